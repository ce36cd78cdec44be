//! Candidate scoring strategies.
//!
//! The orchestrator ranks candidates through a [`ScoringStrategy`] chosen
//! from config. [`BlendScorer`] is the default three-term blend;
//! [`EcologicalScorer`] ranks by similarity, forgetting-curve strength,
//! recency and a small random novelty term, penalized by dismissals.

use mnemos_types::config::{BlendWeights, EcologyWeights, RecallSettings, ScoringStrategyKind};
use mnemos_types::memory::{Candidate, Vitality};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::{Arc, Mutex};

const MS_PER_HOUR: f64 = 3_600_000.0;
const MS_PER_DAY: f64 = 86_400_000.0;

/// Per-request inputs shared by every candidate.
#[derive(Debug, Clone, Copy)]
pub struct ScoringContext {
    /// Whether the vector stage produced scores for this request.
    pub vector_stage_ran: bool,
    pub now_ms: i64,
    /// Lexical scores are divided by this and capped at 1.
    pub lexical_norm_divisor: f32,
    /// Resonance assumed before payloads (and stored affect) are fetched.
    pub neutral_resonance: f32,
}

pub trait ScoringStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Combined score for one candidate.
    fn score(&self, candidate: &Candidate, ctx: &ScoringContext) -> f32;

    /// Weight of the affect term, used to fold the real resonance in after
    /// enrichment: `combined += weight * (actual - neutral)`.
    fn affect_weight(&self, ctx: &ScoringContext) -> f32;

    /// Whether the candidate should be rendered as a faded memory.
    fn is_ghost(&self, _candidate: &Candidate, _now_ms: i64) -> bool {
        false
    }
}

/// Lexical score scaled into `[0, 1]`.
pub fn normalize_lexical(score: f32, divisor: f32) -> f32 {
    if divisor <= 0.0 {
        return score.clamp(0.0, 1.0);
    }
    (score / divisor).clamp(0.0, 1.0)
}

/// Forgetting curve: `strength * exp(-decay_rate * hours_since_access)`.
pub fn decayed_strength(strength: f32, decay_rate: f32, hours: f64) -> f32 {
    (f64::from(strength) * (-f64::from(decay_rate) * hours.max(0.0)).exp()) as f32
}

/// Current strength of a memory. Never-accessed memories decay from their
/// own timestamp.
pub fn current_strength(vitality: &Vitality, timestamp_ms: i64, now_ms: i64) -> f32 {
    let since = if vitality.last_accessed_ms > 0 {
        vitality.last_accessed_ms
    } else {
        timestamp_ms
    };
    let hours = (now_ms - since) as f64 / MS_PER_HOUR;
    decayed_strength(vitality.strength, vitality.decay_rate, hours)
}

/// Default strategy: `wL*norm(lexical) + wV*vector + wA*resonance`.
///
/// When the vector stage did not run, the lexical and affect weights are
/// rescaled to sum to their original total plus the vector weight.
#[derive(Debug, Clone, Copy)]
pub struct BlendScorer {
    weights: BlendWeights,
}

impl BlendScorer {
    pub fn new(weights: BlendWeights) -> Self {
        Self { weights }
    }

    /// Effective (lexical, vector, affect) weights for this request.
    fn effective(&self, ctx: &ScoringContext) -> (f32, f32, f32) {
        let w = self.weights;
        if ctx.vector_stage_ran {
            return (w.lexical, w.vector, w.affect);
        }
        let kept = w.lexical + w.affect;
        if kept <= 0.0 {
            return (0.0, 0.0, 0.0);
        }
        let total = kept + w.vector;
        (w.lexical * total / kept, 0.0, w.affect * total / kept)
    }
}

impl ScoringStrategy for BlendScorer {
    fn name(&self) -> &'static str {
        "blend"
    }

    fn score(&self, candidate: &Candidate, ctx: &ScoringContext) -> f32 {
        let (wl, wv, wa) = self.effective(ctx);
        let lexical = candidate
            .lexical_score
            .map(|s| normalize_lexical(s, ctx.lexical_norm_divisor))
            .unwrap_or(0.0);
        let vector = candidate.vector_score.unwrap_or(0.0).max(0.0);
        let resonance = candidate
            .affect_resonance
            .unwrap_or(ctx.neutral_resonance);
        wl * lexical + wv * vector + wa * resonance
    }

    fn affect_weight(&self, ctx: &ScoringContext) -> f32 {
        self.effective(ctx).2
    }
}

/// Ecological ranking with a forgetting curve and dismissal penalty.
pub struct EcologicalScorer {
    weights: EcologyWeights,
    rng: Mutex<StdRng>,
}

impl EcologicalScorer {
    pub fn new(weights: EcologyWeights) -> Self {
        Self {
            weights,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Deterministic novelty, for tests and reproducible runs.
    pub fn with_seed(weights: EcologyWeights, seed: u64) -> Self {
        Self {
            weights,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Usually a small value; occasionally a large one to surface
    /// something unexpected.
    fn novelty(&self) -> f32 {
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        if rng.gen_bool(0.1) {
            rng.gen_range(0.5..1.0)
        } else {
            rng.gen_range(0.0..0.2)
        }
    }

    fn strength(&self, candidate: &Candidate, now_ms: i64) -> f32 {
        candidate
            .vitality
            .map(|v| current_strength(&v, candidate.timestamp_ms, now_ms))
            .unwrap_or(1.0)
    }
}

impl ScoringStrategy for EcologicalScorer {
    fn name(&self) -> &'static str {
        "ecological"
    }

    fn score(&self, candidate: &Candidate, ctx: &ScoringContext) -> f32 {
        let w = self.weights;
        let similarity = candidate.vector_score.unwrap_or_else(|| {
            candidate
                .lexical_score
                .map(|s| normalize_lexical(s, ctx.lexical_norm_divisor))
                .unwrap_or(0.0)
        });
        let strength = self.strength(candidate, ctx.now_ms);
        let age_days = ((ctx.now_ms - candidate.timestamp_ms) as f64 / MS_PER_DAY).max(0.0);
        let recency = (-f64::from(w.recency_decay_per_day) * age_days).exp() as f32;
        let dismissals = candidate.vitality.map(|v| v.dismissal_count).unwrap_or(0);
        let penalty = 0.5f32.powi(dismissals.min(64) as i32);

        (w.similarity * similarity
            + w.strength * strength
            + w.recency * recency
            + w.novelty * self.novelty())
            * penalty
    }

    fn affect_weight(&self, _ctx: &ScoringContext) -> f32 {
        0.0
    }

    fn is_ghost(&self, candidate: &Candidate, now_ms: i64) -> bool {
        self.strength(candidate, now_ms) < self.weights.ghost_threshold
    }
}

/// Strategy selected by `[recall] strategy`.
pub fn strategy_from_config(settings: &RecallSettings) -> Arc<dyn ScoringStrategy> {
    match settings.strategy {
        ScoringStrategyKind::Blend => Arc::new(BlendScorer::new(settings.weights)),
        ScoringStrategyKind::Ecological => Arc::new(EcologicalScorer::new(settings.ecology)),
    }
}
