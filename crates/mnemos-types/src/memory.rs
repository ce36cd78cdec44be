//! Recall data model: candidates, payloads, results, and the `MemoryStore` trait.

use crate::affect::AffectVector;
use crate::error::MnemosResult;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Identifier of a conversation turn. Candidates are keyed by it.
pub type TurnId = String;

/// Timestamps below this value are seconds, not milliseconds (year 2100 in seconds).
const SECONDS_CUTOFF: i64 = 4_102_444_800;

const MS_PER_DAY: i64 = 86_400_000;

/// Normalize a store timestamp to milliseconds since the epoch.
pub fn normalize_timestamp(ts: i64) -> i64 {
    if ts < SECONDS_CUTOFF {
        ts * 1000
    } else {
        ts
    }
}

/// Lower time bound applied to every search stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    /// Oldest timestamp (ms) included in the window.
    pub since_ms: i64,
}

impl TimeWindow {
    /// A window covering the last `days` days, ending now.
    pub fn last_days(days: u32) -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            since_ms: now - i64::from(days) * MS_PER_DAY,
        }
    }

    /// A window with no lower bound.
    pub fn unbounded() -> Self {
        Self { since_ms: i64::MIN }
    }

    /// Whether a (normalized) timestamp falls inside the window.
    pub fn contains(&self, timestamp_ms: i64) -> bool {
        timestamp_ms >= self.since_ms
    }
}

/// Forgetting-curve state of a memory, as tracked by the store.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Vitality {
    /// Stored strength at `last_accessed_ms` (0.0 - 1.0).
    pub strength: f32,
    /// Exponential decay rate per hour.
    pub decay_rate: f32,
    /// Last reinforcement time in ms (0 = never accessed).
    pub last_accessed_ms: i64,
    /// How often the user dismissed this memory.
    pub dismissal_count: u32,
}

impl Default for Vitality {
    fn default() -> Self {
        Self {
            strength: 1.0,
            decay_rate: 0.01,
            last_accessed_ms: 0,
            dismissal_count: 0,
        }
    }
}

/// One row returned by the store's keyword search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LexicalHit {
    /// Turn this hit belongs to.
    pub turn_id: TurnId,
    /// Timestamp in milliseconds.
    pub timestamp_ms: i64,
    /// Relevance magnitude; higher is better.
    pub score: f32,
    /// Forgetting-curve state, when the store tracks it.
    pub vitality: Option<Vitality>,
}

/// A recall candidate discovered by the lexical and/or vector stage.
///
/// Identity is `turn_id`. Scores from different stages are unioned by
/// [`Candidate::merge`], never overwritten by an absent value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub turn_id: TurnId,
    pub timestamp_ms: i64,
    pub lexical_score: Option<f32>,
    pub vector_score: Option<f32>,
    pub affect_resonance: Option<f32>,
    pub combined_score: f32,
    pub vitality: Option<Vitality>,
}

impl Candidate {
    /// Candidate seeded from a keyword hit.
    pub fn from_lexical(hit: LexicalHit) -> Self {
        Self {
            turn_id: hit.turn_id,
            timestamp_ms: normalize_timestamp(hit.timestamp_ms),
            lexical_score: Some(hit.score),
            vector_score: None,
            affect_resonance: None,
            combined_score: 0.0,
            vitality: hit.vitality,
        }
    }

    /// Candidate seeded from a vector-index hit.
    pub fn from_vector(turn_id: TurnId, timestamp_ms: i64, similarity: f32) -> Self {
        Self {
            turn_id,
            timestamp_ms: normalize_timestamp(timestamp_ms),
            lexical_score: None,
            vector_score: Some(similarity),
            affect_resonance: None,
            combined_score: 0.0,
            vitality: None,
        }
    }

    /// Union another sighting of the same turn into this candidate,
    /// keeping the best score per stage.
    pub fn merge(&mut self, other: Candidate) {
        debug_assert_eq!(self.turn_id, other.turn_id);
        self.lexical_score = max_opt(self.lexical_score, other.lexical_score);
        self.vector_score = max_opt(self.vector_score, other.vector_score);
        self.affect_resonance = self.affect_resonance.or(other.affect_resonance);
        self.timestamp_ms = self.timestamp_ms.max(other.timestamp_ms);
        if self.vitality.is_none() {
            self.vitality = other.vitality;
        }
    }
}

fn max_opt(a: Option<f32>, b: Option<f32>) -> Option<f32> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.max(y)),
        (x, None) => x,
        (None, y) => y,
    }
}

/// A stored embedding as returned by `MemoryStore::fetch_vectors`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredVector {
    /// Store-level node identifier (external ID for the index).
    pub node_id: String,
    pub turn_id: TurnId,
    pub vector: Vec<f32>,
    pub timestamp_ms: i64,
    pub speaker: Option<String>,
    pub layer: Option<String>,
}

/// Full payload for one turn, fetched only for the final top-K.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnPayload {
    /// Who spoke (`unknown` when the store has no speaker).
    pub speaker: String,
    /// Best single-line summary of the turn.
    pub summary: String,
    /// Raw text of the turn.
    pub text: String,
    /// Per-layer summaries (`input`, `output`, `contemplation`).
    pub layers: BTreeMap<String, String>,
    /// Stored emotional vector, opaque to the engine.
    pub affect: Option<AffectVector>,
}

/// The immutable response of one recall call.
///
/// Serialized verbatim to stdout by the CLI.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecallResult {
    /// Rendered fragments, best first.
    pub memories: Vec<String>,
    /// Aggregated emotional bleed of the returned set.
    pub affect_bleed: AffectVector,
}

impl RecallResult {
    /// Whether nothing was recalled.
    pub fn is_empty(&self) -> bool {
        self.memories.is_empty()
    }
}

/// The memory store the engine searches. Persistence and schema are owned
/// by the implementor; the engine only reads, except for reinforcement.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Keyword search over turns newer than `window`, best hits first.
    async fn search_keywords(
        &self,
        terms: &[String],
        window: TimeWindow,
        limit: usize,
    ) -> MnemosResult<Vec<LexicalHit>>;

    /// All stored embeddings newer than `window`, for index builds.
    async fn fetch_vectors(&self, window: TimeWindow) -> MnemosResult<Vec<StoredVector>>;

    /// Payloads for the given turns. Missing turns are absent from the map.
    async fn fetch_payload(
        &self,
        turn_ids: &[TurnId],
    ) -> MnemosResult<HashMap<TurnId, TurnPayload>>;

    /// Bump access/strength metadata for recalled turns.
    async fn update_reinforcement(&self, turn_ids: &[TurnId]) -> MnemosResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_timestamp() {
        assert_eq!(normalize_timestamp(1_700_000_000), 1_700_000_000_000);
        assert_eq!(normalize_timestamp(1_700_000_000_000), 1_700_000_000_000);
    }

    #[test]
    fn test_time_window() {
        let window = TimeWindow::last_days(90);
        let now = Utc::now().timestamp_millis();
        assert!(window.contains(now));
        assert!(!window.contains(now - 91 * MS_PER_DAY));
        assert!(TimeWindow::unbounded().contains(0));
    }

    #[test]
    fn test_merge_unions_scores() {
        let mut lexical = Candidate::from_lexical(LexicalHit {
            turn_id: "t1".into(),
            timestamp_ms: 1_700_000_000_000,
            score: 12.0,
            vitality: None,
        });
        let vector = Candidate::from_vector("t1".into(), 1_700_000_000_000, 0.8);
        lexical.merge(vector);
        assert_eq!(lexical.lexical_score, Some(12.0));
        assert_eq!(lexical.vector_score, Some(0.8));

        // A later sighting without a lexical score must not erase it.
        lexical.merge(Candidate::from_vector("t1".into(), 1_700_000_000_000, 0.5));
        assert_eq!(lexical.lexical_score, Some(12.0));
        assert_eq!(lexical.vector_score, Some(0.8));
    }

    #[test]
    fn test_recall_result_serialization() {
        let mut bleed = AffectVector::new();
        bleed.insert("CARE".into(), 0.08);
        let result = RecallResult {
            memories: vec!["[user] In: hello".into()],
            affect_bleed: bleed,
        };
        let json = serde_json::to_string(&result).unwrap();
        assert_eq!(
            json,
            r#"{"memories":["[user] In: hello"],"affect_bleed":{"CARE":0.08}}"#
        );
    }
}
