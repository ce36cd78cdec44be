//! Tiered hybrid recall.
//!
//! One request runs: query cache → lexical stage → confidence gate →
//! vector stage (optional, deadline-bounded) → merge and score → top-K →
//! payload fetch for the top-K only → affect folding → render → cache
//! write → background reinforcement.
//!
//! Provider failures, rate limiting and deadline overruns inside the vector
//! stage degrade the request to lexical-only ranking. The lexical stage and
//! the payload fetch run under the same deadline; when either overruns, the
//! request returns what it has (possibly nothing) marked degraded. Degraded
//! results are never cached. Store errors are returned to the caller.

use crate::embedder::CachedEmbedder;
use crate::index::SharedIndex;
use crate::lexical;
use crate::query_cache::{query_key, QueryCache};
use crate::render::{render, render_ghost};
use crate::scoring::{ScoringContext, ScoringStrategy};
use chrono::Utc;
use mnemos_memory::embedding_cache::normalize_text;
use mnemos_types::affect::{AffectModel, AffectVector};
use mnemos_types::config::{AffectConfig, RecallSettings};
use mnemos_types::error::{MnemosError, MnemosResult};
use mnemos_types::memory::{Candidate, MemoryStore, RecallResult, TimeWindow, TurnId};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Requests slower than this are logged.
const SLOW_QUERY: Duration = Duration::from_millis(100);

/// How the vector stage may be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingMode {
    /// Decide per request (query length and lexical confidence).
    #[default]
    Auto,
    /// Never embed (`--fts-only`).
    LexicalOnly,
}

/// One recall request.
#[derive(Debug, Clone, Default)]
pub struct RecallRequest {
    pub query: String,
    /// Caller's current affect, opaque to the engine.
    pub affect: Option<AffectVector>,
    pub mode: EmbeddingMode,
    /// Overrides `recall.max_results`.
    pub max_results: Option<usize>,
    /// Overrides `recall.deadline_ms`.
    pub deadline: Option<Duration>,
}

impl RecallRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }
}

/// Why the vector stage did not contribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Answered by the query cache or a concurrent identical request.
    Cached,
    LexicalOnly,
    ShortQuery,
    ConfidentLexical,
    NoProvider,
    NoIndex,
}

/// Outcome of the vector stage.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum VectorStage {
    Skipped { reason: SkipReason },
    Completed { hits: usize },
    Degraded { reason: String },
}

impl VectorStage {
    pub fn ran(&self) -> bool {
        matches!(self, VectorStage::Completed { .. })
    }
}

/// Per-request diagnostics. Never part of the serialized result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecallTrace {
    /// Served from the query cache (or by a concurrent identical request).
    pub cache_hit: bool,
    pub lexical_candidates: usize,
    pub vector_stage: VectorStage,
    /// Some stage was cut short by an error or the deadline.
    pub degraded: bool,
    pub returned: usize,
    pub elapsed_ms: u64,
}

/// Result of [`RecallEngine::recall`].
#[derive(Debug, Clone)]
pub struct RecallOutcome {
    pub result: Arc<RecallResult>,
    pub trace: RecallTrace,
}

/// The recall service. Build once, share by `Arc`.
pub struct RecallEngine {
    store: Arc<dyn MemoryStore>,
    embedder: Option<Arc<CachedEmbedder>>,
    index: Arc<SharedIndex>,
    query_cache: Arc<QueryCache<Arc<RecallResult>>>,
    scorer: Arc<dyn ScoringStrategy>,
    affect: Arc<dyn AffectModel>,
    settings: RecallSettings,
    affect_config: AffectConfig,
    /// Reinforcement writes still in flight.
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl RecallEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn MemoryStore>,
        embedder: Option<Arc<CachedEmbedder>>,
        index: Arc<SharedIndex>,
        query_cache: Arc<QueryCache<Arc<RecallResult>>>,
        scorer: Arc<dyn ScoringStrategy>,
        affect: Arc<dyn AffectModel>,
        settings: RecallSettings,
        affect_config: AffectConfig,
    ) -> Self {
        Self {
            store,
            embedder,
            index,
            query_cache,
            scorer,
            affect,
            settings,
            affect_config,
            background: Mutex::new(Vec::new()),
        }
    }

    pub fn query_cache(&self) -> &Arc<QueryCache<Arc<RecallResult>>> {
        &self.query_cache
    }

    fn cache_key(&self, req: &RecallRequest, max_results: usize) -> String {
        let query = normalize_text(&req.query);
        let affect = req
            .affect
            .as_ref()
            .and_then(|a| serde_json::to_string(a).ok())
            .unwrap_or_default();
        let mode = match req.mode {
            EmbeddingMode::Auto => "auto",
            EmbeddingMode::LexicalOnly => "lexical",
        };
        let max = max_results.to_string();
        query_key(&[&query, &affect, mode, &max])
    }

    /// Run one recall.
    pub async fn recall(&self, req: RecallRequest) -> MnemosResult<RecallOutcome> {
        let started = Instant::now();
        let max_results = req.max_results.unwrap_or(self.settings.max_results).max(1);
        let key = self.cache_key(&req, max_results);

        let mut trace = None;
        let slot = &mut trace;
        let (result, cache_hit) = self
            .query_cache
            .get_or_compute(&key, move || async move {
                let (result, t) = self.run_pipeline(&req, max_results, started).await?;
                let cacheable = !t.degraded;
                *slot = Some(t);
                Ok((Arc::new(result), cacheable))
            })
            .await?;

        let elapsed = started.elapsed();
        let mut trace = trace.unwrap_or(RecallTrace {
            cache_hit: true,
            lexical_candidates: 0,
            vector_stage: VectorStage::Skipped {
                reason: SkipReason::Cached,
            },
            degraded: false,
            returned: result.memories.len(),
            elapsed_ms: 0,
        });
        trace.cache_hit = cache_hit;
        trace.elapsed_ms = elapsed.as_millis() as u64;

        if cache_hit {
            debug!(returned = trace.returned, "Recall served from query cache");
        } else if elapsed > SLOW_QUERY {
            warn!(
                elapsed_ms = trace.elapsed_ms,
                lexical = trace.lexical_candidates,
                returned = trace.returned,
                "Slow recall"
            );
        }
        Ok(RecallOutcome { result, trace })
    }

    /// Wait for in-flight reinforcement writes. Called before the process
    /// exits so single-shot invocations do not lose them.
    pub async fn drain(&self) {
        let pending: Vec<JoinHandle<()>> = {
            let mut guard = self.background.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *guard)
        };
        for handle in pending {
            if let Err(e) = handle.await {
                warn!(error = %e, "Reinforcement task failed");
            }
        }
    }

    async fn run_pipeline(
        &self,
        req: &RecallRequest,
        max_results: usize,
        started: Instant,
    ) -> MnemosResult<(RecallResult, RecallTrace)> {
        let deadline = req
            .deadline
            .unwrap_or(Duration::from_millis(self.settings.deadline_ms));
        let window = TimeWindow::last_days(self.settings.time_window_days);
        let reserve = Duration::from_millis(self.settings.enrichment_reserve_ms);
        let mut degraded = false;

        // Keep the enrichment reserve only when it leaves the search some time.
        let lexical_budget = deadline
            .checked_sub(reserve)
            .filter(|b| !b.is_zero())
            .unwrap_or(deadline);
        let lexical_hits = match tokio::time::timeout(
            lexical_budget,
            lexical::search(self.store.as_ref(), &req.query, window, max_results),
        )
        .await
        {
            Ok(hits) => hits?,
            Err(_) => {
                warn!(
                    budget_ms = lexical_budget.as_millis() as u64,
                    "Lexical stage exceeded deadline"
                );
                degraded = true;
                Vec::new()
            }
        };
        let lexical_count = lexical_hits.len();

        let vector_stage_decision = self.vector_stage_decision(req, &lexical_hits);
        let (vector_hits, vector_stage) = match vector_stage_decision {
            Some(reason) => (Vec::new(), VectorStage::Skipped { reason }),
            None => {
                let budget = deadline
                    .saturating_sub(started.elapsed())
                    .saturating_sub(reserve);
                self.vector_stage(&req.query, window, max_results, budget)
                    .await
            }
        };
        if matches!(vector_stage, VectorStage::Degraded { .. }) {
            degraded = true;
        }

        // Merge by turn, unioning scores.
        let mut merged: HashMap<TurnId, Candidate> = HashMap::new();
        for candidate in lexical_hits.into_iter().chain(vector_hits) {
            match merged.get_mut(&candidate.turn_id) {
                Some(existing) => existing.merge(candidate),
                None => {
                    merged.insert(candidate.turn_id.clone(), candidate);
                }
            }
        }

        let ctx = ScoringContext {
            vector_stage_ran: vector_stage.ran(),
            now_ms: Utc::now().timestamp_millis(),
            lexical_norm_divisor: self.settings.lexical_norm_divisor,
            neutral_resonance: self.affect_config.neutral_resonance,
        };
        let mut ranked: Vec<Candidate> = merged
            .into_values()
            .map(|mut c| {
                c.combined_score = self.scorer.score(&c, &ctx);
                c
            })
            .collect();
        sort_ranked(&mut ranked);
        ranked.truncate(max_results);

        let enrich_budget = deadline.saturating_sub(started.elapsed());
        let (result, returned_ids) = match self.enrich(req, ranked, &ctx, enrich_budget).await? {
            Some(enriched) => enriched,
            None => {
                warn!(
                    budget_ms = enrich_budget.as_millis() as u64,
                    "Payload fetch exceeded deadline, returning no memories"
                );
                degraded = true;
                (RecallResult::default(), Vec::new())
            }
        };

        if !returned_ids.is_empty() {
            let store = Arc::clone(&self.store);
            let handle = tokio::spawn(async move {
                if let Err(e) = store.update_reinforcement(&returned_ids).await {
                    warn!(error = %e, "Reinforcement update failed");
                }
            });
            let mut pending = self.background.lock().unwrap_or_else(|e| e.into_inner());
            pending.retain(|h| !h.is_finished());
            pending.push(handle);
        }

        let trace = RecallTrace {
            cache_hit: false,
            lexical_candidates: lexical_count,
            vector_stage,
            degraded,
            returned: result.memories.len(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            lexical = trace.lexical_candidates,
            vector = ?trace.vector_stage,
            returned = trace.returned,
            scorer = self.scorer.name(),
            "Recall complete"
        );
        Ok((result, trace))
    }

    /// `Some(reason)` when the vector stage should not run.
    fn vector_stage_decision(&self, req: &RecallRequest, lexical: &[Candidate]) -> Option<SkipReason> {
        if req.mode == EmbeddingMode::LexicalOnly {
            return Some(SkipReason::LexicalOnly);
        }
        if req.query.trim().chars().count() < self.settings.skip_embedding_min_len {
            return Some(SkipReason::ShortQuery);
        }
        let best = lexical
            .iter()
            .filter_map(|c| c.lexical_score)
            .fold(0.0f32, f32::max);
        if lexical.len() >= self.settings.min_lexical_results
            && best >= self.settings.lexical_confidence_threshold
        {
            debug!(
                candidates = lexical.len(),
                best, "Lexical results confident, skipping embedding"
            );
            return Some(SkipReason::ConfidentLexical);
        }
        if self.embedder.is_none() {
            return Some(SkipReason::NoProvider);
        }
        if self.index.load().map_or(true, |idx| idx.is_empty()) {
            return Some(SkipReason::NoIndex);
        }
        None
    }

    async fn vector_stage(
        &self,
        query: &str,
        window: TimeWindow,
        max_results: usize,
        budget: Duration,
    ) -> (Vec<Candidate>, VectorStage) {
        if budget.is_zero() {
            warn!("No time left for vector stage, using lexical results");
            return (
                Vec::new(),
                VectorStage::Degraded {
                    reason: "deadline exhausted".into(),
                },
            );
        }
        match tokio::time::timeout(budget, self.vector_search(query, window, max_results)).await {
            Ok(Ok(hits)) => {
                let n = hits.len();
                (hits, VectorStage::Completed { hits: n })
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Vector stage failed, using lexical results");
                (
                    Vec::new(),
                    VectorStage::Degraded {
                        reason: e.to_string(),
                    },
                )
            }
            Err(_) => {
                warn!(
                    budget_ms = budget.as_millis() as u64,
                    "Vector stage exceeded deadline, using lexical results"
                );
                (
                    Vec::new(),
                    VectorStage::Degraded {
                        reason: "deadline exceeded".into(),
                    },
                )
            }
        }
    }

    async fn vector_search(
        &self,
        query: &str,
        window: TimeWindow,
        max_results: usize,
    ) -> MnemosResult<Vec<Candidate>> {
        let embedder = self
            .embedder
            .as_ref()
            .ok_or_else(|| MnemosError::ProviderUnavailable("no embedding provider".into()))?;
        let query: String = query.trim().chars().take(self.settings.max_query_chars).collect();
        let vector = embedder.embed_one(&query).await?;

        let k = max_results.saturating_mul(lexical::CANDIDATE_MULTIPLIER);
        let hits = self
            .index
            .search_filtered(&vector, k, self.settings.similarity_floor, window);
        Ok(hits
            .into_iter()
            .map(|h| Candidate::from_vector(h.entry.turn_id, h.entry.timestamp, h.score))
            .collect())
    }

    /// Fetch payloads for the top-K, fold in real resonance, render.
    /// `None` when the fetch did not finish within `budget`.
    async fn enrich(
        &self,
        req: &RecallRequest,
        ranked: Vec<Candidate>,
        ctx: &ScoringContext,
        budget: Duration,
    ) -> MnemosResult<Option<(RecallResult, Vec<TurnId>)>> {
        if ranked.is_empty() {
            return Ok(Some((RecallResult::default(), Vec::new())));
        }
        let ids: Vec<TurnId> = ranked.iter().map(|c| c.turn_id.clone()).collect();
        let mut payloads =
            match tokio::time::timeout(budget, self.store.fetch_payload(&ids)).await {
                Ok(payloads) => payloads?,
                Err(_) => return Ok(None),
            };

        let affect_weight = self.scorer.affect_weight(ctx);
        let mut enriched = Vec::with_capacity(ranked.len());
        for mut candidate in ranked {
            let Some(payload) = payloads.remove(&candidate.turn_id) else {
                debug!(turn_id = %candidate.turn_id, "Payload missing, dropping candidate");
                continue;
            };
            let resonance = self
                .affect
                .resonance(payload.affect.as_ref(), req.affect.as_ref());
            candidate.combined_score += affect_weight * (resonance - ctx.neutral_resonance);
            candidate.affect_resonance = Some(resonance);
            enriched.push((candidate, payload));
        }
        enriched.sort_by(|(a, _), (b, _)| compare_ranked(a, b));

        let bleed_factor = self.affect_config.bleed_factor;
        let contributions: Vec<(&AffectVector, f32)> = enriched
            .iter()
            .filter_map(|(_, p)| p.affect.as_ref().map(|a| (a, bleed_factor)))
            .collect();
        let affect_bleed = self.affect.bleed(&contributions);

        let memories = enriched
            .iter()
            .map(|(c, p)| {
                if self.scorer.is_ghost(c, ctx.now_ms) {
                    render_ghost(p)
                } else {
                    render(p)
                }
            })
            .collect();
        let ids = enriched.into_iter().map(|(c, _)| c.turn_id).collect();
        Ok(Some((
            RecallResult {
                memories,
                affect_bleed,
            },
            ids,
        )))
    }
}

/// Best score first; ties go to the newer memory, then to turn ID.
fn compare_ranked(a: &Candidate, b: &Candidate) -> std::cmp::Ordering {
    b.combined_score
        .partial_cmp(&a.combined_score)
        .unwrap_or(std::cmp::Ordering::Equal)
        .then_with(|| b.timestamp_ms.cmp(&a.timestamp_ms))
        .then_with(|| a.turn_id.cmp(&b.turn_id))
}

fn sort_ranked(candidates: &mut [Candidate]) {
    candidates.sort_by(compare_ranked);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scored(turn: &str, score: f32, ts: i64) -> Candidate {
        Candidate {
            turn_id: turn.into(),
            timestamp_ms: ts,
            lexical_score: None,
            vector_score: None,
            affect_resonance: None,
            combined_score: score,
            vitality: None,
        }
    }

    #[test]
    fn test_ranking_ties_prefer_newer() {
        let mut v = vec![scored("a", 0.5, 1), scored("b", 0.9, 1), scored("c", 0.5, 2)];
        sort_ranked(&mut v);
        let order: Vec<&str> = v.iter().map(|c| c.turn_id.as_str()).collect();
        assert_eq!(order, vec!["b", "c", "a"]);
    }

    #[test]
    fn test_vector_stage_ran_only_when_completed() {
        assert!(VectorStage::Completed { hits: 0 }.ran());
        assert!(!VectorStage::Degraded {
            reason: "x".into()
        }
        .ran());
        assert!(!VectorStage::Skipped {
            reason: SkipReason::ShortQuery
        }
        .ran());
    }
}
