//! Recall pipeline for mnemos.
//!
//! Holds the pieces one recall request flows through: the cached,
//! rate-limited embedding client, the vector index, lexical search, scoring
//! strategies, rendering, and the [`recall::RecallEngine`] that ties them
//! together with a deadline and graceful degradation.

pub mod affect;
pub mod embedder;
pub mod embedding;
pub mod index;
pub mod lexical;
pub mod query_cache;
pub mod rate_limiter;
pub mod recall;
pub mod render;
pub mod scoring;

pub use recall::{EmbeddingMode, RecallEngine, RecallOutcome, RecallRequest, RecallTrace};
