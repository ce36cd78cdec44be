//! Affect collaborator contract.
//!
//! The engine never interprets affect dimensions. It passes the caller's
//! context vector and each memory's stored vector to an [`AffectModel`] and
//! folds whatever number comes back into the ranking.

use std::collections::BTreeMap;

/// Named affect dimensions to intensity. Ordered so serialization is stable.
pub type AffectVector = BTreeMap<String, f32>;

/// Resonance and bleed semantics, owned by the affect subsystem.
pub trait AffectModel: Send + Sync {
    /// Similarity (0.0 - 1.0) between a memory's stored affect and the
    /// caller's current affect. Either side may be absent.
    fn resonance(&self, memory: Option<&AffectVector>, current: Option<&AffectVector>) -> f32;

    /// Aggregate the affect of the returned memories, each with a weight,
    /// into the bleed reported alongside the results.
    fn bleed(&self, contributions: &[(&AffectVector, f32)]) -> AffectVector;
}
