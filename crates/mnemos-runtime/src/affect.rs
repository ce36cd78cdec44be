//! Default affect model used when no external affect subsystem is wired in.

use mnemos_types::affect::{AffectModel, AffectVector};

/// Default resonance when either side has no affect.
pub const NEUTRAL_RESONANCE: f32 = 0.5;

/// Distance charged for a dimension present on only one side.
const ONE_SIDED_DISTANCE: f32 = 0.3;

/// Per-dimension distance model.
///
/// Resonance is `1 - mean |a - b|` over the union of dimensions, clamped to
/// `[0, 1]`. Bleed is the weighted sum of the contributing vectors, clamped
/// to `[-1, 1]` per dimension.
#[derive(Debug, Clone, Copy)]
pub struct DimensionalAffect {
    neutral: f32,
}

impl DimensionalAffect {
    /// Model answering `neutral` whenever a side has no affect.
    pub fn new(neutral: f32) -> Self {
        Self {
            neutral: neutral.clamp(0.0, 1.0),
        }
    }
}

impl Default for DimensionalAffect {
    fn default() -> Self {
        Self::new(NEUTRAL_RESONANCE)
    }
}

impl AffectModel for DimensionalAffect {
    fn resonance(&self, memory: Option<&AffectVector>, current: Option<&AffectVector>) -> f32 {
        let (Some(memory), Some(current)) = (memory, current) else {
            return self.neutral;
        };
        if memory.is_empty() || current.is_empty() {
            return self.neutral;
        }

        let mut total = 0.0f32;
        let mut dims = 0usize;
        for (dim, a) in memory {
            total += match current.get(dim) {
                Some(b) => (a - b).abs(),
                None => ONE_SIDED_DISTANCE,
            };
            dims += 1;
        }
        for dim in current.keys() {
            if !memory.contains_key(dim) {
                total += ONE_SIDED_DISTANCE;
                dims += 1;
            }
        }
        1.0 - (total / dims as f32).min(1.0)
    }

    fn bleed(&self, contributions: &[(&AffectVector, f32)]) -> AffectVector {
        let mut bleed = AffectVector::new();
        for (affect, weight) in contributions {
            for (dim, value) in affect.iter() {
                *bleed.entry(dim.clone()).or_insert(0.0) += value * weight;
            }
        }
        bleed.retain(|_, v| v.abs() > f32::EPSILON);
        for v in bleed.values_mut() {
            *v = v.clamp(-1.0, 1.0);
        }
        bleed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn affect(pairs: &[(&str, f32)]) -> AffectVector {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_identical_affect_resonates_fully() {
        let a = affect(&[("CARE", 0.7), ("PLAY", 0.2)]);
        assert!((DimensionalAffect::default().resonance(Some(&a), Some(&a)) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_missing_side_is_neutral() {
        let a = affect(&[("CARE", 0.7)]);
        assert_eq!(DimensionalAffect::default().resonance(None, Some(&a)), NEUTRAL_RESONANCE);
        assert_eq!(DimensionalAffect::default().resonance(Some(&a), None), NEUTRAL_RESONANCE);
        assert_eq!(
            DimensionalAffect::default().resonance(Some(&AffectVector::new()), Some(&a)),
            NEUTRAL_RESONANCE
        );
    }

    #[test]
    fn test_one_sided_dimensions_cost_distance() {
        let a = affect(&[("CARE", 0.5)]);
        let b = affect(&[("CARE", 0.5), ("FEAR", 0.9)]);
        // mean distance (0 + 0.3) / 2
        assert!((DimensionalAffect::default().resonance(Some(&a), Some(&b)) - 0.85).abs() < 1e-6);
    }

    #[test]
    fn test_bleed_is_weighted_sum() {
        let a = affect(&[("CARE", 1.0)]);
        let b = affect(&[("CARE", 0.5), ("FEAR", 0.25)]);
        let bleed = DimensionalAffect::default().bleed(&[(&a, 0.08), (&b, 0.08)]);
        assert!((bleed["CARE"] - 0.12).abs() < 1e-6);
        assert!((bleed["FEAR"] - 0.02).abs() < 1e-6);
        assert!(DimensionalAffect::default().bleed(&[]).is_empty());
    }
}
