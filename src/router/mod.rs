//! Resource-aware model variant selection.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::probe::SystemSnapshot;

/// A named model configuration with its minimum free-RAM requirement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelVariant {
    /// Runtime model name, e.g. `gemma3:12b-q4_0`.
    pub name: String,
    /// Free RAM required to run this variant.
    pub min_ram_bytes: u64,
    /// Relative quality, higher is better.
    pub quality_score: f32,
}

impl ModelVariant {
    /// Convenience constructor.
    pub fn new(name: impl Into<String>, min_ram_bytes: u64, quality_score: f32) -> Self {
        Self {
            name: name.into(),
            min_ram_bytes,
            quality_score,
        }
    }
}

/// Router construction failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouterError {
    /// A router needs at least one variant.
    #[error("router requires at least one model variant")]
    NoVariants,
}

/// Picks the best variant the current resource snapshot can afford.
///
/// Variants are held highest-quality first; [`ModelRouter::choose`] walks
/// down until one fits in free RAM. When nothing fits, the lightest variant
/// is returned anyway (rejecting outright is the admission gate's job, not
/// the router's) and `ram_below_floor` is logged.
pub struct ModelRouter {
    variants: Vec<ModelVariant>,
}

impl ModelRouter {
    /// Creates a router; variants are sorted by descending quality.
    pub fn new(mut variants: Vec<ModelVariant>) -> Result<Self, RouterError> {
        if variants.is_empty() {
            return Err(RouterError::NoVariants);
        }
        variants.sort_by(|a, b| {
            b.quality_score
                .partial_cmp(&a.quality_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(Self { variants })
    }

    /// The configured variants, highest quality first.
    pub fn variants(&self) -> &[ModelVariant] {
        &self.variants
    }

    /// Chooses the first variant whose RAM requirement is met.
    pub fn choose(&self, snapshot: &SystemSnapshot) -> &ModelVariant {
        for variant in &self.variants {
            if variant.min_ram_bytes <= snapshot.ram_free_bytes {
                return variant;
            }
        }
        let lightest = self
            .variants
            .last()
            .expect("constructor guarantees at least one variant");
        warn!(
            ram_free_bytes = snapshot.ram_free_bytes,
            variant = %lightest.name,
            "ram_below_floor"
        );
        lightest
    }
}

impl std::fmt::Debug for ModelRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRouter")
            .field("variants", &self.variants.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn snapshot(ram_free_bytes: u64) -> SystemSnapshot {
        SystemSnapshot {
            cpu_pct: 10.0,
            ram_free_bytes,
            ram_total_bytes: 32 * GIB,
            temperature_c: 40.0,
            gpu_present: false,
            gpu_load_pct: 0.0,
            sampled_at: Instant::now(),
        }
    }

    fn router() -> ModelRouter {
        ModelRouter::new(vec![
            ModelVariant::new("tiny-q2", 2 * GIB, 0.4),
            ModelVariant::new("big-q4", 10 * GIB, 0.9),
            ModelVariant::new("mid-q3", 6 * GIB, 0.7),
        ])
        .unwrap()
    }

    #[test]
    fn empty_variant_list_rejected() {
        assert!(matches!(
            ModelRouter::new(Vec::new()),
            Err(RouterError::NoVariants)
        ));
    }

    #[test]
    fn picks_heaviest_variant_that_fits() {
        let router = router();
        assert_eq!(router.choose(&snapshot(16 * GIB)).name, "big-q4");
        assert_eq!(router.choose(&snapshot(7 * GIB)).name, "mid-q3");
        assert_eq!(router.choose(&snapshot(3 * GIB)).name, "tiny-q2");
    }

    #[test]
    fn falls_back_to_lightest_below_floor() {
        let router = router();
        assert_eq!(router.choose(&snapshot(GIB / 2)).name, "tiny-q2");
    }

    #[test]
    fn variants_are_ordered_by_quality() {
        let router = router();
        let names: Vec<&str> = router.variants().iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["big-q4", "mid-q3", "tiny-q2"]);
    }
}
