use rand::Rng;

use super::config::{Experiment, Variant};

/// Picks the variant to render for one visit.
///
/// Each variant is chosen with probability `weight / 100` only when the
/// weights sum to 100. See [`select_variant_with_draw`] for the fallback
/// when they do not.
pub fn select_variant(experiment: &Experiment) -> Option<&Variant> {
    let draw = rand::thread_rng().gen_range(0.0..100.0);
    select_variant_with_draw(experiment, draw)
}

/// Walks the variants in order, accumulating weights, and returns the first
/// whose cumulative boundary is >= `draw`.
///
/// When `draw` lies past the last boundary (weights summing to less than 100)
/// the control variant is returned, or the first variant if none is flagged
/// as control. `None` only for an experiment without variants.
pub fn select_variant_with_draw(experiment: &Experiment, draw: f64) -> Option<&Variant> {
    let mut cumulative = 0.0;
    for variant in &experiment.variants {
        cumulative += variant.weight as f64;
        if cumulative >= draw {
            return Some(variant);
        }
    }
    experiment.control().or_else(|| experiment.variants.first())
}
