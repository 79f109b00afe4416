use crate::network::ExitNode;
use rand::Rng;
use relaymesh_common::config::selection::WEIGHT_FLOOR;

/// Clamp a raw weight to the floor so unmeasured or badly scored nodes keep a
/// chance of being picked
pub fn floor_weight(weight: f64) -> f64 {
    if weight.is_finite() && weight >= WEIGHT_FLOOR {
        weight
    } else {
        WEIGHT_FLOOR
    }
}

/// Selection weight of a node: `score^exponent`, floored. A node without a
/// latency sample only gets the floor.
pub fn node_weight(node: &ExitNode, exponent: f64) -> f64 {
    if !node.is_measured() {
        return WEIGHT_FLOOR;
    }
    floor_weight(node.score().max(0.0).powf(exponent))
}

/// Linear weighted-random walk: pick a uniform point in `[0, total)` and
/// return the index whose cumulative weight first covers it
pub fn pick_index<R: Rng + ?Sized>(weights: &[f64], rng: &mut R) -> Option<usize> {
    let total: f64 = weights.iter().sum();
    if weights.is_empty() || !(total > 0.0) || !total.is_finite() {
        return None;
    }

    let point = rng.gen_range(0.0..total);
    let mut covered = 0.0;
    for (index, weight) in weights.iter().enumerate() {
        covered += weight;
        if point < covered {
            return Some(index);
        }
    }

    // Rounding can leave the point just past the last boundary
    Some(weights.len() - 1)
}
