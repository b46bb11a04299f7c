//! Greedy neighbor view selection
//!
//! Both strategies share the same loop: repeatedly add the candidate with
//! the highest positive score (given what is already selected) until a cap
//! is reached or no candidate scores above zero.
use nalgebra::Vector3;
use ordered_float::OrderedFloat;
use std::{cmp::Reverse, collections::BTreeSet};

mod global;
mod local;

pub use global::GlobalViewSelection;
pub use local::LocalViewSelection;

/// Set of view indices
pub type ViewSet = BTreeSet<usize>;

/// A scoring strategy for greedy view selection
pub trait ViewSelector {
    /// Scores a candidate against the views selected so far
    ///
    /// Returns `None` if the candidate cannot be used at all.
    fn score(&mut self, candidate: usize, selected: &ViewSet) -> Option<f32>;

    /// Greedily extends `selected` with candidates, up to `max` views
    ///
    /// Ties go to the lower view index.
    fn select(
        &mut self,
        candidates: &ViewSet,
        mut selected: ViewSet,
        max: usize,
    ) -> ViewSet {
        let mut available: ViewSet =
            candidates.difference(&selected).copied().collect();
        while selected.len() < max {
            let best = available
                .iter()
                .filter_map(|&v| Some((v, self.score(v, &selected)?)))
                .filter(|(_, s)| *s > 0.0)
                .max_by_key(|(v, s)| (OrderedFloat(*s), Reverse(*v)));
            let Some((v, _)) = best else {
                break;
            };
            selected.insert(v);
            available.remove(&v);
        }
        selected
    }
}

/// Angle (in degrees) between the rays from `p` to two camera centers
pub fn parallax(p: &Vector3<f32>, a: &Vector3<f32>, b: &Vector3<f32>) -> f32 {
    let da = a - p;
    let db = b - p;
    let c = da.dot(&db) / (da.norm() * db.norm());
    c.clamp(-1.0, 1.0).acos().to_degrees()
}

/// Gaussian preference for parallax angles around 20 degrees
///
/// The falloff is steeper below the mean (sigma of 5 degrees) than above
/// it (sigma of 15 degrees).
pub fn parallax_to_weight(p: f32) -> f32 {
    const MEAN: f32 = 20.0;
    let sigma = if p < MEAN { 5.0 } else { 15.0 };
    (-(p - MEAN) * (p - MEAN) / (2.0 * sigma * sigma)).exp()
}
