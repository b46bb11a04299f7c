//! Photometric refinement of a single patch hypothesis
use super::{
    patch_sampler::PatchSampler,
    settings::Settings,
    single_view::SingleView,
    view_selection::{LocalViewSelection, ViewSet},
};
use nalgebra::{Matrix3, Vector3};

/// Local views are re-checked against `accept_ncc` at this interval
const REPLACE_INTERVAL: usize = 5;

/// Weight of the SAD term in the objective, relative to SSD
const SAD_WEIGHT: f32 = 0.5;

/// Gauss-Newton system `(A, b)` and the largest allowed depth step
type NormalEquations = (Matrix3<f32>, Vector3<f32>, f32);

/// Stage of a [`PatchOptimization`]
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum::Display)]
pub enum OptimizationState {
    /// Local views were selected; optimization has not run yet
    NotStarted,
    /// Optimization is in progress
    Optimizing,
    /// Optimization finished, with the best hypothesis kept
    Converged,
    /// No usable hypothesis (bad master patch or too few neighbor views)
    Failed,
}

/// Refines depth and orientation of one master patch
///
/// Construction selects local neighbor views; [`do_auto_optimization`]
/// then alternates depth-only and depth-plus-orientation Gauss-Newton steps
/// on the color-scaled sum of squared differences between the master patch
/// and every neighbor.
///
/// [`do_auto_optimization`]: PatchOptimization::do_auto_optimization
pub struct PatchOptimization<'a> {
    sampler: PatchSampler<'a>,
    settings: &'a Settings,
    global: &'a ViewSet,
    local: ViewSet,
    state: OptimizationState,
}

impl<'a> PatchOptimization<'a> {
    /// Samples the initial hypothesis and selects local views
    ///
    /// `propagated` views (typically inherited from a neighboring pixel) are
    /// preferred when they still match the master patch.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        views: &'a [Option<SingleView>],
        settings: &'a Settings,
        global: &'a ViewSet,
        x: usize,
        y: usize,
        depth: f32,
        dz_i: f32,
        dz_j: f32,
        propagated: &ViewSet,
    ) -> Self {
        let mut sampler =
            PatchSampler::new(views, settings, x, y, depth, dz_i, dz_j);
        let local = if sampler.master_ok() {
            LocalViewSelection::new(&mut sampler, settings, global)
                .perform(propagated)
        } else {
            None
        };
        let state = if local.is_some() {
            OptimizationState::NotStarted
        } else {
            OptimizationState::Failed
        };
        Self {
            sampler,
            settings,
            global,
            local: local.unwrap_or_default(),
            state,
        }
    }

    /// Returns the current stage
    pub fn state(&self) -> OptimizationState {
        self.state
    }

    /// Returns the selected local views
    pub fn local_views(&self) -> &ViewSet {
        &self.local
    }

    /// Returns the current hypothesis as `(depth, dz_i, dz_j)`
    pub fn hypothesis(&self) -> (f32, f32, f32) {
        self.sampler.hypothesis()
    }

    /// Returns the patch normal for the current hypothesis
    pub fn normal(&self) -> Option<Vector3<f32>> {
        self.sampler.patch_normal()
    }

    /// Per-channel scale mapping raw neighbor colors onto the normalized
    /// master colors, in the least-squares sense
    fn color_scale(&self, colors: &[Vector3<f32>]) -> Vector3<f32> {
        let fallback = self.sampler.master_mean().map(|m| 1.0 / m);
        if !self.settings.use_color_scale {
            return fallback;
        }
        let master = self.sampler.master_samples();
        let mut num = Vector3::zeros();
        let mut denom = Vector3::zeros();
        for (m, n) in master.iter().zip(colors) {
            num += m.component_mul(n);
            denom += n.component_mul(n);
        }
        Vector3::from_fn(|i, _| {
            if denom[i] > f32::EPSILON {
                num[i] / denom[i]
            } else {
                fallback[i]
            }
        })
    }

    /// Weighted sum of color-scaled SSD and SAD, averaged over local views
    /// and patch samples
    fn objective(&mut self) -> Option<f32> {
        let mut sum = 0.0;
        let views: Vec<_> = self.local.iter().copied().collect();
        for &v in &views {
            let n = self.sampler.neigh_samples(v)?.to_vec();
            let cs = self.color_scale(&n);
            let ssd = self.sampler.ssd(v, &cs)?;
            let sad = self.sampler.sad(v, &cs)?;
            sum += ssd + SAD_WEIGHT * sad;
        }
        let count = views.len() * self.sampler.num_samples();
        Some(sum / count.max(1) as f32)
    }

    /// Accumulates Gauss-Newton normal equations for `(depth, dz_i, dz_j)`
    ///
    /// Returns the system and the smallest depth change that moves the
    /// patch center by one pixel in any neighbor.
    fn normal_equations(&mut self) -> Option<NormalEquations> {
        let r = self.settings.filter_radius() as i32;
        let offsets: Vec<(f32, f32)> = (-r..=r)
            .flat_map(|j| (-r..=r).map(move |i| (i as f32, j as f32)))
            .collect();
        let mut a = Matrix3::zeros();
        let mut b = Vector3::zeros();
        let mut step = f32::INFINITY;
        let views: Vec<_> = self.local.iter().copied().collect();
        for v in views {
            let cad = self.sampler.fast_col_and_deriv(v)?;
            let cs = self.color_scale(&cad.color);
            step = step.min(cad.step);
            let master = self.sampler.master_samples();
            for (k, (i, j)) in offsets.iter().enumerate() {
                let res = master[k] - cad.color[k].component_mul(&cs);
                let d = cad.deriv[k].component_mul(&cs);
                let jac = Vector3::new(1.0, *i, *j);
                a += jac * jac.transpose() * d.norm_squared();
                b += jac * res.dot(&d);
            }
        }
        step.is_finite().then_some((a, b, step))
    }

    /// Computes an update to the current hypothesis
    fn step(&mut self, full: bool) -> Option<(f32, f32, f32)> {
        let (a, b, step) = self.normal_equations()?;
        let (depth, dz_i, dz_j) = self.sampler.hypothesis();
        let delta = if full {
            a.lu().solve(&b)?
        } else if a[(0, 0)] > f32::EPSILON {
            Vector3::new(b[0] / a[(0, 0)], 0.0, 0.0)
        } else {
            return None;
        };
        if !delta.iter().all(|v| v.is_finite()) {
            return None;
        }
        let dz_step = step / self.settings.filter_radius().max(1) as f32;
        Some((
            depth + delta[0].clamp(-step, step),
            dz_i + delta[1].clamp(-dz_step, dz_step),
            dz_j + delta[2].clamp(-dz_step, dz_step),
        ))
    }

    /// Swaps out local views whose NCC fell below `accept_ncc`
    ///
    /// Returns `false` if no replacement could be found.
    fn replace_bad_views(&mut self) -> bool {
        let accept = self.settings.accept_ncc;
        let local: Vec<_> = self.local.iter().copied().collect();
        let to_replace: ViewSet = local
            .into_iter()
            .filter(|v| !(self.sampler.fast_ncc(*v).unwrap_or(-1.0) >= accept))
            .collect();
        if to_replace.is_empty() {
            return true;
        }
        let r = LocalViewSelection::new(
            &mut self.sampler,
            self.settings,
            self.global,
        )
        .replace_views(&self.local, &to_replace);
        match r {
            Some(v) => {
                self.local = v;
                true
            }
            None => false,
        }
    }

    /// Runs the optimizer, keeping the hypothesis with the lowest objective
    pub fn do_auto_optimization(&mut self) {
        if self.state != OptimizationState::NotStarted {
            return;
        }
        self.state = OptimizationState::Optimizing;
        let Some(mut best_obj) = self.objective() else {
            self.state = OptimizationState::Failed;
            return;
        };
        let mut best = self.sampler.hypothesis();
        let mut prev = best_obj;

        for iter in 0..self.settings.max_iterations {
            if iter > 0 && iter % REPLACE_INTERVAL == 0 {
                if !self.replace_bad_views() {
                    self.state = OptimizationState::Failed;
                    return;
                }
                // The objective changes with the view set
                let Some(obj) = self.objective() else {
                    self.state = OptimizationState::Failed;
                    return;
                };
                best_obj = obj;
                best = self.sampler.hypothesis();
                prev = obj;
            }

            let Some((depth, dz_i, dz_j)) = self.step(iter % 2 == 1) else {
                break;
            };
            self.sampler.update(depth, dz_i, dz_j);
            let Some(obj) = self.objective() else {
                break;
            };
            if obj < best_obj {
                best_obj = obj;
                best = (depth, dz_i, dz_j);
            }
            let decrease = if prev > f32::EPSILON {
                (prev - obj) / prev
            } else {
                0.0
            };
            prev = obj;
            if iter > 0 && decrease < self.settings.min_refine_diff {
                break;
            }
        }

        if self.sampler.hypothesis() != best {
            self.sampler.update(best.0, best.1, best.2);
        }
        self.state = OptimizationState::Converged;
    }

    /// Scores the current hypothesis, from 0 (unusable) upwards
    ///
    /// The score combines agreement with every local view (NCC above
    /// `accept_ncc`) and master patch texture.
    pub fn compute_confidence(&mut self) -> f32 {
        if self.state != OptimizationState::Converged
            || !self.sampler.master_ok()
            || self.local.len() != self.settings.nr_recon_neighbors
        {
            return 0.0;
        }
        let accept = self.settings.accept_ncc;
        let mut sum = 0.0;
        let local: Vec<_> = self.local.iter().copied().collect();
        for v in local {
            let ncc = self.sampler.fast_ncc(v).unwrap_or(-1.0);
            if !(ncc >= accept) {
                return 0.0;
            }
            sum += (ncc - accept) / (1.0 - accept);
        }
        let agreement = sum / self.local.len() as f32;
        let var = self.sampler.master_variance();
        let texture = var / (var + self.settings.texture_variance);
        let out = agreement * texture;
        if out.is_finite() { out.max(0.0) } else { 0.0 }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::synth::{EMBEDDING, SphereScene};

    fn setup() -> (crate::scene::Scene, Vec<Option<SingleView>>) {
        let (scene, _) = SphereScene::default().scene();
        let views = (0..12)
            .map(|i| {
                let mut v = SingleView::new(&scene, i, EMBEDDING).ok()?;
                v.load_color_image(&scene, EMBEDDING).ok()?;
                Some(v)
            })
            .collect();
        (scene, views)
    }

    #[test]
    fn test_refines_depth() {
        let (_scene, views) = setup();
        let settings = Settings {
            nr_recon_neighbors: 2,
            ..Default::default()
        };
        let global: ViewSet = [1, 2, 10, 11].into();
        let master = views[0].as_ref().unwrap();
        let ray = master.view_ray_scaled(32.0, 24.0);
        // Depth of the sphere's front surface along the central ray
        let truth = 3.0;
        assert!((ray.norm() - 1.0).abs() < 1e-5);

        let mut opt = PatchOptimization::new(
            &views,
            &settings,
            &global,
            32,
            24,
            truth + 0.04,
            0.0,
            0.0,
            &ViewSet::new(),
        );
        assert_eq!(opt.state(), OptimizationState::NotStarted);
        assert_eq!(opt.local_views().len(), 2);
        opt.do_auto_optimization();
        assert_eq!(opt.state(), OptimizationState::Converged);
        let (depth, ..) = opt.hypothesis();
        let p = master.position() + ray * depth;
        let err = (p.norm() - 1.0).abs();
        assert!(err < 0.02, "bad depth {depth} (error {err})");

        let conf = opt.compute_confidence();
        assert!(conf > 0.0 && conf <= 1.0, "bad confidence {conf}");
        let n = opt.normal().unwrap();
        assert!(n.dot(&(master.position() - p)) > 0.0, "bad normal {n:?}");
    }

    #[test]
    fn test_objective() {
        let (_scene, views) = setup();
        let settings = Settings {
            nr_recon_neighbors: 2,
            ..Default::default()
        };
        let global: ViewSet = [1, 2, 10, 11].into();
        let master = views[0].as_ref().unwrap();
        let ray = master.view_ray_scaled(32.0, 24.0);
        let o = master.position();
        let b = o.dot(&ray);
        let truth = -b - (b * b - o.norm_squared() + 1.0).sqrt();

        let mut opt = PatchOptimization::new(
            &views,
            &settings,
            &global,
            32,
            24,
            truth,
            0.0,
            0.0,
            &ViewSet::new(),
        );
        let at_surface = opt.objective().unwrap();
        assert!(at_surface >= 0.0);
        opt.sampler.update(truth + 0.2, 0.0, 0.0);
        let off_surface = opt.objective().unwrap();
        assert!(
            off_surface > at_surface,
            "objective {off_surface} off the surface beats {at_surface}"
        );
    }

    #[test]
    fn test_converged_is_stable() {
        let (_scene, views) = setup();
        let settings = Settings {
            nr_recon_neighbors: 2,
            ..Default::default()
        };
        let global: ViewSet = [1, 2, 10, 11].into();
        let mut first = PatchOptimization::new(
            &views,
            &settings,
            &global,
            32,
            24,
            3.04,
            0.0,
            0.0,
            &ViewSet::new(),
        );
        first.do_auto_optimization();
        assert_eq!(first.state(), OptimizationState::Converged);
        let (depth, dz_i, dz_j) = first.hypothesis();
        let normal = first.normal().unwrap();

        // Optimizing the result again leaves it in place
        let mut second = PatchOptimization::new(
            &views,
            &settings,
            &global,
            32,
            24,
            depth,
            dz_i,
            dz_j,
            first.local_views(),
        );
        second.do_auto_optimization();
        assert_eq!(second.state(), OptimizationState::Converged);
        let (d, ..) = second.hypothesis();
        assert!((d - depth).abs() < 0.02, "depth moved from {depth} to {d}");
        let n = second.normal().unwrap();
        assert!(n.dot(&normal) > 0.95, "normal moved from {normal:?} to {n:?}");
    }

    #[test]
    fn test_background_fails() {
        let (_scene, views) = setup();
        let settings = Settings::default();
        let global: ViewSet = [1, 2, 10, 11].into();
        // Corner pixels see random background, which no neighbor matches
        let mut opt = PatchOptimization::new(
            &views,
            &settings,
            &global,
            4,
            4,
            3.0,
            0.0,
            0.0,
            &ViewSet::new(),
        );
        opt.do_auto_optimization();
        assert_eq!(opt.compute_confidence(), 0.0);
    }

    #[test]
    fn test_border_fails() {
        let (_scene, views) = setup();
        let settings = Settings::default();
        let global: ViewSet = [1, 2, 10, 11].into();
        let mut opt = PatchOptimization::new(
            &views,
            &settings,
            &global,
            1,
            24,
            3.0,
            0.0,
            0.0,
            &ViewSet::new(),
        );
        assert_eq!(opt.state(), OptimizationState::Failed);
        opt.do_auto_optimization();
        assert_eq!(opt.state(), OptimizationState::Failed);
        assert_eq!(opt.compute_confidence(), 0.0);
    }
}
