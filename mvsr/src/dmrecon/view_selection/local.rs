use super::{ViewSelector, ViewSet, parallax, parallax_to_weight};
use crate::dmrecon::{patch_sampler::PatchSampler, settings::Settings};
use nalgebra::Vector3;
use std::collections::BTreeMap;

/// Per-pixel selection of neighbor views from the global set
///
/// Candidates must match the master patch with an NCC of at least
/// `min_ncc`.  Scores start from that NCC and are weighted towards a
/// parallax of about 20 degrees, both against the reference view and
/// against views already selected.  Candidates whose epipolar plane is
/// close to that of a selected view are penalized, as are candidates with
/// a much finer footprint than the master.
pub struct LocalViewSelection<'s, 'a> {
    sampler: &'s mut PatchSampler<'a>,
    settings: &'a Settings,
    global: &'s ViewSet,
    ncc: BTreeMap<usize, f32>,
}

impl<'s, 'a> LocalViewSelection<'s, 'a> {
    /// Builds a selector drawing candidates from `global`
    pub fn new(
        sampler: &'s mut PatchSampler<'a>,
        settings: &'a Settings,
        global: &'s ViewSet,
    ) -> Self {
        Self {
            sampler,
            settings,
            global,
            ncc: BTreeMap::new(),
        }
    }

    /// Evaluates (and caches) a candidate's NCC against the master patch
    ///
    /// Returns `true` if the candidate is good enough to be used.
    fn check(&mut self, v: usize) -> bool {
        match self.sampler.fast_ncc(v) {
            Some(ncc) if ncc >= self.settings.min_ncc => {
                self.ncc.insert(v, ncc);
                true
            }
            _ => false,
        }
    }

    /// Selects exactly `nr_recon_neighbors` views
    ///
    /// Propagated views (e.g. from a neighboring pixel) are kept when they
    /// still match the master patch.  Returns `None` if there are not
    /// enough usable views.
    pub fn perform(&mut self, propagated: &ViewSet) -> Option<ViewSet> {
        self.ncc.clear();
        let n = self.settings.nr_recon_neighbors;
        let keep: ViewSet = propagated
            .iter()
            .copied()
            .filter(|v| self.check(*v))
            .take(n)
            .collect();
        self.fill(keep, &ViewSet::new())
    }

    /// Drops `to_replace` from `current` and backfills the selection
    ///
    /// Neither the dropped views nor the remaining ones are considered as
    /// candidates.  Returns `None` if the selection cannot be completed.
    pub fn replace_views(
        &mut self,
        current: &ViewSet,
        to_replace: &ViewSet,
    ) -> Option<ViewSet> {
        self.ncc.clear();
        let keep: ViewSet = current.difference(to_replace).copied().collect();
        for v in &keep {
            if let Some(ncc) = self.sampler.fast_ncc(*v) {
                self.ncc.insert(*v, ncc);
            }
        }
        self.fill(keep, to_replace)
    }

    fn fill(&mut self, keep: ViewSet, exclude: &ViewSet) -> Option<ViewSet> {
        let n = self.settings.nr_recon_neighbors;
        let ref_view = self.settings.ref_view;
        let global = self.global;
        let mut candidates = ViewSet::new();
        for &v in global {
            if v != ref_view
                && !keep.contains(&v)
                && !exclude.contains(&v)
                && self.check(v)
            {
                candidates.insert(v);
            }
        }
        let out = self.select(&candidates, keep, n);
        (out.len() == n).then_some(out)
    }

    /// Unit direction from `p` towards a view's camera
    fn dir_to(&self, p: &Vector3<f32>, v: usize) -> Option<Vector3<f32>> {
        let view = self.sampler.views().get(v)?.as_ref()?;
        (view.position() - p).try_normalize(f32::EPSILON)
    }
}

impl ViewSelector for LocalViewSelection<'_, '_> {
    fn score(&mut self, candidate: usize, selected: &ViewSet) -> Option<f32> {
        let mut score = *self.ncc.get(&candidate)?;
        let views = self.sampler.views();
        let master = views.get(self.settings.ref_view)?.as_ref()?;
        let view = views.get(candidate)?.as_ref()?;
        let p = self.sampler.mid_world_point()?;

        let mfp = master.foot_print_scaled(&p);
        let nfp = view.foot_print(&p);
        if mfp / nfp < 0.5 {
            score *= 0.01;
        }
        let ref_pos = master.position();
        score *= parallax_to_weight(parallax(&p, &ref_pos, &view.position()));

        let dir_ref = self.dir_to(&p, self.settings.ref_view)?;
        let dir = self.dir_to(&p, candidate)?;
        let ep = dir_ref.cross(&dir).try_normalize(f32::EPSILON);
        for &s in selected {
            let Some(dir_s) = self.dir_to(&p, s) else {
                continue;
            };
            let ep_s = dir_ref.cross(&dir_s).try_normalize(f32::EPSILON);
            let angle = match (ep, ep_s) {
                (Some(a), Some(b)) => {
                    let angle = a.dot(&b).clamp(-1.0, 1.0).acos().to_degrees();
                    if angle > 90.0 { 180.0 - angle } else { angle }
                }
                _ => 0.0,
            }
            .max(1.0);
            if angle < self.settings.min_parallax {
                score *= (angle / self.settings.min_parallax).powi(2);
            }
            let plx = dir.dot(&dir_s).clamp(-1.0, 1.0).acos().to_degrees();
            score *= parallax_to_weight(plx);
        }
        Some(score)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        dmrecon::single_view::SingleView,
        synth::{EMBEDDING, SphereScene},
    };

    fn setup() -> Vec<Option<SingleView>> {
        let (scene, _) = SphereScene::default().scene();
        (0..12)
            .map(|i| {
                let mut v = SingleView::new(&scene, i, EMBEDDING).ok()?;
                v.load_color_image(&scene, EMBEDDING).ok()?;
                Some(v)
            })
            .collect()
    }

    fn two_neighbors() -> Settings {
        Settings {
            nr_recon_neighbors: 2,
            ..Default::default()
        }
    }

    #[test]
    fn test_perform() {
        let views = setup();
        let settings = two_neighbors();
        let global: ViewSet = [1, 2, 6, 10, 11].into();
        let mut sampler =
            PatchSampler::new(&views, &settings, 32, 24, 3.0, 0.0, 0.0);
        let mut lvs = LocalViewSelection::new(&mut sampler, &settings, &global);

        let out = lvs.perform(&ViewSet::new()).unwrap();
        assert_eq!(out.len(), 2);
        assert!(out.is_subset(&global), "bad selection {out:?}");
        // View 6 is on the far side of the sphere
        assert!(!out.contains(&6), "bad selection {out:?}");

        // A matching propagated view is kept
        let out = lvs.perform(&[11].into()).unwrap();
        assert!(out.contains(&11), "bad selection {out:?}");
    }

    #[test]
    fn test_replace_views() {
        let views = setup();
        let settings = two_neighbors();
        let global: ViewSet = [1, 2, 10, 11].into();
        let mut sampler =
            PatchSampler::new(&views, &settings, 32, 24, 3.0, 0.0, 0.0);
        let mut lvs = LocalViewSelection::new(&mut sampler, &settings, &global);

        let current = lvs.perform(&ViewSet::new()).unwrap();
        let Some(&dropped) = current.iter().next() else {
            panic!("empty selection");
        };
        let out = lvs.replace_views(&current, &[dropped].into()).unwrap();
        assert_eq!(out.len(), 2);
        assert!(!out.contains(&dropped), "bad selection {out:?}");
        assert!(out.is_subset(&global));
    }

    #[test]
    fn test_not_enough_views() {
        let views = setup();
        let settings = two_neighbors();
        let global: ViewSet = [1, 6].into();
        let mut sampler =
            PatchSampler::new(&views, &settings, 32, 24, 3.0, 0.0, 0.0);
        let mut lvs = LocalViewSelection::new(&mut sampler, &settings, &global);
        assert!(lvs.perform(&ViewSet::new()).is_none());
    }
}
