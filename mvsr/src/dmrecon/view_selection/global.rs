use super::{ViewSelector, ViewSet, parallax};
use crate::{
    Error,
    dmrecon::{settings::Settings, single_view::SingleView},
    scene::Feature,
};

/// Per-run selection of neighbor views, driven by shared sparse features
///
/// Each candidate is scored by summing a benefit over the features it has
/// registered.  A feature's benefit falls off for small parallax against the
/// reference view, for a footprint mismatch of more than 2x, and for small
/// parallax against every view selected so far.
pub struct GlobalViewSelection<'a> {
    views: &'a [Option<SingleView>],
    features: &'a [Feature],
    settings: &'a Settings,
}

impl<'a> GlobalViewSelection<'a> {
    /// Builds a selector
    ///
    /// Features must already be registered with the views that see them.
    pub fn new(
        views: &'a [Option<SingleView>],
        features: &'a [Feature],
        settings: &'a Settings,
    ) -> Self {
        Self {
            views,
            features,
            settings,
        }
    }

    /// Selects up to `global_vs_max` neighbors of the reference view
    ///
    /// Returns [`Error::NoGlobalViews`] if no view has a positive benefit.
    pub fn perform(&mut self) -> Result<ViewSet, Error> {
        let ref_view = self.settings.ref_view;
        let candidates: ViewSet = self
            .views
            .iter()
            .enumerate()
            .filter(|(i, v)| *i != ref_view && v.is_some())
            .map(|(i, _)| i)
            .collect();
        let max = self.settings.global_vs_max;
        let out = self.select(&candidates, ViewSet::new(), max);
        if out.is_empty() {
            return Err(Error::NoGlobalViews);
        }
        log::info!("selected {} global views: {out:?}", out.len());
        Ok(out)
    }

    fn min_parallax_penalty(&self, plx: f32) -> f32 {
        if plx < self.settings.min_parallax {
            (plx / 10.0).powi(2)
        } else {
            1.0
        }
    }
}

impl ViewSelector for GlobalViewSelection<'_> {
    fn score(&mut self, candidate: usize, selected: &ViewSet) -> Option<f32> {
        let master = self.views.get(self.settings.ref_view)?.as_ref()?;
        let view = self.views.get(candidate)?.as_ref()?;
        let mut benefit = 0.0;
        for &f in view.features() {
            let pos = self.features[f].pos;
            let plx = parallax(&pos, &master.position(), &view.position());
            let mut score = self.min_parallax_penalty(plx);

            let mfp = master.foot_print_scaled(&pos);
            let nfp = view.foot_print(&pos);
            let ratio = mfp / nfp;
            score *= if ratio > 2.0 {
                2.0 / ratio
            } else if ratio > 1.0 {
                1.0
            } else {
                ratio
            };

            for s in selected {
                let Some(Some(other)) = self.views.get(*s) else {
                    continue;
                };
                let plx = parallax(&pos, &other.position(), &view.position());
                score *= self.min_parallax_penalty(plx);
            }
            if score.is_finite() {
                benefit += score;
            }
        }
        Some(benefit)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        image::ColorImage,
        scene::{Bundle, CameraInfo, FeatureRef, MemoryStore, Scene},
    };
    use nalgebra::{Vector2, Vector3};
    use std::sync::Arc;

    /// Cameras on a circle of radius 5 around the origin, at the given
    /// angles (in degrees)
    fn scene(angles: &[f32]) -> Scene {
        let mut store = MemoryStore::new();
        for a in angles {
            let a = a.to_radians();
            let eye = Vector3::new(a.sin(), 0.0, -a.cos()) * 5.0;
            let cam =
                CameraInfo::look_at(eye, Vector3::zeros(), Vector3::y(), 1.0);
            let v = store.add_view(Some(cam));
            store.insert_image(v, "undistorted", ColorImage::new(64, 48, 3));
        }
        let refs = (0..angles.len())
            .map(|view| FeatureRef {
                view,
                pos: Vector2::zeros(),
            })
            .collect::<Vec<_>>();
        let features = (0..9)
            .map(|i| Feature {
                pos: Vector3::new(
                    (i % 3) as f32 * 0.2 - 0.2,
                    (i / 3) as f32 * 0.2 - 0.2,
                    0.0,
                ),
                color: Vector3::repeat(0.5),
                refs: refs.clone(),
            })
            .collect();
        Scene::new(Arc::new(store), Bundle { features })
    }

    fn views(scene: &Scene) -> Vec<Option<SingleView>> {
        (0..scene.store.num_views())
            .map(|i| {
                let mut v = SingleView::new(scene, i, "undistorted").ok()?;
                for f in 0..scene.bundle.features.len() {
                    v.add_feature(f);
                }
                Some(v)
            })
            .collect()
    }

    #[test]
    fn test_prefers_parallax() {
        // View 1 is almost co-located with the reference view
        let s = scene(&[0.0, 2.0, 20.0, -25.0]);
        let views = views(&s);
        let settings = Settings {
            global_vs_max: 2,
            ..Default::default()
        };
        let mut gvs =
            GlobalViewSelection::new(&views, &s.bundle.features, &settings);
        let out = gvs.perform().unwrap();
        assert_eq!(out, [2, 3].into(), "bad selection {out:?}");
    }

    #[test]
    fn test_redundant_views() {
        // Views 2 and 3 are nearly identical, so picking one of them makes
        // the other worthless
        let s = scene(&[0.0, -40.0, 20.0, 21.0]);
        let views = views(&s);
        let settings = Settings {
            global_vs_max: 2,
            ..Default::default()
        };
        let mut gvs =
            GlobalViewSelection::new(&views, &s.bundle.features, &settings);
        let out = gvs.perform().unwrap();
        assert!(out.contains(&1), "bad selection {out:?}");
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_no_features() {
        let s = scene(&[0.0, 20.0]);
        let views: Vec<_> = (0..2)
            .map(|i| SingleView::new(&s, i, "undistorted").ok())
            .collect();
        let settings = Settings::default();
        let mut gvs =
            GlobalViewSelection::new(&views, &s.bundle.features, &settings);
        assert!(matches!(gvs.perform(), Err(Error::NoGlobalViews)));
    }
}
