//! Color sampling of planar patches across views
//!
//! A patch is a `filter_width x filter_width` grid of master pixels around
//! `(x, y)`.  Each grid point is placed along its own view ray at
//! `depth + i * dz_i + j * dz_j`, where `(i, j)` is its offset from the
//! center; `(dz_i, dz_j)` therefore encode the patch orientation.
//!
//! Similarity scores work on colors divided by their per-channel mean, so
//! they are invariant to a per-channel gain in either view.
use super::{settings::Settings, single_view::SingleView};
use nalgebra::Vector3;

/// Per-channel means below this value make a sample set unusable
const MIN_MEAN: f32 = 0.01;

/// Neighbor samples nearer than this (in pixels) to the border are invalid
const NEIGH_BORDER: f32 = 1.0;

/// Divides samples by their per-channel mean
///
/// Returns `None` if any channel's mean is too dark.
fn normalized(samples: &[Vector3<f32>]) -> Option<Vec<Vector3<f32>>> {
    let mean = samples.iter().sum::<Vector3<f32>>() / samples.len() as f32;
    if mean.iter().any(|m| !(*m >= MIN_MEAN)) {
        return None;
    }
    Some(samples.iter().map(|s| s.component_div(&mean)).collect())
}

/// Sum of squared deviations from 1, for mean-normalized samples
fn sqr_dev(samples: &[Vector3<f32>]) -> f32 {
    samples
        .iter()
        .map(|s| (s - Vector3::repeat(1.0)).norm_squared())
        .sum()
}

/// NCC between two mean-normalized sample sets
fn ncc_normalized(a: &[Vector3<f32>], b: &[Vector3<f32>]) -> Option<f32> {
    let one = Vector3::repeat(1.0);
    let dev_xy: f32 =
        a.iter().zip(b).map(|(x, y)| (x - one).dot(&(y - one))).sum();
    let denom = (sqr_dev(a) * sqr_dev(b)).sqrt();
    (denom > f32::EPSILON).then(|| dev_xy / denom)
}

/// Colors and depth derivatives drawn from one neighbor view
#[derive(Clone, Debug)]
pub struct ColorAndDeriv {
    /// Raw colors at each patch point
    pub color: Vec<Vector3<f32>>,
    /// Derivative of color with respect to depth along each master ray
    pub deriv: Vec<Vector3<f32>>,
    /// Depth change that moves the patch center by one neighbor pixel
    pub step: f32,
}

/// Samples a single patch hypothesis across the master and neighbor views
pub struct PatchSampler<'a> {
    views: &'a [Option<SingleView>],
    settings: &'a Settings,
    x: usize,
    y: usize,
    depth: f32,
    dz_i: f32,
    dz_j: f32,
    /// Unit view rays through each patch pixel
    master_view_dirs: Vec<Vector3<f32>>,
    patch_points: Vec<Vector3<f32>>,
    points_ok: bool,
    /// Master colors, mean-normalized; empty if unusable
    master_samples: Vec<Vector3<f32>>,
    master_mean: Vector3<f32>,
    master_sqr_dev: f32,
    /// Cached raw neighbor colors, indexed by view
    neigh_samples: Vec<Option<Vec<Vector3<f32>>>>,
}

impl<'a> PatchSampler<'a> {
    /// Builds a sampler for the master pixel `(x, y)` (at the working level)
    ///
    /// The master view must have its color pyramid loaded, and the patch
    /// must lie inside the master image; otherwise the sampler reports
    /// [`master_ok() == false`](Self::master_ok).
    pub fn new(
        views: &'a [Option<SingleView>],
        settings: &'a Settings,
        x: usize,
        y: usize,
        depth: f32,
        dz_i: f32,
        dz_j: f32,
    ) -> Self {
        let mut out = Self {
            views,
            settings,
            x,
            y,
            depth,
            dz_i,
            dz_j,
            master_view_dirs: vec![],
            patch_points: vec![],
            points_ok: false,
            master_samples: vec![],
            master_mean: Vector3::zeros(),
            master_sqr_dev: 0.0,
            neigh_samples: vec![None; views.len()],
        };
        out.compute_master_samples();
        out.compute_patch_points();
        out
    }

    fn master(&self) -> Option<&'a SingleView> {
        self.views.get(self.settings.ref_view)?.as_ref()
    }

    /// Iterates over patch offsets, in row-major order
    fn offsets(&self) -> impl Iterator<Item = (i32, i32)> + use<> {
        let r = self.settings.filter_radius() as i32;
        (-r..=r).flat_map(move |j| (-r..=r).map(move |i| (i, j)))
    }

    /// Number of samples in the patch
    pub fn num_samples(&self) -> usize {
        self.settings.filter_width * self.settings.filter_width
    }

    fn compute_master_samples(&mut self) {
        let Some(master) = self.master() else {
            return;
        };
        let Some(img) = master.image(master.scale()) else {
            return;
        };
        let r = self.settings.filter_radius();
        if self.x < r
            || self.y < r
            || self.x + r >= img.width()
            || self.y + r >= img.height()
        {
            return;
        }
        let mut dirs = Vec::with_capacity(self.num_samples());
        let mut colors = Vec::with_capacity(self.num_samples());
        for (i, j) in self.offsets() {
            let px = (self.x as i32 + i) as usize;
            let py = (self.y as i32 + j) as usize;
            colors.push(img.linear_at(px as f32, py as f32));
            dirs.push(master.view_ray_scaled(px as f32, py as f32));
        }
        self.master_view_dirs = dirs;
        let Some(normed) = normalized(&colors) else {
            return;
        };
        self.master_mean =
            colors.iter().sum::<Vector3<f32>>() / colors.len() as f32;
        self.master_sqr_dev = sqr_dev(&normed);
        self.master_samples = normed;
    }

    fn compute_patch_points(&mut self) {
        self.patch_points.clear();
        self.points_ok = false;
        let Some(master) = self.master() else {
            return;
        };
        if self.master_view_dirs.is_empty() {
            return;
        }
        let center = master.position();
        let offsets: Vec<_> = self.offsets().collect();
        for ((i, j), dir) in offsets.into_iter().zip(&self.master_view_dirs) {
            let d = self.depth + i as f32 * self.dz_i + j as f32 * self.dz_j;
            if !(d > 0.0) {
                self.patch_points.clear();
                return;
            }
            self.patch_points.push(center + dir * d);
        }
        self.points_ok = true;
    }

    /// Moves the hypothesis, invalidating cached neighbor samples
    pub fn update(&mut self, depth: f32, dz_i: f32, dz_j: f32) {
        self.depth = depth;
        self.dz_i = dz_i;
        self.dz_j = dz_j;
        self.compute_patch_points();
        self.neigh_samples.iter_mut().for_each(|s| *s = None);
    }

    /// Checks that the master patch is usable: inside the image, bright
    /// enough, and with every patch point in front of the camera
    pub fn master_ok(&self) -> bool {
        self.points_ok && !self.master_samples.is_empty()
    }

    /// Returns mean-normalized master colors
    pub fn master_samples(&self) -> &[Vector3<f32>] {
        &self.master_samples
    }

    /// Returns the mean master color
    pub fn master_mean(&self) -> Vector3<f32> {
        self.master_mean
    }

    /// Variance of the mean-normalized master colors, per channel
    pub fn master_variance(&self) -> f32 {
        self.master_sqr_dev / (3 * self.master_samples.len().max(1)) as f32
    }

    /// Returns world positions of the patch points
    pub fn patch_points(&self) -> &[Vector3<f32>] {
        &self.patch_points
    }

    /// Returns the patch center in world coordinates
    pub fn mid_world_point(&self) -> Option<Vector3<f32>> {
        self.patch_points.get(self.num_samples() / 2).copied()
    }

    /// Returns the unit view ray through the master pixel
    pub fn mid_view_dir(&self) -> Option<Vector3<f32>> {
        self.master_view_dirs.get(self.num_samples() / 2).copied()
    }

    /// Estimates the patch normal, oriented towards the master camera
    pub fn patch_normal(&self) -> Option<Vector3<f32>> {
        let fw = self.settings.filter_width;
        let r = self.settings.filter_radius();
        if !self.points_ok || r == 0 {
            return None;
        }
        let p = &self.patch_points;
        let horiz = p[r * fw + fw - 1] - p[r * fw];
        let vert = p[(fw - 1) * fw + r] - p[r];
        let n = horiz.cross(&vert).try_normalize(f32::EPSILON)?;
        let dir = self.mid_view_dir()?;
        Some(if n.dot(&dir) > 0.0 { -n } else { n })
    }

    /// Picks the neighbor pyramid level whose footprint best matches the
    /// master's at the patch center
    fn neighbor_level(&self, v: &SingleView) -> Option<usize> {
        let master = self.master()?;
        let p0 = self.mid_world_point()?;
        let mfp = master.foot_print_scaled(&p0);
        let nfp = v.foot_print(&p0);
        if !(mfp > 0.0 && nfp > 0.0) {
            return None;
        }
        let mut ratio = nfp / mfp;
        let mut level = 0;
        while ratio < 0.5 {
            level += 1;
            ratio *= 2.0;
        }
        Some(v.clamp_level(level))
    }

    /// Draws raw colors for every patch point from a neighbor view
    ///
    /// Fails if any point projects within 1 pixel of the image border.
    pub fn neigh_samples(&mut self, v: usize) -> Option<&[Vector3<f32>]> {
        if self.neigh_samples.get(v)?.is_none() {
            let s = self.draw_neigh_samples(v)?;
            self.neigh_samples[v] = Some(s);
        }
        self.neigh_samples[v].as_deref()
    }

    fn draw_neigh_samples(&self, v: usize) -> Option<Vec<Vector3<f32>>> {
        if !self.master_ok() {
            return None;
        }
        let view = self.views.get(v)?.as_ref()?;
        let level = self.neighbor_level(view)?;
        let img = view.image(level)?;
        self.patch_points
            .iter()
            .map(|p| {
                let s = view.world_to_screen(p, level);
                img.contains(s.x, s.y, NEIGH_BORDER)
                    .then(|| img.linear_at(s.x, s.y))
            })
            .collect()
    }

    /// Draws colors and their derivatives with respect to depth
    ///
    /// Derivatives are taken along each master ray and scaled to a unit
    /// change in depth.
    pub fn fast_col_and_deriv(&mut self, v: usize) -> Option<ColorAndDeriv> {
        if !self.master_ok() {
            return None;
        }
        let view = self.views.get(v)?.as_ref()?;
        let level = self.neighbor_level(view)?;
        let img = view.image(level)?;
        let mid = self.num_samples() / 2;

        // Depth change that moves the projected center by one pixel
        let p0 = self.patch_points[mid];
        let p1 = p0 + self.master_view_dirs[mid];
        let d = (view.world_to_screen(&p1, level)
            - view.world_to_screen(&p0, level))
        .norm();
        if !(d > 0.0) {
            return None;
        }
        let step = 1.0 / d;

        let mut color = Vec::with_capacity(self.num_samples());
        let mut deriv = Vec::with_capacity(self.num_samples());
        for (p, dir) in self.patch_points.iter().zip(&self.master_view_dirs) {
            let s0 = view.world_to_screen(p, level);
            if !img.contains(s0.x, s0.y, NEIGH_BORDER) {
                return None;
            }
            let s1 = view.world_to_screen(&(p + dir * step), level);
            let g = s1 - s0;
            let (c, dc) = img.linear_with_derivative(s0.x, s0.y, g.x, g.y);
            color.push(c);
            deriv.push(dc / step);
        }
        self.neigh_samples[v] = Some(color.clone());
        Some(ColorAndDeriv { color, deriv, step })
    }

    /// NCC between the master patch and a neighbor view
    pub fn fast_ncc(&mut self, v: usize) -> Option<f32> {
        let n = normalized(self.neigh_samples(v)?)?;
        ncc_normalized(&self.master_samples, &n)
    }

    /// NCC between two neighbor views
    pub fn ncc(&mut self, u: usize, v: usize) -> Option<f32> {
        let a = normalized(self.neigh_samples(u)?)?;
        let b = normalized(self.neigh_samples(v)?)?;
        ncc_normalized(&a, &b)
    }

    /// Sum of absolute differences after scaling neighbor colors by `cs`
    pub fn sad(&mut self, v: usize, cs: &Vector3<f32>) -> Option<f32> {
        let n = self.neigh_samples(v)?.to_vec();
        Some(
            self.master_samples
                .iter()
                .zip(&n)
                .map(|(m, c)| (m - c.component_mul(cs)).abs().sum())
                .sum(),
        )
    }

    /// Sum of squared differences after scaling neighbor colors by `cs`
    pub fn ssd(&mut self, v: usize, cs: &Vector3<f32>) -> Option<f32> {
        let n = self.neigh_samples(v)?.to_vec();
        Some(
            self.master_samples
                .iter()
                .zip(&n)
                .map(|(m, c)| (m - c.component_mul(cs)).norm_squared())
                .sum(),
        )
    }

    /// Returns the current hypothesis as `(depth, dz_i, dz_j)`
    pub fn hypothesis(&self) -> (f32, f32, f32) {
        (self.depth, self.dz_i, self.dz_j)
    }

    /// Returns the master pixel
    pub fn pixel(&self) -> (usize, usize) {
        (self.x, self.y)
    }

    /// Returns every view, indexed by id
    pub fn views(&self) -> &'a [Option<SingleView>] {
        self.views
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::synth::{EMBEDDING, SphereScene};
    use approx::assert_relative_eq;

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

    /// Distance along the master ray through `(x, y)` to the unit sphere
    fn true_depth(views: &[Option<SingleView>], x: f32, y: f32) -> f32 {
        let master = views[0].as_ref().unwrap();
        let o = master.position();
        let d = master.view_ray_scaled(x, y);
        let b = o.dot(&d);
        let c = o.norm_squared() - 1.0;
        -b - (b * b - c).sqrt()
    }

    #[test]
    fn test_normalized() {
        let a: Vec<_> = (0..9)
            .map(|i| {
                let t = i as f32;
                Vector3::new(0.2 + 0.05 * t, 0.5 + 0.01 * t * t, 0.9 - 0.03 * t)
            })
            .collect();
        let n = normalized(&a).unwrap();
        let mean = n.iter().sum::<Vector3<f32>>() / n.len() as f32;
        assert_relative_eq!(mean, Vector3::repeat(1.0), epsilon = 1e-5);

        // Invariant to a per-channel gain
        let b: Vec<_> = a
            .iter()
            .map(|c| c.component_mul(&Vector3::new(2.0, 0.5, 1.5)))
            .collect();
        let m = normalized(&b).unwrap();
        let ncc = ncc_normalized(&n, &m).unwrap();
        assert_relative_eq!(ncc, 1.0, epsilon = 1e-4);

        let dark = vec![Vector3::new(0.001, 0.5, 0.5); 9];
        assert!(normalized(&dark).is_none());

        // Flat patches have no defined correlation
        let flat = vec![Vector3::repeat(0.5); 9];
        let f = normalized(&flat).unwrap();
        assert!(ncc_normalized(&f, &n).is_none());
    }

    #[test]
    fn test_master_samples() {
        let views = setup();
        let settings = Settings::default();
        let depth = true_depth(&views, 32.0, 24.0);
        let s = PatchSampler::new(&views, &settings, 32, 24, depth, 0.0, 0.0);
        assert!(s.master_ok());
        assert_eq!(s.pixel(), (32, 24));
        assert_eq!(s.master_samples().len(), 25);
        assert_eq!(s.patch_points().len(), 25);
        assert!(s.master_variance() > 0.0);
        assert!(s.master_mean().iter().all(|m| *m > 0.0));

        let p = s.mid_world_point().unwrap();
        assert_relative_eq!(p.norm(), 1.0, epsilon = 1e-4);
        let dir = s.mid_view_dir().unwrap();
        let n = s.patch_normal().unwrap();
        assert!(n.dot(&dir) < -0.9, "bad normal {n:?}");
    }

    #[test]
    fn test_ncc_peaks_at_surface() {
        let views = setup();
        let settings = Settings::default();
        let depth = true_depth(&views, 32.0, 24.0);
        let mut s =
            PatchSampler::new(&views, &settings, 32, 24, depth, 0.0, 0.0);
        let good = s.fast_ncc(1).unwrap();
        assert!(good > 0.8, "bad NCC at the surface: {good}");
        let pair = s.ncc(1, 11).unwrap();
        assert!(pair > 0.5, "bad NCC between neighbors: {pair}");
        let ssd = s.ssd(1, &Vector3::repeat(1.0)).unwrap();
        let sad = s.sad(1, &Vector3::repeat(1.0)).unwrap();
        assert!(ssd >= 0.0 && sad >= 0.0);

        s.update(depth + 0.3, 0.0, 0.0);
        assert_eq!(s.hypothesis(), (depth + 0.3, 0.0, 0.0));
        let bad = s.fast_ncc(1).unwrap_or(-1.0);
        assert!(bad < good, "NCC {bad} off the surface beats {good}");
    }

    #[test]
    fn test_col_and_deriv() {
        let views = setup();
        let settings = Settings::default();
        let depth = true_depth(&views, 32.0, 24.0);
        let mut s =
            PatchSampler::new(&views, &settings, 32, 24, depth, 0.0, 0.0);
        let cd = s.fast_col_and_deriv(2).unwrap();
        assert_eq!(cd.color.len(), 25);
        assert_eq!(cd.deriv.len(), 25);
        assert!(cd.step > 0.0);
        // Colors are cached for later scoring
        assert_eq!(s.neigh_samples(2).unwrap(), cd.color.as_slice());
    }

    #[test]
    fn test_border_agreement() {
        let views = setup();
        let settings = Settings::default();
        let (mut inside, mut outside) = (0, 0);
        for v in 1..12 {
            for k in 0..40 {
                // Sweeps the patch along the epipolar line in each view
                let depth = 1.0 + k as f32 * 0.25;
                let sampler = || {
                    let (x, y) = (32, 24);
                    PatchSampler::new(&views, &settings, x, y, depth, 0.0, 0.0)
                };
                let (mut a, mut b) = (sampler(), sampler());
                let cd = a.fast_col_and_deriv(v);
                let ns = b.neigh_samples(v).map(|s| s.to_vec());
                match (cd, ns) {
                    (Some(cd), Some(ns)) => {
                        assert_eq!(cd.color, ns, "view {v} at depth {depth}");
                        inside += 1;
                    }
                    (None, None) => outside += 1,
                    (cd, ns) => panic!(
                        "view {v} at depth {depth}: derivative samples {}, \
                         colors {}",
                        cd.is_some(),
                        ns.is_some()
                    ),
                }
            }
        }
        assert!(inside > 0 && outside > 0, "{inside} inside, {outside} out");
    }

    #[test]
    fn test_invalid_patches() {
        let views = setup();
        let settings = Settings::default();
        let mut s = PatchSampler::new(&views, &settings, 1, 24, 3.0, 0.0, 0.0);
        assert!(!s.master_ok());
        assert!(s.neigh_samples(1).is_none());
        assert!(s.fast_ncc(1).is_none());

        // Patch points behind the camera
        let mut s =
            PatchSampler::new(&views, &settings, 32, 24, 3.0, 0.0, 0.0);
        assert!(s.master_ok());
        s.update(0.5, 1.0, 0.0);
        assert!(!s.master_ok());
        assert!(s.patch_normal().is_none());
    }
}
