//! Procedural test scenes: a textured sphere seen by a ring of cameras
//!
//! Rendered images are exact (up to supersampling) and the ground truth is
//! known analytically, so reconstruction results can be checked against
//! the sphere's radius.
//!
//! ```
//! use mvsr::synth::SphereScene;
//!
//! let (scene, store) = SphereScene::default().scene();
//! assert_eq!(store.raster_names(0).len(), 0);
//! assert!(!scene.bundle.features.is_empty());
//! ```
use crate::{
    image::ColorImage,
    scene::{
        Bundle, CameraInfo, Feature, FeatureRef, MemoryStore, Scene, ViewStore,
    },
};
use nalgebra::{Vector2, Vector3};
use rand::{Rng, SeedableRng, rngs::StdRng};
use std::{f32::consts::TAU, sync::Arc};

/// Smooth 3D value noise on a periodic lattice
struct ValueNoise {
    values: Vec<f32>,
    size: usize,
    cell: f32,
}

impl ValueNoise {
    fn new(rng: &mut StdRng, size: usize, cell: f32) -> Self {
        let values = (0..size * size * size).map(|_| rng.r#gen()).collect();
        Self { values, size, cell }
    }

    fn lattice(&self, i: i64, j: i64, k: i64) -> f32 {
        let n = self.size as i64;
        let (i, j, k) = (i.rem_euclid(n), j.rem_euclid(n), k.rem_euclid(n));
        self.values[((k * n + j) * n + i) as usize]
    }

    fn at(&self, p: &Vector3<f32>) -> f32 {
        let q = p / self.cell;
        let f = q.map(|v| v.floor());
        let t = (q - f).map(|v| v * v * (3.0 - 2.0 * v));
        let (i, j, k) = (f.x as i64, f.y as i64, f.z as i64);
        let mut out = 0.0;
        for c in 0..8i64 {
            let (dx, dy, dz) = (c & 1, c >> 1 & 1, c >> 2);
            let w = (if dx == 1 { t.x } else { 1.0 - t.x })
                * (if dy == 1 { t.y } else { 1.0 - t.y })
                * (if dz == 1 { t.z } else { 1.0 - t.z });
            out += w * self.lattice(i + dx, j + dy, k + dz);
        }
        out
    }
}

/// Sphere texture: two octaves of value noise per channel
struct Texture {
    channels: [(ValueNoise, ValueNoise); 3],
}

impl Texture {
    fn new(rng: &mut StdRng, radius: f32) -> Self {
        let mut octaves = || {
            (
                ValueNoise::new(rng, 16, radius * 0.3),
                ValueNoise::new(rng, 16, radius * 0.1),
            )
        };
        Self {
            channels: [octaves(), octaves(), octaves()],
        }
    }

    fn color(&self, p: &Vector3<f32>) -> Vector3<f32> {
        let c = |(a, b): &(ValueNoise, ValueNoise)| {
            0.15 + 0.45 * a.at(p) + 0.35 * b.at(p)
        };
        Vector3::new(
            c(&self.channels[0]),
            c(&self.channels[1]),
            c(&self.channels[2]),
        )
    }
}

/// Parameters of a synthetic sphere scene
///
/// Cameras sit on a ring around the sphere, alternating slightly above and
/// below its equator, all looking at the center.  Every camera sees the
/// sphere against a background of per-view random noise, so only the
/// sphere is photo-consistent.
#[derive(Clone, Debug)]
pub struct SphereScene {
    /// Number of cameras
    pub num_views: usize,
    /// Image width, in pixels
    pub width: usize,
    /// Image height, in pixels
    pub height: usize,
    /// Sphere radius; the sphere is centered at the origin
    pub radius: f32,
    /// Distance from camera centers to the origin
    pub distance: f32,
    /// Normalized focal length
    pub flen: f32,
    /// Number of sparse features, spread evenly over the sphere
    pub num_features: usize,
    /// Seed for the texture and background noise
    pub seed: u64,
}

impl Default for SphereScene {
    fn default() -> Self {
        Self {
            num_views: 12,
            width: 64,
            height: 48,
            radius: 1.0,
            distance: 4.0,
            flen: 1.0,
            num_features: 200,
            seed: 0,
        }
    }
}

/// Image embedding name used for rendered views
pub const EMBEDDING: &str = "undistorted";

impl SphereScene {
    /// Builds the camera for each view
    pub fn cameras(&self) -> Vec<CameraInfo> {
        (0..self.num_views)
            .map(|i| {
                let a = TAU * i as f32 / self.num_views as f32;
                let h = if i % 2 == 0 { 0.2 } else { -0.2 };
                let eye = Vector3::new(a.sin(), h, -a.cos()).normalize()
                    * self.distance;
                CameraInfo::look_at(
                    eye,
                    Vector3::zeros(),
                    Vector3::y(),
                    self.flen,
                )
            })
            .collect()
    }

    /// Intersects a ray with the sphere, returning the nearest hit
    fn hit(&self, o: &Vector3<f32>, d: &Vector3<f32>) -> Option<Vector3<f32>> {
        let b = o.dot(d);
        let c = o.norm_squared() - self.radius * self.radius;
        let disc = b * b - c;
        if disc < 0.0 {
            return None;
        }
        let t = -b - disc.sqrt();
        (t > 0.0).then(|| o + d * t)
    }

    fn render(
        &self,
        cam: &CameraInfo,
        texture: &Texture,
        rng: &mut StdRng,
    ) -> ColorImage {
        const SUB: usize = 2;
        let mut img = ColorImage::new(self.width, self.height, 3);
        let Some(k_inv) =
            cam.calibration(self.width, self.height).try_inverse()
        else {
            return img;
        };
        let eye = cam.position();
        for y in 0..self.height {
            for x in 0..self.width {
                let mut sum = Vector3::zeros();
                let mut hits = 0;
                for s in 0..SUB * SUB {
                    let sx = x as f32 + (s % SUB) as f32 / SUB as f32 + 0.25;
                    let sy = y as f32 + (s / SUB) as f32 / SUB as f32 + 0.25;
                    let d = k_inv * Vector3::new(sx, sy, 1.0);
                    let d = cam.cam_to_world_dir(d).normalize();
                    if let Some(p) = self.hit(&eye, &d) {
                        sum += texture.color(&p);
                        hits += 1;
                    }
                }
                let bg = Vector3::from_fn(|_, _| rng.gen_range(0.1..0.9));
                let c = (sum + bg * (SUB * SUB - hits) as f32)
                    / (SUB * SUB) as f32;
                img.pixel_mut(x, y).copy_from_slice(c.as_slice());
            }
        }
        img
    }

    /// Renders every view into a new store
    pub fn store(&self) -> MemoryStore {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let texture = Texture::new(&mut rng, self.radius);
        let mut store = MemoryStore::new();
        for cam in self.cameras() {
            let img = self.render(&cam, &texture, &mut rng);
            let v = store.add_view(Some(cam));
            store.insert_image(v, EMBEDDING, img);
        }
        store
    }

    /// Builds sparse features on a Fibonacci lattice over the sphere
    ///
    /// Each feature references the views that see its front side.
    pub fn bundle(&self) -> Bundle {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let texture = Texture::new(&mut rng, self.radius);
        let cameras = self.cameras();
        let golden = std::f32::consts::PI * (3.0 - 5f32.sqrt());
        let features = (0..self.num_features)
            .map(|i| {
                let y = 1.0 - 2.0 * (i as f32 + 0.5) / self.num_features as f32;
                let r = (1.0 - y * y).sqrt();
                let phi = golden * i as f32;
                let pos =
                    Vector3::new(r * phi.cos(), y, r * phi.sin()) * self.radius;
                let refs = cameras
                    .iter()
                    .enumerate()
                    .filter_map(|(view, cam)| {
                        Some(FeatureRef {
                            view,
                            pos: self.project(cam, &pos)?,
                        })
                    })
                    .collect();
                Feature {
                    pos,
                    color: texture.color(&pos),
                    refs,
                }
            })
            .collect();
        Bundle { features }
    }

    /// Projects a point on the sphere, if the camera sees it
    fn project(
        &self,
        cam: &CameraInfo,
        p: &Vector3<f32>,
    ) -> Option<Vector2<f32>> {
        if (cam.position() - p).dot(p) <= 0.0 {
            return None;
        }
        let q = cam.calibration(self.width, self.height) * cam.world_to_cam(*p);
        let s = Vector2::new(q.x / q.z - 0.5, q.y / q.z - 0.5);
        let inside = s.x >= 0.0
            && s.y >= 0.0
            && s.x <= (self.width - 1) as f32
            && s.y <= (self.height - 1) as f32;
        inside.then_some(s)
    }

    /// Renders the scene, returning it with a handle to its store
    pub fn scene(&self) -> (Scene, Arc<MemoryStore>) {
        let store = Arc::new(self.store());
        let scene = Scene::new(store.clone(), self.bundle());
        log::debug!(
            "built synthetic scene with {} views",
            store.num_views()
        );
        (scene, store)
    }
}

/// Builds an image of uniform random noise
pub fn noise_image(width: usize, height: usize, seed: u64) -> ColorImage {
    let mut rng = StdRng::seed_from_u64(seed);
    let data = (0..width * height * 3)
        .map(|_| rng.gen_range(0.1..0.9))
        .collect();
    ColorImage::from_data(width, height, 3, data)
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_value_noise() {
        let mut rng = StdRng::seed_from_u64(1);
        let n = ValueNoise::new(&mut rng, 4, 0.5);
        // Lattice points return stored values
        assert_relative_eq!(n.at(&Vector3::zeros()), n.values[0]);
        assert_relative_eq!(n.at(&Vector3::new(0.5, 0.0, 0.0)), n.values[1]);
        // The lattice wraps around
        assert_relative_eq!(
            n.at(&Vector3::new(2.0, 0.0, 0.0)),
            n.values[0],
            epsilon = 1e-6
        );
        for i in 0..100 {
            let v = n.at(&Vector3::new(i as f32 * 0.037, 0.3, -0.8));
            assert!((0.0..=1.0).contains(&v), "bad noise value {v}");
        }
    }

    #[test]
    fn test_render() {
        let s = SphereScene::default();
        let store = s.store();
        assert_eq!(store.num_views(), 12);
        let img = store.load_image(0, EMBEDDING).unwrap();
        assert_eq!((img.width(), img.height()), (64, 48));

        // The image center sees the sphere
        let c = img.pixel(32, 24);
        assert!(c.iter().all(|v| (0.1..=0.95).contains(v)), "bad color {c:?}");
    }

    #[test]
    fn test_bundle() {
        let s = SphereScene::default();
        let b = s.bundle();
        assert_eq!(b.features.len(), 200);
        for f in &b.features {
            assert_relative_eq!(f.pos.norm(), 1.0, epsilon = 1e-5);
        }
        // Every feature on the equator band is seen by several cameras
        let seen = b
            .features
            .iter()
            .filter(|f| f.pos.y.abs() < 0.5)
            .all(|f| f.refs.len() >= 3);
        assert!(seen);

        // References project back to the feature position
        let cams = s.cameras();
        let f = &b.features[100];
        let r = f.refs[0];
        let p = s.project(&cams[r.view], &f.pos).unwrap();
        assert_relative_eq!(p, r.pos);
    }

    #[test]
    fn test_noise_image() {
        let a = noise_image(8, 8, 1);
        let b = noise_image(8, 8, 2);
        assert_ne!(a, b);
        assert_eq!(a, noise_image(8, 8, 1));
    }
}
