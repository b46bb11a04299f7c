//! Calibrated views, sparse features, and per-view storage
//!
//! These types stand in for a full scene/bundle data model: reconstruction
//! only needs camera poses, image access, feature observations, and a place
//! to write results.
use crate::{
    Error,
    image::{ColorImage, Image, PyramidCache},
};
use nalgebra::{Matrix3, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

/// Pinhole camera with a world-to-camera rigid transform
///
/// Camera space has `+z` pointing forward and `+y` pointing down the image.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CameraInfo {
    /// Focal length, normalized by the larger image dimension
    pub flen: f32,
    /// Principal point, as a fraction of image width and height
    pub ppoint: Vector2<f32>,
    /// Pixel aspect ratio
    pub paspect: f32,
    /// World-to-camera rotation
    pub rot: Matrix3<f32>,
    /// World-to-camera translation
    pub trans: Vector3<f32>,
}

impl CameraInfo {
    /// Builds a camera at `eye` looking at `target`
    ///
    /// `up` is a hint for the world direction that appears at the top of the
    /// image; it must not be parallel to the viewing direction.
    pub fn look_at(
        eye: Vector3<f32>,
        target: Vector3<f32>,
        up: Vector3<f32>,
        flen: f32,
    ) -> Self {
        let z = (target - eye).normalize();
        let x = (-up).cross(&z).normalize();
        let y = z.cross(&x);
        let rot =
            Matrix3::from_rows(&[x.transpose(), y.transpose(), z.transpose()]);
        Self {
            flen,
            ppoint: Vector2::new(0.5, 0.5),
            paspect: 1.0,
            trans: -(rot * eye),
            rot,
        }
    }

    /// Checks for a positive focal length and an orthonormal rotation
    pub fn is_valid(&self) -> bool {
        let finite = self.rot.iter().all(|v| v.is_finite())
            && self.trans.iter().all(|v| v.is_finite());
        let ortho = (self.rot * self.rot.transpose() - Matrix3::identity())
            .abs()
            .max()
            < 1e-3;
        finite && ortho && self.flen > 0.0 && self.paspect > 0.0
    }

    /// Camera center in world coordinates
    pub fn position(&self) -> Vector3<f32> {
        -(self.rot.transpose() * self.trans)
    }

    /// Transforms a world point into camera coordinates
    pub fn world_to_cam(&self, p: Vector3<f32>) -> Vector3<f32> {
        self.rot * p + self.trans
    }

    /// Rotates a camera-space direction into world coordinates
    pub fn cam_to_world_dir(&self, d: Vector3<f32>) -> Vector3<f32> {
        self.rot.transpose() * d
    }

    /// Builds the calibration matrix for an image of the given size
    pub fn calibration(&self, width: usize, height: usize) -> Matrix3<f32> {
        let (w, h) = (width as f32, height as f32);
        let image_aspect = w / h * self.paspect;
        let (ax, ay) = if image_aspect < 1.0 {
            (self.flen * h / self.paspect, self.flen * h)
        } else {
            (self.flen * w, self.flen * w * self.paspect)
        };
        Matrix3::new(
            ax,
            0.0,
            w * self.ppoint.x,
            0.0,
            ay,
            h * self.ppoint.y,
            0.0,
            0.0,
            1.0,
        )
    }
}

/// A single 2D observation of a [`Feature`]
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeatureRef {
    /// Observing view
    pub view: usize,
    /// Pixel position in that view
    pub pos: Vector2<f32>,
}

/// Triangulated 3D feature with its observations
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    /// World position
    pub pos: Vector3<f32>,
    /// Color, in the `[0, 1]` range
    pub color: Vector3<f32>,
    /// Views in which this feature was observed
    pub refs: Vec<FeatureRef>,
}

impl Feature {
    /// Checks whether the feature was observed in the given view
    pub fn contains_view_id(&self, view: usize) -> bool {
        self.refs.iter().any(|r| r.view == view)
    }
}

/// Sparse reconstruction: a list of features
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Bundle {
    /// Features, indexed by position in this list
    pub features: Vec<Feature>,
}

/// Raster written back to a view's storage
#[derive(Clone, Debug, PartialEq)]
pub enum Raster {
    /// Floating-point data (depth, normals, confidence, color)
    Float(Image<f32>),
    /// Integer data (per-pixel view indices)
    Int(Image<i32>),
}

/// Builds the storage name for a result raster, e.g. `depth-L0`
pub fn raster_name(kind: &str, scale: u32) -> String {
    format!("{kind}-L{scale}")
}

/// Per-view storage used by reconstruction
///
/// Implementations must be shareable across worker threads; results for
/// different views are written concurrently.
pub trait ViewStore: Send + Sync {
    /// Number of views, including ones without a valid camera
    fn num_views(&self) -> usize;

    /// Returns the view's camera, or `None` if it is not calibrated
    fn camera(&self, view: usize) -> Option<CameraInfo>;

    /// Returns the size of an image embedding without decoding it
    fn image_size(&self, view: usize, name: &str) -> Option<(usize, usize)>;

    /// Loads an image embedding as a color image
    fn load_image(&self, view: usize, name: &str) -> Result<ColorImage, Error>;

    /// Persists a result raster under the given name
    fn save_raster(
        &self,
        view: usize,
        name: &str,
        raster: Raster,
    ) -> Result<(), Error>;
}

#[derive(Default)]
struct MemoryView {
    camera: Option<CameraInfo>,
    images: HashMap<String, ColorImage>,
}

/// [`ViewStore`] that keeps everything in memory
#[derive(Default)]
pub struct MemoryStore {
    views: Vec<MemoryView>,
    rasters: Mutex<HashMap<(usize, String), Raster>>,
}

impl MemoryStore {
    /// Builds an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a view, returning its index
    pub fn add_view(&mut self, camera: Option<CameraInfo>) -> usize {
        self.views.push(MemoryView {
            camera,
            images: HashMap::new(),
        });
        self.views.len() - 1
    }

    /// Adds (or replaces) an image embedding
    ///
    /// # Panics
    /// If the view does not exist
    pub fn insert_image(&mut self, view: usize, name: &str, img: ColorImage) {
        self.views[view].images.insert(name.to_owned(), img);
    }

    /// Returns a copy of a previously saved raster
    pub fn raster(&self, view: usize, name: &str) -> Option<Raster> {
        self.lock().get(&(view, name.to_owned())).cloned()
    }

    /// Returns the names of every raster saved for a view, sorted
    pub fn raster_names(&self, view: usize) -> Vec<String> {
        let mut out: Vec<String> = self
            .lock()
            .keys()
            .filter(|(v, _)| *v == view)
            .map(|(_, n)| n.clone())
            .collect();
        out.sort();
        out
    }

    fn lock(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<(usize, String), Raster>> {
        self.rasters.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ViewStore for MemoryStore {
    fn num_views(&self) -> usize {
        self.views.len()
    }

    fn camera(&self, view: usize) -> Option<CameraInfo> {
        self.views.get(view)?.camera.clone()
    }

    fn image_size(&self, view: usize, name: &str) -> Option<(usize, usize)> {
        let img = self.views.get(view)?.images.get(name)?;
        Some((img.width(), img.height()))
    }

    fn load_image(&self, view: usize, name: &str) -> Result<ColorImage, Error> {
        self.views
            .get(view)
            .and_then(|v| v.images.get(name))
            .cloned()
            .ok_or_else(|| Error::MissingImage {
                view,
                name: name.to_owned(),
            })
    }

    fn save_raster(
        &self,
        view: usize,
        name: &str,
        raster: Raster,
    ) -> Result<(), Error> {
        self.lock().insert((view, name.to_owned()), raster);
        Ok(())
    }
}

/// Everything a reconstruction reads: views, features, and cached pyramids
///
/// A `Scene` is shared read-only between concurrent reconstructions.
pub struct Scene {
    /// Storage for cameras, images, and results
    pub store: Arc<dyn ViewStore>,
    /// Sparse features
    pub bundle: Bundle,
    /// Pyramids shared between reconstructions
    pub pyramids: PyramidCache,
}

impl Scene {
    /// Builds a new scene with an empty pyramid cache
    pub fn new(store: Arc<dyn ViewStore>, bundle: Bundle) -> Self {
        Self {
            store,
            bundle,
            pyramids: PyramidCache::new(),
        }
    }
}
