//! A calibrated view with its image pyramid and result rasters
use super::settings::Settings;
use crate::{
    Error,
    image::{
        ColorImage, Image, ImagePyramid, in_bounds, level_size, pyramid_levels,
    },
    scene::{CameraInfo, Scene},
};
use nalgebra::{Matrix3, Vector2, Vector3};
use std::sync::Arc;

/// Calibration of one pyramid level
#[derive(Copy, Clone, Debug)]
struct LevelCalib {
    width: usize,
    height: usize,
    k: Matrix3<f32>,
    k_inv: Matrix3<f32>,
}

/// Rasters filled in while a view is the reconstruction master
#[derive(Clone, Debug)]
pub struct MasterImages {
    /// Distance along the pixel's view ray; 0 where unset
    pub depth: Image<f32>,
    /// World-space unit normal (3 channels)
    pub normal: Image<f32>,
    /// Depth change per pixel along `x` and `y` (2 channels)
    pub dz: Image<f32>,
    /// Confidence; 0 where unset
    pub conf: Image<f32>,
    /// Local neighbor views used for each pixel, `-1` for unused slots
    pub views: Image<i32>,
}

/// One calibrated camera and its (lazily loaded) color pyramid
#[derive(Clone, Debug)]
pub struct SingleView {
    id: usize,
    camera: CameraInfo,
    position: Vector3<f32>,
    levels: Vec<LevelCalib>,
    /// Working level, once this view is the master
    scale: usize,
    pyramid: Option<Arc<ImagePyramid>>,
    features: Vec<usize>,
    master: Option<MasterImages>,
}

impl SingleView {
    /// Builds a view from the scene's camera and image header
    ///
    /// Fails if the camera is missing or invalid, or if the image embedding
    /// does not exist.  Pixels are not loaded here.
    pub fn new(
        scene: &Scene,
        id: usize,
        embedding: &str,
    ) -> Result<Self, Error> {
        let camera = scene
            .store
            .camera(id)
            .filter(CameraInfo::is_valid)
            .ok_or(Error::InvalidCamera(id))?;
        let (width, height) =
            scene.store.image_size(id, embedding).ok_or_else(|| {
                Error::MissingImage {
                    view: id,
                    name: embedding.to_owned(),
                }
            })?;
        let levels = (0..pyramid_levels(width, height))
            .map(|l| {
                let (width, height) = level_size(width, height, l);
                let k = camera.calibration(width, height);
                let k_inv = k.try_inverse().ok_or(Error::InvalidCamera(id))?;
                Ok(LevelCalib {
                    width,
                    height,
                    k,
                    k_inv,
                })
            })
            .collect::<Result<Vec<_>, Error>>()?;
        Ok(Self {
            id,
            position: camera.position(),
            camera,
            levels,
            scale: 0,
            pyramid: None,
            features: vec![],
            master: None,
        })
    }

    /// Returns the view's index in the scene
    pub fn id(&self) -> usize {
        self.id
    }

    /// Returns the camera center in world coordinates
    pub fn position(&self) -> Vector3<f32> {
        self.position
    }

    /// Returns the working pyramid level
    pub fn scale(&self) -> usize {
        self.scale
    }

    /// Number of pyramid levels
    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    /// Clamps a pyramid level to the coarsest available one
    pub fn clamp_level(&self, level: usize) -> usize {
        level.min(self.levels.len() - 1)
    }

    /// Returns the image size at a pyramid level
    pub fn level_size(&self, level: usize) -> (usize, usize) {
        let c = &self.levels[self.clamp_level(level)];
        (c.width, c.height)
    }

    /// Loads the color pyramid through the scene's shared cache
    pub fn load_color_image(
        &mut self,
        scene: &Scene,
        embedding: &str,
    ) -> Result<(), Error> {
        if self.pyramid.is_none() {
            let id = self.id;
            let p = scene.pyramids.get_or_load(id, embedding, || {
                scene.store.load_image(id, embedding)
            })?;
            self.pyramid = Some(p);
        }
        Ok(())
    }

    /// Returns the color image at a pyramid level, if loaded
    pub fn image(&self, level: usize) -> Option<&ColorImage> {
        self.pyramid.as_ref().map(|p| p.level(level))
    }

    /// Projects a world point to pixel coordinates at a pyramid level
    ///
    /// Integer coordinates are pixel centers.
    pub fn world_to_screen(
        &self,
        p: &Vector3<f32>,
        level: usize,
    ) -> Vector2<f32> {
        let c = &self.levels[self.clamp_level(level)];
        let q = c.k * self.camera.world_to_cam(*p);
        Vector2::new(q.x / q.z - 0.5, q.y / q.z - 0.5)
    }

    /// Projects a world point to pixel coordinates at the working level
    pub fn world_to_screen_scaled(&self, p: &Vector3<f32>) -> Vector2<f32> {
        self.world_to_screen(p, self.scale)
    }

    /// Returns the unit world-space ray through a pixel
    pub fn view_ray(&self, x: f32, y: f32, level: usize) -> Vector3<f32> {
        let c = &self.levels[self.clamp_level(level)];
        let d = c.k_inv * Vector3::new(x + 0.5, y + 0.5, 1.0);
        self.camera.cam_to_world_dir(d).normalize()
    }

    /// Returns the unit world-space ray through a pixel at the working level
    pub fn view_ray_scaled(&self, x: f32, y: f32) -> Vector3<f32> {
        self.view_ray(x, y, self.scale)
    }

    /// World-space size of one full-resolution pixel at a point's depth
    pub fn foot_print(&self, p: &Vector3<f32>) -> f32 {
        self.foot_print_at(p, 0)
    }

    /// World-space size of one working-level pixel at a point's depth
    pub fn foot_print_scaled(&self, p: &Vector3<f32>) -> f32 {
        self.foot_print_at(p, self.scale)
    }

    fn foot_print_at(&self, p: &Vector3<f32>, level: usize) -> f32 {
        let c = &self.levels[self.clamp_level(level)];
        self.camera.world_to_cam(*p).z * c.k_inv[(0, 0)]
    }

    /// Checks whether a point is in front of the camera and projects inside
    /// the full-resolution image
    pub fn point_in_frustum(&self, p: &Vector3<f32>) -> bool {
        if self.camera.world_to_cam(*p).z <= 0.0 {
            return false;
        }
        let s = self.world_to_screen(p, 0);
        let c = &self.levels[0];
        in_bounds(c.width, c.height, s.x, s.y, 0.0)
    }

    /// Allocates result rasters at the given working level
    ///
    /// The level must exist in this view's pyramid.
    pub fn prepare_master_view(
        &mut self,
        settings: &Settings,
    ) -> Result<(), Error> {
        let scale = settings.scale as usize;
        if scale >= self.levels.len() {
            return Err(Error::BadScale(settings.scale, self.levels.len()));
        }
        self.scale = scale;
        let (w, h) = self.level_size(scale);
        self.master = Some(MasterImages {
            depth: Image::new(w, h, 1),
            normal: Image::new(w, h, 3),
            dz: Image::new(w, h, 2),
            conf: Image::new(w, h, 1),
            views: Image::filled(w, h, settings.nr_recon_neighbors, -1),
        });
        Ok(())
    }

    /// Returns result rasters, if this view was prepared as a master
    pub fn master(&self) -> Option<&MasterImages> {
        self.master.as_ref()
    }

    /// Mutable access to result rasters
    pub fn master_mut(&mut self) -> Option<&mut MasterImages> {
        self.master.as_mut()
    }

    /// Releases result rasters
    pub fn take_master(&mut self) -> Option<MasterImages> {
        self.master.take()
    }

    /// Records a feature as visible in this view
    pub fn add_feature(&mut self, index: usize) {
        self.features.push(index);
    }

    /// Returns features recorded as visible, in insertion order
    pub fn features(&self) -> &[usize] {
        &self.features
    }

    /// Forgets recorded features
    pub fn clear_features(&mut self) {
        self.features.clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::scene::{Bundle, MemoryStore};
    use approx::assert_relative_eq;

    fn scene() -> Scene {
        let mut store = MemoryStore::new();
        let cam = CameraInfo::look_at(
            Vector3::new(0.0, 0.0, -5.0),
            Vector3::zeros(),
            Vector3::y(),
            1.0,
        );
        let v = store.add_view(Some(cam));
        store.insert_image(v, "undistorted", ColorImage::new(64, 48, 3));
        store.add_view(None);
        Scene::new(Arc::new(store), Bundle::default())
    }

    #[test]
    fn test_new() {
        let s = scene();
        assert!(SingleView::new(&s, 0, "undistorted").is_ok());
        let r = SingleView::new(&s, 0, "original");
        assert!(matches!(r, Err(Error::MissingImage { view: 0, .. })));
        let r = SingleView::new(&s, 1, "undistorted");
        assert!(matches!(r, Err(Error::InvalidCamera(1))));
        let r = SingleView::new(&s, 7, "undistorted");
        assert!(matches!(r, Err(Error::InvalidCamera(7))));
    }

    #[test]
    fn test_projection() {
        let s = scene();
        let v = SingleView::new(&s, 0, "undistorted").unwrap();
        assert_eq!(v.num_levels(), 3);

        for level in 0..3 {
            for (x, y) in [(0.0, 0.0), (10.0, 20.0), (31.5, 23.5)] {
                let ray = v.view_ray(x, y, level);
                assert_relative_eq!(ray.norm(), 1.0, epsilon = 1e-6);
                let p = v.position() + ray * 3.0;
                let s = v.world_to_screen(&p, level);
                assert_relative_eq!(s.x, x, epsilon = 1e-3);
                assert_relative_eq!(s.y, y, epsilon = 1e-3);
            }
        }

        // The image center is on the optical axis
        let c = v.world_to_screen(&Vector3::zeros(), 0);
        assert_relative_eq!(c.x, 31.5, epsilon = 1e-4);
        assert_relative_eq!(c.y, 23.5, epsilon = 1e-4);
    }

    #[test]
    fn test_foot_print() {
        let s = scene();
        let mut v = SingleView::new(&s, 0, "undistorted").unwrap();
        // 64 pixels span the full focal length at unit depth
        let p = Vector3::zeros();
        assert_relative_eq!(v.foot_print(&p), 5.0 / 64.0, epsilon = 1e-6);

        let settings = Settings {
            scale: 1,
            ..Default::default()
        };
        v.prepare_master_view(&settings).unwrap();
        let fp = v.foot_print_scaled(&p);
        assert_relative_eq!(fp, 5.0 / 32.0, epsilon = 1e-6);
        let m = v.master().unwrap();
        assert_eq!((m.depth.width(), m.depth.height()), (32, 24));
        assert_eq!(m.views.channels(), 4);
        assert!(m.views.data().iter().all(|v| *v == -1));

        let settings = Settings {
            scale: 3,
            ..Default::default()
        };
        let r = v.prepare_master_view(&settings);
        assert!(matches!(r, Err(Error::BadScale(3, 3))), "bad result {r:?}");
    }

    #[test]
    fn test_frustum() {
        let s = scene();
        let v = SingleView::new(&s, 0, "undistorted").unwrap();
        assert!(v.point_in_frustum(&Vector3::zeros()));
        assert!(v.point_in_frustum(&Vector3::new(2.0, 1.0, 0.0)));
        assert!(!v.point_in_frustum(&Vector3::new(3.0, 0.0, 0.0)));
        assert!(!v.point_in_frustum(&Vector3::new(0.0, 0.0, -10.0)));
    }

    #[test]
    fn test_load_color() {
        let s = scene();
        let mut v = SingleView::new(&s, 0, "undistorted").unwrap();
        assert!(v.image(0).is_none());
        v.load_color_image(&s, "undistorted").unwrap();
        assert_eq!(v.image(1).unwrap().width(), 32);
        assert_eq!(s.pyramids.len(), 1);
    }
}
