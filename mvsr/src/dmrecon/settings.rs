//! Reconstruction settings
use crate::Error;
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

/// Largest supported number of local neighbor views per pixel
pub const MAX_RECON_NEIGHBORS: usize = 8;

/// Settings for a single depth-map reconstruction
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Reference (master) view
    pub ref_view: usize,
    /// Name of the image embedding used for color
    pub image_embedding: String,
    /// Pyramid level at which the depth map is built; 0 is full resolution
    pub scale: u32,
    /// Patch width in pixels; must be odd
    pub filter_width: usize,
    /// Neighbors with a lower NCC are not selected
    pub min_ncc: f32,
    /// Parallax (in degrees) below which view pairs are penalized
    pub min_parallax: f32,
    /// Selected neighbors must keep at least this NCC during optimization
    pub accept_ncc: f32,
    /// Relative objective decrease at which optimization stops
    pub min_refine_diff: f32,
    /// Iteration cap for patch optimization
    pub max_iterations: usize,
    /// Number of local neighbor views required per pixel
    pub nr_recon_neighbors: usize,
    /// Cap on the number of globally selected neighbor views
    pub global_vs_max: usize,
    /// Estimate a per-view, per-channel color scale during optimization
    pub use_color_scale: bool,
    /// Features outside this box are ignored
    pub aabb_min: Vector3<f32>,
    /// Features outside this box are ignored
    pub aabb_max: Vector3<f32>,
    /// Save the depth-derivative map
    pub keep_dz_map: bool,
    /// Save the confidence map
    pub keep_confidence_map: bool,
    /// Save per-pixel local view indices
    pub keep_view_indices: bool,
    /// Convert the finished depth map into oriented samples
    pub export_points: bool,
    /// Master patch variance at which the texture term reaches 1/2
    pub texture_variance: f32,
    /// Exported sample scale, as a multiple of the pixel footprint
    pub point_scale_factor: f32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            ref_view: 0,
            image_embedding: "undistorted".to_owned(),
            scale: 0,
            filter_width: 5,
            min_ncc: 0.3,
            min_parallax: 10.0,
            accept_ncc: 0.6,
            min_refine_diff: 0.001,
            max_iterations: 20,
            nr_recon_neighbors: 4,
            global_vs_max: 20,
            use_color_scale: true,
            aabb_min: Vector3::repeat(f32::NEG_INFINITY),
            aabb_max: Vector3::repeat(f32::INFINITY),
            keep_dz_map: false,
            keep_confidence_map: false,
            keep_view_indices: false,
            export_points: false,
            texture_variance: 0.001,
            point_scale_factor: 2.0,
        }
    }
}

impl Settings {
    /// Checks settings that do not depend on the scene
    pub fn validate(&self) -> Result<(), Error> {
        if self.filter_width % 2 == 0 {
            return Err(Error::BadFilterWidth(self.filter_width));
        }
        if !(1..=MAX_RECON_NEIGHBORS).contains(&self.nr_recon_neighbors) {
            return Err(Error::BadNeighborCount(
                self.nr_recon_neighbors,
                MAX_RECON_NEIGHBORS,
            ));
        }
        if self.global_vs_max == 0 {
            return Err(Error::BadGlobalViewCount);
        }
        if self.accept_ncc.is_nan() || self.accept_ncc >= 1.0 {
            return Err(Error::BadAcceptNcc(self.accept_ncc));
        }
        Ok(())
    }

    /// Checks whether a point lies inside the feature bounding box
    pub fn in_aabb(&self, p: &Vector3<f32>) -> bool {
        (0..3).all(|i| p[i] >= self.aabb_min[i] && p[i] <= self.aabb_max[i])
    }

    /// Half the filter width
    pub(crate) fn filter_radius(&self) -> usize {
        self.filter_width / 2
    }
}
