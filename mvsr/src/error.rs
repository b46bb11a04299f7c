//! Module containing the universal error type
use crate::fssr::VoxelIndex;
use thiserror::Error;

/// Universal error type for reconstruction and surface extraction
#[derive(Error, Debug)]
pub enum Error {
    /// The reference view is out of range or was excluded from the view pool
    #[error("invalid reference view {0}")]
    InvalidRefView(usize),

    /// The view has no usable camera
    #[error("view {0} has an invalid camera")]
    InvalidCamera(usize),

    /// The requested image embedding does not exist for the given view
    #[error("view {view} has no image embedding `{name}`")]
    MissingImage {
        /// View index
        view: usize,
        /// Embedding name
        name: String,
    },

    /// The patch filter width must be odd and nonzero
    #[error("filter width must be odd and nonzero (got {0})")]
    BadFilterWidth(usize),

    /// Neighbor count is out of range
    #[error("neighbor count must be in 1..={1} (got {0})")]
    BadNeighborCount(usize, usize),

    /// Global view selection cap is zero
    #[error("global view selection cap must be nonzero")]
    BadGlobalViewCount,

    /// The acceptance NCC must be below 1
    #[error("acceptance NCC must be below 1 (got {0})")]
    BadAcceptNcc(f32),

    /// The reconstruction scale is too coarse for the reference image
    #[error("scale {0} exceeds the image pyramid depth ({1} levels)")]
    BadScale(u32, usize),

    /// Global view selection did not find a single usable neighbor
    #[error("global view selection found no usable neighbor views")]
    NoGlobalViews,

    /// Reconstruction was cancelled
    #[error("reconstruction was cancelled")]
    Cancelled,

    /// The octree contains no samples
    #[error("octree is empty")]
    EmptyOctree,

    /// Some node has between 1 and 7 children
    #[error("octree is not regular; call `make_regular_octree` first")]
    IrregularOctree,

    /// A node is deeper than voxel indices can address
    #[error("octree node at level {0} is too deep")]
    OctreeTooDeep(u8),

    /// Voxels were not sorted by index
    #[error("voxel list is not sorted")]
    UnsortedVoxels,

    /// A voxel needed during extraction is missing
    #[error("missing voxel {0:?}")]
    MissingVoxel(VoxelIndex),

    /// A sign change was found on an edge without an interned isovertex
    #[error("no isovertex between voxels {0:?} and {1:?}")]
    MissingIsoVertex(VoxelIndex, VoxelIndex),

    /// Edges harvested from a leaf did not chain into closed loops
    #[error("isoedges of leaf at level {0} do not form closed loops")]
    OpenIsoPolygon(u8),

    /// io error; see inner code for details
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),
}
