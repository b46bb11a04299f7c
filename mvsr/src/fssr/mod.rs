//! Floating-scale surface reconstruction
//!
//! Oriented [`Sample`]s are inserted into an adaptive [`Octree`], where each
//! sample lands at the level matching its scale.  An [`IsoOctree`] evaluates
//! the implicit function defined by the samples at every leaf corner, then
//! [`IsoSurface`] extracts a triangle [`Mesh`] from those voxels, handling
//! neighboring leaves of different sizes.
//!
//! ```
//! use mvsr::{
//!     config::ThreadCount,
//!     fssr::{IsoOctree, IsoSurface, Octree, Sample, VoxelData},
//! };
//! use nalgebra::Vector3;
//!
//! // A single coarse sample defines the root cell, which is then refined
//! let mut octree = Octree::new();
//! octree.insert_sample(Sample {
//!     pos: Vector3::zeros(),
//!     normal: Vector3::z(),
//!     color: Vector3::repeat(1.0),
//!     scale: 2.0,
//!     confidence: 1.0,
//! });
//! for _ in 0..3 {
//!     octree.refine_octree();
//! }
//!
//! // Sphere of radius 0.6, evaluated analytically
//! let mut iso = IsoOctree::new(octree);
//! iso.compute_voxels_with(
//!     |p| VoxelData {
//!         value: (p.norm() - 0.6) as f32,
//!         conf: 1.0,
//!         ..Default::default()
//!     },
//!     ThreadCount::One,
//! )?;
//! let mesh = IsoSurface::new(&iso)?.extract_mesh(0.0)?;
//! assert!(!mesh.triangles.is_empty());
//!
//! // Open a file to write, e.g.
//! // let mut f = std::fs::File::create("out.stl")?;
//! # let mut f = vec![];
//! mesh.write_stl(&mut f)?;
//! # Ok::<(), mvsr::Error>(())
//! ```
mod basis;
mod iso_octree;
mod iso_surface;
mod mesh;
mod octree;
mod output;
mod sample;
mod triangulation;
mod voxel;

#[doc(hidden)]
pub mod types;

pub use basis::{basis, sample_frame, weight, weight_x, weight_yz};
pub use iso_octree::{IsoOctree, IsoSettings};
pub use iso_surface::{IsoSurface, IsoVertex};
pub use mesh::Mesh;
pub use octree::{Node, NodeId, NodeInfo, Octree};
pub use sample::{SanitizeStats, Sample, sanitize};
pub use triangulation::min_area_triangulation;
pub use voxel::{MAX_LEVEL, VoxelData, VoxelIndex};

use crate::Error;

include!(concat!(env!("OUT_DIR"), "/mc_tables.rs"));

/// Runs the full pipeline, from raw samples to a mesh
///
/// Samples are validated with [`sanitize`], inserted into a fresh octree
/// (refined `refine` extra times), evaluated, and extracted.
pub fn reconstruct<I>(
    samples: I,
    refine: usize,
    settings: &IsoSettings,
) -> Result<Mesh, Error>
where
    I: IntoIterator<Item = Sample>,
{
    let (samples, stats) = sanitize(samples);
    log::info!(
        "inserting {} samples ({} renormalized)",
        stats.kept,
        stats.renormalized
    );
    let mut octree = Octree::new();
    octree.insert_samples(samples);
    for _ in 0..refine {
        octree.refine_octree();
    }
    octree.make_regular_octree();
    log::info!(
        "octree has {} nodes in {} levels",
        octree.num_nodes(),
        octree.num_levels()
    );

    let mut iso = IsoOctree::new(octree);
    iso.compute_voxels(settings)?;
    IsoSurface::new(&iso)?.extract_mesh(settings.min_confidence)
}
