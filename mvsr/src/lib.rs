//! Dense surface reconstruction from calibrated images.
//!
//! The crate has two halves, which can be used together or separately:
//!
//! - [`dmrecon`] builds a depth map for each reference view by growing
//!   photo-consistent patches out from sparse features
//! - [`fssr`] fuses oriented point samples (e.g. from depth maps) into an
//!   adaptive octree, evaluates an implicit function at its corners, and
//!   extracts a triangle mesh
//!
//! Cameras, images, and features are supplied through [`scene`]; the
//! [`synth`] module renders synthetic scenes for testing.
//!
//! ```
//! use mvsr::{
//!     config::ThreadCount,
//!     dmrecon::{Progress, Settings, reconstruct_views},
//!     fssr::{IsoSettings, reconstruct},
//!     synth::SphereScene,
//! };
//!
//! let (scene, _store) = SphereScene::default().scene();
//! let settings = Settings {
//!     export_points: true,
//!     ..Default::default()
//! };
//! let results = reconstruct_views(
//!     &scene,
//!     &settings,
//!     &[0, 3, 6, 9],
//!     ThreadCount::One,
//!     &Progress::new(),
//! );
//! let samples = results.into_iter().flat_map(|r| r.samples);
//!
//! let mesh = reconstruct(samples, 0, &IsoSettings::default())?;
//! println!("{} triangles", mesh.triangles.len());
//! # Ok::<(), mvsr::Error>(())
//! ```
#![warn(missing_docs)]

pub mod config;
pub mod dmrecon;
pub mod fssr;
pub mod image;
pub mod scene;
pub mod synth;

mod error;

pub use error::Error;
