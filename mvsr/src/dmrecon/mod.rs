//! Patch-based multi-view stereo depth maps
//!
//! A [`DmRecon`] reconstructs the depth map of one reference view:
//!
//! - Sparse features are registered with the views that see them, and
//!   [`GlobalViewSelection`] picks a set of neighbor views for the whole run
//! - Each feature seeds a [`PatchOptimization`] at its projected pixel;
//!   successful seeds go into a priority queue keyed by confidence
//! - The highest-confidence hypothesis is repeatedly popped, refined, and
//!   propagated to its 4-connected neighbors
//!
//! Results are written into the reference view's rasters and saved through
//! the scene's [`ViewStore`](crate::scene::ViewStore).
//!
//! ```
//! use mvsr::{
//!     dmrecon::{DmRecon, Progress, Settings, Status},
//!     synth::SphereScene,
//! };
//! use std::sync::Arc;
//!
//! let (scene, store) = SphereScene::default().scene();
//! let progress = Arc::new(Progress::new());
//! let settings = Settings {
//!     ref_view: 0,
//!     ..Default::default()
//! };
//! let mut recon = DmRecon::new(&scene, settings, progress.clone())?;
//! recon.start()?;
//! assert_eq!(progress.snapshot().status, Status::Idle);
//! assert!(store.raster(0, "depth-L0").is_some());
//! # Ok::<(), mvsr::Error>(())
//! ```
use crate::{Error, config::ThreadCount, scene::Scene};
use rayon::prelude::*;
use std::sync::Arc;

mod patch_optimization;
mod patch_sampler;
mod progress;
mod recon;
mod settings;
mod single_view;
mod view_selection;

pub use patch_optimization::{OptimizationState, PatchOptimization};
pub use patch_sampler::{ColorAndDeriv, PatchSampler};
pub use progress::{Progress, ProgressSnapshot, Status};
pub use recon::{DmRecon, QueueData};
pub use settings::{MAX_RECON_NEIGHBORS, Settings};
pub use single_view::{MasterImages, SingleView};
pub use view_selection::{
    GlobalViewSelection, LocalViewSelection, ViewSelector, ViewSet, parallax,
    parallax_to_weight,
};

/// Outcome of reconstructing one view with [`reconstruct_views`]
#[derive(Debug)]
pub struct ViewResult {
    /// Reference view
    pub view: usize,
    /// Number of pixels with a committed depth, or the error that stopped
    /// the reconstruction
    pub filled: Result<usize, Error>,
    /// Oriented samples, if `export_points` was set
    pub samples: Vec<crate::fssr::Sample>,
    /// Final progress state
    pub progress: ProgressSnapshot,
}

/// Reconstructs depth maps for several reference views
///
/// Each view is reconstructed independently with a copy of `settings`
/// (whose `ref_view` is overwritten).  Views run concurrently according to
/// `threads`.  Each run reports to its own [`Progress`], linked to `cancel`
/// so that cancelling it stops every run.
pub fn reconstruct_views(
    scene: &Scene,
    settings: &Settings,
    views: &[usize],
    threads: ThreadCount,
    cancel: &Progress,
) -> Vec<ViewResult> {
    let run = |&view: &usize| {
        let progress = Arc::new(cancel.linked());
        let settings = Settings {
            ref_view: view,
            ..settings.clone()
        };
        let export = settings.export_points;
        let mut samples = vec![];
        let filled = DmRecon::new(scene, settings, progress.clone())
            .and_then(|mut r| {
                r.start()?;
                if export {
                    samples = r.export_points();
                }
                Ok(r.filled())
            });
        if let Err(e) = &filled {
            log::warn!("view {view} failed: {e}");
        }
        ViewResult {
            view,
            filled,
            samples,
            progress: progress.snapshot(),
        }
    };
    match threads.pool() {
        Some(pool) => pool.install(|| views.par_iter().map(run).collect()),
        None => views.iter().map(run).collect(),
    }
}
