//! Externally polled progress and cooperative cancellation
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};

/// Phase of a depth-map reconstruction
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, strum::Display, strum::EnumIter,
)]
pub enum Status {
    /// Not running (before start or after a successful run)
    #[default]
    Idle,
    /// Analyzing or seeding from sparse features
    Features,
    /// Selecting global neighbor views
    GlobalVs,
    /// Growing the depth map from the priority queue
    Queue,
    /// Writing results
    Saving,
    /// Stopped early at the caller's request, or after an error
    Cancelled,
}

/// A copy of the progress state at one point in time
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct ProgressSnapshot {
    /// Reference view being reconstructed
    pub ref_view: usize,
    /// Current phase
    pub status: Status,
    /// Number of pixels with a committed depth
    pub filled: usize,
    /// Number of pending hypotheses
    pub queue_size: usize,
}

/// Progress of a single reconstruction, shared with an observer
///
/// The reconstruction thread writes snapshots and polls the cancellation
/// flag; any other thread may read snapshots or request cancellation.
#[derive(Debug, Default)]
pub struct Progress {
    snapshot: Mutex<ProgressSnapshot>,
    cancel: Arc<AtomicBool>,
}

impl Progress {
    /// Builds a new progress object, initially idle and not cancelled
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a new progress object sharing this one's cancellation flag
    ///
    /// Cancelling either object cancels both.
    pub fn linked(&self) -> Self {
        Self {
            snapshot: Mutex::default(),
            cancel: self.cancel.clone(),
        }
    }

    /// Returns a copy of the current state
    pub fn snapshot(&self) -> ProgressSnapshot {
        *self.snapshot.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Requests cancellation
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    /// Checks whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Modifies the current state
    pub(crate) fn update<F: FnOnce(&mut ProgressSnapshot)>(&self, f: F) {
        f(&mut self.snapshot.lock().unwrap_or_else(|e| e.into_inner()))
    }
}
