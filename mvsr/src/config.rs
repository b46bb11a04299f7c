//! Shared execution settings

/// Number of threads to use during reconstruction and voxel evaluation
#[derive(Copy, Clone, Debug)]
pub enum ThreadCount {
    /// Perform all work in the calling thread, not spawning any workers
    One,

    /// Spawn some number of worker threads
    ///
    /// This can be set to `1`, in which case a single worker thread will be
    /// spawned; this is different from doing work in the calling thread, but
    /// not particularly useful!
    Many(std::num::NonZeroUsize),
}

impl From<std::num::NonZeroUsize> for ThreadCount {
    fn from(v: std::num::NonZeroUsize) -> Self {
        match v.get() {
            0 => unreachable!(),
            1 => ThreadCount::One,
            _ => ThreadCount::Many(v),
        }
    }
}

/// Single-threaded mode is shown as `-`; otherwise, an integer
impl std::fmt::Display for ThreadCount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ThreadCount::One => write!(f, "-"),
            ThreadCount::Many(n) => write!(f, "{n}"),
        }
    }
}

impl ThreadCount {
    /// Gets the thread count
    ///
    /// Returns `None` if we are required to be single-threaded
    pub fn get(&self) -> Option<usize> {
        match self {
            ThreadCount::One => None,
            ThreadCount::Many(v) => Some(v.get()),
        }
    }

    /// Builds a dedicated worker pool, or `None` in single-threaded mode
    ///
    /// Pool construction failures are logged and fall back to the calling
    /// thread.
    pub fn pool(&self) -> Option<rayon::ThreadPool> {
        let n = self.get()?;
        match rayon::ThreadPoolBuilder::new().num_threads(n).build() {
            Ok(pool) => Some(pool),
            Err(e) => {
                log::warn!("could not build a {n}-thread pool: {e}");
                None
            }
        }
    }
}

impl Default for ThreadCount {
    fn default() -> Self {
        match std::thread::available_parallelism() {
            Ok(n) => Self::from(n),
            Err(_) => Self::One,
        }
    }
}
