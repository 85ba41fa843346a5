//! Runtime options threaded explicitly through Store constructors and the
//! planner, replacing the original implementation's process-wide
//! known-sizes global with an object whose lifecycle matches one run.

use crate::progress::ShowProgress;

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub dry_run: bool,
    pub chunk_size: usize,
    pub show_progress: ShowProgress,
    /// Delete volumes/diffs at the destination that are no longer needed.
    pub delete: bool,
    /// Force a precise `measure_size` pass even when estimates look stable.
    pub measure: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        SyncOptions {
            dry_run: false,
            chunk_size: crate::transfer::DEFAULT_CHUNK_SIZE,
            show_progress: ShowProgress::Auto,
            delete: false,
            measure: false,
        }
    }
}
