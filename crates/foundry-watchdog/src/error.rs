//! Watchdog errors

use foundry_core::BusError;
use foundry_store::StoreError;

/// Watchdog error type
#[derive(Debug, thiserror::Error)]
pub enum WatchdogError {
    /// Snapshot of the active set failed
    #[error("snapshot failed: {0}")]
    Snapshot(#[from] StoreError),

    /// Signal could not be published
    #[error("signal not published: {0}")]
    Publish(#[from] BusError),
}

impl WatchdogError {
    /// A later scan may succeed
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Snapshot(err) => matches!(err, StoreError::Backend(_) | StoreError::VersionConflict { .. }),
            Self::Publish(err) => matches!(err, BusError::Transport(_)),
        }
    }
}
