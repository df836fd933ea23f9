//! Observable manager state.

use tokio::time::Instant;

use crate::protocol::FailureClass;

/// Where the manager is in its update cycle.
///
/// Published through a `watch` channel after every transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerState {
    /// Created but never scheduled.
    Idle,
    /// Waiting for the update timer.
    Scheduled { at: Instant },
    /// Waiting for the delegate to report coverage.
    AwaitingCoverage,
    /// Update request to the primary prefix in flight.
    FetchingPrimary,
    /// Update request to a backup prefix in flight.
    FetchingBackup(FailureClass),
    /// Redirect fetch in flight.
    FetchingChunks { list_name: String },
    /// Waiting for the delegate to apply chunks or deletions.
    ApplyingChunks,
    /// Shut down; no further updates.
    Stopped,
}

impl ManagerState {
    /// True only while waiting for the next update timer.
    #[must_use]
    pub fn is_scheduled(&self) -> bool {
        matches!(self, Self::Scheduled { .. })
    }

    /// True while an update cycle is in progress.
    #[must_use]
    pub fn is_updating(&self) -> bool {
        matches!(
            self,
            Self::AwaitingCoverage
                | Self::FetchingPrimary
                | Self::FetchingBackup(_)
                | Self::FetchingChunks { .. }
                | Self::ApplyingChunks
        )
    }
}
