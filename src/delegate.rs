//! Storage delegate contract.
//!
//! The manager never stores list data itself. It reports cycle boundaries to
//! a [`StorageDelegate`] and hands it every decoded delta. The async methods
//! are always awaited on a spawned task, never from inside the manager's
//! event handler, so an implementation may complete them immediately without
//! re-entering the update state machine.

use async_trait::async_trait;
use thiserror::Error;

use crate::protocol::{Chunk, ChunkDelete, ListCoverage};

/// The delegate could not read its database.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("storage error: {message}")]
pub struct StorageError {
    pub message: String,
}

impl StorageError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Receiver of update-cycle events and list deltas.
#[async_trait]
pub trait StorageDelegate: Send + Sync {
    /// A cycle is starting; coverage will be requested next.
    fn update_started(&self);

    /// The cycle ended. `success` is false if any step failed.
    fn update_finished(&self, success: bool);

    /// The server asked for every list to be dropped.
    fn reset_database(&self);

    /// Returns current coverage for every list the client tracks.
    ///
    /// # Errors
    ///
    /// A [`StorageError`] aborts the cycle before any network request.
    async fn get_chunks(&self) -> Result<Vec<ListCoverage>, StorageError>;

    /// Applies add/sub chunks for one list. Completes when the data is stored.
    async fn add_chunks(&self, list_name: &str, chunks: Vec<Chunk>);

    /// Drops the given chunk ranges. Completes when the deletion is stored.
    async fn delete_chunks(&self, deletes: Vec<ChunkDelete>);
}
