//! In-memory storage delegate.
//!
//! [`MemoryStore`] tracks which chunk numbers each list holds. It does not
//! index prefixes, so it cannot answer lookups; it exists to drive the
//! update protocol from the CLI and from tests.

use std::collections::BTreeSet;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::delegate::{StorageDelegate, StorageError};
use crate::protocol::{Chunk, ChunkDelete, ChunkKind, ListCoverage, format_chunk_ranges};

/// Outcome counters published after every finished cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateSummary {
    /// Number of cycles that reported `update_finished`.
    pub completed: u64,
    /// Result of the most recent cycle.
    pub last_success: Option<bool>,
}

#[derive(Debug)]
struct ListState {
    name: String,
    adds: BTreeSet<u32>,
    subs: BTreeSet<u32>,
}

impl ListState {
    fn numbers_mut(&mut self, kind: ChunkKind) -> &mut BTreeSet<u32> {
        match kind {
            ChunkKind::Add => &mut self.adds,
            ChunkKind::Sub => &mut self.subs,
        }
    }
}

/// Chunk-number bookkeeping for a fixed set of lists.
///
/// Chunks for lists outside the configured set are dropped.
#[derive(Debug)]
pub struct MemoryStore {
    lists: Mutex<Vec<ListState>>,
    summary: watch::Sender<UpdateSummary>,
}

impl MemoryStore {
    /// Creates an empty store tracking `lists`, in request order.
    pub fn new<I, S>(lists: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let lists = lists
            .into_iter()
            .map(|name| ListState {
                name: name.into(),
                adds: BTreeSet::new(),
                subs: BTreeSet::new(),
            })
            .collect();
        Self {
            lists: Mutex::new(lists),
            summary: watch::Sender::new(UpdateSummary::default()),
        }
    }

    /// Chunk numbers of `kind` currently held for `list_name`, ascending.
    #[must_use]
    pub fn chunk_numbers(&self, list_name: &str, kind: ChunkKind) -> Vec<u32> {
        let mut lists = self.lock();
        lists
            .iter_mut()
            .find(|list| list.name == list_name)
            .map(|list| list.numbers_mut(kind).iter().copied().collect())
            .unwrap_or_default()
    }

    /// Current cycle counters.
    #[must_use]
    pub fn summary(&self) -> UpdateSummary {
        *self.summary.borrow()
    }

    /// Receiver notified whenever a cycle finishes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<UpdateSummary> {
        self.summary.subscribe()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ListState>> {
        self.lists.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl StorageDelegate for MemoryStore {
    fn update_started(&self) {
        debug!("update started");
    }

    fn update_finished(&self, success: bool) {
        self.summary.send_modify(|summary| {
            summary.completed += 1;
            summary.last_success = Some(success);
        });
        info!(success, "update finished");
    }

    fn reset_database(&self) {
        let mut lists = self.lock();
        for list in lists.iter_mut() {
            list.adds.clear();
            list.subs.clear();
        }
        info!("database reset");
    }

    async fn get_chunks(&self) -> Result<Vec<ListCoverage>, StorageError> {
        let lists = self.lock();
        Ok(lists
            .iter()
            .map(|list| {
                let adds: Vec<u32> = list.adds.iter().copied().collect();
                let subs: Vec<u32> = list.subs.iter().copied().collect();
                ListCoverage::new(
                    list.name.clone(),
                    format_chunk_ranges(&adds),
                    format_chunk_ranges(&subs),
                )
            })
            .collect())
    }

    async fn add_chunks(&self, list_name: &str, chunks: Vec<Chunk>) {
        let mut lists = self.lock();
        let Some(list) = lists.iter_mut().find(|list| list.name == list_name) else {
            debug!(list = list_name, "dropping chunks for untracked list");
            return;
        };
        for chunk in &chunks {
            list.numbers_mut(chunk.kind).insert(chunk.number);
        }
        debug!(list = list_name, chunks = chunks.len(), "chunks stored");
    }

    async fn delete_chunks(&self, deletes: Vec<ChunkDelete>) {
        let mut lists = self.lock();
        for delete in &deletes {
            let Some(list) = lists.iter_mut().find(|list| list.name == delete.list_name) else {
                continue;
            };
            list.numbers_mut(delete.kind)
                .retain(|number| !delete.ranges.iter().any(|range| range.contains(*number)));
        }
        debug!(deletes = deletes.len(), "chunk deletions stored");
    }
}
