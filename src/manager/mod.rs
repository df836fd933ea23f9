//! The protocol manager: update scheduling, backoff, and get-hash requests.
//!
//! [`ProtocolManager::spawn`] starts a background task that owns all update
//! state. The returned handle only sends commands and reads the published
//! [`ManagerState`], so every method on it is cheap and non-blocking except
//! [`ProtocolManager::get_full_hashes`] and [`ProtocolManager::shutdown`].
//!
//! # Update cycle
//!
//! 1. The timer fires and the delegate is told `update_started`.
//! 2. The delegate reports coverage; it is POSTed to the primary prefix.
//! 3. On a primary failure the same body is retried once via the backup
//!    prefix for that failure class.
//! 4. A successful response is applied: reset, deletions, inline chunks,
//!    then each redirect is fetched and its chunks applied, one at a time.
//! 5. `update_finished` is reported and the next update is scheduled with
//!    backoff.

mod driver;
mod error;
mod state;

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::delegate::StorageDelegate;
use crate::protocol::constants::{DEFAULT_POLL_INTERVAL, FETCH_TIMEOUT};
use crate::protocol::{FullHash, HashPrefix, ProtocolConfig};
use crate::transport::Transport;
use driver::{Driver, Event};

pub use error::{GetHashError, UpdateError};
pub use state::ManagerState;

/// Tunables for a manager instance.
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Backoff fuzz in `[0, 1)`. Fixed for the lifetime of the manager.
    pub fuzz: f64,
    /// Timeout applied to every network fetch.
    pub fetch_timeout: Duration,
    /// Poll interval until the server sends `n:`.
    pub poll_interval: Duration,
}

impl ManagerOptions {
    /// Default options with a fixed fuzz, for deterministic schedules.
    #[must_use]
    pub fn with_fuzz(fuzz: f64) -> Self {
        Self {
            fuzz,
            ..Self::default()
        }
    }
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            fuzz: rand::thread_rng().gen_range(0.0..1.0),
            fetch_timeout: FETCH_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Handle to a running protocol manager.
///
/// Dropping the handle stops the manager; use [`shutdown`](Self::shutdown)
/// to also wait for the task to exit.
#[derive(Debug)]
pub struct ProtocolManager {
    events: mpsc::UnboundedSender<Event>,
    state: watch::Receiver<ManagerState>,
    task: Option<JoinHandle<()>>,
}

impl ProtocolManager {
    /// Spawns the manager task. Nothing is scheduled until [`start`](Self::start).
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn spawn(
        config: ProtocolConfig,
        delegate: Arc<dyn StorageDelegate>,
        transport: Arc<dyn Transport>,
        options: ManagerOptions,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ManagerState::Idle);
        let driver = Driver::new(
            Arc::new(config),
            delegate,
            transport,
            &options,
            events_tx.clone(),
            events_rx,
            state_tx,
        );
        let task = tokio::spawn(driver.run());
        Self {
            events: events_tx,
            state: state_rx,
            task: Some(task),
        }
    }

    /// Schedules the first update after the randomized startup delay.
    ///
    /// Has no effect once anything has been scheduled.
    pub fn start(&self) {
        self.send(Event::Start);
    }

    /// Replaces any pending timer so the next update runs after `delay`.
    ///
    /// Ignored while an update cycle is in progress. Delays longer than
    /// [`MAX_POLL_INTERVAL`](crate::protocol::constants::MAX_POLL_INTERVAL)
    /// are clamped.
    pub fn force_update(&self, delay: Duration) {
        self.send(Event::ForceUpdate(delay));
    }

    /// Sets the extra query appended to update, get-hash, and redirect URLs.
    ///
    /// A leading `?` or `&` is stripped; an empty string clears it.
    pub fn set_additional_query(&self, query: impl Into<String>) {
        self.send(Event::SetAdditionalQuery(Some(query.into())));
    }

    /// Overrides the poll interval used after the next successful cycle.
    ///
    /// Zero is ignored and values above
    /// [`MAX_POLL_INTERVAL`](crate::protocol::constants::MAX_POLL_INTERVAL)
    /// are clamped, the same as a server-sent `n:`.
    pub fn set_poll_interval(&self, interval: Duration) {
        self.send(Event::SetPollInterval(interval));
    }

    /// True only while waiting for the next update timer.
    #[must_use]
    pub fn is_update_scheduled(&self) -> bool {
        self.state.borrow().is_scheduled()
    }

    /// Snapshot of the current state.
    #[must_use]
    pub fn state(&self) -> ManagerState {
        self.state.borrow().clone()
    }

    /// Receiver that observes every state transition.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ManagerState> {
        self.state.clone()
    }

    /// Waits until the manager is scheduled or stopped, returning that state.
    pub async fn wait_until_scheduled(&self) -> ManagerState {
        let mut state = self.state.clone();
        let current = state
            .wait_for(|s| s.is_scheduled() || *s == ManagerState::Stopped)
            .await
            .map(|s| s.clone());
        current.unwrap_or(ManagerState::Stopped)
    }

    /// Asks the server for full hashes matching `prefixes`.
    ///
    /// # Errors
    ///
    /// - [`GetHashError::BackedOff`] if earlier failures are still in backoff
    /// - [`GetHashError::Fetch`] if the request failed or the body was malformed
    /// - [`GetHashError::ManagerStopped`] if the manager is gone
    pub async fn get_full_hashes(
        &self,
        prefixes: Vec<HashPrefix>,
    ) -> Result<Vec<FullHash>, GetHashError> {
        let (reply, response) = oneshot::channel();
        self.events
            .send(Event::GetHash { prefixes, reply })
            .map_err(|_| GetHashError::ManagerStopped)?;
        response.await.map_err(|_| GetHashError::ManagerStopped)?
    }

    /// Stops the manager and waits for its task to exit.
    ///
    /// Fetches and delegate calls already in flight are abandoned; their
    /// results are never processed.
    pub async fn shutdown(mut self) {
        self.send(Event::Shutdown);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    fn send(&self, event: Event) {
        // The task only exits after Shutdown, which consumes or drops the handle.
        let _ = self.events.send(event);
    }
}

impl Drop for ProtocolManager {
    fn drop(&mut self) {
        let _ = self.events.send(Event::Shutdown);
    }
}
