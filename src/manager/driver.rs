//! The update state machine.
//!
//! A single task owns all mutable manager state and processes one [`Event`]
//! at a time. Transport fetches and async delegate calls run on spawned
//! tasks that post their result back as another event, so a handler never
//! waits on anything. Stale completions are recognised by their cycle or
//! fetch id and dropped.

use std::collections::VecDeque;
use std::mem;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::ManagerOptions;
use super::error::{GetHashError, UpdateError};
use super::state::ManagerState;
use crate::delegate::{StorageDelegate, StorageError};
use crate::protocol::constants::{MAX_POLL_INTERVAL, STARTUP_DELAY_MAX, STARTUP_DELAY_MIN};
use crate::protocol::{
    BackoffPolicy, Chunk, ChunkDelete, ChunkRedirect, FailureClass, FullHash, GetHashBackoff,
    HashPrefix, ListCoverage, ProtocolConfig, RequestBuilder, UpdateResponse, parse_chunk_response,
    parse_gethash_response, parse_update_response, update_body,
};
use crate::transport::{FetchRequest, FetchResponse, NetError, Transport};

pub(crate) type GetHashReply = oneshot::Sender<Result<Vec<FullHash>, GetHashError>>;

/// Everything the driver reacts to.
pub(crate) enum Event {
    Start,
    ForceUpdate(Duration),
    SetAdditionalQuery(Option<String>),
    SetPollInterval(Duration),
    GetHash {
        prefixes: Vec<HashPrefix>,
        reply: GetHashReply,
    },
    Shutdown,

    UpdateTimerFired,
    FetchTimedOut,
    CoverageReady {
        cycle: u64,
        result: Result<Vec<ListCoverage>, StorageError>,
    },
    FetchCompleted {
        fetch: u64,
        result: Result<FetchResponse, NetError>,
    },
    StorageApplied {
        cycle: u64,
    },
    GetHashCompleted {
        url: String,
        result: Result<FetchResponse, NetError>,
        reply: GetHashReply,
    },
}

/// Work left in the current cycle, run strictly in order.
#[derive(Debug)]
enum CycleStep {
    Delete(Vec<ChunkDelete>),
    Add { list_name: String, chunks: Vec<Chunk> },
    Redirect(ChunkRedirect),
}

#[derive(Debug)]
struct Cycle {
    id: u64,
    /// Update request body, kept for a backup retry.
    body: String,
    steps: VecDeque<CycleStep>,
}

#[derive(Debug)]
enum FetchKind {
    Update { backup: Option<FailureClass> },
    Chunks { list_name: String },
}

#[derive(Debug)]
struct InFlight {
    id: u64,
    kind: FetchKind,
    url: String,
    deadline: Instant,
}

#[derive(Debug)]
enum Phase {
    Idle,
    Scheduled { at: Instant },
    AwaitingCoverage { cycle: u64 },
    Fetching { cycle: Cycle, fetch: InFlight },
    Applying { cycle: Cycle },
}

impl Phase {
    fn state(&self) -> ManagerState {
        match self {
            Self::Idle => ManagerState::Idle,
            Self::Scheduled { at } => ManagerState::Scheduled { at: *at },
            Self::AwaitingCoverage { .. } => ManagerState::AwaitingCoverage,
            Self::Fetching { fetch, .. } => match &fetch.kind {
                FetchKind::Update { backup: None } => ManagerState::FetchingPrimary,
                FetchKind::Update {
                    backup: Some(class),
                } => ManagerState::FetchingBackup(*class),
                FetchKind::Chunks { list_name } => ManagerState::FetchingChunks {
                    list_name: list_name.clone(),
                },
            },
            Self::Applying { .. } => ManagerState::ApplyingChunks,
        }
    }

    fn in_cycle(&self) -> bool {
        matches!(
            self,
            Self::AwaitingCoverage { .. } | Self::Fetching { .. } | Self::Applying { .. }
        )
    }
}

pub(crate) struct Driver {
    delegate: Arc<dyn StorageDelegate>,
    transport: Arc<dyn Transport>,
    requests: RequestBuilder,
    update_backoff: BackoffPolicy,
    gethash_backoff: GetHashBackoff,
    poll_interval: Duration,
    fetch_timeout: Duration,
    startup_delay: Duration,
    phase: Phase,
    next_cycle: u64,
    next_fetch: u64,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,
    state_tx: watch::Sender<ManagerState>,
}

impl Driver {
    pub(crate) fn new(
        config: Arc<ProtocolConfig>,
        delegate: Arc<dyn StorageDelegate>,
        transport: Arc<dyn Transport>,
        options: &ManagerOptions,
        events_tx: mpsc::UnboundedSender<Event>,
        events_rx: mpsc::UnboundedReceiver<Event>,
        state_tx: watch::Sender<ManagerState>,
    ) -> Self {
        let update_backoff = BackoffPolicy::new(options.fuzz);
        let fuzz = update_backoff.fuzz();
        let startup_delay = STARTUP_DELAY_MIN + (STARTUP_DELAY_MAX - STARTUP_DELAY_MIN).mul_f64(fuzz);
        Self {
            delegate,
            transport,
            requests: RequestBuilder::new(config),
            update_backoff,
            gethash_backoff: GetHashBackoff::new(fuzz),
            poll_interval: options.poll_interval.min(MAX_POLL_INTERVAL),
            fetch_timeout: options.fetch_timeout,
            startup_delay,
            phase: Phase::Idle,
            next_cycle: 0,
            next_fetch: 0,
            events_tx,
            events_rx,
            state_tx,
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            let update_at = self.update_deadline();
            let fetch_deadline = self.fetch_deadline();
            let event = tokio::select! {
                event = self.events_rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
                () = sleep_until(update_at) => Event::UpdateTimerFired,
                () = sleep_until(fetch_deadline) => Event::FetchTimedOut,
            };
            if self.handle(event).is_break() {
                break;
            }
        }
        debug!("protocol manager stopped");
        self.state_tx.send_replace(ManagerState::Stopped);
    }

    fn update_deadline(&self) -> Option<Instant> {
        match &self.phase {
            Phase::Scheduled { at } => Some(*at),
            _ => None,
        }
    }

    fn fetch_deadline(&self) -> Option<Instant> {
        match &self.phase {
            Phase::Fetching { fetch, .. } => Some(fetch.deadline),
            _ => None,
        }
    }

    fn handle(&mut self, event: Event) -> ControlFlow<()> {
        match event {
            Event::Start => {
                if matches!(self.phase, Phase::Idle) {
                    info!(
                        delay_secs = self.startup_delay.as_secs(),
                        "scheduling first update"
                    );
                    self.schedule(self.startup_delay);
                }
            }
            Event::ForceUpdate(delay) => {
                if self.phase.in_cycle() {
                    debug!("update already in progress, ignoring force_update");
                } else {
                    self.schedule(delay);
                }
            }
            Event::SetAdditionalQuery(query) => self.requests.set_additional_query(query),
            Event::SetPollInterval(interval) => self.set_poll_interval(interval),
            Event::GetHash { prefixes, reply } => self.start_gethash(&prefixes, reply),
            Event::Shutdown => return ControlFlow::Break(()),
            Event::UpdateTimerFired => self.start_cycle(),
            Event::FetchTimedOut => self.on_fetch_timeout(),
            Event::CoverageReady { cycle, result } => self.on_coverage(cycle, result),
            Event::FetchCompleted { fetch, result } => self.on_fetch_completed(fetch, result),
            Event::StorageApplied { cycle } => self.on_storage_applied(cycle),
            Event::GetHashCompleted { url, result, reply } => {
                self.finish_gethash(&url, result, reply);
            }
        }
        ControlFlow::Continue(())
    }

    fn set_phase(&mut self, phase: Phase) {
        self.phase = phase;
        self.state_tx.send_replace(self.phase.state());
    }

    fn schedule(&mut self, delay: Duration) {
        self.set_phase(Phase::Scheduled {
            at: deadline_after(delay.min(MAX_POLL_INTERVAL)),
        });
    }

    /// Zero keeps the current interval; anything above the ceiling is clamped.
    fn set_poll_interval(&mut self, interval: Duration) {
        if interval.is_zero() {
            debug!("ignoring zero poll interval");
            return;
        }
        self.poll_interval = interval.min(MAX_POLL_INTERVAL);
        debug!(secs = self.poll_interval.as_secs(), "poll interval set");
    }

    // ==================== Update Cycle ====================

    fn start_cycle(&mut self) {
        self.next_cycle += 1;
        let cycle = self.next_cycle;
        info!(cycle, "update cycle started");
        self.delegate.update_started();
        self.set_phase(Phase::AwaitingCoverage { cycle });

        let delegate = Arc::clone(&self.delegate);
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let result = delegate.get_chunks().await;
            let _ = events.send(Event::CoverageReady { cycle, result });
        });
    }

    fn on_coverage(&mut self, cycle: u64, result: Result<Vec<ListCoverage>, StorageError>) {
        if !matches!(self.phase, Phase::AwaitingCoverage { cycle: current } if current == cycle) {
            debug!(cycle, "ignoring stale coverage report");
            return;
        }
        match result {
            Ok(lists) => {
                let cycle = Cycle {
                    id: cycle,
                    body: update_body(&lists),
                    steps: VecDeque::new(),
                };
                self.send_update(cycle, None);
            }
            Err(error) => {
                warn!(cycle, error = %UpdateError::from(error), "could not read chunk coverage");
                self.finish_cycle(false);
            }
        }
    }

    fn send_update(&mut self, cycle: Cycle, backup: Option<FailureClass>) {
        let config = self.requests.config();
        let prefix = match backup {
            None => Some(config.url_prefix()),
            Some(class) => config.backup_prefix(class),
        };
        let Some(prefix) = prefix else {
            self.finish_cycle(false);
            return;
        };
        match self.requests.update_request(prefix, &cycle.body) {
            Ok(request) => self.start_fetch(cycle, FetchKind::Update { backup }, request),
            Err(source) => {
                let prefix = prefix.to_string();
                warn!(error = %UpdateError::invalid_url(prefix, source), "could not build update request");
                self.finish_cycle(false);
            }
        }
    }

    fn start_fetch(&mut self, cycle: Cycle, kind: FetchKind, request: FetchRequest) {
        self.next_fetch += 1;
        let fetch = InFlight {
            id: self.next_fetch,
            kind,
            url: request.url.to_string(),
            deadline: deadline_after(self.fetch_timeout),
        };
        debug!(cycle = cycle.id, url = %fetch.url, "fetch started");

        let transport = Arc::clone(&self.transport);
        let events = self.events_tx.clone();
        let fetch_id = fetch.id;
        tokio::spawn(async move {
            let result = transport.fetch(request).await;
            let _ = events.send(Event::FetchCompleted {
                fetch: fetch_id,
                result,
            });
        });
        self.set_phase(Phase::Fetching { cycle, fetch });
    }

    /// Takes the in-flight fetch out of the phase if `fetch_id` matches it.
    fn take_fetch(&mut self, fetch_id: Option<u64>) -> Option<(Cycle, InFlight)> {
        let current = match &self.phase {
            Phase::Fetching { fetch, .. } => fetch.id,
            _ => return None,
        };
        if fetch_id.is_some_and(|id| id != current) {
            return None;
        }
        match mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Fetching { cycle, fetch } => Some((cycle, fetch)),
            other => {
                self.phase = other;
                None
            }
        }
    }

    fn on_fetch_completed(&mut self, fetch_id: u64, result: Result<FetchResponse, NetError>) {
        let Some((cycle, fetch)) = self.take_fetch(Some(fetch_id)) else {
            debug!(fetch = fetch_id, "ignoring stale fetch result");
            return;
        };
        let outcome = match result {
            Err(source) => Err(UpdateError::network(&fetch.url, source)),
            Ok(response) if response.status != 200 => {
                Err(UpdateError::http_status(&fetch.url, response.status))
            }
            Ok(response) => Ok(response.body),
        };
        self.on_fetch_outcome(cycle, fetch, outcome);
    }

    fn on_fetch_timeout(&mut self) {
        let Some((cycle, fetch)) = self.take_fetch(None) else {
            return;
        };
        let error = UpdateError::timeout(&fetch.url);
        self.on_fetch_outcome(cycle, fetch, Err(error));
    }

    fn on_fetch_outcome(
        &mut self,
        mut cycle: Cycle,
        fetch: InFlight,
        outcome: Result<Vec<u8>, UpdateError>,
    ) {
        match fetch.kind {
            FetchKind::Update { backup } => {
                let parsed = outcome.and_then(|body| {
                    parse_update_response(&body).map_err(|e| UpdateError::protocol(&fetch.url, e))
                });
                match parsed {
                    Ok(response) => self.apply_update_response(cycle, response),
                    Err(error) => self.handle_update_failure(cycle, backup, &error),
                }
            }
            FetchKind::Chunks { list_name } => {
                let parsed = outcome.and_then(|body| {
                    parse_chunk_response(&body).map_err(|e| UpdateError::protocol(&fetch.url, e))
                });
                match parsed {
                    Ok(chunks) => {
                        debug!(list = %list_name, chunks = chunks.len(), "redirect fetched");
                        if !chunks.is_empty() {
                            cycle.steps.push_front(CycleStep::Add { list_name, chunks });
                        }
                        self.advance(cycle);
                    }
                    Err(error) => {
                        warn!(list = %list_name, error = %error, "redirect fetch failed");
                        self.finish_cycle(false);
                    }
                }
            }
        }
    }

    fn handle_update_failure(
        &mut self,
        cycle: Cycle,
        backup: Option<FailureClass>,
        error: &UpdateError,
    ) {
        if let Some(class) = backup {
            warn!(class = class.as_str(), error = %error, "backup update request failed");
            self.finish_cycle(false);
            return;
        }
        let Some(class) = error.failure_class() else {
            warn!(error = %error, "update request failed");
            self.finish_cycle(false);
            return;
        };
        if self.requests.config().backup_prefix(class).is_none() {
            warn!(class = class.as_str(), error = %error, "update request failed, no backup configured");
            self.finish_cycle(false);
            return;
        }
        warn!(class = class.as_str(), error = %error, "update request failed, retrying backup");
        self.send_update(cycle, Some(class));
    }

    #[instrument(skip_all, fields(cycle = cycle.id))]
    fn apply_update_response(&mut self, mut cycle: Cycle, response: UpdateResponse) {
        if let Some(interval) = response.next_update_interval {
            self.set_poll_interval(interval);
        }
        if response.reset {
            info!("server requested database reset");
            self.delegate.reset_database();
        }
        if !response.deletes.is_empty() {
            cycle.steps.push_back(CycleStep::Delete(response.deletes));
        }
        for list in response.chunks {
            cycle.steps.push_back(CycleStep::Add {
                list_name: list.list_name,
                chunks: list.chunks,
            });
        }
        cycle
            .steps
            .extend(response.redirects.into_iter().map(CycleStep::Redirect));
        debug!(steps = cycle.steps.len(), "update response accepted");
        self.advance(cycle);
    }

    /// Runs the next pending step, or ends the cycle when none remain.
    fn advance(&mut self, mut cycle: Cycle) {
        let Some(step) = cycle.steps.pop_front() else {
            self.finish_cycle(true);
            return;
        };
        match step {
            CycleStep::Delete(deletes) => {
                let delegate = Arc::clone(&self.delegate);
                self.apply_storage(cycle, async move { delegate.delete_chunks(deletes).await });
            }
            CycleStep::Add { list_name, chunks } => {
                let delegate = Arc::clone(&self.delegate);
                self.apply_storage(cycle, async move {
                    delegate.add_chunks(&list_name, chunks).await;
                });
            }
            CycleStep::Redirect(redirect) => match self.requests.next_chunk_url(&redirect.url) {
                Ok(url) => {
                    let request = RequestBuilder::chunk_request(url);
                    let kind = FetchKind::Chunks {
                        list_name: redirect.list_name,
                    };
                    self.start_fetch(cycle, kind, request);
                }
                Err(source) => {
                    warn!(error = %UpdateError::invalid_url(redirect.url, source), "bad redirect");
                    self.finish_cycle(false);
                }
            },
        }
    }

    fn apply_storage<F>(&mut self, cycle: Cycle, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let id = cycle.id;
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            work.await;
            let _ = events.send(Event::StorageApplied { cycle: id });
        });
        self.set_phase(Phase::Applying { cycle });
    }

    fn on_storage_applied(&mut self, cycle_id: u64) {
        if !matches!(&self.phase, Phase::Applying { cycle } if cycle.id == cycle_id) {
            debug!(cycle = cycle_id, "ignoring stale storage completion");
            return;
        }
        if let Phase::Applying { cycle } = mem::replace(&mut self.phase, Phase::Idle) {
            self.advance(cycle);
        }
    }

    fn finish_cycle(&mut self, success: bool) {
        self.delegate.update_finished(success);
        let interval = self.update_backoff.next_interval(!success, self.poll_interval);
        info!(
            success,
            errors = self.update_backoff.error_count(),
            next_update_secs = interval.as_secs(),
            "update cycle finished"
        );
        self.schedule(interval);
    }

    // ==================== Get-Hash ====================

    fn start_gethash(&mut self, prefixes: &[HashPrefix], reply: GetHashReply) {
        let now = Instant::now();
        if !self.gethash_backoff.is_allowed(now) {
            let retry_in = self
                .gethash_backoff
                .next_allowed()
                .map_or(Duration::ZERO, |at| at.saturating_duration_since(now));
            debug!(retry_in_secs = retry_in.as_secs(), "get-hash backing off");
            let _ = reply.send(Err(GetHashError::BackedOff { retry_in }));
            return;
        }
        let request = match self.requests.gethash_request(prefixes) {
            Ok(request) => request,
            Err(source) => {
                let error = UpdateError::invalid_url(self.requests.config().url_prefix(), source);
                let _ = reply.send(Err(error.into()));
                return;
            }
        };
        let url = request.url.to_string();
        debug!(prefixes = prefixes.len(), %url, "get-hash request started");

        let transport = Arc::clone(&self.transport);
        let events = self.events_tx.clone();
        let timeout = self.fetch_timeout;
        tokio::spawn(async move {
            let result = tokio::time::timeout(timeout, transport.fetch(request))
                .await
                .unwrap_or(Err(NetError::TimedOut));
            let _ = events.send(Event::GetHashCompleted { url, result, reply });
        });
    }

    fn finish_gethash(
        &mut self,
        url: &str,
        result: Result<FetchResponse, NetError>,
        reply: GetHashReply,
    ) {
        let outcome = match result {
            Err(source) => Err(UpdateError::network(url, source)),
            Ok(response) if response.status == 204 => Ok(Vec::new()),
            Ok(response) if response.status == 200 => {
                parse_gethash_response(&response.body).map_err(|e| UpdateError::protocol(url, e))
            }
            Ok(response) => Err(UpdateError::http_status(url, response.status)),
        };
        match &outcome {
            Ok(hashes) => {
                debug!(hashes = hashes.len(), "get-hash succeeded");
                self.gethash_backoff.handle_success();
            }
            Err(error) => {
                self.gethash_backoff.handle_failure(Instant::now());
                warn!(
                    error = %error,
                    errors = self.gethash_backoff.error_count(),
                    "get-hash request failed"
                );
            }
        }
        let _ = reply.send(outcome.map_err(GetHashError::from));
    }
}

fn deadline_after(delay: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(delay).unwrap_or_else(|| now + MAX_POLL_INTERVAL)
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
