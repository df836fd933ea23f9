//! Integration tests for the protocol manager update cycle.
//!
//! The transport hands every request to the test over a channel and waits
//! for the test to answer it, so each test drives the exchange step by step.
//! All tests run on a paused clock: timers fire as soon as the runtime is
//! otherwise idle.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use listupdate_core::{
    Chunk, ChunkDelete, ChunkKind, ChunkRange, FailureClass, FetchMethod, FetchRequest,
    FetchResponse, GetHashError, ListCoverage, ManagerOptions, ManagerState, NetError,
    ProtocolConfig, ProtocolManager, StorageDelegate, StorageError, Transport, UpdateError,
};
use listupdate_core::protocol::constants::MAX_POLL_INTERVAL;
use tokio::sync::{Semaphore, mpsc, oneshot};
use tokio::time::Instant;

const PRIMARY: &str = "https://prefix.com/foo";
const BACKUP_CONNECT: &str = "https://alt1-prefix.com/foo";
const BACKUP_HTTP: &str = "https://alt2-prefix.com/foo";
const BACKUP_NETWORK: &str = "https://alt3-prefix.com/foo";
const QUERY: &str = "client=unittest&appver=1.0&pver=2.2";

const REDIRECT_RESPONSE: &[u8] = b"i:goog-phish-shavar\nu:redirect-server.example.com/path\n";
const CHUNK_DATA: &[u8] = b"a:4:4:9\nhost\x01fdaf";

// ==================== Test Doubles ====================

struct PendingFetch {
    request: FetchRequest,
    reply: oneshot::Sender<Result<FetchResponse, NetError>>,
}

impl PendingFetch {
    fn respond(self, status: u16, body: &[u8]) {
        let _ = self.reply.send(Ok(FetchResponse::new(status, body.to_vec())));
    }

    fn fail(self, error: NetError) {
        let _ = self.reply.send(Err(error));
    }
}

struct ChannelTransport {
    fetches: mpsc::UnboundedSender<PendingFetch>,
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, NetError> {
        let (reply, response) = oneshot::channel();
        self.fetches
            .send(PendingFetch { request, reply })
            .map_err(|_| NetError::Other("test finished".to_string()))?;
        response
            .await
            .unwrap_or_else(|_| Err(NetError::Other("reply dropped".to_string())))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    Started,
    Finished(bool),
    Reset,
    Add(String, Vec<u32>),
    Delete(Vec<ChunkDelete>),
}

struct RecordingDelegate {
    calls: mpsc::UnboundedSender<Call>,
    coverage: Result<Vec<ListCoverage>, StorageError>,
    add_gate: Option<Arc<Semaphore>>,
}

#[async_trait]
impl StorageDelegate for RecordingDelegate {
    fn update_started(&self) {
        let _ = self.calls.send(Call::Started);
    }

    fn update_finished(&self, success: bool) {
        let _ = self.calls.send(Call::Finished(success));
    }

    fn reset_database(&self) {
        let _ = self.calls.send(Call::Reset);
    }

    async fn get_chunks(&self) -> Result<Vec<ListCoverage>, StorageError> {
        self.coverage.clone()
    }

    async fn add_chunks(&self, list_name: &str, chunks: Vec<Chunk>) {
        let numbers = chunks.iter().map(|chunk| chunk.number).collect();
        let _ = self.calls.send(Call::Add(list_name.to_string(), numbers));
        if let Some(gate) = &self.add_gate {
            gate.acquire().await.unwrap().forget();
        }
    }

    async fn delete_chunks(&self, deletes: Vec<ChunkDelete>) {
        let _ = self.calls.send(Call::Delete(deletes));
    }
}

struct Harness {
    manager: ProtocolManager,
    fetches: mpsc::UnboundedReceiver<PendingFetch>,
    calls: mpsc::UnboundedReceiver<Call>,
}

impl Harness {
    async fn next_fetch(&mut self) -> PendingFetch {
        self.fetches.recv().await.unwrap()
    }

    async fn next_call(&mut self) -> Call {
        self.calls.recv().await.unwrap()
    }

    /// Forces an update now and returns the primary update request.
    async fn begin_update(&mut self) -> PendingFetch {
        self.manager.force_update(Duration::ZERO);
        assert_eq!(self.next_call().await, Call::Started);
        self.next_fetch().await
    }

    async fn settle(&self) {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    fn scheduled_in(&self) -> Duration {
        match self.manager.state() {
            ManagerState::Scheduled { at } => at.saturating_duration_since(Instant::now()),
            other => panic!("expected a scheduled update, found {other:?}"),
        }
    }
}

fn test_config() -> ProtocolConfig {
    ProtocolConfig::builder("unittest", "1.0", PRIMARY)
        .backup_prefix(FailureClass::Connect, BACKUP_CONNECT)
        .backup_prefix(FailureClass::Http, BACKUP_HTTP)
        .backup_prefix(FailureClass::Network, BACKUP_NETWORK)
        .build()
        .unwrap()
}

fn harness_with(
    config: ProtocolConfig,
    coverage: Result<Vec<ListCoverage>, StorageError>,
    add_gate: Option<Arc<Semaphore>>,
) -> Harness {
    let (fetch_tx, fetches) = mpsc::unbounded_channel();
    let (call_tx, calls) = mpsc::unbounded_channel();
    let delegate = RecordingDelegate {
        calls: call_tx,
        coverage,
        add_gate,
    };
    let manager = ProtocolManager::spawn(
        config,
        Arc::new(delegate),
        Arc::new(ChannelTransport { fetches: fetch_tx }),
        ManagerOptions::with_fuzz(0.0),
    );
    Harness {
        manager,
        fetches,
        calls,
    }
}

fn harness() -> Harness {
    harness_with(test_config(), Ok(Vec::new()), None)
}

fn update_url(prefix: &str) -> String {
    format!("{prefix}/downloads?{QUERY}")
}

// ==================== Update Request Tests ====================

#[tokio::test(start_paused = true)]
async fn test_update_posts_coverage_to_primary() {
    let coverage = vec![
        ListCoverage::new("goog-phish-shavar", "1-3", "4"),
        ListCoverage::empty("goog-malware-shavar"),
    ];
    let mut h = harness_with(test_config(), Ok(coverage), None);

    let fetch = h.begin_update().await;
    assert_eq!(fetch.request.url.as_str(), update_url(PRIMARY));
    assert_eq!(fetch.request.method, FetchMethod::Post);
    assert_eq!(
        fetch.request.body,
        b"goog-phish-shavar;a:1-3:s:4\ngoog-malware-shavar;\n".to_vec()
    );
    assert!(fetch.request.load_flags.disable_cache);
    assert_eq!(h.manager.state(), ManagerState::FetchingPrimary);
    assert!(!h.manager.is_update_scheduled());

    fetch.respond(200, b"");
    assert_eq!(h.next_call().await, Call::Finished(true));
    assert!(h.manager.is_update_scheduled());
    assert_eq!(h.scheduled_in(), Duration::from_secs(1800));
}

#[tokio::test(start_paused = true)]
async fn test_start_waits_for_startup_delay() {
    let mut h = harness();
    let started_at = Instant::now();

    h.manager.start();
    assert!(h.manager.wait_until_scheduled().await.is_scheduled());
    assert_eq!(h.scheduled_in(), Duration::from_secs(60));

    assert_eq!(h.next_call().await, Call::Started);
    assert!(started_at.elapsed() >= Duration::from_secs(60));
    h.next_fetch().await.respond(200, b"");
    assert_eq!(h.next_call().await, Call::Finished(true));
}

#[tokio::test(start_paused = true)]
async fn test_additional_query_is_appended() {
    let mut h = harness();
    h.manager.set_additional_query("&ext=1");

    let fetch = h.begin_update().await;
    assert_eq!(
        fetch.request.url.as_str(),
        format!("{}&ext=1", update_url(PRIMARY))
    );

    fetch.respond(200, REDIRECT_RESPONSE);
    let redirect = h.next_fetch().await;
    assert_eq!(
        redirect.request.url.as_str(),
        "https://redirect-server.example.com/path?ext=1"
    );
    redirect.respond(200, b"");
    assert_eq!(h.next_call().await, Call::Finished(true));
}

#[tokio::test(start_paused = true)]
async fn test_database_error_skips_network() {
    let mut h = harness_with(test_config(), Err(StorageError::new("locked")), None);

    h.manager.force_update(Duration::ZERO);
    assert_eq!(h.next_call().await, Call::Started);
    assert_eq!(h.next_call().await, Call::Finished(false));
    assert!(h.fetches.try_recv().is_err());
    assert_eq!(h.scheduled_in(), Duration::from_secs(60));
}

#[tokio::test(start_paused = true)]
async fn test_consecutive_failures_back_off() {
    let mut h = harness_with(test_config(), Err(StorageError::new("locked")), None);

    h.manager.force_update(Duration::ZERO);
    assert_eq!(h.next_call().await, Call::Started);
    assert_eq!(h.next_call().await, Call::Finished(false));
    assert_eq!(h.scheduled_in(), Duration::from_secs(60));

    assert_eq!(h.next_call().await, Call::Started);
    assert_eq!(h.next_call().await, Call::Finished(false));
    assert_eq!(h.scheduled_in(), Duration::from_secs(30 * 60));

    assert_eq!(h.next_call().await, Call::Started);
    assert_eq!(h.next_call().await, Call::Finished(false));
    assert_eq!(h.scheduled_in(), Duration::from_secs(60 * 60));
}

#[tokio::test(start_paused = true)]
async fn test_server_interval_becomes_poll_interval() {
    let mut h = harness();

    h.begin_update().await.respond(200, b"n:600\n");
    assert_eq!(h.next_call().await, Call::Finished(true));
    assert_eq!(h.scheduled_in(), Duration::from_secs(600));
}

#[tokio::test(start_paused = true)]
async fn test_zero_server_interval_keeps_poll_interval() {
    let mut h = harness();

    h.begin_update().await.respond(200, b"n:0\n");
    assert_eq!(h.next_call().await, Call::Finished(true));
    assert_eq!(h.scheduled_in(), Duration::from_secs(1800));
}

#[tokio::test(start_paused = true)]
async fn test_oversized_server_interval_is_capped() {
    let mut h = harness();

    h.begin_update().await.respond(200, b"n:18446744073709551615\n");
    assert_eq!(h.next_call().await, Call::Finished(true));
    assert_eq!(h.scheduled_in(), MAX_POLL_INTERVAL);

    h.begin_update().await.respond(200, b"");
    assert_eq!(h.next_call().await, Call::Finished(true));
    assert_eq!(h.scheduled_in(), MAX_POLL_INTERVAL);
}

#[tokio::test(start_paused = true)]
async fn test_huge_delays_keep_manager_running() {
    let mut h = harness();

    h.manager.force_update(Duration::MAX);
    assert!(h.manager.wait_until_scheduled().await.is_scheduled());
    assert_eq!(h.scheduled_in(), MAX_POLL_INTERVAL);

    h.manager.set_poll_interval(Duration::MAX);
    h.manager.set_poll_interval(Duration::ZERO);
    h.begin_update().await.respond(200, b"");
    assert_eq!(h.next_call().await, Call::Finished(true));
    assert_eq!(h.scheduled_in(), MAX_POLL_INTERVAL);
}

#[tokio::test(start_paused = true)]
async fn test_force_update_ignored_during_cycle() {
    let mut h = harness();

    let fetch = h.begin_update().await;
    h.manager.force_update(Duration::ZERO);
    h.settle().await;
    assert_eq!(h.manager.state(), ManagerState::FetchingPrimary);

    fetch.respond(200, b"");
    assert_eq!(h.next_call().await, Call::Finished(true));
    assert_eq!(h.scheduled_in(), Duration::from_secs(1800));
}

// ==================== Backup Tests ====================

#[tokio::test(start_paused = true)]
async fn test_connect_error_uses_connect_backup() {
    let mut h = harness();

    let primary = h.begin_update().await;
    let body = primary.request.body.clone();
    primary.fail(NetError::ConnectionReset);

    let backup = h.next_fetch().await;
    assert_eq!(backup.request.url.as_str(), update_url(BACKUP_CONNECT));
    assert_eq!(backup.request.body, body);
    assert_eq!(
        h.manager.state(),
        ManagerState::FetchingBackup(FailureClass::Connect)
    );
    backup.respond(200, b"");
    assert_eq!(h.next_call().await, Call::Finished(true));
}

#[tokio::test(start_paused = true)]
async fn test_http_error_uses_http_backup() {
    let mut h = harness();

    h.begin_update().await.respond(404, b"");
    let backup = h.next_fetch().await;
    assert_eq!(backup.request.url.as_str(), update_url(BACKUP_HTTP));
    backup.respond(200, b"");
    assert_eq!(h.next_call().await, Call::Finished(true));
}

#[tokio::test(start_paused = true)]
async fn test_network_error_uses_network_backup() {
    let mut h = harness();

    h.begin_update().await.fail(NetError::InternetDisconnected);
    let backup = h.next_fetch().await;
    assert_eq!(backup.request.url.as_str(), update_url(BACKUP_NETWORK));
    backup.respond(200, b"");
    assert_eq!(h.next_call().await, Call::Finished(true));
}

#[tokio::test(start_paused = true)]
async fn test_unparseable_body_uses_http_backup() {
    let mut h = harness();

    h.begin_update().await.respond(200, b"THIS IS AN INVALID RESPONSE");
    let backup = h.next_fetch().await;
    assert_eq!(backup.request.url.as_str(), update_url(BACKUP_HTTP));
    backup.respond(200, b"THIS IS AN INVALID RESPONSE");

    assert_eq!(h.next_call().await, Call::Finished(false));
    assert!(h.fetches.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_backup_failure_ends_cycle() {
    let mut h = harness();

    h.begin_update().await.fail(NetError::ConnectionRefused);
    h.next_fetch().await.respond(503, b"");

    assert_eq!(h.next_call().await, Call::Finished(false));
    assert!(h.fetches.try_recv().is_err());
    assert_eq!(h.scheduled_in(), Duration::from_secs(60));
}

#[tokio::test(start_paused = true)]
async fn test_missing_backup_prefix_ends_cycle() {
    let config = ProtocolConfig::builder("unittest", "1.0", PRIMARY)
        .build()
        .unwrap();
    let mut h = harness_with(config, Ok(Vec::new()), None);

    h.begin_update().await.respond(500, b"");
    assert_eq!(h.next_call().await, Call::Finished(false));
    assert!(h.fetches.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_timeout_uses_connect_backup_and_drops_late_reply() {
    let mut h = harness();
    let started_at = Instant::now();

    let stalled = h.begin_update().await;
    let backup = h.next_fetch().await;
    assert!(started_at.elapsed() >= Duration::from_secs(30));
    assert_eq!(backup.request.url.as_str(), update_url(BACKUP_CONNECT));
    backup.respond(200, b"");
    assert_eq!(h.next_call().await, Call::Finished(true));

    stalled.respond(200, b"r:pleasereset\n");
    h.settle().await;
    assert!(h.calls.try_recv().is_err());
    assert!(h.manager.is_update_scheduled());
}

// ==================== Response Handling Tests ====================

#[tokio::test(start_paused = true)]
async fn test_reset_response_resets_database() {
    let mut h = harness();

    h.begin_update().await.respond(200, b"r:pleasereset\n");
    assert_eq!(h.next_call().await, Call::Reset);
    assert_eq!(h.next_call().await, Call::Finished(true));
}

#[tokio::test(start_paused = true)]
async fn test_reset_in_unparseable_body_is_not_applied() {
    let mut h = harness();

    h.begin_update().await.respond(200, b"r:pleasereset\nGARBAGE\n");
    let backup = h.next_fetch().await;
    assert_eq!(backup.request.url.as_str(), update_url(BACKUP_HTTP));
    backup.respond(200, b"r:pleasereset\nGARBAGE\n");

    assert_eq!(h.next_call().await, Call::Finished(false));
    h.settle().await;
    assert!(h.calls.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_deletes_then_inline_chunks_in_order() {
    let mut h = harness();

    let mut body = b"i:goog-phish-shavar\nad:1-2\n".to_vec();
    body.extend_from_slice(CHUNK_DATA);
    h.begin_update().await.respond(200, &body);

    assert_eq!(
        h.next_call().await,
        Call::Delete(vec![ChunkDelete {
            list_name: "goog-phish-shavar".to_string(),
            kind: ChunkKind::Add,
            ranges: vec![ChunkRange::new(1, 2)],
        }])
    );
    assert_eq!(
        h.next_call().await,
        Call::Add("goog-phish-shavar".to_string(), vec![4])
    );
    assert_eq!(h.next_call().await, Call::Finished(true));
}

// ==================== Redirect Tests ====================

#[tokio::test(start_paused = true)]
async fn test_empty_redirect_response() {
    let mut h = harness();

    h.begin_update().await.respond(200, REDIRECT_RESPONSE);
    let redirect = h.next_fetch().await;
    assert_eq!(
        redirect.request.url.as_str(),
        "https://redirect-server.example.com/path"
    );
    assert_eq!(redirect.request.method, FetchMethod::Get);
    redirect.respond(200, b"");

    assert_eq!(h.next_call().await, Call::Finished(true));
}

#[tokio::test(start_paused = true)]
async fn test_invalid_redirect_response() {
    let mut h = harness();

    h.begin_update().await.respond(200, REDIRECT_RESPONSE);
    h.next_fetch().await.respond(200, b"THIS IS AN INVALID RESPONSE");

    assert_eq!(h.next_call().await, Call::Finished(false));
    assert!(h.fetches.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_redirect_network_error_fails_cycle() {
    let mut h = harness();

    h.begin_update().await.respond(200, REDIRECT_RESPONSE);
    h.next_fetch().await.fail(NetError::ConnectionReset);

    assert_eq!(h.next_call().await, Call::Finished(false));
}

#[tokio::test(start_paused = true)]
async fn test_single_redirect_waits_for_add_chunks() {
    let gate = Arc::new(Semaphore::new(0));
    let mut h = harness_with(test_config(), Ok(Vec::new()), Some(Arc::clone(&gate)));

    h.begin_update().await.respond(200, REDIRECT_RESPONSE);
    let redirect = h.next_fetch().await;
    assert_eq!(
        h.manager.state(),
        ManagerState::FetchingChunks {
            list_name: "goog-phish-shavar".to_string()
        }
    );
    assert!(!h.manager.is_update_scheduled());
    redirect.respond(200, CHUNK_DATA);

    assert_eq!(
        h.next_call().await,
        Call::Add("goog-phish-shavar".to_string(), vec![4])
    );
    h.settle().await;
    assert_eq!(h.manager.state(), ManagerState::ApplyingChunks);
    assert!(!h.manager.is_update_scheduled());

    gate.add_permits(1);
    assert_eq!(h.next_call().await, Call::Finished(true));
    assert!(h.manager.is_update_scheduled());
}

#[tokio::test(start_paused = true)]
async fn test_multiple_redirects_fetched_one_at_a_time() {
    let gate = Arc::new(Semaphore::new(0));
    let mut h = harness_with(test_config(), Ok(Vec::new()), Some(Arc::clone(&gate)));

    let body = b"i:goog-phish-shavar\n\
u:redirect-server.example.com/a\n\
u:redirect-server.example.com/b\n";
    h.begin_update().await.respond(200, body);

    let first = h.next_fetch().await;
    assert_eq!(first.request.url.as_str(), "https://redirect-server.example.com/a");
    first.respond(200, CHUNK_DATA);
    assert_eq!(
        h.next_call().await,
        Call::Add("goog-phish-shavar".to_string(), vec![4])
    );

    h.settle().await;
    assert!(h.fetches.try_recv().is_err());
    assert!(!h.manager.is_update_scheduled());

    gate.add_permits(1);
    let second = h.next_fetch().await;
    assert_eq!(second.request.url.as_str(), "https://redirect-server.example.com/b");
    second.respond(200, b"a:5:4:9\nhost\x01fdaf");
    assert_eq!(
        h.next_call().await,
        Call::Add("goog-phish-shavar".to_string(), vec![5])
    );

    gate.add_permits(1);
    assert_eq!(h.next_call().await, Call::Finished(true));
    assert!(h.manager.is_update_scheduled());
}

// ==================== Get-Hash Tests ====================

fn gethash_response(list: &str, add_chunk: u32, hash: [u8; 32]) -> Vec<u8> {
    let mut body = format!("{list}:{add_chunk}:32\n").into_bytes();
    body.extend_from_slice(&hash);
    body
}

#[tokio::test(start_paused = true)]
async fn test_gethash_returns_full_hashes() {
    let Harness {
        manager,
        mut fetches,
        ..
    } = harness();

    let answer = async {
        let fetch = fetches.recv().await.unwrap();
        assert_eq!(
            fetch.request.url.as_str(),
            format!("{PRIMARY}/gethash?{QUERY}")
        );
        assert_eq!(fetch.request.body, b"4:4\nabcd".to_vec());
        fetch.respond(200, &gethash_response("goog-phish-shavar", 7, [0xab; 32]));
    };
    let (result, ()) = tokio::join!(manager.get_full_hashes(vec![*b"abcd"]), answer);

    let hashes = result.unwrap();
    assert_eq!(hashes.len(), 1);
    assert_eq!(hashes[0].list_name, "goog-phish-shavar");
    assert_eq!(hashes[0].add_chunk, 7);
    assert_eq!(hashes[0].hash, [0xab; 32]);
}

#[tokio::test(start_paused = true)]
async fn test_gethash_no_content_is_empty() {
    let Harness {
        manager,
        mut fetches,
        ..
    } = harness();

    let answer = async { fetches.recv().await.unwrap().respond(204, b"") };
    let (result, ()) = tokio::join!(manager.get_full_hashes(vec![*b"abcd"]), answer);
    assert!(result.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_gethash_failures_back_off() {
    let Harness {
        manager,
        mut fetches,
        ..
    } = harness();

    let answer = async { fetches.recv().await.unwrap().respond(500, b"") };
    let (result, ()) = tokio::join!(manager.get_full_hashes(vec![*b"abcd"]), answer);
    assert!(matches!(
        result,
        Err(GetHashError::Fetch(UpdateError::HttpStatus { status: 500, .. }))
    ));

    let result = manager.get_full_hashes(vec![*b"abcd"]).await;
    assert_eq!(
        result,
        Err(GetHashError::BackedOff {
            retry_in: Duration::from_secs(60)
        })
    );
    assert!(fetches.try_recv().is_err());

    tokio::time::advance(Duration::from_secs(60)).await;
    let answer = async {
        fetches
            .recv()
            .await
            .unwrap()
            .fail(NetError::ConnectionReset);
    };
    let (result, ()) = tokio::join!(manager.get_full_hashes(vec![*b"abcd"]), answer);
    assert!(matches!(result, Err(GetHashError::Fetch(UpdateError::Network { .. }))));

    let result = manager.get_full_hashes(vec![*b"abcd"]).await;
    assert_eq!(
        result,
        Err(GetHashError::BackedOff {
            retry_in: Duration::from_secs(30 * 60)
        })
    );

    tokio::time::advance(Duration::from_secs(30 * 60)).await;
    let answer = async { fetches.recv().await.unwrap().respond(200, b"") };
    let (result, ()) = tokio::join!(manager.get_full_hashes(vec![*b"abcd"]), answer);
    assert_eq!(result, Ok(Vec::new()));
}

// ==================== Lifecycle Tests ====================

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_manager() {
    let h = harness();
    let state = h.manager.subscribe();
    h.manager.start();

    h.manager.shutdown().await;
    assert_eq!(*state.borrow(), ManagerState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_dropping_handle_stops_manager() {
    let Harness {
        manager, mut calls, ..
    } = harness();
    let mut state = manager.subscribe();
    manager.force_update(Duration::from_secs(10));

    drop(manager);
    state
        .wait_for(|s| *s == ManagerState::Stopped)
        .await
        .unwrap();
    tokio::time::advance(Duration::from_secs(20)).await;
    assert!(calls.try_recv().is_err());
}
