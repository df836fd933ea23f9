//! Production [`Transport`] backed by `reqwest`.

use std::error::Error as _;
use std::io;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::{CACHE_CONTROL, PRAGMA};
use tracing::{debug, instrument};

use super::{FetchMethod, FetchRequest, FetchResponse, NetError, Transport};

/// Default HTTP connect timeout (10 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default whole-request timeout (60 seconds). The manager applies its own,
/// shorter per-fetch timeout on top of this.
pub const READ_TIMEOUT_SECS: u64 = 60;

/// HTTP transport with connection pooling.
///
/// Create once and share behind an `Arc`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// Creates a transport with default timeouts.
    ///
    /// # Errors
    ///
    /// Returns the reqwest error if the client cannot be built (TLS backend
    /// initialization failure).
    pub fn new() -> Result<Self, reqwest::Error> {
        Self::with_timeouts(CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS)
    }

    /// Creates a transport with explicit timeouts in seconds.
    ///
    /// # Errors
    ///
    /// Returns the reqwest error if the client cannot be built.
    pub fn with_timeouts(connect_timeout_secs: u64, read_timeout_secs: u64) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(connect_timeout_secs))
            .timeout(Duration::from_secs(read_timeout_secs))
            .gzip(true)
            .user_agent(default_user_agent())
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    #[instrument(skip(self, request), fields(url = %request.url, method = ?request.method))]
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, NetError> {
        let mut builder = match request.method {
            FetchMethod::Get => self.client.get(request.url),
            FetchMethod::Post => self.client.post(request.url).body(request.body),
        };
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if request.load_flags.disable_cache {
            builder = builder
                .header(CACHE_CONTROL, "no-cache")
                .header(PRAGMA, "no-cache");
        }

        let response = builder.send().await.map_err(|e| classify_reqwest_error(&e))?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| classify_reqwest_error(&e))?;

        debug!(status, bytes = body.len(), "fetch complete");
        Ok(FetchResponse::new(status, body.to_vec()))
    }
}

fn default_user_agent() -> String {
    format!("listupdate/{}", env!("CARGO_PKG_VERSION"))
}

/// Maps a reqwest failure onto a [`NetError`] by walking its source chain.
fn classify_reqwest_error(error: &reqwest::Error) -> NetError {
    if error.is_timeout() {
        return NetError::TimedOut;
    }

    let mut source = error.source();
    while let Some(cause) = source {
        if let Some(io_error) = cause.downcast_ref::<io::Error>()
            && let Some(net_error) = classify_io_error(io_error)
        {
            return net_error;
        }
        let text = cause.to_string().to_lowercase();
        if text.contains("dns error") || text.contains("failed to lookup address") {
            return NetError::NameNotResolved(cause.to_string());
        }
        source = cause.source();
    }

    if error.is_connect() {
        NetError::ConnectionFailed(error.to_string())
    } else {
        NetError::Other(error.to_string())
    }
}

fn classify_io_error(error: &io::Error) -> Option<NetError> {
    match error.kind() {
        io::ErrorKind::ConnectionReset => Some(NetError::ConnectionReset),
        io::ErrorKind::ConnectionRefused => Some(NetError::ConnectionRefused),
        io::ErrorKind::ConnectionAborted => Some(NetError::ConnectionAborted),
        io::ErrorKind::TimedOut => Some(NetError::TimedOut),
        io::ErrorKind::NetworkUnreachable
        | io::ErrorKind::HostUnreachable
        | io::ErrorKind::NetworkDown => Some(NetError::InternetDisconnected),
        _ => None,
    }
}
