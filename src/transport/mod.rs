//! Transport abstraction between the protocol manager and the network.
//!
//! The manager only ever talks to a [`Transport`]; production code uses
//! [`HttpTransport`] and tests substitute scripted implementations.
//!
//! A fetch either yields an HTTP response (any status) or a [`NetError`]
//! describing why no response arrived. Each [`NetError`] maps to a
//! [`FailureClass`] that picks the backup endpoint for a failed update.

pub mod http;

pub use http::HttpTransport;

use async_trait::async_trait;
use thiserror::Error;
use url::Url;

use crate::protocol::FailureClass;

/// HTTP method of a fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMethod {
    Get,
    Post,
}

/// Per-request behavior flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadFlags {
    /// Bypass and do not populate any response cache.
    pub disable_cache: bool,
}

impl LoadFlags {
    /// Flags used by every protocol request.
    pub const DISABLE_CACHE: Self = Self {
        disable_cache: true,
    };
}

/// A request handed to a [`Transport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: Url,
    pub method: FetchMethod,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub load_flags: LoadFlags,
}

/// A completed HTTP exchange. Non-2xx statuses are still responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl FetchResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }
}

/// Why a fetch produced no HTTP response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetError {
    #[error("connection reset")]
    ConnectionReset,

    #[error("connection refused")]
    ConnectionRefused,

    #[error("connection aborted")]
    ConnectionAborted,

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("request timed out")]
    TimedOut,

    #[error("internet disconnected")]
    InternetDisconnected,

    #[error("name not resolved: {0}")]
    NameNotResolved(String),

    #[error("network error: {0}")]
    Other(String),
}

impl NetError {
    /// Backup class for this error: link-down and DNS failures are
    /// network-class, everything else is connect-class.
    #[must_use]
    pub fn failure_class(&self) -> FailureClass {
        match self {
            Self::InternetDisconnected | Self::NameNotResolved(_) => FailureClass::Network,
            Self::ConnectionReset
            | Self::ConnectionRefused
            | Self::ConnectionAborted
            | Self::ConnectionFailed(_)
            | Self::TimedOut
            | Self::Other(_) => FailureClass::Connect,
        }
    }
}

/// Executes protocol requests.
///
/// Implementations must be cheap to share behind an `Arc`; the manager
/// spawns one task per fetch.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Performs the request and returns the response or the network failure.
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, NetError>;
}
