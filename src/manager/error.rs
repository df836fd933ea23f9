//! Error types for update cycles and get-hash requests.
//!
//! None of these escape as panics or aborted tasks: update failures end the
//! cycle with `update_finished(false)` and a backoff reschedule, and get-hash
//! failures are returned to the caller.

use std::time::Duration;

use thiserror::Error;

use crate::delegate::StorageError;
use crate::protocol::{FailureClass, ParseError};
use crate::transport::NetError;

/// Why one step of an update cycle (or a get-hash request) failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpdateError {
    /// No HTTP response arrived.
    #[error("network error fetching {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: NetError,
    },

    /// The per-fetch timeout fired before a response arrived.
    #[error("timeout fetching {url}")]
    Timeout { url: String },

    /// The server answered with a status other than 200.
    #[error("HTTP {status} fetching {url}")]
    HttpStatus { url: String, status: u16 },

    /// The server answered 200 with a body that failed to parse.
    #[error("malformed response from {url}: {source}")]
    Protocol {
        url: String,
        #[source]
        source: ParseError,
    },

    /// The storage delegate could not report coverage.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// A request URL could not be assembled.
    #[error("invalid URL {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
}

impl UpdateError {
    pub fn network(url: impl Into<String>, source: NetError) -> Self {
        Self::Network {
            url: url.into(),
            source,
        }
    }

    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
        }
    }

    pub fn protocol(url: impl Into<String>, source: ParseError) -> Self {
        Self::Protocol {
            url: url.into(),
            source,
        }
    }

    pub fn invalid_url(url: impl Into<String>, source: url::ParseError) -> Self {
        Self::InvalidUrl {
            url: url.into(),
            source,
        }
    }

    /// Backup class for a failed primary update, or `None` if no backup applies.
    ///
    /// | Error | Class |
    /// |-------|-------|
    /// | Network (link down, DNS) | Network |
    /// | Network (other) | Connect |
    /// | Timeout | Connect |
    /// | HttpStatus | Http |
    /// | Protocol | Http |
    /// | Storage, InvalidUrl | none |
    #[must_use]
    pub fn failure_class(&self) -> Option<FailureClass> {
        match self {
            Self::Network { source, .. } => Some(source.failure_class()),
            Self::Timeout { .. } => Some(FailureClass::Connect),
            Self::HttpStatus { .. } | Self::Protocol { .. } => Some(FailureClass::Http),
            Self::Storage(_) | Self::InvalidUrl { .. } => None,
        }
    }
}

/// Why a get-hash request produced no result.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GetHashError {
    /// Earlier failures put the get-hash track into backoff.
    #[error("get-hash backing off for another {}s", retry_in.as_secs())]
    BackedOff { retry_in: Duration },

    /// The request was sent and failed.
    #[error(transparent)]
    Fetch(#[from] UpdateError),

    /// The manager shut down before answering.
    #[error("protocol manager stopped")]
    ManagerStopped,
}
