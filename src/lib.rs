//! List Update Core Library
//!
//! Client side of an incremental denylist update protocol. The library keeps
//! a set of lists current by polling an update server on a randomized,
//! backoff-aware schedule, retrying failed polls against backup endpoints,
//! following chunk redirects, and handing every delta to a storage delegate.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`protocol`] - Wire formats, request building, response parsing, backoff
//! - [`manager`] - The update state machine and get-hash requests
//! - [`delegate`] - The storage contract the manager reports to
//! - [`transport`] - The HTTP seam, with a `reqwest` implementation
//! - [`store`] - An in-memory delegate that tracks chunk numbers
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use listupdate_core::{HttpTransport, ManagerOptions, MemoryStore, ProtocolConfig, ProtocolManager};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ProtocolConfig::builder("example", "1.0", "https://lists.example.com/safebrowsing")
//!     .build()?;
//! let store = Arc::new(MemoryStore::new(["goog-phish-shavar"]));
//! let manager = ProtocolManager::spawn(
//!     config,
//!     store,
//!     Arc::new(HttpTransport::new()?),
//!     ManagerOptions::default(),
//! );
//! manager.start();
//! # Ok(())
//! # }
//! ```

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod delegate;
pub mod manager;
pub mod protocol;
pub mod store;
pub mod transport;

// Re-export commonly used types
pub use delegate::{StorageDelegate, StorageError};
pub use manager::{GetHashError, ManagerOptions, ManagerState, ProtocolManager, UpdateError};
pub use protocol::{
    BackoffPolicy, Chunk, ChunkDelete, ChunkKind, ChunkRange, ConfigError, FailureClass, FullHash,
    GetHashBackoff, HashPrefix, ListCoverage, ParseError, ProtocolConfig,
};
pub use store::{MemoryStore, UpdateSummary};
pub use transport::{FetchMethod, FetchRequest, FetchResponse, HttpTransport, NetError, Transport};
