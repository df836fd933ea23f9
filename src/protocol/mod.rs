//! Wire-level pieces of the list update protocol.
//!
//! Everything in this module is synchronous and free of I/O:
//!
//! - [`BackoffPolicy`] / [`GetHashBackoff`] - failure-driven retry intervals
//! - [`RequestBuilder`] - update, get-hash, and redirect requests
//! - [`parse_update_response`] and friends - response decoding
//! - [`ProtocolConfig`] - service identity and endpoints
//!
//! The stateful update cycle lives in [`crate::manager`].

mod backoff;
mod chunk;
mod config;
pub mod constants;
mod error;
mod parser;
pub mod ranges;
mod request;

pub use backoff::{BackoffPolicy, GetHashBackoff};
pub use chunk::{
    Chunk, ChunkDelete, ChunkEntry, ChunkKind, FullHash, FullHashValue, HashPrefix, ListCoverage,
};
pub use config::{FailureClass, ProtocolConfig, ProtocolConfigBuilder};
pub use error::{ConfigError, ParseError};
pub use parser::{
    ChunkRedirect, ListChunks, UpdateResponse, parse_chunk_response, parse_gethash_response,
    parse_update_response,
};
pub use ranges::{ChunkRange, format_chunk_ranges, parse_chunk_ranges};
pub use request::{RequestBuilder, format_list, gethash_body, update_body};
