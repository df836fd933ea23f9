//! Error types for the protocol layer.
//!
//! [`ParseError`] describes why a response body was rejected. A single bad
//! line rejects the whole body, so every variant carries the byte offset of
//! the offending line for debugging.

use thiserror::Error;

/// Reasons a response body failed to parse.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// A line did not end with `\n` before the body ended.
    #[error("unterminated line at offset {offset}")]
    UnterminatedLine {
        /// Byte offset where the line starts.
        offset: usize,
    },

    /// A line is not valid UTF-8.
    #[error("non-text line at offset {offset}")]
    NotText {
        /// Byte offset where the line starts.
        offset: usize,
    },

    /// A line matched none of the known commands.
    #[error("unknown command {line:?} at offset {offset}")]
    UnknownCommand {
        /// Byte offset where the line starts.
        offset: usize,
        /// The rejected line (truncated to 64 bytes).
        line: String,
    },

    /// A list-scoped command appeared before any `i:` line.
    #[error("{command:?} at offset {offset} has no list context")]
    MissingList {
        /// Byte offset where the line starts.
        offset: usize,
        /// The command prefix (`u`, `a`, `ad`, ...).
        command: &'static str,
    },

    /// A numeric field could not be parsed.
    #[error("invalid number {value:?} at offset {offset}")]
    InvalidNumber {
        /// Byte offset where the line starts.
        offset: usize,
        /// The rejected field.
        value: String,
    },

    /// A chunk-range field is not in `lo-hi,n,...` form.
    #[error("invalid chunk ranges {value:?}")]
    InvalidRanges {
        /// The rejected range string.
        value: String,
    },

    /// Hash length other than a prefix or a full hash.
    #[error("unsupported hash length {hash_len} at offset {offset}")]
    UnsupportedHashLength {
        /// Byte offset where the header starts.
        offset: usize,
        /// The advertised hash length.
        hash_len: usize,
    },

    /// Payload is shorter than its header advertised, or its entries overrun it.
    #[error("truncated payload at offset {offset}: need {needed} bytes, have {available}")]
    Truncated {
        /// Byte offset where the payload starts.
        offset: usize,
        /// Bytes required.
        needed: usize,
        /// Bytes remaining.
        available: usize,
    },
}

impl ParseError {
    pub(crate) fn unknown(offset: usize, line: &str) -> Self {
        let line = line.chars().take(64).collect();
        Self::UnknownCommand { offset, line }
    }

    pub(crate) fn number(offset: usize, value: &str) -> Self {
        Self::InvalidNumber {
            offset,
            value: value.to_string(),
        }
    }
}

/// Errors raised while validating a [`ProtocolConfig`](super::ProtocolConfig).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A required text field is empty.
    #[error("config field `{field}` must not be empty")]
    Empty {
        /// The offending field name.
        field: &'static str,
    },

    /// A URL prefix is not an absolute http(s) URL.
    #[error("config field `{field}` is not a valid http(s) URL prefix: {value}")]
    InvalidPrefix {
        /// The offending field name.
        field: &'static str,
        /// The rejected value.
        value: String,
    },
}
