//! Compact chunk-range notation (`1,4,6,8-20,99`).
//!
//! Coverage strings sent in update requests and the `ad:`/`sd:` delete
//! commands both use this notation: a comma-separated ascending list of
//! single chunk numbers or inclusive `lo-hi` runs. The empty string means
//! "no chunks".

use std::fmt;

use super::error::ParseError;

/// An inclusive run of chunk numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRange {
    /// First chunk number in the run.
    pub start: u32,
    /// Last chunk number in the run (inclusive).
    pub stop: u32,
}

impl ChunkRange {
    /// Creates a run covering `start..=stop`.
    #[must_use]
    pub fn new(start: u32, stop: u32) -> Self {
        Self { start, stop }
    }

    /// Creates a run covering a single chunk.
    #[must_use]
    pub fn single(chunk: u32) -> Self {
        Self::new(chunk, chunk)
    }

    /// Returns true if `chunk` falls inside this run.
    #[must_use]
    pub fn contains(&self, chunk: u32) -> bool {
        (self.start..=self.stop).contains(&chunk)
    }
}

impl fmt::Display for ChunkRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.stop {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.stop)
        }
    }
}

/// Collapses chunk numbers into ascending runs.
///
/// Input order and duplicates do not matter.
#[must_use]
pub fn collapse_chunks(chunks: &[u32]) -> Vec<ChunkRange> {
    let mut sorted = chunks.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut ranges: Vec<ChunkRange> = Vec::new();
    for chunk in sorted {
        match ranges.last_mut() {
            Some(last) if last.stop.checked_add(1) == Some(chunk) => last.stop = chunk,
            _ => ranges.push(ChunkRange::single(chunk)),
        }
    }
    ranges
}

/// Formats runs as `1,4,6,8-20,99`.
#[must_use]
pub fn ranges_to_string(ranges: &[ChunkRange]) -> String {
    ranges
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// Formats a set of chunk numbers in compact notation.
#[must_use]
pub fn format_chunk_ranges(chunks: &[u32]) -> String {
    ranges_to_string(&collapse_chunks(chunks))
}

/// Parses compact notation into runs.
///
/// # Errors
///
/// Returns [`ParseError::InvalidRanges`] when a token is not a number or a
/// `lo-hi` pair with `lo <= hi`, or when a run does not start after the end
/// of the previous one.
pub fn parse_chunk_ranges(value: &str) -> Result<Vec<ChunkRange>, ParseError> {
    if value.is_empty() {
        return Ok(Vec::new());
    }

    let invalid = || ParseError::InvalidRanges {
        value: value.to_string(),
    };

    let mut ranges: Vec<ChunkRange> = Vec::new();
    for token in value.split(',') {
        let range = match token.split_once('-') {
            Some((lo, hi)) => ChunkRange::new(
                lo.parse().map_err(|_| invalid())?,
                hi.parse().map_err(|_| invalid())?,
            ),
            None => ChunkRange::single(token.parse().map_err(|_| invalid())?),
        };
        if range.start > range.stop {
            return Err(invalid());
        }
        if ranges.last().is_some_and(|last| range.start <= last.stop) {
            return Err(invalid());
        }
        ranges.push(range);
    }
    Ok(ranges)
}
