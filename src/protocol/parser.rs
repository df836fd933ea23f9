//! Decoder for the line-oriented update, chunk, and get-hash responses.
//!
//! Every line is `\n`-terminated. Chunk headers (`a:`/`s:`) and get-hash
//! headers are followed by a raw binary payload of the advertised length.
//! Parsing is all-or-nothing: one bad line rejects the whole body and the
//! caller discards it. An empty body is valid and carries no commands.

use std::time::Duration;

use tracing::{debug, instrument};

use super::chunk::{Chunk, ChunkDelete, ChunkEntry, ChunkKind, FullHash, HashPrefix};
use super::constants::{FULL_HASH_LEN, PREFIX_LEN};
use super::error::ParseError;
use super::ranges::parse_chunk_ranges;

/// A `u:` command: fetch `url` and apply its chunks to `list_name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRedirect {
    /// List the fetched chunks belong to.
    pub list_name: String,
    /// Target exactly as sent by the server (possibly schemeless).
    pub url: String,
}

/// Inline chunks for one list, in the order they appeared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListChunks {
    pub list_name: String,
    pub chunks: Vec<Chunk>,
}

/// Commands decoded from an update response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateResponse {
    /// Server-advertised poll interval (`n:`).
    pub next_update_interval: Option<Duration>,
    /// Whether the server asked for a full database reset (`r:`).
    pub reset: bool,
    /// Chunk deletions (`ad:` / `sd:`).
    pub deletes: Vec<ChunkDelete>,
    /// Inline chunk data (`a:` / `s:`).
    pub chunks: Vec<ListChunks>,
    /// Redirects to fetch, in order (`u:`).
    pub redirects: Vec<ChunkRedirect>,
}

/// Byte cursor over a response body.
struct Reader<'a> {
    body: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(body: &'a [u8]) -> Self {
        Self { body, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.body.len()
    }

    /// Returns the next line (without `\n`) and its starting offset.
    fn line(&mut self) -> Result<(usize, &'a str), ParseError> {
        let offset = self.pos;
        let rest = &self.body[offset..];
        let end = rest
            .iter()
            .position(|&b| b == b'\n')
            .ok_or(ParseError::UnterminatedLine { offset })?;
        self.pos += end + 1;
        let line = std::str::from_utf8(&rest[..end]).map_err(|_| ParseError::NotText { offset })?;
        Ok((offset, line))
    }

    /// Consumes exactly `len` raw bytes.
    fn take(&mut self, len: usize) -> Result<(usize, &'a [u8]), ParseError> {
        let offset = self.pos;
        let available = self.body.len() - offset;
        if len > available {
            return Err(ParseError::Truncated {
                offset,
                needed: len,
                available,
            });
        }
        self.pos += len;
        Ok((offset, &self.body[offset..offset + len]))
    }
}

/// Parses an update (`/downloads`) response.
///
/// # Errors
///
/// Returns [`ParseError`] if any line is unknown or malformed.
#[instrument(level = "debug", skip(body), fields(len = body.len()))]
pub fn parse_update_response(body: &[u8]) -> Result<UpdateResponse, ParseError> {
    let mut reader = Reader::new(body);
    let mut response = UpdateResponse::default();
    let mut list: Option<String> = None;

    while !reader.is_empty() {
        let (offset, line) = reader.line()?;
        let (command, value) = line
            .split_once(':')
            .ok_or_else(|| ParseError::unknown(offset, line))?;

        match command {
            "n" => {
                let secs: u64 = value.parse().map_err(|_| ParseError::number(offset, value))?;
                response.next_update_interval = Some(Duration::from_secs(secs));
            }
            "r" => response.reset = true,
            "i" => {
                if value.is_empty() {
                    return Err(ParseError::unknown(offset, line));
                }
                list = Some(value.to_string());
            }
            "u" => {
                let list_name = current_list(list.as_ref(), offset, "u")?;
                // Optional `,<mac>` suffix is not verified.
                let url = value.split(',').next().unwrap_or_default();
                if url.is_empty() {
                    return Err(ParseError::unknown(offset, line));
                }
                response.redirects.push(ChunkRedirect {
                    list_name,
                    url: url.to_string(),
                });
            }
            "ad" | "sd" => {
                let (kind, name) = if command == "ad" {
                    (ChunkKind::Add, "ad")
                } else {
                    (ChunkKind::Sub, "sd")
                };
                let list_name = current_list(list.as_ref(), offset, name)?;
                response.deletes.push(ChunkDelete {
                    list_name,
                    kind,
                    ranges: parse_chunk_ranges(value)?,
                });
            }
            "a" | "s" => {
                let kind = if command == "a" {
                    ChunkKind::Add
                } else {
                    ChunkKind::Sub
                };
                let list_name = current_list(list.as_ref(), offset, kind.as_str())?;
                let chunk = read_chunk(&mut reader, offset, kind, value)?;
                match response.chunks.last_mut() {
                    Some(last) if last.list_name == list_name => last.chunks.push(chunk),
                    _ => response.chunks.push(ListChunks {
                        list_name,
                        chunks: vec![chunk],
                    }),
                }
            }
            _ => return Err(ParseError::unknown(offset, line)),
        }
    }

    debug!(
        reset = response.reset,
        redirects = response.redirects.len(),
        deletes = response.deletes.len(),
        "parsed update response"
    );
    Ok(response)
}

/// Parses a redirect (chunk data) response: only `a:` / `s:` records.
///
/// # Errors
///
/// Returns [`ParseError`] if any record is malformed.
#[instrument(level = "debug", skip(body), fields(len = body.len()))]
pub fn parse_chunk_response(body: &[u8]) -> Result<Vec<Chunk>, ParseError> {
    let mut reader = Reader::new(body);
    let mut chunks = Vec::new();

    while !reader.is_empty() {
        let (offset, line) = reader.line()?;
        let kind = match line.split_once(':') {
            Some(("a", _)) => ChunkKind::Add,
            Some(("s", _)) => ChunkKind::Sub,
            _ => return Err(ParseError::unknown(offset, line)),
        };
        let header = &line[2..];
        chunks.push(read_chunk(&mut reader, offset, kind, header)?);
    }

    Ok(chunks)
}

/// Parses a get-hash response into full-hash matches.
///
/// # Errors
///
/// Returns [`ParseError`] if a header is malformed or a payload is not a
/// whole number of full hashes.
#[instrument(level = "debug", skip(body), fields(len = body.len()))]
pub fn parse_gethash_response(body: &[u8]) -> Result<Vec<FullHash>, ParseError> {
    let mut reader = Reader::new(body);
    let mut hashes = Vec::new();

    while !reader.is_empty() {
        let (offset, line) = reader.line()?;
        let mut parts = line.rsplitn(3, ':');
        let (Some(len), Some(add_chunk), Some(list_name)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(ParseError::unknown(offset, line));
        };
        if list_name.is_empty() {
            return Err(ParseError::unknown(offset, line));
        }
        let add_chunk: u32 = add_chunk
            .parse()
            .map_err(|_| ParseError::number(offset, add_chunk))?;
        let len: usize = len.parse().map_err(|_| ParseError::number(offset, len))?;
        if len % FULL_HASH_LEN != 0 {
            return Err(ParseError::UnsupportedHashLength {
                offset,
                hash_len: len,
            });
        }

        let (_, data) = reader.take(len)?;
        for raw in data.chunks_exact(FULL_HASH_LEN) {
            let mut hash = [0u8; FULL_HASH_LEN];
            hash.copy_from_slice(raw);
            hashes.push(FullHash {
                list_name: list_name.to_string(),
                add_chunk,
                hash,
            });
        }
    }

    Ok(hashes)
}

fn current_list(
    list: Option<&String>,
    offset: usize,
    command: &'static str,
) -> Result<String, ParseError> {
    list.cloned()
        .ok_or(ParseError::MissingList { offset, command })
}

/// Reads `<num>:<hash_len>:<data_len>` and the payload that follows it.
fn read_chunk(
    reader: &mut Reader<'_>,
    offset: usize,
    kind: ChunkKind,
    header: &str,
) -> Result<Chunk, ParseError> {
    let mut fields = header.split(':');
    let (Some(number), Some(hash_len), Some(data_len), None) =
        (fields.next(), fields.next(), fields.next(), fields.next())
    else {
        return Err(ParseError::unknown(offset, header));
    };

    let number: u32 = number.parse().map_err(|_| ParseError::number(offset, number))?;
    let hash_len: usize = hash_len
        .parse()
        .map_err(|_| ParseError::number(offset, hash_len))?;
    let data_len: usize = data_len
        .parse()
        .map_err(|_| ParseError::number(offset, data_len))?;

    if hash_len != PREFIX_LEN && hash_len != FULL_HASH_LEN {
        return Err(ParseError::UnsupportedHashLength { offset, hash_len });
    }

    let (data_offset, data) = reader.take(data_len)?;
    let entries = decode_entries(kind, hash_len, data, data_offset)?;
    Ok(Chunk {
        number,
        kind,
        hash_len,
        entries,
    })
}

/// Decodes `host(4) count(1) ...` records from a chunk payload.
fn decode_entries(
    kind: ChunkKind,
    hash_len: usize,
    data: &[u8],
    base_offset: usize,
) -> Result<Vec<ChunkEntry>, ParseError> {
    let mut payload = Reader::new(data);
    let mut entries = Vec::new();
    let relocate = |error: ParseError| match error {
        ParseError::Truncated {
            offset,
            needed,
            available,
        } => ParseError::Truncated {
            offset: base_offset + offset,
            needed,
            available,
        },
        other => other,
    };

    while !payload.is_empty() {
        let (_, header) = payload.take(PREFIX_LEN + 1).map_err(relocate)?;
        let mut host: HashPrefix = [0; PREFIX_LEN];
        host.copy_from_slice(&header[..PREFIX_LEN]);
        let count = header[PREFIX_LEN];

        match (kind, count) {
            (ChunkKind::Add, 0) => entries.push(ChunkEntry {
                host,
                add_chunk: None,
                prefix: Vec::new(),
            }),
            (ChunkKind::Add, _) => {
                for _ in 0..count {
                    let (_, prefix) = payload.take(hash_len).map_err(relocate)?;
                    entries.push(ChunkEntry {
                        host,
                        add_chunk: None,
                        prefix: prefix.to_vec(),
                    });
                }
            }
            (ChunkKind::Sub, 0) => {
                let add_chunk = read_u32(&mut payload).map_err(relocate)?;
                entries.push(ChunkEntry {
                    host,
                    add_chunk: Some(add_chunk),
                    prefix: Vec::new(),
                });
            }
            (ChunkKind::Sub, _) => {
                for _ in 0..count {
                    let add_chunk = read_u32(&mut payload).map_err(relocate)?;
                    let (_, prefix) = payload.take(hash_len).map_err(relocate)?;
                    entries.push(ChunkEntry {
                        host,
                        add_chunk: Some(add_chunk),
                        prefix: prefix.to_vec(),
                    });
                }
            }
        }
    }

    Ok(entries)
}

fn read_u32(reader: &mut Reader<'_>) -> Result<u32, ParseError> {
    let (_, raw) = reader.take(4)?;
    Ok(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
}
