//! JSONL request traces.
//!
//! One JSON object per line:
//!
//! ```text
//! {"id": 0, "arrival_us": 1200, "input_tokens": 512, "output_tokens": 64,
//!  "slo_class": "critical", "prefix_group": 3, "prefix_blocks": 8}
//! ```
//!
//! `slo_class`, `prefix_group` and `prefix_blocks` are optional. Blank lines
//! and lines starting with `#` are skipped. Prefix groups become KV block
//! hashes when a record is turned into a [`Request`]: the first
//! `prefix_blocks` full input blocks hash identically across the group, the
//! rest are unique to the request.

use std::collections::HashSet;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::request::Request;

#[derive(Error, Debug)]
pub enum TraceError {
    #[error("Failed to read trace file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse JSON at line {line}: {source}")]
    JsonParse {
        line: usize,
        source: serde_json::Error,
    },
    #[error("Unsupported trace format: {0}")]
    UnsupportedFormat(String),
    #[error("Duplicate request id {id} at line {line}")]
    DuplicateId { id: u64, line: usize },
    #[error("Request at line {line} needs {tokens} tokens, limit is {}", MAX_REQUEST_TOKENS)]
    TooManyTokens { line: usize, tokens: u64 },
    #[error("Failed to serialize trace record {index}: {source}")]
    JsonWrite {
        index: usize,
        source: serde_json::Error,
    },
}

/// Largest `input_tokens + output_tokens` a trace record may ask for.
pub const MAX_REQUEST_TOKENS: u64 = 1 << 24;

/// One trace line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceRecord {
    /// Defaults to the record's position in the file.
    #[serde(default)]
    pub id: Option<u64>,
    pub arrival_us: u64,
    pub input_tokens: u32,
    pub output_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slo_class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix_group: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix_blocks: Option<u32>,
}

impl TraceRecord {
    /// Build the simulator request, hashing full input blocks of
    /// `block_size` tokens.
    pub fn to_request(&self, fallback_id: u64, block_size: u32) -> Request {
        let id = self.id.unwrap_or(fallback_id);
        let shared = self
            .prefix_group
            .map(|group| (group, self.prefix_blocks.unwrap_or(0)));
        Request {
            id,
            arrival_us: self.arrival_us,
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            slo_class: self.slo_class.clone().unwrap_or_default(),
            prefix_hashes: block_hashes(id, self.input_tokens, block_size, shared),
        }
    }
}

const FNV_OFFSET: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

fn fnv1a(mut hash: u64, bytes: &[u8]) -> u64 {
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Chained hashes of a request's full input blocks.
///
/// Each hash covers its block and everything before it, so two requests
/// share a hash at block `k` only if they share blocks `0..=k`. With
/// `shared = Some((group, n))` the first `n` blocks are derived from the
/// group alone.
pub fn block_hashes(
    request_id: u64,
    input_tokens: u32,
    block_size: u32,
    shared: Option<(u32, u32)>,
) -> Vec<u64> {
    if block_size == 0 {
        return Vec::new();
    }
    let full_blocks = input_tokens / block_size;
    let mut hashes = Vec::with_capacity(full_blocks as usize);
    let mut prev = FNV_OFFSET;
    for block in 0..full_blocks {
        let mut h = fnv1a(prev, &block.to_le_bytes());
        h = match shared {
            Some((group, n)) if block < n => fnv1a(fnv1a(h, b"group"), &group.to_le_bytes()),
            _ => fnv1a(fnv1a(h, b"request"), &request_id.to_le_bytes()),
        };
        hashes.push(h);
        prev = h;
    }
    hashes
}

/// Load a trace file. Only `.jsonl` and `.json` (one object per line) are
/// understood.
pub fn load_trace(path: &Path, block_size: u32) -> Result<Vec<Request>, TraceError> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("jsonl") | Some("json") => load_jsonl(path, block_size),
        other => Err(TraceError::UnsupportedFormat(
            other.unwrap_or("<none>").to_string(),
        )),
    }
}

/// Load a JSONL trace file.
pub fn load_jsonl(path: &Path, block_size: u32) -> Result<Vec<Request>, TraceError> {
    let file = std::fs::File::open(path)?;
    let requests = parse_jsonl(BufReader::new(file), block_size)?;
    info!(path = %path.display(), requests = requests.len(), "loaded trace");
    Ok(requests)
}

/// Parse a JSONL trace from any reader, sorted by arrival then id.
pub fn parse_jsonl<R: Read>(
    reader: BufReader<R>,
    block_size: u32,
) -> Result<Vec<Request>, TraceError> {
    let mut requests = Vec::new();
    let mut seen = HashSet::new();
    for (line_num, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let record: TraceRecord =
            serde_json::from_str(trimmed).map_err(|e| TraceError::JsonParse {
                line: line_num + 1,
                source: e,
            })?;
        let tokens = u64::from(record.input_tokens) + u64::from(record.output_tokens);
        if tokens > MAX_REQUEST_TOKENS {
            return Err(TraceError::TooManyTokens {
                line: line_num + 1,
                tokens,
            });
        }
        let request = record.to_request(requests.len() as u64, block_size);
        if !seen.insert(request.id) {
            return Err(TraceError::DuplicateId {
                id: request.id,
                line: line_num + 1,
            });
        }
        requests.push(request);
    }
    requests.sort_by_key(|r| (r.arrival_us, r.id));
    Ok(requests)
}

/// Write trace records as JSONL.
pub fn write_jsonl(records: &[TraceRecord], path: &Path) -> Result<(), TraceError> {
    let file = std::fs::File::create(path)?;
    let mut writer = std::io::BufWriter::new(file);
    for (index, record) in records.iter().enumerate() {
        serde_json::to_writer(&mut writer, record)
            .map_err(|e| TraceError::JsonWrite { index, source: e })?;
        writeln!(writer)?;
    }
    writer.flush()?;
    Ok(())
}
