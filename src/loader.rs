//! Record Loader & Deduplicator
//!
//! Re-reads the raw capture log, verifies per-record integrity, and collapses
//! repeated `(stream_id, ingest_seq)` deliveries.
//!
//! # Classification
//!
//! - Same key, same payload hash: the same delivery retried. The first copy
//!   is kept, the repeat is counted as an idempotent duplicate and dropped.
//! - Same key, different payload hash: a conflict. Never resolved by
//!   "latest wins" — conflicts are collected and force fail-closed downstream
//!   regardless of every other check.
//!
//! Structural failures (unparseable line, missing field, payload hash
//! mismatch) abort immediately: the source-of-truth log cannot be trusted.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, warn};

use crate::capture::RawRecord;
use crate::codec;
use crate::error::PipelineError;

/// Two records shared a `(stream_id, ingest_seq)` key with different payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateConflict {
    pub stream_id: String,
    pub ingest_seq: u64,
    pub first_payload_sha256: String,
    pub conflicting_payload_sha256: String,
}

/// Result of loading one raw log.
#[derive(Debug, Default)]
pub struct LoadedLog {
    /// Kept records, sorted by `(stream_id, ingest_seq)`.
    pub records: Vec<RawRecord>,
    /// Irreconcilable same-key-different-payload pairs.
    pub conflicts: Vec<DuplicateConflict>,
    /// Same-key-same-payload repeats that were dropped.
    pub idempotent_duplicates: u64,
}

/// Load and verify every record in the log at `path`.
///
/// A missing file is an empty log. Every line must parse as a well-formed
/// record and every stored `payload_sha256` must match the hash recomputed
/// from the stored bytes.
pub fn load(path: &Path) -> Result<LoadedLog, PipelineError> {
    let mut out = LoadedLog::default();
    if !path.exists() {
        return Ok(out);
    }

    let contents = std::fs::read_to_string(path)?;
    let mut first_hash: HashMap<(String, u64), String> = HashMap::new();

    for (idx, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let value: Value =
            serde_json::from_str(line).map_err(|e| PipelineError::MalformedLogEntry {
                line: idx + 1,
                reason: e.to_string(),
            })?;
        let record = RawRecord::from_wire(&value, idx + 1)?;

        let recomputed = codec::sha256_hex(&record.payload);
        if recomputed != record.payload_sha256 {
            return Err(PipelineError::PayloadTampered {
                stream_id: record.stream_id,
                ingest_seq: record.ingest_seq,
                stored: record.payload_sha256,
                recomputed,
            });
        }

        let key = (record.stream_id.clone(), record.ingest_seq);
        match first_hash.get(&key) {
            None => {
                first_hash.insert(key, record.payload_sha256.clone());
                out.records.push(record);
            }
            Some(kept) if *kept == record.payload_sha256 => {
                out.idempotent_duplicates += 1;
                debug!(
                    stream = %key.0,
                    ingest_seq = key.1,
                    "idempotent duplicate dropped"
                );
            }
            Some(kept) => {
                warn!(
                    stream = %key.0,
                    ingest_seq = key.1,
                    first = %kept,
                    conflicting = %record.payload_sha256,
                    "duplicate ingest_seq conflict"
                );
                out.conflicts.push(DuplicateConflict {
                    stream_id: key.0,
                    ingest_seq: key.1,
                    first_payload_sha256: kept.clone(),
                    conflicting_payload_sha256: record.payload_sha256,
                });
            }
        }
    }

    out.records
        .sort_by(|a, b| (a.stream_id.as_str(), a.ingest_seq).cmp(&(b.stream_id.as_str(), b.ingest_seq)));
    out.conflicts
        .sort_by(|a, b| (a.stream_id.as_str(), a.ingest_seq).cmp(&(b.stream_id.as_str(), b.ingest_seq)));
    Ok(out)
}

// =============================================================================
// TESTS
// =============================================================================
