//! Error taxonomy for the canonicalization pipeline.
//!
//! Four classes, handled differently:
//!
//! 1. **Configuration** — invalid timeframe or backfill policy. Surfaced
//!    before any I/O.
//! 2. **Structural/integrity** — malformed log lines, tampered payloads,
//!    undecodable payloads, missing timestamps. Fatal immediately: once the
//!    raw log cannot be trusted nothing downstream matters.
//! 3. **Consistency** — gaps, duplicate conflicts, late data. These are NOT
//!    raised during detection; they accumulate into status documents and only
//!    the final publication decision raises, as [`PipelineError::FailClosed`]
//!    carrying the full run result for inspection.
//! 4. **Provider** — backfill provider failures, caught per gap and recorded
//!    in the attempt log, never run-fatal.

use crate::pipeline::RunResult;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reason code attached to a fail-closed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailClosedReason {
    /// Two records shared `(stream_id, ingest_seq)` with different payloads.
    /// Never resolvable by backfill.
    DuplicateIngestSeqConflict,
    /// Ingestion or bucket gaps remained after backfill was exhausted.
    GapUnresolved,
}

impl std::fmt::Display for FailClosedReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateIngestSeqConflict => write!(f, "duplicate_ingest_seq_conflict"),
            Self::GapUnresolved => write!(f, "gap_unresolved"),
        }
    }
}

/// All errors the pipeline can raise.
#[derive(Debug, Error)]
pub enum PipelineError {
    // -- configuration ------------------------------------------------------
    #[error("timeframe_ms must be positive, got {0}")]
    InvalidTimeframe(i64),

    #[error("invalid backfill policy: {0}")]
    InvalidBackfillPolicy(String),

    // -- structural / integrity --------------------------------------------
    #[error("invalid transport/source pairing: transport={transport}, source={provenance}")]
    InvalidTransportSource { transport: String, provenance: String },

    #[error("unknown feed channel: {0:?}")]
    UnknownFeedChannel(String),

    #[error("malformed log entry at line {line}: {reason}")]
    MalformedLogEntry { line: usize, reason: String },

    #[error(
        "payload tampered for stream {stream_id} ingest_seq {ingest_seq}: \
         stored sha256 {stored} != recomputed {recomputed}"
    )]
    PayloadTampered {
        stream_id: String,
        ingest_seq: u64,
        stored: String,
        recomputed: String,
    },

    #[error("payload decode error for stream {stream_id} ingest_seq {ingest_seq}: {reason}")]
    PayloadDecodeError {
        stream_id: String,
        ingest_seq: u64,
        reason: String,
    },

    #[error("no usable event timestamp for stream {stream_id} ingest_seq {ingest_seq}")]
    MissingEventTimestamp { stream_id: String, ingest_seq: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // -- consistency (publication gate) ------------------------------------
    /// Publication was blocked. The boxed result carries the complete gap and
    /// revision picture so callers can inspect before handling.
    #[error("publication blocked ({reason}) for run {}", .result.run_id)]
    FailClosed {
        reason: FailClosedReason,
        result: Box<RunResult>,
    },
}

impl PipelineError {
    /// The fail-closed reason, if this error is the publication gate refusing.
    pub fn fail_closed_reason(&self) -> Option<FailClosedReason> {
        match self {
            Self::FailClosed { reason, .. } => Some(*reason),
            _ => None,
        }
    }

    /// The accumulated run result, if this error carries one.
    pub fn run_result(&self) -> Option<&RunResult> {
        match self {
            Self::FailClosed { result, .. } => Some(result),
            _ => None,
        }
    }
}
