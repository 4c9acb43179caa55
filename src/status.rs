//! Status Documents & Manifest
//!
//! Immutable, content-addressed documents produced once per canonicalization
//! run — never mutated, always fully regenerated. The manifest carries the
//! SHA-256 digest of every artifact it references plus the raw-log and config
//! digests, so for an unchanged raw log, config, and run id the manifest
//! reproduces byte for byte. No wall-clock value appears anywhere in these
//! documents.

use serde::{Deserialize, Serialize};

use crate::backfill::BackfillSummary;
use crate::canonical::LateEvent;
use crate::gaps::{BucketGap, IngestionGap};
use crate::loader::DuplicateConflict;

pub const GAP_STATUS_SCHEMA: &str = "gap_status.v1";
pub const REVISION_STATUS_SCHEMA: &str = "revision_status.v1";
pub const MANIFEST_SCHEMA: &str = "canonical_manifest.v1";
pub const EVENTS_SCHEMA: &str = "canonical_events.v1";
pub const BARS_SCHEMA: &str = "canonical_ohlcv.v1";

pub const GAP_STATUS_OK: &str = "OK";
pub const GAP_STATUS_UNRESOLVED: &str = "GAP_UNRESOLVED";
pub const REVISION_STATUS_OK: &str = "OK";
pub const REVISION_STATUS_CANDIDATE: &str = "REVISION_CANDIDATE";

/// Complete gap and conflict picture for one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GapStatus {
    pub schema_version: String,
    /// `OK` or `GAP_UNRESOLVED`.
    pub status: String,
    pub ingestion_gaps: Vec<IngestionGap>,
    pub bucket_gaps: Vec<BucketGap>,
    pub duplicate_ingest_seq_conflicts: Vec<DuplicateConflict>,
    pub backfill: BackfillSummary,
}

impl GapStatus {
    pub fn build(
        ingestion_gaps: Vec<IngestionGap>,
        bucket_gaps: Vec<BucketGap>,
        conflicts: Vec<DuplicateConflict>,
        backfill: BackfillSummary,
    ) -> Self {
        let clean = ingestion_gaps.is_empty() && bucket_gaps.is_empty() && conflicts.is_empty();
        Self {
            schema_version: GAP_STATUS_SCHEMA.to_string(),
            status: if clean { GAP_STATUS_OK } else { GAP_STATUS_UNRESOLVED }.to_string(),
            ingestion_gaps,
            bucket_gaps,
            duplicate_ingest_seq_conflicts: conflicts,
            backfill,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.status == GAP_STATUS_OK
    }
}

/// Late-data picture for one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionStatus {
    pub schema_version: String,
    /// `OK` or `REVISION_CANDIDATE`.
    pub status: String,
    pub late_event_count: u64,
    pub late_events: Vec<LateEvent>,
}

impl RevisionStatus {
    pub fn build(late_events: Vec<LateEvent>) -> Self {
        Self {
            schema_version: REVISION_STATUS_SCHEMA.to_string(),
            status: if late_events.is_empty() {
                REVISION_STATUS_OK
            } else {
                REVISION_STATUS_CANDIDATE
            }
            .to_string(),
            late_event_count: late_events.len() as u64,
            late_events,
        }
    }
}

/// Digest entry for one written artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactDigest {
    pub name: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Record counts rolled into the manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestCounts {
    pub deduplicated_records: u64,
    pub idempotent_duplicates: u64,
    pub duplicate_conflicts: u64,
    pub canonical_events: u64,
    pub late_events: u64,
    pub bars: u64,
}

/// Content-addressed description of one canonicalization run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub schema_version: String,
    pub run_id: String,
    /// `PUBLISHED` or `FAIL_CLOSED`.
    pub status: String,
    pub timeframe_ms: i64,
    pub raw_log_sha256: String,
    pub config_sha256: String,
    /// Schema versions of the artifacts this manifest describes.
    pub events_schema: String,
    pub bars_schema: String,
    /// The total order applied to canonical events.
    pub ordering_rule: String,
    /// The bucketing function applied to event timestamps.
    pub bucketing_rule: String,
    pub counts: ManifestCounts,
    pub backfill: BackfillSummary,
    /// Digest of every artifact written for this run, sorted by name.
    pub artifacts: Vec<ArtifactDigest>,
}

pub const MANIFEST_STATUS_PUBLISHED: &str = "PUBLISHED";
pub const MANIFEST_STATUS_FAIL_CLOSED: &str = "FAIL_CLOSED";

pub const ORDERING_RULE: &str = "(event_ts_ms, ingest_seq, stream_id)";
pub const BUCKETING_RULE: &str = "bucket_start_ms = floor(event_ts_ms / timeframe_ms) * timeframe_ms";

// =============================================================================
// TESTS
// =============================================================================
