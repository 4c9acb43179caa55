//! Canonicalization Run
//!
//! Single-threaded, run-to-completion driver: load the raw log, attempt
//! bounded backfill, derive canonical events and bars, then decide
//! publication. Everything is recomputed from the log every run; partial
//! progress is never written — artifacts land only in the final publication
//! step.
//!
//! # Fail-closed
//!
//! Publication is refused iff any ingestion gap, bucket gap, or duplicate
//! conflict remains. A refused run still writes the gap status, revision
//! status, and manifest (and deletes any stale canonical artifacts), then
//! raises [`PipelineError::FailClosed`] carrying the full result.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::backfill::{
    BackfillAttempt, BackfillOutcome, BackfillPolicy, BackfillProvider, BackfillState,
    BackfillSummary,
};
use crate::bars;
use crate::canonical::{self, CanonicalEvent, LateEvent};
use crate::capture::{FeedChannel, IngestionSession};
use crate::codec;
use crate::error::{FailClosedReason, PipelineError};
use crate::gaps::{self, BucketGap, IngestionGap};
use crate::loader::{self, DuplicateConflict};
use crate::status::{
    ArtifactDigest, GapStatus, Manifest, ManifestCounts, RevisionStatus, BARS_SCHEMA,
    BUCKETING_RULE, EVENTS_SCHEMA, MANIFEST_SCHEMA, MANIFEST_STATUS_FAIL_CLOSED,
    MANIFEST_STATUS_PUBLISHED, ORDERING_RULE,
};

pub const EVENTS_FILE: &str = "canonical_events.jsonl";
pub const BARS_FILE: &str = "canonical_ohlcv.jsonl";
pub const GAP_STATUS_FILE: &str = "gap_status.json";
pub const REVISION_STATUS_FILE: &str = "revision_status.json";
pub const MANIFEST_FILE: &str = "manifest.json";

/// Hex characters of the derived run id.
const RUN_ID_LEN: usize = 16;

/// Parameters for one canonicalization run.
#[derive(Debug, Clone)]
pub struct CanonicalizationConfig {
    pub raw_log_path: PathBuf,
    pub output_dir: PathBuf,
    pub timeframe_ms: i64,
    /// Explicit run id; when absent one is derived from
    /// `raw_log_digest:config_digest`, so unchanged inputs reproduce the
    /// same id.
    pub run_id: Option<String>,
    pub backfill_policy: BackfillPolicy,
}

impl CanonicalizationConfig {
    pub fn new(
        raw_log_path: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
        timeframe_ms: i64,
    ) -> Self {
        Self {
            raw_log_path: raw_log_path.into(),
            output_dir: output_dir.into(),
            timeframe_ms,
            run_id: None,
            backfill_policy: BackfillPolicy::default(),
        }
    }

    fn validate(&self) -> Result<(), PipelineError> {
        if self.timeframe_ms <= 0 {
            return Err(PipelineError::InvalidTimeframe(self.timeframe_ms));
        }
        self.backfill_policy.validate()
    }

    /// Behavior-relevant configuration only; the digest feeds the manifest
    /// and the derived run id.
    fn digest(&self) -> Result<String, PipelineError> {
        let tree = serde_json::json!({
            "schema_version": MANIFEST_SCHEMA,
            "timeframe_ms": self.timeframe_ms,
            "backfill_policy": self.backfill_policy,
            "ordering_rule": ORDERING_RULE,
            "bucketing_rule": BUCKETING_RULE,
        });
        Ok(codec::sha256_hex(&codec::canonical_json_bytes(&tree)))
    }
}

/// Result of a completed run; also carried inside a fail-closed error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: String,
    pub published: bool,
    pub fail_closed_reason: Option<FailClosedReason>,
    pub canonical_event_count: u64,
    pub bar_count: u64,
    pub gap_status: GapStatus,
    pub revision_status: RevisionStatus,
    pub manifest: Manifest,
}

/// Everything derivable from the raw log for one detection cycle.
struct DerivedState {
    records: Vec<crate::capture::RawRecord>,
    conflicts: Vec<DuplicateConflict>,
    idempotent_duplicates: u64,
    events: Vec<CanonicalEvent>,
    late_events: Vec<LateEvent>,
    ingestion_gaps: Vec<IngestionGap>,
    bucket_gaps: Vec<BucketGap>,
}

impl DerivedState {
    fn has_gaps(&self) -> bool {
        !self.ingestion_gaps.is_empty() || !self.bucket_gaps.is_empty()
    }
}

fn derive_state(log_path: &Path, timeframe_ms: i64) -> Result<DerivedState, PipelineError> {
    let loaded = loader::load(log_path)?;
    let canonicalized = canonical::canonicalize(&loaded.records, timeframe_ms)?;
    let ingestion_gaps = gaps::detect_ingestion_gaps(&loaded.records);
    let bucket_gaps = gaps::detect_bucket_gaps(&canonicalized.events, timeframe_ms);
    Ok(DerivedState {
        records: loaded.records,
        conflicts: loaded.conflicts,
        idempotent_duplicates: loaded.idempotent_duplicates,
        events: canonicalized.events,
        late_events: canonicalized.late_events,
        ingestion_gaps,
        bucket_gaps,
    })
}

/// Run the full pipeline. Returns the result on publication, raises
/// [`PipelineError::FailClosed`] (carrying the same result) when publication
/// is blocked.
pub fn run(
    config: &CanonicalizationConfig,
    provider: Option<&mut dyn BackfillProvider>,
) -> Result<RunResult, PipelineError> {
    config.validate()?;

    let mut state = derive_state(&config.raw_log_path, config.timeframe_ms)?;
    let (final_state, backfill) = orchestrate_backfill(config, provider, state)?;
    state = final_state;

    let bars = bars::aggregate(&state.events, config.timeframe_ms);

    let raw_log_bytes = if config.raw_log_path.exists() {
        std::fs::read(&config.raw_log_path)?
    } else {
        Vec::new()
    };
    let raw_log_sha256 = codec::sha256_hex(&raw_log_bytes);
    let config_sha256 = config.digest()?;
    let run_id = match &config.run_id {
        Some(id) => id.clone(),
        None => {
            let seed = format!("{raw_log_sha256}:{config_sha256}");
            codec::sha256_hex(seed.as_bytes())[..RUN_ID_LEN].to_string()
        }
    };

    let fail_closed_reason = if !state.conflicts.is_empty() {
        Some(FailClosedReason::DuplicateIngestSeqConflict)
    } else if state.has_gaps() {
        Some(FailClosedReason::GapUnresolved)
    } else {
        None
    };

    let gap_status = GapStatus::build(
        state.ingestion_gaps.clone(),
        state.bucket_gaps.clone(),
        state.conflicts.clone(),
        backfill.clone(),
    );
    let revision_status = RevisionStatus::build(state.late_events.clone());

    let events_bytes = jsonl_bytes(&state.events)?;
    let bars_bytes = jsonl_bytes(&bars)?;
    let gap_status_bytes = document_bytes(&gap_status)?;
    let revision_status_bytes = document_bytes(&revision_status)?;

    let mut artifacts = vec![
        ArtifactDigest {
            name: GAP_STATUS_FILE.to_string(),
            sha256: codec::sha256_hex(&gap_status_bytes),
            bytes: gap_status_bytes.len() as u64,
        },
        ArtifactDigest {
            name: REVISION_STATUS_FILE.to_string(),
            sha256: codec::sha256_hex(&revision_status_bytes),
            bytes: revision_status_bytes.len() as u64,
        },
    ];
    if fail_closed_reason.is_none() {
        artifacts.push(ArtifactDigest {
            name: EVENTS_FILE.to_string(),
            sha256: codec::sha256_hex(&events_bytes),
            bytes: events_bytes.len() as u64,
        });
        artifacts.push(ArtifactDigest {
            name: BARS_FILE.to_string(),
            sha256: codec::sha256_hex(&bars_bytes),
            bytes: bars_bytes.len() as u64,
        });
    }
    artifacts.sort_by(|a, b| a.name.cmp(&b.name));

    let manifest = Manifest {
        schema_version: MANIFEST_SCHEMA.to_string(),
        run_id: run_id.clone(),
        status: if fail_closed_reason.is_none() {
            MANIFEST_STATUS_PUBLISHED
        } else {
            MANIFEST_STATUS_FAIL_CLOSED
        }
        .to_string(),
        timeframe_ms: config.timeframe_ms,
        raw_log_sha256,
        config_sha256,
        events_schema: EVENTS_SCHEMA.to_string(),
        bars_schema: BARS_SCHEMA.to_string(),
        ordering_rule: ORDERING_RULE.to_string(),
        bucketing_rule: BUCKETING_RULE.to_string(),
        counts: ManifestCounts {
            deduplicated_records: state.records.len() as u64,
            idempotent_duplicates: state.idempotent_duplicates,
            duplicate_conflicts: state.conflicts.len() as u64,
            canonical_events: state.events.len() as u64,
            late_events: state.late_events.len() as u64,
            bars: bars.len() as u64,
        },
        backfill,
        artifacts,
    };
    let manifest_bytes = document_bytes(&manifest)?;

    std::fs::create_dir_all(&config.output_dir)?;
    if fail_closed_reason.is_some() {
        // Canonical artifacts are never left stale under a refused run.
        remove_if_present(&config.output_dir.join(EVENTS_FILE))?;
        remove_if_present(&config.output_dir.join(BARS_FILE))?;
    } else {
        std::fs::write(config.output_dir.join(EVENTS_FILE), &events_bytes)?;
        std::fs::write(config.output_dir.join(BARS_FILE), &bars_bytes)?;
    }
    std::fs::write(config.output_dir.join(GAP_STATUS_FILE), &gap_status_bytes)?;
    std::fs::write(config.output_dir.join(REVISION_STATUS_FILE), &revision_status_bytes)?;
    std::fs::write(config.output_dir.join(MANIFEST_FILE), &manifest_bytes)?;

    let result = RunResult {
        run_id: run_id.clone(),
        published: fail_closed_reason.is_none(),
        fail_closed_reason,
        canonical_event_count: state.events.len() as u64,
        bar_count: bars.len() as u64,
        gap_status,
        revision_status,
        manifest,
    };

    match fail_closed_reason {
        None => {
            info!(
                run_id = %run_id,
                events = result.canonical_event_count,
                bars = result.bar_count,
                "canonicalization published"
            );
            Ok(result)
        }
        Some(reason) => {
            warn!(run_id = %run_id, %reason, "canonicalization fail-closed");
            Err(PipelineError::FailClosed {
                reason,
                result: Box::new(result),
            })
        }
    }
}

/// Bounded backfill loop. Re-derives the full detection state after every
/// attempt; conflicts short-circuit immediately.
fn orchestrate_backfill(
    config: &CanonicalizationConfig,
    mut provider: Option<&mut dyn BackfillProvider>,
    initial: DerivedState,
) -> Result<(DerivedState, BackfillSummary), PipelineError> {
    let policy = config.backfill_policy;

    if !initial.conflicts.is_empty() {
        return Ok((
            initial,
            BackfillSummary {
                outcome: BackfillOutcome::Unresolved,
                policy,
                attempts: Vec::new(),
            },
        ));
    }
    if !initial.has_gaps() {
        return Ok((initial, BackfillSummary::not_needed(policy)));
    }

    let mut state = initial;
    let mut attempts: Vec<BackfillAttempt> = Vec::new();
    let mut machine = BackfillState::Attempting;

    while machine == BackfillState::Attempting {
        let attempt_no = attempts.len() as u32 + 1;
        if attempt_no > policy.max_attempts {
            machine = BackfillState::Unresolved;
            break;
        }
        let Some(active) = provider.as_deref_mut() else {
            machine = BackfillState::Unresolved;
            break;
        };

        // Request identity comes from the stream that owns the gapped
        // timeline; runs are per-market by construction.
        let (exchange_id, market, feed_channel) = match state.records.first() {
            Some(record) => (
                record.exchange_id.clone(),
                record.market.clone(),
                record.feed_channel,
            ),
            None => (String::new(), String::new(), FeedChannel::Trades),
        };

        let mut attempt = BackfillAttempt {
            attempt: attempt_no,
            requested_buckets: state.bucket_gaps.len() as u64,
            records_appended: 0,
            provider_errors: Vec::new(),
        };

        let mut session = IngestionSession::open(&config.raw_log_path)?;
        for gap in &state.bucket_gaps {
            let start_ms = gap.bucket_start_ms;
            let end_ms = start_ms + config.timeframe_ms - 1;
            match active.backfill(&market, start_ms, end_ms, policy.limit) {
                Ok(payloads) => {
                    for payload in payloads.iter().take(policy.limit as usize) {
                        session.capture_rest_backfill(
                            &exchange_id,
                            &market,
                            feed_channel,
                            end_ms,
                            payload,
                            None,
                        )?;
                        attempt.records_appended += 1;
                    }
                }
                Err(e) => {
                    warn!(
                        bucket_start_ms = start_ms,
                        error = %e,
                        "backfill provider failed for gap"
                    );
                    attempt.provider_errors.push(e.to_string());
                }
            }
        }
        info!(
            attempt = attempt.attempt,
            requested = attempt.requested_buckets,
            appended = attempt.records_appended,
            errors = attempt.provider_errors.len(),
            "backfill attempt complete"
        );
        attempts.push(attempt);

        state = derive_state(&config.raw_log_path, config.timeframe_ms)?;
        if !state.conflicts.is_empty() {
            machine = BackfillState::Unresolved;
        } else if !state.has_gaps() {
            machine = BackfillState::Resolved;
        }
    }

    let outcome = match machine {
        BackfillState::Resolved => BackfillOutcome::Resolved,
        _ => BackfillOutcome::Unresolved,
    };
    Ok((
        state,
        BackfillSummary {
            outcome,
            policy,
            attempts,
        },
    ))
}

fn jsonl_bytes<T: Serialize>(items: &[T]) -> Result<Vec<u8>, PipelineError> {
    let mut out = Vec::new();
    for item in items {
        out.extend_from_slice(&codec::canonical_bytes(item)?);
        out.push(b'\n');
    }
    Ok(out)
}

fn document_bytes<T: Serialize>(doc: &T) -> Result<Vec<u8>, PipelineError> {
    let mut out = codec::canonical_bytes(doc)?;
    out.push(b'\n');
    Ok(out)
}

fn remove_if_present(path: &Path) -> Result<(), PipelineError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_invalid_timeframe_rejected_before_io() {
        let config = CanonicalizationConfig::new("/nonexistent/raw.jsonl", "/nonexistent/out", 0);
        let err = run(&config, None).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidTimeframe(0)));
    }

    #[test]
    fn test_invalid_policy_rejected_before_io() {
        let mut config =
            CanonicalizationConfig::new("/nonexistent/raw.jsonl", "/nonexistent/out", 60_000);
        config.backfill_policy.limit = 0;
        let err = run(&config, None).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidBackfillPolicy(_)));
    }

    #[test]
    fn test_empty_log_publishes_empty_artifacts() {
        let dir = tempdir().unwrap();
        let config = CanonicalizationConfig::new(
            dir.path().join("raw.jsonl"),
            dir.path().join("out"),
            60_000,
        );
        let result = run(&config, None).unwrap();
        assert!(result.published);
        assert_eq!(result.canonical_event_count, 0);
        assert!(dir.path().join("out").join(EVENTS_FILE).exists());
        assert!(dir.path().join("out").join(MANIFEST_FILE).exists());
    }

    #[test]
    fn test_run_id_derived_deterministically() {
        let dir = tempdir().unwrap();
        let config = CanonicalizationConfig::new(
            dir.path().join("raw.jsonl"),
            dir.path().join("out"),
            60_000,
        );
        let first = run(&config, None).unwrap();
        let second = run(&config, None).unwrap();
        assert_eq!(first.run_id, second.run_id);
        assert_eq!(first.run_id.len(), 16);
    }

    #[test]
    fn test_explicit_run_id_respected() {
        let dir = tempdir().unwrap();
        let mut config = CanonicalizationConfig::new(
            dir.path().join("raw.jsonl"),
            dir.path().join("out"),
            60_000,
        );
        config.run_id = Some("manual-001".to_string());
        let result = run(&config, None).unwrap();
        assert_eq!(result.run_id, "manual-001");
        assert_eq!(result.manifest.run_id, "manual-001");
    }
}
