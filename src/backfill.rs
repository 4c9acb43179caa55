//! Backfill Orchestration
//!
//! Bounded recovery loop for bucket gaps. The provider is injected; this
//! crate performs no network I/O of its own. Anything the provider returns is
//! appended through the same capture path as live data, tagged
//! `rest_backfill`, then detection re-runs.
//!
//! # State machine (per canonicalization run)
//!
//! - `NotNeeded` — no gaps found, terminal.
//! - `Attempting` — gaps found and attempts remain; cycles with re-detection.
//! - `Resolved` — gaps eliminated after at least one attempt, terminal.
//! - `Unresolved` — attempts exhausted or a duplicate conflict appeared,
//!   terminal, forces fail-closed.
//!
//! A duplicate conflict short-circuits the loop immediately: conflicts are
//! not backfill-resolvable. Neither are ingestion-sequence gaps — the
//! provider is only ever asked about bucket ranges, so a run with an
//! ingestion gap will exhaust its attempts and fail closed. That asymmetry is
//! deliberate and load-bearing: a missing `ingest_seq` means the capture
//! process itself lost data, and no amount of exchange history can restore
//! the original delivery.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::PipelineError;

/// Error surfaced by a backfill provider. Caught per gap and recorded in the
/// attempt log; never fatal to the run.
#[derive(Debug, Clone, Error)]
#[error("backfill provider error: {0}")]
pub struct BackfillProviderError(pub String);

impl BackfillProviderError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Injected source of replacement raw payloads.
///
/// May return zero or more payloads for the requested range, may fail. A
/// no-op implementation is valid and makes the system behave as
/// "fail-closed, no recovery" for all gaps. Implementations that reach the
/// network should enforce their own timeout: this is the single suspension
/// point in the pipeline and an unbounded block stalls the attempt loop.
pub trait BackfillProvider {
    fn backfill(
        &mut self,
        symbol: &str,
        start_ms: i64,
        end_ms: i64,
        limit: u32,
    ) -> Result<Vec<Vec<u8>>, BackfillProviderError>;
}

/// Provider that never returns anything.
pub struct NoopBackfillProvider;

impl BackfillProvider for NoopBackfillProvider {
    fn backfill(
        &mut self,
        _symbol: &str,
        _start_ms: i64,
        _end_ms: i64,
        _limit: u32,
    ) -> Result<Vec<Vec<u8>>, BackfillProviderError> {
        Ok(Vec::new())
    }
}

/// Attempt and size bounds for one run. Pure configuration, validated once
/// before any I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillPolicy {
    /// Maximum detection/backfill cycles. Zero disables backfill entirely.
    pub max_attempts: u32,
    /// Maximum raw records requested (and accepted) per gap range.
    pub limit: u32,
}

impl Default for BackfillPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            limit: 1000,
        }
    }
}

impl BackfillPolicy {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.limit == 0 {
            return Err(PipelineError::InvalidBackfillPolicy(
                "limit must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Orchestrator state. `Attempting` is the only non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackfillState {
    NotNeeded,
    Attempting,
    Resolved,
    Unresolved,
}

impl BackfillState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Attempting)
    }
}

/// Terminal outcome recorded in the status documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackfillOutcome {
    NotNeeded,
    Resolved,
    Unresolved,
}

/// What one detection/backfill cycle did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillAttempt {
    pub attempt: u32,
    pub requested_buckets: u64,
    pub records_appended: u64,
    /// Provider failures, one entry per gap that errored. Recorded, not fatal.
    pub provider_errors: Vec<String>,
}

/// Full backfill account for the manifest and gap status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillSummary {
    pub outcome: BackfillOutcome,
    pub policy: BackfillPolicy,
    pub attempts: Vec<BackfillAttempt>,
}

impl BackfillSummary {
    pub fn not_needed(policy: BackfillPolicy) -> Self {
        Self {
            outcome: BackfillOutcome::NotNeeded,
            policy,
            attempts: Vec::new(),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_zero_limit_rejected() {
        let policy = BackfillPolicy {
            max_attempts: 1,
            limit: 0,
        };
        assert!(matches!(
            policy.validate(),
            Err(PipelineError::InvalidBackfillPolicy(_))
        ));
    }

    #[test]
    fn test_policy_zero_attempts_is_valid() {
        let policy = BackfillPolicy {
            max_attempts: 0,
            limit: 10,
        };
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_terminal_states() {
        assert!(BackfillState::NotNeeded.is_terminal());
        assert!(BackfillState::Resolved.is_terminal());
        assert!(BackfillState::Unresolved.is_terminal());
        assert!(!BackfillState::Attempting.is_terminal());
    }

    #[test]
    fn test_outcome_serializes_snake_case() {
        let json = serde_json::to_value(BackfillOutcome::Resolved).unwrap();
        assert_eq!(json, serde_json::json!("resolved"));
        let json = serde_json::to_value(BackfillOutcome::NotNeeded).unwrap();
        assert_eq!(json, serde_json::json!("not_needed"));
    }

    #[test]
    fn test_noop_provider_returns_nothing() {
        let mut provider = NoopBackfillProvider;
        let payloads = provider.backfill("BTCUSDT", 0, 59_999, 100).unwrap();
        assert!(payloads.is_empty());
    }
}
