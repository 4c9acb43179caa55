//! Canonfeed
//!
//! Deterministic canonicalization pipeline for captured market data.
//!
//! ```text
//!   raw capture log (append-only JSONL)
//!        |
//!   load + verify payload hashes + dedup
//!        |
//!   gap detection (ingest_seq, time buckets)
//!        |
//!   bounded backfill (injected provider) --appends--> raw capture log
//!        |
//!   canonical events (ordered, bucketed, late data quarantined)
//!        |
//!   OHLCV bars (exact decimal)
//!        |
//!   publication gate: PUBLISHED or FAIL_CLOSED + content-addressed manifest
//! ```
//!
//! Every run recomputes everything from the raw log; unchanged inputs
//! reproduce every artifact byte for byte.

pub mod backfill;
pub mod bars;
pub mod canonical;
pub mod capture;
pub mod codec;
pub mod error;
pub mod gaps;
pub mod loader;
pub mod pipeline;
pub mod status;

pub use backfill::{BackfillPolicy, BackfillProvider, BackfillProviderError, NoopBackfillProvider};
pub use capture::{CaptureLog, FeedChannel, IngestionSession, RawRecord, Source, Transport};
pub use error::{FailClosedReason, PipelineError};
pub use pipeline::{run, CanonicalizationConfig, RunResult};
