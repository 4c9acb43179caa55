//! Event Canonicalizer
//!
//! Decodes raw payload bytes into typed trade events, assigns each to a
//! fixed-width time bucket, and separates in-order events from late arrivals.
//!
//! # Late-event policy
//!
//! A per-stream maximum-bucket watermark is kept for the duration of one
//! canonicalization pass (and only that pass — it never survives a run). An
//! event whose bucket is below its stream's watermark is a revision
//! candidate: preserved in the raw log, excluded from the canonical stream,
//! recorded with reason `late_data`.
//!
//! # Ordering
//!
//! The canonical output is sorted by `(event_ts_ms, ingest_seq, stream_id)`,
//! a pure function of content, never of arrival order.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr;
use tracing::debug;

use crate::capture::RawRecord;
use crate::error::PipelineError;

/// Reason recorded against every revision candidate.
pub const LATE_DATA_REASON: &str = "late_data";

/// Payload keys tried, in order, when the record carries no exchange timestamp.
const TIMESTAMP_KEYS: [&str; 6] = ["event_ts_ms", "timestamp", "ts", "T", "E", "time"];
const PRICE_KEYS: [&str; 2] = ["price", "p"];
const QTY_KEYS: [&str; 4] = ["qty", "q", "quantity", "size"];

/// One decoded trade tick, fully provenanced back to its raw record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalEvent {
    pub stream_id: String,
    pub event_ts_ms: i64,
    /// `floor(event_ts_ms / timeframe_ms) * timeframe_ms`.
    pub bucket_start_ms: i64,
    /// Exact decimal, serialized as decimal text.
    pub price: Decimal,
    /// Exact decimal, serialized as decimal text.
    pub qty: Decimal,
    pub ingest_seq: u64,
    pub payload_sha256: String,
}

impl CanonicalEvent {
    /// Market component of the stream id (`exchange:market:transport:channel`).
    pub fn market(&self) -> &str {
        self.stream_id.split(':').nth(1).unwrap_or("")
    }
}

/// A late arrival excluded from the canonical stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LateEvent {
    pub stream_id: String,
    pub ingest_seq: u64,
    pub event_ts_ms: i64,
    pub bucket_start_ms: i64,
    /// The stream's watermark at the moment the event was rejected.
    pub watermark_bucket_ms: i64,
    pub reason: String,
    pub payload_sha256: String,
}

/// Output of one canonicalization pass.
#[derive(Debug, Default)]
pub struct CanonicalizeOutput {
    pub events: Vec<CanonicalEvent>,
    pub late_events: Vec<LateEvent>,
}

/// Start of the fixed-width window `ts` belongs to.
pub fn bucket_start(event_ts_ms: i64, timeframe_ms: i64) -> i64 {
    event_ts_ms.div_euclid(timeframe_ms) * timeframe_ms
}

/// Canonicalize deduplicated records in ascending `(stream_id, ingest_seq)`
/// order. Decode failures and missing timestamps are fatal, never skipped.
pub fn canonicalize(
    records: &[RawRecord],
    timeframe_ms: i64,
) -> Result<CanonicalizeOutput, PipelineError> {
    let mut ordered: Vec<&RawRecord> = records.iter().collect();
    ordered.sort_by(|a, b| {
        (a.stream_id.as_str(), a.ingest_seq).cmp(&(b.stream_id.as_str(), b.ingest_seq))
    });

    let mut out = CanonicalizeOutput::default();
    let mut watermarks: HashMap<&str, i64> = HashMap::new();

    for record in ordered {
        let decoded: Value = serde_json::from_slice(&record.payload).map_err(|e| {
            PipelineError::PayloadDecodeError {
                stream_id: record.stream_id.clone(),
                ingest_seq: record.ingest_seq,
                reason: e.to_string(),
            }
        })?;

        let event_ts_ms = record
            .event_ts_exchange_ms
            .or_else(|| payload_timestamp(&decoded))
            .ok_or_else(|| PipelineError::MissingEventTimestamp {
                stream_id: record.stream_id.clone(),
                ingest_seq: record.ingest_seq,
            })?;

        let price = field_decimal(&decoded, &PRICE_KEYS).ok_or_else(|| decode_error(record, "price"))?;
        let qty = field_decimal(&decoded, &QTY_KEYS).ok_or_else(|| decode_error(record, "qty"))?;

        let bucket = bucket_start(event_ts_ms, timeframe_ms);
        match watermarks.get(record.stream_id.as_str()) {
            Some(&watermark) if bucket < watermark => {
                debug!(
                    stream = %record.stream_id,
                    ingest_seq = record.ingest_seq,
                    bucket,
                    watermark,
                    "late event diverted to revision candidates"
                );
                out.late_events.push(LateEvent {
                    stream_id: record.stream_id.clone(),
                    ingest_seq: record.ingest_seq,
                    event_ts_ms,
                    bucket_start_ms: bucket,
                    watermark_bucket_ms: watermark,
                    reason: LATE_DATA_REASON.to_string(),
                    payload_sha256: record.payload_sha256.clone(),
                });
            }
            _ => {
                watermarks.insert(record.stream_id.as_str(), bucket);
                out.events.push(CanonicalEvent {
                    stream_id: record.stream_id.clone(),
                    event_ts_ms,
                    bucket_start_ms: bucket,
                    price: price.normalize(),
                    qty: qty.normalize(),
                    ingest_seq: record.ingest_seq,
                    payload_sha256: record.payload_sha256.clone(),
                });
            }
        }
    }

    out.events.sort_by(|a, b| {
        (a.event_ts_ms, a.ingest_seq, a.stream_id.as_str())
            .cmp(&(b.event_ts_ms, b.ingest_seq, b.stream_id.as_str()))
    });
    Ok(out)
}

fn decode_error(record: &RawRecord, field: &str) -> PipelineError {
    PipelineError::PayloadDecodeError {
        stream_id: record.stream_id.clone(),
        ingest_seq: record.ingest_seq,
        reason: format!("missing or unparseable {field}"),
    }
}

fn payload_timestamp(decoded: &Value) -> Option<i64> {
    let obj = decoded.as_object()?;
    for key in TIMESTAMP_KEYS {
        if let Some(value) = obj.get(key) {
            if let Some(ts) = value.as_i64() {
                return Some(ts);
            }
            if let Some(ts) = value.as_str().and_then(|s| s.parse::<i64>().ok()) {
                return Some(ts);
            }
        }
    }
    None
}

/// Exact decimal from the first present key; string or number, never via f64.
fn field_decimal(decoded: &Value, keys: &[&str]) -> Option<Decimal> {
    let obj = decoded.as_object()?;
    for key in keys {
        if let Some(value) = obj.get(*key) {
            return decimal_value(value);
        }
    }
    None
}

fn decimal_value(value: &Value) -> Option<Decimal> {
    match value {
        Value::String(s) => {
            Decimal::from_str(s).ok().or_else(|| Decimal::from_scientific(s).ok())
        }
        Value::Number(n) => {
            let text = n.to_string();
            Decimal::from_str(&text)
                .ok()
                .or_else(|| Decimal::from_scientific(&text).ok())
        }
        _ => None,
    }
}

// =============================================================================
// TESTS
// =============================================================================
