//! Gap Detector
//!
//! Two independent checks, both advisory inputs to the publication gate:
//! missing ingestion sequence numbers per stream, and missing time buckets in
//! the derived canonical timeline. Detection never raises — every gap is
//! reported in one pass so a single run surfaces the complete picture.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::canonical::CanonicalEvent;
use crate::capture::RawRecord;

/// A jump in a stream's `ingest_seq` timeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestionGap {
    pub stream_id: String,
    pub expected_ingest_seq: u64,
    pub found_ingest_seq: u64,
}

/// A `timeframe_ms`-aligned bucket with no canonical events, strictly between
/// the earliest and latest observed buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketGap {
    pub bucket_start_ms: i64,
}

/// Scan kept records for per-stream sequence gaps. Expected sequence starts
/// at 1 and increments by 1; any `found != expected` is a gap.
pub fn detect_ingestion_gaps(records: &[RawRecord]) -> Vec<IngestionGap> {
    let mut by_stream: BTreeMap<&str, Vec<u64>> = BTreeMap::new();
    for record in records {
        by_stream
            .entry(record.stream_id.as_str())
            .or_default()
            .push(record.ingest_seq);
    }

    let mut gaps = Vec::new();
    for (stream, mut seqs) in by_stream {
        seqs.sort_unstable();
        let mut expected = 1u64;
        for found in seqs {
            if found != expected {
                gaps.push(IngestionGap {
                    stream_id: stream.to_string(),
                    expected_ingest_seq: expected,
                    found_ingest_seq: found,
                });
            }
            expected = found + 1;
        }
    }
    gaps
}

/// Walk every multiple of `timeframe_ms` from the minimum to the maximum
/// observed bucket; report each bucket with no events.
pub fn detect_bucket_gaps(events: &[CanonicalEvent], timeframe_ms: i64) -> Vec<BucketGap> {
    let observed: BTreeSet<i64> = events.iter().map(|e| e.bucket_start_ms).collect();
    let (Some(&min), Some(&max)) = (observed.first(), observed.last()) else {
        return Vec::new();
    };

    let mut gaps = Vec::new();
    let mut bucket = min;
    while bucket <= max {
        if !observed.contains(&bucket) {
            gaps.push(BucketGap {
                bucket_start_ms: bucket,
            });
        }
        bucket += timeframe_ms;
    }
    gaps
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{FeedChannel, RawRecord, Source, Transport, RAW_SCHEMA_VERSION};
    use rust_decimal::Decimal;

    fn make_record(stream: &str, seq: u64) -> RawRecord {
        RawRecord {
            schema_version: RAW_SCHEMA_VERSION.to_string(),
            stream_id: stream.to_string(),
            exchange_id: "binance".to_string(),
            market: "BTCUSDT".to_string(),
            transport: Transport::Ws,
            source: Source::WsLive,
            feed_channel: FeedChannel::Trades,
            ingest_seq: seq,
            event_ts_ingest_ms: seq as i64,
            event_ts_exchange_ms: None,
            payload: b"{}".to_vec(),
            payload_sha256: crate::codec::sha256_hex(b"{}"),
        }
    }

    fn make_event(bucket: i64) -> CanonicalEvent {
        CanonicalEvent {
            stream_id: "binance:BTCUSDT:ws:trades".to_string(),
            event_ts_ms: bucket,
            bucket_start_ms: bucket,
            price: Decimal::ONE,
            qty: Decimal::ONE,
            ingest_seq: 1,
            payload_sha256: "0".repeat(64),
        }
    }

    #[test]
    fn test_contiguous_stream_has_no_gaps() {
        let records: Vec<_> = (1..=5).map(|s| make_record("s", s)).collect();
        assert!(detect_ingestion_gaps(&records).is_empty());
    }

    #[test]
    fn test_skipped_seq_reported_with_expected_and_found() {
        let records = vec![make_record("s", 1), make_record("s", 3)];
        let gaps = detect_ingestion_gaps(&records);
        assert_eq!(
            gaps,
            vec![IngestionGap {
                stream_id: "s".to_string(),
                expected_ingest_seq: 2,
                found_ingest_seq: 3,
            }]
        );
    }

    #[test]
    fn test_stream_not_starting_at_one_is_a_gap() {
        let records = vec![make_record("s", 2), make_record("s", 3)];
        let gaps = detect_ingestion_gaps(&records);
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].expected_ingest_seq, 1);
        assert_eq!(gaps[0].found_ingest_seq, 2);
    }

    #[test]
    fn test_streams_tracked_independently() {
        let records = vec![make_record("a", 1), make_record("b", 1), make_record("b", 4)];
        let gaps = detect_ingestion_gaps(&records);
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].stream_id, "b");
    }

    #[test]
    fn test_bucket_gap_walk() {
        let events = vec![make_event(0), make_event(120_000), make_event(180_000)];
        let gaps = detect_bucket_gaps(&events, 60_000);
        assert_eq!(
            gaps,
            vec![BucketGap { bucket_start_ms: 60_000 }]
        );
    }

    #[test]
    fn test_no_events_no_bucket_gaps() {
        assert!(detect_bucket_gaps(&[], 60_000).is_empty());
    }

    #[test]
    fn test_single_bucket_has_no_gaps() {
        let events = vec![make_event(60_000), make_event(60_000)];
        assert!(detect_bucket_gaps(&events, 60_000).is_empty());
    }
}
