//! Bar Aggregator
//!
//! Folds the ordered canonical event stream into one OHLCV bar per
//! `(market, bucket_start_ms)` with exact-decimal arithmetic throughout.
//! One mutable accumulator per bucket lives in an ordered map and is
//! finalized exactly once, in a single deterministic pass over sorted keys.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::canonical::CanonicalEvent;

/// One OHLCV aggregate. Every contributing event is traceable: the bar
/// carries the inclusive `ingest_seq` range and each payload hash in event
/// order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalBar {
    pub market: String,
    pub timeframe_ms: i64,
    pub bucket_start_ms: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub event_count: u64,
    pub ingest_seq_first: u64,
    pub ingest_seq_last: u64,
    pub payload_sha256s: Vec<String>,
}

struct BarAccumulator {
    open: Decimal,
    high: Decimal,
    low: Decimal,
    close: Decimal,
    volume: Decimal,
    event_count: u64,
    ingest_seq_first: u64,
    ingest_seq_last: u64,
    payload_sha256s: Vec<String>,
}

impl BarAccumulator {
    fn start(event: &CanonicalEvent) -> Self {
        Self {
            open: event.price,
            high: event.price,
            low: event.price,
            close: event.price,
            volume: event.qty,
            event_count: 1,
            ingest_seq_first: event.ingest_seq,
            ingest_seq_last: event.ingest_seq,
            payload_sha256s: vec![event.payload_sha256.clone()],
        }
    }

    fn fold(&mut self, event: &CanonicalEvent) {
        self.high = self.high.max(event.price);
        self.low = self.low.min(event.price);
        self.close = event.price;
        self.volume += event.qty;
        self.event_count += 1;
        self.ingest_seq_first = self.ingest_seq_first.min(event.ingest_seq);
        self.ingest_seq_last = self.ingest_seq_last.max(event.ingest_seq);
        self.payload_sha256s.push(event.payload_sha256.clone());
    }

    fn finalize(self, market: String, timeframe_ms: i64, bucket_start_ms: i64) -> CanonicalBar {
        CanonicalBar {
            market,
            timeframe_ms,
            bucket_start_ms,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume.normalize(),
            event_count: self.event_count,
            ingest_seq_first: self.ingest_seq_first,
            ingest_seq_last: self.ingest_seq_last,
            payload_sha256s: self.payload_sha256s,
        }
    }
}

/// Fold events (already in canonical order) into bars, returned sorted by
/// `(market, bucket_start_ms)`.
pub fn aggregate(events: &[CanonicalEvent], timeframe_ms: i64) -> Vec<CanonicalBar> {
    let mut accumulators: BTreeMap<(String, i64), BarAccumulator> = BTreeMap::new();

    for event in events {
        let key = (event.market().to_string(), event.bucket_start_ms);
        match accumulators.get_mut(&key) {
            Some(acc) => acc.fold(event),
            None => {
                accumulators.insert(key, BarAccumulator::start(event));
            }
        }
    }

    accumulators
        .into_iter()
        .map(|((market, bucket), acc)| acc.finalize(market, timeframe_ms, bucket))
        .collect()
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::format_decimal;
    use std::str::FromStr;

    fn make_event(ts: i64, seq: u64, price: &str, qty: &str) -> CanonicalEvent {
        CanonicalEvent {
            stream_id: "binance:BTCUSDT:ws:trades".to_string(),
            event_ts_ms: ts,
            bucket_start_ms: ts.div_euclid(60_000) * 60_000,
            price: Decimal::from_str(price).unwrap(),
            qty: Decimal::from_str(qty).unwrap(),
            ingest_seq: seq,
            payload_sha256: format!("{seq:064x}"),
        }
    }

    #[test]
    fn test_ohlcv_single_bucket() {
        let events = vec![
            make_event(1_000, 1, "100", "1"),
            make_event(2_000, 2, "105", "2"),
            make_event(3_000, 3, "98", "3"),
        ];
        let bars = aggregate(&events, 60_000);

        assert_eq!(bars.len(), 1);
        let bar = &bars[0];
        assert_eq!(format_decimal(bar.open), "100");
        assert_eq!(format_decimal(bar.high), "105");
        assert_eq!(format_decimal(bar.low), "98");
        assert_eq!(format_decimal(bar.close), "98");
        assert_eq!(format_decimal(bar.volume), "6");
        assert_eq!(bar.event_count, 3);
        assert_eq!(bar.ingest_seq_first, 1);
        assert_eq!(bar.ingest_seq_last, 3);
        assert_eq!(bar.payload_sha256s.len(), 3);
        assert_eq!(bar.market, "BTCUSDT");
    }

    #[test]
    fn test_buckets_do_not_mix() {
        let events = vec![
            make_event(0, 1, "10", "1"),
            make_event(60_000, 2, "20", "1"),
        ];
        let bars = aggregate(&events, 60_000);
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].bucket_start_ms, 0);
        assert_eq!(format_decimal(bars[0].close), "10");
        assert_eq!(bars[1].bucket_start_ms, 60_000);
        assert_eq!(format_decimal(bars[1].open), "20");
    }

    #[test]
    fn test_decimal_volume_has_no_float_drift() {
        // 0.1 + 0.2 is exactly 0.3 in decimal arithmetic.
        let events = vec![
            make_event(0, 1, "1", "0.1"),
            make_event(1, 2, "1", "0.2"),
        ];
        let bars = aggregate(&events, 60_000);
        assert_eq!(format_decimal(bars[0].volume), "0.3");
    }

    #[test]
    fn test_provenance_in_event_order() {
        let events = vec![
            make_event(0, 2, "1", "1"),
            make_event(1, 1, "1", "1"),
        ];
        let bars = aggregate(&events, 60_000);
        // Hashes follow event order, seq range is inclusive min/max.
        assert_eq!(bars[0].payload_sha256s[0], format!("{:064x}", 2));
        assert_eq!(bars[0].ingest_seq_first, 1);
        assert_eq!(bars[0].ingest_seq_last, 2);
    }

    #[test]
    fn test_empty_stream_yields_no_bars() {
        assert!(aggregate(&[], 60_000).is_empty());
    }
}
