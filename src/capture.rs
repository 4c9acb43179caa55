//! Raw Capture Log
//!
//! Append-only, per-stream sequenced record of every payload received,
//! before any parsing. All recovery and replay start here.
//!
//! # Design
//!
//! - One canonical-JSON line per record, UTF-8, newline-delimited.
//! - `ingest_seq` is assigned per stream, strictly +1, recovered by a single
//!   scan of the existing log when the writer is constructed.
//! - Records are created once and never rewritten; the only mutation of the
//!   file is appending one line.
//! - The file is opened append-then-flush per call, never held open for the
//!   duration of a run.
//! - Single-writer structure: two concurrent writers on the same log are out
//!   of contract and must be serialized by the caller.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::codec;
use crate::error::PipelineError;

/// Schema version written to every new record.
pub const RAW_SCHEMA_VERSION: &str = "raw_capture.v2";

/// Legacy schema version still accepted on read (`payload_raw` encoding).
pub const RAW_SCHEMA_VERSION_LEGACY: &str = "raw_capture.v1";

// =============================================================================
// STREAM VOCABULARY
// =============================================================================

/// Wire mechanism a payload arrived over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Ws,
    Rest,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ws => "ws",
            Self::Rest => "rest",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ws" => Some(Self::Ws),
            "rest" => Some(Self::Rest),
            _ => None,
        }
    }
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provenance of a payload. Pairing with [`Transport`] is constrained:
/// `ws_live` requires `ws`, `rest_backfill` requires `rest`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    WsLive,
    RestBackfill,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WsLive => "ws_live",
            Self::RestBackfill => "rest_backfill",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ws_live" => Some(Self::WsLive),
            "rest_backfill" => Some(Self::RestBackfill),
            _ => None,
        }
    }

    /// The only transport this source may be paired with.
    pub fn required_transport(&self) -> Transport {
        match self {
            Self::WsLive => Transport::Ws,
            Self::RestBackfill => Transport::Rest,
        }
    }
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed feed-channel vocabulary. Strings outside this set fail closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedChannel {
    Trades,
    Klines,
    Depth,
    Ticker,
    Mark,
    Index,
    Unknown,
}

impl FeedChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trades => "trades",
            Self::Klines => "klines",
            Self::Depth => "depth",
            Self::Ticker => "ticker",
            Self::Mark => "mark",
            Self::Index => "index",
            Self::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Result<Self, PipelineError> {
        match s {
            "trades" => Ok(Self::Trades),
            "klines" => Ok(Self::Klines),
            "depth" => Ok(Self::Depth),
            "ticker" => Ok(Self::Ticker),
            "mark" => Ok(Self::Mark),
            "index" => Ok(Self::Index),
            "unknown" => Ok(Self::Unknown),
            other => Err(PipelineError::UnknownFeedChannel(other.to_string())),
        }
    }
}

impl std::fmt::Display for FeedChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Composite stream key: `exchange_id:market:transport:feed_channel`.
pub fn stream_id(
    exchange_id: &str,
    market: &str,
    transport: Transport,
    feed_channel: FeedChannel,
) -> String {
    format!("{exchange_id}:{market}:{transport}:{feed_channel}")
}

// =============================================================================
// RAW RECORD
// =============================================================================

/// One captured payload. Immutable after append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub schema_version: String,
    pub stream_id: String,
    pub exchange_id: String,
    pub market: String,
    pub transport: Transport,
    pub source: Source,
    pub feed_channel: FeedChannel,
    /// Per-stream, starts at 1, strictly +1.
    pub ingest_seq: u64,
    /// Receipt wall-clock, milliseconds.
    pub event_ts_ingest_ms: i64,
    /// Exchange-reported event time, if the transport carried one.
    pub event_ts_exchange_ms: Option<i64>,
    /// Exact payload bytes as received.
    pub payload: Vec<u8>,
    /// SHA-256 of `payload`, verified on every read.
    pub payload_sha256: String,
}

impl RawRecord {
    /// Canonical wire form. UTF-8 payloads are stored inline as text;
    /// anything else is base64.
    pub fn wire_value(&self) -> Value {
        let mut obj = json!({
            "schema_version": self.schema_version,
            "stream_id": self.stream_id,
            "exchange_id": self.exchange_id,
            "market": self.market,
            "transport": self.transport.as_str(),
            "source": self.source.as_str(),
            "feed_channel": self.feed_channel.as_str(),
            "ingest_seq": self.ingest_seq,
            "event_ts_ingest_ms": self.event_ts_ingest_ms,
            "payload_sha256": self.payload_sha256,
        });
        let map = obj.as_object_mut().unwrap_or_else(|| unreachable!());
        if let Some(ts) = self.event_ts_exchange_ms {
            map.insert("event_ts_exchange_ms".into(), json!(ts));
        }
        match std::str::from_utf8(&self.payload) {
            Ok(text) => {
                map.insert("payload_text".into(), json!(text));
            }
            Err(_) => {
                map.insert("payload_b64".into(), json!(BASE64.encode(&self.payload)));
            }
        }
        obj
    }

    /// Parse one log line, accepting the current tagged payload encodings and
    /// the legacy `payload_raw` + `payload_encoding` form.
    pub fn from_wire(value: &Value, line: usize) -> Result<Self, PipelineError> {
        let malformed = |reason: String| PipelineError::MalformedLogEntry { line, reason };

        let obj = value
            .as_object()
            .ok_or_else(|| malformed("record is not a JSON object".into()))?;

        let req_str = |key: &str| -> Result<&str, PipelineError> {
            obj.get(key)
                .and_then(Value::as_str)
                .ok_or_else(|| malformed(format!("missing or non-string field: {key}")))
        };
        let req_u64 = |key: &str| -> Result<u64, PipelineError> {
            obj.get(key)
                .and_then(Value::as_u64)
                .ok_or_else(|| malformed(format!("missing or non-integer field: {key}")))
        };
        let req_i64 = |key: &str| -> Result<i64, PipelineError> {
            obj.get(key)
                .and_then(Value::as_i64)
                .ok_or_else(|| malformed(format!("missing or non-integer field: {key}")))
        };

        let schema_version = req_str("schema_version")?.to_string();
        let record_stream_id = req_str("stream_id")?.to_string();
        let exchange_id = req_str("exchange_id")?.to_string();
        let market = req_str("market")?.to_string();
        let ingest_seq = req_u64("ingest_seq")?;
        let payload_sha256 = req_str("payload_sha256")?.to_string();
        let event_ts_ingest_ms = req_i64("event_ts_ingest_ms")?;
        let event_ts_exchange_ms = obj.get("event_ts_exchange_ms").and_then(Value::as_i64);

        let source_raw = req_str("source")?;
        let source = Source::parse(source_raw)
            .ok_or_else(|| malformed(format!("unknown source: {source_raw}")))?;
        let feed_channel = FeedChannel::parse(req_str("feed_channel")?)
            .map_err(|e| malformed(e.to_string()))?;

        // Transport is derivable from source for records that predate it.
        let transport = match obj.get("transport").and_then(Value::as_str) {
            Some(raw) => Transport::parse(raw)
                .ok_or_else(|| malformed(format!("unknown transport: {raw}")))?,
            None => source.required_transport(),
        };
        if source.required_transport() != transport {
            return Err(malformed(format!(
                "invalid transport/source pairing: transport={transport}, source={source}"
            )));
        }

        let payload = decode_payload(obj, &malformed)?;

        Ok(Self {
            schema_version,
            stream_id: record_stream_id,
            exchange_id,
            market,
            transport,
            source,
            feed_channel,
            ingest_seq,
            event_ts_ingest_ms,
            event_ts_exchange_ms,
            payload,
            payload_sha256,
        })
    }
}

/// Payload encodings, resolved once at load time rather than by scattered
/// field-presence checks: inline UTF-8, inline base64, or the legacy
/// prefixed single-field form.
fn decode_payload(
    obj: &serde_json::Map<String, Value>,
    malformed: &dyn Fn(String) -> PipelineError,
) -> Result<Vec<u8>, PipelineError> {
    let text = obj.get("payload_text").and_then(Value::as_str);
    let b64 = obj.get("payload_b64").and_then(Value::as_str);
    let legacy = obj.get("payload_raw").and_then(Value::as_str);

    match (text, b64, legacy) {
        (Some(t), None, None) => Ok(t.as_bytes().to_vec()),
        (None, Some(b), None) => BASE64
            .decode(b)
            .map_err(|e| malformed(format!("invalid base64 payload: {e}"))),
        (None, None, Some(raw)) => {
            let encoding = obj
                .get("payload_encoding")
                .and_then(Value::as_str)
                .ok_or_else(|| malformed("payload_raw without payload_encoding".into()))?;
            match encoding {
                "utf-8" => Ok(raw.as_bytes().to_vec()),
                "base64" => {
                    let body = raw.strip_prefix("base64:").ok_or_else(|| {
                        malformed("base64 payload_raw missing base64: prefix".into())
                    })?;
                    BASE64
                        .decode(body)
                        .map_err(|e| malformed(format!("invalid legacy base64 payload: {e}")))
                }
                other => Err(malformed(format!("unknown payload_encoding: {other}"))),
            }
        }
        (None, None, None) => Err(malformed("record carries no payload field".into())),
        _ => Err(malformed("ambiguous payload encoding: multiple payload fields".into())),
    }
}

// =============================================================================
// CAPTURE LOG
// =============================================================================

/// Append-only writer over the raw log file.
///
/// Construction scans the whole log once to recover per-stream `ingest_seq`
/// counters (write-ahead log with a derived index). The counter map is the
/// only mutable state.
pub struct CaptureLog {
    path: PathBuf,
    last_seq: HashMap<String, u64>,
}

impl CaptureLog {
    /// Open a log for appending, scanning any existing records to recover
    /// sequence counters. A missing file is a fresh, empty log.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, PipelineError> {
        let path = path.into();
        let mut last_seq: HashMap<String, u64> = HashMap::new();

        if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            for (idx, line) in contents.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                let value: Value = serde_json::from_str(line).map_err(|e| {
                    PipelineError::MalformedLogEntry {
                        line: idx + 1,
                        reason: e.to_string(),
                    }
                })?;
                let record = RawRecord::from_wire(&value, idx + 1)?;
                let entry = last_seq.entry(record.stream_id.clone()).or_insert(0);
                *entry = (*entry).max(record.ingest_seq);
            }
        }

        debug!(
            path = %path.display(),
            streams = last_seq.len(),
            "capture log opened"
        );
        Ok(Self { path, last_seq })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Last assigned `ingest_seq` for a stream, 0 if never seen.
    pub fn last_seq(&self, stream: &str) -> u64 {
        self.last_seq.get(stream).copied().unwrap_or(0)
    }

    /// Append one payload: validates transport/source pairing, assigns the
    /// next per-stream sequence, hashes the payload, writes exactly one line.
    #[allow(clippy::too_many_arguments)]
    pub fn append(
        &mut self,
        exchange_id: &str,
        market: &str,
        transport: Transport,
        source: Source,
        feed_channel: FeedChannel,
        received_at_ms: i64,
        payload: &[u8],
        exchange_event_ts_ms: Option<i64>,
    ) -> Result<RawRecord, PipelineError> {
        if source.required_transport() != transport {
            return Err(PipelineError::InvalidTransportSource {
                transport: transport.to_string(),
                provenance: source.to_string(),
            });
        }

        let sid = stream_id(exchange_id, market, transport, feed_channel);
        let seq = self.last_seq(&sid) + 1;

        let record = RawRecord {
            schema_version: RAW_SCHEMA_VERSION.to_string(),
            stream_id: sid.clone(),
            exchange_id: exchange_id.to_string(),
            market: market.to_string(),
            transport,
            source,
            feed_channel,
            ingest_seq: seq,
            event_ts_ingest_ms: received_at_ms,
            event_ts_exchange_ms: exchange_event_ts_ms,
            payload: payload.to_vec(),
            payload_sha256: codec::sha256_hex(payload),
        };

        let line = codec::canonical_json_bytes(&record.wire_value());
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(&line)?;
        file.write_all(b"\n")?;
        file.flush()?;

        self.last_seq.insert(sid.clone(), seq);
        debug!(stream = %sid, ingest_seq = seq, source = %source, "captured payload");
        Ok(record)
    }
}

// =============================================================================
// INGESTION SESSION
// =============================================================================

/// Capability-scoped facade over [`CaptureLog`]. Callers get exactly two
/// entry points, each with the transport/source pairing fixed, so a live
/// payload cannot be mislabeled as backfill or vice versa.
pub struct IngestionSession {
    log: CaptureLog,
}

impl IngestionSession {
    pub fn new(log: CaptureLog) -> Self {
        Self { log }
    }

    pub fn open(path: impl Into<PathBuf>) -> Result<Self, PipelineError> {
        Ok(Self::new(CaptureLog::open(path)?))
    }

    pub fn log(&self) -> &CaptureLog {
        &self.log
    }

    /// Capture a live WebSocket payload (`transport=ws`, `source=ws_live`).
    pub fn capture_ws(
        &mut self,
        exchange_id: &str,
        market: &str,
        feed_channel: FeedChannel,
        received_at_ms: i64,
        payload: &[u8],
        exchange_event_ts_ms: Option<i64>,
    ) -> Result<RawRecord, PipelineError> {
        self.log.append(
            exchange_id,
            market,
            Transport::Ws,
            Source::WsLive,
            feed_channel,
            received_at_ms,
            payload,
            exchange_event_ts_ms,
        )
    }

    /// Capture a REST backfill payload (`transport=rest`,
    /// `source=rest_backfill`). Backfilled records flow through the same
    /// append path as live data and are distinguishable only by provenance.
    pub fn capture_rest_backfill(
        &mut self,
        exchange_id: &str,
        market: &str,
        feed_channel: FeedChannel,
        received_at_ms: i64,
        payload: &[u8],
        exchange_event_ts_ms: Option<i64>,
    ) -> Result<RawRecord, PipelineError> {
        self.log.append(
            exchange_id,
            market,
            Transport::Rest,
            Source::RestBackfill,
            feed_channel,
            received_at_ms,
            payload,
            exchange_event_ts_ms,
        )
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn log_path(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("raw.jsonl")
    }

    #[test]
    fn test_append_assigns_sequential_seqs_per_stream() {
        let dir = tempdir().unwrap();
        let mut log = CaptureLog::open(log_path(&dir)).unwrap();

        let r1 = log
            .append("binance", "BTCUSDT", Transport::Ws, Source::WsLive, FeedChannel::Trades, 1, b"{}", None)
            .unwrap();
        let r2 = log
            .append("binance", "BTCUSDT", Transport::Ws, Source::WsLive, FeedChannel::Trades, 2, b"{}", None)
            .unwrap();
        let other = log
            .append("binance", "ETHUSDT", Transport::Ws, Source::WsLive, FeedChannel::Trades, 3, b"{}", None)
            .unwrap();

        assert_eq!(r1.ingest_seq, 1);
        assert_eq!(r2.ingest_seq, 2);
        assert_eq!(other.ingest_seq, 1);
        assert_eq!(r1.stream_id, "binance:BTCUSDT:ws:trades");
    }

    #[test]
    fn test_reopen_recovers_counters_from_scan() {
        let dir = tempdir().unwrap();
        let path = log_path(&dir);
        {
            let mut log = CaptureLog::open(&path).unwrap();
            for ts in 0..3 {
                log.append("binance", "BTCUSDT", Transport::Ws, Source::WsLive, FeedChannel::Trades, ts, b"{}", None)
                    .unwrap();
            }
        }

        let mut reopened = CaptureLog::open(&path).unwrap();
        assert_eq!(reopened.last_seq("binance:BTCUSDT:ws:trades"), 3);
        let next = reopened
            .append("binance", "BTCUSDT", Transport::Ws, Source::WsLive, FeedChannel::Trades, 9, b"{}", None)
            .unwrap();
        assert_eq!(next.ingest_seq, 4);
    }

    #[test]
    fn test_invalid_pairing_rejected() {
        let dir = tempdir().unwrap();
        let mut log = CaptureLog::open(log_path(&dir)).unwrap();

        let err = log
            .append("binance", "BTCUSDT", Transport::Rest, Source::WsLive, FeedChannel::Trades, 1, b"{}", None)
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidTransportSource { .. }));

        let err = log
            .append("binance", "BTCUSDT", Transport::Ws, Source::RestBackfill, FeedChannel::Trades, 1, b"{}", None)
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidTransportSource { .. }));
        assert_eq!(
            err.to_string(),
            "invalid transport/source pairing: transport=ws, source=rest_backfill"
        );
    }

    #[test]
    fn test_unknown_source_string_rejected() {
        let wire = serde_json::json!({
            "schema_version": RAW_SCHEMA_VERSION,
            "stream_id": "binance:BTCUSDT:ws:trades",
            "exchange_id": "binance",
            "market": "BTCUSDT",
            "source": "manual_insert",
            "feed_channel": "trades",
            "ingest_seq": 1,
            "event_ts_ingest_ms": 5,
            "payload_sha256": codec::sha256_hex(b"{}"),
            "payload_text": "{}",
        });
        let err = RawRecord::from_wire(&wire, 4).unwrap_err();
        match err {
            PipelineError::MalformedLogEntry { line, reason } => {
                assert_eq!(line, 4);
                assert!(reason.contains("manual_insert"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_session_fixes_pairing() {
        let dir = tempdir().unwrap();
        let mut session = IngestionSession::open(log_path(&dir)).unwrap();

        let live = session
            .capture_ws("binance", "BTCUSDT", FeedChannel::Trades, 1, b"{}", None)
            .unwrap();
        let backfill = session
            .capture_rest_backfill("binance", "BTCUSDT", FeedChannel::Trades, 2, b"{}", None)
            .unwrap();

        assert_eq!(live.source, Source::WsLive);
        assert_eq!(live.transport, Transport::Ws);
        assert_eq!(backfill.source, Source::RestBackfill);
        assert_eq!(backfill.transport, Transport::Rest);
        // Different transports are different streams with independent counters.
        assert_eq!(live.ingest_seq, 1);
        assert_eq!(backfill.ingest_seq, 1);
    }

    #[test]
    fn test_binary_payload_roundtrips_via_base64() {
        let dir = tempdir().unwrap();
        let mut log = CaptureLog::open(log_path(&dir)).unwrap();
        let payload = [0u8, 159, 146, 150, 255];

        let written = log
            .append("binance", "BTCUSDT", Transport::Ws, Source::WsLive, FeedChannel::Trades, 1, &payload, None)
            .unwrap();

        let wire = written.wire_value();
        assert!(wire.get("payload_b64").is_some());
        assert!(wire.get("payload_text").is_none());

        let parsed = RawRecord::from_wire(&wire, 1).unwrap();
        assert_eq!(parsed.payload, payload);
    }

    #[test]
    fn test_legacy_payload_encodings_readable() {
        let utf8 = serde_json::json!({
            "schema_version": RAW_SCHEMA_VERSION_LEGACY,
            "stream_id": "binance:BTCUSDT:ws:trades",
            "exchange_id": "binance",
            "market": "BTCUSDT",
            "source": "ws_live",
            "feed_channel": "trades",
            "ingest_seq": 1,
            "event_ts_ingest_ms": 5,
            "payload_sha256": codec::sha256_hex(b"{\"p\":1}"),
            "payload_raw": "{\"p\":1}",
            "payload_encoding": "utf-8",
        });
        let record = RawRecord::from_wire(&utf8, 1).unwrap();
        assert_eq!(record.payload, b"{\"p\":1}");
        // Transport derived from source when the field is absent.
        assert_eq!(record.transport, Transport::Ws);

        let b64 = serde_json::json!({
            "schema_version": RAW_SCHEMA_VERSION_LEGACY,
            "stream_id": "binance:BTCUSDT:ws:trades",
            "exchange_id": "binance",
            "market": "BTCUSDT",
            "source": "ws_live",
            "feed_channel": "trades",
            "ingest_seq": 2,
            "event_ts_ingest_ms": 6,
            "payload_sha256": codec::sha256_hex(b"raw-bytes"),
            "payload_raw": format!("base64:{}", BASE64.encode(b"raw-bytes")),
            "payload_encoding": "base64",
        });
        let record = RawRecord::from_wire(&b64, 2).unwrap();
        assert_eq!(record.payload, b"raw-bytes");
    }

    #[test]
    fn test_unknown_feed_channel_fails_closed() {
        assert!(FeedChannel::parse("funding").is_err());
        assert!(FeedChannel::parse("unknown").is_ok());
    }

    #[test]
    fn test_multiple_payload_fields_rejected() {
        let wire = serde_json::json!({
            "schema_version": RAW_SCHEMA_VERSION,
            "stream_id": "binance:BTCUSDT:ws:trades",
            "exchange_id": "binance",
            "market": "BTCUSDT",
            "source": "ws_live",
            "feed_channel": "trades",
            "ingest_seq": 1,
            "event_ts_ingest_ms": 5,
            "payload_sha256": "00",
            "payload_text": "{}",
            "payload_b64": "e30=",
        });
        let err = RawRecord::from_wire(&wire, 7).unwrap_err();
        assert!(matches!(err, PipelineError::MalformedLogEntry { line: 7, .. }));
    }
}
