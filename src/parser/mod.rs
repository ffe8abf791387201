//! Centralized log-line parser (C2): a pure, side-effect-free dispatcher
//! from raw log lines to typed [`Event`]s, plus the geo-IP cache it
//! consults for traffic events.
//!
//! A parse failure or an irrelevant line never propagates as an error — it
//! is simply "not relevant", represented as `None`.

mod categorize;
mod duration;
pub mod geoip;
mod size;

use std::sync::{Mutex, OnceLock};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::Value;

pub use categorize::categorize_action;
pub use duration::parse_duration_to_seconds;
pub use geoip::{GeoIpCache, GeoIpLookup, MaxMindLookup};
pub use size::{get_size_bucket, parse_size_to_bytes};

use crate::events::{pairing_key, Event, HashstoreEnd, OperationStart, Status, TrafficEvent};

fn json_object_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{.*\}").unwrap())
}

enum Level {
    Info,
    Debug,
    Error,
}

impl Level {
    fn token(&self) -> &'static str {
        match self {
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Error => "ERROR",
        }
    }

    fn detect(line: &str) -> Option<Level> {
        if line.contains("INFO") {
            Some(Level::Info)
        } else if line.contains("DEBUG") {
            Some(Level::Debug)
        } else if line.contains("ERROR") {
            Some(Level::Error)
        } else {
            None
        }
    }
}

pub struct Parser {
    geoip_cache: Mutex<GeoIpCache>,
    geoip_lookup: Box<dyn GeoIpLookup>,
}

impl Parser {
    pub fn new(geoip_lookup: Box<dyn GeoIpLookup>, geoip_cache_capacity: usize) -> Self {
        Self {
            geoip_cache: Mutex::new(GeoIpCache::new(geoip_cache_capacity)),
            geoip_lookup,
        }
    }

    /// Parses one log line for `node_name`. Returns `None` if the line is
    /// not one of the recognized shapes.
    pub fn parse_log_line(&self, line: &str, node_name: &str) -> Option<Event> {
        if !line.contains("piecestore") && !line.contains("hashstore") {
            return None;
        }

        let level = Level::detect(line)?;
        let level_token = level.token();
        let mut parts = line.splitn(2, level_token);
        let timestamp_str = parts.next()?.trim();
        let rest = parts.next()?;
        let timestamp = parse_source_timestamp(timestamp_str)?;

        let json_match = json_object_pattern().find(line)?;
        let log_data: Value = serde_json::from_str(json_match.as_str()).ok()?;

        if line.contains("hashstore") {
            return self.parse_hashstore(rest, node_name, timestamp, &log_data);
        }

        if line.contains("download started") || line.contains("upload started") {
            return parse_operation_start(timestamp, &log_data);
        }

        self.parse_traffic_event(line, node_name, timestamp, &log_data)
    }

    fn parse_hashstore(
        &self,
        rest_of_line: &str,
        node_name: &str,
        timestamp: DateTime<Utc>,
        log_data: &Value,
    ) -> Option<Event> {
        let action = rest_of_line
            .split("hashstore")
            .nth(1)?
            .trim()
            .split('\t')
            .next()?
            .trim();

        let satellite = log_data.get("satellite")?.as_str()?.to_string();
        let store = log_data.get("store")?.as_str()?.to_string();
        let key = format!("{satellite}:{store}");

        match action {
            "beginning compaction" => Some(Event::HashstoreBegin { key, timestamp }),
            "finished compaction" => {
                let duration_s = log_data
                    .get("duration")
                    .and_then(|v| v.as_str())
                    .and_then(parse_duration_to_seconds)
                    .unwrap_or(0.0);

                let stats = log_data.get("stats");
                let table_load = stats
                    .and_then(|s| s.get("Table"))
                    .and_then(|t| t.get("Load"))
                    .and_then(|v| v.as_f64())
                    .unwrap_or(0.0)
                    * 100.0;
                let trash_percent = stats
                    .and_then(|s| s.get("TrashPercent"))
                    .and_then(|v| v.as_f64())
                    .unwrap_or(0.0)
                    * 100.0;
                let data_reclaimed_bytes = stats
                    .and_then(|s| s.get("DataReclaimed"))
                    .and_then(|v| v.as_str())
                    .map(parse_size_to_bytes)
                    .unwrap_or(0);
                let data_rewritten_bytes = stats
                    .and_then(|s| s.get("DataRewritten"))
                    .and_then(|v| v.as_str())
                    .map(parse_size_to_bytes)
                    .unwrap_or(0);

                Some(Event::HashstoreEnd {
                    key: key.clone(),
                    data: HashstoreEnd {
                        node_name: node_name.to_string(),
                        satellite,
                        store,
                        last_run_iso: timestamp.to_rfc3339(),
                        duration_s,
                        data_reclaimed_bytes,
                        data_rewritten_bytes,
                        table_load,
                        trash_percent,
                    },
                })
            }
            _ => None,
        }
    }

    fn parse_traffic_event(
        &self,
        line: &str,
        node_name: &str,
        timestamp: DateTime<Utc>,
        log_data: &Value,
    ) -> Option<Event> {
        let (status, error_reason) = if line.contains("download canceled") {
            (
                Status::Canceled,
                Some(str_field(log_data, "reason").unwrap_or_else(|| "context canceled".to_string())),
            )
        } else if line.contains("failed") || line.contains("ERROR") {
            (Status::Failed, Some(str_field(log_data, "error").unwrap_or_else(|| "unknown error".to_string())))
        } else {
            (Status::Success, None)
        };

        let action = str_field(log_data, "Action")?;
        let piece_id = str_field(log_data, "Piece ID")?;
        let satellite_id = str_field(log_data, "Satellite ID")?;
        let remote_addr = str_field(log_data, "Remote Address")?;
        let size = log_data.get("Size")?.as_i64()?;

        let remote_ip = remote_addr.split(':').next().unwrap_or(&remote_addr).to_string();
        let location = {
            let mut cache = self.geoip_cache.lock().unwrap();
            cache.resolve(&remote_ip, self.geoip_lookup.as_ref())
        };

        let duration_ms = log_data
            .get("duration")
            .and_then(|v| v.as_str())
            .and_then(parse_duration_to_seconds)
            .map(|secs| (secs * 1000.0) as i64);

        Some(Event::Traffic(TrafficEvent {
            ts_unix: timestamp.timestamp() as f64 + timestamp.timestamp_subsec_nanos() as f64 / 1e9,
            timestamp,
            node_name: node_name.to_string(),
            category: categorize_action(&action),
            action,
            status,
            size,
            piece_id,
            satellite_id,
            remote_ip,
            location,
            error_reason,
            duration_ms,
            arrival_time: 0.0,
        }))
    }
}

fn parse_operation_start(timestamp: DateTime<Utc>, log_data: &Value) -> Option<Event> {
    let piece_id = str_field(log_data, "Piece ID")?;
    let satellite_id = str_field(log_data, "Satellite ID")?;
    let action = str_field(log_data, "Action")?;
    let available_space = log_data.get("Available Space").and_then(|v| v.as_i64());

    Some(Event::OperationStart(OperationStart {
        piece_id,
        satellite_id,
        action,
        timestamp,
        arrival_time: 0.0,
        available_space,
    }))
}

fn str_field(data: &Value, key: &str) -> Option<String> {
    data.get(key)?.as_str().map(|s| s.to_string())
}

/// Parses an ISO-8601 timestamp carrying a source-local offset and
/// normalizes it to UTC.
fn parse_source_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw).ok().map(|dt| dt.with_timezone(&Utc))
}

/// Re-keys an `Event::Traffic` for pairing lookups. Exposed for the
/// processor (C3), which owns the pairing index itself.
pub fn traffic_pairing_key(event: &TrafficEvent) -> (String, String, String) {
    pairing_key(&event.piece_id, &event.satellite_id, &event.action)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Location as Loc;
    use std::net::IpAddr;

    struct NullLookup;
    impl GeoIpLookup for NullLookup {
        fn lookup(&self, _ip: IpAddr) -> Option<Loc> {
            None
        }
    }

    fn parser() -> Parser {
        Parser::new(Box::new(NullLookup), 5000)
    }

    #[test]
    fn irrelevant_line_is_rejected() {
        let p = parser();
        assert!(p.parse_log_line("2024-01-01T00:00:00Z INFO totally unrelated line", "n1").is_none());
    }

    #[test]
    fn operation_start_is_recognized() {
        let p = parser();
        let line = r#"2024-01-01T00:00:00Z	DEBUG	piecestore	download started	{"Piece ID":"P","Satellite ID":"S","Action":"GET","Available Space":5000000000}"#;
        match p.parse_log_line(line, "n1") {
            Some(Event::OperationStart(start)) => {
                assert_eq!(start.piece_id, "P");
                assert_eq!(start.available_space, Some(5_000_000_000));
            }
            other => panic!("expected OperationStart, got {other:?}"),
        }
    }

    #[test]
    fn traffic_event_success() {
        let p = parser();
        let line = r#"2024-01-01T00:00:00Z	INFO	piecestore	downloaded	{"Piece ID":"P","Satellite ID":"S","Action":"GET","Size":1024,"Remote Address":"1.2.3.4:1"}"#;
        match p.parse_log_line(line, "n1") {
            Some(Event::Traffic(event)) => {
                assert_eq!(event.status.as_str(), "success");
                assert_eq!(event.category.as_str(), "get");
                assert_eq!(event.size, 1024);
                assert_eq!(event.remote_ip, "1.2.3.4");
            }
            other => panic!("expected Traffic, got {other:?}"),
        }
    }

    #[test]
    fn hashstore_finished_compaction() {
        let p = parser();
        let line = r#"2024-01-01T00:00:00Z	INFO	hashstore	finished compaction	{"satellite":"S","store":"pieces","duration":"2m30s","stats":{"DataReclaimed":"100 MB","DataRewritten":"50 MB","Table":{"Load":0.75},"TrashPercent":0.05}}"#;
        match p.parse_log_line(line, "n1") {
            Some(Event::HashstoreEnd { data, .. }) => {
                assert_eq!(data.duration_s, 150.0);
                assert_eq!(data.data_reclaimed_bytes, 100_000_000);
                assert!((data.table_load - 75.0).abs() < 1e-9);
                assert!((data.trash_percent - 5.0).abs() < 1e-9);
            }
            other => panic!("expected HashstoreEnd, got {other:?}"),
        }
    }
}
