//! Typed events produced by the parser (C2) and consumed by the per-node
//! processor (C3).
//!
//! Mirrors the dynamic `type`-tagged dicts of the original Python
//! implementation as an exhaustive Rust sum type: one variant per line shape
//! the parser recognizes, nothing more.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome category of a traffic event. `GetRepair`/`PutRepair` are kept
/// distinct from plain `Get`/`Put` so repair traffic never pollutes ordinary
/// up/download counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Get,
    Put,
    Audit,
    GetRepair,
    PutRepair,
    Other,
}

impl Category {
    pub fn as_str(self) -> &'static str {
        match self {
            Category::Get => "get",
            Category::Put => "put",
            Category::Audit => "audit",
            Category::GetRepair => "get_repair",
            Category::PutRepair => "put_repair",
            Category::Other => "other",
        }
    }

    /// Categories that feed the performance binner (§4.5).
    pub fn is_performance_relevant(self) -> bool {
        !matches!(self, Category::Other)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Success,
    Failed,
    Canceled,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Success => "success",
            Status::Failed => "failed",
            Status::Canceled => "canceled",
        }
    }
}

/// Resolved geo location for a remote peer's IP, or the "not found" sentinel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub country: String,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
}

impl Location {
    pub fn unknown() -> Self {
        Self {
            country: "Unknown".to_string(),
            lat: None,
            lon: None,
        }
    }
}

/// A completed piece transfer or audit, ready for persistence and broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficEvent {
    pub ts_unix: f64,
    pub timestamp: DateTime<Utc>,
    pub node_name: String,
    pub action: String,
    pub category: Category,
    pub status: Status,
    pub size: i64,
    pub piece_id: String,
    pub satellite_id: String,
    pub remote_ip: String,
    pub location: Location,
    pub error_reason: Option<String>,
    pub duration_ms: Option<i64>,
    /// Populated by the source, used by the processor for hybrid duration
    /// derivation; not persisted.
    #[serde(skip)]
    pub arrival_time: f64,
}

/// A `download started`/`upload started` line, kept in the processor's
/// pairing index until a matching `TrafficEvent` arrives (or it ages out).
#[derive(Debug, Clone)]
pub struct OperationStart {
    pub piece_id: String,
    pub satellite_id: String,
    pub action: String,
    pub timestamp: DateTime<Utc>,
    pub arrival_time: f64,
    pub available_space: Option<i64>,
}

/// Key used to pair an `OperationStart` with its terminal `TrafficEvent`.
pub type PairingKey = (String, String, String);

pub fn pairing_key(piece_id: &str, satellite_id: &str, action: &str) -> PairingKey {
    (
        piece_id.to_string(),
        satellite_id.to_string(),
        action.to_string(),
    )
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HashstoreEnd {
    pub node_name: String,
    pub satellite: String,
    pub store: String,
    pub last_run_iso: String,
    pub duration_s: f64,
    pub data_reclaimed_bytes: i64,
    pub data_rewritten_bytes: i64,
    pub table_load: f64,
    pub trash_percent: f64,
}

/// A log-derived capacity reading (`source = "logs"`); only `available_bytes`
/// is known, the rest are left `None` per §3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSnapshot {
    pub timestamp: DateTime<Utc>,
    pub node_name: String,
    pub available_bytes: i64,
    pub total_bytes: Option<i64>,
    pub used_bytes: Option<i64>,
    pub trash_bytes: Option<i64>,
    pub source: &'static str,
}

/// A satellite reputation reading, polled from a node's admin API (C7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReputationSnapshot {
    pub node_name: String,
    pub satellite_id: String,
    pub audit_score: f64,
    pub suspension_score: f64,
    pub online_score: f64,
    pub disqualified: bool,
    pub suspended: bool,
    pub sampled_at: DateTime<Utc>,
}

/// Per-node connectivity state, recomputed from C1's and C7's self-reported
/// state and broadcast by C6. Not persisted; lives only in process memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub node_name: String,
    pub source_connected: bool,
    pub last_line_at: Option<DateTime<Utc>>,
    pub api_connected: bool,
    pub last_api_error: Option<String>,
}

/// The parser's output: one variant per recognized line shape. A parse
/// failure or an irrelevant line simply yields `None` from the parser, never
/// a variant of this enum.
#[derive(Debug, Clone)]
pub enum Event {
    OperationStart(OperationStart),
    Traffic(TrafficEvent),
    HashstoreBegin {
        key: String,
        timestamp: DateTime<Utc>,
    },
    HashstoreEnd {
        key: String,
        data: HashstoreEnd,
    },
    /// Emitted by the processor (not the parser) when an `OperationStart`'s
    /// `Available Space` field yields a fresh log-derived capacity sample.
    StorageSnapshot(StorageSnapshot),
}
