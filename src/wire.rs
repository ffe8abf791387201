//! Wire protocol exchanged with dashboard websocket clients (§6).
//!
//! Server → client and client → server messages are both tagged JSON
//! objects (`{"type": "...", ...}`), dispatched with serde's internally
//! tagged enum representation so the websocket layer never hand-rolls
//! dispatch on a bare string.

use serde::{Deserialize, Serialize};

/// A node's display name, or the special aggregate-of-all-nodes view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum View {
    Aggregate(AggregateTag),
    Nodes(Vec<String>),
}

/// Serializes/deserializes as the bare string `"Aggregate"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregateTag;

impl Serialize for AggregateTag {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("Aggregate")
    }
}

impl<'de> Deserialize<'de> for AggregateTag {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        if s == "Aggregate" {
            Ok(AggregateTag)
        } else {
            Err(serde::de::Error::custom("expected \"Aggregate\""))
        }
    }
}

impl View {
    pub fn matches_node(&self, node_name: &str) -> bool {
        match self {
            View::Aggregate(_) => true,
            View::Nodes(names) => names.iter().any(|n| n == node_name),
        }
    }

    pub fn aggregate() -> Self {
        View::Aggregate(AggregateTag)
    }
}

/// A single dashboard-facing event row, batched by the broadcaster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub action: String,
    pub size: i64,
    pub country: String,
    pub timestamp: String,
    pub node_name: String,
    /// Milliseconds since the first record in this batch arrived.
    pub arrival_offset_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSummary {
    pub name: String,
    pub source_connected: bool,
    pub api_connected: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "init")]
    Init { nodes: Vec<NodeSummary> },
    #[serde(rename = "stats_update")]
    StatsUpdate { payload: serde_json::Value },
    #[serde(rename = "log_entry_batch")]
    LogEntryBatch { events: Vec<LogEntry> },
    #[serde(rename = "performance_batch_update")]
    PerformanceBatchUpdate { node_name: String, bins: serde_json::Value },
    #[serde(rename = "active_compactions")]
    ActiveCompactions { compactions: serde_json::Value },
    #[serde(rename = "hashstore_updated")]
    HashstoreUpdated { node_name: String },
    #[serde(rename = "connection_status")]
    ConnectionStatus { nodes: Vec<NodeSummary> },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "set_view")]
    SetView { view: View },
    #[serde(rename = "get_historical_performance")]
    GetHistoricalPerformance { view: View, points: u32, interval_sec: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_view_aggregate_round_trips() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"set_view","view":"Aggregate"}"#).unwrap();
        match msg {
            ClientMessage::SetView { view } => assert_eq!(view, View::aggregate()),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn set_view_node_list_round_trips() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"set_view","view":["n1","n2"]}"#).unwrap();
        match msg {
            ClientMessage::SetView { view } => assert_eq!(view, View::Nodes(vec!["n1".into(), "n2".into()])),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn server_message_tags_as_expected() {
        let msg = ServerMessage::HashstoreUpdated { node_name: "n1".into() };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "hashstore_updated");
        assert_eq!(json["node_name"], "n1");
    }

    #[test]
    fn view_matches_node() {
        assert!(View::aggregate().matches_node("anything"));
        let v = View::Nodes(vec!["n1".into()]);
        assert!(v.matches_node("n1"));
        assert!(!v.matches_node("n2"));
    }
}
