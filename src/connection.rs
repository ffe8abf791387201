//! Connection status tracker: merges the Log Source's and API
//! Collaborator's self-reported per-node state into the periodic
//! `connection_status` broadcast (§4.6).
//!
//! Neither C1 nor C7 broadcasts directly; both just update their slot here,
//! and a single timer drains the whole table every few seconds.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;

use crate::broadcast::Broadcaster;
use crate::events::ConnectionStatus;
use crate::wire::NodeSummary;
use std::sync::Arc;

const CONNECTION_STATUS_INTERVAL: Duration = Duration::from_secs(5);

pub struct ConnectionTracker {
    nodes: Mutex<HashMap<String, ConnectionStatus>>,
}

impl ConnectionTracker {
    pub fn new(node_names: &[String]) -> Arc<Self> {
        let mut nodes = HashMap::new();
        for name in node_names {
            nodes.insert(
                name.clone(),
                ConnectionStatus {
                    node_name: name.clone(),
                    source_connected: false,
                    last_line_at: None,
                    api_connected: false,
                    last_api_error: None,
                },
            );
        }
        Arc::new(Self { nodes: Mutex::new(nodes) })
    }

    pub fn mark_source_connected(&self, node_name: &str) {
        let mut nodes = self.nodes.lock().unwrap();
        if let Some(entry) = nodes.get_mut(node_name) {
            entry.source_connected = true;
            entry.last_line_at = Some(Utc::now());
        }
    }

    pub fn mark_source_disconnected(&self, node_name: &str) {
        let mut nodes = self.nodes.lock().unwrap();
        if let Some(entry) = nodes.get_mut(node_name) {
            entry.source_connected = false;
        }
    }

    pub fn mark_api_status(&self, node_name: &str, connected: bool, last_error: Option<String>) {
        let mut nodes = self.nodes.lock().unwrap();
        if let Some(entry) = nodes.get_mut(node_name) {
            entry.api_connected = connected;
            if last_error.is_some() {
                entry.last_api_error = last_error;
            }
        }
    }

    pub fn snapshot(&self) -> Vec<NodeSummary> {
        self.nodes
            .lock()
            .unwrap()
            .values()
            .map(|s| NodeSummary {
                name: s.node_name.clone(),
                source_connected: s.source_connected,
                api_connected: s.api_connected,
            })
            .collect()
    }

    /// Spawns the periodic broadcast loop. Runs until cancelled.
    pub fn spawn_broadcast_loop(self: &Arc<Self>, broadcaster: Arc<Broadcaster>) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(CONNECTION_STATUS_INTERVAL);
            loop {
                interval.tick().await;
                broadcaster.broadcast_connection_status(this.snapshot());
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_disconnected_for_known_nodes() {
        let tracker = ConnectionTracker::new(&["n1".to_string()]);
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert!(!snapshot[0].source_connected);
    }

    #[test]
    fn marking_connected_updates_snapshot() {
        let tracker = ConnectionTracker::new(&["n1".to_string()]);
        tracker.mark_source_connected("n1");
        tracker.mark_api_status("n1", true, None);
        let snapshot = tracker.snapshot();
        assert!(snapshot[0].source_connected);
        assert!(snapshot[0].api_connected);
    }

    #[test]
    fn unknown_node_updates_are_ignored() {
        let tracker = ConnectionTracker::new(&["n1".to_string()]);
        tracker.mark_source_connected("ghost");
        assert!(tracker.snapshot().iter().all(|s| s.name != "ghost"));
    }
}
