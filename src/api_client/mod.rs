//! API Collaborator (C7): polls a node's admin API for reputation,
//! storage, and payout data, writing results through the store and
//! reporting per-node connectivity failures without ever affecting
//! ingest.
//!
//! Grounded in `storj_api_client.py`'s `StorjNodeAPIClient` and
//! `auto_discover_api_endpoint`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::connection::ConnectionTracker;
use crate::events::ReputationSnapshot;
use crate::store::{Store, WriteRecord};

const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(2);
const REPUTATION_POLL_INTERVAL: Duration = Duration::from_secs(3600);
const STORAGE_POLL_INTERVAL: Duration = Duration::from_secs(300);
const EARNINGS_POLL_INTERVAL: Duration = Duration::from_secs(86_400);

#[derive(Debug, Deserialize)]
struct DashboardResponse {
    #[serde(rename = "nodeID")]
    node_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SatelliteEntry {
    id: String,
    disqualified: bool,
    suspended: bool,
    audit: ScoreBlock,
    suspension: ScoreBlock,
    online: ScoreBlock,
}

#[derive(Debug, Deserialize)]
struct ScoreBlock {
    score: f64,
}

/// Per-node client state, tracked so connection status reflects the
/// latest poll outcome without the API collaborator touching ingest.
pub struct ApiClient {
    node_name: String,
    endpoint: String,
    client: reqwest::Client,
    available: AtomicBool,
    last_error: Mutex<Option<String>>,
    tracker: Option<Arc<ConnectionTracker>>,
}

impl ApiClient {
    pub fn new(node_name: &str, endpoint: &str, timeout: Duration) -> Self {
        let client = reqwest::Client::builder().timeout(timeout).build().unwrap_or_default();
        Self {
            node_name: node_name.to_string(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            client,
            available: AtomicBool::new(false),
            last_error: Mutex::new(None),
            tracker: None,
        }
    }

    pub fn with_tracker(mut self, tracker: Arc<ConnectionTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Relaxed)
    }

    pub async fn last_error(&self) -> Option<String> {
        self.last_error.lock().await.clone()
    }

    async fn record_error(&self, err: impl std::fmt::Display) {
        self.available.store(false, Ordering::Relaxed);
        let message = err.to_string();
        *self.last_error.lock().await = Some(message.clone());
        if let Some(tracker) = &self.tracker {
            tracker.mark_api_status(&self.node_name, false, Some(message));
        }
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Option<T> {
        let url = format!("{}{}", self.endpoint, path);
        match self.client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => match resp.json::<T>().await {
                Ok(value) => {
                    self.available.store(true, Ordering::Relaxed);
                    if let Some(tracker) = &self.tracker {
                        tracker.mark_api_status(&self.node_name, true, None);
                    }
                    Some(value)
                }
                Err(e) => {
                    self.record_error(e).await;
                    None
                }
            },
            Ok(resp) => {
                self.record_error(format!("status {}", resp.status())).await;
                None
            }
            Err(e) => {
                self.record_error(e).await;
                None
            }
        }
    }

    /// Verifies connectivity by probing `/api/sno`.
    pub async fn verify(&self) -> bool {
        match self.get_json::<DashboardResponse>("/api/sno").await {
            Some(resp) => resp.node_id.is_some(),
            None => false,
        }
    }

    async fn poll_reputation(&self, store: &Store) {
        let Some(satellites) = self.get_json::<std::collections::HashMap<String, SatelliteEntry>>("/api/sno/satellites").await else {
            return;
        };
        for (satellite_key, entry) in satellites {
            let satellite_id = if entry.id.is_empty() { satellite_key } else { entry.id.clone() };
            let snapshot = ReputationSnapshot {
                node_name: self.node_name.clone(),
                satellite_id,
                audit_score: entry.audit.score,
                suspension_score: entry.suspension.score,
                online_score: entry.online.score,
                disqualified: entry.disqualified,
                suspended: entry.suspended,
                sampled_at: Utc::now(),
            };
            if let Err(e) = store.submit(WriteRecord::Reputation(snapshot)) {
                tracing::warn!("[{}] failed to submit reputation snapshot: {}", self.node_name, e);
            }
        }
    }

    async fn poll_earnings(&self, store: &Store) {
        let Some(payload) = self.get_json::<serde_json::Value>("/api/sno/estimated-payout").await else {
            return;
        };
        let key = format!("payout_{}", self.node_name);
        let value = payload.to_string();
        if let Err(e) = store.submit(WriteRecord::PersistentState { key, value }) {
            tracing::warn!("[{}] failed to persist payout blob: {}", self.node_name, e);
        }
    }
}

/// Discovers a node's admin API endpoint per §4.7: an explicit
/// `api_endpoint` wins outright; otherwise a file-sourced node tries the
/// loopback candidates, and a network-sourced node tries the same host
/// only when remote API access is explicitly permitted.
pub async fn discover_endpoint(
    explicit: Option<&str>,
    is_network_source: bool,
    host: Option<&str>,
    default_port: u16,
    allow_remote_api: bool,
) -> Option<String> {
    if let Some(endpoint) = explicit {
        return Some(endpoint.to_string());
    }

    let candidates: Vec<String> = if is_network_source {
        let host = host?;
        if !allow_remote_api && !is_localhost(host) {
            tracing::warn!("remote API access disabled for {host}; set ALLOW_REMOTE_API to enable");
            return None;
        }
        vec![format!("http://{host}:{default_port}")]
    } else {
        vec![format!("http://localhost:{default_port}"), format!("http://127.0.0.1:{default_port}")]
    };

    let probe_client = reqwest::Client::builder().timeout(DISCOVERY_TIMEOUT).build().ok()?;

    for candidate in candidates {
        let url = format!("{candidate}/api/sno");
        if let Ok(resp) = probe_client.get(&url).send().await {
            if resp.status().is_success() {
                if let Ok(data) = resp.json::<DashboardResponse>().await {
                    if data.node_id.is_some() {
                        return Some(candidate);
                    }
                }
            }
        }
    }

    None
}

fn is_localhost(host: &str) -> bool {
    matches!(host, "localhost" | "127.0.0.1" | "::1" | "0.0.0.0")
}

/// Runs the three polling loops for one node's API client until cancelled.
pub fn spawn_polling_loops(client: Arc<ApiClient>, store: Arc<Store>) -> Vec<tokio::task::JoinHandle<()>> {
    let reputation_client = client.clone();
    let reputation_store = store.clone();
    let reputation_handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(REPUTATION_POLL_INTERVAL);
        loop {
            interval.tick().await;
            reputation_client.poll_reputation(&reputation_store).await;
        }
    });

    let storage_client = client.clone();
    let storage_handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(STORAGE_POLL_INTERVAL);
        loop {
            interval.tick().await;
            let _ = storage_client.get_json::<serde_json::Value>("/api/sno").await;
        }
    });

    let earnings_client = client;
    let earnings_store = store;
    let earnings_handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(EARNINGS_POLL_INTERVAL);
        loop {
            interval.tick().await;
            earnings_client.poll_earnings(&earnings_store).await;
        }
    });

    vec![reputation_handle, storage_handle, earnings_handle]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn localhost_variants_are_recognized() {
        assert!(is_localhost("localhost"));
        assert!(is_localhost("127.0.0.1"));
        assert!(!is_localhost("10.0.0.5"));
    }

    #[tokio::test]
    async fn discovery_returns_explicit_endpoint_without_probing() {
        let result = discover_endpoint(Some("http://example:9999"), false, None, 14002, false).await;
        assert_eq!(result, Some("http://example:9999".to_string()));
    }

    #[tokio::test]
    async fn remote_discovery_denied_without_allow_flag() {
        let result = discover_endpoint(None, true, Some("10.0.0.5"), 14002, false).await;
        assert_eq!(result, None);
    }
}
