//! HTTP/websocket surface: the dashboard upgrade route and a liveness
//! probe, following the teacher's `axum::Router` convention of a handful
//! of plain `GET` routes alongside the main surface.

use std::sync::Arc;

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    response::IntoResponse,
    routing::get,
    Router,
};
use chrono::{Duration as ChronoDuration, Utc};
use futures::{SinkExt, StreamExt};

use crate::broadcast::Broadcaster;
use crate::store::Store;
use crate::wire::{ClientMessage, NodeSummary, ServerMessage, View};

#[derive(Clone)]
pub struct AppState {
    pub broadcaster: Arc<Broadcaster>,
    pub store: Store,
    pub node_names: Vec<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new().route("/ws", get(ws_handler)).route("/healthz", get(healthz)).with_state(state)
}

async fn healthz() -> impl IntoResponse {
    "ok"
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let (id, mut outbound) = state.broadcaster.subscribe(View::aggregate());

    // Broadcast pushes and one-off query replies (historical performance)
    // are funneled through the same local channel so a single send loop
    // drives the socket.
    let (reply_tx, mut reply_rx) = tokio::sync::mpsc::unbounded_channel::<ServerMessage>();

    let init = ServerMessage::Init {
        nodes: state
            .node_names
            .iter()
            .map(|n| NodeSummary { name: n.clone(), source_connected: true, api_connected: false })
            .collect(),
    };
    if let Ok(text) = serde_json::to_string(&init) {
        if sender.send(Message::Text(text)).await.is_err() {
            state.broadcaster.unsubscribe(id);
            return;
        }
    }

    let forward_tx = reply_tx.clone();
    let forward_task = tokio::spawn(async move {
        while let Some(msg) = outbound.recv().await {
            if forward_tx.send(msg).is_err() {
                break;
            }
        }
    });

    let broadcaster_for_recv = state.broadcaster.clone();
    let store_for_recv = state.store.clone();
    let node_names = state.node_names.clone();
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            let Message::Text(text) = msg else {
                continue;
            };
            match serde_json::from_str::<ClientMessage>(&text) {
                Ok(ClientMessage::SetView { view }) => {
                    broadcaster_for_recv.set_view(id, view);
                }
                Ok(ClientMessage::GetHistoricalPerformance { view, points, interval_sec }) => {
                    serve_historical_performance(&store_for_recv, &node_names, &view, points, interval_sec, &reply_tx)
                        .await;
                }
                Err(e) => {
                    tracing::debug!("discarding unrecognized client message: {e}");
                }
            }
        }
    });

    let send_task = tokio::spawn(async move {
        while let Some(msg) = reply_rx.recv().await {
            if let Ok(text) = serde_json::to_string(&msg) {
                if sender.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = forward_task => {},
        _ = recv_task => {},
        _ = send_task => {},
    }

    state.broadcaster.unsubscribe(id);
}

/// Answers a `get_historical_performance` request by reading the store's
/// `hourly_stats` rollup for every node the requested view matches, one
/// `PerformanceBatchUpdate` per node. Runs the blocking SQLite read on a
/// blocking-pool thread so it never stalls the socket's async tasks.
async fn serve_historical_performance(
    store: &Store,
    node_names: &[String],
    view: &View,
    points: u32,
    interval_sec: u64,
    reply_tx: &tokio::sync::mpsc::UnboundedSender<ServerMessage>,
) {
    let to = Utc::now();
    let span_secs = (points as i64).max(1) * (interval_sec as i64).max(1);
    let from = to - ChronoDuration::seconds(span_secs);

    for node_name in node_names.iter().filter(|n| view.matches_node(n)) {
        let store = store.clone();
        let name = node_name.clone();
        let rows = tokio::task::spawn_blocking(move || store.hourly_stats_range(&name, from, to)).await;
        let rows = match rows {
            Ok(Ok(rows)) => rows,
            Ok(Err(e)) => {
                tracing::warn!("historical performance query failed for {node_name}: {e}");
                continue;
            }
            Err(e) => {
                tracing::warn!("historical performance query task panicked for {node_name}: {e}");
                continue;
            }
        };
        if let Ok(bins) = serde_json::to_value(&rows) {
            let _ = reply_tx.send(ServerMessage::PerformanceBatchUpdate { node_name: node_name.clone(), bins });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreConfig;
    use std::time::Duration;
    use tower::ServiceExt;

    fn test_store() -> Store {
        let dir = tempfile::tempdir().unwrap();
        Store::open(StoreConfig {
            database_file: dir.path().join("test.sqlite"),
            write_batch_interval: Duration::from_secs(1),
            queue_max_size: 100,
            events_retention_days: 2,
            hashstore_retention_days: 30,
            prune_interval: Duration::from_secs(3600),
            hourly_agg_interval: Duration::from_secs(600),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn historical_performance_replies_per_matching_node() {
        let store = test_store();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        serve_historical_performance(
            &store,
            &["n1".to_string(), "n2".to_string()],
            &View::Nodes(vec!["n1".to_string()]),
            24,
            3600,
            &tx,
        )
        .await;
        drop(tx);

        let mut replies = Vec::new();
        while let Some(msg) = rx.recv().await {
            replies.push(msg);
        }
        assert_eq!(replies.len(), 1);
        match &replies[0] {
            ServerMessage::PerformanceBatchUpdate { node_name, bins } => {
                assert_eq!(node_name, "n1");
                assert!(bins.as_array().unwrap().is_empty());
            }
            other => panic!("expected PerformanceBatchUpdate, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn router_serves_healthz() {
        let broadcaster = Broadcaster::new(Duration::from_millis(100), 500);
        let state = AppState { broadcaster, store: test_store(), node_names: vec!["n1".into()] };
        let app = router(state);

        let response = app
            .oneshot(axum::http::Request::builder().uri("/healthz").body(axum::body::Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
    }
}
