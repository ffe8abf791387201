//! Broadcaster (C6): batches dashboard-facing `log_entry` records and
//! fans out immediate notifications (active compactions, hashstore
//! updates, connection status) to subscribed websocket clients.
//!
//! A slow or closed subscriber is dropped on its first send failure; it
//! never blocks delivery to the others. All bookkeeping uses plain
//! `std::sync::Mutex`: every mutation is a quick map/vec edit plus a
//! non-blocking channel `send`, so there's no need to drag the async
//! runtime into call sites like the per-node processor, which pushes log
//! entries from synchronous code.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedSender};

use crate::events::Event;
use crate::pipeline::{EventProcessor, ProcessContext, ProcessResult};
use crate::wire::{LogEntry, NodeSummary, ServerMessage, View};

struct Subscriber {
    sender: UnboundedSender<ServerMessage>,
    view: View,
}

struct QueuedLogEntry {
    entry: LogEntry,
    arrival: std::time::Instant,
}

pub struct Broadcaster {
    subscribers: Mutex<HashMap<u64, Subscriber>>,
    next_id: AtomicU64,
    queue: Mutex<Vec<QueuedLogEntry>>,
    batch_interval: Duration,
    batch_size: usize,
}

impl Broadcaster {
    pub fn new(batch_interval: Duration, batch_size: usize) -> Arc<Self> {
        Arc::new(Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            queue: Mutex::new(Vec::new()),
            batch_interval,
            batch_size,
        })
    }

    /// Registers a new subscriber, returning its id and receiving end of
    /// the outbound message channel.
    pub fn subscribe(&self, initial_view: View) -> (u64, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().unwrap().insert(id, Subscriber { sender: tx, view: initial_view });
        (id, rx)
    }

    pub fn set_view(&self, id: u64, view: View) {
        if let Some(sub) = self.subscribers.lock().unwrap().get_mut(&id) {
            sub.view = view;
        }
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.lock().unwrap().remove(&id);
    }

    /// Enqueues a dashboard log-entry row for the next batch flush.
    pub fn push_log_entry(&self, entry: LogEntry) {
        self.queue.lock().unwrap().push(QueuedLogEntry { entry, arrival: std::time::Instant::now() });
    }

    fn flush_batches(&self) {
        let drained: Vec<QueuedLogEntry> = {
            let mut queue = self.queue.lock().unwrap();
            if queue.is_empty() {
                return;
            }
            queue.drain(..).collect()
        };

        let first_arrival = drained[0].arrival;
        let mut by_node: HashMap<String, Vec<LogEntry>> = HashMap::new();
        for queued in drained {
            let offset_ms = queued.arrival.saturating_duration_since(first_arrival).as_millis() as i64;
            let mut entry = queued.entry;
            entry.arrival_offset_ms = offset_ms;
            by_node.entry(entry.node_name.clone()).or_default().push(entry);
        }

        let mut dead = Vec::new();
        {
            let subs = self.subscribers.lock().unwrap();
            for (&id, sub) in subs.iter() {
                let mut matching: Vec<LogEntry> = by_node
                    .iter()
                    .filter(|(node, _)| sub.view.matches_node(node))
                    .flat_map(|(_, v)| v.clone())
                    .collect();
                if matching.is_empty() {
                    continue;
                }
                matching.sort_by_key(|e| e.arrival_offset_ms);
                for chunk in matching.chunks(self.batch_size) {
                    let msg = ServerMessage::LogEntryBatch { events: chunk.to_vec() };
                    if sub.sender.send(msg).is_err() {
                        dead.push(id);
                    }
                }
            }
        }

        if !dead.is_empty() {
            let mut subs = self.subscribers.lock().unwrap();
            for id in dead {
                subs.remove(&id);
            }
        }
    }

    /// Spawns the periodic batch-flush task. Runs until the returned
    /// handle is aborted.
    pub fn spawn_batcher(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(this.batch_interval);
            loop {
                interval.tick().await;
                this.flush_batches();
            }
        })
    }

    fn broadcast_to_all(&self, msg: ServerMessage) {
        let mut dead = Vec::new();
        {
            let subs = self.subscribers.lock().unwrap();
            for (&id, sub) in subs.iter() {
                if sub.sender.send(msg.clone()).is_err() {
                    dead.push(id);
                }
            }
        }
        if !dead.is_empty() {
            let mut subs = self.subscribers.lock().unwrap();
            for id in dead {
                subs.remove(&id);
            }
        }
    }

    pub fn broadcast_active_compactions(&self, compactions: serde_json::Value) {
        self.broadcast_to_all(ServerMessage::ActiveCompactions { compactions });
    }

    pub fn broadcast_hashstore_updated(&self, node_name: &str) {
        self.broadcast_to_all(ServerMessage::HashstoreUpdated { node_name: node_name.to_string() });
    }

    pub fn broadcast_connection_status(&self, nodes: Vec<NodeSummary>) {
        self.broadcast_to_all(ServerMessage::ConnectionStatus { nodes });
    }

    /// Returns the id and current view of every connected subscriber.
    pub fn distinct_views(&self) -> Vec<(u64, View)> {
        self.subscribers.lock().unwrap().iter().map(|(&id, sub)| (id, sub.view.clone())).collect()
    }

    pub fn send_to(&self, id: u64, msg: ServerMessage) {
        let subs = self.subscribers.lock().unwrap();
        if let Some(sub) = subs.get(&id) {
            let _ = sub.sender.send(msg);
        }
    }
}

impl EventProcessor for Broadcaster {
    fn name(&self) -> &'static str {
        "broadcaster"
    }

    /// Traffic events become a batched `log_entry` row; a finished hashstore
    /// compaction becomes an immediate `hashstore_updated` notice. Pairing
    /// starts and log-derived storage snapshots aren't dashboard-facing on
    /// their own and are skipped. The active-compactions snapshot itself is
    /// pushed directly by the processor, since it needs the node's full
    /// in-memory compaction map rather than just the event that triggered it.
    fn process(&self, event: &Event, ctx: &ProcessContext) -> ProcessResult {
        match event {
            Event::Traffic(traffic) => {
                self.push_log_entry(LogEntry {
                    action: traffic.action.clone(),
                    size: traffic.size,
                    country: traffic.location.country.clone(),
                    timestamp: traffic.timestamp.to_rfc3339(),
                    node_name: traffic.node_name.clone(),
                    arrival_offset_ms: 0,
                });
            }
            Event::HashstoreEnd { .. } => {
                self.broadcast_hashstore_updated(&ctx.node_name);
            }
            Event::OperationStart(_) | Event::HashstoreBegin { .. } | Event::StorageSnapshot(_) => {}
        }
        ProcessResult::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn batch_delivers_only_to_matching_view() {
        let b = Broadcaster::new(Duration::from_millis(10), 500);
        let (id_a, mut rx_a) = b.subscribe(View::aggregate());
        let (_id_b, mut rx_b) = b.subscribe(View::Nodes(vec!["n2".into()]));

        b.push_log_entry(LogEntry {
            action: "GET".into(),
            size: 10,
            country: "US".into(),
            timestamp: "2024-01-01T00:00:00Z".into(),
            node_name: "n1".into(),
            arrival_offset_ms: 0,
        });

        b.flush_batches();

        let msg_a = tokio::time::timeout(Duration::from_millis(100), rx_a.recv()).await.unwrap().unwrap();
        match msg_a {
            ServerMessage::LogEntryBatch { events } => assert_eq!(events.len(), 1),
            _ => panic!("expected batch"),
        }

        let msg_b = tokio::time::timeout(Duration::from_millis(50), rx_b.recv()).await;
        assert!(msg_b.is_err(), "node-scoped subscriber should not receive n1 events");

        let _ = id_a;
    }

    #[tokio::test]
    async fn dropped_receiver_is_removed_on_next_broadcast() {
        let b = Broadcaster::new(Duration::from_millis(10), 500);
        let (id, rx) = b.subscribe(View::aggregate());
        drop(rx);

        b.broadcast_hashstore_updated("n1");
        assert!(b.subscribers.lock().unwrap().get(&id).is_none());
    }
}
