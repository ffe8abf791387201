//! Per-node processor (C3): pairs `download/upload started` lines with their
//! terminal traffic events, derives latency, samples storage capacity off
//! piece sizes, and fans finished events out to the store, stats, and
//! broadcast consumers.
//!
//! One `NodeProcessor` runs per monitored node; each owns its own pairing
//! index and storage-sample state so nodes never cross-contaminate each
//! other's derived data.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::broadcast::Broadcaster;
use crate::events::{pairing_key, Event, OperationStart, PairingKey, StorageSnapshot, TrafficEvent};
use crate::pipeline::{EventPipeline, ProcessContext};

/// Cap on the pairing index before the oldest entries are evicted. Mirrors
/// the corpus's bound on `_PENDING_OPS`-style dictionaries to stop a node
/// that never completes operations (crashed piecestore, log gap) from
/// growing this index without bound.
const MAX_PENDING_STARTS: usize = 10_000;

/// Fraction of the pairing index evicted, oldest first, once the cap is hit.
const EVICTION_FRACTION: f64 = 0.2;

/// An `OperationStart` loses its match if nothing pairs with it for this
/// long and is dropped silently rather than kept forever.
const START_EVENT_MAX_AGE_SECS: i64 = 3600;

/// When a terminal event arrives within this many milliseconds of its
/// `OperationStart` (by wall-clock arrival time, not log timestamp), the
/// arrival-time delta is used as the duration; log timestamps on piecestore
/// lines only carry second resolution, so they're too coarse for fast
/// operations. Above the threshold, the two log timestamps are used instead.
const HYBRID_DURATION_ARRIVAL_THRESHOLD_MS: i64 = 4000;

/// Minimum spacing between storage snapshots taken from piece-size deltas.
const STORAGE_SAMPLE_MIN_INTERVAL_SECS: i64 = 300;

/// Minimum cumulative piece-size delta before a new opportunistic storage
/// snapshot is taken, even if the time interval has elapsed.
const STORAGE_SAMPLE_MIN_DELTA_BYTES: i64 = 1024 * 1024 * 1024;

struct PendingStart {
    start: OperationStart,
    inserted_at: DateTime<Utc>,
}

#[derive(Default)]
struct StorageSampleState {
    last_sampled_at: Option<DateTime<Utc>>,
    last_available_bytes: Option<i64>,
}

/// Live, in-memory state exposed to the stats engine / broadcaster for
/// "what is this node doing right now" dashboard views. Not persisted.
#[derive(Default)]
pub struct LiveState {
    pub live_events: Vec<TrafficEvent>,
    pub active_compactions: HashMap<String, DateTime<Utc>>,
    pub has_new_events: bool,
}

pub struct NodeProcessor {
    node_name: String,
    pending_starts: Mutex<HashMap<PairingKey, PendingStart>>,
    storage_state: Mutex<StorageSampleState>,
    live_state: Mutex<LiveState>,
    pipeline: Arc<EventPipeline>,
    broadcaster: Arc<Broadcaster>,
    stats_window_minutes: u64,
}

impl NodeProcessor {
    pub fn new(
        node_name: &str,
        pipeline: Arc<EventPipeline>,
        broadcaster: Arc<Broadcaster>,
        stats_window_minutes: u64,
    ) -> Self {
        Self {
            node_name: node_name.to_string(),
            pending_starts: Mutex::new(HashMap::new()),
            storage_state: Mutex::new(StorageSampleState::default()),
            live_state: Mutex::new(LiveState::default()),
            pipeline,
            broadcaster,
            stats_window_minutes,
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// Handles one parsed event: records pairing state, derives duration and
    /// storage snapshots as needed, and dispatches everything downstream
    /// through the pipeline.
    pub fn handle_event(&self, event: Event, arrival_time: f64) {
        let ctx = ProcessContext::new(&self.node_name);

        match event {
            Event::OperationStart(mut start) => {
                start.arrival_time = arrival_time;
                if let Some(available) = start.available_space {
                    self.record_available_space(available, start.timestamp);
                }
                self.record_start(start);
            }
            Event::Traffic(mut traffic) => {
                traffic.arrival_time = arrival_time;
                self.pair_and_derive_duration(&mut traffic, arrival_time);
                self.record_live_event(&traffic);
                self.pipeline.process(&Event::Traffic(traffic), &ctx);
            }
            Event::HashstoreBegin { key, timestamp } => {
                self.live_state.lock().unwrap().active_compactions.insert(key.clone(), timestamp);
                let snapshot = self.active_compactions_snapshot();
                if let Ok(compactions) = serde_json::to_value(&snapshot) {
                    self.broadcaster.broadcast_active_compactions(compactions);
                }
                self.pipeline.process(&Event::HashstoreBegin { key, timestamp }, &ctx);
            }
            Event::HashstoreEnd { key, data } => {
                self.live_state.lock().unwrap().active_compactions.remove(&key);
                self.pipeline.process(&Event::HashstoreEnd { key, data }, &ctx);
            }
            Event::StorageSnapshot(snap) => {
                self.pipeline.process(&Event::StorageSnapshot(snap), &ctx);
            }
        }

        self.evict_stale_starts();
    }

    fn record_start(&self, start: OperationStart) {
        let key = pairing_key(&start.piece_id, &start.satellite_id, &start.action);
        let mut pending = self.pending_starts.lock().unwrap();

        if pending.len() >= MAX_PENDING_STARTS {
            evict_oldest(&mut pending);
        }

        pending.insert(
            key,
            PendingStart {
                inserted_at: start.timestamp,
                start,
            },
        );
    }

    /// Looks up the matching `OperationStart` for a terminal traffic event
    /// and, if found, derives `duration_ms` using the hybrid rule: prefer
    /// the arrival-time delta when it's under the threshold (sub-second
    /// piecestore operations lose all precision once rounded to the log's
    /// one-second timestamp granularity), otherwise fall back to the
    /// log-timestamp delta.
    fn pair_and_derive_duration(&self, traffic: &mut TrafficEvent, arrival_time: f64) {
        let key = pairing_key(&traffic.piece_id, &traffic.satellite_id, &traffic.action);
        let start = self.pending_starts.lock().unwrap().remove(&key);

        let Some(pending) = start else {
            return;
        };

        if traffic.duration_ms.is_some() {
            return;
        }

        let arrival_delta_ms = ((arrival_time - pending.start.arrival_time) * 1000.0).round() as i64;

        let duration_ms = if pending.start.arrival_time > 0.0 && arrival_delta_ms < HYBRID_DURATION_ARRIVAL_THRESHOLD_MS
        {
            arrival_delta_ms
        } else {
            (traffic.timestamp - pending.start.timestamp).num_milliseconds()
        };

        traffic.duration_ms = Some(duration_ms.max(0));
    }

    /// Called whenever an `OperationStart` carries an `Available Space`
    /// reading. Samples are gated on either enough elapsed time or enough
    /// observed movement since the last sample, so a busy node doesn't
    /// flood the store with near-duplicate rows.
    fn record_available_space(&self, available_bytes: i64, timestamp: DateTime<Utc>) {
        let mut state = self.storage_state.lock().unwrap();
        let due_by_time = state
            .last_sampled_at
            .map(|t| (timestamp - t).num_seconds() >= STORAGE_SAMPLE_MIN_INTERVAL_SECS)
            .unwrap_or(true);
        let due_by_delta = state
            .last_available_bytes
            .map(|prev| (prev - available_bytes).abs() >= STORAGE_SAMPLE_MIN_DELTA_BYTES)
            .unwrap_or(true);

        if !(due_by_time && due_by_delta) {
            return;
        }

        state.last_sampled_at = Some(timestamp);
        state.last_available_bytes = Some(available_bytes);
        drop(state);

        let snapshot = StorageSnapshot {
            timestamp,
            node_name: self.node_name.clone(),
            available_bytes,
            total_bytes: None,
            used_bytes: None,
            trash_bytes: None,
            source: "logs",
        };
        self.pipeline.process(&Event::StorageSnapshot(snapshot), &ProcessContext::new(&self.node_name));
    }

    /// `live_events` is time-ordered; events older than `stats_window_minutes`
    /// are pruned from the front, mirroring the corpus's periodic
    /// `prune_live_events_task` (`cutoff = now - STATS_WINDOW_MINUTES`).
    fn record_live_event(&self, traffic: &TrafficEvent) {
        let mut state = self.live_state.lock().unwrap();
        state.live_events.push(traffic.clone());

        let cutoff = Utc::now() - chrono::Duration::minutes(self.stats_window_minutes as i64);
        let stale = state.live_events.iter().take_while(|e| e.timestamp < cutoff).count();
        if stale > 0 {
            state.live_events.drain(0..stale);
        }

        state.has_new_events = true;
    }

    fn evict_stale_starts(&self) {
        let mut pending = self.pending_starts.lock().unwrap();
        let now = Utc::now();
        pending.retain(|_, v| (now - v.inserted_at).num_seconds() < START_EVENT_MAX_AGE_SECS);
    }

    pub fn pending_start_count(&self) -> usize {
        self.pending_starts.lock().unwrap().len()
    }

    pub fn take_has_new_events(&self) -> bool {
        let mut state = self.live_state.lock().unwrap();
        std::mem::take(&mut state.has_new_events)
    }

    pub fn live_events_snapshot(&self) -> Vec<TrafficEvent> {
        self.live_state.lock().unwrap().live_events.clone()
    }

    pub fn active_compactions_snapshot(&self) -> HashMap<String, DateTime<Utc>> {
        self.live_state.lock().unwrap().active_compactions.clone()
    }
}

fn evict_oldest(pending: &mut HashMap<PairingKey, PendingStart>) {
    let evict_count = ((pending.len() as f64) * EVICTION_FRACTION).ceil() as usize;
    let mut keys: Vec<(PairingKey, DateTime<Utc>)> =
        pending.iter().map(|(k, v)| (k.clone(), v.inserted_at)).collect();
    keys.sort_by_key(|(_, ts)| *ts);
    for (key, _) in keys.into_iter().take(evict_count) {
        pending.remove(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Category, Location, Status};
    use crate::pipeline::EventPipeline;

    fn start(piece: &str, action: &str, ts: DateTime<Utc>, arrival: f64) -> OperationStart {
        OperationStart {
            piece_id: piece.to_string(),
            satellite_id: "S".to_string(),
            action: action.to_string(),
            timestamp: ts,
            arrival_time: arrival,
            available_space: Some(1_000_000),
        }
    }

    fn traffic(piece: &str, action: &str, ts: DateTime<Utc>) -> TrafficEvent {
        TrafficEvent {
            ts_unix: ts.timestamp() as f64,
            timestamp: ts,
            node_name: "n1".to_string(),
            action: action.to_string(),
            category: Category::Get,
            status: Status::Success,
            size: 1024,
            piece_id: piece.to_string(),
            satellite_id: "S".to_string(),
            remote_ip: "1.2.3.4".to_string(),
            location: Location::unknown(),
            error_reason: None,
            duration_ms: None,
            arrival_time: 0.0,
        }
    }

    #[test]
    fn pairs_start_and_traffic_using_log_timestamp_when_slow() {
        let processor = NodeProcessor::new("n1", Arc::new(EventPipeline::new()), Broadcaster::new(std::time::Duration::from_millis(100), 500), 60);
        let t0 = Utc::now();
        processor.handle_event(Event::OperationStart(start("P1", "GET", t0, 0.0)), 0.0);

        let mut out = traffic("P1", "GET", t0 + chrono::Duration::seconds(5));
        processor.pair_and_derive_duration(&mut out, 10.0);
        assert_eq!(out.duration_ms, Some(5000));
    }

    #[test]
    fn pairs_start_and_traffic_using_arrival_time_when_fast() {
        let processor = NodeProcessor::new("n1", Arc::new(EventPipeline::new()), Broadcaster::new(std::time::Duration::from_millis(100), 500), 60);
        let t0 = Utc::now();
        processor.handle_event(Event::OperationStart(start("P2", "GET", t0, 100.0)), 100.0);

        let mut out = traffic("P2", "GET", t0);
        processor.pair_and_derive_duration(&mut out, 100.25);
        assert_eq!(out.duration_ms, Some(250));
    }

    #[test]
    fn unpaired_traffic_keeps_none_duration() {
        let processor = NodeProcessor::new("n1", Arc::new(EventPipeline::new()), Broadcaster::new(std::time::Duration::from_millis(100), 500), 60);
        let mut out = traffic("unknown", "GET", Utc::now());
        processor.pair_and_derive_duration(&mut out, 0.0);
        assert_eq!(out.duration_ms, None);
    }

    #[test]
    fn pending_index_evicts_oldest_when_over_capacity() {
        let processor = NodeProcessor::new("n1", Arc::new(EventPipeline::new()), Broadcaster::new(std::time::Duration::from_millis(100), 500), 60);
        let base = Utc::now() - chrono::Duration::seconds(MAX_PENDING_STARTS as i64);
        for i in 0..MAX_PENDING_STARTS + 10 {
            let ts = base + chrono::Duration::seconds(i as i64);
            processor.handle_event(Event::OperationStart(start(&format!("P{i}"), "GET", ts, i as f64)), i as f64);
        }
        assert!(processor.pending_start_count() <= MAX_PENDING_STARTS);
    }

    #[test]
    fn live_events_prunes_entries_older_than_stats_window() {
        let processor = NodeProcessor::new("n1", Arc::new(EventPipeline::new()), Broadcaster::new(std::time::Duration::from_millis(100), 500), 60);

        let stale_ts = Utc::now() - chrono::Duration::minutes(90);
        processor.handle_event(Event::Traffic(traffic("Pstale", "GET", stale_ts)), 0.0);

        let fresh_ts = Utc::now() - chrono::Duration::minutes(5);
        processor.handle_event(Event::Traffic(traffic("Pfresh", "GET", fresh_ts)), 1.0);

        let snapshot = processor.live_events_snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].piece_id, "Pfresh");
    }
}
