//! Stats Engine (C5): maintains one `IncrementalStats` accumulator per
//! distinct view held by a connected dashboard, advancing each from the
//! tail of the relevant nodes' `live_events` and periodically publishing a
//! merged snapshot.

mod templates;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::broadcast::Broadcaster;
use crate::events::{Category, Status, TrafficEvent};
use crate::parser::get_size_bucket;
use crate::processor::NodeProcessor;
use crate::store::{HourlyStatsRow, Store};
use crate::wire::{ServerMessage, View};
use templates::ErrorTemplateTracker;

/// How far back `tick()` reads `hourly_stats` to combine with the live
/// counters (§4.5 step 4).
const HISTORY_WINDOW_HOURS: i64 = 24;

/// Summed `hourly_stats` rows for a view's matched nodes over the history
/// window.
#[derive(Default)]
struct HistoryTotals {
    dl_success: i64,
    dl_fail: i64,
    ul_success: i64,
    ul_fail: i64,
    audit_success: i64,
    audit_fail: i64,
    total_download_size: i64,
    total_upload_size: i64,
}

impl HistoryTotals {
    fn add_row(&mut self, row: &HourlyStatsRow) {
        self.dl_success += row.dl_success;
        self.dl_fail += row.dl_fail;
        self.ul_success += row.ul_success;
        self.ul_fail += row.ul_fail;
        self.audit_success += row.audit_success;
        self.audit_fail += row.audit_fail;
        self.total_download_size += row.total_download_size;
        self.total_upload_size += row.total_upload_size;
    }
}

/// Rolling counters accumulated from a view's merged event tail. Never
/// reset; each update folds in only the newly observed events for that
/// view's subscribed nodes.
#[derive(Default)]
pub struct IncrementalStats {
    last_processed_index: HashMap<String, usize>,
    category_success: HashMap<&'static str, u64>,
    category_fail: HashMap<&'static str, u64>,
    per_satellite: HashMap<String, u64>,
    per_size_bucket: HashMap<&'static str, u64>,
    per_country_bytes: HashMap<String, i64>,
    top_pieces: HashMap<String, (u64, i64)>,
    error_templates: ErrorTemplateTracker,
    recent_window: Vec<(f64, i64)>,
}

const THROUGHPUT_WINDOW_SECS: f64 = 60.0;

impl IncrementalStats {
    fn ingest(&mut self, node_name: &str, events: &[TrafficEvent]) {
        for event in events {
            match event.status {
                Status::Success => *self.category_success.entry(event.category.as_str()).or_default() += 1,
                Status::Failed | Status::Canceled => *self.category_fail.entry(event.category.as_str()).or_default() += 1,
            }
            *self.per_satellite.entry(event.satellite_id.clone()).or_default() += 1;
            *self.per_size_bucket.entry(get_size_bucket(event.size)).or_default() += 1;
            *self.per_country_bytes.entry(event.location.country.clone()).or_default() += event.size;

            let piece_entry = self.top_pieces.entry(event.piece_id.clone()).or_insert((0, 0));
            piece_entry.0 += 1;
            piece_entry.1 += event.size;

            if let Some(reason) = &event.error_reason {
                self.error_templates.record(reason);
            }

            self.recent_window.push((event.ts_unix, event.size));
        }

        let _ = node_name;
        self.trim_recent_window();
    }

    fn trim_recent_window(&mut self) {
        if let Some(&(latest, _)) = self.recent_window.last() {
            self.recent_window.retain(|(ts, _)| latest - ts <= THROUGHPUT_WINDOW_SECS);
        }
    }

    fn throughput_bytes_per_sec(&self) -> f64 {
        if self.recent_window.len() < 2 {
            return 0.0;
        }
        let total: i64 = self.recent_window.iter().map(|(_, size)| size).sum();
        let span = (self.recent_window.last().unwrap().0 - self.recent_window.first().unwrap().0).max(1.0);
        total as f64 / span
    }

    /// Folds `history` (summed `hourly_stats` rows) onto a copy of the live
    /// per-category counters, approximating the historical dl/ul split as
    /// get/put since `hourly_stats` doesn't retain the repair distinction.
    fn combined_category_totals(&self, history: &HistoryTotals) -> (HashMap<&'static str, u64>, HashMap<&'static str, u64>) {
        let mut success = self.category_success.clone();
        let mut fail = self.category_fail.clone();
        *success.entry(Category::Get.as_str()).or_default() += history.dl_success.max(0) as u64;
        *fail.entry(Category::Get.as_str()).or_default() += history.dl_fail.max(0) as u64;
        *success.entry(Category::Put.as_str()).or_default() += history.ul_success.max(0) as u64;
        *fail.entry(Category::Put.as_str()).or_default() += history.ul_fail.max(0) as u64;
        *success.entry(Category::Audit.as_str()).or_default() += history.audit_success.max(0) as u64;
        *fail.entry(Category::Audit.as_str()).or_default() += history.audit_fail.max(0) as u64;
        (success, fail)
    }

    fn to_payload(&self, history: &HistoryTotals) -> serde_json::Value {
        let (combined_success, combined_fail) = self.combined_category_totals(history);

        serde_json::json!({
            "category_success": combined_success,
            "category_fail": combined_fail,
            "live_category_success": self.category_success,
            "live_category_fail": self.category_fail,
            "per_satellite": self.per_satellite,
            "per_size_bucket": self.per_size_bucket,
            "per_country_bytes": self.per_country_bytes,
            "top_pieces": self.top_pieces.iter().map(|(k, (count, size))| {
                serde_json::json!({"piece_id": k, "count": count, "size": size})
            }).collect::<Vec<_>>(),
            "top_error_templates": self.error_templates.top(10),
            "throughput_bytes_per_sec": self.throughput_bytes_per_sec(),
            "history_bytes": {
                "download": history.total_download_size,
                "upload": history.total_upload_size,
            },
        })
    }
}

/// Identifies a distinct `View` for the purpose of grouping subscribers
/// that can share one `IncrementalStats` accumulator.
fn view_key(view: &View) -> String {
    match view {
        View::Aggregate(_) => "Aggregate".to_string(),
        View::Nodes(names) => {
            let mut sorted = names.clone();
            sorted.sort();
            sorted.join(",")
        }
    }
}

pub struct StatsEngine {
    node_processors: HashMap<String, Arc<NodeProcessor>>,
    store: Arc<Store>,
    broadcaster: Arc<Broadcaster>,
    interval: Duration,
    per_view: Mutex<HashMap<String, (View, IncrementalStats)>>,
}

impl StatsEngine {
    pub fn new(
        node_processors: HashMap<String, Arc<NodeProcessor>>,
        store: Arc<Store>,
        broadcaster: Arc<Broadcaster>,
        interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            node_processors,
            store,
            broadcaster,
            interval,
            per_view: Mutex::new(HashMap::new()),
        })
    }

    /// Runs the periodic tick loop until cancelled.
    pub fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(this.interval);
            loop {
                interval.tick().await;
                this.tick().await;
            }
        })
    }

    /// Reads and sums `hourly_stats` for every node matching `view` over the
    /// trailing [`HISTORY_WINDOW_HOURS`] window (§4.4/§4.5 step 4).
    async fn history_for_view(&self, view: &View) -> HistoryTotals {
        let to = chrono::Utc::now();
        let from = to - chrono::Duration::hours(HISTORY_WINDOW_HOURS);

        let mut total = HistoryTotals::default();
        for node_name in self.node_processors.keys() {
            if !view.matches_node(node_name) {
                continue;
            }
            let store = self.store.clone();
            let name = node_name.clone();
            let rows = tokio::task::spawn_blocking(move || store.hourly_stats_range(&name, from, to)).await;
            match rows {
                Ok(Ok(rows)) => rows.iter().for_each(|r| total.add_row(r)),
                Ok(Err(e)) => tracing::warn!("failed to read hourly_stats history for {node_name}: {e}"),
                Err(e) => tracing::warn!("hourly_stats history task for {node_name} panicked: {e}"),
            }
        }
        total
    }

    async fn tick(&self) {
        let subscribers = self.broadcaster.distinct_views();

        let mut distinct_views: HashMap<String, View> = HashMap::new();
        for (_id, view) in &subscribers {
            distinct_views.entry(view_key(view)).or_insert_with(|| view.clone());
        }

        {
            let mut per_view = self.per_view.lock().unwrap();
            per_view.retain(|key, _| distinct_views.contains_key(key));
        }

        let mut payloads: HashMap<String, serde_json::Value> = HashMap::new();

        for (key, view) in &distinct_views {
            {
                let mut per_view = self.per_view.lock().unwrap();
                let (stored_view, stats) =
                    per_view.entry(key.clone()).or_insert_with(|| (view.clone(), IncrementalStats::default()));
                *stored_view = view.clone();

                for (node_name, processor) in &self.node_processors {
                    if !view.matches_node(node_name) {
                        continue;
                    }
                    if !processor.take_has_new_events() {
                        continue;
                    }
                    let all_events = processor.live_events_snapshot();
                    let start = stats.last_processed_index.get(node_name).copied().unwrap_or(0);
                    if start >= all_events.len() {
                        stats.last_processed_index.insert(node_name.clone(), all_events.len());
                        continue;
                    }
                    let tail = &all_events[start..];
                    stats.ingest(node_name, tail);
                    stats.last_processed_index.insert(node_name.clone(), all_events.len());
                }
            }

            let history = self.history_for_view(view).await;
            let per_view = self.per_view.lock().unwrap();
            if let Some((_, stats)) = per_view.get(key) {
                payloads.insert(key.clone(), stats.to_payload(&history));
            }
        }

        for (id, view) in &subscribers {
            if let Some(payload) = payloads.get(&view_key(view)) {
                self.broadcaster.send_to(*id, ServerMessage::StatsUpdate { payload: payload.clone() });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Category as Cat, Location, Status as St};

    fn traffic(piece: &str, size: i64, ts: f64) -> TrafficEvent {
        TrafficEvent {
            ts_unix: ts,
            timestamp: chrono::Utc::now(),
            node_name: "n1".to_string(),
            action: "GET".to_string(),
            category: Cat::Get,
            status: St::Success,
            size,
            piece_id: piece.to_string(),
            satellite_id: "S".to_string(),
            remote_ip: "1.2.3.4".to_string(),
            location: Location { country: "US".into(), lat: None, lon: None },
            error_reason: None,
            duration_ms: Some(10),
            arrival_time: ts,
        }
    }

    #[test]
    fn ingest_accumulates_counts() {
        let mut stats = IncrementalStats::default();
        stats.ingest("n1", &[traffic("p1", 1024, 1.0), traffic("p2", 2048, 2.0)]);
        assert_eq!(*stats.category_success.get("get").unwrap(), 2);
        assert_eq!(stats.per_satellite.get("S").copied().unwrap(), 2);
    }

    #[test]
    fn view_key_is_order_independent() {
        let a = View::Nodes(vec!["n2".into(), "n1".into()]);
        let b = View::Nodes(vec!["n1".into(), "n2".into()]);
        assert_eq!(view_key(&a), view_key(&b));
    }

    #[test]
    fn aggregate_view_has_stable_key() {
        assert_eq!(view_key(&View::aggregate()), "Aggregate");
    }

    #[test]
    fn to_payload_folds_history_onto_live_counts() {
        let mut stats = IncrementalStats::default();
        stats.ingest("n1", &[traffic("p1", 1024, 1.0)]);

        let history = HistoryTotals {
            dl_success: 5,
            ul_success: 2,
            audit_fail: 1,
            ..HistoryTotals::default()
        };

        let payload = stats.to_payload(&history);
        assert_eq!(payload["category_success"]["get"], 6);
        assert_eq!(payload["category_success"]["put"], 2);
        assert_eq!(payload["category_fail"]["audit"], 1);
        assert_eq!(payload["live_category_success"]["get"], 1);
        assert!(payload["live_category_success"].get("put").is_none());
    }
}
