//! Store Writer (C4): a single logical writer serializing all mutations
//! through a dedicated OS thread, backed by a pooled SQLite connection.
//!
//! Architecture, grounded in the teacher's `pipeline/lifestats.rs`:
//!
//! ```text
//! Processor (C3)
//!     │
//!     └──→ Store::submit() ──→ std::sync::mpsc::SyncSender (bounded, BLOCKING)
//!                                       │
//!                                       └──→ Dedicated Writer Thread
//!                                               │
//!                                               ├──→ Batch buffer (flushed every T)
//!                                               ├──→ Hourly roll-up (every 10 min)
//!                                               ├──→ Retention pruning (every P hours)
//!                                               └──→ SQLite (WAL mode)
//! ```
//!
//! Divergence from the teacher: `lifestats.rs` uses `try_send` and drops
//! events under backpressure. This writer uses a blocking `send`, so a full
//! queue propagates backpressure all the way to the per-node processor (and,
//! through its own blocking enqueue, to the log source).

use std::collections::HashMap;
use std::path::Path;
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeZone, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection};

use crate::events::{Category, Event, HashstoreEnd, ReputationSnapshot, StorageSnapshot, Status, TrafficEvent};
use crate::pipeline::{CompletionSignal, EventProcessor, ProcessContext, ProcessResult};

/// One unit of work accepted by the store writer.
#[derive(Debug, Clone)]
pub enum WriteRecord {
    Traffic(TrafficEvent),
    StorageSnapshot(StorageSnapshot),
    HashstoreEnd(HashstoreEnd),
    Reputation(ReputationSnapshot),
    PersistentState { key: String, value: String },
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub database_file: std::path::PathBuf,
    pub write_batch_interval: Duration,
    pub queue_max_size: usize,
    pub events_retention_days: i64,
    pub hashstore_retention_days: i64,
    pub prune_interval: Duration,
    pub hourly_agg_interval: Duration,
}

enum WriterCommand {
    Write(WriteRecord),
    Shutdown,
}

/// Handle to the running store writer. Cheaply cloneable; all clones share
/// the same dedicated thread and connection pool.
#[derive(Clone)]
pub struct Store {
    pool: Pool<SqliteConnectionManager>,
    tx: SyncSender<WriterCommand>,
    completion: Arc<CompletionSignal>,
    shared: Arc<std::sync::Mutex<Option<JoinHandle<()>>>>,
}

impl Store {
    /// Opens (creating if needed) the database, runs migrations, backfills
    /// hourly stats, and spawns the dedicated writer thread.
    pub fn open(config: StoreConfig) -> anyhow::Result<Self> {
        if let Some(parent) = config.database_file.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let manager = SqliteConnectionManager::file(&config.database_file);
        let pool = Pool::builder().max_size(8).build(manager)?;

        {
            let conn = pool.get()?;
            init_schema(&conn)?;
            backfill_hourly_stats(&conn)?;
        }

        // Admission channel is bounded and uses a blocking `send`, so a full
        // queue propagates backpressure to the processor.
        let (tx, rx) = mpsc::sync_channel::<WriterCommand>(config.queue_max_size);
        let completion = Arc::new(CompletionSignal::new());
        let writer_completion = completion.clone();
        let writer_pool = pool.clone();
        let writer_config = config.clone();

        let handle = thread::Builder::new().name("store-writer".into()).spawn(move || {
            if let Err(e) = writer_thread(rx, writer_pool, writer_config) {
                tracing::error!("store writer thread error: {}", e);
            }
            writer_completion.complete();
        })?;

        Ok(Self {
            pool,
            tx,
            completion,
            shared: Arc::new(std::sync::Mutex::new(Some(handle))),
        })
    }

    /// Enqueues a record for persistence. Probes with a non-blocking send
    /// first so a full queue is logged, then blocks (intentional
    /// backpressure, see module docs).
    pub fn submit(&self, record: WriteRecord) -> anyhow::Result<()> {
        let record = match self.tx.try_send(WriterCommand::Write(record)) {
            Ok(()) => return Ok(()),
            Err(mpsc::TrySendError::Full(WriterCommand::Write(record))) => record,
            Err(mpsc::TrySendError::Full(WriterCommand::Shutdown)) => unreachable!(),
            Err(mpsc::TrySendError::Disconnected(_)) => {
                return Err(anyhow::anyhow!("store writer thread has exited"))
            }
        };

        tracing::warn!("store write queue full, blocking until the writer catches up");
        self.tx
            .send(WriterCommand::Write(record))
            .map_err(|_| anyhow::anyhow!("store writer thread has exited"))
    }

    /// Blocks until the writer thread has flushed and exited.
    pub fn shutdown(&self) -> anyhow::Result<()> {
        let _ = self.tx.send(WriterCommand::Shutdown);
        if !self.completion.wait(Duration::from_secs(10)) {
            return Err(anyhow::anyhow!("store writer did not shut down within 10s"));
        }
        if let Some(handle) = self.shared.lock().unwrap().take() {
            let _ = handle.join();
        }
        Ok(())
    }

    /// Returns the hourly_stats rows for `node_name` in `[from, to)`.
    pub fn hourly_stats_range(
        &self,
        node_name: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> anyhow::Result<Vec<HourlyStatsRow>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT hour_timestamp, node_name, dl_success, dl_fail, ul_success, ul_fail,
                    audit_success, audit_fail, total_download_size, total_upload_size
             FROM hourly_stats
             WHERE node_name = ?1 AND hour_timestamp >= ?2 AND hour_timestamp < ?3
             ORDER BY hour_timestamp ASC",
        )?;
        let rows = stmt
            .query_map(params![node_name, from.to_rfc3339(), to.to_rfc3339()], row_to_hourly_stats)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn latest_reputation(&self, node_name: &str) -> anyhow::Result<Vec<ReputationRow>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT satellite_id, audit_score, suspension_score, online_score, disqualified, suspended, sampled_at
             FROM reputation_snapshots
             WHERE node_name = ?1 AND id IN (
                 SELECT MAX(id) FROM reputation_snapshots WHERE node_name = ?1 GROUP BY satellite_id
             )",
        )?;
        let rows = stmt
            .query_map(params![node_name], |row| {
                Ok(ReputationRow {
                    satellite_id: row.get(0)?,
                    audit_score: row.get(1)?,
                    suspension_score: row.get(2)?,
                    online_score: row.get(3)?,
                    disqualified: row.get::<_, i64>(4)? != 0,
                    suspended: row.get::<_, i64>(5)? != 0,
                    sampled_at: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get_persistent_state(&self, key: &str) -> anyhow::Result<Option<String>> {
        let conn = self.pool.get()?;
        conn.query_row("SELECT value FROM app_persistent_state WHERE key = ?1", params![key], |r| r.get(0))
            .map(Some)
            .or_else(|e| if e == rusqlite::Error::QueryReturnedNoRows { Ok(None) } else { Err(e.into()) })
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct HourlyStatsRow {
    pub hour_timestamp: String,
    pub node_name: String,
    pub dl_success: i64,
    pub dl_fail: i64,
    pub ul_success: i64,
    pub ul_fail: i64,
    pub audit_success: i64,
    pub audit_fail: i64,
    pub total_download_size: i64,
    pub total_upload_size: i64,
}

fn row_to_hourly_stats(row: &rusqlite::Row) -> rusqlite::Result<HourlyStatsRow> {
    Ok(HourlyStatsRow {
        hour_timestamp: row.get(0)?,
        node_name: row.get(1)?,
        dl_success: row.get(2)?,
        dl_fail: row.get(3)?,
        ul_success: row.get(4)?,
        ul_fail: row.get(5)?,
        audit_success: row.get(6)?,
        audit_fail: row.get(7)?,
        total_download_size: row.get(8)?,
        total_upload_size: row.get(9)?,
    })
}

/// Adapts [`Store`] to the pipeline's [`EventProcessor`] trait, so it can be
/// registered alongside the stats engine and broadcaster.
impl EventProcessor for Store {
    fn name(&self) -> &'static str {
        "store"
    }

    fn process(&self, event: &Event, _ctx: &ProcessContext) -> ProcessResult {
        let record = match event {
            Event::Traffic(traffic) => Some(WriteRecord::Traffic(traffic.clone())),
            Event::StorageSnapshot(snap) => Some(WriteRecord::StorageSnapshot(snap.clone())),
            Event::HashstoreEnd { data, .. } => Some(WriteRecord::HashstoreEnd(data.clone())),
            Event::OperationStart(_) | Event::HashstoreBegin { .. } => None,
        };

        let Some(record) = record else {
            return ProcessResult::Continue;
        };

        match self.submit(record) {
            Ok(()) => ProcessResult::Continue,
            Err(e) => ProcessResult::Error(e),
        }
    }

    fn shutdown(&self) -> anyhow::Result<()> {
        Store::shutdown(self)
    }
}

#[derive(Debug, Clone)]
pub struct ReputationRow {
    pub satellite_id: String,
    pub audit_score: f64,
    pub suspension_score: f64,
    pub online_score: f64,
    pub disqualified: bool,
    pub suspended: bool,
    pub sampled_at: String,
}

fn writer_thread(
    rx: mpsc::Receiver<WriterCommand>,
    pool: Pool<SqliteConnectionManager>,
    config: StoreConfig,
) -> anyhow::Result<()> {
    let mut batch: Vec<WriteRecord> = Vec::new();
    let mut last_flush = Instant::now();
    let mut last_rollup = Instant::now();
    let mut last_prune = Instant::now();

    loop {
        match rx.recv_timeout(config.write_batch_interval) {
            Ok(WriterCommand::Write(record)) => {
                batch.push(record);
                if batch.len() >= 1000 || last_flush.elapsed() >= config.write_batch_interval {
                    flush_batch(&pool, &mut batch)?;
                    last_flush = Instant::now();
                }
            }
            Ok(WriterCommand::Shutdown) => {
                if !batch.is_empty() {
                    flush_batch(&pool, &mut batch)?;
                }
                tracing::debug!("store writer thread shutting down");
                break;
            }
            Err(RecvTimeoutError::Timeout) => {
                if !batch.is_empty() {
                    flush_batch(&pool, &mut batch)?;
                    last_flush = Instant::now();
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                if !batch.is_empty() {
                    flush_batch(&pool, &mut batch)?;
                }
                break;
            }
        }

        if last_rollup.elapsed() >= config.hourly_agg_interval {
            let conn = pool.get()?;
            if let Err(e) = run_hourly_rollup(&conn) {
                tracing::warn!("hourly rollup failed: {}", e);
            }
            last_rollup = Instant::now();
        }

        if last_prune.elapsed() >= config.prune_interval {
            let conn = pool.get()?;
            if let Err(e) = run_retention_pruning(&conn, config.events_retention_days, config.hashstore_retention_days) {
                tracing::warn!("retention pruning failed: {}", e);
            }
            last_prune = Instant::now();
        }
    }

    Ok(())
}

fn flush_batch(pool: &Pool<SqliteConnectionManager>, batch: &mut Vec<WriteRecord>) -> anyhow::Result<()> {
    if batch.is_empty() {
        return Ok(());
    }
    let mut conn = pool.get()?;
    let tx = conn.transaction()?;
    let count = batch.len();
    for record in batch.drain(..) {
        if let Err(e) = store_record(&tx, &record) {
            tracing::warn!("failed to store record: {}", e);
        }
    }
    tx.commit()?;
    tracing::trace!("flushed {} records to store", count);
    Ok(())
}

fn store_record(conn: &Connection, record: &WriteRecord) -> anyhow::Result<()> {
    match record {
        WriteRecord::Traffic(event) => {
            conn.execute(
                "INSERT INTO events (timestamp, action, status, size, piece_id, satellite_id,
                    remote_ip, country, latitude, longitude, error_reason, node_name, duration_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    event.timestamp.to_rfc3339(),
                    event.action,
                    event.status.as_str(),
                    event.size,
                    event.piece_id,
                    event.satellite_id,
                    event.remote_ip,
                    event.location.country,
                    event.location.lat,
                    event.location.lon,
                    event.error_reason,
                    event.node_name,
                    event.duration_ms,
                ],
            )?;
        }
        WriteRecord::StorageSnapshot(snap) => {
            conn.execute(
                "INSERT INTO storage_snapshots (ts, node_name, available_bytes, total_bytes, used_bytes, trash_bytes, source)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    snap.timestamp.to_rfc3339(),
                    snap.node_name,
                    snap.available_bytes,
                    snap.total_bytes,
                    snap.used_bytes,
                    snap.trash_bytes,
                    snap.source,
                ],
            )?;
        }
        WriteRecord::HashstoreEnd(end) => {
            conn.execute(
                "INSERT INTO hashstore_log (ts_iso, node_name, satellite, store, duration_s,
                    data_reclaimed_bytes, data_rewritten_bytes, table_load, trash_percent)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    end.last_run_iso,
                    end.node_name,
                    end.satellite,
                    end.store,
                    end.duration_s,
                    end.data_reclaimed_bytes,
                    end.data_rewritten_bytes,
                    end.table_load,
                    end.trash_percent,
                ],
            )?;
        }
        WriteRecord::Reputation(rep) => {
            conn.execute(
                "INSERT INTO reputation_snapshots (node_name, satellite_id, audit_score, suspension_score,
                    online_score, disqualified, suspended, sampled_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    rep.node_name,
                    rep.satellite_id,
                    rep.audit_score,
                    rep.suspension_score,
                    rep.online_score,
                    rep.disqualified as i64,
                    rep.suspended as i64,
                    rep.sampled_at.to_rfc3339(),
                ],
            )?;
        }
        WriteRecord::PersistentState { key, value } => {
            conn.execute(
                "INSERT INTO app_persistent_state (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )?;
        }
    }
    Ok(())
}

fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;
        PRAGMA busy_timeout=5000;
        "#,
    )?;

    let current_version: i32 = conn
        .query_row(
            "SELECT COALESCE((SELECT CAST(value AS INTEGER) FROM app_persistent_state WHERE key = 'schema_version'), 0)
             FROM (SELECT 1) WHERE EXISTS (SELECT 1 FROM sqlite_master WHERE type='table' AND name='app_persistent_state')",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current_version < 1 {
        apply_schema_v1(conn)?;
    }

    Ok(())
}

fn apply_schema_v1(conn: &Connection) -> anyhow::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS app_persistent_state (
            key TEXT PRIMARY KEY,
            value TEXT
        );

        CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp TEXT NOT NULL,
            action TEXT NOT NULL,
            status TEXT NOT NULL,
            size INTEGER NOT NULL,
            piece_id TEXT NOT NULL,
            satellite_id TEXT NOT NULL,
            remote_ip TEXT NOT NULL,
            country TEXT,
            latitude REAL,
            longitude REAL,
            error_reason TEXT,
            node_name TEXT NOT NULL,
            duration_ms INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp);
        CREATE INDEX IF NOT EXISTS idx_events_node ON events(node_name);
        CREATE INDEX IF NOT EXISTS idx_events_node_timestamp ON events(node_name, timestamp);

        CREATE TABLE IF NOT EXISTS hourly_stats (
            hour_timestamp TEXT NOT NULL,
            node_name TEXT NOT NULL,
            dl_success INTEGER NOT NULL DEFAULT 0,
            dl_fail INTEGER NOT NULL DEFAULT 0,
            ul_success INTEGER NOT NULL DEFAULT 0,
            ul_fail INTEGER NOT NULL DEFAULT 0,
            audit_success INTEGER NOT NULL DEFAULT 0,
            audit_fail INTEGER NOT NULL DEFAULT 0,
            total_download_size INTEGER NOT NULL DEFAULT 0,
            total_upload_size INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (hour_timestamp, node_name)
        );

        CREATE TABLE IF NOT EXISTS storage_snapshots (
            ts TEXT NOT NULL,
            node_name TEXT NOT NULL,
            available_bytes INTEGER NOT NULL,
            total_bytes INTEGER,
            used_bytes INTEGER,
            trash_bytes INTEGER,
            source TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_storage_snapshots_node ON storage_snapshots(node_name, ts);

        CREATE TABLE IF NOT EXISTS hashstore_log (
            ts_iso TEXT NOT NULL,
            node_name TEXT NOT NULL,
            satellite TEXT NOT NULL,
            store TEXT NOT NULL,
            duration_s REAL NOT NULL,
            data_reclaimed_bytes INTEGER NOT NULL,
            data_rewritten_bytes INTEGER NOT NULL,
            table_load REAL NOT NULL,
            trash_percent REAL NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_hashstore_log_node ON hashstore_log(node_name, ts_iso);

        CREATE TABLE IF NOT EXISTS reputation_snapshots (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            node_name TEXT NOT NULL,
            satellite_id TEXT NOT NULL,
            audit_score REAL NOT NULL,
            suspension_score REAL NOT NULL,
            online_score REAL NOT NULL,
            disqualified INTEGER NOT NULL,
            suspended INTEGER NOT NULL,
            sampled_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_reputation_node ON reputation_snapshots(node_name, satellite_id);

        INSERT INTO app_persistent_state (key, value) VALUES ('schema_version', '1')
        ON CONFLICT(key) DO NOTHING;
        "#,
    )?;
    Ok(())
}

/// Classifies an action/category/status triple into the hourly counters,
/// mirroring §4.4's roll-up predicates: `GET_AUDIT` is audit, other GET*/PUT*
/// roll into dl/ul, failures are anything not `success`.
fn bucket_for(category: Category, status: Status) -> Option<(&'static str, bool)> {
    match category {
        Category::Audit => Some(("audit", status == Status::Success)),
        Category::Get | Category::GetRepair => Some(("dl", status == Status::Success)),
        Category::Put | Category::PutRepair => Some(("ul", status == Status::Success)),
        Category::Other => None,
    }
}

fn run_hourly_rollup(conn: &Connection) -> anyhow::Result<()> {
    let now = Utc::now();
    let hour_start = floor_to_hour(now);
    rollup_hour(conn, hour_start)?;
    rollup_hour(conn, hour_start - chrono::Duration::hours(1))?;
    Ok(())
}

fn floor_to_hour(ts: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(ts.year(), ts.month(), ts.day(), ts.hour(), 0, 0).unwrap()
}

use chrono::Datelike;
use chrono::Timelike;

fn rollup_hour(conn: &Connection, hour_start: DateTime<Utc>) -> anyhow::Result<()> {
    let hour_end = hour_start + chrono::Duration::hours(1);
    let mut stmt = conn.prepare(
        "SELECT node_name, action, status, size FROM events WHERE timestamp >= ?1 AND timestamp < ?2",
    )?;
    let mut per_node: HashMap<String, HourlyAccumulator> = HashMap::new();

    let rows = stmt.query_map(params![hour_start.to_rfc3339(), hour_end.to_rfc3339()], |row| {
        let node_name: String = row.get(0)?;
        let action: String = row.get(1)?;
        let status_str: String = row.get(2)?;
        let size: i64 = row.get(3)?;
        Ok((node_name, action, status_str, size))
    })?;

    for row in rows {
        let (node_name, action, status_str, size) = row?;
        let category = crate::parser::categorize_action(&action);
        let status = match status_str.as_str() {
            "success" => Status::Success,
            "canceled" => Status::Canceled,
            _ => Status::Failed,
        };
        let Some((bucket, is_success)) = bucket_for(category, status) else {
            continue;
        };
        let acc = per_node.entry(node_name).or_default();
        match (bucket, is_success) {
            ("dl", true) => {
                acc.dl_success += 1;
                acc.total_download_size += size;
            }
            ("dl", false) => acc.dl_fail += 1,
            ("ul", true) => {
                acc.ul_success += 1;
                acc.total_upload_size += size;
            }
            ("ul", false) => acc.ul_fail += 1,
            ("audit", true) => acc.audit_success += 1,
            ("audit", false) => acc.audit_fail += 1,
            _ => {}
        }
    }

    for (node_name, acc) in per_node {
        conn.execute(
            "INSERT INTO hourly_stats (hour_timestamp, node_name, dl_success, dl_fail, ul_success, ul_fail,
                audit_success, audit_fail, total_download_size, total_upload_size)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(hour_timestamp, node_name) DO UPDATE SET
                dl_success = excluded.dl_success,
                dl_fail = excluded.dl_fail,
                ul_success = excluded.ul_success,
                ul_fail = excluded.ul_fail,
                audit_success = excluded.audit_success,
                audit_fail = excluded.audit_fail,
                total_download_size = excluded.total_download_size,
                total_upload_size = excluded.total_upload_size",
            params![
                hour_start.to_rfc3339(),
                node_name,
                acc.dl_success,
                acc.dl_fail,
                acc.ul_success,
                acc.ul_fail,
                acc.audit_success,
                acc.audit_fail,
                acc.total_download_size,
                acc.total_upload_size,
            ],
        )?;
    }

    Ok(())
}

#[derive(Default)]
struct HourlyAccumulator {
    dl_success: i64,
    dl_fail: i64,
    ul_success: i64,
    ul_fail: i64,
    audit_success: i64,
    audit_fail: i64,
    total_download_size: i64,
    total_upload_size: i64,
}

/// At startup, idempotently backfills `hourly_stats` from `min(events.timestamp)`
/// to `max(events.timestamp)`, hour by hour, for every node observed.
fn backfill_hourly_stats(conn: &Connection) -> anyhow::Result<()> {
    let bounds: Option<(String, String)> = conn
        .query_row("SELECT MIN(timestamp), MAX(timestamp) FROM events", [], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })
        .ok();

    let Some((min_ts, max_ts)) = bounds else {
        return Ok(());
    };

    let Ok(min_dt) = DateTime::parse_from_rfc3339(&min_ts) else {
        return Ok(());
    };
    let Ok(max_dt) = DateTime::parse_from_rfc3339(&max_ts) else {
        return Ok(());
    };

    let mut cursor = floor_to_hour(min_dt.with_timezone(&Utc));
    let end = floor_to_hour(max_dt.with_timezone(&Utc));

    while cursor <= end {
        rollup_hour(conn, cursor)?;
        cursor += chrono::Duration::hours(1);
    }

    Ok(())
}

fn run_retention_pruning(conn: &Connection, events_retention_days: i64, hashstore_retention_days: i64) -> anyhow::Result<()> {
    let events_cutoff = (Utc::now() - chrono::Duration::days(events_retention_days)).to_rfc3339();
    let hashstore_cutoff = (Utc::now() - chrono::Duration::days(hashstore_retention_days)).to_rfc3339();

    let deleted_events = conn.execute("DELETE FROM events WHERE timestamp < ?1", params![events_cutoff])?;
    let deleted_hashstore = conn.execute("DELETE FROM hashstore_log WHERE ts_iso < ?1", params![hashstore_cutoff])?;

    if deleted_events > 0 || deleted_hashstore > 0 {
        tracing::info!(
            "retention pruning: deleted {} events, {} hashstore_log rows",
            deleted_events,
            deleted_hashstore
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Category, Location, Status};

    fn test_config(path: &Path) -> StoreConfig {
        StoreConfig {
            database_file: path.to_path_buf(),
            write_batch_interval: Duration::from_millis(20),
            queue_max_size: 100,
            events_retention_days: 2,
            hashstore_retention_days: 30,
            prune_interval: Duration::from_secs(3600),
            hourly_agg_interval: Duration::from_secs(600),
        }
    }

    fn sample_traffic(node: &str, ts: DateTime<Utc>) -> TrafficEvent {
        TrafficEvent {
            ts_unix: ts.timestamp() as f64,
            timestamp: ts,
            node_name: node.to_string(),
            action: "GET".to_string(),
            category: Category::Get,
            status: Status::Success,
            size: 1024,
            piece_id: "P".to_string(),
            satellite_id: "S".to_string(),
            remote_ip: "1.2.3.4".to_string(),
            location: Location::unknown(),
            error_reason: None,
            duration_ms: Some(42),
            arrival_time: 0.0,
        }
    }

    #[test]
    fn schema_init_creates_tables() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(test_config(&dir.path().join("test.sqlite"))).unwrap();
        let conn = store.pool.get().unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN
                 ('events','hourly_stats','storage_snapshots','hashstore_log','reputation_snapshots','app_persistent_state')",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(count, 6);
        store.shutdown().unwrap();
    }

    #[test]
    fn submit_and_flush_persists_event() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(test_config(&dir.path().join("test.sqlite"))).unwrap();
        store.submit(WriteRecord::Traffic(sample_traffic("n1", Utc::now()))).unwrap();
        store.shutdown().unwrap();

        let conn = Connection::open(dir.path().join("test.sqlite")).unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM events", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn hourly_rollup_counts_success_and_failure() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(test_config(&dir.path().join("test.sqlite"))).unwrap();
        let now = Utc::now();
        let mut ok_event = sample_traffic("n1", now);
        ok_event.status = Status::Success;
        let mut fail_event = sample_traffic("n1", now);
        fail_event.status = Status::Failed;

        store.submit(WriteRecord::Traffic(ok_event)).unwrap();
        store.submit(WriteRecord::Traffic(fail_event)).unwrap();
        std::thread::sleep(Duration::from_millis(50));

        {
            let conn = store.pool.get().unwrap();
            run_hourly_rollup(&conn).unwrap();
        }

        let rows = store.hourly_stats_range("n1", now - chrono::Duration::hours(1), now + chrono::Duration::hours(1)).unwrap();
        let total: i64 = rows.iter().map(|r| r.dl_success + r.dl_fail).sum();
        assert_eq!(total, 2);
        store.shutdown().unwrap();
    }

    #[test]
    fn retention_pruning_deletes_old_rows() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(test_config(&dir.path().join("test.sqlite"))).unwrap();
        let old_event = sample_traffic("n1", Utc::now() - chrono::Duration::days(10));
        store.submit(WriteRecord::Traffic(old_event)).unwrap();
        std::thread::sleep(Duration::from_millis(50));

        {
            let conn = store.pool.get().unwrap();
            run_retention_pruning(&conn, 2, 30).unwrap();
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM events", [], |r| r.get(0)).unwrap();
            assert_eq!(count, 0);
        }
        store.shutdown().unwrap();
    }

    #[test]
    fn persistent_state_upserts() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(test_config(&dir.path().join("test.sqlite"))).unwrap();
        store
            .submit(WriteRecord::PersistentState { key: "payout_n1".into(), value: "{\"a\":1}".into() })
            .unwrap();
        store
            .submit(WriteRecord::PersistentState { key: "payout_n1".into(), value: "{\"a\":2}".into() })
            .unwrap();
        std::thread::sleep(Duration::from_millis(50));
        let value = store.get_persistent_state("payout_n1").unwrap();
        assert_eq!(value, Some("{\"a\":2}".to_string()));
        store.shutdown().unwrap();
    }
}
