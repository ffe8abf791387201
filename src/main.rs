// Multi-node operational monitor for a distributed storage daemon.
//
// Architecture:
// - Log Source (C1): tails a file or reads a network log forwarder per node
// - Parser (C2): turns raw lines into typed events
// - Per-node Processor (C3): pairs operations, derives latency and storage
//   samples, fans events out through a shared pipeline
// - Store (C4): a dedicated writer thread batches events into SQLite
// - Stats Engine (C5): maintains incremental per-view dashboard stats
// - Broadcaster (C6): batches and fans out dashboard-facing websocket traffic
// - API Collaborator (C7): polls each node's admin API for reputation/payout

mod api_client;
mod broadcast;
mod cli;
mod config;
mod connection;
mod events;
mod log_source;
mod node;
mod parser;
mod pipeline;
mod processor;
mod server;
mod stats;
mod store;
mod wire;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use api_client::ApiClient;
use config::Config;
use connection::ConnectionTracker;
use log_source::{spawn_file_source, network_source_loop, LogLine};
use node::{NodeSource, NodeSpec};
use parser::{GeoIpLookup, MaxMindLookup, Parser};
use pipeline::EventPipeline;
use processor::NodeProcessor;
use server::AppState;
use stats::StatsEngine;
use store::{Store, StoreConfig};

/// A running file-tail thread's join handle and cooperative stop flag.
struct FileSourceHandle {
    thread: std::thread::JoinHandle<()>,
    stop: Arc<AtomicBool>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Handle CLI commands first (config --show, --reset, --edit, --update).
    // If a subcommand was handled, exit early.
    let Some(nodes) = cli::handle_cli() else {
        return Ok(());
    };

    if nodes.is_empty() {
        eprintln!("no --node arguments given; nothing to monitor");
        std::process::exit(1);
    }

    // Ensure config template exists (helps operators discover options).
    Config::ensure_config_exists();

    let config = Config::from_env();

    // Headless binary: logs always go to stdout via the standard fmt layer.
    // Precedence: RUST_LOG env var > config file level > default "info".
    let default_filter = format!("storj_monitor={},tower_http=debug,axum=debug", config.log_level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());
    tracing_subscriber::registry().with(filter).with(tracing_subscriber::fmt::layer()).init();

    tracing::info!("starting storj-monitor, watching {} node(s)", nodes.len());

    let geoip_lookup: Box<dyn GeoIpLookup> = match MaxMindLookup::open(&config.geoip_database_path) {
        Ok(lookup) => Box::new(lookup),
        Err(e) => {
            tracing::error!("failed to open GeoIP database at {}: {e}", config.geoip_database_path.display());
            std::process::exit(1);
        }
    };
    let parser = Arc::new(Parser::new(geoip_lookup, config.max_geoip_cache_size));

    let store = Store::open(StoreConfig {
        database_file: config.database_file.clone(),
        write_batch_interval: Duration::from_secs(config.db_write_batch_interval_seconds),
        queue_max_size: config.db_queue_max_size,
        events_retention_days: config.db_events_retention_days,
        hashstore_retention_days: config.db_hashstore_retention_days,
        prune_interval: Duration::from_secs(config.db_prune_interval_hours * 3600),
        hourly_agg_interval: Duration::from_secs(config.hourly_agg_interval_minutes * 60),
    })?;

    let broadcaster = broadcast::Broadcaster::new(
        Duration::from_millis(config.websocket_batch_interval_ms),
        config.websocket_batch_size,
    );
    let batcher_handle = broadcaster.spawn_batcher();

    let mut pipeline = EventPipeline::new();
    pipeline.register(store.clone());
    pipeline.register(broadcaster.clone());
    let pipeline = Arc::new(pipeline);
    let store = Arc::new(store);

    let node_names: Vec<String> = nodes.iter().map(|n| n.name.clone()).collect();
    let connection_tracker = ConnectionTracker::new(&node_names);
    let connection_handle = connection_tracker.spawn_broadcast_loop(broadcaster.clone());

    let mut node_processors: HashMap<String, Arc<NodeProcessor>> = HashMap::new();
    let mut file_sources: Vec<FileSourceHandle> = Vec::new();
    let mut background_tasks: Vec<tokio::task::JoinHandle<()>> = Vec::new();

    for node in &nodes {
        let processor = Arc::new(NodeProcessor::new(
            &node.name,
            pipeline.clone(),
            broadcaster.clone(),
            config.stats_window_minutes,
        ));
        node_processors.insert(node.name.clone(), processor.clone());

        let (tx, mut rx) = tokio::sync::mpsc::channel::<LogLine>(10_000);

        match &node.source {
            NodeSource::File { path } => {
                let stop = Arc::new(AtomicBool::new(false));
                let thread = spawn_file_source(
                    PathBuf::from(path),
                    tx,
                    stop.clone(),
                    connection_tracker.clone(),
                    node.name.clone(),
                );
                file_sources.push(FileSourceHandle { thread, stop });
            }
            NodeSource::Network { host, port } => {
                let handle = tokio::spawn(network_source_loop(
                    host.clone(),
                    *port,
                    tx,
                    connection_tracker.clone(),
                    node.name.clone(),
                ));
                background_tasks.push(handle);
            }
        }

        let ingest_parser = parser.clone();
        let ingest_node_name = node.name.clone();
        let ingest_processor = processor;
        background_tasks.push(tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                if let Some(event) = ingest_parser.parse_log_line(&line.raw, &ingest_node_name) {
                    ingest_processor.handle_event(event, line.arrival_time);
                }
            }
        }));

        if let Some(endpoint) = discover_api_endpoint(node, &config).await {
            tracing::info!("[{}] discovered admin API at {endpoint}", node.name);
            let client = Arc::new(
                ApiClient::new(&node.name, &endpoint, Duration::from_secs(config.node_api_timeout_seconds))
                    .with_tracker(connection_tracker.clone()),
            );
            background_tasks.extend(api_client::spawn_polling_loops(client, store.clone()));
        } else {
            tracing::warn!("[{}] no admin API endpoint discovered; reputation/payout data unavailable", node.name);
        }
    }

    let stats_engine =
        StatsEngine::new(node_processors, store.clone(), broadcaster.clone(), Duration::from_secs(config.stats_interval_seconds));
    let stats_handle = stats_engine.spawn();

    let addr = format!("{}:{}", config.server_host, config.server_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("dashboard server listening on {addr}");
    let server_state = AppState { broadcaster: broadcaster.clone(), store: (*store).clone(), node_names };
    let app = server::router(server_state);
    let serve_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("dashboard server error: {e}");
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down...");

    // Flush and stop the store before tearing down ingest so in-flight
    // events aren't dropped mid-batch.
    if let Err(e) = pipeline.shutdown() {
        tracing::error!("pipeline shutdown error: {e}");
    }

    for handle in &file_sources {
        handle.stop.store(true, std::sync::atomic::Ordering::Relaxed);
    }
    for handle in file_sources {
        let _ = handle.thread.join();
    }

    batcher_handle.abort();
    connection_handle.abort();
    stats_handle.abort();
    serve_handle.abort();
    for handle in background_tasks {
        handle.abort();
    }

    tracing::info!("shutdown complete");
    Ok(())
}

/// Resolves a node's admin API endpoint per §4.7: an explicit `api_endpoint`
/// wins outright, otherwise discovery probes the loopback (file sources) or
/// the node's own host (network sources, only when permitted).
async fn discover_api_endpoint(node: &NodeSpec, config: &Config) -> Option<String> {
    let (is_network, host) = match &node.source {
        NodeSource::Network { host, .. } => (true, Some(host.as_str())),
        NodeSource::File { .. } => (false, None),
    };
    api_client::discover_endpoint(
        node.api_endpoint.as_deref(),
        is_network,
        host,
        config.node_api_default_port,
        config.allow_remote_api,
    )
    .await
}
