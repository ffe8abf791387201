//! Configuration for the monitor.
//!
//! Configuration is loaded in order of precedence:
//! 1. Environment variables (highest priority)
//! 2. Config file (~/.config/storj-monitor/config.toml)
//! 3. Built-in defaults (lowest priority)

use std::path::PathBuf;

use serde::Deserialize;

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application configuration, fully resolved from env > file > defaults.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_file: PathBuf,
    pub geoip_database_path: PathBuf,
    pub server_host: String,
    pub server_port: u16,

    pub stats_window_minutes: u64,
    pub stats_interval_seconds: u64,
    pub performance_interval_seconds: u64,

    pub db_write_batch_interval_seconds: u64,
    pub db_queue_max_size: usize,
    pub db_events_retention_days: i64,
    pub db_hashstore_retention_days: i64,
    pub db_prune_interval_hours: u64,
    pub hourly_agg_interval_minutes: u64,

    pub websocket_batch_interval_ms: u64,
    pub websocket_batch_size: usize,

    pub max_geoip_cache_size: usize,

    pub node_api_timeout_seconds: u64,
    pub node_api_default_port: u16,
    pub allow_remote_api: bool,

    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_file: PathBuf::from("./storj_monitor.sqlite"),
            geoip_database_path: PathBuf::from("./GeoLite2-City.mmdb"),
            server_host: "127.0.0.1".to_string(),
            server_port: 8765,

            stats_window_minutes: 60,
            stats_interval_seconds: 5,
            performance_interval_seconds: 2,

            db_write_batch_interval_seconds: 10,
            db_queue_max_size: 30_000,
            db_events_retention_days: 2,
            db_hashstore_retention_days: 30,
            db_prune_interval_hours: 6,
            hourly_agg_interval_minutes: 10,

            websocket_batch_interval_ms: 100,
            websocket_batch_size: 500,

            max_geoip_cache_size: 5000,

            node_api_timeout_seconds: 10,
            node_api_default_port: 14002,
            allow_remote_api: false,

            log_level: "info".to_string(),
        }
    }
}

/// Config file structure (subset of `Config` that makes sense to persist).
#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileConfig {
    pub database_file: Option<String>,
    pub geoip_database_path: Option<String>,
    pub server_host: Option<String>,
    pub server_port: Option<u16>,

    pub stats_window_minutes: Option<u64>,
    pub stats_interval_seconds: Option<u64>,
    pub performance_interval_seconds: Option<u64>,

    pub db_write_batch_interval_seconds: Option<u64>,
    pub db_queue_max_size: Option<usize>,
    pub db_events_retention_days: Option<i64>,
    pub db_hashstore_retention_days: Option<i64>,
    pub db_prune_interval_hours: Option<u64>,
    pub hourly_agg_interval_minutes: Option<u64>,

    pub websocket_batch_interval_ms: Option<u64>,
    pub websocket_batch_size: Option<usize>,

    pub max_geoip_cache_size: Option<usize>,

    pub node_api_timeout_seconds: Option<u64>,
    pub node_api_default_port: Option<u16>,
    pub allow_remote_api: Option<bool>,

    pub log_level: Option<String>,
}

impl Config {
    /// `~/.config/storj-monitor/config.toml`
    pub fn config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|p| p.join(".config").join("storj-monitor").join("config.toml"))
    }

    /// Create config file with defaults if it doesn't exist. Called during
    /// startup to help operators discover configuration options; failure is
    /// non-fatal since the file is optional.
    pub fn ensure_config_exists() {
        let Some(path) = Self::config_path() else {
            return;
        };
        if path.exists() {
            return;
        }
        if let Some(parent) = path.parent() {
            if std::fs::create_dir_all(parent).is_err() {
                return;
            }
        }
        let _ = std::fs::write(&path, Self::default().to_toml());
    }

    fn load_file_config() -> FileConfig {
        let Some(path) = Self::config_path() else {
            return FileConfig::default();
        };

        match std::fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(parsed) => parsed,
                Err(e) => {
                    eprintln!("\n╔══════════════════════════════════════════════════════════════╗");
                    eprintln!("║  CONFIG ERROR - Failed to parse configuration file            ║");
                    eprintln!("╚══════════════════════════════════════════════════════════════╝\n");
                    eprintln!("  File: {}\n", path.display());
                    eprintln!("  Error: {}\n", e);
                    eprintln!("  To reset, delete the file and restart.\n");
                    std::process::exit(1);
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => FileConfig::default(),
            Err(e) => {
                eprintln!("\n╔══════════════════════════════════════════════════════════════╗");
                eprintln!("║  CONFIG ERROR - Cannot read configuration file                ║");
                eprintln!("╚══════════════════════════════════════════════════════════════╝\n");
                eprintln!("  File: {}\n", path.display());
                eprintln!("  Error: {}\n", e);
                std::process::exit(1);
            }
        }
    }

    /// Load configuration: env > file > defaults. Each field follows the
    /// same `env.ok().or(file).unwrap_or(default)` precedence chain.
    pub fn from_env() -> Self {
        let file = Self::load_file_config();
        let d = Self::default();

        let database_file = std::env::var("DATABASE_FILE")
            .ok()
            .or(file.database_file)
            .map(PathBuf::from)
            .unwrap_or(d.database_file);

        let geoip_database_path = std::env::var("GEOIP_DATABASE_PATH")
            .ok()
            .or(file.geoip_database_path)
            .map(PathBuf::from)
            .unwrap_or(d.geoip_database_path);

        let server_host = std::env::var("SERVER_HOST").ok().or(file.server_host).unwrap_or(d.server_host);

        let server_port = std::env::var("SERVER_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .or(file.server_port)
            .unwrap_or(d.server_port);

        let stats_window_minutes = env_num("STATS_WINDOW_MINUTES")
            .or(file.stats_window_minutes)
            .unwrap_or(d.stats_window_minutes);
        let stats_interval_seconds = env_num("STATS_INTERVAL_SECONDS")
            .or(file.stats_interval_seconds)
            .unwrap_or(d.stats_interval_seconds);
        let performance_interval_seconds = env_num("PERFORMANCE_INTERVAL_SECONDS")
            .or(file.performance_interval_seconds)
            .unwrap_or(d.performance_interval_seconds);

        let db_write_batch_interval_seconds = env_num("DB_WRITE_BATCH_INTERVAL_SECONDS")
            .or(file.db_write_batch_interval_seconds)
            .unwrap_or(d.db_write_batch_interval_seconds);
        let db_queue_max_size = env_num("DB_QUEUE_MAX_SIZE")
            .or(file.db_queue_max_size)
            .unwrap_or(d.db_queue_max_size);
        let db_events_retention_days = env_num("DB_EVENTS_RETENTION_DAYS")
            .or(file.db_events_retention_days)
            .unwrap_or(d.db_events_retention_days);
        let db_hashstore_retention_days = env_num("DB_HASHSTORE_RETENTION_DAYS")
            .or(file.db_hashstore_retention_days)
            .unwrap_or(d.db_hashstore_retention_days);
        let db_prune_interval_hours = env_num("DB_PRUNE_INTERVAL_HOURS")
            .or(file.db_prune_interval_hours)
            .unwrap_or(d.db_prune_interval_hours);
        let hourly_agg_interval_minutes = env_num("HOURLY_AGG_INTERVAL_MINUTES")
            .or(file.hourly_agg_interval_minutes)
            .unwrap_or(d.hourly_agg_interval_minutes);

        let websocket_batch_interval_ms = env_num("WEBSOCKET_BATCH_INTERVAL_MS")
            .or(file.websocket_batch_interval_ms)
            .unwrap_or(d.websocket_batch_interval_ms);
        let websocket_batch_size = env_num("WEBSOCKET_BATCH_SIZE")
            .or(file.websocket_batch_size)
            .unwrap_or(d.websocket_batch_size);

        let max_geoip_cache_size = env_num("MAX_GEOIP_CACHE_SIZE")
            .or(file.max_geoip_cache_size)
            .unwrap_or(d.max_geoip_cache_size);

        let node_api_timeout_seconds = env_num("NODE_API_TIMEOUT")
            .or(file.node_api_timeout_seconds)
            .unwrap_or(d.node_api_timeout_seconds);
        let node_api_default_port = env_num("NODE_API_DEFAULT_PORT")
            .or(file.node_api_default_port)
            .unwrap_or(d.node_api_default_port);
        let allow_remote_api = std::env::var("ALLOW_REMOTE_API")
            .ok()
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .or(file.allow_remote_api)
            .unwrap_or(d.allow_remote_api);

        let log_level = std::env::var("LOG_LEVEL").ok().or(file.log_level).unwrap_or(d.log_level);

        Self {
            database_file,
            geoip_database_path,
            server_host,
            server_port,
            stats_window_minutes,
            stats_interval_seconds,
            performance_interval_seconds,
            db_write_batch_interval_seconds,
            db_queue_max_size,
            db_events_retention_days,
            db_hashstore_retention_days,
            db_prune_interval_hours,
            hourly_agg_interval_minutes,
            websocket_batch_interval_ms,
            websocket_batch_size,
            max_geoip_cache_size,
            node_api_timeout_seconds,
            node_api_default_port,
            allow_remote_api,
            log_level,
        }
    }

    /// Single source of truth for the on-disk config template.
    pub fn to_toml(&self) -> String {
        format!(
            "# storj-monitor configuration\n\
             database_file = {:?}\n\
             geoip_database_path = {:?}\n\
             server_host = {:?}\n\
             server_port = {}\n\
             \n\
             stats_window_minutes = {}\n\
             stats_interval_seconds = {}\n\
             performance_interval_seconds = {}\n\
             \n\
             db_write_batch_interval_seconds = {}\n\
             db_queue_max_size = {}\n\
             db_events_retention_days = {}\n\
             db_hashstore_retention_days = {}\n\
             db_prune_interval_hours = {}\n\
             hourly_agg_interval_minutes = {}\n\
             \n\
             websocket_batch_interval_ms = {}\n\
             websocket_batch_size = {}\n\
             \n\
             max_geoip_cache_size = {}\n\
             \n\
             node_api_timeout_seconds = {}\n\
             node_api_default_port = {}\n\
             allow_remote_api = {}\n\
             \n\
             log_level = {:?}\n",
            self.database_file.display().to_string(),
            self.geoip_database_path.display().to_string(),
            self.server_host,
            self.server_port,
            self.stats_window_minutes,
            self.stats_interval_seconds,
            self.performance_interval_seconds,
            self.db_write_batch_interval_seconds,
            self.db_queue_max_size,
            self.db_events_retention_days,
            self.db_hashstore_retention_days,
            self.db_prune_interval_hours,
            self.hourly_agg_interval_minutes,
            self.websocket_batch_interval_ms,
            self.websocket_batch_size,
            self.max_geoip_cache_size,
            self.node_api_timeout_seconds,
            self.node_api_default_port,
            self.allow_remote_api,
            self.log_level,
        )
    }
}

fn env_num<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_toml() {
        let defaults = Config::default();
        let toml_str = defaults.to_toml();
        let parsed: FileConfig = toml::from_str(&toml_str).expect("template must parse");
        assert_eq!(parsed.server_port, Some(defaults.server_port));
        assert_eq!(parsed.db_events_retention_days, Some(defaults.db_events_retention_days));
    }
}
