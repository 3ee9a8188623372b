use serde::Deserialize;

/// Flowline runtime configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// HTTP server bind address
    pub bind_address: String,
    /// HTTP server port
    pub port: u16,
    /// SQLite database path, shared by store and queue
    pub db_path: String,
    /// Log level when RUST_LOG is unset
    pub log_level: String,
    /// Size of the batch worker pool
    pub workers: usize,
    /// Seconds between schedule-fire cron ticks
    pub schedule_interval_secs: u64,
    /// Seconds between campaign-fire cron ticks
    pub campaign_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8070,
            db_path: "flowline.db".to_string(),
            log_level: "info".to_string(),
            workers: 4,
            schedule_interval_secs: 60,
            campaign_interval_secs: 60,
        }
    }
}

impl Config {
    /// Load configuration from environment variables with sensible defaults.
    pub fn from_env() -> Self {
        let defaults = Config::default();
        Self {
            bind_address: std::env::var("FLOWLINE_BIND").unwrap_or(defaults.bind_address),
            port: std::env::var("FLOWLINE_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            db_path: std::env::var("FLOWLINE_DB").unwrap_or(defaults.db_path),
            log_level: std::env::var("RUST_LOG").unwrap_or(defaults.log_level),
            workers: std::env::var("FLOWLINE_WORKERS")
                .ok()
                .and_then(|w| w.parse().ok())
                .unwrap_or(defaults.workers),
            schedule_interval_secs: std::env::var("FLOWLINE_SCHEDULE_INTERVAL")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.schedule_interval_secs),
            campaign_interval_secs: std::env::var("FLOWLINE_CAMPAIGN_INTERVAL")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.campaign_interval_secs),
        }
    }
}
