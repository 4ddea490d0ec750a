use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub log_level: String,
    pub max_message_length: usize,
    pub store_timeout: Duration,
    pub blob_root: String,
    pub blob_public_url: String,
    pub max_upload_bytes: usize,
    pub redis_url: Option<String>,
    pub cleanup_interval: Duration,
    pub inactive_retention_days: i64,
    pub stats_log_path: String,
    pub stats_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5001,
            database_url: "sqlite:data/marketchat.db".to_string(),
            log_level: "info".to_string(),
            max_message_length: 2048,
            store_timeout: Duration::from_millis(5000),
            blob_root: "data/blobs".to_string(),
            blob_public_url: "http://127.0.0.1:5002/blobs".to_string(),
            max_upload_bytes: 10 * 1024 * 1024,
            redis_url: None,
            cleanup_interval: Duration::from_secs(24 * 60 * 60),
            inactive_retention_days: 30,
            stats_log_path: "data/marketchat_stats.log".to_string(),
            stats_interval: Duration::from_secs(120),
        }
    }
}

/// Upper bound on `INACTIVE_RETENTION_DAYS`; keeps the retention window representable.
pub const MAX_RETENTION_DAYS: i64 = 36_500;

fn positive_secs(value: Option<String>) -> Option<Duration> {
    value.and_then(|v| v.parse::<u64>().ok()).filter(|secs| *secs > 0).map(Duration::from_secs)
}

impl ServerConfig {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from `lookup`. Unparsable or out-of-range values fall back
    /// to the defaults: intervals and timeouts must be non-zero, retention is
    /// between one day and `MAX_RETENTION_DAYS`.
    pub fn from_lookup<L>(lookup: L) -> Self
    where
        L: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        Self {
            host: lookup("SERVER_HOST").unwrap_or(defaults.host),
            port: lookup("SERVER_PORT").and_then(|p| p.parse().ok()).unwrap_or(defaults.port),
            database_url: lookup("DATABASE_URL").unwrap_or(defaults.database_url),
            log_level: lookup("LOG_LEVEL").unwrap_or(defaults.log_level),
            max_message_length: lookup("MAX_MESSAGE_LENGTH").and_then(|v| v.parse().ok()).unwrap_or(defaults.max_message_length),
            store_timeout: lookup("STORE_TIMEOUT_MS")
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(defaults.store_timeout),
            blob_root: lookup("BLOB_ROOT").unwrap_or(defaults.blob_root),
            blob_public_url: lookup("BLOB_PUBLIC_URL").unwrap_or(defaults.blob_public_url),
            max_upload_bytes: lookup("MAX_UPLOAD_BYTES").and_then(|v| v.parse().ok()).unwrap_or(defaults.max_upload_bytes),
            redis_url: lookup("REDIS_URL").filter(|v| !v.trim().is_empty()),
            cleanup_interval: positive_secs(lookup("CLEANUP_INTERVAL_SECS")).unwrap_or(defaults.cleanup_interval),
            inactive_retention_days: lookup("INACTIVE_RETENTION_DAYS")
                .and_then(|v| v.parse::<i64>().ok())
                .filter(|days| (1..=MAX_RETENTION_DAYS).contains(days))
                .unwrap_or(defaults.inactive_retention_days),
            stats_log_path: lookup("STATS_LOG_PATH").unwrap_or(defaults.stats_log_path),
            stats_interval: positive_secs(lookup("STATS_INTERVAL_SECS")).unwrap_or(defaults.stats_interval),
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
