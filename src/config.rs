use std::env;
use std::time::Duration;

use crate::error::ConfigError;

/// Runtime configuration, read from the environment (and `.env` via dotenvy
/// before `from_env` is called). Everything except the connection strings has
/// a sensible default so a local setup only needs `DATABASE_URL` and
/// `VALKEY_URL`.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub valkey_url: String,
    pub bind_addr: String,
    /// Hard ceiling on simultaneous SSE subscriptions across all polls.
    pub max_sse_connections_total: usize,
    /// Per-user ceiling on simultaneous SSE subscriptions. Anonymous viewers
    /// only count toward the global limit.
    pub max_sse_connections_per_user: usize,
    /// Interval for SSE keepalives; also the mailbox wait timeout, so idle
    /// client streams get polled for liveness at this cadence.
    pub sse_keepalive: Duration,
    /// How often the vote processor commits consumer progress.
    pub event_commit_interval: Duration,
    /// Stable consumer name within the event log's consumer group, so a
    /// restarted worker picks up its own unacknowledged backlog.
    pub event_consumer_name: String,
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::MissingVar(name))
}

fn parsed_or<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| ConfigError::InvalidVar(name, raw)),
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Config {
            database_url: required("DATABASE_URL")?,
            valkey_url: required("VALKEY_URL")?,
            bind_addr: env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            max_sse_connections_total: parsed_or("MAX_SSE_CONNECTIONS_TOTAL", 1000)?,
            max_sse_connections_per_user: parsed_or("MAX_SSE_CONNECTIONS_PER_USER", 5)?,
            sse_keepalive: Duration::from_secs(parsed_or("SSE_KEEPALIVE_SECS", 30u64)?),
            event_commit_interval: Duration::from_secs(parsed_or("EVENT_COMMIT_SECS", 5u64)?),
            event_consumer_name: env::var("EVENT_CONSUMER_NAME")
                .unwrap_or_else(|_| "vote-worker-1".to_string()),
        })
    }
}
