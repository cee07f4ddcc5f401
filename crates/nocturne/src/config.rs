use std::path::PathBuf;
use std::time::Duration;

use crate::error::{NocturneError, NocturneResult};

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_DOC_ROOT: &str = "./resources";
pub const DEFAULT_WORKERS: usize = 8;
pub const DEFAULT_MAX_REQUESTS: usize = 10_000;
pub const DEFAULT_MAX_CONNECTIONS: usize = 65_536;
pub const DEFAULT_MAX_EVENTS: usize = 10_000;
/// Interval between idle-timer ticks.
pub const TIMESLOT: Duration = Duration::from_secs(5);

/// Server configuration, fixed at startup.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Interface to bind (default: 0.0.0.0)
    pub host: String,

    /// TCP port; 0 asks the kernel for an ephemeral port.
    pub port: u16,

    /// Directory every request path is resolved under.
    pub doc_root: PathBuf,

    /// Number of worker threads (default: 8)
    pub workers: usize,

    /// Maximum number of ready connections waiting for a worker (default: 10000)
    pub max_requests: usize,

    /// Size of the connection table; also the highest accepted descriptor + 1.
    pub max_connections: usize,

    /// Events drained per `epoll_wait` call.
    pub max_events: usize,

    /// Close connections that stay idle this long. `None` disables the timer list.
    pub idle_timeout: Option<Duration>,

    /// How often expired idle timers are checked.
    pub tick_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: 0,
            doc_root: PathBuf::from(DEFAULT_DOC_ROOT),
            workers: DEFAULT_WORKERS,
            max_requests: DEFAULT_MAX_REQUESTS,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_events: DEFAULT_MAX_EVENTS,
            idle_timeout: Some(TIMESLOT * 3),
            tick_interval: TIMESLOT,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables (with .env support).
    pub fn from_env() -> Self {
        // Load .env file if present (ignore errors if missing)
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from any key/value source. Unparsable values
    /// fall back to their defaults.
    pub fn from_lookup<F>(get: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let parse = |key: &str, default: usize| -> usize {
            get(key).and_then(|v| v.trim().parse().ok()).unwrap_or(default)
        };

        let idle_timeout = match get("NOCTURNE_IDLE_TIMEOUT_SECS").and_then(|v| v.trim().parse::<u64>().ok()) {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => defaults.idle_timeout,
        };

        ServerConfig {
            host: get("NOCTURNE_HOST").unwrap_or(defaults.host),
            port: defaults.port,
            doc_root: get("NOCTURNE_DOC_ROOT").map(PathBuf::from).unwrap_or(defaults.doc_root),
            workers: parse("NOCTURNE_WORKERS", defaults.workers),
            max_requests: parse("NOCTURNE_MAX_REQUESTS", defaults.max_requests),
            max_connections: parse("NOCTURNE_MAX_CONNECTIONS", defaults.max_connections),
            max_events: defaults.max_events,
            idle_timeout,
            tick_interval: get("NOCTURNE_TICK_SECS")
                .and_then(|v| v.trim().parse::<u64>().ok())
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.tick_interval),
        }
    }

    /// Reject configurations the server cannot start with.
    pub fn validate(&self) -> NocturneResult<()> {
        if self.workers == 0 {
            return Err(NocturneError::InvalidConfig("workers must be > 0".into()));
        }
        if self.max_requests == 0 {
            return Err(NocturneError::InvalidConfig("max_requests must be > 0".into()));
        }
        if self.max_connections == 0 {
            return Err(NocturneError::InvalidConfig("max_connections must be > 0".into()));
        }
        if self.max_events == 0 {
            return Err(NocturneError::InvalidConfig("max_events must be > 0".into()));
        }
        if self.tick_interval.is_zero() {
            return Err(NocturneError::InvalidConfig("tick_interval must be > 0".into()));
        }
        if self.doc_root.to_str().is_none() {
            return Err(NocturneError::InvalidConfig(format!(
                "document root {} is not valid UTF-8",
                self.doc_root.display()
            )));
        }
        if !self.doc_root.is_dir() {
            return Err(NocturneError::InvalidConfig(format!(
                "document root {} is not a directory",
                self.doc_root.display()
            )));
        }
        Ok(())
    }

    /// Get the full server address.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
