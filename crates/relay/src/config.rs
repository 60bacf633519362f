// Relay configuration.
//
// Centralizes environment variable parsing with defaults for local
// development. Pool sizing stays in `db::pool::PoolConfig`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use docsync_common::Author;

use crate::clock::Clock;

const DEFAULT_PORT: u16 = 8080;

/// Timing knobs for caching, flushing and staleness detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncTuning {
    /// Quiet period after the last edit before a scheduled flush commits.
    pub flush_debounce: Duration,
    /// Delay before flushing once the last editor has left.
    pub idle_flush_delay: Duration,
    /// How often live sessions poll the durable head.
    pub head_check_interval: Duration,
    /// How often the sweep job evicts idle documents.
    pub sweep_interval: Duration,
    /// Lifetime of cached CRDT state and its metadata.
    pub state_ttl: Duration,
    /// Lifetime of an active-subscriber counter without a refresh.
    pub active_ttl: Duration,
    /// Lifetime of the marker naming the revision produced by our own flush.
    pub flush_head_ttl: Duration,
    /// Backoff between lock acquisition attempts.
    pub lock_poll_interval: Duration,
    /// Upper bound on concurrently executing flushes in this process.
    pub max_concurrent_flushes: usize,
    /// Source of edit timestamps and debounce decisions.
    pub clock: Clock,
}

impl Default for SyncTuning {
    fn default() -> Self {
        Self {
            flush_debounce: Duration::from_secs(30),
            idle_flush_delay: Duration::from_secs(5),
            head_check_interval: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(15 * 60),
            state_ttl: Duration::from_secs(2 * 60 * 60),
            active_ttl: Duration::from_secs(5 * 60),
            flush_head_ttl: Duration::from_secs(60),
            lock_poll_interval: Duration::from_millis(10),
            max_concurrent_flushes: 5,
            clock: Clock::System,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Core relay configuration.
///
/// Constructed via [`RelayConfig::from_env`] which reads environment
/// variables and falls back to development defaults.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// PostgreSQL connection string. Without one the relay runs single-process
    /// with an in-memory cache and local locks.
    pub database_url: Option<String>,
    /// Directory holding one bare git repository per project.
    pub repos_root: PathBuf,
    /// Log filter directive (e.g. `info`, `docsync_relay=debug`).
    pub log_filter: String,
    pub log_format: LogFormat,
    /// Identity used for background auto-save commits.
    pub autosave_author: Author,
    pub tuning: SyncTuning,
}

impl RelayConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `DOCSYNC_RELAY_HOST` | `0.0.0.0` |
    /// | `DOCSYNC_RELAY_PORT` | `8080` |
    /// | `DOCSYNC_RELAY_DATABASE_URL` | *(none)* |
    /// | `DOCSYNC_RELAY_REPOS_ROOT` | `./repos` |
    /// | `DOCSYNC_RELAY_LOG_FILTER` | `info` |
    /// | `DOCSYNC_RELAY_LOG_FORMAT` | `text` (`json` for structured output) |
    /// | `DOCSYNC_AUTOSAVE_AUTHOR_NAME` | `docsync` |
    /// | `DOCSYNC_AUTOSAVE_AUTHOR_EMAIL` | `docsync@localhost` |
    /// | `DOCSYNC_FLUSH_DEBOUNCE_SECS` | `30` |
    /// | `DOCSYNC_IDLE_FLUSH_DELAY_SECS` | `5` |
    /// | `DOCSYNC_HEAD_CHECK_INTERVAL_SECS` | `10` |
    /// | `DOCSYNC_SWEEP_INTERVAL_SECS` | `900` |
    /// | `DOCSYNC_STATE_TTL_SECS` | `7200` |
    /// | `DOCSYNC_ACTIVE_TTL_SECS` | `300` |
    /// | `DOCSYNC_FLUSH_HEAD_TTL_SECS` | `60` |
    /// | `DOCSYNC_LOCK_POLL_MS` | `10` |
    /// | `DOCSYNC_MAX_CONCURRENT_FLUSHES` | `5` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("DOCSYNC_RELAY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 =
            env("DOCSYNC_RELAY_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(DEFAULT_PORT);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let database_url = env("DOCSYNC_RELAY_DATABASE_URL").ok().filter(|v| !v.is_empty());
        let repos_root =
            env("DOCSYNC_RELAY_REPOS_ROOT").map(PathBuf::from).unwrap_or_else(|_| "./repos".into());
        let log_filter = env("DOCSYNC_RELAY_LOG_FILTER").unwrap_or_else(|_| "info".into());
        let log_format = match env("DOCSYNC_RELAY_LOG_FORMAT").as_deref() {
            Ok("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };

        let autosave_author = Author::new(
            env("DOCSYNC_AUTOSAVE_AUTHOR_NAME").unwrap_or_else(|_| "docsync".into()),
            env("DOCSYNC_AUTOSAVE_AUTHOR_EMAIL").unwrap_or_else(|_| "docsync@localhost".into()),
        );

        let defaults = SyncTuning::default();
        let secs = |key: &str, fallback: Duration| {
            env(key)
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(fallback)
        };
        let tuning = SyncTuning {
            flush_debounce: secs("DOCSYNC_FLUSH_DEBOUNCE_SECS", defaults.flush_debounce),
            idle_flush_delay: secs("DOCSYNC_IDLE_FLUSH_DELAY_SECS", defaults.idle_flush_delay),
            head_check_interval: secs(
                "DOCSYNC_HEAD_CHECK_INTERVAL_SECS",
                defaults.head_check_interval,
            ),
            sweep_interval: secs("DOCSYNC_SWEEP_INTERVAL_SECS", defaults.sweep_interval),
            state_ttl: secs("DOCSYNC_STATE_TTL_SECS", defaults.state_ttl),
            active_ttl: secs("DOCSYNC_ACTIVE_TTL_SECS", defaults.active_ttl),
            flush_head_ttl: secs("DOCSYNC_FLUSH_HEAD_TTL_SECS", defaults.flush_head_ttl),
            lock_poll_interval: env("DOCSYNC_LOCK_POLL_MS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.lock_poll_interval),
            max_concurrent_flushes: env("DOCSYNC_MAX_CONCURRENT_FLUSHES")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_concurrent_flushes),
            clock: defaults.clock,
        };

        Self { listen_addr, database_url, repos_root, log_filter, log_format, autosave_author, tuning }
    }
}
