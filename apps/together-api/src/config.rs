use std::str::FromStr;
use std::time::Duration;

/// Which event queue body every session broadcast uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// Single process, no external dependency.
    Local,
    /// Many replicas coordinating through Redis pub/sub and keys.
    Redis,
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "local" | "inmem" | "memory" => Ok(Self::Local),
            "redis" | "distributed" => Ok(Self::Redis),
            other => Err(format!("unknown broadcast backend `{other}` (expected local or redis)")),
        }
    }
}

impl Backend {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Redis => "redis",
        }
    }
}

/// Knobs consumed by the session broadcast engine.
#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    /// Interval between two fan-out passes.
    pub fanout_tick: Duration,
    /// Positions older than this are stale and never broadcast.
    pub inactivity_window: Duration,
    /// How often a distributed queue persists its recovery snapshot.
    pub snapshot_persist_interval: Duration,
    /// Expiry of the persisted snapshot.
    pub snapshot_ttl: Duration,
    /// Whether a member sees its own position echoed back.
    pub echo_self: bool,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            fanout_tick: Duration::from_millis(16),
            inactivity_window: Duration::from_secs(60),
            snapshot_persist_interval: Duration::from_secs(60),
            snapshot_ttl: Duration::from_secs(60 * 60),
            echo_self: true,
        }
    }
}

/// Server configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port the HTTP server binds to.
    pub port: u16,
    pub backend: Backend,
    /// Redis connection string, used when `backend` is `Redis`.
    pub redis_url: String,
    /// Public WebSocket origin used to build join URLs (e.g. `wss://api.example.com`).
    pub public_ws_base: String,
    pub broadcast: BroadcastConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            backend: Backend::Local,
            redis_url: "redis://localhost:6379/0".to_string(),
            public_ws_base: "ws://127.0.0.1:8080".to_string(),
            broadcast: BroadcastConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Every variable is optional. Panics with a descriptive message if one is
    /// present but cannot be parsed.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let broadcast = BroadcastConfig {
            fanout_tick: Duration::from_millis(parsed_var("FANOUT_TICK_MS", 16).max(1)),
            inactivity_window: Duration::from_secs(parsed_var("INACTIVITY_WINDOW_SECS", 60)),
            snapshot_persist_interval: Duration::from_secs(
                parsed_var("SNAPSHOT_PERSIST_SECS", 60).max(1),
            ),
            snapshot_ttl: Duration::from_secs(parsed_var("SNAPSHOT_TTL_SECS", 3600).max(1)),
            echo_self: parsed_var("ECHO_SELF", true),
        };

        Self {
            port: parsed_var("PORT", defaults.port),
            backend: parsed_var("BROADCAST_BACKEND", defaults.backend),
            redis_url: std::env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            public_ws_base: std::env::var("PUBLIC_WS_BASE")
                .map(|v| v.trim_end_matches('/').to_string())
                .unwrap_or(defaults.public_ws_base),
            broadcast,
        }
    }
}

fn parsed_var<T>(name: &str, default: T) -> T
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .unwrap_or_else(|e| panic!("{name} env var is invalid: {e}")),
        _ => default,
    }
}
