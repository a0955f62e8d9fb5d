//! Runtime configuration, read from environment variables.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

/// Which [`ChatStore`](crate::store::ChatStore) the binary runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Redis,
}

impl FromStr for StoreBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(StoreBackend::Memory),
            "redis" => Ok(StoreBackend::Redis),
            other => Err(ConfigError::Invalid {
                key: "RELAY_STORE",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value `{value}` for {key}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    pub store: StoreBackend,
    pub redis_url: String,
    /// Upper bound on a single frame write.
    pub send_timeout: Duration,
    /// A connection with no inbound frame for this long is closed.
    pub idle_timeout: Duration,
    /// Delay before a listener resubscribes after its subscription failed.
    pub listener_backoff: Duration,
    /// Upper bound on a participants lookup.
    pub lookup_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            store: StoreBackend::Memory,
            redis_url: "redis://127.0.0.1/".to_string(),
            send_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(300),
            listener_backoff: Duration::from_secs(5),
            lookup_timeout: Duration::from_secs(3),
        }
    }
}

impl RelayConfig {
    /// Reads the configuration from the process environment. Unset variables
    /// keep their defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an explicit variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(addr) = lookup("RELAY_LISTEN_ADDR") {
            config.listen_addr = parse("RELAY_LISTEN_ADDR", &addr)?;
        }
        if let Some(store) = lookup("RELAY_STORE") {
            config.store = store.parse()?;
        }
        if let Some(url) = lookup("REDIS_URL") {
            config.redis_url = url;
        }
        if let Some(ms) = lookup("RELAY_SEND_TIMEOUT_MS") {
            config.send_timeout = Duration::from_millis(parse("RELAY_SEND_TIMEOUT_MS", &ms)?);
        }
        if let Some(secs) = lookup("RELAY_IDLE_TIMEOUT_SECS") {
            config.idle_timeout = Duration::from_secs(parse("RELAY_IDLE_TIMEOUT_SECS", &secs)?);
        }
        if let Some(ms) = lookup("RELAY_LISTENER_BACKOFF_MS") {
            config.listener_backoff =
                Duration::from_millis(parse("RELAY_LISTENER_BACKOFF_MS", &ms)?);
        }
        if let Some(ms) = lookup("RELAY_COALESCE_TIMEOUT_MS") {
            config.lookup_timeout = Duration::from_millis(parse("RELAY_COALESCE_TIMEOUT_MS", &ms)?);
        }

        Ok(config)
    }
}

fn parse<T: FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        key,
        value: value.to_string(),
    })
}
