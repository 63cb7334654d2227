//! Configuration for the relay server and for peer processes.

use std::time::Duration;

/// Relay-side defaults (spec §6).
pub mod defaults {
    use std::time::Duration;

    pub const PORT: u16 = 8765;
    pub const HOST: &str = "0.0.0.0";
    pub const KEEP_ALIVE_MS: u64 = 30_000;
    pub const REQUEST_TIMEOUT_MS: u64 = 30_000;

    /// Peer-side defaults (spec §6).
    pub const RECONNECT_BASE_DELAY_MS: u64 = 1_000;
    pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;
    pub const CONNECTION_TIMEOUT_MS: u64 = 30_000;

    pub const KEEP_ALIVE: Duration = Duration::from_millis(KEEP_ALIVE_MS);
    pub const REQUEST_TIMEOUT: Duration = Duration::from_millis(REQUEST_TIMEOUT_MS);
}

/// Relay server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// TCP port to bind.
    pub port: u16,

    /// Interface to bind.
    pub host: String,

    /// Heartbeat interval on each push channel.
    pub keep_alive: Duration,

    /// Forward timeout for a caller request awaiting a provider response.
    pub request_timeout: Duration,

    /// Verbose logging.
    pub debug: bool,
}

impl RelayConfig {
    #[must_use]
    pub fn new(port: u16, host: impl Into<String>) -> Self {
        Self {
            port,
            host: host.into(),
            keep_alive: defaults::KEEP_ALIVE,
            request_timeout: defaults::REQUEST_TIMEOUT,
            debug: false,
        }
    }

    /// Build a configuration from environment variables, falling back to
    /// the defaults in spec §6 for anything unset.
    ///
    /// # Errors
    ///
    /// Returns an error if a numeric environment variable fails to parse.
    pub fn from_env() -> anyhow::Result<Self> {
        let port = env_parsed("TOOL_RELAY_PORT", defaults::PORT)?;
        let host = std::env::var("TOOL_RELAY_HOST").unwrap_or_else(|_| defaults::HOST.to_string());
        let keep_alive_ms = env_parsed("TOOL_RELAY_KEEP_ALIVE_MS", defaults::KEEP_ALIVE_MS)?;
        let request_timeout_ms =
            env_parsed("TOOL_RELAY_REQUEST_TIMEOUT_MS", defaults::REQUEST_TIMEOUT_MS)?;
        let debug = std::env::var("TOOL_RELAY_DEBUG").is_ok_and(|v| v == "1" || v == "true");

        Ok(Self {
            port,
            host,
            keep_alive: Duration::from_millis(keep_alive_ms),
            request_timeout: Duration::from_millis(request_timeout_ms),
            debug,
        })
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self::new(defaults::PORT, defaults::HOST)
    }
}

/// Peer (provider or caller) configuration.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Base URL of the relay, e.g. `http://localhost:8765`.
    pub server_url: String,

    /// Session id to attach under. Generated if absent.
    pub session_id: Option<String>,

    /// Retry the push-channel attach with exponential backoff.
    pub auto_reconnect: bool,

    /// Base delay for the reconnect backoff.
    pub reconnect_base_delay: Duration,

    /// Maximum reconnect attempts before giving up.
    pub max_reconnect_attempts: u32,

    /// Timeout for a single attach attempt.
    pub connection_timeout: Duration,

    /// Timeout for an individual `request()` call.
    pub request_timeout: Duration,

    /// Verbose logging.
    pub debug: bool,
}

impl PeerConfig {
    #[must_use]
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            session_id: None,
            auto_reconnect: true,
            reconnect_base_delay: Duration::from_millis(defaults::RECONNECT_BASE_DELAY_MS),
            max_reconnect_attempts: defaults::MAX_RECONNECT_ATTEMPTS,
            connection_timeout: Duration::from_millis(defaults::CONNECTION_TIMEOUT_MS),
            request_timeout: defaults::REQUEST_TIMEOUT,
            debug: false,
        }
    }

    #[must_use]
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

fn env_parsed<T: std::str::FromStr>(name: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(value) => value
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid value for {name}: {e}")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_config_default_matches_spec_defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.port, 8765);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.keep_alive, Duration::from_secs(30));
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert!(!config.debug);
    }

    #[test]
    fn peer_config_default_matches_spec_defaults() {
        let config = PeerConfig::new("http://localhost:8765");
        assert!(config.auto_reconnect);
        assert_eq!(config.max_reconnect_attempts, 5);
        assert_eq!(config.reconnect_base_delay, Duration::from_secs(1));
        assert!(config.session_id.is_none());
    }

    #[test]
    fn peer_config_with_session_id() {
        let config = PeerConfig::new("http://localhost:8765").with_session_id("abc");
        assert_eq!(config.session_id.as_deref(), Some("abc"));
    }
}
