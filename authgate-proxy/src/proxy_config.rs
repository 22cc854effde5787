//! Network and runtime tuning for the proxy, read from the environment.
//!
//! Route, key and upstream configuration lives in the YAML file loaded by
//! `authgate_core::config`; this module only covers socket and connection
//! behaviour.

use std::time::Duration;
use tracing::warn;

/// Runtime configuration for the authgate proxy.
///
/// All parameters can be overridden via environment variables.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Enable TCP_NODELAY (Nagle's algorithm disabled)
    pub tcp_nodelay: bool,

    /// TCP keepalive interval in seconds
    pub tcp_keepalive_secs: u64,

    /// Maximum concurrent client connections; overflow gets 503
    pub max_concurrent_streams: usize,

    /// Socket buffer size (SO_RCVBUF / SO_SNDBUF)
    pub socket_buffer_size: usize,

    /// Maximum number of idle upstream connections per host
    pub pool_max_idle_per_host: usize,

    /// Deadline for the upstream to return response headers
    pub request_timeout: Duration,

    /// How long in-flight connections may drain after a shutdown signal
    pub shutdown_timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            tcp_nodelay: true,
            tcp_keepalive_secs: 60,
            max_concurrent_streams: 10000,
            socket_buffer_size: 262144, // 256 KB
            pool_max_idle_per_host: 128,
            request_timeout: Duration::from_secs(300),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl ProxyConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// # Environment Variables
    ///
    /// - `AUTHGATE_TCP_NODELAY` (default: true)
    /// - `AUTHGATE_TCP_KEEPALIVE_SECS` (default: 60)
    /// - `AUTHGATE_MAX_CONCURRENT_STREAMS` (default: 10000)
    /// - `AUTHGATE_SOCKET_BUFFER_SIZE` (default: 262144)
    /// - `AUTHGATE_POOL_MAX_IDLE` (default: 128)
    /// - `AUTHGATE_REQUEST_TIMEOUT_SECS` (default: 300)
    /// - `AUTHGATE_SHUTDOWN_TIMEOUT_SECS` (default: 30)
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            tcp_nodelay: parse_env_warn("AUTHGATE_TCP_NODELAY", default.tcp_nodelay),

            tcp_keepalive_secs: parse_env_warn(
                "AUTHGATE_TCP_KEEPALIVE_SECS",
                default.tcp_keepalive_secs,
            ),

            max_concurrent_streams: parse_env_warn(
                "AUTHGATE_MAX_CONCURRENT_STREAMS",
                default.max_concurrent_streams,
            ),

            socket_buffer_size: parse_env_warn(
                "AUTHGATE_SOCKET_BUFFER_SIZE",
                default.socket_buffer_size,
            ),

            pool_max_idle_per_host: parse_env_warn(
                "AUTHGATE_POOL_MAX_IDLE",
                default.pool_max_idle_per_host,
            ),

            request_timeout: Duration::from_secs(parse_env_warn(
                "AUTHGATE_REQUEST_TIMEOUT_SECS",
                default.request_timeout.as_secs(),
            )),

            shutdown_timeout: Duration::from_secs(parse_env_warn(
                "AUTHGATE_SHUTDOWN_TIMEOUT_SECS",
                default.shutdown_timeout.as_secs(),
            )),
        }
    }
}

/// Parse an environment variable with a warning on invalid values.
///
/// If the env var is set but cannot be parsed, logs a warning and returns the default.
/// If the env var is not set, returns the default silently.
fn parse_env_warn<T: std::str::FromStr + std::fmt::Display>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(val) => match val.parse::<T>() {
            Ok(parsed) => parsed,
            Err(_) => {
                warn!(
                    env_var = name,
                    value = %val,
                    default = %default,
                    "Invalid value for environment variable, using default"
                );
                default
            }
        },
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ProxyConfig::default();

        assert!(config.tcp_nodelay);
        assert_eq!(config.tcp_keepalive_secs, 60);
        assert_eq!(config.max_concurrent_streams, 10000);
        assert_eq!(config.socket_buffer_size, 262144);
        assert_eq!(config.pool_max_idle_per_host, 128);
        assert_eq!(config.request_timeout, Duration::from_secs(300));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(30));
    }

    #[test]
    #[serial_test::serial]
    fn test_config_env_loading() {
        unsafe {
            std::env::set_var("AUTHGATE_MAX_CONCURRENT_STREAMS", "5000");
            std::env::set_var("AUTHGATE_REQUEST_TIMEOUT_SECS", "12");
            std::env::set_var("AUTHGATE_TCP_NODELAY", "false");
        }
        let config = ProxyConfig::from_env();
        assert_eq!(config.max_concurrent_streams, 5000);
        assert_eq!(config.request_timeout, Duration::from_secs(12));
        assert!(!config.tcp_nodelay);
        unsafe {
            std::env::remove_var("AUTHGATE_MAX_CONCURRENT_STREAMS");
            std::env::remove_var("AUTHGATE_REQUEST_TIMEOUT_SECS");
            std::env::remove_var("AUTHGATE_TCP_NODELAY");
        }
    }

    #[test]
    #[serial_test::serial]
    fn test_invalid_env_value_falls_back() {
        unsafe {
            std::env::set_var("AUTHGATE_SOCKET_BUFFER_SIZE", "lots");
        }
        let config = ProxyConfig::from_env();
        assert_eq!(config.socket_buffer_size, 262144);
        unsafe {
            std::env::remove_var("AUTHGATE_SOCKET_BUFFER_SIZE");
        }
    }
}
