//! Server configuration loaded from environment variables.
//!
//! Environment variables are prefixed with `WINDLASS_`:
//! - `WINDLASS_HOST`: Server bind address (default: "0.0.0.0")
//! - `WINDLASS_PORT`: Server port (default: 8090)
//! - `WINDLASS_SERVER_NAME`: Server name for identification
//! - `WINDLASS_DEBUG`: Enable debug mode (default: false)
//! - `WINDLASS_POLL_TIMEOUT_SECS`: Long-poll timeout for task polls

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Server bind address
    #[serde(default = "default_host")]
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Server name for identification
    #[serde(default = "default_server_name")]
    pub server_name: String,

    /// Enable debug mode
    #[serde(default)]
    pub debug: bool,

    /// Long-poll timeout for workflow and activity task polls, in seconds
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_secs: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8090
}

fn default_server_name() -> String {
    "windlass-server".to_string()
}

fn default_poll_timeout() -> u64 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            server_name: default_server_name(),
            debug: false,
            poll_timeout_secs: default_poll_timeout(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from `WINDLASS_`-prefixed environment variables.
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::prefixed("WINDLASS_").from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 8090);
        assert_eq!(config.poll_timeout_secs, 30);
        assert!(!config.debug);
    }
}
