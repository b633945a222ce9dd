//! Server configuration
//!
//! Every field has a default, so a TOML file only needs the keys it changes.

use crate::codec::DEFAULT_MAX_LINE_LENGTH;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind the listener to
    pub bind_addr: String,

    /// Port used by the server binary
    pub port: u16,

    /// Responses buffered per connection before further ones are dropped
    pub outbound_queue_capacity: usize,

    /// Requests waiting for the coordinator
    pub request_channel_capacity: usize,

    /// Connect/disconnect events waiting for the coordinator
    pub event_channel_capacity: usize,

    /// Longest accepted command line, in bytes
    pub max_line_length: usize,

    /// How long a closing connection may spend flushing queued responses
    pub drain_timeout_ms: u64,

    /// Disable Nagle's algorithm on accepted sockets
    pub tcp_nodelay: bool,

    /// Journal file for the store (memory-only if not set)
    pub wal_path: Option<PathBuf>,

    /// Log level
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1".to_string(),
            port: 9999,
            outbound_queue_capacity: 500,
            request_channel_capacity: 1024,
            event_channel_capacity: 1024,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
            drain_timeout_ms: 1000,
            tcp_nodelay: true,
            wal_path: None,
            log_level: "info".to_string(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from a TOML file; missing keys take their defaults
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: ServerConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("outbound_queue_capacity", self.outbound_queue_capacity),
            ("request_channel_capacity", self.request_channel_capacity),
            ("event_channel_capacity", self.event_channel_capacity),
            ("max_line_length", self.max_line_length),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(Error::Config(format!("{} must be > 0", name)));
            }
        }
        Ok(())
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_are_valid() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.outbound_queue_capacity, 500);
        assert_eq!(config.drain_timeout(), Duration::from_secs(1));
        assert!(config.tcp_nodelay);
    }

    #[test]
    fn test_from_file_fills_missing_keys() {
        let temp_file = NamedTempFile::new().unwrap();
        fs::write(
            temp_file.path(),
            "port = 7000\noutbound_queue_capacity = 8\ntcp_nodelay = false\nwal_path = \"data.wal\"\n",
        )
        .unwrap();

        let config = ServerConfig::from_file(temp_file.path()).unwrap();
        assert_eq!(config.port, 7000);
        assert_eq!(config.outbound_queue_capacity, 8);
        assert!(!config.tcp_nodelay);
        assert_eq!(config.wal_path, Some(PathBuf::from("data.wal")));
        assert_eq!(config.bind_addr, "127.0.0.1");
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let config = ServerConfig {
            outbound_queue_capacity: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }
}
