//! Endpoint, connection and channel configuration
//!
//! Every section has serde defaults so a TOML file only needs the values it
//! changes:
//!
//! ```toml
//! endpoint_name = "billing"
//! worker_threads = 4
//!
//! [channel]
//! outbound_window = 32
//! local_queue_capacity = 16
//!
//! [connection]
//! remote_auth = false
//! ```

use crate::error::{RemotingError, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

/// Per-channel options, negotiated when a channel opens
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelOptions {
    /// Maximum concurrently open outbound messages
    pub outbound_window: u32,
    /// Maximum concurrently open inbound messages
    pub inbound_window: u32,
    /// Capacity of an in-process channel's message queue
    pub local_queue_capacity: usize,
    /// Largest outbound message in bytes; `None` for unbounded
    pub max_outbound_message_size: Option<u64>,
    /// Attempts to find a free message ID before reporting `ChannelBusy`
    pub message_id_retries: u32,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            outbound_window: 80,
            inbound_window: 80,
            local_queue_capacity: 8,
            max_outbound_message_size: None,
            message_id_retries: 16,
        }
    }
}

impl ChannelOptions {
    /// Check option invariants
    pub fn validate(&self) -> Result<()> {
        if self.outbound_window == 0 || self.inbound_window == 0 {
            return Err(RemotingError::configuration(
                "message windows must be at least 1",
            ));
        }
        if self.local_queue_capacity == 0 {
            return Err(RemotingError::configuration(
                "local_queue_capacity must be at least 1",
            ));
        }
        if self.message_id_retries == 0 {
            return Err(RemotingError::configuration(
                "message_id_retries must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Per-connection options handed to connection providers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionOptions {
    /// Maximum channels this side may have open on one connection
    pub max_outbound_channels: u32,
    /// Local address to bind, for providers that bind sockets
    pub bind_address: Option<SocketAddr>,
    /// Whether the provider should offer identity switching over the connection
    pub remote_auth: bool,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            max_outbound_channels: 40,
            bind_address: None,
            remote_auth: true,
        }
    }
}

/// Endpoint configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Name reported to peers and used in logs; generated when absent
    pub endpoint_name: Option<String>,
    /// Size of a dedicated worker pool; 0 runs on the ambient runtime
    pub worker_threads: usize,
    /// Default channel options
    pub channel: ChannelOptions,
    /// Default connection options
    pub connection: ConnectionOptions,
    /// Attempts to find a free authentication ID
    pub auth_id_retries: u32,
    /// Bound on cached identities per connection
    pub max_cached_identities: usize,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            endpoint_name: None,
            worker_threads: 0,
            channel: ChannelOptions::default(),
            connection: ConnectionOptions::default(),
            auth_id_retries: 16,
            max_cached_identities: 64,
        }
    }
}

impl EndpointConfig {
    /// Parse from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)
            .map_err(|e| RemotingError::configuration(format!("invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            RemotingError::configuration(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }

    /// Render as TOML
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self)
            .map_err(|e| RemotingError::configuration(format!("failed to render TOML: {e}")))
    }

    /// Check configuration invariants
    pub fn validate(&self) -> Result<()> {
        if let Some(name) = &self.endpoint_name {
            if name.trim().is_empty() {
                return Err(RemotingError::configuration("endpoint_name must not be blank"));
            }
        }
        if self.auth_id_retries == 0 {
            return Err(RemotingError::configuration(
                "auth_id_retries must be at least 1",
            ));
        }
        if self.max_cached_identities == 0 {
            return Err(RemotingError::configuration(
                "max_cached_identities must be at least 1",
            ));
        }
        self.channel.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = EndpointConfig::default();
        config.validate().unwrap();
        assert_eq!(config.channel.local_queue_capacity, 8);
        assert!(config.connection.remote_auth);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = EndpointConfig::from_toml_str(
            r#"
            endpoint_name = "billing"

            [channel]
            outbound_window = 4
            "#,
        )
        .unwrap();
        assert_eq!(config.endpoint_name.as_deref(), Some("billing"));
        assert_eq!(config.channel.outbound_window, 4);
        assert_eq!(config.channel.local_queue_capacity, 8);
        assert_eq!(config.max_cached_identities, 64);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = EndpointConfig::from_toml_str("[channel]\nlocal_queue_capacity = 0\n").unwrap_err();
        assert!(matches!(err, RemotingError::Configuration { .. }));
        assert!(EndpointConfig::from_toml_str("endpoint_name = 7").is_err());
    }

    #[test]
    fn test_load_from_file_and_render() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "worker_threads = 2\n[connection]\nremote_auth = false").unwrap();
        let config = EndpointConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.worker_threads, 2);
        assert!(!config.connection.remote_auth);

        let rendered = config.to_toml_string().unwrap();
        assert_eq!(EndpointConfig::from_toml_str(&rendered).unwrap(), config);
    }
}
