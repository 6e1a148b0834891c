use crate::protocol::{MuxKey, NodeAddress, MAX_MUX_KEY};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_TIMEOUT_MS: u64 = 1000;
pub const DEFAULT_MAX_SUBSCRIBERS: usize = 8;
pub const DEFAULT_BUFFER_COUNT: usize = 10;
pub const DEFAULT_TCP_BASE_PORT: u16 = 8200;
pub const DEFAULT_INBOX_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    Invalid(&'static str),
}

/// Settings shared by connections, endpoints and the transports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub connect_timeout_ms: u64,
    pub send_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub accept_timeout_ms: u64,
    pub max_subscribers: usize,
    pub buffer_count: usize,
    /// Key carrying subscription requests; never used for data.
    pub control_key: MuxKey,
    pub tcp_base_port: u16,
    /// Host table for the TCP transport. Unlisted nodes resolve to loopback.
    pub nodes: BTreeMap<u8, String>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: DEFAULT_TIMEOUT_MS,
            send_timeout_ms: DEFAULT_TIMEOUT_MS,
            read_timeout_ms: DEFAULT_TIMEOUT_MS,
            accept_timeout_ms: DEFAULT_TIMEOUT_MS,
            max_subscribers: DEFAULT_MAX_SUBSCRIBERS,
            buffer_count: DEFAULT_BUFFER_COUNT,
            control_key: MuxKey::CONTROL,
            tcp_base_port: DEFAULT_TCP_BASE_PORT,
            nodes: BTreeMap::new(),
        }
    }
}

impl LinkConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: LinkConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_subscribers == 0 {
            return Err(ConfigError::Invalid("max_subscribers must be at least 1"));
        }
        if self.buffer_count == 0 {
            return Err(ConfigError::Invalid("buffer_count must be at least 1"));
        }
        if self.control_key.is_service() {
            return Err(ConfigError::Invalid("control_key collides with a service key"));
        }
        // Every key must map to a real port above the base.
        if self.tcp_base_port > u16::MAX - u16::from(MAX_MUX_KEY) {
            return Err(ConfigError::Invalid("tcp_base_port leaves no room for every key"));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn accept_timeout(&self) -> Duration {
        Duration::from_millis(self.accept_timeout_ms)
    }

    pub fn host_for(&self, address: NodeAddress) -> &str {
        self.nodes.get(&address.0).map_or("127.0.0.1", String::as_str)
    }
}

/// What a bus context does when two handlers claim the same (interface, member).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum HandlerConflict {
    /// The first registration stays, later ones are dropped with a warning.
    #[default]
    KeepFirst,
    Reject,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub call_timeout_ms: u64,
    pub inbox_capacity: usize,
    pub handler_conflict: HandlerConflict,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: DEFAULT_TIMEOUT_MS,
            inbox_capacity: DEFAULT_INBOX_CAPACITY,
            handler_conflict: HandlerConflict::KeepFirst,
        }
    }
}

impl BusConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LinkConfig::default();
        assert_eq!(config.connect_timeout(), Duration::from_secs(1));
        assert_eq!(config.control_key, MuxKey::CONTROL);
        assert_eq!(config.host_for(NodeAddress(4)), "127.0.0.1");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = LinkConfig::from_json_str(
            r#"{"max_subscribers":3,"control_key":20,"nodes":{"4":"10.0.0.4"}}"#,
        )
        .unwrap();
        assert_eq!(config.max_subscribers, 3);
        assert_eq!(config.control_key.value(), 20);
        assert_eq!(config.host_for(NodeAddress(4)), "10.0.0.4");
        assert_eq!(config.read_timeout_ms, DEFAULT_TIMEOUT_MS);
    }

    #[test]
    fn test_invalid_json_values() {
        assert!(matches!(
            LinkConfig::from_json_str(r#"{"control_key":40}"#),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            LinkConfig::from_json_str(r#"{"control_key":28}"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            LinkConfig::from_json_str(r#"{"max_subscribers":0}"#),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_tcp_base_port_must_fit_every_key() {
        assert!(matches!(
            LinkConfig::from_json_str(r#"{"tcp_base_port":65530}"#),
            Err(ConfigError::Invalid(_))
        ));

        let highest = u16::MAX - u16::from(MAX_MUX_KEY);
        let config = LinkConfig::from_json_str(&format!(r#"{{"tcp_base_port":{highest}}}"#)).unwrap();
        assert_eq!(config.tcp_base_port, highest);
    }

    #[test]
    fn test_bus_config_conflict_policy() {
        let config: BusConfig = serde_json::from_str(r#"{"handler_conflict":"Reject"}"#).unwrap();
        assert_eq!(config.handler_conflict, HandlerConflict::Reject);
        assert_eq!(config.call_timeout(), Duration::from_secs(1));
    }
}
