use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// How packets travel on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Framing {
    /// Packets are written to the link as-is. Suited to links that preserve
    /// message boundaries (one send, one delivery).
    #[default]
    Raw,
    /// Packets ride inside checksummed frames and are reassembled from the
    /// byte stream on receipt. Required for serial-style links.
    Framed,
}

/// Node and peer behavior configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NodeConfig {
    /// Numeric identity of the local node.
    pub node_id: u32,
    /// Total time a synchronous call waits for its response. Default: 5 s.
    #[serde(rename = "call_timeout_ms", with = "duration_ms")]
    pub call_timeout: Duration,
    /// Longest single wait between status checks of a blocked call. Default: 100 ms.
    #[serde(rename = "poll_interval_ms", with = "duration_ms")]
    pub poll_interval: Duration,
    /// Age after which an unfinished outgoing request is reclaimed. Default: 30 s.
    #[serde(rename = "request_retention_ms", with = "duration_ms")]
    pub request_retention: Duration,
    /// Wire framing for packets.
    pub framing: Framing,
    /// Maximum inbound requests waiting for dispatch. Default: 64.
    pub max_queued_requests: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: 0,
            call_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(100),
            request_retention: Duration::from_secs(30),
            framing: Framing::Raw,
            max_queued_requests: 64,
        }
    }
}

impl NodeConfig {
    /// Parse a JSON configuration document. Missing fields take defaults.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Load a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NodeError;

    #[test]
    fn defaults_match_protocol_constants() {
        let config = NodeConfig::default();
        assert_eq!(config.call_timeout, Duration::from_secs(5));
        assert_eq!(config.poll_interval, Duration::from_millis(100));
        assert_eq!(config.framing, Framing::Raw);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = NodeConfig::from_json(r#"{"call_timeout_ms": 250, "framing": "framed"}"#).unwrap();
        assert_eq!(config.call_timeout, Duration::from_millis(250));
        assert_eq!(config.framing, Framing::Framed);
        assert_eq!(config.poll_interval, Duration::from_millis(100));
        assert_eq!(config.max_queued_requests, 64);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = NodeConfig::from_json(r#"{"call_timeout": 1}"#).unwrap_err();
        assert!(matches!(err, NodeError::Config(_)));
    }

    #[test]
    fn json_roundtrip() {
        let config = NodeConfig {
            node_id: 7,
            framing: Framing::Framed,
            ..NodeConfig::default()
        };
        let text = serde_json::to_string(&config).unwrap();
        assert!(text.contains("\"poll_interval_ms\":100"));
        assert_eq!(NodeConfig::from_json(&text).unwrap(), config);
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = NodeConfig::from_file("/nonexistent/linkrpc/node.json").unwrap_err();
        assert!(matches!(err, NodeError::Io(_)));
    }
}
