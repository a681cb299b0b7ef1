//! Configuration model for connections, offset managers, receivers and
//! senders.
//!
//! Blocks are internally tagged by `type`, so an unknown broker or store tag
//! fails at configuration-load time, long before any I/O. Files (TOML, JSON
//! or YAML) can be overridden by `RELAY_`-prefixed environment variables.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::connection::BrokerKind;
use crate::error::{MessagingError, Result};

/// A named broker connection.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ConnectionConfig {
    Kafka {
        brokers: String,
        #[serde(default)]
        group: Option<String>,
    },
    Sqs {
        #[serde(default)]
        region: Option<String>,
        #[serde(default)]
        queue_url_prefix: Option<String>,
    },
    Log {
        /// Journal directory; omit for pure in-memory queues.
        #[serde(default)]
        dir: Option<PathBuf>,
    },
    Stream {
        url: String,
    },
}

/// A named offset-store backend.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OffsetStoreConfig {
    Postgres { url: String },
    Memory,
}

/// Sender block; also the shape of a receiver's nested `errors` block.
#[derive(Debug, Clone, Deserialize)]
pub struct SenderConfig {
    #[serde(rename = "type")]
    pub broker: BrokerKind,
    pub connection: String,
    pub queue: String,
}

/// Receiver block.
#[derive(Debug, Clone, Deserialize)]
pub struct ReceiverConfig {
    #[serde(rename = "type")]
    pub broker: BrokerKind,
    pub connection: String,
    pub queue: String,
    /// Kafka consumer-group override.
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub offset_manager: Option<String>,
    /// `-1` means the default.
    #[serde(default)]
    pub batch_size: Option<i64>,
    #[serde(default)]
    pub receive_timeout_ms: Option<u64>,
    /// Dead-letter sender, built recursively with the same machinery.
    #[serde(default)]
    pub errors: Option<SenderConfig>,
}

/// Root configuration document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub connections: HashMap<String, ConnectionConfig>,
    #[serde(default)]
    pub offset_managers: HashMap<String, OffsetStoreConfig>,
    #[serde(default)]
    pub receivers: HashMap<String, ReceiverConfig>,
    #[serde(default)]
    pub senders: HashMap<String, SenderConfig>,
}

impl RelayConfig {
    /// Load from a file, with `RELAY_`-prefixed environment overrides
    /// (`RELAY_CONNECTIONS__ANALYTICS__BROKERS=...`).
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(config::Environment::with_prefix("RELAY").separator("__"))
            .build()
            .map_err(|e| MessagingError::Configuration(e.to_string()))?;
        settings
            .try_deserialize()
            .map_err(|e| MessagingError::Configuration(e.to_string()))
    }

    /// Parse an inline TOML document.
    pub fn from_toml(content: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(content, config::FileFormat::Toml))
            .build()
            .map_err(|e| MessagingError::Configuration(e.to_string()))?;
        settings
            .try_deserialize()
            .map_err(|e| MessagingError::Configuration(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [connections.analytics]
        type = "kafka"
        brokers = "kafka:9092"
        group = "relay-analytics"

        [connections.archive]
        type = "log"

        [offset_managers.primary]
        type = "postgres"
        url = "postgresql://relay@db/relay"

        [offset_managers.local]
        type = "memory"

        [receivers.content]
        type = "kafka"
        connection = "analytics"
        queue = "cdc.content"
        offset_manager = "primary"
        batch_size = -1
        receive_timeout_ms = 5000

        [receivers.content.errors]
        type = "kafka"
        connection = "analytics"
        queue = "cdc.content.errors"

        [senders.audit]
        type = "log"
        connection = "archive"
        queue = "audit"
    "#;

    #[test]
    fn test_sample_config_parses() {
        let config = RelayConfig::from_toml(SAMPLE).unwrap();

        assert!(matches!(
            config.connections.get("analytics"),
            Some(ConnectionConfig::Kafka { .. })
        ));
        assert!(matches!(
            config.offset_managers.get("local"),
            Some(OffsetStoreConfig::Memory)
        ));

        let receiver = config.receivers.get("content").unwrap();
        assert_eq!(receiver.broker, BrokerKind::Kafka);
        assert_eq!(receiver.connection, "analytics");
        assert_eq!(receiver.batch_size, Some(-1));
        assert_eq!(receiver.offset_manager.as_deref(), Some("primary"));

        let errors = receiver.errors.as_ref().unwrap();
        assert_eq!(errors.queue, "cdc.content.errors");

        assert_eq!(config.senders.get("audit").unwrap().broker, BrokerKind::Log);
    }

    #[test]
    fn test_unknown_broker_tag_fails_to_parse() {
        let err = RelayConfig::from_toml(
            r#"
            [connections.bad]
            type = "rabbitmq"
            brokers = "amqp://"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, MessagingError::Configuration(_)));
    }

    #[test]
    fn test_unknown_store_tag_fails_to_parse() {
        let err = RelayConfig::from_toml(
            r#"
            [offset_managers.bad]
            type = "zookeeper"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, MessagingError::Configuration(_)));
    }
}
