//! The process-wide messaging environment.
//!
//! Owns the connection and state-manager registries and is passed by
//! reference to the builders: explicit dependency injection, no ambient
//! global state. Created once per process, either from configuration or
//! programmatically.

use std::sync::Arc;

use crate::brokers::{KafkaConnection, LogConnection, SqsConnection, StreamConnection};
use crate::config::{ConnectionConfig, OffsetStoreConfig, RelayConfig};
use crate::connection::{ConnectionRegistry, MessageConnection};
use crate::error::Result;
use crate::manager::{OffsetStateManager, StateManagerRegistry};
use crate::store::{InMemoryOffsetStore, OffsetStore, PostgresOffsetStore};

pub struct MessagingEnvironment {
    connections: ConnectionRegistry,
    offset_managers: StateManagerRegistry,
}

impl MessagingEnvironment {
    pub fn new() -> Self {
        Self {
            connections: ConnectionRegistry::new(),
            offset_managers: StateManagerRegistry::new(),
        }
    }

    /// Materialize every configured connection and offset manager.
    ///
    /// Connections are registered unconnected; the builders connect them on
    /// first use. The Postgres store pool is lazy for the same reason, so
    /// this never touches the network.
    pub fn from_config(config: &RelayConfig) -> Result<Self> {
        let env = Self::new();

        for (name, connection) in &config.connections {
            let connection: Arc<dyn MessageConnection> = match connection {
                ConnectionConfig::Kafka { brokers, group } => {
                    Arc::new(KafkaConnection::new(name, brokers, group.clone()))
                }
                ConnectionConfig::Sqs {
                    region,
                    queue_url_prefix,
                } => Arc::new(SqsConnection::new(
                    name,
                    region.clone(),
                    queue_url_prefix.clone(),
                )),
                ConnectionConfig::Log { dir } => Arc::new(LogConnection::new(name, dir.clone())),
                ConnectionConfig::Stream { url } => Arc::new(StreamConnection::new(name, url)),
            };
            env.connections.register(connection);
        }

        for (name, store) in &config.offset_managers {
            let store: Arc<dyn OffsetStore> = match store {
                OffsetStoreConfig::Postgres { url } => {
                    Arc::new(PostgresOffsetStore::connect_lazy(url)?)
                }
                OffsetStoreConfig::Memory => Arc::new(InMemoryOffsetStore::new()),
            };
            env.offset_managers
                .register(Arc::new(OffsetStateManager::new(name, store)));
        }

        Ok(env)
    }

    pub fn connections(&self) -> &ConnectionRegistry {
        &self.connections
    }

    pub fn offset_managers(&self) -> &StateManagerRegistry {
        &self.offset_managers
    }

    /// Register a connection built outside configuration (embedded and test
    /// topologies).
    pub fn register_connection(&self, connection: Arc<dyn MessageConnection>) {
        self.connections.register(connection);
    }

    pub fn register_offset_manager(&self, manager: Arc<OffsetStateManager>) {
        self.offset_managers.register(manager);
    }
}

impl Default for MessagingEnvironment {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;
    use crate::connection::BrokerKind;

    #[test]
    fn test_environment_from_config() {
        let config = RelayConfig::from_toml(
            r#"
            [connections.archive]
            type = "log"

            [connections.analytics]
            type = "kafka"
            brokers = "kafka:9092"

            [offset_managers.local]
            type = "memory"
            "#,
        )
        .unwrap();

        let env = MessagingEnvironment::from_config(&config).unwrap();
        assert!(env.connections().get("archive", BrokerKind::Log).is_ok());
        assert!(env.connections().get("analytics", BrokerKind::Kafka).is_ok());
        assert!(env.offset_managers().get("local").is_ok());

        // registered but not yet connected
        let archive = env.connections().get("archive", BrokerKind::Log).unwrap();
        assert!(!archive.is_connected());
    }
}
