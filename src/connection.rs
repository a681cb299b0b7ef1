//! Broker connection abstraction and the name-keyed connection registry.

use std::any::Any;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{MessagingError, Result};
use crate::state::{Phase, ProcessorState};

/// Broker technology tag, validated against configuration at build time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    Kafka,
    Sqs,
    Log,
    Stream,
}

impl fmt::Display for BrokerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            BrokerKind::Kafka => "kafka",
            BrokerKind::Sqs => "sqs",
            BrokerKind::Log => "log",
            BrokerKind::Stream => "stream",
        };
        f.write_str(label)
    }
}

impl FromStr for BrokerKind {
    type Err = MessagingError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "kafka" => Ok(BrokerKind::Kafka),
            "sqs" => Ok(BrokerKind::Sqs),
            "log" => Ok(BrokerKind::Log),
            "stream" => Ok(BrokerKind::Stream),
            other => Err(MessagingError::Configuration(format!(
                "unknown broker type `{}`",
                other
            ))),
        }
    }
}

/// A broker-specific transport handle with its own connection lifecycle.
///
/// Connections are supplied by configuration and shared through the
/// registry; receivers and senders borrow broker clients from them at build
/// time via [`MessageConnection::as_any`] downcasts in the concrete
/// builders.
#[async_trait]
pub trait MessageConnection: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn kind(&self) -> BrokerKind;

    fn processor_state(&self) -> &ProcessorState;

    fn is_connected(&self) -> bool {
        self.processor_state().phase() == Phase::Ready
    }

    /// Establish the underlying broker client. Idempotent when already
    /// connected.
    async fn connect(&self) -> Result<()>;

    /// Release the underlying broker client.
    async fn close(&self) -> Result<()>;

    /// Concrete-type access for the matching builder.
    fn as_any(&self) -> &dyn Any;
}

impl std::fmt::Debug for dyn MessageConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageConnection")
            .field("name", &self.name())
            .field("kind", &self.kind())
            .finish()
    }
}

/// Name-keyed registry of connections, owned by the messaging environment.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<String, Arc<dyn MessageConnection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, connection: Arc<dyn MessageConnection>) {
        self.connections
            .insert(connection.name().to_string(), connection);
    }

    /// Resolve a connection by name, validating its broker kind.
    ///
    /// A missing name or a kind mismatch is a configuration error: callers
    /// fail at build time, before any broker I/O.
    pub fn get(&self, name: &str, expected: BrokerKind) -> Result<Arc<dyn MessageConnection>> {
        let connection = self.connections.get(name).map(|c| c.clone()).ok_or_else(|| {
            MessagingError::Configuration(format!("connection `{}` is not registered", name))
        })?;
        if connection.kind() != expected {
            return Err(MessagingError::Configuration(format!(
                "connection `{}` is `{}`, expected `{}`",
                name,
                connection.kind(),
                expected
            )));
        }
        Ok(connection)
    }

    pub fn names(&self) -> Vec<String> {
        self.connections.iter().map(|e| e.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeConnection {
        name: String,
        kind: BrokerKind,
        state: ProcessorState,
    }

    #[async_trait]
    impl MessageConnection for FakeConnection {
        fn name(&self) -> &str {
            &self.name
        }

        fn kind(&self) -> BrokerKind {
            self.kind
        }

        fn processor_state(&self) -> &ProcessorState {
            &self.state
        }

        async fn connect(&self) -> Result<()> {
            self.state.transition(Phase::Ready);
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            self.state.transition(Phase::Closed);
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn test_registry_validates_kind() {
        let registry = ConnectionRegistry::new();
        registry.register(Arc::new(FakeConnection {
            name: "events".into(),
            kind: BrokerKind::Sqs,
            state: ProcessorState::new(),
        }));

        assert!(registry.get("events", BrokerKind::Sqs).is_ok());

        let err = registry.get("events", BrokerKind::Kafka).unwrap_err();
        assert!(matches!(err, MessagingError::Configuration(_)));
        assert!(err.to_string().contains("events"));

        assert!(matches!(
            registry.get("missing", BrokerKind::Kafka),
            Err(MessagingError::Configuration(_))
        ));
    }

    #[test]
    fn test_broker_kind_parse() {
        assert_eq!("kafka".parse::<BrokerKind>().unwrap(), BrokerKind::Kafka);
        assert!("rabbitmq".parse::<BrokerKind>().is_err());
    }
}
