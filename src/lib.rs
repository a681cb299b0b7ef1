//! # Reliable message delivery with persisted offset state
//!
//! `message-relay` is the data-movement core of a change-data-capture
//! pipeline: it reads events from heterogeneous brokers behind one uniform
//! receiver/sender contract, tracks exactly how far each logical consumer
//! has progressed, and guarantees that progress survives process restarts
//! without silently losing or duplicating work.
//!
//! ## Problem
//!
//! Every broker hands you a different delivery model: Kafka has group
//! offsets, SQS has visibility timeouts, streams have entry ids, a local
//! log has positions. Without one contract on top:
//! - **Restarts lose or replay work**: each consumer reinvents resumption
//! - **Poison messages stall pipelines**: one bad record blocks a partition
//! - **Progress is unauditable**: nothing records what was actually applied
//!
//! ## Solution
//!
//! - One [`MessageReceiver`]/[`MessageSender`] contract over Kafka, SQS, a
//!   local append-only log store and Redis Streams
//! - Offset state persisted through an [`OffsetStateManager`] **only on
//!   ack**, so a crash between receive and ack causes redelivery, never
//!   loss (at-least-once)
//! - Monotonic persisted offsets: an update that would move a consumer
//!   backwards is rejected
//! - Dead-letter routing that treats an unprocessable message as completed:
//!   it is forwarded once to the error queue and the offset advances past it
//!
//! ## Usage
//!
//! ```rust,no_run
//! use message_relay::{
//!     build_receiver, MessageReceiver, MessagingEnvironment, ReceiverSettings, RelayConfig,
//! };
//!
//! # async fn example() -> message_relay::Result<()> {
//! let config = RelayConfig::from_file("relay.toml")?;
//! let env = MessagingEnvironment::from_config(&config)?;
//!
//! let settings = ReceiverSettings::from_config(&config.receivers["content"])?;
//! let mut receiver = build_receiver::<serde_json::Value>(&env, settings).await?;
//!
//! while let Some(message) = receiver.receive().await? {
//!     // process, then ack; the only point where offset state advances
//!     let id = message.id.clone();
//!     receiver.ack(&[id]).await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod brokers;
pub mod builder;
pub mod config;
pub mod connection;
pub mod env;
pub mod error;
pub mod manager;
pub mod message;
pub mod metrics;
pub mod offset;
pub mod receiver;
pub mod replication;
pub mod sender;
pub mod state;
pub mod states;
pub mod store;

pub use builder::{
    build_receiver, build_sender, BrokerReceiver, KafkaReceiverBuilder, KafkaSenderBuilder,
    LogReceiverBuilder, LogSenderBuilder, ReceiverSettings, SenderSettings, SqsReceiverBuilder,
    SqsSenderBuilder, StreamReceiverBuilder, StreamSenderBuilder,
};
pub use config::{ConnectionConfig, OffsetStoreConfig, ReceiverConfig, RelayConfig, SenderConfig};
pub use connection::{BrokerKind, ConnectionRegistry, MessageConnection};
pub use env::MessagingEnvironment;
pub use error::{MessagingError, Result};
pub use manager::{OffsetStateManager, StateManagerRegistry};
pub use message::{DeliveryMode, MessageId, MessageObject, Payload};
pub use metrics::RelayMetrics;
pub use offset::{Offset, QueueOffset, TransactionId};
pub use receiver::{
    DeadLetterRoute, MessageReceiver, DEFAULT_BATCH_SIZE, DEFAULT_RECEIVE_TIMEOUT,
};
pub use replication::{
    ApplyError, ChangeEvent, ChangeHandler, EntityReplicator, ReplicatorStatus,
};
pub use sender::{MessageSender, Partitioner};
pub use state::{Phase, ProcessorState};
pub use states::{
    ConsumerStatus, EntityReadState, EntityWriteState, OffsetState, ReceiverState,
    ReplicationStatus, StateRecord,
};
pub use store::{InMemoryOffsetStore, OffsetStore, PostgresOffsetStore, StoredState};
