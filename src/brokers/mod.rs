//! Broker backends behind the uniform receiver/sender contract.
//!
//! One module per technology: Kafka (`rdkafka`), SQS (`aws-sdk-sqs`), the
//! local append-only log store, and Redis Streams. Each owns its wire
//! protocol; the shared semantics live in
//! [`crate::receiver::ReceiverCore`].

pub mod kafka;
pub mod log;
pub mod sqs;
pub mod stream;

pub use kafka::{KafkaConnection, KafkaReceiver, KafkaSender};
pub use log::{LogConnection, LogEntry, LogReceiver, LogSender, LogStore};
pub use sqs::{SqsConnection, SqsReceiver, SqsSender};
pub use stream::{StreamConnection, StreamReceiver, StreamSender};
