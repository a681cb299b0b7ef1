//! Kafka backend over `rdkafka`.
//!
//! Receivers wrap a `StreamConsumer` with group auto-commit disabled: the
//! group offset is committed explicitly on `ack`, alongside the offset
//! record persisted through the state manager. Producers are created with
//! idempotence enabled so a bounded retry cannot duplicate messages.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{ClientConfig, Offset as KafkaOffset, TopicPartitionList};
use tracing::{debug, info};

use crate::connection::{BrokerKind, MessageConnection};
use crate::error::{MessagingError, Result};
use crate::message::{decode_payload, DeliveryMode, MessageId, MessageObject, Payload};
use crate::offset::{Offset, QueueOffset};
use crate::receiver::{MessageReceiver, ReceiverCore};
use crate::sender::{MessageSender, Partitioner};
use crate::state::{Phase, ProcessorState};

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection handle for one Kafka cluster.
pub struct KafkaConnection {
    name: String,
    brokers: String,
    group: Option<String>,
    producer: Mutex<Option<FutureProducer>>,
    state: ProcessorState,
}

impl KafkaConnection {
    pub fn new(name: impl Into<String>, brokers: impl Into<String>, group: Option<String>) -> Self {
        Self {
            name: name.into(),
            brokers: brokers.into(),
            group,
            producer: Mutex::new(None),
            state: ProcessorState::new(),
        }
    }

    /// Build a dedicated consumer; rdkafka consumers are owned by a single
    /// receiver, never shared.
    pub(crate) fn create_consumer(&self, group_override: Option<&str>) -> Result<StreamConsumer> {
        let group = group_override
            .map(str::to_string)
            .or_else(|| self.group.clone())
            .unwrap_or_else(|| format!("relay-{}", self.name));
        ClientConfig::new()
            .set("group.id", &group)
            .set("bootstrap.servers", &self.brokers)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("session.timeout.ms", "30000")
            .set("heartbeat.interval.ms", "3000")
            .set("max.poll.interval.ms", "300000")
            .set("enable.partition.eof", "false")
            .create()
            .map_err(|e| MessagingError::Connection {
                name: self.name.clone(),
                reason: e.to_string(),
            })
    }

    pub(crate) fn producer(&self) -> Result<FutureProducer> {
        self.producer
            .lock()
            .clone()
            .ok_or_else(|| MessagingError::Connection {
                name: self.name.clone(),
                reason: "not connected".to_string(),
            })
    }
}

#[async_trait]
impl MessageConnection for KafkaConnection {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> BrokerKind {
        BrokerKind::Kafka
    }

    fn processor_state(&self) -> &ProcessorState {
        &self.state
    }

    async fn connect(&self) -> Result<()> {
        let mut producer = self.producer.lock();
        if producer.is_none() {
            let created = ClientConfig::new()
                .set("bootstrap.servers", &self.brokers)
                .set("message.timeout.ms", "30000")
                .set("request.timeout.ms", "30000")
                .set("enable.idempotence", "true")
                .set("acks", "all")
                .set("max.in.flight.requests.per.connection", "5")
                .set("retries", "5")
                .set("compression.type", "lz4")
                .set("linger.ms", "10")
                .create::<FutureProducer>()
                .map_err(|e| MessagingError::Connection {
                    name: self.name.clone(),
                    reason: e.to_string(),
                })?;
            *producer = Some(created);
            info!(connection = %self.name, brokers = %self.brokers, "kafka connection established");
        }
        drop(producer);
        self.state.transition(Phase::Ready);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        *self.producer.lock() = None;
        self.state.transition(Phase::Closed);
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Receiver over one Kafka topic.
pub struct KafkaReceiver<V: Payload> {
    pub(crate) core: ReceiverCore<V>,
    consumer: StreamConsumer,
}

impl<V: Payload> std::fmt::Debug for KafkaReceiver<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaReceiver").finish_non_exhaustive()
    }
}

impl<V: Payload> KafkaReceiver<V> {
    pub(crate) fn new(core: ReceiverCore<V>, consumer: StreamConsumer) -> Self {
        Self { core, consumer }
    }

    fn wrap(core: &mut ReceiverCore<V>, msg: &BorrowedMessage<'_>) -> Result<MessageObject<V>> {
        let payload = msg
            .payload()
            .ok_or_else(|| MessagingError::decode(&core.queue, "message has no payload"))?;
        let value: V = decode_payload(&core.queue, payload)?;

        let mut correlation_id = None;
        let mut origin_id = None;
        let mut mode = DeliveryMode::New;
        if let Some(headers) = msg.headers() {
            for header in headers.iter() {
                let text = header.value.and_then(|v| std::str::from_utf8(v).ok());
                match header.key {
                    "correlation_id" => correlation_id = text.map(str::to_string),
                    "origin_id" => origin_id = text.map(str::to_string),
                    "delivery_mode" => {
                        if let Some(parsed) = text.and_then(DeliveryMode::parse) {
                            mode = parsed;
                        }
                    }
                    _ => {}
                }
            }
        }

        let topic = msg.topic().to_string();
        let partition = msg.partition();
        let position = msg.offset();
        let id = origin_id
            .map(MessageId::new)
            .unwrap_or_else(|| MessageId::new(format!("{}/{}@{}", topic, partition, position)));
        let mut message = MessageObject::new(id, core.queue.clone(), value).with_offset(
            QueueOffset::Partition {
                topic,
                partition,
                offset: position,
            },
        );
        message.mode = mode;
        message.correlation_id = correlation_id;
        message.key = msg
            .key()
            .and_then(|k| std::str::from_utf8(k).ok())
            .map(str::to_string);
        core.record_delivery(&message);
        Ok(message)
    }
}

#[async_trait]
impl<V: Payload> MessageReceiver<V> for KafkaReceiver<V> {
    async fn init(&mut self) -> Result<()> {
        self.core.state.check(Phase::Created)?;
        self.consumer
            .subscribe(&[self.core.queue.as_str()])
            .map_err(|e| MessagingError::transport(&self.core.queue, e))?;
        if let Some(resume) = self.core.init_offsets().await? {
            // the group commit governs the broker-side resume position; the
            // persisted record is the audit trail
            info!(
                queue = %self.core.queue,
                resume = %resume.as_string(),
                "kafka receiver resuming"
            );
        }
        self.core.state.transition(Phase::Ready);
        Ok(())
    }

    async fn receive_within(&mut self, timeout: Duration) -> Result<Option<MessageObject<V>>> {
        self.core.state.check(Phase::Ready)?;
        match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Err(_) => Ok(None),
            Ok(Err(e)) => Err(MessagingError::transport(&self.core.queue, e)),
            Ok(Ok(msg)) => Ok(Some(Self::wrap(&mut self.core, &msg)?)),
        }
    }

    async fn next_batch(&mut self, timeout: Duration) -> Result<Vec<MessageObject<V>>> {
        self.core.state.check(Phase::Ready)?;
        let deadline = std::time::Instant::now() + timeout;
        let mut out = Vec::new();
        while out.len() < self.core.batch_size {
            let Some(remaining) = deadline.checked_duration_since(std::time::Instant::now())
            else {
                break;
            };
            match tokio::time::timeout(remaining, self.consumer.recv()).await {
                Err(_) => break,
                Ok(Err(e)) => return Err(MessagingError::transport(&self.core.queue, e)),
                Ok(Ok(msg)) => out.push(Self::wrap(&mut self.core, &msg)?),
            }
        }
        Ok(out)
    }

    async fn ack(&mut self, ids: &[MessageId]) -> Result<()> {
        self.core.state.check(Phase::Ready)?;
        let acked = self.core.take_acked(ids);

        // Group commit goes first; if persisting the offset record fails
        // afterwards the error propagates so the caller knows durability
        // tracking may lag the broker-side ack.
        let mut high: HashMap<(String, i32), i64> = HashMap::new();
        for offset in &acked {
            if let QueueOffset::Partition {
                topic,
                partition,
                offset: position,
            } = offset
            {
                let entry = high.entry((topic.clone(), *partition)).or_insert(*position);
                if *position > *entry {
                    *entry = *position;
                }
            }
        }
        if !high.is_empty() {
            let mut tpl = TopicPartitionList::new();
            for ((topic, partition), position) in &high {
                tpl.add_partition_offset(topic, *partition, KafkaOffset::Offset(position + 1))
                    .map_err(|e| MessagingError::transport(&self.core.queue, e))?;
            }
            self.consumer
                .commit(&tpl, CommitMode::Async)
                .map_err(|e| MessagingError::transport(&self.core.queue, e))?;
        }

        self.core.persist_acked(&acked).await
    }

    async fn dead_letter(&mut self, message: MessageObject<V>) -> Result<()> {
        let id = message.id.clone();
        self.core.route_dead_letter(message).await?;
        self.ack(&[id]).await
    }

    fn current_offset(&self, scope: &str) -> Option<QueueOffset> {
        self.core.last_delivered(scope)
    }

    async fn seek(&mut self, offset: QueueOffset) -> Result<()> {
        match offset {
            QueueOffset::Partition {
                ref topic,
                partition,
                offset: position,
            } => self
                .consumer
                .seek(
                    topic,
                    partition,
                    KafkaOffset::Offset(position),
                    Duration::from_secs(5),
                )
                .map_err(|e| MessagingError::transport(&self.core.queue, e)),
            other => Err(MessagingError::IncompatibleOffsets {
                left: other.as_string(),
                right: format!("partition:{}/*", self.core.queue),
            }),
        }
    }

    fn receive_timeout(&self) -> Duration {
        self.core.receive_timeout
    }

    fn queue(&self) -> &str {
        &self.core.queue
    }

    fn stateful(&self) -> bool {
        self.core.stateful()
    }
}

/// Sender publishing to one Kafka topic.
pub struct KafkaSender<V: Payload> {
    queue: String,
    producer: FutureProducer,
    partitioner: Option<Partitioner<V>>,
}

impl<V: Payload> KafkaSender<V> {
    pub(crate) fn new(
        queue: impl Into<String>,
        producer: FutureProducer,
        partitioner: Option<Partitioner<V>>,
    ) -> Self {
        Self {
            queue: queue.into(),
            producer,
            partitioner,
        }
    }
}

#[async_trait]
impl<V: Payload> MessageSender<V> for KafkaSender<V> {
    async fn send(&self, message: &MessageObject<V>) -> Result<()> {
        let payload = message.encoded_payload()?;
        let key = message
            .key
            .clone()
            .unwrap_or_else(|| message.id.to_string());

        let mut record = FutureRecord::to(&self.queue).payload(&payload).key(&key);
        if let Some(partitioner) = &self.partitioner {
            if let Some(partition) = partitioner(message) {
                record = record.partition(partition);
            }
        }

        let origin_id = message.id.to_string();
        let mut headers = OwnedHeaders::new();
        if let Some(correlation_id) = &message.correlation_id {
            headers = headers.insert(Header {
                key: "correlation_id",
                value: Some(correlation_id.as_bytes()),
            });
        }
        if message.mode != DeliveryMode::New {
            // re-sent messages carry their primary-flow identity
            headers = headers.insert(Header {
                key: "delivery_mode",
                value: Some(message.mode.as_str().as_bytes()),
            });
            headers = headers.insert(Header {
                key: "origin_id",
                value: Some(origin_id.as_bytes()),
            });
        }
        record = record.headers(headers);

        self.producer
            .send(record, DELIVERY_TIMEOUT)
            .await
            .map(|_| ())
            .map_err(|(e, _)| MessagingError::transport(&self.queue, e))?;

        debug!(queue = %self.queue, id = %message.id, "message published");
        Ok(())
    }

    fn queue(&self) -> &str {
        &self.queue
    }
}
