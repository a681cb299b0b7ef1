//! Redis Streams backend.
//!
//! Receivers read with `XREAD BLOCK` from an explicit cursor (the last
//! persisted entry id), so resumption is driven entirely by the offset
//! record, with no consumer groups involved. Senders `XADD` with auto ids.

use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tracing::{debug, info};

use crate::connection::{BrokerKind, MessageConnection};
use crate::error::{MessagingError, Result};
use crate::message::{decode_payload, DeliveryMode, MessageId, MessageObject, Payload};
use crate::offset::{Offset, QueueOffset};
use crate::receiver::{MessageReceiver, ReceiverCore};
use crate::sender::MessageSender;
use crate::state::{Phase, ProcessorState};

/// Connection handle for one Redis instance.
pub struct StreamConnection {
    name: String,
    url: String,
    client: Mutex<Option<redis::Client>>,
    manager: tokio::sync::Mutex<Option<ConnectionManager>>,
    state: ProcessorState,
}

impl StreamConnection {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            client: Mutex::new(None),
            manager: tokio::sync::Mutex::new(None),
            state: ProcessorState::new(),
        }
    }

    /// Dedicated connection for a receiver; blocking reads must not share a
    /// connection with anything else.
    pub(crate) async fn dedicated_connection(&self) -> Result<MultiplexedConnection> {
        let client = self.client.lock().clone().ok_or_else(|| {
            MessagingError::Connection {
                name: self.name.clone(),
                reason: "not connected".to_string(),
            }
        })?;
        client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| MessagingError::Connection {
                name: self.name.clone(),
                reason: e.to_string(),
            })
    }

    /// Shared auto-reconnecting connection for senders.
    pub(crate) async fn sender_connection(&self) -> Result<ConnectionManager> {
        self.manager
            .lock()
            .await
            .clone()
            .ok_or_else(|| MessagingError::Connection {
                name: self.name.clone(),
                reason: "not connected".to_string(),
            })
    }
}

#[async_trait]
impl MessageConnection for StreamConnection {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> BrokerKind {
        BrokerKind::Stream
    }

    fn processor_state(&self) -> &ProcessorState {
        &self.state
    }

    async fn connect(&self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        let client = redis::Client::open(self.url.as_str()).map_err(|e| {
            MessagingError::Connection {
                name: self.name.clone(),
                reason: e.to_string(),
            }
        })?;
        let manager = ConnectionManager::new(client.clone()).await.map_err(|e| {
            MessagingError::Connection {
                name: self.name.clone(),
                reason: e.to_string(),
            }
        })?;
        *self.client.lock() = Some(client);
        *self.manager.lock().await = Some(manager);
        self.state.transition(Phase::Ready);
        info!(connection = %self.name, "stream connection established");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        *self.client.lock() = None;
        *self.manager.lock().await = None;
        self.state.transition(Phase::Closed);
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Receiver over one stream key.
pub struct StreamReceiver<V: Payload> {
    pub(crate) core: ReceiverCore<V>,
    conn: MultiplexedConnection,
    /// Last seen entry id; `XREAD` returns strictly newer entries.
    cursor: String,
}

impl<V: Payload> StreamReceiver<V> {
    pub(crate) fn new(core: ReceiverCore<V>, conn: MultiplexedConnection) -> Self {
        Self {
            core,
            conn,
            cursor: "0-0".to_string(),
        }
    }

    async fn fetch(&mut self, timeout: Duration, max: usize) -> Result<Vec<MessageObject<V>>> {
        self.core.state.check(Phase::Ready)?;

        let mut opts = StreamReadOptions::default().count(max);
        let block_ms = timeout.as_millis() as usize;
        if block_ms > 0 {
            opts = opts.block(block_ms);
        }

        let reply: Option<StreamReadReply> = self
            .conn
            .xread_options(&[self.core.queue.as_str()], &[self.cursor.as_str()], &opts)
            .await
            .map_err(|e| MessagingError::transport(&self.core.queue, e))?;

        let Some(reply) = reply else {
            return Ok(Vec::new());
        };

        let mut out = Vec::new();
        for key in reply.keys {
            for entry in key.ids {
                let (ms, seq) = entry
                    .id
                    .split_once('-')
                    .and_then(|(ms, seq)| Some((ms.parse().ok()?, seq.parse().ok()?)))
                    .ok_or_else(|| {
                        MessagingError::transport(
                            &self.core.queue,
                            format!("malformed stream entry id `{}`", entry.id),
                        )
                    })?;
                let payload: String = entry.get("payload").ok_or_else(|| {
                    MessagingError::transport(&self.core.queue, "stream entry missing payload")
                })?;
                let value: V = decode_payload(&self.core.queue, payload.as_bytes())?;

                let id = entry
                    .get::<String>("origin_id")
                    .map(MessageId::new)
                    .unwrap_or_else(|| {
                        MessageId::new(format!("{}@{}", self.core.queue, entry.id))
                    });
                let mut message = MessageObject::new(id, self.core.queue.clone(), value)
                    .with_offset(QueueOffset::Stream {
                        stream: self.core.queue.clone(),
                        ms,
                        seq,
                    });
                message.mode = entry
                    .get::<String>("mode")
                    .and_then(|m| DeliveryMode::parse(&m))
                    .unwrap_or_default();
                message.key = entry.get("key");
                message.correlation_id = entry.get("correlation_id");
                self.core.record_delivery(&message);
                self.cursor = entry.id.clone();
                out.push(message);
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl<V: Payload> MessageReceiver<V> for StreamReceiver<V> {
    async fn init(&mut self) -> Result<()> {
        self.core.state.check(Phase::Created)?;
        if let Some(QueueOffset::Stream { stream, ms, seq }) = self.core.init_offsets().await? {
            if stream == self.core.queue {
                self.cursor = format!("{}-{}", ms, seq);
            }
        }
        self.core.state.transition(Phase::Ready);
        Ok(())
    }

    async fn receive_within(&mut self, timeout: Duration) -> Result<Option<MessageObject<V>>> {
        let mut batch = self.fetch(timeout, 1).await?;
        Ok(batch.pop())
    }

    async fn next_batch(&mut self, timeout: Duration) -> Result<Vec<MessageObject<V>>> {
        let max = self.core.batch_size;
        self.fetch(timeout, max).await
    }

    async fn ack(&mut self, ids: &[MessageId]) -> Result<()> {
        self.core.state.check(Phase::Ready)?;
        let acked = self.core.take_acked(ids);
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
            QueueOffset::Stream { ref stream, ms, seq } if *stream == self.core.queue => {
                // XREAD returns entries strictly after the cursor, so park
                // it just before the requested entry
                self.cursor = if seq > 0 {
                    format!("{}-{}", ms, seq - 1)
                } else if ms > 0 {
                    format!("{}-{}", ms - 1, u64::MAX)
                } else {
                    "0-0".to_string()
                };
                Ok(())
            }
            other => Err(MessagingError::IncompatibleOffsets {
                left: other.as_string(),
                right: format!("stream:{}@{}", self.core.queue, self.cursor),
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

/// Sender appending to one stream key.
pub struct StreamSender<V: Payload> {
    queue: String,
    manager: ConnectionManager,
    _marker: PhantomData<fn() -> V>,
}

impl<V: Payload> StreamSender<V> {
    pub(crate) fn new(queue: impl Into<String>, manager: ConnectionManager) -> Self {
        Self {
            queue: queue.into(),
            manager,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<V: Payload> MessageSender<V> for StreamSender<V> {
    async fn send(&self, message: &MessageObject<V>) -> Result<()> {
        let payload = serde_json::to_string(&message.value)
            .map_err(|e| MessagingError::decode(&self.queue, e))?;

        let mut items: Vec<(&str, String)> = vec![("payload", payload)];
        if let Some(key) = &message.key {
            items.push(("key", key.clone()));
        }
        if let Some(correlation_id) = &message.correlation_id {
            items.push(("correlation_id", correlation_id.clone()));
        }
        if message.mode != DeliveryMode::New {
            items.push(("mode", message.mode.as_str().to_string()));
            items.push(("origin_id", message.id.to_string()));
        }

        let mut conn = self.manager.clone();
        let entry_id: String = conn
            .xadd(self.queue.as_str(), "*", &items)
            .await
            .map_err(|e| MessagingError::transport(&self.queue, e))?;

        debug!(queue = %self.queue, entry_id = %entry_id, "entry appended to stream");
        Ok(())
    }

    fn queue(&self) -> &str {
        &self.queue
    }
}
