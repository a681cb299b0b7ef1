//! Amazon SQS backend over `aws-sdk-sqs`.
//!
//! SQS tracks delivery natively: unacked messages reappear after the
//! visibility timeout, and `ack` deletes them. There is no orderable
//! offset, so these receivers are always stateless; the builder rejects an
//! offset-manager binding for them at build time.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_sqs::error::DisplayErrorContext;
use aws_sdk_sqs::types::MessageAttributeValue;
use aws_sdk_sqs::Client;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::connection::{BrokerKind, MessageConnection};
use crate::error::{MessagingError, Result};
use crate::message::{decode_payload, DeliveryMode, MessageId, MessageObject, Payload};
use crate::offset::QueueOffset;
use crate::receiver::{MessageReceiver, ReceiverCore};
use crate::sender::MessageSender;
use crate::state::{Phase, ProcessorState};

/// SQS long-poll ceiling.
const MAX_WAIT_SECONDS: u64 = 20;

/// SQS receive-batch ceiling.
const MAX_SQS_BATCH: usize = 10;

/// Connection handle for one SQS account/region.
pub struct SqsConnection {
    name: String,
    region: Option<String>,
    queue_url_prefix: Option<String>,
    client: Mutex<Option<Client>>,
    state: ProcessorState,
}

impl SqsConnection {
    pub fn new(
        name: impl Into<String>,
        region: Option<String>,
        queue_url_prefix: Option<String>,
    ) -> Self {
        Self {
            name: name.into(),
            region,
            queue_url_prefix,
            client: Mutex::new(None),
            state: ProcessorState::new(),
        }
    }

    pub(crate) fn client(&self) -> Result<Client> {
        self.client
            .lock()
            .clone()
            .ok_or_else(|| MessagingError::Connection {
                name: self.name.clone(),
                reason: "not connected".to_string(),
            })
    }

    /// Resolve a queue name to its URL, preferring the configured prefix
    /// over a `GetQueueUrl` round trip.
    pub(crate) async fn queue_url(&self, queue: &str) -> Result<String> {
        if let Some(prefix) = &self.queue_url_prefix {
            return Ok(format!("{}/{}", prefix.trim_end_matches('/'), queue));
        }
        let client = self.client()?;
        let out = client
            .get_queue_url()
            .queue_name(queue)
            .send()
            .await
            .map_err(|e| MessagingError::transport(queue, DisplayErrorContext(e)))?;
        out.queue_url()
            .map(str::to_string)
            .ok_or_else(|| MessagingError::transport(queue, "queue url not returned"))
    }
}

#[async_trait]
impl MessageConnection for SqsConnection {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> BrokerKind {
        BrokerKind::Sqs
    }

    fn processor_state(&self) -> &ProcessorState {
        &self.state
    }

    async fn connect(&self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &self.region {
            loader = loader.region(Region::new(region.clone()));
        }
        let config = loader.load().await;
        *self.client.lock() = Some(Client::new(&config));
        self.state.transition(Phase::Ready);
        info!(connection = %self.name, "sqs connection established");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        *self.client.lock() = None;
        self.state.transition(Phase::Closed);
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Receiver over one SQS queue.
pub struct SqsReceiver<V: Payload> {
    pub(crate) core: ReceiverCore<V>,
    client: Client,
    queue_url: String,
    /// Receipt handles for delivered-but-unacked messages.
    receipts: HashMap<MessageId, String>,
}

impl<V: Payload> std::fmt::Debug for SqsReceiver<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqsReceiver")
            .field("queue_url", &self.queue_url)
            .finish_non_exhaustive()
    }
}

impl<V: Payload> SqsReceiver<V> {
    pub(crate) fn new(core: ReceiverCore<V>, client: Client, queue_url: String) -> Self {
        Self {
            core,
            client,
            queue_url,
            receipts: HashMap::new(),
        }
    }

    async fn fetch(&mut self, timeout: Duration, max: usize) -> Result<Vec<MessageObject<V>>> {
        self.core.state.check(Phase::Ready)?;

        let out = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(max.min(MAX_SQS_BATCH) as i32)
            .wait_time_seconds(timeout.as_secs().min(MAX_WAIT_SECONDS) as i32)
            .message_attribute_names("All")
            .send()
            .await
            .map_err(|e| MessagingError::transport(&self.core.queue, DisplayErrorContext(e)))?;

        let mut messages = Vec::new();
        for m in out.messages() {
            let body = m.body().ok_or_else(|| {
                MessagingError::decode(&self.core.queue, "message has no body")
            })?;
            let value: V = decode_payload(&self.core.queue, body.as_bytes())?;

            let broker_id = MessageId::new(m.message_id().unwrap_or_default());
            let mut message =
                MessageObject::new(broker_id.clone(), self.core.queue.clone(), value);
            if let Some(attrs) = m.message_attributes() {
                message.key = attrs
                    .get("key")
                    .and_then(|a| a.string_value())
                    .map(str::to_string);
                message.correlation_id = attrs
                    .get("correlation_id")
                    .and_then(|a| a.string_value())
                    .map(str::to_string);
                // re-sent messages keep their primary-flow identity
                if let Some(origin) = attrs.get("origin_id").and_then(|a| a.string_value()) {
                    message.id = MessageId::new(origin);
                }
                message.mode = attrs
                    .get("mode")
                    .and_then(|a| a.string_value())
                    .and_then(DeliveryMode::parse)
                    .unwrap_or_default();
            }
            if let Some(receipt) = m.receipt_handle() {
                self.receipts.insert(message.id.clone(), receipt.to_string());
            }
            self.core.record_delivery(&message);
            messages.push(message);
        }
        Ok(messages)
    }
}

#[async_trait]
impl<V: Payload> MessageReceiver<V> for SqsReceiver<V> {
    async fn init(&mut self) -> Result<()> {
        self.core.state.check(Phase::Created)?;
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
        for id in ids {
            let Some(receipt) = self.receipts.remove(id) else {
                debug!(id = %id, queue = %self.core.queue, "ack for unknown message id ignored");
                continue;
            };
            self.client
                .delete_message()
                .queue_url(&self.queue_url)
                .receipt_handle(receipt)
                .send()
                .await
                .map_err(|e| {
                    MessagingError::transport(&self.core.queue, DisplayErrorContext(e))
                })?;
        }
        Ok(())
    }

    async fn dead_letter(&mut self, message: MessageObject<V>) -> Result<()> {
        let id = message.id.clone();
        self.core.route_dead_letter(message).await?;
        self.ack(&[id]).await
    }

    fn current_offset(&self, _scope: &str) -> Option<QueueOffset> {
        None
    }

    async fn seek(&mut self, _offset: QueueOffset) -> Result<()> {
        Err(MessagingError::Unsupported(
            "sqs receivers have no seekable position",
        ))
    }

    fn receive_timeout(&self) -> Duration {
        self.core.receive_timeout
    }

    fn queue(&self) -> &str {
        &self.core.queue
    }

    fn stateful(&self) -> bool {
        false
    }
}

/// Sender publishing to one SQS queue.
pub struct SqsSender<V: Payload> {
    queue: String,
    client: Client,
    queue_url: String,
    _marker: PhantomData<fn() -> V>,
}

impl<V: Payload> SqsSender<V> {
    pub(crate) fn new(queue: impl Into<String>, client: Client, queue_url: String) -> Self {
        Self {
            queue: queue.into(),
            client,
            queue_url,
            _marker: PhantomData,
        }
    }

    fn string_attribute(&self, value: &str) -> Result<MessageAttributeValue> {
        MessageAttributeValue::builder()
            .data_type("String")
            .string_value(value)
            .build()
            .map_err(|e| MessagingError::transport(&self.queue, e))
    }
}

#[async_trait]
impl<V: Payload> MessageSender<V> for SqsSender<V> {
    async fn send(&self, message: &MessageObject<V>) -> Result<()> {
        let body = serde_json::to_string(&message.value)
            .map_err(|e| MessagingError::decode(&self.queue, e))?;

        let mut request = self
            .client
            .send_message()
            .queue_url(&self.queue_url)
            .message_body(body);
        if let Some(key) = &message.key {
            request = request.message_attributes("key", self.string_attribute(key)?);
        }
        if let Some(correlation_id) = &message.correlation_id {
            request =
                request.message_attributes("correlation_id", self.string_attribute(correlation_id)?);
        }
        if message.mode != DeliveryMode::New {
            request = request
                .message_attributes("mode", self.string_attribute(message.mode.as_str())?)
                .message_attributes("origin_id", self.string_attribute(message.id.as_str())?);
        }

        request
            .send()
            .await
            .map_err(|e| MessagingError::transport(&self.queue, DisplayErrorContext(e)))?;

        debug!(queue = %self.queue, id = %message.id, "message sent");
        Ok(())
    }

    fn queue(&self) -> &str {
        &self.queue
    }
}
