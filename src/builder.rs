//! Configuration-driven assembly of receivers and senders.
//!
//! Builders are pure wiring with no business logic: resolve settings,
//! validate the broker tag against the concrete builder, look up and connect
//! the named connection, attach the offset manager and the recursively-built
//! dead-letter sender, call `init()`, and hand back a ready object. Every
//! failure here is a configuration error raised before steady-state I/O
//! begins.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::brokers::{
    KafkaConnection, KafkaReceiver, KafkaSender, LogConnection, LogReceiver, LogSender,
    SqsConnection, SqsReceiver, SqsSender, StreamConnection, StreamReceiver, StreamSender,
};
use crate::config::{ReceiverConfig, SenderConfig};
use crate::connection::{BrokerKind, MessageConnection};
use crate::env::MessagingEnvironment;
use crate::error::{MessagingError, Result};
use crate::message::{MessageId, MessageObject, Payload};
use crate::offset::QueueOffset;
use crate::receiver::{
    DeadLetterRoute, MessageReceiver, ReceiverCore, DEFAULT_BATCH_SIZE, DEFAULT_RECEIVE_TIMEOUT,
};
use crate::sender::{MessageSender, Partitioner};

/// Resolved receiver settings with defaults applied.
#[derive(Clone, Debug)]
pub struct ReceiverSettings {
    pub broker: BrokerKind,
    pub connection: String,
    pub queue: String,
    pub group: Option<String>,
    pub offset_manager: Option<String>,
    pub batch_size: usize,
    pub receive_timeout: Duration,
    pub error_queue: Option<SenderSettings>,
}

impl ReceiverSettings {
    pub fn new(
        broker: BrokerKind,
        connection: impl Into<String>,
        queue: impl Into<String>,
    ) -> Self {
        Self {
            broker,
            connection: connection.into(),
            queue: queue.into(),
            group: None,
            offset_manager: None,
            batch_size: DEFAULT_BATCH_SIZE,
            receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
            error_queue: None,
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn with_offset_manager(mut self, name: impl Into<String>) -> Self {
        self.offset_manager = Some(name.into());
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    pub fn with_error_queue(mut self, error_queue: SenderSettings) -> Self {
        self.error_queue = Some(error_queue);
        self
    }

    /// Resolve a configuration block, applying defaults (`batch_size` 32,
    /// timeout 5 s; `-1` means default).
    pub fn from_config(config: &ReceiverConfig) -> Result<Self> {
        let batch_size = match config.batch_size {
            None | Some(-1) => DEFAULT_BATCH_SIZE,
            Some(n) if n > 0 => n as usize,
            Some(n) => {
                return Err(MessagingError::Configuration(format!(
                    "batch_size must be positive or -1, got {}",
                    n
                )))
            }
        };
        Ok(Self {
            broker: config.broker,
            connection: config.connection.clone(),
            queue: config.queue.clone(),
            group: config.group.clone(),
            offset_manager: config.offset_manager.clone(),
            batch_size,
            receive_timeout: config
                .receive_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_RECEIVE_TIMEOUT),
            error_queue: config.errors.as_ref().map(SenderSettings::from_config),
        })
    }
}

/// Resolved sender settings.
#[derive(Clone, Debug)]
pub struct SenderSettings {
    pub broker: BrokerKind,
    pub connection: String,
    pub queue: String,
}

impl SenderSettings {
    pub fn new(
        broker: BrokerKind,
        connection: impl Into<String>,
        queue: impl Into<String>,
    ) -> Self {
        Self {
            broker,
            connection: connection.into(),
            queue: queue.into(),
        }
    }

    pub fn from_config(config: &SenderConfig) -> Self {
        Self {
            broker: config.broker,
            connection: config.connection.clone(),
            queue: config.queue.clone(),
        }
    }
}

/// The declared broker tag must match the concrete builder; a mismatch is
/// a configuration mistake, caught before any I/O.
fn check_broker(found: BrokerKind, expected: BrokerKind) -> Result<()> {
    if found == expected {
        Ok(())
    } else {
        Err(MessagingError::Configuration(format!(
            "`{}` settings handed to the {} builder",
            found, expected
        )))
    }
}

/// Look up the named connection and connect it once if needed.
async fn resolve_connection(
    env: &MessagingEnvironment,
    name: &str,
    expected: BrokerKind,
) -> Result<Arc<dyn MessageConnection>> {
    let connection = env.connections().get(name, expected)?;
    if !connection.is_connected() {
        connection.connect().await?;
    }
    if !connection.is_connected() {
        return Err(MessagingError::Connection {
            name: name.to_string(),
            reason: "connect did not reach the ready state".to_string(),
        });
    }
    Ok(connection)
}

/// Assemble the shared receiver core: offset manager binding and the
/// recursively-built dead-letter sender.
async fn build_core<V: Payload>(
    env: &MessagingEnvironment,
    settings: &ReceiverSettings,
) -> Result<ReceiverCore<V>> {
    let mut core = ReceiverCore::new(
        settings.connection.clone(),
        settings.queue.clone(),
        settings.batch_size,
        settings.receive_timeout,
    );
    if let Some(manager_name) = &settings.offset_manager {
        let manager = env.offset_managers().get(manager_name)?;
        core.bind_offsets(
            manager,
            format!("{}.{}", settings.connection, settings.queue),
        );
    }
    if let Some(error_settings) = &settings.error_queue {
        let sender = build_sender::<V>(env, error_settings.clone()).await?;
        core.bind_dead_letter(DeadLetterRoute::new(sender));
        debug!(
            queue = %settings.queue,
            error_queue = %error_settings.queue,
            "dead-letter sender attached"
        );
    }
    Ok(core)
}

pub struct KafkaReceiverBuilder<'a> {
    env: &'a MessagingEnvironment,
}

impl<'a> KafkaReceiverBuilder<'a> {
    pub fn new(env: &'a MessagingEnvironment) -> Self {
        Self { env }
    }

    pub async fn build<V: Payload>(&self, settings: ReceiverSettings) -> Result<KafkaReceiver<V>> {
        check_broker(settings.broker, BrokerKind::Kafka)?;
        let connection =
            resolve_connection(self.env, &settings.connection, BrokerKind::Kafka).await?;
        let kafka = connection
            .as_any()
            .downcast_ref::<KafkaConnection>()
            .ok_or_else(|| {
                MessagingError::Configuration(format!(
                    "connection `{}` is not a kafka connection",
                    settings.connection
                ))
            })?;
        let consumer = kafka.create_consumer(settings.group.as_deref())?;
        let core = build_core(self.env, &settings).await?;
        let mut receiver = KafkaReceiver::new(core, consumer);
        receiver.init().await?;
        Ok(receiver)
    }
}

pub struct SqsReceiverBuilder<'a> {
    env: &'a MessagingEnvironment,
}

impl<'a> SqsReceiverBuilder<'a> {
    pub fn new(env: &'a MessagingEnvironment) -> Self {
        Self { env }
    }

    pub async fn build<V: Payload>(&self, settings: ReceiverSettings) -> Result<SqsReceiver<V>> {
        check_broker(settings.broker, BrokerKind::Sqs)?;
        if settings.offset_manager.is_some() {
            return Err(MessagingError::Configuration(format!(
                "sqs receivers track delivery broker-side; remove `offset_manager` from `{}`",
                settings.queue
            )));
        }
        let connection =
            resolve_connection(self.env, &settings.connection, BrokerKind::Sqs).await?;
        let sqs = connection
            .as_any()
            .downcast_ref::<SqsConnection>()
            .ok_or_else(|| {
                MessagingError::Configuration(format!(
                    "connection `{}` is not an sqs connection",
                    settings.connection
                ))
            })?;
        let client = sqs.client()?;
        let queue_url = sqs.queue_url(&settings.queue).await?;
        let core = build_core(self.env, &settings).await?;
        let mut receiver = SqsReceiver::new(core, client, queue_url);
        receiver.init().await?;
        Ok(receiver)
    }
}

pub struct LogReceiverBuilder<'a> {
    env: &'a MessagingEnvironment,
}

impl<'a> LogReceiverBuilder<'a> {
    pub fn new(env: &'a MessagingEnvironment) -> Self {
        Self { env }
    }

    pub async fn build<V: Payload>(&self, settings: ReceiverSettings) -> Result<LogReceiver<V>> {
        check_broker(settings.broker, BrokerKind::Log)?;
        let connection =
            resolve_connection(self.env, &settings.connection, BrokerKind::Log).await?;
        let log = connection
            .as_any()
            .downcast_ref::<LogConnection>()
            .ok_or_else(|| {
                MessagingError::Configuration(format!(
                    "connection `{}` is not a log connection",
                    settings.connection
                ))
            })?;
        let store = log.store()?;
        let core = build_core(self.env, &settings).await?;
        let mut receiver = LogReceiver::new(core, store);
        receiver.init().await?;
        Ok(receiver)
    }
}

pub struct StreamReceiverBuilder<'a> {
    env: &'a MessagingEnvironment,
}

impl<'a> StreamReceiverBuilder<'a> {
    pub fn new(env: &'a MessagingEnvironment) -> Self {
        Self { env }
    }

    pub async fn build<V: Payload>(&self, settings: ReceiverSettings) -> Result<StreamReceiver<V>> {
        check_broker(settings.broker, BrokerKind::Stream)?;
        let connection =
            resolve_connection(self.env, &settings.connection, BrokerKind::Stream).await?;
        let stream = connection
            .as_any()
            .downcast_ref::<StreamConnection>()
            .ok_or_else(|| {
                MessagingError::Configuration(format!(
                    "connection `{}` is not a stream connection",
                    settings.connection
                ))
            })?;
        let conn = stream.dedicated_connection().await?;
        let core = build_core(self.env, &settings).await?;
        let mut receiver = StreamReceiver::new(core, conn);
        receiver.init().await?;
        Ok(receiver)
    }
}

pub struct KafkaSenderBuilder<'a> {
    env: &'a MessagingEnvironment,
}

impl<'a> KafkaSenderBuilder<'a> {
    pub fn new(env: &'a MessagingEnvironment) -> Self {
        Self { env }
    }

    pub async fn build<V: Payload>(&self, settings: SenderSettings) -> Result<KafkaSender<V>> {
        self.build_inner(settings, None).await
    }

    /// Attach a shard-routing plugin, fixed for the sender's lifetime.
    pub async fn build_with_partitioner<V: Payload>(
        &self,
        settings: SenderSettings,
        partitioner: Partitioner<V>,
    ) -> Result<KafkaSender<V>> {
        self.build_inner(settings, Some(partitioner)).await
    }

    async fn build_inner<V: Payload>(
        &self,
        settings: SenderSettings,
        partitioner: Option<Partitioner<V>>,
    ) -> Result<KafkaSender<V>> {
        check_broker(settings.broker, BrokerKind::Kafka)?;
        let connection =
            resolve_connection(self.env, &settings.connection, BrokerKind::Kafka).await?;
        let kafka = connection
            .as_any()
            .downcast_ref::<KafkaConnection>()
            .ok_or_else(|| {
                MessagingError::Configuration(format!(
                    "connection `{}` is not a kafka connection",
                    settings.connection
                ))
            })?;
        let producer = kafka.producer()?;
        Ok(KafkaSender::new(settings.queue, producer, partitioner))
    }
}

pub struct SqsSenderBuilder<'a> {
    env: &'a MessagingEnvironment,
}

impl<'a> SqsSenderBuilder<'a> {
    pub fn new(env: &'a MessagingEnvironment) -> Self {
        Self { env }
    }

    pub async fn build<V: Payload>(&self, settings: SenderSettings) -> Result<SqsSender<V>> {
        check_broker(settings.broker, BrokerKind::Sqs)?;
        let connection =
            resolve_connection(self.env, &settings.connection, BrokerKind::Sqs).await?;
        let sqs = connection
            .as_any()
            .downcast_ref::<SqsConnection>()
            .ok_or_else(|| {
                MessagingError::Configuration(format!(
                    "connection `{}` is not an sqs connection",
                    settings.connection
                ))
            })?;
        let client = sqs.client()?;
        let queue_url = sqs.queue_url(&settings.queue).await?;
        Ok(SqsSender::new(settings.queue, client, queue_url))
    }
}

pub struct LogSenderBuilder<'a> {
    env: &'a MessagingEnvironment,
}

impl<'a> LogSenderBuilder<'a> {
    pub fn new(env: &'a MessagingEnvironment) -> Self {
        Self { env }
    }

    pub async fn build<V: Payload>(&self, settings: SenderSettings) -> Result<LogSender<V>> {
        check_broker(settings.broker, BrokerKind::Log)?;
        let connection =
            resolve_connection(self.env, &settings.connection, BrokerKind::Log).await?;
        let log = connection
            .as_any()
            .downcast_ref::<LogConnection>()
            .ok_or_else(|| {
                MessagingError::Configuration(format!(
                    "connection `{}` is not a log connection",
                    settings.connection
                ))
            })?;
        Ok(LogSender::new(settings.queue, log.store()?))
    }
}

pub struct StreamSenderBuilder<'a> {
    env: &'a MessagingEnvironment,
}

impl<'a> StreamSenderBuilder<'a> {
    pub fn new(env: &'a MessagingEnvironment) -> Self {
        Self { env }
    }

    pub async fn build<V: Payload>(&self, settings: SenderSettings) -> Result<StreamSender<V>> {
        check_broker(settings.broker, BrokerKind::Stream)?;
        let connection =
            resolve_connection(self.env, &settings.connection, BrokerKind::Stream).await?;
        let stream = connection
            .as_any()
            .downcast_ref::<StreamConnection>()
            .ok_or_else(|| {
                MessagingError::Configuration(format!(
                    "connection `{}` is not a stream connection",
                    settings.connection
                ))
            })?;
        let manager = stream.sender_connection().await?;
        Ok(StreamSender::new(settings.queue, manager))
    }
}

/// Tagged wrapper over the concrete receivers, so callers can hold any
/// backend behind one type.
pub enum BrokerReceiver<V: Payload> {
    Kafka(KafkaReceiver<V>),
    Sqs(SqsReceiver<V>),
    Log(LogReceiver<V>),
    Stream(StreamReceiver<V>),
}

impl<V: Payload> std::fmt::Debug for BrokerReceiver<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let variant = match self {
            BrokerReceiver::Kafka(_) => "Kafka",
            BrokerReceiver::Sqs(_) => "Sqs",
            BrokerReceiver::Log(_) => "Log",
            BrokerReceiver::Stream(_) => "Stream",
        };
        f.debug_tuple(&format!("BrokerReceiver::{variant}")).finish()
    }
}

macro_rules! delegate {
    ($self:ident, $receiver:ident => $body:expr) => {
        match $self {
            BrokerReceiver::Kafka($receiver) => $body,
            BrokerReceiver::Sqs($receiver) => $body,
            BrokerReceiver::Log($receiver) => $body,
            BrokerReceiver::Stream($receiver) => $body,
        }
    };
}

#[async_trait::async_trait]
impl<V: Payload> MessageReceiver<V> for BrokerReceiver<V> {
    async fn init(&mut self) -> Result<()> {
        delegate!(self, receiver => receiver.init().await)
    }

    async fn receive_within(&mut self, timeout: Duration) -> Result<Option<MessageObject<V>>> {
        delegate!(self, receiver => receiver.receive_within(timeout).await)
    }

    async fn next_batch(&mut self, timeout: Duration) -> Result<Vec<MessageObject<V>>> {
        delegate!(self, receiver => receiver.next_batch(timeout).await)
    }

    async fn ack(&mut self, ids: &[MessageId]) -> Result<()> {
        delegate!(self, receiver => receiver.ack(ids).await)
    }

    async fn dead_letter(&mut self, message: MessageObject<V>) -> Result<()> {
        delegate!(self, receiver => receiver.dead_letter(message).await)
    }

    fn current_offset(&self, scope: &str) -> Option<QueueOffset> {
        delegate!(self, receiver => receiver.current_offset(scope))
    }

    async fn seek(&mut self, offset: QueueOffset) -> Result<()> {
        delegate!(self, receiver => receiver.seek(offset).await)
    }

    fn receive_timeout(&self) -> Duration {
        delegate!(self, receiver => receiver.receive_timeout())
    }

    fn queue(&self) -> &str {
        delegate!(self, receiver => receiver.queue())
    }

    fn stateful(&self) -> bool {
        delegate!(self, receiver => receiver.stateful())
    }
}

/// Build any receiver from resolved settings, dispatching on the broker tag.
pub async fn build_receiver<V: Payload>(
    env: &MessagingEnvironment,
    settings: ReceiverSettings,
) -> Result<BrokerReceiver<V>> {
    match settings.broker {
        BrokerKind::Kafka => Ok(BrokerReceiver::Kafka(
            KafkaReceiverBuilder::new(env).build(settings).await?,
        )),
        BrokerKind::Sqs => Ok(BrokerReceiver::Sqs(
            SqsReceiverBuilder::new(env).build(settings).await?,
        )),
        BrokerKind::Log => Ok(BrokerReceiver::Log(
            LogReceiverBuilder::new(env).build(settings).await?,
        )),
        BrokerKind::Stream => Ok(BrokerReceiver::Stream(
            StreamReceiverBuilder::new(env).build(settings).await?,
        )),
    }
}

/// Build any sender from resolved settings, dispatching on the broker tag.
pub async fn build_sender<V: Payload>(
    env: &MessagingEnvironment,
    settings: SenderSettings,
) -> Result<Box<dyn MessageSender<V>>> {
    match settings.broker {
        BrokerKind::Kafka => Ok(Box::new(
            KafkaSenderBuilder::new(env).build(settings).await?,
        )),
        BrokerKind::Sqs => Ok(Box::new(SqsSenderBuilder::new(env).build(settings).await?)),
        BrokerKind::Log => Ok(Box::new(LogSenderBuilder::new(env).build(settings).await?)),
        BrokerKind::Stream => Ok(Box::new(
            StreamSenderBuilder::new(env).build(settings).await?,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;

    #[test]
    fn test_settings_apply_defaults() {
        let config = RelayConfig::from_toml(
            r#"
            [receivers.content]
            type = "log"
            connection = "archive"
            queue = "cdc.content"
            batch_size = -1
            "#,
        )
        .unwrap();

        let settings = ReceiverSettings::from_config(&config.receivers["content"]).unwrap();
        assert_eq!(settings.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(settings.receive_timeout, DEFAULT_RECEIVE_TIMEOUT);
        assert!(settings.error_queue.is_none());
    }

    #[test]
    fn test_settings_reject_bad_batch_size() {
        let config = RelayConfig::from_toml(
            r#"
            [receivers.content]
            type = "log"
            connection = "archive"
            queue = "cdc.content"
            batch_size = -7
            "#,
        )
        .unwrap();

        let err = ReceiverSettings::from_config(&config.receivers["content"]).unwrap_err();
        assert!(matches!(err, MessagingError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_builder_rejects_foreign_settings() {
        let env = MessagingEnvironment::new();
        let settings = ReceiverSettings::new(BrokerKind::Sqs, "intake", "jobs");
        let err = KafkaReceiverBuilder::new(&env)
            .build::<serde_json::Value>(settings)
            .await
            .unwrap_err();
        assert!(matches!(err, MessagingError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_build_fails_fast_on_connection_kind_mismatch() {
        // a kafka receiver pointed at a connection registered as `log`
        let config = RelayConfig::from_toml(
            r#"
            [connections.archive]
            type = "log"
            "#,
        )
        .unwrap();
        let env = MessagingEnvironment::from_config(&config).unwrap();

        let settings = ReceiverSettings::new(BrokerKind::Kafka, "archive", "cdc.content");
        let err = build_receiver::<serde_json::Value>(&env, settings)
            .await
            .unwrap_err();
        assert!(matches!(err, MessagingError::Configuration(_)));

        // the mismatch is caught in the registry, before any connect attempt
        let archive = env.connections().get("archive", BrokerKind::Log).unwrap();
        assert!(!archive.is_connected());
    }

    #[tokio::test]
    async fn test_sqs_receiver_rejects_offset_manager() {
        let env = MessagingEnvironment::new();
        let settings =
            ReceiverSettings::new(BrokerKind::Sqs, "intake", "jobs").with_offset_manager("primary");
        let err = SqsReceiverBuilder::new(&env)
            .build::<serde_json::Value>(settings)
            .await
            .unwrap_err();
        assert!(matches!(err, MessagingError::Configuration(_)));
    }
}
