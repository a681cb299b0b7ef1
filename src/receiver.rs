//! The uniform pull contract and the shared receiver plumbing.
//!
//! Every broker backend implements [`MessageReceiver`] on top of a
//! [`ReceiverCore`] that owns the common concerns: pending-delivery
//! bookkeeping, ack-driven offset persistence, and dead-letter routing.
//! Offset state advances only on `ack`, never on receive, so a crash
//! between the two causes redelivery, not loss.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::{MessagingError, Result};
use crate::manager::OffsetStateManager;
use crate::message::{MessageId, MessageObject, Payload};
use crate::offset::{Offset, QueueOffset};
use crate::sender::MessageSender;
use crate::state::ProcessorState;
use crate::states::{ConsumerStatus, ReceiverState};

/// Timeout applied by [`MessageReceiver::receive`] when the configuration
/// does not override it.
pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Batch ceiling applied when the configuration does not override it.
pub const DEFAULT_BATCH_SIZE: usize = 32;

/// The uniform pull contract.
///
/// Within one receiver bound to one queue/partition scope, messages arrive
/// in non-decreasing offset order and `ack` is expected in delivery order;
/// an ack that would move the persisted offset backwards is rejected, never
/// silently applied.
#[async_trait]
pub trait MessageReceiver<V: Payload>: Send {
    /// Bind and validate the connection, ensure the offset state record
    /// exists when stateful, and resume the read cursor from the last acked
    /// offset.
    async fn init(&mut self) -> Result<()>;

    /// One message, or `None` if nothing arrives before the timeout.
    async fn receive_within(&mut self, timeout: Duration) -> Result<Option<MessageObject<V>>>;

    /// [`MessageReceiver::receive_within`] with the configured default
    /// timeout.
    async fn receive(&mut self) -> Result<Option<MessageObject<V>>> {
        let timeout = self.receive_timeout();
        self.receive_within(timeout).await
    }

    /// Up to `batch_size` messages within the timeout; empty on timeout,
    /// never an unbounded wait.
    async fn next_batch(&mut self, timeout: Duration) -> Result<Vec<MessageObject<V>>>;

    /// Mark messages durably processed.
    ///
    /// This is the only point at which offset state is advanced and
    /// persisted. A persistence failure propagates: the broker-side ack (if
    /// any) may already have happened, but durability tracking is stale and
    /// the caller must know. Without a bound offset manager the persistence
    /// step is a no-op.
    async fn ack(&mut self, ids: &[MessageId]) -> Result<()>;

    /// Route a message that cannot be processed to the configured error
    /// queue, then ack it on the primary flow.
    ///
    /// Dead-lettering is completion: the offset advances past the message
    /// and it is never redelivered to the primary consumer.
    async fn dead_letter(&mut self, message: MessageObject<V>) -> Result<()>;

    /// Read cursor for the given queue/partition scope, for recovery and
    /// replay tooling.
    fn current_offset(&self, scope: &str) -> Option<QueueOffset>;

    /// Override the read cursor.
    async fn seek(&mut self, offset: QueueOffset) -> Result<()>;

    /// Default timeout used by [`MessageReceiver::receive`].
    fn receive_timeout(&self) -> Duration {
        DEFAULT_RECEIVE_TIMEOUT
    }

    /// Queue this receiver is bound to.
    fn queue(&self) -> &str;

    /// Whether acks persist offset state.
    fn stateful(&self) -> bool;
}

/// Dead-letter path attached to a receiver at build time.
pub struct DeadLetterRoute<V: Payload> {
    sender: Box<dyn MessageSender<V>>,
}

impl<V: Payload> DeadLetterRoute<V> {
    pub fn new(sender: Box<dyn MessageSender<V>>) -> Self {
        Self { sender }
    }

    pub fn error_queue(&self) -> &str {
        self.sender.queue()
    }

    /// Forward the re-wrapped original in a single bounded attempt.
    pub async fn route(&self, message: MessageObject<V>) -> Result<()> {
        let id = message.id.clone();
        let source = message.queue.clone();
        let error_queue = self.sender.queue().to_string();
        let dead = message.into_dead_letter(error_queue.clone());
        match self.sender.send(&dead).await {
            Ok(()) => {
                warn!(
                    id = %id,
                    queue = %source,
                    error_queue = %error_queue,
                    "message routed to error queue"
                );
                Ok(())
            }
            Err(e) => {
                warn!(
                    id = %id,
                    queue = %source,
                    error_queue = %error_queue,
                    error = %e,
                    "dead-letter send failed"
                );
                Err(e)
            }
        }
    }
}

struct OffsetBinding {
    manager: Arc<OffsetStateManager>,
    state_name: String,
}

impl OffsetBinding {
    /// Record name for a delivery scope. The primary queue scope keeps the
    /// configured name; extra scopes (e.g. additional partitions) get a
    /// suffixed record of their own.
    fn state_name_for(&self, queue: &str, scope: &str) -> String {
        if scope == queue {
            self.state_name.clone()
        } else {
            format!("{}#{}", self.state_name, scope)
        }
    }
}

/// Shared plumbing for all broker receivers.
pub(crate) struct ReceiverCore<V: Payload> {
    pub(crate) connection: String,
    pub(crate) queue: String,
    pub(crate) batch_size: usize,
    pub(crate) receive_timeout: Duration,
    pub(crate) state: ProcessorState,
    offsets: Option<OffsetBinding>,
    dead_letter: Option<DeadLetterRoute<V>>,
    /// Delivered but not yet acked, by message id.
    pending: HashMap<MessageId, QueueOffset>,
    /// Highest delivered offset per scope.
    last_delivered: HashMap<String, QueueOffset>,
}

impl<V: Payload> ReceiverCore<V> {
    pub(crate) fn new(
        connection: impl Into<String>,
        queue: impl Into<String>,
        batch_size: usize,
        receive_timeout: Duration,
    ) -> Self {
        Self {
            connection: connection.into(),
            queue: queue.into(),
            batch_size,
            receive_timeout,
            state: ProcessorState::new(),
            offsets: None,
            dead_letter: None,
            pending: HashMap::new(),
            last_delivered: HashMap::new(),
        }
    }

    pub(crate) fn bind_offsets(&mut self, manager: Arc<OffsetStateManager>, state_name: String) {
        self.offsets = Some(OffsetBinding {
            manager,
            state_name,
        });
    }

    pub(crate) fn bind_dead_letter(&mut self, route: DeadLetterRoute<V>) {
        self.dead_letter = Some(route);
    }

    pub(crate) fn stateful(&self) -> bool {
        self.offsets.is_some()
    }

    /// Ensure the offset state record exists and return the resume offset.
    ///
    /// A record stuck in the error status blocks initialization until an
    /// operator clears it.
    pub(crate) async fn init_offsets(&mut self) -> Result<Option<QueueOffset>> {
        let Some(binding) = &self.offsets else {
            return Ok(None);
        };
        let mut state = binding
            .manager
            .create(ReceiverState::new(
                &binding.state_name,
                ConsumerStatus::Unknown,
            ))
            .await?;
        match state.status {
            ConsumerStatus::Error => {
                return Err(MessagingError::InvalidState {
                    expected: "active".to_string(),
                    found: "error".to_string(),
                });
            }
            ConsumerStatus::Unknown => {
                state.status = ConsumerStatus::Active;
                binding.manager.update(&mut state).await?;
            }
            ConsumerStatus::Active => {}
        }
        info!(
            connection = %self.connection,
            queue = %self.queue,
            state = %binding.state_name,
            resume = ?state.committed.as_ref().map(|o| o.as_string()),
            "receiver offset state bound"
        );
        Ok(state.committed)
    }

    /// Track a delivery so a later ack can resolve its offset.
    pub(crate) fn record_delivery(&mut self, message: &MessageObject<V>) {
        if let Some(offset) = &message.offset {
            self.pending.insert(message.id.clone(), offset.clone());
            self.last_delivered
                .insert(offset.scope(), offset.clone());
        }
    }

    /// Resolve acked ids to their delivery offsets, dropping them from the
    /// pending set. Ids with no pending entry (already acked, or delivered
    /// before a restart) are skipped.
    pub(crate) fn take_acked(&mut self, ids: &[MessageId]) -> Vec<QueueOffset> {
        let mut acked = Vec::with_capacity(ids.len());
        for id in ids {
            match self.pending.remove(id) {
                Some(offset) => acked.push(offset),
                None => {
                    debug!(id = %id, queue = %self.queue, "ack for unknown message id ignored")
                }
            }
        }
        acked
    }

    /// Persist the highest acked offset per scope through the offset
    /// manager. A no-op for stateless receivers.
    pub(crate) async fn persist_acked(&mut self, acked: &[QueueOffset]) -> Result<()> {
        let Some(binding) = &self.offsets else {
            return Ok(());
        };
        if acked.is_empty() {
            return Ok(());
        }

        let mut per_scope: Vec<(String, QueueOffset)> = Vec::new();
        for offset in acked {
            let scope = offset.scope();
            match per_scope.iter_mut().find(|(s, _)| *s == scope) {
                Some((_, current)) => {
                    if offset.try_compare(current)? == Ordering::Greater {
                        *current = offset.clone();
                    }
                }
                None => per_scope.push((scope, offset.clone())),
            }
        }

        for (scope, offset) in per_scope {
            let state_name = binding.state_name_for(&self.queue, &scope);
            let mut state = match binding.manager.get::<ReceiverState>(&state_name).await? {
                Some(state) => state,
                None => {
                    binding
                        .manager
                        .create(ReceiverState::new(&state_name, ConsumerStatus::Active))
                        .await?
                }
            };
            state.advance(offset)?;
            binding.manager.update(&mut state).await?;
        }
        Ok(())
    }

    pub(crate) fn last_delivered(&self, scope: &str) -> Option<QueueOffset> {
        self.last_delivered.get(scope).cloned()
    }

    pub(crate) async fn route_dead_letter(&self, message: MessageObject<V>) -> Result<()> {
        match &self.dead_letter {
            Some(route) => route.route(message).await,
            None => Err(MessagingError::Configuration(format!(
                "no error queue configured for `{}`",
                self.queue
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryOffsetStore;
    use parking_lot::Mutex;

    fn log_offset(position: u64) -> QueueOffset {
        QueueOffset::Log {
            queue: "archive".into(),
            position,
        }
    }

    fn delivered(core: &mut ReceiverCore<u32>, position: u64) -> MessageId {
        let id = MessageId::new(format!("archive@{}", position));
        let message = MessageObject::new(id.clone(), "archive", position as u32)
            .with_offset(log_offset(position));
        core.record_delivery(&message);
        id
    }

    fn stateful_core() -> (ReceiverCore<u32>, Arc<OffsetStateManager>) {
        let manager = Arc::new(OffsetStateManager::new(
            "primary",
            Arc::new(InMemoryOffsetStore::new()),
        ));
        let mut core =
            ReceiverCore::new("local", "archive", DEFAULT_BATCH_SIZE, DEFAULT_RECEIVE_TIMEOUT);
        core.bind_offsets(manager.clone(), "local.archive".to_string());
        (core, manager)
    }

    #[tokio::test]
    async fn test_ack_persists_highest_offset() {
        let (mut core, manager) = stateful_core();
        core.init_offsets().await.unwrap();

        let a = delivered(&mut core, 0);
        let b = delivered(&mut core, 1);
        let acked = core.take_acked(&[a, b]);
        core.persist_acked(&acked).await.unwrap();

        let state: ReceiverState = manager.get("local.archive").await.unwrap().unwrap();
        assert_eq!(state.committed, Some(log_offset(1)));
    }

    #[tokio::test]
    async fn test_stateless_ack_is_noop() {
        let mut core: ReceiverCore<u32> =
            ReceiverCore::new("local", "archive", DEFAULT_BATCH_SIZE, DEFAULT_RECEIVE_TIMEOUT);
        let id = delivered(&mut core, 3);
        let acked = core.take_acked(&[id]);
        core.persist_acked(&acked).await.unwrap();
        assert!(!core.stateful());
    }

    #[tokio::test]
    async fn test_out_of_order_ack_is_rejected_not_regressed() {
        let (mut core, manager) = stateful_core();
        core.init_offsets().await.unwrap();

        let first = delivered(&mut core, 0);
        let second = delivered(&mut core, 1);

        let acked = core.take_acked(&[second]);
        core.persist_acked(&acked).await.unwrap();

        let acked = core.take_acked(&[first]);
        let err = core.persist_acked(&acked).await.unwrap_err();
        assert!(matches!(err, MessagingError::OffsetRegression { .. }));

        let state: ReceiverState = manager.get("local.archive").await.unwrap().unwrap();
        assert_eq!(state.committed, Some(log_offset(1)));
    }

    #[tokio::test]
    async fn test_init_refuses_error_state() {
        let (mut core, manager) = stateful_core();
        let mut state = manager
            .create(ReceiverState::new("local.archive", ConsumerStatus::Unknown))
            .await
            .unwrap();
        state.status = ConsumerStatus::Error;
        state.last_error = Some("poisoned".into());
        manager.update(&mut state).await.unwrap();

        let err = core.init_offsets().await.unwrap_err();
        assert!(matches!(err, MessagingError::InvalidState { .. }));
    }

    struct RecordingSender {
        queue: String,
        sent: Arc<Mutex<Vec<MessageObject<u32>>>>,
    }

    #[async_trait]
    impl MessageSender<u32> for RecordingSender {
        async fn send(&self, message: &MessageObject<u32>) -> Result<()> {
            self.sent.lock().push(message.clone());
            Ok(())
        }

        fn queue(&self) -> &str {
            &self.queue
        }
    }

    #[tokio::test]
    async fn test_dead_letter_route_rewraps_once() {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let sender = Box::new(RecordingSender {
            queue: "archive.errors".into(),
            sent: sent.clone(),
        });

        let route = DeadLetterRoute::new(sender as Box<dyn MessageSender<u32>>);
        let message = MessageObject::new(MessageId::new("archive@5"), "archive", 5u32)
            .with_offset(log_offset(5));
        route.route(message).await.unwrap();

        let sent = sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].id, MessageId::new("archive@5"));
        assert_eq!(sent[0].queue, "archive.errors");
        assert_eq!(sent[0].mode, crate::message::DeliveryMode::Error);
    }
}
