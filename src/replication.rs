//! Caller-driven replication loop for one (domain, entity) pair.
//!
//! Ties a receiver, an offset state manager and a [`ChangeHandler`]
//! together: batch receive, apply, ack or dead-letter, with the
//! [`crate::states::EntityReadState`] bookkeeping persisted after every
//! batch. Receive failures back off exponentially; unrecoverable failures
//! park the entity in the error status until an operator resets it.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::error::{MessagingError, Result};
use crate::manager::OffsetStateManager;
use crate::message::{MessageObject, Payload};
use crate::metrics::RelayMetrics;
use crate::offset::TransactionId;
use crate::receiver::MessageReceiver;
use crate::states::{EntityReadState, StateRecord};

/// Threshold for consecutive receive errors before the replicator reports
/// unhealthy.
const UNHEALTHY_ERROR_THRESHOLD: u32 = 5;

/// Threshold for consecutive receive errors before a critical warning is
/// emitted.
const CRITICAL_ERROR_THRESHOLD: u32 = 10;

/// Outcome of applying one change event at the destination.
#[derive(Debug, Error)]
pub enum ApplyError {
    /// Destination temporarily unavailable: the event is not acked and will
    /// be redelivered.
    #[error("transient apply failure: {0}")]
    Transient(String),

    /// Bad data: the event is routed to the error queue and the read
    /// position advances past it.
    #[error("poison event: {0}")]
    Poison(String),
}

/// Payloads carrying a change-event position.
pub trait ChangeEvent {
    fn transaction_id(&self) -> TransactionId;

    /// Whether this event is an edit (counted separately).
    fn is_edit(&self) -> bool {
        false
    }
}

/// Destination-side apply logic.
#[async_trait]
pub trait ChangeHandler<V>: Send {
    async fn apply(&mut self, change: &MessageObject<V>) -> std::result::Result<(), ApplyError>;
}

/// Receive-error bookkeeping driving exponential backoff.
struct BackoffState {
    consecutive: u32,
    last_success: Instant,
}

impl BackoffState {
    fn new() -> Self {
        Self {
            consecutive: 0,
            last_success: Instant::now(),
        }
    }

    fn record_success(&mut self) {
        self.consecutive = 0;
        self.last_success = Instant::now();
    }

    fn record_error(&mut self) -> u32 {
        self.consecutive += 1;
        self.consecutive
    }

    fn time_since_success(&self) -> Duration {
        self.last_success.elapsed()
    }

    /// 1 s doubling per consecutive error, capped at 60 s.
    fn backoff(&self) -> Duration {
        const MAX_BACKOFF_SECS: u64 = 60;
        if self.consecutive == 0 {
            return Duration::from_secs(1);
        }
        let secs = 2u64
            .saturating_pow(self.consecutive.saturating_sub(1))
            .min(MAX_BACKOFF_SECS);
        Duration::from_secs(secs)
    }
}

/// Point-in-time health of a replicator.
#[derive(Debug, Clone)]
pub struct ReplicatorStatus {
    pub healthy: bool,
    pub consecutive_errors: u32,
    pub time_since_last_success: Duration,
    pub current_backoff: Duration,
}

/// Drives one entity's change stream into a destination.
pub struct EntityReplicator<R, H, V>
where
    R: MessageReceiver<V>,
    H: ChangeHandler<V>,
    V: Payload + ChangeEvent,
{
    receiver: R,
    handler: H,
    manager: Arc<OffsetStateManager>,
    state_name: String,
    batch_timeout: Duration,
    backoff: BackoffState,
    metrics: RelayMetrics,
    _marker: PhantomData<fn() -> V>,
}

impl<R, H, V> EntityReplicator<R, H, V>
where
    R: MessageReceiver<V>,
    H: ChangeHandler<V>,
    V: Payload + ChangeEvent,
{
    /// Register the entity state record (idempotent) and bind the loop.
    pub async fn bind(
        receiver: R,
        handler: H,
        manager: Arc<OffsetStateManager>,
        initial: EntityReadState,
    ) -> Result<Self> {
        let batch_timeout = receiver.receive_timeout();
        let state = manager.create(initial).await?;
        info!(
            entity = %state.name(),
            queue = %state.queue,
            status = ?state.status(),
            "entity replicator bound"
        );
        Ok(Self {
            receiver,
            handler,
            manager,
            state_name: state.name().to_string(),
            batch_timeout,
            backoff: BackoffState::new(),
            metrics: RelayMetrics::new(),
            _marker: PhantomData,
        })
    }

    pub fn state_name(&self) -> &str {
        &self.state_name
    }

    pub fn metrics(&self) -> &RelayMetrics {
        &self.metrics
    }

    async fn load_state(&self) -> Result<EntityReadState> {
        self.manager
            .get(&self.state_name)
            .await?
            .ok_or_else(|| {
                MessagingError::persistence(&self.state_name, "entity state record missing")
            })
    }

    /// Current persisted entity state.
    pub async fn state(&self) -> Result<EntityReadState> {
        self.load_state().await
    }

    /// Operator transition into the bulk catch-up phase.
    pub async fn begin_snapshot(&self) -> Result<()> {
        let mut state = self.load_state().await?;
        state.begin_snapshot()?;
        self.manager.update(&mut state).await
    }

    /// Operator transition into steady-state streaming.
    pub async fn activate(&self) -> Result<()> {
        let mut state = self.load_state().await?;
        state.activate()?;
        self.manager.update(&mut state).await
    }

    /// Operator reset out of the error status.
    pub async fn reset(&self) -> Result<()> {
        let mut state = self.load_state().await?;
        state.reset()?;
        self.manager.update(&mut state).await
    }

    /// Process one batch; returns the number of events completed (applied
    /// or dead-lettered).
    ///
    /// Does nothing unless the entity state allows processing. A transient
    /// apply failure stops the batch without acking the failed event and
    /// seeks the receiver back so it is redelivered; a poison event is
    /// dead-lettered and the read position advances past it.
    pub async fn run_once(&mut self) -> Result<usize> {
        let mut state = self.load_state().await?;
        if !state.can_process() {
            debug!(entity = %self.state_name, status = ?state.status(), "entity not processable");
            return Ok(0);
        }

        let batch = match self.receiver.next_batch(self.batch_timeout).await {
            Ok(batch) => {
                self.record_receive_success();
                batch
            }
            Err(e) => {
                self.record_receive_error();
                return Err(e);
            }
        };
        self.metrics
            .messages_received_total
            .inc_by(batch.len() as u64);

        let mut completed = 0;
        for message in batch {
            let tx = message.value.transaction_id();
            let edit = message.value.is_edit();
            match self.handler.apply(&message).await {
                Ok(()) => {
                    if edit {
                        state.record_edit(tx)?;
                    } else {
                        state.record_processed(tx)?;
                    }
                    let id = message.id.clone();
                    self.receiver.ack(&[id]).await?;
                    self.metrics.messages_acked_total.inc();
                    completed += 1;
                }
                Err(ApplyError::Transient(reason)) => {
                    warn!(
                        entity = %self.state_name,
                        id = %message.id,
                        reason = %reason,
                        "transient apply failure; event will be redelivered"
                    );
                    self.metrics.messages_failed_total.inc();
                    if let Some(offset) = message.offset.clone() {
                        self.receiver.seek(offset).await?;
                    }
                    break;
                }
                Err(ApplyError::Poison(reason)) => {
                    warn!(
                        entity = %self.state_name,
                        id = %message.id,
                        reason = %reason,
                        "poison event; routing to error queue"
                    );
                    state.record_error(tx)?;
                    self.receiver.dead_letter(message).await?;
                    self.metrics.messages_dead_lettered_total.inc();
                    completed += 1;
                }
            }
        }

        self.manager.update(&mut state).await?;
        Ok(completed)
    }

    /// Drive the loop until a non-transient error. Transient failures back
    /// off exponentially (1 s doubling to 60 s); unrecoverable ones park
    /// the entity in the error status and return.
    pub async fn run(&mut self) -> Result<()> {
        info!(entity = %self.state_name, "entity replicator started");
        loop {
            match self.run_once().await {
                Ok(_) => {}
                Err(e) if e.is_transient() => {
                    let consecutive = self.backoff.consecutive;
                    let backoff = self.backoff.backoff();
                    if consecutive >= CRITICAL_ERROR_THRESHOLD {
                        error!(
                            entity = %self.state_name,
                            consecutive_errors = consecutive,
                            backoff_secs = backoff.as_secs(),
                            "persistent receive failures; manual intervention may be required: {}",
                            e
                        );
                    } else if consecutive >= UNHEALTHY_ERROR_THRESHOLD {
                        warn!(
                            entity = %self.state_name,
                            consecutive_errors = consecutive,
                            backoff_secs = backoff.as_secs(),
                            "replicator unhealthy: {}",
                            e
                        );
                    } else {
                        warn!(
                            entity = %self.state_name,
                            consecutive_errors = consecutive,
                            backoff_secs = backoff.as_secs(),
                            "receive failed, retrying with backoff: {}",
                            e
                        );
                    }
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    error!(entity = %self.state_name, error = %e, "unrecoverable replication failure");
                    match self.load_state().await {
                        Ok(mut state) => {
                            state.fail(&e);
                            if let Err(update_err) = self.manager.update(&mut state).await {
                                warn!(
                                    entity = %self.state_name,
                                    error = %update_err,
                                    "failed to persist error status"
                                );
                            }
                        }
                        Err(load_err) => {
                            warn!(
                                entity = %self.state_name,
                                error = %load_err,
                                "failed to load state while recording error status"
                            );
                        }
                    }
                    return Err(e);
                }
            }
        }
    }

    pub fn healthy(&self) -> bool {
        let consecutive = self.backoff.consecutive;
        if consecutive >= UNHEALTHY_ERROR_THRESHOLD {
            return false;
        }
        if self.backoff.time_since_success() > Duration::from_secs(300) && consecutive > 0 {
            return false;
        }
        true
    }

    pub fn status(&self) -> ReplicatorStatus {
        ReplicatorStatus {
            healthy: self.healthy(),
            consecutive_errors: self.backoff.consecutive,
            time_since_last_success: self.backoff.time_since_success(),
            current_backoff: self.backoff.backoff(),
        }
    }

    fn record_receive_success(&mut self) {
        self.backoff.record_success();
        self.metrics.consecutive_errors.set(0);
        self.metrics.consumer_healthy.set(1);
        self.metrics.backoff_seconds.set(0);
    }

    fn record_receive_error(&mut self) {
        let consecutive = self.backoff.record_error();
        self.metrics.consecutive_errors.set(consecutive as i64);
        self.metrics
            .backoff_seconds
            .set(self.backoff.backoff().as_secs() as i64);
        self.metrics
            .consumer_healthy
            .set(if self.healthy() { 1 } else { 0 });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = BackoffState::new();
        assert_eq!(backoff.backoff(), Duration::from_secs(1));

        backoff.record_error();
        assert_eq!(backoff.backoff(), Duration::from_secs(1));
        backoff.record_error();
        assert_eq!(backoff.backoff(), Duration::from_secs(2));
        backoff.record_error();
        assert_eq!(backoff.backoff(), Duration::from_secs(4));

        for _ in 0..10 {
            backoff.record_error();
        }
        assert_eq!(backoff.backoff(), Duration::from_secs(60));

        backoff.record_success();
        assert_eq!(backoff.backoff(), Duration::from_secs(1));
        assert_eq!(backoff.consecutive, 0);
    }
}
