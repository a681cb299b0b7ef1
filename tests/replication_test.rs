//! Replication-loop tests: entity state gating, apply outcomes, and
//! dead-letter bookkeeping over the log backend.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use message_relay::{
    build_receiver, build_sender, ApplyError, BrokerKind, BrokerReceiver, ChangeEvent,
    ChangeHandler, EntityReadState, MessageId, MessageObject, MessageReceiver, MessageSender,
    MessagingEnvironment, EntityReplicator, ReceiverSettings, RelayConfig, ReplicationStatus,
    SenderSettings, TransactionId,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Change {
    seq: u64,
    entity_id: String,
    op: String,
}

impl ChangeEvent for Change {
    fn transaction_id(&self) -> TransactionId {
        TransactionId::new("wal", self.seq)
    }

    fn is_edit(&self) -> bool {
        self.op == "update"
    }
}

fn change(seq: u64, op: &str) -> Change {
    Change {
        seq,
        entity_id: format!("doc-{}", seq),
        op: op.to_string(),
    }
}

struct ScriptedHandler {
    poison: HashSet<u64>,
    fail_once: HashSet<u64>,
    applied: Arc<Mutex<Vec<u64>>>,
}

impl ScriptedHandler {
    fn new() -> (Self, Arc<Mutex<Vec<u64>>>) {
        let applied = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                poison: HashSet::new(),
                fail_once: HashSet::new(),
                applied: applied.clone(),
            },
            applied,
        )
    }
}

#[async_trait]
impl ChangeHandler<Change> for ScriptedHandler {
    async fn apply(&mut self, message: &MessageObject<Change>) -> Result<(), ApplyError> {
        let seq = message.value.seq;
        if self.fail_once.remove(&seq) {
            return Err(ApplyError::Transient("destination unavailable".into()));
        }
        if self.poison.contains(&seq) {
            return Err(ApplyError::Poison("malformed change payload".into()));
        }
        self.applied.lock().push(seq);
        Ok(())
    }
}

fn test_env() -> MessagingEnvironment {
    let config = RelayConfig::from_toml(
        r#"
        [connections.local]
        type = "log"

        [offset_managers.state]
        type = "memory"
        "#,
    )
    .unwrap();
    MessagingEnvironment::from_config(&config).unwrap()
}

async fn change_sender(env: &MessagingEnvironment) -> Box<dyn MessageSender<Change>> {
    build_sender(env, SenderSettings::new(BrokerKind::Log, "local", "cdc.document"))
        .await
        .unwrap()
}

async fn send_changes(env: &MessagingEnvironment, changes: &[Change]) {
    let sender = change_sender(env).await;
    for c in changes {
        sender
            .send(&MessageObject::new(
                MessageId::new("outbound"),
                "cdc.document",
                c.clone(),
            ))
            .await
            .unwrap();
    }
}

async fn change_receiver(env: &MessagingEnvironment) -> BrokerReceiver<Change> {
    let settings = ReceiverSettings::new(BrokerKind::Log, "local", "cdc.document")
        .with_offset_manager("state")
        .with_receive_timeout(Duration::from_millis(200))
        .with_error_queue(SenderSettings::new(
            BrokerKind::Log,
            "local",
            "cdc.document.errors",
        ));
    build_receiver(env, settings).await.unwrap()
}

async fn bind_replicator(
    env: &MessagingEnvironment,
    handler: ScriptedHandler,
) -> EntityReplicator<BrokerReceiver<Change>, ScriptedHandler, Change> {
    let receiver = change_receiver(env).await;
    let manager = env.offset_managers().get("state").unwrap();
    let initial = EntityReadState::new("content", "document", "cdc.document")
        .with_error_queue("cdc.document.errors");
    EntityReplicator::bind(receiver, handler, manager, initial)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_unknown_entity_state_blocks_processing() {
    let env = test_env();
    send_changes(&env, &[change(1, "insert")]).await;

    let (handler, applied) = ScriptedHandler::new();
    let mut replicator = bind_replicator(&env, handler).await;

    assert_eq!(replicator.run_once().await.unwrap(), 0);
    assert!(applied.lock().is_empty());

    let state = replicator.state().await.unwrap();
    assert_eq!(state.status(), ReplicationStatus::Unknown);
    assert!(!state.can_process());
}

#[tokio::test]
async fn test_applies_changes_and_tracks_progress() {
    let env = test_env();
    send_changes(
        &env,
        &[change(1, "insert"), change(2, "update"), change(3, "insert")],
    )
    .await;

    let (handler, applied) = ScriptedHandler::new();
    let mut replicator = bind_replicator(&env, handler).await;
    replicator.activate().await.unwrap();

    assert_eq!(replicator.run_once().await.unwrap(), 3);
    assert_eq!(*applied.lock(), vec![1, 2, 3]);

    let state = replicator.state().await.unwrap();
    assert_eq!(state.status(), ReplicationStatus::Active);
    assert_eq!(state.event_count, 3);
    assert_eq!(state.edits_event_count, 1);
    assert_eq!(state.event_error_count, 0);
    assert_eq!(state.processed_tx().unwrap().sequence, 3);
}

#[tokio::test]
async fn test_poison_change_is_dead_lettered_and_completed() {
    let env = test_env();
    send_changes(
        &env,
        &[change(1, "insert"), change(2, "insert"), change(3, "insert")],
    )
    .await;

    let (mut handler, applied) = ScriptedHandler::new();
    handler.poison.insert(2);
    let mut replicator = bind_replicator(&env, handler).await;
    replicator.activate().await.unwrap();

    assert_eq!(replicator.run_once().await.unwrap(), 3);
    assert_eq!(*applied.lock(), vec![1, 3]);
    assert_eq!(replicator.metrics().messages_dead_lettered_total.get(), 1);

    // the read position advanced past the poison change
    let state = replicator.state().await.unwrap();
    assert_eq!(state.event_count, 3);
    assert_eq!(state.event_error_count, 1);
    assert_eq!(state.processed_tx().unwrap().sequence, 3);

    // forwarded exactly once to the error queue
    let mut errors = build_receiver::<Change>(
        &env,
        ReceiverSettings::new(BrokerKind::Log, "local", "cdc.document.errors")
            .with_receive_timeout(Duration::from_millis(200)),
    )
    .await
    .unwrap();
    let dead = errors.receive().await.unwrap().expect("dead-lettered change");
    assert_eq!(dead.value.seq, 2);
    assert!(errors
        .receive_within(Duration::from_millis(200))
        .await
        .unwrap()
        .is_none());

    // the poison change is never redelivered to the primary consumer
    assert_eq!(replicator.run_once().await.unwrap(), 0);
    assert_eq!(*applied.lock(), vec![1, 3]);
}

#[tokio::test]
async fn test_transient_failure_retries_without_losing_order() {
    let env = test_env();
    send_changes(
        &env,
        &[change(1, "insert"), change(2, "insert"), change(3, "insert")],
    )
    .await;

    let (mut handler, applied) = ScriptedHandler::new();
    handler.fail_once.insert(2);
    let mut replicator = bind_replicator(&env, handler).await;
    replicator.activate().await.unwrap();

    // first pass stops at the transient failure; nothing past it is applied
    assert_eq!(replicator.run_once().await.unwrap(), 1);
    assert_eq!(*applied.lock(), vec![1]);
    let state = replicator.state().await.unwrap();
    assert_eq!(state.processed_tx().unwrap().sequence, 1);

    // the failed change is redelivered and the stream completes in order
    assert_eq!(replicator.run_once().await.unwrap(), 2);
    assert_eq!(*applied.lock(), vec![1, 2, 3]);
    let state = replicator.state().await.unwrap();
    assert_eq!(state.event_count, 3);
    assert_eq!(state.event_error_count, 0);
    assert_eq!(state.processed_tx().unwrap().sequence, 3);
}

#[tokio::test]
async fn test_operator_reset_reopens_a_failed_entity() {
    let env = test_env();
    let (handler, _applied) = ScriptedHandler::new();
    let mut replicator = bind_replicator(&env, handler).await;
    replicator.activate().await.unwrap();

    // park the entity in the error status, as the run loop would on an
    // unrecoverable failure
    let manager = env.offset_managers().get("state").unwrap();
    let mut state: EntityReadState = manager
        .get(replicator.state_name())
        .await
        .unwrap()
        .unwrap();
    state.fail("destination schema mismatch");
    manager.update(&mut state).await.unwrap();

    assert_eq!(replicator.run_once().await.unwrap(), 0);

    replicator.reset().await.unwrap();
    replicator.activate().await.unwrap();
    let state = replicator.state().await.unwrap();
    assert!(state.can_process());
}
