//! Persisted consumer state records.
//!
//! One record exists per named consumer identity (`<connection>.<queue>` for
//! plain receivers, `<domain>.<entity>` for replication pairs). Records are
//! created once, mutated only through [`crate::manager::OffsetStateManager::update`],
//! and never deleted except by explicit administrative reset.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{MessagingError, Result};
use crate::offset::{Offset, QueueOffset, TransactionId};

/// A record the offset state manager can persist.
///
/// `progress_cmp` compares the record's progress marker against a stored
/// revision; the manager rejects any update that would order `Less` than
/// what is already persisted.
pub trait StateRecord: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Record family, part of the storage key.
    fn kind() -> &'static str;
    /// Consumer identity, unique within the kind.
    fn name(&self) -> &str;
    /// Optimistic-concurrency token owned by the state manager.
    fn version(&self) -> u64;
    fn set_version(&mut self, version: u64);
    /// Refresh the record's modification timestamp.
    fn touch(&mut self);
    /// Compare progress against a stored revision of the same record.
    fn progress_cmp(&self, stored: &Self) -> Result<Ordering>;
    /// Human-readable progress marker for diagnostics.
    fn progress_label(&self) -> String;
}

/// Lifecycle paired with the most recently committed offset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OffsetState<S, O> {
    pub name: String,
    pub status: S,
    /// Last durably acked position; `None` until the first ack.
    pub committed: Option<O>,
    /// Cause of the last fault, present only in an error status.
    pub last_error: Option<String>,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl<S, O: Offset> OffsetState<S, O> {
    pub fn new(name: impl Into<String>, status: S) -> Self {
        Self {
            name: name.into(),
            status,
            committed: None,
            last_error: None,
            version: 0,
            updated_at: Utc::now(),
        }
    }

    /// Move the committed position forward.
    ///
    /// A backward move is rejected with [`MessagingError::OffsetRegression`];
    /// re-acking the current position is a no-op.
    pub fn advance(&mut self, offset: O) -> Result<()> {
        if let Some(current) = &self.committed {
            if offset.try_compare(current)? == Ordering::Less {
                return Err(MessagingError::OffsetRegression {
                    name: self.name.clone(),
                    stored: current.as_string(),
                    attempted: offset.as_string(),
                });
            }
        }
        self.committed = Some(offset);
        Ok(())
    }

    fn committed_cmp(&self, stored: &Self) -> Result<Ordering> {
        match (&self.committed, &stored.committed) {
            (None, None) => Ok(Ordering::Equal),
            (Some(_), None) => Ok(Ordering::Greater),
            (None, Some(_)) => Ok(Ordering::Less),
            (Some(mine), Some(theirs)) => mine.try_compare(theirs),
        }
    }

    fn committed_label(&self) -> String {
        self.committed
            .as_ref()
            .map(|o| o.as_string())
            .unwrap_or_else(|| "-".to_string())
    }
}

/// Lifecycle of a plain (non-replication) receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsumerStatus {
    Unknown,
    Active,
    Error,
}

/// Offset record kept per receiver queue scope.
pub type ReceiverState = OffsetState<ConsumerStatus, QueueOffset>;

impl StateRecord for ReceiverState {
    fn kind() -> &'static str {
        "receiver"
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    fn progress_cmp(&self, stored: &Self) -> Result<Ordering> {
        self.committed_cmp(stored)
    }

    fn progress_label(&self) -> String {
        self.committed_label()
    }
}

/// Lifecycle of an entity replication pair.
///
/// `Snapshot` designates the one-time bulk catch-up phase, `Active` the
/// steady incremental stream. Only those two states allow processing;
/// `Error` is left only by an explicit operator reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicationStatus {
    Unknown,
    Snapshot,
    Active,
    Error,
}

impl ReplicationStatus {
    pub fn can_process(&self) -> bool {
        matches!(self, ReplicationStatus::Snapshot | ReplicationStatus::Active)
    }
}

/// Read-side progress of one (domain, entity) replication pair.
///
/// The committed offset of the embedded [`OffsetState`] is the last
/// transaction id successfully read (`processed_tx`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityReadState {
    pub offsets: OffsetState<ReplicationStatus, TransactionId>,
    pub domain: String,
    pub entity: String,
    /// Primary queue the entity's change events arrive on.
    pub queue: String,
    /// Error queue unprocessable events are routed to.
    pub error_queue: Option<String>,
    pub event_count: u64,
    pub event_error_count: u64,
    pub edits_event_count: u64,
}

impl EntityReadState {
    pub fn new(
        domain: impl Into<String>,
        entity: impl Into<String>,
        queue: impl Into<String>,
    ) -> Self {
        let domain = domain.into();
        let entity = entity.into();
        let name = format!("{}.{}", domain, entity);
        Self {
            offsets: OffsetState::new(name, ReplicationStatus::Unknown),
            domain,
            entity,
            queue: queue.into(),
            error_queue: None,
            event_count: 0,
            event_error_count: 0,
            edits_event_count: 0,
        }
    }

    pub fn with_error_queue(mut self, error_queue: impl Into<String>) -> Self {
        self.error_queue = Some(error_queue.into());
        self
    }

    pub fn status(&self) -> ReplicationStatus {
        self.offsets.status
    }

    /// True only while the state machine allows consumption.
    pub fn can_process(&self) -> bool {
        self.offsets.status.can_process()
    }

    /// Last transaction id successfully read.
    pub fn processed_tx(&self) -> Option<&TransactionId> {
        self.offsets.committed.as_ref()
    }

    /// Enter the bulk catch-up phase. Valid only from `Unknown`.
    pub fn begin_snapshot(&mut self) -> Result<()> {
        self.require_status(ReplicationStatus::Unknown)?;
        self.offsets.status = ReplicationStatus::Snapshot;
        Ok(())
    }

    /// Enter steady-state streaming. Valid from `Unknown` or `Snapshot`.
    pub fn activate(&mut self) -> Result<()> {
        match self.offsets.status {
            ReplicationStatus::Unknown | ReplicationStatus::Snapshot => {
                self.offsets.status = ReplicationStatus::Active;
                Ok(())
            }
            found => Err(MessagingError::InvalidState {
                expected: "unknown or snapshot".to_string(),
                found: format!("{:?}", found).to_lowercase(),
            }),
        }
    }

    /// Enter the error state, blocking consumption until an operator resets.
    pub fn fail(&mut self, cause: impl ToString) {
        self.offsets.status = ReplicationStatus::Error;
        self.offsets.last_error = Some(cause.to_string());
    }

    /// Operator reset out of the error state.
    pub fn reset(&mut self) -> Result<()> {
        self.require_status(ReplicationStatus::Error)?;
        self.offsets.status = ReplicationStatus::Unknown;
        self.offsets.last_error = None;
        Ok(())
    }

    /// Record a successfully read and applied change event.
    pub fn record_processed(&mut self, tx: TransactionId) -> Result<()> {
        self.check_processable()?;
        self.offsets.advance(tx)?;
        self.event_count += 1;
        Ok(())
    }

    /// Record a successfully applied edit event.
    pub fn record_edit(&mut self, tx: TransactionId) -> Result<()> {
        self.record_processed(tx)?;
        self.edits_event_count += 1;
        Ok(())
    }

    /// Record a non-recoverable event that was routed to the error queue.
    ///
    /// The read position still advances: dead-lettering is completion, so a
    /// single bad record cannot stall the pipeline.
    pub fn record_error(&mut self, tx: TransactionId) -> Result<()> {
        self.check_processable()?;
        self.offsets.advance(tx)?;
        self.event_count += 1;
        self.event_error_count += 1;
        Ok(())
    }

    fn check_processable(&self) -> Result<()> {
        if self.can_process() {
            Ok(())
        } else {
            Err(MessagingError::InvalidState {
                expected: "snapshot or active".to_string(),
                found: format!("{:?}", self.offsets.status).to_lowercase(),
            })
        }
    }

    fn require_status(&self, expected: ReplicationStatus) -> Result<()> {
        if self.offsets.status == expected {
            Ok(())
        } else {
            Err(MessagingError::InvalidState {
                expected: format!("{:?}", expected).to_lowercase(),
                found: format!("{:?}", self.offsets.status).to_lowercase(),
            })
        }
    }
}

impl StateRecord for EntityReadState {
    fn kind() -> &'static str {
        "entity-read"
    }

    fn name(&self) -> &str {
        &self.offsets.name
    }

    fn version(&self) -> u64 {
        self.offsets.version
    }

    fn set_version(&mut self, version: u64) {
        self.offsets.version = version;
    }

    fn touch(&mut self) {
        self.offsets.updated_at = Utc::now();
    }

    fn progress_cmp(&self, stored: &Self) -> Result<Ordering> {
        self.offsets.committed_cmp(&stored.offsets)
    }

    fn progress_label(&self) -> String {
        self.offsets.committed_label()
    }
}

/// Write-side progress of one (domain, entity) replication pair.
///
/// `committed_tx` is the last transaction durably applied at the
/// destination; it may lag `processed_tx`, and the gap between them is
/// exactly the window replayed on recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityWriteState {
    pub read: EntityReadState,
    pub committed_tx: Option<TransactionId>,
    /// Staging area for edits not yet committed at the destination.
    pub current_edits_path: Option<String>,
    pub edits_base_path: Option<String>,
    /// Set once every snapshot-phase event is both processed and committed.
    pub snapshot_committed: bool,
    pub committed_event_count: u64,
}

impl EntityWriteState {
    pub fn new(
        domain: impl Into<String>,
        entity: impl Into<String>,
        queue: impl Into<String>,
    ) -> Self {
        Self {
            read: EntityReadState::new(domain, entity, queue),
            committed_tx: None,
            current_edits_path: None,
            edits_base_path: None,
            snapshot_committed: false,
            committed_event_count: 0,
        }
    }

    pub fn with_edits_base_path(mut self, path: impl Into<String>) -> Self {
        self.edits_base_path = Some(path.into());
        self
    }

    /// Record a transaction durably committed at the destination.
    ///
    /// The commit position must be monotonic and never pass the read
    /// position (`committed_tx <= processed_tx` always holds).
    pub fn record_committed(&mut self, tx: TransactionId) -> Result<()> {
        let processed = self.read.processed_tx().ok_or_else(|| {
            MessagingError::CommitOverrun {
                name: self.read.name().to_string(),
                processed: "-".to_string(),
                attempted: tx.as_string(),
            }
        })?;
        if tx.try_compare(processed)? == Ordering::Greater {
            return Err(MessagingError::CommitOverrun {
                name: self.read.name().to_string(),
                processed: processed.as_string(),
                attempted: tx.as_string(),
            });
        }
        if let Some(current) = &self.committed_tx {
            if tx.try_compare(current)? == Ordering::Less {
                return Err(MessagingError::OffsetRegression {
                    name: self.read.name().to_string(),
                    stored: current.as_string(),
                    attempted: tx.as_string(),
                });
            }
        }
        self.committed_tx = Some(tx);
        self.committed_event_count += 1;
        Ok(())
    }

    /// Flip `snapshot_committed` once the snapshot phase has fully drained:
    /// in `Snapshot` status with the commit position caught up to the read
    /// position. Returns whether the flag is now set.
    pub fn try_mark_snapshot_committed(&mut self) -> Result<bool> {
        if self.snapshot_committed {
            return Ok(true);
        }
        if self.read.status() != ReplicationStatus::Snapshot {
            return Ok(false);
        }
        let caught_up = match (&self.committed_tx, self.read.processed_tx()) {
            (Some(committed), Some(processed)) => {
                committed.try_compare(processed)? == Ordering::Equal
            }
            _ => false,
        };
        if caught_up {
            self.snapshot_committed = true;
        }
        Ok(caught_up)
    }

    /// Leave the snapshot phase for steady-state streaming.
    ///
    /// Gated on `snapshot_committed`: every snapshot event must be both
    /// processed and committed first.
    pub fn complete_snapshot(&mut self) -> Result<()> {
        if self.read.status() != ReplicationStatus::Snapshot {
            return Err(MessagingError::InvalidState {
                expected: "snapshot".to_string(),
                found: format!("{:?}", self.read.status()).to_lowercase(),
            });
        }
        if !self.snapshot_committed {
            return Err(MessagingError::InvalidState {
                expected: "snapshot fully committed".to_string(),
                found: "uncommitted snapshot events".to_string(),
            });
        }
        self.read.activate()
    }
}

impl StateRecord for EntityWriteState {
    fn kind() -> &'static str {
        "entity-write"
    }

    fn name(&self) -> &str {
        self.read.name()
    }

    fn version(&self) -> u64 {
        self.read.version()
    }

    fn set_version(&mut self, version: u64) {
        self.read.set_version(version);
    }

    fn touch(&mut self) {
        self.read.touch();
    }

    fn progress_cmp(&self, stored: &Self) -> Result<Ordering> {
        self.read.progress_cmp(&stored.read)
    }

    fn progress_label(&self) -> String {
        self.read.progress_label()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(seq: u64) -> TransactionId {
        TransactionId::new("wal", seq)
    }

    #[test]
    fn test_can_process_gating() {
        let mut state = EntityReadState::new("content", "document", "cdc.content");
        assert_eq!(state.status(), ReplicationStatus::Unknown);
        assert!(!state.can_process());

        state.begin_snapshot().unwrap();
        assert!(state.can_process());

        state.activate().unwrap();
        assert!(state.can_process());

        state.fail("destination rejected batch");
        assert!(!state.can_process());
        assert!(state.record_processed(tx(1)).is_err());

        state.reset().unwrap();
        assert_eq!(state.status(), ReplicationStatus::Unknown);
        assert!(!state.can_process());
    }

    #[test]
    fn test_error_state_left_only_by_reset() {
        let mut state = EntityReadState::new("content", "document", "cdc.content");
        state.fail("boom");
        assert!(state.begin_snapshot().is_err());
        assert!(state.activate().is_err());
        state.reset().unwrap();
        assert!(state.begin_snapshot().is_ok());
    }

    #[test]
    fn test_processed_advances_and_counts() {
        let mut state = EntityReadState::new("content", "document", "cdc.content");
        state.activate().unwrap();

        state.record_processed(tx(1)).unwrap();
        state.record_edit(tx(2)).unwrap();
        state.record_error(tx(3)).unwrap();

        assert_eq!(state.processed_tx().unwrap().sequence, 3);
        assert_eq!(state.event_count, 3);
        assert_eq!(state.edits_event_count, 1);
        assert_eq!(state.event_error_count, 1);

        // dead-letter advanced the read position; going back is refused
        assert!(matches!(
            state.record_processed(tx(2)),
            Err(MessagingError::OffsetRegression { .. })
        ));
    }

    #[test]
    fn test_commit_never_passes_read_position() {
        let mut state = EntityWriteState::new("content", "document", "cdc.content");
        state.read.activate().unwrap();
        state.read.record_processed(tx(5)).unwrap();

        state.record_committed(tx(3)).unwrap();
        assert_eq!(state.committed_event_count, 1);

        assert!(matches!(
            state.record_committed(tx(9)),
            Err(MessagingError::CommitOverrun { .. })
        ));
        // commit is also monotonic
        assert!(matches!(
            state.record_committed(tx(2)),
            Err(MessagingError::OffsetRegression { .. })
        ));
    }

    #[test]
    fn test_snapshot_completion_gate() {
        let mut state = EntityWriteState::new("content", "document", "cdc.content");
        state.read.begin_snapshot().unwrap();
        state.read.record_processed(tx(1)).unwrap();
        state.read.record_processed(tx(2)).unwrap();

        // not caught up yet
        state.record_committed(tx(1)).unwrap();
        assert!(!state.try_mark_snapshot_committed().unwrap());
        assert!(state.complete_snapshot().is_err());

        state.record_committed(tx(2)).unwrap();
        assert!(state.try_mark_snapshot_committed().unwrap());
        state.complete_snapshot().unwrap();
        assert_eq!(state.read.status(), ReplicationStatus::Active);
    }

    #[test]
    fn test_receiver_state_progress_cmp() {
        let mut newer = ReceiverState::new("analytics.cdc.content", ConsumerStatus::Active);
        let stored = newer.clone();
        assert_eq!(
            newer.progress_cmp(&stored).unwrap(),
            std::cmp::Ordering::Equal
        );

        newer
            .advance(QueueOffset::Log {
                queue: "cdc.content".into(),
                position: 4,
            })
            .unwrap();
        assert_eq!(
            newer.progress_cmp(&stored).unwrap(),
            std::cmp::Ordering::Greater
        );
        assert_eq!(
            stored.progress_cmp(&newer).unwrap(),
            std::cmp::Ordering::Less
        );
    }
}
