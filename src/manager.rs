//! Durable CRUD over named consumer state records.
//!
//! One [`OffsetStateManager`] fronts one storage backend and serializes
//! updates per record name through compare-and-swap. On restart,
//! [`OffsetStateManager::get`] returns the last *acked* state, never the
//! last received one, which is what makes at-least-once delivery
//! crash-consistent.

use std::cmp::Ordering;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::error::{MessagingError, Result};
use crate::states::StateRecord;
use crate::store::OffsetStore;

pub struct OffsetStateManager {
    name: String,
    store: Arc<dyn OffsetStore>,
}

impl OffsetStateManager {
    pub fn new(name: impl Into<String>, store: Arc<dyn OffsetStore>) -> Self {
        Self {
            name: name.into(),
            store,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fetch an existing record; never creates one.
    ///
    /// A record that exists but cannot be decoded is reported as a
    /// persistence error: corruption is surfaced, not silently reset.
    pub async fn get<T: StateRecord>(&self, name: &str) -> Result<Option<T>> {
        let Some(stored) = self.store.load(T::kind(), name).await? else {
            return Ok(None);
        };
        let mut record: T = serde_json::from_value(stored.value).map_err(|e| {
            MessagingError::persistence(name, format!("corrupt state record: {}", e))
        })?;
        record.set_version(stored.version);
        Ok(Some(record))
    }

    /// Idempotent create-or-get.
    ///
    /// Persists `initial` at version 0 unless a record with the same name
    /// already exists, then returns whatever is stored. Two concurrent
    /// callers both observe the same resulting record.
    pub async fn create<T: StateRecord>(&self, initial: T) -> Result<T> {
        let mut initial = initial;
        initial.set_version(0);
        let name = initial.name().to_string();
        let value = serde_json::to_value(&initial)
            .map_err(|e| MessagingError::persistence(&name, e))?;

        let inserted = self.store.try_insert(T::kind(), &name, &value).await?;
        if inserted {
            debug!(manager = %self.name, kind = T::kind(), name = %name, "created state record");
        } else {
            debug!(manager = %self.name, kind = T::kind(), name = %name, "state record already exists");
        }

        self.get(&name).await?.ok_or_else(|| {
            MessagingError::persistence(&name, "state record vanished after create")
        })
    }

    /// Full-record overwrite through compare-and-swap.
    ///
    /// Rejects the update when the caller's revision is stale
    /// ([`MessagingError::StateConflict`]) or when the record's progress
    /// marker would move backwards relative to what is stored
    /// ([`MessagingError::OffsetRegression`]). On success the record's
    /// version is bumped in place.
    pub async fn update<T: StateRecord>(&self, state: &mut T) -> Result<()> {
        let name = state.name().to_string();
        let stored: T = self.get(&name).await?.ok_or_else(|| {
            MessagingError::persistence(&name, "state record does not exist; call create() first")
        })?;

        if state.version() != stored.version() {
            warn!(
                manager = %self.name,
                kind = T::kind(),
                name = %name,
                held = state.version(),
                stored = stored.version(),
                "state update lost against a concurrent writer"
            );
            return Err(MessagingError::StateConflict {
                kind: T::kind().to_string(),
                name,
            });
        }

        if state.progress_cmp(&stored)? == Ordering::Less {
            return Err(MessagingError::OffsetRegression {
                name,
                stored: stored.progress_label(),
                attempted: state.progress_label(),
            });
        }

        let current_version = stored.version();
        state.set_version(current_version + 1);
        state.touch();
        let value = serde_json::to_value(&*state)
            .map_err(|e| MessagingError::persistence(&name, e))?;

        let swapped = self
            .store
            .compare_and_swap(T::kind(), &name, current_version, &value)
            .await?;
        if !swapped {
            state.set_version(current_version);
            return Err(MessagingError::StateConflict {
                kind: T::kind().to_string(),
                name,
            });
        }

        debug!(
            manager = %self.name,
            kind = T::kind(),
            name = %name,
            progress = %state.progress_label(),
            "state record updated"
        );
        Ok(())
    }
}

/// Name-keyed registry of offset state managers, owned by the messaging
/// environment and shared across builders.
#[derive(Default)]
pub struct StateManagerRegistry {
    managers: DashMap<String, Arc<OffsetStateManager>>,
}

impl StateManagerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, manager: Arc<OffsetStateManager>) {
        self.managers.insert(manager.name().to_string(), manager);
    }

    pub fn get(&self, name: &str) -> Result<Arc<OffsetStateManager>> {
        self.managers.get(name).map(|m| m.clone()).ok_or_else(|| {
            MessagingError::Configuration(format!("offset manager `{}` is not registered", name))
        })
    }

    pub fn names(&self) -> Vec<String> {
        self.managers.iter().map(|e| e.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offset::QueueOffset;
    use crate::states::{ConsumerStatus, ReceiverState};
    use crate::store::InMemoryOffsetStore;

    fn manager() -> OffsetStateManager {
        OffsetStateManager::new("primary", Arc::new(InMemoryOffsetStore::new()))
    }

    fn log_offset(position: u64) -> QueueOffset {
        QueueOffset::Log {
            queue: "cdc.content".into(),
            position,
        }
    }

    #[tokio::test]
    async fn test_get_does_not_create() {
        let manager = manager();
        let missing: Option<ReceiverState> = manager.get("analytics.cdc.content").await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let manager = Arc::new(manager());

        let (a, b) = tokio::join!(
            manager.create(ReceiverState::new(
                "analytics.cdc.content",
                ConsumerStatus::Unknown
            )),
            manager.create(ReceiverState::new(
                "analytics.cdc.content",
                ConsumerStatus::Unknown
            )),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.version, b.version);
        assert_eq!(a.status, b.status);
        assert!(a.committed.is_none() && b.committed.is_none());
    }

    #[tokio::test]
    async fn test_update_persists_progress() {
        let manager = manager();
        let mut state = manager
            .create(ReceiverState::new("a.q", ConsumerStatus::Active))
            .await
            .unwrap();

        state.advance(log_offset(3)).unwrap();
        manager.update(&mut state).await.unwrap();
        assert_eq!(state.version, 1);

        let reloaded: ReceiverState = manager.get("a.q").await.unwrap().unwrap();
        assert_eq!(reloaded.committed, Some(log_offset(3)));
    }

    #[tokio::test]
    async fn test_update_rejects_regression() {
        let manager = manager();
        let mut state = manager
            .create(ReceiverState::new("a.q", ConsumerStatus::Active))
            .await
            .unwrap();
        state.advance(log_offset(9)).unwrap();
        manager.update(&mut state).await.unwrap();

        // craft a stale-progress record at the current version
        let mut rogue: ReceiverState = manager.get("a.q").await.unwrap().unwrap();
        rogue.committed = Some(log_offset(4));
        let err = manager.update(&mut rogue).await.unwrap_err();
        assert!(matches!(err, MessagingError::OffsetRegression { .. }));

        let reloaded: ReceiverState = manager.get("a.q").await.unwrap().unwrap();
        assert_eq!(reloaded.committed, Some(log_offset(9)));
    }

    #[tokio::test]
    async fn test_update_rejects_stale_version() {
        let manager = manager();
        let mut first = manager
            .create(ReceiverState::new("a.q", ConsumerStatus::Active))
            .await
            .unwrap();
        let mut second = first.clone();

        first.advance(log_offset(1)).unwrap();
        manager.update(&mut first).await.unwrap();

        second.advance(log_offset(2)).unwrap();
        let err = manager.update(&mut second).await.unwrap_err();
        assert!(matches!(err, MessagingError::StateConflict { .. }));
    }

    #[tokio::test]
    async fn test_corrupt_record_is_reported_not_reset() {
        let store = Arc::new(InMemoryOffsetStore::new());
        store
            .try_insert("receiver", "a.q", &serde_json::json!({"garbage": true}))
            .await
            .unwrap();

        let manager = OffsetStateManager::new("primary", store);
        let err = manager.get::<ReceiverState>("a.q").await.unwrap_err();
        assert!(matches!(err, MessagingError::StatePersistence { .. }));
    }

    #[test]
    fn test_registry_resolves_by_name() {
        let registry = StateManagerRegistry::new();
        registry.register(Arc::new(OffsetStateManager::new(
            "primary",
            Arc::new(InMemoryOffsetStore::new()),
        )));

        assert!(registry.get("primary").is_ok());
        assert!(matches!(
            registry.get("missing"),
            Err(MessagingError::Configuration(_))
        ));
    }
}
