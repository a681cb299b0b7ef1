//! In-process offset store backed by a concurrent map.
//!
//! Used by tests and by local/log topologies that do not need the state to
//! survive the process. Per-name atomicity comes from the map's entry locks.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::{OffsetStore, StoredState};
use crate::error::Result;

#[derive(Default)]
pub struct InMemoryOffsetStore {
    records: DashMap<(String, String), StoredState>,
}

impl InMemoryOffsetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl OffsetStore for InMemoryOffsetStore {
    async fn load(&self, kind: &str, name: &str) -> Result<Option<StoredState>> {
        Ok(self
            .records
            .get(&(kind.to_string(), name.to_string()))
            .map(|r| r.clone()))
    }

    async fn try_insert(&self, kind: &str, name: &str, value: &serde_json::Value) -> Result<bool> {
        match self.records.entry((kind.to_string(), name.to_string())) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(StoredState {
                    version: 0,
                    value: value.clone(),
                });
                Ok(true)
            }
        }
    }

    async fn compare_and_swap(
        &self,
        kind: &str,
        name: &str,
        expected_version: u64,
        value: &serde_json::Value,
    ) -> Result<bool> {
        match self.records.entry((kind.to_string(), name.to_string())) {
            Entry::Occupied(mut slot) => {
                if slot.get().version != expected_version {
                    return Ok(false);
                }
                slot.insert(StoredState {
                    version: expected_version + 1,
                    value: value.clone(),
                });
                Ok(true)
            }
            Entry::Vacant(_) => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_try_insert_is_first_writer_wins() {
        let store = InMemoryOffsetStore::new();
        let first = serde_json::json!({"committed": null});
        let second = serde_json::json!({"committed": "log:q@3"});

        assert!(store.try_insert("receiver", "a.q", &first).await.unwrap());
        assert!(!store.try_insert("receiver", "a.q", &second).await.unwrap());

        let stored = store.load("receiver", "a.q").await.unwrap().unwrap();
        assert_eq!(stored.version, 0);
        assert_eq!(stored.value, first);
    }

    #[tokio::test]
    async fn test_compare_and_swap_enforces_version() {
        let store = InMemoryOffsetStore::new();
        let value = serde_json::json!({"n": 0});
        store.try_insert("receiver", "a.q", &value).await.unwrap();

        let next = serde_json::json!({"n": 1});
        assert!(store
            .compare_and_swap("receiver", "a.q", 0, &next)
            .await
            .unwrap());
        // stale version loses
        assert!(!store
            .compare_and_swap("receiver", "a.q", 0, &next)
            .await
            .unwrap());

        let stored = store.load("receiver", "a.q").await.unwrap().unwrap();
        assert_eq!(stored.version, 1);
    }

    #[tokio::test]
    async fn test_swap_on_missing_record_fails() {
        let store = InMemoryOffsetStore::new();
        let value = serde_json::json!({});
        assert!(!store
            .compare_and_swap("receiver", "ghost", 0, &value)
            .await
            .unwrap());
    }
}
