//! Local append-only log store backend.
//!
//! Queues are in-process vectors of entries, optionally journaled to a
//! newline-delimited JSON file per queue so contents survive a restart.
//! Offsets are plain positions into the log, which makes this backend fully
//! deterministic and backs the shared contract tests and local topologies.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::debug;

use crate::connection::{BrokerKind, MessageConnection};
use crate::error::{MessagingError, Result};
use crate::message::{DeliveryMode, MessageId, MessageObject, Payload};
use crate::offset::{Offset, QueueOffset};
use crate::receiver::{MessageReceiver, ReceiverCore};
use crate::sender::MessageSender;
use crate::state::{Phase, ProcessorState};

/// One stored message.
///
/// Re-sent messages (retries, dead letters) keep their original id and
/// delivery mode in the entry, so error-queue consumers see the identity
/// the message had on the primary flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub key: Option<String>,
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub mode: DeliveryMode,
    #[serde(default)]
    pub origin_id: Option<String>,
    pub payload: serde_json::Value,
}

struct QueueLog {
    entries: Mutex<Vec<LogEntry>>,
    journal: Option<Mutex<File>>,
    notify: Notify,
}

impl QueueLog {
    fn open(dir: Option<&Path>, queue: &str) -> Result<Self> {
        let io_err = |e: std::io::Error| MessagingError::transport(queue, e);
        let mut entries = Vec::new();
        let journal = match dir {
            Some(dir) => {
                let path = dir.join(format!("{}.log", queue));
                if path.exists() {
                    let file = File::open(&path).map_err(io_err)?;
                    for line in BufReader::new(file).lines() {
                        let line = line.map_err(io_err)?;
                        if line.trim().is_empty() {
                            continue;
                        }
                        let entry: LogEntry = serde_json::from_str(&line).map_err(|e| {
                            MessagingError::transport(
                                queue,
                                format!("corrupt journal line: {}", e),
                            )
                        })?;
                        entries.push(entry);
                    }
                    debug!(queue = %queue, replayed = entries.len(), "journal replayed");
                }
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .map_err(io_err)?;
                Some(Mutex::new(file))
            }
            None => None,
        };
        Ok(Self {
            entries: Mutex::new(entries),
            journal,
            notify: Notify::new(),
        })
    }

    fn append(&self, queue: &str, entry: LogEntry) -> Result<u64> {
        let mut entries = self.entries.lock();
        if let Some(journal) = &self.journal {
            let line = serde_json::to_string(&entry)
                .map_err(|e| MessagingError::transport(queue, e))?;
            let mut file = journal.lock();
            writeln!(file, "{}", line).map_err(|e| MessagingError::transport(queue, e))?;
            file.flush().map_err(|e| MessagingError::transport(queue, e))?;
        }
        entries.push(entry);
        let position = (entries.len() - 1) as u64;
        drop(entries);
        self.notify.notify_waiters();
        Ok(position)
    }

    fn read_from(&self, from: u64, max: usize) -> Vec<(u64, LogEntry)> {
        let entries = self.entries.lock();
        entries
            .iter()
            .enumerate()
            .skip(from as usize)
            .take(max)
            .map(|(position, entry)| (position as u64, entry.clone()))
            .collect()
    }

    fn len(&self) -> u64 {
        self.entries.lock().len() as u64
    }
}

/// In-process append-only queue store, optionally journaled to disk.
pub struct LogStore {
    dir: Option<PathBuf>,
    queues: DashMap<String, Arc<QueueLog>>,
}

impl LogStore {
    /// Queues live only as long as the process.
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            queues: DashMap::new(),
        }
    }

    /// Journal every queue to `<dir>/<queue>.log`, replaying existing
    /// journals lazily when a queue is first touched.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| {
            MessagingError::Configuration(format!(
                "cannot create log dir `{}`: {}",
                dir.display(),
                e
            ))
        })?;
        Ok(Self {
            dir: Some(dir),
            queues: DashMap::new(),
        })
    }

    fn queue(&self, name: &str) -> Result<Arc<QueueLog>> {
        if let Some(queue) = self.queues.get(name) {
            return Ok(queue.clone());
        }
        let opened = Arc::new(QueueLog::open(self.dir.as_deref(), name)?);
        Ok(self.queues.entry(name.to_string()).or_insert(opened).clone())
    }

    pub fn append(&self, queue: &str, entry: LogEntry) -> Result<u64> {
        self.queue(queue)?.append(queue, entry)
    }

    pub fn read_from(&self, queue: &str, from: u64, max: usize) -> Result<Vec<(u64, LogEntry)>> {
        Ok(self.queue(queue)?.read_from(from, max))
    }

    pub fn len(&self, queue: &str) -> Result<u64> {
        Ok(self.queue(queue)?.len())
    }

    async fn wait_for_append(&self, queue: &str, wait: Duration) -> Result<()> {
        let queue = self.queue(queue)?;
        let _ = tokio::time::timeout(wait, queue.notify.notified()).await;
        Ok(())
    }
}

/// Connection handle owning one [`LogStore`].
pub struct LogConnection {
    name: String,
    dir: Option<PathBuf>,
    store: Mutex<Option<Arc<LogStore>>>,
    state: ProcessorState,
}

impl LogConnection {
    pub fn new(name: impl Into<String>, dir: Option<PathBuf>) -> Self {
        Self {
            name: name.into(),
            dir,
            store: Mutex::new(None),
            state: ProcessorState::new(),
        }
    }

    pub(crate) fn store(&self) -> Result<Arc<LogStore>> {
        self.store.lock().clone().ok_or_else(|| MessagingError::Connection {
            name: self.name.clone(),
            reason: "not connected".to_string(),
        })
    }
}

#[async_trait]
impl MessageConnection for LogConnection {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> BrokerKind {
        BrokerKind::Log
    }

    fn processor_state(&self) -> &ProcessorState {
        &self.state
    }

    async fn connect(&self) -> Result<()> {
        let mut store = self.store.lock();
        if store.is_none() {
            let opened = match &self.dir {
                Some(dir) => LogStore::open(dir.clone())?,
                None => LogStore::in_memory(),
            };
            *store = Some(Arc::new(opened));
        }
        drop(store);
        self.state.transition(Phase::Ready);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        *self.store.lock() = None;
        self.state.transition(Phase::Closed);
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Receiver over one log-store queue.
pub struct LogReceiver<V: Payload> {
    pub(crate) core: ReceiverCore<V>,
    store: Arc<LogStore>,
    next_position: u64,
}

impl<V: Payload> LogReceiver<V> {
    pub(crate) fn new(core: ReceiverCore<V>, store: Arc<LogStore>) -> Self {
        Self {
            core,
            store,
            next_position: 0,
        }
    }

    async fn fetch(&mut self, timeout: Duration, max: usize) -> Result<Vec<MessageObject<V>>> {
        self.core.state.check(Phase::Ready)?;
        let deadline = Instant::now() + timeout;
        loop {
            let entries = self
                .store
                .read_from(&self.core.queue, self.next_position, max)?;
            if !entries.is_empty() {
                let mut out = Vec::with_capacity(entries.len());
                for (position, entry) in entries {
                    let value: V = serde_json::from_value(entry.payload)
                        .map_err(|e| MessagingError::decode(&self.core.queue, e))?;
                    let id = entry
                        .origin_id
                        .map(MessageId::new)
                        .unwrap_or_else(|| {
                            MessageId::new(format!("{}@{}", self.core.queue, position))
                        });
                    let mut message = MessageObject::new(id, self.core.queue.clone(), value)
                        .with_offset(QueueOffset::Log {
                            queue: self.core.queue.clone(),
                            position,
                        });
                    message.mode = entry.mode;
                    message.key = entry.key;
                    message.correlation_id = entry.correlation_id;
                    self.core.record_delivery(&message);
                    self.next_position = position + 1;
                    out.push(message);
                }
                return Ok(out);
            }

            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return Ok(Vec::new());
            };
            if remaining.is_zero() {
                return Ok(Vec::new());
            }
            let wait = remaining.min(Duration::from_millis(50));
            self.store.wait_for_append(&self.core.queue, wait).await?;
        }
    }
}

#[async_trait]
impl<V: Payload> MessageReceiver<V> for LogReceiver<V> {
    async fn init(&mut self) -> Result<()> {
        self.core.state.check(Phase::Created)?;
        if let Some(QueueOffset::Log { queue, position }) = self.core.init_offsets().await? {
            if queue == self.core.queue {
                self.next_position = position + 1;
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
            QueueOffset::Log { ref queue, position } if *queue == self.core.queue => {
                self.next_position = position;
                Ok(())
            }
            other => Err(MessagingError::IncompatibleOffsets {
                left: other.as_string(),
                right: QueueOffset::Log {
                    queue: self.core.queue.clone(),
                    position: self.next_position,
                }
                .as_string(),
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

/// Sender appending to one log-store queue.
pub struct LogSender<V: Payload> {
    queue: String,
    store: Arc<LogStore>,
    _marker: PhantomData<fn() -> V>,
}

impl<V: Payload> LogSender<V> {
    pub(crate) fn new(queue: impl Into<String>, store: Arc<LogStore>) -> Self {
        Self {
            queue: queue.into(),
            store,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<V: Payload> MessageSender<V> for LogSender<V> {
    async fn send(&self, message: &MessageObject<V>) -> Result<()> {
        let payload = serde_json::to_value(&message.value)
            .map_err(|e| MessagingError::decode(&self.queue, e))?;
        let entry = LogEntry {
            key: message.key.clone(),
            correlation_id: message.correlation_id.clone(),
            mode: message.mode,
            origin_id: (message.mode != DeliveryMode::New).then(|| message.id.to_string()),
            payload,
        };
        let position = self.store.append(&self.queue, entry)?;
        debug!(queue = %self.queue, position, "message appended");
        Ok(())
    }

    fn queue(&self) -> &str {
        &self.queue
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(n: u64) -> LogEntry {
        LogEntry {
            key: Some(format!("k-{}", n)),
            correlation_id: None,
            mode: DeliveryMode::New,
            origin_id: None,
            payload: serde_json::json!({ "n": n }),
        }
    }

    #[test]
    fn test_append_returns_positions_in_order() {
        let store = LogStore::in_memory();
        assert_eq!(store.append("archive", entry(0)).unwrap(), 0);
        assert_eq!(store.append("archive", entry(1)).unwrap(), 1);
        assert_eq!(store.len("archive").unwrap(), 2);

        let read = store.read_from("archive", 1, 16).unwrap();
        assert_eq!(read.len(), 1);
        assert_eq!(read[0].0, 1);
    }

    #[test]
    fn test_queues_are_isolated() {
        let store = LogStore::in_memory();
        store.append("a", entry(0)).unwrap();
        assert_eq!(store.len("b").unwrap(), 0);
    }

    #[test]
    fn test_journal_replay_restores_queue() {
        let dir = std::env::temp_dir().join(format!("relay-log-{}", uuid::Uuid::new_v4()));

        {
            let store = LogStore::open(&dir).unwrap();
            store.append("archive", entry(0)).unwrap();
            store.append("archive", entry(1)).unwrap();
        }

        let reopened = LogStore::open(&dir).unwrap();
        assert_eq!(reopened.len("archive").unwrap(), 2);
        let read = reopened.read_from("archive", 0, 16).unwrap();
        assert_eq!(read[1].1.key.as_deref(), Some("k-1"));
        // appends continue after the replayed tail
        assert_eq!(reopened.append("archive", entry(2)).unwrap(), 2);

        fs::remove_dir_all(&dir).ok();
    }
}
