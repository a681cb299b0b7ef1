//! The uniform push contract over heterogeneous brokers.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::message::{MessageObject, Payload};

/// Maps a message to a target shard before send.
///
/// Configured once at build time and reused for the sender's lifetime;
/// `None` lets the broker pick (key hashing or round-robin).
pub type Partitioner<V> = Arc<dyn Fn(&MessageObject<V>) -> Option<i32> + Send + Sync>;

/// Publishes messages to one bound connection's target queue.
///
/// Senders used as dead-letter targets are invoked from inside another
/// component's failure-handling path: they make a single bounded attempt
/// and propagate failure instead of retrying.
#[async_trait]
pub trait MessageSender<V: Payload>: Send + Sync {
    /// Publish one message. Failures surface as
    /// [`crate::error::MessagingError::Transport`].
    async fn send(&self, message: &MessageObject<V>) -> Result<()>;

    /// Publish a batch in order, stopping at the first failure.
    async fn send_all(&self, batch: &[MessageObject<V>]) -> Result<()> {
        for message in batch {
            self.send(message).await?;
        }
        Ok(())
    }

    /// Target queue this sender publishes to.
    fn queue(&self) -> &str;
}
