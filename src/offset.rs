//! Position markers for resumable consumption.
//!
//! An [`Offset`] is an opaque, broker-specific position that is totally
//! ordered within one queue/partition scope and round-trips through a string
//! encoding. Offsets from different scopes are never comparable; attempting
//! it is an error, not a silent `false`.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{MessagingError, Result};

/// A comparable position marker within one queue/partition scope.
pub trait Offset: Clone + fmt::Debug + Send + Sync + 'static {
    /// Compare two offsets from the same scope.
    ///
    /// Returns [`MessagingError::IncompatibleOffsets`] when the two values
    /// belong to different scopes (different partitions, queues or engines).
    fn try_compare(&self, other: &Self) -> Result<Ordering>;

    /// Stable string encoding; inverse of [`Offset::from_string`].
    fn as_string(&self) -> String;

    /// Parse the encoding produced by [`Offset::as_string`].
    fn from_string(encoded: &str) -> Result<Self>
    where
        Self: Sized;
}

/// Broker-native read position, one variant per backend technology.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueueOffset {
    /// Kafka topic/partition/offset triple.
    Partition {
        topic: String,
        partition: i32,
        offset: i64,
    },
    /// Append-only log store position.
    Log { queue: String, position: u64 },
    /// Stream entry id (millisecond timestamp + sequence within it).
    Stream { stream: String, ms: u64, seq: u64 },
}

impl QueueOffset {
    /// Scope key: two offsets compare only when their scopes are equal.
    pub fn scope(&self) -> String {
        match self {
            QueueOffset::Partition {
                topic, partition, ..
            } => format!("{}/{}", topic, partition),
            QueueOffset::Log { queue, .. } => queue.clone(),
            QueueOffset::Stream { stream, .. } => stream.clone(),
        }
    }

    fn incompatible(&self, other: &Self) -> MessagingError {
        MessagingError::IncompatibleOffsets {
            left: self.as_string(),
            right: other.as_string(),
        }
    }
}

impl Offset for QueueOffset {
    fn try_compare(&self, other: &Self) -> Result<Ordering> {
        match (self, other) {
            (
                QueueOffset::Partition {
                    topic: lt,
                    partition: lp,
                    offset: lo,
                },
                QueueOffset::Partition {
                    topic: rt,
                    partition: rp,
                    offset: ro,
                },
            ) if lt == rt && lp == rp => Ok(lo.cmp(ro)),
            (
                QueueOffset::Log {
                    queue: lq,
                    position: lp,
                },
                QueueOffset::Log {
                    queue: rq,
                    position: rp,
                },
            ) if lq == rq => Ok(lp.cmp(rp)),
            (
                QueueOffset::Stream {
                    stream: ls,
                    ms: lm,
                    seq: lq,
                },
                QueueOffset::Stream {
                    stream: rs,
                    ms: rm,
                    seq: rq,
                },
            ) if ls == rs => Ok((lm, lq).cmp(&(rm, rq))),
            _ => Err(self.incompatible(other)),
        }
    }

    fn as_string(&self) -> String {
        match self {
            QueueOffset::Partition {
                topic,
                partition,
                offset,
            } => format!("partition:{}/{}@{}", topic, partition, offset),
            QueueOffset::Log { queue, position } => format!("log:{}@{}", queue, position),
            QueueOffset::Stream { stream, ms, seq } => {
                format!("stream:{}@{}-{}", stream, ms, seq)
            }
        }
    }

    fn from_string(encoded: &str) -> Result<Self> {
        let bad = || MessagingError::Configuration(format!("malformed offset `{}`", encoded));
        let (kind, rest) = encoded.split_once(':').ok_or_else(bad)?;
        let (scope, position) = rest.rsplit_once('@').ok_or_else(bad)?;
        match kind {
            "partition" => {
                let (topic, partition) = scope.rsplit_once('/').ok_or_else(bad)?;
                Ok(QueueOffset::Partition {
                    topic: topic.to_string(),
                    partition: partition.parse().map_err(|_| bad())?,
                    offset: position.parse().map_err(|_| bad())?,
                })
            }
            "log" => Ok(QueueOffset::Log {
                queue: scope.to_string(),
                position: position.parse().map_err(|_| bad())?,
            }),
            "stream" => {
                let (ms, seq) = position.split_once('-').ok_or_else(bad)?;
                Ok(QueueOffset::Stream {
                    stream: scope.to_string(),
                    ms: ms.parse().map_err(|_| bad())?,
                    seq: seq.parse().map_err(|_| bad())?,
                })
            }
            _ => Err(bad()),
        }
    }
}

impl fmt::Display for QueueOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_string())
    }
}

/// A change-event position within one source engine.
///
/// Transaction ids order primarily by `sequence`; the `snapshot` flag marks
/// events produced during a bulk initial load rather than incremental
/// streaming and does not participate in ordering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionId {
    /// Identifies the source system that produced the event.
    pub engine: String,
    /// Monotonically increasing, unique per engine instance.
    pub sequence: u64,
    /// True when the event belongs to a bulk initial load.
    pub snapshot: bool,
}

impl TransactionId {
    pub fn new(engine: impl Into<String>, sequence: u64) -> Self {
        Self {
            engine: engine.into(),
            sequence,
            snapshot: false,
        }
    }

    pub fn snapshot(engine: impl Into<String>, sequence: u64) -> Self {
        Self {
            engine: engine.into(),
            sequence,
            snapshot: true,
        }
    }
}

impl Offset for TransactionId {
    fn try_compare(&self, other: &Self) -> Result<Ordering> {
        if self.engine != other.engine {
            return Err(MessagingError::IncompatibleOffsets {
                left: self.as_string(),
                right: other.as_string(),
            });
        }
        Ok(self.sequence.cmp(&other.sequence))
    }

    fn as_string(&self) -> String {
        format!(
            "{}@{}{}",
            self.engine,
            self.sequence,
            if self.snapshot { "+snapshot" } else { "" }
        )
    }

    fn from_string(encoded: &str) -> Result<Self> {
        let bad =
            || MessagingError::Configuration(format!("malformed transaction id `{}`", encoded));
        let (engine, rest) = encoded.rsplit_once('@').ok_or_else(bad)?;
        let (sequence, snapshot) = match rest.strip_suffix("+snapshot") {
            Some(seq) => (seq, true),
            None => (rest, false),
        };
        Ok(TransactionId {
            engine: engine.to_string(),
            sequence: sequence.parse().map_err(|_| bad())?,
            snapshot,
        })
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_offset_ordering_within_scope() {
        let low = QueueOffset::Partition {
            topic: "cdc.content".into(),
            partition: 0,
            offset: 10,
        };
        let high = QueueOffset::Partition {
            topic: "cdc.content".into(),
            partition: 0,
            offset: 42,
        };
        assert_eq!(low.try_compare(&high).unwrap(), Ordering::Less);
        assert_eq!(high.try_compare(&low).unwrap(), Ordering::Greater);
        assert_eq!(low.try_compare(&low).unwrap(), Ordering::Equal);
    }

    #[test]
    fn test_queue_offset_rejects_cross_scope_compare() {
        let kafka = QueueOffset::Partition {
            topic: "cdc.content".into(),
            partition: 0,
            offset: 10,
        };
        let other_partition = QueueOffset::Partition {
            topic: "cdc.content".into(),
            partition: 1,
            offset: 10,
        };
        let log = QueueOffset::Log {
            queue: "cdc.content".into(),
            position: 10,
        };
        assert!(matches!(
            kafka.try_compare(&other_partition),
            Err(MessagingError::IncompatibleOffsets { .. })
        ));
        assert!(matches!(
            kafka.try_compare(&log),
            Err(MessagingError::IncompatibleOffsets { .. })
        ));
    }

    #[test]
    fn test_queue_offset_string_round_trip() {
        let offsets = [
            QueueOffset::Partition {
                topic: "cdc.content".into(),
                partition: 3,
                offset: 918,
            },
            QueueOffset::Log {
                queue: "archive".into(),
                position: 7,
            },
            QueueOffset::Stream {
                stream: "events".into(),
                ms: 1_726_000_000_123,
                seq: 4,
            },
        ];
        for offset in offsets {
            let encoded = offset.as_string();
            assert_eq!(QueueOffset::from_string(&encoded).unwrap(), offset);
        }
    }

    #[test]
    fn test_queue_offset_rejects_malformed_encoding() {
        assert!(QueueOffset::from_string("nonsense").is_err());
        assert!(QueueOffset::from_string("partition:no-at-sign").is_err());
        assert!(QueueOffset::from_string("zk:/path@3").is_err());
    }

    #[test]
    fn test_transaction_id_orders_by_sequence() {
        let a = TransactionId::new("wal", 5);
        let b = TransactionId::snapshot("wal", 9);
        assert_eq!(a.try_compare(&b).unwrap(), Ordering::Less);

        let foreign = TransactionId::new("binlog", 9);
        assert!(a.try_compare(&foreign).is_err());
    }

    #[test]
    fn test_transaction_id_round_trip() {
        for tx in [
            TransactionId::new("wal", 42),
            TransactionId::snapshot("wal", 1),
        ] {
            assert_eq!(TransactionId::from_string(&tx.as_string()).unwrap(), tx);
        }
    }
}
