//! Error types for the message relay core.
//!
//! Every broker backend and state store maps its own failures into this one
//! taxonomy, so operators see a single set of error shapes regardless of the
//! underlying technology. Raw driver errors never cross the crate boundary.

use thiserror::Error;

/// Result type for messaging operations
pub type Result<T> = std::result::Result<T, MessagingError>;

/// Errors that can occur while building or driving receivers, senders and
/// offset state managers.
#[derive(Error, Debug)]
pub enum MessagingError {
    /// Build-time configuration problem (missing connection, wrong broker
    /// tag, bad settings). Never raised from a steady-state receive/send path.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Named connection is absent, closed, or failed to connect.
    #[error("connection `{name}` unavailable: {reason}")]
    Connection { name: String, reason: String },

    /// Broker I/O failure on a specific queue.
    #[error("transport error on `{queue}`: {detail}")]
    Transport { queue: String, detail: String },

    /// Payload from the broker could not be decoded into the expected type.
    #[error("failed to decode payload from `{queue}`: {detail}")]
    Decode { queue: String, detail: String },

    /// The offset store failed or returned a corrupt record. The caller must
    /// not assume the offset advanced; the receive/process/ack cycle is safe
    /// to retry.
    #[error("state persistence failed for `{name}`: {detail}")]
    StatePersistence { name: String, detail: String },

    /// Compare-and-swap on a state record lost against a concurrent writer.
    #[error("state record `{kind}/{name}` was modified concurrently")]
    StateConflict { kind: String, name: String },

    /// An update would move a persisted offset backwards.
    #[error("offset for `{name}` would regress from {stored} to {attempted}")]
    OffsetRegression {
        name: String,
        stored: String,
        attempted: String,
    },

    /// A destination commit would pass the read position.
    #[error("commit for `{name}` would pass the read position ({attempted} > {processed})")]
    CommitOverrun {
        name: String,
        processed: String,
        attempted: String,
    },

    /// Two offsets from different queue scopes were compared.
    #[error("offsets `{left}` and `{right}` belong to different scopes")]
    IncompatibleOffsets { left: String, right: String },

    /// A lifecycle precondition failed (`ProcessorState::check`).
    #[error("invalid processor state: expected {expected}, found {found}")]
    InvalidState { expected: String, found: String },

    /// The backend has no equivalent for the requested operation.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
}

impl MessagingError {
    /// Wrap a broker-level failure with its queue context.
    pub fn transport(queue: impl Into<String>, detail: impl ToString) -> Self {
        MessagingError::Transport {
            queue: queue.into(),
            detail: detail.to_string(),
        }
    }

    /// Wrap a payload decode failure with its queue context.
    pub fn decode(queue: impl Into<String>, detail: impl ToString) -> Self {
        MessagingError::Decode {
            queue: queue.into(),
            detail: detail.to_string(),
        }
    }

    /// Wrap an offset-store failure with the state record name.
    pub fn persistence(name: impl Into<String>, detail: impl ToString) -> Self {
        MessagingError::StatePersistence {
            name: name.into(),
            detail: detail.to_string(),
        }
    }

    /// Check if the error is worth retrying after a backoff.
    ///
    /// Configuration and state-machine errors are permanent until an operator
    /// intervenes; transport and persistence failures are usually transient.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MessagingError::Transport { .. }
                | MessagingError::Connection { .. }
                | MessagingError::StatePersistence { .. }
                | MessagingError::StateConflict { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(MessagingError::transport("q", "broker down").is_transient());
        assert!(MessagingError::persistence("s", "pool timeout").is_transient());
        assert!(!MessagingError::Configuration("bad type".into()).is_transient());
        assert!(!MessagingError::Unsupported("seek").is_transient());
    }

    #[test]
    fn test_error_display_carries_context() {
        let err = MessagingError::transport("cdc.content", "timed out");
        assert!(err.to_string().contains("cdc.content"));

        let err = MessagingError::OffsetRegression {
            name: "analytics.cdc.content".into(),
            stored: "log:cdc.content@9".into(),
            attempted: "log:cdc.content@4".into(),
        };
        assert!(err.to_string().contains("regress"));
    }
}
