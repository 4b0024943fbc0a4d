use std::time::Duration;

use thiserror::Error;

/// Errors produced by pipe operations.
///
/// Variants are grouped by how the notifier and listener treat them:
/// [`Transport`](PipeError::Transport) and [`Timeout`](PipeError::Timeout)
/// are recoverable and retried locally, [`Cancelled`](PipeError::Cancelled)
/// is a clean abort, everything else is fatal for the call.
#[derive(Error, Debug)]
pub enum PipeError {
    /// Could not establish a bus connection.
    #[error("could not connect to bus: {0}")]
    Connect(String),

    /// Payload could not be read from the input source.
    #[error("could not read input: {0}")]
    Input(String),

    /// Delivered payload could not be written out.
    #[error("could not write output: {0}")]
    Output(String),

    /// Payload could not be compressed or decompressed.
    #[error("codec error: {0}")]
    Codec(String),

    /// Recoverable transport failure (no responders, dropped connection, ...).
    #[error("transport error: {0}")]
    Transport(String),

    /// A single attempt ran out of time.
    #[error("request timed out")]
    Timeout,

    /// The overall deadline of a notify call was exhausted.
    #[error("timeout after {}", humantime::format_duration(*.0))]
    TimedOut(Duration),

    /// Durable resources could not be provisioned.
    #[error("could not provision durable resources: {0}")]
    Provision(String),

    /// The resource being created already exists on the bus.
    #[error("resource already exists: {0}")]
    AlreadyExists(String),

    /// The operation was cancelled by the caller.
    #[error("operation cancelled")]
    Cancelled,

    /// A discovery request arrived without a reply subject.
    #[error("no reply subject received on discovery channel")]
    MissingReplySubject,

    /// Pipe name or mode is unusable.
    #[error("invalid pipe: {0}")]
    InvalidPipe(String),

    /// Required configuration is missing.
    #[error("missing configuration: {0}")]
    MissingConfig(String),

    /// Configuration options contradict each other.
    #[error("configuration conflict: {0}")]
    ConfigConflict(String),

    /// The bus connection was already closed.
    #[error("bus connection is closed")]
    Closed,
}

impl PipeError {
    /// Returns `true` for errors the notifier retries with backoff.
    pub fn is_retryable(&self) -> bool {
        // ---
        matches!(self, PipeError::Transport(_) | PipeError::Timeout)
    }

    /// Returns `true` when the error is a clean cancellation, not a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, PipeError::Cancelled)
    }
}

/// Result type alias for pipe operations.
pub type Result<T> = std::result::Result<T, PipeError>;

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_timed_out_message_carries_configured_timeout() {
        // ---
        let err = PipeError::TimedOut(Duration::from_secs(3600));
        assert_eq!(err.to_string(), "timeout after 1h");
    }

    #[test]
    fn test_retryable_classification() {
        // ---
        assert!(PipeError::Transport("no responders".into()).is_retryable());
        assert!(PipeError::Timeout.is_retryable());
        assert!(!PipeError::Codec("bad header".into()).is_retryable());
        assert!(!PipeError::Cancelled.is_retryable());
        assert!(PipeError::Cancelled.is_cancelled());
    }
}
