use thiserror::Error;

/// Error kinds surfaced by the communication layer.
///
/// Background threads (`SendProgress`, `RecvProgress`, `CallbackDispatch`)
/// never propagate errors across a thread boundary: a fatal condition there
/// is logged and recorded in a shared failure flag, which a subsequent
/// producer-facing call observes and reports as [`CommError::TransportFailure`].
#[derive(Debug, Clone, Error)]
pub enum CommError {
    /// Reserved tag used, unregistered tag, duplicate registration, zero-length
    /// payload, or a payload larger than the configured buffer capacity.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Call sequence violation: send after finalize, double init, or similar.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Unrecoverable transport-level failure. The layer does not retry.
    #[error("transport failure: {0}")]
    TransportFailure(String),

    /// Enqueue attempted after push was disabled on a queue.
    #[error("queue closed")]
    QueueClosed,
}

impl CommError {
    pub(crate) fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub(crate) fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    pub(crate) fn transport_failure(msg: impl Into<String>) -> Self {
        Self::TransportFailure(msg.into())
    }
}

/// Convenience alias used throughout the crate's fallible APIs.
pub type CommResult<T> = Result<T, CommError>;
