//! Bus error types.

use std::time::Duration;

use lodestone_types::Revision;
use thiserror::Error;

/// Result type for bus operations.
pub type BusResult<T> = Result<T, BusError>;

/// Failure modes surfaced by the transport port.
///
/// This is the complete set: no other transport condition is distinguished
/// at this layer. Everything else is an adapter bug.
#[derive(Debug, Error)]
pub enum BusError {
    /// The transport connection is down.
    #[error("transport disconnected")]
    Disconnected,

    /// The operation did not complete within its timeout.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// A compare-and-swap presented a stale revision.
    #[error("revision mismatch on {key}: expected {expected}")]
    RevisionMismatch {
        key: String,
        expected: Revision,
    },

    /// The addressed key does not exist (or has expired).
    #[error("key not found: {0}")]
    NotFound(String),

    /// An atomic create lost the race: the key already exists.
    #[error("key already exists: {0}")]
    AlreadyExists(String),
}

impl BusError {
    /// Whether retrying the same operation can succeed.
    ///
    /// Only transport-level failures are transient; the KV outcomes carry
    /// information the caller must react to instead of retrying blindly.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Timeout(_))
    }
}
