//! Error types for connection tracking operations.
//!
//! Per-packet failures (malformed headers, admission refusals, state
//! violations) never surface as errors from a batch: they are folded into
//! packet metadata and the batch report. The variants here cover the
//! control plane and construction paths.

use thiserror::Error;

/// Result type for connection tracking operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while building or operating a tracker.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The packet could not be turned into a connection tuple.
    ///
    /// Raised by tuple extraction; the batch pipeline converts it into an
    /// untrackable verdict and carries on with the next packet.
    #[error("malformed packet: {0}")]
    Malformed(&'static str),

    /// The provider does not implement the requested operation.
    #[error("operation not supported: {0}")]
    NotSupported(&'static str),

    /// Invalid construction parameters.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The background cleanup thread could not be started.
    #[error("failed to spawn cleanup thread: {0}")]
    Spawn(String),

    /// The operating system random source failed while seeding the hash.
    #[error("random source unavailable: {0}")]
    Random(String),
}

impl Error {
    /// Returns true for errors that mean "this provider lacks the operation".
    pub fn is_not_supported(&self) -> bool {
        matches!(self, Error::NotSupported(_))
    }
}
