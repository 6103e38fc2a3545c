//! Error types for bus discovery

use thiserror::Error;

/// Errors that can occur during discovery
#[derive(Debug, Error)]
pub enum DetectError {
    /// Failed to enumerate serial ports
    #[error("failed to enumerate ports: {0}")]
    EnumerationFailed(String),

    /// A CAN candidate could not be parsed
    #[error("invalid CAN candidate {0:?}, expected \"interface - channel\"")]
    InvalidCandidate(String),
}
