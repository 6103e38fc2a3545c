//! Error types for the simulation layer

use canopy_tree::ChannelError;
use thiserror::Error;

/// Errors raised by virtual hardware
#[derive(Debug, Error)]
pub enum SimError {
    /// No channel is open on the interface
    #[error("no open channel on {0}")]
    NotOpen(String),

    /// The interface is not part of the simulated hardware
    #[error("unknown interface {0}")]
    UnknownInterface(String),

    /// The endpoint is not attached to a bus channel
    #[error("endpoint {0} is not attached")]
    Detached(String),

    /// The bus channel rejected the payload
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),
}
