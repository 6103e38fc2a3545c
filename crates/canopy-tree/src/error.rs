//! Error types for the bus tree

use thiserror::Error;

use crate::tree::NodeId;

/// Errors returned by tree operations
#[derive(Debug, Error)]
pub enum TreeError {
    /// Requested bitrate is not in the bus family's table
    #[error("{requested} not found in {legal}")]
    InvalidBitrate {
        /// The rejected value, as given
        requested: String,
        /// Comma separated legal labels
        legal: String,
    },

    /// Structurally impossible checked-state request
    #[error("invalid checked state request on node {node}: {reason}")]
    InvalidChecked {
        /// Node the request targeted
        node: NodeId,
        /// Why it was rejected
        reason: &'static str,
    },

    /// The node exists but is of the wrong kind for the operation
    #[error("node {node} is not a {expected}")]
    WrongNodeKind {
        /// Node the request targeted
        node: NodeId,
        /// Kind the operation needs
        expected: &'static str,
    },

    /// Node handle does not refer to a live node
    #[error("unknown node: {0}")]
    UnknownNode(NodeId),

    /// Malformed interface parameters
    #[error("invalid interface parameters: {0}")]
    InvalidParams(String),

    /// The family factory could not open the live channel
    #[error("failed to open channel for {bus}: {source}")]
    ChannelOpen {
        /// Display name of the bus
        bus: String,
        /// Underlying factory error
        #[source]
        source: ChannelError,
    },
}

/// Errors raised by live channels and their factories
#[derive(Debug, Error)]
pub enum ChannelError {
    /// No factory is registered for the bus family
    #[error("no channel factory registered for {0}")]
    NoFactory(String),

    /// The factory refused to open the interface
    #[error("cannot open {interface}: {reason}")]
    OpenFailed {
        /// Joined interface parameters
        interface: String,
        /// Driver message
        reason: String,
    },

    /// The parameters belong to another family
    #[error("parameters {0} are not supported by this factory")]
    UnsupportedParams(String),

    /// No live channel is installed
    #[error("channel is not connected")]
    NotConnected,

    /// Transmit is disabled on the bus
    #[error("transmit is disabled")]
    TransmitDisabled,

    /// I/O error on the live channel
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serial port error
    #[error("serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),
}
