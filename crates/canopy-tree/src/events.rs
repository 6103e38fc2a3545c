//! Change notifications for the presentation layer
//!
//! Every mutation of the tree is reported as a [`TreeEvent`]. Structural
//! events mirror the usual item-model vocabulary (rows inserted/removed,
//! layout changed, reset) so a view can map them one to one. Channel
//! lifecycle events are emitted through the same stream so observers see
//! them in order with the checked-state changes they cause.

use serde::{Deserialize, Serialize};

use crate::column::Column;
use crate::device::EndpointId;
use crate::tree::NodeId;

/// Unified event enum for all tree activity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TreeEvent {
    // -------------------------------------------------------------------------
    // Value changes
    // -------------------------------------------------------------------------
    /// Display or checked data of a contiguous range of siblings changed
    DataChanged {
        /// First node of the range
        first: NodeId,
        /// Last node of the range
        last: NodeId,
        /// First affected column
        first_column: Column,
        /// Last affected column
        last_column: Column,
    },

    // -------------------------------------------------------------------------
    // Structural changes
    // -------------------------------------------------------------------------
    /// Rows were inserted under a parent
    RowsInserted {
        /// Parent node
        parent: NodeId,
        /// First inserted row
        first: usize,
        /// Last inserted row
        last: usize,
    },

    /// Rows were removed from a parent
    RowsRemoved {
        /// Parent node
        parent: NodeId,
        /// First removed row
        first: usize,
        /// Last removed row
        last: usize,
    },

    /// The layout below a parent changed
    LayoutChanged {
        /// Parent node
        parent: NodeId,
    },

    /// Everything may have changed
    Reset,

    /// A device left the tree; downstream owners should clean up the endpoint
    DeviceRemoved {
        /// Key of the removed endpoint
        endpoint: EndpointId,
    },

    // -------------------------------------------------------------------------
    // Channel lifecycle
    // -------------------------------------------------------------------------
    /// A live channel was installed on a bus
    ChannelConnected {
        /// Bus node
        bus: NodeId,
    },

    /// A bus's live channel was closed
    ChannelDisconnected {
        /// Bus node
        bus: NodeId,
    },

    /// A bus's live channel failed asynchronously
    WentOffline {
        /// Bus node
        bus: NodeId,
        /// Driver message
        reason: String,
    },

    /// The family factory could not open a channel
    ChannelOpenFailed {
        /// Bus node
        bus: NodeId,
        /// Error message
        message: String,
    },
}

impl TreeEvent {
    /// Value change spanning a single node and column
    pub fn cell_changed(node: NodeId, column: Column) -> Self {
        Self::DataChanged {
            first: node,
            last: node,
            first_column: column,
            last_column: column,
        }
    }

    /// Value change spanning a range of siblings and every column
    pub fn rows_changed(first: NodeId, last: NodeId) -> Self {
        Self::DataChanged {
            first,
            last,
            first_column: Column::FIRST,
            last_column: Column::LAST,
        }
    }

    /// Check if this is a structural event
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            TreeEvent::RowsInserted { .. }
                | TreeEvent::RowsRemoved { .. }
                | TreeEvent::LayoutChanged { .. }
                | TreeEvent::Reset
        )
    }

    /// Check if this is a channel lifecycle event
    pub fn is_channel_lifecycle(&self) -> bool {
        matches!(
            self,
            TreeEvent::ChannelConnected { .. }
                | TreeEvent::ChannelDisconnected { .. }
                | TreeEvent::WentOffline { .. }
                | TreeEvent::ChannelOpenFailed { .. }
        )
    }

    /// Get the bus if this event is a channel lifecycle event
    pub fn bus(&self) -> Option<NodeId> {
        match self {
            TreeEvent::ChannelConnected { bus }
            | TreeEvent::ChannelDisconnected { bus }
            | TreeEvent::WentOffline { bus, .. }
            | TreeEvent::ChannelOpenFailed { bus, .. } => Some(*bus),
            _ => None,
        }
    }
}
