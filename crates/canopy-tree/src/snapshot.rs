//! Read-only snapshots of the tree
//!
//! A snapshot is a plain copy of every row's display and checked data that
//! can be sent across channels (the actor hands them to the presentation
//! layer) or serialized.

use serde::{Deserialize, Serialize};

use crate::device::EndpointId;
use crate::family::{BusFamily, InterfaceParams};
use crate::tree::NodeId;
use crate::tristate::TriState;

/// Snapshot of a device row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRow {
    /// Node id of the device
    pub node: NodeId,
    /// Key of the endpoint
    pub endpoint: EndpointId,
    /// Display name
    pub name: String,
    /// Name column flag
    pub active: TriState,
    /// Transmit column flag
    pub transmit: TriState,
    /// Whether the endpoint is effectively online
    pub effective_active: bool,
}

/// Snapshot of a bus row and its devices
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusRow {
    /// Node id of the bus
    pub node: NodeId,
    /// Channel family
    pub family: BusFamily,
    /// Display name
    pub name: String,
    /// Interface parameters, `None` for a placeholder
    pub params: Option<InterfaceParams>,
    /// Current bitrate
    pub bitrate: u32,
    /// Label of the current bitrate
    pub bitrate_label: String,
    /// Name column flag
    pub connected: TriState,
    /// Transmit column flag
    pub transmit: TriState,
    /// Whether a live channel is installed
    pub live: bool,
    /// Whether this is an always-offline placeholder
    pub placeholder: bool,
    /// Device rows in order
    pub devices: Vec<DeviceRow>,
}

/// Snapshot of the whole tree
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeSnapshot {
    /// Bus rows in order
    pub buses: Vec<BusRow>,
}

impl TreeSnapshot {
    /// Find a bus row by node id
    pub fn bus(&self, node: NodeId) -> Option<&BusRow> {
        self.buses.iter().find(|b| b.node == node)
    }

    /// Find a device row by node id
    pub fn device(&self, node: NodeId) -> Option<&DeviceRow> {
        self.buses
            .iter()
            .flat_map(|b| b.devices.iter())
            .find(|d| d.node == node)
    }

    /// Number of live channels
    pub fn live_count(&self) -> usize {
        self.buses.iter().filter(|b| b.live).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_survive_separator_in_channel_name() {
        let params = InterfaceParams::can("socketcan", "vcan - lab");
        let row = BusRow {
            node: NodeId(3),
            family: BusFamily::Can,
            name: params.unique(),
            params: Some(params.clone()),
            bitrate: 500_000,
            bitrate_label: "500 kBit/s".to_string(),
            connected: TriState::Off,
            transmit: TriState::Off,
            live: false,
            placeholder: false,
            devices: Vec::new(),
        };
        let snapshot = TreeSnapshot { buses: vec![row] };

        let json = serde_json::to_string(&snapshot).unwrap();
        let back: TreeSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back.bus(NodeId(3)).unwrap().params, Some(params));
    }
}
