//! Text rendering of snapshots and events

use std::fmt::Write;

use canopy_tree::{Column, TreeEvent, TreeSnapshot};

/// Render the tree as an indented listing
pub fn render_tree(snapshot: &TreeSnapshot) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<6} {:<34} {:<12} {}",
        "node",
        Column::Name.header(),
        Column::Bitrate.header(),
        Column::Transmit.header()
    );

    for bus in &snapshot.buses {
        let live = if bus.live { "  live" } else { "" };
        let _ = writeln!(
            out,
            "{:<6} {} {:<30} {:<12} {}{}",
            bus.node.to_string(),
            bus.connected.marker(),
            bus.name,
            bus.bitrate_label,
            bus.transmit.marker(),
            live
        );
        for device in &bus.devices {
            let online = if device.effective_active {
                "  online"
            } else {
                ""
            };
            let _ = writeln!(
                out,
                "  {:<4} {} {:<30} {:<12} {}{}",
                device.node.to_string(),
                device.active.marker(),
                device.name,
                "",
                device.transmit.marker(),
                online
            );
        }
    }
    out
}

/// One-line description of an event worth showing, if any
pub fn describe_event(event: &TreeEvent) -> Option<String> {
    match event {
        TreeEvent::ChannelConnected { bus } => Some(format!("{} connected", bus)),
        TreeEvent::ChannelDisconnected { bus } => Some(format!("{} disconnected", bus)),
        TreeEvent::WentOffline { bus, reason } => Some(format!("{} went offline: {}", bus, reason)),
        TreeEvent::ChannelOpenFailed { bus, message } => {
            Some(format!("{} failed to open: {}", bus, message))
        }
        TreeEvent::DeviceRemoved { endpoint } => Some(format!("{} removed", endpoint)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_tree::{BusFamily, BusRow, DeviceRow, EndpointId, InterfaceParams, NodeId, TriState};

    #[test]
    fn test_render_marks_state() {
        let snapshot = TreeSnapshot {
            buses: vec![BusRow {
                node: NodeId(3),
                family: BusFamily::Can,
                name: "socketcan - vcan0".to_string(),
                params: Some(InterfaceParams::can("socketcan", "vcan0")),
                bitrate: 500_000,
                bitrate_label: "500 kBit/s".to_string(),
                connected: TriState::On,
                transmit: TriState::Off,
                live: true,
                placeholder: false,
                devices: vec![DeviceRow {
                    node: NodeId(4),
                    endpoint: EndpointId(1),
                    name: "meter".to_string(),
                    active: TriState::Partial,
                    transmit: TriState::Off,
                    effective_active: false,
                }],
            }],
        };

        let text = render_tree(&snapshot);
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[1].contains("[x] socketcan - vcan0"));
        assert!(lines[1].ends_with("live"));
        assert!(lines[2].contains("[~] meter"));
        assert!(!lines[2].contains("online"));
    }

    #[test]
    fn test_value_changes_are_quiet() {
        assert!(describe_event(&TreeEvent::cell_changed(NodeId(1), Column::Name)).is_none());
        assert_eq!(
            describe_event(&TreeEvent::WentOffline {
                bus: NodeId(2),
                reason: "unplugged".to_string()
            })
            .as_deref(),
            Some("#2 went offline: unplugged")
        );
    }
}
