//! Device nodes and the endpoints they forward to

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::channel::ChannelLink;
use crate::column::{Column, Columns};
use crate::tristate::TriState;

/// Opaque key of an externally owned endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EndpointId(pub u32);

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "endpoint {}", self.0)
    }
}

/// An endpoint attached to a bus through a device node
///
/// The tree owns the endpoint while the device is in the tree and hands it
/// back on removal.
pub trait Endpoint: Send {
    /// Unique key of the endpoint
    fn id(&self) -> EndpointId;

    /// Display name
    fn name(&self) -> String;

    /// Effective activity and transmit enable changed
    fn bus_status_changed(&mut self, online: bool, transmit: bool);

    /// Attach to (or detach from) the owning bus's channel
    fn attach(&mut self, link: Option<ChannelLink>);

    /// Transmit enable changed
    fn set_transmit(&mut self, transmit: bool);
}

/// Resolve a requested flag for a device against its parent's flag
///
/// - `On` becomes `On` only while the parent is `On`; otherwise the flag
///   cycles `Off -> Partial -> Off`.
/// - `Partial` and `Off` are applied unconditionally.
pub fn resolve_request(current: TriState, requested: TriState, parent: TriState) -> TriState {
    match requested {
        TriState::On if parent.is_on() => TriState::On,
        TriState::On if current == TriState::Off => TriState::Partial,
        TriState::On => TriState::Off,
        TriState::Partial => TriState::Partial,
        TriState::Off => TriState::Off,
    }
}

/// An endpoint attached to a bus
pub struct Device {
    endpoint: Box<dyn Endpoint>,
    id: EndpointId,
    name: String,
    checked: Columns<TriState>,
}

impl Device {
    /// Wrap an endpoint; both flags start off
    pub fn new(mut endpoint: Box<dyn Endpoint>) -> Self {
        let checked = Columns::fill(TriState::Off);
        endpoint.set_transmit(checked.transmit.is_on());
        endpoint.bus_status_changed(false, false);

        Self {
            id: endpoint.id(),
            name: endpoint.name(),
            endpoint,
            checked,
        }
    }

    /// Key of the wrapped endpoint
    pub fn endpoint_id(&self) -> EndpointId {
        self.id
    }

    /// Display name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Checked flag of a column
    pub fn checked(&self, column: Column) -> TriState {
        *self.checked.get(column)
    }

    /// Display text per column
    pub fn fields(&self) -> Columns<String> {
        Columns {
            name: self.name.clone(),
            bitrate: String::new(),
            transmit: String::new(),
        }
    }

    /// Effective activity given the parent bus's name flag
    pub fn effective_active(&self, parent: TriState) -> bool {
        self.checked.name.is_on() && parent.is_on()
    }

    pub(crate) fn set_flag(&mut self, column: Column, state: TriState) {
        *self.checked.get_mut(column) = state;
    }

    pub(crate) fn endpoint_mut(&mut self) -> &mut dyn Endpoint {
        self.endpoint.as_mut()
    }

    pub(crate) fn into_endpoint(self) -> Box<dyn Endpoint> {
        self.endpoint
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("checked", &self.checked)
            .field("endpoint", &"<endpoint>")
            .finish()
    }
}
