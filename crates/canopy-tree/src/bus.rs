//! Bus nodes

use crate::channel::{ChannelHandle, ChannelLink};
use crate::column::{Column, Columns};
use crate::family::{BusFamily, BusRecord, InterfaceParams};
use crate::tristate::TriState;

/// A root-level selectable channel
///
/// Owns one [`ChannelHandle`] for its whole lifetime. Only the model mutates
/// the checked flags, so propagation to devices always runs.
#[derive(Debug)]
pub struct Bus {
    family: BusFamily,
    params: Option<InterfaceParams>,
    name: String,
    bitrate: u32,
    checked: Columns<TriState>,
    handle: ChannelHandle,
    opening: Option<u64>,
}

impl Bus {
    /// Create a bus from a discovery record
    pub fn new(record: BusRecord) -> Self {
        let family = record.family;
        let name = match &record.params {
            Some(params) => params.unique(),
            None => format!("Offline ({})", family.type_string()),
        };
        let checked = Columns::fill(TriState::Off);

        Self {
            family,
            params: record.params,
            name,
            bitrate: family.default_bitrate(),
            handle: ChannelHandle::new(checked.transmit.is_on()),
            checked,
            opening: None,
        }
    }

    /// Channel family
    pub fn family(&self) -> BusFamily {
        self.family
    }

    /// Interface parameters, `None` for a placeholder
    pub fn params(&self) -> Option<&InterfaceParams> {
        self.params.as_ref()
    }

    /// Check if this is an always-offline placeholder
    pub fn is_placeholder(&self) -> bool {
        self.params.is_none()
    }

    /// Display name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Identity string, `None` for a placeholder
    pub fn unique(&self) -> Option<String> {
        self.params.as_ref().map(InterfaceParams::unique)
    }

    /// Current bitrate
    pub fn bitrate(&self) -> u32 {
        self.bitrate
    }

    /// Display label of the current bitrate
    pub fn bitrate_label(&self) -> &'static str {
        self.family.bitrate_label(self.bitrate).unwrap_or("")
    }

    /// Legal bitrate labels in table order
    pub fn bitrate_choices(&self) -> Vec<&'static str> {
        self.family.bitrates().iter().map(|(_, label)| *label).collect()
    }

    /// Checked flag of a column
    pub fn checked(&self, column: Column) -> TriState {
        *self.checked.get(column)
    }

    /// Display text per column
    pub fn fields(&self) -> Columns<String> {
        Columns {
            name: self.name.clone(),
            bitrate: self.bitrate_label().to_string(),
            transmit: String::new(),
        }
    }

    /// The owned channel handle
    pub fn handle(&self) -> &ChannelHandle {
        &self.handle
    }

    /// A link to the owned channel handle
    pub fn link(&self) -> ChannelLink {
        self.handle.link()
    }

    /// Generation of the open currently in flight, if any
    ///
    /// At most one open runs per bus. A derivation that happens while it
    /// runs is picked up when it completes.
    pub fn opening(&self) -> Option<u64> {
        self.opening
    }

    pub(crate) fn set_opening(&mut self, generation: Option<u64>) {
        self.opening = generation;
    }

    pub(crate) fn set_flag(&mut self, column: Column, state: TriState) {
        *self.checked.get_mut(column) = state;
    }

    pub(crate) fn set_bitrate_unchecked(&mut self, bitrate: u32) {
        self.bitrate = bitrate;
    }
}
