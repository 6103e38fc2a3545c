//! Bus tree model
//!
//! The model owns the node tree and is the only thing that mutates it. It
//! applies the tri-state propagation rules, derives each bus's live channel
//! from its checked state, folds asynchronous went-offline reports back into
//! the tree and records every change as a [`TreeEvent`].
//!
//! # Propagation
//!
//! - Turning a bus on promotes every device that is not explicitly off.
//! - Turning a bus off demotes selected devices to `Partial` instead of
//!   clearing them, so they come back when the bus does.
//! - A device can only become `On` while its bus is `On`; otherwise a
//!   request toggles it between `Off` and `Partial`.
//!
//! # Opening channels
//!
//! With [`OpenMode::Inline`] a channel is opened inside the mutating call and
//! failures are returned to the caller. With [`OpenMode::Deferred`] the model
//! queues [`OpenRequest`]s; the owner runs them wherever it likes and hands
//! the result back through [`BusTreeModel::complete_open`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::bus::Bus;
use crate::channel::{ChannelFactory, LiveChannel, OfflineNotifier, OfflineReport};
use crate::column::{self, Column, Columns};
use crate::device::{resolve_request, Device, Endpoint, EndpointId};
use crate::error::{ChannelError, TreeError};
use crate::events::TreeEvent;
use crate::family::{BusFamily, BusRecord, InterfaceParams};
use crate::snapshot::{BusRow, DeviceRow, TreeSnapshot};
use crate::tree::{NodeId, Tree};
use crate::tristate::TriState;

/// Default pause after opening a channel before it is considered usable
pub const DEFAULT_SETTLE_DELAY_MS: u64 = 500;

/// Where channel opens run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OpenMode {
    /// Open on the calling thread, inside the mutating call
    #[default]
    Inline,
    /// Queue open requests for the owner to run
    Deferred,
}

/// Tree configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeConfig {
    /// Pause after a channel opens, to let the hardware recover from a
    /// previous session at another rate
    pub settle_delay_ms: u64,
    /// Where channel opens run
    pub open_mode: OpenMode,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: DEFAULT_SETTLE_DELAY_MS,
            open_mode: OpenMode::Inline,
        }
    }
}

impl TreeConfig {
    /// Settle delay as a duration
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

/// Channel factories keyed by family
#[derive(Clone, Default)]
pub struct ChannelFactories {
    factories: HashMap<BusFamily, Arc<dyn ChannelFactory>>,
}

impl ChannelFactories {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory, builder style
    pub fn with(mut self, factory: Arc<dyn ChannelFactory>) -> Self {
        self.register(factory);
        self
    }

    /// Register a factory, replacing any previous one for the same family
    pub fn register(&mut self, factory: Arc<dyn ChannelFactory>) {
        self.factories.insert(factory.family(), factory);
    }

    /// Factory for a family
    pub fn get(&self, family: BusFamily) -> Option<Arc<dyn ChannelFactory>> {
        self.factories.get(&family).cloned()
    }
}

impl fmt::Debug for ChannelFactories {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.factories.keys()).finish()
    }
}

/// A pending channel open for one bus generation
pub struct OpenRequest {
    bus: NodeId,
    generation: u64,
    bus_name: String,
    family: BusFamily,
    params: InterfaceParams,
    bitrate: u32,
    factory: Option<Arc<dyn ChannelFactory>>,
    notifier: OfflineNotifier,
    settle_delay: Duration,
}

impl OpenRequest {
    /// Bus the channel is for
    pub fn bus(&self) -> NodeId {
        self.bus
    }

    /// Handle generation the channel is for
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Bitrate the channel is opened at
    pub fn bitrate(&self) -> u32 {
        self.bitrate
    }

    /// Open the channel and wait out the settle delay
    ///
    /// Blocks; run it on a thread that may block.
    pub fn open_blocking(&self) -> Result<Box<dyn LiveChannel>, ChannelError> {
        let factory = self
            .factory
            .as_ref()
            .ok_or_else(|| ChannelError::NoFactory(self.family.to_string()))?;

        debug!("Opening {} at {} bit/s", self.bus_name, self.bitrate);
        let channel = factory.open(&self.params, self.bitrate, self.notifier.clone())?;

        if !self.settle_delay.is_zero() {
            std::thread::sleep(self.settle_delay);
        }

        Ok(channel)
    }
}

impl fmt::Debug for OpenRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenRequest")
            .field("bus", &self.bus)
            .field("generation", &self.generation)
            .field("bus_name", &self.bus_name)
            .field("bitrate", &self.bitrate)
            .finish_non_exhaustive()
    }
}

/// Payload of a tree node
#[derive(Debug)]
pub enum NodeData {
    /// The invisible root
    Root,
    /// A bus
    Bus(Bus),
    /// A device below a bus
    Device(Device),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeKind {
    Root,
    Bus,
    Device,
}

/// The bus tree and its change notifier
pub struct BusTreeModel {
    config: TreeConfig,
    tree: Tree<NodeData>,
    factories: ChannelFactories,
    offline_tx: mpsc::UnboundedSender<OfflineReport>,
    offline_rx: Option<mpsc::UnboundedReceiver<OfflineReport>>,
    pending_opens: Vec<OpenRequest>,
    event_buffer: Vec<TreeEvent>,
}

impl BusTreeModel {
    /// Build the tree from a discovery snapshot
    ///
    /// One offline placeholder per family is inserted first, followed by the
    /// discovered buses in order. Placeholder records in `discovered` are
    /// skipped.
    pub fn new(config: TreeConfig, factories: ChannelFactories, discovered: Vec<BusRecord>) -> Self {
        let (offline_tx, offline_rx) = mpsc::unbounded_channel();
        let mut model = Self {
            config,
            tree: Tree::new(NodeData::Root),
            factories,
            offline_tx,
            offline_rx: Some(offline_rx),
            pending_opens: Vec::new(),
            event_buffer: Vec::new(),
        };

        let root = model.tree.root();
        let discovered = discovered.into_iter().filter(|record| {
            if record.is_placeholder() {
                debug!("Skipping discovered placeholder for {}", record.family);
            }
            !record.is_placeholder()
        });
        for record in BusRecord::placeholders().into_iter().chain(discovered) {
            let bus = Bus::new(record);
            debug!("Adding bus {}", bus.name());
            if let Err(e) = model.tree.append_child(root, NodeData::Bus(bus)) {
                warn!("Failed to add bus: {}", e);
            }
        }

        info!("Bus tree built with {} bus(es)", model.buses().len());
        model
    }

    /// Current configuration
    pub fn config(&self) -> &TreeConfig {
        &self.config
    }

    // -------------------------------------------------------------------------
    // Read access
    // -------------------------------------------------------------------------

    /// Root node id
    pub fn root(&self) -> NodeId {
        self.tree.root()
    }

    /// Bus nodes in order
    pub fn buses(&self) -> &[NodeId] {
        self.tree.children(self.tree.root())
    }

    /// Device nodes of a bus in order
    pub fn devices(&self, bus: NodeId) -> &[NodeId] {
        self.tree.children(bus)
    }

    /// Parent of a node
    pub fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.tree.parent(node)
    }

    /// Position of a node among its siblings
    pub fn row(&self, node: NodeId) -> Option<usize> {
        self.tree.row(node)
    }

    /// Look up a bus
    pub fn bus(&self, node: NodeId) -> Result<&Bus, TreeError> {
        match &self.tree.node(node)?.data {
            NodeData::Bus(bus) => Ok(bus),
            _ => Err(TreeError::WrongNodeKind {
                node,
                expected: "bus",
            }),
        }
    }

    /// Look up a device
    pub fn device(&self, node: NodeId) -> Result<&Device, TreeError> {
        match &self.tree.node(node)?.data {
            NodeData::Device(device) => Ok(device),
            _ => Err(TreeError::WrongNodeKind {
                node,
                expected: "device",
            }),
        }
    }

    fn bus_mut(&mut self, node: NodeId) -> Result<&mut Bus, TreeError> {
        match &mut self.tree.node_mut(node)?.data {
            NodeData::Bus(bus) => Ok(bus),
            _ => Err(TreeError::WrongNodeKind {
                node,
                expected: "bus",
            }),
        }
    }

    fn device_mut(&mut self, node: NodeId) -> Result<&mut Device, TreeError> {
        match &mut self.tree.node_mut(node)?.data {
            NodeData::Device(device) => Ok(device),
            _ => Err(TreeError::WrongNodeKind {
                node,
                expected: "device",
            }),
        }
    }

    fn kind(&self, node: NodeId) -> Result<NodeKind, TreeError> {
        Ok(match &self.tree.node(node)?.data {
            NodeData::Root => NodeKind::Root,
            NodeData::Bus(_) => NodeKind::Bus,
            NodeData::Device(_) => NodeKind::Device,
        })
    }

    /// Header labels
    pub fn headers(&self) -> Columns<&'static str> {
        column::headers()
    }

    /// Display text of a cell
    pub fn data(&self, node: NodeId, column: Column) -> Result<String, TreeError> {
        Ok(match &self.tree.node(node)?.data {
            NodeData::Root => column.header().to_string(),
            NodeData::Bus(bus) => bus.fields().get(column).clone(),
            NodeData::Device(device) => device.fields().get(column).clone(),
        })
    }

    /// Checked flag of a cell; the root and the bitrate column are always off
    pub fn checked(&self, node: NodeId, column: Column) -> Result<TriState, TreeError> {
        Ok(match &self.tree.node(node)?.data {
            NodeData::Root => TriState::Off,
            NodeData::Bus(bus) => bus.checked(column),
            NodeData::Device(device) => device.checked(column),
        })
    }

    /// Legal bitrate labels of a bus, for an editor
    pub fn bitrate_choices(&self, bus: NodeId) -> Result<Vec<&'static str>, TreeError> {
        Ok(self.bus(bus)?.bitrate_choices())
    }

    /// Whether a device is effectively online
    pub fn effective_active(&self, device: NodeId) -> Result<bool, TreeError> {
        let parent_flag = match self.tree.parent(device) {
            Some(parent) => self.bus(parent)?.checked(Column::Name),
            None => TriState::Off,
        };
        Ok(self.device(device)?.effective_active(parent_flag))
    }

    /// Find a bus by its identity string
    pub fn find_bus(&self, unique: &str) -> Option<NodeId> {
        self.buses().iter().copied().find(|id| {
            self.bus(*id)
                .ok()
                .and_then(Bus::unique)
                .is_some_and(|u| u == unique)
        })
    }

    /// Find the placeholder bus of a family
    pub fn placeholder(&self, family: BusFamily) -> Option<NodeId> {
        self.buses().iter().copied().find(|id| {
            self.bus(*id)
                .is_ok_and(|bus| bus.is_placeholder() && bus.family() == family)
        })
    }

    /// Find the device wrapping an endpoint
    pub fn find_device(&self, endpoint: EndpointId) -> Option<NodeId> {
        self.buses()
            .iter()
            .flat_map(|bus| self.devices(*bus).iter().copied())
            .find(|id| {
                self.device(*id)
                    .is_ok_and(|device| device.endpoint_id() == endpoint)
            })
    }

    /// Copy of every row's display and checked data
    pub fn snapshot(&self) -> TreeSnapshot {
        let buses = self
            .buses()
            .iter()
            .filter_map(|id| self.bus(*id).ok().map(|bus| (*id, bus)))
            .map(|(id, bus)| {
                let connected = bus.checked(Column::Name);
                let devices = self
                    .devices(id)
                    .iter()
                    .filter_map(|d| self.device(*d).ok().map(|device| (*d, device)))
                    .map(|(node, device)| DeviceRow {
                        node,
                        endpoint: device.endpoint_id(),
                        name: device.name().to_string(),
                        active: device.checked(Column::Name),
                        transmit: device.checked(Column::Transmit),
                        effective_active: device.effective_active(connected),
                    })
                    .collect();

                BusRow {
                    node: id,
                    family: bus.family(),
                    name: bus.name().to_string(),
                    params: bus.params().cloned(),
                    bitrate: bus.bitrate(),
                    bitrate_label: bus.bitrate_label().to_string(),
                    connected,
                    transmit: bus.checked(Column::Transmit),
                    live: bus.handle().is_live(),
                    placeholder: bus.is_placeholder(),
                    devices,
                }
            })
            .collect();

        TreeSnapshot { buses }
    }

    /// Drain pending change events
    pub fn drain_events(&mut self) -> Vec<TreeEvent> {
        std::mem::take(&mut self.event_buffer)
    }

    // -------------------------------------------------------------------------
    // Checked state
    // -------------------------------------------------------------------------

    /// Set the checked flag of a bus or device column
    pub fn set_checked(
        &mut self,
        node: NodeId,
        column: Column,
        state: TriState,
    ) -> Result<(), TreeError> {
        if !column.is_checkable() {
            return Err(TreeError::InvalidChecked {
                node,
                reason: "column is not checkable",
            });
        }

        match self.kind(node)? {
            NodeKind::Root => Err(TreeError::InvalidChecked {
                node,
                reason: "the root is not checkable",
            }),
            NodeKind::Bus => self.set_bus_checked(node, column, state),
            NodeKind::Device => self.set_device_checked(node, column, state),
        }
    }

    fn set_bus_checked(
        &mut self,
        bus_id: NodeId,
        column: Column,
        state: TriState,
    ) -> Result<(), TreeError> {
        if state == TriState::Partial {
            return Err(TreeError::InvalidChecked {
                node: bus_id,
                reason: "partial cannot be requested on a bus",
            });
        }

        let bus = self.bus_mut(bus_id)?;
        if bus.is_placeholder() {
            // Flags stay off; there is no channel to construct
            if state == TriState::On {
                return Err(TreeError::InvalidChecked {
                    node: bus_id,
                    reason: "an offline placeholder cannot be turned on",
                });
            }
            return Ok(());
        }

        if bus.checked(column) == state {
            return Ok(());
        }

        bus.set_flag(column, state);
        if column == Column::Transmit {
            bus.handle().set_transmit(state.is_on());
        }
        debug!("{} {:?} -> {:?}", bus.name(), column, state);
        self.event_buffer
            .push(TreeEvent::cell_changed(bus_id, column));

        let children = self.tree.children(bus_id).to_vec();
        let mut children_touched = false;
        for child in &children {
            if !self.device(*child)?.checked(column).is_selected() {
                continue;
            }
            let target = match (state, column) {
                (TriState::On, _) => TriState::On,
                (_, Column::Name) => TriState::Partial,
                // Transmit has no demotion
                _ => continue,
            };
            self.set_device_checked(*child, column, target)?;
            children_touched = true;
        }
        if let (true, Some(first), Some(last)) = (children_touched, children.first(), children.last())
        {
            self.event_buffer
                .push(TreeEvent::rows_changed(*first, *last));
        }

        if column == Column::Name {
            self.derive_channel(bus_id)?;
        }

        Ok(())
    }

    fn set_device_checked(
        &mut self,
        device_id: NodeId,
        column: Column,
        requested: TriState,
    ) -> Result<(), TreeError> {
        let no_parent = TreeError::InvalidChecked {
            node: device_id,
            reason: "device has no parent bus",
        };
        let Some(parent) = self.tree.parent(device_id) else {
            return Err(no_parent);
        };
        let (parent_flag, parent_online, link) = match &self.tree.node(parent)?.data {
            NodeData::Bus(bus) => (bus.checked(column), bus.checked(Column::Name), bus.link()),
            _ => return Err(no_parent),
        };

        let device = self.device_mut(device_id)?;
        let current = device.checked(column);
        let next = resolve_request(current, requested, parent_flag);
        if next == current {
            return Ok(());
        }

        device.set_flag(column, next);
        debug!("{} {:?} -> {:?}", device.name(), column, next);

        let online = device.effective_active(parent_online);
        let transmit = device.checked(Column::Transmit).is_on();
        let endpoint = device.endpoint_mut();
        endpoint.bus_status_changed(online, transmit);
        match column {
            Column::Name => endpoint.attach(online.then_some(link)),
            Column::Transmit => endpoint.set_transmit(transmit),
            Column::Bitrate => {}
        }

        self.event_buffer
            .push(TreeEvent::cell_changed(device_id, column));
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Bitrate
    // -------------------------------------------------------------------------

    /// Select a bus bitrate and reopen the channel at the new rate
    pub fn set_bitrate(&mut self, bus_id: NodeId, bitrate: u32) -> Result<(), TreeError> {
        let bus = self.bus_mut(bus_id)?;
        let bitrate = bus.family().check_bitrate(bitrate)?;
        bus.set_bitrate_unchecked(bitrate);
        info!("{} bitrate set to {}", bus.name(), bus.bitrate_label());

        self.event_buffer
            .push(TreeEvent::cell_changed(bus_id, Column::Bitrate));

        // A channel opened at the old rate is unusable; always reopen
        self.derive_channel(bus_id)
    }

    /// Select a bus bitrate by its display label
    pub fn set_bitrate_label(&mut self, bus_id: NodeId, label: &str) -> Result<(), TreeError> {
        let family = self.bus(bus_id)?.family();
        let bitrate = family
            .bitrate_for_label(label)
            .ok_or_else(|| TreeError::InvalidBitrate {
                requested: label.to_string(),
                legal: family.legal_bitrates(),
            })?;
        self.set_bitrate(bus_id, bitrate)
    }

    // -------------------------------------------------------------------------
    // Channel lifecycle
    // -------------------------------------------------------------------------

    /// Tear down the bus's live channel and reopen it if the bus is on
    ///
    /// In deferred mode at most one open is in flight per bus. A derivation
    /// that happens while one runs only bumps the generation; the open for
    /// the newest generation is queued once the running one completes and
    /// its channel has been closed.
    pub fn derive_channel(&mut self, bus_id: NodeId) -> Result<(), TreeError> {
        let bus = self.bus(bus_id)?;
        if bus.is_placeholder() {
            return Ok(());
        }

        let (generation, closed) = bus.handle().disconnect();
        let connect = bus.checked(Column::Name).is_on();
        let in_flight = bus.opening();
        let bus_name = bus.name().to_string();

        if closed {
            info!("Disconnected {}", bus_name);
            self.event_buffer
                .push(TreeEvent::ChannelDisconnected { bus: bus_id });
        }

        if !connect {
            return Ok(());
        }

        match self.config.open_mode {
            OpenMode::Inline => {
                let request = self.open_request(bus_id)?;
                let result = request.open_blocking();
                self.complete_open(request, result)
            }
            OpenMode::Deferred => match in_flight {
                Some(running) => {
                    debug!(
                        "{} still opening generation {}; generation {} follows",
                        bus_name, running, generation
                    );
                    Ok(())
                }
                None => self.queue_open(bus_id),
            },
        }
    }

    fn open_request(&self, bus_id: NodeId) -> Result<OpenRequest, TreeError> {
        let bus = self.bus(bus_id)?;
        let params = bus.params().cloned().ok_or(TreeError::InvalidChecked {
            node: bus_id,
            reason: "an offline placeholder has no channel",
        })?;
        let generation = bus.handle().generation();
        let family = bus.family();

        Ok(OpenRequest {
            bus: bus_id,
            generation,
            bus_name: bus.name().to_string(),
            family,
            params,
            bitrate: bus.bitrate(),
            factory: self.factories.get(family),
            notifier: OfflineNotifier::new(bus_id, generation, self.offline_tx.clone()),
            settle_delay: self.config.settle_delay(),
        })
    }

    fn queue_open(&mut self, bus_id: NodeId) -> Result<(), TreeError> {
        let request = self.open_request(bus_id)?;
        self.bus_mut(bus_id)?.set_opening(Some(request.generation));
        debug!(
            "Queued open of {} (generation {})",
            request.bus_name, request.generation
        );
        self.pending_opens.push(request);
        Ok(())
    }

    /// Queue an open for the current generation if the bus still wants one
    fn reopen_if_wanted(&mut self, bus_id: NodeId) -> Result<(), TreeError> {
        let bus = self.bus(bus_id)?;
        let wanted = self.config.open_mode == OpenMode::Deferred
            && !bus.is_placeholder()
            && bus.opening().is_none()
            && !bus.handle().is_live()
            && bus.checked(Column::Name).is_on();
        if !wanted {
            return Ok(());
        }
        self.queue_open(bus_id)
    }

    /// Take the queued open requests (deferred mode)
    pub fn take_pending_opens(&mut self) -> Vec<OpenRequest> {
        std::mem::take(&mut self.pending_opens)
    }

    /// Install the result of an open request
    ///
    /// A channel opened for a generation the bus has moved past is closed
    /// and discarded, and the open for the current generation is queued. A
    /// failure for the current generation is reported and leaves the bus
    /// flag on with no live channel; nothing retries it.
    pub fn complete_open(
        &mut self,
        request: OpenRequest,
        result: Result<Box<dyn LiveChannel>, ChannelError>,
    ) -> Result<(), TreeError> {
        let bus = match self.bus_mut(request.bus) {
            Ok(bus) => bus,
            Err(e) => {
                if let Ok(mut channel) = result {
                    channel.close();
                }
                return Err(e);
            }
        };
        if bus.opening() == Some(request.generation) {
            bus.set_opening(None);
        }
        let current = bus.handle().generation() == request.generation;

        match result {
            Ok(channel) => match bus.handle().connect(request.generation, channel) {
                Ok(()) => {
                    info!("Connected {} at {} bit/s", request.bus_name, request.bitrate);
                    self.event_buffer
                        .push(TreeEvent::ChannelConnected { bus: request.bus });
                    Ok(())
                }
                Err(mut stale) => {
                    debug!(
                        "Discarding channel for {} opened for stale generation {}",
                        request.bus_name, request.generation
                    );
                    stale.close();
                    self.reopen_if_wanted(request.bus)
                }
            },
            Err(source) if !current => {
                debug!(
                    "Ignoring open failure of {} for stale generation {}: {}",
                    request.bus_name, request.generation, source
                );
                self.reopen_if_wanted(request.bus)
            }
            Err(source) => {
                warn!("Failed to open {}: {}", request.bus_name, source);
                self.event_buffer.push(TreeEvent::ChannelOpenFailed {
                    bus: request.bus,
                    message: source.to_string(),
                });
                Err(TreeError::ChannelOpen {
                    bus: request.bus_name,
                    source,
                })
            }
        }
    }

    /// Take the receiving end of the went-offline queue
    ///
    /// The owner that takes it must feed every report to
    /// [`handle_offline_report`](Self::handle_offline_report).
    pub fn take_offline_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<OfflineReport>> {
        self.offline_rx.take()
    }

    /// Handle every queued went-offline report
    ///
    /// Returns the number of reports handled. Does nothing once the receiver
    /// has been taken.
    pub fn process_offline_reports(&mut self) -> usize {
        let mut reports = Vec::new();
        if let Some(rx) = self.offline_rx.as_mut() {
            while let Ok(report) = rx.try_recv() {
                reports.push(report);
            }
        }

        let count = reports.len();
        for report in reports {
            self.handle_offline_report(report);
        }
        count
    }

    /// Force a bus off after its live channel failed
    pub fn handle_offline_report(&mut self, report: OfflineReport) {
        let bus = match self.bus(report.bus) {
            Ok(bus) => bus,
            Err(e) => {
                warn!("Offline report for {}: {}", report.bus, e);
                return;
            }
        };

        if !bus.handle().went_offline(report.generation) {
            debug!(
                "Stale offline report for {} (generation {})",
                bus.name(),
                report.generation
            );
            return;
        }

        warn!("{} went offline: {}", bus.name(), report.reason);
        self.event_buffer.push(TreeEvent::WentOffline {
            bus: report.bus,
            reason: report.reason,
        });

        if let Err(e) = self.set_checked(report.bus, Column::Name, TriState::Off) {
            warn!("Failed to reset {} after going offline: {}", report.bus, e);
        }
    }

    // -------------------------------------------------------------------------
    // Structure
    // -------------------------------------------------------------------------

    /// Append a device for an endpoint as the last child of a bus
    pub fn add_device(
        &mut self,
        bus_id: NodeId,
        endpoint: Box<dyn Endpoint>,
    ) -> Result<NodeId, TreeError> {
        let bus_name = self.bus(bus_id)?.name().to_string();
        let row = self.tree.children(bus_id).len();

        let device = Device::new(endpoint);
        let name = device.name().to_string();
        let id = self.tree.append_child(bus_id, NodeData::Device(device))?;

        self.event_buffer.push(TreeEvent::RowsInserted {
            parent: bus_id,
            first: row,
            last: row,
        });
        self.event_buffer
            .push(TreeEvent::LayoutChanged { parent: bus_id });

        info!("Added device {} to {} (node {})", name, bus_name, id);
        Ok(id)
    }

    /// Remove a device and hand its endpoint back
    pub fn remove_device(&mut self, device_id: NodeId) -> Result<Box<dyn Endpoint>, TreeError> {
        self.device(device_id)?;
        let (Some(bus_id), Some(row)) = (self.tree.parent(device_id), self.tree.row(device_id))
        else {
            return Err(TreeError::InvalidChecked {
                node: device_id,
                reason: "device has no parent bus",
            });
        };

        let NodeData::Device(mut device) = self.tree.remove_child(bus_id, row)? else {
            return Err(TreeError::WrongNodeKind {
                node: device_id,
                expected: "device",
            });
        };
        device.endpoint_mut().attach(None);

        self.event_buffer.push(TreeEvent::RowsRemoved {
            parent: bus_id,
            first: row,
            last: row,
        });
        self.event_buffer
            .push(TreeEvent::LayoutChanged { parent: bus_id });
        self.event_buffer.push(TreeEvent::Reset);
        self.event_buffer.push(TreeEvent::DeviceRemoved {
            endpoint: device.endpoint_id(),
        });

        info!("Removed device {} (node {})", device.name(), device_id);
        Ok(device.into_endpoint())
    }
}

impl fmt::Debug for BusTreeModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusTreeModel")
            .field("config", &self.config)
            .field("factories", &self.factories)
            .field("nodes", &self.tree.len())
            .field("pending_opens", &self.pending_opens.len())
            .field("pending_events", &self.event_buffer.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelLink;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FactoryLog {
        opens: Vec<(InterfaceParams, u32)>,
        notifiers: Vec<OfflineNotifier>,
        fail_next: bool,
        closed: usize,
    }

    struct TestFactory {
        log: Arc<Mutex<FactoryLog>>,
    }

    struct TestChannel {
        log: Arc<Mutex<FactoryLog>>,
    }

    impl LiveChannel for TestChannel {
        fn send(&mut self, _payload: &[u8]) -> Result<(), ChannelError> {
            Ok(())
        }

        fn close(&mut self) {
            self.log.lock().unwrap().closed += 1;
        }
    }

    impl ChannelFactory for TestFactory {
        fn family(&self) -> BusFamily {
            BusFamily::Can
        }

        fn open(
            &self,
            params: &InterfaceParams,
            bitrate: u32,
            notifier: OfflineNotifier,
        ) -> Result<Box<dyn LiveChannel>, ChannelError> {
            let mut log = self.log.lock().unwrap();
            if log.fail_next {
                log.fail_next = false;
                return Err(ChannelError::OpenFailed {
                    interface: params.unique(),
                    reason: "no such device".to_string(),
                });
            }
            log.opens.push((params.clone(), bitrate));
            log.notifiers.push(notifier);
            Ok(Box::new(TestChannel {
                log: Arc::clone(&self.log),
            }))
        }
    }

    #[derive(Debug, Default)]
    struct EndpointLog {
        online: bool,
        transmit: bool,
        attached: bool,
        status_calls: usize,
    }

    struct TestEndpoint {
        id: u32,
        log: Arc<Mutex<EndpointLog>>,
    }

    impl Endpoint for TestEndpoint {
        fn id(&self) -> EndpointId {
            EndpointId(self.id)
        }

        fn name(&self) -> String {
            format!("inverter {}", self.id)
        }

        fn bus_status_changed(&mut self, online: bool, transmit: bool) {
            let mut log = self.log.lock().unwrap();
            log.online = online;
            log.transmit = transmit;
            log.status_calls += 1;
        }

        fn attach(&mut self, link: Option<ChannelLink>) {
            self.log.lock().unwrap().attached = link.is_some();
        }

        fn set_transmit(&mut self, transmit: bool) {
            self.log.lock().unwrap().transmit = transmit;
        }
    }

    fn config(open_mode: OpenMode) -> TreeConfig {
        TreeConfig {
            settle_delay_ms: 0,
            open_mode,
        }
    }

    fn model_with(open_mode: OpenMode) -> (BusTreeModel, Arc<Mutex<FactoryLog>>, NodeId) {
        let log = Arc::new(Mutex::new(FactoryLog::default()));
        let factories = ChannelFactories::new().with(Arc::new(TestFactory {
            log: Arc::clone(&log),
        }));
        let model = BusTreeModel::new(
            config(open_mode),
            factories,
            vec![BusRecord::new(InterfaceParams::can("socketcan", "can0"))],
        );
        let bus = model.find_bus("socketcan - can0").unwrap();
        (model, log, bus)
    }

    fn model() -> (BusTreeModel, Arc<Mutex<FactoryLog>>, NodeId) {
        model_with(OpenMode::Inline)
    }

    fn endpoint(id: u32) -> (Box<dyn Endpoint>, Arc<Mutex<EndpointLog>>) {
        let log = Arc::new(Mutex::new(EndpointLog::default()));
        let endpoint = TestEndpoint {
            id,
            log: Arc::clone(&log),
        };
        (Box::new(endpoint), log)
    }

    #[test]
    fn test_placeholders_come_first() {
        let (model, _, bus) = model();
        let buses = model.buses();
        assert_eq!(buses.len(), 3);
        assert_eq!(model.bus(buses[0]).unwrap().name(), "Offline (CAN)");
        assert_eq!(model.bus(buses[1]).unwrap().name(), "Offline (SunSpec)");
        assert_eq!(buses[2], bus);
        assert_eq!(model.placeholder(BusFamily::SunSpec), Some(buses[1]));
    }

    #[test]
    fn test_placeholder_never_goes_online() {
        let (mut model, log, _) = model();
        let placeholder = model.placeholder(BusFamily::Can).unwrap();

        let err = model
            .set_checked(placeholder, Column::Name, TriState::On)
            .unwrap_err();
        assert!(matches!(err, TreeError::InvalidChecked { .. }));
        assert_eq!(
            model.checked(placeholder, Column::Name).unwrap(),
            TriState::Off
        );
        assert!(log.lock().unwrap().opens.is_empty());
        assert!(model.drain_events().is_empty());
    }

    #[test]
    fn test_bus_on_opens_channel() {
        let (mut model, log, bus) = model();
        model.set_checked(bus, Column::Name, TriState::On).unwrap();

        assert!(model.bus(bus).unwrap().handle().is_live());
        assert_eq!(
            log.lock().unwrap().opens,
            vec![(InterfaceParams::can("socketcan", "can0"), 500_000)]
        );

        let events = model.drain_events();
        assert_eq!(events[0], TreeEvent::cell_changed(bus, Column::Name));
        assert!(events.contains(&TreeEvent::ChannelConnected { bus }));

        model.set_checked(bus, Column::Name, TriState::Off).unwrap();
        assert!(!model.bus(bus).unwrap().handle().is_live());
        assert_eq!(log.lock().unwrap().closed, 1);
        assert!(model
            .drain_events()
            .contains(&TreeEvent::ChannelDisconnected { bus }));
    }

    #[test]
    fn test_repeated_set_is_idempotent() {
        let (mut model, log, bus) = model();
        model.set_checked(bus, Column::Name, TriState::On).unwrap();
        model.drain_events();

        model.set_checked(bus, Column::Name, TriState::On).unwrap();
        assert!(model.drain_events().is_empty());
        assert_eq!(log.lock().unwrap().opens.len(), 1);
        assert_eq!(log.lock().unwrap().closed, 0);
    }

    #[test]
    fn test_partial_on_bus_is_rejected() {
        let (mut model, _, bus) = model();
        let err = model
            .set_checked(bus, Column::Name, TriState::Partial)
            .unwrap_err();
        assert!(matches!(err, TreeError::InvalidChecked { .. }));

        let err = model
            .set_checked(bus, Column::Bitrate, TriState::On)
            .unwrap_err();
        assert!(matches!(err, TreeError::InvalidChecked { .. }));

        let root = model.root();
        assert!(model.set_checked(root, Column::Name, TriState::On).is_err());
    }

    #[test]
    fn test_demotion_survives_offline_cycle() {
        let (mut model, _, bus) = model();
        model.set_checked(bus, Column::Name, TriState::On).unwrap();
        let (ep, ep_log) = endpoint(1);
        let device = model.add_device(bus, ep).unwrap();

        model.set_checked(device, Column::Name, TriState::On).unwrap();
        assert_eq!(model.checked(device, Column::Name).unwrap(), TriState::On);
        assert!(model.effective_active(device).unwrap());
        assert!(ep_log.lock().unwrap().attached);

        model.set_checked(bus, Column::Name, TriState::Off).unwrap();
        assert_eq!(
            model.checked(device, Column::Name).unwrap(),
            TriState::Partial
        );
        assert!(!model.effective_active(device).unwrap());
        assert!(!ep_log.lock().unwrap().online);
        assert!(!ep_log.lock().unwrap().attached);

        model.set_checked(bus, Column::Name, TriState::On).unwrap();
        assert_eq!(model.checked(device, Column::Name).unwrap(), TriState::On);
        assert!(ep_log.lock().unwrap().online);
        assert!(ep_log.lock().unwrap().attached);
    }

    #[test]
    fn test_explicitly_off_device_stays_off() {
        let (mut model, _, bus) = model();
        let (ep, _) = endpoint(1);
        let device = model.add_device(bus, ep).unwrap();

        model.set_checked(bus, Column::Name, TriState::On).unwrap();
        assert_eq!(model.checked(device, Column::Name).unwrap(), TriState::Off);
    }

    #[test]
    fn test_device_toggles_while_bus_offline() {
        let (mut model, _, bus) = model();
        let (ep, ep_log) = endpoint(1);
        let device = model.add_device(bus, ep).unwrap();

        model.set_checked(device, Column::Name, TriState::On).unwrap();
        assert_eq!(
            model.checked(device, Column::Name).unwrap(),
            TriState::Partial
        );
        assert!(!ep_log.lock().unwrap().online);

        model.set_checked(device, Column::Name, TriState::On).unwrap();
        assert_eq!(model.checked(device, Column::Name).unwrap(), TriState::Off);

        // Queued intent is honoured once the bus comes up
        model.set_checked(device, Column::Name, TriState::On).unwrap();
        model.set_checked(bus, Column::Name, TriState::On).unwrap();
        assert_eq!(model.checked(device, Column::Name).unwrap(), TriState::On);
    }

    #[test]
    fn test_set_bitrate_reopens() {
        let (mut model, log, bus) = model();
        model.set_checked(bus, Column::Name, TriState::On).unwrap();

        model.set_bitrate(bus, 250_000).unwrap();
        assert_eq!(model.bus(bus).unwrap().bitrate(), 250_000);
        assert_eq!(model.data(bus, Column::Bitrate).unwrap(), "250 kBit/s");
        {
            let log = log.lock().unwrap();
            assert_eq!(log.opens.len(), 2);
            assert_eq!(log.opens[1].1, 250_000);
            assert_eq!(log.closed, 1);
        }

        let err = model.set_bitrate(bus, 999).unwrap_err();
        assert!(matches!(err, TreeError::InvalidBitrate { .. }));
        assert_eq!(model.bus(bus).unwrap().bitrate(), 250_000);
        assert_eq!(log.lock().unwrap().opens.len(), 2);
    }

    #[test]
    fn test_set_bitrate_by_label() {
        let (mut model, _, bus) = model();
        model.set_bitrate_label(bus, "125 kBit/s").unwrap();
        assert_eq!(model.bus(bus).unwrap().bitrate(), 125_000);

        assert!(model.set_bitrate_label(bus, "9600 Bit/s").is_err());
        assert_eq!(
            model.bitrate_choices(bus).unwrap(),
            vec!["1 MBit/s", "500 kBit/s", "250 kBit/s", "125 kBit/s"]
        );
    }

    #[test]
    fn test_set_bitrate_on_device_is_rejected() {
        let (mut model, _, bus) = model();
        let (ep, _) = endpoint(1);
        let device = model.add_device(bus, ep).unwrap();
        assert!(matches!(
            model.set_bitrate(device, 500_000),
            Err(TreeError::WrongNodeKind { .. })
        ));
    }

    #[test]
    fn test_offline_report_forces_bus_off() {
        let (mut model, log, bus) = model();
        model.set_checked(bus, Column::Name, TriState::On).unwrap();
        let (ep, _) = endpoint(1);
        let device = model.add_device(bus, ep).unwrap();
        model.set_checked(device, Column::Name, TriState::On).unwrap();
        model.drain_events();

        let notifier = log.lock().unwrap().notifiers[0].clone();
        assert!(notifier.report("bus error"));
        assert_eq!(model.process_offline_reports(), 1);

        assert_eq!(model.checked(bus, Column::Name).unwrap(), TriState::Off);
        assert_eq!(
            model.checked(device, Column::Name).unwrap(),
            TriState::Partial
        );
        assert!(!model.effective_active(device).unwrap());
        assert!(!model.bus(bus).unwrap().handle().is_live());

        let events = model.drain_events();
        assert!(events.contains(&TreeEvent::WentOffline {
            bus,
            reason: "bus error".to_string()
        }));
        assert!(events.contains(&TreeEvent::cell_changed(bus, Column::Name)));
    }

    #[test]
    fn test_stale_offline_report_is_ignored() {
        let (mut model, log, bus) = model();
        model.set_checked(bus, Column::Name, TriState::On).unwrap();
        let old = log.lock().unwrap().notifiers[0].clone();

        // Reopen at a new rate; the old channel's report is stale
        model.set_bitrate(bus, 125_000).unwrap();
        model.drain_events();
        old.report("late failure from closed channel");
        model.process_offline_reports();

        assert_eq!(model.checked(bus, Column::Name).unwrap(), TriState::On);
        assert!(model.bus(bus).unwrap().handle().is_live());
        assert!(model.drain_events().is_empty());
    }

    #[test]
    fn test_open_failure_leaves_flag_on() {
        let (mut model, log, bus) = model();
        log.lock().unwrap().fail_next = true;

        let err = model.set_checked(bus, Column::Name, TriState::On).unwrap_err();
        assert!(matches!(err, TreeError::ChannelOpen { .. }));
        assert_eq!(model.checked(bus, Column::Name).unwrap(), TriState::On);
        assert!(!model.bus(bus).unwrap().handle().is_live());
        assert!(model
            .drain_events()
            .iter()
            .any(|e| matches!(e, TreeEvent::ChannelOpenFailed { .. })));

        // Nothing retries; the caller turns it off and on again
        model.set_checked(bus, Column::Name, TriState::Off).unwrap();
        model.set_checked(bus, Column::Name, TriState::On).unwrap();
        assert!(model.bus(bus).unwrap().handle().is_live());
    }

    #[test]
    fn test_missing_factory_is_open_failure() {
        let mut model = BusTreeModel::new(
            config(OpenMode::Inline),
            ChannelFactories::new(),
            vec![BusRecord::new(InterfaceParams::serial("/dev/ttyUSB0"))],
        );
        let bus = model.find_bus("/dev/ttyUSB0").unwrap();
        let err = model.set_checked(bus, Column::Name, TriState::On).unwrap_err();
        assert!(matches!(
            err,
            TreeError::ChannelOpen {
                source: ChannelError::NoFactory(_),
                ..
            }
        ));
    }

    #[test]
    fn test_deferred_open_and_stale_completion() {
        let (mut model, log, bus) = model_with(OpenMode::Deferred);
        model.set_checked(bus, Column::Name, TriState::On).unwrap();
        assert!(!model.bus(bus).unwrap().handle().is_live());

        let mut requests = model.take_pending_opens();
        assert_eq!(requests.len(), 1);
        let first = requests.remove(0);
        assert_eq!(model.bus(bus).unwrap().opening(), Some(first.generation()));

        // Re-derive while the first open is in flight; nothing new is queued
        model.set_bitrate(bus, 1_000_000).unwrap();
        assert!(model.take_pending_opens().is_empty());

        let result = first.open_blocking();
        model.complete_open(first, result).unwrap();
        assert!(!model.bus(bus).unwrap().handle().is_live());
        assert_eq!(log.lock().unwrap().closed, 1);

        // The stale channel is closed before the newest generation opens
        let second = model.take_pending_opens().remove(0);
        assert_eq!(second.bitrate(), 1_000_000);
        let result = second.open_blocking();
        model.complete_open(second, result).unwrap();
        assert!(model.bus(bus).unwrap().handle().is_live());
        assert_eq!(model.bus(bus).unwrap().opening(), None);
        assert!(model.take_pending_opens().is_empty());
    }

    #[test]
    fn test_stale_completion_after_bus_off_opens_nothing() {
        let (mut model, log, bus) = model_with(OpenMode::Deferred);
        model.set_checked(bus, Column::Name, TriState::On).unwrap();
        let first = model.take_pending_opens().remove(0);

        model.set_checked(bus, Column::Name, TriState::Off).unwrap();
        let result = first.open_blocking();
        model.complete_open(first, result).unwrap();

        assert!(model.take_pending_opens().is_empty());
        assert!(!model.bus(bus).unwrap().handle().is_live());
        assert_eq!(model.bus(bus).unwrap().opening(), None);
        assert_eq!(log.lock().unwrap().closed, 1);
    }

    #[test]
    fn test_stale_failure_reopens_current_generation() {
        let (mut model, log, bus) = model_with(OpenMode::Deferred);
        model.set_checked(bus, Column::Name, TriState::On).unwrap();
        let first = model.take_pending_opens().remove(0);
        model.set_bitrate(bus, 250_000).unwrap();

        log.lock().unwrap().fail_next = true;
        let result = first.open_blocking();
        model.complete_open(first, result).unwrap();
        assert!(!model
            .drain_events()
            .iter()
            .any(|e| matches!(e, TreeEvent::ChannelOpenFailed { .. })));

        let second = model.take_pending_opens().remove(0);
        let result = second.open_blocking();
        model.complete_open(second, result).unwrap();
        assert!(model.bus(bus).unwrap().handle().is_live());
        assert_eq!(log.lock().unwrap().opens[0].1, 250_000);
    }

    #[test]
    fn test_add_device_notifies_row_first() {
        let (mut model, _, bus) = model();
        model.drain_events();
        let (ep, ep_log) = endpoint(7);
        let device = model.add_device(bus, ep).unwrap();

        let events = model.drain_events();
        assert_eq!(
            events[0],
            TreeEvent::RowsInserted {
                parent: bus,
                first: 0,
                last: 0
            }
        );
        assert_eq!(events[1], TreeEvent::LayoutChanged { parent: bus });
        assert_eq!(model.devices(bus), &[device]);
        assert_eq!(model.data(device, Column::Name).unwrap(), "inverter 7");
        assert_eq!(model.find_device(EndpointId(7)), Some(device));
        assert_eq!(ep_log.lock().unwrap().status_calls, 1);

        let (ep, _) = endpoint(8);
        model.add_device(bus, ep).unwrap();
        assert!(matches!(
            model.drain_events()[0],
            TreeEvent::RowsInserted { first: 1, last: 1, .. }
        ));
    }

    #[test]
    fn test_remove_device_emits_device_removed_once() {
        let (mut model, _, bus) = model();
        model.set_checked(bus, Column::Name, TriState::On).unwrap();
        let (ep, ep_log) = endpoint(3);
        let device = model.add_device(bus, ep).unwrap();
        model.set_checked(device, Column::Name, TriState::On).unwrap();
        model.drain_events();

        let endpoint = model.remove_device(device).unwrap();
        assert_eq!(endpoint.id(), EndpointId(3));
        assert!(model.devices(bus).is_empty());
        assert!(!ep_log.lock().unwrap().attached);

        let events = model.drain_events();
        let removed: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, TreeEvent::DeviceRemoved { .. }))
            .collect();
        assert_eq!(
            removed,
            vec![&TreeEvent::DeviceRemoved {
                endpoint: EndpointId(3)
            }]
        );
        assert!(events.contains(&TreeEvent::Reset));

        assert!(matches!(
            model.remove_device(device),
            Err(TreeError::UnknownNode(_))
        ));
    }

    #[test]
    fn test_transmit_column() {
        let (mut model, _, bus) = model();
        model.set_checked(bus, Column::Name, TriState::On).unwrap();
        let (ep, ep_log) = endpoint(1);
        let device = model.add_device(bus, ep).unwrap();

        model
            .set_checked(device, Column::Transmit, TriState::On)
            .unwrap();
        assert_eq!(
            model.checked(device, Column::Transmit).unwrap(),
            TriState::Partial
        );

        model.set_checked(bus, Column::Transmit, TriState::On).unwrap();
        assert!(model.bus(bus).unwrap().handle().transmit());
        assert_eq!(
            model.checked(device, Column::Transmit).unwrap(),
            TriState::On
        );
        assert!(ep_log.lock().unwrap().transmit);

        // No demotion for transmit
        model
            .set_checked(bus, Column::Transmit, TriState::Off)
            .unwrap();
        assert!(!model.bus(bus).unwrap().handle().transmit());
        assert_eq!(
            model.checked(device, Column::Transmit).unwrap(),
            TriState::On
        );
    }

    #[test]
    fn test_snapshot_reflects_state() {
        let (mut model, _, bus) = model();
        model.set_checked(bus, Column::Name, TriState::On).unwrap();
        let (ep, _) = endpoint(4);
        let device = model.add_device(bus, ep).unwrap();
        model.set_checked(device, Column::Name, TriState::On).unwrap();

        let snapshot = model.snapshot();
        assert_eq!(snapshot.buses.len(), 3);
        assert_eq!(snapshot.live_count(), 1);
        let row = snapshot.bus(bus).unwrap();
        assert_eq!(row.connected, TriState::On);
        assert_eq!(row.bitrate_label, "500 kBit/s");
        assert!(snapshot.device(device).unwrap().effective_active);
        assert!(snapshot.buses[0].placeholder);
        assert_eq!(snapshot.buses[0].params, None);
        assert_eq!(row.params, Some(InterfaceParams::can("socketcan", "can0")));
    }
}
