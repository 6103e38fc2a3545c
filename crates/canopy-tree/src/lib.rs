//! Canopy Bus Tree
//!
//! This crate provides the selection tree behind a bus browser: a root with
//! one row per communication bus and, below each bus, one row per attached
//! device.
//!
//! # Architecture
//!
//! Each row carries tri-state checked flags for its `Name` (active) and
//! `Transmit` columns. The tree keeps them consistent:
//!
//! - **Bus on**: every device that is not explicitly off follows it on
//! - **Bus off**: selected devices are demoted to `Partial` and return when
//!   the bus comes back
//! - **Device on while its bus is off**: the device toggles between `Off`
//!   and `Partial`
//!
//! Every bus owns a [`ChannelHandle`]. The live channel inside it is
//! reconstructed from the bus's family, parameters and bitrate whenever the
//! bus is switched on or its bitrate changes. Asynchronous driver failures
//! are reported through an [`OfflineNotifier`] and force the bus off on the
//! owner's side.
//!
//! All changes are recorded as [`TreeEvent`]s. The [`actor`] module wraps
//! the model in a command-driven tokio task for use from async code.
//!
//! # Example
//!
//! ```rust,no_run
//! use canopy_tree::{
//!     BusRecord, BusTreeModel, ChannelFactories, Column, InterfaceParams, TreeConfig, TriState,
//! };
//!
//! let mut model = BusTreeModel::new(
//!     TreeConfig::default(),
//!     ChannelFactories::new(),
//!     vec![BusRecord::new(InterfaceParams::can("socketcan", "can0"))],
//! );
//!
//! if let Some(bus) = model.find_bus("socketcan - can0") {
//!     model.set_bitrate(bus, 250_000).ok();
//!     model.set_checked(bus, Column::Name, TriState::On).ok();
//! }
//! ```

pub mod actor;
pub mod bus;
pub mod channel;
pub mod column;
pub mod device;
pub mod error;
pub mod events;
pub mod family;
pub mod model;
pub mod serial;
pub mod snapshot;
pub mod tree;
pub mod tristate;

// Re-export actor types
pub use actor::{run_tree_actor, TreeCommand};

// Re-export node types
pub use bus::Bus;
pub use device::{resolve_request, Device, Endpoint, EndpointId};
pub use tree::{Node, NodeId, Tree};

// Re-export channel types
pub use channel::{
    ChannelFactory, ChannelHandle, ChannelLink, HandleStatus, LiveChannel, OfflineNotifier,
    OfflineReport,
};
pub use serial::{SerialChannel, SerialChannelFactory};

// Re-export event types
pub use events::TreeEvent;

// Re-export model types
pub use column::{Column, Columns};
pub use error::{ChannelError, TreeError};
pub use family::{BusFamily, BusRecord, InterfaceParams, PARAM_SEPARATOR};
pub use model::{
    BusTreeModel, ChannelFactories, NodeData, OpenMode, OpenRequest, TreeConfig,
    DEFAULT_SETTLE_DELAY_MS,
};
pub use snapshot::{BusRow, DeviceRow, TreeSnapshot};
pub use tristate::TriState;
