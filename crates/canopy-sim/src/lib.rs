//! Canopy Simulation Library
//!
//! This crate provides virtual hardware for exercising the bus tree without
//! CAN adapters or serial ports. It includes:
//!
//! - **VirtualChannelFactory**: a channel family that records opens and
//!   closes, broadcasts sent payloads and injects failures
//! - **VirtualEndpoint**: a device endpoint that records what the tree
//!   forwards to it
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use canopy_sim::VirtualChannelFactory;
//! use canopy_tree::{
//!     BusFamily, BusRecord, BusTreeModel, ChannelFactories, Column, InterfaceParams,
//!     TreeConfig, TriState,
//! };
//!
//! let can = Arc::new(VirtualChannelFactory::new(BusFamily::Can));
//! let params = InterfaceParams::can("socketcan", "vcan0");
//! let config = TreeConfig {
//!     settle_delay_ms: 0,
//!     ..TreeConfig::default()
//! };
//! let mut model = BusTreeModel::new(
//!     config,
//!     ChannelFactories::new().with(can.clone()),
//!     vec![BusRecord::new(params.clone())],
//! );
//!
//! let bus = model.find_bus("socketcan - vcan0").unwrap();
//! model.set_checked(bus, Column::Name, TriState::On).unwrap();
//! assert!(can.is_open(&params));
//! ```

pub mod channel;
pub mod endpoint;
pub mod error;

pub use channel::{OpenRecord, SentFrame, VirtualChannel, VirtualChannelFactory};
pub use endpoint::{EndpointMonitor, EndpointStatus, VirtualEndpoint};
pub use error::SimError;
