//! Virtual endpoint
//!
//! Records everything the tree forwards to a device's endpoint. The tree
//! owns the [`VirtualEndpoint`]; tests and the console keep the paired
//! [`EndpointMonitor`] to observe it and to send through its link.

use std::sync::{Arc, Mutex, MutexGuard};

use canopy_tree::{ChannelLink, Endpoint, EndpointId};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::SimError;

/// Observable state of a virtual endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointStatus {
    /// Last effective activity reported by the tree
    pub online: bool,
    /// Last transmit enable reported by the tree
    pub transmit: bool,
    /// Whether a bus link is attached
    pub attached: bool,
    /// Every `(online, transmit)` pair reported, in order
    pub history: Vec<(bool, bool)>,
}

#[derive(Default)]
struct Shared {
    status: EndpointStatus,
    link: Option<ChannelLink>,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A simulated endpoint, e.g. an inverter on a SunSpec bus
pub struct VirtualEndpoint {
    id: EndpointId,
    name: String,
    shared: Arc<Mutex<Shared>>,
}

impl VirtualEndpoint {
    /// Create an endpoint and the monitor that observes it
    pub fn new(id: u32, name: impl Into<String>) -> (Self, EndpointMonitor) {
        let shared = Arc::new(Mutex::new(Shared::default()));
        let name = name.into();
        let monitor = EndpointMonitor {
            name: name.clone(),
            shared: Arc::clone(&shared),
        };

        let endpoint = Self {
            id: EndpointId(id),
            name,
            shared,
        };
        (endpoint, monitor)
    }
}

impl Endpoint for VirtualEndpoint {
    fn id(&self) -> EndpointId {
        self.id
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    fn bus_status_changed(&mut self, online: bool, transmit: bool) {
        debug!("{}: online={} transmit={}", self.name, online, transmit);
        let mut shared = lock(&self.shared);
        shared.status.online = online;
        shared.status.transmit = transmit;
        shared.status.history.push((online, transmit));
    }

    fn attach(&mut self, link: Option<ChannelLink>) {
        let mut shared = lock(&self.shared);
        shared.status.attached = link.is_some();
        shared.link = link;
    }

    fn set_transmit(&mut self, transmit: bool) {
        lock(&self.shared).status.transmit = transmit;
    }
}

/// Observer half of a [`VirtualEndpoint`]
#[derive(Clone)]
pub struct EndpointMonitor {
    name: String,
    shared: Arc<Mutex<Shared>>,
}

impl EndpointMonitor {
    /// Copy of the current status
    pub fn status(&self) -> EndpointStatus {
        lock(&self.shared).status.clone()
    }

    /// Whether the tree last reported the endpoint online
    pub fn is_online(&self) -> bool {
        lock(&self.shared).status.online
    }

    /// Whether a bus link is attached
    pub fn is_attached(&self) -> bool {
        lock(&self.shared).status.attached
    }

    /// Send a payload through the attached bus link
    pub fn send(&self, payload: &[u8]) -> Result<(), SimError> {
        let link = lock(&self.shared)
            .link
            .clone()
            .ok_or_else(|| SimError::Detached(self.name.clone()))?;
        link.send(payload)?;
        Ok(())
    }
}
