//! Virtual channel family
//!
//! A [`VirtualChannelFactory`] stands in for a bus driver. It records every
//! open and close, broadcasts every payload sent through its channels, and
//! lets tests inject open failures or kill an open channel the way an
//! unplugged adapter would.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use canopy_tree::{
    BusFamily, ChannelError, ChannelFactory, InterfaceParams, LiveChannel, OfflineNotifier,
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::error::SimError;

/// Capacity of the sent-frame broadcast
const FRAME_CAPACITY: usize = 256;

/// A payload sent through a virtual channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentFrame {
    /// Joined interface parameters
    pub interface: String,
    /// Bitrate the channel was opened at
    pub bitrate: u32,
    /// Raw payload
    pub payload: Vec<u8>,
}

/// One successful open
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenRecord {
    /// Joined interface parameters
    pub interface: String,
    /// Requested bitrate
    pub bitrate: u32,
}

struct OpenChannel {
    serial: u64,
    bitrate: u32,
    notifier: OfflineNotifier,
}

#[derive(Default)]
struct SimState {
    /// `None` means every interface of the family exists
    available: Option<HashSet<String>>,
    open: HashMap<String, OpenChannel>,
    opens: Vec<OpenRecord>,
    closes: usize,
    fail_next: Option<String>,
    next_serial: u64,
}

fn lock(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Channel factory backed by virtual hardware
#[derive(Clone)]
pub struct VirtualChannelFactory {
    family: BusFamily,
    state: Arc<Mutex<SimState>>,
    frames: broadcast::Sender<SentFrame>,
}

impl VirtualChannelFactory {
    /// Create a factory on which every interface of `family` exists
    pub fn new(family: BusFamily) -> Self {
        let (frames, _) = broadcast::channel(FRAME_CAPACITY);
        Self {
            family,
            state: Arc::new(Mutex::new(SimState::default())),
            frames,
        }
    }

    /// Create a factory on which only the given interfaces exist
    pub fn with_interfaces(
        family: BusFamily,
        interfaces: impl IntoIterator<Item = InterfaceParams>,
    ) -> Self {
        let factory = Self::new(family);
        lock(&factory.state).available =
            Some(interfaces.into_iter().map(|p| p.unique()).collect());
        factory
    }

    /// Make an interface exist
    pub fn plug(&self, params: &InterfaceParams) {
        if let Some(available) = lock(&self.state).available.as_mut() {
            available.insert(params.unique());
        }
    }

    /// Remove an interface, killing its open channel if any
    pub fn unplug(&self, params: &InterfaceParams) -> Result<(), SimError> {
        let interface = params.unique();
        let was_available = match lock(&self.state).available.as_mut() {
            Some(available) => available.remove(&interface),
            None => true,
        };

        match self.fail(params, "device unplugged") {
            Err(SimError::NotOpen(_)) if was_available => Ok(()),
            Err(SimError::NotOpen(_)) => Err(SimError::UnknownInterface(interface)),
            other => other,
        }
    }

    /// Kill the open channel on an interface and report it offline
    pub fn fail(&self, params: &InterfaceParams, reason: &str) -> Result<(), SimError> {
        let interface = params.unique();
        let channel = lock(&self.state)
            .open
            .remove(&interface)
            .ok_or_else(|| SimError::NotOpen(interface.clone()))?;

        info!("Virtual {} failed: {}", interface, reason);
        channel.notifier.report(reason);
        Ok(())
    }

    /// Make the next open fail with `reason`
    pub fn fail_next_open(&self, reason: impl Into<String>) {
        lock(&self.state).fail_next = Some(reason.into());
    }

    /// Subscribe to payloads sent through this factory's channels
    pub fn subscribe(&self) -> broadcast::Receiver<SentFrame> {
        self.frames.subscribe()
    }

    /// Check if an interface has an open channel
    pub fn is_open(&self, params: &InterfaceParams) -> bool {
        lock(&self.state).open.contains_key(&params.unique())
    }

    /// Bitrate of the open channel on an interface
    pub fn open_bitrate(&self, params: &InterfaceParams) -> Option<u32> {
        lock(&self.state)
            .open
            .get(&params.unique())
            .map(|c| c.bitrate)
    }

    /// Number of currently open channels
    pub fn open_count(&self) -> usize {
        lock(&self.state).open.len()
    }

    /// Every successful open so far
    pub fn opens(&self) -> Vec<OpenRecord> {
        lock(&self.state).opens.clone()
    }

    /// Number of channels closed by their owner
    pub fn close_count(&self) -> usize {
        lock(&self.state).closes
    }
}

impl ChannelFactory for VirtualChannelFactory {
    fn family(&self) -> BusFamily {
        self.family
    }

    fn open(
        &self,
        params: &InterfaceParams,
        bitrate: u32,
        notifier: OfflineNotifier,
    ) -> Result<Box<dyn LiveChannel>, ChannelError> {
        if params.family() != self.family {
            return Err(ChannelError::UnsupportedParams(params.unique()));
        }

        let interface = params.unique();
        let mut state = lock(&self.state);
        if let Some(reason) = state.fail_next.take() {
            return Err(ChannelError::OpenFailed { interface, reason });
        }
        if let Some(available) = &state.available {
            if !available.contains(&interface) {
                return Err(ChannelError::OpenFailed {
                    interface,
                    reason: "no such device".to_string(),
                });
            }
        }

        state.next_serial += 1;
        let serial = state.next_serial;
        state.open.insert(
            interface.clone(),
            OpenChannel {
                serial,
                bitrate,
                notifier,
            },
        );
        state.opens.push(OpenRecord {
            interface: interface.clone(),
            bitrate,
        });
        debug!("Virtual {} open at {} bit/s", interface, bitrate);

        Ok(Box::new(VirtualChannel {
            interface,
            bitrate,
            serial,
            state: Arc::clone(&self.state),
            frames: self.frames.clone(),
        }))
    }
}

impl fmt::Debug for VirtualChannelFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("VirtualChannelFactory")
            .field("family", &self.family)
            .field("open", &state.open.len())
            .field("opens", &state.opens.len())
            .field("closes", &state.closes)
            .finish()
    }
}

/// A live virtual channel
pub struct VirtualChannel {
    interface: String,
    bitrate: u32,
    serial: u64,
    state: Arc<Mutex<SimState>>,
    frames: broadcast::Sender<SentFrame>,
}

impl VirtualChannel {
    fn is_current(&self, state: &SimState) -> bool {
        state
            .open
            .get(&self.interface)
            .is_some_and(|c| c.serial == self.serial)
    }
}

impl LiveChannel for VirtualChannel {
    fn send(&mut self, payload: &[u8]) -> Result<(), ChannelError> {
        if !self.is_current(&lock(&self.state)) {
            return Err(ChannelError::NotConnected);
        }

        // No subscribers is fine
        let _ = self.frames.send(SentFrame {
            interface: self.interface.clone(),
            bitrate: self.bitrate,
            payload: payload.to_vec(),
        });
        Ok(())
    }

    fn close(&mut self) {
        let mut state = lock(&self.state);
        state.closes += 1;
        if self.is_current(&state) {
            state.open.remove(&self.interface);
        }
        debug!("Virtual {} closed", self.interface);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_tree::{NodeId, OfflineReport};
    use tokio::sync::mpsc;

    fn notifier() -> (OfflineNotifier, mpsc::UnboundedReceiver<OfflineReport>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (OfflineNotifier::new(NodeId(2), 1, tx), rx)
    }

    #[test]
    fn test_open_and_close_accounting() {
        let factory = VirtualChannelFactory::new(BusFamily::Can);
        let params = InterfaceParams::can("socketcan", "vcan0");
        let (n, _rx) = notifier();

        let mut channel = factory.open(&params, 250_000, n).unwrap();
        assert!(factory.is_open(&params));
        assert_eq!(factory.open_bitrate(&params), Some(250_000));
        assert_eq!(
            factory.opens(),
            vec![OpenRecord {
                interface: "socketcan - vcan0".to_string(),
                bitrate: 250_000
            }]
        );

        channel.close();
        assert!(!factory.is_open(&params));
        assert_eq!(factory.close_count(), 1);
    }

    #[test]
    fn test_restricted_interfaces() {
        let present = InterfaceParams::can("socketcan", "vcan0");
        let factory = VirtualChannelFactory::with_interfaces(BusFamily::Can, [present.clone()]);
        let (n, _rx) = notifier();
        assert!(factory
            .open(&InterfaceParams::can("socketcan", "vcan1"), 500_000, n.clone())
            .is_err());
        assert!(factory.open(&present, 500_000, n.clone()).is_ok());

        assert!(factory
            .open(&InterfaceParams::serial("/dev/ttyUSB0"), 9600, n)
            .is_err());
    }

    #[test]
    fn test_fail_next_open() {
        let factory = VirtualChannelFactory::new(BusFamily::SunSpec);
        let params = InterfaceParams::serial("/dev/ttyUSB0");
        factory.fail_next_open("permission denied");

        let (n, _rx) = notifier();
        let err = factory.open(&params, 9600, n.clone()).err().unwrap();
        assert!(err.to_string().contains("permission denied"));
        assert!(factory.open(&params, 9600, n).is_ok());
    }

    #[test]
    fn test_unplug_reports_offline() {
        let params = InterfaceParams::can("pcan", "PCAN_USBBUS1");
        let factory = VirtualChannelFactory::with_interfaces(BusFamily::Can, [params.clone()]);
        let (n, mut rx) = notifier();
        let mut channel = factory.open(&params, 500_000, n).unwrap();

        factory.unplug(&params).unwrap();
        let report = rx.try_recv().unwrap();
        assert_eq!(report.reason, "device unplugged");
        assert!(matches!(channel.send(b"x"), Err(ChannelError::NotConnected)));

        let (n, _rx) = notifier();
        assert!(factory.open(&params, 500_000, n).is_err());
        assert!(matches!(
            factory.unplug(&params),
            Err(SimError::UnknownInterface(_))
        ));
    }

    #[test]
    fn test_stale_close_keeps_newer_channel() {
        let factory = VirtualChannelFactory::new(BusFamily::Can);
        let params = InterfaceParams::can("socketcan", "vcan0");
        let (n, _rx) = notifier();

        let mut old = factory.open(&params, 500_000, n.clone()).unwrap();
        let _new = factory.open(&params, 125_000, n).unwrap();
        old.close();

        assert!(factory.is_open(&params));
        assert_eq!(factory.open_bitrate(&params), Some(125_000));
    }

    #[test]
    fn test_frames_are_broadcast() {
        let factory = VirtualChannelFactory::new(BusFamily::Can);
        let params = InterfaceParams::can("socketcan", "vcan3");
        let mut frames = factory.subscribe();
        let (n, _rx) = notifier();

        let mut channel = factory.open(&params, 1_000_000, n).unwrap();
        channel.send(&[0xde, 0xad]).unwrap();

        let frame = frames.try_recv().unwrap();
        assert_eq!(frame.interface, "socketcan - vcan3");
        assert_eq!(frame.bitrate, 1_000_000);
        assert_eq!(frame.payload, vec![0xde, 0xad]);
    }
}
