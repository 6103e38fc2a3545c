//! Channel handles and the live channels they own
//!
//! A bus owns exactly one [`ChannelHandle`] for its whole lifetime. The live
//! channel inside the handle is swapped whenever the bus's checked state or
//! bitrate changes. Endpoints never see the live channel directly; they hold
//! a [`ChannelLink`] to the handle, so the link stays valid across
//! reconnects.
//!
//! # Went-offline reports
//!
//! Family factories receive an [`OfflineNotifier`] when they open a channel.
//! Driver threads and reader tasks call [`OfflineNotifier::report`] when the
//! hardware goes away. The report only enqueues a message; the tree's owner
//! drains the queue and forces the bus off through the normal checked-state
//! path.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::ChannelError;
use crate::family::{BusFamily, InterfaceParams};
use crate::tree::NodeId;

/// A live, open channel
pub trait LiveChannel: Send {
    /// Write an opaque payload to the channel
    fn send(&mut self, payload: &[u8]) -> Result<(), ChannelError>;

    /// Close the channel and release the hardware
    ///
    /// Called exactly once by the handle. A closed channel must not report
    /// failure afterwards.
    fn close(&mut self);
}

/// Opens live channels for one bus family
pub trait ChannelFactory: Send + Sync {
    /// Family this factory serves
    fn family(&self) -> BusFamily;

    /// Open a live channel
    ///
    /// May block while the hardware opens. Failures of the channel after a
    /// successful open are reported through `notifier`.
    fn open(
        &self,
        params: &InterfaceParams,
        bitrate: u32,
        notifier: OfflineNotifier,
    ) -> Result<Box<dyn LiveChannel>, ChannelError>;
}

/// Asynchronous failure report from a live channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfflineReport {
    /// Bus whose channel failed
    pub bus: NodeId,
    /// Handle generation the failed channel was opened for
    pub generation: u64,
    /// Driver message
    pub reason: String,
}

/// Sender half of the went-offline queue, bound to one opened channel
#[derive(Clone)]
pub struct OfflineNotifier {
    bus: NodeId,
    generation: u64,
    tx: mpsc::UnboundedSender<OfflineReport>,
}

impl OfflineNotifier {
    /// Create a notifier for one opened channel
    pub fn new(bus: NodeId, generation: u64, tx: mpsc::UnboundedSender<OfflineReport>) -> Self {
        Self { bus, generation, tx }
    }

    /// Bus the notifier reports for
    pub fn bus(&self) -> NodeId {
        self.bus
    }

    /// Handle generation the notifier reports for
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Report that the channel went offline
    ///
    /// Safe to call from any thread. Returns false if the tree has been
    /// dropped.
    pub fn report(&self, reason: impl Into<String>) -> bool {
        self.tx
            .send(OfflineReport {
                bus: self.bus,
                generation: self.generation,
                reason: reason.into(),
            })
            .is_ok()
    }
}

impl fmt::Debug for OfflineNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OfflineNotifier")
            .field("bus", &self.bus)
            .field("generation", &self.generation)
            .field("tx", &"<sender>")
            .finish()
    }
}

/// Whether a handle currently holds a live channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandleStatus {
    /// No live channel
    Empty,
    /// A live channel is installed
    Live,
}

struct HandleState {
    live: Option<Box<dyn LiveChannel>>,
    transmit: bool,
    generation: u64,
}

fn lock(state: &Mutex<HandleState>) -> MutexGuard<'_, HandleState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Stable proxy around the bus's current live channel
pub struct ChannelHandle {
    state: Arc<Mutex<HandleState>>,
}

impl ChannelHandle {
    /// Create an empty handle
    pub fn new(transmit: bool) -> Self {
        Self {
            state: Arc::new(Mutex::new(HandleState {
                live: None,
                transmit,
                generation: 0,
            })),
        }
    }

    /// Current status
    pub fn status(&self) -> HandleStatus {
        if lock(&self.state).live.is_some() {
            HandleStatus::Live
        } else {
            HandleStatus::Empty
        }
    }

    /// Check if a live channel is installed
    pub fn is_live(&self) -> bool {
        self.status() == HandleStatus::Live
    }

    /// Current generation
    ///
    /// Bumped on every disconnect, so a channel opened for an older
    /// generation can be recognised as stale.
    pub fn generation(&self) -> u64 {
        lock(&self.state).generation
    }

    /// Whether transmit is enabled
    pub fn transmit(&self) -> bool {
        lock(&self.state).transmit
    }

    /// Enable or disable transmit
    pub fn set_transmit(&self, transmit: bool) {
        lock(&self.state).transmit = transmit;
    }

    /// Close and discard the live channel and start a new generation
    ///
    /// Returns the new generation and whether a channel was closed.
    pub fn disconnect(&self) -> (u64, bool) {
        let mut state = lock(&self.state);
        state.generation += 1;
        let closed = match state.live.take() {
            Some(mut channel) => {
                channel.close();
                true
            }
            None => false,
        };
        (state.generation, closed)
    }

    /// Install a freshly opened channel
    ///
    /// The channel is handed back if the handle has moved on to another
    /// generation or already holds a channel.
    pub fn connect(
        &self,
        generation: u64,
        channel: Box<dyn LiveChannel>,
    ) -> Result<(), Box<dyn LiveChannel>> {
        let mut state = lock(&self.state);
        if state.generation != generation || state.live.is_some() {
            return Err(channel);
        }
        state.live = Some(channel);
        Ok(())
    }

    /// Drop the live channel after a failure report
    ///
    /// Returns true if the report belongs to the current generation, even
    /// when the channel has not been installed yet (the reader may fail
    /// before the open completes). Reports for an older generation leave
    /// the handle untouched.
    pub fn went_offline(&self, generation: u64) -> bool {
        let mut state = lock(&self.state);
        if state.generation != generation {
            debug!(
                "ignoring offline report for generation {} (current {})",
                generation, state.generation
            );
            return false;
        }
        if let Some(mut channel) = state.live.take() {
            channel.close();
        }
        true
    }

    /// Get a link endpoints can send through
    pub fn link(&self) -> ChannelLink {
        ChannelLink {
            state: Arc::clone(&self.state),
        }
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        if let Some(mut channel) = lock(&self.state).live.take() {
            channel.close();
        }
    }
}

impl fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("ChannelHandle")
            .field("live", &state.live.is_some())
            .field("transmit", &state.transmit)
            .field("generation", &state.generation)
            .finish()
    }
}

/// Cloneable reference to a bus's channel handle
#[derive(Clone)]
pub struct ChannelLink {
    state: Arc<Mutex<HandleState>>,
}

impl ChannelLink {
    /// Check if the bus currently has a live channel
    pub fn is_live(&self) -> bool {
        lock(&self.state).live.is_some()
    }

    /// Send a payload through the bus's live channel
    pub fn send(&self, payload: &[u8]) -> Result<(), ChannelError> {
        let mut state = lock(&self.state);
        if !state.transmit {
            return Err(ChannelError::TransmitDisabled);
        }
        match state.live.as_mut() {
            Some(channel) => channel.send(payload),
            None => Err(ChannelError::NotConnected),
        }
    }

    /// Check if two links point at the same handle
    pub fn same_handle(&self, other: &ChannelLink) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

impl fmt::Debug for ChannelLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelLink")
            .field("live", &self.is_live())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingChannel {
        sent: Arc<AtomicUsize>,
        closed: Arc<AtomicUsize>,
    }

    impl LiveChannel for CountingChannel {
        fn send(&mut self, _payload: &[u8]) -> Result<(), ChannelError> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn close(&mut self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn channel() -> (Box<dyn LiveChannel>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let sent = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicUsize::new(0));
        let ch = CountingChannel {
            sent: Arc::clone(&sent),
            closed: Arc::clone(&closed),
        };
        (Box::new(ch), sent, closed)
    }

    #[test]
    fn test_connect_disconnect_cycle() {
        let handle = ChannelHandle::new(false);
        assert_eq!(handle.status(), HandleStatus::Empty);

        let (generation, closed_any) = handle.disconnect();
        assert!(!closed_any);

        let (ch, _sent, closed) = channel();
        assert!(handle.connect(generation, ch).is_ok());
        assert!(handle.is_live());

        let (_, closed_any) = handle.disconnect();
        assert!(closed_any);
        assert!(!handle.is_live());
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stale_connect_is_rejected() {
        let handle = ChannelHandle::new(false);
        let (old_generation, _) = handle.disconnect();
        handle.disconnect();

        let (ch, _, _) = channel();
        assert!(handle.connect(old_generation, ch).is_err());
        assert!(!handle.is_live());
    }

    #[test]
    fn test_went_offline_matches_generation() {
        let handle = ChannelHandle::new(false);
        let (generation, _) = handle.disconnect();
        let (ch, _, closed) = channel();
        handle.connect(generation, ch).ok();

        assert!(!handle.went_offline(generation + 5));
        assert!(handle.is_live());

        assert!(handle.went_offline(generation));
        assert!(!handle.is_live());
        assert_eq!(closed.load(Ordering::SeqCst), 1);

        // Once the owner tears down, the old generation is stale
        handle.disconnect();
        assert!(!handle.went_offline(generation));
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_link_gates_on_transmit_and_live() {
        let handle = ChannelHandle::new(false);
        let link = handle.link();
        assert!(matches!(link.send(b"x"), Err(ChannelError::TransmitDisabled)));

        handle.set_transmit(true);
        assert!(matches!(link.send(b"x"), Err(ChannelError::NotConnected)));

        let (generation, _) = handle.disconnect();
        let (ch, sent, _) = channel();
        handle.connect(generation, ch).ok();
        link.send(b"x").unwrap();
        assert_eq!(sent.load(Ordering::SeqCst), 1);
        assert!(link.same_handle(&handle.link()));
    }

    #[test]
    fn test_notifier_reports_into_queue() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let notifier = OfflineNotifier::new(NodeId(3), 7, tx);
        assert!(notifier.report("unplugged"));

        let report = rx.try_recv().unwrap();
        assert_eq!(report.bus, NodeId(3));
        assert_eq!(report.generation, 7);
        assert_eq!(report.reason, "unplugged");

        drop(rx);
        assert!(!notifier.report("again"));
    }
}
