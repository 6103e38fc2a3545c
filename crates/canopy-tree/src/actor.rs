//! Tree Actor
//!
//! Async actor that owns a [`BusTreeModel`] and serializes every mutation
//! through a command channel. Channel opens are queued by the model
//! ([`OpenMode::Deferred`](crate::OpenMode::Deferred)) and run on the
//! blocking pool, so a slow driver or the settle delay never stalls the
//! actor. Completions and went-offline reports come back into the same loop
//! and are matched against the bus's current generation.
//!
//! # Example
//!
//! ```rust,ignore
//! use canopy_tree::actor::{run_tree_actor, TreeCommand};
//! use tokio::sync::mpsc;
//!
//! let (cmd_tx, cmd_rx) = mpsc::channel(64);
//! let (event_tx, mut event_rx) = mpsc::channel(256);
//!
//! tokio::spawn(run_tree_actor(model, cmd_rx, event_tx));
//! ```

use std::fmt;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::channel::LiveChannel;
use crate::column::Column;
use crate::device::Endpoint;
use crate::error::{ChannelError, TreeError};
use crate::events::TreeEvent;
use crate::model::{BusTreeModel, OpenMode, OpenRequest};
use crate::snapshot::TreeSnapshot;
use crate::tree::NodeId;
use crate::tristate::TriState;

/// Commands that can be sent to the tree actor
pub enum TreeCommand {
    /// Set a checked flag
    SetChecked {
        /// Bus or device node
        node: NodeId,
        /// Checkable column
        column: Column,
        /// Requested state
        state: TriState,
        /// Result of the request
        response: oneshot::Sender<Result<(), TreeError>>,
    },

    /// Select a bus bitrate
    SetBitrate {
        /// Bus node
        bus: NodeId,
        /// New bitrate in bit/s
        bitrate: u32,
        /// Result of the request
        response: oneshot::Sender<Result<(), TreeError>>,
    },

    /// Select a bus bitrate by label
    SetBitrateLabel {
        /// Bus node
        bus: NodeId,
        /// Bitrate label, e.g. `250 kBit/s`
        label: String,
        /// Result of the request
        response: oneshot::Sender<Result<(), TreeError>>,
    },

    /// Append a device below a bus
    AddDevice {
        /// Bus node
        bus: NodeId,
        /// Endpoint the device forwards to
        endpoint: Box<dyn Endpoint>,
        /// The new device node
        response: oneshot::Sender<Result<NodeId, TreeError>>,
    },

    /// Remove a device
    RemoveDevice {
        /// Device node
        device: NodeId,
        /// The endpoint, handed back to the caller
        response: oneshot::Sender<Result<Box<dyn Endpoint>, TreeError>>,
    },

    /// Query a snapshot of the tree
    Snapshot {
        /// Channel to send back the snapshot
        response: oneshot::Sender<TreeSnapshot>,
    },

    /// Shutdown the actor
    Shutdown,
}

impl fmt::Debug for TreeCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SetChecked {
                node,
                column,
                state,
                ..
            } => f
                .debug_struct("SetChecked")
                .field("node", node)
                .field("column", column)
                .field("state", state)
                .finish(),
            Self::SetBitrate { bus, bitrate, .. } => f
                .debug_struct("SetBitrate")
                .field("bus", bus)
                .field("bitrate", bitrate)
                .finish(),
            Self::SetBitrateLabel { bus, label, .. } => f
                .debug_struct("SetBitrateLabel")
                .field("bus", bus)
                .field("label", label)
                .finish(),
            Self::AddDevice { bus, endpoint, .. } => f
                .debug_struct("AddDevice")
                .field("bus", bus)
                .field("endpoint", &endpoint.id())
                .finish(),
            Self::RemoveDevice { device, .. } => f
                .debug_struct("RemoveDevice")
                .field("device", device)
                .finish(),
            Self::Snapshot { .. } => f.write_str("Snapshot"),
            Self::Shutdown => f.write_str("Shutdown"),
        }
    }
}

type OpenCompletion = (OpenRequest, Result<Box<dyn LiveChannel>, ChannelError>);

/// Run the tree actor
///
/// Processes commands until [`TreeCommand::Shutdown`] is received or every
/// command sender is dropped. All live channels are closed when the model is
/// dropped on exit.
pub async fn run_tree_actor(
    mut model: BusTreeModel,
    mut cmd_rx: mpsc::Receiver<TreeCommand>,
    event_tx: mpsc::Sender<TreeEvent>,
) {
    let Some(mut offline_rx) = model.take_offline_receiver() else {
        warn!("Tree actor not started: offline receiver already taken");
        return;
    };
    if model.config().open_mode == OpenMode::Inline {
        warn!("Tree actor running with inline opens; channel opens will block the actor");
    }

    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<OpenCompletion>();
    info!("Tree actor started");

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { break; };
                debug!("Tree command: {:?}", cmd);
                match cmd {
                    TreeCommand::SetChecked { node, column, state, response } => {
                        let _ = response.send(model.set_checked(node, column, state));
                    }

                    TreeCommand::SetBitrate { bus, bitrate, response } => {
                        let _ = response.send(model.set_bitrate(bus, bitrate));
                    }

                    TreeCommand::SetBitrateLabel { bus, label, response } => {
                        let _ = response.send(model.set_bitrate_label(bus, &label));
                    }

                    TreeCommand::AddDevice { bus, endpoint, response } => {
                        let _ = response.send(model.add_device(bus, endpoint));
                    }

                    TreeCommand::RemoveDevice { device, response } => {
                        let _ = response.send(model.remove_device(device));
                    }

                    TreeCommand::Snapshot { response } => {
                        let _ = response.send(model.snapshot());
                    }

                    TreeCommand::Shutdown => {
                        info!("Tree actor shutting down");
                        break;
                    }
                }
            }
            Some(report) = offline_rx.recv() => {
                model.handle_offline_report(report);
            }
            Some((request, result)) = done_rx.recv() => {
                if let Err(e) = model.complete_open(request, result) {
                    debug!("Open completed with error: {}", e);
                }
            }
        }

        for request in model.take_pending_opens() {
            let done_tx = done_tx.clone();
            tokio::task::spawn_blocking(move || {
                let result = request.open_blocking();
                if let Err(mpsc::error::SendError((request, result))) =
                    done_tx.send((request, result))
                {
                    // The actor is gone; nobody else will close this channel
                    if let Ok(mut channel) = result {
                        debug!("Closing channel for {} opened after shutdown", request.bus());
                        channel.close();
                    }
                }
            });
        }

        for event in model.drain_events() {
            let _ = event_tx.send(event).await;
        }
    }

    // Opens still running see a closed queue and close their own channels
    done_rx.close();
    while let Ok((request, result)) = done_rx.try_recv() {
        if let Ok(mut channel) = result {
            debug!("Closing channel for {} completed during shutdown", request.bus());
            channel.close();
        }
    }

    info!("Tree actor stopped");
}
