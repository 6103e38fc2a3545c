//! Canopy - bus tree console
//!
//! Discovers buses, builds the tree and drives it from stdin. CAN channels
//! listed in the settings' `virtual_can` are backed by virtual hardware;
//! serial ports open real SunSpec channels.

mod command;
mod error;
mod render;
mod settings;

use std::collections::HashMap;
use std::sync::Arc;

use canopy_detect::{Discovery, ProbeConfig};
use canopy_sim::{EndpointMonitor, VirtualChannelFactory, VirtualEndpoint};
use canopy_tree::{
    run_tree_actor, BusFamily, BusTreeModel, ChannelFactories, Endpoint, InterfaceParams, NodeId,
    SerialChannelFactory, TreeCommand, TreeEvent,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::command::{Command, HELP};
use crate::error::ConsoleError;
use crate::render::{describe_event, render_tree};
use crate::settings::Settings;

/// Console state between commands
struct Console {
    settings: Settings,
    cmd_tx: mpsc::Sender<TreeCommand>,
    can: Arc<VirtualChannelFactory>,
    monitors: HashMap<NodeId, EndpointMonitor>,
    next_endpoint: u32,
}

/// Send a request to the tree actor and wait for its response
async fn request<T>(
    cmd_tx: &mpsc::Sender<TreeCommand>,
    build: impl FnOnce(oneshot::Sender<T>) -> TreeCommand,
) -> Result<T, ConsoleError> {
    let (tx, rx) = oneshot::channel();
    cmd_tx
        .send(build(tx))
        .await
        .map_err(|_| ConsoleError::ActorGone)?;
    rx.await.map_err(|_| ConsoleError::ActorGone)
}

fn discovery(settings: &Settings, can: Arc<VirtualChannelFactory>) -> Discovery {
    Discovery::new(settings.scanner.clone()).with_can(
        can,
        ProbeConfig {
            candidates: settings.can_candidates.clone(),
        },
    )
}

impl Console {
    /// Run one command; returns false when the console should exit
    async fn execute(&mut self, command: Command) -> Result<bool, ConsoleError> {
        match command {
            Command::List => {
                let snapshot = request(&self.cmd_tx, |response| TreeCommand::Snapshot {
                    response,
                })
                .await?;
                print!("{}", render_tree(&snapshot));
            }

            Command::Set {
                node,
                column,
                state,
            } => {
                request(&self.cmd_tx, |response| TreeCommand::SetChecked {
                    node,
                    column,
                    state,
                    response,
                })
                .await??;
            }

            Command::Bitrate { bus, value } => {
                let result = match value.parse::<u32>() {
                    Ok(bitrate) => {
                        request(&self.cmd_tx, |response| TreeCommand::SetBitrate {
                            bus,
                            bitrate,
                            response,
                        })
                        .await?
                    }
                    Err(_) => {
                        request(&self.cmd_tx, |response| TreeCommand::SetBitrateLabel {
                            bus,
                            label: value,
                            response,
                        })
                        .await?
                    }
                };
                result?;
            }

            Command::Add { bus, name } => {
                self.next_endpoint += 1;
                let (endpoint, monitor) = VirtualEndpoint::new(self.next_endpoint, name);
                let device = request(&self.cmd_tx, |response| TreeCommand::AddDevice {
                    bus,
                    endpoint: Box::new(endpoint),
                    response,
                })
                .await??;
                self.monitors.insert(device, monitor);
                println!("added {}", device);
            }

            Command::Remove { device } => {
                let endpoint = request(&self.cmd_tx, |response| TreeCommand::RemoveDevice {
                    device,
                    response,
                })
                .await??;
                self.monitors.remove(&device);
                info!("Released {}", endpoint.name());
            }

            Command::Send { device, payload } => {
                let monitor = self
                    .monitors
                    .get(&device)
                    .ok_or_else(|| ConsoleError::Parse(format!("{} is not a device", device)))?;
                monitor.send(&payload)?;
                println!("sent {} byte(s)", payload.len());
            }

            Command::Unplug { bus } => {
                let snapshot = request(&self.cmd_tx, |response| TreeCommand::Snapshot {
                    response,
                })
                .await?;
                let row = snapshot
                    .bus(bus)
                    .ok_or_else(|| ConsoleError::Parse(format!("{} is not a bus", bus)))?;
                let params = match &row.params {
                    Some(params) if row.family == BusFamily::Can => params,
                    _ => {
                        return Err(ConsoleError::Parse(format!(
                            "{} is not a virtual CAN bus",
                            bus
                        )))
                    }
                };
                self.can.unplug(params)?;
            }

            Command::Scan => {
                let discovery = discovery(&self.settings, self.can.clone());
                let records = tokio::task::spawn_blocking(move || discovery.discover()).await??;
                for record in records {
                    if let Some(params) = record.params {
                        println!("{:<8} {}", record.family.type_string(), params.unique());
                    }
                }
            }

            Command::Save => {
                let path = self.settings.save()?;
                println!("settings written to {}", path.display());
            }

            Command::Help => println!("{}", HELP),

            Command::Quit => return Ok(false),
        }
        Ok(true)
    }
}

#[tokio::main]
async fn main() -> Result<(), ConsoleError> {
    // Include all our crates in the default filter
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "canopy=info,canopy_tree=info,canopy_detect=info,canopy_sim=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    info!("Starting Canopy bus tree console");

    let settings = Settings::load();

    let can = Arc::new(VirtualChannelFactory::with_interfaces(
        BusFamily::Can,
        settings
            .virtual_can
            .iter()
            .map(|channel| InterfaceParams::can("socketcan", channel.clone())),
    ));
    let serial = Arc::new(SerialChannelFactory::new(tokio::runtime::Handle::current()));
    let factories = ChannelFactories::new().with(can.clone()).with(serial);

    let records = if settings.auto_scan {
        let discovery = discovery(&settings, can.clone());
        match tokio::task::spawn_blocking(move || discovery.discover()).await? {
            Ok(records) => records,
            Err(e) => {
                warn!("Discovery failed: {}", e);
                Vec::new()
            }
        }
    } else {
        Vec::new()
    };

    let model = BusTreeModel::new(settings.tree_config(), factories, records);

    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    let (event_tx, mut event_rx) = mpsc::channel::<TreeEvent>(256);
    let actor_handle = tokio::spawn(run_tree_actor(model, cmd_rx, event_tx));

    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            if let Some(line) = describe_event(&event) {
                println!("* {}", line);
            }
        }
    });

    let mut console = Console {
        settings,
        cmd_tx,
        can,
        monitors: HashMap::new(),
        next_endpoint: 0,
    };

    println!("Type help for commands.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let command = match command::parse(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                println!("error: {}", e);
                continue;
            }
        };

        match console.execute(command).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(ConsoleError::ActorGone) => return Err(ConsoleError::ActorGone),
            Err(e) => println!("error: {}", e),
        }
    }

    let _ = console.cmd_tx.send(TreeCommand::Shutdown).await;
    actor_handle.await?;
    info!("Canopy console stopped");
    Ok(())
}
