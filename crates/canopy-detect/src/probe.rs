//! CAN channel probing
//!
//! A CAN channel is available if the CAN family factory can open it. Each
//! candidate is opened at the family's default bitrate and closed again
//! straight away.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use canopy_tree::{
    BusFamily, BusRecord, ChannelFactory, InterfaceParams, NodeId, OfflineNotifier,
    PARAM_SEPARATOR,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::DetectError;

/// A CAN channel to try
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CanCandidate {
    /// Driver interface, e.g. `pcan`
    pub interface: String,
    /// Channel name, e.g. `PCAN_USBBUS1`
    pub channel: String,
}

impl CanCandidate {
    /// Create a candidate
    pub fn new(interface: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            channel: channel.into(),
        }
    }

    /// Interface parameters of the candidate
    pub fn params(&self) -> InterfaceParams {
        InterfaceParams::can(self.interface.clone(), self.channel.clone())
    }
}

impl fmt::Display for CanCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.interface, PARAM_SEPARATOR, self.channel)
    }
}

impl FromStr for CanCandidate {
    type Err = DetectError;

    /// Parse `interface - channel` (or `interface:channel`)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (interface, channel) = s
            .split_once(PARAM_SEPARATOR)
            .or_else(|| s.split_once(':'))
            .ok_or_else(|| DetectError::InvalidCandidate(s.to_string()))?;
        let (interface, channel) = (interface.trim(), channel.trim());
        if interface.is_empty() || channel.is_empty() {
            return Err(DetectError::InvalidCandidate(s.to_string()));
        }
        Ok(Self::new(interface, channel))
    }
}

/// The channels tried by default
///
/// PCAN USB buses 1 to 8, then SocketCAN `can0`..`can8` and `vcan0`..`vcan8`.
pub fn default_candidates() -> Vec<CanCandidate> {
    let pcan = (1..=8).map(|n| CanCandidate::new("pcan", format!("PCAN_USBBUS{}", n)));
    let can = (0..=8).map(|n| CanCandidate::new("socketcan", format!("can{}", n)));
    let vcan = (0..=8).map(|n| CanCandidate::new("socketcan", format!("vcan{}", n)));
    pcan.chain(can).chain(vcan).collect()
}

/// Configuration for probing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Channels to try, in order
    pub candidates: Vec<CanCandidate>,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            candidates: default_candidates(),
        }
    }
}

/// Probes CAN candidates through a channel factory
pub struct CanProber {
    config: ProbeConfig,
    factory: Arc<dyn ChannelFactory>,
}

impl CanProber {
    /// Create a prober with default configuration
    pub fn new(factory: Arc<dyn ChannelFactory>) -> Self {
        Self::with_config(factory, ProbeConfig::default())
    }

    /// Create a prober with custom configuration
    pub fn with_config(factory: Arc<dyn ChannelFactory>, config: ProbeConfig) -> Self {
        if factory.family() != BusFamily::Can {
            warn!(
                "CAN prober given a {} factory; every candidate will fail",
                factory.family()
            );
        }
        Self { config, factory }
    }

    /// Check whether one candidate can be opened
    ///
    /// Blocks while the factory opens the channel.
    pub fn probe(&self, candidate: &CanCandidate) -> bool {
        // Nobody listens; a probe channel is closed before it can fail
        let (tx, _rx) = mpsc::unbounded_channel();
        let notifier = OfflineNotifier::new(NodeId(0), 0, tx);

        match self
            .factory
            .open(&candidate.params(), BusFamily::Can.default_bitrate(), notifier)
        {
            Ok(mut channel) => {
                channel.close();
                debug!("CAN candidate {} is available", candidate);
                true
            }
            Err(e) => {
                debug!("CAN candidate {} unavailable: {}", candidate, e);
                false
            }
        }
    }

    /// CAN bus records for every available candidate, in candidate order
    pub fn records(&self) -> Vec<BusRecord> {
        let records: Vec<_> = self
            .config
            .candidates
            .iter()
            .filter(|c| self.probe(c))
            .map(|c| BusRecord::new(c.params()))
            .collect();
        info!("Found {} CAN channel(s)", records.len());
        records
    }
}

impl fmt::Debug for CanProber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CanProber")
            .field("config", &self.config)
            .field("factory", &self.factory.family())
            .finish()
    }
}
