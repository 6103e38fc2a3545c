//! Bus discovery
//!
//! Produces the snapshot the tree is built from: available CAN channels
//! first, then serial ports. Discovery is an explicit call; run it again to
//! pick up hardware that appeared since.

use std::sync::Arc;

use canopy_tree::{BusRecord, ChannelFactory};
use tracing::info;

use crate::error::DetectError;
use crate::probe::{CanProber, ProbeConfig};
use crate::scanner::{PortScanner, ScannerConfig};

/// Discovers available buses
#[derive(Debug, Default)]
pub struct Discovery {
    scanner: PortScanner,
    prober: Option<CanProber>,
}

impl Discovery {
    /// Serial discovery only; CAN probing needs a factory
    pub fn new(scanner: ScannerConfig) -> Self {
        Self {
            scanner: PortScanner::with_config(scanner),
            prober: None,
        }
    }

    /// Probe CAN candidates through `factory`
    pub fn with_can(mut self, factory: Arc<dyn ChannelFactory>, config: ProbeConfig) -> Self {
        self.prober = Some(CanProber::with_config(factory, config));
        self
    }

    /// Take a discovery snapshot
    pub fn discover(&self) -> Result<Vec<BusRecord>, DetectError> {
        let mut records = match &self.prober {
            Some(prober) => prober.records(),
            None => {
                info!("No CAN factory; skipping CAN probing");
                Vec::new()
            }
        };
        records.extend(self.scanner.records()?);

        info!("Discovered {} bus(es)", records.len());
        Ok(records)
    }
}

/// Discover buses with default scanner and probe settings
pub fn available_buses(
    can_factory: Option<Arc<dyn ChannelFactory>>,
) -> Result<Vec<BusRecord>, DetectError> {
    let discovery = Discovery::new(ScannerConfig::default());
    let discovery = match can_factory {
        Some(factory) => discovery.with_can(factory, ProbeConfig::default()),
        None => discovery,
    };
    discovery.discover()
}
