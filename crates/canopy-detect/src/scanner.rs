//! Serial port scanner
//!
//! Every serial port that survives the skip patterns is a SunSpec bus
//! candidate. Ports are reported sorted by name so discovery is stable.

use canopy_tree::{BusRecord, InterfaceParams};
use serde::{Deserialize, Serialize};
use serialport::{available_ports, SerialPortType};
use tracing::{debug, info};

use crate::error::DetectError;

/// Information about a serial port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialPortInfo {
    /// Port name (e.g., /dev/ttyUSB0, COM3)
    pub port: String,
    /// USB product string
    pub product: Option<String>,
}

impl SerialPortInfo {
    fn from_serialport(name: String, port_type: &SerialPortType) -> Self {
        let product = match port_type {
            SerialPortType::UsbPort(usb) => usb.product.clone(),
            _ => None,
        };
        Self {
            port: name,
            product,
        }
    }
}

/// Serial port scanner configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScannerConfig {
    /// Skip ports whose name contains any of these patterns
    pub skip_patterns: Vec<String>,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            skip_patterns: vec![
                // Bluetooth ports on macOS
                "Bluetooth".to_string(),
                // Debug/logging ports
                "debug".to_string(),
            ],
        }
    }
}

/// Serial port scanner
#[derive(Debug, Clone, Default)]
pub struct PortScanner {
    config: ScannerConfig,
}

impl PortScanner {
    /// Create a new scanner with default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a scanner with custom configuration
    pub fn with_config(config: ScannerConfig) -> Self {
        Self { config }
    }

    /// Enumerate candidate serial ports, sorted by name
    pub fn enumerate_ports(&self) -> Result<Vec<SerialPortInfo>, DetectError> {
        debug!("Enumerating serial ports...");
        let ports = available_ports().map_err(|e| DetectError::EnumerationFailed(e.to_string()))?;

        let result = self.select(
            ports
                .into_iter()
                .map(|p| SerialPortInfo::from_serialport(p.port_name, &p.port_type))
                .collect(),
        );

        if result.is_empty() {
            info!("No serial ports found");
        } else {
            info!("Found {} serial port(s)", result.len());
            for port in &result {
                let desc = port.product.as_deref().unwrap_or("Unknown");
                debug!("  {} - {}", port.port, desc);
            }
        }

        Ok(result)
    }

    /// SunSpec bus records for every candidate port
    pub fn records(&self) -> Result<Vec<BusRecord>, DetectError> {
        Ok(self
            .enumerate_ports()?
            .into_iter()
            .map(|p| BusRecord::new(InterfaceParams::serial(p.port)))
            .collect())
    }

    /// Drop skipped ports and sort the rest by name
    fn select(&self, ports: Vec<SerialPortInfo>) -> Vec<SerialPortInfo> {
        let mut ports: Vec<_> = ports
            .into_iter()
            .filter(|p| !self.should_skip_port(p))
            .collect();
        ports.sort_by(|a, b| a.port.cmp(&b.port));
        ports.dedup_by(|a, b| a.port == b.port);
        ports
    }

    fn should_skip_port(&self, port: &SerialPortInfo) -> bool {
        self.config
            .skip_patterns
            .iter()
            .any(|pattern| port.port.contains(pattern.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serialport::UsbPortInfo;

    fn port(name: &str) -> SerialPortInfo {
        SerialPortInfo {
            port: name.to_string(),
            product: None,
        }
    }

    #[test]
    fn test_serial_port_info_from_usb() {
        let usb_info = SerialPortType::UsbPort(UsbPortInfo {
            vid: 0x0403,
            pid: 0x6001,
            serial_number: Some("12345".to_string()),
            manufacturer: Some("FTDI".to_string()),
            product: Some("FT232R".to_string()),
        });

        let info = SerialPortInfo::from_serialport("/dev/ttyUSB0".to_string(), &usb_info);
        assert_eq!(info.port, "/dev/ttyUSB0");
        assert_eq!(info.product.as_deref(), Some("FT232R"));
    }

    #[test]
    fn test_select_skips_and_sorts() {
        let scanner = PortScanner::new();
        let selected = scanner.select(vec![
            port("/dev/ttyUSB1"),
            port("/dev/cu.Bluetooth-Incoming-Port"),
            port("/dev/ttyUSB0"),
            port("/dev/cu.debug-console"),
            port("/dev/ttyUSB0"),
        ]);

        let names: Vec<_> = selected.iter().map(|p| p.port.as_str()).collect();
        assert_eq!(names, vec!["/dev/ttyUSB0", "/dev/ttyUSB1"]);
    }

    #[test]
    fn test_custom_skip_patterns() {
        let scanner = PortScanner::with_config(ScannerConfig {
            skip_patterns: vec!["ttyS".to_string()],
        });
        let selected = scanner.select(vec![port("/dev/ttyS0"), port("/dev/ttyACM0")]);
        assert_eq!(selected, vec![port("/dev/ttyACM0")]);
    }
}
