//! Canopy Bus Discovery Library
//!
//! This crate finds the buses a tree is built from: CAN channels that a CAN
//! channel factory can open, and serial ports for SunSpec devices.
//!
//! # Example
//!
//! ```rust,no_run
//! use canopy_detect::PortScanner;
//!
//! let scanner = PortScanner::new();
//! let ports = scanner.enumerate_ports().unwrap();
//!
//! for port in ports {
//!     println!("Found port: {}", port.port);
//! }
//! ```

pub mod discovery;
pub mod error;
pub mod probe;
pub mod scanner;

pub use discovery::{available_buses, Discovery};
pub use error::DetectError;
pub use probe::{default_candidates, CanCandidate, CanProber, ProbeConfig};
pub use scanner::{PortScanner, ScannerConfig, SerialPortInfo};
