//! Channel families and their interface parameters
//!
//! Every bus belongs to one of a closed set of families. The family decides
//! which bitrates are legal, which bitrate a fresh bus starts at, and which
//! channel factory opens the live channel.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TreeError;

/// Separator used when joining interface parameters into a display name
pub const PARAM_SEPARATOR: &str = " - ";

/// Kind of channel a bus opens
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BusFamily {
    /// CAN bus (SocketCAN, PCAN, ...)
    Can,
    /// SunSpec Modbus over a serial port
    SunSpec,
}

const CAN_BITRATES: &[(u32, &str)] = &[
    (1_000_000, "1 MBit/s"),
    (500_000, "500 kBit/s"),
    (250_000, "250 kBit/s"),
    (125_000, "125 kBit/s"),
];

const SUNSPEC_BITRATES: &[(u32, &str)] = &[(9600, "9600 Bit/s")];

impl BusFamily {
    /// All families, in the order their placeholders appear in the tree
    pub const ALL: [BusFamily; 2] = [BusFamily::Can, BusFamily::SunSpec];

    /// Human-readable type string
    pub fn type_string(&self) -> &'static str {
        match self {
            Self::Can => "CAN",
            Self::SunSpec => "SunSpec",
        }
    }

    /// Legal bitrates and their labels, in display order
    pub fn bitrates(&self) -> &'static [(u32, &'static str)] {
        match self {
            Self::Can => CAN_BITRATES,
            Self::SunSpec => SUNSPEC_BITRATES,
        }
    }

    /// Bitrate a fresh bus starts at
    pub fn default_bitrate(&self) -> u32 {
        match self {
            Self::Can => 500_000,
            Self::SunSpec => 9600,
        }
    }

    /// Label for a bitrate, if it is legal for this family
    pub fn bitrate_label(&self, bitrate: u32) -> Option<&'static str> {
        self.bitrates()
            .iter()
            .find(|(rate, _)| *rate == bitrate)
            .map(|(_, label)| *label)
    }

    /// Bitrate for a display label, if it is legal for this family
    pub fn bitrate_for_label(&self, label: &str) -> Option<u32> {
        self.bitrates()
            .iter()
            .find(|(_, l)| *l == label)
            .map(|(rate, _)| *rate)
    }

    /// Comma separated list of legal labels, for error messages
    pub fn legal_bitrates(&self) -> String {
        self.bitrates()
            .iter()
            .map(|(_, label)| *label)
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Validate a bitrate against the family table
    pub fn check_bitrate(&self, bitrate: u32) -> Result<u32, TreeError> {
        match self.bitrate_label(bitrate) {
            Some(_) => Ok(bitrate),
            None => Err(TreeError::InvalidBitrate {
                requested: bitrate.to_string(),
                legal: self.legal_bitrates(),
            }),
        }
    }
}

impl fmt::Display for BusFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_string())
    }
}

/// Parameters identifying the interface a bus opens
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InterfaceParams {
    /// A CAN channel on a given driver interface
    Can {
        /// Driver interface, e.g. `socketcan` or `pcan`
        interface: String,
        /// Channel name, e.g. `can0` or `PCAN_USBBUS1`
        channel: String,
    },
    /// A serial port
    Serial {
        /// Port path, e.g. `/dev/ttyUSB0` or `COM3`
        port: String,
    },
}

impl InterfaceParams {
    /// Build CAN parameters
    pub fn can(interface: impl Into<String>, channel: impl Into<String>) -> Self {
        Self::Can {
            interface: interface.into(),
            channel: channel.into(),
        }
    }

    /// Build serial parameters
    pub fn serial(port: impl Into<String>) -> Self {
        Self::Serial { port: port.into() }
    }

    /// Build parameters for a family from a raw parameter list
    ///
    /// CAN takes `[interface, channel]`, SunSpec takes `[port]`. Missing or
    /// extra parameters are rejected.
    pub fn from_parts(family: BusFamily, parts: &[String]) -> Result<Self, TreeError> {
        let expected = match family {
            BusFamily::Can => 2,
            BusFamily::SunSpec => 1,
        };
        if parts.len() > expected {
            return Err(TreeError::InvalidParams(format!(
                "extra device parameters passed: {:?}",
                &parts[expected..]
            )));
        }
        if parts.len() < expected {
            return Err(TreeError::InvalidParams(format!(
                "{} bus needs {} parameter(s), got {}",
                family,
                expected,
                parts.len()
            )));
        }
        Ok(match family {
            BusFamily::Can => Self::can(parts[0].clone(), parts[1].clone()),
            BusFamily::SunSpec => Self::serial(parts[0].clone()),
        })
    }

    /// Parameters as an ordered list
    pub fn parts(&self) -> Vec<&str> {
        match self {
            Self::Can { interface, channel } => vec![interface.as_str(), channel.as_str()],
            Self::Serial { port } => vec![port.as_str()],
        }
    }

    /// Parameters joined into a single identity string
    pub fn unique(&self) -> String {
        self.parts().join(PARAM_SEPARATOR)
    }

    /// Family these parameters belong to
    pub fn family(&self) -> BusFamily {
        match self {
            Self::Can { .. } => BusFamily::Can,
            Self::Serial { .. } => BusFamily::SunSpec,
        }
    }
}

/// One entry of a discovery snapshot
///
/// Records without parameters become the permanent offline placeholders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusRecord {
    /// Family of the bus
    pub family: BusFamily,
    /// Interface parameters, `None` for a placeholder
    pub params: Option<InterfaceParams>,
}

impl BusRecord {
    /// Record for a real interface
    pub fn new(params: InterfaceParams) -> Self {
        Self {
            family: params.family(),
            params: Some(params),
        }
    }

    /// Record for an always-offline placeholder
    pub fn placeholder(family: BusFamily) -> Self {
        Self {
            family,
            params: None,
        }
    }

    /// One placeholder per family
    pub fn placeholders() -> Vec<Self> {
        BusFamily::ALL.iter().map(|f| Self::placeholder(*f)).collect()
    }

    /// Check if this is a placeholder record
    pub fn is_placeholder(&self) -> bool {
        self.params.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_can_bitrate_table() {
        let family = BusFamily::Can;
        assert_eq!(family.default_bitrate(), 500_000);
        assert_eq!(family.bitrate_label(250_000), Some("250 kBit/s"));
        assert_eq!(family.bitrate_for_label("1 MBit/s"), Some(1_000_000));
        assert_eq!(family.bitrate_label(999), None);
        assert_eq!(
            family.legal_bitrates(),
            "1 MBit/s, 500 kBit/s, 250 kBit/s, 125 kBit/s"
        );
    }

    #[test]
    fn test_check_bitrate_rejects_unknown() {
        let err = BusFamily::SunSpec.check_bitrate(19200).unwrap_err();
        assert!(matches!(err, TreeError::InvalidBitrate { .. }));
        assert!(err.to_string().contains("9600 Bit/s"));
    }

    #[test]
    fn test_params_from_parts() {
        let parts = vec!["socketcan".to_string(), "can0".to_string()];
        let params = InterfaceParams::from_parts(BusFamily::Can, &parts).unwrap();
        assert_eq!(params.unique(), "socketcan - can0");
        assert_eq!(params.family(), BusFamily::Can);
    }

    #[test]
    fn test_params_reject_extra() {
        let parts = vec![
            "socketcan".to_string(),
            "can0".to_string(),
            "oops".to_string(),
        ];
        let err = InterfaceParams::from_parts(BusFamily::Can, &parts).unwrap_err();
        assert!(err.to_string().contains("extra device parameters"));

        let err = InterfaceParams::from_parts(BusFamily::SunSpec, &[]).unwrap_err();
        assert!(matches!(err, TreeError::InvalidParams(_)));
    }

    #[test]
    fn test_placeholders_one_per_family() {
        let records = BusRecord::placeholders();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(BusRecord::is_placeholder));
        assert_eq!(records[0].family, BusFamily::Can);
        assert_eq!(records[1].family, BusFamily::SunSpec);
    }
}
