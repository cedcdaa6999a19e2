use std::fmt;
use std::str::FromStr;

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use snafu::OptionExt;

/// Known model strings and their PCI device ids. Extend as new MIG-capable
/// boards ship.
const KNOWN_DEVICES: &[(&str, u32)] = &[
    ("A100-SXM4-40GB", 0x20B0_10DE),
    ("A100-SXM4-80GB", 0x20B2_10DE),
    ("A100-PCIE-40GB", 0x20F1_10DE),
    ("A100-PCIE-80GB", 0x20B5_10DE),
    ("A30", 0x20B7_10DE),
    ("H100-SXM5-80GB", 0x2330_10DE),
    ("H100-PCIE-80GB", 0x2331_10DE),
];

/// A 32-bit PCI identifier packing the 16-bit device id over the 16-bit
/// vendor id. Constant for the lifetime of a GPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(u32);

impl DeviceId {
    pub fn new(device: u16, vendor: u16) -> Self {
        Self((u32::from(device) << 16) | u32::from(vendor))
    }

    pub fn from_u32(value: u32) -> Self {
        Self(value)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }

    pub fn device(&self) -> u16 {
        (self.0 >> 16) as u16
    }

    pub fn vendor(&self) -> u16 {
        self.0 as u16
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

impl FromStr for DeviceId {
    type Err = error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            let value = u32::from_str_radix(hex, 16)
                .ok()
                .context(error::InvalidDeviceIdSnafu { value: s })?;
            return Ok(Self(value));
        }

        KNOWN_DEVICES
            .iter()
            .find(|(model, _)| model.eq_ignore_ascii_case(s))
            .map(|&(_, id)| Self(id))
            .context(error::UnknownModelSnafu { value: s })
    }
}

impl Serialize for DeviceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for DeviceId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

mod error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display("Invalid device id '{}': expected 0xXXXXXXXX", value))]
        InvalidDeviceId { value: String },

        #[snafu(display("Unknown device model '{}'", value))]
        UnknownModel { value: String },
    }
}

pub use error::Error;

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=
