//! The MIG-state engine: per-GPU mode control, instance layout control,
//! whole-node state snapshots, and hardware discovery.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::nvml;

pub mod config;
pub mod discover;
pub mod mode;
pub mod state;

/// Per-GPU MIG mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigMode {
    Disabled,
    Enabled,
}

impl MigMode {
    pub fn from_nvml(value: u32) -> Self {
        if value == nvml::MIG_ENABLE {
            Self::Enabled
        } else {
            Self::Disabled
        }
    }

    pub fn as_nvml(&self) -> u32 {
        match self {
            Self::Enabled => nvml::MIG_ENABLE,
            Self::Disabled => nvml::MIG_DISABLE,
        }
    }
}

impl fmt::Display for MigMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Enabled => write!(f, "Enabled"),
            Self::Disabled => write!(f, "Disabled"),
        }
    }
}
