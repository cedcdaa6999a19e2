//! PCI-level access to NVIDIA GPUs: sysfs enumeration, the BAR0 register
//! window, and function-level reset. This is the only path available when
//! the kernel driver is not loaded.

use std::fs;
use std::path::{Path, PathBuf};

use snafu::{ensure, OptionExt, ResultExt};

pub mod mmio;

use crate::types::DeviceId;

pub const PCI_DEVICES_PATH: &str = "/sys/bus/pci/devices";

const NVIDIA_VENDOR_ID: u16 = 0x10DE;

// PCI class 0x03xxxx: display controller.
const DISPLAY_CLASS_PREFIX: u32 = 0x03;

/// One PCI function, identified by its full `DDDD:BB:DD.F` address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PciDevice {
    address: String,
    vendor: u16,
    device: u16,
    sysfs_dir: PathBuf,
}

impl PciDevice {
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn device_id(&self) -> DeviceId {
        DeviceId::new(self.device, self.vendor)
    }

    pub fn from_address(address: &str) -> Result<Self> {
        Self::load(Path::new(PCI_DEVICES_PATH), address)
    }

    fn load(root: &Path, address: &str) -> Result<Self> {
        let sysfs_dir = root.join(address);
        let vendor = read_hex_attribute(&sysfs_dir, "vendor")? as u16;
        let device = read_hex_attribute(&sysfs_dir, "device")? as u16;
        Ok(Self {
            address: address.to_string(),
            vendor,
            device,
            sysfs_dir,
        })
    }

    /// Map the device's BAR0 register window.
    pub fn open_bar0(&self) -> Result<mmio::Bar0> {
        let path = self.sysfs_dir.join("resource0");
        mmio::Bar0::open(&path).context(error::Bar0Snafu {
            address: &self.address,
        })
    }

    /// Function-level reset through the standard sysfs attribute.
    pub fn reset(&self) -> Result<()> {
        let path = self.sysfs_dir.join("reset");
        ensure!(
            path.exists(),
            error::ResetUnavailableSnafu {
                address: &self.address
            }
        );
        fs::write(&path, "1").context(error::SysfsWriteSnafu { path })
    }
}

/// All NVIDIA display-class functions on the node, in bus address order.
/// This ordering matches the driver's default device enumeration.
pub fn enumerate_nvidia_gpus() -> Result<Vec<PciDevice>> {
    enumerate_nvidia_gpus_at(Path::new(PCI_DEVICES_PATH))
}

pub fn enumerate_nvidia_gpus_at(root: &Path) -> Result<Vec<PciDevice>> {
    let mut gpus = Vec::new();
    let entries = fs::read_dir(root).context(error::SysfsReadSnafu { path: root })?;
    for entry in entries {
        let entry = entry.context(error::SysfsReadSnafu { path: root })?;
        let address = entry.file_name().to_string_lossy().to_string();

        let vendor = read_hex_attribute(&entry.path(), "vendor")? as u16;
        if vendor != NVIDIA_VENDOR_ID {
            continue;
        }
        let class = read_hex_attribute(&entry.path(), "class")?;
        if class >> 16 != DISPLAY_CLASS_PREFIX {
            continue;
        }

        gpus.push(PciDevice::load(root, &address)?);
    }
    gpus.sort_by(|a, b| a.address.cmp(&b.address));
    Ok(gpus)
}

fn read_hex_attribute(dir: &Path, name: &str) -> Result<u32> {
    let path = dir.join(name);
    let raw = fs::read_to_string(&path).context(error::SysfsReadSnafu { path: &path })?;
    let trimmed = raw.trim();
    let digits = trimmed.strip_prefix("0x").unwrap_or(trimmed);
    u32::from_str_radix(digits, 16)
        .ok()
        .context(error::MalformedAttributeSnafu { path })
}

type Result<T, E = error::Error> = std::result::Result<T, E>;

mod error {
    use snafu::Snafu;
    use std::path::PathBuf;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display("Unable to read '{}': {}", path.display(), source))]
        SysfsRead {
            path: PathBuf,
            source: std::io::Error,
        },

        #[snafu(display("Unable to write '{}': {}", path.display(), source))]
        SysfsWrite {
            path: PathBuf,
            source: std::io::Error,
        },

        #[snafu(display("Malformed sysfs attribute '{}'", path.display()))]
        MalformedAttribute { path: PathBuf },

        #[snafu(display("Unable to map BAR0 of device {}: {}", address, source))]
        Bar0 {
            address: String,
            source: super::mmio::Error,
        },

        #[snafu(display("Device {} has no reset attribute", address))]
        ResetUnavailable { address: String },
    }
}

pub use error::Error;

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

#[cfg(test)]
mod test {
    use super::*;
    use std::fs;

    fn fake_device(root: &Path, address: &str, vendor: &str, device: &str, class: &str) {
        let dir = root.join(address);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("vendor"), format!("{}\n", vendor)).unwrap();
        fs::write(dir.join("device"), format!("{}\n", device)).unwrap();
        fs::write(dir.join("class"), format!("{}\n", class)).unwrap();
    }

    #[test]
    fn enumerates_only_nvidia_display_devices() {
        let root = tempfile::tempdir().unwrap();
        fake_device(root.path(), "0000:3b:00.0", "0x10de", "0x20b0", "0x030200");
        fake_device(root.path(), "0000:1a:00.0", "0x10de", "0x20b0", "0x030200");
        // An NVIDIA USB controller function and another vendor's GPU.
        fake_device(root.path(), "0000:3b:00.2", "0x10de", "0x1ad8", "0x0c0330");
        fake_device(root.path(), "0000:04:00.0", "0x1002", "0x73bf", "0x030000");

        let gpus = enumerate_nvidia_gpus_at(root.path()).unwrap();
        let addresses: Vec<&str> = gpus.iter().map(|g| g.address()).collect();
        assert_eq!(addresses, ["0000:1a:00.0", "0000:3b:00.0"]);
        assert_eq!(gpus[0].device_id().to_string(), "0x20B010DE");
    }

    #[test]
    fn reset_requires_the_attribute() {
        let root = tempfile::tempdir().unwrap();
        fake_device(root.path(), "0000:3b:00.0", "0x10de", "0x20b0", "0x030200");
        let gpus = enumerate_nvidia_gpus_at(root.path()).unwrap();
        assert!(matches!(
            gpus[0].reset(),
            Err(Error::ResetUnavailable { .. })
        ));

        fs::write(root.path().join("0000:3b:00.0/reset"), "").unwrap();
        gpus[0].reset().unwrap();
        let written = fs::read_to_string(root.path().join("0000:3b:00.0/reset")).unwrap();
        assert_eq!(written, "1");
    }
}
