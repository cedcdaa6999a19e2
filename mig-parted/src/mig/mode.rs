//! Per-GPU MIG mode control. Two backends share one surface: NVML when the
//! kernel driver is loaded, and direct BAR0 register access when it is not.

use std::path::Path;

use snafu::{ensure, OptionExt, ResultExt};

use super::MigMode;
use crate::nvml::{self, InitGuard, Nvml};
use crate::pci::{self, mmio, PciDevice};

pub trait MigModeManager {
    fn is_mig_capable(&self, gpu: usize) -> Result<bool>;
    fn get_mig_mode(&self, gpu: usize) -> Result<MigMode>;
    fn set_mig_mode(&self, gpu: usize, mode: MigMode) -> Result<()>;
    fn is_mig_mode_change_pending(&self, gpu: usize) -> Result<bool>;
}

/// Whether the NVIDIA kernel module is present. Decides which backend can
/// talk to the GPUs.
pub fn is_nvidia_module_loaded() -> bool {
    Path::new("/sys/module/nvidia").exists()
}

pub fn new_mig_mode_manager(nvml: &dyn Nvml) -> Result<Box<dyn MigModeManager + '_>> {
    if is_nvidia_module_loaded() {
        Ok(Box::new(NvmlMigModeManager::new(nvml)))
    } else {
        Ok(Box::new(PciMigModeManager::new()?))
    }
}

/// The driver-backed mode manager.
pub struct NvmlMigModeManager<'a> {
    nvml: &'a dyn Nvml,
}

impl<'a> NvmlMigModeManager<'a> {
    pub fn new(nvml: &'a dyn Nvml) -> Self {
        Self { nvml }
    }

    fn device(&self, gpu: usize) -> Result<Box<dyn nvml::Device>> {
        self.nvml
            .device_by_index(gpu as u32)
            .context(error::NvmlSnafu {
                op: "get device handle",
                gpu,
            })
    }
}

impl MigModeManager for NvmlMigModeManager<'_> {
    fn is_mig_capable(&self, gpu: usize) -> Result<bool> {
        let _nvml = InitGuard::new(self.nvml).context(error::NvmlSnafu { op: "init", gpu })?;
        match self.device(gpu)?.mig_mode() {
            Ok(_) => Ok(true),
            Err(nvml::Error::NotSupported) => Ok(false),
            Err(source) => Err(source).context(error::NvmlSnafu {
                op: "get MIG mode",
                gpu,
            }),
        }
    }

    fn get_mig_mode(&self, gpu: usize) -> Result<MigMode> {
        let _nvml = InitGuard::new(self.nvml).context(error::NvmlSnafu { op: "init", gpu })?;
        let (current, _) = self
            .device(gpu)?
            .mig_mode()
            .context(error::NvmlSnafu {
                op: "get MIG mode",
                gpu,
            })?;
        Ok(MigMode::from_nvml(current))
    }

    fn set_mig_mode(&self, gpu: usize, mode: MigMode) -> Result<()> {
        let _nvml = InitGuard::new(self.nvml).context(error::NvmlSnafu { op: "init", gpu })?;
        match self.device(gpu)?.set_mig_mode(mode.as_nvml()) {
            Ok(()) => Ok(()),
            Err(nvml::Error::NotSupported) => error::NotCapableSnafu { gpu }.fail(),
            Err(source) => Err(source).context(error::NvmlSnafu {
                op: "set MIG mode",
                gpu,
            }),
        }
    }

    fn is_mig_mode_change_pending(&self, gpu: usize) -> Result<bool> {
        let _nvml = InitGuard::new(self.nvml).context(error::NvmlSnafu { op: "init", gpu })?;
        let (current, pending) = self
            .device(gpu)?
            .mig_mode()
            .context(error::NvmlSnafu {
                op: "get MIG mode",
                gpu,
            })?;
        Ok(current != pending)
    }
}

// PMC_BOOT_0 chip families with MIG support.
const MIG_CAPABLE_CHIPS: &[u32] = &[0x170, 0x180, 0x1B0];

fn chip_of(pmc_id: u32) -> u32 {
    (pmc_id >> 20) & 0x1FF
}

/// The driverless mode manager, poking BAR0 registers directly. GPUs are
/// indexed in PCI bus address order.
pub struct PciMigModeManager {
    gpus: Vec<PciDevice>,
}

impl PciMigModeManager {
    pub fn new() -> Result<Self> {
        let gpus = pci::enumerate_nvidia_gpus().context(error::EnumerateSnafu)?;
        Ok(Self::with_devices(gpus))
    }

    pub fn with_devices(gpus: Vec<PciDevice>) -> Self {
        Self { gpus }
    }

    pub fn devices(&self) -> &[PciDevice] {
        &self.gpus
    }

    fn gpu(&self, gpu: usize) -> Result<&PciDevice> {
        self.gpus.get(gpu).context(error::UnknownGpuSnafu { gpu })
    }

    fn open(&self, gpu: usize) -> Result<mmio::Bar0> {
        let bar0 = self.gpu(gpu)?.open_bar0().context(error::PciSnafu { gpu })?;
        bar0.wait_for_boot().context(error::MmioSnafu { gpu })?;
        Ok(bar0)
    }
}

impl MigModeManager for PciMigModeManager {
    fn is_mig_capable(&self, gpu: usize) -> Result<bool> {
        let bar0 = self.open(gpu)?;
        let pmc_id = bar0.read32(mmio::PMC_ID).context(error::MmioSnafu { gpu })?;
        Ok(MIG_CAPABLE_CHIPS.contains(&chip_of(pmc_id)))
    }

    fn get_mig_mode(&self, gpu: usize) -> Result<MigMode> {
        let bar0 = self.open(gpu)?;
        let check = bar0
            .read32(mmio::MIG_MODE_CHECK)
            .context(error::MmioSnafu { gpu })?;
        if check & mmio::MIG_MODE_CHECK_MASK != 0 {
            Ok(MigMode::Enabled)
        } else {
            Ok(MigMode::Disabled)
        }
    }

    fn set_mig_mode(&self, gpu: usize, mode: MigMode) -> Result<()> {
        ensure!(self.is_mig_capable(gpu)?, error::NotCapableSnafu { gpu });

        let bar0 = self.open(gpu)?;
        let bits = match mode {
            MigMode::Enabled => mmio::MIG_MODE_SET_ENABLE,
            MigMode::Disabled => mmio::MIG_MODE_SET_DISABLE,
        };
        let old = bar0
            .read32(mmio::MIG_MODE_SET)
            .context(error::MmioSnafu { gpu })?;
        let new = (old & !mmio::MIG_MODE_SET_MASK) | (bits << mmio::MIG_MODE_SET_SHIFT);
        bar0.write32(mmio::MIG_MODE_SET, new)
            .context(error::MmioSnafu { gpu })?;
        bar0.sync().context(error::MmioSnafu { gpu })
    }

    fn is_mig_mode_change_pending(&self, gpu: usize) -> Result<bool> {
        let bar0 = self.open(gpu)?;
        let set = bar0
            .read32(mmio::MIG_MODE_SET)
            .context(error::MmioSnafu { gpu })?;
        let requested = match (set & mmio::MIG_MODE_SET_MASK) >> mmio::MIG_MODE_SET_SHIFT {
            mmio::MIG_MODE_SET_ENABLE => MigMode::Enabled,
            mmio::MIG_MODE_SET_DISABLE => MigMode::Disabled,
            // No mode change has ever been requested through this register.
            _ => return Ok(false),
        };
        Ok(requested != self.get_mig_mode(gpu)?)
    }
}

type Result<T, E = error::Error> = std::result::Result<T, E>;

mod error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display("GPU {} is not MIG capable", gpu))]
        NotCapable { gpu: usize },

        #[snafu(display("No GPU with index {}", gpu))]
        UnknownGpu { gpu: usize },

        #[snafu(display("Unable to {} for GPU {}: {}", op, gpu, source))]
        Nvml {
            op: String,
            gpu: usize,
            source: crate::nvml::Error,
        },

        #[snafu(display("Unable to enumerate PCI GPUs: {}", source))]
        Enumerate { source: crate::pci::Error },

        #[snafu(display("Unable to access GPU {}: {}", gpu, source))]
        Pci {
            gpu: usize,
            source: crate::pci::Error,
        },

        #[snafu(display("BAR0 access failed for GPU {}: {}", gpu, source))]
        Mmio {
            gpu: usize,
            source: crate::pci::mmio::Error,
        },
    }
}

pub use error::Error;

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=
