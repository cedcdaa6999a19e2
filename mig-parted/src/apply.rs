//! The top-level driver: walk the GPUs a selected config names, converge
//! MIG mode (resetting GPUs as needed), then converge the instance layout.
//! `assert` has the same shape but reports instead of mutating.

use itertools::Itertools;
use log::{debug, info};
use snafu::{OptionExt, ResultExt};

use crate::command::command;
use crate::mig::config::{MigConfigManager, NvmlMigConfigManager};
use crate::mig::mode::{is_nvidia_module_loaded, new_mig_mode_manager, MigModeManager};
use crate::mig::MigMode;
use crate::nvml::{InitGuard, Nvml};
use crate::pci;
use crate::types::{DeviceId, DeviceSelector, MigConfigSpec};

/// One GPU as seen by the selection walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuLocation {
    pub index: usize,
    pub device_id: DeviceId,
    pub pci_address: String,
}

/// Enumerate the node's GPUs through the driver when it is loaded, and
/// through sysfs otherwise. Both paths yield the same index order on nodes
/// with default bus-order enumeration.
pub fn enumerate_gpus(nvml: &dyn Nvml) -> Result<Vec<GpuLocation>> {
    if is_nvidia_module_loaded() {
        enumerate_gpus_nvml(nvml)
    } else {
        enumerate_gpus_pci()
    }
}

pub fn enumerate_gpus_nvml(nvml: &dyn Nvml) -> Result<Vec<GpuLocation>> {
    let _nvml = InitGuard::new(nvml).context(error::NvmlSnafu { op: "init" })?;
    let count = nvml
        .device_count()
        .context(error::NvmlSnafu { op: "count devices" })?;

    let mut gpus = Vec::with_capacity(count as usize);
    for index in 0..count {
        let device = nvml.device_by_index(index).context(error::NvmlSnafu {
            op: "get device handle",
        })?;
        gpus.push(GpuLocation {
            index: index as usize,
            device_id: DeviceId::from_u32(
                device
                    .pci_device_id()
                    .context(error::NvmlSnafu { op: "get PCI info" })?,
            ),
            pci_address: device
                .pci_bus_id()
                .context(error::NvmlSnafu { op: "get PCI info" })?,
        });
    }
    Ok(gpus)
}

pub fn enumerate_gpus_pci() -> Result<Vec<GpuLocation>> {
    let devices = pci::enumerate_nvidia_gpus().context(error::PciEnumerateSnafu)?;
    Ok(devices
        .into_iter()
        .enumerate()
        .map(|(index, device)| GpuLocation {
            index,
            device_id: device.device_id(),
            pci_address: device.address().to_string(),
        })
        .collect())
}

/// The `(spec, gpu)` pairs a selected config applies to, in spec order then
/// GPU order.
pub fn selected_gpus<'a>(
    specs: &'a [MigConfigSpec],
    gpus: &'a [GpuLocation],
) -> Vec<(usize, &'a GpuLocation)> {
    let mut selected = Vec::new();
    for (spec_index, spec) in specs.iter().enumerate() {
        for gpu in gpus {
            if spec.matches_device_filter(gpu.device_id) && spec.matches_devices(gpu.index) {
                selected.push((spec_index, gpu));
            }
        }
    }
    selected
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ApplyOptions {
    pub mode_only: bool,
    pub skip_reset: bool,
}

pub struct Applier<'a> {
    nvml: &'a dyn Nvml,
    mode_manager: Box<dyn MigModeManager + 'a>,
    gpus: Vec<GpuLocation>,
}

impl<'a> Applier<'a> {
    pub fn new(nvml: &'a dyn Nvml) -> Result<Self> {
        let mode_manager = new_mig_mode_manager(nvml).context(error::ModeSnafu)?;
        let gpus = enumerate_gpus(nvml)?;
        Ok(Self {
            nvml,
            mode_manager,
            gpus,
        })
    }

    /// Assemble an applier from parts, for callers that pick their own
    /// backend or device inventory.
    pub fn from_parts(
        nvml: &'a dyn Nvml,
        mode_manager: Box<dyn MigModeManager + 'a>,
        gpus: Vec<GpuLocation>,
    ) -> Self {
        Self {
            nvml,
            mode_manager,
            gpus,
        }
    }

    pub fn gpus(&self) -> &[GpuLocation] {
        &self.gpus
    }

    /// Converge every selected GPU onto its spec, mode first.
    pub fn apply(&self, specs: &[MigConfigSpec], options: ApplyOptions) -> Result<()> {
        let pending = self.apply_mig_mode(specs)?;
        if !pending.is_empty() {
            if options.skip_reset {
                info!("skipping reset of GPUs with pending mode changes: {:?}", pending);
            } else {
                self.reset_gpus(&pending)?;
            }
        }
        if options.mode_only {
            return Ok(());
        }
        self.apply_mig_config(specs)
    }

    /// Check the node against the selected config without mutating it.
    pub fn assert(&self, specs: &[MigConfigSpec], options: ApplyOptions) -> Result<()> {
        self.assert_mig_mode(specs)?;
        if options.mode_only {
            return Ok(());
        }
        self.assert_mig_config(specs)
    }

    /// Converge MIG mode on every selected GPU. Returns the indices whose
    /// change is pending a reset.
    pub fn apply_mig_mode(&self, specs: &[MigConfigSpec]) -> Result<Vec<usize>> {
        let mut pending = Vec::new();
        for (spec_index, gpu) in selected_gpus(specs, &self.gpus) {
            let spec = &specs[spec_index];
            let desired = desired_mode(spec);

            if !self.mode_manager.is_mig_capable(gpu.index).context(error::ModeSnafu)? {
                if desired == MigMode::Disabled || matches_every_device(spec) {
                    debug!("GPU {} is not MIG capable; nothing to do", gpu.index);
                    continue;
                }
                return error::NotCapableSnafu { gpu: gpu.index }.fail();
            }

            let current = self
                .mode_manager
                .get_mig_mode(gpu.index)
                .context(error::ModeSnafu)?;
            if current != desired {
                info!("setting MIG mode {} on GPU {}", desired, gpu.index);
                self.mode_manager
                    .set_mig_mode(gpu.index, desired)
                    .context(error::ModeSnafu)?;
            }
            if self
                .mode_manager
                .is_mig_mode_change_pending(gpu.index)
                .context(error::ModeSnafu)?
                && !pending.contains(&gpu.index)
            {
                pending.push(gpu.index);
            }
        }
        Ok(pending)
    }

    /// Reset the given GPUs so pending mode changes take effect.
    pub fn reset_gpus(&self, pending: &[usize]) -> Result<()> {
        if pending.is_empty() {
            return Ok(());
        }
        if is_nvidia_module_loaded() {
            let ids = pending.iter().join(",");
            info!("resetting GPUs {} via the driver", ids);
            command("nvidia-smi", ["--gpu-reset", "-i", &ids])
                .context(error::ResetCommandSnafu)?;
            return Ok(());
        }

        for &index in pending {
            let gpu = self
                .gpus
                .iter()
                .find(|gpu| gpu.index == index)
                .context(error::UnknownGpuSnafu { gpu: index })?;
            info!("resetting GPU {} at {}", index, gpu.pci_address);
            let device = pci::PciDevice::from_address(&gpu.pci_address)
                .context(error::PciResetSnafu { gpu: index })?;
            device.reset().context(error::PciResetSnafu { gpu: index })?;
        }
        Ok(())
    }

    /// Converge the instance layout on every selected, MIG-enabled GPU.
    pub fn apply_mig_config(&self, specs: &[MigConfigSpec]) -> Result<()> {
        let config_manager = NvmlMigConfigManager::new(self.nvml);
        for (spec_index, gpu) in selected_gpus(specs, &self.gpus) {
            let spec = &specs[spec_index];
            if !spec.mig_enabled || spec.mig_devices.is_empty() {
                continue;
            }
            let current = config_manager
                .get_mig_config(gpu.index)
                .context(error::ConfigSnafu)?;
            if current.equals(&spec.mig_devices) {
                debug!("GPU {} already matches the requested layout", gpu.index);
                continue;
            }
            info!("applying MIG layout on GPU {}", gpu.index);
            config_manager
                .set_mig_config(gpu.index, &spec.mig_devices)
                .context(error::ConfigSnafu)?;
        }
        Ok(())
    }

    pub fn assert_mig_mode(&self, specs: &[MigConfigSpec]) -> Result<()> {
        for (spec_index, gpu) in selected_gpus(specs, &self.gpus) {
            let spec = &specs[spec_index];
            let desired = desired_mode(spec);

            if !self.mode_manager.is_mig_capable(gpu.index).context(error::ModeSnafu)? {
                if desired == MigMode::Disabled || matches_every_device(spec) {
                    continue;
                }
                return error::ModeMismatchSnafu { gpu: gpu.index }.fail();
            }
            let current = self
                .mode_manager
                .get_mig_mode(gpu.index)
                .context(error::ModeSnafu)?;
            if current != desired {
                return error::ModeMismatchSnafu { gpu: gpu.index }.fail();
            }
        }
        Ok(())
    }

    pub fn assert_mig_config(&self, specs: &[MigConfigSpec]) -> Result<()> {
        let config_manager = NvmlMigConfigManager::new(self.nvml);
        for (spec_index, gpu) in selected_gpus(specs, &self.gpus) {
            let spec = &specs[spec_index];
            if !spec.mig_enabled || spec.mig_devices.is_empty() {
                continue;
            }
            let current = config_manager
                .get_mig_config(gpu.index)
                .context(error::ConfigSnafu)?;
            if !current.equals(&spec.mig_devices) {
                return error::ConfigMismatchSnafu { gpu: gpu.index }.fail();
            }
        }
        Ok(())
    }
}

fn desired_mode(spec: &MigConfigSpec) -> MigMode {
    if spec.mig_enabled {
        MigMode::Enabled
    } else {
        MigMode::Disabled
    }
}

fn matches_every_device(spec: &MigConfigSpec) -> bool {
    spec.device_filter.is_all() && matches!(spec.devices, DeviceSelector::All)
}

type Result<T, E = error::Error> = std::result::Result<T, E>;

mod error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display("Cannot enable MIG on GPU {}: not MIG capable", gpu))]
        NotCapable { gpu: usize },

        #[snafu(display("MIG mode of GPU {} does not match the selected config", gpu))]
        ModeMismatch { gpu: usize },

        #[snafu(display("MIG layout of GPU {} does not match the selected config", gpu))]
        ConfigMismatch { gpu: usize },

        #[snafu(display("Unable to {}: {}", op, source))]
        Nvml {
            op: String,
            source: crate::nvml::Error,
        },

        #[snafu(display("Unable to enumerate PCI GPUs: {}", source))]
        PciEnumerate { source: crate::pci::Error },

        #[snafu(display("{}", source))]
        Mode { source: crate::mig::mode::Error },

        #[snafu(display("{}", source))]
        Config { source: crate::mig::config::Error },

        #[snafu(display("No GPU with index {}", gpu))]
        UnknownGpu { gpu: usize },

        #[snafu(display("GPU reset failed: {}", source))]
        ResetCommand { source: crate::command::Error },

        #[snafu(display("Unable to reset GPU {}: {}", gpu, source))]
        PciReset {
            gpu: usize,
            source: crate::pci::Error,
        },
    }
}

pub use error::Error;

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=
