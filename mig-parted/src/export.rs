//! Export of the node's current MIG state as a canonical config spec.

use std::collections::BTreeMap;

use snafu::ResultExt;

use crate::apply::enumerate_gpus_nvml;
use crate::mig::config::{MigConfigManager, NvmlMigConfigManager};
use crate::mig::mode::{MigModeManager, NvmlMigModeManager};
use crate::mig::MigMode;
use crate::nvml::Nvml;
use crate::types::spec::SPEC_VERSION;
use crate::types::{normalize, DeviceFilter, DeviceSelector, MigConfig, MigConfigSpec, Spec};

pub const DEFAULT_EXPORT_LABEL: &str = "current";

/// Build a spec whose single config reproduces the node's current state.
pub fn export_spec(nvml: &dyn Nvml, label: &str) -> Result<Spec> {
    let gpus = enumerate_gpus_nvml(nvml).context(error::EnumerateSnafu)?;
    let mode_manager = NvmlMigModeManager::new(nvml);
    let config_manager = NvmlMigConfigManager::new(nvml);

    let mut specs = Vec::new();
    let mut devices = Vec::new();
    for gpu in &gpus {
        devices.push((gpu.index, gpu.device_id));

        let mut mig_enabled = false;
        let mut mig_devices = MigConfig::new();
        if mode_manager
            .is_mig_capable(gpu.index)
            .context(error::ModeSnafu)?
        {
            mig_enabled = mode_manager
                .get_mig_mode(gpu.index)
                .context(error::ModeSnafu)?
                == MigMode::Enabled;
            if mig_enabled {
                mig_devices = config_manager
                    .get_mig_config(gpu.index)
                    .context(error::ConfigSnafu)?;
            }
        }

        specs.push(MigConfigSpec {
            device_filter: DeviceFilter::Devices(vec![gpu.device_id]),
            devices: DeviceSelector::Indices(vec![gpu.index]),
            mig_enabled,
            mig_devices,
        });
    }

    let mut mig_configs = BTreeMap::new();
    mig_configs.insert(label.to_string(), normalize(&specs, &devices));
    Ok(Spec {
        version: SPEC_VERSION.to_string(),
        mig_configs,
    })
}

type Result<T, E = error::Error> = std::result::Result<T, E>;

mod error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display("Unable to enumerate GPUs: {}", source))]
        Enumerate { source: crate::apply::Error },

        #[snafu(display("{}", source))]
        Mode { source: crate::mig::mode::Error },

        #[snafu(display("{}", source))]
        Config { source: crate::mig::config::Error },
    }
}

pub use error::Error;

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=
