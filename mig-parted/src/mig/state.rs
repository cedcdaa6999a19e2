//! Atomic fetch/restore of the full MIG state of the node's GPUs, used for
//! checkpointing. Snapshots record the profile indices and placements
//! needed to recreate the exact layout.

use log::debug;
use serde::{Deserialize, Serialize};
use snafu::{ensure, ResultExt};

use super::MigMode;
use crate::nvml::{self, GpuInstancePlacement, InitGuard, Nvml};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigState {
    pub devices: Vec<DeviceState>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceState {
    pub uuid: String,
    pub mig_mode: MigMode,
    pub gpu_instances: Vec<GpuInstanceState>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GpuInstanceState {
    pub profile_id: u32,
    pub placement: Placement,
    pub compute_instances: Vec<ComputeInstanceState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Placement {
    pub start: u32,
    pub size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComputeInstanceState {
    pub profile_id: u32,
    pub eng_profile_id: u32,
}

pub struct MigStateManager<'a> {
    nvml: &'a dyn Nvml,
}

impl<'a> MigStateManager<'a> {
    pub fn new(nvml: &'a dyn Nvml) -> Self {
        Self { nvml }
    }

    /// Snapshot every MIG-capable device on the node.
    pub fn fetch(&self) -> Result<MigState> {
        let _nvml = InitGuard::new(self.nvml).context(error::NvmlSnafu { op: "init" })?;

        let mut devices = Vec::new();
        let count = self
            .nvml
            .device_count()
            .context(error::NvmlSnafu { op: "count devices" })?;
        for index in 0..count {
            let device = self
                .nvml
                .device_by_index(index)
                .context(error::NvmlSnafu {
                    op: "get device handle",
                })?;
            let (current, _) = match device.mig_mode() {
                Ok(modes) => modes,
                Err(nvml::Error::NotSupported) => {
                    debug!("device {} is not MIG capable; not checkpointing it", index);
                    continue;
                }
                Err(source) => {
                    return Err(source).context(error::NvmlSnafu { op: "get MIG mode" })
                }
            };
            let uuid = device
                .uuid()
                .context(error::NvmlSnafu { op: "get UUID" })?;
            let mig_mode = MigMode::from_nvml(current);

            let mut gpu_instances = Vec::new();
            if mig_mode == MigMode::Enabled {
                gpu_instances = self.fetch_gpu_instances(device.as_ref())?;
            }

            devices.push(DeviceState {
                uuid,
                mig_mode,
                gpu_instances,
            });
        }

        Ok(MigState { devices })
    }

    fn fetch_gpu_instances(&self, device: &dyn nvml::Device) -> Result<Vec<GpuInstanceState>> {
        let mut states = Vec::new();
        for gi_profile in 0..nvml::GPU_INSTANCE_PROFILE_COUNT {
            let gi_info = match device.gpu_instance_profile_info(gi_profile) {
                Ok(info) => info,
                Err(nvml::Error::NotSupported) | Err(nvml::Error::InvalidArgument) => continue,
                Err(source) => {
                    return Err(source).context(error::NvmlSnafu {
                        op: "get GPU instance profile info",
                    })
                }
            };
            let gis = device.gpu_instances(&gi_info).context(error::NvmlSnafu {
                op: "enumerate GPU instances",
            })?;
            for gi in gis {
                let info = gi.info().context(error::NvmlSnafu {
                    op: "get GPU instance info",
                })?;
                let compute_instances = self.fetch_compute_instances(gi.as_ref())?;
                states.push(GpuInstanceState {
                    profile_id: gi_profile,
                    placement: Placement {
                        start: info.placement.start,
                        size: info.placement.size,
                    },
                    compute_instances,
                });
            }
        }
        Ok(states)
    }

    fn fetch_compute_instances(
        &self,
        gi: &dyn nvml::GpuInstance,
    ) -> Result<Vec<ComputeInstanceState>> {
        let mut states = Vec::new();
        for ci_profile in 0..nvml::COMPUTE_INSTANCE_PROFILE_COUNT {
            for eng_profile in 0..nvml::COMPUTE_INSTANCE_ENGINE_PROFILE_COUNT {
                let ci_info = match gi.compute_instance_profile_info(ci_profile, eng_profile) {
                    Ok(info) => info,
                    Err(nvml::Error::NotSupported) | Err(nvml::Error::InvalidArgument) => continue,
                    Err(source) => {
                        return Err(source).context(error::NvmlSnafu {
                            op: "get compute instance profile info",
                        })
                    }
                };
                let cis = gi.compute_instances(&ci_info).context(error::NvmlSnafu {
                    op: "enumerate compute instances",
                })?;
                for _ in cis {
                    states.push(ComputeInstanceState {
                        profile_id: ci_profile,
                        eng_profile_id: eng_profile,
                    });
                }
            }
        }
        Ok(states)
    }

    /// Set each snapshotted device's mode. Returns the indices of devices
    /// whose change is pending a GPU reset.
    pub fn restore_mode(&self, state: &MigState) -> Result<Vec<usize>> {
        let _nvml = InitGuard::new(self.nvml).context(error::NvmlSnafu { op: "init" })?;

        let mut pending = Vec::new();
        for device_state in &state.devices {
            let (index, device) = self.device_by_uuid(&device_state.uuid)?;
            device
                .set_mig_mode(device_state.mig_mode.as_nvml())
                .context(error::NvmlSnafu { op: "set MIG mode" })?;
            let (current, _) = device
                .mig_mode()
                .context(error::NvmlSnafu { op: "get MIG mode" })?;
            if MigMode::from_nvml(current) != device_state.mig_mode {
                pending.push(index);
            }
        }
        Ok(pending)
    }

    /// Recreate each snapshotted device's instance layout, placements
    /// included. Modes must already be restored.
    pub fn restore_config(&self, state: &MigState) -> Result<()> {
        let _nvml = InitGuard::new(self.nvml).context(error::NvmlSnafu { op: "init" })?;

        for device_state in &state.devices {
            if device_state.mig_mode != MigMode::Enabled {
                continue;
            }
            let (_, device) = self.device_by_uuid(&device_state.uuid)?;
            let (current, _) = device
                .mig_mode()
                .context(error::NvmlSnafu { op: "get MIG mode" })?;
            ensure!(
                current == nvml::MIG_ENABLE,
                error::ModeDisabledSnafu {
                    uuid: &device_state.uuid
                }
            );

            self.clear_device(device.as_ref())?;

            for gi_state in &device_state.gpu_instances {
                let gi_info = device
                    .gpu_instance_profile_info(gi_state.profile_id)
                    .context(error::NvmlSnafu {
                        op: "get GPU instance profile info",
                    })?;
                let placement = GpuInstancePlacement {
                    start: gi_state.placement.start,
                    size: gi_state.placement.size,
                };
                let gi = device
                    .create_gpu_instance_with_placement(&gi_info, &placement)
                    .context(error::NvmlSnafu {
                        op: "create GPU instance",
                    })?;
                for ci_state in &gi_state.compute_instances {
                    let ci_info = gi
                        .compute_instance_profile_info(
                            ci_state.profile_id,
                            ci_state.eng_profile_id,
                        )
                        .context(error::NvmlSnafu {
                            op: "get compute instance profile info",
                        })?;
                    gi.create_compute_instance(&ci_info)
                        .context(error::NvmlSnafu {
                            op: "create compute instance",
                        })?;
                }
            }
        }
        Ok(())
    }

    fn clear_device(&self, device: &dyn nvml::Device) -> Result<()> {
        for gi_profile in 0..nvml::GPU_INSTANCE_PROFILE_COUNT {
            let gi_info = match device.gpu_instance_profile_info(gi_profile) {
                Ok(info) => info,
                Err(nvml::Error::NotSupported) | Err(nvml::Error::InvalidArgument) => continue,
                Err(source) => {
                    return Err(source).context(error::NvmlSnafu {
                        op: "get GPU instance profile info",
                    })
                }
            };
            let gis = device.gpu_instances(&gi_info).context(error::NvmlSnafu {
                op: "enumerate GPU instances",
            })?;
            for gi in gis {
                for ci_profile in 0..nvml::COMPUTE_INSTANCE_PROFILE_COUNT {
                    for eng_profile in 0..nvml::COMPUTE_INSTANCE_ENGINE_PROFILE_COUNT {
                        let ci_info =
                            match gi.compute_instance_profile_info(ci_profile, eng_profile) {
                                Ok(info) => info,
                                Err(nvml::Error::NotSupported)
                                | Err(nvml::Error::InvalidArgument) => continue,
                                Err(source) => {
                                    return Err(source).context(error::NvmlSnafu {
                                        op: "get compute instance profile info",
                                    })
                                }
                            };
                        let cis = gi.compute_instances(&ci_info).context(error::NvmlSnafu {
                            op: "enumerate compute instances",
                        })?;
                        for ci in cis {
                            ci.destroy().context(error::NvmlSnafu {
                                op: "destroy compute instance",
                            })?;
                        }
                    }
                }
                gi.destroy().context(error::NvmlSnafu {
                    op: "destroy GPU instance",
                })?;
            }
        }
        Ok(())
    }

    fn device_by_uuid(&self, uuid: &str) -> Result<(usize, Box<dyn nvml::Device>)> {
        let count = self
            .nvml
            .device_count()
            .context(error::NvmlSnafu { op: "count devices" })?;
        for index in 0..count {
            let device = self
                .nvml
                .device_by_index(index)
                .context(error::NvmlSnafu {
                    op: "get device handle",
                })?;
            if device.uuid().context(error::NvmlSnafu { op: "get UUID" })? == uuid {
                return Ok((index as usize, device));
            }
        }
        error::UnknownDeviceSnafu { uuid }.fail()
    }
}

type Result<T, E = error::Error> = std::result::Result<T, E>;

mod error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display("Unable to {}: {}", op, source))]
        Nvml {
            op: String,
            source: crate::nvml::Error,
        },

        #[snafu(display("No device with UUID '{}' on this node", uuid))]
        UnknownDevice { uuid: String },

        #[snafu(display("MIG mode is disabled on device '{}'", uuid))]
        ModeDisabled { uuid: String },
    }
}

pub use error::Error;

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=
