//! Enumeration of the MIG profiles each GPU on the node supports, used to
//! generate a canonical config spec.

use std::collections::BTreeMap;
use std::env;

use log::debug;
use snafu::ResultExt;

use crate::nvml::{self, InitGuard, Nvml};
use crate::types::{DeviceId, MigProfile};

/// Disables the substituted profile table for boards whose driver reports
/// bad instance counts.
pub const A30_WORKAROUND_ENV: &str = "MIG_PARTED_A30_PROFILE_WORKAROUND";

const A30_DEVICE_ID: u32 = 0x20B710DE;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredProfile {
    pub profile: MigProfile,
    pub max_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredGpu {
    pub device_id: DeviceId,
    pub profiles: Vec<DiscoveredProfile>,
}

/// Walk the node's MIG-capable GPUs and report the profiles each supports
/// with their maximum instance counts. GPUs without MIG support are absent
/// from the result.
pub fn discover(nvml: &dyn Nvml) -> Result<BTreeMap<usize, DiscoveredGpu>> {
    let a30_workaround = env::var(A30_WORKAROUND_ENV)
        .map(|value| value != "false")
        .unwrap_or(true);
    discover_with_options(nvml, a30_workaround)
}

pub fn discover_with_options(
    nvml: &dyn Nvml,
    a30_workaround: bool,
) -> Result<BTreeMap<usize, DiscoveredGpu>> {
    let _nvml = InitGuard::new(nvml).context(error::NvmlSnafu { op: "init" })?;

    let mut discovered = BTreeMap::new();
    let count = nvml
        .device_count()
        .context(error::NvmlSnafu { op: "count devices" })?;
    for index in 0..count {
        let device = nvml.device_by_index(index).context(error::NvmlSnafu {
            op: "get device handle",
        })?;
        if let Err(nvml::Error::NotSupported) = device.mig_mode() {
            debug!("device {} is not MIG capable; skipping discovery", index);
            continue;
        }

        let device_id = DeviceId::from_u32(
            device
                .pci_device_id()
                .context(error::NvmlSnafu { op: "get PCI info" })?,
        );

        let profiles = if a30_workaround && device_id.as_u32() == A30_DEVICE_ID {
            a30_profiles()?
        } else {
            device_profiles(device.as_ref())?
        };

        discovered.insert(index as usize, DiscoveredGpu {
            device_id,
            profiles,
        });
    }
    Ok(discovered)
}

fn device_profiles(device: &dyn nvml::Device) -> Result<Vec<DiscoveredProfile>> {
    let mut profiles = Vec::new();
    for gi_profile in 0..nvml::GPU_INSTANCE_PROFILE_COUNT {
        let (g, me) = match gi_profile_geometry(gi_profile) {
            Some(geometry) => geometry,
            None => continue,
        };
        let info = match device.gpu_instance_profile_info(gi_profile) {
            Ok(info) => info,
            Err(nvml::Error::NotSupported) | Err(nvml::Error::InvalidArgument) => continue,
            Err(source) => {
                return Err(source).context(error::NvmlSnafu {
                    op: "get GPU instance profile info",
                })
            }
        };

        let attrs = if me {
            vec![crate::types::profile::ATTRIBUTE_MEDIA_EXTENSIONS]
        } else {
            Vec::new()
        };
        let profile = MigProfile::new(g, g, info.memory_size_mb, attrs)
            .context(error::ProfileSnafu)?;
        profiles.push(DiscoveredProfile {
            profile,
            max_count: info.instance_count as usize,
        });
    }
    profiles.sort_by(|a, b| a.profile.cmp(&b.profile));
    Ok(profiles)
}

// The driver reports wrong instance counts for these profiles, so the
// table is fixed here.
fn a30_profiles() -> Result<Vec<DiscoveredProfile>> {
    let table = [
        ("1g.6gb", 4),
        ("1g.6gb+me", 1),
        ("2g.12gb", 2),
        ("2g.12gb+me", 1),
        ("4g.24gb", 1),
    ];
    let mut profiles = Vec::new();
    for (name, max_count) in table {
        profiles.push(DiscoveredProfile {
            profile: name.parse().context(error::ProfileSnafu)?,
            max_count,
        });
    }
    profiles.sort_by(|a, b| a.profile.cmp(&b.profile));
    Ok(profiles)
}

/// GPU-slice count and media-extensions flag for a GPU instance profile
/// index, or None for indices that cannot appear as top-level devices.
fn gi_profile_geometry(gi_profile: u32) -> Option<(u32, bool)> {
    match gi_profile {
        nvml::GPU_INSTANCE_PROFILE_1_SLICE => Some((1, false)),
        nvml::GPU_INSTANCE_PROFILE_2_SLICE => Some((2, false)),
        nvml::GPU_INSTANCE_PROFILE_3_SLICE => Some((3, false)),
        nvml::GPU_INSTANCE_PROFILE_4_SLICE => Some((4, false)),
        nvml::GPU_INSTANCE_PROFILE_6_SLICE => Some((6, false)),
        nvml::GPU_INSTANCE_PROFILE_7_SLICE => Some((7, false)),
        nvml::GPU_INSTANCE_PROFILE_8_SLICE => Some((8, false)),
        nvml::GPU_INSTANCE_PROFILE_1_SLICE_REV1 => Some((1, true)),
        nvml::GPU_INSTANCE_PROFILE_2_SLICE_REV1 => Some((2, true)),
        _ => None,
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

        #[snafu(display("Invalid MIG profile: {}", source))]
        Profile {
            source: crate::types::profile::Error,
        },
    }
}

pub use error::Error;

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

#[cfg(test)]
mod test {
    use super::*;
    use crate::nvml::mock::{MockDeviceState, MockNvml};

    fn names(gpu: &DiscoveredGpu) -> Vec<String> {
        gpu.profiles
            .iter()
            .map(|p| format!("{}:{}", p.profile, p.max_count))
            .collect()
    }

    #[test]
    fn discovers_a100_profiles() {
        let nvml = MockNvml::a100_node(1);
        let discovered = discover_with_options(&nvml, true).unwrap();
        assert_eq!(
            names(&discovered[&0]),
            [
                "7g.40gb:1",
                "4g.20gb:1",
                "3g.20gb:2",
                "2g.10gb:3",
                "1g.5gb:7"
            ]
        );
    }

    #[test]
    fn skips_non_mig_devices() {
        let nvml = MockNvml::new(vec![
            MockDeviceState::not_capable(0),
            MockDeviceState::a100(1),
        ]);
        let discovered = discover_with_options(&nvml, true).unwrap();
        assert!(!discovered.contains_key(&0));
        assert!(discovered.contains_key(&1));
    }

    #[test]
    fn a30_profile_table_overrides_the_driver() {
        let nvml = MockNvml::new(vec![MockDeviceState::a30(0)]);
        let discovered = discover_with_options(&nvml, true).unwrap();
        assert_eq!(
            names(&discovered[&0]),
            [
                "4g.24gb:1",
                "2g.12gb:2",
                "2g.12gb+me:1",
                "1g.6gb:4",
                "1g.6gb+me:1"
            ]
        );
    }

    #[test]
    fn a30_override_can_be_disabled() {
        let nvml = MockNvml::new(vec![MockDeviceState::a30(0)]);
        let discovered = discover_with_options(&nvml, false).unwrap();
        // The driver-reported (wrong) count of 1 shows through.
        assert!(names(&discovered[&0]).contains(&"1g.6gb:1".to_string()));
    }
}
