//! Emission of a canonical config spec from hardware discovery: one config
//! per supported profile, plus the stock `all-disabled`, `all-enabled`,
//! and `all-balanced` entries.

use std::collections::{BTreeMap, BTreeSet};

use snafu::ResultExt;

use crate::apply::{enumerate_gpus_nvml, GpuLocation};
use crate::mig::discover::{discover, DiscoveredGpu};
use crate::nvml::Nvml;
use crate::types::spec::SPEC_VERSION;
use crate::types::{
    normalize, DeviceFilter, DeviceId, DeviceSelector, MigConfig, MigConfigSpec, MigProfile, Spec,
};

pub fn generate_spec(nvml: &dyn Nvml) -> Result<Spec> {
    let discovered = discover(nvml).context(error::DiscoverSnafu)?;
    let gpus = enumerate_gpus_nvml(nvml).context(error::EnumerateSnafu)?;
    Ok(build_spec(&discovered, &gpus))
}

fn build_spec(discovered: &BTreeMap<usize, DiscoveredGpu>, gpus: &[GpuLocation]) -> Spec {
    let devices: Vec<(usize, DeviceId)> = gpus.iter().map(|g| (g.index, g.device_id)).collect();
    let distinct_ids: BTreeSet<DeviceId> = gpus.iter().map(|g| g.device_id).collect();
    let multiple_ids = distinct_ids.len() > 1;

    let mut mig_configs = BTreeMap::new();

    mig_configs.insert(
        "all-disabled".to_string(),
        vec![MigConfigSpec {
            device_filter: DeviceFilter::All,
            devices: DeviceSelector::All,
            mig_enabled: false,
            mig_devices: MigConfig::new(),
        }],
    );
    mig_configs.insert(
        "all-enabled".to_string(),
        vec![MigConfigSpec {
            device_filter: DeviceFilter::All,
            devices: DeviceSelector::All,
            mig_enabled: true,
            mig_devices: MigConfig::new(),
        }],
    );

    let all_profiles: BTreeSet<MigProfile> = discovered
        .values()
        .flat_map(|gpu| gpu.profiles.iter().map(|p| p.profile.clone()))
        .collect();

    for profile in &all_profiles {
        let specs = per_profile_specs(discovered, profile, multiple_ids);
        let label = format!("all-{}", profile.to_string().replace('+', "."));
        mig_configs.insert(label, normalize(&specs, &devices));
    }

    let balanced = balanced_specs(discovered, multiple_ids);
    if !balanced.is_empty() {
        mig_configs.insert("all-balanced".to_string(), normalize(&balanced, &devices));
    }

    Spec {
        version: SPEC_VERSION.to_string(),
        mig_configs,
    }
}

/// One spec per distinct (max-count, device-id) group of GPUs supporting
/// `profile`, with a device filter only on heterogeneous systems.
fn per_profile_specs(
    discovered: &BTreeMap<usize, DiscoveredGpu>,
    profile: &MigProfile,
    multiple_ids: bool,
) -> Vec<MigConfigSpec> {
    let mut groups: Vec<((usize, DeviceId), Vec<usize>)> = Vec::new();
    for (&index, gpu) in discovered {
        let Some(found) = gpu.profiles.iter().find(|p| p.profile == *profile) else {
            continue;
        };
        let key = (found.max_count, gpu.device_id);
        match groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, indices)) => indices.push(index),
            None => groups.push((key, vec![index])),
        }
    }

    groups
        .into_iter()
        .map(|((max_count, device_id), indices)| MigConfigSpec {
            device_filter: if multiple_ids {
                DeviceFilter::Devices(vec![device_id])
            } else {
                DeviceFilter::All
            },
            devices: DeviceSelector::Indices(indices),
            mig_enabled: true,
            mig_devices: [(profile.clone(), max_count)].into_iter().collect(),
        })
        .collect()
}

/// A balanced mix per device: seven-slot boards get two 1-slice, one
/// 2-slice, and one 3-slice device; four-slot boards get two 1-slice and
/// one 2-slice. Devices missing any required base profile are skipped.
fn balanced_specs(
    discovered: &BTreeMap<usize, DiscoveredGpu>,
    multiple_ids: bool,
) -> Vec<MigConfigSpec> {
    let mut groups: Vec<(MigConfig, DeviceId, Vec<usize>)> = Vec::new();

    for (&index, gpu) in discovered {
        // The base variant with the largest max-count has the smallest
        // memory footprint.
        let base = |g: u32| {
            gpu.profiles
                .iter()
                .filter(|p| p.profile.g() == g && p.profile.attributes().is_empty())
                .max_by_key(|p| p.max_count)
        };
        let Some(one) = base(1) else { continue };
        let Some(two) = base(2) else { continue };

        let config: MigConfig = if one.max_count >= 7 {
            let Some(three) = base(3) else { continue };
            [
                (one.profile.clone(), 2),
                (two.profile.clone(), 1),
                (three.profile.clone(), 1),
            ]
            .into_iter()
            .collect()
        } else if one.max_count >= 4 {
            [(one.profile.clone(), 2), (two.profile.clone(), 1)]
                .into_iter()
                .collect()
        } else {
            continue;
        };

        let slot = groups
            .iter_mut()
            .find(|(c, id, _)| c.equals(&config) && *id == gpu.device_id);
        match slot {
            Some((_, _, indices)) => indices.push(index),
            None => groups.push((config, gpu.device_id, vec![index])),
        }
    }

    groups
        .into_iter()
        .map(|(config, device_id, indices)| MigConfigSpec {
            device_filter: if multiple_ids {
                DeviceFilter::Devices(vec![device_id])
            } else {
                DeviceFilter::All
            },
            devices: DeviceSelector::Indices(indices),
            mig_enabled: true,
            mig_devices: config,
        })
        .collect()
}

type Result<T, E = error::Error> = std::result::Result<T, E>;

mod error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display("Unable to discover MIG profiles: {}", source))]
        Discover {
            source: crate::mig::discover::Error,
        },

        #[snafu(display("Unable to enumerate GPUs: {}", source))]
        Enumerate { source: crate::apply::Error },
    }
}

pub use error::Error;

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

#[cfg(test)]
mod test {
    use super::*;
    use crate::mig::discover::discover_with_options;
    use crate::nvml::mock::{MockDeviceState, MockNvml};

    fn generate(nvml: &MockNvml) -> Spec {
        let discovered = discover_with_options(nvml, true).unwrap();
        let gpus = enumerate_gpus_nvml(nvml).unwrap();
        build_spec(&discovered, &gpus)
    }

    #[test]
    fn homogeneous_node_gets_compact_configs() {
        let nvml = MockNvml::a100_node(2);
        let spec = generate(&nvml);

        let labels: Vec<&str> = spec.mig_configs.keys().map(String::as_str).collect();
        assert_eq!(
            labels,
            [
                "all-1g.5gb",
                "all-2g.10gb",
                "all-3g.20gb",
                "all-4g.20gb",
                "all-7g.40gb",
                "all-balanced",
                "all-disabled",
                "all-enabled",
            ]
        );

        let ones = &spec.mig_configs["all-1g.5gb"];
        assert_eq!(ones.len(), 1);
        assert_eq!(ones[0].device_filter, DeviceFilter::All);
        assert_eq!(ones[0].devices, DeviceSelector::All);
        assert_eq!(ones[0].mig_devices.len(), 7);

        let balanced = &spec.mig_configs["all-balanced"];
        assert_eq!(balanced.len(), 1);
        let expected: MigConfig = [
            ("1g.5gb".parse().unwrap(), 2),
            ("2g.10gb".parse().unwrap(), 1),
            ("3g.20gb".parse().unwrap(), 1),
        ]
        .into_iter()
        .collect();
        assert!(balanced[0].mig_devices.equals(&expected));
    }

    #[test]
    fn heterogeneous_node_gets_device_filters() {
        let nvml = MockNvml::new(vec![
            MockDeviceState::a100(0),
            MockDeviceState::a30(1),
        ]);
        let spec = generate(&nvml);

        // A30-only profile names carry the attribute with a dot.
        assert!(spec.mig_configs.contains_key("all-1g.6gb.me"));

        let sixes = &spec.mig_configs["all-1g.6gb"];
        assert_eq!(sixes.len(), 1);
        assert_eq!(
            sixes[0].device_filter,
            DeviceFilter::Devices(vec!["0x20B710DE".parse().unwrap()])
        );
        assert_eq!(sixes[0].devices, DeviceSelector::All);
        assert_eq!(sixes[0].mig_devices.len(), 4);

        let balanced = &spec.mig_configs["all-balanced"];
        assert_eq!(balanced.len(), 2);
        let a30_balanced: MigConfig = [
            ("1g.6gb".parse().unwrap(), 2),
            ("2g.12gb".parse().unwrap(), 1),
        ]
        .into_iter()
        .collect();
        assert!(balanced
            .iter()
            .any(|spec| spec.mig_devices.equals(&a30_balanced)));
    }

    #[test]
    fn generated_spec_round_trips_through_the_parser() {
        let nvml = MockNvml::a100_node(2);
        let spec = generate(&nvml);
        let yaml = serde_yaml::to_string(&spec).unwrap();
        let back = Spec::from_slice(yaml.as_bytes()).unwrap();
        assert_eq!(spec, back);
    }
}
