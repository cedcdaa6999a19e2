use std::collections::BTreeMap;
use std::fmt;

use serde::de::{self, Deserializer, SeqAccess, Visitor};
use serde::ser::{SerializeSeq, Serializer};
use serde::{Deserialize, Serialize};
use snafu::{ensure, OptionExt, ResultExt};

use super::config::MigConfig;
use super::device_id::DeviceId;

pub const SPEC_VERSION: &str = "v1";

/// Which physical devices a config spec applies to, by PCI device id.
/// Collapses to the compact YAML/JSON form: absent, a single string, or a
/// list of strings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum DeviceFilter {
    #[default]
    All,
    Devices(Vec<DeviceId>),
}

impl DeviceFilter {
    pub fn is_all(&self) -> bool {
        matches!(self, Self::All)
    }

    pub fn matches(&self, id: DeviceId) -> bool {
        match self {
            Self::All => true,
            Self::Devices(ids) => ids.contains(&id),
        }
    }
}

impl Serialize for DeviceFilter {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::All => serializer.serialize_none(),
            Self::Devices(ids) if ids.len() == 1 => {
                serializer.serialize_str(&ids[0].to_string())
            }
            Self::Devices(ids) => {
                let mut seq = serializer.serialize_seq(Some(ids.len()))?;
                for id in ids {
                    seq.serialize_element(&id.to_string())?;
                }
                seq.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for DeviceFilter {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct FilterVisitor;

        impl<'de> Visitor<'de> for FilterVisitor {
            type Value = DeviceFilter;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a device id string or a list of device id strings")
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Self::Value, E> {
                let id = value.parse().map_err(de::Error::custom)?;
                Ok(DeviceFilter::Devices(vec![id]))
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let mut ids = Vec::new();
                while let Some(value) = seq.next_element::<String>()? {
                    ids.push(value.parse().map_err(de::Error::custom)?);
                }
                Ok(DeviceFilter::Devices(ids))
            }

            fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
                Ok(DeviceFilter::All)
            }

            fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
                Ok(DeviceFilter::All)
            }
        }

        deserializer.deserialize_any(FilterVisitor)
    }
}

/// Which GPU indices a config spec applies to: the literal `all` or a list
/// of integer indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceSelector {
    All,
    Indices(Vec<usize>),
}

impl DeviceSelector {
    pub fn matches(&self, index: usize) -> bool {
        match self {
            Self::All => true,
            Self::Indices(indices) => indices.contains(&index),
        }
    }
}

impl Serialize for DeviceSelector {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::All => serializer.serialize_str("all"),
            Self::Indices(indices) => {
                let mut seq = serializer.serialize_seq(Some(indices.len()))?;
                for index in indices {
                    seq.serialize_element(index)?;
                }
                seq.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for DeviceSelector {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct SelectorVisitor;

        impl<'de> Visitor<'de> for SelectorVisitor {
            type Value = DeviceSelector;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("the string \"all\" or a list of device indices")
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Self::Value, E> {
                if value == "all" {
                    Ok(DeviceSelector::All)
                } else {
                    Err(de::Error::custom(format!(
                        "invalid devices value '{}': expected \"all\" or a list",
                        value
                    )))
                }
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let mut indices = Vec::new();
                while let Some(index) = seq.next_element::<usize>()? {
                    indices.push(index);
                }
                Ok(DeviceSelector::Indices(indices))
            }
        }

        deserializer.deserialize_any(SelectorVisitor)
    }
}

/// One per-filter entry of a named MIG config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MigConfigSpec {
    #[serde(
        rename = "device-filter",
        default,
        skip_serializing_if = "DeviceFilter::is_all"
    )]
    pub device_filter: DeviceFilter,

    pub devices: DeviceSelector,

    #[serde(rename = "mig-enabled")]
    pub mig_enabled: bool,

    #[serde(rename = "mig-devices", default, skip_serializing_if = "MigConfig::is_empty")]
    pub mig_devices: MigConfig,
}

impl MigConfigSpec {
    pub fn matches_device_filter(&self, id: DeviceId) -> bool {
        self.device_filter.matches(id)
    }

    pub fn matches_devices(&self, index: usize) -> bool {
        self.devices.matches(index)
    }
}

/// The versioned, labeled set of MIG configs an operator selects from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Spec {
    pub version: String,

    #[serde(rename = "mig-configs")]
    pub mig_configs: BTreeMap<String, Vec<MigConfigSpec>>,
}

impl Spec {
    /// Parse a spec from YAML or JSON bytes and enforce the schema
    /// invariants. JSON parses through the YAML front end, which accepts it
    /// as a subset.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let spec: Self = serde_yaml::from_slice(bytes).context(error::ParseSnafu)?;
        spec.validate()?;
        Ok(spec)
    }

    fn validate(&self) -> Result<()> {
        ensure!(
            self.version == SPEC_VERSION,
            error::UnknownVersionSnafu {
                version: &self.version
            }
        );
        ensure!(!self.mig_configs.is_empty(), error::NoConfigsSnafu);

        for (label, specs) in &self.mig_configs {
            ensure!(!specs.is_empty(), error::EmptyConfigSnafu { label });
            for spec in specs {
                ensure!(
                    spec.mig_enabled || spec.mig_devices.is_empty(),
                    error::DevicesWithoutMigSnafu { label }
                );
            }
        }
        Ok(())
    }

    /// Resolve a selected config by label. When no label is given and
    /// exactly one config exists, that one is used.
    pub fn select(&self, label: Option<&str>) -> Result<&[MigConfigSpec]> {
        match label {
            Some(label) => self
                .mig_configs
                .get(label)
                .map(Vec::as_slice)
                .context(error::NotFoundSnafu { label }),
            None => {
                ensure!(
                    self.mig_configs.len() == 1,
                    error::NoSelectionSnafu {
                        count: self.mig_configs.len()
                    }
                );
                self.mig_configs
                    .values()
                    .next()
                    .map(Vec::as_slice)
                    .context(error::NoConfigsSnafu)
            }
        }
    }
}

/// Compact a list of config specs against the node's device inventory.
/// Specs sharing (filter, mig-enabled, mig-devices) have their index lists
/// unioned; a union covering every matching device collapses to `all`; and
/// when only one filter exists overall, filters are dropped entirely.
pub fn normalize(specs: &[MigConfigSpec], devices: &[(usize, DeviceId)]) -> Vec<MigConfigSpec> {
    let mut merged: Vec<MigConfigSpec> = Vec::new();

    for spec in specs {
        let existing = merged.iter_mut().find(|m| {
            m.device_filter == spec.device_filter
                && m.mig_enabled == spec.mig_enabled
                && m.mig_devices.equals(&spec.mig_devices)
        });
        match existing {
            Some(m) => {
                m.devices = union_selectors(&m.devices, &spec.devices);
            }
            None => merged.push(spec.clone()),
        }
    }

    for spec in &mut merged {
        let matching: Vec<usize> = devices
            .iter()
            .filter(|&&(_, id)| spec.device_filter.matches(id))
            .map(|&(index, _)| index)
            .collect();
        if let DeviceSelector::Indices(indices) = &spec.devices {
            let mut covered = indices.clone();
            covered.sort_unstable();
            covered.dedup();
            if covered == matching {
                spec.devices = DeviceSelector::All;
            } else {
                spec.devices = DeviceSelector::Indices(covered);
            }
        }
    }

    // A single shared filter that matches every device on the node carries
    // no information; drop it.
    let mut distinct: Vec<DeviceFilter> = Vec::new();
    for spec in &merged {
        if !distinct.contains(&spec.device_filter) {
            distinct.push(spec.device_filter.clone());
        }
    }
    if let [only] = distinct.as_slice() {
        if devices.iter().all(|&(_, id)| only.matches(id)) {
            for spec in &mut merged {
                spec.device_filter = DeviceFilter::All;
            }
        }
    }

    merged
}

fn union_selectors(a: &DeviceSelector, b: &DeviceSelector) -> DeviceSelector {
    match (a, b) {
        (DeviceSelector::All, _) | (_, DeviceSelector::All) => DeviceSelector::All,
        (DeviceSelector::Indices(a), DeviceSelector::Indices(b)) => {
            let mut union = a.clone();
            union.extend_from_slice(b);
            union.sort_unstable();
            union.dedup();
            DeviceSelector::Indices(union)
        }
    }
}

type Result<T, E = error::Error> = std::result::Result<T, E>;

mod error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display("Unable to parse MIG config spec: {}", source))]
        Parse { source: serde_yaml::Error },

        #[snafu(display("Unknown spec version '{}': expected '{}'", version, super::SPEC_VERSION))]
        UnknownVersion { version: String },

        #[snafu(display("Spec must define at least one MIG config"))]
        NoConfigs,

        #[snafu(display("MIG config '{}' must have at least one entry", label))]
        EmptyConfig { label: String },

        #[snafu(display(
            "MIG config '{}' sets mig-devices on an entry with mig-enabled false",
            label
        ))]
        DevicesWithoutMig { label: String },

        #[snafu(display("Selected MIG config '{}' not present in spec", label))]
        NotFound { label: String },

        #[snafu(display("No config selected and spec defines {} configs", count))]
        NoSelection { count: usize },
    }
}

pub use error::Error;

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

#[cfg(test)]
mod test {
    use super::*;

    const BASIC: &str = r#"
version: v1
mig-configs:
  all-disabled:
    - devices: all
      mig-enabled: false
  all-1g.5gb:
    - devices: all
      mig-enabled: true
      mig-devices:
        "1g.5gb": 7
"#;

    #[test]
    fn parses_yaml() {
        let spec = Spec::from_slice(BASIC.as_bytes()).unwrap();
        assert_eq!(spec.mig_configs.len(), 2);
        let specs = spec.select(Some("all-1g.5gb")).unwrap();
        assert_eq!(specs.len(), 1);
        assert!(specs[0].mig_enabled);
        assert_eq!(specs[0].mig_devices.len(), 7);
    }

    #[test]
    fn parses_json() {
        let json = r#"{
            "version": "v1",
            "mig-configs": {
                "custom": [
                    {"device-filter": "0x20B010DE", "devices": [0, 1], "mig-enabled": false}
                ]
            }
        }"#;
        let spec = Spec::from_slice(json.as_bytes()).unwrap();
        let specs = spec.select(Some("custom")).unwrap();
        assert_eq!(
            specs[0].device_filter,
            DeviceFilter::Devices(vec!["0x20B010DE".parse().unwrap()])
        );
        assert_eq!(specs[0].devices, DeviceSelector::Indices(vec![0, 1]));
    }

    #[test]
    fn rejects_unknown_top_level_field() {
        let yaml = "version: v1\nbogus: true\nmig-configs:\n  a:\n    - devices: all\n      mig-enabled: false\n";
        assert!(Spec::from_slice(yaml.as_bytes()).is_err());
    }

    #[test]
    fn rejects_unknown_spec_field() {
        let yaml = "version: v1\nmig-configs:\n  a:\n    - devices: all\n      mig-enabled: false\n      extra: 1\n";
        assert!(Spec::from_slice(yaml.as_bytes()).is_err());
    }

    #[test]
    fn rejects_missing_version() {
        let yaml = "mig-configs:\n  a:\n    - devices: all\n      mig-enabled: false\n";
        assert!(Spec::from_slice(yaml.as_bytes()).is_err());
    }

    #[test]
    fn rejects_wrong_version() {
        let yaml = "version: v2\nmig-configs:\n  a:\n    - devices: all\n      mig-enabled: false\n";
        assert!(Spec::from_slice(yaml.as_bytes()).is_err());
    }

    #[test]
    fn rejects_empty_configs() {
        assert!(Spec::from_slice(b"version: v1\nmig-configs: {}\n").is_err());
        assert!(Spec::from_slice(b"version: v1\nmig-configs:\n  a: []\n").is_err());
    }

    #[test]
    fn rejects_devices_on_disabled_entry() {
        let yaml = "version: v1\nmig-configs:\n  a:\n    - devices: all\n      mig-enabled: false\n      mig-devices:\n        \"1g.5gb\": 7\n";
        assert!(Spec::from_slice(yaml.as_bytes()).is_err());
    }

    #[test]
    fn accepts_mode_only_entry() {
        let yaml = "version: v1\nmig-configs:\n  a:\n    - devices: all\n      mig-enabled: true\n";
        let spec = Spec::from_slice(yaml.as_bytes()).unwrap();
        assert!(spec.select(Some("a")).unwrap()[0].mig_devices.is_empty());
    }

    #[test]
    fn select_defaults_to_single_config() {
        let yaml = "version: v1\nmig-configs:\n  only:\n    - devices: all\n      mig-enabled: false\n";
        let spec = Spec::from_slice(yaml.as_bytes()).unwrap();
        assert!(spec.select(None).is_ok());

        let spec = Spec::from_slice(BASIC.as_bytes()).unwrap();
        assert!(spec.select(None).is_err());
        assert!(spec.select(Some("missing")).is_err());
    }

    #[test]
    fn filter_matching() {
        let a100: DeviceId = "0x20B010DE".parse().unwrap();
        let a30: DeviceId = "0x20B710DE".parse().unwrap();

        let spec = MigConfigSpec {
            device_filter: DeviceFilter::Devices(vec![a100]),
            devices: DeviceSelector::Indices(vec![0, 2]),
            mig_enabled: false,
            mig_devices: MigConfig::new(),
        };
        assert!(spec.matches_device_filter(a100));
        assert!(!spec.matches_device_filter(a30));
        assert!(spec.matches_devices(0));
        assert!(!spec.matches_devices(1));

        let all = MigConfigSpec {
            device_filter: DeviceFilter::All,
            devices: DeviceSelector::All,
            mig_enabled: false,
            mig_devices: MigConfig::new(),
        };
        assert!(all.matches_device_filter(a30));
        assert!(all.matches_devices(7));
    }

    fn node_of_eight(id: DeviceId) -> Vec<(usize, DeviceId)> {
        (0..8).map(|i| (i, id)).collect()
    }

    #[test]
    fn normalize_merges_and_collapses_to_all() {
        let id: DeviceId = "0x20B010DE".parse().unwrap();
        let spec = |indices: Vec<usize>| MigConfigSpec {
            device_filter: DeviceFilter::Devices(vec![id]),
            devices: DeviceSelector::Indices(indices),
            mig_enabled: false,
            mig_devices: MigConfig::new(),
        };

        let normalized = normalize(
            &[spec(vec![0, 1, 2, 3]), spec(vec![4, 5, 6, 7])],
            &node_of_eight(id),
        );
        assert_eq!(normalized.len(), 1);
        assert_eq!(normalized[0].devices, DeviceSelector::All);
        // A single distinct filter is dropped.
        assert_eq!(normalized[0].device_filter, DeviceFilter::All);
    }

    #[test]
    fn normalize_keeps_partial_index_lists() {
        let id: DeviceId = "0x20B010DE".parse().unwrap();
        let spec = MigConfigSpec {
            device_filter: DeviceFilter::All,
            devices: DeviceSelector::Indices(vec![2, 0]),
            mig_enabled: false,
            mig_devices: MigConfig::new(),
        };
        let normalized = normalize(&[spec], &node_of_eight(id));
        assert_eq!(normalized[0].devices, DeviceSelector::Indices(vec![0, 2]));
    }

    #[test]
    fn normalize_keeps_distinct_configs_apart() {
        let id: DeviceId = "0x20B010DE".parse().unwrap();
        let enabled = MigConfigSpec {
            device_filter: DeviceFilter::All,
            devices: DeviceSelector::Indices(vec![0]),
            mig_enabled: true,
            mig_devices: [("1g.5gb".parse().unwrap(), 7)].into_iter().collect(),
        };
        let disabled = MigConfigSpec {
            device_filter: DeviceFilter::All,
            devices: DeviceSelector::Indices(vec![1]),
            mig_enabled: false,
            mig_devices: MigConfig::new(),
        };
        let normalized = normalize(&[enabled, disabled], &node_of_eight(id));
        assert_eq!(normalized.len(), 2);
    }

    #[test]
    fn normalize_keeps_multiple_filters() {
        let a100: DeviceId = "0x20B010DE".parse().unwrap();
        let a30: DeviceId = "0x20B710DE".parse().unwrap();
        let devices = vec![(0, a100), (1, a30)];
        let spec = |id: DeviceId, index: usize| MigConfigSpec {
            device_filter: DeviceFilter::Devices(vec![id]),
            devices: DeviceSelector::Indices(vec![index]),
            mig_enabled: false,
            mig_devices: MigConfig::new(),
        };
        let normalized = normalize(&[spec(a100, 0), spec(a30, 1)], &devices);
        assert_eq!(normalized.len(), 2);
        assert_eq!(normalized[0].device_filter, DeviceFilter::Devices(vec![a100]));
        assert_eq!(normalized[0].devices, DeviceSelector::All);
    }

    #[test]
    fn normalize_keeps_a_restrictive_filter_on_mixed_nodes() {
        let a100: DeviceId = "0x20B010DE".parse().unwrap();
        let a30: DeviceId = "0x20B710DE".parse().unwrap();
        let devices = vec![(0, a100), (1, a30)];
        let spec = MigConfigSpec {
            device_filter: DeviceFilter::Devices(vec![a30]),
            devices: DeviceSelector::Indices(vec![1]),
            mig_enabled: false,
            mig_devices: MigConfig::new(),
        };
        let normalized = normalize(&[spec], &devices);
        assert_eq!(normalized[0].device_filter, DeviceFilter::Devices(vec![a30]));
        // The filter's full coverage still collapses the index list.
        assert_eq!(normalized[0].devices, DeviceSelector::All);
    }

    #[test]
    fn round_trips_compact_form() {
        let spec = Spec::from_slice(BASIC.as_bytes()).unwrap();
        let yaml = serde_yaml::to_string(&spec).unwrap();
        let back = Spec::from_slice(yaml.as_bytes()).unwrap();
        assert_eq!(spec, back);
        // The device-filter stays absent in the compact form.
        assert!(!yaml.contains("device-filter"));
    }
}
