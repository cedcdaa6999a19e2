use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use snafu::ensure;

use super::profile::MigProfile;

/// A requested multiset of MIG profiles: profile -> count. The underlying
/// map is keyed in canonical profile order, so iteration, flattening, and
/// serialized output are all deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MigConfig(BTreeMap<MigProfile, usize>);

impl MigConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, profile: MigProfile, count: usize) {
        self.0.insert(profile, count);
    }

    pub fn count(&self, profile: &MigProfile) -> usize {
        self.0.get(profile).copied().unwrap_or(0)
    }

    pub fn contains(&self, profile: &MigProfile) -> bool {
        self.count(profile) > 0
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(|&count| count == 0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&MigProfile, usize)> {
        self.0.iter().map(|(profile, &count)| (profile, count))
    }

    /// Total number of requested devices.
    pub fn len(&self) -> usize {
        self.0.values().sum()
    }

    /// A config is valid when every profile parsed (guaranteed by
    /// construction) and at least one count is positive.
    pub fn assert_valid(&self) -> Result<(), Error> {
        ensure!(!self.is_empty(), error::EmptyConfigSnafu);
        Ok(())
    }

    /// Expand the multiset into an ordered sequence of length `len()`.
    /// Order is the canonical profile order: descending G, then descending
    /// C, then attributes.
    pub fn flatten(&self) -> Vec<MigProfile> {
        let mut flat = Vec::with_capacity(self.len());
        for (profile, &count) in &self.0 {
            for _ in 0..count {
                flat.push(profile.clone());
            }
        }
        flat
    }

    /// Multiset equality. Entries with a zero count are ignored.
    pub fn equals(&self, other: &Self) -> bool {
        self.flatten() == other.flatten()
    }

    pub fn is_subset_of(&self, other: &Self) -> bool {
        self.0
            .iter()
            .all(|(profile, &count)| count <= other.count(profile))
    }
}

impl FromIterator<(MigProfile, usize)> for MigConfig {
    fn from_iter<I: IntoIterator<Item = (MigProfile, usize)>>(iter: I) -> Self {
        let mut config = Self::new();
        for (profile, count) in iter {
            let existing = config.count(&profile);
            config.set(profile, existing + count);
        }
        config
    }
}

mod error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display("MIG config must request at least one device"))]
        EmptyConfig,
    }
}

pub use error::Error;

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

#[cfg(test)]
mod test {
    use super::*;

    fn config(entries: &[(&str, usize)]) -> MigConfig {
        entries
            .iter()
            .map(|&(profile, count)| (profile.parse().unwrap(), count))
            .collect()
    }

    #[test]
    fn flatten_is_ordered_and_sized() {
        let config = config(&[("1g.5gb", 2), ("3g.20gb", 1), ("2g.10gb", 1)]);
        assert_eq!(config.len(), 4);
        let flat: Vec<String> = config.flatten().iter().map(|p| p.to_string()).collect();
        assert_eq!(flat, ["3g.20gb", "2g.10gb", "1g.5gb", "1g.5gb"]);
    }

    #[test]
    fn flatten_is_deterministic() {
        let a = config(&[("1g.5gb", 7)]);
        let b = config(&[("1g.5gb", 7)]);
        assert_eq!(a.flatten(), b.flatten());
    }

    #[test]
    fn zero_counts_do_not_affect_equality() {
        let mut a = config(&[("1g.5gb", 2)]);
        a.set("2g.10gb".parse().unwrap(), 0);
        let b = config(&[("1g.5gb", 2)]);
        assert!(a.equals(&b));
        assert!(!a.is_empty());
    }

    #[test]
    fn empty_config_is_invalid() {
        let empty = MigConfig::new();
        assert!(empty.assert_valid().is_err());

        let mut zeros = MigConfig::new();
        zeros.set("1g.5gb".parse().unwrap(), 0);
        assert!(zeros.assert_valid().is_err());

        assert!(config(&[("1g.5gb", 1)]).assert_valid().is_ok());
    }

    #[test]
    fn subset_and_contains() {
        let small = config(&[("1g.5gb", 2)]);
        let large = config(&[("1g.5gb", 3), ("2g.10gb", 1)]);
        assert!(small.is_subset_of(&large));
        assert!(!large.is_subset_of(&small));
        assert!(large.contains(&"2g.10gb".parse().unwrap()));
        assert!(!small.contains(&"2g.10gb".parse().unwrap()));
    }

    #[test]
    fn deserializes_from_profile_map() {
        let config: MigConfig = serde_yaml::from_str("{\"1g.5gb\": 7}").unwrap();
        assert_eq!(config.len(), 7);
        assert!(config.contains(&"1g.5gb".parse().unwrap()));
    }

    #[test]
    fn rejects_malformed_profile_keys() {
        let result: Result<MigConfig, _> = serde_yaml::from_str("{\"1x.5gb\": 7}");
        assert!(result.is_err());
    }
}
