//! The GPU clients file: host systemd services that hold the GPU open and
//! must be stopped before a mode change can land.

use serde::Deserialize;
use snafu::{ensure, ResultExt};

pub const CLIENTS_VERSION: &str = "v1";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GpuClientsSpec {
    pub version: String,

    #[serde(rename = "systemd-services", default)]
    pub systemd_services: Vec<String>,
}

impl GpuClientsSpec {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, Error> {
        let spec: Self = serde_yaml::from_slice(bytes).context(error::ParseSnafu)?;
        ensure!(
            spec.version == CLIENTS_VERSION,
            error::UnknownVersionSnafu {
                version: &spec.version
            }
        );
        Ok(spec)
    }
}

mod error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display("Unable to parse GPU clients file: {}", source))]
        Parse { source: serde_yaml::Error },

        #[snafu(display(
            "Unknown GPU clients file version '{}': expected '{}'",
            version,
            super::CLIENTS_VERSION
        ))]
        UnknownVersion { version: String },
    }
}

pub use error::Error;

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_service_list() {
        let yaml = "version: v1\nsystemd-services:\n  - nvidia-fabricmanager.service\n  - nvidia-persistenced.service\n";
        let spec = GpuClientsSpec::from_slice(yaml.as_bytes()).unwrap();
        assert_eq!(
            spec.systemd_services,
            ["nvidia-fabricmanager.service", "nvidia-persistenced.service"]
        );
    }

    #[test]
    fn rejects_wrong_version() {
        assert!(GpuClientsSpec::from_slice(b"version: v2\n").is_err());
    }

    #[test]
    fn service_list_is_optional() {
        let spec = GpuClientsSpec::from_slice(b"version: v1\n").unwrap();
        assert!(spec.systemd_services.is_empty());
    }
}
