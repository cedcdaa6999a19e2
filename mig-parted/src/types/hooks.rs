use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use snafu::{ensure, ResultExt};

pub const HOOKS_VERSION: &str = "v1";

/// The points in an apply at which external hooks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HookPoint {
    ApplyStart,
    PreApplyMode,
    PreApplyConfig,
    ApplyExit,
}

impl HookPoint {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ApplyStart => "apply-start",
            Self::PreApplyMode => "pre-apply-mode",
            Self::PreApplyConfig => "pre-apply-config",
            Self::ApplyExit => "apply-exit",
        }
    }
}

/// One external process to run at a hook point. The process environment is
/// the caller's hook environment overlaid by `envs` (hook-local wins).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HookSpec {
    pub command: PathBuf,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub envs: BTreeMap<String, String>,

    #[serde(default)]
    pub workdir: Option<PathBuf>,
}

/// The versioned hooks file: hook point -> hooks to run, in order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HooksSpec {
    pub version: String,

    #[serde(default)]
    pub hooks: BTreeMap<HookPoint, Vec<HookSpec>>,
}

impl HooksSpec {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, Error> {
        let spec: Self = serde_yaml::from_slice(bytes).context(error::ParseSnafu)?;
        ensure!(
            spec.version == HOOKS_VERSION,
            error::UnknownVersionSnafu {
                version: &spec.version
            }
        );
        Ok(spec)
    }

    pub fn hooks_for(&self, point: HookPoint) -> &[HookSpec] {
        self.hooks.get(&point).map(Vec::as_slice).unwrap_or(&[])
    }
}

mod error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display("Unable to parse hooks spec: {}", source))]
        Parse { source: serde_yaml::Error },

        #[snafu(display(
            "Unknown hooks version '{}': expected '{}'",
            version,
            super::HOOKS_VERSION
        ))]
        UnknownVersion { version: String },
    }
}

pub use error::Error;

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=
