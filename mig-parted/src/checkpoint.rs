//! Versioned checkpoints of the node's MIG state. Writing goes through the
//! CLI; restoring is a library-level operation.

use serde::{Deserialize, Serialize};
use snafu::{ensure, ResultExt};

use crate::mig::state::{MigState, MigStateManager};
use crate::nvml::Nvml;

pub const CHECKPOINT_VERSION: &str = "v1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Checkpoint {
    pub version: String,
    pub mig_state: MigState,
}

/// Snapshot the node into a checkpoint.
pub fn take(nvml: &dyn Nvml) -> Result<Checkpoint> {
    let mig_state = MigStateManager::new(nvml)
        .fetch()
        .context(error::StateSnafu)?;
    Ok(Checkpoint {
        version: CHECKPOINT_VERSION.to_string(),
        mig_state,
    })
}

pub fn from_slice(bytes: &[u8]) -> Result<Checkpoint> {
    let checkpoint: Checkpoint = serde_json::from_slice(bytes).context(error::ParseSnafu)?;
    ensure!(
        checkpoint.version == CHECKPOINT_VERSION,
        error::UnknownVersionSnafu {
            version: &checkpoint.version
        }
    );
    Ok(checkpoint)
}

pub fn to_json(checkpoint: &Checkpoint) -> Result<String> {
    serde_json::to_string_pretty(checkpoint).context(error::SerializeSnafu)
}

/// Drive the node back to a checkpointed state: modes first, then the
/// instance layouts. Mode changes that would need a GPU reset are refused
/// here so the caller can orchestrate the reset and retry.
pub fn restore(nvml: &dyn Nvml, checkpoint: &Checkpoint) -> Result<()> {
    ensure!(
        checkpoint.version == CHECKPOINT_VERSION,
        error::UnknownVersionSnafu {
            version: &checkpoint.version
        }
    );
    let manager = MigStateManager::new(nvml);
    let pending = manager
        .restore_mode(&checkpoint.mig_state)
        .context(error::StateSnafu)?;
    ensure!(pending.is_empty(), error::ResetRequiredSnafu { gpus: pending });
    manager
        .restore_config(&checkpoint.mig_state)
        .context(error::StateSnafu)
}

type Result<T, E = error::Error> = std::result::Result<T, E>;

mod error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display("Unable to parse checkpoint: {}", source))]
        Parse { source: serde_json::Error },

        #[snafu(display("Unable to serialize checkpoint: {}", source))]
        Serialize { source: serde_json::Error },

        #[snafu(display(
            "Unknown checkpoint version '{}': expected '{}'",
            version,
            super::CHECKPOINT_VERSION
        ))]
        UnknownVersion { version: String },

        #[snafu(display("{}", source))]
        State { source: crate::mig::state::Error },

        #[snafu(display("GPUs {:?} need a reset before their layout can be restored", gpus))]
        ResetRequired { gpus: Vec<usize> },
    }
}

pub use error::Error;

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=
