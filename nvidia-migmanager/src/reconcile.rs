//! The reconcile loop: for each selected-config change observed on the
//! node, quiesce GPU clients, converge MIG mode (rebooting at most once
//! when no GPU reset is available), converge the layout, regenerate the
//! CDI spec, and bring the clients back.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use snafu::ResultExt;

use mig_parted::apply::{Applier, ApplyOptions};
use mig_parted::nvml::LibNvml;
use mig_parted::types::{MigConfigSpec, Spec};

use crate::cdi::CdiSettings;
use crate::host;
use crate::node::NodeClient;
use crate::operands::OperandManager;
use crate::sync::SyncableValue;
use crate::systemd::{RestartStack, Systemd};

// Give the fabric manager time to settle after its service stops.
const FABRIC_SETTLE_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct Settings {
    pub node_name: String,
    pub config_file: PathBuf,
    pub gpu_clients: Vec<String>,
    pub host_root_mount: PathBuf,
    pub state_dir: PathBuf,
    pub host_mig_manager_state_file: PathBuf,
    pub host_kubelet_service: Option<String>,
    pub namespace: String,
    pub with_reboot: bool,
    pub with_shutdown_host_gpu_clients: bool,
    pub cdi: CdiSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Applied,
    Rebooting,
}

pub struct Controller {
    pub settings: Settings,
    pub node: NodeClient,
    pub operands: OperandManager,
    pub systemd: Systemd,
}

impl Controller {
    /// Consume selected-config values forever. A value observed while an
    /// apply is in flight is picked up afterwards; only the newest queued
    /// value is ever seen.
    pub async fn run(&self, sink: Arc<SyncableValue<String>>) {
        loop {
            let selected = sink.get().await;
            info!("reconciling MIG config '{}'", selected);
            match self.reconcile(&selected).await {
                Ok(()) => info!("done reconciling MIG config '{}'", selected),
                Err(e) => warn!("unable to apply MIG config '{}': {}", selected, e),
            }
        }
    }

    pub async fn reconcile(&self, selected: &str) -> Result<()> {
        let outcome = self.reconcile_inner(selected).await;

        // Report the terminal state and retire the reboot sentinel. The
        // rebooting state was already published before the reboot call.
        match &outcome {
            Ok(Outcome::Rebooting) => {}
            Ok(Outcome::Applied) => {
                if let Err(e) = host::clear_reboot_attempt(&self.settings.state_dir) {
                    warn!("unable to clear the reboot sentinel: {}", e);
                }
                self.set_state(constants::MIG_CONFIG_STATE_SUCCESS).await?;
            }
            Err(_) => {
                if let Err(e) = host::clear_reboot_attempt(&self.settings.state_dir) {
                    warn!("unable to clear the reboot sentinel: {}", e);
                }
                if let Err(e) = self.set_state(constants::MIG_CONFIG_STATE_FAILED).await {
                    warn!("unable to set the state label: {}", e);
                }
            }
        }
        outcome.map(|_| ())
    }

    async fn reconcile_inner(&self, selected: &str) -> Result<Outcome> {
        let state_before = self
            .node
            .get_label(constants::MIG_CONFIG_STATE_LABEL)
            .await
            .context(error::NodeSnafu)?;
        self.set_state(constants::MIG_CONFIG_STATE_PENDING).await?;

        let selected_specs = self.load_selected(selected)?;

        if self.assert_applied(&selected_specs, false).await? {
            info!("MIG config '{}' is already applied", selected);
            return Ok(Outcome::Applied);
        }

        // Persist the selection so a reboot resurfaces it.
        host::persist_selected_config(&self.settings.host_mig_manager_state_file, selected)
            .context(error::HostSnafu)?;
        self.systemd
            .daemon_reload()
            .await
            .context(error::SystemdSnafu)?;

        let mode_ok = self.assert_applied(&selected_specs, true).await?;
        if !mode_ok && state_before.as_deref() == Some(constants::MIG_CONFIG_STATE_REBOOTING) {
            // The reboot we triggered did not fix the mode; do not loop.
            return error::RebootLoopSnafu { selected }.fail();
        }

        let remembered = self
            .operands
            .pause(&self.node)
            .await
            .context(error::OperandsSnafu)?;
        self.operands
            .wait_for_pods_gone(&remembered)
            .await
            .context(error::OperandsSnafu)?;
        self.operands
            .delete_validator_pods()
            .await
            .context(error::OperandsSnafu)?;

        let mut stack = RestartStack::default();
        if self.settings.with_shutdown_host_gpu_clients {
            stack = self
                .systemd
                .stop_gpu_clients(&self.settings.gpu_clients)
                .await
                .context(error::SystemdSnafu)?;
            if !mode_ok && !stack.is_empty() {
                info!("waiting for stopped GPU clients to settle");
                tokio::time::sleep(FABRIC_SETTLE_DELAY).await;
            }
        }

        let applied = self.apply_phase(selected, &selected_specs, mode_ok).await;
        if let Ok(Outcome::Rebooting) = applied {
            // Leave the node quiesced; the reboot takes it from here.
            return Ok(Outcome::Rebooting);
        }

        let restored = self.restore_clients(&mut stack, &remembered).await;
        applied.and(restored.map(|()| Outcome::Applied))
    }

    fn load_selected(&self, selected: &str) -> Result<Vec<MigConfigSpec>> {
        let bytes = fs::read(&self.settings.config_file).context(error::ReadConfigSnafu {
            path: &self.settings.config_file,
        })?;
        let spec = Spec::from_slice(&bytes).context(error::SpecSnafu)?;
        Ok(spec
            .select(Some(selected))
            .context(error::SpecSnafu)?
            .to_vec())
    }

    /// Converge the mode (rebooting at most once if it will not take),
    /// then the layout, then the CDI spec.
    async fn apply_phase(
        &self,
        selected: &str,
        specs: &[MigConfigSpec],
        mode_ok: bool,
    ) -> Result<Outcome> {
        if !mode_ok {
            if let Err(e) = self.run_apply(specs.to_vec(), true).await {
                warn!("mode-only apply failed: {}", e);
            }
            if !self.assert_applied(specs, true).await? {
                return self.reboot_for_mode_change(selected).await;
            }
        }

        self.run_apply(specs.to_vec(), false).await?;

        let cdi = self.settings.cdi.clone();
        tokio::task::spawn_blocking(move || cdi.regenerate())
            .await
            .context(error::JoinSnafu)?
            .context(error::CdiSnafu)?;

        Ok(Outcome::Applied)
    }

    /// The mode will not converge without a reboot. Reboot at most once
    /// per selection cycle.
    async fn reboot_for_mode_change(&self, selected: &str) -> Result<Outcome> {
        if !self.settings.with_reboot {
            return error::ResetUnavailableSnafu.fail();
        }
        if host::reboot_attempted(&self.settings.state_dir) {
            return error::RebootLoopSnafu { selected }.fail();
        }
        host::record_reboot_attempt(&self.settings.state_dir, selected)
            .context(error::HostSnafu)?;
        self.set_state(constants::MIG_CONFIG_STATE_REBOOTING).await?;

        let root = self.settings.host_root_mount.clone();
        tokio::task::spawn_blocking(move || host::reboot(&root))
            .await
            .context(error::JoinSnafu)?
            .context(error::HostSnafu)?;
        Ok(Outcome::Rebooting)
    }

    async fn restore_clients(
        &self,
        stack: &mut RestartStack,
        remembered: &BTreeMap<String, String>,
    ) -> Result<()> {
        self.systemd
            .restart_gpu_clients(stack)
            .await
            .context(error::SystemdSnafu)?;

        // With CDI in play the kubelet has to pick up the regenerated spec
        // before the device plugin comes back.
        if self.settings.cdi.enabled {
            if let Some(kubelet) = &self.settings.host_kubelet_service {
                info!("restarting {}", kubelet);
                self.systemd
                    .restart(kubelet)
                    .await
                    .context(error::SystemdSnafu)?;
            }
        }

        self.operands
            .delete_operator_validator_pods()
            .await
            .context(error::OperandsSnafu)?;
        self.operands
            .restore(&self.node, remembered)
            .await
            .context(error::OperandsSnafu)
    }

    async fn run_apply(&self, specs: Vec<MigConfigSpec>, mode_only: bool) -> Result<()> {
        tokio::task::spawn_blocking(move || -> Result<()> {
            let nvml = LibNvml::new().context(error::NvmlSnafu)?;
            let applier = Applier::new(&nvml).context(error::ApplySnafu)?;
            applier
                .apply(
                    &specs,
                    ApplyOptions {
                        mode_only,
                        skip_reset: false,
                    },
                )
                .context(error::ApplySnafu)
        })
        .await
        .context(error::JoinSnafu)?
    }

    async fn assert_applied(&self, specs: &[MigConfigSpec], mode_only: bool) -> Result<bool> {
        let specs = specs.to_vec();
        tokio::task::spawn_blocking(move || -> Result<bool> {
            let nvml = LibNvml::new().context(error::NvmlSnafu)?;
            let applier = Applier::new(&nvml).context(error::ApplySnafu)?;
            match applier.assert(
                &specs,
                ApplyOptions {
                    mode_only,
                    skip_reset: false,
                },
            ) {
                Ok(()) => Ok(true),
                Err(
                    mig_parted::apply::Error::ModeMismatch { .. }
                    | mig_parted::apply::Error::ConfigMismatch { .. }
                    | mig_parted::apply::Error::NotCapable { .. },
                ) => Ok(false),
                Err(source) => Err(source).context(error::ApplySnafu),
            }
        })
        .await
        .context(error::JoinSnafu)?
    }

    async fn set_state(&self, state: &str) -> Result<()> {
        self.node
            .set_label(constants::MIG_CONFIG_STATE_LABEL, state)
            .await
            .context(error::NodeSnafu)
    }
}

type Result<T, E = error::Error> = std::result::Result<T, E>;

mod error {
    use snafu::Snafu;
    use std::path::PathBuf;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display("Unable to read config file '{}': {}", path.display(), source))]
        ReadConfig {
            path: PathBuf,
            source: std::io::Error,
        },

        #[snafu(display("{}", source))]
        Spec {
            source: mig_parted::types::spec::Error,
        },

        #[snafu(display("{}", source))]
        Node { source: crate::node::Error },

        #[snafu(display("{}", source))]
        Operands { source: crate::operands::Error },

        #[snafu(display("{}", source))]
        Systemd { source: crate::systemd::Error },

        #[snafu(display("{}", source))]
        Host { source: crate::host::Error },

        #[snafu(display("{}", source))]
        Cdi { source: crate::cdi::Error },

        #[snafu(display("Unable to load NVML: {}", source))]
        Nvml { source: mig_parted::nvml::Error },

        #[snafu(display("{}", source))]
        Apply { source: mig_parted::apply::Error },

        #[snafu(display(
            "MIG mode for '{}' still wrong after a reboot; refusing to reboot again",
            selected
        ))]
        RebootLoop { selected: String },

        #[snafu(display("MIG mode change needs a reboot, but reboots are not enabled"))]
        ResetUnavailable,

        #[snafu(display("Background task failed: {}", source))]
        Join { source: tokio::task::JoinError },
    }
}

pub use error::Error;
