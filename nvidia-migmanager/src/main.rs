/*!
# Introduction

nvidia-migmanager is a long-running node controller that keeps a node's
GPUs partitioned according to the MIG config selected through the
`nvidia.com/mig.config` node label. For every change of the label it:

* validates the selection against the node's MIG config file,
* quiesces the GPU Operator operands and, optionally, host systemd
  services that hold the GPU open,
* converges MIG mode, rebooting the node at most once when no GPU reset
  is available,
* converges the MIG instance layout,
* regenerates the management CDI spec when CDI is enabled, and
* restores the quiesced clients and publishes the outcome through the
  `nvidia.com/mig.config.state` label.

Configuration comes from the environment (`NODE_NAME`, `CONFIG_FILE`,
`GPU_CLIENTS_FILE`, `WITH_REBOOT`, `CDI_ENABLED`, and friends), matching
how the GPU Operator deploys it.
*/

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::{env, fs, process};

use log::info;
use simplelog::{Config as LogConfig, LevelFilter, SimpleLogger};
use snafu::{OptionExt, ResultExt};

mod cdi;
mod clients;
mod host;
mod node;
mod operands;
mod reconcile;
mod sync;
mod systemd;

use cdi::CdiSettings;
use clients::GpuClientsSpec;
use node::NodeClient;
use operands::OperandManager;
use reconcile::{Controller, Settings};
use sync::SyncableValue;
use systemd::Systemd;

const DEFAULT_CONFIG_FILE: &str = "/mig-parted-config/config.yaml";
const DEFAULT_STATE_FILE: &str =
    "/etc/systemd/system/nvidia-mig-manager.service.d/override.conf";
const DEFAULT_KUBELET_SERVICE: &str = "kubelet.service";
const DEFAULT_HOST_NVIDIA_DIR: &str = "/usr/local/nvidia";

/// Stores user-supplied global arguments
struct Args {
    log_level: LevelFilter,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            log_level: LevelFilter::Info,
        }
    }
}

/// Parse the args to the program and return an Args struct
fn parse_args(args: env::Args) -> Result<Args> {
    let mut global_args = Args::default();
    let mut iter = args.skip(1);

    while let Some(arg) = iter.next() {
        match arg.as_ref() {
            "--log-level" => {
                let log_level = iter.next().context(error::UsageSnafu {
                    message: "Did not give argument to --log-level",
                })?;
                global_args.log_level = LevelFilter::from_str(&log_level)
                    .context(error::LogLevelSnafu { log_level })?;
            }

            "--version" => {
                println!("nvidia-migmanager {}", env!("CARGO_PKG_VERSION"));
                process::exit(0);
            }

            _ => (),
        }
    }

    Ok(global_args)
}

fn env_string(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.is_empty())
}

fn env_bool(name: &str) -> bool {
    matches!(env_string(name).as_deref(), Some("true") | Some("1"))
}

fn settings_from_env() -> Result<Settings> {
    let node_name = env_string("NODE_NAME").context(error::UsageSnafu {
        message: "NODE_NAME must be set",
    })?;
    let config_file = PathBuf::from(
        env_string("CONFIG_FILE").unwrap_or_else(|| DEFAULT_CONFIG_FILE.to_string()),
    );
    let host_root_mount = PathBuf::from(
        env_string("HOST_ROOT_MOUNT")
            .unwrap_or_else(|| constants::DEFAULT_HOST_ROOT_MOUNT.to_string()),
    );
    let host_nvidia_dir =
        env_string("HOST_NVIDIA_DIR").unwrap_or_else(|| DEFAULT_HOST_NVIDIA_DIR.to_string());

    // The sentinel lives on the host so it survives the reboot it tracks.
    let state_dir = host_root_mount.join(
        Path::new(constants::DEFAULT_STATE_DIR)
            .strip_prefix("/")
            .unwrap_or(Path::new(constants::DEFAULT_STATE_DIR)),
    );

    let host_mig_manager_state_file = match env_string("HOST_MIG_MANAGER_STATE_FILE") {
        Some(path) => PathBuf::from(path),
        None => host_root_mount.join(
            Path::new(DEFAULT_STATE_FILE)
                .strip_prefix("/")
                .unwrap_or(Path::new(DEFAULT_STATE_FILE)),
        ),
    };

    let gpu_clients = match env_string("GPU_CLIENTS_FILE") {
        Some(path) => {
            let bytes = fs::read(&path).context(error::ReadClientsSnafu { path })?;
            GpuClientsSpec::from_slice(&bytes)
                .context(error::ClientsSnafu)?
                .systemd_services
        }
        None => Vec::new(),
    };

    let driver_root = env_string("NVIDIA_DRIVER_ROOT").unwrap_or_else(|| "/".to_string());
    let driver_root_ctr_path =
        env_string("DRIVER_ROOT_CTR_PATH").unwrap_or_else(|| "/driver-root".to_string());
    let dev_root = env_string("NVIDIA_DEV_ROOT").unwrap_or_else(|| driver_root.clone());
    let dev_root_ctr_path =
        env_string("DEV_ROOT_CTR_PATH").unwrap_or_else(|| driver_root_ctr_path.clone());
    let cdi_hook_path = env_string("NVIDIA_CDI_HOOK_PATH")
        .or_else(|| Some(format!("{}/toolkit/nvidia-cdi-hook", host_nvidia_dir)));

    Ok(Settings {
        node_name,
        config_file,
        gpu_clients,
        host_root_mount,
        state_dir,
        host_mig_manager_state_file,
        host_kubelet_service: Some(
            env_string("HOST_KUBELET_SYSTEMD_SERVICE")
                .unwrap_or_else(|| DEFAULT_KUBELET_SERVICE.to_string()),
        ),
        namespace: env_string("DEFAULT_GPU_CLIENTS_NAMESPACE")
            .unwrap_or_else(|| constants::DEFAULT_GPU_CLIENTS_NAMESPACE.to_string()),
        with_reboot: env_bool("WITH_REBOOT"),
        with_shutdown_host_gpu_clients: env_bool("WITH_SHUTDOWN_HOST_GPU_CLIENTS"),
        cdi: CdiSettings {
            enabled: env_bool("CDI_ENABLED"),
            driver_root,
            driver_root_ctr_path,
            dev_root,
            dev_root_ctr_path,
            cdi_hook_path,
        },
    })
}

async fn run() -> Result<()> {
    let args = parse_args(env::args())?;

    // SimpleLogger will send errors to stderr and anything less to stdout.
    SimpleLogger::init(args.log_level, LogConfig::default()).context(error::LoggerSnafu)?;

    let settings = settings_from_env()?;
    info!(
        "watching node '{}' for changes to {}",
        settings.node_name,
        constants::MIG_CONFIG_LABEL
    );

    let client = kube::Client::try_default()
        .await
        .context(error::KubeSnafu)?;
    let node = NodeClient::new(client.clone(), settings.node_name.clone());
    let operands = OperandManager::new(
        client.clone(),
        settings.namespace.clone(),
        settings.node_name.clone(),
    );
    let systemd = Systemd::system().await.context(error::SystemdSnafu)?;

    let sink = Arc::new(SyncableValue::new());
    let watch_sink = Arc::clone(&sink);
    let watch_node = NodeClient::new(client, settings.node_name.clone());
    tokio::spawn(async move {
        watch_node
            .watch_label(constants::MIG_CONFIG_LABEL, watch_sink)
            .await;
    });

    let controller = Controller {
        settings,
        node,
        operands,
        systemd,
    };
    controller.run(sink).await;
    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("{}", e);
        process::exit(1);
    }
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

type Result<T, E = error::Error> = std::result::Result<T, E>;

mod error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display("{}", message))]
        Usage { message: String },

        #[snafu(display("Logger setup error: {}", source))]
        Logger { source: log::SetLoggerError },

        #[snafu(display("Invalid log level '{}'", log_level))]
        LogLevel {
            log_level: String,
            source: log::ParseLevelError,
        },

        #[snafu(display("Unable to read GPU clients file '{}': {}", path, source))]
        ReadClients {
            path: String,
            source: std::io::Error,
        },

        #[snafu(display("{}", source))]
        Clients { source: crate::clients::Error },

        #[snafu(display("Unable to create Kubernetes client: {}", source))]
        Kube { source: kube::Error },

        #[snafu(display("{}", source))]
        Systemd { source: crate::systemd::Error },
    }
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn bool_envs_accept_true_and_one() {
        env::set_var("MIGMANAGER_TEST_FLAG", "true");
        assert!(env_bool("MIGMANAGER_TEST_FLAG"));
        env::set_var("MIGMANAGER_TEST_FLAG", "1");
        assert!(env_bool("MIGMANAGER_TEST_FLAG"));
        env::set_var("MIGMANAGER_TEST_FLAG", "false");
        assert!(!env_bool("MIGMANAGER_TEST_FLAG"));
        env::remove_var("MIGMANAGER_TEST_FLAG");
        assert!(!env_bool("MIGMANAGER_TEST_FLAG"));
    }

    #[test]
    fn empty_env_values_are_absent() {
        env::set_var("MIGMANAGER_TEST_EMPTY", "");
        assert_eq!(env_string("MIGMANAGER_TEST_EMPTY"), None);
        env::remove_var("MIGMANAGER_TEST_EMPTY");
    }
}
