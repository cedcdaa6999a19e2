//! Regeneration of the management CDI spec after a reconfigure. The spec
//! is generated against the container-side driver mount and its paths are
//! rewritten to their host-side equivalents before being saved where the
//! runtime looks for it.

use std::path::{Path, PathBuf};

use log::info;
use mig_parted::command::command;
use serde_yaml::Value;
use snafu::ResultExt;

#[derive(Debug, Clone)]
pub struct CdiSettings {
    pub enabled: bool,
    pub driver_root: String,
    pub driver_root_ctr_path: String,
    pub dev_root: String,
    pub dev_root_ctr_path: String,
    pub cdi_hook_path: Option<String>,
}

impl CdiSettings {
    pub fn spec_path(&self) -> PathBuf {
        Path::new(constants::CDI_SPEC_DIR).join(constants::CDI_MANAGEMENT_SPEC_FILE)
    }

    /// Regenerate and save the management CDI spec.
    pub fn regenerate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        info!("regenerating the management CDI spec");

        if self.driver_root != self.dev_root {
            command(
                "nvidia-ctk",
                [
                    "system",
                    "create-device-nodes",
                    "--control-devices",
                    &format!("--dev-root={}", self.dev_root_ctr_path),
                ],
            )
            .context(error::CtkSnafu {
                op: "create control device nodes",
            })?;
        }

        let mut args = vec![
            "cdi".to_string(),
            "generate".to_string(),
            "--mode=management".to_string(),
            format!("--vendor={}", constants::CDI_MANAGEMENT_VENDOR),
            format!("--class={}", constants::CDI_MANAGEMENT_CLASS),
            format!("--driver-root={}", self.driver_root_ctr_path),
        ];
        if let Some(hook_path) = &self.cdi_hook_path {
            args.push(format!("--nvidia-cdi-hook-path={}", hook_path));
        }
        let generated = command("nvidia-ctk", &args).context(error::CtkSnafu {
            op: "generate the management CDI spec",
        })?;

        let mut spec: Value =
            serde_yaml::from_str(&generated).context(error::ParseSnafu)?;
        transform_paths(&mut spec, &self.driver_root_ctr_path, &self.driver_root);
        transform_paths(&mut spec, &self.dev_root_ctr_path, &self.dev_root);

        let path = self.spec_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context(error::SaveSnafu { path: parent })?;
        }
        let rendered = serde_yaml::to_string(&spec).context(error::SerializeSnafu)?;
        std::fs::write(&path, rendered).context(error::SaveSnafu { path })?;
        Ok(())
    }
}

/// Rewrite every string under `value` that starts with the container-side
/// prefix to start with the host-side prefix instead.
pub fn transform_paths(value: &mut Value, from: &str, to: &str) {
    if from == to {
        return;
    }
    match value {
        Value::String(s) => {
            if let Some(rest) = s.strip_prefix(from) {
                let mut host = to.trim_end_matches('/').to_string();
                if !rest.starts_with('/') {
                    host.push('/');
                }
                host.push_str(rest);
                *s = host;
            }
        }
        Value::Sequence(seq) => {
            for item in seq {
                transform_paths(item, from, to);
            }
        }
        Value::Mapping(map) => {
            for (_, item) in map.iter_mut() {
                transform_paths(item, from, to);
            }
        }
        _ => {}
    }
}

type Result<T, E = error::Error> = std::result::Result<T, E>;

mod error {
    use snafu::Snafu;
    use std::path::PathBuf;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display("Unable to {}: {}", op, source))]
        Ctk {
            op: String,
            source: mig_parted::command::Error,
        },

        #[snafu(display("Unable to parse generated CDI spec: {}", source))]
        Parse { source: serde_yaml::Error },

        #[snafu(display("Unable to serialize CDI spec: {}", source))]
        Serialize { source: serde_yaml::Error },

        #[snafu(display("Unable to save CDI spec '{}': {}", path.display(), source))]
        Save {
            path: PathBuf,
            source: std::io::Error,
        },
    }
}

pub use error::Error;

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rewrites_container_paths_to_host_paths() {
        let yaml = r#"
cdiVersion: 0.5.0
kind: management.nvidia.com/gpu
containerEdits:
  deviceNodes:
    - path: /driver-root/dev/nvidiactl
  mounts:
    - hostPath: /driver-root/usr/lib/libnvidia-ml.so.1
      containerPath: /usr/lib/libnvidia-ml.so.1
"#;
        let mut spec: Value = serde_yaml::from_str(yaml).unwrap();
        transform_paths(&mut spec, "/driver-root", "/run/nvidia/driver");
        let rendered = serde_yaml::to_string(&spec).unwrap();
        assert!(rendered.contains("/run/nvidia/driver/dev/nvidiactl"));
        assert!(rendered.contains("/run/nvidia/driver/usr/lib/libnvidia-ml.so.1"));
        // Paths outside the prefix stay put.
        assert!(rendered.contains("containerPath: /usr/lib/libnvidia-ml.so.1"));
    }

    #[test]
    fn identical_roots_are_left_alone() {
        let mut spec: Value = serde_yaml::from_str("path: /dev/nvidiactl\n").unwrap();
        transform_paths(&mut spec, "/", "/");
        assert_eq!(
            serde_yaml::to_string(&spec).unwrap().trim(),
            "path: /dev/nvidiactl"
        );
    }

    #[test]
    fn root_prefix_transform_keeps_separator() {
        let mut spec: Value = serde_yaml::from_str("path: /dev/nvidia0\n").unwrap();
        transform_paths(&mut spec, "/", "/host/");
        assert_eq!(
            serde_yaml::to_string(&spec).unwrap().trim(),
            "path: /host/dev/nvidia0"
        );
    }
}
