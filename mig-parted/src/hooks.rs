//! Execution of operator-supplied hooks around an apply. Hooks inherit the
//! tool's stdio; their environment is the caller's hook environment overlaid
//! by each hook's own `envs`.

use std::collections::BTreeMap;
use std::process::Command;

use log::debug;
use snafu::{ensure, ResultExt};

use crate::types::{HookPoint, HooksSpec};

pub struct HookRunner {
    spec: HooksSpec,
    envs: BTreeMap<String, String>,
}

impl HookRunner {
    pub fn new(spec: HooksSpec, envs: BTreeMap<String, String>) -> Self {
        Self { spec, envs }
    }

    /// Run every hook registered at `point`, in order. The first failure
    /// stops the run.
    pub fn run(&self, point: HookPoint) -> Result<()> {
        for hook in self.spec.hooks_for(point) {
            debug!("running {} hook: {}", point.name(), hook.command.display());

            let mut command = Command::new(&hook.command);
            command.args(&hook.args);
            command.envs(&self.envs);
            command.envs(&hook.envs);
            if let Some(workdir) = &hook.workdir {
                command.current_dir(workdir);
            }

            let status = command.status().context(error::ExecutionFailureSnafu {
                point: point.name(),
                command: hook.command.display().to_string(),
            })?;
            ensure!(
                status.success(),
                error::HookFailureSnafu {
                    point: point.name(),
                    command: hook.command.display().to_string(),
                    code: status.code().unwrap_or(-1),
                }
            );
        }
        Ok(())
    }
}

type Result<T, E = error::Error> = std::result::Result<T, E>;

mod error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display("Failed to execute {} hook '{}': {}", point, command, source))]
        ExecutionFailure {
            point: String,
            command: String,
            source: std::io::Error,
        },

        #[snafu(display("{} hook '{}' exited with code {}", point, command, code))]
        HookFailure {
            point: String,
            command: String,
            code: i32,
        },
    }
}

pub use error::Error;

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

#[cfg(test)]
mod test {
    use super::*;
    use std::fs;

    fn hooks(yaml: &str) -> HooksSpec {
        HooksSpec::from_slice(yaml.as_bytes()).unwrap()
    }

    #[test]
    fn hook_local_env_wins() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let yaml = format!(
            r#"
version: v1
hooks:
  apply-start:
    - command: /bin/sh
      args: ["-c", "printenv SELECTED > {}"]
      envs:
        SELECTED: hook-local
"#,
            out.display()
        );

        let mut envs = BTreeMap::new();
        envs.insert("SELECTED".to_string(), "caller".to_string());
        let runner = HookRunner::new(hooks(&yaml), envs);
        runner.run(HookPoint::ApplyStart).unwrap();
        assert_eq!(fs::read_to_string(&out).unwrap().trim(), "hook-local");
    }

    #[test]
    fn caller_env_reaches_hooks() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let yaml = format!(
            r#"
version: v1
hooks:
  pre-apply-mode:
    - command: /bin/sh
      args: ["-c", "printenv SELECTED > {}"]
"#,
            out.display()
        );

        let mut envs = BTreeMap::new();
        envs.insert("SELECTED".to_string(), "caller".to_string());
        let runner = HookRunner::new(hooks(&yaml), envs);
        runner.run(HookPoint::PreApplyMode).unwrap();
        assert_eq!(fs::read_to_string(&out).unwrap().trim(), "caller");
    }

    #[test]
    fn failing_hook_reports_point_and_code() {
        let yaml = r#"
version: v1
hooks:
  apply-exit:
    - command: /bin/sh
      args: ["-c", "exit 3"]
"#;
        let runner = HookRunner::new(hooks(yaml), BTreeMap::new());
        assert!(matches!(
            runner.run(HookPoint::ApplyExit),
            Err(Error::HookFailure { code: 3, .. })
        ));
    }

    #[test]
    fn unregistered_point_is_a_no_op() {
        let runner = HookRunner::new(HooksSpec::default(), BTreeMap::new());
        runner.run(HookPoint::PreApplyConfig).unwrap();
    }

    #[test]
    fn workdir_is_honored() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = format!(
            r#"
version: v1
hooks:
  apply-start:
    - command: /bin/sh
      args: ["-c", "pwd > out"]
      workdir: {}
"#,
            dir.path().display()
        );
        let runner = HookRunner::new(hooks(&yaml), BTreeMap::new());
        runner.run(HookPoint::ApplyStart).unwrap();
        let pwd = fs::read_to_string(dir.path().join("out")).unwrap();
        assert_eq!(
            fs::canonicalize(pwd.trim()).unwrap(),
            fs::canonicalize(dir.path()).unwrap()
        );
    }
}
