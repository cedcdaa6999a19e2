//! Wrapper around `process::Command` that adds error checking.

use std::ffi::OsStr;
use std::process::Command;

use log::trace;
use snafu::{ensure, ResultExt};

pub fn command<I, S>(bin_path: &str, args: I) -> Result<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut command = Command::new(bin_path);
    command.args(args);
    let output = command
        .output()
        .context(error::ExecutionFailureSnafu { command })?;

    trace!("stdout: {}", String::from_utf8_lossy(&output.stdout));
    trace!("stderr: {}", String::from_utf8_lossy(&output.stderr));

    ensure!(
        output.status.success(),
        error::CommandFailureSnafu { bin_path, output }
    );

    let output_str = String::from_utf8_lossy(&output.stdout);

    Ok(output_str.to_string())
}

type Result<T, E = error::Error> = std::result::Result<T, E>;

mod error {
    use snafu::Snafu;
    use std::process::{Command, Output};

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display("'{}' failed - stderr: {}",
                        bin_path, String::from_utf8_lossy(&output.stderr)))]
        CommandFailure { bin_path: String, output: Output },

        #[snafu(display("Failed to execute '{:?}': {}", command, source))]
        ExecutionFailure {
            command: Command,
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
    fn captures_stdout() {
        let output = command("/bin/echo", ["hello"]).unwrap();
        assert_eq!(output, "hello\n");
    }

    #[test]
    fn nonzero_exit_is_an_error() {
        assert!(matches!(
            command("/bin/false", Vec::<&str>::new()),
            Err(Error::CommandFailure { .. })
        ));
    }

    #[test]
    fn missing_binary_is_an_error() {
        assert!(matches!(
            command("/does/not/exist", Vec::<&str>::new()),
            Err(Error::ExecutionFailure { .. })
        ));
    }
}
