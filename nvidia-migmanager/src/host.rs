//! Host-side persistent state: the systemd drop-in that pins the selected
//! config across reboots, the reboot-attempted sentinel, and the reboot
//! escape hatch into the host rootfs.

use std::fs;
use std::path::{Path, PathBuf};

use log::info;
use mig_parted::command::command;
use snafu::ResultExt;

/// Write a systemd drop-in so the unit sees the same selection after a
/// reboot.
pub fn persist_selected_config(state_file: &Path, selected: &str) -> Result<()> {
    if let Some(parent) = state_file.parent() {
        fs::create_dir_all(parent).context(error::WriteStateSnafu { path: parent })?;
    }
    let contents = format!(
        "[Service]\nEnvironment=\"{}={}\"\n",
        constants::SELECTED_CONFIG_ENV,
        selected
    );
    fs::write(state_file, contents).context(error::WriteStateSnafu { path: state_file })
}

fn sentinel_path(state_dir: &Path) -> PathBuf {
    state_dir.join(constants::REBOOT_SENTINEL_FILE)
}

/// Whether a reboot has already been attempted for the current selection.
pub fn reboot_attempted(state_dir: &Path) -> bool {
    sentinel_path(state_dir).exists()
}

pub fn record_reboot_attempt(state_dir: &Path, selected: &str) -> Result<()> {
    fs::create_dir_all(state_dir).context(error::WriteStateSnafu { path: state_dir })?;
    let path = sentinel_path(state_dir);
    fs::write(&path, selected).context(error::WriteStateSnafu { path })
}

pub fn clear_reboot_attempt(state_dir: &Path) -> Result<()> {
    let path = sentinel_path(state_dir);
    if path.exists() {
        fs::remove_file(&path).context(error::WriteStateSnafu { path })?;
    }
    Ok(())
}

/// Reboot the node through the host rootfs. Does not return an error on
/// success; the process is on borrowed time once this call lands.
pub fn reboot(host_root: &Path) -> Result<()> {
    info!("rebooting the node");
    command("chroot", [host_root.as_os_str(), "reboot".as_ref()])
        .context(error::RebootSnafu)?;
    Ok(())
}

type Result<T, E = error::Error> = std::result::Result<T, E>;

mod error {
    use snafu::Snafu;
    use std::path::PathBuf;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display("Unable to write host state '{}': {}", path.display(), source))]
        WriteState {
            path: PathBuf,
            source: std::io::Error,
        },

        #[snafu(display("Unable to reboot the host: {}", source))]
        Reboot {
            source: mig_parted::command::Error,
        },
    }
}

pub use error::Error;

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn drop_in_pins_the_selection() {
        let dir = tempfile::tempdir().unwrap();
        let state_file = dir
            .path()
            .join("nvidia-mig-manager.service.d/override.conf");
        persist_selected_config(&state_file, "all-balanced").unwrap();
        let contents = fs::read_to_string(&state_file).unwrap();
        assert_eq!(
            contents,
            "[Service]\nEnvironment=\"MIG_PARTED_SELECTED_CONFIG=all-balanced\"\n"
        );

        // Re-persisting a new selection replaces the old one.
        persist_selected_config(&state_file, "all-disabled").unwrap();
        let contents = fs::read_to_string(&state_file).unwrap();
        assert!(contents.contains("all-disabled"));
    }

    #[test]
    fn sentinel_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let state_dir = dir.path().join("state");
        assert!(!reboot_attempted(&state_dir));

        record_reboot_attempt(&state_dir, "all-enabled").unwrap();
        assert!(reboot_attempted(&state_dir));

        clear_reboot_attempt(&state_dir).unwrap();
        assert!(!reboot_attempted(&state_dir));

        // Clearing twice is fine.
        clear_reboot_attempt(&state_dir).unwrap();
    }
}
