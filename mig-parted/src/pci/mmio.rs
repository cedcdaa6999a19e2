//! A memory-mapped view of a GPU's BAR0 register window, with the small
//! register map this tool touches.

use std::fs::OpenOptions;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use std::{io, ptr, thread};

use snafu::{ensure, ResultExt};

// Register map.
pub const PMC_ID: u64 = 0x0;
pub const BOOT_COMPLETE: u64 = 0x118234;
pub const BOOT_COMPLETE_VALUE: u32 = 0x03FF;
pub const MIG_MODE_CHECK: u64 = 0x1404;
pub const MIG_MODE_CHECK_MASK: u32 = 0x8000;
pub const MIG_MODE_SET: u64 = 0x118F78;
pub const MIG_MODE_SET_SHIFT: u32 = 14;
pub const MIG_MODE_SET_MASK: u32 = 0x3 << MIG_MODE_SET_SHIFT;
pub const MIG_MODE_SET_ENABLE: u32 = 0b11;
pub const MIG_MODE_SET_DISABLE: u32 = 0b10;

const BOOT_POLL_INTERVAL: Duration = Duration::from_millis(100);
const BOOT_TIMEOUT: Duration = Duration::from_secs(5);

/// An open BAR0 mapping. Unmapped on drop.
pub struct Bar0 {
    base: *mut u8,
    len: usize,
}

impl Bar0 {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .context(error::ResourceUnavailableSnafu { path })?;
        let len = file
            .metadata()
            .context(error::ResourceUnavailableSnafu { path })?
            .len() as usize;
        ensure!(len > 0, error::EmptyResourceSnafu { path });

        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error()).context(error::MapSnafu { path });
        }

        Ok(Self {
            base: base as *mut u8,
            len,
        })
    }

    pub fn read32(&self, offset: u64) -> Result<u32> {
        self.check_bounds(offset)?;
        let value = unsafe { ptr::read_volatile(self.base.add(offset as usize) as *const u32) };
        Ok(value)
    }

    pub fn write32(&self, offset: u64, value: u32) -> Result<()> {
        self.check_bounds(offset)?;
        unsafe { ptr::write_volatile(self.base.add(offset as usize) as *mut u32, value) };
        Ok(())
    }

    /// Flush outstanding writes to the device.
    pub fn sync(&self) -> Result<()> {
        let rc = unsafe { libc::msync(self.base as *mut libc::c_void, self.len, libc::MS_SYNC) };
        if rc != 0 {
            return Err(io::Error::last_os_error()).context(error::SyncSnafu);
        }
        Ok(())
    }

    /// Poll the boot-complete register until the GPU has finished
    /// initializing its register file.
    pub fn wait_for_boot(&self) -> Result<()> {
        let deadline = Instant::now() + BOOT_TIMEOUT;
        loop {
            if self.read32(BOOT_COMPLETE)? == BOOT_COMPLETE_VALUE {
                return Ok(());
            }
            ensure!(Instant::now() < deadline, error::BootTimeoutSnafu);
            thread::sleep(BOOT_POLL_INTERVAL);
        }
    }

    fn check_bounds(&self, offset: u64) -> Result<()> {
        ensure!(
            (offset as usize) + 4 <= self.len,
            error::OutOfRangeSnafu {
                offset,
                len: self.len
            }
        );
        Ok(())
    }
}

impl Drop for Bar0 {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.len);
        }
    }
}

type Result<T, E = error::Error> = std::result::Result<T, E>;

mod error {
    use snafu::Snafu;
    use std::path::PathBuf;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display("Unable to open BAR0 resource '{}': {}", path.display(), source))]
        ResourceUnavailable {
            path: PathBuf,
            source: std::io::Error,
        },

        #[snafu(display("BAR0 resource '{}' is empty", path.display()))]
        EmptyResource { path: PathBuf },

        #[snafu(display("Unable to map BAR0 resource '{}': {}", path.display(), source))]
        Map {
            path: PathBuf,
            source: std::io::Error,
        },

        #[snafu(display("Unable to sync BAR0 mapping: {}", source))]
        Sync { source: std::io::Error },

        #[snafu(display("GPU did not finish booting within the timeout"))]
        BootTimeout,

        #[snafu(display("Register offset {:#x} out of range for a {} byte BAR", offset, len))]
        OutOfRange { offset: u64, len: usize },
    }
}

pub use error::Error;

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

#[cfg(test)]
mod test {
    use super::*;
    use std::fs;
    use std::os::unix::fs::FileExt;

    pub(crate) fn fake_bar0(dir: &Path) -> PathBuf {
        let path = dir.join("resource0");
        let file = fs::File::create(&path).unwrap();
        file.set_len(0x120000).unwrap();
        let booted = BOOT_COMPLETE_VALUE.to_ne_bytes();
        file.write_at(&booted, BOOT_COMPLETE).unwrap();
        path
    }

    #[test]
    fn reads_and_writes_registers() {
        let dir = tempfile::tempdir().unwrap();
        let path = fake_bar0(dir.path());

        let bar0 = Bar0::open(&path).unwrap();
        bar0.wait_for_boot().unwrap();

        assert_eq!(bar0.read32(MIG_MODE_CHECK).unwrap(), 0);
        bar0.write32(MIG_MODE_CHECK, MIG_MODE_CHECK_MASK).unwrap();
        bar0.sync().unwrap();
        assert_eq!(
            bar0.read32(MIG_MODE_CHECK).unwrap() & MIG_MODE_CHECK_MASK,
            MIG_MODE_CHECK_MASK
        );
        drop(bar0);

        // Writes land in the backing resource.
        let bar0 = Bar0::open(&path).unwrap();
        assert_eq!(bar0.read32(MIG_MODE_CHECK).unwrap(), MIG_MODE_CHECK_MASK);
    }

    #[test]
    fn rejects_out_of_range_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let path = fake_bar0(dir.path());
        let bar0 = Bar0::open(&path).unwrap();
        assert!(matches!(
            bar0.read32(0x200000),
            Err(Error::OutOfRange { .. })
        ));
    }

    #[test]
    fn missing_resource_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Bar0::open(&dir.path().join("resource0")),
            Err(Error::ResourceUnavailable { .. })
        ));
    }
}
