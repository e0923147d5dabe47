//! Per-device advisory locking.
//!
//! Two runs against the same device would interleave raw writes and reads,
//! so a run holds an exclusive `flock` on a lock file named after the device
//! identifier for its whole duration.
use crate::device::DeviceRef;
use crate::error::{BusyCause, DupError, Result};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Holds the exclusive lock for one device. Released on drop, or by the OS
/// when the process exits.
#[derive(Debug)]
pub struct DeviceLock {
    _flock: Flock<File>,
    path: PathBuf,
}

impl DeviceLock {
    /// Attempts to lock `device` without blocking.
    ///
    /// Fails with [`DupError::DeviceBusy`] if another run holds the lock.
    pub fn acquire(lock_dir: &Path, device: &DeviceRef) -> Result<Self> {
        let path = lock_dir.join(format!("blkdup-{}.lock", device.identifier()));
        let busy = |reason: String| DupError::DeviceBusy {
            device: device.identifier().to_string(),
            reason,
            cause: BusyCause::Locked,
        };

        std::fs::create_dir_all(lock_dir)
            .map_err(|e| busy(format!("cannot create lock directory: {e}")))?;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| busy(format!("cannot open lock file {}: {e}", path.display())))?;

        let flock = Flock::lock(file, FlockArg::LockExclusiveNonblock).map_err(|(_, errno)| {
            if errno == Errno::EWOULDBLOCK {
                busy("another imaging operation is using this device".to_string())
            } else {
                busy(format!("cannot lock {}: {}", path.display(), errno.desc()))
            }
        })?;

        debug!(lock_path = %path.display(), "Acquired device lock");
        Ok(Self {
            _flock: flock,
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DeviceLock {
    fn drop(&mut self) {
        debug!(lock_path = %self.path.display(), "Released device lock");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceNaming;
    use tempfile::TempDir;

    fn device(name: &str) -> DeviceRef {
        DeviceRef::parse_with(DeviceNaming::Linux, name).unwrap()
    }

    #[test]
    fn lock_prevents_concurrent_runs() {
        let dir = TempDir::new().unwrap();
        let lock = DeviceLock::acquire(dir.path(), &device("sdy")).unwrap();
        assert!(lock.path().ends_with("blkdup-sdy.lock"));

        let err = DeviceLock::acquire(dir.path(), &device("sdy")).unwrap_err();
        assert!(err.is_device_busy());
        assert!(err.is_device_locked());
    }

    #[test]
    fn lock_released_on_drop() {
        let dir = TempDir::new().unwrap();
        {
            let _lock = DeviceLock::acquire(dir.path(), &device("sdy")).unwrap();
        }
        assert!(DeviceLock::acquire(dir.path(), &device("sdy")).is_ok());
    }

    #[test]
    fn different_devices_are_independent() {
        let dir = TempDir::new().unwrap();
        let _a = DeviceLock::acquire(dir.path(), &device("sdx")).unwrap();
        let _b = DeviceLock::acquire(dir.path(), &device("sdy")).unwrap();
    }

    #[test]
    fn lock_across_threads() {
        let dir = TempDir::new().unwrap();
        let _held = DeviceLock::acquire(dir.path(), &device("sdw")).unwrap();
        let path = dir.path().to_path_buf();
        let result = std::thread::spawn(move || DeviceLock::acquire(&path, &device("sdw")).is_ok())
            .join()
            .unwrap();
        assert!(!result);
    }
}
