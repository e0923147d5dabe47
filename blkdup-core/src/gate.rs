//! Mount-state control for the device side of an operation.
//!
//! Raw I/O against a device with mounted volumes corrupts them, so every run
//! unmounts first. Unmount failures are reported, never retried here: going
//! ahead with a mounted device has to be an explicit decision by the caller.
use crate::device::DeviceRef;
use crate::error::{BusyCause, DupError, Result};
use crate::platform;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Puts a device into the mount state an operation needs.
pub trait DeviceGate: Send + Sync {
    /// Unmounts all volumes of `device` and returns whether anything was
    /// mounted. A device with nothing mounted is a successful no-op
    /// (`Ok(false)`). Fails with [`DupError::DeviceBusy`] when a volume
    /// cannot be unmounted.
    fn ensure_unmounted(&self, device: &DeviceRef) -> Result<bool>;

    /// Mounts the volumes of `device` again. Best-effort: callers report a
    /// failure as a warning.
    fn ensure_mounted(&self, device: &DeviceRef) -> Result<()>;
}

/// The gate backed by the operating system's mount facilities.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemGate;

impl DeviceGate for SystemGate {
    fn ensure_unmounted(&self, device: &DeviceRef) -> Result<bool> {
        platform::unmount_device(device)
    }

    fn ensure_mounted(&self, device: &DeviceRef) -> Result<()> {
        platform::mount_device(device)
    }
}

#[derive(Debug, Default)]
struct SimulatedState {
    mounted: bool,
    busy: bool,
    remount_fails: bool,
}

/// An in-memory gate for simulated devices.
///
/// Tracks a single mounted/unmounted flag and lets tests make the device busy
/// or make remounting fail. Calls are counted.
#[derive(Debug, Default)]
pub struct SimulatedGate {
    state: Mutex<SimulatedState>,
    unmount_calls: AtomicUsize,
    mount_calls: AtomicUsize,
}

impl SimulatedGate {
    /// A gate whose device starts out unmounted.
    pub fn new() -> Self {
        Self::default()
    }

    /// A gate whose device starts out mounted.
    pub fn mounted() -> Self {
        let gate = Self::default();
        gate.lock().mounted = true;
        gate
    }

    /// While busy, unmounting a mounted device fails.
    pub fn set_busy(&self, busy: bool) {
        self.lock().busy = busy;
    }

    pub fn set_remount_fails(&self, fails: bool) {
        self.lock().remount_fails = fails;
    }

    pub fn is_mounted(&self) -> bool {
        self.lock().mounted
    }

    pub fn unmount_calls(&self) -> usize {
        self.unmount_calls.load(Ordering::SeqCst)
    }

    pub fn mount_calls(&self) -> usize {
        self.mount_calls.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimulatedState> {
        // The state is plain flags; a poisoned lock still holds valid data.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl DeviceGate for SimulatedGate {
    fn ensure_unmounted(&self, device: &DeviceRef) -> Result<bool> {
        self.unmount_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.lock();
        if !state.mounted {
            return Ok(false);
        }
        if state.busy {
            return Err(DupError::DeviceBusy {
                device: device.identifier().to_string(),
                reason: "target is busy".to_string(),
                cause: BusyCause::Mounted,
            });
        }
        state.mounted = false;
        Ok(true)
    }

    fn ensure_mounted(&self, device: &DeviceRef) -> Result<()> {
        self.mount_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.lock();
        if state.remount_fails {
            return Err(DupError::Mount {
                device: device.identifier().to_string(),
                reason: "no mountable filesystem".to_string(),
            });
        }
        state.mounted = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceNaming;

    fn device() -> DeviceRef {
        DeviceRef::parse_with(DeviceNaming::Linux, "sdz").unwrap()
    }

    #[test]
    fn unmount_is_idempotent() {
        let gate = SimulatedGate::new();
        let dev = device();
        assert!(!gate.ensure_unmounted(&dev).unwrap());
        assert!(!gate.ensure_unmounted(&dev).unwrap());
        assert!(!gate.is_mounted());
        assert_eq!(gate.unmount_calls(), 2);
    }

    #[test]
    fn busy_device_reports_busy() {
        let gate = SimulatedGate::mounted();
        gate.set_busy(true);
        let err = gate.ensure_unmounted(&device()).unwrap_err();
        assert!(err.is_device_busy());
        assert!(!err.is_device_locked());
        assert!(gate.is_mounted());

        gate.set_busy(false);
        assert!(gate.ensure_unmounted(&device()).unwrap());
        assert!(!gate.is_mounted());
        assert!(!gate.ensure_unmounted(&device()).unwrap());
    }

    #[test]
    fn busy_flag_is_irrelevant_when_unmounted() {
        let gate = SimulatedGate::new();
        gate.set_busy(true);
        assert!(!gate.ensure_unmounted(&device()).unwrap());
    }

    #[test]
    fn remount_failure_is_a_mount_error() {
        let gate = SimulatedGate::new();
        gate.set_remount_fails(true);
        let err = gate.ensure_mounted(&device()).unwrap_err();
        assert!(matches!(err, DupError::Mount { .. }));
        assert!(!gate.is_mounted());
    }
}
