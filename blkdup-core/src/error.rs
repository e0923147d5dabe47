//! The error taxonomy shared by every component of the core.
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias used throughout the core.
pub type Result<T, E = DupError> = std::result::Result<T, E>;

/// Why a device could not be claimed for raw I/O.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BusyCause {
    /// A volume is still mounted and could not be unmounted. A caller may
    /// choose to proceed anyway.
    Mounted,
    /// Another run holds the device lock. Forcing does not help.
    Locked,
}

/// Errors produced by the imaging components.
///
/// Components return these as typed results; only the workflow decides what
/// a given failure means for the run as a whole.
#[derive(Error, Debug)]
pub enum DupError {
    /// Bad device identifier, missing or unwritable paths, bad configuration.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Unmounting failed, or another operation holds the device.
    #[error("Device {device} is busy: {reason}")]
    DeviceBusy {
        device: String,
        reason: String,
        cause: BusyCause,
    },

    /// The raw device could not be opened or failed its probe read.
    #[error("Device {} is not accessible: {source}", path.display())]
    DeviceNotAccessible {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A regular file could not be opened or read.
    #[error("File {} is not readable: {source}", path.display())]
    FileNotReadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// An I/O error aborted the copy.
    #[error("Copy failed after {bytes_copied} bytes: {source}")]
    CopyIo {
        bytes_copied: u64,
        #[source]
        source: io::Error,
    },

    /// The two digests differ.
    #[error("Verification failed: expected {expected}, found {actual}")]
    VerificationFailed { expected: String, actual: String },

    /// The destination digest could not be obtained after the bounded retry.
    #[error("Verification indeterminate after {attempts} attempt(s): {reason}")]
    VerificationIndeterminate { attempts: u32, reason: String },

    /// Remounting a device failed. Only ever reported as a warning.
    #[error("Mount control failed for {device}: {reason}")]
    Mount { device: String, reason: String },

    /// Cooperative cancellation was requested.
    #[error("Operation cancelled by user")]
    Cancelled,
}

impl DupError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, DupError::Cancelled)
    }

    pub fn is_device_busy(&self) -> bool {
        matches!(self, DupError::DeviceBusy { .. })
    }

    /// Busy because another run holds the device lock.
    pub fn is_device_locked(&self) -> bool {
        matches!(
            self,
            DupError::DeviceBusy {
                cause: BusyCause::Locked,
                ..
            }
        )
    }

    /// A short machine-friendly name for the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            DupError::InvalidInput(_) => "invalid_input",
            DupError::DeviceBusy {
                cause: BusyCause::Locked,
                ..
            } => "device_locked",
            DupError::DeviceBusy { .. } => "device_busy",
            DupError::DeviceNotAccessible { .. } => "device_not_accessible",
            DupError::FileNotReadable { .. } => "file_not_readable",
            DupError::CopyIo { .. } => "copy_io_failure",
            DupError::VerificationFailed { .. } => "verification_failed",
            DupError::VerificationIndeterminate { .. } => "verification_indeterminate",
            DupError::Mount { .. } => "mount",
            DupError::Cancelled => "cancelled",
        }
    }
}
