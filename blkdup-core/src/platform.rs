//! Provides platform-specific functionality.
//!
//! This module contains the logic for interacting with the operating system to
//! perform tasks that are not cross-platform: discovering block devices,
//! unmounting and remounting their volumes, and querying device sizes.
//!
//! It uses conditional compilation (`#[cfg]`) to expose the correct implementation
//! for the target OS (Linux, macOS). Each submodule exposes the same public API,
//! so the rest of the library can use it without worrying about the underlying
//! platform:
//!
//! - `list_devices(include_fixed) -> anyhow::Result<Vec<Device>>`
//! - `unmount_device(&DeviceRef) -> error::Result<bool>`
//! - `mount_device(&DeviceRef) -> error::Result<()>`
//! - `device_size(&Path) -> Option<u64>`

use std::ffi::OsStr;
use std::process::{Command, Output};

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use self::linux::*;

#[cfg(target_os = "macos")]
mod macos;
#[cfg(target_os = "macos")]
pub use self::macos::*;

/// Runs an external tool and returns its output if it exited successfully.
/// On failure, returns a one-line reason built from stderr.
pub(crate) fn run_tool<I, S>(program: &str, args: I) -> Result<Output, String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| format!("failed to execute {program}: {e}"))?;

    if output.status.success() {
        Ok(output)
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let reason = stderr.trim();
        Err(if reason.is_empty() {
            format!("{program} exited with {}", output.status)
        } else {
            reason.lines().next().unwrap_or(reason).to_string()
        })
    }
}
