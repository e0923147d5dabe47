use crate::device::{Device, DeviceRef};
use crate::error::{BusyCause, DupError, Result};
use crate::os_options;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Extracts `Key: value` pairs from `diskutil info` output.
fn info_field<'a>(info: &'a str, key: &str) -> Option<&'a str> {
    info.lines().find_map(|line| {
        let (k, v) = line.split_once(':')?;
        (k.trim() == key).then(|| v.trim())
    })
}

/// Parses the byte count out of a `Disk Size:` value such as
/// `31.9 GB (31914983424 Bytes) (exactly 62333952 512-Byte-Units)`.
fn parse_disk_size(value: &str) -> Option<u64> {
    let start = value.find('(')? + 1;
    let rest = &value[start..];
    let end = rest.find(" Bytes")?;
    rest[..end].trim().parse().ok()
}

fn disk_info(node: &str) -> Option<String> {
    let output = super::run_tool("diskutil", ["info", node]).ok()?;
    Some(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Parses `mount` output (`/dev/disk2s1 on /Volumes/X (msdos, ...)`) for the
/// volumes of `node`, whose slices are named `<node>s<N>`.
fn parse_mount_output(output: &str, node: &Path) -> Vec<PathBuf> {
    let node = node.to_string_lossy();
    output
        .lines()
        .filter_map(|line| {
            let (source, rest) = line.split_once(" on ")?;
            let suffix = source.strip_prefix(node.as_ref())?;
            let is_ours = suffix.is_empty()
                || suffix
                    .strip_prefix('s')
                    .is_some_and(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()));
            let mount_point = rest.rsplit_once(" (").map_or(rest, |(mp, _)| mp);
            is_ours.then(|| PathBuf::from(mount_point))
        })
        .collect()
}

/// Unmounts every volume of `device` with `diskutil unmountDisk`. A disk with
/// nothing mounted is left untouched. Returns `true` if anything was mounted.
pub fn unmount_device(device: &DeviceRef) -> Result<bool> {
    let node = device.node_path();
    let table = super::run_tool("mount", std::iter::empty::<&str>()).map_err(|reason| {
        DupError::DeviceBusy {
            device: device.identifier().to_string(),
            reason: format!("cannot list mounts: {reason}"),
            cause: BusyCause::Mounted,
        }
    })?;
    if parse_mount_output(&String::from_utf8_lossy(&table.stdout), node).is_empty() {
        debug!(device = %device, "No mounted volumes");
        return Ok(false);
    }

    super::run_tool("diskutil", [Path::new("unmountDisk"), node]).map_err(|reason| {
        DupError::DeviceBusy {
            device: device.identifier().to_string(),
            reason,
            cause: BusyCause::Mounted,
        }
    })?;
    info!(device = %device, "Unmounted");
    Ok(true)
}

/// Mounts the volumes of `device` again with `diskutil mountDisk`.
pub fn mount_device(device: &DeviceRef) -> Result<()> {
    let node = device.node_path();
    super::run_tool("diskutil", [Path::new("mountDisk"), node]).map_err(|reason| {
        DupError::Mount {
            device: device.identifier().to_string(),
            reason,
        }
    })?;
    info!(device = %device, "Mounted");
    Ok(())
}

/// Size in bytes of a regular file. Raw disk nodes report zero through
/// `stat`, so their size is unknown here.
pub fn device_size(path: &Path) -> Option<u64> {
    if os_options::is_block_device(path) {
        return None;
    }
    fs::metadata(path).ok().map(|m| m.len())
}

/// Scans `/dev` for whole disks and describes them with `diskutil info`.
///
/// Internal disks are skipped unless `include_fixed` is set; the disk holding
/// the running system is always skipped.
pub fn list_devices(include_fixed: bool) -> anyhow::Result<Vec<Device>> {
    let mut devices = Vec::new();

    for entry in fs::read_dir("/dev")?.filter_map(|e| e.ok()) {
        let name = entry.file_name().to_string_lossy().to_string();
        // Each disk also has an `rdiskN` raw node.
        if !name.starts_with("disk") {
            continue;
        }
        let Ok(device) = DeviceRef::parse_with(crate::device::DeviceNaming::Darwin, &name) else {
            continue;
        };
        let node = device.node_path().to_string_lossy().to_string();
        let Some(info) = disk_info(&node) else {
            continue;
        };

        // Synthesized APFS containers mirror a physical disk.
        if info_field(&info, "Virtual") == Some("Yes") {
            continue;
        }
        let internal = info_field(&info, "Device Location") == Some("Internal");
        let removable = info_field(&info, "Removable Media")
            .is_some_and(|v| v == "Removable" || v == "Yes")
            || !internal;
        if !removable && !include_fixed {
            continue;
        }
        let size_bytes = info_field(&info, "Disk Size")
            .and_then(parse_disk_size)
            .unwrap_or(0);
        if size_bytes == 0 {
            continue;
        }

        let mount_points = info_field(&info, "Mount Point")
            .filter(|mp| !mp.is_empty())
            .map(|mp| vec![PathBuf::from(mp)])
            .unwrap_or_default();
        if mount_points.iter().any(|mp| mp == Path::new("/")) {
            continue;
        }

        devices.push(Device {
            path: device.node_path().to_path_buf(),
            name: device.identifier().to_string(),
            description: info_field(&info, "Device / Media Name")
                .unwrap_or_default()
                .to_string(),
            size_bytes,
            removable,
            mount_points,
        });
    }

    devices.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(devices)
}
