use crate::device::{Device, DeviceRef};
use crate::error::{BusyCause, DupError, Result};
use crate::os_options;
use anyhow::anyhow;
use nix::errno::Errno;
use nix::ioctl_read;
use nix::mount::{MntFlags, umount2};
use std::fs;
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

ioctl_read!(blkgetsize64, 0x12, 114, u64);

const MOUNTS_TABLE: &str = "/proc/self/mounts";

/// Helper to read a specific file from the /sys/block filesystem.
fn read_sys_file(device_name: &str, file: &str) -> io::Result<String> {
    let path = PathBuf::from("/sys/block").join(device_name).join(file);
    fs::read_to_string(path).map(|s| s.trim().to_string())
}

/// Helper to find the parent device of a partition (e.g., /dev/sda1 -> /dev/sda).
/// This is used to find the system drive's parent for exclusion.
fn get_parent_device_path(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if path_str.starts_with("/dev/sd") || path_str.starts_with("/dev/vd") {
        if let Some(index) = path_str.rfind(|c: char| c.is_alphabetic()) {
            return PathBuf::from(&path_str[..=index]);
        }
    } else if path_str.starts_with("/dev/mmcblk") || path_str.starts_with("/dev/nvme") {
        if let Some(index) = path_str.rfind('p') {
            return PathBuf::from(&path_str[..index]);
        }
    }

    path.to_path_buf()
}

/// Returns `true` if `source` is `node` itself or one of its partitions.
///
/// Nodes ending in a letter (`sdb`) number partitions directly (`sdb1`);
/// nodes ending in a digit (`nvme0n1`, `loop1`) use a `p` separator
/// (`nvme0n1p1`), so `loop12` is not a partition of `loop1`.
fn belongs_to(source: &str, node: &str) -> bool {
    let Some(rest) = source.strip_prefix(node) else {
        return false;
    };
    if rest.is_empty() {
        return true;
    }
    let digits = if node.ends_with(|c: char| c.is_ascii_digit()) {
        match rest.strip_prefix('p') {
            Some(digits) => digits,
            None => return false,
        }
    } else {
        rest
    };
    !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())
}

/// Decodes the octal escapes (`\040` for space, ...) used in the mounts table.
fn unescape_mount_path(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let octal = &bytes[i + 1..i + 4];
            if octal.iter().all(|b| (b'0'..=b'7').contains(b)) {
                let value = octal.iter().fold(0u16, |acc, b| acc * 8 + u16::from(b - b'0'));
                if let Ok(value) = u8::try_from(value) {
                    out.push(value);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn parse_mounts(table: &str, node: &Path) -> Vec<PathBuf> {
    let node = node.to_string_lossy();
    table
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let source = fields.next()?;
            let mount_point = fields.next()?;
            belongs_to(source, &node).then(|| PathBuf::from(unescape_mount_path(mount_point)))
        })
        .collect()
}

/// Lists the mount points of every volume on `node` (the device itself and its
/// partitions).
pub fn mounted_volumes(node: &Path) -> io::Result<Vec<PathBuf>> {
    let table = fs::read_to_string(MOUNTS_TABLE)?;
    Ok(parse_mounts(&table, node))
}

/// Unmounts every volume of `device`. A device with nothing mounted is left
/// untouched. Returns `true` if at least one volume was unmounted.
pub fn unmount_device(device: &DeviceRef) -> Result<bool> {
    let busy = |reason: String| DupError::DeviceBusy {
        device: device.identifier().to_string(),
        reason,
        cause: BusyCause::Mounted,
    };

    let mut mount_points = mounted_volumes(device.node_path())
        .map_err(|e| busy(format!("cannot read {MOUNTS_TABLE}: {e}")))?;
    if mount_points.is_empty() {
        debug!(device = %device, "No mounted volumes");
        return Ok(false);
    }

    // Nested mounts must go before their parents.
    mount_points.sort_by_key(|p| std::cmp::Reverse(p.components().count()));

    let mut unmounted = false;
    for mount_point in &mount_points {
        match umount2(mount_point, MntFlags::empty()) {
            Ok(()) => {
                info!(device = %device, mount_point = %mount_point.display(), "Unmounted");
                unmounted = true;
            }
            // Already gone, e.g. an automounter beat us to it.
            Err(Errno::EINVAL) | Err(Errno::ENOENT) => {}
            Err(errno) => {
                return Err(busy(format!(
                    "cannot unmount {}: {}",
                    mount_point.display(),
                    errno.desc()
                )));
            }
        }
    }
    Ok(unmounted)
}

/// Asks udisks to mount the partitions of `device` again.
pub fn mount_device(device: &DeviceRef) -> Result<()> {
    let name = device.identifier();
    let mut partitions: Vec<String> = fs::read_dir(PathBuf::from("/sys/block").join(name))
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().to_string())
                .filter(|entry| entry.starts_with(name))
                .collect()
        })
        .unwrap_or_default();
    partitions.sort();
    if partitions.is_empty() {
        partitions.push(name.to_string());
    }

    let mut failures = Vec::new();
    for partition in &partitions {
        let node = format!("/dev/{partition}");
        match super::run_tool("udisksctl", ["mount", "--no-user-interaction", "-b", &node]) {
            Ok(_) => info!(device = %device, partition = %node, "Mounted"),
            Err(reason) => failures.push(format!("{node}: {reason}")),
        }
    }

    // Partitions without a filesystem always fail; one success is enough.
    if failures.len() == partitions.len() {
        return Err(DupError::Mount {
            device: name.to_string(),
            reason: failures.join("; "),
        });
    }
    Ok(())
}

/// Size in bytes of a block device or regular file.
pub fn device_size(path: &Path) -> Option<u64> {
    if !os_options::is_block_device(path) {
        return fs::metadata(path).ok().map(|m| m.len());
    }
    let file = fs::File::open(path).ok()?;
    let mut size_bytes: u64 = 0;
    // SAFETY: BLKGETSIZE64 writes a single u64 through the pointer.
    unsafe { blkgetsize64(file.as_raw_fd(), &mut size_bytes) }.ok()?;
    Some(size_bytes)
}

/// Scans for whole block devices on a Linux system.
///
/// This function discovers devices by iterating through the `/sys/block` directory.
/// The filtering logic is as follows:
/// 1.  Find the main system drive (e.g., `/dev/nvme0n1`) and exclude it.
/// 2.  Skip loop, ram, zram, device-mapper and optical devices.
/// 3.  Unless `include_fixed` is set, keep only devices whose
///     `/sys/block/<device>/removable` flag is set.
/// 4.  Skip devices that report a size of zero, which often corresponds to
///     empty card readers.
pub fn list_devices(include_fixed: bool) -> anyhow::Result<Vec<Device>> {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    let system_disk_parent = disks
        .iter()
        .find(|disk| disk.mount_point() == Path::new("/"))
        .map(|disk| get_parent_device_path(&PathBuf::from("/dev/").join(disk.name())))
        .ok_or_else(|| anyhow!("Could not determine system drive."))?;

    let mounts = fs::read_to_string(MOUNTS_TABLE).unwrap_or_default();
    let mut devices = Vec::new();

    for entry in fs::read_dir("/sys/block")?.filter_map(|e| e.ok()) {
        let device_name = entry.file_name().to_string_lossy().to_string();
        let device_path = PathBuf::from("/dev/").join(&device_name);

        let virtual_device = ["loop", "ram", "zram", "dm-", "sr", "md"]
            .iter()
            .any(|prefix| device_name.starts_with(prefix));
        if virtual_device || device_path == system_disk_parent {
            continue;
        }

        let removable = read_sys_file(&device_name, "removable")
            .map(|s| s == "1")
            .unwrap_or(false);
        if !removable && !include_fixed {
            continue;
        }

        let size_sectors = read_sys_file(&device_name, "size")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);
        if size_sectors == 0 {
            continue;
        }

        let vendor = read_sys_file(&device_name, "device/vendor").unwrap_or_default();
        let model = read_sys_file(&device_name, "device/model").unwrap_or_default();
        let description = format!("{vendor} {model}").trim().to_string();

        devices.push(Device {
            mount_points: parse_mounts(&mounts, &device_path),
            path: device_path,
            name: device_name,
            description,
            size_bytes: size_sectors * 512,
            removable,
        });
    }

    devices.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(devices)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = "\
sysfs /sys sysfs rw,nosuid 0 0
/dev/nvme0n1p2 / ext4 rw,relatime 0 0
/dev/sdb1 /media/user/MY\\040STICK vfat rw 0 0
/dev/sdb2 /media/user/data ext4 rw 0 0
/dev/sdbc1 /mnt/other ext4 rw 0 0
";

    #[test]
    fn finds_partitions_of_device() {
        let mounts = parse_mounts(TABLE, Path::new("/dev/sdb"));
        assert_eq!(
            mounts,
            vec![
                PathBuf::from("/media/user/MY STICK"),
                PathBuf::from("/media/user/data"),
            ]
        );
        assert_eq!(
            parse_mounts(TABLE, Path::new("/dev/nvme0n1")),
            vec![PathBuf::from("/")]
        );
        assert!(parse_mounts(TABLE, Path::new("/dev/sdc")).is_empty());
    }

    #[test]
    fn partition_suffixes() {
        assert!(belongs_to("/dev/sda", "/dev/sda"));
        assert!(belongs_to("/dev/sda12", "/dev/sda"));
        assert!(belongs_to("/dev/mmcblk0p1", "/dev/mmcblk0"));
        assert!(!belongs_to("/dev/sdab", "/dev/sda"));
        assert!(!belongs_to("/dev/mmcblk0boot0", "/dev/mmcblk0"));
        assert!(belongs_to("/dev/nvme0n1p3", "/dev/nvme0n1"));
        assert!(belongs_to("/dev/loop1p1", "/dev/loop1"));
        assert!(!belongs_to("/dev/nvme0n12", "/dev/nvme0n1"));
        assert!(!belongs_to("/dev/loop12", "/dev/loop1"));
        assert!(!belongs_to("/dev/mmcblk01", "/dev/mmcblk0"));
    }

    #[test]
    fn other_loop_devices_are_not_claimed() {
        let table = "\
/dev/loop12 /snap/core/123 squashfs ro 0 0
/dev/loop1p1 /mnt/image ext4 rw 0 0
";
        assert_eq!(
            parse_mounts(table, Path::new("/dev/loop1")),
            vec![PathBuf::from("/mnt/image")]
        );
        assert!(parse_mounts(table, Path::new("/dev/loop2")).is_empty());
    }

    #[test]
    fn parent_of_partition() {
        assert_eq!(
            get_parent_device_path(Path::new("/dev/sda1")),
            PathBuf::from("/dev/sda")
        );
        assert_eq!(
            get_parent_device_path(Path::new("/dev/nvme0n1p2")),
            PathBuf::from("/dev/nvme0n1")
        );
    }

    #[test]
    fn unescapes_octal() {
        assert_eq!(unescape_mount_path("/a\\040b"), "/a b");
        assert_eq!(unescape_mount_path("/plain"), "/plain");
        assert_eq!(unescape_mount_path("/trail\\"), "/trail\\");
    }

    #[test]
    fn regular_file_size() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), [0u8; 1536]).unwrap();
        assert_eq!(device_size(file.path()), Some(1536));
    }
}
