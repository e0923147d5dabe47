//! Device and image references.
//!
//! [`Device`] is what discovery reports; [`DeviceRef`] is the validated handle
//! the imaging workflow operates on; [`ImageRef`] names the image file side.
use crate::error::{DupError, Result};
use regex::Regex;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

/// Represents a block device discovered on the system.
///
/// This struct holds cross-platform information about a device, such as its
/// system path, size, and mount points. It is populated by the platform-specific
/// discovery functions in the [`crate::platform`] module.
#[derive(Clone, Debug)]
pub struct Device {
    /// The system path to the device (e.g., `/dev/sda` or `/dev/disk2`).
    pub path: PathBuf,
    /// The kernel-provided name of the device (e.g., "sda").
    pub name: String,
    /// A human-readable description, usually the vendor and model.
    pub description: String,
    /// The total size of the device in bytes.
    pub size_bytes: u64,
    /// Whether the kernel flags the device as removable.
    pub removable: bool,
    /// Mount points of any volumes on the device.
    pub mount_points: Vec<PathBuf>,
}

impl Device {
    pub fn size_gb(&self) -> f64 {
        self.size_bytes as f64 / (1024.0 * 1024.0 * 1024.0)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mount_info = match self.mount_points.first() {
            Some(mp) => format!("[Mounted at {}]", mp.display()),
            None => "[Not mounted]".to_string(),
        };

        write!(
            f,
            "{:<15} {:>7.1} GB  {:<25} {}",
            self.path.display(),
            self.size_gb(),
            self.description,
            mount_info
        )
    }
}

/// The device naming convention of a platform.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceNaming {
    /// `sda`, `vdb`, `nvme0n1`, `mmcblk0`, `loop3`, ...
    Linux,
    /// `disk2`, `disk10`, ...
    Darwin,
}

static LINUX_WHOLE_DISK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:(?:sd|vd|hd|xvd)[a-z]+|nvme\d+n\d+|mmcblk\d+|loop\d+)$")
        .expect("valid regex")
});

static DARWIN_WHOLE_DISK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^disk\d+$").expect("valid regex"));

impl DeviceNaming {
    /// The convention of the platform this binary was built for.
    pub fn native() -> Self {
        if cfg!(target_os = "macos") {
            DeviceNaming::Darwin
        } else {
            DeviceNaming::Linux
        }
    }

    fn pattern(self) -> &'static Regex {
        match self {
            DeviceNaming::Linux => &LINUX_WHOLE_DISK,
            DeviceNaming::Darwin => &DARWIN_WHOLE_DISK,
        }
    }

    /// Strips `/dev/` and, on Darwin, the raw-node `r` prefix.
    fn normalize(self, input: &str) -> String {
        let name = input.trim();
        let name = name.strip_prefix("/dev/").unwrap_or(name);
        match self {
            DeviceNaming::Darwin if name.starts_with("rdisk") => name[1..].to_string(),
            _ => name.to_string(),
        }
    }

    fn node_path(self, identifier: &str) -> PathBuf {
        PathBuf::from("/dev").join(identifier)
    }

    fn raw_path(self, identifier: &str) -> PathBuf {
        match self {
            DeviceNaming::Linux => PathBuf::from("/dev").join(identifier),
            DeviceNaming::Darwin => PathBuf::from("/dev").join(format!("r{identifier}")),
        }
    }
}

/// A validated reference to a whole block device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceRef {
    identifier: String,
    node_path: PathBuf,
    raw_path: PathBuf,
    backed: bool,
}

impl DeviceRef {
    /// Parses an identifier using the native naming convention.
    pub fn parse(input: &str) -> Result<Self> {
        Self::parse_with(DeviceNaming::native(), input)
    }

    /// Parses an identifier such as `sdb`, `/dev/nvme0n1` or `disk2`.
    ///
    /// Partition identifiers are rejected; imaging always covers the whole
    /// device.
    pub fn parse_with(naming: DeviceNaming, input: &str) -> Result<Self> {
        let identifier = naming.normalize(input);
        if identifier.is_empty() {
            return Err(DupError::InvalidInput(
                "device identifier is empty".to_string(),
            ));
        }
        if !naming.pattern().is_match(&identifier) {
            return Err(DupError::InvalidInput(format!(
                "'{input}' is not a whole-disk device name"
            )));
        }
        Ok(Self {
            node_path: naming.node_path(&identifier),
            raw_path: naming.raw_path(&identifier),
            identifier,
            backed: false,
        })
    }

    /// Binds this reference to an explicit backing path for raw I/O.
    ///
    /// Used for simulated devices: a regular file that stands in for the
    /// device while the identifier keeps its validated name.
    pub fn with_backing_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.raw_path = path.into();
        self.backed = true;
        self
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// The device node used for mount bookkeeping (`/dev/disk2`).
    pub fn node_path(&self) -> &Path {
        &self.node_path
    }

    /// The path raw reads and writes go through (`/dev/rdisk2`).
    pub fn raw_path(&self) -> &Path {
        &self.raw_path
    }

    /// Whether the raw path was overridden with a backing file.
    pub fn is_backed(&self) -> bool {
        self.backed
    }
}

impl fmt::Display for DeviceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.identifier)
    }
}

/// The advisory format tag of an image file.
///
/// The bytes are raw regardless of the tag; it only reflects the extension.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageFormat {
    Img,
    Iso,
    Dmg,
    Bin,
    Custom,
}

impl ImageFormat {
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();
        match ext.as_str() {
            "img" => ImageFormat::Img,
            "iso" => ImageFormat::Iso,
            "dmg" => ImageFormat::Dmg,
            "bin" => ImageFormat::Bin,
            _ => ImageFormat::Custom,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ImageFormat::Img => "img",
            ImageFormat::Iso => "iso",
            ImageFormat::Dmg => "dmg",
            ImageFormat::Bin => "bin",
            ImageFormat::Custom => "custom",
        }
    }
}

/// A reference to the image file side of an operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageRef {
    path: PathBuf,
    format: ImageFormat,
}

impl ImageRef {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let format = ImageFormat::from_path(&path);
        Self { path, format }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> ImageFormat {
        self.format
    }

    /// Checks that the image can be created: its parent directory must exist
    /// and be writable.
    pub fn validate_for_capture(&self) -> Result<()> {
        if self.path.as_os_str().is_empty() {
            return Err(DupError::InvalidInput("image path is empty".to_string()));
        }
        if self.path.is_dir() {
            return Err(DupError::InvalidInput(format!(
                "image path {} is a directory",
                self.path.display()
            )));
        }
        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        if !parent.is_dir() {
            return Err(DupError::InvalidInput(format!(
                "directory {} does not exist",
                parent.display()
            )));
        }
        if !is_writable(parent) {
            return Err(DupError::InvalidInput(format!(
                "directory {} is not writable",
                parent.display()
            )));
        }
        Ok(())
    }

    /// Checks that the image exists and is a readable regular file. Returns
    /// its length in bytes.
    pub fn validate_for_restore(&self) -> Result<u64> {
        let meta = std::fs::metadata(&self.path).map_err(|e| {
            DupError::InvalidInput(format!("image {} cannot be read: {e}", self.path.display()))
        })?;
        if !meta.is_file() {
            return Err(DupError::InvalidInput(format!(
                "image {} is not a regular file",
                self.path.display()
            )));
        }
        std::fs::File::open(&self.path).map_err(|e| {
            DupError::InvalidInput(format!("image {} cannot be read: {e}", self.path.display()))
        })?;
        Ok(meta.len())
    }
}

#[cfg(unix)]
fn is_writable(dir: &Path) -> bool {
    use nix::unistd::{AccessFlags, access};
    access(dir, AccessFlags::W_OK).is_ok()
}

#[cfg(not(unix))]
fn is_writable(dir: &Path) -> bool {
    std::fs::metadata(dir)
        .map(|m| !m.permissions().readonly())
        .unwrap_or(false)
}
