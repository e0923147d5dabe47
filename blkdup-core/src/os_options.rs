//! Opening raw sources and destinations with the right OS flags.
//!
//! Real block devices are opened with `O_DIRECT` (Linux) so that reads and
//! writes bypass the page cache. That in turn requires every transfer to go
//! through a sector-aligned buffer, which [`AlignedBuffer`] provides. Regular
//! files (images, or files standing in for devices) are opened normally.
use std::fs::{File, OpenOptions};
use std::io::{self, Read};
#[cfg(unix)]
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::path::Path;

/// Alignment and padding granularity for direct I/O.
pub(crate) const SECTOR_SIZE: usize = 512;

/// Returns `true` if `path` refers to a block device node.
pub(crate) fn is_block_device(path: &Path) -> bool {
    #[cfg(unix)]
    {
        std::fs::metadata(path)
            .map(|m| m.file_type().is_block_device())
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        false
    }
}

#[cfg(target_os = "linux")]
fn direct_flags(direct: bool) -> i32 {
    if direct { libc::O_DIRECT } else { 0 }
}

#[cfg(not(target_os = "linux"))]
fn direct_flags(_direct: bool) -> i32 {
    0
}

/// Opens `path` for reading. Returns the file and whether direct I/O is in use.
pub(crate) fn open_read(path: &Path) -> io::Result<(File, bool)> {
    let direct = cfg!(target_os = "linux") && is_block_device(path);
    let file = OpenOptions::new()
        .read(true)
        .custom_flags(direct_flags(direct))
        .open(path)?;
    Ok((file, direct))
}

/// Opens `path` for writing. Block devices are never truncated or created.
/// Regular files are created if missing and cut to zero length when
/// `truncate` is set.
pub(crate) fn open_write(path: &Path, truncate: bool) -> io::Result<(File, bool)> {
    if is_block_device(path) {
        let direct = cfg!(target_os = "linux");
        let file = OpenOptions::new()
            .write(true)
            .custom_flags(direct_flags(direct))
            .open(path)?;
        Ok((file, direct))
    } else {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(truncate)
            .open(path)?;
        Ok((file, false))
    }
}

/// A heap buffer whose usable region starts on a sector boundary.
pub(crate) struct AlignedBuffer {
    storage: Vec<u8>,
    offset: usize,
    len: usize,
}

impl AlignedBuffer {
    /// `len` should be a multiple of [`SECTOR_SIZE`] when used for direct I/O.
    pub(crate) fn new(len: usize) -> Self {
        let storage = vec![0u8; len + SECTOR_SIZE];
        let offset = storage.as_ptr().align_offset(SECTOR_SIZE);
        Self {
            storage,
            offset,
            len,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn as_slice(&self) -> &[u8] {
        &self.storage[self.offset..self.offset + self.len]
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.storage[self.offset..self.offset + self.len]
    }
}

/// Reads until `buf` is full or the reader hits EOF. Returns the number of
/// bytes read; anything short of `buf.len()` means EOF was reached.
pub(crate) fn read_full<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Rounds `n` up to the next sector boundary.
pub(crate) fn round_up_to_sector(n: usize) -> usize {
    n.div_ceil(SECTOR_SIZE) * SECTOR_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_is_sector_aligned() {
        let mut buf = AlignedBuffer::new(4 * SECTOR_SIZE);
        assert_eq!(buf.len(), 4 * SECTOR_SIZE);
        assert_eq!(buf.as_mut_slice().as_ptr() as usize % SECTOR_SIZE, 0);
        assert!(buf.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn rounding() {
        assert_eq!(round_up_to_sector(0), 0);
        assert_eq!(round_up_to_sector(1), 512);
        assert_eq!(round_up_to_sector(512), 512);
        assert_eq!(round_up_to_sector(513), 1024);
    }

    #[test]
    fn read_full_coalesces_short_reads() {
        struct Trickle<'a>(&'a [u8]);
        impl Read for Trickle<'_> {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                let n = self.0.len().min(buf.len()).min(3);
                buf[..n].copy_from_slice(&self.0[..n]);
                self.0 = &self.0[n..];
                Ok(n)
            }
        }
        let data = [7u8; 10];
        let mut buf = [0u8; 8];
        assert_eq!(read_full(&mut Trickle(&data), &mut buf).unwrap(), 8);
        let mut big = [0u8; 16];
        assert_eq!(read_full(&mut Trickle(&data), &mut big).unwrap(), 10);
    }

    #[test]
    fn regular_files_are_not_block_devices() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(!is_block_device(file.path()));
        let (_f, direct) = open_read(file.path()).unwrap();
        assert!(!direct);
    }
}
