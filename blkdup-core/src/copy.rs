//! Whole-extent raw copying between devices and image files.
//!
//! The copier moves bytes from a source to a destination in fixed-size blocks
//! until the source is exhausted. It is direction-agnostic: capture copies a
//! device into an image file, restore copies an image file onto a device.
use crate::cancel::CancelToken;
use crate::error::DupError;
use crate::os_options::{self, AlignedBuffer, SECTOR_SIZE};
use std::io::{self, Write};
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// The default block size, 1 MiB.
pub const DEFAULT_BLOCK_SIZE: usize = 1024 * 1024;

/// How a copy reads and writes.
#[derive(Clone, Copy, Debug)]
pub struct CopyOptions {
    pub block_size: usize,
    /// Cut a regular-file destination to the copied extent. Left off when the
    /// file stands in for a device, whose size does not change on write.
    pub truncate_dest: bool,
}

impl Default for CopyOptions {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            truncate_dest: true,
        }
    }
}

impl CopyOptions {
    pub fn with_block_size(block_size: usize) -> Self {
        Self {
            block_size,
            ..Self::default()
        }
    }
}

/// The outcome of a single copy run.
#[derive(Debug)]
pub struct CopyResult {
    bytes_copied: u64,
    elapsed: Duration,
    error: Option<DupError>,
}

impl CopyResult {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }

    pub fn was_cancelled(&self) -> bool {
        self.error.as_ref().is_some_and(DupError::is_cancelled)
    }

    pub fn bytes_copied(&self) -> u64 {
        self.bytes_copied
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn error(&self) -> Option<&DupError> {
        self.error.as_ref()
    }

    /// Average throughput in bytes per second.
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.bytes_copied as f64 / secs
        } else {
            0.0
        }
    }
}

/// Copies the full extent of `source` to `dest`.
///
/// Reads proceed in `options.block_size` chunks until EOF; a short final chunk is
/// still written in full. `on_progress` receives the running byte count after
/// every block and must return quickly. The copy stops at the first I/O error
/// and never removes a partially written destination; that decision belongs to
/// the caller.
///
/// When either side is a block device it is accessed with direct I/O. A final
/// partial block written to such a device is zero-padded up to the sector
/// size; only the real bytes are counted.
pub fn copy<F>(
    source: &Path,
    dest: &Path,
    options: CopyOptions,
    cancel: &CancelToken,
    mut on_progress: F,
) -> CopyResult
where
    F: FnMut(u64),
{
    let start = Instant::now();
    let mut copied: u64 = 0;

    let result = copy_blocks(source, dest, options, cancel, &mut copied, &mut on_progress);
    let elapsed = start.elapsed();

    match result {
        Ok(()) => {
            info!(
                source = %source.display(),
                dest = %dest.display(),
                bytes = copied,
                elapsed_ms = elapsed.as_millis() as u64,
                "Copy complete"
            );
            CopyResult {
                bytes_copied: copied,
                elapsed,
                error: None,
            }
        }
        Err(error) => {
            debug!(bytes = copied, error = %error, "Copy stopped");
            CopyResult {
                bytes_copied: copied,
                elapsed,
                error: Some(error),
            }
        }
    }
}

fn copy_blocks(
    source: &Path,
    dest: &Path,
    options: CopyOptions,
    cancel: &CancelToken,
    copied: &mut u64,
    on_progress: &mut dyn FnMut(u64),
) -> Result<(), DupError> {
    let block_size = options.block_size;
    if block_size == 0 {
        return Err(DupError::InvalidInput(
            "block size must be greater than zero".to_string(),
        ));
    }

    let io_failure = |bytes_copied: u64| {
        move |source: io::Error| DupError::CopyIo {
            bytes_copied,
            source,
        }
    };

    let (mut reader, direct_read) = os_options::open_read(source).map_err(io_failure(0))?;
    let (mut writer, direct_write) =
        os_options::open_write(dest, options.truncate_dest).map_err(io_failure(0))?;

    // Direct reads must be whole sectors.
    let block_size = if direct_read {
        os_options::round_up_to_sector(block_size)
    } else {
        block_size
    };
    let mut buffer = AlignedBuffer::new(os_options::round_up_to_sector(block_size));

    debug!(
        block_size,
        direct_read, direct_write, "Starting block copy"
    );

    loop {
        if cancel.is_cancelled() {
            return Err(DupError::Cancelled);
        }

        let buf = buffer.as_mut_slice();
        let n = os_options::read_full(&mut reader, &mut buf[..block_size])
            .map_err(io_failure(*copied))?;
        if n == 0 {
            break;
        }

        let write_len = if direct_write && n % SECTOR_SIZE != 0 {
            let padded = os_options::round_up_to_sector(n);
            buf[n..padded].fill(0);
            padded
        } else {
            n
        };

        writer
            .write_all(&buf[..write_len])
            .map_err(io_failure(*copied))?;
        *copied += n as u64;
        on_progress(*copied);

        if n < block_size {
            break;
        }
    }

    writer.flush().map_err(io_failure(*copied))?;
    writer.sync_all().map_err(io_failure(*copied))?;
    Ok(())
}
