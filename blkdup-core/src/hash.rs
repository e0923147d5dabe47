//! Content digests over files and raw devices.
//!
//! Every source is streamed through SHA-256 in fixed-size chunks so that even
//! a whole-disk digest runs in constant memory. Raw devices get a small probe
//! read first: a device that is not ready yet fails in milliseconds instead of
//! partway through a multi-gigabyte hash.
use crate::cancel::CancelToken;
use crate::error::{DupError, Result};
use crate::os_options::{self, AlignedBuffer};
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Length of a digest value in bytes.
pub const DIGEST_LEN: usize = 32;

const CHUNK_SIZE: usize = 1024 * 1024; // 1 MiB
const PROBE_SIZE: usize = 512;

/// A SHA-256 value together with the identity of the source it came from.
///
/// Two digests are equal iff their values are equal; the source is metadata.
#[derive(Clone, Debug, Eq)]
pub struct Digest {
    value: [u8; DIGEST_LEN],
    source: String,
}

impl Digest {
    pub fn new(value: [u8; DIGEST_LEN], source: impl Into<String>) -> Self {
        Self {
            value,
            source: source.into(),
        }
    }

    /// Digest of an in-memory buffer.
    pub fn of_bytes(bytes: &[u8], source: impl Into<String>) -> Self {
        Self::new(Sha256::digest(bytes).into(), source)
    }

    /// Parses a recorded digest from its hex form.
    pub fn from_hex(hex_str: &str, source: impl Into<String>) -> Result<Self> {
        let mut value = [0u8; DIGEST_LEN];
        hex::decode_to_slice(hex_str.trim(), &mut value).map_err(|e| {
            DupError::InvalidInput(format!("'{hex_str}' is not a SHA-256 digest: {e}"))
        })?;
        Ok(Self::new(value, source))
    }

    pub fn value(&self) -> &[u8; DIGEST_LEN] {
        &self.value
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.value)
    }
}

impl PartialEq for Digest {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// What kind of byte source a path refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceKind {
    /// A regular file, typically an image.
    File,
    /// A raw block device, or a file standing in for one.
    RawDevice,
}

/// Describes one digest computation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DigestSpec {
    pub path: PathBuf,
    pub kind: SourceKind,
    /// Hash only the first `limit` bytes. `None` hashes to EOF.
    pub limit: Option<u64>,
}

impl DigestSpec {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            kind: SourceKind::File,
            limit: None,
        }
    }

    pub fn device(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            kind: SourceKind::RawDevice,
            limit: None,
        }
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    fn unreadable(&self, source: io::Error) -> DupError {
        match self.kind {
            SourceKind::File => DupError::FileNotReadable {
                path: self.path.clone(),
                source,
            },
            SourceKind::RawDevice => DupError::DeviceNotAccessible {
                path: self.path.clone(),
                source,
            },
        }
    }
}

/// Anything that can produce a digest for a [`DigestSpec`].
///
/// The production implementation is [`Sha256Hasher`]; verification is written
/// against this trait so its retry policy can be exercised with doubles.
pub trait DigestSource: Send + Sync {
    /// Computes the digest, reporting bytes hashed so far to `on_progress`.
    fn compute_digest(
        &self,
        spec: &DigestSpec,
        cancel: &CancelToken,
        on_progress: &mut dyn FnMut(u64),
    ) -> Result<Digest>;
}

/// Streams sources through SHA-256.
#[derive(Clone, Copy, Debug, Default)]
pub struct Sha256Hasher;

impl Sha256Hasher {
    /// One sector read from the start of the source, then rewind.
    fn probe<R: Read + Seek>(file: &mut R) -> io::Result<()> {
        let mut probe = AlignedBuffer::new(PROBE_SIZE);
        os_options::read_full(file, probe.as_mut_slice())?;
        file.seek(SeekFrom::Start(0))?;
        Ok(())
    }
}

impl DigestSource for Sha256Hasher {
    fn compute_digest(
        &self,
        spec: &DigestSpec,
        cancel: &CancelToken,
        on_progress: &mut dyn FnMut(u64),
    ) -> Result<Digest> {
        let (mut file, direct) =
            os_options::open_read(&spec.path).map_err(|e| spec.unreadable(e))?;

        if spec.kind == SourceKind::RawDevice {
            Self::probe(&mut file).map_err(|e| spec.unreadable(e))?;
            debug!(path = %spec.path.display(), "Probe read succeeded");
        }

        let mut hasher = Sha256::new();
        let mut buffer = AlignedBuffer::new(CHUNK_SIZE);
        let mut hashed: u64 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(DupError::Cancelled);
            }

            let wanted = match spec.limit {
                Some(limit) => (limit - hashed).min(CHUNK_SIZE as u64) as usize,
                None => CHUNK_SIZE,
            };
            if wanted == 0 {
                break;
            }
            // Direct reads must cover whole sectors; the surplus is discarded.
            let to_read = if direct {
                os_options::round_up_to_sector(wanted)
            } else {
                wanted
            };

            let n = os_options::read_full(&mut file, &mut buffer.as_mut_slice()[..to_read])
                .map_err(|e| spec.unreadable(e))?;
            let take = n.min(wanted);
            hasher.update(&buffer.as_slice()[..take]);
            hashed += take as u64;
            on_progress(hashed);

            if n < to_read {
                break;
            }
        }

        Ok(Digest::new(hasher.finalize().into(), display_source(&spec.path)))
    }
}

fn display_source(path: &Path) -> String {
    path.display().to_string()
}

/// Hashes `spec` with [`Sha256Hasher`], without progress reporting.
pub fn compute_digest(spec: &DigestSpec, cancel: &CancelToken) -> Result<Digest> {
    Sha256Hasher.compute_digest(spec, cancel, &mut |_| {})
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn temp_with(bytes: &[u8]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(bytes).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn matches_in_memory_digest() {
        let data: Vec<u8> = (0..3 * CHUNK_SIZE + 17).map(|i| (i % 251) as u8).collect();
        let file = temp_with(&data);
        let digest = compute_digest(&DigestSpec::file(file.path()), &CancelToken::new()).unwrap();
        assert_eq!(digest, Digest::of_bytes(&data, "memory"));
        assert_eq!(digest.source(), file.path().display().to_string());
    }

    #[test]
    fn empty_source_has_the_empty_digest() {
        let file = temp_with(&[]);
        let digest = compute_digest(&DigestSpec::file(file.path()), &CancelToken::new()).unwrap();
        assert_eq!(
            digest.to_hex(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn limit_hashes_a_prefix() {
        let mut data = vec![0xAB; 4096];
        data.extend_from_slice(&[0xCD; 1000]);
        let file = temp_with(&data);
        let spec = DigestSpec::device(file.path()).with_limit(4096);
        let digest = compute_digest(&spec, &CancelToken::new()).unwrap();
        assert_eq!(digest, Digest::of_bytes(&data[..4096], "prefix"));
    }

    #[test]
    fn progress_reaches_total() {
        let data = vec![1u8; CHUNK_SIZE + 10];
        let file = temp_with(&data);
        let mut seen = Vec::new();
        Sha256Hasher
            .compute_digest(
                &DigestSpec::file(file.path()),
                &CancelToken::new(),
                &mut |n| seen.push(n),
            )
            .unwrap();
        assert_eq!(seen.last().copied(), Some(data.len() as u64));
    }

    #[test]
    fn missing_file_is_not_readable() {
        let dir = tempfile::tempdir().unwrap();
        let err = compute_digest(
            &DigestSpec::file(dir.path().join("missing.img")),
            &CancelToken::new(),
        )
        .unwrap_err();
        assert!(matches!(err, DupError::FileNotReadable { .. }));
    }

    #[test]
    fn missing_device_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let err = compute_digest(
            &DigestSpec::device(dir.path().join("sdz")),
            &CancelToken::new(),
        )
        .unwrap_err();
        assert!(matches!(err, DupError::DeviceNotAccessible { .. }));
    }

    #[test]
    fn cancellation_is_distinguished() {
        let file = temp_with(&[9u8; 2048]);
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = compute_digest(&DigestSpec::file(file.path()), &cancel).unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn hex_round_trip_and_equality_ignores_source() {
        let a = Digest::of_bytes(b"abc", "one");
        let b = Digest::from_hex(&a.to_hex(), "two").unwrap();
        assert_eq!(a, b);
        assert!(Digest::from_hex("zz", "bad").is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn equal_length_sources_hash_equal_iff_identical(
            a in proptest::collection::vec(any::<u8>(), 1..4096),
            flip in any::<proptest::sample::Index>(),
            mask in 1u8..=255,
            same in any::<bool>(),
        ) {
            let mut b = a.clone();
            if !same {
                let i = flip.index(b.len());
                b[i] ^= mask;
            }
            let fa = temp_with(&a);
            let fb = temp_with(&b);
            let cancel = CancelToken::new();
            let da = compute_digest(&DigestSpec::file(fa.path()), &cancel).unwrap();
            let db = compute_digest(&DigestSpec::device(fb.path()), &cancel).unwrap();
            prop_assert_eq!(da == db, a == b);
        }
    }
}
