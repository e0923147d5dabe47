//! Tunables for a duplication run.
//!
//! Values are layered: built-in defaults, then an optional TOML file, then
//! `BLKDUP_*` environment variables. Front-ends apply their own flags on top.
use crate::copy::DEFAULT_BLOCK_SIZE;
use crate::error::{DupError, Result};
use crate::os_options::SECTOR_SIZE;
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config file picked up from the working directory when none is given.
pub const DEFAULT_CONFIG_FILE: &str = "blkdup.toml";

/// Prefix of the environment variables that override file settings.
pub const ENV_PREFIX: &str = "BLKDUP_";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DupConfig {
    /// Bytes per copy block. Must be a non-zero multiple of 512.
    pub block_size: usize,
    /// Verify the copy by comparing digests of both sides.
    pub verify: bool,
    /// How many times a failed destination digest is retried.
    pub verify_retries: u32,
    /// Pause before and after re-gating a device that is not yet readable.
    pub settle_delay_ms: u64,
    /// Remount the device once the run is over.
    pub remount: bool,
    /// Where per-device lock files live.
    pub lock_dir: PathBuf,
}

impl Default for DupConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            verify: true,
            verify_retries: 1,
            settle_delay_ms: 2000,
            remount: true,
            lock_dir: std::env::temp_dir(),
        }
    }
}

impl DupConfig {
    /// Loads the layered configuration. `file` defaults to
    /// [`DEFAULT_CONFIG_FILE`]; a missing file is not an error.
    pub fn load(file: Option<&Path>) -> anyhow::Result<Self> {
        let file = file.unwrap_or(Path::new(DEFAULT_CONFIG_FILE));
        let config: DupConfig = Figment::from(Serialized::defaults(DupConfig::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed(ENV_PREFIX))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 || self.block_size % SECTOR_SIZE != 0 {
            return Err(DupError::InvalidInput(format!(
                "block size {} is not a non-zero multiple of {SECTOR_SIZE}",
                self.block_size
            )));
        }
        Ok(())
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}
