//! Coordinator configuration.

use std::path::PathBuf;

use dirdelta_protocol::{PacketPriority, SendParams};
use dirdelta_transfer::{DEFAULT_STAGING_SUFFIX, TransferError};
use serde::{Deserialize, Serialize};

/// Settings of one [`TransferCoordinator`](crate::TransferCoordinator).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Application root. Upload directories and prepended output
    /// directories are resolved below it.
    #[serde(default = "default_app_root")]
    pub app_root: PathBuf,

    /// Priority of file headers, chunks and completion messages.
    #[serde(default)]
    pub upload_priority: PacketPriority,

    /// Ordering channel used for uploads.
    #[serde(default)]
    pub upload_channel: u8,

    /// Bytes per chunk when reading incrementally (0 = whole file).
    #[serde(default)]
    pub chunk_size: u32,

    /// Reuse hashes of files whose size and modification time are unchanged.
    #[serde(default)]
    pub hash_cache: bool,

    /// Suffix of files being received.
    #[serde(default = "default_staging_suffix")]
    pub staging_suffix: String,
}

fn default_app_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_staging_suffix() -> String {
    DEFAULT_STAGING_SUFFIX.into()
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            app_root: default_app_root(),
            upload_priority: PacketPriority::default(),
            upload_channel: 0,
            chunk_size: 0,
            hash_cache: false,
            staging_suffix: default_staging_suffix(),
        }
    }
}

impl CoordinatorConfig {
    /// Creates a configuration rooted at `app_root` with default settings.
    pub fn new(app_root: impl Into<PathBuf>) -> Self {
        Self {
            app_root: app_root.into(),
            ..Self::default()
        }
    }

    /// Send parameters for uploads.
    pub fn upload_params(&self) -> Result<SendParams, TransferError> {
        Ok(SendParams::new(self.upload_priority, self.upload_channel)?)
    }

    /// Chunk size for incremental reads, `None` for whole-file sends.
    pub fn chunk_size(&self) -> Option<u32> {
        (self.chunk_size > 0).then_some(self.chunk_size)
    }

    /// Checks values serde cannot.
    pub fn validate(&self) -> Result<(), TransferError> {
        self.upload_params()?;
        if self.staging_suffix.is_empty() || self.staging_suffix.contains(['/', '\\']) {
            return Err(TransferError::InvalidRequest(format!(
                "invalid staging suffix {:?}",
                self.staging_suffix
            )));
        }
        Ok(())
    }
}
