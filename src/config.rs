//! Tunables for a migration session.
//!
//! Defaults are sized for a WebRTC-style data channel: 64 KiB chunks with
//! a 64 chunk window keep at most 4 MiB unacknowledged, well under the
//! 16 MiB frame budget of the channel.

use crate::error::{MigrationError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Chunk size for file data (64KB)
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Maximum sent-but-unacknowledged chunk requests
pub const DEFAULT_WINDOW_SIZE: usize = 64;

/// Hard ceiling imposed by the channel on in-flight bytes (16MB)
pub const DEFAULT_FRAME_BUDGET: usize = 16 * 1024 * 1024;

/// Files larger than this are not migrated unless negotiated otherwise (256MB)
pub const DEFAULT_MAX_FILE_SIZE: i64 = 256 * 1024 * 1024;

/// Records per ListFiles message
pub const MAX_LIST_BATCH: usize = 64;

/// Segment size used with peers that need control-byte framing (16KB)
pub const DEFAULT_LEGACY_FRAME_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    pub chunk_size: usize,
    pub window_size: usize,
    pub frame_budget: usize,
    pub max_file_size: i64,
    pub list_batch_size: usize,
    pub legacy_frame_size: usize,
    pub liveness_interval_ms: u64,
    pub connect_timeout_ms: u64,
    pub reconnect_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    pub progress_interval_ms: u64,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            window_size: DEFAULT_WINDOW_SIZE,
            frame_budget: DEFAULT_FRAME_BUDGET,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            list_batch_size: MAX_LIST_BATCH,
            legacy_frame_size: DEFAULT_LEGACY_FRAME_SIZE,
            liveness_interval_ms: 10_000,
            connect_timeout_ms: 30_000,
            reconnect_delay_ms: 2_000,
            max_reconnect_attempts: 10,
            progress_interval_ms: 500,
        }
    }
}

impl MigrationConfig {
    /// Load a TOML config file. Missing keys fall back to defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| MigrationError::path(path, e))?;
        let config: Self = toml::from_str(&text)
            .map_err(|e| MigrationError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 || self.window_size == 0 {
            return Err(MigrationError::Config(
                "chunk_size and window_size must be non-zero".to_string(),
            ));
        }
        let in_flight = self.chunk_size.saturating_mul(self.window_size);
        if in_flight > self.frame_budget {
            return Err(MigrationError::Config(format!(
                "chunk_size * window_size ({}) exceeds frame_budget ({})",
                in_flight, self.frame_budget
            )));
        }
        if self.list_batch_size == 0 || self.list_batch_size > MAX_LIST_BATCH {
            return Err(MigrationError::Config(format!(
                "list_batch_size must be between 1 and {}",
                MAX_LIST_BATCH
            )));
        }
        if self.legacy_frame_size < 16 {
            return Err(MigrationError::Config(
                "legacy_frame_size is too small".to_string(),
            ));
        }
        if self.max_file_size < 0 {
            return Err(MigrationError::Config(
                "max_file_size must not be negative".to_string(),
            ));
        }
        Ok(())
    }

    /// Upper bound on bytes represented by unacknowledged chunks.
    pub fn window_bytes(&self) -> u64 {
        (self.chunk_size as u64) * (self.window_size as u64)
    }

    pub fn liveness_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }
}
