//! Replication settings

use crate::constants::{
  DEFAULT_ACTIVITY_CHECK_INTERVAL_MS, DEFAULT_ACTIVITY_TIMEOUT_MS, DEFAULT_CHUNK_SIZE_BYTES,
  DEFAULT_MAX_BYTES_PER_SEC, DEFAULT_TRANSFER_POLL_INTERVAL_MS, DEFAULT_WORKER_THREADS,
};
use crate::error::{Result, SegrepError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Node-level replication settings.
///
/// Durations are stored in milliseconds so a settings file stays plain JSON:
///
/// ```json
/// { "activity_timeout_ms": 30000, "max_bytes_per_sec": 0 }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationSettings {
  pub activity_timeout_ms: u64,
  pub activity_check_interval_ms: u64,
  /// 0 disables throttling
  pub max_bytes_per_sec: u64,
  pub chunk_size_bytes: usize,
  pub worker_threads: usize,
  pub transfer_poll_interval_ms: u64,
}

impl Default for ReplicationSettings {
  fn default() -> Self {
    Self {
      activity_timeout_ms: DEFAULT_ACTIVITY_TIMEOUT_MS,
      activity_check_interval_ms: DEFAULT_ACTIVITY_CHECK_INTERVAL_MS,
      max_bytes_per_sec: DEFAULT_MAX_BYTES_PER_SEC,
      chunk_size_bytes: DEFAULT_CHUNK_SIZE_BYTES,
      worker_threads: DEFAULT_WORKER_THREADS,
      transfer_poll_interval_ms: DEFAULT_TRANSFER_POLL_INTERVAL_MS,
    }
  }
}

impl ReplicationSettings {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn activity_timeout(mut self, timeout: Duration) -> Self {
    self.activity_timeout_ms = duration_ms(timeout);
    self
  }

  pub fn activity_check_interval(mut self, interval: Duration) -> Self {
    self.activity_check_interval_ms = duration_ms(interval);
    self
  }

  pub fn max_bytes_per_sec(mut self, bytes: u64) -> Self {
    self.max_bytes_per_sec = bytes;
    self
  }

  pub fn chunk_size_bytes(mut self, bytes: usize) -> Self {
    self.chunk_size_bytes = bytes;
    self
  }

  pub fn worker_threads(mut self, threads: usize) -> Self {
    self.worker_threads = threads;
    self
  }

  pub fn transfer_poll_interval(mut self, interval: Duration) -> Self {
    self.transfer_poll_interval_ms = duration_ms(interval);
    self
  }

  pub fn activity_timeout_duration(&self) -> Duration {
    Duration::from_millis(self.activity_timeout_ms)
  }

  pub fn activity_check_interval_duration(&self) -> Duration {
    Duration::from_millis(self.activity_check_interval_ms)
  }

  pub fn transfer_poll_interval_duration(&self) -> Duration {
    Duration::from_millis(self.transfer_poll_interval_ms)
  }

  /// Load settings from a JSON file; missing keys keep their defaults.
  pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
    let path = path.as_ref();
    let bytes = std::fs::read(path)?;
    let settings: ReplicationSettings = serde_json::from_slice(&bytes).map_err(|error| {
      SegrepError::Serialization(format!(
        "decode replication settings {} failed: {error}",
        path.display()
      ))
    })?;
    settings.validate()?;
    Ok(settings)
  }

  pub fn validate(&self) -> Result<()> {
    if self.activity_timeout_ms == 0 {
      return Err(SegrepError::InvalidConfig(
        "activity_timeout_ms must be positive".to_string(),
      ));
    }
    if self.activity_check_interval_ms == 0 {
      return Err(SegrepError::InvalidConfig(
        "activity_check_interval_ms must be positive".to_string(),
      ));
    }
    if self.chunk_size_bytes == 0 {
      return Err(SegrepError::InvalidConfig(
        "chunk_size_bytes must be positive".to_string(),
      ));
    }
    if self.worker_threads == 0 {
      return Err(SegrepError::InvalidConfig(
        "worker_threads must be positive".to_string(),
      ));
    }
    if self.transfer_poll_interval_ms == 0 {
      return Err(SegrepError::InvalidConfig(
        "transfer_poll_interval_ms must be positive".to_string(),
      ));
    }
    Ok(())
  }
}

fn duration_ms(duration: Duration) -> u64 {
  u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
