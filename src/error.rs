//! Error types for segment replication

use thiserror::Error;

use crate::types::{ReplicationId, ShardId};

/// Errors raised by the replica-side replication engine
#[derive(Debug, Error)]
pub enum SegrepError {
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),

  #[error("Serialization error: {0}")]
  Serialization(String),

  #[error("Invalid config: {0}")]
  InvalidConfig(String),

  #[error("Invalid replication: {0}")]
  InvalidReplication(String),

  /// A second attempt was started for a shard that already has one
  #[error("shard {0} already has an active replication")]
  AlreadyReplicating(ShardId),

  #[error("replication {0} not found")]
  ReplicationNotFound(ReplicationId),

  #[error("replication {id} belongs to shard {actual}, expected {expected}")]
  ShardMismatch {
    id: ReplicationId,
    expected: ShardId,
    actual: ShardId,
  },

  #[error("replication cancelled: {0}")]
  Cancelled(String),

  #[error("replication timed out: {0}")]
  Timeout(String),

  #[error("replication source unavailable: {0}")]
  SourceUnavailable(String),

  #[error("file {file} does not match manifest: {reason}")]
  ManifestMismatch { file: String, reason: String },

  #[error("chunk for {file} out of order: expected offset {expected}, got {actual}")]
  ChunkOutOfOrder {
    file: String,
    expected: u64,
    actual: u64,
  },

  #[error("Lock failed: {0}")]
  LockFailed(String),

  #[error("{message}: {source}")]
  ReplicationFailed {
    message: String,
    #[source]
    source: Box<SegrepError>,
  },
}

impl SegrepError {
  pub fn failed(message: impl Into<String>, source: SegrepError) -> Self {
    SegrepError::ReplicationFailed {
      message: message.into(),
      source: Box::new(source),
    }
  }

  /// Strip `ReplicationFailed` wrappers down to the originating error.
  pub fn root_cause(&self) -> &SegrepError {
    let mut current = self;
    while let SegrepError::ReplicationFailed { source, .. } = current {
      current = source;
    }
    current
  }

  /// Cancellation-class errors finalize an attempt without failing the shard.
  pub fn is_cancellation(&self) -> bool {
    matches!(self.root_cause(), SegrepError::Cancelled(_))
  }

  /// Errors that mean an inbound message references an attempt this node no
  /// longer tracks under that shard.
  pub fn is_stale_reference(&self) -> bool {
    matches!(
      self.root_cause(),
      SegrepError::ReplicationNotFound(_) | SegrepError::ShardMismatch { .. }
    )
  }
}

// io::Error is not Clone; its copy keeps the kind and message.
impl Clone for SegrepError {
  fn clone(&self) -> Self {
    match self {
      SegrepError::Io(error) => SegrepError::Io(std::io::Error::new(error.kind(), error.to_string())),
      SegrepError::Serialization(message) => SegrepError::Serialization(message.clone()),
      SegrepError::InvalidConfig(message) => SegrepError::InvalidConfig(message.clone()),
      SegrepError::InvalidReplication(message) => SegrepError::InvalidReplication(message.clone()),
      SegrepError::AlreadyReplicating(shard) => SegrepError::AlreadyReplicating(shard.clone()),
      SegrepError::ReplicationNotFound(id) => SegrepError::ReplicationNotFound(*id),
      SegrepError::ShardMismatch {
        id,
        expected,
        actual,
      } => SegrepError::ShardMismatch {
        id: *id,
        expected: expected.clone(),
        actual: actual.clone(),
      },
      SegrepError::Cancelled(reason) => SegrepError::Cancelled(reason.clone()),
      SegrepError::Timeout(reason) => SegrepError::Timeout(reason.clone()),
      SegrepError::SourceUnavailable(reason) => SegrepError::SourceUnavailable(reason.clone()),
      SegrepError::ManifestMismatch { file, reason } => SegrepError::ManifestMismatch {
        file: file.clone(),
        reason: reason.clone(),
      },
      SegrepError::ChunkOutOfOrder {
        file,
        expected,
        actual,
      } => SegrepError::ChunkOutOfOrder {
        file: file.clone(),
        expected: *expected,
        actual: *actual,
      },
      SegrepError::LockFailed(message) => SegrepError::LockFailed(message.clone()),
      SegrepError::ReplicationFailed { message, source } => SegrepError::ReplicationFailed {
        message: message.clone(),
        source: source.clone(),
      },
    }
  }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, SegrepError>;
