//! Source collaborator: the primary a replica copies segments from.

use crate::error::Result;
use crate::types::{Checkpoint, CheckpointInfo, FileChunk, FileMetadata, ReplicationId, ShardId};
use std::sync::Arc;

/// Files an attempt asks the source to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetFilesRequest {
  pub replication_id: ReplicationId,
  pub shard_id: ShardId,
  pub checkpoint: Checkpoint,
  pub files: Vec<FileMetadata>,
}

/// Pull-mode chunk supply, in the order the source generates offsets.
pub trait ChunkStream: Send {
  /// `None` once every requested file has been sent.
  fn next_chunk(&mut self) -> Result<Option<FileChunk>>;
}

/// How the requested files will reach the replica.
pub enum FileTransfer {
  /// The attempt drives the transfer by pulling chunks.
  Pull(Box<dyn ChunkStream>),
  /// The source delivers chunks through the node's `ChunkTransferHandler`.
  Push,
}

impl std::fmt::Debug for FileTransfer {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      FileTransfer::Pull(_) => f.write_str("Pull"),
      FileTransfer::Push => f.write_str("Push"),
    }
  }
}

pub trait ReplicationSource: Send + Sync {
  fn description(&self) -> String;

  /// Manifest of the source's current checkpoint, at or ahead of `checkpoint`.
  fn checkpoint_info(
    &self,
    replication_id: ReplicationId,
    checkpoint: &Checkpoint,
  ) -> Result<CheckpointInfo>;

  fn get_segment_files(&self, request: GetFilesRequest) -> Result<FileTransfer>;

  /// The replica gave up on `replication_id`; stop sending.
  fn cancel(&self, _replication_id: ReplicationId, _reason: &str) {}
}

/// Opens a session with the current primary of a shard.
pub trait SourceFactory: Send + Sync {
  fn open_session(
    &self,
    shard: &ShardId,
    checkpoint: &Checkpoint,
  ) -> Result<Arc<dyn ReplicationSource>>;
}
