//! Storage collaborator: where replicated segment files land.

use crate::error::Result;
use crate::types::{CheckpointInfo, FileMetadata, ReplicationId, ShardId};

/// Sequential writer for one file of one attempt. Dropping a writer without
/// calling `finish` abandons the partial file.
pub trait SegmentWriter: Send {
  fn write(&mut self, bytes: &[u8]) -> Result<()>;

  /// Flush and close, reporting what was actually written.
  fn finish(self: Box<Self>) -> Result<FileMetadata>;
}

pub trait SegmentStore: Send + Sync {
  /// Files of the last installed checkpoint that are present and intact.
  fn local_files(&self, shard: &ShardId) -> Result<Vec<FileMetadata>>;

  /// Open an attempt-scoped writer for `file`; nothing is visible under the
  /// file's real name until `finalize_manifest` succeeds.
  fn open_writer(
    &self,
    shard: &ShardId,
    replication_id: ReplicationId,
    file: &FileMetadata,
  ) -> Result<Box<dyn SegmentWriter>>;

  /// Atomically install `info` using `written` plus already-present local
  /// files. Fails with `ManifestMismatch` if any file disagrees with `info`.
  fn finalize_manifest(
    &self,
    shard: &ShardId,
    replication_id: ReplicationId,
    info: &CheckpointInfo,
    written: &[FileMetadata],
  ) -> Result<()>;

  /// Remove whatever the attempt left behind.
  fn discard_temp_files(&self, shard: &ShardId, replication_id: ReplicationId) -> Result<()>;
}
