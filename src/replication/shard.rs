//! Shard collaborator: the replica shard being kept in sync.

use crate::error::{Result, SegrepError};
use crate::types::{Checkpoint, CheckpointInfo, ShardId};

pub trait ReplicaShard: Send + Sync {
  fn shard_id(&self) -> ShardId;

  /// Whether `checkpoint` should be pursued now.
  fn should_process_checkpoint(&self, checkpoint: &Checkpoint) -> bool;

  /// Checkpoint of the segments currently installed.
  fn current_checkpoint(&self) -> Checkpoint;

  /// Called once the store has installed `info`.
  fn finalize_replication(&self, info: &CheckpointInfo) -> Result<()>;

  /// Take the shard out of rotation.
  fn fail_shard(&self, reason: &str, cause: &SegrepError);
}
