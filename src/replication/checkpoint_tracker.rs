//! Latest-received checkpoint per replica shard.

use crate::types::{Checkpoint, ShardId};
use std::collections::HashMap;

/// Plain bookkeeping; the owning service serializes access.
#[derive(Debug, Default)]
pub struct CheckpointTracker {
  latest: HashMap<ShardId, Checkpoint>,
}

impl CheckpointTracker {
  pub fn new() -> Self {
    Self::default()
  }

  /// Store `checkpoint` if nothing is stored for `shard` yet or it is strictly
  /// ahead of the stored one. Returns whether the entry changed.
  pub fn record_received(&mut self, shard: &ShardId, checkpoint: &Checkpoint) -> bool {
    match self.latest.get_mut(shard) {
      Some(stored) => {
        if checkpoint.is_ahead_of(stored) {
          *stored = checkpoint.clone();
          true
        } else {
          false
        }
      }
      None => {
        self.latest.insert(shard.clone(), checkpoint.clone());
        true
      }
    }
  }

  pub fn latest(&self, shard: &ShardId) -> Option<&Checkpoint> {
    self.latest.get(shard)
  }

  pub fn remove(&mut self, shard: &ShardId) -> Option<Checkpoint> {
    self.latest.remove(shard)
  }

  pub fn len(&self) -> usize {
    self.latest.len()
  }

  pub fn is_empty(&self) -> bool {
    self.latest.is_empty()
  }
}
