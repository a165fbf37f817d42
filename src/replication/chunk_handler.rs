//! Inbound file-chunk handling shared by every attempt on the node.

use super::rate_limiter::ChunkThrottle;
use super::registry::ReplicationRegistry;
use crate::error::Result;
use crate::types::FileChunk;
use std::sync::Arc;

/// Routes chunks to their attempt and applies the node-wide throttle.
#[derive(Debug)]
pub struct ChunkTransferHandler {
  registry: Arc<ReplicationRegistry>,
  throttle: Arc<ChunkThrottle>,
}

impl ChunkTransferHandler {
  pub fn new(registry: Arc<ReplicationRegistry>, throttle: Arc<ChunkThrottle>) -> Self {
    Self { registry, throttle }
  }

  pub fn throttle(&self) -> &ChunkThrottle {
    &self.throttle
  }

  /// Apply one chunk. `Ok(())` is the acknowledgement; an error goes back to
  /// the sender. A chunk for an attempt that is gone or registered under a
  /// different shard is rejected before anything is throttled or written.
  pub fn handle_inbound_chunk(&self, chunk: FileChunk) -> Result<()> {
    let target = self
      .registry
      .acquire_safe(chunk.replication_id, &chunk.shard_id)
      .map_err(|error| {
        tracing::debug!(
          replication_id = %chunk.replication_id,
          shard = %chunk.shard_id,
          file = %chunk.file_name,
          "rejecting stale file chunk: {error}"
        );
        error
      })?;

    let paused = self.throttle.admit(chunk.data.len());
    target.add_throttle_time(paused);
    target.handle_file_chunk(&chunk)
  }
}
