//! Replica-side orchestration: reacts to checkpoint notifications and shard
//! lifecycle events, starts at most one attempt per shard, chains attempts
//! until the replica has caught up, and classifies failures.

use super::checkpoint_tracker::CheckpointTracker;
use super::chunk_handler::ChunkTransferHandler;
use super::executor::WorkerPool;
use super::rate_limiter::ChunkThrottle;
use super::registry::{next_replication_id, ReplicationMonitor, ReplicationRegistry};
use super::shard::ReplicaShard;
use super::source::SourceFactory;
use super::state::ReplicationState;
use super::store::SegmentStore;
use super::target::{ReplicationListener, ReplicationOutcome, ReplicationTarget};
use crate::config::ReplicationSettings;
use crate::error::{Result, SegrepError};
use crate::types::{Checkpoint, FileChunk, ReplicationId, ReplicationRole, ShardId};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

const SHARD_CLOSED_REASON: &str = "shard closed";
const SHARD_PROMOTED_REASON: &str = "shard has been promoted to primary";
const NODE_SHUTDOWN_REASON: &str = "replication service shutting down";

/// Replica-side replication service; one per node.
pub struct ReplicationTargetService {
  inner: Arc<ServiceInner>,
}

struct ServiceInner {
  settings: ReplicationSettings,
  // Guards the whole "checkpoint received" decision.
  tracker: Mutex<CheckpointTracker>,
  registry: Arc<ReplicationRegistry>,
  chunk_handler: Arc<ChunkTransferHandler>,
  store: Arc<dyn SegmentStore>,
  source_factory: Arc<dyn SourceFactory>,
  pool: WorkerPool,
  monitor: Mutex<Option<ReplicationMonitor>>,
}

impl ReplicationTargetService {
  pub fn new(
    settings: ReplicationSettings,
    store: Arc<dyn SegmentStore>,
    source_factory: Arc<dyn SourceFactory>,
  ) -> Result<Self> {
    settings.validate()?;
    let registry = Arc::new(ReplicationRegistry::new());
    let throttle = Arc::new(ChunkThrottle::new(settings.max_bytes_per_sec));
    let chunk_handler = Arc::new(ChunkTransferHandler::new(Arc::clone(&registry), throttle));
    let pool = WorkerPool::new("segrep-generic", settings.worker_threads)?;
    let monitor =
      ReplicationMonitor::start(&registry, settings.activity_check_interval_duration())?;

    Ok(Self {
      inner: Arc::new(ServiceInner {
        settings,
        tracker: Mutex::new(CheckpointTracker::new()),
        registry,
        chunk_handler,
        store,
        source_factory,
        pool,
        monitor: Mutex::new(Some(monitor)),
      }),
    })
  }

  pub fn settings(&self) -> &ReplicationSettings {
    &self.inner.settings
  }

  pub fn registry(&self) -> &Arc<ReplicationRegistry> {
    &self.inner.registry
  }

  /// The transport entry point for pushed chunks.
  pub fn chunk_handler(&self) -> Arc<ChunkTransferHandler> {
    Arc::clone(&self.inner.chunk_handler)
  }

  /// A new checkpoint was observed for `shard`. Returns the id of the attempt
  /// started for it, or `None` if the checkpoint was only recorded.
  pub fn on_new_checkpoint(
    &self,
    checkpoint: Checkpoint,
    shard: Arc<dyn ReplicaShard>,
  ) -> Result<Option<ReplicationId>> {
    self.inner.on_new_checkpoint(checkpoint, shard)
  }

  /// Start an attempt unconditionally; the shard must not be replicating.
  pub fn start_replication(
    &self,
    checkpoint: Checkpoint,
    shard: Arc<dyn ReplicaShard>,
    listener: ReplicationListener,
  ) -> Result<ReplicationId> {
    self.inner.start_replication(checkpoint, shard, listener)
  }

  pub fn on_shard_closing(&self, shard: &ShardId) {
    self
      .inner
      .registry
      .cancel_for_shard(shard, SHARD_CLOSED_REASON);
    self.inner.tracker.lock().remove(shard);
  }

  pub fn on_shard_promoted(&self, shard: &ShardId) {
    self
      .inner
      .registry
      .cancel_for_shard(shard, SHARD_PROMOTED_REASON);
  }

  /// Routing update for a shard copy; only replica-to-primary cancels.
  pub fn shard_routing_changed(
    &self,
    shard: &ShardId,
    old_role: Option<ReplicationRole>,
    new_role: ReplicationRole,
  ) {
    if old_role == Some(ReplicationRole::Replica) && new_role == ReplicationRole::Primary {
      self.on_shard_promoted(shard);
    }
  }

  pub fn handle_inbound_chunk(&self, chunk: FileChunk) -> Result<()> {
    self.inner.chunk_handler.handle_inbound_chunk(chunk)
  }

  pub fn get_active_attempt(&self, shard: &ShardId) -> Option<ReplicationState> {
    self
      .inner
      .registry
      .get_attempt_for_shard(shard)
      .map(|target| target.state())
  }

  pub fn latest_received_checkpoint(&self, shard: &ShardId) -> Option<Checkpoint> {
    self.inner.tracker.lock().latest(shard).cloned()
  }

  /// Cancel all attempts, stop the monitor and drain the worker pool.
  pub fn shutdown(&self) {
    self.inner.shutdown();
  }
}

impl Drop for ReplicationTargetService {
  fn drop(&mut self) {
    self.inner.shutdown();
  }
}

impl ServiceInner {
  fn on_new_checkpoint(
    self: &Arc<Self>,
    checkpoint: Checkpoint,
    shard: Arc<dyn ReplicaShard>,
  ) -> Result<Option<ReplicationId>> {
    let shard_id = shard.shard_id();
    if checkpoint.shard_id != shard_id {
      return Err(SegrepError::InvalidReplication(format!(
        "checkpoint for {} delivered to shard {shard_id}",
        checkpoint.shard_id
      )));
    }

    let mut tracker = self.tracker.lock();
    tracing::trace!(shard = %shard_id, checkpoint = %checkpoint, "received replication checkpoint");
    tracker.record_received(&shard_id, &checkpoint);

    if self.registry.is_shard_active(&shard_id) {
      tracing::trace!(
        shard = %shard_id,
        "ignoring checkpoint, shard is already replicating"
      );
      return Ok(None);
    }
    if !shard.should_process_checkpoint(&checkpoint) {
      tracing::trace!(shard = %shard_id, checkpoint = %checkpoint, "shard declined checkpoint");
      return Ok(None);
    }

    let listener = self.listener_for(Arc::clone(&shard));
    let id = self.start_replication(checkpoint, shard, listener)?;
    drop(tracker);
    Ok(Some(id))
  }

  fn start_replication(
    &self,
    checkpoint: Checkpoint,
    shard: Arc<dyn ReplicaShard>,
    listener: ReplicationListener,
  ) -> Result<ReplicationId> {
    let target = Arc::new(ReplicationTarget::new(
      next_replication_id(),
      checkpoint,
      shard,
      Arc::clone(&self.store),
      Arc::clone(&self.source_factory),
      listener,
    ));
    let shard_id = target.shard_id().clone();
    let checkpoint = target.checkpoint().clone();
    let id = self
      .registry
      .start(target, self.settings.activity_timeout_duration())?;

    let registry = Arc::clone(&self.registry);
    let handler = Arc::clone(&self.chunk_handler);
    let poll_interval = self.settings.transfer_poll_interval_duration();
    if let Err(error) = self
      .pool
      .execute(move || run_replication(&registry, &handler, id, poll_interval))
    {
      self.registry.fail(id, error.clone(), false);
      return Err(error);
    }

    tracing::debug!(
      replication_id = %id,
      shard = %shard_id,
      checkpoint = %checkpoint,
      "started replication"
    );
    Ok(id)
  }

  fn listener_for(self: &Arc<Self>, shard: Arc<dyn ReplicaShard>) -> ReplicationListener {
    let service: Weak<ServiceInner> = Arc::downgrade(self);
    Box::new(move |outcome: ReplicationOutcome| match outcome {
      ReplicationOutcome::Done(state) => {
        tracing::info!(
          replication_id = %state.replication_id,
          shard = %state.shard_id,
          elapsed_ms = state.elapsed.as_millis() as u64,
          files = state.progress.files_recovered,
          bytes = state.progress.bytes_recovered,
          throttle_ms = state.throttle_time.as_millis() as u64,
          "replication complete"
        );
        if let Some(service) = service.upgrade() {
          service.on_replication_done(shard);
        }
      }
      ReplicationOutcome::Failed {
        state,
        cause,
        send_shard_failure,
      } => {
        if send_shard_failure {
          tracing::error!(
            replication_id = %state.replication_id,
            shard = %state.shard_id,
            "replication failure: {cause}"
          );
          shard.fail_shard("replication failure", &cause);
        } else {
          tracing::debug!(
            replication_id = %state.replication_id,
            shard = %state.shard_id,
            "replication ended without shard failure: {cause}"
          );
        }
      }
    })
  }

  /// Pursue a checkpoint that arrived while the finished attempt ran. The
  /// continuation always runs as a new pool task so chained attempts never
  /// nest on one call stack.
  fn on_replication_done(self: &Arc<Self>, shard: Arc<dyn ReplicaShard>) {
    let shard_id = shard.shard_id();
    let Some(latest) = self.tracker.lock().latest(&shard_id).cloned() else {
      return;
    };
    if !latest.is_ahead_of(&shard.current_checkpoint()) {
      return;
    }

    let service = Arc::clone(self);
    let scheduled = self.pool.execute(move || {
      if let Err(error) = service.on_new_checkpoint(latest, shard) {
        tracing::warn!("failed to chain replication: {error}");
      }
    });
    if let Err(error) = scheduled {
      tracing::debug!(shard = %shard_id, "not chaining replication: {error}");
    }
  }

  fn shutdown(&self) {
    if let Some(mut monitor) = self.monitor.lock().take() {
      monitor.stop();
    }
    let cancelled = self.registry.cancel_all(NODE_SHUTDOWN_REASON);
    if cancelled > 0 {
      tracing::debug!(cancelled, "cancelled in-flight replications");
    }
    self.pool.shutdown();
  }
}

/// Worker-side body of one attempt: run it under a scoped reference and turn
/// the result into exactly one registry finalization.
fn run_replication(
  registry: &ReplicationRegistry,
  handler: &ChunkTransferHandler,
  id: ReplicationId,
  poll_interval: std::time::Duration,
) {
  // removed before the pool got to it
  let Some(target) = registry.acquire(id) else {
    return;
  };

  match target.run(handler, poll_interval) {
    Ok(()) => {
      registry.mark_done(id);
    }
    Err(error) if error.is_cancellation() => {
      // Local cancellations unregister the attempt first; if it is still
      // registered the source cancelled it.
      if registry.is_registered(id) {
        registry.fail(id, error, false);
      }
    }
    Err(error) => {
      registry.fail(id, SegrepError::failed("segment replication failed", error), true);
    }
  }
}
