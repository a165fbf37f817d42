//! Registry of in-flight replication attempts.
//!
//! The registry is the sole owner of every registered `ReplicationTarget`.
//! Other code resolves an id through `acquire`/`acquire_safe` and holds the
//! returned `ReplicationRef` for exactly as long as it touches the target.
//! Finalizing (`mark_done`, `fail`, `cancel_for_shard`) unregisters the target
//! immediately so no new reference can be taken; its resources are released
//! once the last outstanding reference drops.

use super::state::ReplicationState;
use super::target::ReplicationTarget;
use crate::error::{Result, SegrepError};
use crate::types::{ReplicationId, ShardId};
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

static NEXT_REPLICATION_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-wide unique, monotonically increasing attempt id.
pub fn next_replication_id() -> ReplicationId {
  ReplicationId::new(NEXT_REPLICATION_ID.fetch_add(1, Ordering::Relaxed))
}

/// Scoped reference to a registered target; released on drop.
#[derive(Debug)]
pub struct ReplicationRef {
  target: Arc<ReplicationTarget>,
}

impl Deref for ReplicationRef {
  type Target = ReplicationTarget;

  fn deref(&self) -> &ReplicationTarget {
    &self.target
  }
}

impl Drop for ReplicationRef {
  fn drop(&mut self) {
    self.target.dec_ref();
  }
}

#[derive(Debug)]
struct Registered {
  target: Arc<ReplicationTarget>,
  activity_timeout: Duration,
}

#[derive(Debug, Default)]
struct RegistryInner {
  by_id: HashMap<ReplicationId, Registered>,
  by_shard: HashMap<ShardId, ReplicationId>,
}

impl RegistryInner {
  fn remove(&mut self, id: ReplicationId) -> Option<Arc<ReplicationTarget>> {
    let registered = self.by_id.remove(&id)?;
    if self.by_shard.get(registered.target.shard_id()) == Some(&id) {
      self.by_shard.remove(registered.target.shard_id());
    }
    Some(registered.target)
  }
}

#[derive(Debug, Default)]
pub struct ReplicationRegistry {
  inner: Mutex<RegistryInner>,
}

impl ReplicationRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register `target` as the active attempt of its shard.
  ///
  /// Fails with `AlreadyReplicating` if the shard already has one: callers
  /// must check `is_shard_active` under the same lock as this call.
  pub fn start(
    &self,
    target: Arc<ReplicationTarget>,
    activity_timeout: Duration,
  ) -> Result<ReplicationId> {
    let id = target.id();
    let shard = target.shard_id().clone();
    let mut inner = self.inner.lock();
    if inner.by_shard.contains_key(&shard) {
      return Err(SegrepError::AlreadyReplicating(shard));
    }
    if inner.by_id.contains_key(&id) {
      return Err(SegrepError::InvalidReplication(format!(
        "replication id {id} is already registered"
      )));
    }
    inner.by_shard.insert(shard.clone(), id);
    inner.by_id.insert(
      id,
      Registered {
        target,
        activity_timeout,
      },
    );
    drop(inner);

    tracing::debug!(replication_id = %id, shard = %shard, "registered replication");
    Ok(id)
  }

  /// Take a scoped reference, or `None` if the attempt no longer exists.
  pub fn acquire(&self, id: ReplicationId) -> Option<ReplicationRef> {
    let inner = self.inner.lock();
    let registered = inner.by_id.get(&id)?;
    if !registered.target.try_inc_ref() {
      return None;
    }
    Some(ReplicationRef {
      target: Arc::clone(&registered.target),
    })
  }

  /// Like `acquire`, but an absent id or one registered under another shard
  /// is an error for the caller to report back to the message sender.
  pub fn acquire_safe(&self, id: ReplicationId, shard: &ShardId) -> Result<ReplicationRef> {
    let inner = self.inner.lock();
    let registered = inner
      .by_id
      .get(&id)
      .ok_or(SegrepError::ReplicationNotFound(id))?;
    if registered.target.shard_id() != shard {
      return Err(SegrepError::ShardMismatch {
        id,
        expected: shard.clone(),
        actual: registered.target.shard_id().clone(),
      });
    }
    if !registered.target.try_inc_ref() {
      return Err(SegrepError::ReplicationNotFound(id));
    }
    Ok(ReplicationRef {
      target: Arc::clone(&registered.target),
    })
  }

  pub fn is_registered(&self, id: ReplicationId) -> bool {
    self.inner.lock().by_id.contains_key(&id)
  }

  pub fn is_shard_active(&self, shard: &ShardId) -> bool {
    self.inner.lock().by_shard.contains_key(shard)
  }

  pub fn get_attempt_for_shard(&self, shard: &ShardId) -> Option<ReplicationRef> {
    let id = *self.inner.lock().by_shard.get(shard)?;
    self.acquire(id)
  }

  pub fn len(&self) -> usize {
    self.inner.lock().by_id.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn states(&self) -> Vec<ReplicationState> {
    let targets: Vec<Arc<ReplicationTarget>> = self
      .inner
      .lock()
      .by_id
      .values()
      .map(|registered| Arc::clone(&registered.target))
      .collect();
    targets.iter().map(|target| target.state()).collect()
  }

  /// Finalize as done and notify the listener. Returns false if the attempt
  /// was already finalized.
  pub fn mark_done(&self, id: ReplicationId) -> bool {
    let Some(target) = self.inner.lock().remove(id) else {
      return false;
    };
    let transitioned = target.mark_as_done();
    target.dec_ref();
    transitioned
  }

  /// Finalize as failed; `send_shard_failure` tells the listener whether the
  /// shard itself must be failed.
  pub fn fail(&self, id: ReplicationId, cause: SegrepError, send_shard_failure: bool) -> bool {
    let Some(target) = self.inner.lock().remove(id) else {
      return false;
    };
    tracing::debug!(
      replication_id = %id,
      shard = %target.shard_id(),
      send_shard_failure,
      "failing replication: {cause}"
    );
    let transitioned = target.fail(cause, send_shard_failure);
    target.dec_ref();
    transitioned
  }

  /// Cancel one attempt by id.
  pub fn cancel(&self, id: ReplicationId, reason: &str) -> bool {
    let Some(target) = self.inner.lock().remove(id) else {
      return false;
    };
    let transitioned = target.cancel(reason);
    target.dec_ref();
    transitioned
  }

  /// Cancel the shard's active attempt, if any. A no-op otherwise.
  pub fn cancel_for_shard(&self, shard: &ShardId, reason: &str) -> bool {
    let target = {
      let mut inner = self.inner.lock();
      let Some(id) = inner.by_shard.get(shard).copied() else {
        return false;
      };
      inner.remove(id)
    };
    let Some(target) = target else {
      return false;
    };
    tracing::debug!(
      replication_id = %target.id(),
      shard = %shard,
      "cancelling replication: {reason}"
    );
    let transitioned = target.cancel(reason);
    target.dec_ref();
    transitioned
  }

  /// Cancel everything, e.g. on node shutdown.
  pub fn cancel_all(&self, reason: &str) -> usize {
    let targets: Vec<Arc<ReplicationTarget>> = {
      let mut inner = self.inner.lock();
      inner.by_shard.clear();
      inner
        .by_id
        .drain()
        .map(|(_, registered)| registered.target)
        .collect()
    };
    let count = targets.len();
    for target in targets {
      target.cancel(reason);
      target.dec_ref();
    }
    count
  }

  /// Fail every running attempt idle longer than its activity timeout.
  /// Attempts still queued for a worker are skipped. Returns the number of
  /// attempts failed.
  pub fn fail_idle(&self) -> usize {
    let expired: Vec<(ReplicationId, Duration, Duration)> = self
      .inner
      .lock()
      .by_id
      .iter()
      .filter_map(|(id, registered)| {
        let idle = registered.target.running_idle_for()?;
        (idle > registered.activity_timeout).then_some((*id, idle, registered.activity_timeout))
      })
      .collect();

    let mut failed = 0usize;
    for (id, idle, timeout) in expired {
      tracing::warn!(
        replication_id = %id,
        idle_ms = idle.as_millis() as u64,
        "no activity for replication within {}ms",
        timeout.as_millis()
      );
      let cause = SegrepError::Timeout(format!(
        "no activity after [{}ms] for replication {id}",
        timeout.as_millis()
      ));
      if self.fail(id, cause, true) {
        failed += 1;
      }
    }
    failed
  }
}

/// Background sweeper failing idle attempts. Stops when dropped or when the
/// registry goes away.
#[derive(Debug)]
pub struct ReplicationMonitor {
  shutdown: Option<Sender<()>>,
  handle: Option<JoinHandle<()>>,
}

impl ReplicationMonitor {
  pub fn start(registry: &Arc<ReplicationRegistry>, interval: Duration) -> Result<Self> {
    let registry: Weak<ReplicationRegistry> = Arc::downgrade(registry);
    let (shutdown, signal) = bounded::<()>(0);
    let handle = std::thread::Builder::new()
      .name("segrep-monitor".to_string())
      .spawn(move || loop {
        match signal.recv_timeout(interval) {
          Err(RecvTimeoutError::Timeout) => {}
          Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
        let Some(registry) = registry.upgrade() else {
          break;
        };
        registry.fail_idle();
      })?;

    Ok(Self {
      shutdown: Some(shutdown),
      handle: Some(handle),
    })
  }

  pub fn stop(&mut self) {
    drop(self.shutdown.take());
    if let Some(handle) = self.handle.take() {
      if handle.thread().id() == std::thread::current().id() {
        return;
      }
      if handle.join().is_err() {
        tracing::warn!("replication monitor exited abnormally");
      }
    }
  }
}

impl Drop for ReplicationMonitor {
  fn drop(&mut self) {
    self.stop();
  }
}
