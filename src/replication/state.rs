//! Attempt status, stage timing and progress reporting.

use crate::types::{Checkpoint, ReplicationId, ShardId};
use std::time::{Duration, Instant};

/// Lifecycle of one attempt. `Done`, `Failed` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttemptStatus {
  Created,
  Running,
  Done,
  Failed,
  Cancelled,
}

impl AttemptStatus {
  pub fn is_terminal(self) -> bool {
    matches!(
      self,
      AttemptStatus::Done | AttemptStatus::Failed | AttemptStatus::Cancelled
    )
  }
}

/// Step of the replica-side protocol an attempt is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplicationStage {
  Init,
  GetCheckpointInfo,
  FileDiff,
  GetFiles,
  Finalize,
  Finished,
}

impl ReplicationStage {
  fn next(self) -> Option<ReplicationStage> {
    match self {
      ReplicationStage::Init => Some(ReplicationStage::GetCheckpointInfo),
      ReplicationStage::GetCheckpointInfo => Some(ReplicationStage::FileDiff),
      ReplicationStage::FileDiff => Some(ReplicationStage::GetFiles),
      ReplicationStage::GetFiles => Some(ReplicationStage::Finalize),
      ReplicationStage::Finalize => Some(ReplicationStage::Finished),
      ReplicationStage::Finished => None,
    }
  }
}

/// Per-stage wall clock timings.
#[derive(Debug, Clone)]
pub(crate) struct StageTimer {
  started: Instant,
  stage: ReplicationStage,
  stage_started: Instant,
  timings: Vec<(ReplicationStage, Duration)>,
}

impl StageTimer {
  pub(crate) fn new() -> Self {
    let now = Instant::now();
    Self {
      started: now,
      stage: ReplicationStage::Init,
      stage_started: now,
      timings: Vec::new(),
    }
  }

  pub(crate) fn stage(&self) -> ReplicationStage {
    self.stage
  }

  /// Move to `next`, which must be the stage following the current one.
  pub(crate) fn advance(&mut self, next: ReplicationStage) -> bool {
    if self.stage.next() != Some(next) {
      return false;
    }
    let now = Instant::now();
    self
      .timings
      .push((self.stage, now.saturating_duration_since(self.stage_started)));
    self.stage = next;
    self.stage_started = now;
    true
  }

  pub(crate) fn elapsed(&self) -> Duration {
    self.started.elapsed()
  }

  pub(crate) fn timings(&self) -> Vec<(ReplicationStage, Duration)> {
    self.timings.clone()
  }
}

/// Byte and file counters for one attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferProgress {
  pub files_total: usize,
  pub files_reused: usize,
  pub files_recovered: usize,
  pub bytes_total: u64,
  pub bytes_recovered: u64,
}

/// Point-in-time view of one attempt, handed to listeners and diagnostics.
#[derive(Debug, Clone)]
pub struct ReplicationState {
  pub replication_id: ReplicationId,
  pub shard_id: ShardId,
  pub checkpoint: Checkpoint,
  pub status: AttemptStatus,
  pub stage: ReplicationStage,
  pub source: String,
  pub progress: TransferProgress,
  pub throttle_time: Duration,
  pub elapsed: Duration,
  pub idle_for: Duration,
  pub stage_timings: Vec<(ReplicationStage, Duration)>,
}
