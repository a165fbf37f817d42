//! One replication attempt: fetch the files a checkpoint names from the
//! source, install them, report the outcome.
//!
//! A `ReplicationTarget` is owned by the `ReplicationRegistry`; everyone else
//! reaches it through a `ReplicationRef`. Resources (open writers, the source
//! session, temporary files) are released exactly once, when the last
//! reference is dropped after the registry has finalized the attempt.

use super::chunk_handler::ChunkTransferHandler;
use super::shard::ReplicaShard;
use super::source::{ChunkStream, FileTransfer, GetFilesRequest, ReplicationSource, SourceFactory};
use super::state::{
  AttemptStatus, ReplicationStage, ReplicationState, StageTimer, TransferProgress,
};
use super::store::{SegmentStore, SegmentWriter};
use crate::error::{Result, SegrepError};
use crate::types::{Checkpoint, CheckpointInfo, FileChunk, FileMetadata, ReplicationId, ShardId};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Single callback receiving the terminal outcome of an attempt.
pub type ReplicationListener = Box<dyn FnOnce(ReplicationOutcome) + Send + 'static>;

#[derive(Debug, Clone)]
pub enum ReplicationOutcome {
  Done(ReplicationState),
  Failed {
    state: ReplicationState,
    cause: SegrepError,
    send_shard_failure: bool,
  },
}

impl ReplicationOutcome {
  pub fn state(&self) -> &ReplicationState {
    match self {
      ReplicationOutcome::Done(state) => state,
      ReplicationOutcome::Failed { state, .. } => state,
    }
  }
}

/// Cooperative cancellation flag observed at chunk and file-open boundaries.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
  inner: Arc<CancellationInner>,
}

#[derive(Debug, Default)]
struct CancellationInner {
  cancelled: AtomicBool,
  reason: Mutex<Option<String>>,
}

impl CancellationToken {
  pub fn new() -> Self {
    Self::default()
  }

  /// Returns false if the token was already cancelled; the first reason wins.
  pub fn cancel(&self, reason: impl Into<String>) -> bool {
    let mut slot = self.inner.reason.lock();
    if self.inner.cancelled.load(Ordering::Acquire) {
      return false;
    }
    *slot = Some(reason.into());
    self.inner.cancelled.store(true, Ordering::Release);
    true
  }

  pub fn is_cancelled(&self) -> bool {
    self.inner.cancelled.load(Ordering::Acquire)
  }

  pub fn reason(&self) -> Option<String> {
    self.inner.reason.lock().clone()
  }

  pub fn check(&self) -> Result<()> {
    if !self.is_cancelled() {
      return Ok(());
    }
    Err(SegrepError::Cancelled(
      self.reason().unwrap_or_else(|| "cancelled".to_string()),
    ))
  }
}

enum TransferEvent {
  Complete,
  Failed(SegrepError),
}

struct OpenFile {
  meta: FileMetadata,
  writer: Box<dyn SegmentWriter>,
  next_offset: u64,
}

#[derive(Default)]
struct TransferState {
  requested: Vec<FileMetadata>,
  open: HashMap<String, OpenFile>,
  written: Vec<FileMetadata>,
  progress: TransferProgress,
  complete: bool,
}

pub struct ReplicationTarget {
  id: ReplicationId,
  shard_id: ShardId,
  checkpoint: Checkpoint,
  shard: Arc<dyn ReplicaShard>,
  store: Arc<dyn SegmentStore>,
  source_factory: Arc<dyn SourceFactory>,
  source: Mutex<Option<Arc<dyn ReplicationSource>>>,
  listener: Mutex<Option<ReplicationListener>>,
  cancellation: CancellationToken,
  status: Mutex<AttemptStatus>,
  refs: AtomicUsize,
  released: AtomicBool,
  created: Instant,
  last_access_nanos: AtomicU64,
  throttle_nanos: AtomicU64,
  timer: Mutex<StageTimer>,
  transfer: Mutex<TransferState>,
  events_tx: Sender<TransferEvent>,
  events_rx: Receiver<TransferEvent>,
}

impl ReplicationTarget {
  pub fn new(
    id: ReplicationId,
    checkpoint: Checkpoint,
    shard: Arc<dyn ReplicaShard>,
    store: Arc<dyn SegmentStore>,
    source_factory: Arc<dyn SourceFactory>,
    listener: ReplicationListener,
  ) -> Self {
    let (events_tx, events_rx) = unbounded();
    Self {
      id,
      shard_id: shard.shard_id(),
      checkpoint,
      shard,
      store,
      source_factory,
      source: Mutex::new(None),
      listener: Mutex::new(Some(listener)),
      cancellation: CancellationToken::new(),
      status: Mutex::new(AttemptStatus::Created),
      // the registry's reference
      refs: AtomicUsize::new(1),
      released: AtomicBool::new(false),
      created: Instant::now(),
      last_access_nanos: AtomicU64::new(0),
      throttle_nanos: AtomicU64::new(0),
      timer: Mutex::new(StageTimer::new()),
      transfer: Mutex::new(TransferState::default()),
      events_tx,
      events_rx,
    }
  }

  pub fn id(&self) -> ReplicationId {
    self.id
  }

  pub fn shard_id(&self) -> &ShardId {
    &self.shard_id
  }

  pub fn checkpoint(&self) -> &Checkpoint {
    &self.checkpoint
  }

  pub fn status(&self) -> AttemptStatus {
    *self.status.lock()
  }

  pub fn cancellation(&self) -> &CancellationToken {
    &self.cancellation
  }

  pub fn ref_count(&self) -> usize {
    self.refs.load(Ordering::Acquire)
  }

  /// Whether the attempt's resources have been released.
  pub fn is_released(&self) -> bool {
    self.released.load(Ordering::Acquire)
  }

  /// Time since the last chunk or source request.
  pub fn idle_for(&self) -> Duration {
    let last = Duration::from_nanos(self.last_access_nanos.load(Ordering::Acquire));
    self.created.elapsed().saturating_sub(last)
  }

  /// Idle time of an attempt a worker has picked up; `None` while it is still
  /// queued.
  pub fn running_idle_for(&self) -> Option<Duration> {
    // status first: the transition to Running restarts the clock under the
    // status lock
    if self.status() == AttemptStatus::Created {
      return None;
    }
    Some(self.idle_for())
  }

  pub fn add_throttle_time(&self, paused: Duration) {
    if paused.is_zero() {
      return;
    }
    let nanos = u64::try_from(paused.as_nanos()).unwrap_or(u64::MAX);
    self.throttle_nanos.fetch_add(nanos, Ordering::Relaxed);
  }

  pub fn state(&self) -> ReplicationState {
    let status = self.status();
    let (stage, elapsed, stage_timings) = {
      let timer = self.timer.lock();
      (timer.stage(), timer.elapsed(), timer.timings())
    };
    let progress = self.transfer.lock().progress.clone();
    let source = self
      .source
      .lock()
      .as_ref()
      .map(|source| source.description())
      .unwrap_or_default();

    ReplicationState {
      replication_id: self.id,
      shard_id: self.shard_id.clone(),
      checkpoint: self.checkpoint.clone(),
      status,
      stage,
      source,
      progress,
      throttle_time: Duration::from_nanos(self.throttle_nanos.load(Ordering::Relaxed)),
      elapsed,
      idle_for: self.idle_for(),
      stage_timings,
    }
  }

  /// Drive the attempt to completion on the calling worker thread.
  ///
  /// Pull-mode chunks are routed through `handler` so they share the node's
  /// throttle with pushed chunks. Every error is returned to the caller, which
  /// classifies it and finalizes the attempt through the registry.
  pub fn run(&self, handler: &ChunkTransferHandler, poll_interval: Duration) -> Result<()> {
    self.mark_running();
    self.cancellation.check()?;

    let source = self
      .source_factory
      .open_session(&self.shard_id, &self.checkpoint)?;
    *self.source.lock() = Some(Arc::clone(&source));
    self.touch();

    self.advance(ReplicationStage::GetCheckpointInfo);
    let info = source.checkpoint_info(self.id, &self.checkpoint)?;
    self.touch();
    if info.checkpoint.shard_id != self.shard_id {
      return Err(SegrepError::InvalidReplication(format!(
        "source answered for shard {}, expected {}",
        info.checkpoint.shard_id, self.shard_id
      )));
    }
    if self.checkpoint.is_ahead_of(&info.checkpoint) {
      return Err(SegrepError::InvalidReplication(format!(
        "source checkpoint [{}] is behind requested [{}]",
        info.checkpoint, self.checkpoint
      )));
    }

    self.advance(ReplicationStage::FileDiff);
    self.cancellation.check()?;
    let local = self.store.local_files(&self.shard_id)?;
    let (missing, reused) = files_to_fetch(&info, &local);
    {
      let mut transfer = self.transfer.lock();
      transfer.progress = TransferProgress {
        files_total: info.files.len(),
        files_reused: reused,
        files_recovered: 0,
        bytes_total: missing.iter().map(|file| file.length).sum(),
        bytes_recovered: 0,
      };
      transfer.requested = missing.clone();
      transfer.complete = missing.is_empty();
    }
    tracing::debug!(
      replication_id = %self.id,
      shard = %self.shard_id,
      missing = missing.len(),
      reused,
      "computed replication file diff"
    );

    self.advance(ReplicationStage::GetFiles);
    if !missing.is_empty() {
      self.cancellation.check()?;
      let request = GetFilesRequest {
        replication_id: self.id,
        shard_id: self.shard_id.clone(),
        checkpoint: info.checkpoint.clone(),
        files: missing,
      };
      let transfer = source.get_segment_files(request)?;
      self.touch();
      match transfer {
        FileTransfer::Pull(mut stream) => self.pull_files(stream.as_mut(), handler)?,
        FileTransfer::Push => self.await_pushed_files(poll_interval)?,
      }
    }

    self.advance(ReplicationStage::Finalize);
    self.cancellation.check()?;
    let written = self.transfer.lock().written.clone();
    self
      .store
      .finalize_manifest(&self.shard_id, self.id, &info, &written)?;
    self.shard.finalize_replication(&info)?;
    self.advance(ReplicationStage::Finished);
    Ok(())
  }

  fn pull_files(&self, stream: &mut dyn ChunkStream, handler: &ChunkTransferHandler) -> Result<()> {
    loop {
      self.cancellation.check()?;
      let Some(chunk) = stream.next_chunk()? else {
        break;
      };
      self.touch();
      handler.handle_inbound_chunk(chunk)?;
    }

    if !self.transfer.lock().complete {
      return Err(SegrepError::InvalidReplication(format!(
        "source stream for replication {} ended before every file arrived",
        self.id
      )));
    }
    Ok(())
  }

  fn await_pushed_files(&self, poll_interval: Duration) -> Result<()> {
    loop {
      self.cancellation.check()?;
      match self.events_rx.recv_timeout(poll_interval) {
        Ok(TransferEvent::Complete) => return Ok(()),
        Ok(TransferEvent::Failed(error)) => return Err(error),
        Err(RecvTimeoutError::Timeout) => {}
        Err(RecvTimeoutError::Disconnected) => {
          return Err(SegrepError::InvalidReplication(
            "transfer event channel closed".to_string(),
          ))
        }
      }
    }
  }

  /// Write one inbound chunk. Chunks of a file must arrive in offset order;
  /// the final chunk of a file closes its writer and checks it against the
  /// manifest. A rejected chunk also fails a waiting push-mode transfer.
  pub fn handle_file_chunk(&self, chunk: &FileChunk) -> Result<()> {
    let result = self.apply_chunk(chunk);
    if let Err(error) = &result {
      if !error.is_cancellation() {
        self.send_event(TransferEvent::Failed(error.clone()));
      }
    }
    result
  }

  fn apply_chunk(&self, chunk: &FileChunk) -> Result<()> {
    self.cancellation.check()?;
    self.mark_running();
    self.touch();

    let mut transfer = self.transfer.lock();
    if transfer.complete {
      return Err(SegrepError::InvalidReplication(format!(
        "replication {} already received every file",
        self.id
      )));
    }
    let meta = transfer
      .requested
      .iter()
      .find(|file| file.name == chunk.file_name)
      .cloned()
      .ok_or_else(|| {
        SegrepError::InvalidReplication(format!(
          "file {} was not requested by replication {}",
          chunk.file_name, self.id
        ))
      })?;
    if transfer.written.iter().any(|file| file.name == meta.name) {
      return Err(SegrepError::InvalidReplication(format!(
        "file {} already completed",
        meta.name
      )));
    }

    let open = match transfer.open.entry(meta.name.clone()) {
      Entry::Occupied(entry) => entry.into_mut(),
      Entry::Vacant(entry) => {
        if chunk.offset != 0 {
          return Err(SegrepError::ChunkOutOfOrder {
            file: meta.name.clone(),
            expected: 0,
            actual: chunk.offset,
          });
        }
        self.cancellation.check()?;
        let writer = self.store.open_writer(&self.shard_id, self.id, &meta)?;
        entry.insert(OpenFile {
          meta: meta.clone(),
          writer,
          next_offset: 0,
        })
      }
    };

    if chunk.offset != open.next_offset {
      return Err(SegrepError::ChunkOutOfOrder {
        file: meta.name.clone(),
        expected: open.next_offset,
        actual: chunk.offset,
      });
    }
    let end = open.next_offset.saturating_add(chunk.data.len() as u64);
    if end > open.meta.length {
      return Err(SegrepError::ManifestMismatch {
        file: meta.name.clone(),
        reason: format!("received {end} bytes, manifest length {}", open.meta.length),
      });
    }
    open.writer.write(&chunk.data)?;
    open.next_offset = end;
    transfer.progress.bytes_recovered = transfer
      .progress
      .bytes_recovered
      .saturating_add(chunk.data.len() as u64);

    if !chunk.last_chunk {
      return Ok(());
    }

    let Some(open) = transfer.open.remove(&meta.name) else {
      return Err(SegrepError::InvalidReplication(format!(
        "writer for {} vanished",
        meta.name
      )));
    };
    let actual = open.writer.finish()?;
    if !actual.is_same(&meta) {
      return Err(SegrepError::ManifestMismatch {
        file: meta.name.clone(),
        reason: format!(
          "wrote length {} checksum {:08x}, manifest length {} checksum {:08x}",
          actual.length, actual.checksum, meta.length, meta.checksum
        ),
      });
    }
    transfer.written.push(actual);
    transfer.progress.files_recovered += 1;

    if transfer.written.len() == transfer.requested.len() {
      transfer.complete = true;
      drop(transfer);
      self.send_event(TransferEvent::Complete);
    }
    Ok(())
  }

  // ==========================================================================
  // Finalization (registry only)
  // ==========================================================================

  pub(crate) fn mark_as_done(&self) -> bool {
    if !self.transition(AttemptStatus::Done) {
      return false;
    }
    self.notify(ReplicationOutcome::Done(self.state()));
    true
  }

  pub(crate) fn fail(&self, cause: SegrepError, send_shard_failure: bool) -> bool {
    if !self.transition(AttemptStatus::Failed) {
      return false;
    }
    let reason = format!("replication failed [{cause}]");
    self.cancellation.cancel(reason.clone());
    self.cancel_source(&reason);
    self.notify(ReplicationOutcome::Failed {
      state: self.state(),
      cause,
      send_shard_failure,
    });
    true
  }

  pub(crate) fn cancel(&self, reason: &str) -> bool {
    if !self.transition(AttemptStatus::Cancelled) {
      return false;
    }
    self.cancellation.cancel(reason);
    self.cancel_source(reason);
    self.notify(ReplicationOutcome::Failed {
      state: self.state(),
      cause: SegrepError::Cancelled(reason.to_string()),
      send_shard_failure: false,
    });
    true
  }

  pub(crate) fn try_inc_ref(&self) -> bool {
    let mut current = self.refs.load(Ordering::Acquire);
    loop {
      if current == 0 {
        return false;
      }
      match self
        .refs
        .compare_exchange_weak(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
      {
        Ok(_) => return true,
        Err(actual) => current = actual,
      }
    }
  }

  pub(crate) fn dec_ref(&self) {
    let previous = self.refs.fetch_sub(1, Ordering::AcqRel);
    if previous == 0 {
      self.refs.store(0, Ordering::Release);
      tracing::error!(replication_id = %self.id, "replication reference released twice");
      return;
    }
    if previous == 1 {
      self.release_resources();
    }
  }

  fn release_resources(&self) {
    if self.released.swap(true, Ordering::AcqRel) {
      return;
    }
    let open = std::mem::take(&mut self.transfer.lock().open);
    drop(open);
    drop(self.source.lock().take());
    if let Err(error) = self.store.discard_temp_files(&self.shard_id, self.id) {
      tracing::warn!(
        replication_id = %self.id,
        shard = %self.shard_id,
        "failed to discard replication temp files: {error}"
      );
    }
    tracing::trace!(replication_id = %self.id, shard = %self.shard_id, "replication released");
  }

  fn transition(&self, next: AttemptStatus) -> bool {
    let mut status = self.status.lock();
    if status.is_terminal() {
      return false;
    }
    *status = next;
    true
  }

  // Queue time does not count as inactivity.
  fn mark_running(&self) {
    let mut status = self.status.lock();
    if *status == AttemptStatus::Created {
      *status = AttemptStatus::Running;
      self.touch();
    }
  }

  // Unbounded, and the receiver lives in `self`, so the send cannot fail.
  fn send_event(&self, event: TransferEvent) {
    let sent = self.events_tx.send(event);
    debug_assert!(sent.is_ok());
  }

  fn touch(&self) {
    let nanos = u64::try_from(self.created.elapsed().as_nanos()).unwrap_or(u64::MAX);
    self.last_access_nanos.store(nanos, Ordering::Release);
  }

  fn advance(&self, stage: ReplicationStage) {
    self.timer.lock().advance(stage);
    self.touch();
  }

  fn cancel_source(&self, reason: &str) {
    let source = self.source.lock().clone();
    if let Some(source) = source {
      source.cancel(self.id, reason);
    }
  }

  fn notify(&self, outcome: ReplicationOutcome) {
    let listener = self.listener.lock().take();
    if let Some(listener) = listener {
      listener(outcome);
    }
  }
}

impl fmt::Debug for ReplicationTarget {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ReplicationTarget")
      .field("id", &self.id)
      .field("shard_id", &self.shard_id)
      .field("checkpoint", &self.checkpoint)
      .field("status", &self.status())
      .field("refs", &self.ref_count())
      .finish()
  }
}

/// Split the manifest into files to fetch and the count of files already
/// present locally with identical length and checksum.
fn files_to_fetch(info: &CheckpointInfo, local: &[FileMetadata]) -> (Vec<FileMetadata>, usize) {
  let local: HashMap<&str, &FileMetadata> =
    local.iter().map(|file| (file.name.as_str(), file)).collect();
  let mut missing = Vec::new();
  let mut reused = 0usize;
  for file in &info.files {
    match local.get(file.name.as_str()) {
      Some(existing) if existing.is_same(file) => reused += 1,
      _ => missing.push(file.clone()),
    }
  }
  (missing, reused)
}
