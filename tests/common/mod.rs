#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

use segrep::error::{Result, SegrepError};
use segrep::replication::{
  ChunkStream, ChunkTransferHandler, FileTransfer, GetFilesRequest, ReplicaShard,
  ReplicationSource, SegmentStore, SegmentWriter, SourceFactory,
};
use segrep::types::{
  Checkpoint, CheckpointInfo, FileChunk, FileMetadata, ReplicationId, ShardId,
};
use segrep::ReplicationSettings;

pub const WAIT: Duration = Duration::from_secs(10);

pub fn init_tracing() {
  let _ = tracing_subscriber::fmt()
    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
    .with_test_writer()
    .try_init();
}

pub fn fast_settings() -> ReplicationSettings {
  ReplicationSettings::new()
    .activity_timeout(Duration::from_secs(30))
    .activity_check_interval(Duration::from_millis(20))
    .transfer_poll_interval(Duration::from_millis(10))
    .max_bytes_per_sec(0)
    .worker_threads(4)
}

pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
  let deadline = Instant::now() + timeout;
  while Instant::now() < deadline {
    if condition() {
      return true;
    }
    std::thread::sleep(Duration::from_millis(5));
  }
  condition()
}

// ============================================================================
// Shard
// ============================================================================

pub struct TestShard {
  id: ShardId,
  current: Mutex<Checkpoint>,
  finalized: Mutex<Vec<Checkpoint>>,
  failures: Mutex<Vec<String>>,
}

impl TestShard {
  pub fn new(id: ShardId) -> Arc<Self> {
    Arc::new(Self {
      current: Mutex::new(Checkpoint::empty(id.clone())),
      id,
      finalized: Mutex::new(Vec::new()),
      failures: Mutex::new(Vec::new()),
    })
  }

  pub fn current(&self) -> Checkpoint {
    self.current.lock().clone()
  }

  pub fn finalized(&self) -> Vec<Checkpoint> {
    self.finalized.lock().clone()
  }

  pub fn failures(&self) -> Vec<String> {
    self.failures.lock().clone()
  }
}

impl ReplicaShard for TestShard {
  fn shard_id(&self) -> ShardId {
    self.id.clone()
  }

  fn should_process_checkpoint(&self, checkpoint: &Checkpoint) -> bool {
    checkpoint.is_ahead_of(&self.current.lock())
  }

  fn current_checkpoint(&self) -> Checkpoint {
    self.current()
  }

  fn finalize_replication(&self, info: &CheckpointInfo) -> Result<()> {
    *self.current.lock() = info.checkpoint.clone();
    self.finalized.lock().push(info.checkpoint.clone());
    Ok(())
  }

  fn fail_shard(&self, reason: &str, cause: &SegrepError) {
    self.failures.lock().push(format!("{reason}: {cause}"));
  }
}

// ============================================================================
// In-memory segment store
// ============================================================================

#[derive(Default)]
struct MemoryState {
  installed: Mutex<HashMap<ShardId, HashMap<String, Vec<u8>>>>,
  manifests: Mutex<HashMap<ShardId, CheckpointInfo>>,
  temp: Mutex<HashMap<(ReplicationId, String), Vec<u8>>>,
  writes: AtomicUsize,
  discarded: Mutex<Vec<ReplicationId>>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
  state: Arc<MemoryState>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn installed_file(&self, shard: &ShardId, name: &str) -> Option<Vec<u8>> {
    self
      .state
      .installed
      .lock()
      .get(shard)
      .and_then(|files| files.get(name).cloned())
  }

  pub fn manifest(&self, shard: &ShardId) -> Option<CheckpointInfo> {
    self.state.manifests.lock().get(shard).cloned()
  }

  pub fn writes(&self) -> usize {
    self.state.writes.load(Ordering::SeqCst)
  }

  pub fn discarded(&self) -> Vec<ReplicationId> {
    self.state.discarded.lock().clone()
  }
}

struct MemoryWriter {
  key: (ReplicationId, String),
  buffer: Vec<u8>,
  state: Arc<MemoryState>,
}

impl SegmentWriter for MemoryWriter {
  fn write(&mut self, bytes: &[u8]) -> Result<()> {
    self.state.writes.fetch_add(1, Ordering::SeqCst);
    self.buffer.extend_from_slice(bytes);
    Ok(())
  }

  fn finish(self: Box<Self>) -> Result<FileMetadata> {
    let MemoryWriter { key, buffer, state } = *self;
    let meta = FileMetadata::of_bytes(key.1.clone(), &buffer);
    state.temp.lock().insert(key, buffer);
    Ok(meta)
  }
}

impl SegmentStore for MemoryStore {
  fn local_files(&self, shard: &ShardId) -> Result<Vec<FileMetadata>> {
    Ok(
      self
        .manifest(shard)
        .map(|info| info.files)
        .unwrap_or_default(),
    )
  }

  fn open_writer(
    &self,
    _shard: &ShardId,
    replication_id: ReplicationId,
    file: &FileMetadata,
  ) -> Result<Box<dyn SegmentWriter>> {
    Ok(Box::new(MemoryWriter {
      key: (replication_id, file.name.clone()),
      buffer: Vec::new(),
      state: Arc::clone(&self.state),
    }))
  }

  fn finalize_manifest(
    &self,
    shard: &ShardId,
    replication_id: ReplicationId,
    info: &CheckpointInfo,
    written: &[FileMetadata],
  ) -> Result<()> {
    let mut temp = self.state.temp.lock();
    let mut installed = self.state.installed.lock();
    let previous = installed.get(shard).cloned().unwrap_or_default();
    let mut next = HashMap::new();
    for file in &info.files {
      let fresh = written.iter().any(|meta| meta.name == file.name);
      let bytes = if fresh {
        temp.remove(&(replication_id, file.name.clone()))
      } else {
        previous.get(&file.name).cloned()
      };
      let Some(bytes) = bytes else {
        return Err(SegrepError::ManifestMismatch {
          file: file.name.clone(),
          reason: "missing".to_string(),
        });
      };
      next.insert(file.name.clone(), bytes);
    }
    installed.insert(shard.clone(), next);
    self
      .state
      .manifests
      .lock()
      .insert(shard.clone(), info.clone());
    Ok(())
  }

  fn discard_temp_files(&self, _shard: &ShardId, replication_id: ReplicationId) -> Result<()> {
    self
      .state
      .temp
      .lock()
      .retain(|key, _| key.0 != replication_id);
    self.state.discarded.lock().push(replication_id);
    Ok(())
  }
}

// ============================================================================
// Scripted primary
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
  Pull,
  Push,
  FailFiles,
  CancelFiles,
}

/// A primary whose published checkpoints and transfer behavior a test
/// controls. `hold_next` parks the next sessions inside `checkpoint_info`
/// until `release` is called.
pub struct ScriptedPrimary {
  published: Mutex<HashMap<Checkpoint, (CheckpointInfo, HashMap<String, Vec<u8>>)>>,
  mode: Mutex<TransferMode>,
  chunk_size: usize,
  holds: AtomicUsize,
  entered_tx: Sender<ReplicationId>,
  entered_rx: Receiver<ReplicationId>,
  release_tx: Sender<()>,
  release_rx: Receiver<()>,
  cancelled: Mutex<Vec<ReplicationId>>,
  push_handler: OnceLock<Arc<ChunkTransferHandler>>,
}

impl ScriptedPrimary {
  pub fn new(chunk_size: usize) -> Arc<Self> {
    let (entered_tx, entered_rx) = unbounded();
    let (release_tx, release_rx) = unbounded();
    Arc::new(Self {
      published: Mutex::new(HashMap::new()),
      mode: Mutex::new(TransferMode::Pull),
      chunk_size,
      holds: AtomicUsize::new(0),
      entered_tx,
      entered_rx,
      release_tx,
      release_rx,
      cancelled: Mutex::new(Vec::new()),
      push_handler: OnceLock::new(),
    })
  }

  pub fn factory(self: &Arc<Self>) -> Arc<dyn SourceFactory> {
    Arc::new(ScriptedFactory(Arc::clone(self)))
  }

  pub fn publish(&self, checkpoint: &Checkpoint, files: &[(&str, &[u8])]) -> CheckpointInfo {
    let metadata = files
      .iter()
      .map(|(name, bytes)| FileMetadata::of_bytes(*name, bytes))
      .collect();
    let bodies = files
      .iter()
      .map(|(name, bytes)| (name.to_string(), bytes.to_vec()))
      .collect();
    let info = CheckpointInfo::new(checkpoint.clone(), metadata);
    self
      .published
      .lock()
      .insert(checkpoint.clone(), (info.clone(), bodies));
    info
  }

  pub fn set_mode(&self, mode: TransferMode) {
    *self.mode.lock() = mode;
  }

  pub fn push_through(&self, handler: Arc<ChunkTransferHandler>) {
    let _ = self.push_handler.set(handler);
  }

  pub fn hold_next(&self, sessions: usize) {
    self.holds.store(sessions, Ordering::SeqCst);
  }

  /// Wait until a held session reached `checkpoint_info`.
  pub fn await_held(&self) -> ReplicationId {
    self.entered_rx.recv_timeout(WAIT).expect("held session")
  }

  pub fn release(&self) {
    let _ = self.release_tx.send(());
  }

  pub fn cancelled(&self) -> Vec<ReplicationId> {
    self.cancelled.lock().clone()
  }

  fn take_hold(&self) -> bool {
    self
      .holds
      .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |holds| holds.checked_sub(1))
      .is_ok()
  }

  fn chunks_for(&self, request: &GetFilesRequest) -> Result<Vec<FileChunk>> {
    let published = self.published.lock();
    let (_, bodies) = published.get(&request.checkpoint).ok_or_else(|| {
      SegrepError::SourceUnavailable(format!("checkpoint {} not published", request.checkpoint))
    })?;

    let mut chunks = Vec::new();
    for file in &request.files {
      let body = bodies.get(&file.name).ok_or_else(|| {
        SegrepError::SourceUnavailable(format!("file {} not published", file.name))
      })?;
      let mut offset = 0usize;
      loop {
        let end = (offset + self.chunk_size).min(body.len());
        chunks.push(FileChunk {
          replication_id: request.replication_id,
          shard_id: request.shard_id.clone(),
          file_name: file.name.clone(),
          offset: offset as u64,
          data: body[offset..end].to_vec(),
          last_chunk: end == body.len(),
        });
        if end == body.len() {
          break;
        }
        offset = end;
      }
    }
    Ok(chunks)
  }
}

impl ReplicationSource for ScriptedPrimary {
  fn description(&self) -> String {
    "scripted primary".to_string()
  }

  fn checkpoint_info(
    &self,
    replication_id: ReplicationId,
    checkpoint: &Checkpoint,
  ) -> Result<CheckpointInfo> {
    if self.take_hold() {
      let _ = self.entered_tx.send(replication_id);
      if self.release_rx.recv_timeout(WAIT).is_err() {
        return Err(SegrepError::SourceUnavailable("held session never released".to_string()));
      }
    }
    self
      .published
      .lock()
      .get(checkpoint)
      .map(|(info, _)| info.clone())
      .ok_or_else(|| SegrepError::SourceUnavailable(format!("checkpoint {checkpoint} not published")))
  }

  fn get_segment_files(&self, request: GetFilesRequest) -> Result<FileTransfer> {
    let mode = *self.mode.lock();
    match mode {
      TransferMode::FailFiles => Err(SegrepError::SourceUnavailable(
        "primary lost segment files".to_string(),
      )),
      TransferMode::CancelFiles => Err(SegrepError::Cancelled(
        "primary cancelled the transfer".to_string(),
      )),
      TransferMode::Pull => Ok(FileTransfer::Pull(Box::new(VecStream(
        self.chunks_for(&request)?.into_iter(),
      )))),
      TransferMode::Push => {
        let chunks = self.chunks_for(&request)?;
        let handler = self
          .push_handler
          .get()
          .cloned()
          .ok_or_else(|| SegrepError::SourceUnavailable("no push handler".to_string()))?;
        std::thread::spawn(move || {
          for chunk in chunks {
            if handler.handle_inbound_chunk(chunk).is_err() {
              break;
            }
          }
        });
        Ok(FileTransfer::Push)
      }
    }
  }

  fn cancel(&self, replication_id: ReplicationId, _reason: &str) {
    self.cancelled.lock().push(replication_id);
  }
}

struct ScriptedFactory(Arc<ScriptedPrimary>);

impl SourceFactory for ScriptedFactory {
  fn open_session(
    &self,
    _shard: &ShardId,
    _checkpoint: &Checkpoint,
  ) -> Result<Arc<dyn ReplicationSource>> {
    Ok(Arc::clone(&self.0) as Arc<dyn ReplicationSource>)
  }
}

struct VecStream(std::vec::IntoIter<FileChunk>);

impl ChunkStream for VecStream {
  fn next_chunk(&mut self) -> Result<Option<FileChunk>> {
    Ok(self.0.next())
  }
}
