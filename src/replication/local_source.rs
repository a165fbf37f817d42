//! In-process replication source reading a primary's `FsSegmentStore`.
//!
//! Serves pull-mode transfers: files are streamed in `chunk_size` pieces in
//! request order. Used when primary and replica share a node and by tests.

use super::fs_store::FsSegmentStore;
use super::source::{ChunkStream, FileTransfer, GetFilesRequest, ReplicationSource, SourceFactory};
use crate::error::{Result, SegrepError};
use crate::types::{Checkpoint, CheckpointInfo, FileChunk, FileMetadata, ReplicationId, ShardId};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct LocalSourceFactory {
  primary: Arc<FsSegmentStore>,
  chunk_size: usize,
}

impl LocalSourceFactory {
  pub fn new(primary: Arc<FsSegmentStore>, chunk_size: usize) -> Self {
    Self {
      primary,
      chunk_size: chunk_size.max(1),
    }
  }
}

impl SourceFactory for LocalSourceFactory {
  fn open_session(
    &self,
    shard: &ShardId,
    _checkpoint: &Checkpoint,
  ) -> Result<Arc<dyn ReplicationSource>> {
    Ok(Arc::new(LocalPrimarySource::new(
      Arc::clone(&self.primary),
      shard.clone(),
      self.chunk_size,
    )))
  }
}

#[derive(Debug)]
pub struct LocalPrimarySource {
  primary: Arc<FsSegmentStore>,
  shard: ShardId,
  chunk_size: usize,
  // per-attempt stop flags handed to open streams
  streams: Mutex<HashMap<ReplicationId, Arc<AtomicBool>>>,
}

impl LocalPrimarySource {
  pub fn new(primary: Arc<FsSegmentStore>, shard: ShardId, chunk_size: usize) -> Self {
    Self {
      primary,
      shard,
      chunk_size: chunk_size.max(1),
      streams: Mutex::new(HashMap::new()),
    }
  }
}

impl ReplicationSource for LocalPrimarySource {
  fn description(&self) -> String {
    format!("local primary {} for {}", self.primary.root().display(), self.shard)
  }

  fn checkpoint_info(
    &self,
    _replication_id: ReplicationId,
    checkpoint: &Checkpoint,
  ) -> Result<CheckpointInfo> {
    let info = self.primary.checkpoint_info(&self.shard)?.ok_or_else(|| {
      SegrepError::SourceUnavailable(format!("primary has no checkpoint for {}", self.shard))
    })?;
    if checkpoint.is_ahead_of(&info.checkpoint) {
      return Err(SegrepError::SourceUnavailable(format!(
        "primary checkpoint [{}] is behind requested [{checkpoint}]",
        info.checkpoint
      )));
    }
    Ok(info)
  }

  fn get_segment_files(&self, request: GetFilesRequest) -> Result<FileTransfer> {
    if request.shard_id != self.shard {
      return Err(SegrepError::InvalidReplication(format!(
        "file request for {} sent to source of {}",
        request.shard_id, self.shard
      )));
    }
    let stop = Arc::new(AtomicBool::new(false));
    self
      .streams
      .lock()
      .insert(request.replication_id, Arc::clone(&stop));

    Ok(FileTransfer::Pull(Box::new(LocalChunkStream {
      primary: Arc::clone(&self.primary),
      replication_id: request.replication_id,
      shard: request.shard_id,
      pending: request.files.into(),
      current: None,
      chunk_size: self.chunk_size,
      stop,
    })))
  }

  fn cancel(&self, replication_id: ReplicationId, reason: &str) {
    if let Some(stop) = self.streams.lock().remove(&replication_id) {
      tracing::debug!(replication_id = %replication_id, "stopping local file stream: {reason}");
      stop.store(true, Ordering::Release);
    }
  }
}

struct SourceFile {
  meta: FileMetadata,
  file: File,
  offset: u64,
}

struct LocalChunkStream {
  primary: Arc<FsSegmentStore>,
  replication_id: ReplicationId,
  shard: ShardId,
  pending: VecDeque<FileMetadata>,
  current: Option<SourceFile>,
  chunk_size: usize,
  stop: Arc<AtomicBool>,
}

impl ChunkStream for LocalChunkStream {
  fn next_chunk(&mut self) -> Result<Option<FileChunk>> {
    if self.stop.load(Ordering::Acquire) {
      return Err(SegrepError::Cancelled(format!(
        "source stopped sending for replication {}",
        self.replication_id
      )));
    }

    let mut current = match self.current.take() {
      Some(current) => current,
      None => {
        let Some(meta) = self.pending.pop_front() else {
          return Ok(None);
        };
        let file = self.primary.open_file(&self.shard, &meta.name)?;
        SourceFile {
          meta,
          file,
          offset: 0,
        }
      }
    };

    let remaining = current.meta.length.saturating_sub(current.offset);
    let take = remaining.min(self.chunk_size as u64) as usize;
    let mut data = vec![0u8; take];
    current.file.read_exact(&mut data)?;

    let offset = current.offset;
    current.offset += take as u64;
    let last_chunk = current.offset == current.meta.length;
    let chunk = FileChunk {
      replication_id: self.replication_id,
      shard_id: self.shard.clone(),
      file_name: current.meta.name.clone(),
      offset,
      data,
      last_chunk,
    };
    if !last_chunk {
      self.current = Some(current);
    }
    Ok(Some(chunk))
  }
}
