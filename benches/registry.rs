//! Benchmarks for the replication hot paths
//!
//! Run with: cargo bench --bench registry

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use std::time::Duration;

use segrep::error::{Result, SegrepError};
use segrep::replication::{
  next_replication_id, ChunkThrottle, ChunkTransferHandler, ReplicaShard, ReplicationOutcome,
  ReplicationRegistry, ReplicationSource, ReplicationTarget, SegmentStore, SegmentWriter,
  SourceFactory,
};
use segrep::types::{Checkpoint, CheckpointInfo, FileChunk, FileMetadata, ReplicationId, ShardId};

struct NullShard(ShardId);

impl ReplicaShard for NullShard {
  fn shard_id(&self) -> ShardId {
    self.0.clone()
  }

  fn should_process_checkpoint(&self, _checkpoint: &Checkpoint) -> bool {
    true
  }

  fn current_checkpoint(&self) -> Checkpoint {
    Checkpoint::empty(self.0.clone())
  }

  fn finalize_replication(&self, _info: &CheckpointInfo) -> Result<()> {
    Ok(())
  }

  fn fail_shard(&self, _reason: &str, _cause: &SegrepError) {}
}

struct NullStore;

impl SegmentStore for NullStore {
  fn local_files(&self, _shard: &ShardId) -> Result<Vec<FileMetadata>> {
    Ok(Vec::new())
  }

  fn open_writer(
    &self,
    _shard: &ShardId,
    _replication_id: ReplicationId,
    _file: &FileMetadata,
  ) -> Result<Box<dyn SegmentWriter>> {
    Err(SegrepError::InvalidReplication("read-only".to_string()))
  }

  fn finalize_manifest(
    &self,
    _shard: &ShardId,
    _replication_id: ReplicationId,
    _info: &CheckpointInfo,
    _written: &[FileMetadata],
  ) -> Result<()> {
    Ok(())
  }

  fn discard_temp_files(&self, _shard: &ShardId, _replication_id: ReplicationId) -> Result<()> {
    Ok(())
  }
}

struct NoPrimary;

impl SourceFactory for NoPrimary {
  fn open_session(
    &self,
    shard: &ShardId,
    _checkpoint: &Checkpoint,
  ) -> Result<Arc<dyn ReplicationSource>> {
    Err(SegrepError::SourceUnavailable(format!("no primary for {shard}")))
  }
}

fn registry_with(shards: u32) -> (Arc<ReplicationRegistry>, Vec<(ReplicationId, ShardId)>) {
  let registry = Arc::new(ReplicationRegistry::new());
  let mut ids = Vec::with_capacity(shards as usize);
  for shard_id in 0..shards {
    let shard = ShardId::new("bench", shard_id);
    let target = Arc::new(ReplicationTarget::new(
      next_replication_id(),
      Checkpoint::new(shard.clone(), 1, 1, 1, 0),
      Arc::new(NullShard(shard.clone())),
      Arc::new(NullStore),
      Arc::new(NoPrimary),
      Box::new(|_: ReplicationOutcome| {}),
    ));
    let id = registry
      .start(target, Duration::from_secs(600))
      .expect("expected value");
    ids.push((id, shard));
  }
  (registry, ids)
}

fn bench_acquire_release(c: &mut Criterion) {
  let mut group = c.benchmark_group("registry_acquire");
  for shards in [1u32, 64, 1024] {
    let (registry, ids) = registry_with(shards);
    group.throughput(Throughput::Elements(1));
    group.bench_with_input(BenchmarkId::from_parameter(shards), &ids, |b, ids| {
      let mut next = 0usize;
      b.iter(|| {
        let (id, shard) = &ids[next % ids.len()];
        next = next.wrapping_add(1);
        let handle = registry.acquire_safe(*id, shard).expect("expected value");
        black_box(handle.id());
      });
    });
  }
  group.finish();
}

fn bench_stale_chunk_rejection(c: &mut Criterion) {
  let (registry, _) = registry_with(64);
  let handler = ChunkTransferHandler::new(registry, Arc::new(ChunkThrottle::unlimited()));
  let chunk = FileChunk {
    replication_id: ReplicationId::new(u64::MAX),
    shard_id: ShardId::new("bench", 0),
    file_name: "_0.cfs".to_string(),
    offset: 0,
    data: vec![0u8; 4096],
    last_chunk: false,
  };

  c.bench_function("stale_chunk_rejection", |b| {
    b.iter(|| black_box(handler.handle_inbound_chunk(chunk.clone()).is_err()));
  });
}

fn bench_checkpoint_order(c: &mut Criterion) {
  let shard = ShardId::new("bench", 0);
  let older = Checkpoint::new(shard.clone(), 3, 10, 100, 0);
  let newer = Checkpoint::new(shard, 3, 11, 101, 0);
  c.bench_function("checkpoint_is_ahead_of", |b| {
    b.iter(|| black_box(black_box(&newer).is_ahead_of(black_box(&older))));
  });
}

criterion_group!(
  benches,
  bench_acquire_release,
  bench_stale_chunk_rejection,
  bench_checkpoint_order
);
criterion_main!(benches);
