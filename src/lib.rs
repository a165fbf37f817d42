//! KiteDB segment replication - replica-side coordination
//!
//! Keeps replica shards in sync with their primary by copying immutable
//! segment files named by published checkpoints.
//!
//! # Architecture
//!
//! - **Checkpoint handling**: notifications are recorded per shard; at most
//!   one replication attempt per shard is in flight, and a newer checkpoint
//!   received meanwhile is pursued once the attempt finishes
//! - **Registry**: sole owner of in-flight attempts, handing out scoped
//!   references so finalization and resource release never race
//! - **Transfer**: chunks are ordered per file, throttled node-wide and
//!   written to attempt-scoped temp files
//! - **Install**: a verified manifest swap makes a checkpoint visible

#![deny(clippy::all)]

pub mod config;
pub mod constants;
pub mod error;
pub mod replication;
pub mod types;

pub use config::ReplicationSettings;
pub use error::{Result, SegrepError};
pub use replication::{
  ChunkTransferHandler, FsSegmentStore, LocalSourceFactory, ReplicaShard, ReplicationOutcome,
  ReplicationRegistry, ReplicationSource, ReplicationState, ReplicationTargetService,
  SegmentStore, SourceFactory,
};
pub use types::{Checkpoint, CheckpointInfo, FileChunk, FileMetadata, ReplicationId, ReplicationRole, ShardId};
