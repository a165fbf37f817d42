//! Replica-side segment replication.
//!
//! `ReplicationTargetService` receives checkpoint notifications and shard
//! lifecycle events; each accepted checkpoint becomes a `ReplicationTarget`
//! registered in the `ReplicationRegistry` and driven on the service's worker
//! pool. File chunks reach their attempt through the `ChunkTransferHandler`,
//! which applies the node-wide transfer throttle.

pub mod checkpoint_tracker;
pub mod chunk_handler;
pub mod executor;
pub mod fs_store;
pub mod local_source;
pub mod rate_limiter;
pub mod registry;
pub mod service;
pub mod shard;
pub mod source;
pub mod state;
pub mod store;
pub mod target;

pub use checkpoint_tracker::CheckpointTracker;
pub use chunk_handler::ChunkTransferHandler;
pub use executor::WorkerPool;
pub use fs_store::FsSegmentStore;
pub use local_source::{LocalPrimarySource, LocalSourceFactory};
pub use rate_limiter::{ChunkThrottle, RateLimiter};
pub use registry::{next_replication_id, ReplicationMonitor, ReplicationRef, ReplicationRegistry};
pub use service::ReplicationTargetService;
pub use shard::ReplicaShard;
pub use source::{ChunkStream, FileTransfer, GetFilesRequest, ReplicationSource, SourceFactory};
pub use state::{AttemptStatus, ReplicationStage, ReplicationState, TransferProgress};
pub use store::{SegmentStore, SegmentWriter};
pub use target::{CancellationToken, ReplicationListener, ReplicationOutcome, ReplicationTarget};
