//! Core value types shared across the replication engine

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Identity of one shard copy: index name plus shard number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId {
  pub index: String,
  pub id: u32,
}

impl ShardId {
  pub fn new(index: impl Into<String>, id: u32) -> Self {
    Self {
      index: index.into(),
      id,
    }
  }
}

impl fmt::Display for ShardId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "[{}][{}]", self.index, self.id)
  }
}

/// Process-wide unique identifier of one replication attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReplicationId(u64);

impl ReplicationId {
  pub const fn new(value: u64) -> Self {
    Self(value)
  }

  pub const fn get(self) -> u64 {
    self.0
  }
}

impl fmt::Display for ReplicationId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Role of a shard copy in its replication group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReplicationRole {
  Primary,
  Replica,
}

/// A point in a primary shard's segment history.
///
/// Checkpoints of one shard are totally ordered by `(primary_term,
/// segment_infos_version)`. `segments_gen` and `signature` describe the
/// content but never break ties: two checkpoints with the same ordering key
/// are not ahead of each other.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Checkpoint {
  pub shard_id: ShardId,
  pub primary_term: u64,
  pub segments_gen: u64,
  pub segment_infos_version: u64,
  pub signature: u64,
}

impl Checkpoint {
  pub fn new(
    shard_id: ShardId,
    primary_term: u64,
    segments_gen: u64,
    segment_infos_version: u64,
    signature: u64,
  ) -> Self {
    Self {
      shard_id,
      primary_term,
      segments_gen,
      segment_infos_version,
      signature,
    }
  }

  /// The empty checkpoint a fresh replica starts from.
  pub fn empty(shard_id: ShardId) -> Self {
    Self::new(shard_id, 0, 0, 0, 0)
  }

  fn ordering_key(&self) -> (u64, u64) {
    (self.primary_term, self.segment_infos_version)
  }

  /// Compare two checkpoints of the same shard; `None` across shards.
  pub fn compare(&self, other: &Checkpoint) -> Option<Ordering> {
    if self.shard_id != other.shard_id {
      return None;
    }
    Some(self.ordering_key().cmp(&other.ordering_key()))
  }

  /// Strictly ahead of `other` in the same shard's history.
  pub fn is_ahead_of(&self, other: &Checkpoint) -> bool {
    self.compare(other) == Some(Ordering::Greater)
  }
}

impl fmt::Display for Checkpoint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "{} term={} gen={} version={}",
      self.shard_id, self.primary_term, self.segments_gen, self.segment_infos_version
    )
  }
}

/// Length and checksum of one segment file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileMetadata {
  pub name: String,
  pub length: u64,
  pub checksum: u32,
}

impl FileMetadata {
  pub fn new(name: impl Into<String>, length: u64, checksum: u32) -> Self {
    Self {
      name: name.into(),
      length,
      checksum,
    }
  }

  /// Compute metadata for an in-memory file body.
  pub fn of_bytes(name: impl Into<String>, bytes: &[u8]) -> Self {
    Self::new(name, bytes.len() as u64, crc32fast::hash(bytes))
  }

  pub fn is_same(&self, other: &FileMetadata) -> bool {
    self.name == other.name && self.length == other.length && self.checksum == other.checksum
  }
}

/// The manifest a checkpoint implies: every file that must exist locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointInfo {
  pub checkpoint: Checkpoint,
  pub files: Vec<FileMetadata>,
}

impl CheckpointInfo {
  pub fn new(checkpoint: Checkpoint, files: Vec<FileMetadata>) -> Self {
    Self { checkpoint, files }
  }

  pub fn file(&self, name: &str) -> Option<&FileMetadata> {
    self.files.iter().find(|file| file.name == name)
  }

  pub fn total_bytes(&self) -> u64 {
    self.files.iter().map(|file| file.length).sum()
  }
}

/// One inbound slice of a segment file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChunk {
  pub replication_id: ReplicationId,
  pub shard_id: ShardId,
  pub file_name: String,
  pub offset: u64,
  pub data: Vec<u8>,
  pub last_chunk: bool,
}
