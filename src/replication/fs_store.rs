//! Directory-backed segment store.
//!
//! Layout: `<root>/<index>/<shard id>/` holds the segment files of the last
//! installed checkpoint plus `checkpoint.json`, the manifest naming them.
//! An attempt writes into `replication.<attempt id>.<file name>` and nothing
//! becomes visible under a real name until the manifest is installed. The
//! manifest is replaced with the write-tmp, fsync, rename, fsync-parent
//! sequence, so a crash leaves either the old or the new checkpoint.

use super::store::{SegmentStore, SegmentWriter};
use crate::constants::{SHARD_LOCK_FILE_NAME, SHARD_MANIFEST_FILE_NAME, TEMP_FILE_PREFIX};
use crate::error::{Result, SegrepError};
use crate::types::{Checkpoint, CheckpointInfo, FileMetadata, ReplicationId, ShardId};
use fs2::FileExt;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct FsSegmentStore {
  root: PathBuf,
  // serializes manifest installs
  install: Mutex<()>,
  _lock: File,
}

impl FsSegmentStore {
  /// Open (creating if needed) a store rooted at `root`. Only one store per
  /// root may be open at a time, across processes.
  pub fn open(root: impl AsRef<Path>) -> Result<Self> {
    let root = root.as_ref().to_path_buf();
    std::fs::create_dir_all(&root)?;
    let lock_path = root.join(SHARD_LOCK_FILE_NAME);
    let lock = OpenOptions::new()
      .create(true)
      .read(true)
      .write(true)
      .truncate(false)
      .open(&lock_path)?;
    lock.try_lock_exclusive().map_err(|error| {
      SegrepError::LockFailed(format!(
        "segment store is held by another process: {} ({error})",
        lock_path.display()
      ))
    })?;

    Ok(Self {
      root,
      install: Mutex::new(()),
      _lock: lock,
    })
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  pub fn shard_dir(&self, shard: &ShardId) -> PathBuf {
    self.root.join(&shard.index).join(shard.id.to_string())
  }

  /// Manifest of the installed checkpoint, if one was ever installed.
  pub fn checkpoint_info(&self, shard: &ShardId) -> Result<Option<CheckpointInfo>> {
    load_manifest(&self.shard_dir(shard).join(SHARD_MANIFEST_FILE_NAME))
  }

  pub fn current_checkpoint(&self, shard: &ShardId) -> Result<Checkpoint> {
    Ok(
      self
        .checkpoint_info(shard)?
        .map(|info| info.checkpoint)
        .unwrap_or_else(|| Checkpoint::empty(shard.clone())),
    )
  }

  pub fn open_file(&self, shard: &ShardId, name: &str) -> Result<File> {
    check_file_name(name)?;
    Ok(File::open(self.shard_dir(shard).join(name))?)
  }

  pub fn read_file(&self, shard: &ShardId, name: &str) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    self.open_file(shard, name)?.read_to_end(&mut bytes)?;
    Ok(bytes)
  }

  /// Publish a new checkpoint made of `files`, as a primary does after a
  /// refresh. Files already installed with identical content are kept.
  pub fn write_checkpoint(
    &self,
    checkpoint: &Checkpoint,
    files: &[(&str, &[u8])],
  ) -> Result<CheckpointInfo> {
    let shard = &checkpoint.shard_id;
    let dir = self.shard_dir(shard);
    std::fs::create_dir_all(&dir)?;

    let _install = self.install.lock();
    let mut metadata = Vec::with_capacity(files.len());
    for (name, bytes) in files {
      check_file_name(name)?;
      let path = dir.join(name);
      let mut file = OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(&path)?;
      file.write_all(bytes)?;
      file.sync_all()?;
      metadata.push(FileMetadata::of_bytes(*name, bytes));
    }

    let info = CheckpointInfo::new(checkpoint.clone(), metadata);
    persist_manifest(&dir.join(SHARD_MANIFEST_FILE_NAME), &info)?;
    remove_unreferenced(&dir, &info)?;
    Ok(info)
  }

  fn temp_path(&self, shard: &ShardId, replication_id: ReplicationId, name: &str) -> PathBuf {
    self
      .shard_dir(shard)
      .join(format!("{}{name}", temp_prefix(replication_id)))
  }
}

impl SegmentStore for FsSegmentStore {
  fn local_files(&self, shard: &ShardId) -> Result<Vec<FileMetadata>> {
    let Some(info) = self.checkpoint_info(shard)? else {
      return Ok(Vec::new());
    };
    let dir = self.shard_dir(shard);
    let mut present = Vec::with_capacity(info.files.len());
    for file in info.files {
      match std::fs::metadata(dir.join(&file.name)) {
        Ok(meta) if meta.len() == file.length => present.push(file),
        Ok(_) => {
          tracing::warn!(shard = %shard, file = %file.name, "installed file has unexpected length");
        }
        Err(error) if error.kind() == ErrorKind::NotFound => {
          tracing::warn!(shard = %shard, file = %file.name, "installed file is missing");
        }
        Err(error) => return Err(error.into()),
      }
    }
    Ok(present)
  }

  fn open_writer(
    &self,
    shard: &ShardId,
    replication_id: ReplicationId,
    file: &FileMetadata,
  ) -> Result<Box<dyn SegmentWriter>> {
    check_file_name(&file.name)?;
    std::fs::create_dir_all(self.shard_dir(shard))?;
    let path = self.temp_path(shard, replication_id, &file.name);
    let handle = OpenOptions::new()
      .create(true)
      .truncate(true)
      .write(true)
      .open(&path)?;

    Ok(Box::new(FsSegmentWriter {
      name: file.name.clone(),
      out: BufWriter::new(handle),
      hasher: crc32fast::Hasher::new(),
      length: 0,
    }))
  }

  fn finalize_manifest(
    &self,
    shard: &ShardId,
    replication_id: ReplicationId,
    info: &CheckpointInfo,
    written: &[FileMetadata],
  ) -> Result<()> {
    if &info.checkpoint.shard_id != shard {
      return Err(SegrepError::InvalidReplication(format!(
        "manifest for {} installed into {shard}",
        info.checkpoint.shard_id
      )));
    }
    let dir = self.shard_dir(shard);
    std::fs::create_dir_all(&dir)?;
    let written: HashMap<&str, &FileMetadata> =
      written.iter().map(|file| (file.name.as_str(), file)).collect();

    let _install = self.install.lock();

    // Verify everything before the first rename.
    let mut renames = Vec::new();
    for file in &info.files {
      check_file_name(&file.name)?;
      let received = written.get(file.name.as_str());
      if let Some(actual) = received {
        if !actual.is_same(file) {
          return Err(SegrepError::ManifestMismatch {
            file: file.name.clone(),
            reason: format!(
              "received checksum {:08x}, manifest {:08x}",
              actual.checksum, file.checksum
            ),
          });
        }
      }
      let (path, origin) = match received {
        Some(_) => (self.temp_path(shard, replication_id, &file.name), "received"),
        None => (dir.join(&file.name), "local"),
      };
      let length = match std::fs::metadata(&path) {
        Ok(meta) => meta.len(),
        Err(error) if error.kind() == ErrorKind::NotFound => {
          return Err(SegrepError::ManifestMismatch {
            file: file.name.clone(),
            reason: format!("{origin} copy is missing"),
          })
        }
        Err(error) => return Err(error.into()),
      };
      if length != file.length {
        return Err(SegrepError::ManifestMismatch {
          file: file.name.clone(),
          reason: format!("{origin} length {length}, manifest {}", file.length),
        });
      }
      if received.is_some() {
        renames.push((path, dir.join(&file.name)));
      }
    }

    for (from, to) in renames {
      std::fs::rename(from, to)?;
    }
    persist_manifest(&dir.join(SHARD_MANIFEST_FILE_NAME), info)?;
    remove_unreferenced(&dir, info)?;

    tracing::debug!(
      replication_id = %replication_id,
      shard = %shard,
      checkpoint = %info.checkpoint,
      files = info.files.len(),
      "installed replicated checkpoint"
    );
    Ok(())
  }

  fn discard_temp_files(&self, shard: &ShardId, replication_id: ReplicationId) -> Result<()> {
    let dir = self.shard_dir(shard);
    let entries = match std::fs::read_dir(&dir) {
      Ok(entries) => entries,
      Err(error) if error.kind() == ErrorKind::NotFound => return Ok(()),
      Err(error) => return Err(error.into()),
    };
    let prefix = temp_prefix(replication_id);
    for entry in entries {
      let entry = entry?;
      let name = entry.file_name();
      if name.to_string_lossy().starts_with(&prefix) {
        remove_if_present(&entry.path())?;
      }
    }
    Ok(())
  }
}

struct FsSegmentWriter {
  name: String,
  out: BufWriter<File>,
  hasher: crc32fast::Hasher,
  length: u64,
}

impl SegmentWriter for FsSegmentWriter {
  fn write(&mut self, bytes: &[u8]) -> Result<()> {
    self.out.write_all(bytes)?;
    self.hasher.update(bytes);
    self.length += bytes.len() as u64;
    Ok(())
  }

  fn finish(self: Box<Self>) -> Result<FileMetadata> {
    let FsSegmentWriter {
      name,
      out,
      hasher,
      length,
    } = *self;
    let file = out
      .into_inner()
      .map_err(|error| SegrepError::Io(error.into_error()))?;
    file.sync_all()?;
    Ok(FileMetadata::new(name, length, hasher.finalize()))
  }
}

fn temp_prefix(replication_id: ReplicationId) -> String {
  format!("{TEMP_FILE_PREFIX}{replication_id}.")
}

fn check_file_name(name: &str) -> Result<()> {
  let reserved = name == SHARD_MANIFEST_FILE_NAME
    || name == SHARD_LOCK_FILE_NAME
    || name.starts_with(TEMP_FILE_PREFIX);
  if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." || reserved {
    return Err(SegrepError::InvalidReplication(format!(
      "invalid segment file name: {name:?}"
    )));
  }
  Ok(())
}

fn load_manifest(path: &Path) -> Result<Option<CheckpointInfo>> {
  let bytes = match std::fs::read(path) {
    Ok(bytes) => bytes,
    Err(error) if error.kind() == ErrorKind::NotFound => return Ok(None),
    Err(error) => return Err(error.into()),
  };
  let info: CheckpointInfo = serde_json::from_slice(&bytes).map_err(|error| {
    SegrepError::Serialization(format!("decode checkpoint manifest failed: {error}"))
  })?;
  Ok(Some(info))
}

fn persist_manifest(path: &Path, info: &CheckpointInfo) -> Result<()> {
  let tmp_path = path.with_extension("json.tmp");
  let bytes = serde_json::to_vec(info).map_err(|error| {
    SegrepError::Serialization(format!("encode checkpoint manifest failed: {error}"))
  })?;

  let mut file = OpenOptions::new()
    .create(true)
    .truncate(true)
    .write(true)
    .open(&tmp_path)?;
  file.write_all(&bytes)?;
  file.sync_all()?;
  std::fs::rename(&tmp_path, path)?;
  sync_parent_dir(path.parent())?;
  Ok(())
}

/// Delete files the installed manifest no longer names. Temp files of
/// other attempts belong to them and are left alone.
fn remove_unreferenced(dir: &Path, info: &CheckpointInfo) -> Result<()> {
  let referenced: HashSet<&str> = info.files.iter().map(|file| file.name.as_str()).collect();
  for entry in std::fs::read_dir(dir)? {
    let entry = entry?;
    if !entry.file_type()?.is_file() {
      continue;
    }
    let name = entry.file_name();
    let name = name.to_string_lossy();
    if name == SHARD_MANIFEST_FILE_NAME
      || name == SHARD_LOCK_FILE_NAME
      || name.starts_with(TEMP_FILE_PREFIX)
      || name.ends_with(".tmp")
      || referenced.contains(name.as_ref())
    {
      continue;
    }
    remove_if_present(&entry.path())?;
  }
  Ok(())
}

fn remove_if_present(path: &Path) -> Result<()> {
  match std::fs::remove_file(path) {
    Ok(()) => Ok(()),
    Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
    Err(error) => Err(error.into()),
  }
}

fn sync_parent_dir(parent: Option<&Path>) -> Result<()> {
  #[cfg(unix)]
  {
    if let Some(parent) = parent {
      File::open(parent)?.sync_all()?;
    }
  }

  #[cfg(not(unix))]
  {
    let _ = parent;
  }

  Ok(())
}
