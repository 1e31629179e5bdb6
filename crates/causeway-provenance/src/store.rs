//! Append-only persistence
//!
//! One newline-delimited JSON file per ledger, plus one file per snapshot
//! named by snapshot id. Writes go through [`AppendLog::append`], which
//! serializes a single line and flushes it before the in-memory state is
//! allowed to advance. A failed append surfaces as a storage error and the
//! owning ledger refuses further records, so an audit write is never
//! silently skipped.

use causeway_core::{EngineError, Result, SnapshotId};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

/// Append-only newline-delimited JSON log.
#[derive(Debug)]
pub struct AppendLog<T> {
    path: PathBuf,
    _record: PhantomData<T>,
}

impl<T: Serialize + DeserializeOwned> AppendLog<T> {
    /// Open (or create) the log at `path`. Parent directories are created.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(Self {
            path,
            _record: PhantomData,
        })
    }

    /// Serialize `record` as one line and append it, flushing to disk.
    pub fn append(&self, record: &T) -> Result<()> {
        let line = serde_json::to_string(record)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        file.flush()?;
        Ok(())
    }

    /// Read every record back in append order.
    ///
    /// A malformed line is a storage-level integrity problem and fails the
    /// whole load rather than being skipped.
    pub fn load(&self) -> Result<Vec<T>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.path)?;
        let reader = BufReader::new(file);
        let mut records = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            records.push(serde_json::from_str(&line)?);
        }
        Ok(records)
    }

    /// Path of the underlying file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// One-file-per-snapshot store, named by snapshot id.
#[derive(Debug)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    /// Open (or create) the snapshot directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, id: &SnapshotId) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    /// Persist a snapshot record. Snapshots are immutable; overwriting an
    /// existing id is refused.
    pub fn write<T: Serialize>(&self, id: &SnapshotId, snapshot: &T) -> Result<()> {
        let path = self.path_for(id);
        if path.exists() {
            return Err(EngineError::Storage {
                message: format!("snapshot {id} already exists"),
            });
        }
        let json = serde_json::to_vec_pretty(snapshot)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Load a snapshot by id, if present.
    pub fn read<T: DeserializeOwned>(&self, id: &SnapshotId) -> Result<Option<T>> {
        let path = self.path_for(id);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(path)?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }
}
