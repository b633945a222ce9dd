//! Write-Ahead Log for the in-memory store
//!
//! Every mutation is appended as one JSON line before it is applied, so the
//! store can be rebuilt by replaying the file in order. The log is owned by
//! the store, which in turn is owned by the coordinator, so no locking is
//! needed around the writer.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// A logged store mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Update { key: Vec<u8>, old: Vec<u8>, new: Vec<u8> },
    Delete { key: Vec<u8> },
}

/// WAL entry representing a logged operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    pub timestamp: u64,
    pub op: WalOp,
}

impl WalEntry {
    pub fn new(op: WalOp) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Self { timestamp, op }
    }
}

/// Append-only JSON-lines journal
pub struct WriteAheadLog {
    writer: BufWriter<File>,
    path: PathBuf,
}

impl WriteAheadLog {
    /// Open (or create) the log at `path` for appending
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            writer: BufWriter::new(file),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append an operation and flush it to the file
    pub fn append(&mut self, op: WalOp) -> Result<()> {
        let entry = WalEntry::new(op);
        let json = serde_json::to_string(&entry)?;
        writeln!(self.writer, "{}", json)?;
        self.writer.flush()?;
        Ok(())
    }

    /// Feed every logged operation, oldest first, to `apply_fn`
    pub fn replay<F>(&self, mut apply_fn: F) -> Result<()>
    where
        F: FnMut(WalOp),
    {
        if !self.path.exists() {
            return Ok(());
        }

        let reader = BufReader::new(File::open(&self.path)?);
        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }

            let entry: WalEntry = serde_json::from_str(&line).map_err(|e| {
                Error::Wal(format!("malformed entry on line {}: {}", index + 1, e))
            })?;
            apply_fn(entry.op);
        }

        Ok(())
    }
}
