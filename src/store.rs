//! Key-value store consumed by the coordinator
//!
//! The coordinator is the only caller, one operation at a time, so stores
//! take `&mut self` and carry no synchronization of their own.

use crate::error::Result;
use crate::wal::{WalOp, WriteAheadLog};
use std::collections::HashMap;

/// The four operations the server needs from a store
pub trait Store: Send + 'static {
    /// Add `value` under `key`
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()>;

    /// All values stored under `key`, in the order they were added
    fn get(&self, key: &[u8]) -> Vec<Vec<u8>>;

    /// Replace `old` with `new` among the values of `key`
    fn update(&mut self, key: &[u8], old: &[u8], new: &[u8]) -> Result<()>;

    /// Remove `key` and every value stored under it
    fn delete(&mut self, key: &[u8]) -> Result<()>;
}

/// In-memory multi-valued store with an optional write-ahead log
#[derive(Default)]
pub struct MemoryStore {
    data: HashMap<Vec<u8>, Vec<Vec<u8>>>,
    wal: Option<WriteAheadLog>,
}

impl MemoryStore {
    /// Create a new memory store without WAL
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store journaled to `wal`, restoring whatever it already holds
    pub fn open(wal: WriteAheadLog) -> Result<Self> {
        let mut store = Self::new();
        wal.replay(|op| store.apply(op))?;
        store.wal = Some(wal);
        Ok(store)
    }

    /// Number of keys
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn log(&mut self, op: &WalOp) -> Result<()> {
        match self.wal.as_mut() {
            Some(wal) => wal.append(op.clone()),
            None => Ok(()),
        }
    }

    /// Apply a mutation without journaling it
    fn apply(&mut self, op: WalOp) {
        match op {
            WalOp::Put { key, value } => {
                self.data.entry(key).or_default().push(value);
            }
            WalOp::Update { key, old, new } => {
                if let Some(values) = self.data.get_mut(&key) {
                    for value in values.iter_mut().filter(|v| **v == old) {
                        *value = new.clone();
                    }
                }
            }
            WalOp::Delete { key } => {
                self.data.remove(&key);
            }
        }
    }

    fn log_and_apply(&mut self, op: WalOp) -> Result<()> {
        self.log(&op)?;
        self.apply(op);
        Ok(())
    }
}

impl Store for MemoryStore {
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.log_and_apply(WalOp::Put {
            key: key.to_vec(),
            value: value.to_vec(),
        })
    }

    fn get(&self, key: &[u8]) -> Vec<Vec<u8>> {
        self.data.get(key).cloned().unwrap_or_default()
    }

    fn update(&mut self, key: &[u8], old: &[u8], new: &[u8]) -> Result<()> {
        let present = self
            .data
            .get(key)
            .is_some_and(|values| values.iter().any(|v| v == old));
        if !present {
            return Ok(());
        }
        self.log_and_apply(WalOp::Update {
            key: key.to_vec(),
            old: old.to_vec(),
            new: new.to_vec(),
        })
    }

    fn delete(&mut self, key: &[u8]) -> Result<()> {
        if !self.data.contains_key(key) {
            return Ok(());
        }
        self.log_and_apply(WalOp::Delete { key: key.to_vec() })
    }
}
