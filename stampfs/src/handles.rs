//! Open file handle bookkeeping.
//!
//! FUSE identifies an open file by an opaque `fh`. The table hands out fresh numbers and owns
//! the `File` until `release`, which removes it exactly once.

use std::collections::HashMap;
use std::fs::File;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{Result, StampFsError};

#[derive(Debug)]
pub struct HandleTable {
    next: AtomicU64,
    files: Mutex<HashMap<u64, Arc<File>>>,
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            // 0 is what stateless replies use, never hand it out
            next: AtomicU64::new(1),
            files: Mutex::new(HashMap::new()),
        }
    }

    fn files(&self) -> MutexGuard<'_, HashMap<u64, Arc<File>>> {
        match self.files.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn insert(&self, file: File) -> u64 {
        let fh = self.next.fetch_add(1, Ordering::Relaxed);
        self.files().insert(fh, Arc::new(file));
        fh
    }

    pub fn get(&self, fh: u64) -> Result<Arc<File>> {
        self.files()
            .get(&fh)
            .cloned()
            .ok_or(StampFsError::BadHandle(fh))
    }

    /// Drop the table's reference. The descriptor closes once in-flight users finish with it.
    pub fn remove(&self, fh: u64) -> Result<()> {
        self.files()
            .remove(&fh)
            .map(drop)
            .ok_or(StampFsError::BadHandle(fh))
    }

    pub fn len(&self) -> usize {
        self.files().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.files().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempfile;

    #[test]
    fn handles_are_unique_and_nonzero() {
        let table = HandleTable::new();
        let a = table.insert(tempfile().unwrap());
        let b = table.insert(tempfile().unwrap());
        assert_ne!(a, 0);
        assert_ne!(a, b);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn release_happens_exactly_once() {
        let table = HandleTable::new();
        let fh = table.insert(tempfile().unwrap());
        table.get(fh).unwrap();
        table.remove(fh).unwrap();
        assert!(matches!(table.remove(fh), Err(StampFsError::BadHandle(h)) if h == fh));
        assert!(table.get(fh).is_err());
        assert!(table.is_empty());
    }
}
