//! Per-open file handle bookkeeping (C5's `Closed -> Open(fd) -> Closed`
//! state machine, spec.md §4.5). Ground: teacher's `FileHandle` newtype in
//! `fs/mod.rs` and its release/read/write trio in `fs/backing.rs`'s
//! `BackingFS` trait, generalized to hold the real `OpenFile` directly
//! since this crate has only one backing implementation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::backing::OpenFile;

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct FileHandle(pub u64);

pub struct OpenHandle {
    pub file: OpenFile,
}

pub struct HandleTable {
    next: AtomicU64,
    open: Mutex<HashMap<u64, OpenHandle>>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
            open: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, file: OpenFile) -> FileHandle {
        let fh = self.next.fetch_add(1, Ordering::Relaxed);
        self.open.lock().insert(fh, OpenHandle { file });
        FileHandle(fh)
    }

    pub fn with<R>(&self, fh: FileHandle, f: impl FnOnce(&OpenHandle) -> R) -> Option<R> {
        self.open.lock().get(&fh.0).map(f)
    }

    pub fn remove(&self, fh: FileHandle) -> Option<OpenHandle> {
        self.open.lock().remove(&fh.0)
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_are_never_reused_while_distinct_opens_are_live() {
        let table = HandleTable::new();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), b"x").unwrap();
        let backing = crate::backing::BackingDir::new(dir.path());
        let a = table.insert(backing.open("a", false).unwrap());
        let b = table.insert(backing.open("a", false).unwrap());
        assert_ne!(a.0, b.0);
        assert!(table.remove(a).is_some());
        assert!(table.with(a, |_| ()).is_none());
        assert!(table.with(b, |_| ()).is_some());
    }
}
