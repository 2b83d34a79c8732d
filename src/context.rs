//! Mount-wide shared state (C6). A single `RwLock`-guarded `Tdb` plus the
//! backing directory accessor, shared across every FUSE callback. Ground:
//! teacher's `TagFS` struct in `fs/tag.rs` held the equivalent state
//! without a lock (the teacher's mount loop is single-threaded); the lock
//! itself is grounded on sibling example `amoffat-supertag`, whose
//! `parking_lot`-guarded store plays the same role under `fuser`'s
//! multi-threaded callback dispatch.

use std::path::{Path, PathBuf};

use parking_lot::{Mutex, RwLock};

use crate::backing::BackingDir;
use crate::config::Config;
use crate::error::Result;
use crate::fs::handle::HandleTable;
use crate::fs::node_table::{FileIds, NodeTable};
use crate::tagdb::{self, Checked, Tdb};

pub struct MountContext {
    pub tdb: RwLock<Tdb>,
    pub backing: BackingDir,
    pub config: Config,
    /// FUSE ino-protocol bookkeeping, guarded separately from the TDB so
    /// that `lookup`/`readdir` can allocate directory/file ids without
    /// holding the TDB lock across both (locking discipline in spec.md
    /// §4.6: the TDB lock is always innermost and never nested under
    /// another).
    pub nodes: Mutex<NodeTable>,
    pub file_ids: Mutex<FileIds>,
    pub handles: HandleTable,
    sidecar_path: PathBuf,
}

const SIDECAR_NAME: &str = ".tagdb";

impl MountContext {
    /// Opens the sidecar under `backing_root` (creating an empty one if
    /// absent), runs the integrity check, and returns the ready context
    /// along with the check's outcome so `main` can decide whether to back
    /// up the sidecar before the mount proceeds.
    pub fn open<P: AsRef<Path>>(backing_root: P, config: Config) -> Result<(Self, Checked)> {
        let backing = BackingDir::new(backing_root.as_ref());
        let sidecar_path = backing_root.as_ref().join(SIDECAR_NAME);

        let mut tdb = if sidecar_path.exists() {
            let bytes = backing.read_file(SIDECAR_NAME)?;
            tagdb::open(std::io::Cursor::new(bytes))?
        } else {
            Tdb::new()
        };

        let outcome = tagdb::check(&mut tdb, &backing)?;
        let tag_capacity = tdb.tag_capacity();

        Ok((
            Self {
                tdb: RwLock::new(tdb),
                backing,
                config,
                nodes: Mutex::new(NodeTable::new(tag_capacity)),
                file_ids: Mutex::new(FileIds::new()),
                handles: HandleTable::new(),
                sidecar_path,
            },
            outcome,
        ))
    }

    pub fn sidecar_path(&self) -> &Path {
        &self.sidecar_path
    }

    /// Serializes the current TDB state and overwrites the sidecar.
    /// Called from `fsync` and `destroy` (spec.md §4.5's flush points);
    /// every other mutation stays in memory until one of those fires.
    pub fn flush(&self) -> Result<()> {
        let tdb = self.tdb.read();
        let mut buf = Vec::new();
        tagdb::flush(&tdb, &mut buf)?;
        self.backing.write_file(SIDECAR_NAME, &buf)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tagdb::EntryKind;

    #[test]
    fn opening_a_fresh_backing_dir_yields_an_empty_clean_tdb() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, outcome) = MountContext::open(dir.path(), Config::default()).unwrap();
        assert!(matches!(outcome, Checked::Clean));
        assert!(ctx.tdb.read().iter().next().is_none());
    }

    #[test]
    fn flush_then_reopen_round_trips_tags() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _) = MountContext::open(dir.path(), Config::default()).unwrap();
        ctx.tdb.write().insert("red", EntryKind::Tag);
        ctx.flush().unwrap();

        let (ctx2, _) = MountContext::open(dir.path(), Config::default()).unwrap();
        assert!(ctx2.tdb.read().get("red").is_some());
    }
}
