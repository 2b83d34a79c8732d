//! The `fuser::Filesystem` implementation (C5): maps each kernel callback
//! onto the resolver (C4) and TDB (C3) primitives behind the mount
//! context's lock (C6). Ground: teacher's `TagFS` impl in `fs/tag.rs`,
//! generalized from its `TagNumber`/`TagTree` scheme to the `(pos, neg)`
//! query masks and name-keyed TDB this crate uses.
//!
//! Each mutating callback (`mknod`/`mkdir`/`unlink`/`rmdir`/`rename`)
//! delegates to a `do_*` inherent method that returns a plain `Result`
//! instead of writing to a `fuser` reply type directly. `fuser`'s
//! `Request`/`Reply*` types have no public constructors outside of a real
//! kernel session, so this split is also what makes the core logic
//! reachable from `#[cfg(test)]` without mounting anything.

pub mod handle;
pub mod ino;
pub mod node_table;

use std::ffi::OsStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry,
    ReplyOpen, ReplyWrite, ReplyXattr, Request, TimeOrNow,
};
use log::error;

use crate::bitset::Bitset;
use crate::context::MountContext;
use crate::error::{Result, TagfsError};
use crate::fs::handle::FileHandle;
use crate::fs::ino::Ino;
use crate::resolve::{self, NameOutcome, ResolveFlags};
use crate::tagdb::{Entry, EntryKind};

const TTL: Duration = Duration::new(0, 0);

macro_rules! ok_or_errno {
    ($result:expr, $reply:expr) => {
        match $result {
            Ok(v) => v,
            Err(e) => {
                $reply.error(e.errno());
                return;
            }
        }
    };
}

pub struct TagfsFilesystem {
    ctx: Arc<MountContext>,
}

impl TagfsFilesystem {
    pub fn new(ctx: Arc<MountContext>) -> Self {
        Self { ctx }
    }

    fn flush_or_log(&self) {
        if let Err(e) = self.ctx.flush() {
            error!("failed to flush sidecar: {e}");
        }
    }

    /// Decodes an FUSE name argument. This crate keys TDB entries on
    /// UTF-8 `String`s (see DESIGN.md); a non-UTF-8 request name can never
    /// match an entry and is rejected up front.
    fn decode_name<'a>(name: &'a OsStr) -> Result<&'a str> {
        name.to_str().ok_or(TagfsError::InvalidArgument)
    }

    /// Parent node's cached query masks, resized to the TDB's current tag
    /// capacity. Acquires (and releases) only the node-table lock.
    fn parent_masks(&self, parent_node: u64, cap: usize) -> (Bitset, Bitset) {
        let mut nodes = self.ctx.nodes.lock();
        let (pos, neg) = nodes.masks(parent_node, cap);
        (pos.clone(), neg.clone())
    }

    /// Resolves one path component under the parent directory node,
    /// mutating the TDB if the name names a previously-untracked real
    /// file (spec.md §4.4's `MaterializeRealFile`). Takes the TDB write
    /// lock, matching the locking discipline for any resolution-driving
    /// callback.
    fn resolve_child(&self, parent_node: u64, name: &str) -> Result<ResolvedChild> {
        let cap = self.ctx.tdb.read().tag_capacity();
        let (pos, neg) = self.parent_masks(parent_node, cap);

        let mut tdb = self.ctx.tdb.write();
        let cap = tdb.tag_capacity();

        match resolve::resolve_name(&mut tdb, &self.ctx.backing, name, ResolveFlags::full())? {
            NameOutcome::Entry(EntryKind::File) => {
                let entry = tdb.get(name).expect("just resolved");
                let file_tags = entry.file_tags().expect("file entry");
                if !file_tags.matches(cap, Some(&pos), Some(&neg)) {
                    return Err(TagfsError::NotFound);
                }
                let file_id = self.ctx.file_ids.lock().id_for(name);
                Ok(ResolvedChild::File { file_id })
            }
            NameOutcome::Entry(EntryKind::Tag) => {
                let mut child_pos = pos.clone();
                let mut child_neg = neg.clone();
                resolve::apply_token(&tdb, name, &mut child_pos, &mut child_neg)?;
                let node_id =
                    self.ctx
                        .nodes
                        .lock()
                        .child(parent_node, name, child_pos, child_neg, cap);
                Ok(ResolvedChild::Dir { node_id })
            }
            NameOutcome::ExistsUntracked | NameOutcome::Absent => Err(TagfsError::NotFound),
        }
    }

    fn file_name(&self, file_id: u32) -> Option<String> {
        self.ctx.file_ids.lock().name_of(file_id).map(str::to_string)
    }

    fn file_attr(&self, ino: Ino, name: &str) -> Result<FileAttr> {
        let mut attr = self.ctx.backing.stat(name)?;
        attr.ino = ino.0;
        Ok(attr)
    }

    fn dir_attr(&self, ino: Ino) -> Result<FileAttr> {
        let mut attr = self.ctx.backing.stat_root()?;
        attr.ino = ino.0;
        Ok(attr)
    }

    /// Core of `mknod`: creates a new file entry under `parent_ino`,
    /// copying the parent query's positive mask onto its initial tags.
    fn do_mknod(&self, parent_ino: Ino, name: &str, mode: u32) -> Result<(Ino, FileAttr)> {
        if resolve::is_reserved_name(name) || name.starts_with('-') {
            return Err(TagfsError::InvalidArgument);
        }

        let cap = { self.ctx.tdb.read().tag_capacity() };
        let (pos, _neg) = self.parent_masks(parent_ino.node_id(), cap);

        let mut tdb = self.ctx.tdb.write();
        if tdb.contains(name) || self.ctx.backing.exists(name)? {
            return Err(TagfsError::AlreadyExists);
        }

        let entry = tdb.try_insert(name, EntryKind::File);
        let crate::tagdb::TryInsert::Inserted(e) = entry else {
            return Err(TagfsError::AlreadyExists);
        };
        if let Entry::File { file_tags } = e {
            file_tags.copy_from(cap, &pos);
        }

        if let Err(e) = self.ctx.backing.create(name, mode) {
            tdb.remove(name);
            return Err(e);
        }
        drop(tdb);

        let file_id = self.ctx.file_ids.lock().id_for(name);
        let ino = Ino::file(parent_ino.node_id(), file_id);
        let attr = self.file_attr(ino, name)?;
        Ok((ino, attr))
    }

    /// Core of `mkdir`: creates a new tag, requiring the caller's mode to
    /// match the backing root's own permission bits (there is nothing else
    /// for a virtual tag directory's mode to mean).
    fn do_mkdir(&self, parent_ino: Ino, name: &str, mode: u32) -> Result<(Ino, FileAttr)> {
        let root_mode = self.ctx.backing.stat_root()?.perm as u32;
        if mode & 0o777 != root_mode & 0o777 {
            return Err(TagfsError::NotSupported);
        }
        if resolve::is_reserved_name(name) || name.starts_with('-') {
            return Err(TagfsError::InvalidArgument);
        }
        if self.ctx.config.is_blocked_trash_name(name) {
            return Err(TagfsError::InvalidArgument);
        }

        let mut tdb = self.ctx.tdb.write();
        if tdb.contains(name) || self.ctx.backing.exists(name)? {
            return Err(TagfsError::AlreadyExists);
        }
        tdb.insert(name, EntryKind::Tag);
        drop(tdb);

        let cap = self.ctx.tdb.read().tag_capacity();
        let (pos, neg) = self.parent_masks(parent_ino.node_id(), cap);
        let tdb = self.ctx.tdb.read();
        let mut child_pos = pos;
        let mut child_neg = neg;
        resolve::apply_token(&tdb, name, &mut child_pos, &mut child_neg)?;
        let node_id =
            self.ctx
                .nodes
                .lock()
                .child(parent_ino.node_id(), name, child_pos, child_neg, cap);
        drop(tdb);

        let ino = Ino::dir(node_id);
        let attr = self.dir_attr(ino)?;
        Ok((ino, attr))
    }

    /// Core of `unlink`: removes a file's TDB entry and its backing bytes.
    fn do_unlink(&self, parent_ino: Ino, name: &str) -> Result<()> {
        let resolved = self.resolve_child(parent_ino.node_id(), name)?;
        let ResolvedChild::File { .. } = resolved else {
            return Err(TagfsError::IsADirectory);
        };

        let mut tdb = self.ctx.tdb.write();
        tdb.remove(name);
        drop(tdb);

        self.ctx.backing.remove_file(name)?;
        Ok(())
    }

    /// Core of `rmdir`: removes a tag's TDB entry. There is no backing
    /// directory to remove, since tag directories are purely virtual.
    fn do_rmdir(&self, parent_ino: Ino, name: &str) -> Result<()> {
        let resolved = self.resolve_child(parent_ino.node_id(), name)?;
        let ResolvedChild::Dir { .. } = resolved else {
            return Err(TagfsError::NotADirectory);
        };

        let mut tdb = self.ctx.tdb.write();
        tdb.remove(name);
        Ok(())
    }

    /// Core of `rename`. Moving a file into a different query directory
    /// re-tags it per `config.relative_rename`; moving a tag directory
    /// only renames the tag's own TDB entry.
    fn do_rename(
        &self,
        parent_ino: Ino,
        name: &str,
        newparent_ino: Ino,
        newname: &str,
    ) -> Result<()> {
        let resolved = self.resolve_child(parent_ino.node_id(), name)?;
        let cap = self.ctx.tdb.read().tag_capacity();
        let (new_pos, new_neg) = self.parent_masks(newparent_ino.node_id(), cap);

        let mut tdb = self.ctx.tdb.write();

        match resolved {
            ResolvedChild::File { .. } => {
                if let Some(e) = tdb.get_mut(name) {
                    if let Entry::File { file_tags } = e {
                        if self.ctx.config.relative_rename {
                            if new_pos.all(cap, false) && new_neg.all(cap, false) {
                                file_tags.fill(cap, false);
                            } else {
                                file_tags.merge(cap, &new_pos, &new_neg);
                            }
                        } else {
                            file_tags.copy_from(cap, &new_pos);
                        }
                    }
                }

                if name != newname {
                    self.ctx.backing.rename(name, newname)?;
                }
            }
            ResolvedChild::Dir { .. } => {}
        }

        if name != newname {
            match tdb.rename(name, newname) {
                Ok(crate::tagdb::RenameOutcome::Moved) => {
                    self.ctx.file_ids.lock().rename(name, newname);
                }
                Ok(crate::tagdb::RenameOutcome::AlreadyExists) => {
                    return Err(TagfsError::AlreadyExists);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    /// Core of `readdir`: the full `(ino, kind, name)` listing including
    /// `.`/`..`, with dotted/negated tag-derived entries computed the same
    /// way regardless of whether the caller is the real FUSE loop or a
    /// test harness driving this directly.
    fn do_readdir(&self, ino: Ino) -> Result<Vec<(u64, FileType, String)>> {
        if !ino.is_dir() {
            return Err(TagfsError::NotADirectory);
        }
        let node_id = ino.node_id();

        let cap = { self.ctx.tdb.read().tag_capacity() };
        let (pos, neg) = self.parent_masks(node_id, cap);
        let parent_node = self.ctx.nodes.lock().parent_of(node_id);

        let tdb = self.ctx.tdb.read();
        let any_pos = pos.any(cap, true);
        let mut dirmask = Bitset::new(cap);
        let mut file_names: Vec<String> = Vec::new();

        for real_name in self.ctx.backing.list()? {
            if real_name == ".tagdb" || real_name.starts_with(".tagdb.") {
                continue;
            }
            match tdb.get(&real_name) {
                Some(Entry::File { file_tags }) => {
                    if !file_tags.matches(cap, Some(&pos), Some(&neg)) {
                        continue;
                    }
                    dirmask.or_assign(cap, file_tags);
                    file_names.push(real_name);
                }
                Some(Entry::Tag { .. }) => continue,
                None => {
                    if any_pos {
                        continue;
                    }
                    file_names.push(real_name);
                }
            }
        }

        // (display name, extended pos, extended neg) for every tag-derived
        // subdirectory entry to emit, computed while the TDB is still read.
        let mut dir_tokens: Vec<(String, Bitset, Bitset)> = Vec::new();
        for (tag_name, entry) in tdb.iter() {
            let EntryKind::Tag = entry.kind() else { continue };
            let tag_id = entry.tag_id().unwrap();
            if pos.get(tag_id) || neg.get(tag_id) {
                continue;
            }

            let display = if dirmask.get(tag_id) {
                tag_name.to_string()
            } else {
                format!(".{tag_name}")
            };
            let mut dpos = pos.clone();
            let mut dneg = neg.clone();
            if resolve::apply_token(&tdb, &display, &mut dpos, &mut dneg).is_ok() {
                dir_tokens.push((display, dpos, dneg));
            }

            if self.ctx.config.list_negated_tags {
                let negated = format!("-{tag_name}");
                let mut npos = pos.clone();
                let mut nneg = neg.clone();
                if resolve::apply_token(&tdb, &negated, &mut npos, &mut nneg).is_ok() {
                    dir_tokens.push((negated, npos, nneg));
                }
            }
        }
        drop(tdb);

        let mut entries: Vec<(u64, FileType, String)> = vec![
            (ino.0, FileType::Directory, ".".to_string()),
            (Ino::dir(parent_node).0, FileType::Directory, "..".to_string()),
        ];

        {
            let mut file_ids = self.ctx.file_ids.lock();
            for name in file_names {
                let file_id = file_ids.id_for(&name);
                entries.push((Ino::file(node_id, file_id).0, FileType::RegularFile, name));
            }
        }
        {
            let mut nodes = self.ctx.nodes.lock();
            for (name, dpos, dneg) in dir_tokens {
                let child_id = nodes.child(node_id, &name, dpos, dneg, cap);
                entries.push((Ino::dir(child_id).0, FileType::Directory, name));
            }
        }

        Ok(entries)
    }
}

enum ResolvedChild {
    Dir { node_id: u64 },
    File { file_id: u32 },
}

impl Filesystem for TagfsFilesystem {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let name = ok_or_errno!(Self::decode_name(name), reply);
        let parent_ino = Ino(parent);
        if !parent_ino.is_dir() {
            reply.error(libc::ENOTDIR);
            return;
        }

        match ok_or_errno!(self.resolve_child(parent_ino.node_id(), name), reply) {
            ResolvedChild::Dir { node_id } => {
                let ino = Ino::dir(node_id);
                match self.dir_attr(ino) {
                    Ok(attr) => reply.entry(&TTL, &attr, 0),
                    Err(e) => reply.error(e.errno()),
                }
            }
            ResolvedChild::File { file_id } => {
                let ino = Ino::file(parent_ino.node_id(), file_id);
                match self.file_attr(ino, name) {
                    Ok(attr) => reply.entry(&TTL, &attr, 0),
                    Err(e) => reply.error(e.errno()),
                }
            }
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        let ino = Ino(ino);
        if ino.is_dir() {
            match self.dir_attr(ino) {
                Ok(attr) => reply.attr(&TTL, &attr),
                Err(e) => reply.error(e.errno()),
            }
            return;
        }

        let Some(name) = self.file_name(ino.file_id()) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.file_attr(ino, &name) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let ino = Ino(ino);
        if ino.is_dir() {
            reply.error(libc::ENOTSUP);
            return;
        }
        let Some(name) = self.file_name(ino.file_id()) else {
            reply.error(libc::ENOENT);
            return;
        };

        let _guard = self.ctx.tdb.write();

        if let Some(size) = size {
            if let Err(e) = self.ctx.backing.open(&name, true).and_then(|f| f.truncate(size)) {
                reply.error(e.errno());
                return;
            }
        }
        if atime.is_some() || mtime.is_some() {
            let now = SystemTime::now();
            let resolve_time = |t: Option<TimeOrNow>| match t {
                Some(TimeOrNow::SpecificTime(t)) => t,
                Some(TimeOrNow::Now) | None => now,
            };
            let at = to_timespec(resolve_time(atime));
            let mt = to_timespec(resolve_time(mtime));
            if let Err(e) = self.ctx.backing.set_times(&name, at, mt) {
                reply.error(e.errno());
                return;
            }
        }
        if let Some(mode) = mode {
            if let Err(e) = self.ctx.backing.chmod(&name, mode) {
                reply.error(e.errno());
                return;
            }
        }

        match self.file_attr(ino, &name) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        let name = ok_or_errno!(Self::decode_name(name), reply);
        let parent_ino = Ino(parent);
        match self.do_mknod(parent_ino, name, mode) {
            Ok((_ino, attr)) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let name = ok_or_errno!(Self::decode_name(name), reply);
        let parent_ino = Ino(parent);
        match self.do_mkdir(parent_ino, name, mode) {
            Ok((_ino, attr)) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = ok_or_errno!(Self::decode_name(name), reply);
        let parent_ino = Ino(parent);
        match self.do_unlink(parent_ino, name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = ok_or_errno!(Self::decode_name(name), reply);
        let parent_ino = Ino(parent);
        match self.do_rmdir(parent_ino, name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let name = ok_or_errno!(Self::decode_name(name), reply);
        let newname = ok_or_errno!(Self::decode_name(newname), reply);
        let parent_ino = Ino(parent);
        let newparent_ino = Ino(newparent);
        match self.do_rename(parent_ino, name, newparent_ino, newname) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let ino = Ino(ino);
        if ino.is_dir() {
            reply.error(libc::EISDIR);
            return;
        }
        let Some(name) = self.file_name(ino.file_id()) else {
            reply.error(libc::ENOENT);
            return;
        };

        let _guard = self.ctx.tdb.read();
        let write = flags & (libc::O_WRONLY | libc::O_RDWR) != 0;
        match self.ctx.backing.open(&name, write) {
            Ok(file) => {
                let fh = self.ctx.handles.insert(file);
                reply.opened(fh.0, 0);
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let _guard = self.ctx.tdb.read();
        let result = self
            .ctx
            .handles
            .with(FileHandle(fh), |h| h.file.read_at(offset as u64, size));
        match result {
            Some(Ok(data)) => reply.data(&data),
            Some(Err(e)) => reply.error(e.errno()),
            None => reply.error(libc::EBADF),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let _guard = self.ctx.tdb.write();
        let result = self
            .ctx
            .handles
            .with(FileHandle(fh), |h| h.file.write_at(offset as u64, data));
        match result {
            Some(Ok(n)) => reply.written(n),
            Some(Err(e)) => reply.error(e.errno()),
            None => reply.error(libc::EBADF),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        self.ctx.handles.remove(FileHandle(fh));
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _datasync: bool, reply: ReplyEmpty) {
        let _guard = self.ctx.tdb.write();
        match self.ctx.handles.with(FileHandle(fh), |h| h.file.sync()) {
            Some(Ok(())) => reply.ok(),
            Some(Err(e)) => reply.error(e.errno()),
            None => reply.error(libc::EBADF),
        }
        self.flush_or_log();
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let ino = Ino(ino);
        if !ino.is_dir() {
            reply.error(libc::ENOTDIR);
            return;
        }
        reply.opened(0, 0);
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        reply.ok();
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let entries = match self.do_readdir(Ino(ino)) {
            Ok(entries) => entries,
            Err(e) => {
                reply.error(e.errno());
                return;
            }
        };

        for (i, (entry_ino, kind, name)) in entries.into_iter().enumerate().skip(offset as usize) {
            if reply.add(entry_ino, (i + 1) as i64, kind, &name) {
                break;
            }
        }
        reply.ok();
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        size: u32,
        reply: ReplyXattr,
    ) {
        let ino = Ino(ino);
        if ino.is_dir() {
            reply.error(libc::ENOTSUP);
            return;
        }
        let Some(file_name) = self.file_name(ino.file_id()) else {
            reply.error(libc::ENOENT);
            return;
        };
        let _guard = self.ctx.tdb.read();
        let path = self.ctx.backing.root().join(&file_name);
        match xattr::get(&path, name) {
            Ok(Some(value)) => {
                if size == 0 {
                    reply.size(value.len() as u32);
                } else if (value.len() as u32) > size {
                    reply.error(libc::ERANGE);
                } else {
                    reply.data(&value);
                }
            }
            Ok(None) => reply.error(libc::ENODATA),
            Err(e) => reply.error(e.raw_os_error().unwrap_or(libc::EIO)),
        }
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let ino = Ino(ino);
        if ino.is_dir() {
            reply.error(libc::ENOTSUP);
            return;
        }
        let Some(file_name) = self.file_name(ino.file_id()) else {
            reply.error(libc::ENOENT);
            return;
        };
        let _guard = self.ctx.tdb.write();
        let path = self.ctx.backing.root().join(&file_name);
        match xattr::set(&path, name, value) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.raw_os_error().unwrap_or(libc::EIO)),
        }
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        let ino = Ino(ino);
        if ino.is_dir() {
            reply.error(libc::ENOTSUP);
            return;
        }
        let Some(file_name) = self.file_name(ino.file_id()) else {
            reply.error(libc::ENOENT);
            return;
        };
        let _guard = self.ctx.tdb.read();
        let path = self.ctx.backing.root().join(&file_name);
        match xattr::list(&path) {
            Ok(names) => {
                let mut buf = Vec::new();
                for n in names {
                    buf.extend_from_slice(n.as_encoded_bytes());
                    buf.push(0);
                }
                if size == 0 {
                    reply.size(buf.len() as u32);
                } else if (buf.len() as u32) > size {
                    reply.error(libc::ERANGE);
                } else {
                    reply.data(&buf);
                }
            }
            Err(e) => reply.error(e.raw_os_error().unwrap_or(libc::EIO)),
        }
    }

    fn removexattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        let ino = Ino(ino);
        if ino.is_dir() {
            reply.error(libc::ENOTSUP);
            return;
        }
        let Some(file_name) = self.file_name(ino.file_id()) else {
            reply.error(libc::ENOENT);
            return;
        };
        let _guard = self.ctx.tdb.write();
        let path = self.ctx.backing.root().join(&file_name);
        match xattr::remove(&path, name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.raw_os_error().unwrap_or(libc::EIO)),
        }
    }

    fn destroy(&mut self) {
        if let Err(e) = self.ctx.flush() {
            error!("failed to flush sidecar on unmount: {e}");
        }
    }
}

fn to_timespec(t: SystemTime) -> libc::timespec {
    match t.duration_since(SystemTime::UNIX_EPOCH) {
        Ok(d) => libc::timespec {
            tv_sec: d.as_secs() as i64,
            tv_nsec: d.subsec_nanos() as i64,
        },
        Err(_) => libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn harness() -> (tempfile::TempDir, TagfsFilesystem) {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _) = MountContext::open(dir.path(), Config::default()).unwrap();
        let fsx = TagfsFilesystem::new(Arc::new(ctx));
        (dir, fsx)
    }

    fn root_mode(fsx: &TagfsFilesystem) -> u32 {
        fsx.ctx.backing.stat_root().unwrap().perm as u32
    }

    fn names_in(entries: &[(u64, FileType, String)]) -> Vec<&str> {
        entries.iter().map(|(_, _, n)| n.as_str()).collect()
    }

    #[test]
    fn create_tag_and_list_surfaces_the_file_under_its_tag() {
        let (_dir, fsx) = harness();
        let mode = root_mode(&fsx);

        let (tag_ino, _) = fsx.do_mkdir(Ino::ROOT, "red", mode).unwrap();
        fsx.do_mknod(Ino::ROOT, "a", 0o644).unwrap();
        fsx.do_rename(Ino::ROOT, "a", tag_ino, "a").unwrap();

        let entries = fsx.do_readdir(tag_ino).unwrap();
        assert!(names_in(&entries).contains(&"a"));

        // still visible at the root, now displayed with "red" undotted
        // because a file matches it.
        let root_entries = fsx.do_readdir(Ino::ROOT).unwrap();
        assert!(names_in(&root_entries).contains(&"red"));
    }

    #[test]
    fn negated_tag_directory_hides_tagged_files() {
        let (_dir, fsx) = harness();
        let mode = root_mode(&fsx);

        let (tag_ino, _) = fsx.do_mkdir(Ino::ROOT, "red", mode).unwrap();
        fsx.do_mknod(Ino::ROOT, "tagged", 0o644).unwrap();
        fsx.do_mknod(Ino::ROOT, "plain", 0o644).unwrap();
        fsx.do_rename(Ino::ROOT, "tagged", tag_ino, "tagged").unwrap();

        let root_entries = fsx.do_readdir(Ino::ROOT).unwrap();
        let (neg_ino, _, _) = root_entries
            .iter()
            .find(|(_, kind, name)| *kind == FileType::Directory && name == "-red")
            .expect("negated tag entry must be listed");
        let neg_ino = Ino(*neg_ino);

        let negated_entries = fsx.do_readdir(neg_ino).unwrap();
        let names = names_in(&negated_entries);
        assert!(names.contains(&"plain"));
        assert!(!names.contains(&"tagged"));
    }

    #[test]
    fn tag_with_no_matching_file_is_listed_dotted() {
        let (_dir, fsx) = harness();
        let mode = root_mode(&fsx);

        fsx.do_mkdir(Ino::ROOT, "blue", mode).unwrap();
        let entries = fsx.do_readdir(Ino::ROOT).unwrap();
        assert!(names_in(&entries).contains(&".blue"));
    }

    #[test]
    fn mkdir_over_an_existing_file_name_is_rejected() {
        let (_dir, fsx) = harness();
        let mode = root_mode(&fsx);

        fsx.do_mknod(Ino::ROOT, "shadow", 0o644).unwrap();
        let err = fsx.do_mkdir(Ino::ROOT, "shadow", mode).unwrap_err();
        assert!(matches!(err, TagfsError::AlreadyExists));
    }

    #[test]
    fn rmdir_removes_the_tag_entry() {
        let (_dir, fsx) = harness();
        let mode = root_mode(&fsx);

        let (tag_ino, _) = fsx.do_mkdir(Ino::ROOT, "red", mode).unwrap();
        fsx.do_rmdir(Ino::ROOT, "red").unwrap();
        assert!(fsx.ctx.tdb.read().get("red").is_none());
        let _ = tag_ino;
    }

    #[test]
    fn unlink_removes_the_file_entry_and_backing_bytes() {
        let (dir, fsx) = harness();
        fsx.do_mknod(Ino::ROOT, "a", 0o644).unwrap();
        fsx.do_unlink(Ino::ROOT, "a").unwrap();
        assert!(fsx.ctx.tdb.read().get("a").is_none());
        assert!(!dir.path().join("a").exists());
    }
}
