//! Thin accessor over the real backing directory that holds file content
//! and the `.tagdb` sidecar. Ground: teacher's `ExternalFS` in
//! `fs/backing.rs`, generalized to the richer file-handle and xattr
//! surface SPEC_FULL.md §4.5 needs, and to offset-addressed I/O via `nix`.

use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use fuser::{FileAttr, FileType};
use nix::unistd;

use crate::error::{Result, TagfsError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RealKind {
    Regular,
    Directory,
    Other,
}

/// Handle to an in-progress open against the backing directory. Lives on a
/// FUSE callback's opaque file-handle cookie for the lifetime of the
/// Open state in the per-open state machine (spec.md §4.5).
#[derive(Debug)]
pub struct OpenFile {
    file: File,
}

pub struct BackingDir {
    root: PathBuf,
}

impl BackingDir {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn join(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// `None` if no entry of any kind exists at that name.
    pub fn real_kind(&self, name: &str) -> Result<Option<RealKind>> {
        match fs::symlink_metadata(self.join(name)) {
            Ok(md) => {
                let ft = md.file_type();
                Ok(Some(if ft.is_dir() {
                    RealKind::Directory
                } else if ft.is_file() {
                    RealKind::Regular
                } else {
                    RealKind::Other
                }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.real_kind(name)?.is_some())
    }

    /// Lists every regular-or-other directory entry name, skipping `.` and
    /// `..`. Directories other than the backing root itself are rejected
    /// by the integrity check, not filtered here.
    pub fn list(&self) -> Result<Vec<String>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            out.push(entry.file_name().to_string_lossy().into_owned());
        }
        Ok(out)
    }

    pub fn stat_root(&self) -> Result<FileAttr> {
        let md = fs::metadata(&self.root)?;
        Ok(metadata_to_attr(&md, FileType::Directory))
    }

    pub fn stat(&self, name: &str) -> Result<FileAttr> {
        let md = fs::symlink_metadata(self.join(name))?;
        Ok(metadata_to_attr(&md, FileType::RegularFile))
    }

    pub fn create(&self, name: &str, mode: u32) -> Result<()> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.join(name))?;
        file.set_permissions(fs::Permissions::from_mode(mode & 0o7777))?;
        Ok(())
    }

    pub fn remove_file(&self, name: &str) -> Result<()> {
        fs::remove_file(self.join(name))?;
        Ok(())
    }

    pub fn rename(&self, old_name: &str, new_name: &str) -> Result<()> {
        fs::rename(self.join(old_name), self.join(new_name))?;
        Ok(())
    }

    pub fn open(&self, name: &str, write: bool) -> Result<OpenFile> {
        let file = OpenOptions::new()
            .read(true)
            .write(write)
            .create(write)
            .open(self.join(name))?;
        Ok(OpenFile { file })
    }

    pub fn chmod(&self, name: &str, mode: u32) -> Result<()> {
        fs::set_permissions(self.join(name), fs::Permissions::from_mode(mode & 0o7777))?;
        Ok(())
    }

    pub fn set_times(&self, name: &str, atime: libc::timespec, mtime: libc::timespec) -> Result<()> {
        use nix::sys::stat::{utimensat, UtimensatFlags};
        use nix::sys::time::TimeSpec;
        utimensat(
            None,
            &self.join(name),
            &TimeSpec::new(atime.tv_sec, atime.tv_nsec),
            &TimeSpec::new(mtime.tv_sec, mtime.tv_nsec),
            UtimensatFlags::NoFollowSymlink,
        )
        .map_err(|e| TagfsError::IoError(std::io::Error::from_raw_os_error(e as i32)))?;
        Ok(())
    }

    /// Copies the sidecar content out for the timestamped backup that the
    /// integrity check triggers on `Repaired`.
    pub fn read_file(&self, name: &str) -> Result<Vec<u8>> {
        Ok(fs::read(self.join(name))?)
    }

    pub fn write_file(&self, name: &str, data: &[u8]) -> Result<()> {
        Ok(fs::write(self.join(name), data)?)
    }
}

impl OpenFile {
    pub fn read_at(&self, offset: u64, size: u32) -> Result<Vec<u8>> {
        use std::os::unix::io::AsRawFd;
        let mut buf = vec![0u8; size as usize];
        let n = unistd::pread(self.file.as_raw_fd(), &mut buf, offset as i64)
            .map_err(|e| TagfsError::IoError(std::io::Error::from_raw_os_error(e as i32)))?;
        buf.truncate(n);
        Ok(buf)
    }

    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<u32> {
        use std::os::unix::io::AsRawFd;
        let n = unistd::pwrite(self.file.as_raw_fd(), data, offset as i64)
            .map_err(|e| TagfsError::IoError(std::io::Error::from_raw_os_error(e as i32)))?;
        Ok(n as u32)
    }

    pub fn truncate(&self, len: u64) -> Result<()> {
        self.file.set_len(len)?;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    pub fn attr(&self) -> Result<FileAttr> {
        let md = self.file.metadata()?;
        Ok(metadata_to_attr(&md, FileType::RegularFile))
    }
}

fn metadata_to_attr(md: &fs::Metadata, kind: FileType) -> FileAttr {
    use std::time::UNIX_EPOCH;
    let to_time = |secs: i64, nanos: i64| {
        if secs >= 0 {
            UNIX_EPOCH + std::time::Duration::new(secs as u64, nanos as u32)
        } else {
            UNIX_EPOCH
        }
    };
    FileAttr {
        ino: md.ino(),
        size: md.size(),
        blocks: md.blocks(),
        atime: to_time(md.atime(), md.atime_nsec()),
        mtime: to_time(md.mtime(), md.mtime_nsec()),
        ctime: to_time(md.ctime(), md.ctime_nsec()),
        crtime: UNIX_EPOCH,
        kind,
        perm: md.permissions().mode() as u16,
        nlink: md.nlink() as u32,
        uid: md.uid(),
        gid: md.gid(),
        rdev: md.rdev() as u32,
        blksize: md.blksize() as u32,
        flags: 0,
    }
}
