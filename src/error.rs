//! Error kinds surfaced by the tag database and resolver, and the mapping
//! from each kind to the FUSE/kernel negative-errno convention used at the
//! filesystem operation boundary (ground: teacher's `err!` macro in
//! `fs/tag.rs`, generalized into an explicit, testable mapping).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TagfsError {
    #[error("no such entry")]
    NotFound,
    #[error("entry already exists")]
    AlreadyExists,
    #[error("entry is a directory")]
    IsADirectory,
    #[error("entry is not a directory")]
    NotADirectory,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("operation not supported")]
    NotSupported,
    #[error("out of memory")]
    OutOfMemory,
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("tag database is corrupt: {0}")]
    Corrupt(String),
    #[error("name conflicts with an existing file or tag")]
    Conflict,
}

impl TagfsError {
    /// Maps this error kind to the negative-errno value a FUSE callback
    /// should hand back to `ReplyError::error`.
    pub fn errno(&self) -> i32 {
        match self {
            TagfsError::NotFound => libc::ENOENT,
            TagfsError::AlreadyExists => libc::EEXIST,
            TagfsError::IsADirectory => libc::EISDIR,
            TagfsError::NotADirectory => libc::ENOTDIR,
            TagfsError::InvalidArgument => libc::EINVAL,
            TagfsError::NotSupported => libc::ENOTSUP,
            TagfsError::OutOfMemory => libc::ENOMEM,
            TagfsError::IoError(e) => e.raw_os_error().unwrap_or(libc::EIO),
            TagfsError::Corrupt(_) => libc::EIO,
            TagfsError::Conflict => libc::EEXIST,
        }
    }
}

pub type Result<T> = std::result::Result<T, TagfsError>;
