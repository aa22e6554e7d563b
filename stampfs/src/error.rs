use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Errors raised by the path-virtualization layer and its handlers.
///
/// Every variant maps onto a single OS errno through [`StampFsError::errno`], which is what the
/// FUSE runtime ultimately reports back to the kernel.
#[derive(Debug, Error)]
pub enum StampFsError {
    /// An OS primitive failed on a resolved backing-store path.
    #[error("{op} {}: {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("bad file handle: {0}")]
    BadHandle(u64),

    #[error("unknown inode: {0}")]
    UnknownInode(u64),

    #[error("virtual path has no file name: {}", .0.display())]
    NoFileName(PathBuf),

    /// Another creation already owns this version directory.
    #[error("version directory already exists: {}", .0.display())]
    VersionCollision(PathBuf),

    #[error("system clock unavailable: {0}")]
    ClockUnavailable(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl StampFsError {
    pub fn io(op: &'static str, path: impl AsRef<Path>, source: io::Error) -> Self {
        Self::Io {
            op,
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Positive errno for this error.
    pub fn errno(&self) -> i32 {
        match self {
            Self::Io { source, .. } => source.raw_os_error().unwrap_or(libc::EIO),
            Self::BadHandle(_) => libc::EBADF,
            Self::UnknownInode(_) => libc::ENOENT,
            Self::NoFileName(_) => libc::EINVAL,
            Self::VersionCollision(_) => libc::EEXIST,
            Self::ClockUnavailable(_) => libc::EIO,
            Self::InvalidConfig(_) => libc::EINVAL,
        }
    }

    /// Signed errno, the convention callback runtimes use for failed handlers.
    pub fn neg_errno(&self) -> i32 {
        -self.errno()
    }
}

impl From<StampFsError> for rfuse3::Errno {
    fn from(e: StampFsError) -> Self {
        e.errno().into()
    }
}

impl From<StampFsError> for io::Error {
    fn from(e: StampFsError) -> Self {
        match e {
            StampFsError::Io { source, .. } => source,
            other => io::Error::from_raw_os_error(other.errno()),
        }
    }
}

pub type Result<T> = std::result::Result<T, StampFsError>;
