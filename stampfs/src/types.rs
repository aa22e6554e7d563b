//! Plain data returned by the dispatcher.

use std::ffi::OsString;
use std::fs::{FileType, Metadata};
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use nix::sys::statvfs::Statvfs;

use crate::stamp::VersionStamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Directory,
    File,
    Symlink,
    NamedPipe,
    CharDevice,
    BlockDevice,
    Socket,
}

impl From<FileType> for EntryKind {
    fn from(ft: FileType) -> Self {
        if ft.is_dir() {
            Self::Directory
        } else if ft.is_symlink() {
            Self::Symlink
        } else if ft.is_fifo() {
            Self::NamedPipe
        } else if ft.is_char_device() {
            Self::CharDevice
        } else if ft.is_block_device() {
            Self::BlockDevice
        } else if ft.is_socket() {
            Self::Socket
        } else {
            Self::File
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: OsString,
    pub kind: EntryKind,
}

impl DirEntry {
    pub(crate) fn dot(name: &str) -> Self {
        Self {
            name: OsString::from(name),
            kind: EntryKind::Directory,
        }
    }
}

/// Attributes of a backing-store entry, as `lstat` reports them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attr {
    pub ino: u64,
    pub kind: EntryKind,
    /// Full `st_mode`, type bits included.
    pub mode: u32,
    pub nlink: u64,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
    pub size: u64,
    pub blocks: u64,
    pub blksize: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

fn unix_time(sec: i64, nsec: i64) -> SystemTime {
    let nsec = nsec.clamp(0, 999_999_999) as u32;
    if sec >= 0 {
        UNIX_EPOCH + Duration::new(sec as u64, nsec)
    } else {
        UNIX_EPOCH - Duration::new(sec.unsigned_abs(), 0) + Duration::new(0, nsec)
    }
}

impl From<&Metadata> for Attr {
    fn from(meta: &Metadata) -> Self {
        Self {
            ino: meta.ino(),
            kind: meta.file_type().into(),
            mode: meta.mode(),
            nlink: meta.nlink(),
            uid: meta.uid(),
            gid: meta.gid(),
            rdev: meta.rdev(),
            size: meta.size(),
            blocks: meta.blocks(),
            blksize: meta.blksize(),
            atime: unix_time(meta.atime(), meta.atime_nsec()),
            mtime: unix_time(meta.mtime(), meta.mtime_nsec()),
            ctime: unix_time(meta.ctime(), meta.ctime_nsec()),
        }
    }
}

/// Filesystem statistics of the backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsStat {
    pub bavail: u64,
    pub bfree: u64,
    pub blocks: u64,
    pub bsize: u64,
    pub favail: u64,
    pub ffree: u64,
    pub files: u64,
    pub flag: u64,
    pub frsize: u64,
    pub namemax: u64,
}

impl From<&Statvfs> for FsStat {
    #[allow(clippy::useless_conversion)]
    fn from(st: &Statvfs) -> Self {
        Self {
            bavail: st.blocks_available().into(),
            bfree: st.blocks_free().into(),
            blocks: st.blocks().into(),
            bsize: st.block_size().into(),
            favail: st.files_available().into(),
            ffree: st.files_free().into(),
            files: st.files().into(),
            flag: st.flags().bits().into(),
            frsize: st.fragment_size().into(),
            namemax: st.name_max().into(),
        }
    }
}

/// Result of a versioned create: the open handle plus where things landed.
#[derive(Debug, Clone)]
pub struct Created {
    pub fh: u64,
    pub stamp: VersionStamp,
    pub real_target: PathBuf,
    pub link: PathBuf,
    pub attr: Attr,
}
