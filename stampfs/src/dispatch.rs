//! Path-based filesystem handlers.
//!
//! Each handler takes a virtual path, reports itself to the observer, resolves the path once
//! and calls one OS primitive. `create` is the exception and goes through
//! [`VersionedCreator`]. OS failures come back as [`StampFsError`] carrying the original errno.

use std::ffi::OsString;
use std::fs::{self, DirBuilder, OpenOptions, Permissions};
use std::io;
use std::os::unix::fs::{DirBuilderExt, FileExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use nix::sys::stat::{Mode, SFlag, UtimensatFlags};
use nix::sys::time::TimeSpec;
use nix::unistd::{AccessFlags, Gid, Uid};

use crate::error::{Result, StampFsError};
use crate::handles::HandleTable;
use crate::observe::{OpObserver, TracingObserver};
use crate::resolver::PathResolver;
use crate::types::{Attr, Created, DirEntry, FsStat};
use crate::versioned::{VersionedCreator, relink_target};

pub struct Dispatcher {
    resolver: PathResolver,
    creator: VersionedCreator,
    handles: HandleTable,
    observer: Arc<dyn OpObserver>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("root", &self.resolver.root())
            .field("open_handles", &self.handles.len())
            .finish()
    }
}

fn nix_err(op: &'static str, path: &Path, e: nix::errno::Errno) -> StampFsError {
    StampFsError::io(op, path, io::Error::from(e))
}

/// `None` leaves the field alone. Pre-epoch times clamp to the epoch.
fn time_spec(t: Option<SystemTime>) -> TimeSpec {
    match t {
        Some(t) => TimeSpec::from(t.duration_since(UNIX_EPOCH).unwrap_or_default()),
        None => TimeSpec::UTIME_OMIT,
    }
}

/// Replace `to` with a fresh link to `target` in one rename, then drop `from`.
fn move_link(from: &Path, to: &Path, target: &Path) -> Result<()> {
    let mut staged = OsString::from(".stampfs-relink-");
    staged.push(to.file_name().unwrap_or_default());
    let staged = to.with_file_name(staged);
    std::os::unix::fs::symlink(target, &staged)
        .map_err(|e| StampFsError::io("symlink", &staged, e))?;
    if let Err(e) = fs::rename(&staged, to) {
        let _ = fs::remove_file(&staged);
        return Err(StampFsError::io("rename", from, e));
    }
    tracing::debug!(
        from = %from.display(),
        to = %to.display(),
        target = %target.display(),
        "relinked moved version link"
    );
    fs::remove_file(from).map_err(|e| StampFsError::io("rename", from, e))
}

impl Dispatcher {
    pub fn new(resolver: PathResolver, creator: VersionedCreator) -> Self {
        Self {
            resolver,
            creator,
            handles: HandleTable::new(),
            observer: Arc::new(TracingObserver),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn OpObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn resolver(&self) -> &PathResolver {
        &self.resolver
    }

    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    pub fn access(&self, path: &Path, mask: i32) -> Result<()> {
        self.observer.observe("access", format_args!("{path:?}, {mask:#o}"));
        let real = self.resolver.resolve(path);
        nix::unistd::access(&real, AccessFlags::from_bits_truncate(mask))
            .map_err(|e| nix_err("access", &real, e))
    }

    /// `lstat` of the resolved path: indirection links show up as links.
    pub fn getattr(&self, path: &Path) -> Result<Attr> {
        self.observer.observe("getattr", format_args!("{path:?}"));
        let real = self.resolver.resolve(path);
        let meta = fs::symlink_metadata(&real).map_err(|e| StampFsError::io("stat", &real, e))?;
        Ok(Attr::from(&meta))
    }

    pub fn readdir(&self, path: &Path) -> Result<Vec<DirEntry>> {
        self.observer.observe("readdir", format_args!("{path:?}"));
        let real = self.resolver.resolve(path);

        let mut entries = vec![DirEntry::dot("."), DirEntry::dot("..")];
        if !real.is_dir() {
            return Ok(entries);
        }
        let dir = fs::read_dir(&real).map_err(|e| StampFsError::io("readdir", &real, e))?;
        for entry in dir {
            let entry = entry.map_err(|e| StampFsError::io("readdir", &real, e))?;
            let kind = entry
                .file_type()
                .map_err(|e| StampFsError::io("readdir", entry.path(), e))?;
            entries.push(DirEntry {
                name: entry.file_name(),
                kind: kind.into(),
            });
        }
        Ok(entries)
    }

    pub fn readlink(&self, path: &Path) -> Result<PathBuf> {
        self.observer.observe("readlink", format_args!("{path:?}"));
        let real = self.resolver.resolve(path);
        let target = fs::read_link(&real).map_err(|e| StampFsError::io("readlink", &real, e))?;
        Ok(self.resolver.sanitize_link_target(&target))
    }

    /// `mode` carries the file type bits (`S_IFIFO`, `S_IFCHR`, ...) plus permissions.
    pub fn mknod(&self, path: &Path, mode: u32, rdev: u64) -> Result<()> {
        self.observer.observe("mknod", format_args!("{path:?}, {mode:#o}, {rdev}"));
        let real = self.resolver.resolve(path);
        let kind = SFlag::from_bits_truncate((mode & libc::S_IFMT) as libc::mode_t);
        let perm = Mode::from_bits_truncate((mode & !libc::S_IFMT) as libc::mode_t);
        nix::sys::stat::mknod(&real, kind, perm, rdev as libc::dev_t)
            .map_err(|e| nix_err("mknod", &real, e))
    }

    pub fn mkdir(&self, path: &Path, mode: u32) -> Result<()> {
        self.observer.observe("mkdir", format_args!("{path:?}, {mode:#o}"));
        let real = self.resolver.resolve(path);
        DirBuilder::new()
            .mode(mode)
            .create(&real)
            .map_err(|e| StampFsError::io("mkdir", &real, e))
    }

    pub fn rmdir(&self, path: &Path) -> Result<()> {
        self.observer.observe("rmdir", format_args!("{path:?}"));
        let real = self.resolver.resolve(path);
        fs::remove_dir(&real).map_err(|e| StampFsError::io("rmdir", &real, e))
    }

    pub fn statfs(&self, path: &Path) -> Result<FsStat> {
        self.observer.observe("statfs", format_args!("{path:?}"));
        let real = self.resolver.resolve(path);
        let st = nix::sys::statvfs::statvfs(&real).map_err(|e| nix_err("statfs", &real, e))?;
        Ok(FsStat::from(&st))
    }

    pub fn unlink(&self, path: &Path) -> Result<()> {
        self.observer.observe("unlink", format_args!("{path:?}"));
        let real = self.resolver.resolve(path);
        fs::remove_file(&real).map_err(|e| StampFsError::io("unlink", &real, e))
    }

    /// Both ends go through the resolver, so the stored target is absolute in the backing store.
    /// `readlink` turns it back into a root-relative path.
    pub fn symlink(&self, target: &Path, name: &Path) -> Result<()> {
        self.observer.observe("symlink", format_args!("{target:?}, {name:?}"));
        let real_target = self.resolver.resolve(target);
        let real_name = self.resolver.resolve(name);
        std::os::unix::fs::symlink(&real_target, &real_name)
            .map_err(|e| StampFsError::io("symlink", &real_name, e))
    }

    /// Plain `rename(2)`, except for an indirection link that changes depth: that one is
    /// recreated at `new` with a target that still reaches its version directory.
    pub fn rename(&self, old: &Path, new: &Path) -> Result<()> {
        self.observer.observe("rename", format_args!("{old:?}, {new:?}"));
        let from = self.resolver.resolve(old);
        let to = self.resolver.resolve(new);
        if let Ok(target) = fs::read_link(&from)
            && let Some(relinked) = relink_target(&target, old, new)
        {
            return move_link(&from, &to, &relinked);
        }
        fs::rename(&from, &to).map_err(|e| StampFsError::io("rename", &from, e))
    }

    pub fn link(&self, target: &Path, name: &Path) -> Result<()> {
        self.observer.observe("link", format_args!("{target:?}, {name:?}"));
        let real_target = self.resolver.resolve(target);
        let real_name = self.resolver.resolve(name);
        fs::hard_link(&real_target, &real_name)
            .map_err(|e| StampFsError::io("link", &real_name, e))
    }

    pub fn chmod(&self, path: &Path, mode: u32) -> Result<()> {
        self.observer.observe("chmod", format_args!("{path:?}, {mode:#o}"));
        let real = self.resolver.resolve(path);
        fs::set_permissions(&real, Permissions::from_mode(mode & 0o7777))
            .map_err(|e| StampFsError::io("chmod", &real, e))
    }

    /// `None` (or `u32::MAX`, the kernel's "unchanged") leaves that id alone.
    pub fn chown(&self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
        self.observer.observe("chown", format_args!("{path:?}, {uid:?}, {gid:?}"));
        let real = self.resolver.resolve(path);
        let uid = uid.filter(|u| *u != u32::MAX).map(Uid::from_raw);
        let gid = gid.filter(|g| *g != u32::MAX).map(Gid::from_raw);
        nix::unistd::chown(&real, uid, gid).map_err(|e| nix_err("chown", &real, e))
    }

    /// Set access and modification times. Both `None` means "now", like `utime(path, NULL)`.
    pub fn utimens(
        &self,
        path: &Path,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> Result<()> {
        self.observer.observe("utimens", format_args!("{path:?}, {atime:?}, {mtime:?}"));
        let real = self.resolver.resolve(path);
        let (atime, mtime) = match (atime, mtime) {
            (None, None) => (TimeSpec::UTIME_NOW, TimeSpec::UTIME_NOW),
            (a, m) => (time_spec(a), time_spec(m)),
        };
        nix::sys::stat::utimensat(None, &real, &atime, &mtime, UtimensatFlags::FollowSymlink)
            .map_err(|e| nix_err("utimens", &real, e))
    }

    /// Open an existing entry with the caller's `open(2)` flags.
    pub fn open(&self, path: &Path, flags: i32) -> Result<u64> {
        self.observer.observe("open", format_args!("{path:?}, {flags:#o}"));
        let real = self.resolver.resolve(path);
        let accmode = flags & libc::O_ACCMODE;
        let file = OpenOptions::new()
            .read(accmode == libc::O_RDONLY || accmode == libc::O_RDWR)
            .write(accmode == libc::O_WRONLY || accmode == libc::O_RDWR)
            .custom_flags(flags & !libc::O_ACCMODE)
            .open(&real)
            .map_err(|e| StampFsError::io("open", &real, e))?;
        Ok(self.handles.insert(file))
    }

    pub fn create(&self, path: &Path, mode: u32) -> Result<Created> {
        self.observer.observe("create", format_args!("{path:?}, {mode:#o}"));
        let created = self.creator.create(path, mode)?;
        let meta = created
            .file
            .metadata()
            .map_err(|e| StampFsError::io("stat", &created.real_target, e))?;
        let attr = Attr::from(&meta);
        let fh = self.handles.insert(created.file);
        Ok(Created {
            fh,
            stamp: created.stamp,
            real_target: created.real_target,
            link: created.link,
            attr,
        })
    }

    /// Read up to `size` bytes at `offset`. Short only at end of file.
    pub fn read(&self, path: &Path, fh: u64, offset: u64, size: u32) -> Result<Vec<u8>> {
        self.observer.observe("read", format_args!("{path:?}, {size}, {offset}, {fh}"));
        let file = self.handles.get(fh)?;
        let mut buf = vec![0u8; size as usize];
        let mut filled = 0;
        while filled < buf.len() {
            match file.read_at(&mut buf[filled..], offset + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(StampFsError::io("read", path, e)),
            }
        }
        buf.truncate(filled);
        Ok(buf)
    }

    pub fn write(&self, path: &Path, fh: u64, offset: u64, data: &[u8]) -> Result<usize> {
        self.observer.observe(
            "write",
            format_args!("{path:?}, <{} bytes>, {offset}, {fh}", data.len()),
        );
        let file = self.handles.get(fh)?;
        file.write_all_at(data, offset).map_err(|e| StampFsError::io("write", path, e))?;
        Ok(data.len())
    }

    /// Open the resolved path for update and cut it to `length`. The handle is closed on return.
    pub fn truncate(&self, path: &Path, length: u64) -> Result<()> {
        self.observer.observe("truncate", format_args!("{path:?}, {length}"));
        let real = self.resolver.resolve(path);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&real)
            .map_err(|e| StampFsError::io("truncate", &real, e))?;
        file.set_len(length).map_err(|e| StampFsError::io("truncate", &real, e))
    }

    pub fn flush(&self, path: &Path, fh: u64) -> Result<()> {
        self.observer.observe("flush", format_args!("{path:?}, {fh}"));
        let file = self.handles.get(fh)?;
        file.sync_all().map_err(|e| StampFsError::io("flush", path, e))
    }

    pub fn fsync(&self, path: &Path, datasync: bool, fh: u64) -> Result<()> {
        self.observer.observe("fsync", format_args!("{path:?}, {datasync}, {fh}"));
        let file = self.handles.get(fh)?;
        let synced = if datasync {
            file.sync_data()
        } else {
            file.sync_all()
        };
        synced.map_err(|e| StampFsError::io("fsync", path, e))
    }

    pub fn release(&self, path: &Path, fh: u64) -> Result<()> {
        self.observer.observe("release", format_args!("{path:?}, {fh}"));
        self.handles.remove(fh)
    }

    /// Unmount hook. Closes whatever the kernel left open.
    pub fn destroy(&self) {
        self.observer.observe("destroy", format_args!(""));
        let open = self.handles.len();
        if open > 0 {
            tracing::debug!("closing {open} handles left open at unmount");
        }
        self.handles.clear();
    }
}
