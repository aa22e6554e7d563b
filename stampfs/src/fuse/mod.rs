//! FUSE adapter.
//!
//! Implements rfuse3's inode-based `Filesystem` trait on top of the path-based
//! [`Dispatcher`](crate::dispatch::Dispatcher): each request resolves its inode(s) to virtual
//! paths through the [`InodeTable`], calls the matching handler and converts the answer into
//! an rfuse3 reply. Errors travel as `StampFsError` and turn into the OS errno on the way out.
//!
//! `create` is the one place where the reply does not describe the looked-up name: the kernel
//! insists on a regular file there, so the reply carries the attributes (and inode) of the
//! real file inside the version directory. Once the entry TTL runs out, lookups of the virtual
//! name see the indirection link instead.
pub mod inode;
pub mod mount;

use std::ffi::OsStr;
use std::num::NonZeroU32;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use futures_util::stream::{self, Stream};
use rfuse3::Result as FuseResult;
use rfuse3::raw::reply::{
    DirectoryEntry, DirectoryEntryPlus, FileAttr, ReplyAttr, ReplyCreated, ReplyData,
    ReplyDirectory, ReplyDirectoryPlus, ReplyEntry, ReplyInit, ReplyOpen, ReplyStatFs,
    ReplyWrite,
};
use rfuse3::raw::{Filesystem, Request};
use rfuse3::{FileType as FuseFileType, SetAttr, Timestamp};

use crate::config::MountConfig;
use crate::dispatch::Dispatcher;
use crate::error::Result;
use crate::observe::TracingObserver;
use crate::resolver::PathResolver;
use crate::stamp::StampGenerator;
use crate::types::{Attr, DirEntry, EntryKind};
use crate::versioned::VersionedCreator;
use inode::{InodeTable, UNKNOWN_INODE};

const TTL: Duration = Duration::from_secs(1);
const MAX_WRITE: u32 = 1024 * 1024;

#[derive(Debug)]
pub struct StampFuse {
    dispatcher: Dispatcher,
    inodes: InodeTable,
    ttl: Duration,
}

impl StampFuse {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            dispatcher,
            inodes: InodeTable::new(),
            ttl: TTL,
        }
    }

    /// Wire resolver, stamp generator, creator and dispatcher for a validated mount config.
    pub fn from_config(config: &MountConfig) -> Result<Self> {
        let resolver = PathResolver::new(&config.root);
        let stamps = StampGenerator::new()?;
        let creator =
            VersionedCreator::new(resolver.clone(), stamps).keep_partial(config.keep_partial);
        let dispatcher = Dispatcher::new(resolver, creator)
            .with_observer(std::sync::Arc::new(TracingObserver));
        Ok(Self::new(dispatcher))
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    fn entry(&self, path: &Path) -> FuseResult<ReplyEntry> {
        let attr = self.dispatcher.getattr(path)?;
        let ino = self.inodes.lookup(path);
        Ok(ReplyEntry {
            ttl: self.ttl,
            attr: fuse_attr(ino, &attr),
            generation: 0,
        })
    }

    /// Listing of `ino`, `.` and `..` first. Children carry the inode the table already knows
    /// (`None` otherwise); nothing is allocated here.
    fn listing(&self, ino: u64) -> FuseResult<(PathBuf, Vec<(Option<u64>, DirEntry)>)> {
        let path = self.inodes.path_of(ino)?;
        let entries = self.dispatcher.readdir(&path)?;
        let parent = self.inodes.parent_of(ino);
        let entries = entries
            .into_iter()
            .map(|e| {
                let child = match e.name.as_bytes() {
                    b"." => Some(ino),
                    b".." => Some(parent),
                    _ => self.inodes.find(&path.join(&e.name)),
                };
                (child, e)
            })
            .collect();
        Ok((path, entries))
    }
}

impl Filesystem for StampFuse {
    type DirEntryStream<'a>
        = Pin<Box<dyn Stream<Item = FuseResult<DirectoryEntry>> + Send + 'a>>
    where
        Self: 'a;

    type DirEntryPlusStream<'a>
        = Pin<Box<dyn Stream<Item = FuseResult<DirectoryEntryPlus>> + Send + 'a>>
    where
        Self: 'a;

    async fn init(&self, _req: Request) -> FuseResult<ReplyInit> {
        let max_write = NonZeroU32::new(MAX_WRITE).unwrap_or(NonZeroU32::MIN);
        Ok(ReplyInit { max_write })
    }

    async fn destroy(&self, _req: Request) {
        self.dispatcher.destroy();
    }

    async fn lookup(&self, _req: Request, parent: u64, name: &OsStr) -> FuseResult<ReplyEntry> {
        let path = self.inodes.child_path(parent, name)?;
        self.entry(&path)
    }

    async fn forget(&self, _req: Request, inode: u64, nlookup: u64) {
        self.inodes.forget(inode, nlookup);
    }

    async fn batch_forget(&self, _req: Request, inodes: &[(u64, u64)]) {
        for &(inode, nlookup) in inodes {
            self.inodes.forget(inode, nlookup);
        }
    }

    async fn getattr(
        &self,
        _req: Request,
        ino: u64,
        _fh: Option<u64>,
        _flags: u32,
    ) -> FuseResult<ReplyAttr> {
        let path = self.inodes.path_of(ino)?;
        let attr = self.dispatcher.getattr(&path)?;
        Ok(ReplyAttr {
            ttl: self.ttl,
            attr: fuse_attr(ino, &attr),
        })
    }

    async fn setattr(
        &self,
        _req: Request,
        ino: u64,
        _fh: Option<u64>,
        set_attr: SetAttr,
    ) -> FuseResult<ReplyAttr> {
        let path = self.inodes.path_of(ino)?;
        if let Some(mode) = set_attr.mode {
            self.dispatcher.chmod(&path, mode)?;
        }
        if set_attr.uid.is_some() || set_attr.gid.is_some() {
            self.dispatcher.chown(&path, set_attr.uid, set_attr.gid)?;
        }
        if let Some(size) = set_attr.size {
            self.dispatcher.truncate(&path, size)?;
        }
        if set_attr.atime.is_some() || set_attr.mtime.is_some() {
            self.dispatcher.utimens(
                &path,
                set_attr.atime.map(system_time),
                set_attr.mtime.map(system_time),
            )?;
        }
        let attr = self.dispatcher.getattr(&path)?;
        Ok(ReplyAttr {
            ttl: self.ttl,
            attr: fuse_attr(ino, &attr),
        })
    }

    async fn readlink(&self, _req: Request, ino: u64) -> FuseResult<ReplyData> {
        let path = self.inodes.path_of(ino)?;
        let target = self.dispatcher.readlink(&path)?;
        Ok(ReplyData {
            data: Bytes::copy_from_slice(target.as_os_str().as_bytes()),
        })
    }

    async fn symlink(
        &self,
        _req: Request,
        parent: u64,
        name: &OsStr,
        link: &OsStr,
    ) -> FuseResult<ReplyEntry> {
        let path = self.inodes.child_path(parent, name)?;
        self.dispatcher.symlink(Path::new(link), &path)?;
        self.entry(&path)
    }

    async fn mknod(
        &self,
        _req: Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        rdev: u32,
    ) -> FuseResult<ReplyEntry> {
        let path = self.inodes.child_path(parent, name)?;
        self.dispatcher.mknod(&path, mode, rdev.into())?;
        self.entry(&path)
    }

    async fn mkdir(
        &self,
        _req: Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
    ) -> FuseResult<ReplyEntry> {
        let path = self.inodes.child_path(parent, name)?;
        self.dispatcher.mkdir(&path, mode & !umask)?;
        self.entry(&path)
    }

    async fn unlink(&self, _req: Request, parent: u64, name: &OsStr) -> FuseResult<()> {
        let path = self.inodes.child_path(parent, name)?;
        self.dispatcher.unlink(&path)?;
        self.inodes.remove(&path);
        Ok(())
    }

    async fn rmdir(&self, _req: Request, parent: u64, name: &OsStr) -> FuseResult<()> {
        let path = self.inodes.child_path(parent, name)?;
        self.dispatcher.rmdir(&path)?;
        self.inodes.remove(&path);
        Ok(())
    }

    async fn rename(
        &self,
        _req: Request,
        parent: u64,
        name: &OsStr,
        new_parent: u64,
        new_name: &OsStr,
    ) -> FuseResult<()> {
        let from = self.inodes.child_path(parent, name)?;
        let to = self.inodes.child_path(new_parent, new_name)?;
        self.dispatcher.rename(&from, &to)?;
        self.inodes.rename(&from, &to);
        Ok(())
    }

    async fn link(
        &self,
        _req: Request,
        ino: u64,
        new_parent: u64,
        new_name: &OsStr,
    ) -> FuseResult<ReplyEntry> {
        let target = self.inodes.path_of(ino)?;
        let path = self.inodes.child_path(new_parent, new_name)?;
        self.dispatcher.link(&target, &path)?;
        self.entry(&path)
    }

    async fn open(&self, _req: Request, ino: u64, flags: u32) -> FuseResult<ReplyOpen> {
        let path = self.inodes.path_of(ino)?;
        let fh = self.dispatcher.open(&path, flags as i32)?;
        Ok(ReplyOpen { fh, flags: 0 })
    }

    async fn create(
        &self,
        _req: Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _flags: u32,
    ) -> FuseResult<ReplyCreated> {
        let path = self.inodes.child_path(parent, name)?;
        let created = self.dispatcher.create(&path, mode & 0o7777)?;
        let real_virtual = Path::new("/").join(&created.stamp).join(name);
        let ino = self.inodes.lookup(&real_virtual);
        Ok(ReplyCreated {
            ttl: self.ttl,
            attr: fuse_attr(ino, &created.attr),
            generation: 0,
            fh: created.fh,
            flags: 0,
        })
    }

    async fn read(
        &self,
        _req: Request,
        ino: u64,
        fh: u64,
        offset: u64,
        size: u32,
    ) -> FuseResult<ReplyData> {
        let path = self.inodes.path_or_empty(ino);
        let data = self.dispatcher.read(&path, fh, offset, size)?;
        Ok(ReplyData {
            data: Bytes::from(data),
        })
    }

    async fn write(
        &self,
        _req: Request,
        ino: u64,
        fh: u64,
        offset: u64,
        data: &[u8],
        _write_flags: u32,
        _flags: u32,
    ) -> FuseResult<ReplyWrite> {
        let path = self.inodes.path_or_empty(ino);
        let n = self.dispatcher.write(&path, fh, offset, data)?;
        Ok(ReplyWrite { written: n as u32 })
    }

    async fn statfs(&self, _req: Request, ino: u64) -> FuseResult<ReplyStatFs> {
        let path = self.inodes.path_of(ino)?;
        let st = self.dispatcher.statfs(&path)?;
        Ok(ReplyStatFs {
            blocks: st.blocks,
            bfree: st.bfree,
            bavail: st.bavail,
            files: st.files,
            ffree: st.ffree,
            bsize: st.bsize as u32,
            namelen: st.namemax as u32,
            frsize: st.frsize as u32,
        })
    }

    async fn release(
        &self,
        _req: Request,
        inode: u64,
        fh: u64,
        _flags: u32,
        _lock_owner: u64,
        _flush: bool,
    ) -> FuseResult<()> {
        let path = self.inodes.path_or_empty(inode);
        self.dispatcher.release(&path, fh)?;
        Ok(())
    }

    async fn flush(
        &self,
        _req: Request,
        inode: u64,
        fh: u64,
        _lock_owner: u64,
    ) -> FuseResult<()> {
        let path = self.inodes.path_or_empty(inode);
        self.dispatcher.flush(&path, fh)?;
        Ok(())
    }

    async fn fsync(&self, _req: Request, inode: u64, fh: u64, datasync: bool) -> FuseResult<()> {
        let path = self.inodes.path_or_empty(inode);
        self.dispatcher.fsync(&path, datasync, fh)?;
        Ok(())
    }

    async fn access(&self, _req: Request, inode: u64, mask: u32) -> FuseResult<()> {
        let path = self.inodes.path_of(inode)?;
        self.dispatcher.access(&path, mask as i32)?;
        Ok(())
    }

    // directories are listed by path, no handle state
    async fn opendir(&self, _req: Request, ino: u64, _flags: u32) -> FuseResult<ReplyOpen> {
        self.inodes.path_of(ino)?;
        Ok(ReplyOpen { fh: 0, flags: 0 })
    }

    async fn releasedir(
        &self,
        _req: Request,
        _inode: u64,
        _fh: u64,
        _flags: u32,
    ) -> FuseResult<()> {
        Ok(())
    }

    async fn fsyncdir(
        &self,
        _req: Request,
        _inode: u64,
        _fh: u64,
        _datasync: bool,
    ) -> FuseResult<()> {
        Ok(())
    }

    async fn readdir<'a>(
        &'a self,
        _req: Request,
        ino: u64,
        _fh: u64,
        offset: i64,
    ) -> FuseResult<ReplyDirectory<Self::DirEntryStream<'a>>> {
        // offset is that of the last entry the kernel already has
        let start = offset.max(0) as usize;
        let (_, listing) = self.listing(ino)?;
        let all: Vec<DirectoryEntry> = listing
            .into_iter()
            .enumerate()
            .skip(start)
            .map(|(i, (inode, e))| DirectoryEntry {
                inode: inode.unwrap_or(UNKNOWN_INODE),
                kind: fuse_kind(e.kind),
                name: e.name,
                offset: i as i64 + 1,
            })
            .collect();
        let entries: Self::DirEntryStream<'a> = Box::pin(stream::iter(all.into_iter().map(Ok)));
        Ok(ReplyDirectory { entries })
    }

    async fn readdirplus<'a>(
        &'a self,
        _req: Request,
        ino: u64,
        _fh: u64,
        offset: u64,
        _lock_owner: u64,
    ) -> FuseResult<ReplyDirectoryPlus<Self::DirEntryPlusStream<'a>>> {
        let (dir, listing) = self.listing(ino)?;
        let mut all: Vec<DirectoryEntryPlus> = Vec::new();
        for (i, (known, e)) in listing.into_iter().enumerate() {
            if (i as u64) < offset {
                continue;
            }
            let is_dot = matches!(e.name.as_bytes(), b"." | b"..");
            let path = match known {
                Some(known) if is_dot => self.inodes.path_or_empty(known),
                _ => dir.join(&e.name),
            };
            // entries can vanish between the listing and the stat
            let Ok(attr) = self.dispatcher.getattr(&path) else {
                continue;
            };
            // the kernel counts a lookup for every entry except `.` and `..`
            let inode = match known {
                Some(known) if is_dot => known,
                _ => self.inodes.lookup(&path),
            };
            all.push(DirectoryEntryPlus {
                inode,
                generation: 0,
                kind: fuse_kind(e.kind),
                name: e.name,
                offset: i as i64 + 1,
                attr: fuse_attr(inode, &attr),
                entry_ttl: self.ttl,
                attr_ttl: self.ttl,
            });
        }
        let entries: Self::DirEntryPlusStream<'a> =
            Box::pin(stream::iter(all.into_iter().map(Ok)));
        Ok(ReplyDirectoryPlus { entries })
    }

    async fn interrupt(&self, _req: Request, _unique: u64) -> FuseResult<()> {
        Ok(())
    }
}

// =============== helpers ===============
fn fuse_kind(k: EntryKind) -> FuseFileType {
    match k {
        EntryKind::Directory => FuseFileType::Directory,
        EntryKind::File => FuseFileType::RegularFile,
        EntryKind::Symlink => FuseFileType::Symlink,
        EntryKind::NamedPipe => FuseFileType::NamedPipe,
        EntryKind::CharDevice => FuseFileType::CharDevice,
        EntryKind::BlockDevice => FuseFileType::BlockDevice,
        EntryKind::Socket => FuseFileType::Socket,
    }
}

fn fuse_attr(ino: u64, a: &Attr) -> FileAttr {
    FileAttr {
        ino,
        size: a.size,
        blocks: a.blocks,
        atime: Timestamp::from(a.atime),
        mtime: Timestamp::from(a.mtime),
        ctime: Timestamp::from(a.ctime),
        #[cfg(target_os = "macos")]
        crtime: Timestamp::from(a.ctime),
        kind: fuse_kind(a.kind),
        perm: (a.mode & 0o7777) as u16,
        nlink: a.nlink as u32,
        uid: a.uid,
        gid: a.gid,
        rdev: a.rdev as u32,
        #[cfg(target_os = "macos")]
        flags: 0,
        blksize: a.blksize as u32,
    }
}

fn system_time(ts: Timestamp) -> SystemTime {
    let nsec = Duration::from_nanos(ts.nsec.into());
    if ts.sec >= 0 {
        UNIX_EPOCH + Duration::from_secs(ts.sec as u64) + nsec
    } else {
        UNIX_EPOCH - Duration::from_secs(ts.sec.unsigned_abs()) + nsec
    }
}
