//! Versioned file creation.
//!
//! Every create lands in a fresh `root/<stamp>/` directory. The virtual path becomes a symlink
//! whose target is relative (`<stamp>/<name>` at the top level), so the backing store can be
//! moved or mounted elsewhere without breaking any link. Below the root the target climbs back
//! with `..`, so moving a link to another depth needs a new target ([`relink_target`]).

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Component, Path, PathBuf};

use crate::error::{Result, StampFsError};
use crate::resolver::{PathResolver, basename};
use crate::stamp::{StampGenerator, VersionStamp};

/// Everything one successful create produced.
#[derive(Debug)]
pub struct VersionedFile {
    pub stamp: VersionStamp,
    pub version_dir: PathBuf,
    /// The file the handle is bound to.
    pub real_target: PathBuf,
    /// Where the indirection link was placed.
    pub link: PathBuf,
    pub link_target: PathBuf,
    pub file: File,
}

#[derive(Debug)]
pub struct VersionedCreator {
    resolver: PathResolver,
    stamps: StampGenerator,
    keep_partial: bool,
}

impl VersionedCreator {
    pub fn new(resolver: PathResolver, stamps: StampGenerator) -> Self {
        Self {
            resolver,
            stamps,
            keep_partial: false,
        }
    }

    /// Leave the version directory and link behind when a create fails halfway.
    pub fn keep_partial(mut self, keep: bool) -> Self {
        self.keep_partial = keep;
        self
    }

    pub fn create(&self, virtual_path: &Path, mode: u32) -> Result<VersionedFile> {
        let name = basename(virtual_path)
            .ok_or_else(|| StampFsError::NoFileName(virtual_path.to_path_buf()))?;

        let stamp = self.stamps.next_stamp();
        let version_dir = self.resolver.root().join(&stamp);
        let real_target = version_dir.join(name);
        let link = self.resolver.resolve(virtual_path);
        let link_target = link_target_for(virtual_path, stamp.as_ref(), Path::new(name));

        let mut guard = PartialCreate::new(&version_dir, &real_target, self.keep_partial);

        fs::create_dir(&version_dir).map_err(|e| {
            if e.kind() == io::ErrorKind::AlreadyExists {
                StampFsError::VersionCollision(version_dir.clone())
            } else {
                StampFsError::io("mkdir", &version_dir, e)
            }
        })?;
        guard.dir_created = true;

        std::os::unix::fs::symlink(&link_target, &link)
            .map_err(|e| StampFsError::io("symlink", &link, e))?;
        guard.link = Some(link.clone());

        // O_CREAT grants the requested access even when `mode` itself would deny it.
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(mode)
            .open(&real_target)
            .map_err(|e| StampFsError::io("open", &real_target, e))?;
        guard.commit();

        tracing::debug!(
            stamp = %stamp,
            link = %link.display(),
            target = %link_target.display(),
            "created versioned file"
        );

        Ok(VersionedFile {
            stamp,
            version_dir,
            real_target,
            link,
            link_target,
            file,
        })
    }
}

/// Directories between the root and the entry at `virtual_path`.
fn depth(virtual_path: &Path) -> usize {
    virtual_path
        .components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .count()
        .saturating_sub(1)
}

/// Relative link target for `virtual_path`, climbing back to the root from the link's parent.
fn link_target_for(virtual_path: &Path, stamp: &Path, name: &Path) -> PathBuf {
    let mut target = PathBuf::new();
    for _ in 0..depth(virtual_path) {
        target.push("..");
    }
    target.push(stamp);
    target.push(name);
    target
}

/// Target an indirection link must carry once it moves from `from` to `to`.
///
/// `None` when `target` is not an indirection link made for `from`, or when the move keeps the
/// depth and the current target still resolves.
pub fn relink_target(target: &Path, from: &Path, to: &Path) -> Option<PathBuf> {
    let mut ups = 0;
    let mut rest = Vec::new();
    for c in target.components() {
        match c {
            Component::ParentDir if rest.is_empty() => ups += 1,
            Component::Normal(part) => rest.push(part),
            _ => return None,
        }
    }
    let [stamp, name] = rest.as_slice() else {
        return None;
    };
    if !VersionStamp::is_stamp(stamp.to_str()?) || ups != depth(from) || ups == depth(to) {
        return None;
    }
    Some(link_target_for(to, Path::new(stamp), Path::new(name)))
}

/// Undoes a half-finished create when dropped before `commit`.
struct PartialCreate {
    version_dir: PathBuf,
    real_target: PathBuf,
    dir_created: bool,
    link: Option<PathBuf>,
    keep: bool,
    committed: bool,
}

impl PartialCreate {
    fn new(version_dir: &Path, real_target: &Path, keep: bool) -> Self {
        Self {
            version_dir: version_dir.to_path_buf(),
            real_target: real_target.to_path_buf(),
            dir_created: false,
            link: None,
            keep,
            committed: false,
        }
    }

    fn commit(&mut self) {
        self.committed = true;
    }
}

impl Drop for PartialCreate {
    fn drop(&mut self) {
        if self.committed || !self.dir_created {
            return;
        }
        if self.keep {
            tracing::warn!(
                "keeping partial version directory {}",
                self.version_dir.display()
            );
            return;
        }
        if let Some(link) = &self.link
            && let Err(e) = fs::remove_file(link)
        {
            tracing::warn!("Failed to remove link {}: {e}", link.display());
        }
        if let Err(e) = fs::remove_file(&self.real_target)
            && e.kind() != io::ErrorKind::NotFound
        {
            tracing::warn!("Failed to remove {}: {e}", self.real_target.display());
        }
        if let Err(e) = fs::remove_dir(&self.version_dir) {
            tracing::warn!(
                "Failed to remove version directory {}: {e}",
                self.version_dir.display()
            );
        }
    }
}
