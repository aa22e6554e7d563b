//! Inode <-> virtual path table.
//!
//! rfuse3's raw API speaks inodes while every handler here works on paths. An inode is handed
//! out the first time the kernel is given a path (lookup, create, mkdir, readdirplus, ...) and
//! carries the kernel's lookup count. `forget` brings the count down; at zero the entry is
//! dropped, so the table only holds what the kernel still references.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::error::{Result, StampFsError};

pub const ROOT_INODE: u64 = 1;

/// `d_ino` for plain readdir entries the kernel has not looked up yet.
pub const UNKNOWN_INODE: u64 = 0xffff_ffff;

#[derive(Debug)]
struct Node {
    path: PathBuf,
    lookups: u64,
}

#[derive(Debug)]
struct Inner {
    next: u64,
    nodes: HashMap<u64, Node>,
    by_path: HashMap<PathBuf, u64>,
}

impl Inner {
    /// Drop `ino`, and its path mapping if that still points at it.
    fn drop_node(&mut self, ino: u64) {
        if let Some(node) = self.nodes.remove(&ino)
            && self.by_path.get(&node.path) == Some(&ino)
        {
            self.by_path.remove(&node.path);
        }
    }
}

#[derive(Debug)]
pub struct InodeTable {
    inner: Mutex<Inner>,
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InodeTable {
    pub fn new() -> Self {
        let root = PathBuf::from("/");
        let mut nodes = HashMap::new();
        let mut by_path = HashMap::new();
        nodes.insert(
            ROOT_INODE,
            Node {
                path: root.clone(),
                lookups: 1,
            },
        );
        by_path.insert(root, ROOT_INODE);
        Self {
            inner: Mutex::new(Inner {
                next: ROOT_INODE + 1,
                nodes,
                by_path,
            }),
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn path_of(&self, ino: u64) -> Result<PathBuf> {
        self.inner()
            .nodes
            .get(&ino)
            .map(|n| n.path.clone())
            .ok_or(StampFsError::UnknownInode(ino))
    }

    /// Path for log lines on handle-based calls, where the name may already be gone.
    pub fn path_or_empty(&self, ino: u64) -> PathBuf {
        self.path_of(ino).unwrap_or_default()
    }

    pub fn child_path(&self, parent: u64, name: &OsStr) -> Result<PathBuf> {
        Ok(self.path_of(parent)?.join(name))
    }

    /// Inode already assigned to `path`, if any. Never allocates.
    pub fn find(&self, path: &Path) -> Option<u64> {
        self.inner().by_path.get(path).copied()
    }

    /// Inode for `path` handed to the kernel: allocates on first sight and counts one lookup.
    pub fn lookup(&self, path: &Path) -> u64 {
        let mut inner = self.inner();
        if let Some(&ino) = inner.by_path.get(path) {
            if let Some(node) = inner.nodes.get_mut(&ino) {
                node.lookups += 1;
            }
            return ino;
        }
        let ino = inner.next;
        inner.next += 1;
        inner.nodes.insert(
            ino,
            Node {
                path: path.to_path_buf(),
                lookups: 1,
            },
        );
        inner.by_path.insert(path.to_path_buf(), ino);
        ino
    }

    /// The kernel dropped `nlookup` references to `ino`.
    pub fn forget(&self, ino: u64, nlookup: u64) {
        if ino == ROOT_INODE {
            return;
        }
        let mut inner = self.inner();
        let Some(node) = inner.nodes.get_mut(&ino) else {
            return;
        };
        node.lookups = node.lookups.saturating_sub(nlookup);
        if node.lookups == 0 {
            inner.drop_node(ino);
        }
    }

    pub fn parent_of(&self, ino: u64) -> u64 {
        match self.path_of(ino) {
            Ok(path) => path
                .parent()
                .and_then(|parent| self.find(parent))
                .unwrap_or(ROOT_INODE),
            Err(_) => ROOT_INODE,
        }
    }

    /// The name is gone from the backing store. The inode lives on until the kernel forgets it,
    /// but the path no longer resolves to it.
    pub fn remove(&self, path: &Path) {
        let mut inner = self.inner();
        if let Some(ino) = inner.by_path.remove(path)
            && inner.nodes.get(&ino).is_some_and(|n| n.lookups == 0)
        {
            inner.nodes.remove(&ino);
        }
    }

    /// Move `from` and everything below it to `to`, keeping inode numbers.
    pub fn rename(&self, from: &Path, to: &Path) {
        let mut inner = self.inner();
        if let Some(replaced) = inner.by_path.get(to).copied()
            && inner.by_path.get(from) != Some(&replaced)
        {
            inner.by_path.remove(to);
        }

        let moved: Vec<(PathBuf, u64)> = inner
            .by_path
            .iter()
            .filter(|(p, _)| p.starts_with(from))
            .map(|(p, ino)| (p.clone(), *ino))
            .collect();
        for (old, ino) in moved {
            let rest = old.strip_prefix(from).unwrap_or(Path::new(""));
            let new = if rest.as_os_str().is_empty() {
                to.to_path_buf()
            } else {
                to.join(rest)
            };
            inner.by_path.remove(&old);
            inner.by_path.insert(new.clone(), ino);
            if let Some(node) = inner.nodes.get_mut(&ino) {
                node.path = new;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_is_preallocated() {
        let t = InodeTable::new();
        assert_eq!(t.path_of(ROOT_INODE).unwrap(), PathBuf::from("/"));
        assert_eq!(t.find(Path::new("/")), Some(ROOT_INODE));
        assert_eq!(t.parent_of(ROOT_INODE), ROOT_INODE);
        t.forget(ROOT_INODE, 100);
        assert_eq!(t.path_of(ROOT_INODE).unwrap(), PathBuf::from("/"));
    }

    #[test]
    fn lookup_is_stable_and_find_never_allocates() {
        let t = InodeTable::new();
        assert_eq!(t.find(Path::new("/a")), None);
        let a = t.lookup(Path::new("/a"));
        assert_eq!(t.lookup(Path::new("/a")), a);
        assert_eq!(t.find(Path::new("/a")), Some(a));
        assert_ne!(t.lookup(Path::new("/b")), a);
        assert_eq!(
            t.child_path(ROOT_INODE, OsStr::new("a")).unwrap(),
            PathBuf::from("/a")
        );
        assert_eq!(t.len(), 3);
    }

    #[test]
    fn forget_drops_entry_once_lookups_reach_zero() {
        let t = InodeTable::new();
        let a = t.lookup(Path::new("/a"));
        t.lookup(Path::new("/a"));
        t.forget(a, 1);
        assert!(t.path_of(a).is_ok());
        t.forget(a, 1);
        assert!(matches!(t.path_of(a), Err(StampFsError::UnknownInode(_))));
        assert_eq!(t.find(Path::new("/a")), None);
        assert_eq!(t.len(), 1);
        // late or repeated forgets are harmless
        t.forget(a, 1);
    }

    #[test]
    fn create_forget_unlink_cycles_do_not_grow_the_table() {
        let t = InodeTable::new();
        for i in 0..200 {
            let alias = PathBuf::from(format!("/2024010112000000{i:04}/f"));
            let ino = t.lookup(&alias);
            t.forget(ino, 1);
            t.remove(Path::new("/f"));
        }
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn removed_name_keeps_inode_until_forgotten() {
        let t = InodeTable::new();
        let a = t.lookup(Path::new("/a"));
        t.remove(Path::new("/a"));
        assert_eq!(t.find(Path::new("/a")), None);
        assert!(t.path_of(a).is_ok());

        // a new file under the old name gets its own inode
        let b = t.lookup(Path::new("/a"));
        assert_ne!(a, b);
        t.forget(a, 1);
        assert_eq!(t.find(Path::new("/a")), Some(b));
        assert_eq!(t.len(), 2);
        assert_eq!(t.path_or_empty(a), PathBuf::new());
    }

    #[test]
    fn rename_moves_the_subtree() {
        let t = InodeTable::new();
        let dir = t.lookup(Path::new("/d"));
        let file = t.lookup(Path::new("/d/f"));
        let other = t.lookup(Path::new("/dx"));
        let replaced = t.lookup(Path::new("/e"));

        t.rename(Path::new("/d"), Path::new("/e"));
        assert_eq!(t.path_of(dir).unwrap(), PathBuf::from("/e"));
        assert_eq!(t.path_of(file).unwrap(), PathBuf::from("/e/f"));
        assert_eq!(t.path_of(other).unwrap(), PathBuf::from("/dx"));
        assert_eq!(t.find(Path::new("/e/f")), Some(file));
        assert_eq!(t.find(Path::new("/d")), None);

        // the replaced inode stays until the kernel forgets it
        t.forget(replaced, 1);
        assert!(t.path_of(replaced).is_err());
        assert_eq!(t.find(Path::new("/e")), Some(dir));
    }
}
