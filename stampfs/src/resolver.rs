//! Virtual path <-> backing-store path translation.
//!
//! The resolver never touches the filesystem. It only knows the configured root, so it is
//! freely shared between handlers running on different runtime workers.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct PathResolver {
    root: PathBuf,
}

impl PathResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a mount-visible path onto the backing store.
    ///
    /// The leading separator is stripped before joining. Repeated leading separators are
    /// stripped too, otherwise `join` would treat the remainder as absolute and leave the root.
    pub fn resolve(&self, virtual_path: impl AsRef<Path>) -> PathBuf {
        let relative = strip_leading_separators(virtual_path.as_ref());
        if relative.as_os_str().is_empty() {
            return self.root.clone();
        }
        self.root.join(relative)
    }

    /// Rewrite a link target read from the backing store so it never exposes the root.
    ///
    /// Absolute targets under the root become root-relative. Anything else is returned as is.
    pub fn sanitize_link_target(&self, target: &Path) -> PathBuf {
        if !target.is_absolute() {
            return target.to_path_buf();
        }
        match target.strip_prefix(&self.root) {
            Ok(rest) if rest.as_os_str().is_empty() => PathBuf::from("."),
            Ok(rest) => rest.to_path_buf(),
            Err(_) => target.to_path_buf(),
        }
    }
}

fn strip_leading_separators(path: &Path) -> &Path {
    let bytes = path.as_os_str().as_bytes();
    let start = bytes.iter().take_while(|b| **b == b'/').count();
    Path::new(OsStr::from_bytes(&bytes[start..]))
}

/// Final component of a virtual path, if it has one.
pub fn basename(virtual_path: &Path) -> Option<&OsStr> {
    virtual_path.file_name()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> PathResolver {
        PathResolver::new("/data")
    }

    #[test]
    fn resolve_strips_leading_separator() {
        let r = resolver();
        assert_eq!(r.resolve("/notes.txt"), PathBuf::from("/data/notes.txt"));
        assert_eq!(r.resolve("a/b/c"), PathBuf::from("/data/a/b/c"));
    }

    #[test]
    fn resolve_is_idempotent_over_leading_separator() {
        let r = resolver();
        for p in ["x", "x/y", "deep/er/path.bin", "with space", ".hidden"] {
            assert_eq!(r.resolve(p), r.resolve(format!("/{p}")), "path {p}");
        }
    }

    #[test]
    fn resolve_root_is_the_backing_root() {
        let r = resolver();
        assert_eq!(r.resolve("/"), PathBuf::from("/data"));
        assert_eq!(r.resolve(""), PathBuf::from("/data"));
    }

    #[test]
    fn resolve_never_leaves_root_on_doubled_separator() {
        let r = resolver();
        assert_eq!(r.resolve("//etc/passwd"), PathBuf::from("/data/etc/passwd"));
    }

    #[test]
    fn sanitize_rewrites_absolute_targets_under_root() {
        let r = resolver();
        assert_eq!(
            r.sanitize_link_target(Path::new("/data/x/y")),
            PathBuf::from("x/y")
        );
        assert_eq!(r.sanitize_link_target(Path::new("/data")), PathBuf::from("."));
    }

    #[test]
    fn sanitize_leaves_relative_and_foreign_targets() {
        let r = resolver();
        assert_eq!(r.sanitize_link_target(Path::new("a/b")), PathBuf::from("a/b"));
        assert_eq!(
            r.sanitize_link_target(Path::new("/etc/hosts")),
            PathBuf::from("/etc/hosts")
        );
        // prefix match is per component, not per byte
        assert_eq!(
            r.sanitize_link_target(Path::new("/database/z")),
            PathBuf::from("/database/z")
        );
    }

    #[test]
    fn basename_of_virtual_paths() {
        assert_eq!(basename(Path::new("/a/b.txt")), Some(OsStr::new("b.txt")));
        assert_eq!(basename(Path::new("/")), None);
    }
}
