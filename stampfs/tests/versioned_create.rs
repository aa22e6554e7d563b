use std::fs;
use std::path::{Path, PathBuf};

use stampfs::stamp::STAMP_LEN;
use stampfs::{
    Dispatcher, MountConfig, PathResolver, StampFuse, StampGenerator, VersionStamp,
    VersionedCreator,
};
use tempfile::TempDir;

fn make_dispatcher() -> (Dispatcher, TempDir, PathBuf) {
    let dir = TempDir::new().unwrap();
    let root = dir.path().canonicalize().unwrap();
    let resolver = PathResolver::new(&root);
    let creator = VersionedCreator::new(resolver.clone(), StampGenerator::new().unwrap());
    (Dispatcher::new(resolver, creator), dir, root)
}

fn version_dirs(root: &Path) -> Vec<String> {
    let mut dirs: Vec<String> = fs::read_dir(root)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| VersionStamp::is_stamp(n))
        .collect();
    dirs.sort();
    dirs
}

fn write_through(fs_: &Dispatcher, path: &str, data: &[u8]) {
    let created = fs_.create(Path::new(path), 0o644).unwrap();
    fs_.write(Path::new(path), created.fh, 0, data).unwrap();
    fs_.flush(Path::new(path), created.fh).unwrap();
    fs_.release(Path::new(path), created.fh).unwrap();
}

#[test]
fn save_by_rename_keeps_every_version() {
    let (fs_, _dir, root) = make_dispatcher();

    write_through(&fs_, "/report.txt", b"draft one");
    write_through(&fs_, "/report.txt.swp", b"draft two");
    fs_.rename(Path::new("/report.txt.swp"), Path::new("/report.txt")).unwrap();

    let dirs = version_dirs(&root);
    assert_eq!(dirs.len(), 2);
    assert_eq!(
        fs::read(root.join(&dirs[0]).join("report.txt")).unwrap(),
        b"draft one"
    );
    assert_eq!(
        fs::read(root.join(&dirs[1]).join("report.txt.swp")).unwrap(),
        b"draft two"
    );

    // The visible name now points at the newest version.
    assert_eq!(fs::read(root.join("report.txt")).unwrap(), b"draft two");
    assert_eq!(
        fs_.readlink(Path::new("/report.txt")).unwrap(),
        Path::new(&dirs[1]).join("report.txt.swp")
    );
}

#[test]
fn reopen_through_link_reads_and_appends() {
    let (fs_, _dir, _root) = make_dispatcher();
    write_through(&fs_, "/log", b"one\n");

    let fh = fs_.open(Path::new("/log"), libc::O_RDWR).unwrap();
    assert_eq!(fs_.read(Path::new("/log"), fh, 0, 64).unwrap(), b"one\n");
    fs_.write(Path::new("/log"), fh, 4, b"two\n").unwrap();
    assert_eq!(fs_.read(Path::new("/log"), fh, 0, 64).unwrap(), b"one\ntwo\n");
    fs_.release(Path::new("/log"), fh).unwrap();
    assert_eq!(fs_.open_handles(), 0);
}

#[test]
fn unlink_drops_only_the_visible_name() {
    let (fs_, _dir, root) = make_dispatcher();
    write_through(&fs_, "/gone.txt", b"still here");

    fs_.unlink(Path::new("/gone.txt")).unwrap();
    assert!(fs::symlink_metadata(root.join("gone.txt")).is_err());

    let dirs = version_dirs(&root);
    assert_eq!(dirs.len(), 1);
    assert_eq!(
        fs::read(root.join(&dirs[0]).join("gone.txt")).unwrap(),
        b"still here"
    );
}

#[test]
fn nested_create_resolves_from_its_own_directory() {
    let (fs_, _dir, root) = make_dispatcher();
    fs_.mkdir(Path::new("/a"), 0o755).unwrap();
    fs_.mkdir(Path::new("/a/b"), 0o755).unwrap();
    write_through(&fs_, "/a/b/deep.txt", b"deep");

    let target = fs::read_link(root.join("a/b/deep.txt")).unwrap();
    assert!(target.starts_with("../.."));
    assert_eq!(fs::read(root.join("a/b/deep.txt")).unwrap(), b"deep");

    let listing = fs_.readdir(Path::new("/a/b")).unwrap();
    assert!(listing.iter().any(|e| e.name == "deep.txt"));

    let err = fs_.rmdir(Path::new("/a/b")).unwrap_err();
    assert_eq!(err.errno(), libc::ENOTEMPTY);
    fs_.unlink(Path::new("/a/b/deep.txt")).unwrap();
    fs_.rmdir(Path::new("/a/b")).unwrap();
}

#[test]
fn mount_config_wires_a_working_filesystem() {
    let data = TempDir::new().unwrap();
    let mnt = TempDir::new().unwrap();
    let config = MountConfig::new(data.path(), mnt.path()).unwrap();
    let fuse = StampFuse::from_config(&config).unwrap();

    let created = fuse.dispatcher().create(Path::new("/hello"), 0o600).unwrap();
    assert!(created.real_target.starts_with(&config.root));
    assert_eq!(created.stamp.as_str().len(), STAMP_LEN);
    fuse.dispatcher().release(Path::new("/hello"), created.fh).unwrap();
    assert_eq!(
        fs::read_link(config.root.join("hello")).unwrap(),
        Path::new(created.stamp.as_str()).join("hello")
    );
}
