use std::fs;
use std::path::{Path, PathBuf};

use clap::Parser;

use crate::error::{Result, StampFsError};

#[derive(Parser, Debug)]
#[command(
    name = "stampfs",
    version,
    about = "Mount a directory so that every created file lands in its own time-stamped version directory"
)]
pub struct Args {
    /// The target directory to view at the mount point
    #[arg(value_name = "TARGET")]
    pub target: PathBuf,

    /// The mount point to view the target directory
    #[arg(value_name = "MOUNT")]
    pub mount: PathBuf,

    /// Keep the version directory and link of a create that failed halfway
    #[arg(long)]
    pub keep_partial: bool,

    /// Mount directly instead of going through fusermount3
    #[arg(long)]
    pub privileged: bool,

    /// Let other users access the mount (needs user_allow_other in /etc/fuse.conf)
    #[arg(long)]
    pub allow_other: bool,

    /// Log filter, e.g. `debug` or `stampfs=trace`. Overrides RUST_LOG
    #[arg(long, value_name = "FILTER")]
    pub log_level: Option<String>,
}

/// Validated mount settings.
#[derive(Debug, Clone)]
pub struct MountConfig {
    /// Canonical backing-store root.
    pub root: PathBuf,
    pub mountpoint: PathBuf,
    pub unprivileged: bool,
    pub keep_partial: bool,
    pub allow_other: bool,
}

fn existing_dir(path: &Path, what: &str) -> Result<PathBuf> {
    if !fs::metadata(path).map(|m| m.is_dir()).unwrap_or(false) {
        return Err(StampFsError::InvalidConfig(format!(
            "{what} {} does not exist or is not a directory",
            path.display()
        )));
    }
    fs::canonicalize(path).map_err(|e| StampFsError::io("canonicalize", path, e))
}

impl MountConfig {
    pub fn new(root: impl AsRef<Path>, mountpoint: impl AsRef<Path>) -> Result<Self> {
        let root = existing_dir(root.as_ref(), "target")?;
        let mountpoint = existing_dir(mountpoint.as_ref(), "mount point")?;
        if root == mountpoint || root.starts_with(&mountpoint) {
            return Err(StampFsError::InvalidConfig(format!(
                "target {} must not live under the mount point {}",
                root.display(),
                mountpoint.display()
            )));
        }
        Ok(Self {
            root,
            mountpoint,
            unprivileged: true,
            keep_partial: false,
            allow_other: false,
        })
    }

    pub fn from_args(args: &Args) -> Result<Self> {
        let mut config = Self::new(&args.target, &args.mount)?;
        config.unprivileged = !args.privileged;
        config.keep_partial = args.keep_partial;
        config.allow_other = args.allow_other;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;
    use tempfile::tempdir;

    #[test]
    fn parses_positional_target_then_mount() {
        let args = Args::try_parse_from(["stampfs", "/data", "/mnt"]).unwrap();
        assert_eq!(args.target, PathBuf::from("/data"));
        assert_eq!(args.mount, PathBuf::from("/mnt"));
        assert!(!args.keep_partial && !args.privileged && !args.allow_other);
        assert!(args.log_level.is_none());
    }

    #[test]
    fn both_paths_are_required() {
        assert!(Args::try_parse_from(["stampfs", "/data"]).is_err());
    }

    #[test]
    fn flags_flow_into_config() {
        let data = tempdir().unwrap();
        let mnt = tempdir().unwrap();
        let args = Args::try_parse_from([
            OsStr::new("stampfs"),
            data.path().as_os_str(),
            mnt.path().as_os_str(),
            OsStr::new("--keep-partial"),
            OsStr::new("--privileged"),
        ])
        .unwrap();
        let config = MountConfig::from_args(&args).unwrap();
        assert!(config.keep_partial);
        assert!(!config.unprivileged);
        assert!(!config.allow_other);
        assert!(config.root.is_absolute());
        assert_eq!(config.root, data.path().canonicalize().unwrap());
    }

    #[test]
    fn missing_target_is_rejected() {
        let mnt = tempdir().unwrap();
        let err = MountConfig::new("/definitely/not/here", mnt.path()).unwrap_err();
        assert!(matches!(err, StampFsError::InvalidConfig(_)));
    }

    #[test]
    fn target_inside_mount_point_is_rejected() {
        let mnt = tempdir().unwrap();
        let inner = mnt.path().join("data");
        fs::create_dir(&inner).unwrap();
        assert!(MountConfig::new(&inner, mnt.path()).is_err());
        assert!(MountConfig::new(mnt.path(), mnt.path()).is_err());
    }
}
