//! Mount helpers for starting/stopping FUSE
//!
//! Notes:
//! - Only supported on Linux. Unprivileged mounts go through fusermount3.
//! - These helpers are thin wrappers over rfuse3 raw Session APIs.

use rfuse3::MountOptions;
use rfuse3::raw::{MountHandle, Session};

use crate::config::MountConfig;
use crate::fuse::StampFuse;

/// Mount options for a stampfs session: fs name, the caller's uid/gid and readdirplus.
pub fn mount_options(config: &MountConfig) -> MountOptions {
    let uid = nix::unistd::getuid().as_raw();
    let gid = nix::unistd::getgid().as_raw();

    let mut mo = MountOptions::default();
    mo.fs_name("stampfs")
        .force_readdir_plus(true)
        .uid(uid)
        .gid(gid);
    if config.allow_other {
        mo.allow_other(true);
    }
    mo
}

/// Mount `fs` at the configured mount point. The returned handle resolves when the session ends.
#[cfg(target_os = "linux")]
pub async fn mount(fs: StampFuse, config: &MountConfig) -> std::io::Result<MountHandle> {
    let session = Session::new(mount_options(config));
    if config.unprivileged {
        session
            .mount_with_unprivileged(fs, &config.mountpoint)
            .await
    } else {
        session.mount(fs, &config.mountpoint).await
    }
}

/// Fallback stub for non-Linux targets.
#[cfg(not(target_os = "linux"))]
pub async fn mount(_fs: StampFuse, _config: &MountConfig) -> std::io::Result<MountHandle> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "FUSE mount is only supported on Linux in this build",
    ))
}
