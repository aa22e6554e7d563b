use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use stampfs::fuse::mount::mount;
use stampfs::{Args, MountConfig, StampFuse};

fn init_tracing(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_level.as_deref());

    if let Err(e) = run(&args).await {
        tracing::error!("stampfs failed: {e:#}");
        return Err(e);
    }
    Ok(())
}

async fn run(args: &Args) -> Result<()> {
    let config = MountConfig::from_args(args).context("invalid mount arguments")?;
    let fs = StampFuse::from_config(&config).context("failed to set up stampfs")?;

    tracing::info!(
        root = %config.root.display(),
        mountpoint = %config.mountpoint.display(),
        unprivileged = config.unprivileged,
        keep_partial = config.keep_partial,
        "mounting stampfs"
    );
    let mut mount_handle = mount(fs, &config)
        .await
        .with_context(|| format!("failed to mount at {}", config.mountpoint.display()))?;

    let handle = &mut mount_handle;
    tokio::select! {
        res = handle => {
            res.context("fuse session ended with an error")?;
            tracing::info!("stampfs session ended");
        }
        _ = signal::ctrl_c() => {
            tracing::info!("interrupted, unmounting {}", config.mountpoint.display());
            mount_handle.unmount().await.context("unmount failed")?;
        }
    }
    Ok(())
}
