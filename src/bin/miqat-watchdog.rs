//! Restart helper.
//!
//! Started detached by `miqat` just before it exits. Waits for the parent pid
//! to go away, relaunches the target executable, then clears stale temp
//! directories. Diagnostics go to `<data_dir>/miqat/restart.log` since the
//! helper has no terminal.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use miqat::config::{self, AppConfig, LifecycleConfig};
use miqat::lifecycle::{Watchdog, cleanup_stale_temp_dirs};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "miqat-watchdog")]
#[command(about = "Relaunch miqat once the running instance has exited")]
struct Args {
    /// Executable to relaunch
    target: PathBuf,

    /// Process id to wait for
    parent_pid: u32,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_dir = config::data_dir();
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("Failed to create {}", log_dir.display()))?;
    let appender = tracing_appender::rolling::never(&log_dir, "restart.log");
    let (writer, _guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::fmt()
        .with_writer(writer)
        .with_ansi(false)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(
        "Watchdog started for {} (parent pid {})",
        args.target.display(),
        args.parent_pid
    );

    // A broken config must not stop the relaunch.
    let lifecycle = match AppConfig::load() {
        Ok(config) => config.lifecycle,
        Err(e) => {
            tracing::warn!("Using default lifecycle settings: {:#}", e);
            LifecycleConfig::default()
        }
    };

    let report = Watchdog::from_config(&args.target, args.parent_pid, &lifecycle).run();
    tracing::info!(
        "Watchdog finished after {:?}: parent_exited={} relaunched={}",
        report.waited,
        report.parent_exited,
        report.relaunched
    );

    cleanup_stale_temp_dirs(
        &std::env::temp_dir(),
        &lifecycle.temp_prefix,
        Duration::from_secs(lifecycle.temp_max_age_secs),
    );

    if !report.relaunched {
        anyhow::bail!("Failed to relaunch {}", args.target.display());
    }
    Ok(())
}
