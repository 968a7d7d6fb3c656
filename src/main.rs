use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use miqat::{
    api::AladhanClient,
    audio::AudioPlaybackManager,
    cache::TimetableCache,
    clock_sync::SyncedClock,
    config::{self, AppConfig},
    i18n::{Catalog, Translator, render},
    lifecycle::{self, InstanceLock},
    notify::NotificationDispatcher,
    scheduler::{AdaptiveScheduler, AlertSettings, CacheTarget, ScheduleState, SchedulerDeps, WorkerPool},
    timetable::format_12h,
    traits::{Clock, TimetableProvider},
};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(name = "miqat")]
#[command(about = "Prayer time notifier with adhan playback")]
struct Args {
    /// Load and print the configuration, then exit
    #[arg(long)]
    config_check: bool,

    /// Load today's timetable, run a single tick and exit
    #[arg(long)]
    once: bool,

    /// Run even if another instance holds the lock
    #[arg(long)]
    no_lock: bool,
}

/// How the main loop ended.
enum Exit {
    Quit,
    Restart,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::builder()
        .with_default_directive(tracing::level_filters::LevelFilter::INFO.into())
        .parse_lossy("miqat=debug");

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let config = AppConfig::load().context("Failed to load configuration")?;

    if args.config_check {
        println!("{config:#?}");
        return Ok(());
    }

    lifecycle::cleanup_stale_temp_dirs(
        &std::env::temp_dir(),
        &config.lifecycle.temp_prefix,
        Duration::from_secs(config.lifecycle.temp_max_age_secs),
    );

    let catalog = Arc::new(Catalog::new(&config.language));

    let mut lock = InstanceLock::from_config(&config.lifecycle);
    if !args.no_lock && !lock.acquire().context("Failed to create instance lock")? {
        eprintln!(
            "{}",
            render(
                &catalog.get("already_running"),
                &[("app_name", config.lifecycle.app_name.as_str())]
            )
        );
        std::process::exit(1);
    }

    let config = Arc::new(config);
    let rt = tokio::runtime::Runtime::new().context("Failed to create tokio runtime")?;
    let exit = rt.block_on(run(config.clone(), catalog, args.once));

    // Give in-flight alerts a moment, then drop the lock before any relaunch.
    rt.shutdown_timeout(Duration::from_secs(2));
    lock.release();

    match exit? {
        Exit::Quit => Ok(()),
        Exit::Restart => {
            let target = std::env::current_exe().context("Failed to locate own executable")?;
            lifecycle::restart(&watchdog_path(&target), &target)
        }
    }
}

async fn run(config: Arc<AppConfig>, catalog: Arc<Catalog>, once: bool) -> Result<Exit> {
    tracing::info!(
        "Starting miqat for {}, {} (method {})",
        config.location.city,
        config.location.country,
        config.location.method
    );

    let pool = WorkerPool::new(tokio::runtime::Handle::current(), config.scheduler.workers);
    let synced_clock = Arc::new(SyncedClock::from_config(&config.clock));

    let provider: Arc<dyn TimetableProvider> =
        Arc::new(AladhanClient::new(&config.network, &config.location)?);
    tracing::info!("API client initialized for {}", config.network.api_url);

    let cache = CacheTarget {
        cache: TimetableCache::new(config::data_dir().join("cache")),
        city: config.location.city.clone(),
        country: config.location.country.clone(),
    };

    // Probing may talk to D-Bus or open an audio device.
    let dispatcher = {
        let config = config.clone();
        let pool = pool.clone();
        tokio::task::spawn_blocking(move || {
            NotificationDispatcher::from_config(&config.notifications, &config.lifecycle.app_name, pool)
        })
        .await
        .context("Notification probe panicked")?
    };
    tracing::info!("Notification tiers: {:?}", dispatcher.available_tiers());

    let audio = {
        let config = config.clone();
        let runtime = tokio::runtime::Handle::current();
        Arc::new(
            tokio::task::spawn_blocking(move || AudioPlaybackManager::from_config(&config.audio, runtime))
                .await
                .context("Audio probe panicked")?,
        )
    };
    tracing::info!("Audio tiers: {:?}", audio.available_tiers());

    let scheduler = AdaptiveScheduler::new(SchedulerDeps {
        clock: synced_clock.clone() as Arc<dyn Clock>,
        synced_clock: Some(synced_clock),
        provider,
        cache: Some(cache),
        dispatcher,
        audio: Some(audio.clone()),
        translator: catalog.clone(),
        pool,
        alerts: AlertSettings::from_config(&config.notifications, &config.audio),
        refresh_interval: Duration::from_secs(config.scheduler.refresh_interval_secs),
    })
    .on_tick(status_logger(catalog.clone()));

    if once {
        if let Some(state) = scheduler.run_once().await? {
            println!("{}", status_line(catalog.as_ref(), &state));
            for line in status_table(catalog.as_ref(), &state) {
                println!("  {line}");
            }
        }
        return Ok(Exit::Quit);
    }

    let handle = scheduler.start();
    let exit = wait_for_signal().await;

    handle.stop();
    audio.stop();
    handle.join().await?;
    exit
}

fn status_line(translator: &dyn Translator, state: &ScheduleState) -> String {
    let next = &state.next_event;
    let mut name = translator.get(next.event.name());
    if next.is_tomorrow {
        name = format!("{} ({})", name, translator.get("tomorrow"));
    }
    let time = format_12h(next.event.minute_of_day(), translator.language());
    render(
        &translator.get("next_prayer"),
        &[
            ("prayer_name", name.as_str()),
            ("time", time.as_str()),
            ("countdown", state.countdown.as_str()),
        ],
    )
}

/// One `name  status` row per event, in timetable order.
fn status_table(translator: &dyn Translator, state: &ScheduleState) -> Vec<String> {
    state
        .statuses
        .iter()
        .map(|(name, status)| {
            format!(
                "{:<10} {}",
                translator.get(name),
                translator.get(status.label_key())
            )
        })
        .collect()
}

/// Stand-in for a window: logs the status line whenever the minute changes.
fn status_logger(translator: Arc<Catalog>) -> miqat::scheduler::UiCallback {
    let mut last: Option<(String, u16)> = None;
    Box::new(move |state: &ScheduleState| {
        let key = (
            state.next_event.event.name().to_string(),
            state.next_event.minutes_until,
        );
        if last.as_ref() != Some(&key) {
            tracing::info!("{}", status_line(translator.as_ref(), state));
            last = Some(key);
        }
        Ok(())
    })
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<Exit> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl-C")?;
            tracing::info!("Shutting down");
            Ok(Exit::Quit)
        }
        _ = hangup.recv() => {
            tracing::info!("SIGHUP received, restarting");
            Ok(Exit::Restart)
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<Exit> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    tracing::info!("Shutting down");
    Ok(Exit::Quit)
}

/// The watchdog binary ships next to the main one.
fn watchdog_path(target: &std::path::Path) -> PathBuf {
    let name = format!("miqat-watchdog{}", std::env::consts::EXE_SUFFIX);
    match target.parent() {
        Some(dir) => dir.join(name),
        None => PathBuf::from(name),
    }
}
