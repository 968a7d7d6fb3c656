//! Adaptive tick loop.
//!
//! One tokio task owns all schedule state: the timetable, the fire registry
//! (through the dispatcher) and the last computed [`ScheduleState`]. Anything
//! slow runs on the [`WorkerPool`] and reports back through the loop's inbox,
//! so that state has a single writer and needs no locking.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use tokio::sync::{Notify, Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::audio::AudioPlaybackManager;
use crate::cache::TimetableCache;
use crate::clock_sync::SyncedClock;
use crate::config::{AudioConfig, NotificationConfig};
use crate::i18n::{Translator, render};
use crate::notify::{NotificationDispatcher, SendOutcome};
use crate::timetable::{DailyTimetable, MINUTES_PER_DAY, NextEvent, Status, minute_of_day};
use crate::traits::{Clock, TimetableProvider};

/// Delay before the next tick when the last one failed.
const ERROR_RETRY: Duration = Duration::from_secs(5);

/// Delay between ticks while no timetable has been loaded yet.
const NO_TIMETABLE_RETRY: Duration = Duration::from_secs(15);

/// Minimum gap between refresh attempts after a failed one.
const REFRESH_RETRY: Duration = Duration::from_secs(300);

/// Minimum gap between clock sync attempts.
const CLOCK_SYNC_RETRY: Duration = Duration::from_secs(300);

/// Slack added past a minute boundary so the tick lands inside the new minute.
const MINUTE_SLACK: Duration = Duration::from_millis(10);

/// Events that never raise alerts.
const SILENT_EVENTS: &[&str] = &["sunrise"];

/// Re-arm delay for the given distance to the next event.
pub fn tick_interval(seconds_until_next: u32) -> Duration {
    let secs = match seconds_until_next {
        s if s < 60 => 1,
        s if s < 5 * 60 => 5,
        s if s < 30 * 60 => 15,
        _ => 60,
    };
    Duration::from_secs(secs)
}

/// Re-arm delay after a tick at `now`, never sleeping past the next minute
/// boundary so that no alert minute is stepped over.
pub fn rearm_delay(seconds_until_next: u32, now: NaiveTime) -> Duration {
    let into_minute = Duration::new(
        u64::from(now.second().min(59)),
        now.nanosecond().min(999_999_999),
    );
    let to_boundary = Duration::from_secs(60).saturating_sub(into_minute) + MINUTE_SLACK;
    tick_interval(seconds_until_next).min(to_boundary)
}

/// How close the next event is, for display emphasis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Urgency {
    Relaxed,
    /// Within 30 minutes.
    Soon,
    /// Within 5 minutes.
    Imminent,
}

impl Urgency {
    pub fn from_seconds(seconds_until_next: u32) -> Self {
        match seconds_until_next {
            s if s <= 5 * 60 => Urgency::Imminent,
            s if s <= 30 * 60 => Urgency::Soon,
            _ => Urgency::Relaxed,
        }
    }
}

/// Everything the UI needs after one tick.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleState {
    pub now: NaiveDateTime,
    pub next_event: NextEvent,
    pub seconds_until_next: u32,
    pub statuses: Vec<(String, Status)>,
    /// `HH:MM:SS` until the next event.
    pub countdown: String,
    pub urgency: Urgency,
}

impl ScheduleState {
    pub fn compute(timetable: &DailyTimetable, now: NaiveDateTime) -> Self {
        let (next_event, seconds_until_next) = timetable.seconds_until_next(now.time());
        Self {
            now,
            statuses: timetable.statuses(minute_of_day(now.time())),
            next_event,
            seconds_until_next,
            countdown: format_countdown(seconds_until_next),
            urgency: Urgency::from_seconds(seconds_until_next),
        }
    }

    pub fn status_of(&self, name: &str) -> Option<Status> {
        self.statuses
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, status)| *status)
    }
}

pub fn format_countdown(seconds: u32) -> String {
    format!(
        "{:02}:{:02}:{:02}",
        seconds / 3600,
        (seconds % 3600) / 60,
        seconds % 60
    )
}

// ==================== FireRegistry ====================

/// Last minute stamp at which each event key fired.
#[derive(Debug, Clone, Default)]
pub struct FireRegistry {
    fired: HashMap<String, String>,
}

impl FireRegistry {
    pub fn should_fire(&self, key: &str, stamp: &str) -> bool {
        self.fired.get(key).is_none_or(|last| last != stamp)
    }

    pub fn record(&mut self, key: &str, stamp: &str) {
        self.fired.insert(key.to_string(), stamp.to_string());
    }

    pub fn last(&self, key: &str) -> Option<&str> {
        self.fired.get(key).map(String::as_str)
    }

    pub fn clear(&mut self) {
        self.fired.clear();
    }

    pub fn len(&self) -> usize {
        self.fired.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fired.is_empty()
    }
}

// ==================== WorkerPool ====================

/// Bounded pool for blocking and slow async work, cheap to clone.
#[derive(Clone)]
pub struct WorkerPool {
    runtime: tokio::runtime::Handle,
    permits: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

struct InFlightGuard {
    in_flight: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

impl WorkerPool {
    pub fn new(runtime: tokio::runtime::Handle, workers: usize) -> Self {
        Self {
            runtime,
            permits: Arc::new(Semaphore::new(workers.max(1))),
            in_flight: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
        }
    }

    pub fn runtime(&self) -> &tokio::runtime::Handle {
        &self.runtime
    }

    fn enter(&self) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        InFlightGuard {
            in_flight: self.in_flight.clone(),
            idle: self.idle.clone(),
        }
    }

    /// Run a blocking closure on a worker. `None` if the job panicked.
    pub fn submit_blocking<F, T>(&self, job: F) -> JoinHandle<Option<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let guard = self.enter();
        let permits = self.permits.clone();
        self.runtime.spawn(async move {
            let _guard = guard;
            let _permit = permits.acquire_owned().await.ok()?;
            match tokio::task::spawn_blocking(job).await {
                Ok(value) => Some(value),
                Err(e) => {
                    tracing::error!("Worker job failed: {}", e);
                    None
                }
            }
        })
    }

    /// Run a future under a worker permit.
    pub fn submit<Fut>(&self, job: Fut) -> JoinHandle<Option<Fut::Output>>
    where
        Fut: Future + Send + 'static,
        Fut::Output: Send + 'static,
    {
        let guard = self.enter();
        let permits = self.permits.clone();
        self.runtime.spawn(async move {
            let _guard = guard;
            let _permit = permits.acquire_owned().await.ok()?;
            Some(job.await)
        })
    }

    /// Jobs submitted and not yet finished.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Wait until every submitted job has finished.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }
}

// ==================== Scheduler ====================

/// Posted back onto the loop by workers and handles.
#[derive(Debug)]
pub enum SchedulerMessage {
    TimetableLoaded(Result<DailyTimetable, String>),
    ClockSynced,
    RefreshRequested,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Stopped,
    Running,
}

/// Called once per tick with the fresh state. Errors are logged by the loop.
pub type UiCallback = Box<dyn FnMut(&ScheduleState) -> Result<()> + Send>;

/// What to say and play for each alert kind.
#[derive(Debug, Clone)]
pub struct AlertSettings {
    /// `0` disables the pre-alert.
    pub pre_alert_minutes: u16,
    pub pre_alert_timeout_secs: u64,
    pub at_time_timeout_secs: u64,
    pub sound_enabled: bool,
    pub volume: f32,
    pub adhan_path: PathBuf,
    pub notification_path: PathBuf,
}

impl AlertSettings {
    pub fn from_config(notifications: &NotificationConfig, audio: &AudioConfig) -> Self {
        Self {
            pre_alert_minutes: notifications.pre_alert_minutes,
            pre_alert_timeout_secs: notifications.pre_alert_timeout_secs,
            at_time_timeout_secs: notifications.at_time_timeout_secs,
            sound_enabled: audio.enabled,
            volume: audio.volume,
            adhan_path: audio.adhan_path(),
            notification_path: audio.notification_path(),
        }
    }
}

impl Default for AlertSettings {
    fn default() -> Self {
        Self::from_config(&NotificationConfig::default(), &AudioConfig::default())
    }
}

/// Where fetched timetables are kept for offline fallback.
#[derive(Debug, Clone)]
pub struct CacheTarget {
    pub cache: TimetableCache,
    pub city: String,
    pub country: String,
}

impl CacheTarget {
    pub fn save(&self, timetable: &DailyTimetable) -> Result<PathBuf> {
        self.cache.save(&self.city, &self.country, timetable)
    }

    pub fn load(&self, date: NaiveDate) -> Option<DailyTimetable> {
        self.cache.load(&self.city, &self.country, date)
    }
}

/// Collaborators handed to [`AdaptiveScheduler::new`].
pub struct SchedulerDeps {
    pub clock: Arc<dyn Clock>,
    /// Refreshed on a worker whenever its offset expires.
    pub synced_clock: Option<Arc<SyncedClock>>,
    pub provider: Arc<dyn TimetableProvider>,
    pub cache: Option<CacheTarget>,
    pub dispatcher: NotificationDispatcher,
    pub audio: Option<Arc<AudioPlaybackManager>>,
    pub translator: Arc<dyn Translator>,
    pub pool: WorkerPool,
    pub alerts: AlertSettings,
    pub refresh_interval: Duration,
}

/// Fetch `date` from the provider, falling back to the cache on failure.
/// Successful fetches are written to the cache.
pub async fn load_timetable(
    provider: &dyn TimetableProvider,
    cache: Option<&CacheTarget>,
    date: NaiveDate,
) -> std::result::Result<DailyTimetable, String> {
    match provider.fetch(date).await {
        Ok(timetable) => {
            if let Some(cache) = cache.cloned() {
                let copy = timetable.clone();
                let saved = tokio::task::spawn_blocking(move || {
                    let path = cache.save(&copy)?;
                    cache.cache.cleanup_before(copy.date());
                    Ok::<_, anyhow::Error>(path)
                })
                .await;
                match saved {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => tracing::debug!("Could not cache timetable: {:#}", e),
                    Err(e) => tracing::debug!("Cache writer failed: {}", e),
                }
            }
            Ok(timetable)
        }
        Err(e) => {
            if let Some(cache) = cache.cloned() {
                if let Ok(Some(cached)) = tokio::task::spawn_blocking(move || cache.load(date)).await {
                    tracing::info!("Provider unavailable ({}), using cached timetable for {}", e, date);
                    return Ok(cached);
                }
            }
            Err(e.to_string())
        }
    }
}

#[derive(Debug, Default)]
struct StopSignal {
    flag: AtomicBool,
    notify: Notify,
}

impl StopSignal {
    /// Returns `true` only for the call that actually flipped the flag.
    fn trigger(&self) -> bool {
        let first = !self.flag.swap(true, Ordering::SeqCst);
        if first {
            self.notify.notify_one();
        }
        first
    }

    fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
struct RefreshState {
    in_flight: bool,
    last_success: Option<Instant>,
    last_failure: Option<Instant>,
}

pub struct AdaptiveScheduler {
    clock: Arc<dyn Clock>,
    synced_clock: Option<Arc<SyncedClock>>,
    provider: Arc<dyn TimetableProvider>,
    cache: Option<CacheTarget>,
    dispatcher: NotificationDispatcher,
    audio: Option<Arc<AudioPlaybackManager>>,
    translator: Arc<dyn Translator>,
    pool: WorkerPool,
    alerts: AlertSettings,
    refresh_interval: Duration,

    timetable: Option<DailyTimetable>,
    today: Option<NaiveDate>,
    refresh: RefreshState,
    sync_in_flight: bool,
    last_sync_attempt: Option<Instant>,
    last_state: Option<ScheduleState>,
    ui: Option<UiCallback>,

    outbox: mpsc::UnboundedSender<SchedulerMessage>,
    inbox: Option<mpsc::UnboundedReceiver<SchedulerMessage>>,
    stop: Arc<StopSignal>,
    running: Arc<AtomicBool>,
}

impl AdaptiveScheduler {
    pub fn new(deps: SchedulerDeps) -> Self {
        let (outbox, inbox) = mpsc::unbounded_channel();
        Self {
            clock: deps.clock,
            synced_clock: deps.synced_clock,
            provider: deps.provider,
            cache: deps.cache,
            dispatcher: deps.dispatcher,
            audio: deps.audio,
            translator: deps.translator,
            pool: deps.pool,
            alerts: deps.alerts,
            refresh_interval: deps.refresh_interval,
            timetable: None,
            today: None,
            refresh: RefreshState::default(),
            sync_in_flight: false,
            last_sync_attempt: None,
            last_state: None,
            ui: None,
            outbox,
            inbox: Some(inbox),
            stop: Arc::new(StopSignal::default()),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Seed the loop with an already loaded timetable.
    pub fn with_timetable(mut self, timetable: DailyTimetable) -> Self {
        self.timetable = Some(timetable);
        self.refresh.last_success = Some(Instant::now());
        self
    }

    pub fn on_tick(mut self, callback: UiCallback) -> Self {
        self.ui = Some(callback);
        self
    }

    pub fn timetable(&self) -> Option<&DailyTimetable> {
        self.timetable.as_ref()
    }

    pub fn last_state(&self) -> Option<&ScheduleState> {
        self.last_state.as_ref()
    }

    /// Spawn the loop. The first tick runs immediately.
    pub fn start(self) -> SchedulerHandle {
        let tx = self.outbox.clone();
        let stop = self.stop.clone();
        let running = self.running.clone();
        running.store(true, Ordering::SeqCst);
        let runtime = self.pool.runtime().clone();
        let task = runtime.spawn(self.run());
        SchedulerHandle {
            tx,
            stop,
            running,
            task,
        }
    }

    /// Load a timetable if needed, run a single tick and wait for the alerts
    /// it triggered to finish.
    pub async fn run_once(mut self) -> Result<Option<ScheduleState>> {
        if self.timetable.is_none() {
            let today = self.clock.now_local().date_naive();
            let timetable = load_timetable(self.provider.as_ref(), self.cache.as_ref(), today)
                .await
                .map_err(|e| anyhow::anyhow!("No timetable available for {}: {}", today, e))?;
            self = self.with_timetable(timetable);
        }
        let ticked = self.tick();
        self.pool.wait_idle().await;
        ticked?;
        Ok(self.last_state)
    }

    async fn run(mut self) {
        let Some(mut inbox) = self.inbox.take() else {
            return;
        };
        let stop = self.stop.clone();
        tracing::info!("Scheduler started");

        let mut next_tick = Instant::now();
        loop {
            if stop.is_set() {
                break;
            }
            tokio::select! {
                biased;
                _ = stop.notify.notified() => {}
                msg = inbox.recv() => match msg {
                    Some(msg) => {
                        if self.handle_message(msg) {
                            next_tick = Instant::now();
                        }
                    }
                    None => break,
                },
                _ = tokio::time::sleep_until(next_tick) => {
                    let delay = match self.tick() {
                        Ok(delay) => delay,
                        Err(e) => {
                            tracing::error!("Scheduler tick failed: {:#}", e);
                            ERROR_RETRY
                        }
                    };
                    if stop.is_set() {
                        break;
                    }
                    next_tick = Instant::now() + delay;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        tracing::info!("Scheduler stopped");
    }

    /// Apply a posted-back message. Returns `true` when the loop should tick
    /// right away.
    fn handle_message(&mut self, msg: SchedulerMessage) -> bool {
        match msg {
            SchedulerMessage::TimetableLoaded(Ok(timetable)) => {
                tracing::info!("Loaded timetable for {}", timetable.date());
                self.timetable = Some(timetable);
                self.refresh.in_flight = false;
                self.refresh.last_success = Some(Instant::now());
                self.refresh.last_failure = None;
                true
            }
            SchedulerMessage::TimetableLoaded(Err(e)) => {
                tracing::warn!("Timetable refresh failed, keeping last known good: {}", e);
                self.refresh.in_flight = false;
                self.refresh.last_failure = Some(Instant::now());
                false
            }
            SchedulerMessage::ClockSynced => {
                self.sync_in_flight = false;
                true
            }
            SchedulerMessage::RefreshRequested => {
                let today = self.clock.now_local().date_naive();
                self.refresh.last_failure = None;
                if !self.refresh.in_flight {
                    self.request_refresh(today);
                }
                false
            }
        }
    }

    /// One pass: recompute, alert, report. Returns the re-arm delay.
    ///
    /// Alerts go out before the UI callback runs; a failing callback is
    /// reported after the state is stored.
    fn tick(&mut self) -> Result<Duration> {
        self.maybe_sync_clock();
        let now = self.clock.now_local().naive_local();
        self.roll_day(now.date());
        self.maybe_refresh(now.date());

        let Some(timetable) = self.timetable.clone() else {
            tracing::debug!("No timetable loaded yet");
            return Ok(NO_TIMETABLE_RETRY);
        };

        let state = ScheduleState::compute(&timetable, now);
        self.check_alerts(&timetable, now);

        let delay = rearm_delay(state.seconds_until_next, now.time());
        let reported = match self.ui.as_mut() {
            Some(ui) => ui(&state),
            None => Ok(()),
        };
        self.last_state = Some(state);
        reported.context("UI refresh callback failed")?;
        Ok(delay)
    }

    fn roll_day(&mut self, date: NaiveDate) {
        if self.today == Some(date) {
            return;
        }
        if self.today.is_some() {
            tracing::info!("Day changed to {}", date);
            self.dispatcher.reset_day();
        }
        self.today = Some(date);
    }

    fn maybe_refresh(&mut self, today: NaiveDate) {
        if self.refresh.in_flight {
            return;
        }
        let stale = self.timetable.as_ref().is_none_or(|t| t.date() != today);
        let due = self
            .refresh
            .last_success
            .is_none_or(|at| at.elapsed() >= self.refresh_interval);
        if !(stale || due) {
            return;
        }
        if self
            .refresh
            .last_failure
            .is_some_and(|at| at.elapsed() < REFRESH_RETRY)
        {
            return;
        }
        self.request_refresh(today);
    }

    fn request_refresh(&mut self, date: NaiveDate) {
        tracing::debug!("Requesting timetable for {}", date);
        self.refresh.in_flight = true;
        let provider = self.provider.clone();
        let cache = self.cache.clone();
        let tx = self.outbox.clone();
        self.pool.submit(async move {
            let result = load_timetable(provider.as_ref(), cache.as_ref(), date).await;
            let _ = tx.send(SchedulerMessage::TimetableLoaded(result));
        });
    }

    fn maybe_sync_clock(&mut self) {
        let Some(synced) = self.synced_clock.as_ref() else {
            return;
        };
        if self.sync_in_flight || !synced.needs_sync() {
            return;
        }
        if self
            .last_sync_attempt
            .is_some_and(|at| at.elapsed() < CLOCK_SYNC_RETRY)
        {
            return;
        }
        self.sync_in_flight = true;
        self.last_sync_attempt = Some(Instant::now());
        let synced = synced.clone();
        let tx = self.outbox.clone();
        self.pool.submit_blocking(move || {
            synced.warm_up();
            let _ = tx.send(SchedulerMessage::ClockSynced);
        });
    }

    fn check_alerts(&mut self, timetable: &DailyTimetable, now: NaiveDateTime) {
        let minute = minute_of_day(now.time());
        let lead = self.alerts.pre_alert_minutes % MINUTES_PER_DAY;

        for event in timetable.events() {
            if SILENT_EVENTS.contains(&event.name()) {
                continue;
            }
            let display_name = self.translator.get(event.name());

            let pre_alert_minute = (event.minute_of_day() + MINUTES_PER_DAY - lead) % MINUTES_PER_DAY;
            if lead > 0 && minute == pre_alert_minute {
                let title = self.translator.get("prayer_notification_alert");
                let minutes = lead.to_string();
                let message = render(
                    &self.translator.get("minutes_remaining_for_prayer"),
                    &[("minutes", minutes.as_str()), ("prayer_name", display_name.as_str())],
                );
                let outcome = self.dispatcher.send(
                    &title,
                    &message,
                    self.alerts.pre_alert_timeout_secs,
                    event.name(),
                    now.time(),
                );
                if outcome == SendOutcome::Dispatched {
                    self.play(self.alerts.notification_path.clone());
                }
            }

            if minute == event.minute_of_day() {
                let title = self.translator.get("prayer_time");
                let message = render(
                    &self.translator.get("its_time_for_prayer"),
                    &[("prayer_name", display_name.as_str())],
                );
                let key = format!("{}_adhan", event.name());
                let outcome = self.dispatcher.send(
                    &title,
                    &message,
                    self.alerts.at_time_timeout_secs,
                    &key,
                    now.time(),
                );
                if outcome == SendOutcome::Dispatched {
                    self.play(self.alerts.adhan_path.clone());
                }
            }
        }
    }

    fn play(&self, path: PathBuf) {
        if !self.alerts.sound_enabled {
            return;
        }
        let Some(audio) = self.audio.clone() else {
            return;
        };
        let volume = self.alerts.volume;
        self.pool.submit_blocking(move || {
            if let Err(e) = audio.play(&path, volume) {
                tracing::warn!("Could not play {}: {}", path.display(), e);
            }
        });
    }
}

/// Control surface for a running scheduler.
pub struct SchedulerHandle {
    tx: mpsc::UnboundedSender<SchedulerMessage>,
    stop: Arc<StopSignal>,
    running: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Ask the loop to exit after the current tick. Idempotent.
    pub fn stop(&self) {
        if self.stop.trigger() {
            tracing::debug!("Scheduler stop requested");
        }
    }

    /// Fetch the timetable again as soon as possible.
    pub fn refresh(&self) {
        let _ = self.tx.send(SchedulerMessage::RefreshRequested);
    }

    pub fn state(&self) -> SchedulerState {
        if self.running.load(Ordering::SeqCst) {
            SchedulerState::Running
        } else {
            SchedulerState::Stopped
        }
    }

    /// Wait for the loop to exit.
    pub async fn join(self) -> Result<()> {
        self.task.await.context("Scheduler task panicked")
    }
}
