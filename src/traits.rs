//! Abstractions for time and side effects to enable testing.
//!
//! This module provides traits for:
//! - `Clock`: Abstracting time access for deterministic testing
//! - `TimeSource`: A single network time server
//! - `Notifier`: One notification tier
//! - `AudioBackend` / `PlaybackHandle`: One sound-playing tier
//! - `TimetableProvider`: The external source of daily timetables

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, TimeZone, Utc};

use crate::api::ProviderError;
use crate::audio::AudioError;
use crate::clock_sync::ClockSyncError;
use crate::notify::{NotificationRequest, NotifyError};
use crate::timetable::DailyTimetable;

// ==================== Clock Trait ====================

/// Trait for abstracting time access.
///
/// This allows injecting mock clocks during testing to create
/// deterministic, reproducible tests for time-dependent logic.
pub trait Clock: Send + Sync {
    /// Get the current time in UTC.
    fn now_utc(&self) -> DateTime<Utc>;

    /// Get the current time in the local timezone.
    fn now_local(&self) -> DateTime<Local>;
}

/// System clock implementation using real time.
#[derive(Debug, Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn now_local(&self) -> DateTime<Local> {
        Local::now()
    }
}

/// Mock clock for testing with controllable time.
#[derive(Debug, Clone)]
pub struct MockClock {
    utc_time: Arc<Mutex<DateTime<Utc>>>,
}

impl MockClock {
    /// Create a new mock clock set to the given UTC time.
    pub fn new(time: DateTime<Utc>) -> Self {
        Self {
            utc_time: Arc::new(Mutex::new(time)),
        }
    }

    /// Create a mock clock whose local wall time is `local`.
    pub fn at_local(local: NaiveDateTime) -> Self {
        Self::new(local_to_utc(local))
    }

    /// Set the mock clock to a new time.
    pub fn set_time(&self, time: DateTime<Utc>) {
        *self.utc_time.lock().unwrap() = time;
    }

    /// Set the mock clock to a local wall time.
    pub fn set_local(&self, local: NaiveDateTime) {
        self.set_time(local_to_utc(local));
    }

    /// Advance the clock by a duration.
    pub fn advance(&self, duration: chrono::Duration) {
        let mut time = self.utc_time.lock().unwrap();
        *time = *time + duration;
    }
}

fn local_to_utc(local: NaiveDateTime) -> DateTime<Utc> {
    Local
        .from_local_datetime(&local)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| local.and_utc())
}

impl Clock for MockClock {
    fn now_utc(&self) -> DateTime<Utc> {
        *self.utc_time.lock().unwrap()
    }

    fn now_local(&self) -> DateTime<Local> {
        self.now_utc().with_timezone(&Local)
    }
}

// ==================== TimeSource Trait ====================

/// A single network time server queried by `SyncedClock`.
pub trait TimeSource: Send + Sync {
    fn name(&self) -> &str;

    /// Blocking fetch of the server's current UTC time.
    fn fetch(&self) -> Result<DateTime<Utc>, ClockSyncError>;
}

/// Time source returning a fixed offset from the wall clock, or failing.
#[derive(Debug, Clone)]
pub struct MockTimeSource {
    name: String,
    offset: Option<chrono::Duration>,
    calls: Arc<AtomicUsize>,
}

impl MockTimeSource {
    pub fn ok(name: &str, offset: chrono::Duration) -> Self {
        Self {
            name: name.to_string(),
            offset: Some(offset),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn failing(name: &str) -> Self {
        Self {
            name: name.to_string(),
            offset: None,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl TimeSource for MockTimeSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn fetch(&self) -> Result<DateTime<Utc>, ClockSyncError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.offset {
            Some(offset) => Ok(Utc::now() + offset),
            None => Err(ClockSyncError::Timeout(self.name.clone())),
        }
    }
}

// ==================== Notifier Trait ====================

/// One tier of the notification fallback chain.
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the tier is usable on this system. Called once at startup.
    fn probe(&self) -> bool {
        true
    }

    /// Deliver a notification. Any error lets the chain fall through.
    fn notify(&self, request: &NotificationRequest) -> Result<(), NotifyError>;
}

/// Mock notifier for testing that records all notifications.
#[derive(Debug, Clone)]
pub struct MockNotifier {
    name: String,
    available: bool,
    failing: bool,
    hang: Option<Duration>,
    notifications: Arc<Mutex<Vec<(String, String)>>>,
    attempts: Arc<AtomicUsize>,
}

impl Default for MockNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl MockNotifier {
    /// Create a new mock notifier.
    pub fn new() -> Self {
        Self::named("mock")
    }

    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            available: true,
            failing: false,
            hang: None,
            notifications: Arc::new(Mutex::new(Vec::new())),
            attempts: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// A tier whose every delivery attempt fails.
    pub fn failing(name: &str) -> Self {
        Self {
            failing: true,
            ..Self::named(name)
        }
    }

    /// A tier that blocks for `hang` before each delivery.
    pub fn hanging(name: &str, hang: Duration) -> Self {
        Self {
            hang: Some(hang),
            ..Self::named(name)
        }
    }

    /// A tier that reports itself unavailable when probed.
    pub fn unavailable(name: &str) -> Self {
        Self {
            available: false,
            ..Self::named(name)
        }
    }

    /// Get all notifications that have been delivered.
    pub fn get_notifications(&self) -> Vec<(String, String)> {
        self.notifications.lock().unwrap().clone()
    }

    /// Get the count of notifications delivered.
    pub fn notification_count(&self) -> usize {
        self.notifications.lock().unwrap().len()
    }

    /// Delivery attempts, including failed ones.
    pub fn attempt_count(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Clear all recorded notifications.
    pub fn clear(&self) {
        self.notifications.lock().unwrap().clear();
        self.attempts.store(0, Ordering::SeqCst);
    }

    /// Check if any notification was delivered.
    pub fn was_called(&self) -> bool {
        !self.notifications.lock().unwrap().is_empty()
    }
}

impl Notifier for MockNotifier {
    fn name(&self) -> &str {
        &self.name
    }

    fn probe(&self) -> bool {
        self.available
    }

    fn notify(&self, request: &NotificationRequest) -> Result<(), NotifyError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(hang) = self.hang {
            std::thread::sleep(hang);
        }
        if self.failing {
            return Err(NotifyError::Backend {
                tier: self.name.clone(),
                reason: "mock failure".to_string(),
            });
        }
        self.notifications
            .lock()
            .unwrap()
            .push((request.title.clone(), request.message.clone()));
        Ok(())
    }
}

// ==================== Audio Traits ====================

/// Callback fired once when a track finishes.
pub type EndCallback = Box<dyn FnOnce() + Send + 'static>;

/// A sound that has started playing on some backend.
pub trait PlaybackHandle: Send {
    /// Stop playback and release backend resources. Idempotent.
    fn stop(&mut self);

    /// Attach a native end-of-track callback. Returns `false` when the
    /// backend cannot report the end of a track; the callback is dropped.
    fn on_end(&mut self, callback: EndCallback) -> bool;

    fn is_finished(&self) -> bool;
}

/// One tier of the audio fallback chain.
pub trait AudioBackend: Send + Sync {
    fn name(&self) -> &str;

    fn probe(&self) -> bool {
        true
    }

    /// Whether handles from this backend deliver native end events.
    fn supports_end_events(&self) -> bool;

    /// Begin playing `path` at `volume` in `[0.0, 1.0]`.
    fn play(&self, path: &Path, volume: f32) -> Result<Box<dyn PlaybackHandle>, AudioError>;
}

/// Shared record of what a `MockAudioBackend` was asked to do.
#[derive(Debug, Default)]
pub struct MockAudioLog {
    pub plays: Mutex<Vec<(PathBuf, f32)>>,
    pub stops: AtomicUsize,
}

/// Mock audio backend for testing.
#[derive(Clone)]
pub struct MockAudioBackend {
    name: String,
    available: bool,
    failing: bool,
    native_end: bool,
    log: Arc<MockAudioLog>,
    last_end: Arc<Mutex<Option<Arc<MockTrack>>>>,
}

/// State of one mock track, shared between the handle and the test.
#[derive(Default)]
pub struct MockTrack {
    finished: AtomicBool,
    callback: Mutex<Option<EndCallback>>,
}

impl MockTrack {
    /// Simulate the backend reaching the end of the track.
    pub fn finish(&self) {
        self.finished.store(true, Ordering::SeqCst);
        let callback = self.callback.lock().unwrap().take();
        if let Some(cb) = callback {
            cb();
        }
    }
}

impl MockAudioBackend {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            available: true,
            failing: false,
            native_end: false,
            log: Arc::new(MockAudioLog::default()),
            last_end: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_native_end(mut self) -> Self {
        self.native_end = true;
        self
    }

    pub fn failing(name: &str) -> Self {
        Self {
            failing: true,
            ..Self::new(name)
        }
    }

    pub fn unavailable(name: &str) -> Self {
        Self {
            available: false,
            ..Self::new(name)
        }
    }

    pub fn plays(&self) -> Vec<(PathBuf, f32)> {
        self.log.plays.lock().unwrap().clone()
    }

    pub fn stop_count(&self) -> usize {
        self.log.stops.load(Ordering::SeqCst)
    }

    /// Track started by the most recent `play`.
    pub fn last_track(&self) -> Option<Arc<MockTrack>> {
        self.last_end.lock().unwrap().clone()
    }
}

struct MockHandle {
    native_end: bool,
    stopped: bool,
    track: Arc<MockTrack>,
    log: Arc<MockAudioLog>,
}

impl PlaybackHandle for MockHandle {
    fn stop(&mut self) {
        if !self.stopped {
            self.stopped = true;
            self.log.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn on_end(&mut self, callback: EndCallback) -> bool {
        if !self.native_end {
            return false;
        }
        *self.track.callback.lock().unwrap() = Some(callback);
        true
    }

    fn is_finished(&self) -> bool {
        self.stopped || self.track.finished.load(Ordering::SeqCst)
    }
}

impl AudioBackend for MockAudioBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn probe(&self) -> bool {
        self.available
    }

    fn supports_end_events(&self) -> bool {
        self.native_end
    }

    fn play(&self, path: &Path, volume: f32) -> Result<Box<dyn PlaybackHandle>, AudioError> {
        if self.failing {
            return Err(AudioError::Backend {
                tier: self.name.clone(),
                reason: "mock failure".to_string(),
            });
        }
        self.log
            .plays
            .lock()
            .unwrap()
            .push((path.to_path_buf(), volume));
        let track = Arc::new(MockTrack::default());
        *self.last_end.lock().unwrap() = Some(track.clone());
        Ok(Box::new(MockHandle {
            native_end: self.native_end,
            stopped: false,
            track,
            log: self.log.clone(),
        }))
    }
}

// ==================== TimetableProvider Trait ====================

/// External source of one day's timetable.
#[async_trait]
pub trait TimetableProvider: Send + Sync {
    async fn fetch(&self, date: NaiveDate) -> Result<DailyTimetable, ProviderError>;
}

/// Provider serving a fixed timetable re-dated to the requested day.
#[derive(Debug, Clone)]
pub struct StaticProvider {
    template: Option<DailyTimetable>,
    delay: Duration,
    calls: Arc<AtomicUsize>,
}

impl StaticProvider {
    pub fn new(template: DailyTimetable) -> Self {
        Self {
            template: Some(template),
            delay: Duration::ZERO,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// A provider that always fails with a transient error.
    pub fn offline() -> Self {
        Self {
            template: None,
            delay: Duration::ZERO,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TimetableProvider for StaticProvider {
    async fn fetch(&self, date: NaiveDate) -> Result<DailyTimetable, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let template = self
            .template
            .as_ref()
            .ok_or_else(|| ProviderError::Transient("offline".to_string()))?;
        let pairs = template
            .events()
            .iter()
            .map(|e| (e.name().to_string(), e.minute_of_day()));
        DailyTimetable::from_pairs(date, pairs).map_err(ProviderError::from)
    }
}
