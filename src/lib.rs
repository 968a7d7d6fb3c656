//! Miqat Library
//!
//! Prayer-time scheduling core: the daily timetable, the adaptive tick loop,
//! notification and audio delivery, clock correction and process lifecycle.

pub mod api;
pub mod audio;
pub mod cache;
pub mod clock_sync;
pub mod config;
pub mod i18n;
pub mod lifecycle;
pub mod notify;
pub mod scheduler;
pub mod timetable;
pub mod traits;

// Re-export commonly used types
pub use api::{AladhanClient, ProviderError};
pub use audio::{AudioError, AudioPlaybackManager, PlaybackId};
pub use cache::TimetableCache;
pub use clock_sync::{ClockOffset, SyncedClock};
pub use config::AppConfig;
pub use i18n::{Catalog, Translator};
pub use lifecycle::{InstanceLock, LockError, Watchdog, WatchdogReport};
pub use notify::{NotificationDispatcher, NotificationRequest, SendOutcome};
pub use scheduler::{
    AdaptiveScheduler, AlertSettings, CacheTarget, FireRegistry, ScheduleState, SchedulerDeps,
    SchedulerHandle, SchedulerState, WorkerPool, tick_interval,
};
pub use timetable::{DailyTimetable, NextEvent, PrayerEvent, Status, TimeParser};
pub use traits::{
    AudioBackend, Clock, MockAudioBackend, MockClock, MockNotifier, MockTimeSource, Notifier,
    StaticProvider, SystemClock, TimeSource, TimetableProvider,
};
