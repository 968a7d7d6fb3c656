use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use config::{Config, Environment, File};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub location: LocationConfig,
    pub network: NetworkConfig,
    pub clock: ClockConfig,
    pub notifications: NotificationConfig,
    pub audio: AudioConfig,
    pub scheduler: SchedulerConfig,
    pub lifecycle: LifecycleConfig,
    pub language: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LocationConfig {
    pub city: String,
    pub country: String,
    /// Calculation method id passed through to the timetable provider.
    pub method: u8,
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            city: "Cairo".to_string(),
            country: "Egypt".to_string(),
            method: 5,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct NetworkConfig {
    pub api_url: String,
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub retries: u32,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.aladhan.com/v1/timingsByCity".to_string(),
            request_timeout_secs: 15,
            connect_timeout_secs: 10,
            retries: 3,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClockConfig {
    pub enabled: bool,
    pub servers: Vec<String>,
    pub timeout_secs: u64,
    pub validity_secs: u64,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            servers: default_time_servers(),
            timeout_secs: 5,
            validity_secs: 3600,
        }
    }
}

impl ClockConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn validity(&self) -> Duration {
        Duration::from_secs(self.validity_secs)
    }
}

fn default_time_servers() -> Vec<String> {
    ["pool.ntp.org", "time.google.com", "time.windows.com", "time.nist.gov"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

#[derive(Debug, Deserialize, Clone)]
pub struct NotificationConfig {
    pub enabled: bool,
    /// Minutes before each prayer at which the pre-alert fires.
    pub pre_alert_minutes: u16,
    pub pre_alert_timeout_secs: u64,
    pub at_time_timeout_secs: u64,
    pub icon: Option<PathBuf>,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            pre_alert_minutes: 5,
            pre_alert_timeout_secs: 15,
            at_time_timeout_secs: 20,
            icon: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AudioConfig {
    pub enabled: bool,
    pub volume: f32,
    pub adhan_file: Option<PathBuf>,
    pub notification_file: Option<PathBuf>,
    pub sounds_dir: PathBuf,
    /// Used to approximate end-of-track for backends without native end events.
    pub estimated_duration_secs: u64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            volume: 0.7,
            adhan_file: None,
            notification_file: None,
            sounds_dir: PathBuf::from("sounds"),
            estimated_duration_secs: 180,
        }
    }
}

impl AudioConfig {
    pub fn adhan_path(&self) -> PathBuf {
        self.adhan_file
            .clone()
            .unwrap_or_else(|| self.sounds_dir.join("adhan_mekka.wma"))
    }

    pub fn notification_path(&self) -> PathBuf {
        self.notification_file
            .clone()
            .unwrap_or_else(|| self.sounds_dir.join("notification.wav"))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    pub workers: usize,
    pub refresh_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 3,
            refresh_interval_secs: 3600,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LifecycleConfig {
    pub app_name: String,
    pub stale_lock_secs: u64,
    pub temp_prefix: String,
    pub temp_max_age_secs: u64,
    pub watchdog_poll_ms: u64,
    pub watchdog_max_wait_secs: u64,
    pub watchdog_settle_secs: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            app_name: "PrayerTimes".to_string(),
            stale_lock_secs: 3600,
            temp_prefix: "_MEI".to_string(),
            temp_max_age_secs: 3600,
            watchdog_poll_ms: 250,
            watchdog_max_wait_secs: 30,
            watchdog_settle_secs: 2,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            location: LocationConfig::default(),
            network: NetworkConfig::default(),
            clock: ClockConfig::default(),
            notifications: NotificationConfig::default(),
            audio: AudioConfig::default(),
            scheduler: SchedulerConfig::default(),
            lifecycle: LifecycleConfig::default(),
            language: "en".to_string(),
        }
    }
}

/// Per-user data directory (`~/.local/share/miqat` and friends).
pub fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("miqat")
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        // Load .env file (silently ignore if not present)
        let _ = dotenvy::dotenv();

        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("miqat");

        let builder = Config::builder()
            // 1. Defaults
            .set_default("language", "en")?
            // Location
            .set_default("location.city", "Cairo")?
            .set_default("location.country", "Egypt")?
            .set_default("location.method", 5)?
            // Network
            .set_default("network.api_url", "https://api.aladhan.com/v1/timingsByCity")?
            .set_default("network.request_timeout_secs", 15)?
            .set_default("network.connect_timeout_secs", 10)?
            .set_default("network.retries", 3)?
            // Clock
            .set_default("clock.enabled", true)?
            .set_default("clock.servers", default_time_servers())?
            .set_default("clock.timeout_secs", 5)?
            .set_default("clock.validity_secs", 3600)?
            // Notifications
            .set_default("notifications.enabled", true)?
            .set_default("notifications.pre_alert_minutes", 5)?
            .set_default("notifications.pre_alert_timeout_secs", 15)?
            .set_default("notifications.at_time_timeout_secs", 20)?
            .set_default("notifications.icon", None::<String>)?
            // Audio
            .set_default("audio.enabled", true)?
            .set_default("audio.volume", 0.7)?
            .set_default("audio.adhan_file", None::<String>)?
            .set_default("audio.notification_file", None::<String>)?
            .set_default("audio.sounds_dir", "sounds")?
            .set_default("audio.estimated_duration_secs", 180)?
            // Scheduler
            .set_default("scheduler.workers", 3)?
            .set_default("scheduler.refresh_interval_secs", 3600)?
            // Lifecycle
            .set_default("lifecycle.app_name", "PrayerTimes")?
            .set_default("lifecycle.stale_lock_secs", 3600)?
            .set_default("lifecycle.temp_prefix", "_MEI")?
            .set_default("lifecycle.temp_max_age_secs", 3600)?
            .set_default("lifecycle.watchdog_poll_ms", 250)?
            .set_default("lifecycle.watchdog_max_wait_secs", 30)?
            .set_default("lifecycle.watchdog_settle_secs", 2)?

            // 2. Local config file (optional, lowest priority)
            .add_source(File::from(PathBuf::from("config.toml")).required(false))

            // 3. User config directory (optional, overrides local)
            .add_source(File::from(config_dir.join("config.toml")).required(false))

            // 4. Environment variables (MIQAT__AUDIO__VOLUME=0.5)
            .add_source(
                Environment::with_prefix("MIQAT")
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("clock.servers")
                    .try_parsing(true),
            );

        let s = builder.build()?;
        Ok(s.try_deserialize()?)
    }
}
