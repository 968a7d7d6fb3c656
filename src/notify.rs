//! Notification tiers and the deduplicating dispatcher in front of them.

use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveTime;
use thiserror::Error;

use crate::config::NotificationConfig;
use crate::scheduler::{FireRegistry, WorkerPool};
use crate::traits::Notifier;

/// Longest a notification command may run before it is killed.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Longest a whole tier chain may hold a worker permit.
pub const DELIVERY_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification tier {0} is not available")]
    BackendUnavailable(String),
    #[error("notification tier {tier} failed: {reason}")]
    Backend { tier: String, reason: String },
}

/// Everything a tier needs to show one alert.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationRequest {
    pub title: String,
    pub message: String,
    pub timeout: Duration,
    pub icon: Option<PathBuf>,
    pub app_name: String,
}

impl NotificationRequest {
    pub fn new(title: impl Into<String>, message: impl Into<String>, timeout_secs: u64) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
            timeout: Duration::from_secs(timeout_secs),
            icon: None,
            app_name: "PrayerTimes".to_string(),
        }
    }

    pub fn with_icon(mut self, icon: Option<PathBuf>) -> Self {
        self.icon = icon;
        self
    }

    pub fn with_app_name(mut self, app_name: impl Into<String>) -> Self {
        self.app_name = app_name.into();
        self
    }
}

// ==================== Desktop Tier ====================

/// Native toast through notify-rust (D-Bus, NSUserNotification, WinRT).
#[cfg(feature = "desktop")]
#[derive(Debug, Clone, Default)]
pub struct DesktopNotifier;

#[cfg(feature = "desktop")]
impl Notifier for DesktopNotifier {
    fn name(&self) -> &str {
        "desktop"
    }

    fn probe(&self) -> bool {
        #[cfg(all(unix, not(target_os = "macos")))]
        {
            notify_rust::get_server_information().is_ok()
        }
        #[cfg(not(all(unix, not(target_os = "macos"))))]
        {
            true
        }
    }

    fn notify(&self, request: &NotificationRequest) -> Result<(), NotifyError> {
        let mut notification = notify_rust::Notification::new();
        notification
            .summary(&request.title)
            .body(&request.message)
            .appname(&request.app_name)
            .timeout(notify_rust::Timeout::Milliseconds(
                u32::try_from(request.timeout.as_millis()).unwrap_or(u32::MAX),
            ));
        if let Some(icon) = request.icon.as_ref().and_then(|p| p.to_str()) {
            notification.icon(icon);
        }
        notification.show().map_err(|e| NotifyError::Backend {
            tier: "desktop".to_string(),
            reason: e.to_string(),
        })?;
        Ok(())
    }
}

// ==================== Command Tier ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    NotifySend,
    Osascript,
    PowerShell,
}

impl CommandKind {
    pub fn program(self) -> &'static str {
        match self {
            CommandKind::NotifySend => "notify-send",
            CommandKind::Osascript => "osascript",
            CommandKind::PowerShell => "powershell",
        }
    }
}

/// Shells out to the platform's notification command.
#[derive(Debug, Clone)]
pub struct CommandNotifier {
    kind: CommandKind,
}

impl CommandNotifier {
    pub fn new(kind: CommandKind) -> Self {
        Self { kind }
    }

    pub fn for_platform() -> Self {
        let kind = if cfg!(target_os = "windows") {
            CommandKind::PowerShell
        } else if cfg!(target_os = "macos") {
            CommandKind::Osascript
        } else {
            CommandKind::NotifySend
        };
        Self::new(kind)
    }

    /// Arguments for one request, without the program name.
    pub fn args_for(&self, request: &NotificationRequest) -> Vec<String> {
        match self.kind {
            CommandKind::NotifySend => {
                let mut args = vec![
                    "-a".to_string(),
                    request.app_name.clone(),
                    "-t".to_string(),
                    request.timeout.as_millis().to_string(),
                ];
                if let Some(icon) = &request.icon {
                    args.push("-i".to_string());
                    args.push(icon.display().to_string());
                }
                args.push(request.title.clone());
                args.push(request.message.clone());
                args
            }
            CommandKind::Osascript => vec![
                "-e".to_string(),
                format!(
                    "display notification {} with title {}",
                    applescript_quote(&request.message),
                    applescript_quote(&request.title)
                ),
            ],
            CommandKind::PowerShell => vec![
                "-NoProfile".to_string(),
                "-WindowStyle".to_string(),
                "Hidden".to_string(),
                "-Command".to_string(),
                format!(
                    "Add-Type -AssemblyName System.Windows.Forms; \
                     $n = New-Object System.Windows.Forms.NotifyIcon; \
                     $n.Icon = [System.Drawing.SystemIcons]::Information; \
                     $n.BalloonTipTitle = {}; $n.BalloonTipText = {}; \
                     $n.Visible = $true; $n.ShowBalloonTip({}); \
                     Start-Sleep -Seconds {}; $n.Dispose()",
                    powershell_quote(&request.title),
                    powershell_quote(&request.message),
                    request.timeout.as_millis(),
                    request.timeout.as_secs().max(1)
                ),
            ],
        }
    }

    fn failure(&self, reason: impl ToString) -> NotifyError {
        NotifyError::Backend {
            tier: self.kind.program().to_string(),
            reason: reason.to_string(),
        }
    }
}

impl Notifier for CommandNotifier {
    fn name(&self) -> &str {
        self.kind.program()
    }

    fn probe(&self) -> bool {
        which::which(self.kind.program()).is_ok()
    }

    fn notify(&self, request: &NotificationRequest) -> Result<(), NotifyError> {
        let mut command = Command::new(self.kind.program());
        command
            .args(self.args_for(request))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        // The balloon script has to outlive its own timeout; don't hold a
        // worker for it.
        if self.kind == CommandKind::PowerShell {
            command.spawn().map_err(|e| self.failure(e))?;
            return Ok(());
        }

        run_bounded(&mut command, COMMAND_TIMEOUT).map_err(|e| self.failure(e))
    }
}

/// Run `command` to completion, killing it once `timeout` has passed.
fn run_bounded(command: &mut Command, timeout: Duration) -> Result<(), String> {
    let program = command.get_program().to_string_lossy().into_owned();
    let mut child = command
        .spawn()
        .map_err(|e| format!("failed to spawn {program}: {e}"))?;
    let started = std::time::Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(status)) if status.success() => return Ok(()),
            Ok(Some(status)) => {
                let mut stderr = String::new();
                if let Some(mut pipe) = child.stderr.take() {
                    let _ = pipe.read_to_string(&mut stderr);
                }
                return Err(format!("{}: {}", status, stderr.trim()));
            }
            Ok(None) if started.elapsed() >= timeout => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(format!("{program} timed out after {timeout:?}"));
            }
            Ok(None) => std::thread::sleep(Duration::from_millis(50)),
            Err(e) => return Err(e.to_string()),
        }
    }
}

fn applescript_quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

fn powershell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

// ==================== Console Tier ====================

/// Last resort: print the alert. Always available.
#[derive(Debug, Clone, Default)]
pub struct ConsoleNotifier;

impl Notifier for ConsoleNotifier {
    fn name(&self) -> &str {
        "console"
    }

    fn notify(&self, request: &NotificationRequest) -> Result<(), NotifyError> {
        eprintln!("[{}] {}: {}", request.app_name, request.title, request.message);
        tracing::info!("Alert: {} - {}", request.title, request.message);
        Ok(())
    }
}

/// Every tier this build knows about, richest first.
pub fn default_tiers() -> Vec<Arc<dyn Notifier>> {
    let mut tiers: Vec<Arc<dyn Notifier>> = Vec::new();
    #[cfg(feature = "desktop")]
    tiers.push(Arc::new(DesktopNotifier));
    tiers.push(Arc::new(CommandNotifier::for_platform()));
    tiers.push(Arc::new(ConsoleNotifier));
    tiers
}

// ==================== Dispatcher ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Same key already fired in this minute.
    Suppressed,
    /// Recorded and handed to a worker.
    Dispatched,
    /// Recorded, but notifications are switched off.
    Disabled,
}

/// Walk `tiers` in order until one delivers. Returns the winning tier's name.
pub fn deliver_chain(tiers: &[Arc<dyn Notifier>], request: &NotificationRequest) -> Option<String> {
    for tier in tiers {
        match tier.notify(request) {
            Ok(()) => {
                tracing::debug!("Notification delivered via {}", tier.name());
                return Some(tier.name().to_string());
            }
            Err(e) => tracing::debug!("Notification tier {} failed: {}", tier.name(), e),
        }
    }
    tracing::warn!(
        "No notification tier could deliver '{}' ({} tried)",
        request.title,
        tiers.len()
    );
    None
}

/// Deduplicates alerts per event key and minute, then fans the delivery out
/// to the worker pool.
///
/// Lives on the scheduler loop; the registry has no other writer.
pub struct NotificationDispatcher {
    tiers: Arc<Vec<Arc<dyn Notifier>>>,
    capabilities: Vec<(String, bool)>,
    registry: FireRegistry,
    pool: WorkerPool,
    enabled: bool,
    app_name: String,
    icon: Option<PathBuf>,
    delivery_timeout: Duration,
}

impl NotificationDispatcher {
    /// Probe each candidate once; unavailable tiers are dropped from the chain.
    pub fn probe(candidates: Vec<Arc<dyn Notifier>>, pool: WorkerPool) -> Self {
        let mut capabilities = Vec::with_capacity(candidates.len());
        let mut tiers = Vec::new();
        for tier in candidates {
            let available = tier.probe();
            tracing::debug!("Notification tier {} available: {}", tier.name(), available);
            capabilities.push((tier.name().to_string(), available));
            if available {
                tiers.push(tier);
            }
        }
        Self {
            tiers: Arc::new(tiers),
            capabilities,
            registry: FireRegistry::default(),
            pool,
            enabled: true,
            app_name: "PrayerTimes".to_string(),
            icon: None,
            delivery_timeout: DELIVERY_TIMEOUT,
        }
    }

    pub fn from_config(config: &NotificationConfig, app_name: &str, pool: WorkerPool) -> Self {
        let mut dispatcher = Self::probe(default_tiers(), pool);
        dispatcher.enabled = config.enabled;
        dispatcher.app_name = app_name.to_string();
        dispatcher.icon = config.icon.clone();
        dispatcher
    }

    /// Cap on how long one delivery may occupy a worker. A chain that runs
    /// past it is abandoned and its permit returned to the pool.
    pub fn with_delivery_timeout(mut self, timeout: Duration) -> Self {
        self.delivery_timeout = timeout;
        self
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Names of the tiers that passed their probe, in chain order.
    pub fn available_tiers(&self) -> Vec<&str> {
        self.tiers.iter().map(|t| t.name()).collect()
    }

    /// Probe result for every candidate, including the unavailable ones.
    pub fn capabilities(&self) -> &[(String, bool)] {
        &self.capabilities
    }

    pub fn registry(&self) -> &FireRegistry {
        &self.registry
    }

    /// Forget all fired keys. Called when the calendar day changes.
    pub fn reset_day(&mut self) {
        self.registry.clear();
    }

    /// Send one alert unless `event_key` already fired at `now`'s minute.
    ///
    /// The key is recorded before delivery starts and regardless of how the
    /// delivery ends.
    pub fn send(
        &mut self,
        title: &str,
        message: &str,
        timeout_secs: u64,
        event_key: &str,
        now: NaiveTime,
    ) -> SendOutcome {
        let stamp = now.format("%H:%M").to_string();
        if !self.registry.should_fire(event_key, &stamp) {
            tracing::debug!("Suppressed duplicate alert {} at {}", event_key, stamp);
            return SendOutcome::Suppressed;
        }
        self.registry.record(event_key, &stamp);

        if !self.enabled {
            return SendOutcome::Disabled;
        }

        let request = NotificationRequest::new(title, message, timeout_secs)
            .with_icon(self.icon.clone())
            .with_app_name(self.app_name.clone());
        let tiers = self.tiers.clone();
        let deadline = self.delivery_timeout;
        let key = event_key.to_string();
        self.pool.submit(async move {
            let delivery = tokio::task::spawn_blocking(move || deliver_chain(&tiers, &request));
            match tokio::time::timeout(deadline, delivery).await {
                Ok(Ok(winner)) => winner,
                Ok(Err(e)) => {
                    tracing::error!("Notification delivery for {} failed: {}", key, e);
                    None
                }
                Err(_) => {
                    tracing::warn!("Notification delivery for {} timed out after {:?}", key, deadline);
                    None
                }
            }
        });
        SendOutcome::Dispatched
    }
}
