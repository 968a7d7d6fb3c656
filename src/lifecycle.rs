//! Single-instance locking, out-of-process restart and temp cleanup.
//!
//! The lock is a plain file created with `create_new`, so the OS guarantees at
//! most one holder. Its content (the owner's pid) is diagnostic only; existence
//! and modification time decide whether it is live or stale.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant, SystemTime};

use anyhow::{Context, Result};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::LifecycleConfig;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("{0} is already running")]
    AlreadyRunning(String),
    #[error("lock file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Where lock files live unless told otherwise.
pub fn default_lock_dir() -> PathBuf {
    std::env::temp_dir()
}

/// Contents of a lock file as read back from disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRecord {
    pub path: PathBuf,
    pub pid: u32,
    pub modified: SystemTime,
}

impl LockRecord {
    pub fn read(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read lock file {}", path.display()))?;
        let pid = text
            .lines()
            .next()
            .unwrap_or_default()
            .trim()
            .parse::<u32>()
            .with_context(|| format!("Lock file {} has no pid", path.display()))?;
        let modified = fs::metadata(path)
            .and_then(|m| m.modified())
            .with_context(|| format!("Failed to stat lock file {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            pid,
            modified,
        })
    }

    pub fn age(&self) -> Duration {
        SystemTime::now()
            .duration_since(self.modified)
            .unwrap_or(Duration::ZERO)
    }
}

/// Exclusive per-application lock file. Released on drop.
#[derive(Debug)]
pub struct InstanceLock {
    app_name: String,
    path: PathBuf,
    stale_after: Duration,
    file: Option<File>,
}

impl InstanceLock {
    pub fn new(dir: impl AsRef<Path>, app_name: &str, stale_after: Duration) -> Self {
        Self {
            app_name: app_name.to_string(),
            path: dir.as_ref().join(format!("{app_name}.lock")),
            stale_after,
            file: None,
        }
    }

    pub fn from_config(config: &LifecycleConfig) -> Self {
        Self::new(
            default_lock_dir(),
            &config.app_name,
            Duration::from_secs(config.stale_lock_secs),
        )
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_held(&self) -> bool {
        self.file.is_some()
    }

    /// Take the lock. `Ok(false)` means a live holder exists.
    ///
    /// A lock older than `stale_after` is removed and creation retried once.
    pub fn acquire(&mut self) -> Result<bool, LockError> {
        if self.is_held() {
            return Ok(true);
        }

        match self.try_create() {
            Ok(()) => return Ok(true),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(self.io_error(e)),
        }

        match self.lock_age() {
            Some(age) if age <= self.stale_after => {
                info!(
                    "Lock {} is held ({}s old)",
                    self.path.display(),
                    age.as_secs()
                );
                return Ok(false);
            }
            Some(age) => {
                warn!(
                    "Removing stale lock {} ({}s old)",
                    self.path.display(),
                    age.as_secs()
                );
                if let Err(e) = fs::remove_file(&self.path) {
                    if e.kind() != io::ErrorKind::NotFound {
                        return Err(self.io_error(e));
                    }
                }
            }
            // Vanished between the failed create and the stat.
            None => {}
        }

        match self.try_create() {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(self.io_error(e)),
        }
    }

    /// Like [`acquire`](Self::acquire) but contention is an error.
    pub fn acquire_or_fail(&mut self) -> Result<(), LockError> {
        if self.acquire()? {
            Ok(())
        } else {
            Err(LockError::AlreadyRunning(self.app_name.clone()))
        }
    }

    /// Close and delete the lock file. Safe to call repeatedly.
    pub fn release(&mut self) {
        let Some(file) = self.file.take() else {
            return;
        };
        drop(file);
        match fs::remove_file(&self.path) {
            Ok(()) => debug!("Released lock {}", self.path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => debug!("Could not remove lock {}: {}", self.path.display(), e),
        }
    }

    fn try_create(&mut self) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)?;
        writeln!(file, "{}", std::process::id())?;
        file.flush()?;
        debug!("Acquired lock {}", self.path.display());
        self.file = Some(file);
        Ok(())
    }

    fn lock_age(&self) -> Option<Duration> {
        let modified = fs::metadata(&self.path).and_then(|m| m.modified()).ok()?;
        Some(
            SystemTime::now()
                .duration_since(modified)
                .unwrap_or(Duration::ZERO),
        )
    }

    fn io_error(&self, source: io::Error) -> LockError {
        LockError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        self.release();
    }
}

// ==================== Processes ====================

/// Whether `pid` names a running process.
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 only checks for existence and permission.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(windows)]
pub fn process_alive(pid: u32) -> bool {
    use windows::Win32::Foundation::{CloseHandle, STILL_ACTIVE};
    use windows::Win32::System::Threading::{
        GetExitCodeProcess, OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION,
    };

    // SAFETY: the handle is closed before returning.
    unsafe {
        let Ok(handle) = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, false, pid) else {
            return false;
        };
        let mut code = 0u32;
        let queried = GetExitCodeProcess(handle, &mut code).is_ok();
        let _ = CloseHandle(handle);
        queried && code == STILL_ACTIVE.0 as u32
    }
}

/// Start `program` with no inherited stdio, outside our process group.
pub fn spawn_detached(program: &Path, args: &[String]) -> io::Result<u32> {
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }
    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        const DETACHED_PROCESS: u32 = 0x0000_0008;
        command.creation_flags(DETACHED_PROCESS);
    }

    let child = command.spawn()?;
    Ok(child.id())
}

/// Hand off to the watchdog, which relaunches `target_exe` once we exit.
///
/// The caller is expected to shut down promptly after this returns.
pub fn restart(watchdog_exe: &Path, target_exe: &Path) -> Result<()> {
    let args = vec![
        target_exe.display().to_string(),
        std::process::id().to_string(),
    ];
    let pid = spawn_detached(watchdog_exe, &args)
        .with_context(|| format!("Failed to start watchdog {}", watchdog_exe.display()))?;
    info!(
        "Watchdog {} (pid {}) will relaunch {}",
        watchdog_exe.display(),
        pid,
        target_exe.display()
    );
    Ok(())
}

// ==================== Watchdog ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogPhase {
    Waiting,
    Settling,
    Relaunching,
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchdogReport {
    /// False when the wait timed out with the parent still alive.
    pub parent_exited: bool,
    pub waited: Duration,
    pub relaunched: bool,
}

type Liveness = Box<dyn FnMut(u32) -> bool + Send>;
type Spawner = Box<dyn FnMut(&Path) -> io::Result<()> + Send>;

/// Waits for a parent process to exit, then relaunches its executable.
pub struct Watchdog {
    target: PathBuf,
    parent_pid: u32,
    poll_interval: Duration,
    max_wait: Duration,
    settle: Duration,
    phase: WatchdogPhase,
    is_alive: Liveness,
    spawn: Spawner,
}

impl Watchdog {
    pub fn new(target: impl Into<PathBuf>, parent_pid: u32) -> Self {
        Self {
            target: target.into(),
            parent_pid,
            poll_interval: Duration::from_millis(250),
            max_wait: Duration::from_secs(30),
            settle: Duration::from_secs(2),
            phase: WatchdogPhase::Waiting,
            is_alive: Box::new(process_alive),
            spawn: Box::new(|path| spawn_detached(path, &[]).map(|_| ())),
        }
    }

    pub fn from_config(target: impl Into<PathBuf>, parent_pid: u32, config: &LifecycleConfig) -> Self {
        Self::new(target, parent_pid).with_timing(
            Duration::from_millis(config.watchdog_poll_ms),
            Duration::from_secs(config.watchdog_max_wait_secs),
            Duration::from_secs(config.watchdog_settle_secs),
        )
    }

    pub fn with_timing(mut self, poll_interval: Duration, max_wait: Duration, settle: Duration) -> Self {
        self.poll_interval = poll_interval;
        self.max_wait = max_wait;
        self.settle = settle;
        self
    }

    pub fn with_liveness(mut self, probe: impl FnMut(u32) -> bool + Send + 'static) -> Self {
        self.is_alive = Box::new(probe);
        self
    }

    pub fn with_spawner(mut self, spawn: impl FnMut(&Path) -> io::Result<()> + Send + 'static) -> Self {
        self.spawn = Box::new(spawn);
        self
    }

    pub fn phase(&self) -> WatchdogPhase {
        self.phase
    }

    /// Drive the state machine to `Done`. Blocks the calling thread.
    pub fn run(&mut self) -> WatchdogReport {
        let started = Instant::now();
        let mut parent_exited = false;
        let mut relaunched = false;

        while self.phase != WatchdogPhase::Done {
            self.phase = match self.phase {
                WatchdogPhase::Waiting => {
                    if !(self.is_alive)(self.parent_pid) {
                        info!("Parent {} exited", self.parent_pid);
                        parent_exited = true;
                        WatchdogPhase::Settling
                    } else if started.elapsed() >= self.max_wait {
                        warn!(
                            "Parent {} still alive after {:?}, relaunching anyway",
                            self.parent_pid, self.max_wait
                        );
                        WatchdogPhase::Settling
                    } else {
                        std::thread::sleep(self.poll_interval);
                        WatchdogPhase::Waiting
                    }
                }
                WatchdogPhase::Settling => {
                    std::thread::sleep(self.settle);
                    WatchdogPhase::Relaunching
                }
                WatchdogPhase::Relaunching => {
                    match (self.spawn)(&self.target) {
                        Ok(()) => {
                            info!("Relaunched {}", self.target.display());
                            relaunched = true;
                        }
                        Err(e) => warn!("Failed to relaunch {}: {}", self.target.display(), e),
                    }
                    WatchdogPhase::Done
                }
                WatchdogPhase::Done => WatchdogPhase::Done,
            };
        }

        WatchdogReport {
            parent_exited,
            waited: started.elapsed(),
            relaunched,
        }
    }
}

// ==================== Temp Cleanup ====================

/// Remove directories under `root` named `prefix*` and older than `max_age`.
///
/// Best effort: directories still in use are skipped. Returns how many went.
pub fn cleanup_stale_temp_dirs(root: &Path, prefix: &str, max_age: Duration) -> usize {
    let Ok(entries) = fs::read_dir(root) else {
        debug!("Cannot list {}", root.display());
        return 0;
    };
    let now = SystemTime::now();
    let mut removed = 0;

    for entry in entries.flatten() {
        let name = entry.file_name();
        if !name.to_string_lossy().starts_with(prefix) {
            continue;
        }
        let Ok(meta) = entry.metadata() else { continue };
        if !meta.is_dir() {
            continue;
        }
        let age = meta
            .modified()
            .ok()
            .and_then(|m| now.duration_since(m).ok())
            .unwrap_or(Duration::ZERO);
        if age <= max_age {
            continue;
        }
        match fs::remove_dir_all(entry.path()) {
            Ok(()) => {
                debug!("Removed stale temp dir {}", entry.path().display());
                removed += 1;
            }
            Err(e) => debug!("Skipping temp dir {}: {}", entry.path().display(), e),
        }
    }

    if removed > 0 {
        info!("Cleaned up {} stale temp dirs under {}", removed, root.display());
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    const HOUR: Duration = Duration::from_secs(3600);

    fn age_file(path: &Path, by: Duration) {
        let file = OpenOptions::new().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - by).unwrap();
    }

    // ==================== Lock Tests ====================

    #[test]
    fn test_acquire_writes_pid() {
        let dir = tempfile::tempdir().unwrap();
        let mut lock = InstanceLock::new(dir.path(), "Test", HOUR);

        assert!(lock.acquire().unwrap());
        assert!(lock.is_held());
        assert_eq!(lock.path(), dir.path().join("Test.lock"));

        let record = LockRecord::read(lock.path()).unwrap();
        assert_eq!(record.pid, std::process::id());
        let text = fs::read_to_string(lock.path()).unwrap();
        assert_eq!(text, format!("{}\n", std::process::id()));
    }

    #[test]
    fn test_second_acquire_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut first = InstanceLock::new(dir.path(), "Test", HOUR);
        let mut second = InstanceLock::new(dir.path(), "Test", HOUR);

        assert!(first.acquire().unwrap());
        assert!(!second.acquire().unwrap());
        assert!(!second.is_held());
        assert!(matches!(
            second.acquire_or_fail(),
            Err(LockError::AlreadyRunning(name)) if name == "Test"
        ));
    }

    #[test]
    fn test_acquire_is_reentrant_for_holder() {
        let dir = tempfile::tempdir().unwrap();
        let mut lock = InstanceLock::new(dir.path(), "Test", HOUR);
        assert!(lock.acquire().unwrap());
        assert!(lock.acquire().unwrap());
    }

    #[test]
    fn test_stale_lock_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Test.lock");
        fs::write(&path, "999999\n").unwrap();
        age_file(&path, 2 * HOUR);

        let mut lock = InstanceLock::new(dir.path(), "Test", HOUR);
        assert!(lock.acquire().unwrap());
        assert_eq!(LockRecord::read(&path).unwrap().pid, std::process::id());
    }

    #[test]
    fn test_fresh_foreign_lock_is_respected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Test.lock");
        fs::write(&path, "999999\n").unwrap();

        let mut lock = InstanceLock::new(dir.path(), "Test", HOUR);
        assert!(!lock.acquire().unwrap());
        assert_eq!(LockRecord::read(&path).unwrap().pid, 999999);
    }

    #[test]
    fn test_release_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut lock = InstanceLock::new(dir.path(), "Test", HOUR);
        lock.acquire().unwrap();

        lock.release();
        assert!(!lock.path().exists());
        lock.release();
        assert!(!lock.is_held());
    }

    #[test]
    fn test_drop_releases() {
        let dir = tempfile::tempdir().unwrap();
        let path = {
            let mut lock = InstanceLock::new(dir.path(), "Test", HOUR);
            lock.acquire().unwrap();
            lock.path().to_path_buf()
        };
        assert!(!path.exists());

        let mut again = InstanceLock::new(dir.path(), "Test", HOUR);
        assert!(again.acquire().unwrap());
    }

    #[test]
    fn test_missing_dir_is_io_error() {
        let mut lock = InstanceLock::new("/definitely/not/here", "Test", HOUR);
        assert!(matches!(lock.acquire(), Err(LockError::Io { .. })));
    }

    #[test]
    fn test_lock_record_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.lock");
        fs::write(&path, "not a pid").unwrap();
        assert!(LockRecord::read(&path).is_err());
    }

    // ==================== Process Tests ====================

    #[test]
    fn test_current_process_is_alive() {
        assert!(process_alive(std::process::id()));
    }

    #[test]
    fn test_pid_zero_is_not_alive() {
        assert!(!process_alive(0));
    }

    // ==================== Watchdog Tests ====================

    fn fast(watchdog: Watchdog) -> Watchdog {
        watchdog.with_timing(
            Duration::from_millis(1),
            Duration::from_millis(200),
            Duration::ZERO,
        )
    }

    #[test]
    fn test_watchdog_waits_for_parent_then_relaunches() {
        let polls = Arc::new(AtomicU32::new(0));
        let spawned = Arc::new(Mutex::new(Vec::<PathBuf>::new()));

        let p = polls.clone();
        let s = spawned.clone();
        let mut watchdog = fast(Watchdog::new("/opt/miqat/miqat", 4242))
            .with_liveness(move |pid| {
                assert_eq!(pid, 4242);
                p.fetch_add(1, Ordering::SeqCst) < 3
            })
            .with_spawner(move |path| {
                s.lock().unwrap().push(path.to_path_buf());
                Ok(())
            });

        let report = watchdog.run();

        assert!(report.parent_exited);
        assert!(report.relaunched);
        assert_eq!(polls.load(Ordering::SeqCst), 4);
        assert_eq!(watchdog.phase(), WatchdogPhase::Done);
        assert_eq!(
            spawned.lock().unwrap().as_slice(),
            &[PathBuf::from("/opt/miqat/miqat")]
        );
    }

    #[test]
    fn test_watchdog_relaunches_after_timeout() {
        let mut watchdog = Watchdog::new("/bin/true", 1)
            .with_timing(Duration::from_millis(5), Duration::from_millis(20), Duration::ZERO)
            .with_liveness(|_| true)
            .with_spawner(|_| Ok(()));

        let report = watchdog.run();

        assert!(!report.parent_exited);
        assert!(report.relaunched);
        assert!(report.waited >= Duration::from_millis(20));
    }

    #[test]
    fn test_watchdog_spawn_failure_is_reported() {
        let mut watchdog = fast(Watchdog::new("/bin/true", 1))
            .with_liveness(|_| false)
            .with_spawner(|_| Err(io::Error::new(io::ErrorKind::NotFound, "gone")));

        let report = watchdog.run();

        assert!(report.parent_exited);
        assert!(!report.relaunched);
    }

    // ==================== Temp Cleanup Tests ====================

    #[test]
    #[cfg(unix)]
    fn test_cleanup_removes_old_prefixed_dirs() {
        let root = tempfile::tempdir().unwrap();
        let old = root.path().join("_MEI1234");
        let fresh = root.path().join("_MEI5678");
        let other = root.path().join("keep_me");
        for dir in [&old, &fresh, &other] {
            fs::create_dir(dir).unwrap();
            fs::write(dir.join("payload.bin"), b"x").unwrap();
        }
        for dir in [&old, &other] {
            File::open(dir).unwrap().set_modified(SystemTime::now() - 2 * HOUR).unwrap();
        }
        fs::write(root.path().join("_MEI_file"), b"not a dir").unwrap();

        assert_eq!(cleanup_stale_temp_dirs(root.path(), "_MEI", HOUR), 1);
        assert!(!old.exists());
        assert!(fresh.exists());
        assert!(other.exists());
        assert!(root.path().join("_MEI_file").exists());
    }

    #[test]
    fn test_cleanup_missing_root_is_zero() {
        assert_eq!(
            cleanup_stale_temp_dirs(Path::new("/definitely/not/here"), "_MEI", HOUR),
            0
        );
    }
}
