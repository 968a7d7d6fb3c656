//! Adhan and alert playback over an ordered chain of audio backends.

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;

use crate::config::AudioConfig;
use crate::traits::{AudioBackend, EndCallback, PlaybackHandle};

#[derive(Debug, Error)]
pub enum AudioError {
    #[error("audio tier {0} is not available")]
    BackendUnavailable(String),
    #[error("audio tier {tier} failed: {reason}")]
    Backend { tier: String, reason: String },
    #[error("no audio tier could play the file")]
    NoBackend,
    #[error("sound file not found: {0}")]
    FileNotFound(PathBuf),
}

/// Identifies one `play` call. Monotonic per manager.
pub type PlaybackId = u64;

// ==================== Media Tier ====================

#[cfg(feature = "desktop")]
pub use media::MediaBackend;

#[cfg(feature = "desktop")]
mod media {
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex, mpsc};
    use std::time::Duration;

    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

    use super::{AudioError, resample_linear};
    use crate::traits::{AudioBackend, EndCallback, PlaybackHandle};

    const TIER: &str = "media";

    fn fail(reason: impl ToString) -> AudioError {
        AudioError::Backend {
            tier: TIER.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Decodes with symphonia and plays through cpal's default output device.
    #[derive(Debug, Clone, Default)]
    pub struct MediaBackend;

    #[derive(Default)]
    struct TrackState {
        finished: AtomicBool,
        stopped: AtomicBool,
        callback: Mutex<Option<EndCallback>>,
    }

    struct MediaHandle {
        state: Arc<TrackState>,
    }

    impl PlaybackHandle for MediaHandle {
        fn stop(&mut self) {
            self.state.stopped.store(true, Ordering::SeqCst);
        }

        fn on_end(&mut self, callback: EndCallback) -> bool {
            if let Ok(mut slot) = self.state.callback.lock() {
                *slot = Some(callback);
            }
            // Track drained before the callback arrived: fire it off-thread so
            // the caller's locks are not re-entered.
            if self.state.finished.load(Ordering::SeqCst)
                && !self.state.stopped.load(Ordering::SeqCst)
            {
                let late = self.state.callback.lock().ok().and_then(|mut s| s.take());
                if let Some(cb) = late {
                    std::thread::spawn(cb);
                }
            }
            true
        }

        fn is_finished(&self) -> bool {
            self.state.finished.load(Ordering::SeqCst) || self.state.stopped.load(Ordering::SeqCst)
        }
    }

    impl AudioBackend for MediaBackend {
        fn name(&self) -> &str {
            TIER
        }

        fn probe(&self) -> bool {
            cpal::default_host().default_output_device().is_some()
        }

        fn supports_end_events(&self) -> bool {
            true
        }

        fn play(&self, path: &Path, volume: f32) -> Result<Box<dyn PlaybackHandle>, AudioError> {
            let (samples, sample_rate) = decode_to_mono_f32(path)?;
            let state = Arc::new(TrackState::default());
            let (ready_tx, ready_rx) = mpsc::channel();

            let thread_state = state.clone();
            // cpal streams are not Send; the stream lives and dies on this thread.
            std::thread::Builder::new()
                .name("miqat-audio".to_string())
                .spawn(move || run_stream(samples, sample_rate, volume, thread_state, ready_tx))
                .map_err(fail)?;

            match ready_rx.recv() {
                Ok(Ok(())) => Ok(Box::new(MediaHandle { state })),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(fail("audio thread exited before starting")),
            }
        }
    }

    struct PlaybackBuffer {
        samples: Vec<f32>,
        position: usize,
        finished: bool,
    }

    fn run_stream(
        samples: Vec<f32>,
        source_rate: u32,
        volume: f32,
        state: Arc<TrackState>,
        ready: mpsc::Sender<Result<(), AudioError>>,
    ) {
        let host = cpal::default_host();
        let Some(device) = host.default_output_device() else {
            let _ = ready.send(Err(fail("no default output device")));
            return;
        };
        let supported = match device.default_output_config() {
            Ok(c) => c,
            Err(e) => {
                let _ = ready.send(Err(fail(format!("no output config: {e}"))));
                return;
            }
        };
        let channels = usize::from(supported.channels()).max(1);
        let device_rate = supported.sample_rate();
        let config = supported.config();

        let buffer = Arc::new(Mutex::new(PlaybackBuffer {
            samples: resample_linear(&samples, source_rate, device_rate),
            position: 0,
            finished: false,
        }));
        let buffer_clone = Arc::clone(&buffer);

        let stream = device.build_output_stream(
            &config,
            move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                let mut buf = match buffer_clone.lock() {
                    Ok(b) => b,
                    Err(_) => return,
                };
                for frame in data.chunks_mut(channels) {
                    let sample = if buf.position < buf.samples.len() {
                        let s = buf.samples[buf.position] * volume;
                        buf.position += 1;
                        s
                    } else {
                        buf.finished = true;
                        0.0
                    };
                    for out in frame.iter_mut() {
                        *out = sample;
                    }
                }
            },
            move |err| {
                tracing::error!("Audio output stream error: {err}");
            },
            None,
        );
        let stream = match stream {
            Ok(s) => s,
            Err(e) => {
                let _ = ready.send(Err(fail(format!("failed to build output stream: {e}"))));
                return;
            }
        };
        if let Err(e) = stream.play() {
            let _ = ready.send(Err(fail(format!("failed to start output stream: {e}"))));
            return;
        }
        let _ = ready.send(Ok(()));

        loop {
            std::thread::sleep(Duration::from_millis(20));
            if state.stopped.load(Ordering::SeqCst) {
                break;
            }
            match buffer.lock() {
                Ok(buf) if buf.finished => break,
                Ok(_) => {}
                Err(_) => break,
            }
        }
        drop(stream);

        state.finished.store(true, Ordering::SeqCst);
        if !state.stopped.load(Ordering::SeqCst) {
            let callback = state.callback.lock().ok().and_then(|mut s| s.take());
            if let Some(cb) = callback {
                cb();
            }
        }
    }

    fn decode_to_mono_f32(path: &Path) -> Result<(Vec<f32>, u32), AudioError> {
        use symphonia::core::audio::SampleBuffer;
        use symphonia::core::codecs::DecoderOptions;
        use symphonia::core::errors::Error as SymphError;
        use symphonia::core::formats::FormatOptions;
        use symphonia::core::io::MediaSourceStream;
        use symphonia::core::meta::MetadataOptions;
        use symphonia::core::probe::Hint;

        let file = std::fs::File::open(path).map_err(fail)?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| fail(format!("unsupported audio file: {e}")))?;

        let mut format = probed.format;
        let track = format
            .default_track()
            .ok_or_else(|| fail("no default audio track"))?;
        let track_id = track.id;
        let codec_params = track.codec_params.clone();
        let sample_rate = codec_params
            .sample_rate
            .ok_or_else(|| fail("unknown sample rate"))?;

        let mut decoder = symphonia::default::get_codecs()
            .make(&codec_params, &DecoderOptions::default())
            .map_err(|e| fail(format!("failed to create decoder: {e}")))?;

        let mut out: Vec<f32> = Vec::new();
        let mut sample_buf: Option<SampleBuffer<f32>> = None;

        loop {
            let packet = match format.next_packet() {
                Ok(p) => p,
                Err(SymphError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(fail(format!("audio read error: {e}"))),
            };
            if packet.track_id() != track_id {
                continue;
            }

            let decoded = match decoder.decode(&packet) {
                Ok(d) => d,
                Err(SymphError::DecodeError(_)) => continue,
                Err(e) => return Err(fail(format!("audio decode error: {e}"))),
            };

            let spec = *decoded.spec();
            let channels = spec.channels.count();
            let frames = decoded.frames() as u64;
            let required = usize::try_from(frames)
                .unwrap_or(usize::MAX)
                .saturating_mul(channels);

            match sample_buf.as_mut() {
                Some(b) if b.capacity() >= required => b.clear(),
                _ => sample_buf = Some(SampleBuffer::<f32>::new(frames, spec)),
            }
            let Some(buf) = sample_buf.as_mut() else {
                continue;
            };
            buf.copy_interleaved_ref(decoded);

            if channels <= 1 {
                out.extend_from_slice(buf.samples());
            } else {
                for frame in buf.samples().chunks_exact(channels) {
                    out.push(frame.iter().sum::<f32>() / channels as f32);
                }
            }
        }

        Ok((out, sample_rate))
    }
}

/// Linear resampling; good enough for alert tones.
pub fn resample_linear(samples: &[f32], from: u32, to: u32) -> Vec<f32> {
    if from == to || from == 0 || to == 0 || samples.is_empty() {
        return samples.to_vec();
    }
    let ratio = f64::from(from) / f64::from(to);
    let out_len = (samples.len() as f64 / ratio).ceil() as usize;
    let last = samples.len() - 1;
    (0..out_len)
        .map(|i| {
            let pos = i as f64 * ratio;
            let idx = (pos.floor() as usize).min(last);
            let frac = (pos - idx as f64) as f32;
            let a = samples[idx];
            let b = samples[(idx + 1).min(last)];
            a + (b - a) * frac
        })
        .collect()
}

// ==================== Command Tier ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerKind {
    Paplay,
    Ffplay,
    Aplay,
    Afplay,
    PowerShell,
}

impl PlayerKind {
    pub fn program(self) -> &'static str {
        match self {
            PlayerKind::Paplay => "paplay",
            PlayerKind::Ffplay => "ffplay",
            PlayerKind::Aplay => "aplay",
            PlayerKind::Afplay => "afplay",
            PlayerKind::PowerShell => "powershell",
        }
    }

    /// Command-line arguments with `volume` mapped to the player's own scale.
    pub fn args(self, path: &Path, volume: f32) -> Vec<String> {
        let file = path.display().to_string();
        match self {
            PlayerKind::Paplay => vec![
                "--volume".to_string(),
                ((volume * 65536.0).round() as u32).to_string(),
                file,
            ],
            PlayerKind::Ffplay => vec![
                "-nodisp".to_string(),
                "-autoexit".to_string(),
                "-loglevel".to_string(),
                "quiet".to_string(),
                "-volume".to_string(),
                ((volume * 100.0).round() as u32).to_string(),
                file,
            ],
            PlayerKind::Aplay => vec!["-q".to_string(), file],
            PlayerKind::Afplay => vec!["-v".to_string(), format!("{volume:.2}"), file],
            PlayerKind::PowerShell => vec![
                "-NoProfile".to_string(),
                "-WindowStyle".to_string(),
                "Hidden".to_string(),
                "-Command".to_string(),
                format!(
                    "(New-Object Media.SoundPlayer '{}').PlaySync()",
                    file.replace('\'', "''")
                ),
            ],
        }
    }
}

/// Fire-and-forget external player process.
#[derive(Debug, Clone)]
pub struct CommandPlayer {
    kind: PlayerKind,
}

impl CommandPlayer {
    pub fn new(kind: PlayerKind) -> Self {
        Self { kind }
    }
}

struct CommandHandle {
    child: Mutex<Option<Child>>,
}

impl PlaybackHandle for CommandHandle {
    fn stop(&mut self) {
        let child = self.child.lock().ok().and_then(|mut c| c.take());
        if let Some(mut child) = child {
            let _ = child.kill();
            let _ = child.wait();
        }
    }

    fn on_end(&mut self, _callback: EndCallback) -> bool {
        false
    }

    fn is_finished(&self) -> bool {
        match self.child.lock() {
            Ok(mut guard) => match guard.as_mut() {
                Some(child) => !matches!(child.try_wait(), Ok(None)),
                None => true,
            },
            Err(_) => true,
        }
    }
}

impl AudioBackend for CommandPlayer {
    fn name(&self) -> &str {
        self.kind.program()
    }

    fn probe(&self) -> bool {
        which::which(self.kind.program()).is_ok()
    }

    fn supports_end_events(&self) -> bool {
        false
    }

    fn play(&self, path: &Path, volume: f32) -> Result<Box<dyn PlaybackHandle>, AudioError> {
        let child = Command::new(self.kind.program())
            .args(self.kind.args(path, volume))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| AudioError::Backend {
                tier: self.kind.program().to_string(),
                reason: e.to_string(),
            })?;
        Ok(Box::new(CommandHandle {
            child: Mutex::new(Some(child)),
        }))
    }
}

/// Every tier this build knows about for the current OS, richest first.
pub fn default_backends() -> Vec<Arc<dyn AudioBackend>> {
    let mut backends: Vec<Arc<dyn AudioBackend>> = Vec::new();
    #[cfg(feature = "desktop")]
    backends.push(Arc::new(MediaBackend));

    let players: &[PlayerKind] = if cfg!(target_os = "windows") {
        &[PlayerKind::PowerShell, PlayerKind::Ffplay]
    } else if cfg!(target_os = "macos") {
        &[PlayerKind::Afplay, PlayerKind::Ffplay]
    } else {
        &[PlayerKind::Paplay, PlayerKind::Ffplay, PlayerKind::Aplay]
    };
    backends.extend(
        players
            .iter()
            .map(|k| Arc::new(CommandPlayer::new(*k)) as Arc<dyn AudioBackend>),
    );
    backends
}

// ==================== Manager ====================

struct ActiveTrack {
    id: PlaybackId,
    tier: String,
    native_end: bool,
    handle: Box<dyn PlaybackHandle>,
}

/// Owns the single active track. Starting a new track replaces the old one.
pub struct AudioPlaybackManager {
    backends: Vec<Arc<dyn AudioBackend>>,
    active: Arc<Mutex<Option<ActiveTrack>>>,
    next_id: AtomicU64,
    fallback: PathBuf,
    estimated_duration: Duration,
    runtime: tokio::runtime::Handle,
}

impl AudioPlaybackManager {
    /// Probe `candidates` once; unavailable tiers are dropped.
    pub fn probe(
        candidates: Vec<Arc<dyn AudioBackend>>,
        fallback: PathBuf,
        estimated_duration: Duration,
        runtime: tokio::runtime::Handle,
    ) -> Self {
        let backends = candidates
            .into_iter()
            .filter(|b| {
                let available = b.probe();
                tracing::debug!("Audio tier {} available: {}", b.name(), available);
                available
            })
            .collect();
        Self {
            backends,
            active: Arc::new(Mutex::new(None)),
            next_id: AtomicU64::new(0),
            fallback,
            estimated_duration,
            runtime,
        }
    }

    pub fn from_config(config: &AudioConfig, runtime: tokio::runtime::Handle) -> Self {
        Self::probe(
            default_backends(),
            config.notification_path(),
            Duration::from_secs(config.estimated_duration_secs),
            runtime,
        )
    }

    pub fn available_tiers(&self) -> Vec<&str> {
        self.backends.iter().map(|b| b.name()).collect()
    }

    /// Start `path`, stopping whatever was playing. Missing files fall back
    /// to the notification sound.
    pub fn play(&self, path: &Path, volume: f32) -> Result<PlaybackId, AudioError> {
        let volume = if volume.is_nan() {
            0.0
        } else {
            volume.clamp(0.0, 1.0)
        };
        self.stop();

        let path = self.resolve(path)?;
        for backend in &self.backends {
            match backend.play(&path, volume) {
                Ok(handle) => {
                    let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
                    let track = ActiveTrack {
                        id,
                        tier: backend.name().to_string(),
                        native_end: backend.supports_end_events(),
                        handle,
                    };
                    let previous = self.lock_active().replace(track);
                    // A concurrent play slipped in between stop() and here.
                    if let Some(mut previous) = previous {
                        previous.handle.stop();
                    }
                    tracing::debug!("Playing {} via {} (id {})", path.display(), backend.name(), id);
                    return Ok(id);
                }
                Err(e) => tracing::debug!("Audio tier {} failed: {}", backend.name(), e),
            }
        }
        tracing::warn!(
            "No audio tier could play {} ({} tried)",
            path.display(),
            self.backends.len()
        );
        Err(AudioError::NoBackend)
    }

    fn resolve(&self, path: &Path) -> Result<PathBuf, AudioError> {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        if self.fallback.exists() {
            tracing::debug!(
                "Sound {} missing, using {}",
                path.display(),
                self.fallback.display()
            );
            return Ok(self.fallback.clone());
        }
        Err(AudioError::FileNotFound(path.to_path_buf()))
    }

    /// Stop the active track, if any. Safe to call repeatedly.
    pub fn stop(&self) {
        // Clear the slot before touching the backend so a racing end
        // callback sees nothing to act on.
        let taken = self.lock_active().take();
        if let Some(mut track) = taken {
            track.handle.stop();
            tracing::debug!("Stopped playback {} on {}", track.id, track.tier);
        }
    }

    pub fn is_playing(&self) -> bool {
        self.lock_active()
            .as_ref()
            .is_some_and(|t| !t.handle.is_finished())
    }

    pub fn current_id(&self) -> Option<PlaybackId> {
        self.lock_active().as_ref().map(|t| t.id)
    }

    /// Run `callback` when the active track ends. Backends without native end
    /// events get a timer of the estimated track length instead; it only
    /// fires if the same track is still current. Returns `false` when
    /// nothing is playing.
    pub fn set_end_callback(&self, callback: EndCallback) -> bool {
        let mut guard = self.lock_active();
        let Some(track) = guard.as_mut() else {
            return false;
        };
        if track.native_end {
            return track.handle.on_end(callback);
        }

        let id = track.id;
        drop(guard);
        let active = self.active.clone();
        let delay = self.estimated_duration;
        self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let still_current = active
                .lock()
                .map(|g| g.as_ref().is_some_and(|t| t.id == id))
                .unwrap_or(false);
            if still_current {
                callback();
            }
        });
        true
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, Option<ActiveTrack>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use super::*;
    use crate::traits::MockAudioBackend;

    fn sound_file(dir: &tempfile::TempDir, name: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, b"RIFF").unwrap();
        path
    }

    fn manager(backends: Vec<Arc<dyn AudioBackend>>, fallback: PathBuf) -> AudioPlaybackManager {
        AudioPlaybackManager::probe(
            backends,
            fallback,
            Duration::from_secs(180),
            tokio::runtime::Handle::current(),
        )
    }

    fn flag() -> (Arc<AtomicBool>, EndCallback) {
        let fired = Arc::new(AtomicBool::new(false));
        let f = fired.clone();
        (fired, Box::new(move || f.store(true, Ordering::SeqCst)))
    }

    // ==================== Player Argument Tests ====================

    #[test]
    fn test_volume_maps_to_native_scales() {
        let path = Path::new("/s/adhan.wav");
        assert_eq!(PlayerKind::Paplay.args(path, 0.5)[1], "32768");
        assert_eq!(PlayerKind::Ffplay.args(path, 0.7)[5], "70");
        assert_eq!(PlayerKind::Afplay.args(path, 0.25)[1], "0.25");
        assert_eq!(PlayerKind::Aplay.args(path, 0.9), vec!["-q", "/s/adhan.wav"]);
    }

    #[test]
    fn test_resample_linear_lengths() {
        let samples = vec![0.0, 1.0, 0.0, -1.0];
        assert_eq!(resample_linear(&samples, 8000, 8000), samples);
        assert_eq!(resample_linear(&samples, 8000, 16000).len(), 8);
        assert_eq!(resample_linear(&samples, 16000, 8000).len(), 2);
        assert_eq!(resample_linear(&samples, 8000, 16000)[1], 0.5);
    }

    // ==================== Manager Tests ====================

    #[tokio::test]
    async fn test_first_working_tier_wins() {
        let dir = tempfile::tempdir().unwrap();
        let file = sound_file(&dir, "adhan.wav");
        let broken = MockAudioBackend::failing("media");
        let player = MockAudioBackend::new("paplay");
        let mgr = manager(
            vec![Arc::new(broken.clone()), Arc::new(player.clone())],
            PathBuf::from("missing.wav"),
        );

        let id = mgr.play(&file, 0.7).unwrap();

        assert_eq!(mgr.current_id(), Some(id));
        assert_eq!(player.plays(), vec![(file, 0.7)]);
        assert!(mgr.is_playing());
    }

    #[tokio::test]
    async fn test_volume_is_clamped() {
        let dir = tempfile::tempdir().unwrap();
        let file = sound_file(&dir, "adhan.wav");
        let backend = MockAudioBackend::new("paplay");
        let mgr = manager(vec![Arc::new(backend.clone())], PathBuf::from("missing.wav"));

        mgr.play(&file, 3.0).unwrap();
        mgr.play(&file, -1.0).unwrap();

        let volumes: Vec<f32> = backend.plays().into_iter().map(|(_, v)| v).collect();
        assert_eq!(volumes, vec![1.0, 0.0]);
    }

    #[tokio::test]
    async fn test_play_replaces_active_track() {
        let dir = tempfile::tempdir().unwrap();
        let file = sound_file(&dir, "adhan.wav");
        let backend = MockAudioBackend::new("paplay");
        let mgr = manager(vec![Arc::new(backend.clone())], PathBuf::from("missing.wav"));

        let first = mgr.play(&file, 0.5).unwrap();
        let second = mgr.play(&file, 0.5).unwrap();

        assert_ne!(first, second);
        assert_eq!(backend.stop_count(), 1);
        assert_eq!(mgr.current_id(), Some(second));
    }

    #[tokio::test]
    async fn test_stop_twice_is_harmless() {
        let dir = tempfile::tempdir().unwrap();
        let file = sound_file(&dir, "adhan.wav");
        let backend = MockAudioBackend::new("paplay");
        let mgr = manager(vec![Arc::new(backend.clone())], PathBuf::from("missing.wav"));

        mgr.play(&file, 0.5).unwrap();
        mgr.stop();
        assert!(!mgr.is_playing());
        mgr.stop();
        assert!(!mgr.is_playing());
        assert_eq!(backend.stop_count(), 1);
    }

    #[tokio::test]
    async fn test_stop_with_nothing_playing() {
        let mgr = manager(vec![], PathBuf::from("missing.wav"));
        mgr.stop();
        assert!(!mgr.is_playing());
        assert!(mgr.current_id().is_none());
    }

    #[tokio::test]
    async fn test_missing_file_falls_back_to_notification_sound() {
        let dir = tempfile::tempdir().unwrap();
        let fallback = sound_file(&dir, "notification.wav");
        let backend = MockAudioBackend::new("paplay");
        let mgr = manager(vec![Arc::new(backend.clone())], fallback.clone());

        mgr.play(&dir.path().join("adhan_mekka.wma"), 0.5).unwrap();

        assert_eq!(backend.plays()[0].0, fallback);
    }

    #[tokio::test]
    async fn test_missing_file_without_fallback_errors() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MockAudioBackend::new("paplay");
        let mgr = manager(vec![Arc::new(backend.clone())], dir.path().join("nope.wav"));

        let result = mgr.play(&dir.path().join("adhan.wav"), 0.5);

        assert!(matches!(result, Err(AudioError::FileNotFound(_))));
        assert!(backend.plays().is_empty());
    }

    #[tokio::test]
    async fn test_all_tiers_failing_is_no_backend() {
        let dir = tempfile::tempdir().unwrap();
        let file = sound_file(&dir, "adhan.wav");
        let mgr = manager(
            vec![
                Arc::new(MockAudioBackend::failing("media")),
                Arc::new(MockAudioBackend::unavailable("paplay")),
            ],
            PathBuf::from("missing.wav"),
        );

        assert_eq!(mgr.available_tiers(), vec!["media"]);
        assert!(matches!(mgr.play(&file, 0.5), Err(AudioError::NoBackend)));
    }

    #[tokio::test]
    async fn test_native_end_callback_attaches_directly() {
        let dir = tempfile::tempdir().unwrap();
        let file = sound_file(&dir, "adhan.wav");
        let backend = MockAudioBackend::new("media").with_native_end();
        let mgr = manager(vec![Arc::new(backend.clone())], PathBuf::from("missing.wav"));

        mgr.play(&file, 0.5).unwrap();
        let (fired, cb) = flag();
        assert!(mgr.set_end_callback(cb));
        backend.last_track().unwrap().finish();

        assert!(fired.load(Ordering::SeqCst));
        assert!(!mgr.is_playing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_estimated_end_callback_fires_after_duration() {
        let dir = tempfile::tempdir().unwrap();
        let file = sound_file(&dir, "adhan.wav");
        let backend = MockAudioBackend::new("paplay");
        let mgr = manager(vec![Arc::new(backend.clone())], PathBuf::from("missing.wav"));

        mgr.play(&file, 0.5).unwrap();
        let (fired, cb) = flag();
        assert!(mgr.set_end_callback(cb));

        tokio::time::sleep(Duration::from_secs(179)).await;
        assert!(!fired.load(Ordering::SeqCst));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_estimated_end_callback_skipped_after_replace() {
        let dir = tempfile::tempdir().unwrap();
        let file = sound_file(&dir, "adhan.wav");
        let backend = MockAudioBackend::new("paplay");
        let mgr = manager(vec![Arc::new(backend.clone())], PathBuf::from("missing.wav"));

        mgr.play(&file, 0.5).unwrap();
        let (fired, cb) = flag();
        mgr.set_end_callback(cb);
        mgr.play(&file, 0.5).unwrap();

        tokio::time::sleep(Duration::from_secs(200)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_end_callback_without_track_is_rejected() {
        let mgr = manager(vec![], PathBuf::from("missing.wav"));
        let (_fired, cb) = flag();
        assert!(!mgr.set_end_callback(cb));
    }
}
