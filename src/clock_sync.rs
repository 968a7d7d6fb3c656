//! Network-corrected clock.
//!
//! `SyncedClock` keeps a cached offset between the local clock and a network
//! time server. The offset is refreshed at most once per validity window; in
//! between, reading the time costs nothing beyond the local clock read.

use std::net::{ToSocketAddrs, UdpSocket};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use thiserror::Error;

use crate::config::ClockConfig;
use crate::traits::{Clock, TimeSource};

/// Seconds between the NTP epoch (1900) and the Unix epoch (1970).
const NTP_UNIX_OFFSET: i64 = 2_208_988_800;

const NTP_PACKET_LEN: usize = 48;

#[derive(Debug, Error)]
pub enum ClockSyncError {
    #[error("timed out waiting for {0}")]
    Timeout(String),
    #[error("could not resolve {0}")]
    Resolve(String),
    #[error("network error talking to {server}: {source}")]
    Io {
        server: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed reply from {server}: {reason}")]
    Malformed { server: String, reason: String },
    #[error("http time source {server} failed: {reason}")]
    Http { server: String, reason: String },
}

/// Cached difference between network time and local time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockOffset {
    pub delta: chrono::Duration,
    /// Local (uncorrected) time at which the offset was measured.
    pub acquired_at: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
}

impl ClockOffset {
    pub fn is_valid_at(&self, local_now: DateTime<Utc>) -> bool {
        local_now < self.valid_until
    }
}

// ==================== Time Sources ====================

/// SNTP (RFC 4330) client over UDP port 123.
#[derive(Debug, Clone)]
pub struct SntpSource {
    server: String,
    timeout: Duration,
}

impl SntpSource {
    pub fn new(server: impl Into<String>, timeout: Duration) -> Self {
        Self {
            server: server.into(),
            timeout,
        }
    }

    fn io_err(&self, source: std::io::Error) -> ClockSyncError {
        match source.kind() {
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => {
                ClockSyncError::Timeout(self.server.clone())
            }
            _ => ClockSyncError::Io {
                server: self.server.clone(),
                source,
            },
        }
    }
}

impl TimeSource for SntpSource {
    fn name(&self) -> &str {
        &self.server
    }

    fn fetch(&self) -> Result<DateTime<Utc>, ClockSyncError> {
        let addr = (self.server.as_str(), 123)
            .to_socket_addrs()
            .map_err(|_| ClockSyncError::Resolve(self.server.clone()))?
            .next()
            .ok_or_else(|| ClockSyncError::Resolve(self.server.clone()))?;

        let bind = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind).map_err(|e| self.io_err(e))?;
        socket
            .set_read_timeout(Some(self.timeout))
            .map_err(|e| self.io_err(e))?;
        socket
            .set_write_timeout(Some(self.timeout))
            .map_err(|e| self.io_err(e))?;

        let mut request = [0u8; NTP_PACKET_LEN];
        // LI = 0, VN = 4, Mode = 3 (client)
        request[0] = 0b00_100_011;
        socket.send_to(&request, addr).map_err(|e| self.io_err(e))?;

        let mut reply = [0u8; NTP_PACKET_LEN];
        let (len, _) = socket.recv_from(&mut reply).map_err(|e| self.io_err(e))?;

        parse_sntp_reply(&reply[..len]).map_err(|reason| ClockSyncError::Malformed {
            server: self.server.clone(),
            reason,
        })
    }
}

/// Extract the transmit timestamp from an SNTP server reply.
pub fn parse_sntp_reply(reply: &[u8]) -> Result<DateTime<Utc>, String> {
    if reply.len() < NTP_PACKET_LEN {
        return Err(format!("short reply ({} bytes)", reply.len()));
    }
    let mode = reply[0] & 0b111;
    if mode != 4 {
        return Err(format!("unexpected mode {mode}"));
    }
    let secs = u32::from_be_bytes([reply[40], reply[41], reply[42], reply[43]]);
    let frac = u32::from_be_bytes([reply[44], reply[45], reply[46], reply[47]]);
    if secs == 0 {
        return Err("zero transmit timestamp".to_string());
    }

    // Era 1 (after 2036) wraps the 32-bit seconds field; RFC 4330 §3.
    let secs = if secs & 0x8000_0000 == 0 {
        i64::from(secs) + (1i64 << 32)
    } else {
        i64::from(secs)
    };
    let nanos = ((u64::from(frac) * 1_000_000_000) >> 32) as u32;

    DateTime::from_timestamp(secs - NTP_UNIX_OFFSET, nanos)
        .ok_or_else(|| "timestamp out of range".to_string())
}

/// Reads the `Date` header of an HTTPS endpoint. Only second precision, but
/// it works where outbound UDP is blocked.
#[derive(Debug, Clone)]
pub struct HttpDateSource {
    url: String,
    timeout: Duration,
}

impl HttpDateSource {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            timeout,
        }
    }

    fn http_err(&self, reason: impl ToString) -> ClockSyncError {
        ClockSyncError::Http {
            server: self.url.clone(),
            reason: reason.to_string(),
        }
    }
}

impl TimeSource for HttpDateSource {
    fn name(&self) -> &str {
        &self.url
    }

    fn fetch(&self) -> Result<DateTime<Utc>, ClockSyncError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| self.http_err(e))?;
        let response = client.head(&self.url).send().map_err(|e| {
            if e.is_timeout() {
                ClockSyncError::Timeout(self.url.clone())
            } else {
                self.http_err(e)
            }
        })?;
        let header = response
            .headers()
            .get(reqwest::header::DATE)
            .ok_or_else(|| self.http_err("no Date header"))?
            .to_str()
            .map_err(|e| self.http_err(e))?;
        DateTime::parse_from_rfc2822(header)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| ClockSyncError::Malformed {
                server: self.url.clone(),
                reason: e.to_string(),
            })
    }
}

/// Sources in priority order for the given config: every SNTP server, then
/// the HTTP `Date` fallback.
pub fn sources_from_config(config: &ClockConfig) -> Vec<Box<dyn TimeSource>> {
    let mut sources: Vec<Box<dyn TimeSource>> = config
        .servers
        .iter()
        .map(|s| Box::new(SntpSource::new(s.clone(), config.timeout())) as Box<dyn TimeSource>)
        .collect();
    sources.push(Box::new(HttpDateSource::new(
        "https://www.google.com",
        config.timeout(),
    )));
    sources
}

// ==================== SyncedClock ====================

/// Local clock corrected by a cached network offset.
///
/// [`SyncedClock::now`] is the blocking entry point: it refreshes the offset
/// when missing or expired. The [`Clock`] impl never touches the network and
/// applies whatever offset is cached, so it is safe to call from the
/// scheduler loop; refreshes are run on a worker through `now()`.
pub struct SyncedClock {
    sources: Vec<Box<dyn TimeSource>>,
    validity: chrono::Duration,
    local: Arc<dyn Clock>,
    offset: Mutex<Option<ClockOffset>>,
    // Held for the whole check-fetch-store sequence so only one caller hits
    // the network at a time.
    sync_lock: Mutex<()>,
}

impl SyncedClock {
    pub fn new(sources: Vec<Box<dyn TimeSource>>, validity: Duration, local: Arc<dyn Clock>) -> Self {
        Self {
            sources,
            validity: chrono::Duration::from_std(validity).unwrap_or(chrono::Duration::hours(1)),
            local,
            offset: Mutex::new(None),
            sync_lock: Mutex::new(()),
        }
    }

    pub fn from_config(config: &ClockConfig) -> Self {
        let sources = if config.enabled {
            sources_from_config(config)
        } else {
            Vec::new()
        };
        Self::new(sources, config.validity(), Arc::new(crate::traits::SystemClock))
    }

    /// Current corrected time, syncing first if the offset is missing or
    /// expired. Falls back to uncorrected local time when every source fails.
    pub fn now(&self) -> DateTime<Utc> {
        let _guard = self.sync_lock.lock().unwrap_or_else(|e| e.into_inner());

        let local_now = self.local.now_utc();
        if let Some(offset) = self.offset() {
            if offset.is_valid_at(local_now) {
                return local_now + offset.delta;
            }
        }

        match self.sync(local_now) {
            Some(offset) => local_now + offset.delta,
            None => local_now,
        }
    }

    fn sync(&self, local_now: DateTime<Utc>) -> Option<ClockOffset> {
        if self.sources.is_empty() {
            return None;
        }
        for source in &self.sources {
            match source.fetch() {
                Ok(server_time) => {
                    let delta = server_time - local_now;
                    let offset = ClockOffset {
                        delta,
                        acquired_at: local_now,
                        valid_until: local_now + self.validity,
                    };
                    *self.offset.lock().unwrap_or_else(|e| e.into_inner()) = Some(offset);
                    tracing::info!(
                        "Clock synced with {} (offset {} ms)",
                        source.name(),
                        delta.num_milliseconds()
                    );
                    return Some(offset);
                }
                Err(e) => {
                    tracing::debug!("Time source {} failed: {}", source.name(), e);
                }
            }
        }
        tracing::warn!("All time sources failed, using uncorrected local time");
        None
    }

    /// Run the first sync eagerly. Meant for a worker thread at startup.
    pub fn warm_up(&self) {
        let corrected = self.now();
        tracing::debug!("Clock warm-up complete, corrected time {}", corrected);
    }

    /// Snapshot of the cached offset, if any.
    pub fn offset(&self) -> Option<ClockOffset> {
        *self.offset.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// True when the next `now()` would go to the network.
    pub fn needs_sync(&self) -> bool {
        match self.offset() {
            Some(offset) => !offset.is_valid_at(self.local.now_utc()),
            None => !self.sources.is_empty(),
        }
    }

    /// Drop the cached offset, forcing the next `now()` to resync.
    pub fn invalidate(&self) {
        *self.offset.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Local time plus the last known offset (even if expired). Never blocks
    /// on the network.
    pub fn cached_now(&self) -> DateTime<Utc> {
        let local_now = self.local.now_utc();
        match self.offset() {
            Some(offset) => local_now + offset.delta,
            None => local_now,
        }
    }
}

impl Clock for SyncedClock {
    fn now_utc(&self) -> DateTime<Utc> {
        self.cached_now()
    }

    fn now_local(&self) -> DateTime<Local> {
        self.cached_now().with_timezone(&Local)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::traits::{MockClock, MockTimeSource};

    fn local_clock() -> Arc<MockClock> {
        Arc::new(MockClock::new(
            Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap(),
        ))
    }

    fn sntp_reply(secs: u32, frac: u32) -> [u8; 48] {
        let mut reply = [0u8; 48];
        reply[0] = 0b00_100_100;
        reply[40..44].copy_from_slice(&secs.to_be_bytes());
        reply[44..48].copy_from_slice(&frac.to_be_bytes());
        reply
    }

    // ==================== SNTP Parsing ====================

    #[test]
    fn test_parse_sntp_reply_known_timestamp() {
        // 2024-06-15T12:00:00Z
        let unix = Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap().timestamp();
        let secs = (unix + NTP_UNIX_OFFSET) as u32;
        let parsed = parse_sntp_reply(&sntp_reply(secs, 1 << 31)).unwrap();
        assert_eq!(parsed.timestamp(), unix);
        assert_eq!(parsed.timestamp_subsec_millis(), 500);
    }

    #[test]
    fn test_parse_sntp_reply_rejects_client_mode() {
        let mut reply = sntp_reply(3_900_000_000, 0);
        reply[0] = 0b00_100_011;
        assert!(parse_sntp_reply(&reply).is_err());
    }

    #[test]
    fn test_parse_sntp_reply_rejects_short_and_zero() {
        assert!(parse_sntp_reply(&[0u8; 12]).is_err());
        assert!(parse_sntp_reply(&sntp_reply(0, 0)).is_err());
    }

    #[test]
    fn test_parse_sntp_reply_after_era_rollover() {
        // Seconds field wrapped: 1000 s into NTP era 1 (2036-02-07).
        let parsed = parse_sntp_reply(&sntp_reply(1000, 0)).unwrap();
        assert_eq!(parsed.timestamp(), (1i64 << 32) + 1000 - NTP_UNIX_OFFSET);
    }

    // ==================== SyncedClock ====================

    #[test]
    fn test_first_call_syncs_and_applies_offset() {
        let local = local_clock();
        let source = MockTimeSource::ok("primary", chrono::Duration::seconds(90));
        let clock = SyncedClock::new(
            vec![Box::new(source.clone())],
            Duration::from_secs(3600),
            local.clone(),
        );

        let now = clock.now();
        let drift = (now - local.now_utc()).num_seconds();
        // Offset is measured against the real wall clock in the mock source.
        assert!(clock.offset().is_some());
        assert_eq!(source.call_count(), 1);
        assert_eq!(drift, clock.offset().unwrap().delta.num_seconds());
    }

    #[test]
    fn test_cached_offset_avoids_network() {
        let local = local_clock();
        let source = MockTimeSource::ok("primary", chrono::Duration::seconds(5));
        let clock = SyncedClock::new(
            vec![Box::new(source.clone())],
            Duration::from_secs(3600),
            local.clone(),
        );

        clock.now();
        local.advance(chrono::Duration::minutes(30));
        clock.now();
        clock.now();

        assert_eq!(source.call_count(), 1);
        assert!(!clock.needs_sync());
    }

    #[test]
    fn test_expired_offset_resyncs() {
        let local = local_clock();
        let source = MockTimeSource::ok("primary", chrono::Duration::seconds(5));
        let clock = SyncedClock::new(
            vec![Box::new(source.clone())],
            Duration::from_secs(3600),
            local.clone(),
        );

        clock.now();
        local.advance(chrono::Duration::minutes(61));
        assert!(clock.needs_sync());
        clock.now();

        assert_eq!(source.call_count(), 2);
    }

    #[test]
    fn test_sources_tried_in_priority_order() {
        let local = local_clock();
        let first = MockTimeSource::failing("first");
        let second = MockTimeSource::ok("second", chrono::Duration::seconds(1));
        let third = MockTimeSource::ok("third", chrono::Duration::seconds(1));
        let clock = SyncedClock::new(
            vec![
                Box::new(first.clone()),
                Box::new(second.clone()),
                Box::new(third.clone()),
            ],
            Duration::from_secs(3600),
            local,
        );

        clock.now();

        assert_eq!(first.call_count(), 1);
        assert_eq!(second.call_count(), 1);
        assert_eq!(third.call_count(), 0);
    }

    #[test]
    fn test_total_failure_returns_local_time() {
        let local = local_clock();
        let source = MockTimeSource::failing("down");
        let clock = SyncedClock::new(
            vec![Box::new(source.clone())],
            Duration::from_secs(3600),
            local.clone(),
        );

        assert_eq!(clock.now(), local.now_utc());
        assert!(clock.offset().is_none());

        // Nothing cached, so the next call tries again.
        clock.now();
        assert_eq!(source.call_count(), 2);
    }

    #[test]
    fn test_clock_trait_never_syncs() {
        let local = local_clock();
        let source = MockTimeSource::ok("primary", chrono::Duration::seconds(5));
        let clock = SyncedClock::new(
            vec![Box::new(source.clone())],
            Duration::from_secs(3600),
            local.clone(),
        );

        assert_eq!(clock.now_utc(), local.now_utc());
        assert_eq!(source.call_count(), 0);
        assert!(clock.needs_sync());
    }

    #[test]
    fn test_invalidate_forces_resync() {
        let local = local_clock();
        let source = MockTimeSource::ok("primary", chrono::Duration::seconds(5));
        let clock = SyncedClock::new(
            vec![Box::new(source.clone())],
            Duration::from_secs(3600),
            local,
        );

        clock.now();
        clock.invalidate();
        clock.now();
        assert_eq!(source.call_count(), 2);
    }

    #[test]
    fn test_no_sources_never_needs_sync() {
        let clock = SyncedClock::new(Vec::new(), Duration::from_secs(3600), local_clock());
        assert!(!clock.needs_sync());
    }
}
