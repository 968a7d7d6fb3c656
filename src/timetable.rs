//! One day's prayer events and the status/next-event resolution on top of it.

use std::collections::HashMap;

use chrono::{NaiveDate, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Minutes in a calendar day.
pub const MINUTES_PER_DAY: u16 = 1440;

/// Number of events a daily timetable always carries.
pub const EVENTS_PER_DAY: usize = 6;

/// Canonical event names in timetable order.
pub const EVENT_NAMES: [&str; EVENTS_PER_DAY] = ["fajr", "sunrise", "dhuhr", "asr", "maghrib", "isha"];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TimetableError {
    #[error("expected {EVENTS_PER_DAY} events, got {0}")]
    WrongEventCount(usize),
    #[error("minute {minute} of '{name}' is outside 0..1440")]
    MinuteOutOfRange { name: String, minute: u16 },
    #[error("'{later}' ({later_minute}) does not come after '{earlier}' ({earlier_minute})")]
    NotIncreasing {
        earlier: String,
        earlier_minute: u16,
        later: String,
        later_minute: u16,
    },
}

/// A named daily occurrence at a fixed minute of the day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrayerEvent {
    name: String,
    minute_of_day: u16,
    ordinal: u8,
}

impl PrayerEvent {
    pub fn new(name: impl Into<String>, minute_of_day: u16, ordinal: u8) -> Result<Self, TimetableError> {
        let name = name.into();
        if minute_of_day >= MINUTES_PER_DAY {
            return Err(TimetableError::MinuteOutOfRange {
                name,
                minute: minute_of_day,
            });
        }
        Ok(Self {
            name,
            minute_of_day,
            ordinal,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn minute_of_day(&self) -> u16 {
        self.minute_of_day
    }

    pub fn ordinal(&self) -> u8 {
        self.ordinal
    }

    /// `HH:MM` in 24h form.
    pub fn stamp(&self) -> String {
        format_hhmm(self.minute_of_day)
    }
}

/// Display status of an event relative to the current minute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    Upcoming,
    Now,
    Finished,
}

impl Status {
    /// Translation key for this status.
    pub fn label_key(self) -> &'static str {
        match self {
            Status::Upcoming => "status_upcoming",
            Status::Now => "status_now",
            Status::Finished => "status_finished",
        }
    }
}

/// Result of [`DailyTimetable::next_event`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NextEvent {
    pub event: PrayerEvent,
    pub minutes_until: u16,
    /// Set when the event belongs to the following calendar day.
    pub is_tomorrow: bool,
}

/// Exactly six strictly increasing events for one calendar date.
///
/// Replaced wholesale on refresh; there are no mutators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "TimetableRecord")]
pub struct DailyTimetable {
    date: NaiveDate,
    events: Vec<PrayerEvent>,
}

/// Unvalidated wire form; deserialization goes through `DailyTimetable::new`.
#[derive(Deserialize)]
struct TimetableRecord {
    date: NaiveDate,
    events: Vec<PrayerEvent>,
}

impl TryFrom<TimetableRecord> for DailyTimetable {
    type Error = TimetableError;

    fn try_from(record: TimetableRecord) -> Result<Self, Self::Error> {
        Self::new(record.date, record.events)
    }
}

impl DailyTimetable {
    pub fn new(date: NaiveDate, mut events: Vec<PrayerEvent>) -> Result<Self, TimetableError> {
        if events.len() != EVENTS_PER_DAY {
            return Err(TimetableError::WrongEventCount(events.len()));
        }
        for (i, event) in events.iter_mut().enumerate() {
            if event.minute_of_day >= MINUTES_PER_DAY {
                return Err(TimetableError::MinuteOutOfRange {
                    name: event.name.clone(),
                    minute: event.minute_of_day,
                });
            }
            event.ordinal = i as u8;
        }
        for pair in events.windows(2) {
            if pair[1].minute_of_day <= pair[0].minute_of_day {
                return Err(TimetableError::NotIncreasing {
                    earlier: pair[0].name.clone(),
                    earlier_minute: pair[0].minute_of_day,
                    later: pair[1].name.clone(),
                    later_minute: pair[1].minute_of_day,
                });
            }
        }
        Ok(Self { date, events })
    }

    /// Build from `(name, minute)` pairs, assigning ordinals in order.
    pub fn from_pairs<S: Into<String>>(
        date: NaiveDate,
        pairs: impl IntoIterator<Item = (S, u16)>,
    ) -> Result<Self, TimetableError> {
        let events = pairs
            .into_iter()
            .enumerate()
            .map(|(i, (name, minute))| PrayerEvent::new(name, minute, i as u8))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(date, events)
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    pub fn events(&self) -> &[PrayerEvent] {
        &self.events
    }

    pub fn event(&self, name: &str) -> Option<&PrayerEvent> {
        self.events.iter().find(|e| e.name == name)
    }

    /// Status of the event at `index` within the closed-open window
    /// `[event, next_event)`. The last event has nothing after it, so once
    /// passed it stays `Finished` until the timetable rolls over.
    pub fn status_at(&self, index: usize, now_minute: u16) -> Status {
        let Some(event) = self.events.get(index) else {
            return Status::Upcoming;
        };
        if now_minute < event.minute_of_day {
            return Status::Upcoming;
        }
        match self.events.get(index + 1) {
            Some(next) if now_minute < next.minute_of_day => Status::Now,
            _ => Status::Finished,
        }
    }

    pub fn status_of(&self, event: &PrayerEvent, now_minute: u16) -> Status {
        self.status_at(event.ordinal as usize, now_minute)
    }

    /// Status of every event in timetable order.
    pub fn statuses(&self, now_minute: u16) -> Vec<(String, Status)> {
        (0..self.events.len())
            .map(|i| (self.events[i].name.clone(), self.status_at(i, now_minute)))
            .collect()
    }

    /// First event strictly after `now_minute`, wrapping to tomorrow's first
    /// event (`+1440`) when none remain today. Never empty.
    pub fn next_event(&self, now_minute: u16) -> NextEvent {
        let now_minute = now_minute.min(MINUTES_PER_DAY - 1);
        if let Some(event) = self.events.iter().find(|e| e.minute_of_day > now_minute) {
            return NextEvent {
                event: event.clone(),
                minutes_until: event.minute_of_day - now_minute,
                is_tomorrow: false,
            };
        }
        let first = &self.events[0];
        NextEvent {
            event: first.clone(),
            minutes_until: first.minute_of_day + MINUTES_PER_DAY - now_minute,
            is_tomorrow: true,
        }
    }

    /// Second-precision distance to the next event.
    pub fn seconds_until_next(&self, now: NaiveTime) -> (NextEvent, u32) {
        let now_minute = minute_of_day(now);
        let next = self.next_event(now_minute);
        let target_secs = if next.is_tomorrow {
            u32::from(next.event.minute_of_day) * 60 + u32::from(MINUTES_PER_DAY) * 60
        } else {
            u32::from(next.event.minute_of_day) * 60
        };
        let now_secs = now.num_seconds_from_midnight();
        (next, target_secs.saturating_sub(now_secs))
    }
}

pub fn minute_of_day(time: NaiveTime) -> u16 {
    (time.hour() * 60 + time.minute()) as u16
}

pub fn format_hhmm(minute: u16) -> String {
    format!("{:02}:{:02}", minute / 60, minute % 60)
}

/// Format a minute as `h:mm AM` (or with the Arabic `ص`/`م` periods).
pub fn format_12h(minute: u16, language: &str) -> String {
    let minute = minute % MINUTES_PER_DAY;
    let hour = minute / 60;
    let hour_12 = match hour % 12 {
        0 => 12,
        h => h,
    };
    let period = match (language, hour < 12) {
        ("ar", true) => "ص",
        ("ar", false) => "م",
        (_, true) => "AM",
        (_, false) => "PM",
    };
    format!("{}:{:02} {}", hour_12, minute % 60, period)
}

/// Memoizing parser for provider and display time strings.
///
/// Accepts `h:mm AM|PM`, `h:mm ص|م` and 24h `HH:MM` with an optional
/// trailing zone such as `05:12 (EET)`. Malformed input yields `0`
/// (midnight) rather than an error.
///
/// The memo is bounded; when full an arbitrary entry is dropped. Not an LRU,
/// which is fine for the handful of distinct strings a day produces.
#[derive(Debug, Clone)]
pub struct TimeParser {
    capacity: usize,
    memo: HashMap<String, u16>,
}

impl Default for TimeParser {
    fn default() -> Self {
        Self::with_capacity(128)
    }
}

impl TimeParser {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            memo: HashMap::new(),
        }
    }

    pub fn parse(&mut self, input: &str) -> u16 {
        if let Some(&minute) = self.memo.get(input) {
            return minute;
        }
        let minute = match parse_time(input) {
            Some(minute) => minute,
            None => {
                tracing::debug!("Unparseable time string {:?}, using midnight", input);
                0
            }
        };
        if self.memo.len() >= self.capacity {
            if let Some(key) = self.memo.keys().next().cloned() {
                self.memo.remove(&key);
            }
        }
        self.memo.insert(input.to_string(), minute);
        minute
    }

    pub fn len(&self) -> usize {
        self.memo.len()
    }

    pub fn is_empty(&self) -> bool {
        self.memo.is_empty()
    }
}

/// Parse without memoization; `None` on malformed input.
pub fn parse_time(input: &str) -> Option<u16> {
    let s = input.trim();
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == ':'))
        .unwrap_or(s.len());
    let (clock, rest) = s.split_at(split);
    let (h, m) = clock.split_once(':')?;
    if h.is_empty() || h.len() > 2 || m.len() != 2 {
        return None;
    }
    let hours: u16 = h.parse().ok()?;
    let minutes: u16 = m.parse().ok()?;
    if minutes > 59 {
        return None;
    }

    let rest = rest.trim_start().to_uppercase();
    let hours = if rest.starts_with("AM") || rest.starts_with('ص') {
        if !(1..=12).contains(&hours) {
            return None;
        }
        hours % 12
    } else if rest.starts_with("PM") || rest.starts_with('م') {
        if !(1..=12).contains(&hours) {
            return None;
        }
        hours % 12 + 12
    } else if rest.is_empty() || rest.starts_with('(') {
        if hours > 23 {
            return None;
        }
        hours
    } else {
        return None;
    };

    Some(hours * 60 + minutes)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 15).unwrap()
    }

    fn sample() -> DailyTimetable {
        DailyTimetable::from_pairs(
            date(),
            [
                ("fajr", 300),
                ("sunrise", 330),
                ("dhuhr", 720),
                ("asr", 900),
                ("maghrib", 1080),
                ("isha", 1140),
            ],
        )
        .unwrap()
    }

    // ==================== Construction ====================

    #[test]
    fn test_rejects_wrong_event_count() {
        let result = DailyTimetable::from_pairs(date(), [("fajr", 300), ("dhuhr", 720)]);
        assert_eq!(result, Err(TimetableError::WrongEventCount(2)));
    }

    #[test]
    fn test_rejects_non_increasing_minutes() {
        let result = DailyTimetable::from_pairs(
            date(),
            [
                ("fajr", 300),
                ("sunrise", 300),
                ("dhuhr", 720),
                ("asr", 900),
                ("maghrib", 1080),
                ("isha", 1140),
            ],
        );
        assert!(matches!(result, Err(TimetableError::NotIncreasing { .. })));
    }

    #[test]
    fn test_rejects_minute_out_of_range() {
        let result = PrayerEvent::new("isha", 1440, 5);
        assert!(matches!(result, Err(TimetableError::MinuteOutOfRange { .. })));
    }

    #[test]
    fn test_ordinals_follow_input_order() {
        let timetable = sample();
        for (i, event) in timetable.events().iter().enumerate() {
            assert_eq!(event.ordinal() as usize, i);
        }
        assert_eq!(timetable.event("asr").unwrap().stamp(), "15:00");
    }

    // ==================== Status ====================

    #[test]
    fn test_status_evening_between_maghrib_and_isha() {
        let timetable = sample();
        let maghrib = timetable.event("maghrib").unwrap().clone();
        let isha = timetable.event("isha").unwrap().clone();
        let dhuhr = timetable.event("dhuhr").unwrap().clone();

        assert_eq!(timetable.status_of(&dhuhr, 1100), Status::Finished);
        assert_eq!(timetable.status_of(&maghrib, 1100), Status::Now);
        assert_eq!(timetable.status_of(&isha, 1100), Status::Upcoming);
    }

    #[test]
    fn test_status_boundary_counts_as_passed() {
        let timetable = sample();
        let asr = timetable.event("asr").unwrap().clone();
        let dhuhr = timetable.event("dhuhr").unwrap().clone();

        assert_eq!(timetable.status_of(&asr, 900), Status::Now);
        assert_eq!(timetable.status_of(&dhuhr, 900), Status::Finished);
        assert_eq!(timetable.status_of(&asr, 899), Status::Upcoming);
    }

    #[test]
    fn test_last_event_is_finished_once_passed() {
        let timetable = sample();
        let isha = timetable.event("isha").unwrap().clone();
        assert_eq!(timetable.status_of(&isha, 1140), Status::Finished);
        assert_eq!(timetable.status_of(&isha, 1439), Status::Finished);
        assert!(
            timetable
                .statuses(1200)
                .iter()
                .all(|(_, s)| *s == Status::Finished)
        );
    }

    #[test]
    fn test_before_first_event_everything_upcoming() {
        let timetable = sample();
        assert!(
            timetable
                .statuses(10)
                .iter()
                .all(|(_, s)| *s == Status::Upcoming)
        );
    }

    // ==================== Next Event ====================

    #[test]
    fn test_next_event_same_day() {
        let next = sample().next_event(1100);
        assert_eq!(next.event.name(), "isha");
        assert_eq!(next.minutes_until, 40);
        assert!(!next.is_tomorrow);
    }

    #[test]
    fn test_next_event_rolls_over_to_tomorrow() {
        let next = sample().next_event(1439);
        assert_eq!(next.event.name(), "fajr");
        assert_eq!(next.minutes_until, 301);
        assert!(next.is_tomorrow);
    }

    #[test]
    fn test_next_event_at_last_event_minute_rolls_over() {
        let next = sample().next_event(1140);
        assert_eq!(next.event.name(), "fajr");
        assert_eq!(next.minutes_until, 1740 - 1140);
    }

    #[test]
    fn test_next_event_on_event_minute_skips_it() {
        let next = sample().next_event(720);
        assert_eq!(next.event.name(), "asr");
        assert_eq!(next.minutes_until, 180);
    }

    #[test]
    fn test_seconds_until_next_counts_seconds() {
        let now = NaiveTime::from_hms_opt(18, 59, 30).unwrap();
        let (next, secs) = sample().seconds_until_next(now);
        assert_eq!(next.event.name(), "isha");
        assert_eq!(secs, 30);
    }

    #[test]
    fn test_seconds_until_next_across_midnight() {
        let now = NaiveTime::from_hms_opt(23, 59, 59).unwrap();
        let (next, secs) = sample().seconds_until_next(now);
        assert_eq!(next.event.name(), "fajr");
        assert_eq!(secs, 1 + 300 * 60);
    }

    // ==================== Parsing ====================

    #[test]
    fn test_parse_12h_forms() {
        assert_eq!(parse_time("5:00 AM"), Some(300));
        assert_eq!(parse_time("12:00 PM"), Some(720));
        assert_eq!(parse_time("12:15 am"), Some(15));
        assert_eq!(parse_time("7:05 PM"), Some(19 * 60 + 5));
        assert_eq!(parse_time("7:05PM"), Some(19 * 60 + 5));
    }

    #[test]
    fn test_parse_arabic_periods() {
        assert_eq!(parse_time("4:30 ص"), Some(270));
        assert_eq!(parse_time("6:45 م"), Some(18 * 60 + 45));
    }

    #[test]
    fn test_parse_24h_with_zone_suffix() {
        assert_eq!(parse_time("05:12"), Some(312));
        assert_eq!(parse_time("19:48 (EET)"), Some(19 * 60 + 48));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(parse_time(""), None);
        assert_eq!(parse_time("noon"), None);
        assert_eq!(parse_time("25:00"), None);
        assert_eq!(parse_time("13:00 PM"), None);
        assert_eq!(parse_time("7:5 PM"), None);
        assert_eq!(parse_time("7:05 XY"), None);
    }

    #[test]
    fn test_parser_returns_midnight_for_malformed_input() {
        let mut parser = TimeParser::default();
        assert_eq!(parser.parse("not a time"), 0);
    }

    #[test]
    fn test_parser_memo_stays_bounded() {
        let mut parser = TimeParser::with_capacity(4);
        for m in 0..20u16 {
            parser.parse(&format_hhmm(m));
        }
        assert_eq!(parser.len(), 4);
        // Still correct after evictions.
        assert_eq!(parser.parse("00:19"), 19);
        assert_eq!(parser.parse("00:01"), 1);
    }

    #[test]
    fn test_format_12h() {
        assert_eq!(format_12h(0, "en"), "12:00 AM");
        assert_eq!(format_12h(720, "en"), "12:00 PM");
        assert_eq!(format_12h(19 * 60 + 5, "en"), "7:05 PM");
        assert_eq!(format_12h(270, "ar"), "4:30 ص");
    }

    #[test]
    fn test_deserialize_validates() {
        let json = serde_json::to_string(&sample()).unwrap();
        let back: DailyTimetable = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sample());

        let broken = json.replace("\"minute_of_day\":330", "\"minute_of_day\":200");
        assert!(serde_json::from_str::<DailyTimetable>(&broken).is_err());
    }

    // ==================== Properties ====================

    fn increasing_minutes() -> impl Strategy<Value = Vec<u16>> {
        proptest::collection::btree_set(0u16..1440, EVENTS_PER_DAY)
            .prop_map(|set| set.into_iter().collect())
    }

    proptest! {
        #[test]
        fn prop_at_most_one_now(minutes in increasing_minutes(), now in 0u16..1440) {
            let timetable = DailyTimetable::from_pairs(
                date(),
                EVENT_NAMES.iter().copied().zip(minutes.iter().copied()),
            ).unwrap();
            let now_count = timetable
                .statuses(now)
                .iter()
                .filter(|(_, s)| *s == Status::Now)
                .count();
            let first = minutes[0];
            let last = minutes[EVENTS_PER_DAY - 1];
            if now >= first && now < last {
                prop_assert_eq!(now_count, 1);
            } else {
                prop_assert_eq!(now_count, 0);
            }
        }

        #[test]
        fn prop_next_event_never_empty(minutes in increasing_minutes(), now in 0u16..1440) {
            let timetable = DailyTimetable::from_pairs(
                date(),
                EVENT_NAMES.iter().copied().zip(minutes.iter().copied()),
            ).unwrap();
            let next = timetable.next_event(now);
            prop_assert!(next.minutes_until >= 1);
            prop_assert!(next.minutes_until <= MINUTES_PER_DAY);
            if now >= minutes[EVENTS_PER_DAY - 1] {
                prop_assert!(next.is_tomorrow);
                prop_assert_eq!(next.event.name(), "fajr");
                prop_assert_eq!(next.minutes_until, minutes[0] + 1440 - now);
            } else {
                prop_assert!(next.event.minute_of_day() > now);
            }
        }
    }
}
