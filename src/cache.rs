//! Per-day timetable files kept as the last known good data.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::NaiveDate;

use crate::timetable::DailyTimetable;

const FILE_PREFIX: &str = "prayer_";

#[derive(Debug, Clone)]
pub struct TimetableCache {
    dir: PathBuf,
}

impl TimetableCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, city: &str, country: &str, date: NaiveDate) -> PathBuf {
        self.dir.join(format!(
            "{FILE_PREFIX}{}_{}_{}.json",
            sanitize(city),
            sanitize(country),
            date.format("%Y-%m-%d")
        ))
    }

    pub fn save(&self, city: &str, country: &str, timetable: &DailyTimetable) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create cache dir {}", self.dir.display()))?;
        let path = self.path_for(city, country, timetable.date());
        let json = serde_json::to_string_pretty(timetable).context("Failed to serialize timetable")?;
        // Write-then-rename so a crash never leaves a half-written day file.
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &path).with_context(|| format!("Failed to move {}", path.display()))?;
        tracing::debug!("Cached timetable at {}", path.display());
        Ok(path)
    }

    /// Cached timetable for `date`. Unreadable or corrupt files count as missing.
    pub fn load(&self, city: &str, country: &str, date: NaiveDate) -> Option<DailyTimetable> {
        let path = self.path_for(city, country, date);
        let text = fs::read_to_string(&path).ok()?;
        match serde_json::from_str::<DailyTimetable>(&text) {
            Ok(timetable) if timetable.date() == date => Some(timetable),
            Ok(timetable) => {
                tracing::debug!(
                    "Cache file {} holds {} instead of {}",
                    path.display(),
                    timetable.date(),
                    date
                );
                None
            }
            Err(e) => {
                tracing::debug!("Ignoring corrupt cache file {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Delete cached days strictly before `today`. Returns how many went.
    pub fn cleanup_before(&self, today: NaiveDate) -> usize {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return 0;
        };
        let mut removed = 0;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(date) = file_date(name) else { continue };
            if date < today {
                match fs::remove_file(entry.path()) {
                    Ok(()) => removed += 1,
                    Err(e) => tracing::debug!("Could not remove {}: {}", name, e),
                }
            }
        }
        removed
    }
}

fn sanitize(part: &str) -> String {
    part.trim()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect()
}

/// Date suffix of a `prayer_*_YYYY-MM-DD.json` name.
fn file_date(name: &str) -> Option<NaiveDate> {
    let stem = name.strip_prefix(FILE_PREFIX)?.strip_suffix(".json")?;
    let (_, date) = stem.rsplit_once('_')?;
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, d).unwrap()
    }

    fn timetable(date: NaiveDate) -> DailyTimetable {
        DailyTimetable::from_pairs(
            date,
            [
                ("fajr", 300u16),
                ("sunrise", 330),
                ("dhuhr", 720),
                ("asr", 900),
                ("maghrib", 1080),
                ("isha", 1140),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_file_name_format() {
        let cache = TimetableCache::new("/tmp/c");
        let path = cache.path_for("Cairo", "Egypt", day(15));
        assert_eq!(path, PathBuf::from("/tmp/c/prayer_Cairo_Egypt_2024-06-15.json"));
    }

    #[test]
    fn test_file_name_sanitizes_spaces() {
        let cache = TimetableCache::new("/tmp/c");
        let path = cache.path_for("New York", "United States", day(15));
        assert!(path.ends_with("prayer_New_York_United_States_2024-06-15.json"));
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TimetableCache::new(dir.path());
        cache.save("Cairo", "Egypt", &timetable(day(15))).unwrap();

        let loaded = cache.load("Cairo", "Egypt", day(15)).unwrap();
        assert_eq!(loaded, timetable(day(15)));
        assert!(cache.load("Cairo", "Egypt", day(16)).is_none());
        assert!(cache.load("Giza", "Egypt", day(15)).is_none());
    }

    #[test]
    fn test_corrupt_file_is_missing() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TimetableCache::new(dir.path());
        fs::write(cache.path_for("Cairo", "Egypt", day(15)), "{ not json").unwrap();

        assert!(cache.load("Cairo", "Egypt", day(15)).is_none());
    }

    #[test]
    fn test_cleanup_removes_only_older_days() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TimetableCache::new(dir.path());
        for d in [13, 14, 15, 16] {
            cache.save("Cairo", "Egypt", &timetable(day(d))).unwrap();
        }
        fs::write(dir.path().join("notes.txt"), "keep me").unwrap();

        assert_eq!(cache.cleanup_before(day(15)), 2);
        assert!(cache.load("Cairo", "Egypt", day(15)).is_some());
        assert!(cache.load("Cairo", "Egypt", day(16)).is_some());
        assert!(dir.path().join("notes.txt").exists());
    }

    #[test]
    fn test_cleanup_missing_dir_is_zero() {
        let cache = TimetableCache::new("/definitely/not/here");
        assert_eq!(cache.cleanup_before(day(15)), 0);
    }

    #[test]
    fn test_file_date_parsing() {
        assert_eq!(file_date("prayer_Cairo_Egypt_2024-06-15.json"), Some(day(15)));
        assert_eq!(file_date("prayer_bad.json"), None);
        assert_eq!(file_date("other_2024-06-15.json"), None);
    }
}
