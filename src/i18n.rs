//! User-facing strings for alerts and the status line.

use std::collections::HashMap;

/// Looks up a display string by key. Unknown keys come back unchanged.
pub trait Translator: Send + Sync {
    fn get(&self, key: &str) -> String;

    fn language(&self) -> &str;
}

const EN: &[(&str, &str)] = &[
    ("fajr", "Fajr"),
    ("sunrise", "Sunrise"),
    ("dhuhr", "Dhuhr"),
    ("asr", "Asr"),
    ("maghrib", "Maghrib"),
    ("isha", "Isha"),
    ("prayer_notification_alert", "Prayer Time Alert"),
    (
        "minutes_remaining_for_prayer",
        "{minutes} minutes remaining for {prayer_name} prayer",
    ),
    ("prayer_time", "Prayer Time"),
    ("its_time_for_prayer", "It's time for {prayer_name} prayer"),
    ("next_prayer", "Next: {prayer_name} at {time} (in {countdown})"),
    ("tomorrow", "tomorrow"),
    ("status_upcoming", "upcoming"),
    ("status_now", "now"),
    ("status_finished", "finished"),
    ("already_running", "{app_name} is already running."),
];

const AR: &[(&str, &str)] = &[
    ("fajr", "الفجر"),
    ("sunrise", "الشروق"),
    ("dhuhr", "الظهر"),
    ("asr", "العصر"),
    ("maghrib", "المغرب"),
    ("isha", "العشاء"),
    ("prayer_notification_alert", "تنبيه مواقيت الصلاة"),
    (
        "minutes_remaining_for_prayer",
        "يتبقى {minutes} دقائق على أذان {prayer_name}",
    ),
    ("prayer_time", "وقت الصلاة"),
    ("its_time_for_prayer", "حان الآن وقت أذان {prayer_name}"),
    ("next_prayer", "الصلاة القادمة: {prayer_name} الساعة {time} (بعد {countdown})"),
    ("tomorrow", "غدا"),
    ("status_upcoming", "قادمة"),
    ("status_now", "الآن"),
    ("status_finished", "انتهت"),
    ("already_running", "{app_name} يعمل بالفعل."),
];

/// Built-in string tables. Anything other than `"ar"` gets English.
#[derive(Debug, Clone)]
pub struct Catalog {
    language: String,
    strings: HashMap<&'static str, &'static str>,
}

impl Catalog {
    pub fn new(language: &str) -> Self {
        let (language, table) = match language {
            "ar" => ("ar", AR),
            other => {
                if other != "en" {
                    tracing::debug!("No strings for language {:?}, using English", other);
                }
                ("en", EN)
            }
        };
        Self {
            language: language.to_string(),
            strings: table.iter().copied().collect(),
        }
    }
}

impl Translator for Catalog {
    fn get(&self, key: &str) -> String {
        self.strings
            .get(key)
            .map(|s| s.to_string())
            .unwrap_or_else(|| key.to_string())
    }

    fn language(&self) -> &str {
        &self.language
    }
}

/// Fill `{name}` placeholders. Placeholders without a value are left as-is.
pub fn render(template: &str, values: &[(&str, &str)]) -> String {
    values.iter().fold(template.to_string(), |acc, (key, value)| {
        acc.replace(&format!("{{{key}}}"), value)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_english_lookup() {
        let catalog = Catalog::new("en");
        assert_eq!(catalog.get("maghrib"), "Maghrib");
        assert_eq!(catalog.language(), "en");
    }

    #[test]
    fn test_arabic_lookup() {
        let catalog = Catalog::new("ar");
        assert_eq!(catalog.get("fajr"), "الفجر");
        assert_eq!(catalog.language(), "ar");
    }

    #[test]
    fn test_unknown_language_falls_back_to_english() {
        assert_eq!(Catalog::new("fr").get("isha"), "Isha");
    }

    #[test]
    fn test_unknown_key_returns_key() {
        assert_eq!(Catalog::new("en").get("no_such_key"), "no_such_key");
    }

    #[test]
    fn test_tables_have_same_keys() {
        let en: Vec<&str> = EN.iter().map(|(k, _)| *k).collect();
        let ar: Vec<&str> = AR.iter().map(|(k, _)| *k).collect();
        assert_eq!(en, ar);
    }

    #[test]
    fn test_status_labels_translated() {
        use crate::timetable::Status;

        let en = Catalog::new("en");
        let ar = Catalog::new("ar");
        for status in [Status::Upcoming, Status::Now, Status::Finished] {
            assert_ne!(en.get(status.label_key()), status.label_key());
            assert_ne!(ar.get(status.label_key()), status.label_key());
        }
        assert_eq!(en.get(Status::Now.label_key()), "now");
    }

    #[test]
    fn test_render_fills_placeholders() {
        let catalog = Catalog::new("en");
        let text = render(
            &catalog.get("minutes_remaining_for_prayer"),
            &[("minutes", "5"), ("prayer_name", "Asr")],
        );
        assert_eq!(text, "5 minutes remaining for Asr prayer");
    }

    #[test]
    fn test_render_leaves_missing_placeholders() {
        assert_eq!(render("{a} and {b}", &[("a", "x")]), "x and {b}");
    }
}
