use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;
use thiserror::Error;

use crate::config::{LocationConfig, NetworkConfig};
use crate::timetable::{DailyTimetable, TimeParser, TimetableError};
use crate::traits::TimetableProvider;

#[derive(Debug, Error)]
pub enum ProviderError {
    /// Network trouble or a non-success status; worth retrying.
    #[error("transient provider error: {0}")]
    Transient(String),
    /// The provider answered with something unusable; retrying won't help.
    #[error("invalid provider payload: {0}")]
    Invalid(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }
}

impl From<TimetableError> for ProviderError {
    fn from(err: TimetableError) -> Self {
        ProviderError::Invalid(err.to_string())
    }
}

/// Response envelope from the timings endpoint.
#[derive(Debug, Deserialize)]
pub struct TimingsResponse {
    pub code: u16,
    pub data: TimingsData,
}

#[derive(Debug, Deserialize)]
pub struct TimingsData {
    pub timings: Timings,
}

/// The provider returns more keys (Imsak, Midnight, ...); only these are kept.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Timings {
    pub fajr: String,
    pub sunrise: String,
    pub dhuhr: String,
    pub asr: String,
    pub maghrib: String,
    pub isha: String,
}

impl Timings {
    /// Convert the wire strings into a validated timetable for `date`.
    pub fn into_timetable(self, date: NaiveDate) -> Result<DailyTimetable, ProviderError> {
        let raw = [
            ("fajr", self.fajr),
            ("sunrise", self.sunrise),
            ("dhuhr", self.dhuhr),
            ("asr", self.asr),
            ("maghrib", self.maghrib),
            ("isha", self.isha),
        ];

        let mut parser = TimeParser::default();
        let mut pairs = Vec::with_capacity(raw.len());
        for (name, text) in raw {
            let minute = parser.parse(&text);
            // 0 is the parser's "unparseable" sentinel; midnight fajr is not
            // a real timetable.
            if minute == 0 && !text.trim().starts_with("00:00") {
                return Err(ProviderError::Invalid(format!(
                    "unparseable time {text:?} for {name}"
                )));
            }
            pairs.push((name, minute));
        }
        Ok(DailyTimetable::from_pairs(date, pairs)?)
    }
}

/// Query parameters for one day.
fn query_for(location: &LocationConfig, date: NaiveDate) -> Vec<(&'static str, String)> {
    vec![
        ("city", location.city.clone()),
        ("country", location.country.clone()),
        ("method", location.method.to_string()),
        ("date", date.format("%d-%m-%Y").to_string()),
    ]
}

/// HTTP client for the Aladhan timings API.
#[derive(Clone, Debug)]
pub struct AladhanClient {
    client: reqwest::Client,
    url: String,
    location: LocationConfig,
    retries: u32,
    backoff_base: Duration,
}

impl AladhanClient {
    /// Create a new API client with configurable timeouts.
    pub fn new(network_config: &NetworkConfig, location: &LocationConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(network_config.request_timeout_secs))
            .connect_timeout(Duration::from_secs(network_config.connect_timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            url: network_config.api_url.clone(),
            location: location.clone(),
            retries: network_config.retries.max(1),
            backoff_base: Duration::from_secs(1),
        })
    }

    /// Scale the `2^attempt` backoff. One second in production.
    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    /// Single request for one day's timetable.
    pub async fn fetch_day(&self, date: NaiveDate) -> Result<DailyTimetable, ProviderError> {
        let response = self
            .client
            .get(&self.url)
            .query(&query_for(&self.location, date))
            .send()
            .await
            .map_err(|e| ProviderError::Transient(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProviderError::Transient(format!(
                "API returned error status: {status}"
            )));
        }

        let body = response
            .json::<TimingsResponse>()
            .await
            .map_err(|e| ProviderError::Invalid(format!("failed to parse timings: {e}")))?;

        if body.code != 200 {
            return Err(ProviderError::Invalid(format!(
                "API reported code {}",
                body.code
            )));
        }

        body.data.timings.into_timetable(date)
    }

    /// `fetch_day` with up to `retries` attempts, sleeping `base * 2^attempt`
    /// between transient failures.
    pub async fn fetch_with_retry(&self, date: NaiveDate) -> Result<DailyTimetable, ProviderError> {
        let mut attempt = 0u32;
        loop {
            match self.fetch_day(date).await {
                Ok(timetable) => return Ok(timetable),
                Err(e) if e.is_transient() && attempt + 1 < self.retries => {
                    let delay = self.backoff_base * 2u32.saturating_pow(attempt);
                    tracing::debug!(
                        "Timetable fetch attempt {} failed: {}; retrying in {:?}",
                        attempt + 1,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    tracing::warn!("Timetable fetch for {} failed: {}", date, e);
                    return Err(e);
                }
            }
        }
    }
}

#[async_trait]
impl TimetableProvider for AladhanClient {
    async fn fetch(&self, date: NaiveDate) -> Result<DailyTimetable, ProviderError> {
        self.fetch_with_retry(date).await
    }
}
