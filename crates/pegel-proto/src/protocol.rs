//! Shared types passed between the fetch tasks, the registry and the display.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Marker preceding the gauge identifier in a station URL.
const STATION_ID_MARKER: &str = "id=";

/// Extract the gauge identifier from a station page URL.
///
/// The identifier is whatever follows the *last* `id=` in the URL. A URL
/// without the marker is its own identifier.
pub fn station_id_from_url(url: &str) -> &str {
    url.rsplit(STATION_ID_MARKER).next().unwrap_or(url)
}

// ── Station ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Station {
    pub id: String,
    pub url: String,
}

impl Station {
    pub fn from_url(url: impl Into<String>) -> Self {
        let url = url.into();
        let id = station_id_from_url(&url).to_string();
        Self { id, url }
    }

    pub fn diagram_url(&self, provider_base: &str, kind: DiagramKind) -> String {
        diagram_url(provider_base, &self.id, kind)
    }
}

// ── Diagrams ──────────────────────────────────────────────────────────────────

/// Chart images published by the provider for every gauge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiagramKind {
    WaterLevel,
    FlowRate,
}

impl DiagramKind {
    /// Numeric suffix the provider uses in the image file name.
    pub fn code(self) -> u16 {
        match self {
            Self::WaterLevel => 140,
            Self::FlowRate => 340,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::WaterLevel => "water level",
            Self::FlowRate => "flow rate",
        }
    }
}

/// `<base>/gifs/<station_id>-<code>.GIF`
pub fn diagram_url(provider_base: &str, station_id: &str, kind: DiagramKind) -> String {
    format!(
        "{}/gifs/{}-{}.GIF",
        provider_base.trim_end_matches('/'),
        station_id,
        kind.code()
    )
}

// ── Reading ───────────────────────────────────────────────────────────────────

/// One scraped snapshot of a gauge page.
///
/// Values are kept as the page printed them; use [`Reading::water_level_cm`]
/// and [`Reading::flow_rate_m3s`] for numbers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub water_level: String,
    pub water_level_trend: String,
    pub water_level_timestamp: String,
    pub flow_rate: String,
    pub flow_rate_trend: String,
    pub flow_rate_timestamp: String,
    /// Human readable gauge position, e.g. "Plochingen / Neckar".
    pub station_label: String,
    pub fetched_at: DateTime<Local>,
}

impl Reading {
    pub fn water_level_cm(&self) -> Result<i64, HistoryParseError> {
        let raw = self.water_level.trim();
        raw.parse::<i64>().map_err(|_| HistoryParseError {
            value: raw.to_string(),
        })
    }

    /// Flow rate in m³/s. Accepts both `12.3` and the provider's `12,3`.
    pub fn flow_rate_m3s(&self) -> Option<f64> {
        self.flow_rate.trim().replace(',', ".").parse().ok()
    }

    /// Strictly older than `max_age` relative to `now`.
    pub fn is_stale_at(&self, max_age: chrono::Duration, now: DateTime<Local>) -> bool {
        now.signed_duration_since(self.fetched_at) > max_age
    }
}

/// One water-level point for charting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistorySample {
    pub at: DateTime<Local>,
    pub water_level_cm: i64,
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Why a station page could not be turned into a [`Reading`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FetchError {
    /// The page could not be loaded at all.
    #[error("navigation failed: {0}")]
    Navigation(String),
    /// The page loaded but an expected value was absent.
    #[error("missing field {0}")]
    MissingField(String),
    #[error("timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("{0}")]
    Unknown(String),
}

impl FetchError {
    pub fn kind(&self) -> FetchErrorKind {
        match self {
            Self::Navigation(_) => FetchErrorKind::Navigation,
            Self::MissingField(_) => FetchErrorKind::MissingField,
            Self::Timeout(_) => FetchErrorKind::Timeout,
            Self::Unknown(_) => FetchErrorKind::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FetchErrorKind {
    Navigation,
    MissingField,
    Timeout,
    Unknown,
}

impl fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Navigation => "navigation",
            Self::MissingField => "missing-field",
            Self::Timeout => "timeout",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// A water level that is not an integer (`"n/a"`, `"--"`, ...).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("water level {value:?} is not an integer")]
pub struct HistoryParseError {
    pub value: String,
}

// ── Display events ────────────────────────────────────────────────────────────

/// Outcome of one fetch task, delivered once to the display.
#[derive(Debug, Clone)]
pub struct UiEvent {
    pub station_id: String,
    pub url: String,
    pub result: Result<Reading, FetchError>,
}

#[cfg(test)]
pub(crate) fn sample_reading(water_level: &str) -> Reading {
    Reading {
        water_level: water_level.to_string(),
        water_level_trend: "steigend".to_string(),
        water_level_timestamp: "15.10.2026 14:00".to_string(),
        flow_rate: "12,3".to_string(),
        flow_rate_trend: "gleich".to_string(),
        flow_rate_timestamp: "15.10.2026 14:00".to_string(),
        station_label: "Plochingen / Neckar".to_string(),
        fetched_at: Local::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_station_id_takes_last_marker() {
        assert_eq!(
            station_id_from_url("https://provider/pegel.html?id=00063"),
            "00063"
        );
        assert_eq!(
            station_id_from_url("https://provider/x.html?id=1&ref=abc&id=00412"),
            "00412"
        );
    }

    #[test]
    fn test_station_id_without_marker_is_whole_url() {
        assert_eq!(station_id_from_url("https://provider/"), "https://provider/");
        assert_eq!(station_id_from_url("pegel?id="), "");
    }

    #[test]
    fn test_diagram_urls() {
        let station = Station::from_url("https://provider/pegel.html?id=00063");
        assert_eq!(
            station.diagram_url("https://www.hvz.baden-wuerttemberg.de/", DiagramKind::WaterLevel),
            "https://www.hvz.baden-wuerttemberg.de/gifs/00063-140.GIF"
        );
        assert_eq!(
            station.diagram_url("https://www.hvz.baden-wuerttemberg.de", DiagramKind::FlowRate),
            "https://www.hvz.baden-wuerttemberg.de/gifs/00063-340.GIF"
        );
    }

    #[test]
    fn test_water_level_parsing() {
        assert_eq!(sample_reading("120").water_level_cm(), Ok(120));
        assert_eq!(sample_reading(" 87 ").water_level_cm(), Ok(87));
        let err = sample_reading("n/a").water_level_cm().unwrap_err();
        assert_eq!(err.value, "n/a");
    }

    #[test]
    fn test_flow_rate_accepts_decimal_comma() {
        assert_eq!(sample_reading("1").flow_rate_m3s(), Some(12.3));
        let mut r = sample_reading("1");
        r.flow_rate = "--".to_string();
        assert_eq!(r.flow_rate_m3s(), None);
    }

    #[test]
    fn test_staleness_is_strictly_greater() {
        let r = sample_reading("1");
        let max_age = chrono::Duration::minutes(15);
        assert!(!r.is_stale_at(max_age, r.fetched_at + max_age));
        assert!(r.is_stale_at(max_age, r.fetched_at + max_age + chrono::Duration::seconds(1)));
    }

    #[test]
    fn test_fetch_error_kinds() {
        assert_eq!(
            FetchError::Timeout(Duration::from_secs(30)).to_string(),
            "timed out after 30s"
        );
        assert_eq!(
            FetchError::MissingField("ID_INFO_W".into()).kind(),
            FetchErrorKind::MissingField
        );
    }
}
