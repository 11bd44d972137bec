//! Station page retrieval.
//!
//! `StationFetcher` is the seam between the refresh engine and whatever turns
//! a gauge URL into a [`Reading`]. `HttpFetcher` is the stock implementation:
//! one GET with the shared reqwest client, then element lookups by id.

use std::time::Duration;

use chrono::Local;
use futures_util::future::BoxFuture;
use pegel_proto::config::FetcherConfig;
use pegel_proto::protocol::{FetchError, Reading};
use scraper::{Html, Selector};
use tracing::debug;

pub type FetchFuture<'a> = BoxFuture<'a, Result<Reading, FetchError>>;

/// Loads a station page and extracts one reading from it.
///
/// Implementations own any per-fetch resource inside the returned future so
/// that dropping the future (completion, error or deadline) releases it.
pub trait StationFetcher: Send + Sync + 'static {
    fn fetch<'a>(&'a self, url: &'a str) -> FetchFuture<'a>;
}

// ── Page layout ───────────────────────────────────────────────────────────────

pub const ID_WATER_LEVEL: &str = "ID_INFO_W";
pub const ID_WATER_LEVEL_TREND: &str = "ID_INFO_WD";
pub const ID_WATER_LEVEL_TIME: &str = "ID_INFO_WZ";
pub const ID_FLOW_RATE: &str = "ID_INFO_Q";
pub const ID_FLOW_RATE_TREND: &str = "ID_INFO_QD";
pub const ID_FLOW_RATE_TIME: &str = "ID_INFO_QZ";
pub const ID_POSITION: &str = "ID_SELECT_POS";

pub const UNKNOWN_POSITION: &str = "Unknown position";

/// Extract a reading from a downloaded gauge page.
///
/// The six measurement fields are required; the position label is not.
pub fn parse_station_page(html: &str) -> Result<Reading, FetchError> {
    let doc = Html::parse_document(html);

    let required = |id: &str| -> Result<String, FetchError> {
        element_text(&doc, id)?.ok_or_else(|| FetchError::MissingField(id.to_string()))
    };

    let water_level = required(ID_WATER_LEVEL)?;
    let water_level_trend = required(ID_WATER_LEVEL_TREND)?;
    let water_level_timestamp = required(ID_WATER_LEVEL_TIME)?;
    let flow_rate = required(ID_FLOW_RATE)?;
    let flow_rate_trend = required(ID_FLOW_RATE_TREND)?;
    let flow_rate_timestamp = required(ID_FLOW_RATE_TIME)?;
    let station_label = element_text(&doc, ID_POSITION)?
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| UNKNOWN_POSITION.to_string());

    Ok(Reading {
        water_level,
        water_level_trend,
        water_level_timestamp,
        flow_rate,
        flow_rate_trend,
        flow_rate_timestamp,
        station_label,
        fetched_at: Local::now(),
    })
}

/// Trimmed, whitespace-collapsed text of the element with `id`, if present.
fn element_text(doc: &Html, id: &str) -> Result<Option<String>, FetchError> {
    let selector = Selector::parse(&format!("#{}", id))
        .map_err(|e| FetchError::Unknown(format!("bad selector for {}: {}", id, e)))?;
    Ok(doc.select(&selector).next().map(|el| {
        el.text()
            .flat_map(str::split_whitespace)
            .collect::<Vec<_>>()
            .join(" ")
    }))
}

// ── HttpFetcher ───────────────────────────────────────────────────────────────

pub struct HttpFetcher {
    client: reqwest::Client,
    timeout: Duration,
    settle_delay: Duration,
}

impl HttpFetcher {
    pub fn new(config: &FetcherConfig) -> anyhow::Result<Self> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            timeout,
            settle_delay: Duration::from_millis(config.settle_delay_ms),
        })
    }

    async fn load_page(&self, url: &str) -> Result<String, FetchError> {
        let response = self.client.get(url).send().await.map_err(|e| self.map_error(e))?;
        if !response.status().is_success() {
            return Err(FetchError::Navigation(format!("HTTP {}", response.status())));
        }
        let body = response.text().await.map_err(|e| self.map_error(e))?;

        // fixed pause between requests, paces the provider
        if !self.settle_delay.is_zero() {
            tokio::time::sleep(self.settle_delay).await;
        }
        Ok(body)
    }

    fn map_error(&self, e: reqwest::Error) -> FetchError {
        if e.is_timeout() {
            FetchError::Timeout(self.timeout)
        } else if e.is_connect() || e.is_request() || e.is_redirect() || e.is_status() {
            FetchError::Navigation(e.to_string())
        } else {
            FetchError::Unknown(e.to_string())
        }
    }
}

impl StationFetcher for HttpFetcher {
    fn fetch<'a>(&'a self, url: &'a str) -> FetchFuture<'a> {
        Box::pin(async move {
            let body = self.load_page(url).await?;
            debug!(url, bytes = body.len(), "station page loaded");
            parse_station_page(&body)
        })
    }
}
