use crate::protocol::{
    FetchError, FetchErrorKind, HistoryParseError, HistorySample, Reading, Station,
};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Per-station fetch bookkeeping. Failures never touch the latest reading;
/// they only show up here and in the log.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FetchHealth {
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub last_error: Option<FetchErrorKind>,
    pub last_success: Option<DateTime<Local>>,
}

/// Everything the display needs for one station entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationSnapshot {
    pub station: Station,
    pub latest: Option<Reading>,
    pub history_len: usize,
    pub health: FetchHealth,
}

#[derive(Debug, Default)]
struct StationData {
    latest: Option<Reading>,
    history: VecDeque<HistorySample>,
    health: FetchHealth,
}

#[derive(Debug, Default)]
struct RegistryState {
    /// Monotonic revision counter, incremented on every mutation.
    rev: u64,
    /// Display entries in insertion order. The same id may appear twice.
    stations: Vec<Station>,
    /// Measurements keyed by station id, shared by duplicate entries.
    data: HashMap<String, StationData>,
}

/// Tracked stations with their latest reading and water-level history.
///
/// Clones share the same state. Writes are expected to come from a single
/// owner (the monitor core loop); readers may sit anywhere.
#[derive(Clone)]
pub struct StationRegistry {
    state: Arc<RwLock<RegistryState>>,
    history_capacity: usize,
}

impl StationRegistry {
    pub fn new(history_capacity: usize) -> Self {
        Self {
            state: Arc::new(RwLock::new(RegistryState::default())),
            history_capacity: history_capacity.max(1),
        }
    }

    pub async fn rev(&self) -> u64 {
        self.state.read().await.rev
    }

    /// Register a station by its page URL. Adding the same URL twice creates
    /// a second entry with the same id.
    pub async fn add_station(&self, url: &str) -> Station {
        let station = Station::from_url(url.trim());
        let mut state = self.state.write().await;
        state.data.entry(station.id.clone()).or_default();
        state.stations.push(station.clone());
        state.rev += 1;
        station
    }

    pub async fn list_stations(&self) -> Vec<Station> {
        self.state.read().await.stations.clone()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.stations.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Replace the latest reading for `station_id`.
    ///
    /// The reading is stored even when its water level is not an integer; in
    /// that case only the history append is skipped and the parse error is
    /// returned.
    pub async fn record_reading(
        &self,
        station_id: &str,
        reading: Reading,
    ) -> Result<(), HistoryParseError> {
        let capacity = self.history_capacity;
        let mut state = self.state.write().await;
        let Some(data) = state.data.get_mut(station_id) else {
            debug!(station_id, "reading for unregistered station dropped");
            return Ok(());
        };

        let parsed = reading.water_level_cm();
        match &parsed {
            Ok(cm) => {
                if data.history.len() >= capacity {
                    data.history.pop_front();
                }
                data.history.push_back(HistorySample {
                    at: reading.fetched_at,
                    water_level_cm: *cm,
                });
            }
            Err(e) => {
                warn!(station_id, error = %e, "history append skipped");
            }
        }

        data.health.consecutive_failures = 0;
        data.health.last_success = Some(reading.fetched_at);
        data.latest = Some(reading);
        state.rev += 1;

        parsed.map(|_| ())
    }

    /// Note a failed fetch. The latest reading and history stay as they are.
    pub async fn record_failure(&self, station_id: &str, error: &FetchError) {
        let mut state = self.state.write().await;
        let Some(data) = state.data.get_mut(station_id) else {
            return;
        };
        data.health.consecutive_failures += 1;
        data.health.total_failures += 1;
        data.health.last_error = Some(error.kind());
        state.rev += 1;
    }

    pub async fn get_latest(&self, station_id: &str) -> Option<Reading> {
        let state = self.state.read().await;
        state.data.get(station_id)?.latest.clone()
    }

    pub async fn get_history(&self, station_id: &str) -> Vec<HistorySample> {
        let state = self.state.read().await;
        state
            .data
            .get(station_id)
            .map(|d| d.history.iter().copied().collect())
            .unwrap_or_default()
    }

    pub async fn health(&self, station_id: &str) -> Option<FetchHealth> {
        let state = self.state.read().await;
        state.data.get(station_id).map(|d| d.health.clone())
    }

    /// One consistent view over every display entry, in insertion order.
    pub async fn snapshot(&self) -> Vec<StationSnapshot> {
        let state = self.state.read().await;
        state
            .stations
            .iter()
            .map(|station| {
                let data = state.data.get(&station.id);
                StationSnapshot {
                    station: station.clone(),
                    latest: data.and_then(|d| d.latest.clone()),
                    history_len: data.map(|d| d.history.len()).unwrap_or(0),
                    health: data.map(|d| d.health.clone()).unwrap_or_default(),
                }
            })
            .collect()
    }
}
