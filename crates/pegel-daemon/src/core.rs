/// MonitorCore: single-owner event loop for registry writes and display
/// updates.
///
/// Fetch tasks, the console reader and the log forwarder never touch the
/// registry or the display directly. They send `MonitorEvent`s into this loop,
/// which applies them one at a time. Every registry write and every `UiSink`
/// call happens here, in arrival order. Readers elsewhere may hold a clone
/// of the `StationRegistry` and take snapshots at any time.
///
/// A failed fetch is recorded as health only. The display receives the event
/// but keeps showing the last good reading.
use std::sync::Arc;
use std::time::Duration;

use pegel_proto::config::{Config, RefreshInterval};
use pegel_proto::protocol::{DiagramKind, HistorySample, Station, UiEvent};
use pegel_proto::state::{StationRegistry, StationSnapshot};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::fetcher::StationFetcher;
use crate::pool::DispatchPool;
use crate::scheduler::RefreshScheduler;

// ── MonitorEvent ──────────────────────────────────────────────────────────────

/// All inputs into the MonitorCore loop.
#[derive(Debug)]
pub enum MonitorEvent {
    /// A request from the control surface.
    Command(ControlCommand),
    /// One fetch task finished, successfully or not.
    FetchCompleted(UiEvent),
    /// A WARN/ERROR line from the tracing forwarder.
    Log(String),
    Shutdown,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControlCommand {
    AddStation(String),
    /// Raw user input, in minutes.
    SetRefreshMinutes(String),
    ShowRefreshRate,
    RestartScheduler,
    RefreshNow,
    ListStations,
    ShowHistory(String),
    ShowDiagram(String, DiagramKind),
    Help,
}

// ── Display ───────────────────────────────────────────────────────────────────

/// Things the display is asked to show besides per-fetch updates.
#[derive(Debug, Clone)]
pub enum View {
    StationAdded(Station),
    Stations {
        entries: Vec<StationSnapshot>,
        stale_after: chrono::Duration,
    },
    History {
        station_id: String,
        samples: Vec<HistorySample>,
    },
    Diagram {
        station_id: String,
        kind: DiagramKind,
        url: String,
    },
    RefreshRate {
        interval_secs: u64,
    },
    Rejected(String),
    Help,
}

/// The display layer. Only ever called from the MonitorCore loop.
pub trait UiSink: Send {
    /// One completed fetch. On error the display should keep its last
    /// reading for the station.
    fn on_update(&mut self, event: &UiEvent);

    fn show(&mut self, view: View);

    fn on_log(&mut self, _line: &str) {}
}

// ── MonitorCore ───────────────────────────────────────────────────────────────

pub struct MonitorCore<S: UiSink> {
    config: Config,
    registry: StationRegistry,
    interval: RefreshInterval,
    scheduler: RefreshScheduler,
    pool: DispatchPool,
    sink: S,
}

impl<S: UiSink> MonitorCore<S> {
    pub async fn new(
        config: Config,
        fetcher: Arc<dyn StationFetcher>,
        sink: S,
        event_tx: mpsc::Sender<MonitorEvent>,
    ) -> anyhow::Result<Self> {
        config.validate()?;

        let registry = StationRegistry::new(config.history.capacity);
        for url in &config.stations.urls {
            let station = registry.add_station(url).await;
            debug!(station_id = %station.id, url = %station.url, "configured station");
        }

        let interval = RefreshInterval::new(config.refresh.interval_secs)?;
        let pool = DispatchPool::new(
            fetcher,
            config.refresh.max_concurrent_fetches,
            Duration::from_secs(config.fetcher.timeout_secs),
            event_tx,
        );
        let scheduler = RefreshScheduler::new(interval.clone(), registry.clone(), pool.clone());

        Ok(Self {
            config,
            registry,
            interval,
            scheduler,
            pool,
            sink,
        })
    }

    pub fn registry(&self) -> StationRegistry {
        self.registry.clone()
    }

    pub fn interval(&self) -> RefreshInterval {
        self.interval.clone()
    }

    /// Run until `Shutdown` arrives or every sender is gone. Returns the sink
    /// so callers can inspect or flush it.
    pub async fn run(mut self, mut event_rx: mpsc::Receiver<MonitorEvent>) -> anyhow::Result<S> {
        let stations = self.registry.len().await;
        info!(
            stations,
            interval_secs = self.interval.seconds(),
            "MonitorCore: starting event loop"
        );

        // first readings right away instead of one full interval from now
        self.scheduler.fire_now().await;
        self.scheduler.start();

        loop {
            match event_rx.recv().await {
                None => {
                    info!("MonitorCore: event channel closed, shutting down");
                    break;
                }
                Some(MonitorEvent::Shutdown) => {
                    info!("MonitorCore: shutdown requested");
                    break;
                }
                Some(MonitorEvent::Command(cmd)) => {
                    debug!("MonitorCore: command {:?}", cmd);
                    self.handle_command(cmd).await;
                }
                Some(MonitorEvent::FetchCompleted(event)) => {
                    self.handle_fetch_completed(event).await;
                }
                Some(MonitorEvent::Log(line)) => {
                    self.sink.on_log(&line);
                }
            }
        }

        self.scheduler.stop();
        Ok(self.sink)
    }

    async fn handle_fetch_completed(&mut self, event: UiEvent) {
        match &event.result {
            Ok(reading) => {
                // a non-numeric level still replaces the latest reading;
                // the registry logs the skipped history append
                let _ = self
                    .registry
                    .record_reading(&event.station_id, reading.clone())
                    .await;
                info!(
                    station_id = %event.station_id,
                    label = %reading.station_label,
                    "station updated at {}",
                    reading.fetched_at.format("%H:%M:%S")
                );
            }
            Err(e) => {
                self.registry.record_failure(&event.station_id, e).await;
            }
        }
        self.sink.on_update(&event);
    }

    async fn handle_command(&mut self, cmd: ControlCommand) {
        match cmd {
            ControlCommand::AddStation(url) => {
                let url = url.trim();
                if url.is_empty() {
                    self.sink.show(View::Rejected("station URL is empty".into()));
                    return;
                }
                let station = self.registry.add_station(url).await;
                info!(station_id = %station.id, url = %station.url, "station added");
                self.sink.show(View::StationAdded(station.clone()));
                self.pool.dispatch(station);
            }

            ControlCommand::SetRefreshMinutes(input) => {
                match self.interval.set_minutes_input(&input) {
                    Ok(secs) => {
                        info!(interval_secs = secs, "refresh rate changed, applies from the next wait");
                        self.sink.show(View::RefreshRate { interval_secs: secs });
                    }
                    Err(e) => {
                        warn!(interval_secs = self.interval.seconds(), "refresh rate unchanged: {}", e);
                        self.sink.show(View::Rejected(e.to_string()));
                    }
                }
            }

            ControlCommand::ShowRefreshRate => {
                self.sink.show(View::RefreshRate {
                    interval_secs: self.interval.seconds(),
                });
            }

            ControlCommand::RestartScheduler => {
                self.scheduler.restart();
                info!(interval_secs = self.interval.seconds(), "refresh loop restarted");
                self.sink.show(View::RefreshRate {
                    interval_secs: self.interval.seconds(),
                });
            }

            ControlCommand::RefreshNow => {
                let dispatched = self.scheduler.fire_now().await;
                debug!(dispatched, "manual refresh");
            }

            ControlCommand::ListStations => {
                let stale_after = stale_window(self.interval.seconds());
                self.sink.show(View::Stations {
                    entries: self.registry.snapshot().await,
                    stale_after,
                });
            }

            ControlCommand::ShowHistory(station_id) => {
                let samples = self.registry.get_history(&station_id).await;
                self.sink.show(View::History { station_id, samples });
            }

            ControlCommand::ShowDiagram(station_id, kind) => {
                let url = pegel_proto::protocol::diagram_url(
                    &self.config.provider.base_url,
                    &station_id,
                    kind,
                );
                self.sink.show(View::Diagram {
                    station_id,
                    kind,
                    url,
                });
            }

            ControlCommand::Help => self.sink.show(View::Help),
        }
    }
}

/// Age past which a reading counts as stale: three refresh intervals.
fn stale_window(interval_secs: u64) -> chrono::Duration {
    i64::try_from(interval_secs)
        .ok()
        .and_then(|secs| secs.checked_mul(3))
        .and_then(chrono::Duration::try_seconds)
        .unwrap_or(chrono::Duration::MAX)
}
