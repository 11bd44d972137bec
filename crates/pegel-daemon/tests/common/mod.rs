#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Local;
use pegel_daemon::core::{MonitorCore, MonitorEvent, UiSink, View};
use pegel_daemon::fetcher::{FetchFuture, StationFetcher};
use pegel_proto::config::Config;
use pegel_proto::protocol::{station_id_from_url, FetchError, Reading, UiEvent};
use tokio::sync::mpsc;

pub fn station_url(id: &str) -> String {
    format!("https://provider/pegel.html?id={}", id)
}

pub fn reading(water_level: &str) -> Reading {
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

// ── Fetcher ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum Step {
    Level(&'static str),
    Fail(FetchError),
    Hang,
}

/// Replays a per-station script of outcomes. The last step repeats once the
/// script runs out.
#[derive(Default)]
pub struct ScriptedFetcher {
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, station_id: &str, steps: impl IntoIterator<Item = Step>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(station_id.to_string(), steps.into_iter().collect());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn next_step(&self, station_id: &str) -> Step {
        let mut scripts = self.scripts.lock().unwrap();
        let Some(steps) = scripts.get_mut(station_id) else {
            return Step::Fail(FetchError::Navigation(format!("no script for {}", station_id)));
        };
        if steps.len() > 1 {
            steps.pop_front().unwrap()
        } else {
            steps.front().cloned().unwrap_or(Step::Hang)
        }
    }
}

impl StationFetcher for ScriptedFetcher {
    fn fetch<'a>(&'a self, url: &'a str) -> FetchFuture<'a> {
        let station_id = station_id_from_url(url).to_string();
        self.calls.lock().unwrap().push(station_id.clone());
        let step = self.next_step(&station_id);
        Box::pin(async move {
            match step {
                Step::Level(level) => Ok(reading(level)),
                Step::Fail(e) => Err(e),
                Step::Hang => std::future::pending().await,
            }
        })
    }
}

// ── Sink ──────────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum Seen {
    Update(UiEvent),
    View(View),
    Log(String),
}

/// Mirrors every display call into a channel the test can await.
pub struct RecordingSink {
    tx: mpsc::UnboundedSender<Seen>,
}

impl UiSink for RecordingSink {
    fn on_update(&mut self, event: &UiEvent) {
        let _ = self.tx.send(Seen::Update(event.clone()));
    }

    fn show(&mut self, view: View) {
        let _ = self.tx.send(Seen::View(view));
    }

    fn on_log(&mut self, line: &str) {
        let _ = self.tx.send(Seen::Log(line.to_string()));
    }
}

pub struct Harness {
    pub events: mpsc::Sender<MonitorEvent>,
    pub seen: mpsc::UnboundedReceiver<Seen>,
    pub registry: pegel_proto::state::StationRegistry,
    pub interval: pegel_proto::config::RefreshInterval,
    pub fetcher: Arc<ScriptedFetcher>,
    pub core: tokio::task::JoinHandle<anyhow::Result<RecordingSink>>,
}

pub fn config(station_ids: &[&str]) -> Config {
    let mut config = Config::default();
    config.stations.urls = station_ids.iter().map(|id| station_url(id)).collect();
    config.provider.base_url = "https://provider".to_string();
    config
}

/// Build a MonitorCore around `fetcher` and start its loop.
pub async fn start(config: Config, fetcher: ScriptedFetcher) -> Harness {
    let (event_tx, event_rx) = mpsc::channel(256);
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();
    let fetcher = Arc::new(fetcher);

    let core = MonitorCore::new(
        config,
        fetcher.clone(),
        RecordingSink { tx: seen_tx },
        event_tx.clone(),
    )
    .await
    .unwrap();
    let registry = core.registry();
    let interval = core.interval();

    Harness {
        events: event_tx,
        seen: seen_rx,
        registry,
        interval,
        fetcher,
        core: tokio::spawn(core.run(event_rx)),
    }
}

impl Harness {
    pub async fn command(&self, cmd: pegel_daemon::core::ControlCommand) {
        self.events.send(MonitorEvent::Command(cmd)).await.unwrap();
    }

    pub async fn next_update(&mut self) -> UiEvent {
        loop {
            match self.seen.recv().await.unwrap() {
                Seen::Update(event) => return event,
                _ => continue,
            }
        }
    }

    pub async fn next_view(&mut self) -> View {
        loop {
            match self.seen.recv().await.unwrap() {
                Seen::View(view) => return view,
                _ => continue,
            }
        }
    }

    /// Collect `n` updates keyed by station id, in arrival order per id.
    pub async fn updates(&mut self, n: usize) -> HashMap<String, Vec<UiEvent>> {
        let mut by_id: HashMap<String, Vec<UiEvent>> = HashMap::new();
        for _ in 0..n {
            let event = self.next_update().await;
            by_id.entry(event.station_id.clone()).or_default().push(event);
        }
        by_id
    }

    pub async fn shutdown(self) -> RecordingSink {
        self.events.send(MonitorEvent::Shutdown).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), self.core)
            .await
            .unwrap()
            .unwrap()
            .unwrap()
    }
}
