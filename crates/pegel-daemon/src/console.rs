//! Line-oriented console front end.
//!
//! Commands come in on stdin and are turned into `MonitorEvent`s; updates go
//! out through [`ConsoleSink`], which only ever runs inside the core loop.

use std::io::Write;

use chrono::Local;
use pegel_proto::protocol::{diagram_url, DiagramKind, Reading, UiEvent};
use pegel_proto::state::StationSnapshot;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::core::{ControlCommand, MonitorEvent, UiSink, View};

pub const HELP: &str = "\
commands:
  add <url>                 track another gauge page
  rate [minutes]            show or set the refresh interval (from the next wait on)
  restart                   restart the refresh loop now
  refresh                   fetch every station right away
  list                      show all stations
  history <id>              show recorded water levels for a station
  diagram <id> level|flow   print the chart URL for a station
  help                      this text
  quit                      exit";

// ── Parsing ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleInput {
    Command(ControlCommand),
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("unknown command {0:?}, try 'help'")]
    Unknown(String),
    #[error("usage: {0}")]
    Usage(&'static str),
}

/// Parse one console line. Blank lines yield `Ok(None)`.
pub fn parse_command(line: &str) -> Result<Option<ConsoleInput>, CommandError> {
    let line = line.trim();
    let Some((verb, rest)) = split_verb(line) else {
        return Ok(None);
    };

    let cmd = match verb.to_ascii_lowercase().as_str() {
        "add" if !rest.is_empty() => ControlCommand::AddStation(rest.to_string()),
        "add" => return Err(CommandError::Usage("add <url>")),
        "rate" if rest.is_empty() => ControlCommand::ShowRefreshRate,
        // the interval validates the value itself so invalid input is logged
        "rate" => ControlCommand::SetRefreshMinutes(rest.to_string()),
        "restart" => ControlCommand::RestartScheduler,
        "refresh" => ControlCommand::RefreshNow,
        "list" | "ls" => ControlCommand::ListStations,
        "history" if !rest.is_empty() => ControlCommand::ShowHistory(rest.to_string()),
        "history" => return Err(CommandError::Usage("history <id>")),
        "diagram" => {
            let mut args = rest.split_whitespace();
            let (Some(id), Some(kind), None) = (args.next(), args.next(), args.next()) else {
                return Err(CommandError::Usage("diagram <id> level|flow"));
            };
            let kind = match kind.to_ascii_lowercase().as_str() {
                "level" | "w" => DiagramKind::WaterLevel,
                "flow" | "q" => DiagramKind::FlowRate,
                _ => return Err(CommandError::Usage("diagram <id> level|flow")),
            };
            ControlCommand::ShowDiagram(id.to_string(), kind)
        }
        "help" | "?" => ControlCommand::Help,
        "quit" | "exit" | "q" => return Ok(Some(ConsoleInput::Quit)),
        _ => return Err(CommandError::Unknown(verb.to_string())),
    };
    Ok(Some(ConsoleInput::Command(cmd)))
}

fn split_verb(line: &str) -> Option<(&str, &str)> {
    if line.is_empty() {
        return None;
    }
    Some(match line.split_once(char::is_whitespace) {
        Some((verb, rest)) => (verb, rest.trim()),
        None => (line, ""),
    })
}

/// Read stdin line by line, forwarding commands to the core loop. `quit`
/// shuts the monitor down; EOF only ends the reader, so the monitor keeps
/// running without a terminal until Ctrl-C.
pub fn spawn_stdin_reader(event_tx: mpsc::Sender<MonitorEvent>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(read_commands(BufReader::new(tokio::io::stdin()), event_tx))
}

pub async fn read_commands<R>(input: R, event_tx: mpsc::Sender<MonitorEvent>)
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!("stdin closed, console commands disabled");
                return;
            }
            Err(e) => {
                info!("stdin read failed, console commands disabled: {}", e);
                return;
            }
        };

        let event = match parse_command(&line) {
            Ok(None) => continue,
            Ok(Some(ConsoleInput::Quit)) => MonitorEvent::Shutdown,
            Ok(Some(ConsoleInput::Command(cmd))) => MonitorEvent::Command(cmd),
            Err(e) => {
                println!("{}", e);
                continue;
            }
        };
        let quit = matches!(event, MonitorEvent::Shutdown);
        if event_tx.send(event).await.is_err() || quit {
            return;
        }
    }
}

// ── Rendering ─────────────────────────────────────────────────────────────────

pub fn format_title(station_id: &str, reading: Option<&Reading>) -> String {
    match reading {
        Some(r) => format!("Station {} - {}", station_id, r.station_label),
        None => format!("Station {} - loading...", station_id),
    }
}

pub fn format_water_level(reading: Option<&Reading>) -> String {
    match reading {
        Some(r) => format!(
            "Water level: {} cm ({}) - {}",
            r.water_level, r.water_level_trend, r.water_level_timestamp
        ),
        None => "Water level: -- cm".to_string(),
    }
}

pub fn format_flow_rate(reading: Option<&Reading>) -> String {
    match reading {
        Some(r) => format!(
            "Flow: {} m³/s ({}) - {}",
            r.flow_rate, r.flow_rate_trend, r.flow_rate_timestamp
        ),
        None => "Flow: -- m³/s".to_string(),
    }
}

pub fn format_last_updated(reading: Option<&Reading>) -> String {
    match reading {
        Some(r) => format!("Last updated: {}", r.fetched_at.format("%H:%M:%S")),
        None => "Last updated: --:--:--".to_string(),
    }
}

/// Prints everything to a writer, stdout by default.
pub struct ConsoleSink<W: Write + Send = std::io::Stdout> {
    out: W,
    provider_base: String,
}

impl ConsoleSink {
    pub fn stdout(provider_base: impl Into<String>) -> Self {
        Self::new(std::io::stdout(), provider_base)
    }
}

impl<W: Write + Send> ConsoleSink<W> {
    pub fn new(out: W, provider_base: impl Into<String>) -> Self {
        Self {
            out,
            provider_base: provider_base.into(),
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn line(&mut self, text: impl AsRef<str>) {
        let _ = writeln!(self.out, "{}", text.as_ref());
    }

    fn station_block(&mut self, station_id: &str, reading: Option<&Reading>) {
        self.line(format_title(station_id, reading));
        self.line(format!("  {}", format_water_level(reading)));
        self.line(format!("  {}", format_flow_rate(reading)));
        self.line(format!("  {}", format_last_updated(reading)));
    }

    fn snapshot_entry(&mut self, entry: &StationSnapshot, stale_after: chrono::Duration) {
        let reading = entry.latest.as_ref();
        self.station_block(&entry.station.id, reading);
        if reading.is_some_and(|r| r.is_stale_at(stale_after, Local::now())) {
            self.line("  [stale]");
        }
        if entry.health.consecutive_failures > 0 {
            let last = entry
                .health
                .last_error
                .map(|k| k.to_string())
                .unwrap_or_default();
            self.line(format!(
                "  {} failed fetch(es) in a row, last: {}",
                entry.health.consecutive_failures, last
            ));
        }
        self.line(format!("  {} samples recorded", entry.history_len));
    }
}

impl<W: Write + Send> UiSink for ConsoleSink<W> {
    fn on_update(&mut self, event: &UiEvent) {
        match &event.result {
            Ok(reading) => {
                self.station_block(&event.station_id, Some(reading));
                self.line(format!(
                    "{} (id: {}) updated at {}",
                    reading.station_label,
                    event.station_id,
                    reading.fetched_at.format("%H:%M:%S")
                ));
            }
            // failures reach the operator through the forwarded log lines
            Err(_) => {}
        }
    }

    fn show(&mut self, view: View) {
        match view {
            View::StationAdded(station) => {
                self.line(format!("Added station {} ({})", station.id, station.url));
                for kind in [DiagramKind::WaterLevel, DiagramKind::FlowRate] {
                    let url = diagram_url(&self.provider_base, &station.id, kind);
                    self.line(format!("  {} chart: {}", kind.label(), url));
                }
            }
            View::Stations {
                entries,
                stale_after,
            } => {
                if entries.is_empty() {
                    self.line("no stations, use 'add <url>'");
                }
                for entry in &entries {
                    self.snapshot_entry(entry, stale_after);
                }
            }
            View::History {
                station_id,
                samples,
            } => {
                if samples.is_empty() {
                    self.line(format!("no history for station {}", station_id));
                }
                for sample in samples {
                    self.line(format!(
                        "{}  {} cm",
                        sample.at.format("%Y-%m-%d %H:%M:%S"),
                        sample.water_level_cm
                    ));
                }
            }
            View::Diagram {
                station_id,
                kind,
                url,
            } => self.line(format!("{} chart for station {}: {}", kind.label(), station_id, url)),
            View::RefreshRate { interval_secs } => {
                if interval_secs % 60 == 0 {
                    self.line(format!("Refresh rate: {} minute(s)", interval_secs / 60));
                } else {
                    self.line(format!("Refresh rate: {} second(s)", interval_secs));
                }
            }
            View::Rejected(reason) => self.line(format!("rejected: {}", reason)),
            View::Help => self.line(HELP),
        }
    }

    fn on_log(&mut self, line: &str) {
        let _ = writeln!(std::io::stderr(), "{}", line);
    }
}
