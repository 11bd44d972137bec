//! Tracing setup: a plain-text log file plus a layer that forwards WARN and
//! ERROR lines into the core loop so the console can show them.

use std::path::Path;

use tokio::sync::mpsc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::core::MonitorEvent;

pub const DEFAULT_FILTER: &str = "info,pegel_daemon=debug,reqwest=warn,hyper=warn";

/// Forwards WARN/ERROR events to the core loop as `MonitorEvent::Log`.
pub struct ForwardLayer {
    sender: mpsc::Sender<MonitorEvent>,
}

impl ForwardLayer {
    pub fn new(sender: mpsc::Sender<MonitorEvent>) -> Self {
        Self { sender }
    }
}

impl<S> tracing_subscriber::Layer<S> for ForwardLayer
where
    S: tracing::Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        let level = event.metadata().level();
        if !matches!(*level, tracing::Level::WARN | tracing::Level::ERROR) {
            return;
        }

        let mut message = format!("{} [{}] ", chrono::Local::now().format("%H:%M:%S"), level);
        let mut visitor = MessageVisitor(&mut message);
        event.record(&mut visitor);

        // never block the emitting task; a full channel drops the line
        let _ = self.sender.try_send(MonitorEvent::Log(message));
    }
}

struct MessageVisitor<'a>(&'a mut String);

impl<'a> tracing::field::Visit for MessageVisitor<'a> {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.0.push_str(value);
        } else {
            self.0.push_str(&format!(" {}={}", field.name(), value));
        }
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0.push_str(&format!("{:?}", value));
        } else {
            self.0.push_str(&format!(" {}={:?}", field.name(), value));
        }
    }
}

/// Install the global subscriber. `RUST_LOG` overrides [`DEFAULT_FILTER`].
pub fn init_tracing(log_path: &Path, event_tx: mpsc::Sender<MonitorEvent>) -> anyhow::Result<()> {
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(ForwardLayer::new(event_tx))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)))
        .try_init()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forwards_warnings_only() {
        let (tx, mut rx) = mpsc::channel(8);
        let subscriber = tracing_subscriber::registry().with(ForwardLayer::new(tx));

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("routine");
            tracing::warn!(station_id = "00063", "fetch failed: timed out after 30s");
            tracing::error!("parse blew up");
        });

        let MonitorEvent::Log(first) = rx.try_recv().unwrap() else {
            panic!("expected a log line");
        };
        assert!(first.contains("[WARN] fetch failed: timed out after 30s"));
        assert!(first.contains("station_id=00063"));

        let MonitorEvent::Log(second) = rx.try_recv().unwrap() else {
            panic!("expected a log line");
        };
        assert!(second.contains("[ERROR] parse blew up"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_full_channel_drops_lines() {
        let (tx, mut rx) = mpsc::channel(1);
        let subscriber = tracing_subscriber::registry().with(ForwardLayer::new(tx));

        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!("one");
            tracing::warn!("two");
        });

        assert!(matches!(rx.try_recv(), Ok(MonitorEvent::Log(_))));
        assert!(rx.try_recv().is_err());
    }
}
