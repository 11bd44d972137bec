use std::sync::Arc;

use pegel_daemon::console::{self, ConsoleSink};
use pegel_daemon::core::{MonitorCore, MonitorEvent};
use pegel_daemon::fetcher::HttpFetcher;
use pegel_daemon::logging;
use pegel_proto::config::Config;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Event channel: fetch results, console commands and forwarded log lines
    // all funnel into MonitorCore
    let (event_tx, event_rx) = tokio::sync::mpsc::channel::<MonitorEvent>(256);

    let config = Config::load()?;

    logging::init_tracing(&config.daemon.log_file, event_tx.clone())?;
    eprintln!("pegel-monitor log: {}", config.daemon.log_file.display());
    info!("Config loaded from: {:?}", Config::config_path());

    let fetcher = Arc::new(HttpFetcher::new(&config.fetcher)?);
    let sink = ConsoleSink::stdout(config.provider.base_url.clone());

    let monitor = MonitorCore::new(config, fetcher, sink, event_tx.clone()).await?;
    let _stdin = console::spawn_stdin_reader(event_tx.clone());

    // Ctrl-C ends the loop the same way `quit` does
    let shutdown_tx = event_tx;
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(MonitorEvent::Shutdown).await;
        }
    });

    println!("{}", console::HELP);
    monitor.run(event_rx).await?;
    info!("pegel-monitor stopped");
    Ok(())
}
