//! Fixed-cadence refresh loop.
//!
//! `Idle -> Waiting(interval) -> Firing -> Waiting(..)` until cancelled. The
//! interval is read at the start of every wait, so a rate change takes effect
//! on the next wait and never preempts the current one. Firing snapshots the
//! registry and hands one fetch per entry to the pool without waiting for any
//! of them. The pool drops entries whose station still has a fetch queued.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pegel_proto::config::RefreshInterval;
use pegel_proto::state::StationRegistry;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::pool::DispatchPool;

struct ActiveLoop {
    generation: u64,
    cancel: CancellationToken,
    _handle: JoinHandle<()>,
}

pub struct RefreshScheduler {
    interval: RefreshInterval,
    registry: StationRegistry,
    pool: DispatchPool,
    ticks: Arc<AtomicU64>,
    active: Option<ActiveLoop>,
    generation: u64,
}

impl RefreshScheduler {
    pub fn new(interval: RefreshInterval, registry: StationRegistry, pool: DispatchPool) -> Self {
        Self {
            interval,
            registry,
            pool,
            ticks: Arc::new(AtomicU64::new(0)),
            active: None,
            generation: 0,
        }
    }

    /// Spawn the loop unless one is already running. Returns whether a new
    /// loop was started.
    pub fn start(&mut self) -> bool {
        if self.is_running() {
            return false;
        }
        self.generation += 1;
        let generation = self.generation;
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_loop(
            generation,
            self.interval.clone(),
            self.registry.clone(),
            self.pool.clone(),
            self.ticks.clone(),
            cancel.clone(),
        ));
        self.active = Some(ActiveLoop {
            generation,
            cancel,
            _handle: handle,
        });
        true
    }

    /// Cancel the running loop, if any. In-flight fetches are left alone.
    pub fn stop(&mut self) {
        if let Some(active) = self.active.take() {
            debug!(generation = active.generation, "cancelling refresh loop");
            active.cancel.cancel();
        }
    }

    /// Replace the running loop with a fresh one whose first wait starts now.
    pub fn restart(&mut self) {
        self.stop();
        self.start();
    }

    pub fn is_running(&self) -> bool {
        self.active
            .as_ref()
            .map(|a| !a.cancel.is_cancelled())
            .unwrap_or(false)
    }

    /// Ticks fired so far, across all loop generations.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::SeqCst)
    }

    /// Fire once right now, outside the regular cadence.
    pub async fn fire_now(&self) -> usize {
        dispatch_all(&self.registry, &self.pool).await
    }
}

impl Drop for RefreshScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_loop(
    generation: u64,
    interval: RefreshInterval,
    registry: StationRegistry,
    pool: DispatchPool,
    ticks: Arc<AtomicU64>,
    cancel: CancellationToken,
) {
    info!(generation, "refresh loop started");
    loop {
        let secs = interval.seconds();
        debug!(generation, secs, "waiting for next tick");
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
        }
        if cancel.is_cancelled() {
            break;
        }

        let dispatched = dispatch_all(&registry, &pool).await;
        ticks.fetch_add(1, Ordering::SeqCst);
        debug!(generation, dispatched, "tick");
    }
    info!(generation, "refresh loop stopped");
}

async fn dispatch_all(registry: &StationRegistry, pool: &DispatchPool) -> usize {
    registry
        .list_stations()
        .await
        .into_iter()
        .filter_map(|station| pool.dispatch(station))
        .count()
}
