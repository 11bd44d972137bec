//! Bounded fan-out of station fetches.
//!
//! Every dispatch is its own tokio task. A semaphore caps how many of them
//! talk to the provider at once, and each fetch runs under a deadline so a
//! hung page frees its permit. A station holds at most one task waiting for
//! a permit; further dispatches for it are dropped until that task starts.
//! Results go back to the core loop over the event channel; nothing here
//! touches the registry.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Local;
use pegel_proto::protocol::{FetchError, Reading, Station, UiEvent};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, warn};

use crate::core::MonitorEvent;
use crate::fetcher::StationFetcher;

#[derive(Clone)]
pub struct DispatchPool {
    fetcher: Arc<dyn StationFetcher>,
    permits: Arc<Semaphore>,
    /// Station ids with a task still waiting for a permit.
    queued: Arc<Mutex<HashSet<String>>>,
    max_concurrent: usize,
    timeout: Duration,
    event_tx: mpsc::Sender<MonitorEvent>,
}

impl DispatchPool {
    pub fn new(
        fetcher: Arc<dyn StationFetcher>,
        max_concurrent: usize,
        timeout: Duration,
        event_tx: mpsc::Sender<MonitorEvent>,
    ) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            fetcher,
            permits: Arc::new(Semaphore::new(max_concurrent)),
            queued: Arc::new(Mutex::new(HashSet::new())),
            max_concurrent,
            timeout,
            event_tx,
        }
    }

    /// Number of fetches currently holding a permit.
    pub fn in_flight(&self) -> usize {
        self.max_concurrent - self.permits.available_permits()
    }

    /// Number of stations with a task waiting for a permit.
    pub fn queued(&self) -> usize {
        self.queued.lock().map(|q| q.len()).unwrap_or(0)
    }

    /// Queue one fetch for `station`. Returns immediately, with `None` when
    /// the station already has a fetch waiting for a permit.
    pub fn dispatch(&self, station: Station) -> Option<tokio::task::JoinHandle<()>> {
        if !self.mark_queued(&station.id) {
            debug!(station_id = %station.id, "fetch already queued, skipping dispatch");
            return None;
        }
        let pool = self.clone();
        Some(tokio::spawn(async move {
            let permit = pool.permits.clone().acquire_owned().await;
            pool.unmark_queued(&station.id);
            let Ok(permit) = permit else {
                return;
            };
            let result = pool.fetch_with_deadline(&station.url).await;
            drop(permit);

            if let Err(e) = &result {
                log_failure(&station, e);
            }

            let event = UiEvent {
                station_id: station.id,
                url: station.url,
                result,
            };
            if pool
                .event_tx
                .send(MonitorEvent::FetchCompleted(event))
                .await
                .is_err()
            {
                debug!("fetch finished after the core loop exited");
            }
        }))
    }

    fn mark_queued(&self, station_id: &str) -> bool {
        match self.queued.lock() {
            Ok(mut queued) => queued.insert(station_id.to_string()),
            Err(poisoned) => poisoned.into_inner().insert(station_id.to_string()),
        }
    }

    fn unmark_queued(&self, station_id: &str) {
        match self.queued.lock() {
            Ok(mut queued) => queued.remove(station_id),
            Err(poisoned) => poisoned.into_inner().remove(station_id),
        };
    }

    async fn fetch_with_deadline(&self, url: &str) -> Result<Reading, FetchError> {
        let started = Instant::now();
        let result = match tokio::time::timeout(self.timeout, self.fetcher.fetch(url)).await {
            Ok(Ok(mut reading)) => {
                reading.fetched_at = Local::now();
                Ok(reading)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(FetchError::Timeout(self.timeout)),
        };
        debug!(
            url,
            elapsed_ms = started.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "fetch done"
        );
        result
    }
}

fn log_failure(station: &Station, e: &FetchError) {
    match e {
        FetchError::Unknown(_) => error!(
            station_id = %station.id,
            url = %station.url,
            kind = %e.kind(),
            "fetch failed: {}", e
        ),
        _ => warn!(
            station_id = %station.id,
            url = %station.url,
            kind = %e.kind(),
            "fetch failed: {}", e
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::FetchFuture;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Never resolves.
    struct HangingFetcher;

    impl StationFetcher for HangingFetcher {
        fn fetch<'a>(&'a self, _url: &'a str) -> FetchFuture<'a> {
            Box::pin(std::future::pending::<Result<Reading, FetchError>>())
        }
    }

    /// Sleeps, then fails; tracks the highest concurrency observed.
    struct SlowFetcher {
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    impl StationFetcher for SlowFetcher {
        fn fetch<'a>(&'a self, url: &'a str) -> FetchFuture<'a> {
            Box::pin(async move {
                let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(2)).await;
                self.running.fetch_sub(1, Ordering::SeqCst);
                Err(FetchError::MissingField(url.to_string()))
            })
        }
    }

    /// Returns a reading stamped a day in the past.
    struct BackdatedFetcher;

    impl StationFetcher for BackdatedFetcher {
        fn fetch<'a>(&'a self, _url: &'a str) -> FetchFuture<'a> {
            Box::pin(async {
                let mut reading = sample_reading();
                reading.fetched_at = Local::now() - chrono::Duration::days(1);
                Ok(reading)
            })
        }
    }

    fn sample_reading() -> Reading {
        Reading {
            water_level: "120".into(),
            water_level_trend: "steigend".into(),
            water_level_timestamp: "15.10.2026 14:00".into(),
            flow_rate: "12,3".into(),
            flow_rate_trend: "gleich".into(),
            flow_rate_timestamp: "15.10.2026 14:00".into(),
            station_label: "Plochingen / Neckar".into(),
            fetched_at: Local::now(),
        }
    }

    fn stations(n: usize) -> Vec<Station> {
        (0..n)
            .map(|i| Station::from_url(format!("https://p/pegel.html?id={}", i)))
            .collect()
    }

    fn completed(event: MonitorEvent) -> UiEvent {
        match event {
            MonitorEvent::FetchCompleted(e) => e,
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_fetch_times_out() {
        let (tx, mut rx) = mpsc::channel(8);
        let pool = DispatchPool::new(Arc::new(HangingFetcher), 2, Duration::from_secs(30), tx);
        pool.dispatch(Station::from_url("https://p/pegel.html?id=1"));

        let event = completed(rx.recv().await.unwrap());
        assert_eq!(event.station_id, "1");
        assert_eq!(event.result, Err(FetchError::Timeout(Duration::from_secs(30))));
        assert_eq!(pool.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_is_bounded() {
        let fetcher = Arc::new(SlowFetcher {
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let (tx, mut rx) = mpsc::channel(16);
        let pool = DispatchPool::new(fetcher.clone(), 3, Duration::from_secs(30), tx);
        for i in 0..10 {
            pool.dispatch(Station::from_url(format!("https://p/pegel.html?id={}", i)));
        }

        for _ in 0..10 {
            let event = completed(rx.recv().await.unwrap());
            assert!(matches!(event.result, Err(FetchError::MissingField(_))));
        }
        assert_eq!(fetcher.peak.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiting_fetches_are_not_stacked() {
        let (tx, mut rx) = mpsc::channel(256);
        let pool = DispatchPool::new(Arc::new(HangingFetcher), 1, Duration::from_secs(30), tx);
        let drain = tokio::spawn(async move { while rx.recv().await.is_some() {} });

        let first = stations(10)
            .into_iter()
            .filter_map(|s| pool.dispatch(s))
            .count();
        assert_eq!(first, 10);
        assert_eq!(pool.queued(), 10);

        // same stations again before any of them got a permit
        let again = stations(10)
            .into_iter()
            .filter_map(|s| pool.dispatch(s))
            .count();
        assert_eq!(again, 0);

        // ticks much faster than the single permit can drain
        for _ in 0..20 {
            tokio::time::sleep(Duration::from_secs(31)).await;
            for station in stations(10) {
                pool.dispatch(station);
            }
            assert!(pool.queued() <= 10, "queued {}", pool.queued());
            assert!(pool.in_flight() <= 1);
        }
        drain.abort();
    }

    #[tokio::test]
    async fn test_fetch_time_is_stamped_by_the_task() {
        let (tx, mut rx) = mpsc::channel(8);
        let pool = DispatchPool::new(Arc::new(BackdatedFetcher), 1, Duration::from_secs(30), tx);
        let before = Local::now();
        pool.dispatch(Station::from_url("https://p/pegel.html?id=00063"));

        let reading = completed(rx.recv().await.unwrap()).result.unwrap();
        assert!(reading.fetched_at >= before);
    }
}
