//! Local network monitor
//!
//! Continuous, target-independent control signal: TCP handshake probes
//! against a fixed reference endpoint. The scheduler snapshots the latest
//! RTT at probe start so analysis can subtract host-side network conditions
//! from target RTTs. The monitor never raises into callers; every failure
//! is logged and absorbed into the loss rate.

use crate::clock::current_time_ms;
use crate::stats;
use crate::store::MeasurementStore;
use common::LocalNetworkSample;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Duration, Instant};

pub const PING_INTERVAL_MS: u64 = 2_000;
pub const CONNECT_TIMEOUT_MS: u64 = 1_000;

/// Rolling window of recent probe outcomes.
const WINDOW_SIZE: usize = 50;
/// Below this many valid samples the reported deviation is 0.
const MIN_STDDEV_SAMPLES: usize = 6;

pub struct NetworkMonitor {
    store: Arc<MeasurementStore>,
    reference_host: String,
    reference_port: u16,
    window: Mutex<VecDeque<Option<i64>>>,
    running: AtomicBool,
    stop_tx: Mutex<Option<watch::Sender<bool>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl NetworkMonitor {
    pub fn new(store: Arc<MeasurementStore>, reference_host: String, reference_port: u16) -> Self {
        Self {
            store,
            reference_host,
            reference_port,
            window: Mutex::new(VecDeque::with_capacity(WINDOW_SIZE)),
            running: AtomicBool::new(false),
            stop_tx: Mutex::new(None),
            handle: Mutex::new(None),
        }
    }

    /// Start the probe loop. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let (stop_tx, mut stop_rx) = watch::channel(false);
        *self.stop_tx.lock() = Some(stop_tx);

        let monitor = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = interval(Duration::from_millis(PING_INTERVAL_MS));
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = ticker.tick() => monitor.probe_once().await,
                }
            }
            tracing::info!("local network monitor stopped");
        });
        *self.handle.lock() = Some(handle);
        tracing::info!(
            "local network monitor started against {}:{}",
            self.reference_host,
            self.reference_port
        );
    }

    /// Stop the probe loop. Idempotent.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(stop_tx) = self.stop_tx.lock().take() {
            let _ = stop_tx.send(true);
        }
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if timeout(Duration::from_secs(3), handle).await.is_err() {
                tracing::warn!("local network monitor did not stop in time");
            }
        }
    }

    /// RTT of the most recent probe, or None if it failed or none ran yet.
    pub fn current_rtt(&self) -> Option<i64> {
        self.window.lock().back().copied().flatten()
    }

    /// Fraction of failed probes in the rolling window.
    pub fn current_loss_rate(&self) -> f64 {
        window_stats(&self.window.lock()).0
    }

    async fn probe_once(&self) {
        let started = Instant::now();
        let addr = (self.reference_host.clone(), self.reference_port);
        let connected = timeout(
            Duration::from_millis(CONNECT_TIMEOUT_MS),
            TcpStream::connect(addr),
        )
        .await;
        let rtt_ms = match connected {
            Ok(Ok(_stream)) => Some(started.elapsed().as_millis() as i64),
            Ok(Err(e)) => {
                tracing::debug!("reference probe failed: {}", e);
                None
            }
            Err(_) => None, // connect deadline exceeded
        };

        let (loss_rate, variance_ms) = {
            let mut window = self.window.lock();
            if window.len() == WINDOW_SIZE {
                window.pop_front();
            }
            window.push_back(rtt_ms);
            window_stats(&window)
        };

        let sample = LocalNetworkSample {
            timestamp_ms: current_time_ms(),
            rtt_ms,
            timeout: rtt_ms.is_none(),
            variance_ms,
            packet_loss_rate: loss_rate,
            reference_target: format!("{}:{}", self.reference_host, self.reference_port),
        };
        if let Err(e) = self.store.append_local(&sample).await {
            tracing::warn!("failed to persist local network sample: {}", e);
        }
    }
}

/// Loss rate and RTT standard deviation over the rolling window.
fn window_stats(window: &VecDeque<Option<i64>>) -> (f64, i64) {
    if window.is_empty() {
        return (0.0, 0);
    }
    let nulls = window.iter().filter(|s| s.is_none()).count();
    let loss_rate = nulls as f64 / window.len() as f64;
    let valid: Vec<i64> = window.iter().filter_map(|s| *s).collect();
    let variance_ms = if valid.len() < MIN_STDDEV_SAMPLES {
        0
    } else {
        stats::population_stddev(&valid).round() as i64
    };
    (loss_rate, variance_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::init_database;
    use tempfile::NamedTempFile;

    fn window_of(samples: &[Option<i64>]) -> VecDeque<Option<i64>> {
        samples.iter().copied().collect()
    }

    #[test]
    fn test_window_stats_empty() {
        assert_eq!(window_stats(&VecDeque::new()), (0.0, 0));
    }

    #[test]
    fn test_loss_rate_over_partial_window() {
        let w = window_of(&[Some(10), None, Some(12), None]);
        let (loss, _) = window_stats(&w);
        assert_eq!(loss, 0.5);
    }

    #[test]
    fn test_stddev_needs_six_valid_samples() {
        let w = window_of(&[Some(10), Some(20), Some(30), Some(40), Some(50)]);
        assert_eq!(window_stats(&w).1, 0);

        let w = window_of(&[Some(10), Some(20), Some(30), Some(40), Some(50), Some(60)]);
        assert!(window_stats(&w).1 > 0);
    }

    async fn monitor_with_listener() -> (Arc<NetworkMonitor>, tokio::net::TcpListener, NamedTempFile)
    {
        let temp_file = NamedTempFile::new().unwrap();
        let db = init_database(temp_file.path()).unwrap();
        let store = Arc::new(MeasurementStore::new(db));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let monitor = Arc::new(NetworkMonitor::new(store, "127.0.0.1".to_string(), port));
        (monitor, listener, temp_file)
    }

    #[tokio::test]
    async fn test_probe_against_live_listener() {
        let (monitor, _listener, _tmp) = monitor_with_listener().await;
        monitor.probe_once().await;
        assert!(monitor.current_rtt().is_some());
        assert_eq!(monitor.current_loss_rate(), 0.0);
    }

    #[tokio::test]
    async fn test_probe_against_dead_port_records_loss() {
        let (monitor, listener, _tmp) = monitor_with_listener().await;
        drop(listener);
        monitor.probe_once().await;
        assert_eq!(monitor.current_rtt(), None);
        assert_eq!(monitor.current_loss_rate(), 1.0);
    }

    #[tokio::test]
    async fn test_start_stop_idempotent() {
        let (monitor, _listener, _tmp) = monitor_with_listener().await;
        monitor.start();
        monitor.start();
        monitor.stop().await;
        monitor.stop().await;
    }
}
