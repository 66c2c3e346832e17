//! Probe scheduler
//!
//! One long-lived task per tracked (target, channel) drives the serialized
//! probe cycle: send, await ack or deadline, append exactly one measurement
//! row, notify analysis, back off. There is never more than one in-flight
//! probe per target; platforms do not guarantee ordered receipts, so
//! parallel probes would corrupt RTT attribution.

use crate::adapter::{PlatformAdapter, Receipt};
use crate::clock::{current_time_ms, jittered_delay_ms};
use crate::errors::AdapterError;
use crate::netmon::NetworkMonitor;
use crate::store::MeasurementStore;
use common::{Channel, Measurement, ProbeMethod};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

/// Poll period while the platform adapter is unlinked.
const UNAVAILABLE_POLL_MS: u64 = 5_000;
/// Added to the minimum backoff after a failed send, so a broken adapter
/// cannot spin the cycle.
const SEND_FAILURE_EXTRA_MS: u64 = 5_000;
/// Receipts that arrive before their probe registration are held this long.
const EARLY_RECEIPT_TTL: Duration = Duration::from_secs(5);

/// Completed-measurement notification toward the analysis engine.
#[derive(Debug, Clone)]
pub struct AnalysisNotice {
    pub target_id: String,
    pub channel: Channel,
}

/// Routes adapter receipts to the cycle currently waiting on the token.
///
/// A token is registered for the lifetime of one awaited probe. Receipts for
/// unregistered tokens (duplicates, late arrivals after timeout or
/// cancellation, or sends racing the receipt stream) land in a short-lived
/// side buffer; only the racing case ever consumes from it.
pub struct ProbeRegistry {
    inner: Mutex<RegistryInner>,
}

struct RegistryInner {
    waiting: HashMap<String, oneshot::Sender<i64>>,
    early: HashMap<String, (i64, Instant)>,
}

impl ProbeRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                waiting: HashMap::new(),
                early: HashMap::new(),
            }),
        }
    }

    pub fn register(&self, token: &str) -> oneshot::Receiver<i64> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock();
        inner.prune_early();
        if let Some((delivered_at_ms, _)) = inner.early.remove(token) {
            let _ = tx.send(delivered_at_ms);
        } else {
            inner.waiting.insert(token.to_string(), tx);
        }
        rx
    }

    /// Returns false when no probe is waiting on the token.
    pub fn deliver(&self, token: &str, delivered_at_ms: i64) -> bool {
        let mut inner = self.inner.lock();
        inner.prune_early();
        if let Some(tx) = inner.waiting.remove(token) {
            let _ = tx.send(delivered_at_ms);
            true
        } else {
            inner
                .early
                .insert(token.to_string(), (delivered_at_ms, Instant::now()));
            false
        }
    }

    pub fn cancel(&self, token: &str) {
        self.inner.lock().waiting.remove(token);
    }
}

impl RegistryInner {
    fn prune_early(&mut self) {
        let now = Instant::now();
        self.early
            .retain(|_, (_, seen_at)| now.duration_since(*seen_at) < EARLY_RECEIPT_TTL);
    }
}

impl Default for ProbeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Dependency handles shared by all target scheduler tasks.
#[derive(Clone)]
pub struct SchedulerContext {
    pub store: Arc<MeasurementStore>,
    pub monitor: Arc<NetworkMonitor>,
    pub registry: Arc<ProbeRegistry>,
    pub analysis_tx: mpsc::UnboundedSender<AnalysisNotice>,
    pub probe_method: Arc<RwLock<ProbeMethod>>,
}

/// Spawn the serialized probe cycle for one target. The returned watch
/// sender stops it cooperatively; the task exits within one probe timeout.
pub fn spawn_target_scheduler(
    ctx: SchedulerContext,
    adapter: Arc<dyn PlatformAdapter>,
    target_id: String,
) -> (watch::Sender<bool>, JoinHandle<()>) {
    let (stop_tx, stop_rx) = watch::channel(false);
    let handle = tokio::spawn(run_target_loop(ctx, adapter, target_id, stop_rx));
    (stop_tx, handle)
}

/// Drain one adapter's receipt stream into the registry.
pub fn spawn_receipt_consumer(
    adapter: Arc<dyn PlatformAdapter>,
    registry: Arc<ProbeRegistry>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let Some(mut receipts) = adapter.take_receipts() else {
            tracing::error!("receipt stream for {} already taken", adapter.channel());
            return;
        };
        while let Some(Receipt {
            token,
            delivered_at_ms,
        }) = receipts.recv().await
        {
            if !registry.deliver(&token, delivered_at_ms) {
                tracing::debug!("receipt for unmatched token discarded");
            }
        }
        tracing::info!("receipt stream for {} ended", adapter.channel());
    })
}

enum CycleOutcome {
    Acked(i64),
    TimedOut,
    Stopped,
}

async fn run_target_loop(
    ctx: SchedulerContext,
    adapter: Arc<dyn PlatformAdapter>,
    target_id: String,
    mut stop_rx: watch::Receiver<bool>,
) {
    let channel = adapter.channel();
    let (min_backoff, max_backoff) = channel.backoff_range_ms();
    let mut last_ts: i64 = 0;
    tracing::info!("probe scheduler started for {} on {}", target_id, channel);

    loop {
        if *stop_rx.borrow() {
            break;
        }
        if !adapter.is_available() {
            tracing::debug!("{} unlinked, probing paused for {}", channel, target_id);
            if wait_or_stop(&mut stop_rx, UNAVAILABLE_POLL_MS).await {
                break;
            }
            continue;
        }

        let method = *ctx.probe_method.read();
        // control snapshot at probe start
        let local_rtt_ms = ctx.monitor.current_rtt();

        let ticket = match adapter.send_probe(&target_id, method).await {
            Ok(ticket) => ticket,
            Err(AdapterError::Unavailable) => {
                tracing::info!("{} became unavailable, pausing {}", channel, target_id);
                if wait_or_stop(&mut stop_rx, UNAVAILABLE_POLL_MS).await {
                    break;
                }
                continue;
            }
            Err(e) => {
                // no network effect to observe, so no row either
                tracing::warn!("probe send failed for {} on {}: {}", target_id, channel, e);
                if wait_or_stop(&mut stop_rx, min_backoff + SEND_FAILURE_EXTRA_MS).await {
                    break;
                }
                continue;
            }
        };

        let ack_rx = ctx.registry.register(&ticket.token);
        let outcome = tokio::select! {
            _ = stop_rx.changed() => CycleOutcome::Stopped,
            ack = ack_rx => match ack {
                Ok(delivered_at_ms) => CycleOutcome::Acked(delivered_at_ms),
                Err(_) => CycleOutcome::TimedOut,
            },
            _ = tokio::time::sleep(Duration::from_millis(channel.probe_timeout_ms())) => {
                CycleOutcome::TimedOut
            }
        };

        let row = match outcome {
            CycleOutcome::Stopped => {
                // discard the in-flight probe; nothing is recorded
                ctx.registry.cancel(&ticket.token);
                tracing::info!("tracking stopped for {} mid-probe", target_id);
                break;
            }
            CycleOutcome::Acked(delivered_at_ms) => {
                let rtt = (delivered_at_ms - ticket.sent_at_ms).max(0);
                Measurement {
                    timestamp_ms: next_timestamp(&mut last_ts),
                    channel,
                    target_id: target_id.clone(),
                    target_rtt_ms: Some(rtt),
                    timeout: false,
                    local_network_rtt_ms: local_rtt_ms,
                    probe_method: method,
                }
            }
            CycleOutcome::TimedOut => {
                ctx.registry.cancel(&ticket.token);
                Measurement {
                    timestamp_ms: next_timestamp(&mut last_ts),
                    channel,
                    target_id: target_id.clone(),
                    target_rtt_ms: None,
                    timeout: true,
                    local_network_rtt_ms: local_rtt_ms,
                    probe_method: method,
                }
            }
        };

        if let Err(e) = ctx.store.append_raw(&row).await {
            // a fatal store error halts measurement for this target;
            // analysis keeps serving prior data
            tracing::error!("halting measurement for {}: {}", target_id, e);
            break;
        }
        let _ = ctx.analysis_tx.send(AnalysisNotice {
            target_id: target_id.clone(),
            channel,
        });

        let delay = jittered_delay_ms(min_backoff, max_backoff);
        if wait_or_stop(&mut stop_rx, delay).await {
            break;
        }
    }

    tracing::info!("probe scheduler stopped for {}", target_id);
}

/// Per-target timestamps are strictly increasing even when cycles complete
/// within the same clock millisecond.
fn next_timestamp(last_ts: &mut i64) -> i64 {
    let ts = current_time_ms().max(*last_ts + 1);
    *last_ts = ts;
    ts
}

/// Sleep that a stop signal cuts short. Returns true when stopped.
async fn wait_or_stop(stop_rx: &mut watch::Receiver<bool>, delay_ms: u64) -> bool {
    tokio::select! {
        _ = stop_rx.changed() => true,
        _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{ProbeTicket, ResolvedTarget};
    use crate::database::init_database;
    use crate::errors::AdapterError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use tempfile::NamedTempFile;

    struct MockAdapter {
        seq: AtomicU64,
        sent_tx: mpsc::UnboundedSender<String>,
        receipts_rx: Mutex<Option<mpsc::UnboundedReceiver<Receipt>>>,
        available: AtomicBool,
        fail_sends: AtomicBool,
    }

    impl MockAdapter {
        fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<String>, mpsc::UnboundedSender<Receipt>) {
            let (sent_tx, sent_rx) = mpsc::unbounded_channel();
            let (receipts_tx, receipts_rx) = mpsc::unbounded_channel();
            let adapter = Arc::new(Self {
                seq: AtomicU64::new(0),
                sent_tx,
                receipts_rx: Mutex::new(Some(receipts_rx)),
                available: AtomicBool::new(true),
                fail_sends: AtomicBool::new(false),
            });
            (adapter, sent_rx, receipts_tx)
        }
    }

    #[async_trait]
    impl PlatformAdapter for MockAdapter {
        fn channel(&self) -> Channel {
            Channel::Whatsapp
        }

        async fn send_probe(
            &self,
            _target_id: &str,
            _method: ProbeMethod,
        ) -> Result<ProbeTicket, AdapterError> {
            if self.fail_sends.load(Ordering::SeqCst) {
                return Err(AdapterError::ProbeFailed("mock failure".to_string()));
            }
            let token = format!("probe-{}", self.seq.fetch_add(1, Ordering::SeqCst));
            let _ = self.sent_tx.send(token.clone());
            Ok(ProbeTicket {
                token,
                sent_at_ms: current_time_ms(),
            })
        }

        fn take_receipts(&self) -> Option<mpsc::UnboundedReceiver<Receipt>> {
            self.receipts_rx.lock().take()
        }

        async fn resolve_target(&self, identifier: &str) -> Result<ResolvedTarget, AdapterError> {
            Ok(ResolvedTarget {
                target_id: identifier.to_string(),
                display_name: None,
                avatar_url: None,
            })
        }

        fn is_available(&self) -> bool {
            self.available.load(Ordering::SeqCst)
        }

        fn malformed_receipt_count(&self) -> u64 {
            0
        }
    }

    async fn test_context() -> (SchedulerContext, mpsc::UnboundedReceiver<AnalysisNotice>, NamedTempFile) {
        let temp_file = NamedTempFile::new().unwrap();
        let db = init_database(temp_file.path()).unwrap();
        let store = Arc::new(MeasurementStore::new(db));
        let monitor = Arc::new(NetworkMonitor::new(store.clone(), "127.0.0.1".to_string(), 1));
        let (analysis_tx, analysis_rx) = mpsc::unbounded_channel();
        let ctx = SchedulerContext {
            store,
            monitor,
            registry: Arc::new(ProbeRegistry::new()),
            analysis_tx,
            probe_method: Arc::new(RwLock::new(ProbeMethod::Delete)),
        };
        (ctx, analysis_rx, temp_file)
    }

    #[test]
    fn test_next_timestamp_strictly_increases() {
        let mut last = 0;
        let a = next_timestamp(&mut last);
        let b = next_timestamp(&mut last);
        let c = next_timestamp(&mut last);
        assert!(a < b && b < c);
    }

    #[tokio::test]
    async fn test_registry_routes_and_rejects_duplicates() {
        let registry = ProbeRegistry::new();
        let rx = registry.register("tok");
        assert!(registry.deliver("tok", 1234));
        assert_eq!(rx.await.unwrap(), 1234);
        // second receipt for the same token finds nobody waiting
        assert!(!registry.deliver("tok", 1235));
    }

    #[tokio::test]
    async fn test_registry_buffers_early_receipt() {
        let registry = ProbeRegistry::new();
        // receipt beats the registration (send racing the receipt stream)
        assert!(!registry.deliver("tok", 500));
        let rx = registry.register("tok");
        assert_eq!(rx.await.unwrap(), 500);
    }

    #[tokio::test]
    async fn test_registry_cancel_discards_late_receipt() {
        let registry = ProbeRegistry::new();
        let rx = registry.register("tok");
        registry.cancel("tok");
        assert!(!registry.deliver("tok", 999));
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn test_duplicate_receipts_yield_one_row() {
        let (ctx, mut analysis_rx, _tmp) = test_context().await;
        let (adapter, mut sent_rx, receipts_tx) = MockAdapter::new();
        let adapter: Arc<dyn PlatformAdapter> = adapter;

        let _consumer = spawn_receipt_consumer(adapter.clone(), ctx.registry.clone());
        let (stop_tx, handle) =
            spawn_target_scheduler(ctx.clone(), adapter, "t1@s.whatsapp.net".to_string());

        let token = sent_rx.recv().await.unwrap();
        let delivered = current_time_ms() + 40;
        receipts_tx
            .send(Receipt {
                token: token.clone(),
                delivered_at_ms: delivered,
            })
            .unwrap();
        receipts_tx
            .send(Receipt {
                token,
                delivered_at_ms: delivered + 1,
            })
            .unwrap();

        // wait for the cycle to record its measurement
        let notice = analysis_rx.recv().await.unwrap();
        assert_eq!(notice.channel, Channel::Whatsapp);

        let _ = stop_tx.send(true);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("scheduler must stop promptly")
            .unwrap();

        let rows = ctx
            .store
            .get_raw_in_window("t1@s.whatsapp.net", Channel::Whatsapp, 0, i64::MAX)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert!(!rows[0].timeout);
        assert!(rows[0].target_rtt_ms.unwrap() >= 0);
    }

    #[tokio::test]
    async fn test_cancellation_while_awaiting_ack_records_nothing() {
        let (ctx, _analysis_rx, _tmp) = test_context().await;
        let (adapter, mut sent_rx, _receipts_tx) = MockAdapter::new();
        let adapter: Arc<dyn PlatformAdapter> = adapter;

        let (stop_tx, handle) =
            spawn_target_scheduler(ctx.clone(), adapter, "t1@s.whatsapp.net".to_string());

        // probe is in flight, no receipt will come
        let token = sent_rx.recv().await.unwrap();
        let _ = stop_tx.send(true);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("stop must complete well within the probe timeout")
            .unwrap();

        let rows = ctx
            .store
            .get_raw_in_window("t1@s.whatsapp.net", Channel::Whatsapp, 0, i64::MAX)
            .await
            .unwrap();
        assert!(rows.is_empty());

        // a late receipt for the discarded probe finds nobody
        assert!(!ctx.registry.deliver(&token, current_time_ms()));
    }

    #[tokio::test]
    async fn test_send_failure_appends_no_row() {
        let (ctx, _analysis_rx, _tmp) = test_context().await;
        let (adapter, _sent_rx, _receipts_tx) = MockAdapter::new();
        adapter.fail_sends.store(true, Ordering::SeqCst);
        let adapter: Arc<dyn PlatformAdapter> = adapter;

        let (stop_tx, handle) =
            spawn_target_scheduler(ctx.clone(), adapter, "t1@s.whatsapp.net".to_string());

        tokio::time::sleep(Duration::from_millis(100)).await;
        let _ = stop_tx.send(true);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();

        let rows = ctx
            .store
            .get_raw_in_window("t1@s.whatsapp.net", Channel::Whatsapp, 0, i64::MAX)
            .await
            .unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_adapter_pauses_probing() {
        let (ctx, _analysis_rx, _tmp) = test_context().await;
        let (adapter, mut sent_rx, _receipts_tx) = MockAdapter::new();
        adapter.available.store(false, Ordering::SeqCst);
        let adapter: Arc<dyn PlatformAdapter> = adapter;

        let (stop_tx, handle) =
            spawn_target_scheduler(ctx.clone(), adapter, "t1@s.whatsapp.net".to_string());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(sent_rx.try_recv().is_err());

        let _ = stop_tx.send(true);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
