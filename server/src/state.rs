//! Shared application state
//!
//! Dependency handles for every component, passed explicitly rather than
//! reached for globally. The tracked-target registry lives here: adding a
//! target spawns its scheduler task, removing one signals it to stop and
//! leaves all historical data in place.

use crate::adapter::PlatformAdapter;
use crate::netmon::NetworkMonitor;
use crate::scheduler::{spawn_target_scheduler, AnalysisNotice, ProbeRegistry, SchedulerContext};
use crate::store::MeasurementStore;
use common::{Channel, ProbeMethod, ServerEvent, TargetInfo};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Duration;

/// One tracked target and the scheduler task probing it.
pub struct TrackedTarget {
    pub info: TargetInfo,
    stop_tx: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<MeasurementStore>,
    pub monitor: Arc<NetworkMonitor>,
    pub adapters: Arc<HashMap<Channel, Arc<dyn PlatformAdapter>>>,
    pub registry: Arc<ProbeRegistry>,
    pub targets: Arc<RwLock<HashMap<String, TrackedTarget>>>,
    pub analysis_tx: mpsc::UnboundedSender<AnalysisNotice>,
    pub updates_tx: broadcast::Sender<ServerEvent>,
    pub probe_method: Arc<parking_lot::RwLock<ProbeMethod>>,
    pub server_start_time: Instant,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<MeasurementStore>,
        monitor: Arc<NetworkMonitor>,
        adapters: HashMap<Channel, Arc<dyn PlatformAdapter>>,
        registry: Arc<ProbeRegistry>,
        analysis_tx: mpsc::UnboundedSender<AnalysisNotice>,
        updates_tx: broadcast::Sender<ServerEvent>,
    ) -> Self {
        Self {
            store,
            monitor,
            adapters: Arc::new(adapters),
            registry,
            targets: Arc::new(RwLock::new(HashMap::new())),
            analysis_tx,
            updates_tx,
            probe_method: Arc::new(parking_lot::RwLock::new(ProbeMethod::default())),
            server_start_time: Instant::now(),
        }
    }

    fn scheduler_context(&self) -> SchedulerContext {
        SchedulerContext {
            store: self.store.clone(),
            monitor: self.monitor.clone(),
            registry: self.registry.clone(),
            analysis_tx: self.analysis_tx.clone(),
            probe_method: self.probe_method.clone(),
        }
    }

    /// Resolve an identifier through the channel's adapter and begin
    /// probing it. Idempotent for already-tracked targets.
    pub async fn add_target(
        &self,
        identifier: &str,
        channel: Channel,
    ) -> Result<TargetInfo, String> {
        let adapter = self
            .adapters
            .get(&channel)
            .ok_or_else(|| format!("{channel} is not configured"))?
            .clone();
        let resolved = adapter
            .resolve_target(identifier)
            .await
            .map_err(|e| e.subscriber_message())?;

        let mut targets = self.targets.write().await;
        if let Some(existing) = targets.get(&resolved.target_id) {
            return Ok(existing.info.clone());
        }

        let info = TargetInfo {
            target_id: resolved.target_id.clone(),
            channel,
            identifier: identifier.to_string(),
        };
        let (stop_tx, handle) =
            spawn_target_scheduler(self.scheduler_context(), adapter, resolved.target_id.clone());
        targets.insert(
            resolved.target_id,
            TrackedTarget {
                info: info.clone(),
                stop_tx,
                handle: Some(handle),
            },
        );
        tracing::info!("tracking {} on {}", info.target_id, channel);
        Ok(info)
    }

    /// Stop probing a target. Historical data stays queryable.
    pub async fn remove_target(&self, target_id: &str) -> Result<(), String> {
        let removed = self.targets.write().await.remove(target_id);
        let Some(mut tracked) = removed else {
            return Err("target is not tracked".to_string());
        };
        let _ = tracked.stop_tx.send(true);
        if let Some(handle) = tracked.handle.take() {
            // the scheduler exits within one probe timeout; watch it off-path
            let _ = tokio::spawn(async move {
                if tokio::time::timeout(Duration::from_secs(16), handle)
                    .await
                    .is_err()
                {
                    tracing::warn!("removed scheduler did not stop within the probe timeout");
                }
            });
        }
        tracing::info!("stopped tracking {}", target_id);
        Ok(())
    }

    pub async fn list_targets(&self) -> Vec<TargetInfo> {
        self.targets
            .read()
            .await
            .values()
            .map(|t| t.info.clone())
            .collect()
    }

    /// Signal every scheduler and wait for them to wind down. Used on
    /// process shutdown under the caller's grace deadline.
    pub async fn stop_all_targets(&self) {
        let drained: Vec<TrackedTarget> = {
            let mut targets = self.targets.write().await;
            targets.drain().map(|(_, t)| t).collect()
        };
        let mut handles = Vec::new();
        for mut tracked in drained {
            let _ = tracked.stop_tx.send(true);
            if let Some(handle) = tracked.handle.take() {
                handles.push(handle);
            }
        }
        for handle in handles {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{ProbeTicket, Receipt, ResolvedTarget};
    use crate::clock::current_time_ms;
    use crate::database::init_database;
    use crate::errors::AdapterError;
    use async_trait::async_trait;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct IdleAdapter {
        receipts_rx: parking_lot::Mutex<Option<UnboundedReceiver<Receipt>>>,
    }

    impl IdleAdapter {
        fn new() -> Arc<Self> {
            let (_tx, rx) = mpsc::unbounded_channel();
            Arc::new(Self {
                receipts_rx: parking_lot::Mutex::new(Some(rx)),
            })
        }
    }

    #[async_trait]
    impl PlatformAdapter for IdleAdapter {
        fn channel(&self) -> Channel {
            Channel::Whatsapp
        }

        async fn send_probe(
            &self,
            _target_id: &str,
            _method: ProbeMethod,
        ) -> Result<ProbeTicket, AdapterError> {
            Ok(ProbeTicket {
                token: uuid::Uuid::new_v4().to_string(),
                sent_at_ms: current_time_ms(),
            })
        }

        fn take_receipts(&self) -> Option<UnboundedReceiver<Receipt>> {
            self.receipts_rx.lock().take()
        }

        async fn resolve_target(&self, identifier: &str) -> Result<ResolvedTarget, AdapterError> {
            let digits = crate::adapter::canonical_digits(identifier)?;
            Ok(ResolvedTarget {
                target_id: format!("{digits}@s.whatsapp.net"),
                display_name: None,
                avatar_url: None,
            })
        }

        fn is_available(&self) -> bool {
            true
        }

        fn malformed_receipt_count(&self) -> u64 {
            0
        }
    }

    async fn test_state() -> (AppState, tempfile::NamedTempFile) {
        let temp_file = tempfile::NamedTempFile::new().unwrap();
        let db = init_database(temp_file.path()).unwrap();
        let store = Arc::new(MeasurementStore::new(db));
        let monitor = Arc::new(NetworkMonitor::new(store.clone(), "127.0.0.1".to_string(), 1));
        let mut adapters: HashMap<Channel, Arc<dyn PlatformAdapter>> = HashMap::new();
        adapters.insert(Channel::Whatsapp, IdleAdapter::new());
        let (analysis_tx, _analysis_rx) = mpsc::unbounded_channel();
        let (updates_tx, _) = broadcast::channel(16);
        let state = AppState::new(
            store,
            monitor,
            adapters,
            Arc::new(ProbeRegistry::new()),
            analysis_tx,
            updates_tx,
        );
        (state, temp_file)
    }

    #[tokio::test]
    async fn test_add_list_remove_target() {
        let (state, _tmp) = test_state().await;

        let info = state
            .add_target("+49 171 123456", Channel::Whatsapp)
            .await
            .unwrap();
        assert_eq!(info.target_id, "49171123456@s.whatsapp.net");

        let listed = state.list_targets().await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].identifier, "+49 171 123456");

        state.remove_target(&info.target_id).await.unwrap();
        assert!(state.list_targets().await.is_empty());
    }

    #[tokio::test]
    async fn test_add_target_is_idempotent() {
        let (state, _tmp) = test_state().await;
        let first = state.add_target("49171123456", Channel::Whatsapp).await.unwrap();
        let second = state.add_target("49171123456", Channel::Whatsapp).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(state.list_targets().await.len(), 1);
    }

    #[tokio::test]
    async fn test_unconfigured_channel_is_rejected() {
        let (state, _tmp) = test_state().await;
        let err = state
            .add_target("49171123456", Channel::Signal)
            .await
            .unwrap_err();
        assert!(err.contains("not configured"));
    }

    #[tokio::test]
    async fn test_remove_unknown_target_errors() {
        let (state, _tmp) = test_state().await;
        assert!(state.remove_target("nobody").await.is_err());
    }
}
