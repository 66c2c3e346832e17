//! WhatsApp adapter
//!
//! Talks to the WhatsApp bridge over its websocket API. Outbound requests
//! carry a `request_id` the bridge echoes back; delivery receipts arrive
//! unsolicited and are translated into `(token, delivered_at_ms)` pairs,
//! where the token is the bridge-assigned message id.

use crate::adapter::bridge::BridgeLink;
use crate::adapter::{
    PlatformAdapter, ProbeTicket, Receipt, ReceiptDeduper, ResolvedTarget, canonical_digits,
};
use crate::clock::current_time_ms;
use crate::errors::AdapterError;
use async_trait::async_trait;
use common::{Channel, ProbeMethod};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, Duration};

pub const DEFAULT_BRIDGE_URL: &str = "ws://127.0.0.1:8066/ws";

const SEND_TIMEOUT_MS: u64 = 5_000;
const LOOKUP_TIMEOUT_MS: u64 = 3_000;
const DEDUP_CAP: usize = 1024;

type PendingRequests = Arc<Mutex<HashMap<String, oneshot::Sender<serde_json::Value>>>>;

pub struct WhatsAppAdapter {
    link: Arc<BridgeLink>,
    pending: PendingRequests,
    receipts_rx: Mutex<Option<mpsc::UnboundedReceiver<Receipt>>>,
    malformed_receipts: Arc<AtomicU64>,
}

impl WhatsAppAdapter {
    pub fn new(bridge_url: String) -> Arc<Self> {
        let (receipts_tx, receipts_rx) = mpsc::unbounded_channel();
        let pending: PendingRequests = Arc::new(Mutex::new(HashMap::new()));
        let malformed = Arc::new(AtomicU64::new(0));

        let pending_cb = pending.clone();
        let malformed_cb = malformed.clone();
        let deduper = Mutex::new(ReceiptDeduper::new(DEDUP_CAP));
        let link = BridgeLink::spawn(bridge_url, move |frame| {
            handle_frame(&frame, &pending_cb, &receipts_tx, &deduper, &malformed_cb);
        });

        Arc::new(Self {
            link,
            pending,
            receipts_rx: Mutex::new(Some(receipts_rx)),
            malformed_receipts: malformed,
        })
    }

    /// Send a request frame and await the bridge response for its id.
    async fn request(
        &self,
        request_id: &str,
        frame: String,
        deadline_ms: u64,
    ) -> Result<serde_json::Value, AdapterError> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id.to_string(), tx);
        if let Err(e) = self.link.send(frame) {
            self.pending.lock().remove(request_id);
            return Err(e);
        }
        match timeout(Duration::from_millis(deadline_ms), rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => {
                self.pending.lock().remove(request_id);
                Err(AdapterError::ProbeFailed("bridge link dropped".to_string()))
            }
            Err(_) => {
                self.pending.lock().remove(request_id);
                Err(AdapterError::ProbeFailed(
                    "bridge did not answer in time".to_string(),
                ))
            }
        }
    }
}

#[async_trait]
impl PlatformAdapter for WhatsAppAdapter {
    fn channel(&self) -> Channel {
        Channel::Whatsapp
    }

    async fn send_probe(
        &self,
        target_id: &str,
        method: ProbeMethod,
    ) -> Result<ProbeTicket, AdapterError> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let sent_at_ms = current_time_ms();
        let frame = serde_json::json!({
            "op": "probe",
            "request_id": request_id,
            "target": target_id,
            "method": method.as_str(),
        });

        let response = self
            .request(&request_id, frame.to_string(), SEND_TIMEOUT_MS)
            .await?;
        if response.get("op").and_then(|v| v.as_str()) == Some("error") {
            let reason = response
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or("bridge rejected probe");
            return Err(AdapterError::ProbeFailed(reason.to_string()));
        }
        let message_id = response
            .get("message_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                AdapterError::ProbeFailed("bridge response missing message id".to_string())
            })?;

        Ok(ProbeTicket {
            token: message_id.to_string(),
            sent_at_ms,
        })
    }

    fn take_receipts(&self) -> Option<mpsc::UnboundedReceiver<Receipt>> {
        self.receipts_rx.lock().take()
    }

    async fn resolve_target(&self, identifier: &str) -> Result<ResolvedTarget, AdapterError> {
        let digits = canonical_digits(identifier)?;
        let target_id = format!("{digits}@s.whatsapp.net");

        // Display metadata is cosmetic; a dark bridge just means none.
        let mut display_name = None;
        let mut avatar_url = None;
        if self.link.is_available() {
            let request_id = uuid::Uuid::new_v4().to_string();
            let frame = serde_json::json!({
                "op": "lookup",
                "request_id": request_id,
                "target": target_id,
            });
            if let Ok(response) = self
                .request(&request_id, frame.to_string(), LOOKUP_TIMEOUT_MS)
                .await
            {
                display_name = response
                    .get("name")
                    .and_then(|v| v.as_str())
                    .map(str::to_string);
                avatar_url = response
                    .get("avatar")
                    .and_then(|v| v.as_str())
                    .map(str::to_string);
            }
        }

        Ok(ResolvedTarget {
            target_id,
            display_name,
            avatar_url,
        })
    }

    fn is_available(&self) -> bool {
        self.link.is_available()
    }

    fn malformed_receipt_count(&self) -> u64 {
        self.malformed_receipts.load(Ordering::Relaxed)
    }
}

fn handle_frame(
    frame: &serde_json::Value,
    pending: &Mutex<HashMap<String, oneshot::Sender<serde_json::Value>>>,
    receipts_tx: &mpsc::UnboundedSender<Receipt>,
    deduper: &Mutex<ReceiptDeduper>,
    malformed: &AtomicU64,
) {
    match frame.get("op").and_then(|v| v.as_str()) {
        Some("sent") | Some("resolved") | Some("error") => {
            let Some(request_id) = frame.get("request_id").and_then(|v| v.as_str()) else {
                return;
            };
            if let Some(tx) = pending.lock().remove(request_id) {
                let _ = tx.send(frame.clone());
            }
        }
        Some("receipt") => {
            let message_id = frame.get("message_id").and_then(|v| v.as_str());
            let delivered = frame.get("delivered_at_ms").and_then(|v| v.as_i64());
            match (message_id, delivered) {
                (Some(id), Some(at)) => {
                    if deduper.lock().insert(id) {
                        let _ = receipts_tx.send(Receipt {
                            token: id.to_string(),
                            delivered_at_ms: at,
                        });
                    } else {
                        tracing::debug!("duplicate receipt for {} discarded", id);
                    }
                }
                _ => {
                    malformed.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!("malformed receipt frame discarded");
                }
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn receipt_env() -> (
        Mutex<HashMap<String, oneshot::Sender<serde_json::Value>>>,
        mpsc::UnboundedSender<Receipt>,
        mpsc::UnboundedReceiver<Receipt>,
        Mutex<ReceiptDeduper>,
        AtomicU64,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Mutex::new(HashMap::new()),
            tx,
            rx,
            Mutex::new(ReceiptDeduper::new(16)),
            AtomicU64::new(0),
        )
    }

    #[tokio::test]
    async fn test_receipt_translation() {
        let (pending, tx, mut rx, dedup, malformed) = receipt_env();
        let frame = serde_json::json!({
            "op": "receipt",
            "message_id": "3EB0A9C71",
            "delivered_at_ms": 1_700_000_000_123i64,
        });
        handle_frame(&frame, &pending, &tx, &dedup, &malformed);

        let receipt = rx.recv().await.unwrap();
        assert_eq!(receipt.token, "3EB0A9C71");
        assert_eq!(receipt.delivered_at_ms, 1_700_000_000_123);
    }

    #[tokio::test]
    async fn test_duplicate_receipt_discarded() {
        let (pending, tx, mut rx, dedup, malformed) = receipt_env();
        let frame = serde_json::json!({
            "op": "receipt",
            "message_id": "3EB0A9C71",
            "delivered_at_ms": 1000i64,
        });
        handle_frame(&frame, &pending, &tx, &dedup, &malformed);
        handle_frame(&frame, &pending, &tx, &dedup, &malformed);

        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_malformed_receipt_counted() {
        let (pending, tx, mut rx, dedup, malformed) = receipt_env();
        let frame = serde_json::json!({"op": "receipt", "message_id": "x"});
        handle_frame(&frame, &pending, &tx, &dedup, &malformed);

        assert_eq!(malformed.load(Ordering::Relaxed), 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_response_resolves_pending_request() {
        let (pending, tx, _rx, dedup, malformed) = receipt_env();
        let (reply_tx, reply_rx) = oneshot::channel();
        pending.lock().insert("req-1".to_string(), reply_tx);

        let frame = serde_json::json!({
            "op": "sent",
            "request_id": "req-1",
            "message_id": "3EB0FFAA2",
        });
        handle_frame(&frame, &pending, &tx, &dedup, &malformed);

        let response = reply_rx.await.unwrap();
        assert_eq!(
            response.get("message_id").and_then(|v| v.as_str()),
            Some("3EB0FFAA2")
        );
        assert!(pending.lock().is_empty());
    }
}
