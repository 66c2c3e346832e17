//! Signal adapter
//!
//! Talks to the external signal-cli bridge over its JSON-RPC websocket.
//! Sends are JSON-RPC requests whose result carries the message timestamp;
//! that timestamp is the probe token, because Signal delivery receipts
//! reference the timestamps of the messages they acknowledge.
//!
//! Bridge unavailability is expected (the bridge container may be down) and
//! is never fatal: probing just pauses until the link returns.

use crate::adapter::bridge::BridgeLink;
use crate::adapter::{
    PlatformAdapter, ProbeTicket, Receipt, ReceiptDeduper, ResolvedTarget, canonical_digits,
};
use crate::clock::current_time_ms;
use crate::errors::AdapterError;
use async_trait::async_trait;
use common::{Channel, ProbeMethod};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, Duration};

pub const DEFAULT_BRIDGE_URL: &str = "ws://127.0.0.1:8080/v1/rpc";

const SEND_TIMEOUT_MS: u64 = 5_000;
const DEDUP_CAP: usize = 1024;
const TARGET_ID_PREFIX: &str = "signal:";

type PendingRequests = Arc<Mutex<HashMap<String, oneshot::Sender<serde_json::Value>>>>;

pub struct SignalAdapter {
    link: Arc<BridgeLink>,
    pending: PendingRequests,
    receipts_rx: Mutex<Option<mpsc::UnboundedReceiver<Receipt>>>,
    malformed_receipts: Arc<AtomicU64>,
}

impl SignalAdapter {
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

    async fn rpc(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, AdapterError> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let frame = serde_json::json!({
            "jsonrpc": "2.0",
            "id": request_id,
            "method": method,
            "params": params,
        });

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id.clone(), tx);
        if let Err(e) = self.link.send(frame.to_string()) {
            self.pending.lock().remove(&request_id);
            return Err(e);
        }
        let response = match timeout(Duration::from_millis(SEND_TIMEOUT_MS), rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => {
                self.pending.lock().remove(&request_id);
                return Err(AdapterError::ProbeFailed("bridge link dropped".to_string()));
            }
            Err(_) => {
                self.pending.lock().remove(&request_id);
                return Err(AdapterError::ProbeFailed(
                    "bridge did not answer in time".to_string(),
                ));
            }
        };

        if let Some(error) = response.get("error") {
            let reason = error
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or("bridge rejected request");
            return Err(AdapterError::ProbeFailed(reason.to_string()));
        }
        response
            .get("result")
            .cloned()
            .ok_or_else(|| AdapterError::ProbeFailed("bridge response missing result".to_string()))
    }
}

/// Recipient number for a canonical `signal:` target id.
fn recipient_of(target_id: &str) -> String {
    format!("+{}", target_id.trim_start_matches(TARGET_ID_PREFIX))
}

#[async_trait]
impl PlatformAdapter for SignalAdapter {
    fn channel(&self) -> Channel {
        Channel::Signal
    }

    async fn send_probe(
        &self,
        target_id: &str,
        method: ProbeMethod,
    ) -> Result<ProbeTicket, AdapterError> {
        let recipient = recipient_of(target_id);
        let sent_at_ms = current_time_ms();

        let result = match method {
            ProbeMethod::Delete => {
                // retraction of a timestamp that never carried a message
                let phantom_ts = sent_at_ms - rand::thread_rng().gen_range(60_000..600_000);
                self.rpc(
                    "remoteDelete",
                    serde_json::json!({
                        "recipient": [recipient.as_str()],
                        "targetTimestamp": phantom_ts,
                    }),
                )
                .await?
            }
            ProbeMethod::Reaction => {
                self.rpc(
                    "sendReaction",
                    serde_json::json!({
                        "recipient": [recipient.as_str()],
                        "emoji": "\u{1F44D}",
                        "targetAuthor": recipient.as_str(),
                        "targetTimestamp": sent_at_ms,
                        "remove": true,
                    }),
                )
                .await?
            }
            ProbeMethod::Message => {
                return Err(AdapterError::UnsupportedProbeMethod(method));
            }
        };

        let message_ts = result
            .get("timestamp")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| {
                AdapterError::ProbeFailed("bridge response missing timestamp".to_string())
            })?;

        Ok(ProbeTicket {
            token: message_ts.to_string(),
            sent_at_ms,
        })
    }

    fn take_receipts(&self) -> Option<mpsc::UnboundedReceiver<Receipt>> {
        self.receipts_rx.lock().take()
    }

    async fn resolve_target(&self, identifier: &str) -> Result<ResolvedTarget, AdapterError> {
        let digits = canonical_digits(identifier)?;
        // the bridge exposes no contact metadata
        Ok(ResolvedTarget {
            target_id: format!("{TARGET_ID_PREFIX}{digits}"),
            display_name: None,
            avatar_url: None,
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
    // JSON-RPC response to one of our requests
    if let Some(request_id) = frame.get("id").and_then(|v| v.as_str()) {
        if let Some(tx) = pending.lock().remove(request_id) {
            let _ = tx.send(frame.clone());
        }
        return;
    }

    // unsolicited notification; only delivery receipts matter here
    if frame.get("method").and_then(|v| v.as_str()) != Some("receive") {
        return;
    }
    let Some(envelope) = frame.pointer("/params/envelope") else {
        return;
    };
    let Some(receipt_message) = envelope.get("receiptMessage") else {
        return; // a chat message, typing notice, etc.
    };
    if receipt_message.get("isDelivery").and_then(|v| v.as_bool()) != Some(true) {
        return; // read/viewed receipts are not delivery acks
    }

    let when = receipt_message.get("when").and_then(|v| v.as_i64());
    let timestamps = receipt_message.get("timestamps").and_then(|v| v.as_array());
    let (Some(when), Some(timestamps)) = (when, timestamps) else {
        malformed.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("malformed delivery receipt discarded");
        return;
    };

    for ts in timestamps.iter().filter_map(|v| v.as_i64()) {
        let token = ts.to_string();
        if deduper.lock().insert(&token) {
            let _ = receipts_tx.send(Receipt {
                token,
                delivered_at_ms: when,
            });
        } else {
            tracing::debug!("duplicate delivery receipt for {} discarded", ts);
        }
    }
}
