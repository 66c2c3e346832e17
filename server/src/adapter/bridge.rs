//! Websocket link to an external platform bridge.
//!
//! Owns the connection lifecycle: connect with deadline, reconnect with a
//! fixed delay after loss, forward outbound frames, hand every inbound JSON
//! frame to the adapter's translator. Availability flips with the link
//! state; adapters gate their sends on it.

use crate::errors::AdapterError;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

const CONNECT_TIMEOUT_MS: u64 = 10_000;
const RECONNECT_DELAY_MS: u64 = 5_000;

pub struct BridgeLink {
    available: Arc<AtomicBool>,
    outbound_tx: mpsc::UnboundedSender<String>,
}

impl BridgeLink {
    /// Spawn the connection task. `on_frame` runs for every inbound JSON
    /// frame; it must not block.
    pub fn spawn<F>(url: String, on_frame: F) -> Arc<Self>
    where
        F: Fn(serde_json::Value) + Send + Sync + 'static,
    {
        let available = Arc::new(AtomicBool::new(false));
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let link = Arc::new(Self {
            available: available.clone(),
            outbound_tx,
        });
        let _ = tokio::spawn(run_link(url, available, outbound_rx, on_frame));
        link
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Queue a frame for the bridge. Fails while the link is down.
    pub fn send(&self, frame: String) -> Result<(), AdapterError> {
        if !self.is_available() {
            return Err(AdapterError::Unavailable);
        }
        self.outbound_tx
            .send(frame)
            .map_err(|_| AdapterError::Unavailable)
    }
}

async fn run_link<F>(
    url: String,
    available: Arc<AtomicBool>,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
    on_frame: F,
) where
    F: Fn(serde_json::Value) + Send + Sync + 'static,
{
    if let Err(e) = Url::parse(&url) {
        tracing::error!("invalid bridge url '{}': {}; bridge disabled", url, e);
        return;
    }

    loop {
        let connected = tokio::time::timeout(
            Duration::from_millis(CONNECT_TIMEOUT_MS),
            connect_async(url.as_str()),
        )
        .await;

        match connected {
            Ok(Ok((stream, _response))) => {
                tracing::info!("bridge link established: {}", url);
                available.store(true, Ordering::SeqCst);
                let (mut sink, mut source) = stream.split();

                loop {
                    tokio::select! {
                        frame = outbound_rx.recv() => match frame {
                            Some(frame) => {
                                if let Err(e) = sink.send(Message::Text(frame.into())).await {
                                    tracing::warn!("bridge send failed: {}", e);
                                    break;
                                }
                            }
                            None => {
                                // adapter dropped; shut the link down for good
                                let _ = sink.close().await;
                                available.store(false, Ordering::SeqCst);
                                return;
                            }
                        },
                        inbound = source.next() => match inbound {
                            Some(Ok(Message::Text(text))) => {
                                match serde_json::from_str::<serde_json::Value>(&text) {
                                    Ok(frame) => on_frame(frame),
                                    Err(e) => tracing::debug!("non-JSON bridge frame dropped: {}", e),
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Ok(_)) => {} // ping/pong/binary
                            Some(Err(e)) => {
                                tracing::warn!("bridge read failed: {}", e);
                                break;
                            }
                        },
                    }
                }

                available.store(false, Ordering::SeqCst);
                tracing::warn!("bridge link lost: {}", url);
            }
            Ok(Err(e)) => {
                tracing::debug!("bridge connect to {} failed: {}", url, e);
            }
            Err(_) => {
                tracing::debug!("bridge connect to {} timed out", url);
            }
        }

        tokio::time::sleep(Duration::from_millis(RECONNECT_DELAY_MS)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_fails_while_disconnected() {
        // nothing listens on this port
        let link = BridgeLink::spawn("ws://127.0.0.1:9/".to_string(), |_| {});
        assert!(!link.is_available());
        assert!(matches!(
            link.send("{}".to_string()),
            Err(AdapterError::Unavailable)
        ));
    }

    #[tokio::test]
    async fn test_invalid_url_disables_bridge() {
        let link = BridgeLink::spawn("not a url".to_string(), |_| {});
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!link.is_available());
    }
}
