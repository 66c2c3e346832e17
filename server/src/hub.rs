//! Live update hub
//!
//! Websocket endpoint multicasting derived state to every subscriber and
//! answering their queries. Clients never re-derive state; they render the
//! payloads as sent. Analysis publishes into the shared broadcast channel,
//! each connection forwards it alongside its own direct replies.

use crate::state::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::HeaderValue,
    response::Response,
    routing::get,
    Json, Router,
};
use common::{Channel, ClientEvent, ServerEvent, TargetInfo, UpdatePayload};
use futures::{stream::StreamExt, SinkExt};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub fn router(state: AppState, client_origin: Option<&str>) -> Router {
    let cors = match client_origin {
        Some(origin) => match origin.parse::<HeaderValue>() {
            Ok(origin) => CorsLayer::new()
                .allow_origin(origin)
                .allow_methods(Any)
                .allow_headers(Any),
            Err(e) => {
                tracing::warn!("invalid CLIENT_ORIGIN '{}': {}; allowing any origin", origin, e);
                CorsLayer::permissive()
            }
        },
        None => CorsLayer::permissive(),
    };

    Router::new()
        .route("/ws", get(ws_handler))
        .route("/healthz", get(health_check))
        .route("/api/targets", get(list_targets_json))
        .route("/api/status", get(server_status))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn health_check() -> &'static str {
    "OK"
}

async fn list_targets_json(State(state): State<AppState>) -> Json<Vec<TargetInfo>> {
    Json(state.list_targets().await)
}

#[derive(Serialize)]
struct AdapterStatus {
    channel: Channel,
    linked: bool,
    malformed_receipts: u64,
}

#[derive(Serialize)]
struct StatusResponse {
    uptime_secs: u64,
    local_network_rtt_ms: Option<i64>,
    local_network_loss_rate: f64,
    adapters: Vec<AdapterStatus>,
}

async fn server_status(State(state): State<AppState>) -> Json<StatusResponse> {
    let mut adapters: Vec<AdapterStatus> = state
        .adapters
        .values()
        .map(|a| AdapterStatus {
            channel: a.channel(),
            linked: a.is_available(),
            malformed_receipts: a.malformed_receipt_count(),
        })
        .collect();
    adapters.sort_by_key(|a| a.channel.as_str());
    Json(StatusResponse {
        uptime_secs: state.server_start_time.elapsed().as_secs(),
        local_network_rtt_ms: state.monitor.current_rtt(),
        local_network_loss_rate: state.monitor.current_loss_rate(),
        adapters,
    })
}

/// Rebuild the latest push payload for a target from the store: newest
/// analysis row plus newest raw row plus the baseline-derived threshold.
async fn snapshot_payload(state: &AppState, info: &TargetInfo) -> Option<UpdatePayload> {
    let analysis = state
        .store
        .get_latest_analysis(&info.target_id)
        .await
        .ok()??;
    let latest = state.store.get_latest_raw(&info.target_id).await.ok()?;
    let baseline = state.store.get_baseline(&info.target_id).await.ok()?;
    Some(UpdatePayload {
        target_id: info.target_id.clone(),
        channel: info.channel,
        rtt_ms: latest.as_ref().and_then(|m| m.target_rtt_ms),
        state: analysis.derived_state,
        confidence: analysis.confidence_score,
        noise: analysis.noise_score,
        responsiveness: analysis.responsiveness_score,
        median: baseline.as_ref().map(|b| b.median_rtt_ms),
        threshold: baseline.as_ref().map(|b| b.threshold()),
        timestamp_ms: latest
            .as_ref()
            .map(|m| m.timestamp_ms)
            .unwrap_or(analysis.end_ms),
    })
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(|socket| hub_ws(socket, state))
}

async fn hub_ws(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let mut updates_rx = state.updates_tx.subscribe();
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<ServerEvent>();

    // A fresh subscriber gets the current picture before any live updates
    for info in state.list_targets().await {
        if let Some(payload) = snapshot_payload(&state, &info).await {
            let _ = reply_tx.send(ServerEvent::Update(payload));
        }
    }

    // Forward broadcast updates and direct replies to this subscriber
    let send_task = tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                update = updates_rx.recv() => match update {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!("subscriber lagging, {} updates dropped", missed);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                reply = reply_rx.recv() => match reply {
                    Some(event) => event,
                    None => break,
                },
            };
            match serde_json::to_string(&event) {
                Ok(json) => {
                    if sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Err(e) => tracing::error!("failed to serialize event: {}", e),
            }
        }
    });

    let recv_state = state.clone();
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<ClientEvent>(&text) {
                    Ok(event) => handle_client_event(&recv_state, event, &reply_tx).await,
                    Err(e) => {
                        tracing::debug!("unparseable client event: {}", e);
                        let _ = reply_tx.send(ServerEvent::Error {
                            message: "unrecognized event".to_string(),
                            target_id: None,
                        });
                    }
                },
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
    }
}

async fn handle_client_event(
    state: &AppState,
    event: ClientEvent,
    reply_tx: &mpsc::UnboundedSender<ServerEvent>,
) {
    match event {
        ClientEvent::AddTarget {
            identifier,
            channel,
        } => match state.add_target(&identifier, channel).await {
            Ok(info) => {
                // every subscriber learns about the new target
                let _ = state.updates_tx.send(ServerEvent::TargetAdded {
                    target_id: info.target_id,
                    channel: info.channel,
                    identifier: info.identifier,
                });
            }
            Err(message) => {
                let _ = reply_tx.send(ServerEvent::Error {
                    message,
                    target_id: None,
                });
            }
        },
        ClientEvent::RemoveTarget { target_id } => match state.remove_target(&target_id).await {
            Ok(()) => {
                let _ = state
                    .updates_tx
                    .send(ServerEvent::TargetRemoved { target_id });
            }
            Err(message) => {
                let _ = reply_tx.send(ServerEvent::Error {
                    message,
                    target_id: Some(target_id),
                });
            }
        },
        ClientEvent::ListTargets => {
            let targets = state.list_targets().await;
            let _ = reply_tx.send(ServerEvent::Targets { targets });
        }
        ClientEvent::GetAvailableDays { target_id } => {
            match state.store.get_available_days(&target_id).await {
                Ok(days) => {
                    let _ = reply_tx.send(ServerEvent::AvailableDays { target_id, days });
                }
                Err(e) => {
                    tracing::warn!("available-days query failed for {}: {}", target_id, e);
                    let _ = reply_tx.send(ServerEvent::Error {
                        message: "history is unavailable".to_string(),
                        target_id: Some(target_id),
                    });
                }
            }
        }
        ClientEvent::GetRawForDay { target_id, day } => {
            match state.store.get_raw_for_day(&target_id, &day).await {
                Ok(rows) => {
                    let _ = reply_tx.send(ServerEvent::RawForDay {
                        target_id,
                        day,
                        rows,
                    });
                }
                Err(e) => {
                    tracing::warn!("raw-for-day query failed for {}: {}", target_id, e);
                    let _ = reply_tx.send(ServerEvent::Error {
                        message: "history is unavailable".to_string(),
                        target_id: Some(target_id),
                    });
                }
            }
        }
        ClientEvent::SetProbeMethod { method } => {
            *state.probe_method.write() = method;
            tracing::info!("probe method set to {}", method.as_str());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::init_database;
    use crate::netmon::NetworkMonitor;
    use crate::scheduler::ProbeRegistry;
    use crate::store::MeasurementStore;
    use common::{Channel, ProbeMethod};
    use std::collections::HashMap;
    use std::sync::Arc;

    async fn bare_state() -> (AppState, tempfile::NamedTempFile) {
        let temp_file = tempfile::NamedTempFile::new().unwrap();
        let db = init_database(temp_file.path()).unwrap();
        let store = Arc::new(MeasurementStore::new(db));
        let monitor = Arc::new(NetworkMonitor::new(store.clone(), "127.0.0.1".to_string(), 1));
        let (analysis_tx, _analysis_rx) = tokio::sync::mpsc::unbounded_channel();
        let (updates_tx, _) = broadcast::channel(16);
        let state = AppState::new(
            store,
            monitor,
            HashMap::new(),
            Arc::new(ProbeRegistry::new()),
            analysis_tx,
            updates_tx,
        );
        (state, temp_file)
    }

    #[tokio::test]
    async fn test_list_targets_reply() {
        let (state, _tmp) = bare_state().await;
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();

        handle_client_event(&state, ClientEvent::ListTargets, &reply_tx).await;

        match reply_rx.recv().await.unwrap() {
            ServerEvent::Targets { targets } => assert!(targets.is_empty()),
            other => panic!("expected targets event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_add_target_without_adapter_yields_error() {
        let (state, _tmp) = bare_state().await;
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();

        handle_client_event(
            &state,
            ClientEvent::AddTarget {
                identifier: "49171123456".to_string(),
                channel: Channel::Whatsapp,
            },
            &reply_tx,
        )
        .await;

        match reply_rx.recv().await.unwrap() {
            ServerEvent::Error { message, .. } => assert!(message.contains("not configured")),
            other => panic!("expected error event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_set_probe_method() {
        let (state, _tmp) = bare_state().await;
        let (reply_tx, _reply_rx) = mpsc::unbounded_channel();

        handle_client_event(
            &state,
            ClientEvent::SetProbeMethod {
                method: ProbeMethod::Reaction,
            },
            &reply_tx,
        )
        .await;

        assert_eq!(*state.probe_method.read(), ProbeMethod::Reaction);
    }

    #[tokio::test]
    async fn test_available_days_on_empty_store() {
        let (state, _tmp) = bare_state().await;
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();

        handle_client_event(
            &state,
            ClientEvent::GetAvailableDays {
                target_id: "t1".to_string(),
            },
            &reply_tx,
        )
        .await;

        match reply_rx.recv().await.unwrap() {
            ServerEvent::AvailableDays { target_id, days } => {
                assert_eq!(target_id, "t1");
                assert!(days.is_empty());
            }
            other => panic!("expected available-days event, got {:?}", other),
        }
    }
}
