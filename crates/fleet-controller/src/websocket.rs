//! WebSocket surface (C6 wiring): the Agent transport endpoint and the two
//! Browser subscription endpoints. Generalizes the teacher's per-endpoint
//! `ws_status_handler`/`select!` pattern; the key departure is that browser
//! subscribers get their own bounded per-subscriber channel from the hub
//! instead of sharing one broadcast channel, so a lagging tab disconnects
//! without starving everyone else (see `hub::Hub::broadcast`).

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use fleet_protocol::envelope::{Envelope, MessageKind};
use fleet_protocol::model::RegisterAck;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct WsAuthQuery {
    token: Option<String>,
}

pub async fn ws_agent_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_agent_ws(socket, state))
}

async fn handle_agent_ws(mut socket: WebSocket, state: AppState) {
    let register = match await_register(&mut socket).await {
        Some(req) => req,
        None => return,
    };

    if !crate::store::verify_shared_secret(&state.db, register.host_id, &register.shared_secret).unwrap_or(false) {
        let _ = socket
            .send(Message::Text(
                Envelope::new(MessageKind::Error(fleet_protocol::error::ErrorPayload {
                    error: "invalid shared secret".to_string(),
                    code: "auth_failed".to_string(),
                }))
                .to_json()
                .unwrap_or_default()
                .into(),
            ))
            .await;
        return;
    }

    let host_id = register.host_id;
    let _ = crate::store::touch_heartbeat(&state.db, host_id, &register.agent_version);

    let (outbound_tx, mut outbound_rx) = tokio::sync::mpsc::channel::<Envelope>(64);
    let (close_tx, mut close_rx) = tokio::sync::oneshot::channel();
    let generation = state.hub.register_agent(host_id, outbound_tx, close_tx).await;

    let ack = {
        let settings = state.settings.read().await;
        Envelope::new(MessageKind::RegisterAck(RegisterAck {
            heartbeat_interval: format!("{}s", settings.heartbeat_interval_secs),
            monitor_interval: format!("{}s", settings.monitor_interval_secs),
        }))
    };
    if socket.send(Message::Text(ack.to_json().unwrap_or_default().into())).await.is_err() {
        state.hub.unregister_agent(host_id, generation).await;
        return;
    }

    info!(host_id, "agent connected");
    state.hub.broadcast("hosts", serde_json::json!({ "type": "host_online", "host_id": host_id })).await;
    state.alert_evaluator.evaluate_status_transition(&state.db, host_id, true).await;

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        handle_agent_message(&state, host_id, &text).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(host_id, error = %e, "agent websocket error");
                        break;
                    }
                }
            }
            outgoing = outbound_rx.recv() => {
                match outgoing {
                    Some(envelope) => {
                        if let Ok(json) = envelope.to_json() {
                            if socket.send(Message::Text(json.into())).await.is_err() {
                                break;
                            }
                        }
                    }
                    None => break,
                }
            }
            _ = &mut close_rx => {
                debug!(host_id, "agent connection superseded");
                let _ = socket.send(Message::Close(None)).await;
                return;
            }
        }
    }

    state.hub.unregister_agent(host_id, generation).await;
    state.hub.fail_pending_for_host(host_id).await;
    state.hub.broadcast("hosts", serde_json::json!({ "type": "host_offline", "host_id": host_id })).await;
    state.alert_evaluator.evaluate_status_transition(&state.db, host_id, false).await;
    info!(host_id, "agent disconnected");
}

async fn await_register(socket: &mut WebSocket) -> Option<fleet_protocol::model::RegisterRequest> {
    match tokio::time::timeout(fleet_protocol::constants::REGISTER_ACK_DEADLINE, socket.recv()).await {
        Ok(Some(Ok(Message::Text(text)))) => match Envelope::from_json(&text) {
            Ok(env) => match env.kind {
                MessageKind::Register(req) => Some(req),
                other => {
                    warn!(kind = other.type_name(), "expected register as first agent frame");
                    None
                }
            },
            Err(e) => {
                warn!(error = %e, "malformed register frame");
                None
            }
        },
        _ => None,
    }
}

async fn handle_agent_message(state: &AppState, host_id: i64, text: &str) {
    let envelope = match Envelope::from_json(text) {
        Ok(e) => e,
        Err(e) => {
            warn!(host_id, error = %e, "malformed agent message");
            return;
        }
    };

    if let Some(ref request_id) = envelope.request_id {
        if state.hub.resolve_pending(request_id, envelope.clone()).await {
            return;
        }
    }

    match envelope.kind {
        MessageKind::Heartbeat(hb) => {
            let _ = crate::store::touch_heartbeat(&state.db, host_id, &hb.agent_version);
        }
        MessageKind::MonitorSample(sample) => {
            if let Err(e) = crate::store::insert_sample(&state.db, host_id, &sample) {
                warn!(host_id, error = %e, "failed to persist monitor sample");
            }
            state.alert_evaluator.evaluate(&state.db, host_id, &sample).await;
            if let Ok(value) = serde_json::to_value(&sample) {
                state.hub.broadcast(&format!("host:{host_id}"), value).await;
            }
        }
        kind @ (MessageKind::ShellOutput(_) | MessageKind::SessionClosed(_)) => {
            if let Ok(value) = serde_json::to_value(&kind) {
                state.hub.broadcast(&format!("host:{host_id}:shell"), value).await;
            }
        }
        kind @ (MessageKind::UpgradeProgress(_) | MessageKind::UpgradeResult(_)) => {
            if let Ok(value) = serde_json::to_value(&kind) {
                state.hub.broadcast(&format!("host:{host_id}"), value).await;
            }
        }
        other => {
            debug!(host_id, kind = other.type_name(), "unsolicited agent message");
        }
    }
}

pub async fn ws_host_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(host_id): Path<i64>,
    Query(auth): Query<WsAuthQuery>,
) -> Response {
    match authenticate_browser(&state, &auth) {
        Ok(()) => ws
            .on_upgrade(move |socket| handle_subscriber_ws(socket, state, format!("host:{host_id}")))
            .into_response(),
        Err(resp) => resp,
    }
}

pub async fn ws_hosts_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(auth): Query<WsAuthQuery>,
) -> Response {
    match authenticate_browser(&state, &auth) {
        Ok(()) => ws
            .on_upgrade(move |socket| handle_subscriber_ws(socket, state, "hosts".to_string()))
            .into_response(),
        Err(resp) => resp,
    }
}

/// Browser WS endpoints can't carry an `Authorization` header during the
/// upgrade handshake, so the bearer token travels as `?token=` instead per
/// spec §6.
fn authenticate_browser(state: &AppState, auth: &WsAuthQuery) -> Result<(), Response> {
    let token = auth.token.as_deref().ok_or(StatusCode::UNAUTHORIZED.into_response())?;
    crate::auth::verify_token(&state.jwt_secret, token)
        .map(|_| ())
        .map_err(|_| StatusCode::UNAUTHORIZED.into_response())
}

/// Generic browser-facing subscriber loop: pushes whatever the hub
/// broadcasts on `topic` until the client disconnects or the hub drops this
/// subscriber for being too slow.
async fn handle_subscriber_ws(mut socket: WebSocket, state: AppState, topic: String) {
    let (id, mut rx) = state.hub.subscribe(&topic).await;
    info!(topic = %topic, "browser subscriber connected");

    loop {
        tokio::select! {
            value = rx.recv() => {
                match value {
                    Some(value) => {
                        if socket.send(Message::Text(value.to_string().into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    state.hub.unsubscribe(&topic, id).await;
    debug!(topic = %topic, "browser subscriber disconnected");
}
