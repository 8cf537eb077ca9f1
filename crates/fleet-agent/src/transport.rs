//! Agent Transport (C2): the persistent connection to the Controller.
//!
//! Implements the state machine from the component design:
//! `Disconnected -> Connecting -> Registering -> Ready -> (Reconnecting <-> Ready) -> Closed`.

use std::sync::Arc;
use std::time::Duration;

use fleet_protocol::constants::{
    RECONNECT_BACKOFF_BASE, RECONNECT_BACKOFF_CAP, REGISTER_ACK_DEADLINE, SHUTDOWN_DRAIN_GRACE,
};
use fleet_protocol::envelope::{Envelope, MessageKind};
use fleet_protocol::model::{Heartbeat, RegisterRequest, SystemInfo};
use fleet_protocol::Backoff;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::dispatcher;
use crate::health::TaskPulse;
use crate::state::AgentState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Registering,
    Ready,
    Reconnecting,
    Closed,
}

/// `None` on a normal, cancellation-driven shutdown. `Some(code)` when the
/// transport decided on its own to stop for good — currently only when the
/// Controller rejects the shared secret, which is permanent and must not be
/// retried with backoff (spec's exit code 3, "registration refused").
pub async fn run(
    state: Arc<AgentState>,
    mut outbound_rx: mpsc::Receiver<Envelope>,
    pulse: TaskPulse,
    cancel: CancellationToken,
) -> Option<i32> {
    let mut backoff = Backoff::new(RECONNECT_BACKOFF_BASE, RECONNECT_BACKOFF_CAP);
    let mut exit_code = None;

    loop {
        if cancel.is_cancelled() {
            break;
        }
        pulse.tick();

        match connect_and_register(&state).await {
            Ok(ws) => {
                backoff.reset();
                info!("registered with controller, entering ready state");
                run_ready_loop(&state, ws, &mut outbound_rx, &pulse, &cancel).await;
                if cancel.is_cancelled() {
                    break;
                }
                warn!("connection to controller lost, reconnecting");
            }
            Err(RegisterError::Refused(msg)) => {
                error!(error = %msg, "registration refused by controller, giving up");
                exit_code = Some(crate::config::exit_code::REGISTRATION_REFUSED);
                break;
            }
            Err(RegisterError::Transient(e)) => {
                warn!(error = %e, "registration failed, retrying");
            }
        }

        let delay = backoff
            .next_delay()
            .unwrap_or(RECONNECT_BACKOFF_CAP);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => break,
        }
    }

    // Drain remaining outbound messages for up to the shutdown grace
    // period, then stop for good.
    let drain_deadline = tokio::time::sleep(SHUTDOWN_DRAIN_GRACE);
    tokio::pin!(drain_deadline);
    loop {
        tokio::select! {
            _ = &mut drain_deadline => break,
            msg = outbound_rx.recv() => {
                if msg.is_none() {
                    break;
                }
            }
        }
    }

    exit_code
}

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Distinguishes a permanent rejection (wrong shared secret) from everything
/// else (connect timeout, I/O error, unexpected frame), which stays retryable.
enum RegisterError {
    Refused(String),
    Transient(anyhow::Error),
}

impl<E: Into<anyhow::Error>> From<E> for RegisterError {
    fn from(e: E) -> Self {
        RegisterError::Transient(e.into())
    }
}

async fn connect_and_register(state: &Arc<AgentState>) -> Result<WsStream, RegisterError> {
    let (mut ws, _) = tokio::time::timeout(
        fleet_protocol::constants::TRANSPORT_CONNECT_TIMEOUT,
        tokio_tungstenite::connect_async(&state.config.server),
    )
    .await
    .map_err(|_| anyhow::anyhow!("timed out connecting to controller"))??;

    let register = Envelope::new(MessageKind::Register(RegisterRequest {
        host_id: state.config.host_id,
        shared_secret: state.config.secret_key.clone(),
        agent_version: crate::state::AGENT_VERSION.to_string(),
        system_info: local_system_info(),
    }));
    ws.send(WsMessage::Text(register.to_json()?)).await?;

    let ack = tokio::time::timeout(REGISTER_ACK_DEADLINE, ws.next())
        .await
        .map_err(|_| anyhow::anyhow!("register_ack not received within deadline"))?
        .ok_or_else(|| anyhow::anyhow!("connection closed before register_ack"))??;

    match ack {
        WsMessage::Text(text) => match Envelope::from_json(&text)?.kind {
            MessageKind::RegisterAck(ack) => {
                apply_negotiated_intervals(state, &ack);
                Ok(ws)
            }
            MessageKind::Error(e) if e.code == "auth_failed" => Err(RegisterError::Refused(e.error)),
            MessageKind::Error(e) => Err(RegisterError::Transient(anyhow::anyhow!("registration error: {}", e.error))),
            other => Err(anyhow::anyhow!("unexpected reply to register: {}", other.type_name()).into()),
        },
        other => Err(anyhow::anyhow!("unexpected frame type: {other:?}").into()),
    }
}

/// Threads the Controller's negotiated `heartbeat_interval`/`monitor_interval`
/// (e.g. `"10s"`) into the running heartbeat and collector loops. A value
/// that fails to parse leaves the previous interval in place.
fn apply_negotiated_intervals(state: &Arc<AgentState>, ack: &fleet_protocol::model::RegisterAck) {
    if let Some(d) = parse_seconds(&ack.heartbeat_interval) {
        let _ = state.heartbeat_interval.send(d);
    } else {
        warn!(value = %ack.heartbeat_interval, "ignoring malformed heartbeat_interval from register_ack");
    }
    if let Some(d) = parse_seconds(&ack.monitor_interval) {
        let _ = state.monitor_interval.send(d);
    } else {
        warn!(value = %ack.monitor_interval, "ignoring malformed monitor_interval from register_ack");
    }
}

/// Parses a `"<seconds>s"` duration string, e.g. `"10s"`.
fn parse_seconds(s: &str) -> Option<Duration> {
    s.strip_suffix('s')?.parse::<u64>().ok().map(Duration::from_secs)
}

async fn run_ready_loop(
    state: &Arc<AgentState>,
    mut ws: WsStream,
    outbound_rx: &mut mpsc::Receiver<Envelope>,
    pulse: &TaskPulse,
    cancel: &CancellationToken,
) {
    let mut heartbeat_watch = state.heartbeat_interval.subscribe();
    let mut heartbeat_interval = tokio::time::interval(*heartbeat_watch.borrow());

    loop {
        pulse.tick();
        tokio::select! {
            _ = heartbeat_interval.tick() => {
                let hb = Envelope::new(MessageKind::Heartbeat(Heartbeat {
                    agent_version: crate::state::AGENT_VERSION.to_string(),
                }));
                if let Ok(json) = hb.to_json() {
                    if ws.send(WsMessage::Text(json)).await.is_err() {
                        return;
                    }
                }
            }
            Ok(()) = heartbeat_watch.changed() => {
                heartbeat_interval = tokio::time::interval(*heartbeat_watch.borrow());
            }
            outbound = outbound_rx.recv() => {
                match outbound {
                    Some(envelope) => {
                        match envelope.to_json() {
                            Ok(json) => {
                                if ws.send(WsMessage::Text(json)).await.is_err() {
                                    return;
                                }
                            }
                            Err(e) => error!(error = %e, "failed to encode outbound envelope"),
                        }
                    }
                    None => return,
                }
            }
            incoming = ws.next() => {
                match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        match Envelope::from_json(&text) {
                            Ok(envelope) => {
                                tokio::spawn(dispatcher::dispatch(Arc::clone(state), envelope));
                            }
                            Err(e) => warn!(error = %e, "failed to parse inbound envelope"),
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => return,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "transport read error");
                        return;
                    }
                }
            }
            _ = cancel.cancelled() => {
                let _ = ws.close(None).await;
                return;
            }
        }
    }
}

fn local_system_info() -> SystemInfo {
    use sysinfo::System;
    let mut sys = System::new_all();
    sys.refresh_memory();
    SystemInfo {
        os: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
        cpu_cores: sys.cpus().len() as u32,
        memory_total: sys.total_memory(),
        disk_total: 0,
        hostname: System::host_name().unwrap_or_else(|| "unknown".to_string()),
    }
}
