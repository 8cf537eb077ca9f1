use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use fleet_protocol::constants::{DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_MONITOR_INTERVAL};
use fleet_protocol::model::UpgradeResult;
use tokio::sync::{mpsc, watch, Mutex};

use crate::config::AgentConfig;
use crate::health::HealthCollector;
use crate::session::SessionRegistry;

pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Shared agent state, handed to every background task as an `Arc` clone,
/// mirroring the teacher's `ClientState` shape.
pub struct AgentState {
    pub config: AgentConfig,
    pub health: Arc<HealthCollector>,
    pub sessions: SessionRegistry,
    /// Outbound queue drained by the transport writer; every component that
    /// needs to send a message to the Controller pushes onto this.
    pub outbound: mpsc::Sender<fleet_protocol::Envelope>,
    /// Cache of completed `upgrade.apply` results keyed by `request_id`,
    /// for the 5 minute idempotence window in the self-upgrade contract.
    pub upgrade_cache: Mutex<HashMap<String, (Instant, UpgradeResult)>>,
    /// Negotiated from `register_ack`; the heartbeat loop subscribes and
    /// rebuilds its interval timer whenever the Controller renegotiates it.
    pub heartbeat_interval: watch::Sender<Duration>,
    /// Negotiated from `register_ack`; the collector loop subscribes the
    /// same way.
    pub monitor_interval: watch::Sender<Duration>,
}

impl AgentState {
    pub fn new(
        config: AgentConfig,
        health: Arc<HealthCollector>,
        outbound: mpsc::Sender<fleet_protocol::Envelope>,
    ) -> Self {
        AgentState {
            config,
            health,
            sessions: SessionRegistry::new(),
            outbound,
            upgrade_cache: Mutex::new(HashMap::new()),
            heartbeat_interval: watch::Sender::new(DEFAULT_HEARTBEAT_INTERVAL),
            monitor_interval: watch::Sender::new(DEFAULT_MONITOR_INTERVAL),
        }
    }

    pub async fn send(&self, envelope: fleet_protocol::Envelope) {
        if self.outbound.send(envelope).await.is_err() {
            tracing::warn!("outbound queue closed, dropping message");
        }
    }
}
