//! Controller Hub (C6): the in-memory registry of live Agent connections and
//! Browser subscribers, and the request/response correlation layer between
//! them. Generalizes the teacher's `WsBroadcaster` (`websocket.rs`) from a
//! handful of fixed broadcast channels into a per-topic subscriber registry,
//! since the spec requires per-subscriber backpressure (disconnect a slow
//! consumer) rather than a single lossy broadcast channel shared by everyone.

use std::collections::HashMap;
use std::time::Duration;

use fleet_protocol::constants::{REQUEST_DEADLINE, SUBSCRIBER_QUEUE_CAPACITY};
use fleet_protocol::envelope::{Envelope, MessageKind};
use fleet_protocol::error::{ErrorKind, ErrorPayload, FleetError};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

/// Reason a previously-registered Agent connection was asked to close.
#[derive(Debug, Clone, Copy)]
pub enum CloseReason {
    Superseded,
}

struct AgentSlot {
    generation: u64,
    outbound: mpsc::Sender<Envelope>,
    close_tx: Option<oneshot::Sender<CloseReason>>,
}

struct Subscriber {
    sender: mpsc::Sender<Value>,
}

struct PendingRequest {
    host_id: i64,
    tx: oneshot::Sender<Envelope>,
}

#[derive(Default)]
pub struct Hub {
    agents: RwLock<HashMap<i64, AgentSlot>>,
    subscribers: RwLock<HashMap<String, HashMap<Uuid, Subscriber>>>,
    pending: Mutex<HashMap<String, PendingRequest>>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a freshly-authenticated Agent connection for `host_id`. If a
    /// connection was already registered, it is asked to close with
    /// [`CloseReason::Superseded`] — the invariant is exactly one live
    /// connection per host.
    pub async fn register_agent(
        &self,
        host_id: i64,
        outbound: mpsc::Sender<Envelope>,
        close_tx: oneshot::Sender<CloseReason>,
    ) -> u64 {
        let mut agents = self.agents.write().await;
        let generation = agents.get(&host_id).map(|s| s.generation + 1).unwrap_or(0);

        if let Some(mut old) = agents.remove(&host_id) {
            if let Some(tx) = old.close_tx.take() {
                let _ = tx.send(CloseReason::Superseded);
            }
        }

        agents.insert(
            host_id,
            AgentSlot {
                generation,
                outbound,
                close_tx: Some(close_tx),
            },
        );
        generation
    }

    /// Removes the agent registration, but only if `generation` still
    /// matches — a connection superseded mid-shutdown must not clobber the
    /// newer one's registration on its way out.
    pub async fn unregister_agent(&self, host_id: i64, generation: u64) {
        let mut agents = self.agents.write().await;
        if let Some(slot) = agents.get(&host_id) {
            if slot.generation == generation {
                agents.remove(&host_id);
            }
        }
    }

    pub async fn is_agent_online(&self, host_id: i64) -> bool {
        self.agents.read().await.contains_key(&host_id)
    }

    pub async fn send_to_agent(&self, host_id: i64, envelope: Envelope) -> Result<(), FleetError> {
        let agents = self.agents.read().await;
        let slot = agents
            .get(&host_id)
            .ok_or_else(|| FleetError::new(ErrorKind::AgentOffline, "agent is not connected"))?;
        slot.outbound
            .send(envelope)
            .await
            .map_err(|_| FleetError::new(ErrorKind::AgentOffline, "agent connection closed"))
    }

    /// Sends `envelope` (with a freshly-assigned `request_id`) to the agent
    /// for `host_id` and awaits its correlated response, timing out after
    /// [`REQUEST_DEADLINE`]. If the agent disconnects while the request is
    /// outstanding, [`Self::fail_pending_for_host`] resolves it with
    /// `agent_offline` instead of hanging until the deadline.
    pub async fn request(&self, host_id: i64, mut envelope: Envelope) -> Result<Envelope, FleetError> {
        let request_id = Uuid::new_v4().to_string();
        envelope.request_id = Some(request_id.clone());

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .await
            .insert(request_id.clone(), PendingRequest { host_id, tx });

        if let Err(e) = self.send_to_agent(host_id, envelope).await {
            self.pending.lock().await.remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(REQUEST_DEADLINE, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(FleetError::new(ErrorKind::AgentOffline, "agent disconnected")),
            Err(_) => {
                self.pending.lock().await.remove(&request_id);
                Err(FleetError::new(ErrorKind::Timeout, "agent did not respond in time"))
            }
        }
    }

    /// Routes an inbound Agent message carrying `request_id` to its waiting
    /// caller. Returns `true` if a caller was waiting (the message was a
    /// correlated response); `false` means it was unsolicited (heartbeat,
    /// monitor sample, ...) and the caller should handle it directly.
    pub async fn resolve_pending(&self, request_id: &str, envelope: Envelope) -> bool {
        if let Some(pending) = self.pending.lock().await.remove(request_id) {
            let _ = pending.tx.send(envelope);
            true
        } else {
            false
        }
    }

    /// Fails every pending request addressed to `host_id` with
    /// `agent_offline`, called when that agent's connection drops. The
    /// sender lives in `pending`, owned by the `Hub`, not by the connection
    /// task, so it is never dropped on its own when the socket closes.
    pub async fn fail_pending_for_host(&self, host_id: i64) {
        let mut pending = self.pending.lock().await;
        let stale: Vec<String> = pending
            .iter()
            .filter(|(_, p)| p.host_id == host_id)
            .map(|(id, _)| id.clone())
            .collect();
        for request_id in stale {
            if let Some(p) = pending.remove(&request_id) {
                let _ = p.tx.send(Envelope::new(MessageKind::Error(ErrorPayload {
                    error: "agent disconnected".to_string(),
                    code: ErrorKind::AgentOffline.code().to_string(),
                })));
            }
        }
    }

    pub async fn subscribe(&self, topic: impl Into<String>) -> (Uuid, mpsc::Receiver<Value>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        self.subscribers
            .write()
            .await
            .entry(topic.into())
            .or_default()
            .insert(id, Subscriber { sender: tx });
        (id, rx)
    }

    pub async fn unsubscribe(&self, topic: &str, id: Uuid) {
        if let Some(subs) = self.subscribers.write().await.get_mut(topic) {
            subs.remove(&id);
        }
    }

    /// Fans `value` out to every subscriber of `topic`. A subscriber whose
    /// queue is full is dropped rather than blocking the publisher — a slow
    /// dashboard tab loses its connection instead of stalling every other
    /// consumer.
    pub async fn broadcast(&self, topic: &str, value: Value) {
        let mut subs = self.subscribers.write().await;
        let Some(targets) = subs.get_mut(topic) else {
            return;
        };
        let mut dead = Vec::new();
        for (id, sub) in targets.iter() {
            if let Err(e) = sub.sender.try_send(value.clone()) {
                match e {
                    mpsc::error::TrySendError::Full(_) => {
                        warn!(topic, subscriber = %id, "slow consumer, disconnecting");
                    }
                    mpsc::error::TrySendError::Closed(_) => {}
                }
                dead.push(*id);
            }
        }
        for id in dead {
            targets.remove(&id);
        }
    }

    pub async fn connected_host_ids(&self) -> Vec<i64> {
        self.agents.read().await.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_protocol::envelope::MessageKind;

    #[tokio::test]
    async fn supersede_closes_previous_connection() {
        let hub = Hub::new();
        let (tx1, _rx1) = mpsc::channel(8);
        let (close_tx1, close_rx1) = oneshot::channel();
        hub.register_agent(1, tx1, close_tx1).await;

        let (tx2, _rx2) = mpsc::channel(8);
        let (close_tx2, _close_rx2) = oneshot::channel();
        let gen2 = hub.register_agent(1, tx2, close_tx2).await;

        assert_eq!(gen2, 1);
        assert!(matches!(close_rx1.await, Ok(CloseReason::Superseded)));
    }

    #[tokio::test]
    async fn request_times_out_when_unanswered() {
        let hub = Hub::new();
        let (tx, mut rx) = mpsc::channel(8);
        let (close_tx, _close_rx) = oneshot::channel();
        hub.register_agent(1, tx, close_tx).await;

        // Drain but never reply, so the request should hang until timeout.
        tokio::spawn(async move { while rx.recv().await.is_some() {} });

        let result = tokio::time::timeout(
            Duration::from_millis(100),
            hub.request(1, Envelope::new(MessageKind::MonitorSnapshot(Default::default()))),
        )
        .await;
        // We only assert the call doesn't panic; the real timeout is 30s so
        // this outer timeout fires first and that's fine for this test.
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn offline_host_rejects_send() {
        let hub = Hub::new();
        let result = hub
            .send_to_agent(99, Envelope::new(MessageKind::Ack(Default::default())))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn slow_subscriber_is_dropped_not_blocked() {
        let hub = Hub::new();
        let (id, mut rx) = hub.subscribe("hosts").await;
        for i in 0..SUBSCRIBER_QUEUE_CAPACITY + 5 {
            hub.broadcast("hosts", serde_json::json!({ "i": i })).await;
        }
        // queue should be full/dropped by now, but the call above must not
        // have blocked or panicked.
        drop(id);
        let _ = rx.try_recv();
    }
}
