//! Agent Command Dispatcher (C3): routes inbound messages by `type` to
//! handlers, each on its own task so a slow handler never blocks the
//! transport reader.

use std::sync::Arc;
use std::time::Instant;

use fleet_protocol::envelope::{Envelope, MessageKind};
use fleet_protocol::error::ErrorPayload;
use tracing::warn;

use crate::handlers::{adapter, file, process};
use crate::state::AgentState;
use crate::upgrade;

pub async fn dispatch(state: Arc<AgentState>, envelope: Envelope) {
    let request_id = envelope.request_id.clone();

    let result: Result<Option<MessageKind>, String> = match envelope.kind {
        MessageKind::ShellOpen(req) => {
            match state.sessions.open(&state, request_id.clone(), req).await {
                Ok(_) => Ok(None), // shell.opened already emitted by the registry
                Err(e) => Err(e.to_string()),
            }
        }
        MessageKind::ShellInput(req) => {
            match base64::Engine::decode(&base64::engine::general_purpose::STANDARD, &req.data) {
                Ok(bytes) => state
                    .sessions
                    .input(&req.session_id, &bytes)
                    .await
                    .map(|_| None)
                    .map_err(|e| e.to_string()),
                Err(e) => Err(format!("invalid base64 payload: {e}")),
            }
        }
        MessageKind::ShellResize(req) => state
            .sessions
            .resize(&req.session_id, req.cols, req.rows)
            .await
            .map(|_| None)
            .map_err(|e| e.to_string()),
        MessageKind::ShellClose(req) => state
            .sessions
            .close(&req.session_id)
            .await
            .map(|_| None)
            .map_err(|e| e.to_string()),

        MessageKind::FileList(payload) => file::list(&payload)
            .await
            .map(|r| Some(MessageKind::AdapterResult(r)))
            .map_err(|e| e),
        MessageKind::FileRead(payload) | MessageKind::FileDownload(payload) => file::read(&payload)
            .await
            .map(|r| Some(MessageKind::AdapterResult(r)))
            .map_err(|e| e),
        MessageKind::FileWrite(payload) | MessageKind::FileUpload(payload) => {
            file::write(&payload)
                .await
                .map(|r| Some(MessageKind::AdapterResult(r)))
                .map_err(|e| e)
        }
        MessageKind::FileDelete(payload) => file::delete(&payload)
            .await
            .map(|r| Some(MessageKind::AdapterResult(r)))
            .map_err(|e| e),

        MessageKind::ProcessList(_) => process::list()
            .await
            .map(|r| Some(MessageKind::AdapterResult(r)))
            .map_err(|e| e),
        MessageKind::ProcessKill(payload) => process::kill(&payload)
            .await
            .map(|r| Some(MessageKind::AdapterResult(r)))
            .map_err(|e| e),

        MessageKind::DockerCommand(payload) => adapter::run_docker(&payload)
            .await
            .map(|r| Some(MessageKind::AdapterResult(r)))
            .map_err(|e| e),
        MessageKind::NginxCommand(payload) => adapter::run_nginx(&payload)
            .await
            .map(|r| Some(MessageKind::AdapterResult(r)))
            .map_err(|e| e),

        MessageKind::MonitorSnapshot(_) => {
            let mut collector = crate::collector::Collector::new(state.config.probe_url.clone());
            match collector.collect().await {
                Ok(sample) => Ok(Some(MessageKind::MonitorSnapshotResult(sample))),
                Err(e) => Err(e.to_string()),
            }
        }

        MessageKind::UpgradeApply(req) => {
            handle_upgrade(&state, request_id.clone(), req).await;
            Ok(None)
        }

        other => {
            warn!(kind = other.type_name(), "unsupported command");
            Err(format!("unsupported command: {}", other.type_name()))
        }
    };

    match result {
        Ok(Some(kind)) => {
            state
                .send(Envelope::with_request_id_opt(kind, request_id))
                .await;
        }
        Ok(None) => {}
        Err(message) => {
            state
                .send(Envelope::with_request_id_opt(
                    MessageKind::Error(ErrorPayload {
                        error: message,
                        code: "invalid_request".to_string(),
                    }),
                    request_id,
                ))
                .await;
        }
    }
}

/// `upgrade.apply` is long-running: it streams `upgrade.progress` frames
/// sharing `request_id`, then a final `upgrade.result`. Duplicate requests
/// within the idempotence window replay the cached result instead of
/// re-downloading.
async fn handle_upgrade(
    state: &Arc<AgentState>,
    request_id: Option<String>,
    req: fleet_protocol::model::UpgradeApply,
) {
    if let Some(ref rid) = request_id {
        let cache = state.upgrade_cache.lock().await;
        if let Some((started, cached)) = cache.get(rid) {
            if started.elapsed() < upgrade::idempotence_window() {
                let cached = cached.clone();
                drop(cache);
                state
                    .send(Envelope::with_request_id_opt(
                        MessageKind::UpgradeResult(cached),
                        request_id,
                    ))
                    .await;
                return;
            }
        }
    }

    let state_progress = Arc::clone(state);
    let request_id_progress = request_id.clone();
    let result = upgrade::apply(&req, move |progress| {
        let state = Arc::clone(&state_progress);
        let request_id = request_id_progress.clone();
        tokio::spawn(async move {
            state
                .send(Envelope::with_request_id_opt(
                    MessageKind::UpgradeProgress(progress),
                    request_id,
                ))
                .await;
        });
    })
    .await;

    if let Some(rid) = request_id.clone() {
        state
            .upgrade_cache
            .lock()
            .await
            .insert(rid, (Instant::now(), result.clone()));
    }

    state
        .send(Envelope::with_request_id_opt(
            MessageKind::UpgradeResult(result),
            request_id,
        ))
        .await;
}

