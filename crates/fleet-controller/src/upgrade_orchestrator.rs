//! Upgrade Orchestrator (C10): resolves the latest release for a channel,
//! caches that resolution briefly, and fans `upgrade.apply` out to a batch
//! of hosts through the hub with bounded concurrency.

use std::sync::Mutex;
use std::time::Instant;

use fleet_protocol::constants::{UPGRADE_BATCH_SIZE, UPGRADE_BATCH_SPACING};
use fleet_protocol::envelope::{Envelope, MessageKind};
use fleet_protocol::model::UpgradeApply;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::state::AppState;

const RELEASE_CACHE_TTL: std::time::Duration = std::time::Duration::from_secs(300);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseInfo {
    pub version: String,
    pub download_url: String,
    pub sha256: String,
    pub channel: String,
}

struct CachedRelease {
    fetched_at: Instant,
    release: ReleaseInfo,
}

pub struct ReleaseResolver {
    cache: Mutex<Option<CachedRelease>>,
}

impl ReleaseResolver {
    pub fn new() -> Self {
        Self {
            cache: Mutex::new(None),
        }
    }

    /// Resolves the latest release for `channel` from `repo`, reusing a
    /// cached answer younger than [`RELEASE_CACHE_TTL`] so a batch upgrade
    /// across many hosts doesn't repeat the lookup per host.
    pub async fn resolve(&self, repo: &str, channel: &str, mirror: Option<&str>) -> Result<ReleaseInfo, String> {
        {
            let cache = self.cache.lock().unwrap();
            if let Some(cached) = cache.as_ref() {
                if cached.fetched_at.elapsed() < RELEASE_CACHE_TTL && cached.release.channel == channel {
                    return Ok(cached.release.clone());
                }
            }
        }

        let base = mirror.unwrap_or("https://api.github.com/repos");
        let url = format!("{base}/{repo}/releases/{channel}");

        let client = reqwest::Client::new();
        let resp = client
            .get(&url)
            .header("User-Agent", "fleetwatch-controller")
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if !resp.status().is_success() {
            return Err(format!("release lookup returned {}", resp.status()));
        }

        let body: serde_json::Value = resp.json().await.map_err(|e| e.to_string())?;
        let release = ReleaseInfo {
            version: body
                .get("tag_name")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown")
                .to_string(),
            download_url: body
                .get("download_url")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            sha256: body
                .get("sha256")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            channel: channel.to_string(),
        };

        *self.cache.lock().unwrap() = Some(CachedRelease {
            fetched_at: Instant::now(),
            release: release.clone(),
        });

        Ok(release)
    }
}

impl Default for ReleaseResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Serialize)]
pub struct BatchSummary {
    pub success: u32,
    pub failure: u32,
    pub offline: u32,
    pub missing: u32,
}

/// Dispatches `upgrade.apply` to every host in `host_ids`, in batches of
/// [`UPGRADE_BATCH_SIZE`] spaced [`UPGRADE_BATCH_SPACING`] apart so a fleet
/// of hundreds of agents doesn't open a thundering-herd download against the
/// release mirror.
pub async fn dispatch_batch(state: &AppState, host_ids: Vec<i64>, release: ReleaseInfo) -> BatchSummary {
    let mut summary = BatchSummary {
        success: 0,
        failure: 0,
        offline: 0,
        missing: 0,
    };

    for chunk in host_ids.chunks(UPGRADE_BATCH_SIZE) {
        let mut handles = Vec::new();
        for &host_id in chunk {
            let state = state.clone();
            let release = release.clone();
            handles.push(tokio::spawn(async move {
                dispatch_one(&state, host_id, &release).await
            }));
        }
        for handle in handles {
            match handle.await {
                Ok(Ok(())) => summary.success += 1,
                Ok(Err(DispatchError::Offline)) => summary.offline += 1,
                Ok(Err(DispatchError::NotFound)) => summary.missing += 1,
                Ok(Err(DispatchError::Failed(msg))) => {
                    warn!(error = %msg, "upgrade dispatch failed");
                    summary.failure += 1;
                }
                Err(e) => {
                    warn!(error = %e, "upgrade dispatch task panicked");
                    summary.failure += 1;
                }
            }
        }
        tokio::time::sleep(UPGRADE_BATCH_SPACING).await;
    }

    summary
}

enum DispatchError {
    Offline,
    NotFound,
    Failed(String),
}

async fn dispatch_one(state: &AppState, host_id: i64, release: &ReleaseInfo) -> Result<(), DispatchError> {
    if crate::store::get_host(&state.db, host_id, state.heartbeat_timeout_secs)
        .map_err(|e| DispatchError::Failed(e.to_string()))?
        .is_none()
    {
        return Err(DispatchError::NotFound);
    }

    if !state.hub.is_agent_online(host_id).await {
        return Err(DispatchError::Offline);
    }

    let envelope = Envelope::new(MessageKind::UpgradeApply(UpgradeApply {
        target_version: release.version.clone(),
        channel: release.channel.clone(),
        download_url: release.download_url.clone(),
        sha256: release.sha256.clone(),
    }));

    // Dispatch, not completion, is the return condition: `upgrade.progress`
    // and `upgrade.result` stream back over the host's subscriber topic
    // instead of being awaited here.
    state
        .hub
        .send_to_agent(host_id, envelope)
        .await
        .map_err(|e| DispatchError::Failed(e.to_string()))?;

    Ok(())
}
