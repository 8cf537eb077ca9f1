//! Data types that travel on the wire between the Agent and the Controller.
//! These mirror the entities in the data model but carry only the fields a
//! message actually needs to transmit.

use serde::{Deserialize, Serialize};

/// One point in a host's time series. Append-only at the Controller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MonitorSample {
    pub captured_at: i64,
    pub cpu_percent: f64,
    pub memory_used: u64,
    pub memory_total: u64,
    pub disk_used: u64,
    pub disk_total: u64,
    pub net_in_rate: f64,
    pub net_out_rate: f64,
    pub net_in_delta: u64,
    pub net_out_delta: u64,
    pub sample_window_ms: u64,
    pub load_1: f64,
    pub load_5: f64,
    pub load_15: f64,
    pub swap_used: u64,
    pub swap_total: u64,
    pub boot_time: i64,
    pub latency_ms: f64,
    pub packet_loss_pct: f64,
    pub process_count: u64,
    pub tcp_conn_count: u64,
    pub udp_conn_count: u64,
}

impl Default for MonitorSample {
    fn default() -> Self {
        MonitorSample {
            captured_at: 0,
            cpu_percent: 0.0,
            memory_used: 0,
            memory_total: 0,
            disk_used: 0,
            disk_total: 0,
            net_in_rate: 0.0,
            net_out_rate: 0.0,
            net_in_delta: 0,
            net_out_delta: 0,
            sample_window_ms: 0,
            load_1: 0.0,
            load_5: 0.0,
            load_15: 0.0,
            swap_used: 0,
            swap_total: 0,
            boot_time: 0,
            latency_ms: 0.0,
            packet_loss_pct: 0.0,
            process_count: 0,
            tcp_conn_count: 0,
            udp_conn_count: 0,
        }
    }
}

/// Static facts about a host reported once at registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInfo {
    pub os: String,
    pub arch: String,
    pub cpu_cores: u32,
    pub memory_total: u64,
    pub disk_total: u64,
    pub hostname: String,
}

/// `shell.open` / `shell.opened` payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionOpenRequest {
    pub cols: u16,
    pub rows: u16,
    #[serde(default)]
    pub kind: SessionKind,
    #[serde(default)]
    pub container: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    #[default]
    HostShell,
    ContainerExec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionOpened {
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInput {
    pub session_id: String,
    /// Base64-encoded raw bytes; binary-safe, tolerates UTF-8 splits.
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionResize {
    pub session_id: String,
    pub cols: u16,
    pub rows: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClose {
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionOutput {
    pub session_id: String,
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClosed {
    pub session_id: String,
    pub reason: String,
}

/// `upgrade.apply` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpgradeApply {
    pub target_version: String,
    pub channel: String,
    pub download_url: String,
    pub sha256: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpgradeStatus {
    Pending,
    Downloading,
    Verifying,
    Applying,
    Succeeded,
    Failed,
    RolledBack,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpgradeProgress {
    pub status: UpgradeStatus,
    pub bytes_done: u64,
    pub bytes_total: Option<u64>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpgradeResult {
    pub status: UpgradeStatus,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub host_id: i64,
    pub shared_secret: String,
    pub agent_version: String,
    pub system_info: SystemInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterAck {
    pub heartbeat_interval: String,
    pub monitor_interval: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub agent_version: String,
}
