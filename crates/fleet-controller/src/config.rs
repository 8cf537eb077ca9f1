use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// CLI surface for the Controller binary, following the same `clap` derive
/// shape the agent uses.
#[derive(clap::Parser, Debug)]
#[command(name = "fleetwatch-controller", about = "FleetWatch controller", version)]
pub struct Args {
    #[arg(long, default_value = "config/controller.toml")]
    pub config: PathBuf,

    #[arg(long, env = "PORT", default_value_t = fleet_protocol::constants::DEFAULT_PORT)]
    pub port: u16,

    #[arg(long, env = "DB_PATH", default_value = "fleetwatch.db")]
    pub db_path: PathBuf,

    #[arg(long, env = "JWT_SECRET")]
    pub jwt_secret: Option<String>,
}

/// Singleton `SystemSettings` persisted in the config file, merged with any
/// values set at runtime through `POST /api/settings`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemSettings {
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_monitor_interval_secs")]
    pub monitor_interval_secs: u64,
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
    #[serde(default = "default_chart_history_hours")]
    pub chart_history_hours: u64,
    #[serde(default)]
    pub release_repo: String,
    #[serde(default = "default_release_channel")]
    pub release_channel: String,
    #[serde(default)]
    pub release_mirror: Option<String>,
    #[serde(default = "default_ui_refresh_interval_secs")]
    pub ui_refresh_interval_secs: u64,
}

fn default_heartbeat_interval_secs() -> u64 {
    fleet_protocol::constants::DEFAULT_HEARTBEAT_INTERVAL.as_secs()
}
fn default_monitor_interval_secs() -> u64 {
    fleet_protocol::constants::DEFAULT_MONITOR_INTERVAL.as_secs()
}
fn default_retention_days() -> i64 {
    fleet_protocol::constants::DEFAULT_RETENTION_DAYS
}
fn default_chart_history_hours() -> u64 {
    24
}
fn default_release_channel() -> String {
    "stable".to_string()
}
fn default_ui_refresh_interval_secs() -> u64 {
    5
}

impl Default for SystemSettings {
    fn default() -> Self {
        SystemSettings {
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            monitor_interval_secs: default_monitor_interval_secs(),
            retention_days: default_retention_days(),
            chart_history_hours: default_chart_history_hours(),
            release_repo: String::new(),
            release_channel: default_release_channel(),
            release_mirror: None,
            ui_refresh_interval_secs: default_ui_refresh_interval_secs(),
        }
    }
}

/// Loads settings from `path` if present, else returns defaults. Mirrors
/// the read-merge-write discipline used for the agent's config file.
pub async fn load_settings(path: &Path) -> anyhow::Result<SystemSettings> {
    if !path.exists() {
        return Ok(SystemSettings::default());
    }
    let raw = tokio::fs::read_to_string(path).await?;
    Ok(toml::from_str(&raw)?)
}

/// Persists `settings`, merging into any existing file so unmanaged TOML
/// sections survive.
pub async fn save_settings(path: &Path, settings: &SystemSettings) -> anyhow::Result<()> {
    let mut table: toml::Table = if path.exists() {
        let raw = tokio::fs::read_to_string(path).await?;
        toml::from_str(&raw).unwrap_or_default()
    } else {
        toml::Table::new()
    };

    let settings_value = toml::Value::try_from(settings)?;
    if let toml::Value::Table(settings_table) = settings_value {
        for (k, v) in settings_table {
            table.insert(k, v);
        }
    }

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, toml::to_string_pretty(&table)?).await?;
    Ok(())
}
