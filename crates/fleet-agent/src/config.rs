use std::path::PathBuf;

use serde::Deserialize;

/// CLI surface per the agent's external interface: `--config`, `--server`,
/// `--host-id`, `--secret-key`, `--register-token`, `--log-level`, `--version`.
#[derive(clap::Parser, Debug)]
#[command(name = "fleetwatch-agent", about = "FleetWatch agent daemon", version)]
pub struct Args {
    /// Path to the agent configuration file.
    #[arg(long, default_value = "config/agent.toml")]
    pub config: PathBuf,

    /// Controller WebSocket URL, e.g. wss://controller.example.com/ws/agent
    #[arg(long, env = "FLEETWATCH_SERVER")]
    pub server: Option<String>,

    /// HTTP(S) endpoint probed for latency/packet-loss telemetry. Defaults
    /// to the Controller's health endpoint derived from `--server`.
    #[arg(long = "probe-url", env = "FLEETWATCH_PROBE_URL")]
    pub probe_url: Option<String>,

    /// This host's numeric id as assigned by the Controller.
    #[arg(long = "host-id", env = "FLEETWATCH_HOST_ID")]
    pub host_id: Option<i64>,

    /// Shared secret minted for this host at registration.
    #[arg(long = "secret-key", env = "FLEETWATCH_SECRET_KEY")]
    pub secret_key: Option<String>,

    /// One-time token used for first registration, if the host record
    /// does not yet exist.
    #[arg(long = "register-token", env = "FLEETWATCH_REGISTER_TOKEN")]
    pub register_token: Option<String>,

    #[arg(long = "log-level", default_value = "info")]
    pub log_level: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct FileConfig {
    pub server: Option<String>,
    pub probe_url: Option<String>,
    pub host_id: Option<i64>,
    pub secret_key: Option<String>,
    pub register_token: Option<String>,
}

/// Fully resolved agent configuration: CLI flags take precedence over the
/// config file, matching the precedence the teacher documents implicitly
/// by parsing CLI args after loading the file.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub server: String,
    /// HTTP(S) endpoint for the latency/packet-loss probe — distinct from
    /// `server`, which is a `ws(s)://` URL and cannot itself be HTTP-probed.
    pub probe_url: String,
    pub host_id: i64,
    pub secret_key: String,
    pub register_token: Option<String>,
}

/// Process exit codes per the external interface contract.
pub mod exit_code {
    pub const OK: i32 = 0;
    pub const CONFIG_INVALID: i32 = 2;
    pub const REGISTRATION_REFUSED: i32 = 3;
    pub const FATAL: i32 = 4;
}

impl AgentConfig {
    pub async fn load(args: &Args) -> anyhow::Result<Self> {
        let file_config = if args.config.exists() {
            let raw = tokio::fs::read_to_string(&args.config).await?;
            toml::from_str::<FileConfig>(&raw)?
        } else {
            FileConfig::default()
        };

        let server = args
            .server
            .clone()
            .or(file_config.server)
            .ok_or_else(|| anyhow::anyhow!("missing --server (or config `server =`)"))?;
        let host_id = args
            .host_id
            .or(file_config.host_id)
            .ok_or_else(|| anyhow::anyhow!("missing --host-id (or config `host_id =`)"))?;
        let register_token = args.register_token.clone().or(file_config.register_token);
        let secret_key = args
            .secret_key
            .clone()
            .or(file_config.secret_key)
            .or_else(|| register_token.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("missing --secret-key and --register-token (need at least one)")
            })?;
        let probe_url = args
            .probe_url
            .clone()
            .or(file_config.probe_url)
            .unwrap_or_else(|| derive_probe_url(&server));

        Ok(AgentConfig {
            server,
            probe_url,
            host_id,
            secret_key,
            register_token,
        })
    }
}

/// Derives a health-check probe URL from the Controller's `ws(s)://` address
/// when no explicit `--probe-url` is configured: `wss://` becomes `https://`,
/// `ws://` becomes `http://`, and the path is replaced with `/api/health`.
fn derive_probe_url(server: &str) -> String {
    let http = server.replacen("wss://", "https://", 1).replacen("ws://", "http://", 1);
    let scheme_end = http.find("://").map(|i| i + 3).unwrap_or(0);
    let origin_end = http[scheme_end..]
        .find('/')
        .map(|i| scheme_end + i)
        .unwrap_or(http.len());
    format!("{}/api/health", &http[..origin_end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_https_probe_from_wss_server() {
        assert_eq!(
            derive_probe_url("wss://controller.example.com/ws/agent"),
            "https://controller.example.com/api/health"
        );
    }

    #[test]
    fn derives_http_probe_from_ws_server() {
        assert_eq!(
            derive_probe_url("ws://localhost:3333/ws/agent"),
            "http://localhost:3333/api/health"
        );
    }
}
