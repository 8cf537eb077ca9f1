//! Docker/Nginx adapters. Their platform-specific implementation is out of
//! scope (treated as an external collaborator); the agent's contribution
//! is limited to forwarding a command line to the relevant CLI binary and
//! returning its output, the same "shell out to an OS command" idiom used
//! elsewhere in this codebase rather than linking a dedicated API client.

use serde_json::{json, Value};
use tokio::process::Command;

pub async fn run_docker(payload: &Value) -> Result<Value, String> {
    run_cli("docker", payload).await
}

pub async fn run_nginx(payload: &Value) -> Result<Value, String> {
    run_cli("nginx", payload).await
}

async fn run_cli(binary: &str, payload: &Value) -> Result<Value, String> {
    let args: Vec<String> = payload
        .get("args")
        .and_then(Value::as_array)
        .map(|a| {
            a.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    let output = Command::new(binary)
        .args(&args)
        .output()
        .await
        .map_err(|e| format!("failed to spawn {binary}: {e}"))?;

    Ok(json!({
        "exit_code": output.status.code().unwrap_or(-1),
        "stdout": String::from_utf8_lossy(&output.stdout),
        "stderr": String::from_utf8_lossy(&output.stderr),
    }))
}
