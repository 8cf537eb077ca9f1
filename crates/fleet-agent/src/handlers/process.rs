//! Process adapter backing `process.list` / `process.kill`.

use serde_json::{json, Value};
use sysinfo::{Pid, System};

pub async fn list() -> Result<Value, String> {
    let mut sys = System::new_all();
    sys.refresh_processes(sysinfo::ProcessesToUpdate::All, true);
    let processes: Vec<Value> = sys
        .processes()
        .iter()
        .map(|(pid, p)| {
            json!({
                "pid": pid.as_u32(),
                "name": p.name().to_string_lossy(),
                "cpu_percent": p.cpu_usage(),
                "memory": p.memory(),
            })
        })
        .collect();
    Ok(json!({ "processes": processes }))
}

pub async fn kill(payload: &Value) -> Result<Value, String> {
    let pid = payload
        .get("pid")
        .and_then(Value::as_u64)
        .ok_or("missing `pid`")?;
    let mut sys = System::new_all();
    sys.refresh_processes(sysinfo::ProcessesToUpdate::All, true);
    let target = Pid::from_u32(pid as u32);
    match sys.process(target) {
        Some(process) => {
            let killed = process.kill();
            Ok(json!({ "ok": killed }))
        }
        None => Err(format!("no such process {pid}")),
    }
}
