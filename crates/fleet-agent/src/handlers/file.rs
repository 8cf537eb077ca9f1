//! Filesystem adapter backing `file.list` / `file.read` / `file.write` /
//! `file.delete` / `file.upload` / `file.download`. Upload/download are
//! treated as aliases of write/read at the transport level (the byte
//! content travels base64-encoded inside the same request/response shape).

use base64::Engine;
use serde_json::{json, Value};

pub async fn list(payload: &Value) -> Result<Value, String> {
    let path = payload
        .get("path")
        .and_then(Value::as_str)
        .ok_or("missing `path`")?;
    let mut entries = Vec::new();
    let mut dir = tokio::fs::read_dir(path).await.map_err(|e| e.to_string())?;
    while let Some(entry) = dir.next_entry().await.map_err(|e| e.to_string())? {
        let meta = entry.metadata().await.map_err(|e| e.to_string())?;
        entries.push(json!({
            "name": entry.file_name().to_string_lossy(),
            "is_dir": meta.is_dir(),
            "size": meta.len(),
        }));
    }
    Ok(json!({ "entries": entries }))
}

pub async fn read(payload: &Value) -> Result<Value, String> {
    let path = payload
        .get("path")
        .and_then(Value::as_str)
        .ok_or("missing `path`")?;
    let bytes = tokio::fs::read(path).await.map_err(|e| e.to_string())?;
    let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
    Ok(json!({ "data": encoded }))
}

pub async fn write(payload: &Value) -> Result<Value, String> {
    let path = payload
        .get("path")
        .and_then(Value::as_str)
        .ok_or("missing `path`")?;
    let data = payload
        .get("data")
        .and_then(Value::as_str)
        .ok_or("missing `data`")?;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(data)
        .map_err(|e| e.to_string())?;
    tokio::fs::write(path, bytes)
        .await
        .map_err(|e| e.to_string())?;
    Ok(json!({ "ok": true }))
}

pub async fn delete(payload: &Value) -> Result<Value, String> {
    let path = payload
        .get("path")
        .and_then(Value::as_str)
        .ok_or("missing `path`")?;
    tokio::fs::remove_file(path)
        .await
        .map_err(|e| e.to_string())?;
    Ok(json!({ "ok": true }))
}
