//! The wire envelope. Every message crossing the Agent<->Controller
//! transport, or a browser<->Controller WebSocket, has the shape
//! `{ "type": <string>, "request_id": <string?>, "payload": <object> }`.
//!
//! Each `type` is a fixed, statically typed variant rather than a loosely
//! typed field bag: unknown fields are rejected by serde at the boundary,
//! and an unrecognized `type` fails deserialization, which the dispatcher
//! turns into an `unsupported_command` error.

use serde::{Deserialize, Serialize};

use crate::error::ErrorPayload;
use crate::model::{
    Heartbeat, MonitorSample, RegisterAck, RegisterRequest, SessionClose, SessionClosed,
    SessionInput, SessionOpenRequest, SessionOpened, SessionOutput, SessionResize, UpgradeApply,
    UpgradeProgress, UpgradeResult,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(flatten)]
    pub kind: MessageKind,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub request_id: Option<String>,
}

impl Envelope {
    pub fn new(kind: MessageKind) -> Self {
        Envelope {
            kind,
            request_id: None,
        }
    }

    pub fn with_request_id(kind: MessageKind, request_id: impl Into<String>) -> Self {
        Envelope {
            kind,
            request_id: Some(request_id.into()),
        }
    }

    pub fn with_request_id_opt(kind: MessageKind, request_id: Option<String>) -> Self {
        Envelope { kind, request_id }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

/// Generic passthrough payload for the adapter families (`file.*`,
/// `process.*`, `docker.*`, `nginx.*`) whose exact argument/result shapes
/// are an external collaborator's concern (see Non-goals); the dispatcher
/// forwards the object verbatim to the matching adapter and back.
pub type AdapterPayload = serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum MessageKind {
    #[serde(rename = "register")]
    Register(RegisterRequest),
    #[serde(rename = "register_ack")]
    RegisterAck(RegisterAck),
    #[serde(rename = "heartbeat")]
    Heartbeat(Heartbeat),
    #[serde(rename = "monitor.sample")]
    MonitorSample(MonitorSample),
    #[serde(rename = "monitor.snapshot")]
    MonitorSnapshot(EmptyPayload),
    #[serde(rename = "monitor.snapshot.result")]
    MonitorSnapshotResult(MonitorSample),

    #[serde(rename = "shell.open")]
    ShellOpen(SessionOpenRequest),
    #[serde(rename = "shell.opened")]
    ShellOpened(SessionOpened),
    #[serde(rename = "shell.input")]
    ShellInput(SessionInput),
    #[serde(rename = "shell.resize")]
    ShellResize(SessionResize),
    #[serde(rename = "shell.close")]
    ShellClose(SessionClose),
    #[serde(rename = "shell.output")]
    ShellOutput(SessionOutput),
    #[serde(rename = "session.closed")]
    SessionClosed(SessionClosed),

    #[serde(rename = "file.list")]
    FileList(AdapterPayload),
    #[serde(rename = "file.read")]
    FileRead(AdapterPayload),
    #[serde(rename = "file.write")]
    FileWrite(AdapterPayload),
    #[serde(rename = "file.delete")]
    FileDelete(AdapterPayload),
    #[serde(rename = "file.upload")]
    FileUpload(AdapterPayload),
    #[serde(rename = "file.download")]
    FileDownload(AdapterPayload),
    #[serde(rename = "process.list")]
    ProcessList(AdapterPayload),
    #[serde(rename = "process.kill")]
    ProcessKill(AdapterPayload),
    #[serde(rename = "docker.command")]
    DockerCommand(AdapterPayload),
    #[serde(rename = "nginx.command")]
    NginxCommand(AdapterPayload),
    #[serde(rename = "adapter.result")]
    AdapterResult(AdapterPayload),

    #[serde(rename = "upgrade.apply")]
    UpgradeApply(UpgradeApply),
    #[serde(rename = "upgrade.progress")]
    UpgradeProgress(UpgradeProgress),
    #[serde(rename = "upgrade.result")]
    UpgradeResult(UpgradeResult),

    #[serde(rename = "ack")]
    Ack(EmptyPayload),
    #[serde(rename = "error")]
    Error(ErrorPayload),
}

impl MessageKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            MessageKind::Register(_) => "register",
            MessageKind::RegisterAck(_) => "register_ack",
            MessageKind::Heartbeat(_) => "heartbeat",
            MessageKind::MonitorSample(_) => "monitor.sample",
            MessageKind::MonitorSnapshot(_) => "monitor.snapshot",
            MessageKind::MonitorSnapshotResult(_) => "monitor.snapshot.result",
            MessageKind::ShellOpen(_) => "shell.open",
            MessageKind::ShellOpened(_) => "shell.opened",
            MessageKind::ShellInput(_) => "shell.input",
            MessageKind::ShellResize(_) => "shell.resize",
            MessageKind::ShellClose(_) => "shell.close",
            MessageKind::ShellOutput(_) => "shell.output",
            MessageKind::SessionClosed(_) => "session.closed",
            MessageKind::FileList(_) => "file.list",
            MessageKind::FileRead(_) => "file.read",
            MessageKind::FileWrite(_) => "file.write",
            MessageKind::FileDelete(_) => "file.delete",
            MessageKind::FileUpload(_) => "file.upload",
            MessageKind::FileDownload(_) => "file.download",
            MessageKind::ProcessList(_) => "process.list",
            MessageKind::ProcessKill(_) => "process.kill",
            MessageKind::DockerCommand(_) => "docker.command",
            MessageKind::NginxCommand(_) => "nginx.command",
            MessageKind::AdapterResult(_) => "adapter.result",
            MessageKind::UpgradeApply(_) => "upgrade.apply",
            MessageKind::UpgradeProgress(_) => "upgrade.progress",
            MessageKind::UpgradeResult(_) => "upgrade.result",
            MessageKind::Ack(_) => "ack",
            MessageKind::Error(_) => "error",
        }
    }
}

/// Marker payload for message types that carry no fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmptyPayload {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SystemInfo;

    #[test]
    fn register_roundtrip() {
        let env = Envelope::new(MessageKind::Register(RegisterRequest {
            host_id: 42,
            shared_secret: "SK".into(),
            agent_version: "1.2.2".into(),
            system_info: SystemInfo {
                os: "linux".into(),
                arch: "x86_64".into(),
                cpu_cores: 4,
                memory_total: 8_000_000_000,
                disk_total: 100_000_000_000,
                hostname: "web-1".into(),
            },
        }));
        let json = env.to_json().unwrap();
        assert!(json.contains("\"type\":\"register\""));
        assert!(json.contains("\"host_id\":42"));
        assert!(!json.contains("request_id"));

        let back = Envelope::from_json(&json).unwrap();
        match back.kind {
            MessageKind::Register(r) => {
                assert_eq!(r.host_id, 42);
                assert_eq!(r.shared_secret, "SK");
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn request_id_round_trips_when_present() {
        let env = Envelope::with_request_id(
            MessageKind::ShellOpen(SessionOpenRequest {
                cols: 120,
                rows: 40,
                kind: Default::default(),
                container: None,
            }),
            "abc",
        );
        let json = env.to_json().unwrap();
        let back = Envelope::from_json(&json).unwrap();
        assert_eq!(back.request_id.as_deref(), Some("abc"));
    }

    #[test]
    fn unknown_type_fails_to_parse() {
        let raw = r#"{"type":"not.a.real.type","payload":{}}"#;
        assert!(Envelope::from_json(raw).is_err());
    }

    #[test]
    fn matches_documented_wire_example() {
        let raw = r#"{ "type":"heartbeat", "payload":{"agent_version":"1.2.2"} }"#;
        let env = Envelope::from_json(raw).unwrap();
        match env.kind {
            MessageKind::Heartbeat(h) => assert_eq!(h.agent_version, "1.2.2"),
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}
