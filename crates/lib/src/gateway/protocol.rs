//! Gateway wire types: WebSocket frames and the execute request body.

use serde::{Deserialize, Serialize};

use crate::executor::{OutputChunk, StreamKind};
use crate::request::{Actor, ExecutionRequest};

/// Wire request: `{ "type": "req", "id", "method", "params" }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsRequest {
    #[serde(rename = "type")]
    pub typ: String,
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Wire response: `{ "type": "res", "id", "ok", "payload" or "error" }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsResponse {
    #[serde(rename = "type")]
    pub typ: String,
    pub id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Server push: `{ "type": "event", "event", "payload" }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsEvent {
    #[serde(rename = "type")]
    pub typ: String,
    pub event: String,
    pub payload: serde_json::Value,
}

/// Params for WS method "connect". With token auth, `auth.token` must match the gateway token.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub min_protocol: Option<u32>,
    pub max_protocol: Option<u32>,
    #[serde(default)]
    pub client: ConnectClient,
    #[serde(default)]
    pub auth: ConnectAuth,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectClient {
    pub id: Option<String>,
    pub version: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectAuth {
    pub token: Option<String>,
}

/// Server hello-ok payload after successful connect.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloOk {
    #[serde(rename = "type")]
    pub typ: String,
    pub protocol: u32,
    /// Names of the commands this gateway will consider.
    pub commands: Vec<String>,
}

/// Body of `POST /v1/execute` and params of WS method "execute".
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteParams {
    pub actor: Actor,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

impl ExecuteParams {
    pub fn into_request(self) -> ExecutionRequest {
        let req = ExecutionRequest::new(self.actor, self.command, self.args);
        match self.correlation_id {
            Some(c) => req.with_correlation_id(c),
            None => req,
        }
    }
}

/// Payload of the "exec.output" event. `data` is lossy UTF-8.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputPayload {
    pub request_id: String,
    pub stream: StreamKind,
    pub data: String,
}

impl OutputPayload {
    pub fn new(request_id: &str, chunk: &OutputChunk) -> Self {
        Self {
            request_id: request_id.to_string(),
            stream: chunk.stream,
            data: String::from_utf8_lossy(&chunk.data).into_owned(),
        }
    }
}

impl WsResponse {
    pub fn ok(id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            typ: "res".to_string(),
            id: id.into(),
            ok: true,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn err(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            typ: "res".to_string(),
            id: id.into(),
            ok: false,
            payload: None,
            error: Some(error.into()),
        }
    }

    /// A finished command: `ok` mirrors the response's own `ok`, payload is always present.
    pub fn command(id: impl Into<String>, ok: bool, payload: serde_json::Value) -> Self {
        Self {
            typ: "res".to_string(),
            id: id.into(),
            ok,
            payload: Some(payload),
            error: None,
        }
    }
}

impl WsEvent {
    pub fn new(event: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            typ: "event".to_string(),
            event: event.into(),
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Role;

    #[test]
    fn execute_params_parse_camel_case() {
        let p: ExecuteParams = serde_json::from_value(serde_json::json!({
            "actor": { "id": "alice", "role": "operator" },
            "command": "list-items",
            "args": ["--all"],
            "correlationId": "trace-9"
        }))
        .unwrap();
        assert_eq!(p.actor.role, Role::Operator);
        let req = p.into_request();
        assert_eq!(req.correlation_id(), "trace-9");
        assert_eq!(req.args(), ["--all".to_string()]);
    }

    #[test]
    fn output_event_shape() {
        let chunk = OutputChunk {
            stream: StreamKind::Stderr,
            data: b"warn\n".to_vec(),
        };
        let ev = WsEvent::new(
            "exec.output",
            serde_json::to_value(OutputPayload::new("req-1", &chunk)).unwrap(),
        );
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "event");
        assert_eq!(v["payload"]["requestId"], "req-1");
        assert_eq!(v["payload"]["stream"], "stderr");
        assert_eq!(v["payload"]["data"], "warn\n");
    }
}
