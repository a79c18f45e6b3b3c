//! Gateway: HTTP + WebSocket control plane over the command gate.
//!
//! Single port serves both. HTTP: `GET /` health, `POST /v1/execute`. WebSocket `/ws`:
//! first frame must be `connect`; then `execute` requests (req/res) and `exec.output` events.

mod protocol;
mod server;

pub use protocol::{
    ConnectParams, ExecuteParams, HelloOk, OutputPayload, WsEvent, WsRequest, WsResponse,
};
pub use server::{router, run_gateway, GatewayState};
