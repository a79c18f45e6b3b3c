//! Gateway HTTP + WebSocket server (single port).

use crate::config::{self, Config};
use crate::executor::OutputChunk;
use crate::gate::CommandGate;
use crate::gateway::protocol::{
    ConnectParams, ExecuteParams, HelloOk, OutputPayload, WsEvent, WsRequest, WsResponse,
};
use crate::init;
use crate::result::{ErrorKind, ExecutionResult, Outcome};
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::json;
use subtle::ConstantTimeEq;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

const PROTOCOL_VERSION: u32 = 1;

const SHUTDOWN_EVENT_JSON: &str = r#"{"type":"event","event":"shutdown","payload":{}}"#;

/// Rate-limit entries untouched this long are forgotten.
const LIMITER_IDLE: Duration = Duration::from_secs(600);
const LIMITER_PRUNE_INTERVAL: Duration = Duration::from_secs(60);

/// nginx's "client closed request"; used for cancelled executions.
const CLIENT_CLOSED_REQUEST: u16 = 499;

/// When auth mode is token and a token is configured, returns it for request validation.
fn require_token(config: &Config) -> Option<String> {
    if config.gateway.auth.mode == config::GatewayAuthMode::Token {
        config::resolve_gateway_token(config)
    } else {
        None
    }
}

/// Shared state for the gateway.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<Config>,
    pub gate: Arc<CommandGate>,
    /// When Some, HTTP requests need `Authorization: Bearer <token>` and WS connect needs `auth.token`.
    pub required_token: Option<String>,
    /// Broadcasts events to connected clients (e.g. shutdown).
    pub event_tx: broadcast::Sender<String>,
}

impl GatewayState {
    pub fn new(config: Config, gate: Arc<CommandGate>) -> Self {
        let required_token = require_token(&config);
        let (event_tx, _) = broadcast::channel(16);
        Self {
            config: Arc::new(config),
            gate,
            required_token,
            event_tx,
        }
    }
}

pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/", get(health_http))
        .route("/v1/execute", post(execute_http))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

/// Refuse a non-loopback bind unless token auth is configured with a token.
fn check_bind(config: &Config) -> Result<()> {
    let bind = config.gateway.bind.trim();
    if !config::is_loopback_bind(bind) {
        let token = config::resolve_gateway_token(config);
        if token.is_none() || config.gateway.auth.mode != config::GatewayAuthMode::Token {
            anyhow::bail!(
                "refusing to bind gateway to {} without auth (set gateway.auth.mode to \"token\" and gateway.auth.token or CLIGATE_GATEWAY_TOKEN)",
                bind
            );
        }
    }
    Ok(())
}

pub async fn run_gateway(config: Config, config_path: PathBuf) -> Result<()> {
    init::require_initialized(&config_path)?;
    check_bind(&config)?;

    let gate = Arc::new(CommandGate::from_config(&config, &config_path).await?);
    let bind_addr = format!("{}:{}", config.gateway.bind.trim(), config.gateway.port);
    let state = GatewayState::new(config, gate.clone());
    let event_tx = state.event_tx.clone();

    let pruner = {
        let gate = gate.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(LIMITER_PRUNE_INTERVAL);
            loop {
                tick.tick().await;
                let removed = gate.limiter().prune_idle(LIMITER_IDLE);
                if removed > 0 {
                    log::debug!("pruned {} idle rate limit entries", removed);
                }
            }
        })
    };

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!(
        "gateway listening on {} ({} command(s))",
        bind_addr,
        gate.registry().len()
    );

    let served = axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal(event_tx))
        .await
        .context("gateway server exited");
    pruner.abort();
    gate.shutdown().await;
    let audit = gate.health().audit;
    log::info!(
        "gateway stopped (audit written={} dropped={} failed={})",
        audit.written,
        audit.dropped,
        audit.failed
    );
    served
}

/// Future that completes when the process should shut down (SIGINT or SIGTERM).
/// Broadcasts a shutdown event so WebSocket clients disconnect and their executions are cancelled.
async fn shutdown_signal(event_tx: broadcast::Sender<String>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                log::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutdown signal received, broadcasting shutdown and draining connections");
    let _ = event_tx.send(SHUTDOWN_EVENT_JSON.to_string());
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
}

/// Constant-time token comparison.
fn token_matches(provided: &str, expected: &str) -> bool {
    provided.as_bytes().ct_eq(expected.as_bytes()).into()
}

fn authorized(headers: &HeaderMap, required: Option<&str>) -> bool {
    match required {
        None => true,
        Some(expected) => bearer_token(headers).is_some_and(|t| token_matches(t, expected)),
    }
}

fn status_for(result: &ExecutionResult) -> StatusCode {
    match result.outcome {
        Outcome::Completed => StatusCode::OK,
        Outcome::Failed => StatusCode::UNPROCESSABLE_ENTITY,
        Outcome::TimedOut => StatusCode::GATEWAY_TIMEOUT,
        Outcome::Killed => {
            StatusCode::from_u16(CLIENT_CLOSED_REQUEST).unwrap_or(StatusCode::BAD_REQUEST)
        }
        Outcome::Denied => match result.error.as_ref().map(|e| e.kind()) {
            Some(ErrorKind::RateLimited) => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::FORBIDDEN,
        },
        Outcome::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn command_response(result: &ExecutionResult) -> Response {
    let mut response = (status_for(result), Json(result.to_response())).into_response();
    if let Some(retry_after) = result.error.as_ref().and_then(|e| e.retry_after()) {
        // Whole seconds, rounded up so a client never retries early.
        let secs = retry_after.as_millis().div_ceil(1000).max(1);
        if let Ok(v) = HeaderValue::from_str(&secs.to_string()) {
            response.headers_mut().insert(header::RETRY_AFTER, v);
        }
    }
    response
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

/// GET / returns health JSON (for probes). 503 while audit writes are failing.
async fn health_http(State(state): State<GatewayState>) -> Response {
    let health = state.gate.health();
    let status = if health.audit.degraded {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    let body = json!({
        "runtime": "running",
        "protocol": PROTOCOL_VERSION,
        "port": state.config.gateway.port,
        "commands": health.commands,
        "internalErrors": health.internal_errors,
        "audit": health.audit,
    });
    (status, Json(body)).into_response()
}

/// POST /v1/execute runs one command. If the client goes away mid-request the execution is
/// cancelled; it still finishes in the background so its audit record is written.
async fn execute_http(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !authorized(&headers, state.required_token.as_deref()) {
        return error_response(StatusCode::UNAUTHORIZED, "unauthorized: gateway token missing or mismatched");
    }
    let params: ExecuteParams = match serde_json::from_slice(&body) {
        Ok(p) => p,
        Err(e) => {
            return error_response(StatusCode::BAD_REQUEST, &format!("invalid execute body: {}", e))
        }
    };
    let req = params.into_request();
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();
    let gate = state.gate.clone();
    let task = tokio::spawn(async move { gate.execute(req, &cancel, None).await });
    let joined = task.await;
    guard.disarm();
    match joined {
        Ok(result) => command_response(&result),
        Err(e) => {
            log::error!("execute task failed: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

/// GET /ws upgrades to WebSocket. First frame must be connect; we reply with hello-ok.
async fn ws_handler(State(state): State<GatewayState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn send_frame<T: Serialize>(out: &mpsc::Sender<String>, frame: &T) {
    if let Ok(text) = serde_json::to_string(frame) {
        let _ = out.send(text).await;
    }
}

async fn handle_socket(socket: WebSocket, state: GatewayState) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<String>(64);
    let writer = tokio::spawn(async move {
        while let Some(text) = out_rx.recv().await {
            if ws_tx.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    let connection = CancellationToken::new();
    let mut running: JoinSet<()> = JoinSet::new();
    let mut event_rx = state.event_tx.subscribe();
    let mut connected = false;

    loop {
        tokio::select! {
            biased;

            event = event_rx.recv() => {
                match event {
                    Ok(text) => {
                        let is_shutdown = text == SHUTDOWN_EVENT_JSON;
                        let _ = out_tx.send(text).await;
                        if is_shutdown {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::debug!("ws client lagged {} broadcast messages", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            Some(done) = running.join_next(), if !running.is_empty() => {
                if let Err(e) = done {
                    log::error!("ws execute task failed: {}", e);
                }
            }
            msg = ws_rx.next() => {
                let Some(Ok(msg)) = msg else { break };
                let Message::Text(text) = msg else { continue };
                let Ok(req): Result<WsRequest, _> = serde_json::from_str(&text) else { continue };

                if req.typ != "req" {
                    continue;
                }

                match req.method.as_str() {
                    "connect" => {
                        let params: ConnectParams = match serde_json::from_value(req.params.clone()) {
                            Ok(p) => p,
                            Err(_) => {
                                send_frame(&out_tx, &WsResponse::err(&req.id, "invalid connect params")).await;
                                continue;
                            }
                        };
                        if let Some(ref required) = state.required_token {
                            let provided = params.auth.token.as_deref().unwrap_or("").trim();
                            if provided.is_empty() {
                                send_frame(
                                    &out_tx,
                                    &WsResponse::err(
                                        &req.id,
                                        "unauthorized: gateway token missing (set CLIGATE_GATEWAY_TOKEN or gateway.auth.token)",
                                    ),
                                )
                                .await;
                                continue;
                            }
                            if !token_matches(provided, required) {
                                send_frame(&out_tx, &WsResponse::err(&req.id, "unauthorized: gateway token mismatch")).await;
                                continue;
                            }
                        }
                        let protocol = params.max_protocol.unwrap_or(PROTOCOL_VERSION).min(PROTOCOL_VERSION);
                        let hello = HelloOk {
                            typ: "hello-ok".to_string(),
                            protocol,
                            commands: state.gate.registry().names().map(String::from).collect(),
                        };
                        let payload = serde_json::to_value(&hello).unwrap_or_else(|_| json!({}));
                        send_frame(&out_tx, &WsResponse::ok(&req.id, payload)).await;
                        connected = true;
                    }
                    "health" => {
                        let health = state.gate.health();
                        let payload = json!({
                            "runtime": "running",
                            "protocol": PROTOCOL_VERSION,
                            "audit": health.audit,
                        });
                        send_frame(&out_tx, &WsResponse::ok(&req.id, payload)).await;
                    }
                    "execute" => {
                        if !connected {
                            send_frame(&out_tx, &WsResponse::err(&req.id, "connect first")).await;
                            continue;
                        }
                        let params: ExecuteParams = match serde_json::from_value(req.params.clone()) {
                            Ok(p) => p,
                            Err(e) => {
                                send_frame(&out_tx, &WsResponse::err(&req.id, format!("invalid execute params: {}", e))).await;
                                continue;
                            }
                        };
                        running.spawn(run_ws_execute(
                            state.gate.clone(),
                            params,
                            req.id,
                            connection.child_token(),
                            out_tx.clone(),
                        ));
                    }
                    _ => {
                        send_frame(&out_tx, &WsResponse::err(&req.id, format!("unknown method: {}", req.method))).await;
                    }
                }
            }
        }
    }

    // Socket gone or shutting down: cancel what is still running and let it be audited.
    connection.cancel();
    while let Some(done) = running.join_next().await {
        if let Err(e) = done {
            log::error!("ws execute task failed: {}", e);
        }
    }
    drop(out_tx);
    let _ = writer.await;
    if !connected {
        log::debug!("ws client disconnected before sending connect");
    }
}

async fn run_ws_execute(
    gate: Arc<CommandGate>,
    params: ExecuteParams,
    frame_id: String,
    cancel: CancellationToken,
    out: mpsc::Sender<String>,
) {
    let req = params.into_request();
    let request_id = req.id().to_string();
    let (chunk_tx, mut chunk_rx) = mpsc::channel::<OutputChunk>(32);
    let forward = {
        let out = out.clone();
        tokio::spawn(async move {
            while let Some(chunk) = chunk_rx.recv().await {
                let payload = serde_json::to_value(OutputPayload::new(&request_id, &chunk))
                    .unwrap_or_else(|_| json!({}));
                send_frame(&out, &WsEvent::new("exec.output", payload)).await;
            }
        })
    };
    let result = gate.execute(req, &cancel, Some(chunk_tx)).await;
    let _ = forward.await;
    let response = result.to_response();
    let payload = serde_json::to_value(&response).unwrap_or_else(|_| json!({}));
    send_frame(&out, &WsResponse::command(frame_id, response.ok, payload)).await;
}
