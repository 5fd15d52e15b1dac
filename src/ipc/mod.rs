pub mod auth;
pub mod event;

use crate::identity::AuthedUser;
use crate::mcp;
use crate::AppContext;
use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

// ─── JSON-RPC 2.0 types ──────────────────────────────────────────────────────

#[derive(Deserialize)]
struct RpcRequest {
    jsonrpc: String,
    id: Option<Value>,
    method: String,
    params: Option<Value>,
}

#[derive(Serialize)]
struct RpcResponse {
    jsonrpc: &'static str,
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<mcp::McpError>,
}

// ─── Server ──────────────────────────────────────────────────────────────────

pub async fn run(ctx: Arc<AppContext>) -> Result<()> {
    let addr = format!("{}:{}", ctx.config.bind_address, ctx.config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "session server listening (WebSocket + HTTP health on same port)");

    ctx.broadcaster.broadcast(
        "daemon.ready",
        serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "port": ctx.config.port
        }),
    );

    // Graceful shutdown: resolve on SIGTERM (Unix) or Ctrl-C (all platforms).
    let shutdown = make_shutdown_future();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown => {
                info!("shutdown signal received — stopping session server");
                break;
            }

            conn = listener.accept() => {
                let (stream, peer) = match conn {
                    Ok(c) => c,
                    Err(e) => {
                        error!(err = %e, "accept error");
                        continue;
                    }
                };
                debug!(peer = %peer, "new connection");
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, ctx).await {
                        warn!(peer = %peer, err = %e, "connection error");
                    }
                });
            }
        }
    }

    info!("session server stopped");
    Ok(())
}

/// Respond to an HTTP `GET /health` request with a JSON status document.
///
/// The daemon shares its port for both WebSocket (JSON-RPC) and a plain
/// HTTP health endpoint so clients can check liveness without a WS library.
async fn handle_health_check(mut stream: tokio::net::TcpStream, ctx: &AppContext) -> Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    // Consume the request — any GET /health is fine.
    let mut req_buf = vec![0u8; 2048];
    let _ = stream.read(&mut req_buf).await;

    let uptime_secs = ctx.started_at.elapsed().as_secs();
    let body = serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime": uptime_secs,
        "port": ctx.config.port,
    });
    let body_str = body.to_string();
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body_str.len(),
        body_str
    );
    stream.write_all(response.as_bytes()).await?;
    Ok(())
}

/// Returns a future that resolves when a shutdown signal is received.
async fn make_shutdown_future() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}

async fn handle_connection(stream: tokio::net::TcpStream, ctx: Arc<AppContext>) -> Result<()> {
    // Peek at the first bytes to distinguish HTTP health checks from
    // WebSocket upgrades — both share the port. All other GET requests
    // (including WS upgrades) fall through to the handshake as normal.
    let mut peek_buf = [0u8; 12];
    let n = stream.peek(&mut peek_buf).await.unwrap_or(0);
    if n >= 11 && &peek_buf[..11] == b"GET /health" {
        return handle_health_check(stream, &ctx).await;
    }

    let ws = accept_async(stream).await?;
    let (mut sink, mut stream) = ws.split();

    // ── Auth challenge ───────────────────────────────────────────────────────
    // The first message from every client must be a `daemon.auth` RPC call
    // carrying the local token. This prevents other local processes from
    // connecting to the daemon and issuing arbitrary commands.
    if !ctx.auth_token.is_empty() {
        let first = tokio::time::timeout(std::time::Duration::from_secs(10), stream.next()).await;

        let text = match first {
            Ok(Some(Ok(Message::Text(t)))) => t,
            // Timeout, connection closed, or non-text frame — reject silently.
            _ => return Ok(()),
        };

        let req: RpcRequest = match serde_json::from_str(&text) {
            Ok(r) => r,
            Err(_) => {
                let _ = sink
                    .send(Message::Text(error_response(
                        Value::Null,
                        mcp::MCP_PARSE_ERROR,
                        "Parse error",
                    )))
                    .await;
                return Ok(());
            }
        };

        let id = req.id.clone().unwrap_or(Value::Null);

        if req.method != "daemon.auth" {
            let _ = sink
                .send(Message::Text(error_response(
                    id,
                    mcp::MCP_UNAUTHORIZED,
                    "Unauthorized — send daemon.auth first",
                )))
                .await;
            return Ok(());
        }

        let provided = req
            .params
            .as_ref()
            .and_then(|p| p.get("token"))
            .and_then(Value::as_str)
            .unwrap_or_default();

        if provided != ctx.auth_token {
            let _ = sink
                .send(Message::Text(error_response(
                    id,
                    mcp::MCP_UNAUTHORIZED,
                    "Unauthorized — invalid token",
                )))
                .await;
            return Ok(());
        }

        let resp = serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": { "authenticated": true }
        });
        let _ = sink.send(Message::Text(resp.to_string())).await;
        debug!("client authenticated");
    }

    let mut broadcast_rx = ctx.broadcaster.subscribe();

    // Research credential registered on this session via
    // `research.authenticate`. Connection-scoped — never cached globally.
    let mut session_user: Option<AuthedUser> = None;

    loop {
        tokio::select! {
            // Incoming message from client
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(response) = dispatch_text(&text, &ctx, &mut session_user).await {
                            if let Err(e) = sink.send(Message::Text(response)).await {
                                warn!(err = %e, "send error");
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(err = %e, "ws error");
                        break;
                    }
                    _ => {}
                }
            }
            // Outgoing broadcast event
            event = broadcast_rx.recv() => {
                match event {
                    Ok(json) => {
                        if let Err(e) = sink.send(Message::Text(json)).await {
                            warn!(err = %e, "broadcast send error");
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "broadcast lagged");
                    }
                }
            }
        }
    }
    Ok(())
}

/// Parse and dispatch one frame. Returns `None` for notifications, which
/// get no response per JSON-RPC 2.0.
pub(crate) async fn dispatch_text(
    text: &str,
    ctx: &Arc<AppContext>,
    session_user: &mut Option<AuthedUser>,
) -> Option<String> {
    let req: RpcRequest = match serde_json::from_str(text) {
        Ok(r) => r,
        Err(_) => {
            return Some(error_response(Value::Null, mcp::MCP_PARSE_ERROR, "Parse error"));
        }
    };

    if req.jsonrpc != "2.0" {
        return Some(error_response(
            req.id.unwrap_or(Value::Null),
            mcp::MCP_INVALID_REQUEST,
            "Invalid Request",
        ));
    }

    // Notifications carry no id and expect no response.
    let is_notification = req.id.is_none();
    let id = req.id.unwrap_or(Value::Null);
    let params = req.params.unwrap_or(Value::Null);

    debug!(method = %req.method, "rpc dispatch");

    let result = dispatch(&req.method, params, ctx, session_user).await;

    if is_notification {
        return None;
    }

    match result {
        Ok(value) => {
            let resp = RpcResponse {
                jsonrpc: "2.0",
                id,
                result: Some(value),
                error: None,
            };
            Some(serde_json::to_string(&resp).unwrap_or_default())
        }
        Err(e) => {
            let err = classify_error(&e);
            Some(error_response(id, err.code, &err.message))
        }
    }
}

async fn dispatch(
    method: &str,
    params: Value,
    ctx: &Arc<AppContext>,
    session_user: &mut Option<AuthedUser>,
) -> anyhow::Result<Value> {
    match method {
        "initialize" => Ok(mcp::handle_initialize(&params)),
        "notifications/initialized" => Ok(Value::Null),
        "ping" => Ok(mcp::handle_ping()),
        "tools/list" => Ok(mcp::handle_tools_list()),
        "tools/call" => {
            let tool_name = params
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| anyhow::anyhow!("MCP_INVALID_PARAMS: missing tool 'name'"))?;
            let arguments = params
                .get("arguments")
                .cloned()
                .unwrap_or_else(|| Value::Object(Default::default()));
            let dispatcher = mcp::McpDispatcher::new(ctx.clone());
            dispatcher
                .dispatch(tool_name, arguments, session_user.as_ref())
                .await
        }
        "research.authenticate" => authenticate(params, ctx, session_user).await,
        "daemon.status" => {
            let uptime = ctx.started_at.elapsed().as_secs();
            Ok(serde_json::json!({
                "version": env!("CARGO_PKG_VERSION"),
                "daemon_id": ctx.daemon_id,
                "uptime": uptime,
                "port": ctx.config.port,
                "authenticated": session_user.is_some(),
            }))
        }
        _ => Err(anyhow::anyhow!("METHOD_NOT_FOUND:{method}")),
    }
}

/// Register the research backend credential on this session.
///
/// The credential is resolved to an owner identity (hex SHA-256), sealed
/// into the credential vault, and held as connection state so every
/// subsequent `tools/call` carries an explicit `(owner_id, credential)`.
async fn authenticate(
    params: Value,
    ctx: &Arc<AppContext>,
    session_user: &mut Option<AuthedUser>,
) -> anyhow::Result<Value> {
    let api_key = params
        .get("api_key")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .ok_or_else(|| anyhow::anyhow!("MCP_INVALID_PARAMS: missing or empty 'api_key'"))?;

    let user = AuthedUser::from_credential(api_key);

    let sealed = ctx.vault.seal(&user.credential)?;
    ctx.storage
        .upsert_credential(user.owner_id.as_str(), &sealed)
        .await?;

    info!(owner = %user.owner_id, "research credential registered");
    let owner_id = user.owner_id.to_string();
    *session_user = Some(user);

    Ok(serde_json::json!({
        "authenticated": true,
        "owner_id": owner_id,
    }))
}

fn classify_error(e: &anyhow::Error) -> mcp::McpError {
    let msg = e.to_string();
    if msg.starts_with("METHOD_NOT_FOUND:") {
        return mcp::McpError::new(mcp::MCP_METHOD_NOT_FOUND, "Method not found");
    }
    if msg.starts_with("MCP_") {
        return mcp::McpDispatcher::classify_error(e);
    }
    if msg.contains("missing field") || msg.contains("invalid type") {
        return mcp::McpError::new(mcp::MCP_INVALID_PARAMS, format!("Invalid params: {msg}"));
    }
    error!(err = %e, "internal error");
    mcp::McpError::new(mcp::MCP_INTERNAL_ERROR, "Internal error")
}

fn error_response(id: Value, code: i32, message: &str) -> String {
    let resp = RpcResponse {
        jsonrpc: "2.0",
        id,
        result: None,
        error: Some(mcp::McpError::new(code, message)),
    };
    serde_json::to_string(&resp).unwrap_or_default()
}
