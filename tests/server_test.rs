//! End-to-end tests for the session server: HTTP health on the shared port,
//! the local-token handshake, and the MCP method surface over WebSocket.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use researchd::config::DaemonConfig;
use researchd::AppContext;

/// Find a free local port by binding to port 0.
fn find_free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Build an AppContext on a random port and spawn the server.
async fn start_server(dir: &TempDir, port: u16, auth_token: &str) -> Arc<AppContext> {
    let config = DaemonConfig::new(
        Some(port),
        Some(dir.path().to_path_buf()),
        Some("error".to_string()),
        None,
    );
    let ctx = Arc::new(
        AppContext::build(config, auth_token.to_string())
            .await
            .unwrap(),
    );

    let ctx_clone = ctx.clone();
    tokio::spawn(async move {
        let _ = researchd::ipc::run(ctx_clone).await;
    });
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    ctx
}

type Ws = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

async fn ws_connect(port: u16) -> Ws {
    let (ws, _) = connect_async(format!("ws://127.0.0.1:{port}"))
        .await
        .unwrap();
    ws
}

/// Send one JSON-RPC request and read frames until the matching response
/// arrives, skipping any interleaved broadcast notifications.
async fn rpc(ws: &mut Ws, id: u64, method: &str, params: Value) -> Value {
    let frame = json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
        "params": params,
    });
    ws.send(Message::Text(frame.to_string())).await.unwrap();

    loop {
        let msg = tokio::time::timeout(std::time::Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for response")
            .expect("connection closed")
            .unwrap();
        if let Message::Text(text) = msg {
            let value: Value = serde_json::from_str(&text).unwrap();
            if value["id"] == json!(id) {
                return value;
            }
        }
    }
}

#[tokio::test]
async fn health_endpoint_reports_status_on_the_ws_port() {
    let dir = TempDir::new().unwrap();
    let port = find_free_port();
    start_server(&dir, port, "").await;

    let mut stream = TcpStream::connect(format!("127.0.0.1:{port}"))
        .await
        .unwrap();
    stream
        .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();

    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await.unwrap();
    let response = String::from_utf8_lossy(&buf);

    let first_line = response.lines().next().unwrap_or("");
    assert!(first_line.contains("200"), "expected HTTP 200, got: {first_line}");

    let body_start = response.find("\r\n\r\n").map(|i| i + 4).expect("no body");
    let body: Value = serde_json::from_str(&response[body_start..]).unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"].as_str().unwrap(), env!("CARGO_PKG_VERSION"));
    assert_eq!(body["port"].as_u64().unwrap(), u64::from(port));
    assert!(body.get("auth_token").is_none());
}

#[tokio::test]
async fn handshake_rejects_a_wrong_token() {
    let dir = TempDir::new().unwrap();
    let port = find_free_port();
    start_server(&dir, port, "secret-token").await;

    let mut ws = ws_connect(port).await;
    let resp = rpc(
        &mut ws,
        1,
        "daemon.auth",
        json!({"token": "not-the-token"}),
    )
    .await;
    assert_eq!(resp["error"]["code"], -32004);
}

#[tokio::test]
async fn mcp_surface_over_websocket() {
    let dir = TempDir::new().unwrap();
    let port = find_free_port();
    let ctx = start_server(&dir, port, "secret-token").await;

    let mut ws = ws_connect(port).await;

    // Local-token handshake must come first.
    let resp = rpc(&mut ws, 1, "daemon.auth", json!({"token": "secret-token"})).await;
    assert_eq!(resp["result"]["authenticated"], true);

    // MCP initialize negotiates the protocol and names the server.
    let resp = rpc(
        &mut ws,
        2,
        "initialize",
        json!({"protocolVersion": "2024-11-05", "capabilities": {}}),
    )
    .await;
    assert_eq!(resp["result"]["protocolVersion"], "2024-11-05");
    assert_eq!(resp["result"]["serverInfo"]["name"], "researchd");

    // The tool catalogue carries the three research tools.
    let resp = rpc(&mut ws, 3, "tools/list", json!({})).await;
    let tools = resp["result"]["tools"].as_array().unwrap();
    let names: Vec<&str> = tools.iter().map(|t| t["name"].as_str().unwrap()).collect();
    assert_eq!(
        names,
        ["start_deep_research", "check_deep_research", "list_research_tasks"]
    );

    // Tool calls before research.authenticate are refused — there is no
    // ambient credential to fall back on.
    let resp = rpc(
        &mut ws,
        4,
        "tools/call",
        json!({"name": "list_research_tasks", "arguments": {}}),
    )
    .await;
    assert_eq!(resp["error"]["code"], -32004);

    // Register a credential for this session, then the same call succeeds.
    let resp = rpc(
        &mut ws,
        5,
        "research.authenticate",
        json!({"api_key": "sk-test-key"}),
    )
    .await;
    assert_eq!(resp["result"]["authenticated"], true);
    let owner_id = resp["result"]["owner_id"].as_str().unwrap().to_string();
    assert_eq!(owner_id.len(), 64);

    // The credential lands sealed in storage, never in the clear.
    let stored = ctx.storage.get_credential(&owner_id).await.unwrap().unwrap();
    assert_ne!(stored.sealed_credential, "sk-test-key");
    assert!(!stored.sealed_credential.contains("sk-test-key"));

    let resp = rpc(
        &mut ws,
        6,
        "tools/call",
        json!({"name": "list_research_tasks", "arguments": {}}),
    )
    .await;
    let text = resp["result"]["content"][0]["text"].as_str().unwrap();
    let listing: Value = serde_json::from_str(text).unwrap();
    assert_eq!(listing["task_count"], 0);
    assert_eq!(listing["tasks"].as_array().unwrap().len(), 0);

    // Unknown methods get the JSON-RPC method-not-found code.
    let resp = rpc(&mut ws, 7, "no.such.method", json!({})).await;
    assert_eq!(resp["error"]["code"], -32601);

    // daemon.status reflects the authenticated session.
    let resp = rpc(&mut ws, 8, "daemon.status", json!({})).await;
    assert_eq!(resp["result"]["authenticated"], true);
    assert_eq!(resp["result"]["port"].as_u64().unwrap(), u64::from(port));
    assert_eq!(resp["result"]["daemon_id"], ctx.daemon_id);
}

#[tokio::test]
async fn sessions_do_not_share_credentials() {
    let dir = TempDir::new().unwrap();
    let port = find_free_port();
    start_server(&dir, port, "").await;

    // First session authenticates; a second, fresh session must not
    // inherit that credential.
    let mut first = ws_connect(port).await;
    let resp = rpc(
        &mut first,
        1,
        "research.authenticate",
        json!({"api_key": "sk-first"}),
    )
    .await;
    assert_eq!(resp["result"]["authenticated"], true);

    let mut second = ws_connect(port).await;
    let resp = rpc(
        &mut second,
        1,
        "tools/call",
        json!({"name": "list_research_tasks", "arguments": {}}),
    )
    .await;
    assert_eq!(resp["error"]["code"], -32004);
}
