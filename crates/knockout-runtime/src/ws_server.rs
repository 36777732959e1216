use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use knockout_core::{CredentialVerifier, Identity, ServerEvent};

use crate::arena::Arena;
use crate::identity::credential_from_request;
use crate::protocol::{handle_request, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, PARSE_ERROR};

// ---------------------------------------------------------------------------
// Identity gate
// ---------------------------------------------------------------------------

fn unauthorized(reason: &str) -> ErrorResponse {
    let mut resp = ErrorResponse::new(Some(reason.to_string()));
    *resp.status_mut() = http::StatusCode::UNAUTHORIZED;
    resp
}

/// Verify the upgrade request's credential. Failure answers HTTP 401
/// before any session logic runs.
fn authenticate(
    verifier: &dyn CredentialVerifier,
    req: &Request,
    resp: Response,
) -> Result<(Identity, Response), ErrorResponse> {
    let Some(credential) = credential_from_request(req.headers(), req.uri()) else {
        tracing::debug!("ws: upgrade without credential rejected");
        return Err(unauthorized("missing credential"));
    };
    match verifier.verify(&credential) {
        Ok(identity) => Ok((identity, resp)),
        Err(e) => {
            tracing::warn!(error = %e, "ws: authentication failed");
            Err(unauthorized("invalid credential"))
        }
    }
}

// ---------------------------------------------------------------------------
// WsServer
// ---------------------------------------------------------------------------

/// Default maximum number of concurrent WebSocket connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 64;

/// WebSocket server carrying JSON-RPC 2.0 in text frames.
pub struct WsServer {
    addr: SocketAddr,
    arena: Arc<Arena>,
    verifier: Arc<dyn CredentialVerifier>,
    cancel: CancellationToken,
    max_connections: usize,
}

impl WsServer {
    pub fn new(addr: SocketAddr, arena: Arc<Arena>, verifier: Arc<dyn CredentialVerifier>) -> Self {
        let cancel = arena.cancel_token();
        Self {
            addr,
            arena,
            verifier,
            cancel,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }

    /// Set the maximum number of concurrent WebSocket connections.
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Run the WebSocket server: bind TCP, accept connections, and spawn
    /// per-client handlers until the cancellation token fires.
    pub async fn run(&self) -> std::io::Result<()> {
        let (listener, _) = self.bind().await?;
        self.serve(listener).await
    }

    /// Bind to the configured address and return the actual local address.
    /// Useful when binding to port 0 to get an OS-assigned ephemeral port.
    pub async fn bind(&self) -> std::io::Result<(TcpListener, SocketAddr)> {
        let listener = TcpListener::bind(self.addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(addr = %local_addr, max_connections = self.max_connections, "ws server listening");
        Ok((listener, local_addr))
    }

    /// Run the accept loop on a pre-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        let semaphore = Arc::new(Semaphore::new(self.max_connections));

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let permit = match semaphore.clone().try_acquire_owned() {
                                Ok(permit) => permit,
                                Err(_) => {
                                    tracing::warn!(
                                        peer = %peer,
                                        max = self.max_connections,
                                        "ws: connection limit reached, rejecting"
                                    );
                                    drop(stream);
                                    continue;
                                }
                            };
                            tracing::debug!(peer = %peer, "ws: TCP connection accepted");
                            let arena = Arc::clone(&self.arena);
                            let verifier = Arc::clone(&self.verifier);
                            let cancel = self.cancel.clone();
                            tokio::spawn(async move {
                                let _permit = permit;
                                if let Err(e) = accept_client(stream, arena, verifier, cancel).await {
                                    tracing::debug!(peer = %peer, error = %e, "ws client handler finished with error");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "ws: TCP accept failed");
                        }
                    }
                }
                _ = self.cancel.cancelled() => {
                    tracing::info!("ws server: cancellation requested, shutting down");
                    break;
                }
            }
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Per-client handler
// ---------------------------------------------------------------------------

type BoxError = Box<dyn std::error::Error + Send + Sync>;

async fn accept_client(
    stream: TcpStream,
    arena: Arc<Arena>,
    verifier: Arc<dyn CredentialVerifier>,
    cancel: CancellationToken,
) -> Result<(), BoxError> {
    let mut verified: Option<Identity> = None;
    let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        let (identity, resp) = authenticate(verifier.as_ref(), req, resp)?;
        verified = Some(identity);
        Ok(resp)
    };
    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, callback).await?;
    let Some(identity) = verified else {
        return Err("handshake completed without identity".into());
    };

    let client = arena.connect(&identity).await;
    let connection = client.connection;
    let result = handle_ws_client(ws_stream, &arena, &identity, client.events, cancel).await;
    arena.disconnect(connection).await;
    result
}

async fn handle_ws_client(
    ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
    arena: &Arc<Arena>,
    identity: &Identity,
    mut events: tokio::sync::mpsc::Receiver<ServerEvent>,
    cancel: CancellationToken,
) -> Result<(), BoxError> {
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    tracing::debug!(identity = %identity.id, "ws client connected");

    loop {
        tokio::select! {
            // --- incoming WebSocket message ---
            msg = ws_rx.next() => {
                let msg = match msg {
                    Some(Ok(m)) => m,
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "ws read error, dropping client");
                        return Err(e.into());
                    }
                    None => {
                        tracing::debug!("ws client disconnected (stream ended)");
                        return Ok(());
                    }
                };

                let text = match msg {
                    Message::Text(t) => t,
                    Message::Close(_) => {
                        tracing::debug!("ws client sent close frame");
                        return Ok(());
                    }
                    Message::Ping(data) => {
                        ws_tx.send(Message::Pong(data)).await?;
                        continue;
                    }
                    _ => continue,
                };

                let req: JsonRpcRequest = match serde_json::from_str(&text) {
                    Ok(r) => r,
                    Err(e) => {
                        let resp = JsonRpcResponse::err(None, PARSE_ERROR, format!("parse error: {e}"));
                        ws_tx.send(Message::Text(serde_json::to_string(&resp)?)).await?;
                        continue;
                    }
                };

                if let Some(resp) = handle_request(arena, identity, req).await {
                    ws_tx.send(Message::Text(serde_json::to_string(&resp)?)).await?;
                }
            }

            // --- server push ---
            event = events.recv() => {
                let Some(event) = event else {
                    tracing::debug!(identity = %identity.id, "event queue closed, closing client");
                    let _ = ws_tx.send(Message::Close(None)).await;
                    return Ok(());
                };
                let superseded = matches!(event, ServerEvent::Superseded);
                let notif = JsonRpcNotification::from_event(&event)?;
                ws_tx.send(Message::Text(serde_json::to_string(&notif)?)).await?;
                if superseded {
                    tracing::debug!(identity = %identity.id, "connection superseded, closing");
                    let _ = ws_tx.send(Message::Close(None)).await;
                    return Ok(());
                }
            }

            _ = cancel.cancelled() => {
                tracing::debug!("ws client handler: cancellation requested");
                let _ = ws_tx.send(Message::Close(None)).await;
                return Ok(());
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::TokenFileVerifier;
    use knockout_core::GameConfig;
    use knockout_store::{SqliteQuestionBank, SqliteStore};
    use std::time::Duration;

    type Client = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>;

    const CREDENTIALS: &str = r#"{
        "tok-a": { "id": "u-a", "name": "Ada" },
        "tok-b": { "id": "u-b", "name": "Bea" }
    }"#;

    struct TestServer {
        addr: SocketAddr,
        arena: Arc<Arena>,
        handle: Option<tokio::task::JoinHandle<std::io::Result<()>>>,
    }

    async fn start_test_server(max_connections: Option<usize>) -> TestServer {
        let verifier = Arc::new(TokenFileVerifier::from_json(CREDENTIALS).unwrap());
        let config = GameConfig {
            min_players: 2,
            max_players: 2,
            ..GameConfig::default()
        };
        let arena = Arena::new(
            config,
            Box::new(SqliteStore::open_in_memory().unwrap()),
            Arc::new(SqliteQuestionBank::open_in_memory().unwrap()),
            verifier.clone(),
        );
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let mut server = WsServer::new(addr, Arc::clone(&arena), verifier);
        if let Some(max) = max_connections {
            server = server.with_max_connections(max);
        }
        let (listener, local_addr) = server.bind().await.unwrap();
        let handle = tokio::spawn(async move { server.serve(listener).await });
        TestServer {
            addr: local_addr,
            arena,
            handle: Some(handle),
        }
    }

    impl TestServer {
        fn url(&self, token: &str) -> String {
            format!("ws://127.0.0.1:{}/?token={token}", self.addr.port())
        }

        async fn connect(&self, token: &str) -> Client {
            let (ws, _) = tokio_tungstenite::connect_async(self.url(token)).await.unwrap();
            ws
        }
    }

    impl Drop for TestServer {
        fn drop(&mut self) {
            self.arena.shutdown();
        }
    }

    async fn recv_json(ws: &mut Client) -> serde_json::Value {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timeout waiting for frame")
            .expect("stream ended")
            .expect("read error");
        let Message::Text(text) = msg else {
            panic!("expected text frame, got {:?}", msg);
        };
        serde_json::from_str(&text).unwrap()
    }

    /// Next frame that is a response (has an `id`), skipping pushes.
    async fn recv_response(ws: &mut Client) -> serde_json::Value {
        loop {
            let v = recv_json(ws).await;
            if v.get("id").is_some() {
                return v;
            }
        }
    }

    async fn send_rpc(ws: &mut Client, id: u64, method: &str, params: serde_json::Value) -> serde_json::Value {
        let req = serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        ws.send(Message::Text(req.to_string())).await.unwrap();
        recv_response(ws).await
    }

    #[tokio::test]
    async fn missing_credential_gets_401() {
        let server = start_test_server(None).await;
        let url = format!("ws://127.0.0.1:{}/", server.addr.port());
        let err = tokio_tungstenite::connect_async(url).await.unwrap_err();
        match err {
            tokio_tungstenite::tungstenite::Error::Http(resp) => {
                assert_eq!(resp.status(), http::StatusCode::UNAUTHORIZED);
            }
            other => panic!("expected HTTP error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn invalid_credential_gets_401() {
        let server = start_test_server(None).await;
        let err = tokio_tungstenite::connect_async(server.url("nope")).await.unwrap_err();
        assert!(matches!(
            err,
            tokio_tungstenite::tungstenite::Error::Http(ref resp) if resp.status() == http::StatusCode::UNAUTHORIZED
        ));
    }

    #[tokio::test]
    async fn bearer_header_is_accepted() {
        use tokio_tungstenite::tungstenite::client::IntoClientRequest;

        let server = start_test_server(None).await;
        let mut req = format!("ws://127.0.0.1:{}/", server.addr.port())
            .into_client_request()
            .unwrap();
        req.headers_mut()
            .insert("Authorization", "Bearer tok-a".parse().unwrap());
        let (mut ws, _) = tokio_tungstenite::connect_async(req).await.unwrap();
        let resp = send_rpc(&mut ws, 1, "leave_waiting_room", serde_json::json!({})).await;
        assert_eq!(resp["result"]["left"], 0);
    }

    #[tokio::test]
    async fn join_returns_membership_and_pushes_update() {
        let server = start_test_server(None).await;
        let mut ws = server.connect("tok-a").await;

        let resp = send_rpc(&mut ws, 1, "join_waiting_room", serde_json::json!({})).await;
        assert_eq!(resp["id"], 1);
        assert_eq!(resp["result"]["count"], 1);
        assert_eq!(resp["result"]["min"], 2);
        assert_eq!(resp["result"]["joinCode"].as_str().unwrap().len(), 6);

        // The membership push may arrive before or after the response.
        let resp2 = send_rpc(&mut ws, 2, "leave_waiting_room", serde_json::json!({})).await;
        assert_eq!(resp2["result"]["left"], 1);
    }

    #[tokio::test]
    async fn repeat_join_is_idempotent() {
        let server = start_test_server(None).await;
        let mut a = server.connect("tok-a").await;
        let mut b = server.connect("tok-b").await;
        send_rpc(&mut a, 1, "join_waiting_room", serde_json::json!({})).await;
        let resp = send_rpc(&mut b, 1, "join_waiting_room", serde_json::json!({})).await;
        assert_eq!(resp["result"]["count"], 2);
        let again = send_rpc(&mut b, 2, "join_waiting_room", serde_json::json!({})).await;
        assert_eq!(again["result"]["count"], 2);
    }

    #[tokio::test]
    async fn unknown_method_returns_error() {
        let server = start_test_server(None).await;
        let mut ws = server.connect("tok-a").await;
        let resp = send_rpc(&mut ws, 7, "steal_points", serde_json::json!({})).await;
        assert_eq!(resp["error"]["code"], -32601);
    }

    #[tokio::test]
    async fn invalid_json_returns_parse_error() {
        let server = start_test_server(None).await;
        let mut ws = server.connect("tok-a").await;
        ws.send(Message::Text("{not json".into())).await.unwrap();
        let resp = recv_json(&mut ws).await;
        assert_eq!(resp["error"]["code"], -32700);
    }

    #[tokio::test]
    async fn malformed_answer_is_invalid_params() {
        let server = start_test_server(None).await;
        let mut ws = server.connect("tok-a").await;
        let resp = send_rpc(&mut ws, 3, "submit_answer", serde_json::json!({ "sessionId": 1 })).await;
        assert_eq!(resp["error"]["code"], -32602);

        let resp = send_rpc(
            &mut ws,
            4,
            "submit_answer",
            serde_json::json!({ "sessionId": 99, "questionId": "q", "chosenOptionIndex": 0 }),
        )
        .await;
        assert_eq!(resp["result"]["received"], true);
    }

    #[tokio::test]
    async fn newer_connection_supersedes_older() {
        let server = start_test_server(None).await;
        let mut old = server.connect("tok-a").await;
        // Make sure the first connection is registered before the second.
        send_rpc(&mut old, 1, "leave_waiting_room", serde_json::json!({})).await;

        let _new = server.connect("tok-a").await;
        let push = recv_json(&mut old).await;
        assert_eq!(push["method"], "superseded");
        let next = tokio::time::timeout(Duration::from_secs(5), old.next()).await.unwrap();
        assert!(matches!(next, Some(Ok(Message::Close(_))) | None | Some(Err(_))));
    }

    #[tokio::test]
    async fn connection_limit_enforced() {
        let server = start_test_server(Some(1)).await;
        let _a = server.connect("tok-a").await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let result = tokio::time::timeout(Duration::from_secs(2), async {
            tokio_tungstenite::connect_async(server.url("tok-b")).await
        })
        .await;
        match result {
            Ok(Ok((mut ws, _))) => {
                let send_result = ws
                    .send(Message::Text(r#"{"jsonrpc":"2.0","id":1,"method":"leave_waiting_room"}"#.into()))
                    .await;
                let next = ws.next().await;
                assert!(
                    send_result.is_err() || next.is_none() || next.unwrap().is_err(),
                    "second connection should not be fully functional"
                );
            }
            Ok(Err(_)) => {}
            Err(_) => {}
        }
    }

    #[tokio::test]
    async fn cancel_token_stops_server() {
        let mut server = start_test_server(None).await;
        let handle = server.handle.take().unwrap();
        server.arena.shutdown();
        let result = tokio::time::timeout(Duration::from_secs(2), handle).await;
        assert!(result.is_ok(), "server should have stopped within timeout");
    }
}
