//! MCP transport layer: stdio subprocess, streamable HTTP, and SSE.
//!
//! A transport moves JSON-RPC messages; it knows nothing about recovery.
//! Errors carry enough structure (HTTP status, closed-stream, RPC error)
//! for the recovery layer to classify them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::sync::{oneshot, Mutex as AsyncMutex};

use tarsy_domain::config::McpTransportConfig;

use crate::protocol::{self, JsonRpcResponse};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Contract
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("server process has exited")]
    ProcessExited,

    #[error("stream closed")]
    StreamClosed,

    #[error("timeout waiting for response")]
    Timeout,

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error(transparent)]
    Rpc(#[from] crate::protocol::JsonRpcError),

    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Errors that are expected during teardown and safe to swallow;
    /// anything else from a close path is re-raised.
    pub fn is_safe_teardown_error(&self) -> bool {
        match self {
            TransportError::ProcessExited | TransportError::StreamClosed => true,
            TransportError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and wait for the matching response's `result`.
    /// A JSON-RPC error object surfaces as [`TransportError::Rpc`].
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, TransportError>;

    /// Send a notification (no response).
    async fn notify(&self, method: &str) -> Result<(), TransportError>;

    fn is_alive(&self) -> bool;

    async fn close(&self) -> Result<(), TransportError>;
}

/// Build a transport from a server's transport config.
pub async fn connect(config: &McpTransportConfig) -> Result<Box<dyn Transport>, TransportError> {
    match config {
        McpTransportConfig::Stdio { command, args, env } => {
            Ok(Box::new(StdioTransport::spawn(command, args, env)?))
        }
        McpTransportConfig::Http {
            url,
            bearer_token,
            headers,
            verify_ssl,
            timeout_secs,
        } => Ok(Box::new(HttpTransport::new(
            url,
            bearer_token.as_deref(),
            headers,
            *verify_ssl,
            Duration::from_secs(*timeout_secs),
        )?)),
        McpTransportConfig::Sse {
            url,
            bearer_token,
            headers,
            verify_ssl,
            read_timeout_secs,
        } => Ok(Box::new(
            SseTransport::connect(
                url,
                bearer_token.as_deref(),
                headers,
                *verify_ssl,
                Duration::from_secs(*read_timeout_secs),
            )
            .await?,
        )),
    }
}

/// Route a response line to its waiting request, shared by the stdio and
/// SSE readers. Messages without an `id` (server notifications), frames
/// carrying neither result nor error (request echoes), and responses
/// nobody is waiting for are dropped.
fn route_response(pending: &Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>, line: &str) {
    let Ok(response) = serde_json::from_str::<JsonRpcResponse>(line) else {
        tracing::debug!(line, "ignoring non-response message from MCP server");
        return;
    };
    if response.result.is_none() && response.error.is_none() {
        tracing::debug!(id = response.id, "ignoring frame with neither result nor error");
        return;
    }
    if let Some(waiter) = pending.lock().remove(&response.id) {
        let _ = waiter.send(response);
    } else {
        tracing::debug!(id = response.id, "response for unknown request id");
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stdio transport
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-request response timeout on the stdio pipe.
const STDIO_RESPONSE_TIMEOUT: Duration = Duration::from_secs(55);

/// Subprocess transport. A dedicated reader task drains stdout and routes
/// responses to waiting requests by id, so concurrent callers don't
/// serialize on the pipe.
pub struct StdioTransport {
    stdin: AsyncMutex<ChildStdin>,
    child: AsyncMutex<Child>,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>,
    reader_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    next_id: AtomicU64,
    alive: Arc<AtomicBool>,
}

impl StdioTransport {
    pub fn spawn(
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> Result<Self, TransportError> {
        let mut cmd = tokio::process::Command::new(command);
        cmd.args(args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);
        for (key, value) in env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn()?;
        let stdin = child.stdin.take().ok_or_else(|| {
            TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "failed to capture child stdin",
            ))
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "failed to capture child stdout",
            ))
        })?;

        let pending: Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));

        let reader_pending = Arc::clone(&pending);
        let reader_alive = Arc::clone(&alive);
        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let trimmed = line.trim();
                        // Non-JSON lines are usually logging leaked to stdout.
                        if trimmed.starts_with('{') {
                            route_response(&reader_pending, trimmed);
                        } else if !trimmed.is_empty() {
                            tracing::debug!(line = %trimmed, "skipping non-JSON stdout line");
                        }
                    }
                    Ok(None) | Err(_) => break,
                }
            }
            reader_alive.store(false, Ordering::SeqCst);
            // Unblock everyone still waiting.
            reader_pending.lock().clear();
        });

        Ok(Self {
            stdin: AsyncMutex::new(stdin),
            child: AsyncMutex::new(child),
            pending,
            reader_task: Mutex::new(Some(reader)),
            next_id: AtomicU64::new(1),
            alive,
        })
    }

    async fn write_line(&self, json: &str) -> Result<(), TransportError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(TransportError::ProcessExited);
        }
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(json.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let frame = protocol::request_frame(id, method, params.as_ref());
        if let Err(e) = self.write_line(&frame).await {
            self.pending.lock().remove(&id);
            return Err(e);
        }

        let response = match tokio::time::timeout(STDIO_RESPONSE_TIMEOUT, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(TransportError::ProcessExited),
            Err(_) => {
                self.pending.lock().remove(&id);
                return Err(TransportError::Timeout);
            }
        };
        response.into_result().map_err(TransportError::Rpc)
    }

    async fn notify(&self, method: &str) -> Result<(), TransportError> {
        self.write_line(&protocol::notification_frame(method)).await
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.alive.store(false, Ordering::SeqCst);
        {
            let mut stdin = self.stdin.lock().await;
            if let Err(e) = stdin.shutdown().await {
                tracing::debug!(error = %e, "error closing MCP server stdin");
            }
        }
        let mut child = self.child.lock().await;
        match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(?status, "MCP server process exited");
            }
            Ok(Err(e)) => return Err(TransportError::Io(e)),
            Err(_) => {
                tracing::warn!("MCP server did not exit in time, killing");
                child.kill().await?;
            }
        }
        if let Some(task) = self.reader_task.lock().take() {
            task.abort();
        }
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HTTP transport (streamable HTTP)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const MCP_SESSION_HEADER: &str = "Mcp-Session-Id";

/// JSON-RPC over POST. The server may assign a session id on `initialize`
/// (via the `Mcp-Session-Id` response header); we echo it on every
/// subsequent request.
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
    session_id: Mutex<Option<String>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl HttpTransport {
    pub fn new(
        url: &str,
        bearer_token: Option<&str>,
        headers: &HashMap<String, String>,
        verify_ssl: bool,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let client = build_http_client(bearer_token, headers, verify_ssl, Some(timeout))?;
        Ok(Self {
            client,
            url: url.to_string(),
            session_id: Mutex::new(None),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        })
    }

    async fn post(&self, body: String) -> Result<reqwest::Response, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::StreamClosed);
        }
        let mut request = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(reqwest::header::ACCEPT, "application/json, text/event-stream")
            .body(body);
        if let Some(session) = self.session_id.lock().clone() {
            request = request.header(MCP_SESSION_HEADER, session);
        }
        let response = request.send().await.map_err(request_error)?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(TransportError::Http {
                status: status.as_u16(),
                message,
            });
        }
        // Capture/refresh the server-assigned session id.
        if let Some(session) = response
            .headers()
            .get(MCP_SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *self.session_id.lock() = Some(session.to_string());
        }
        Ok(response)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let response = self
            .post(protocol::request_frame(id, method, params.as_ref()))
            .await?;

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let body = response.text().await.map_err(request_error)?;

        // Streamable HTTP servers may answer a POST with a one-shot SSE body.
        let payload = if content_type.starts_with("text/event-stream") {
            first_sse_data(&body).ok_or(TransportError::StreamClosed)?
        } else {
            body
        };
        let parsed: JsonRpcResponse = serde_json::from_str(&payload)?;
        parsed.into_result().map_err(TransportError::Rpc)
    }

    async fn notify(&self, method: &str) -> Result<(), TransportError> {
        self.post(protocol::notification_frame(method)).await?;
        Ok(())
    }

    fn is_alive(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        // Streamable HTTP defines DELETE as explicit session teardown.
        let session = self.session_id.lock().take();
        if let Some(session) = session {
            let result = self
                .client
                .delete(&self.url)
                .header(MCP_SESSION_HEADER, session)
                .send()
                .await;
            if let Err(e) = result {
                tracing::debug!(error = %e, "session DELETE failed during teardown");
            }
        }
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SSE transport
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// HTTP POST outbound, Server-Sent-Events inbound. A background task reads
/// the event stream and routes responses by request id.
pub struct SseTransport {
    client: reqwest::Client,
    post_url: String,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>,
    reader_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    next_id: AtomicU64,
    alive: Arc<AtomicBool>,
    read_timeout: Duration,
}

impl SseTransport {
    pub async fn connect(
        url: &str,
        bearer_token: Option<&str>,
        headers: &HashMap<String, String>,
        verify_ssl: bool,
        read_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let client = build_http_client(bearer_token, headers, verify_ssl, None)?;

        let response = client
            .get(url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(request_error)?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(TransportError::Http {
                status: status.as_u16(),
                message,
            });
        }

        let pending: Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));

        let reader_pending = Arc::clone(&pending);
        let reader_alive = Arc::clone(&alive);
        let reader = tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut buffer = String::new();
            while let Some(chunk) = stream.next().await {
                let Ok(chunk) = chunk else { break };
                buffer.push_str(&String::from_utf8_lossy(&chunk));
                // SSE events are separated by a blank line.
                while let Some(boundary) = buffer.find("\n\n") {
                    let event: String = buffer.drain(..boundary + 2).collect();
                    for line in event.lines() {
                        if let Some(data) = line.strip_prefix("data:") {
                            route_response(&reader_pending, data.trim());
                        }
                    }
                }
            }
            reader_alive.store(false, Ordering::SeqCst);
            reader_pending.lock().clear();
        });

        Ok(Self {
            client,
            post_url: url.to_string(),
            pending,
            reader_task: Mutex::new(Some(reader)),
            next_id: AtomicU64::new(1),
            alive,
            read_timeout,
        })
    }
}

#[async_trait]
impl Transport for SseTransport {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, TransportError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(TransportError::StreamClosed);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let post = self
            .client
            .post(&self.post_url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(protocol::request_frame(id, method, params.as_ref()))
            .send()
            .await;
        match post {
            Ok(response) if !response.status().is_success() => {
                self.pending.lock().remove(&id);
                let status = response.status().as_u16();
                let message = response.text().await.unwrap_or_default();
                return Err(TransportError::Http { status, message });
            }
            Err(e) => {
                self.pending.lock().remove(&id);
                return Err(request_error(e));
            }
            Ok(_) => {}
        }

        let response = match tokio::time::timeout(self.read_timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(TransportError::StreamClosed),
            Err(_) => {
                self.pending.lock().remove(&id);
                return Err(TransportError::Timeout);
            }
        };
        response.into_result().map_err(TransportError::Rpc)
    }

    async fn notify(&self, method: &str) -> Result<(), TransportError> {
        let response = self
            .client
            .post(&self.post_url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(protocol::notification_frame(method))
            .send()
            .await
            .map_err(request_error)?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(TransportError::Http { status, message });
        }
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.alive.store(false, Ordering::SeqCst);
        if let Some(task) = self.reader_task.lock().take() {
            task.abort();
        }
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn build_http_client(
    bearer_token: Option<&str>,
    headers: &HashMap<String, String>,
    verify_ssl: bool,
    timeout: Option<Duration>,
) -> Result<reqwest::Client, TransportError> {
    let mut header_map = reqwest::header::HeaderMap::new();
    for (key, value) in headers {
        let name = reqwest::header::HeaderName::from_bytes(key.as_bytes())
            .map_err(|e| TransportError::Other(format!("invalid header name '{key}': {e}")))?;
        let value = reqwest::header::HeaderValue::from_str(value)
            .map_err(|e| TransportError::Other(format!("invalid header value for '{key}': {e}")))?;
        header_map.insert(name, value);
    }
    if let Some(token) = bearer_token {
        let value = reqwest::header::HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| TransportError::Other(format!("invalid bearer token: {e}")))?;
        header_map.insert(reqwest::header::AUTHORIZATION, value);
    }

    let mut builder = reqwest::Client::builder().default_headers(header_map);
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    if !verify_ssl {
        builder = builder.danger_accept_invalid_certs(true);
    }
    builder
        .build()
        .map_err(|e| TransportError::Other(format!("http client build failed: {e}")))
}

/// Map a reqwest error, preserving an HTTP status when one exists.
fn request_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        return TransportError::Timeout;
    }
    if let Some(status) = e.status() {
        return TransportError::Http {
            status: status.as_u16(),
            message: e.to_string(),
        };
    }
    TransportError::Other(e.to_string())
}

/// First `data:` payload of an SSE body.
fn first_sse_data(body: &str) -> Option<String> {
    body.lines()
        .find_map(|line| line.strip_prefix("data:").map(|d| d.trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_teardown_classification() {
        assert!(TransportError::ProcessExited.is_safe_teardown_error());
        assert!(TransportError::StreamClosed.is_safe_teardown_error());
        assert!(TransportError::Io(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "pipe"
        ))
        .is_safe_teardown_error());
        assert!(!TransportError::Timeout.is_safe_teardown_error());
        assert!(!TransportError::Http {
            status: 500,
            message: "boom".into()
        }
        .is_safe_teardown_error());
    }

    #[test]
    fn sse_data_extraction() {
        let body = "event: message\ndata: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{}}\n\n";
        let data = first_sse_data(body).unwrap();
        assert!(data.starts_with('{'));
        assert!(first_sse_data("no data here").is_none());
    }

    #[tokio::test]
    async fn stdio_roundtrip_against_scripted_server() {
        let script = r#"read line; printf '{"jsonrpc":"2.0","id":1,"result":{"ok":true}}\n'"#;
        let transport = StdioTransport::spawn(
            "sh",
            &["-c".to_string(), script.to_string()],
            &HashMap::new(),
        )
        .unwrap();

        let result = transport.request("initialize", None).await.unwrap();
        assert_eq!(result["ok"], true);
        transport.close().await.unwrap();
        assert!(!transport.is_alive());
    }

    #[tokio::test]
    async fn stdio_rpc_error_surfaces_as_rpc_variant() {
        let script = r#"read line; printf '{"jsonrpc":"2.0","id":1,"error":{"code":-32602,"message":"Invalid params"}}\n'"#;
        let transport = StdioTransport::spawn(
            "sh",
            &["-c".to_string(), script.to_string()],
            &HashMap::new(),
        )
        .unwrap();

        let err = transport.request("tools/call", None).await.unwrap_err();
        assert!(matches!(err, TransportError::Rpc(_)));
        let _ = transport.close().await;
    }

    #[tokio::test]
    async fn stdio_exit_is_process_exited() {
        let transport =
            StdioTransport::spawn("sh", &["-c".to_string(), "exit 0".to_string()], &HashMap::new())
                .unwrap();
        // Give the process a moment to exit and the reader to notice.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let err = transport.request("tools/list", None).await.unwrap_err();
        assert!(matches!(
            err,
            TransportError::ProcessExited | TransportError::Io(_)
        ));
    }
}
