//! Network transports over HTTP: streamable HTTP (single POST endpoint,
//! JSON or event-stream replies) and the older HTTP+SSE pairing (a GET
//! event stream for replies plus a POST endpoint announced by the server).

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{RequestBuilder, Url};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::mcp_protocol::{JsonRpcRequest, JsonRpcResponse, McpServerConfig, TransportKind};
use super::mcp_transport::{resolved_headers, McpTransport, PendingRequests};

const SESSION_HEADER: &str = "Mcp-Session-Id";
const ENDPOINT_WAIT: Duration = Duration::from_secs(10);

// ============================================================
// Event-stream framing
// ============================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SseEvent {
    pub event: String,
    pub data: String,
}

/// Incremental `text/event-stream` decoder. Feed it chunks as they arrive.
#[derive(Default)]
pub(crate) struct SseParser {
    buffer: String,
}

impl SseParser {
    pub fn push(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(chunk);
        if self.buffer.contains('\r') {
            self.buffer = self.buffer.replace("\r\n", "\n");
        }
        let mut events = Vec::new();
        while let Some(end) = self.buffer.find("\n\n") {
            let block: String = self.buffer.drain(..end + 2).collect();
            if let Some(event) = parse_block(&block) {
                events.push(event);
            }
        }
        events
    }
}

fn parse_block(block: &str) -> Option<SseEvent> {
    let mut event = String::from("message");
    let mut data: Vec<&str> = Vec::new();
    for line in block.lines() {
        if line.starts_with(':') {
            continue;
        }
        let (field, value) = line.split_once(':').unwrap_or((line, ""));
        let value = value.strip_prefix(' ').unwrap_or(value);
        match field {
            "event" => event = value.to_string(),
            "data" => data.push(value),
            _ => {}
        }
    }
    if data.is_empty() {
        return None;
    }
    Some(SseEvent {
        event,
        data: data.join("\n"),
    })
}

fn with_headers(mut builder: RequestBuilder, headers: &HashMap<String, String>) -> RequestBuilder {
    for (key, value) in headers {
        builder = builder.header(key.as_str(), value.as_str());
    }
    builder
}

fn parse_url(config: &McpServerConfig) -> Result<Url> {
    let raw = config.url.as_deref().unwrap_or_default();
    Url::parse(raw).with_context(|| format!("Invalid MCP server url '{}'", raw))
}

// ============================================================
// Streamable HTTP
// ============================================================

pub struct StreamableHttpTransport {
    server_id: String,
    url: Url,
    headers: HashMap<String, String>,
    client: reqwest::Client,
    session_id: RwLock<Option<String>>,
    open: AtomicBool,
}

impl StreamableHttpTransport {
    pub fn new(client: reqwest::Client, config: &McpServerConfig) -> Result<Self> {
        Ok(Self {
            server_id: config.id.clone(),
            url: parse_url(config)?,
            headers: resolved_headers(config),
            client,
            session_id: RwLock::new(None),
            open: AtomicBool::new(false),
        })
    }

    async fn post(&self, body: &JsonRpcRequest) -> Result<reqwest::Response> {
        if !self.open.load(Ordering::Acquire) {
            bail!("MCP http transport is not open");
        }
        let mut builder = self
            .client
            .post(self.url.clone())
            .header(ACCEPT, "application/json, text/event-stream")
            .json(body);
        builder = with_headers(builder, &self.headers);
        let session = self
            .session_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(session) = session {
            builder = builder.header(SESSION_HEADER, session);
        }

        let response = builder
            .send()
            .await
            .with_context(|| format!("POST to MCP server '{}' failed", self.server_id))?
            .error_for_status()
            .context("MCP server rejected the request")?;

        if let Some(session) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *self.session_id.write().unwrap_or_else(PoisonError::into_inner) =
                Some(session.to_string());
        }
        Ok(response)
    }
}

#[async_trait]
impl McpTransport for StreamableHttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    async fn open(&self) -> Result<()> {
        self.open.store(true, Ordering::Release);
        Ok(())
    }

    async fn send(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse> {
        let expected = request.id_i64();
        let response = self.post(&request).await?;
        let is_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));

        if !is_stream {
            return response
                .json::<JsonRpcResponse>()
                .await
                .context("Failed to decode MCP http response");
        }

        let mut stream = response.bytes_stream();
        let mut parser = SseParser::default();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("MCP event stream read error")?;
            for event in parser.push(&String::from_utf8_lossy(&chunk)) {
                if event.event != "message" {
                    continue;
                }
                match serde_json::from_str::<JsonRpcResponse>(&event.data) {
                    Ok(reply) if reply.id_i64() == expected => return Ok(reply),
                    Ok(_) => debug!(server_id = %self.server_id, "Skipping unrelated MCP stream message"),
                    Err(e) => debug!(server_id = %self.server_id, error = %e, "Skipping non-response MCP stream message"),
                }
            }
        }
        bail!("MCP event stream ended before a response arrived")
    }

    async fn notify(&self, notification: JsonRpcRequest) -> Result<()> {
        self.post(&notification).await.map(|_| ())
    }

    async fn close(&self) -> Result<()> {
        if !self.open.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let session = self
            .session_id
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(session) = session {
            let builder = with_headers(self.client.delete(self.url.clone()), &self.headers)
                .header(SESSION_HEADER, session);
            if let Err(e) = builder.send().await {
                debug!(server_id = %self.server_id, error = %e, "MCP session DELETE failed");
            }
        }
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

// ============================================================
// HTTP + SSE
// ============================================================

pub struct SseTransport {
    server_id: String,
    url: Url,
    headers: HashMap<String, String>,
    client: reqwest::Client,
    pending: PendingRequests,
    endpoint: RwLock<Option<Url>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    alive: Arc<AtomicBool>,
}

impl SseTransport {
    pub fn new(client: reqwest::Client, config: &McpServerConfig) -> Result<Self> {
        Ok(Self {
            server_id: config.id.clone(),
            url: parse_url(config)?,
            headers: resolved_headers(config),
            client,
            pending: PendingRequests::default(),
            endpoint: RwLock::new(None),
            reader: Mutex::new(None),
            alive: Arc::new(AtomicBool::new(false)),
        })
    }

    fn endpoint(&self) -> Result<Url> {
        self.endpoint
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .context("MCP sse transport is not open")
    }

    async fn post(&self, body: &JsonRpcRequest) -> Result<()> {
        let builder = with_headers(self.client.post(self.endpoint()?).json(body), &self.headers);
        builder
            .send()
            .await
            .with_context(|| format!("POST to MCP server '{}' failed", self.server_id))?
            .error_for_status()
            .context("MCP server rejected the message")?;
        Ok(())
    }
}

#[async_trait]
impl McpTransport for SseTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Sse
    }

    async fn open(&self) -> Result<()> {
        let mut reader = self.reader.lock().await;
        if reader.is_some() && self.alive.load(Ordering::Acquire) {
            return Ok(());
        }

        let response = with_headers(self.client.get(self.url.clone()), &self.headers)
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .with_context(|| format!("SSE connection to '{}' failed", self.server_id))?
            .error_for_status()
            .context("SSE connection rejected")?;

        let (endpoint_tx, endpoint_rx) = oneshot::channel::<String>();
        let pending = self.pending.clone();
        let alive = self.alive.clone();
        let server_id = self.server_id.clone();
        alive.store(true, Ordering::Release);

        let handle = tokio::spawn(async move {
            let mut endpoint_tx = Some(endpoint_tx);
            let mut stream = response.bytes_stream();
            let mut parser = SseParser::default();
            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        warn!(server_id = %server_id, error = %e, "SSE stream error");
                        break;
                    }
                };
                for event in parser.push(&String::from_utf8_lossy(&chunk)) {
                    match event.event.as_str() {
                        "endpoint" => {
                            if let Some(tx) = endpoint_tx.take() {
                                let _ = tx.send(event.data);
                            }
                        }
                        "message" => pending.dispatch_frame(&event.data),
                        other => debug!(server_id = %server_id, event = other, "Ignoring SSE event"),
                    }
                }
            }
            alive.store(false, Ordering::Release);
            let failed = pending.fail_all();
            warn!(server_id = %server_id, failed_requests = failed, "MCP SSE stream closed.");
        });
        *reader = Some(handle);

        let path = match tokio::time::timeout(ENDPOINT_WAIT, endpoint_rx).await {
            Ok(Ok(path)) => path,
            Ok(Err(_)) => bail!("SSE stream closed before the endpoint event"),
            Err(_) => bail!("No endpoint event within {}s", ENDPOINT_WAIT.as_secs()),
        };
        let endpoint = self
            .url
            .join(path.trim())
            .with_context(|| format!("Invalid SSE endpoint '{}'", path))?;
        info!(server_id = %self.server_id, endpoint = %endpoint, "SSE endpoint announced");
        *self.endpoint.write().unwrap_or_else(PoisonError::into_inner) = Some(endpoint);
        Ok(())
    }

    async fn send(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse> {
        let slot = self.pending.register(&request)?;
        self.post(&request).await?;
        slot.wait().await
    }

    async fn notify(&self, notification: JsonRpcRequest) -> Result<()> {
        self.post(&notification).await
    }

    async fn close(&self) -> Result<()> {
        if let Some(handle) = self.reader.lock().await.take() {
            handle.abort();
        }
        self.alive.store(false, Ordering::Release);
        *self.endpoint.write().unwrap_or_else(PoisonError::into_inner) = None;
        self.pending.fail_all();
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }
}
