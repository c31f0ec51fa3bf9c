use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, warn};

use super::mcp_protocol::{JsonRpcRequest, JsonRpcResponse, McpServerConfig, TransportKind};
use super::mcp_transport::{resolved_headers, McpTransport, PendingRequests};

struct Connection {
    writer: mpsc::Sender<Message>,
    tasks: [JoinHandle<()>; 2],
}

/// JSON-RPC over text frames on a single websocket.
pub struct WebSocketTransport {
    server_id: String,
    url: String,
    headers: HashMap<String, String>,
    pending: PendingRequests,
    connection: Mutex<Option<Connection>>,
    alive: Arc<AtomicBool>,
}

impl WebSocketTransport {
    pub fn new(config: &McpServerConfig) -> Result<Self> {
        let url = config
            .url
            .clone()
            .context("websocket transport requires a url")?;
        Ok(Self {
            server_id: config.id.clone(),
            url,
            headers: resolved_headers(config),
            pending: PendingRequests::default(),
            connection: Mutex::new(None),
            alive: Arc::new(AtomicBool::new(false)),
        })
    }

    async fn writer(&self) -> Result<mpsc::Sender<Message>> {
        self.connection
            .lock()
            .await
            .as_ref()
            .map(|c| c.writer.clone())
            .context("MCP websocket transport is not open")
    }
}

#[async_trait]
impl McpTransport for WebSocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Websocket
    }

    async fn open(&self) -> Result<()> {
        let mut slot = self.connection.lock().await;
        if slot.is_some() && self.alive.load(Ordering::Acquire) {
            return Ok(());
        }

        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .context("constructing websocket request")?;
        for (key, value) in &self.headers {
            let header_name = HeaderName::from_bytes(key.as_bytes())
                .with_context(|| format!("invalid websocket header name `{key}` for MCP server"))?;
            let header_value = HeaderValue::from_str(value)
                .with_context(|| format!("invalid websocket header value for `{key}`"))?;
            request.headers_mut().insert(header_name, header_value);
        }

        let (stream, _) = connect_async(request)
            .await
            .with_context(|| format!("websocket connection to '{}' failed", self.server_id))?;
        let (mut sink, mut source) = stream.split();
        let (tx, mut rx) = mpsc::channel::<Message>(100);
        self.alive.store(true, Ordering::Release);

        let server_id = self.server_id.clone();
        let writer_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = sink.send(msg).await {
                    error!(server_id = %server_id, error = %e, "Failed to write to MCP websocket");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let pending = self.pending.clone();
        let alive = self.alive.clone();
        let server_id = self.server_id.clone();
        let reader_task = tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                match frame {
                    Ok(Message::Text(text)) => pending.dispatch_frame(&text),
                    Ok(Message::Binary(bytes)) => pending.dispatch_frame(&String::from_utf8_lossy(&bytes)),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(server_id = %server_id, error = %e, "MCP websocket read error");
                        break;
                    }
                }
            }
            alive.store(false, Ordering::Release);
            let failed = pending.fail_all();
            warn!(server_id = %server_id, failed_requests = failed, "MCP websocket closed.");
        });

        *slot = Some(Connection {
            writer: tx,
            tasks: [writer_task, reader_task],
        });
        Ok(())
    }

    async fn send(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse> {
        let writer = self.writer().await?;
        let slot = self.pending.register(&request)?;
        writer
            .send(Message::Text(serde_json::to_string(&request)?))
            .await
            .context("Failed to send request to MCP websocket")?;
        slot.wait().await
    }

    async fn notify(&self, notification: JsonRpcRequest) -> Result<()> {
        let writer = self.writer().await?;
        writer
            .send(Message::Text(serde_json::to_string(&notification)?))
            .await
            .context("Failed to send notification to MCP websocket")
    }

    async fn close(&self) -> Result<()> {
        let connection = self.connection.lock().await.take();
        self.alive.store(false, Ordering::Release);
        if let Some(connection) = connection {
            if connection.writer.send(Message::Close(None)).await.is_err() {
                debug!(server_id = %self.server_id, "MCP websocket writer already stopped");
            }
            let [writer, reader] = connection.tasks;
            reader.abort();
            drop(connection.writer);
            if tokio::time::timeout(std::time::Duration::from_secs(2), writer).await.is_err() {
                debug!(server_id = %self.server_id, "MCP websocket close handshake timed out");
            }
        }
        self.pending.fail_all();
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requires_url() {
        let mut config = McpServerConfig::remote("ws", TransportKind::Websocket, "ws://localhost:1");
        config.url = None;
        assert!(WebSocketTransport::new(&config).is_err());
    }

    #[tokio::test]
    async fn test_send_before_open_fails() {
        let config = McpServerConfig::remote("ws", TransportKind::Websocket, "ws://localhost:1");
        let transport = WebSocketTransport::new(&config).unwrap();
        assert!(!transport.is_alive());
        assert!(transport
            .send(JsonRpcRequest::new(1, "tools/list", None))
            .await
            .is_err());
    }
}
