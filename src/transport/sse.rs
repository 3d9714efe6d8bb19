//! SSE transport (HTTP MCP servers)
//!
//! Speaks JSON-RPC over HTTP POST; responses arrive either as plain JSON or
//! as a single `text/event-stream` data frame.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::{header, Client};
use serde_json::Value;
use tracing::{debug, warn};

use super::Transport;
use crate::protocol::{JsonRpcRequest, JsonRpcResponse, RequestId, PROTOCOL_VERSION};
use crate::{Error, Result};

/// SSE transport for HTTP MCP servers
pub struct SseTransport {
    client: Client,
    url: String,
    /// Session ID assigned by the server
    session_id: RwLock<Option<String>>,
    request_id: AtomicU64,
    connected: AtomicBool,
}

impl SseTransport {
    /// Create a new SSE transport
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(url: &str, timeout: Duration) -> Result<Arc<Self>> {
        let client = Client::builder()
            .timeout(timeout)
            .tcp_nodelay(true)
            .build()
            .map_err(|e| Error::Transport(e.to_string()))?;

        Ok(Arc::new(Self {
            client,
            url: url.to_string(),
            session_id: RwLock::new(None),
            request_id: AtomicU64::new(1),
            connected: AtomicBool::new(false),
        }))
    }

    /// Run the MCP initialize handshake
    ///
    /// # Errors
    ///
    /// Returns an error if the handshake fails.
    pub async fn start(&self) -> Result<()> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: RequestId::Number(0),
            method: "initialize".to_string(),
            params: Some(serde_json::json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {
                    "name": "nl-bridge",
                    "version": env!("CARGO_PKG_VERSION")
                }
            })),
        };

        let response = self.send_request(&request).await?;
        if response.error.is_some() {
            return Err(Error::Protocol("Initialize failed".to_string()));
        }

        self.notify("notifications/initialized", None).await?;

        self.connected.store(true, Ordering::Relaxed);
        debug!(url = %self.url, "SSE transport initialized");
        Ok(())
    }

    async fn send_request(&self, request: &JsonRpcRequest) -> Result<JsonRpcResponse> {
        let mut headers = header::HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, "application/json".parse().expect("static header"));
        headers.insert(
            header::ACCEPT,
            "application/json, text/event-stream".parse().expect("static header"),
        );
        headers.insert("MCP-Protocol-Version", PROTOCOL_VERSION.parse().expect("static header"));

        if let Some(ref session_id) = *self.session_id.read() {
            if let Ok(value) = session_id.parse() {
                headers.insert("MCP-Session-Id", value);
            }
        }

        let response = self
            .client
            .post(&self.url)
            .headers(headers)
            .json(request)
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        if let Some(session_id) = response.headers().get("mcp-session-id") {
            if let Ok(id) = session_id.to_str() {
                *self.session_id.write() = Some(id.to_string());
            }
        }

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Transport(format!("HTTP error: {status}")));
        }

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if content_type.contains("text/event-stream") {
            Self::parse_sse_response(response).await
        } else {
            response
                .json()
                .await
                .map_err(|e| Error::Transport(e.to_string()))
        }
    }

    /// Extract the JSON-RPC response from an SSE body
    async fn parse_sse_response(response: reqwest::Response) -> Result<JsonRpcResponse> {
        let text = response
            .text()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        for line in text.lines() {
            if let Some(data) = line.strip_prefix("data: ") {
                return serde_json::from_str(data).map_err(|e| Error::Transport(e.to_string()));
            }
        }

        Err(Error::Transport("No data in SSE response".to_string()))
    }

    #[allow(clippy::cast_possible_wrap)] // request IDs won't exceed i64::MAX
    fn next_id(&self) -> RequestId {
        RequestId::Number(self.request_id.fetch_add(1, Ordering::Relaxed) as i64)
    }
}

#[async_trait]
impl Transport for SseTransport {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<JsonRpcResponse> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: self.next_id(),
            method: method.to_string(),
            params,
        };

        self.send_request(&request).await
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let notification = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params
        });

        let response = self
            .client
            .post(&self.url)
            .header(header::CONTENT_TYPE, "application/json")
            .header("MCP-Protocol-Version", PROTOCOL_VERSION)
            .json(&notification)
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        if !response.status().is_success() {
            warn!(status = %response.status(), "Notification failed");
        }

        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::Relaxed);

        let session_id = self.session_id.read().clone();
        if let Some(ref id) = session_id {
            let _ = self
                .client
                .delete(&self.url)
                .header("MCP-Session-Id", id)
                .send()
                .await;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_transport_is_disconnected() {
        let t = SseTransport::new("http://127.0.0.1:8088/sse", Duration::from_secs(5)).unwrap();
        assert!(!t.is_connected());
    }

    #[test]
    fn next_id_increments() {
        let t = SseTransport::new("http://127.0.0.1:8088/sse", Duration::from_secs(5)).unwrap();
        assert_eq!(t.next_id(), RequestId::Number(1));
        assert_eq!(t.next_id(), RequestId::Number(2));
    }
}
