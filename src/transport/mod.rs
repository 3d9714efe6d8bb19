//! Transport implementations for MCP servers

mod sse;
mod stdio;

pub use self::sse::SseTransport;
pub use self::stdio::StdioTransport;

use async_trait::async_trait;
use serde_json::Value;

use crate::protocol::JsonRpcResponse;
use crate::Result;

/// Transport contract for MCP communication
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and wait for the response
    async fn request(&self, method: &str, params: Option<Value>) -> Result<JsonRpcResponse>;

    /// Send a notification (no response expected)
    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()>;

    /// Whether the transport is connected
    fn is_connected(&self) -> bool;

    /// Close the transport
    async fn close(&self) -> Result<()>;
}
