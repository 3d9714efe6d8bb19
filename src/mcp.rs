//! MCP tool orchestrator
//!
//! Owns the table of connected MCP servers, aggregates their tool catalogs,
//! and drives the multi-round tool-calling loop: the LLM sees every tool,
//! its calls are dispatched to the owning server, results are fed back, and
//! the loop terminates after at most [`MAX_ROUNDS`] completions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::config::McpServerConfig;
use crate::llm::{
    ChatCompletions, ChatMessage, ChatRequest, FinishReason, ToolDefinition,
};
use crate::protocol::{Tool, ToolsCallResult, ToolsListResult};
use crate::transport::{SseTransport, StdioTransport, Transport};
use crate::{Error, Result};

/// Upper bound on LLM completions per query
pub const MAX_ROUNDS: usize = 3;

/// Timeout for SSE transport requests
const TRANSPORT_TIMEOUT: Duration = Duration::from_secs(30);

/// Message appended to the conversation when a tool call fails
const TOOL_FAILURE_MSG: &str = "the tool call failed";

/// One connected MCP server with its cached tool catalog
pub struct McpServer {
    /// Server name from the configuration
    pub name: String,
    /// Live transport
    pub transport: Arc<dyn Transport>,
    /// Tools listed at init
    pub tools: Vec<Tool>,
}

impl McpServer {
    /// Wrap an already-connected transport (used directly by tests)
    #[must_use]
    pub fn new(name: impl Into<String>, transport: Arc<dyn Transport>, tools: Vec<Tool>) -> Self {
        Self {
            name: name.into(),
            transport,
            tools,
        }
    }
}

struct McpState {
    servers: Vec<Arc<McpServer>>,
    /// Tool name -> index into `servers`; first registration wins, server
    /// order is the configured precedence
    dispatch: HashMap<String, usize>,
    llm: Arc<dyn ChatCompletions>,
}

/// The MCP subsystem. The server table is swapped wholesale at re-init.
#[derive(Default)]
pub struct McpOrchestrator {
    state: RwLock<Option<McpState>>,
}

impl McpOrchestrator {
    /// Empty orchestrator; `reinit` or `install` brings it up
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether any server is installed
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.state.read().is_some()
    }

    /// Tear down every client and drop the table
    pub async fn teardown(&self) {
        let state = self.state.write().take();
        if let Some(state) = state {
            for server in &state.servers {
                if let Err(e) = server.transport.close().await {
                    warn!(server = %server.name, error = %e, "Failed to close MCP client");
                }
            }
        }
    }

    /// Install a server table and LLM client, replacing any previous state
    pub fn install(&self, servers: Vec<McpServer>, llm: Arc<dyn ChatCompletions>) {
        let servers: Vec<Arc<McpServer>> = servers.into_iter().map(Arc::new).collect();

        let mut dispatch = HashMap::new();
        for (i, server) in servers.iter().enumerate() {
            for tool in &server.tools {
                dispatch.entry(tool.name.clone()).or_insert(i);
            }
        }

        info!(
            servers = servers.len(),
            tools = dispatch.len(),
            "MCP server table installed"
        );
        *self.state.write() = Some(McpState {
            servers,
            dispatch,
            llm,
        });
    }

    /// Tear down and reconnect every configured server, then install the
    /// new table. Servers connect in name order so dispatch precedence is
    /// deterministic.
    ///
    /// # Errors
    ///
    /// Returns an error if any server is misconfigured or fails to connect.
    pub async fn reinit(
        &self,
        configs: &HashMap<String, McpServerConfig>,
        llm: Arc<dyn ChatCompletions>,
    ) -> Result<()> {
        self.teardown().await;

        let mut names: Vec<&String> = configs.keys().collect();
        names.sort();

        let mut servers = Vec::with_capacity(names.len());
        for name in names {
            let config = &configs[name];
            servers.push(connect_server(name, config).await?);
        }

        self.install(servers, llm);
        Ok(())
    }

    /// Run one natural-language query against the aggregated tool catalog
    ///
    /// # Errors
    ///
    /// Returns an error when no tools are available, the LLM fails, or the
    /// loop exhausts [`MAX_ROUNDS`] without a final answer.
    #[tracing::instrument(skip(self, utterance), fields(query_id = %uuid::Uuid::new_v4()))]
    pub async fn query(&self, utterance: &str) -> Result<String> {
        // Snapshot the table; a concurrent re-init must not affect this query
        let (servers, dispatch, llm) = {
            let state = self.state.read();
            let state = state
                .as_ref()
                .ok_or_else(|| Error::Internal("MCP subsystem not initialized".to_string()))?;
            (
                state.servers.clone(),
                state.dispatch.clone(),
                Arc::clone(&state.llm),
            )
        };

        let tools: Vec<ToolDefinition> = servers
            .iter()
            .flat_map(|server| &server.tools)
            .map(|tool| {
                ToolDefinition::function(
                    tool.name.clone(),
                    tool.description.clone().unwrap_or_default(),
                    tool.input_schema.clone(),
                )
            })
            .collect();

        if tools.is_empty() {
            return Err(Error::Internal("no available tools".to_string()));
        }

        let mut messages = vec![ChatMessage::user(utterance)];

        for round in 0..MAX_ROUNDS {
            debug!(round, "MCP loop round");
            let outcome = llm
                .complete(ChatRequest {
                    messages: messages.clone(),
                    tools: tools.clone(),
                    response_format: None,
                    max_tokens: None,
                })
                .await?;

            match outcome.finish_reason {
                FinishReason::Stop => return outcome.text(),
                FinishReason::ToolCalls => {
                    let tool_calls = outcome.tool_calls;
                    messages.push(ChatMessage::assistant_tool_calls(tool_calls.clone()));

                    for call in tool_calls {
                        let rendered =
                            dispatch_tool_call(&servers, &dispatch, &call.function.name, &call.function.arguments)
                                .await;
                        messages.push(ChatMessage::tool(call.id, rendered));
                    }
                }
                FinishReason::Other => return outcome.text(),
            }
        }

        Err(Error::RoundLimit)
    }
}

/// Call one tool on its owning server; failures are absorbed into a generic
/// error string so the loop continues.
async fn dispatch_tool_call(
    servers: &[Arc<McpServer>],
    dispatch: &HashMap<String, usize>,
    name: &str,
    arguments: &str,
) -> String {
    let Some(&index) = dispatch.get(name) else {
        warn!(tool = %name, "No server exposes the requested tool");
        return TOOL_FAILURE_MSG.to_string();
    };
    let server = &servers[index];

    let arguments: Value = match serde_json::from_str(arguments) {
        Ok(v) => v,
        Err(e) => {
            error!(tool = %name, error = %e, "Failed to parse tool arguments");
            return TOOL_FAILURE_MSG.to_string();
        }
    };

    info!(tool = %name, server = %server.name, "Calling tool");
    let response = server
        .transport
        .request(
            "tools/call",
            Some(serde_json::json!({"name": name, "arguments": arguments})),
        )
        .await;

    match response {
        Ok(response) => {
            if response.error.is_some() {
                error!(tool = %name, "Tool returned a protocol error");
                return TOOL_FAILURE_MSG.to_string();
            }
            match response
                .result
                .map(serde_json::from_value::<ToolsCallResult>)
            {
                Some(Ok(result)) if !result.is_error => result.render(),
                Some(Ok(_)) => {
                    error!(tool = %name, "Tool reported an error result");
                    TOOL_FAILURE_MSG.to_string()
                }
                Some(Err(e)) => {
                    error!(tool = %name, error = %e, "Failed to parse tool result");
                    TOOL_FAILURE_MSG.to_string()
                }
                None => String::new(),
            }
        }
        Err(e) => {
            error!(tool = %name, error = %e, "Tool call failed");
            TOOL_FAILURE_MSG.to_string()
        }
    }
}

/// Connect one configured server: build its transport, initialize, and list
/// its tools.
async fn connect_server(name: &str, config: &McpServerConfig) -> Result<McpServer> {
    config.validate(name)?;
    let env = config.resolved_env(name)?;

    let transport: Arc<dyn Transport> = if let Some(url) = &config.url {
        let transport = SseTransport::new(url, TRANSPORT_TIMEOUT)?;
        transport.start().await?;
        transport
    } else {
        let command = config.command.as_deref().unwrap_or_default();
        let transport = StdioTransport::new(command, config.args.clone(), env);
        transport.start().await?;
        transport
    };

    let response = transport.request("tools/list", None).await?;
    let tools = match response.result {
        Some(result) => serde_json::from_value::<ToolsListResult>(result)?.tools,
        None => Vec::new(),
    };

    info!(server = %name, tools = tools.len(), "MCP server connected");
    Ok(McpServer {
        name: name.to_string(),
        transport,
        tools,
    })
}
