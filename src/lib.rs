//! NL Bridge Library
//!
//! Gateway-embedded bridge that lets agents and humans talk to heterogeneous
//! backends in natural language.
//!
//! # Features
//!
//! - **Semantic Router**: embedding-based selection of an operation within
//!   one API, or of a target service across all configured APIs
//! - **Request Synthesizer**: schema-constrained LLM call turning an
//!   utterance into a compliant HTTP request for the selected operation
//! - **Response Naturalizer**: optional rewrite of the upstream response
//!   back into plain language keyed to the original intent
//! - **MCP Orchestrator**: bounded multi-round tool-calling loop over SSE
//!   and stdio MCP servers
//! - **Cross-request State**: per-API config cache, shared embedding-model
//!   cache, and a Redis-backed utterance store with lazy re-indexing

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod bridge;
pub mod cli;
pub mod config;
pub mod embedding;
pub mod error;
pub mod gateway;
pub mod index;
pub mod llm;
pub mod mcp;
pub mod naturalize;
pub mod openapi;
pub mod protocol;
pub mod router;
pub mod store;
pub mod synth;
pub mod transport;

pub use error::{Error, Result};

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Setup tracing/logging
///
/// # Errors
///
/// Currently infallible; kept fallible for call-site stability.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
