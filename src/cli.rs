//! Command-line interface definitions for `nl-bridge`.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// NL Bridge - natural-language front door for API gateways
///
/// Routes free-form utterances to API operations or MCP tools, synthesizes
/// compliant requests with an LLM, and optionally rewrites upstream
/// responses back into natural language.
///
/// Run without a subcommand to start the bridge server.
#[derive(Parser, Debug)]
#[command(name = "nl-bridge")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to the bridge configuration file (YAML)
    #[arg(short, long, env = "NL_BRIDGE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port the bridge listens on (overrides config file)
    #[arg(short, long, env = "NL_BRIDGE_PORT")]
    pub port: Option<u16>,

    /// Host address to bind to (overrides config file)
    #[arg(long, env = "NL_BRIDGE_HOST")]
    pub host: Option<String>,

    /// Minimum log level: trace, debug, info, warn, or error
    #[arg(long, default_value = "info", env = "NL_BRIDGE_LOG_LEVEL", global = true)]
    pub log_level: String,

    /// Log output format: "text" for human-readable, "json" for structured
    #[arg(long, env = "NL_BRIDGE_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand to run (defaults to server mode when omitted)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Top-level subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the bridge server (default when no subcommand is given)
    #[command(about = "Start the bridge server")]
    Serve,

    /// Run selection queries against a registered API without a server
    #[command(about = "Debug operation selection for an API spec")]
    Select {
        /// Path to the OpenAPI document (JSON) with the bridge extension
        #[arg(required = true)]
        spec: PathBuf,

        /// Queries to match against the API's input examples
        #[arg(short, long, required = true)]
        query: Vec<String>,
    },
}
