//! NL Bridge - natural-language front door for API gateways

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use nl_bridge::{
    bridge::{BridgeService, HostApi},
    cli::{Cli, Command},
    config::BridgeConfig,
    gateway::Bridge,
    openapi::Document,
    setup_tracing,
    store::MemoryUtteranceStore,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Some(Command::Select { ref spec, ref query }) => run_select(spec, query).await,
        Some(Command::Serve) | None => run_server(cli).await,
    }
}

/// Apply CLI overrides to a loaded configuration
fn apply_cli_overrides(config: &mut BridgeConfig, cli: &Cli) {
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(ref host) = cli.host {
        config.server.host.clone_from(host);
    }
}

/// Run the bridge server
async fn run_server(cli: Cli) -> ExitCode {
    let config = match BridgeConfig::load(cli.config.as_deref()) {
        Ok(mut config) => {
            apply_cli_overrides(&mut config, &cli);
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        apis = config.apis.len(),
        mcp_servers = config.mcp_servers.len(),
        "Starting NL bridge"
    );

    let bridge = match Bridge::new(config).await {
        Ok(b) => b,
        Err(e) => {
            error!("Failed to create bridge: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = bridge.run().await {
        error!("Bridge error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Bridge shutdown complete");
    ExitCode::SUCCESS
}

/// Run selection queries against one API spec without starting a server
async fn run_select(spec: &std::path::Path, queries: &[String]) -> ExitCode {
    let document = match Document::from_file(spec) {
        Ok(d) => Arc::new(d),
        Err(e) => {
            eprintln!("Failed to load spec: {e}");
            return ExitCode::FAILURE;
        }
    };

    let host = match HostApi::from_document(document) {
        Ok(h) => h,
        Err(e) => {
            eprintln!("Spec is missing the bridge extension: {e}");
            return ExitCode::FAILURE;
        }
    };

    let config = BridgeConfig::default();
    let service = BridgeService::new(&config, Arc::new(MemoryUtteranceStore::new()));

    match service.selection_matches(&host, queries).await {
        Ok(reply) => {
            println!(
                "{}",
                serde_json::to_string_pretty(&reply).unwrap_or_default()
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Selection failed: {e}");
            ExitCode::FAILURE
        }
    }
}
