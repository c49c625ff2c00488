//! mcp-runtime: Model Context Protocol server
//!
//! Serves the sample campaign tools, resource, and prompt over stdio or
//! HTTP with Server-Sent Events.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

use mcp_runtime::campaigns::{self, CampaignStore};
use mcp_runtime::config::{self, Config, TransportMode};
use mcp_runtime::error::ServeError;
use mcp_runtime::mcp::registry::Registry;
use mcp_runtime::mcp::server::{shutdown_signal, McpServer, ServerOptions};
use mcp_runtime::mcp::session::Credential;
use mcp_runtime::mcp::transport::http_server::{self, HttpServerOptions};
use mcp_runtime::mcp::types::Implementation;

/// Model Context Protocol server.
///
/// Speaks JSON-RPC 2.0 over stdin/stdout by default, or over HTTP POST with
/// Server-Sent Events when `--http` is given or configured.
#[derive(Parser, Debug)]
#[command(name = "mcp-runtime")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(value_name = "CONFIG_FILE")]
    config: Option<PathBuf>,

    /// Serve HTTP on this address instead of stdio (e.g. 127.0.0.1:8808)
    #[arg(long, value_name = "ADDR")]
    http: Option<String>,

    /// Increase logging verbosity (-v for info, -vv for debug, -vvv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Decrease logging verbosity (only show errors)
    #[arg(short, long)]
    quiet: bool,
}

/// Determines the log level from CLI arguments.
#[allow(clippy::match_same_arms)] // Explicit "warn" arm for clarity
fn get_log_level(verbose: u8, quiet: bool, config_level: &str) -> Level {
    if quiet {
        return Level::ERROR;
    }

    match verbose {
        0 => match config_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::WARN, // Default to warn for unknown levels
        },
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// Initialises the tracing subscriber for logging.
///
/// Logs go to stderr; stdout carries protocol traffic in stdio mode. The
/// target is printed so `audit` records stand out.
fn init_tracing(level: Level) {
    let filter = EnvFilter::from_default_env().add_directive(level.into());

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

fn server_options(cfg: &Config) -> ServerOptions {
    ServerOptions {
        info: Implementation::this_crate(&cfg.server.name),
        protocol_version: cfg.server.protocol_version.clone(),
        instructions: cfg.server.instructions.clone(),
        list_changed: cfg.server.list_changed,
        request_timeout: Some(cfg.limits.request_timeout()),
    }
}

async fn run(cfg: Config, http: Option<String>) -> Result<(), ServeError> {
    let registry = Arc::new(Registry::new());
    campaigns::register(&registry, Arc::new(CampaignStore::new()))?;

    let server = McpServer::new(registry, server_options(&cfg));

    let mode = if http.is_some() {
        TransportMode::Http
    } else {
        cfg.transport.mode
    };

    match mode {
        TransportMode::Stdio => {
            let credential = Credential::from_env(&cfg.credentials.env);
            info!(
                credential = credential.is_some(),
                "MCP server ready, waiting for client connection..."
            );
            server.run_stdio(credential, cfg.limits.max_line_bytes).await?;
            Ok(())
        }
        TransportMode::Http => {
            let bind = http.unwrap_or_else(|| cfg.transport.bind.clone());
            let listener = tokio::net::TcpListener::bind(&bind)
                .await
                .map_err(|source| ServeError::Bind {
                    addr: bind.clone(),
                    source,
                })?;
            let options = HttpServerOptions {
                event_buffer: cfg.transport.event_buffer,
                max_sessions: cfg.transport.max_sessions,
                reply_timeout: cfg.limits.reply_timeout(),
                ..HttpServerOptions::default()
            };

            http_server::serve(server, options, listener, async {
                if let Err(e) = shutdown_signal().await {
                    error!(error = %e, "Failed to install signal handlers");
                }
            })
            .await?;
            Ok(())
        }
    }
}

/// Entry point for the mcp-runtime server.
fn main() -> ExitCode {
    let args = Args::parse();

    // Load configuration
    let config_path = args.config.as_deref();
    let cfg = match config::load_config(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            if let Some(path) = config_path {
                eprintln!("\nWhile loading: {}", path.display());
            }
            return ExitCode::FAILURE;
        }
    };

    // Initialise logging
    let log_level = get_log_level(args.verbose, args.quiet, &cfg.logging.level);
    init_tracing(log_level);

    // Display GPL license notice (required by GPLv3 Section 5d)
    eprintln!(
        "mcp-runtime {}  Copyright (C) 2026  The Embedded Society",
        env!("CARGO_PKG_VERSION")
    );
    eprintln!("This program comes with ABSOLUTELY NO WARRANTY.");
    eprintln!("This is free software, licensed under GPL-3.0-or-later.");
    eprintln!("Source: {}", env!("CARGO_PKG_REPOSITORY"));
    eprintln!();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        protocol = %cfg.server.protocol_version,
        "Starting mcp-runtime server"
    );

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to create Tokio runtime");
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(run(cfg, args.http));

    match result {
        Ok(()) => {
            info!("Server shut down gracefully");
            ExitCode::SUCCESS
        }
        Err(e) => {
            let cause = std::error::Error::source(&e).map(ToString::to_string);
            error!(error = %e, cause = ?cause, "Server error");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Args::command().debug_assert();
    }

    #[test]
    fn log_level_precedence() {
        assert_eq!(get_log_level(0, true, "trace"), Level::ERROR);
        assert_eq!(get_log_level(2, false, "error"), Level::DEBUG);
        assert_eq!(get_log_level(0, false, "info"), Level::INFO);
        assert_eq!(get_log_level(0, false, "nonsense"), Level::WARN);
    }

    #[test]
    fn http_flag_parses() {
        let args = Args::try_parse_from(["mcp-runtime", "--http", "127.0.0.1:0", "-vv"]).unwrap();
        assert_eq!(args.http.as_deref(), Some("127.0.0.1:0"));
        assert_eq!(args.verbose, 2);
    }

    #[test]
    fn options_follow_config() {
        let cfg: Config = serde_json::from_str(r#"{ "server": { "name": "x", "list_changed": false } }"#).unwrap();
        let options = server_options(&cfg);
        assert_eq!(options.info.name, "x");
        assert!(!options.list_changed);
    }
}
