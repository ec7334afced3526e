//! Stub Server - CLI Entry Point

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use stub_server::proxy::HttpForwarder;
use stub_server::{server, Engine, StubServerConfig};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(
    name = "stub-server",
    about = "Configurable HTTP stub server - programmable responses, delays, and failure injection",
    version
)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "stub-server.yaml")]
    config: PathBuf,

    /// Address to bind
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on
    #[arg(short, long, env = "PORT", default_value_t = 3000)]
    port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long, default_value = "info")]
    log_level: Level,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Print default configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let builder = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(false);
    match args.log_format {
        LogFormat::Text => tracing::subscriber::set_global_default(builder.finish())?,
        LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish())?,
    }

    // Print default config if requested
    if args.print_config {
        let default_config = include_str!("../config/default-config.yaml");
        println!("{}", default_config);
        return Ok(());
    }

    // Load configuration
    let config = if args.config.exists() {
        info!(path = ?args.config, "Loading configuration");
        StubServerConfig::from_file(&args.config)
            .with_context(|| format!("Invalid configuration file {:?}", args.config))?
    } else if args.validate {
        anyhow::bail!("Configuration file not found: {:?}", args.config);
    } else {
        info!("Using default configuration");
        StubServerConfig::default()
    };

    // Validate and exit if requested
    if args.validate {
        config.validate()?;
        println!(
            "Configuration is valid ({} seeded paths)",
            config.paths.len()
        );
        return Ok(());
    }

    let forwarder = HttpForwarder::new(Duration::from_millis(config.settings.proxy_timeout_ms))?;
    let engine = Arc::new(Engine::new(&config).with_forwarder(Arc::new(forwarder)));

    let addr: SocketAddr = format!("{}:{}", args.host, args.port)
        .parse()
        .with_context(|| format!("Invalid bind address {}:{}", args.host, args.port))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!(address = %addr, control_path = %config.settings.control_path, "Stub server listening");

    server::serve(listener, server::router(engine.clone()), shutdown_signal())
        .await
        .context("Server error")?;

    let (cached_strings, cached_buffers) = engine.cached_content().await;
    info!(
        requests = engine.total_requests(),
        faulted = engine.total_faulted(),
        rejected_directives = engine.total_rejected(),
        cached_strings,
        cached_buffers,
        "Stub server stopped"
    );
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
