//! Console WebSocket server.
//!
//! Prints every server event, broadcasts each line typed on stdin, and stops
//! on Ctrl-C or end of input.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use hermes_certs::{CertificateInstaller, NetshCertificateInstaller};
use hermes_config::{ConfigLoader, HermesConfig, LogFormat, DEFAULT_ENV_PREFIX};
use hermes_server::{ServerEvent, ShutdownSignal, WebSocketServer};
use hermes_telemetry::init_telemetry;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

/// Hermes WebSocket server
#[derive(Parser, Debug)]
#[command(name = "hermes-server", version, about, long_about = None)]
struct Args {
    /// Configuration file (.toml or .json). Defaults to ./hermes.toml if present
    #[arg(short, long, env = "HERMES_CONFIG")]
    config: Option<PathBuf>,

    /// Listener prefix, e.g. http://+:20005/
    #[arg(short, long)]
    prefix: Option<String>,

    /// Log level or filter directive
    #[arg(long)]
    log_level: Option<String>,

    /// Log output format
    #[arg(long, value_parser = ["json", "pretty"])]
    log_format: Option<String>,
}

fn load_config(args: &Args) -> Result<HermesConfig> {
    let loader = ConfigLoader::new().with_dotenv()?;
    let loader = match &args.config {
        Some(path) => loader
            .with_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => loader.with_optional_file("hermes.toml")?,
    };

    let mut config = loader
        .with_env_prefix(DEFAULT_ENV_PREFIX)
        .load_unvalidated()?;

    if let Some(prefix) = &args.prefix {
        config.server.prefix.clone_from(prefix);
    }
    if let Some(level) = &args.log_level {
        config.telemetry.logging.level.clone_from(level);
    }
    if let Some(format) = args.log_format.as_deref() {
        config.telemetry.logging.format = if format == "pretty" {
            LogFormat::Pretty
        } else {
            LogFormat::Json
        };
    }

    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn print_event(event: &ServerEvent) {
    match event {
        ServerEvent::MessageReceived { client_id, message } => {
            println!("{client_id}: {message}");
        }
        other => println!("{}", other.message()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    init_telemetry(&config.to_telemetry_config()).context("failed to initialise telemetry")?;

    if let Some(bundle) = config.certificate_bundle() {
        let report = NetshCertificateInstaller::new()
            .install(&bundle)
            .await
            .context("failed to install certificate")?;
        info!(
            binding = %report.binding,
            replaced_existing = report.replaced_existing,
            "Certificate installed"
        );
    }

    let server = WebSocketServer::new(config.to_server_config()?);
    server.events().subscribe(print_event);

    let shutdown = ShutdownSignal::with_os_signals();
    tokio::spawn(relay_stdin(server.clone(), shutdown.clone()));

    server
        .run_with_shutdown(shutdown)
        .await
        .context("failed to start server")?;
    Ok(())
}

/// Broadcast each non-empty stdin line; end of input triggers shutdown.
async fn relay_stdin(server: WebSocketServer, shutdown: ShutdownSignal) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.is_empty() => {}
            Ok(Some(line)) => {
                let report = server.broadcast(&line).await;
                if !report.is_complete() {
                    warn!(
                        delivered = report.delivered_count(),
                        failed = report.failed_count(),
                        "Broadcast did not reach every client"
                    );
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Failed to read from stdin");
                break;
            }
        }
    }

    shutdown.trigger();
}
