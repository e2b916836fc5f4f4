//! Console WebSocket client.
//!
//! Prints what the server sends and sends each line typed on stdin. Closes
//! normally on Ctrl-C or end of input.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use hermes_telemetry::{init_logging, LogConfig};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::warn;

const CLOSE_REASON: &str = "Client disconnecting";

/// Hermes console client
#[derive(Parser, Debug)]
#[command(name = "hermes-client", version, about, long_about = None)]
struct Args {
    /// Server URL
    #[arg(short, long, default_value = "ws://localhost:20005/")]
    url: String,

    /// Log level or filter directive
    #[arg(long, default_value = "warn")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&LogConfig::development().with_level(args.log_level.as_str()))
        .context("failed to initialise logging")?;

    let (socket, _) = connect_async(args.url.as_str())
        .await
        .with_context(|| format!("failed to connect to {}", args.url))?;
    println!("Connected to {}", args.url);

    let (mut sink, mut stream) = socket.split();

    let mut reader = tokio::spawn(async move {
        while let Some(message) = stream.next().await {
            match message {
                Ok(Message::Text(text)) => println!("Received from server: {}", text.as_str()),
                Ok(Message::Binary(data)) => {
                    println!("Received from server: {}", String::from_utf8_lossy(&data));
                }
                Ok(Message::Close(_)) => {
                    println!("Server closed the connection");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "Connection error");
                    break;
                }
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = &mut reader => return Ok(()),
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => sink
                    .send(Message::Text(line.into()))
                    .await
                    .context("failed to send message")?,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Failed to read from stdin");
                    break;
                }
            },
        }
    }

    let close = CloseFrame {
        code: CloseCode::Normal,
        reason: CLOSE_REASON.into(),
    };
    sink.send(Message::Close(Some(close)))
        .await
        .context("failed to close connection")?;

    // Give the server a moment to acknowledge the close.
    let _ = tokio::time::timeout(Duration::from_secs(2), reader).await;
    Ok(())
}
