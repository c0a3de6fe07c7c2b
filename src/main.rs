//! tls-psk command-line front end.
//!
//! # Architecture Overview
//!
//! ```text
//!   serve:  config → Context(tcp) → Server.start → accept/receive/close logs
//!                                                → signal → Server.stop
//!
//!   send:   config → Context(tcp) → Client.connect → send → wait for replies
//!                                                  → Client.close (deadline or signal)
//! ```

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;

use tls_psk::config::{load_config, TlsPskConfig};
use tls_psk::lifecycle::wait_for_signal;
use tls_psk::observability::{logging, metrics};
use tls_psk::{Context, PresharedKey};

#[derive(Parser)]
#[command(name = "tls-psk", version)]
#[command(about = "PSK-authenticated secure channel server and client", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Listen for PSK clients until interrupted
    Serve {
        #[arg(long)]
        port: Option<u16>,

        /// Hex-encoded pre-shared key
        #[arg(long)]
        key: Option<String>,

        /// Send every received payload back to its sender
        #[arg(long)]
        echo: bool,
    },
    /// Connect, send one message and print any replies
    Send {
        #[arg(long)]
        host: Option<String>,

        #[arg(long)]
        port: Option<u16>,

        /// Hex-encoded pre-shared key
        #[arg(long)]
        key: Option<String>,

        message: String,

        /// How long to wait for replies before closing
        #[arg(long, default_value_t = 500)]
        wait_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => TlsPskConfig::default(),
    };

    logging::init_logging(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "tls-psk starting");

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    match cli.command {
        Commands::Serve { port, key, echo } => {
            let key = resolve_key(key, config.server.key.as_deref())?;
            let port = port.or(config.server.port);
            serve(config, key, port, echo).await
        }
        Commands::Send {
            host,
            port,
            key,
            message,
            wait_ms,
        } => {
            let key = resolve_key(key, config.client.key.as_deref())?;
            let host = host.unwrap_or_else(|| config.client.host.clone());
            let port = port.or(config.client.port).ok_or("no port given")?;
            send(config, key, host, port, message, Duration::from_millis(wait_ms)).await
        }
    }
}

/// Command-line key first, then the configured one.
fn resolve_key(cli: Option<String>, configured: Option<&str>) -> Result<PresharedKey, Box<dyn std::error::Error>> {
    let encoded = cli
        .as_deref()
        .or(configured)
        .ok_or("no pre-shared key given")?;
    Ok(PresharedKey::from_hex(encoded)?)
}

async fn serve(
    config: TlsPskConfig,
    key: PresharedKey,
    port: Option<u16>,
    echo: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let context = Context::tcp(config.transport);
    let server = context.server();

    server.subscribe_accept(|handle| {
        tracing::info!(connection_id = %handle.id(), peer_addr = %handle.peer_addr(), "Client connected");
    });
    server.subscribe_close(|handle| {
        tracing::info!(connection_id = %handle.id(), "Client disconnected");
    });
    server.subscribe_receive(move |handle, bytes| {
        tracing::info!(
            connection_id = %handle.id(),
            len = bytes.len(),
            text = %String::from_utf8_lossy(&bytes),
            "Received"
        );
        if echo {
            let handle = handle.clone();
            tokio::spawn(async move {
                if let Err(e) = handle.send(bytes).await {
                    tracing::warn!(connection_id = %handle.id(), error = %e, "Echo failed");
                }
            });
        }
    });

    let (listener_id, port) = server.start(key, port).await?;
    tracing::info!(listener_id = %listener_id, port, echo, "Listening");

    wait_for_signal().await;

    tracing::info!(connections = context.registry().accepted_count(), "Shutting down");
    server.stop().await?;
    tracing::info!("Shutdown complete");
    Ok(())
}

async fn send(
    config: TlsPskConfig,
    key: PresharedKey,
    host: String,
    port: u16,
    message: String,
    wait: Duration,
) -> Result<(), Box<dyn std::error::Error>> {
    let context = Context::tcp(config.transport);
    let client = context.client();

    let (tx, mut replies) = mpsc::unbounded_channel();
    client.subscribe_receive(move |_, bytes| {
        let _ = tx.send(bytes);
    });

    let id = client.connect(key, host.as_str(), port).await?;
    tracing::info!(connection_id = %id, host = %host, port, "Connected");
    client.send(message).await?;

    let deadline = tokio::time::sleep(wait);
    let interrupted = wait_for_signal();
    tokio::pin!(deadline, interrupted);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = &mut interrupted => break,
            reply = replies.recv() => match reply {
                Some(bytes) => println!("{}", String::from_utf8_lossy(&bytes)),
                None => break,
            },
        }
    }

    if client.is_connected() {
        client.close().await?;
    } else {
        tracing::info!("Server closed the connection");
    }
    Ok(())
}
