//! tapmesh signaling server.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use signaler::{SignalingServer, TlsIdentity};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

/// Signaling server for tapmesh overlay networks.
#[derive(Parser, Debug)]
#[command(name = "tapmesh-signaler")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Listen address
    #[arg(long, default_value = "0.0.0.0:15325")]
    laddr: SocketAddr,

    /// Keep-alive interval and write deadline in seconds
    #[arg(long, default_value = "10")]
    timeout: u64,

    /// Serve TLS with a self-minted Ed25519 certificate
    #[arg(long)]
    tls: bool,

    /// Path to the TLS certificate (minted if absent)
    #[arg(long)]
    tls_cert: Option<PathBuf>,

    /// Path to the TLS private key (minted if absent)
    #[arg(long)]
    tls_key: Option<PathBuf>,

    /// Organization name placed in minted certificates
    #[arg(long, default_value = "tapmesh")]
    organization: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let acceptor = if cli.tls {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tapmesh");
        let cert_path = cli
            .tls_cert
            .unwrap_or_else(|| data_dir.join("signaler.crt"));
        let key_path = cli.tls_key.unwrap_or_else(|| data_dir.join("signaler.key"));

        let identity = TlsIdentity::load_or_mint(&cert_path, &key_path, &cli.organization)?;
        tracing::info!(
            fingerprint = %identity.fingerprint()?,
            "serving TLS; agents pin this fingerprint in their known-hosts file"
        );

        Some(TlsAcceptor::from(identity.server_config()?))
    } else {
        None
    };

    let listener = TcpListener::bind(cli.laddr).await?;
    tracing::info!(laddr = %listener.local_addr()?, tls = cli.tls, "listening");

    let server = Arc::new(SignalingServer::new(Duration::from_secs(cli.timeout)));
    let shutdown = CancellationToken::new();

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        tracing::info!("received shutdown signal");
        signal_token.cancel();
    });

    server.run(listener, acceptor, shutdown).await?;

    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to register SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("Failed to register SIGINT handler");

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
}
