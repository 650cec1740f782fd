//! tapmesh agent.

use std::path::PathBuf;
use std::sync::Arc;

use agent::config::{default_config_path, AgentConfig};
use agent::tap::FrameDevice;
use agent::Overlay;
use clap::Parser;

/// Peer agent bridging a tap interface onto a tapmesh overlay.
#[derive(Parser, Debug)]
#[command(name = "tapmesh-agent")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Name for the tap interface
    #[arg(long)]
    dev: Option<String>,

    /// MTU for the tap interface
    #[arg(long)]
    mtu: Option<usize>,

    /// Hardware address to claim in the community
    #[arg(long)]
    mac: Option<String>,

    /// Community to join
    #[arg(long)]
    community: Option<String>,

    /// Signaler address
    #[arg(long)]
    raddr: Option<String>,

    /// Comma-separated STUN/TURN servers
    #[arg(long)]
    ice: Option<String>,

    /// Community key (16, 24 or 32 bytes; empty disables encryption)
    #[arg(long)]
    key: Option<String>,

    /// Path to the known-hosts file
    #[arg(long)]
    known_hosts: Option<PathBuf>,

    /// Pin unknown signalers on first contact
    #[arg(long)]
    accept_new: bool,

    /// Skip signaler certificate verification
    #[arg(long)]
    insecure: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    /// Flags override config-file values.
    fn apply_to(&self, config: &mut AgentConfig) {
        if let Some(dev) = &self.dev {
            config.interface.name = dev.clone();
        }
        if let Some(mtu) = self.mtu {
            config.interface.mtu = mtu;
        }
        if let Some(mac) = &self.mac {
            config.interface.mac = mac.clone();
        }
        if let Some(community) = &self.community {
            config.network.community = community.clone();
        }
        if let Some(raddr) = &self.raddr {
            config.network.signaler_url = raddr.clone();
        }
        if let Some(ice) = &self.ice {
            config.network.ice_servers = ice.split(',').map(str::trim).map(String::from).collect();
        }
        if let Some(key) = &self.key {
            config.network.key = key.clone();
        }
        if let Some(known_hosts) = &self.known_hosts {
            config.security.known_hosts = known_hosts.clone();
        }
        if self.accept_new {
            config.security.accept_new = true;
        }
        if self.insecure {
            config.security.insecure = true;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = match &cli.config {
        Some(path) => {
            tracing::info!(path = %path.display(), "using config file");
            AgentConfig::load(path)?
        }
        None => AgentConfig::load(default_config_path())?,
    };
    config.apply_env_overrides();
    cli.apply_to(&mut config);
    config.validate()?;

    let device = open_device(&config)?;
    let overlay = Overlay::new(config, device)?;

    let shutdown = overlay.shutdown_token();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        tracing::info!("received shutdown signal");
        shutdown.cancel();
    });

    overlay.run().await?;

    Ok(())
}

#[cfg(target_os = "linux")]
fn open_device(config: &AgentConfig) -> anyhow::Result<Arc<dyn FrameDevice>> {
    use agent::tap::linux::TapDevice;

    let mac = config.mac().map_err(|err| anyhow::anyhow!("{err}"))?;
    let device = TapDevice::open(&config.interface.name, config.interface.mtu, mac)?;
    tracing::info!(dev = device.name(), mtu = config.interface.mtu, %mac, "tap interface up");

    Ok(Arc::new(device))
}

#[cfg(not(target_os = "linux"))]
fn open_device(_config: &AgentConfig) -> anyhow::Result<Arc<dyn FrameDevice>> {
    anyhow::bail!("the tap adapter is only implemented for Linux")
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
