//! # vitrine-brokerd
//!
//! Broker server binary: layers command-line flags over an optional TOML
//! config file, loads TLS material, and runs the broker until `SIGINT` or
//! `SIGTERM`.

#![deny(unsafe_code)]

mod tls;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{info, warn};
use vitrine_broker::{shutdown, Broker, BrokerConfig};

/// Websocket event broker for display fleets.
#[derive(Parser, Debug)]
#[command(name = "vitrine-brokerd", about = "Websocket event broker for display fleets")]
struct Cli {
    /// Listen address.
    #[arg(long = "addr")]
    addr: Option<String>,

    /// Advertised external address.
    #[arg(long = "ext")]
    external: Option<String>,

    /// Upstream NTP server (host or host:port).
    #[arg(long)]
    ntp: Option<String>,

    /// Number of delivery workers.
    #[arg(long)]
    workers: Option<usize>,

    /// Disable identity enforcement (development only).
    #[arg(long)]
    debug: bool,

    /// Web folder served under /static.
    #[arg(long)]
    web: Option<PathBuf>,

    /// Path to a TOML config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Server certificate chain (PEM); enables TLS together with --key.
    #[arg(long)]
    cert: Option<PathBuf>,

    /// Server private key (PEM).
    #[arg(long)]
    key: Option<PathBuf>,

    /// CA bundle for verifying display client certificates (PEM).
    #[arg(long = "client-ca")]
    client_ca: Option<PathBuf>,

    /// Log filter when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Config file first, flags win.
fn load_config(cli: &Cli) -> Result<BrokerConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("cannot read config file {}", path.display()))?;
            toml::from_str(&text)
                .with_context(|| format!("cannot parse config file {}", path.display()))?
        }
        None => BrokerConfig::default(),
    };
    if let Some(addr) = &cli.addr {
        config.local_addr = addr.clone();
    }
    if let Some(external) = &cli.external {
        config.external_addr = external.clone();
    }
    if let Some(ntp) = &cli.ntp {
        config.ntp_host = ntp.clone();
    }
    if let Some(workers) = cli.workers {
        config.num_workers = workers;
    }
    if cli.debug {
        config.debug = true;
    }
    if let Some(web) = &cli.web {
        config.web_folder = Some(web.clone());
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let config = load_config(&cli)?;

    let tls = match (&cli.cert, &cli.key) {
        (Some(cert), Some(key)) => Some(tls::server_config(
            cert,
            key,
            cli.client_ca.as_deref(),
        )?),
        (None, None) => None,
        _ => bail!("--cert and --key must be given together"),
    };
    if tls.is_none() && !config.debug {
        warn!("running without TLS: no display can prove its identity, every upgrade will be refused");
    }

    let broker = Broker::new(config);
    let (addr, listener) = broker
        .listen(tls)
        .await
        .context("cannot start listener")?;
    info!(%addr, external = %broker.config().external_addr, "broker ready");

    shutdown::wait_for_signal().await;
    broker.stop().await;
    if tokio::time::timeout(Duration::from_secs(5), listener)
        .await
        .is_err()
    {
        warn!("listener did not stop within the grace period");
    }
    Ok(())
}
