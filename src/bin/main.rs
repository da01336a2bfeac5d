//! App Service Debug Tunnel CLI
//!
//! Opens a local port and relays debugger traffic to a remote site through
//! its authenticated WebSocket tunnel.
//!
//! # Usage
//!
//! ```bash
//! webapp-tunnel --bind-address 127.0.0.1 --port 9229 --user '$contoso' --password SECRET contoso
//! ```
//!
//! A debugger attached to `127.0.0.1:9229` then talks to the process behind
//! `wss://contoso.scm.azurewebsites.net/AppServiceTunnel/Tunnel.ashx`.
//!
//! # Options
//!
//! - `--user` / `--password`: deployment credentials (also `WEBAPP_TUNNEL_USER`,
//!   `WEBAPP_TUNNEL_PASSWORD`)
//! - `--check-status`: query the tunnel status endpoint before listening
//! - `--insecure-skip-tls-verify`: do not validate the tunnel certificate
//! - `-v` or `--verbose`: info-level logging and remote wire tracing

use anyhow::{Context, Result};
use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn, Level};
use webapp_tunnel::config::DEFAULT_HOST_SUFFIX;
use webapp_tunnel::{Credential, TunnelConfig, TunnelSession};

/// Relay a local debugging port through an App Service tunnel
#[derive(Parser, Debug)]
#[command(name = "webapp-tunnel")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Name of the remote site; the first label of the tunnel host name.
    #[arg(value_name = "REMOTE_NAME")]
    remote_name: String,

    /// Local address to listen on.
    #[arg(short = 'a', long)]
    bind_address: IpAddr,

    /// Local port to listen on.
    #[arg(short, long)]
    port: u16,

    /// Deployment user name.
    #[arg(short, long, env = "WEBAPP_TUNNEL_USER")]
    user: String,

    /// Deployment password.
    #[arg(long, env = "WEBAPP_TUNNEL_PASSWORD", hide_env_values = true)]
    password: String,

    /// DNS suffix appended to the remote name.
    #[arg(long, default_value = DEFAULT_HOST_SUFFIX)]
    host_suffix: String,

    /// Base URL replacing `wss://<REMOTE_NAME>.<HOST_SUFFIX>`.
    ///
    /// Override the default site for development or testing.
    #[arg(long)]
    endpoint: Option<String>,

    /// Path to a PEM file containing a root CA certificate to trust.
    ///
    /// The CA is trusted in addition to the default roots when opening the
    /// tunnel stream.
    #[arg(long)]
    trust_ca: Option<PathBuf>,

    /// Do not validate the tunnel endpoint's TLS certificate.
    ///
    /// This weakens transport security. The status check is unaffected.
    #[arg(long)]
    insecure_skip_tls_verify: bool,

    /// Query the tunnel status endpoint before accepting connections.
    #[arg(long)]
    check_status: bool,

    /// Seconds to wait for debugger data before dropping the connection (0 disables).
    #[arg(long, default_value_t = 60)]
    idle_timeout: u64,

    /// Enable verbose logging, including a trace of remote frames.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install crypto provider"))?;

    let log_level = if args.verbose { Level::INFO } else { Level::WARN };
    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    let idle_timeout = match args.idle_timeout {
        0 => None,
        secs => Some(Duration::from_secs(secs)),
    };
    let mut config = TunnelConfig::new(
        args.bind_address,
        args.port,
        &args.remote_name,
        Credential::new(args.user, args.password),
    )
    .with_host_suffix(args.host_suffix)
    .with_accept_invalid_certs(args.insecure_skip_tls_verify)
    .with_trace(args.verbose)
    .with_local_read_timeout(idle_timeout);

    if let Some(endpoint) = args.endpoint {
        config = config.with_endpoint(endpoint);
    }

    if let Some(ca_path) = args.trust_ca {
        config = config.with_trust_ca(ca_path);
    }

    let tunnel_url = config.tunnel_url();
    let mut session = TunnelSession::bind(config)
        .await
        .context("Failed to start local tunnel server")?;
    let local_addr = session.local_addr()?;

    if args.check_status {
        let default_port = session
            .probe_status()
            .await
            .context("Failed to query tunnel status")?;
        if default_port {
            info!("Remote debugging port is at its default value (2222)");
        } else {
            warn!("Remote debugging port is not at its default value (2222)");
        }
    }

    warn!(%local_addr, remote = %tunnel_url, "Opening tunnel");

    tokio::select! {
        _ = session.run() => {}
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl-C")?;
            info!("Interrupted, closing tunnel");
        }
    }

    Ok(())
}
