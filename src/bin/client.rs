//! Proxy over SMTP client binary

use anyhow::{Context, Result};
use clap::Parser;
use proxy_over_smtp::config::Config;
use proxy_over_smtp::lifecycle::{Shutdown, wait_for_signal};
use proxy_over_smtp::{AuditLog, Client};
use std::path::{Path, PathBuf};
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

/// Proxy over SMTP client
#[derive(Parser, Debug)]
#[command(name = "proxy-over-smtp-client")]
#[command(about = "Local SOCKS5 endpoint that tunnels through a disguised SMTP session")]
#[command(version = proxy_over_smtp::VERSION)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Local listen address (host:port)
    #[arg(long)]
    listen: Option<String>,

    /// Tunnel server address (host:port)
    #[arg(long)]
    remote: Option<String>,

    /// Shared secret
    #[arg(long)]
    secret: Option<String>,

    /// Audit log file
    #[arg(long)]
    log_file: Option<String>,

    /// One disguised connection per tunnel instead of a multiplexed session
    #[arg(long)]
    direct: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

fn split_addr(addr: &str, flag: &str) -> Result<(String, u16)> {
    let (host, port) = addr
        .rsplit_once(':')
        .with_context(|| format!("--{flag} must be host:port"))?;
    let port = port
        .parse()
        .with_context(|| format!("invalid --{flag} port"))?;
    Ok((host.to_string(), port))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = if args.debug {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Load or create config
    let mut config = if args.config.exists() {
        Config::from_file(&args.config)?
    } else {
        info!("No config file found, using defaults");
        Config::default()
    };

    // Apply command line overrides
    if let Some(listen) = args.listen {
        (config.client.listen_host, config.client.listen_port) = split_addr(&listen, "listen")?;
    }
    if let Some(remote) = args.remote {
        (config.client.remote_host, config.client.remote_port) = split_addr(&remote, "remote")?;
    }
    if let Some(secret) = args.secret {
        config.secret = secret;
    }
    if let Some(log_file) = args.log_file {
        config.audit_log = Some(log_file);
    }
    if args.direct {
        config.multiplex = false;
    }

    config.validate()?;

    let audit = AuditLog::open_or_stdout(config.audit_log.as_deref().map(Path::new));
    let shutdown = Shutdown::new();

    let client = Client::new(&config, audit.clone(), shutdown.clone())?;
    let listener = client
        .bind()
        .await
        .with_context(|| format!("failed to bind {}", config.client.listen_addr()))?;

    let signal = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        signal.trigger();
    });

    client.run(listener).await;

    if shutdown.drain(config.shutdown_grace()).await {
        audit.record("Shutdown Complete.");
    } else {
        audit.record("Shutdown Timed-Out. Forcing Exit.");
    }

    Ok(())
}
