//! Proxy over SMTP server binary

use anyhow::{Context, Result};
use clap::Parser;
use proxy_over_smtp::config::Config;
use proxy_over_smtp::lifecycle::{Shutdown, wait_for_signal};
use proxy_over_smtp::{AuditLog, Server};
use std::path::{Path, PathBuf};
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

/// Proxy over SMTP server
#[derive(Parser, Debug)]
#[command(name = "proxy-over-smtp-server")]
#[command(about = "Accepts disguised tunnels and forwards them to their destinations")]
#[command(version = proxy_over_smtp::VERSION)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Listen address (host:port)
    #[arg(long)]
    listen: Option<String>,

    /// Shared secret
    #[arg(long)]
    secret: Option<String>,

    /// Audit log file
    #[arg(long)]
    log_file: Option<String>,

    /// Hostname announced in the SMTP banner
    #[arg(long)]
    hostname: Option<String>,

    /// One disguised connection per tunnel instead of a multiplexed session
    #[arg(long)]
    direct: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
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

    // Load config
    let mut config = if args.config.exists() {
        Config::from_file(&args.config)?
    } else {
        info!("No config file found, using defaults");
        Config::default()
    };

    // Apply command line overrides
    if let Some(listen) = args.listen {
        let (host, port) = listen
            .rsplit_once(':')
            .context("--listen must be host:port")?;
        config.server.host = host.to_string();
        config.server.port = port.parse().context("invalid --listen port")?;
    }
    if let Some(secret) = args.secret {
        config.secret = secret;
    }
    if let Some(log_file) = args.log_file {
        config.audit_log = Some(log_file);
    }
    if let Some(hostname) = args.hostname {
        config.server.hostname = hostname;
    }
    if args.direct {
        config.multiplex = false;
    }

    config.validate()?;

    let audit = AuditLog::open_or_stdout(config.audit_log.as_deref().map(Path::new));
    let shutdown = Shutdown::new();

    let server = Server::new(&config, audit.clone(), shutdown.clone())?;
    let listener = server
        .bind()
        .await
        .with_context(|| format!("failed to bind {}", config.server.bind_addr()))?;

    let signal = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        signal.trigger();
    });

    server.run(listener).await;

    if shutdown.drain(config.shutdown_grace()).await {
        audit.record("Shutdown Complete.");
    } else {
        audit.record("Shutdown Timed-Out. Forcing Exit.");
    }

    Ok(())
}
