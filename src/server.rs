//! Tunnel server
//!
//! Accepts disguised connections, completes the SMTP-like handshake, switches
//! to the ciphered layer and then, per tunnel, negotiates a destination over
//! SOCKS5 and relays to it.

use crate::audit::AuditLog;
use crate::config::Config;
use crate::crypto::{ObfuscationStream, SharedSecret};
use crate::lifecycle::{Shutdown, with_deadline};
use crate::mux::{MuxConfig, Session};
use crate::proto::smtp;
use crate::relay::{BufferPool, relay};
use crate::{DuplexStream, Error, Result, socks5};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, trace, warn};

/// Tunnel server. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Server {
    inner: Arc<Inner>,
}

struct Inner {
    bind_addr: String,
    hostname: String,
    secret: SharedSecret,
    timeout: Duration,
    multiplex: bool,
    mux: MuxConfig,
    pool: BufferPool,
    audit: AuditLog,
    shutdown: Shutdown,
}

impl Server {
    /// Create a server from validated configuration
    pub fn new(config: &Config, audit: AuditLog, shutdown: Shutdown) -> Result<Self> {
        Ok(Self {
            inner: Arc::new(Inner {
                bind_addr: config.server.bind_addr(),
                hostname: config.server.hostname.clone(),
                secret: config.shared_secret()?,
                timeout: config.timeout(),
                multiplex: config.multiplex,
                mux: MuxConfig::with_keepalive(config.keepalive_interval()),
                pool: BufferPool::new(config.buffer_size),
                audit,
                shutdown,
            }),
        })
    }

    /// Bind the disguised listener.
    pub async fn bind(&self) -> Result<TcpListener> {
        Ok(TcpListener::bind(&self.inner.bind_addr).await?)
    }

    /// Accept connections until shutdown is triggered, then drop the listener.
    pub async fn run(&self, listener: TcpListener) {
        let inner = &self.inner;
        let local = listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| inner.bind_addr.clone());
        inner.audit.record(format!("Server Listening on {local}"));
        info!(
            "Server {} listening on {} (multiplex: {})",
            crate::VERSION,
            local,
            inner.multiplex
        );

        let token = inner.shutdown.token();
        loop {
            let (stream, peer) = tokio::select! {
                biased;

                () = token.cancelled() => break,

                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                        continue;
                    }
                },
            };

            trace!("Connection from {}", peer);
            let server = self.clone();
            inner
                .shutdown
                .spawn(async move { server.serve_connection(stream, peer).await });
        }

        inner.audit.record("Shutting Down Server Listener...");
        drop(listener);
    }

    /// Serve one physical connection until it closes. Failures end only
    /// this connection.
    pub async fn serve_connection(&self, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = self.handle_client(stream, peer).await {
            debug!("Connection from {} ended: {}", peer, e);
        }
    }

    async fn handle_client(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let inner = &self.inner;
        let _ = stream.set_nodelay(true);

        // The buffered reader stays under the cipher so bytes read past the
        // last handshake line are not lost.
        let mut carrier = BufReader::new(stream);
        with_deadline(
            inner.timeout,
            "handshake",
            smtp::server_handshake(&mut carrier, &inner.hostname, &inner.secret),
        )
        .await?;
        let ciphered = ObfuscationStream::new(carrier, inner.secret.clone());

        if !inner.multiplex {
            return self.tunnel(ciphered, peer).await;
        }

        let session = Session::server(ciphered, inner.mux.clone(), &inner.shutdown.token());
        debug!("Multiplexed session with {} established", peer);
        while let Ok(stream) = session.accept().await {
            trace!("Stream {} opened by {}", stream.id(), peer);
            let server = self.clone();
            inner.shutdown.spawn(async move {
                if let Err(e) = server.tunnel(stream, peer).await {
                    debug!("Tunnel from {} ended: {}", peer, e);
                }
            });
        }
        debug!("Multiplexed session with {} closed", peer);
        Ok(())
    }

    /// Negotiate a destination on `stream`, dial it and relay until both
    /// sides are done.
    async fn tunnel<S: DuplexStream>(&self, mut stream: S, peer: SocketAddr) -> Result<()> {
        let inner = &self.inner;

        let request = with_deadline(inner.timeout, "negotiation", socks5::negotiate(&mut stream)).await?;
        let target = request.target();

        let remote = match with_deadline(inner.timeout, "dial", dial(&target)).await {
            Ok(remote) => remote,
            Err(e) => {
                inner.audit.record(format!("Failed to Reach {target}"));
                return Err(e);
            }
        };

        inner.audit.record(format!("Tunnel: {peer} -> {target}"));
        let stats = relay(stream, remote, &inner.pool).await;
        debug!(
            "Tunnel {} -> {} closed ({} bytes up, {} bytes down)",
            peer, target, stats.a_to_b, stats.b_to_a
        );
        Ok(())
    }
}

async fn dial(target: &str) -> Result<TcpStream> {
    let stream = TcpStream::connect(target).await.map_err(|source| Error::Dial {
        target: target.to_string(),
        source,
    })?;
    let _ = stream.set_nodelay(true);
    Ok(stream)
}
