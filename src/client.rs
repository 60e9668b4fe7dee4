//! Tunnel client
//!
//! Listens locally for SOCKS clients and carries each of their connections
//! to the tunnel server, either over its own disguised connection or as a
//! stream of one shared multiplexed session.

use crate::audit::AuditLog;
use crate::config::Config;
use crate::crypto::{ObfuscationStream, SharedSecret};
use crate::lifecycle::{Shutdown, with_deadline};
use crate::mux::{MuxConfig, MuxStream, Session};
use crate::proto::smtp;
use crate::relay::{BufferPool, relay};
use crate::{BoxedStream, Error, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Ciphered carrier produced by [`Connector::connect`]
pub type Carrier = ObfuscationStream<BufReader<TcpStream>>;

/// Dials the tunnel server and completes the disguise.
#[derive(Debug, Clone)]
pub struct Connector {
    remote: String,
    secret: SharedSecret,
    timeout: Duration,
}

impl Connector {
    pub fn new(remote: impl Into<String>, secret: SharedSecret, timeout: Duration) -> Self {
        Self {
            remote: remote.into(),
            secret,
            timeout,
        }
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    /// Dial, run the client handshake and wrap the connection in the
    /// cipher, all under one deadline.
    pub async fn connect(&self) -> Result<Carrier> {
        with_deadline(self.timeout, "handshake", async {
            let stream = TcpStream::connect(&self.remote)
                .await
                .map_err(|source| Error::Dial {
                    target: self.remote.clone(),
                    source,
                })?;
            let _ = stream.set_nodelay(true);

            let mut carrier = BufReader::new(stream);
            smtp::client_handshake(&mut carrier, &self.secret).await?;
            Ok::<_, Error>(ObfuscationStream::new(carrier, self.secret.clone()))
        })
        .await
    }
}

/// Holds at most one live multiplexed session and hands out streams on it,
/// establishing a new session only when the cached one has died.
#[derive(Debug)]
pub struct SessionCache {
    connector: Connector,
    config: MuxConfig,
    cancel: CancellationToken,
    slot: Mutex<Option<Session>>,
}

impl SessionCache {
    pub fn new(connector: Connector, config: MuxConfig, cancel: CancellationToken) -> Self {
        Self {
            connector,
            config,
            cancel,
            slot: Mutex::new(None),
        }
    }

    /// The cached session if alive, otherwise a freshly established one.
    pub async fn get(&self) -> Result<Session> {
        let mut slot = self.slot.lock().await;
        if let Some(session) = slot.as_ref().filter(|s| s.is_alive()) {
            return Ok(session.clone());
        }
        if slot.take().is_some() {
            debug!("Cached session is gone, establishing a new one");
        }

        let carrier = self.connector.connect().await?;
        let session = Session::client(carrier, self.config.clone(), &self.cancel);
        info!("Multiplexed session to {} established", self.connector.remote());
        *slot = Some(session.clone());
        Ok(session)
    }

    /// Open a stream on the shared session.
    pub async fn open(&self) -> Result<MuxStream> {
        self.get().await?.open()
    }

    /// Close the cached session, if any.
    pub async fn close(&self) {
        if let Some(session) = self.slot.lock().await.take() {
            session.close();
        }
    }
}

/// How each local connection reaches the server
#[derive(Debug)]
pub enum Transport {
    /// One disguised connection per local connection
    Direct(Connector),
    /// Streams of one cached multiplexed session
    Multiplexed(SessionCache),
}

impl Transport {
    pub fn from_config(config: &Config, cancel: CancellationToken) -> Result<Self> {
        let connector = Connector::new(
            config.client.remote_addr(),
            config.shared_secret()?,
            config.timeout(),
        );
        Ok(if config.multiplex {
            Transport::Multiplexed(SessionCache::new(
                connector,
                MuxConfig::with_keepalive(config.keepalive_interval()),
                cancel,
            ))
        } else {
            Transport::Direct(connector)
        })
    }

    /// A fresh ciphered stream to the server, ready for negotiation.
    pub async fn open(&self) -> Result<BoxedStream> {
        match self {
            Transport::Direct(connector) => Ok(Box::new(connector.connect().await?)),
            Transport::Multiplexed(cache) => Ok(Box::new(cache.open().await?)),
        }
    }
}

/// Tunnel client. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

struct Inner {
    listen_addr: String,
    remote_addr: String,
    transport: Transport,
    pool: BufferPool,
    audit: AuditLog,
    shutdown: Shutdown,
}

impl Client {
    /// Create a client from validated configuration
    pub fn new(config: &Config, audit: AuditLog, shutdown: Shutdown) -> Result<Self> {
        Ok(Self {
            inner: Arc::new(Inner {
                listen_addr: config.client.listen_addr(),
                remote_addr: config.client.remote_addr(),
                transport: Transport::from_config(config, shutdown.token())?,
                pool: BufferPool::new(config.buffer_size),
                audit,
                shutdown,
            }),
        })
    }

    /// Bind the local listener.
    pub async fn bind(&self) -> Result<TcpListener> {
        Ok(TcpListener::bind(&self.inner.listen_addr).await?)
    }

    /// Accept local connections until shutdown is triggered, then drop the
    /// listener.
    pub async fn run(&self, listener: TcpListener) {
        let inner = &self.inner;
        let local = listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| inner.listen_addr.clone());
        inner
            .audit
            .record(format!("Client Listening on {} -> Tunnel to {}", local, inner.remote_addr));
        info!("Client {} listening on {}", crate::VERSION, local);

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

            trace!("Local connection from {}", peer);
            let client = self.clone();
            inner
                .shutdown
                .spawn(async move { client.serve_connection(stream, peer).await });
        }

        inner.audit.record("Shutting Down Client Listener...");
        drop(listener);
        if let Transport::Multiplexed(cache) = &inner.transport {
            cache.close().await;
        }
    }

    /// Carry one local connection to the server and relay until both sides
    /// are done.
    pub async fn serve_connection(&self, local: TcpStream, peer: SocketAddr) {
        let _ = local.set_nodelay(true);
        let remote = match self.inner.transport.open().await {
            Ok(remote) => remote,
            Err(e) => {
                debug!("Could not reach tunnel server for {}: {}", peer, e);
                return;
            }
        };

        let stats = relay(local, remote, &self.inner.pool).await;
        debug!(
            "Connection from {} closed ({} bytes up, {} bytes down)",
            peer, stats.a_to_b, stats.b_to_a
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::smtp::server_handshake;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Accept disguised connections, counting them, and serve each as a
    /// multiplexed session that just holds its streams.
    async fn fake_server(secret: SharedSecret) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let dials = Arc::new(AtomicUsize::new(0));

        let count = dials.clone();
        tokio::spawn(async move {
            let cancel = CancellationToken::new();
            while let Ok((stream, _)) = listener.accept().await {
                count.fetch_add(1, Ordering::SeqCst);
                let mut carrier = BufReader::new(stream);
                if server_handshake(&mut carrier, "mail.test", &secret).await.is_ok() {
                    let session = Session::server(
                        ObfuscationStream::new(carrier, secret.clone()),
                        MuxConfig::default(),
                        &cancel,
                    );
                    tokio::spawn(async move {
                        let mut held = Vec::new();
                        while let Ok(stream) = session.accept().await {
                            held.push(stream);
                        }
                    });
                }
            }
        });
        (addr, dials)
    }

    #[tokio::test]
    async fn test_session_cache_reuses_live_session() {
        let secret = SharedSecret::new("cache-secret").unwrap();
        let (addr, dials) = fake_server(secret.clone()).await;

        let cache = SessionCache::new(
            Connector::new(addr, secret, Duration::from_secs(2)),
            MuxConfig::default(),
            CancellationToken::new(),
        );

        let first = cache.open().await.unwrap();
        let second = cache.open().await.unwrap();
        assert_eq!(first.id(), 1);
        assert_eq!(second.id(), 3);
        assert_eq!(dials.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_session_cache_replaces_dead_session() {
        let secret = SharedSecret::new("cache-secret").unwrap();
        let (addr, dials) = fake_server(secret.clone()).await;

        let cache = SessionCache::new(
            Connector::new(addr, secret, Duration::from_secs(2)),
            MuxConfig::default(),
            CancellationToken::new(),
        );

        let session = cache.get().await.unwrap();
        session.close();
        assert!(!session.is_alive());

        let replacement = cache.get().await.unwrap();
        assert!(replacement.is_alive());
        assert_eq!(dials.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_connect_fails_without_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let connector = Connector::new(
            addr,
            SharedSecret::new("s").unwrap(),
            Duration::from_secs(2),
        );
        assert!(matches!(connector.connect().await, Err(Error::Dial { .. })));
    }
}
