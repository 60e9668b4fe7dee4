//! Proxy over SMTP
//!
//! A TCP tunnel that makes its wire traffic look like a plaintext SMTP
//! submission session. After a short banner exchange every byte is XORed
//! against the shared secret, optionally multiplexed into many virtual
//! streams, and the server learns each tunnel's destination through a
//! minimal SOCKS5 negotiation.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐      ┌─────────────┐      ┌─────────────┐      ┌──────────────┐
//! │ Application │─────▶│   Client    │─────▶│   Server    │─────▶│  Internet    │
//! │  (Browser)  │ TCP  │  Port 1080  │ SMTP │  Port 465   │ TCP  │              │
//! │             │◀─────│             │◀─────│ SOCKS5 here │◀─────│              │
//! └─────────────┘      └─────────────┘      └─────────────┘      └──────────────┘
//! ```
//!
//! ## Layers
//!
//! ```text
//! TcpStream ─▶ SMTP disguise ─▶ XOR cipher ─▶ [mux session] ─▶ SOCKS5 ─▶ relay
//! ```

pub mod audit;
pub mod client;
pub mod config;
pub mod crypto;
pub mod lifecycle;
pub mod mux;
pub mod proto;
pub mod relay;
pub mod server;
pub mod socks5;

// Re-export commonly used items
pub use audit::AuditLog;
pub use client::{Client, SessionCache, Transport};
pub use config::{ClientConfig, Config, ServerConfig};
pub use crypto::{ObfuscationStream, SharedSecret};
pub use lifecycle::Shutdown;
pub use mux::{MuxConfig, MuxStream, Session};
pub use relay::{BufferPool, relay};
pub use server::Server;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Error types for the tunnel
#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("Unsupported address type: {0:#04x}")]
    UnsupportedAddressType(u8),

    #[error("Failed to reach {target}: {source}")]
    Dial {
        target: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Timed out during {0}")]
    Timeout(&'static str),

    #[error("Session closed")]
    SessionClosed,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<proto::FrameError> for Error {
    fn from(err: proto::FrameError) -> Self {
        match err {
            proto::FrameError::Io(e) => Error::Io(e),
            other => Error::Protocol(other.to_string()),
        }
    }
}

/// Result type for the tunnel
pub type Result<T> = std::result::Result<T, Error>;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Any byte stream a tunnel can run over: a raw TCP connection, an
/// [`ObfuscationStream`], or a multiplexed [`MuxStream`].
///
/// Half-close is `AsyncWrite::poll_shutdown`.
pub trait DuplexStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> DuplexStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// A tunnel stream whose concrete layer is picked at runtime.
pub type BoxedStream = Box<dyn DuplexStream>;
