//! Configuration management

use crate::crypto::SharedSecret;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Secret used when none is configured. Works, but every deployment should
/// override it.
pub const DEFAULT_SECRET: &str = "THIS_IS_YOUR_SECRET_WORD";

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Listen address
    #[serde(default = "default_host")]
    pub host: String,
    /// Listen port (default: 465)
    #[serde(default = "default_port")]
    pub port: u16,
    /// Hostname advertised in the SMTP banner
    #[serde(default = "default_hostname")]
    pub hostname: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            hostname: default_hostname(),
        }
    }
}

/// Client configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// Local bind address for SOCKS clients
    #[serde(default = "default_host")]
    pub listen_host: String,
    /// Local bind port
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Tunnel server host
    #[serde(default = "default_remote_host")]
    pub remote_host: String,
    /// Tunnel server port
    #[serde(default = "default_port")]
    pub remote_port: u16,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            listen_host: default_host(),
            listen_port: default_listen_port(),
            remote_host: default_remote_host(),
            remote_port: default_port(),
        }
    }
}

/// Full configuration file (shared settings + server + client)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Shared secret, used as the handshake credential and the XOR key
    #[serde(default = "default_secret")]
    pub secret: String,
    /// Deadline for handshake, negotiation and dialing, in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Carry many tunnels over one disguised connection
    #[serde(default = "default_true")]
    pub multiplex: bool,
    /// Multiplex keep-alive interval, in seconds
    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,
    /// How long in-flight connections get to finish on shutdown, in seconds
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    /// Relay buffer size in bytes
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Audit log file (appended to; stdout always receives audit lines)
    #[serde(default = "default_audit_log")]
    pub audit_log: Option<String>,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub client: ClientConfig,
}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    465
}
fn default_listen_port() -> u16 {
    1080
}
fn default_remote_host() -> String {
    "127.0.0.1".to_string()
}
fn default_hostname() -> String {
    "mail.google.com".to_string()
}
fn default_secret() -> String {
    DEFAULT_SECRET.to_string()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_keepalive_interval_secs() -> u64 {
    15
}
fn default_shutdown_grace_secs() -> u64 {
    5
}
fn default_buffer_size() -> usize {
    32 * 1024
}
fn default_audit_log() -> Option<String> {
    Some("./proxy-over-smtp.log".to_string())
}
fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject settings the tunnel cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.secret.is_empty() {
            return Err(Error::InvalidConfig("secret must not be empty".into()));
        }
        if self.timeout_secs == 0 {
            return Err(Error::InvalidConfig("timeout_secs must be positive".into()));
        }
        if self.keepalive_interval_secs == 0 {
            return Err(Error::InvalidConfig(
                "keepalive_interval_secs must be positive".into(),
            ));
        }
        if self.buffer_size == 0 {
            return Err(Error::InvalidConfig("buffer_size must be positive".into()));
        }
        if self.secret == DEFAULT_SECRET {
            warn!("Using the built-in default secret; set `secret` before deploying");
        }
        Ok(())
    }

    /// The validated shared secret
    pub fn shared_secret(&self) -> Result<SharedSecret> {
        SharedSecret::new(&self.secret)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            secret: default_secret(),
            timeout_secs: default_timeout_secs(),
            multiplex: true,
            keepalive_interval_secs: default_keepalive_interval_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            buffer_size: default_buffer_size(),
            audit_log: default_audit_log(),
            server: ServerConfig::default(),
            client: ClientConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Address to bind the disguised listener to
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl ClientConfig {
    /// Local address SOCKS clients connect to
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.listen_host, self.listen_port)
    }

    /// Tunnel server address
    pub fn remote_addr(&self) -> String {
        format!("{}:{}", self.remote_host, self.remote_port)
    }
}

/// Generate example configuration
pub fn generate_example_config() -> String {
    r#"# Proxy over SMTP configuration
# Copy this file and customize for your setup

# ============================================================================
# Shared settings (must match on client and server)
# ============================================================================

# Shared secret: sent in the EHLO line and used as the XOR key
secret: "change-me"

# Carry all tunnels over one disguised connection (both sides must agree)
multiplex: true

# Handshake, negotiation and dial deadline
timeout_secs: 30

# Multiplex keep-alive interval
keepalive_interval_secs: 15

# Grace period for in-flight connections on shutdown
shutdown_grace_secs: 5

# Relay buffer size
buffer_size: 32768

# Audit log (appended to)
audit_log: "./proxy-over-smtp.log"

# ============================================================================
# Server (proxy-over-smtp-server)
# ============================================================================
server:
  host: "0.0.0.0"
  port: 465
  # Hostname shown in the 220 banner
  hostname: "mail.google.com"

# ============================================================================
# Client (proxy-over-smtp-client)
# ============================================================================
client:
  # Local SOCKS5 endpoint
  listen_host: "127.0.0.1"
  listen_port: 1080

  # Tunnel server
  remote_host: "mail.example.com"
  remote_port: 465
"#
    .to_string()
}
