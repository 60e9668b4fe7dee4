//! SOCKS5 destination negotiation (server role)
//!
//! Only the subset of RFC 1928 a tunnel needs: no authentication, IPv4 or
//! domain destinations, and every request treated as CONNECT.

use crate::{Error, Result};
use std::fmt;
use std::net::Ipv4Addr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// SOCKS5 protocol constants
pub const VERSION: u8 = 0x05;
pub const AUTH_NONE: u8 = 0x00;

/// SOCKS5 commands
pub const CMD_CONNECT: u8 = 0x01;

/// SOCKS5 address types
pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;

/// Reply sent once the request is parsed: succeeded, bound to 0.0.0.0:0
pub const SUCCESS_REPLY: [u8; 10] = [VERSION, 0x00, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0];

/// Destination host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Ipv4(Ipv4Addr),
    Domain(String),
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ipv4(ip) => write!(f, "{ip}"),
            Address::Domain(domain) => f.write_str(domain),
        }
    }
}

/// A parsed destination request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiationRequest {
    pub command: u8,
    pub address: Address,
    pub port: u16,
}

impl NegotiationRequest {
    /// `host:port` as passed to the dialer
    pub fn target(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

async fn read_exact<S>(stream: &mut S, buf: &mut [u8], what: &str) -> Result<()>
where
    S: AsyncRead + Unpin,
{
    stream
        .read_exact(buf)
        .await
        .map(|_| ())
        .map_err(|e| Error::Negotiation(format!("reading {what}: {e}")))
}

/// Negotiate a destination with the SOCKS client on the far end of `stream`.
///
/// On error the caller should drop the stream; no failure reply is sent.
pub async fn negotiate<S>(stream: &mut S) -> Result<NegotiationRequest>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // 1. Greeting
    let mut buf = [0u8; 2];
    read_exact(stream, &mut buf, "greeting").await?;

    if buf[0] != VERSION {
        return Err(Error::Negotiation(format!(
            "wrong SOCKS version {}, please use SOCKS version 5",
            buf[0]
        )));
    }

    // Offered methods are ignored; no authentication is always selected.
    let nmethods = buf[1] as usize;
    let mut methods = vec![0u8; nmethods];
    read_exact(stream, &mut methods, "methods").await?;

    stream.write_all(&[VERSION, AUTH_NONE]).await?;
    stream.flush().await?;

    // 2. Request
    let mut buf = [0u8; 4];
    read_exact(stream, &mut buf, "request").await?;

    let command = buf[1];
    if command != CMD_CONNECT {
        debug!("SOCKS5 command {:#04x} treated as CONNECT", command);
    }

    let address = match buf[3] {
        ATYP_IPV4 => {
            let mut addr = [0u8; 4];
            read_exact(stream, &mut addr, "IPv4 address").await?;
            Address::Ipv4(Ipv4Addr::from(addr))
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            read_exact(stream, &mut len, "domain length").await?;
            let mut domain = vec![0u8; len[0] as usize];
            read_exact(stream, &mut domain, "domain").await?;
            Address::Domain(String::from_utf8_lossy(&domain).into_owned())
        }
        other => return Err(Error::UnsupportedAddressType(other)),
    };

    let mut port = [0u8; 2];
    read_exact(stream, &mut port, "port").await?;
    let port = u16::from_be_bytes(port);

    stream.write_all(&SUCCESS_REPLY).await?;
    stream.flush().await?;

    Ok(NegotiationRequest {
        command,
        address,
        port,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Feed `request` to the negotiator; return its result and every byte it wrote.
    async fn run(request: &[u8]) -> (Result<NegotiationRequest>, Vec<u8>) {
        let (mut server, mut client) = tokio::io::duplex(1024);
        client.write_all(request).await.unwrap();
        client.shutdown().await.unwrap();

        let result = negotiate(&mut server).await;
        drop(server);

        let mut written = Vec::new();
        client.read_to_end(&mut written).await.unwrap();
        (result, written)
    }

    #[tokio::test]
    async fn test_ipv4_request() {
        let (result, written) = run(&[
            0x05, 0x01, 0x00, // greeting, one method
            0x05, 0x01, 0x00, 0x01, 93, 184, 216, 34, 0x00, 80,
        ])
        .await;

        let request = result.unwrap();
        assert_eq!(request.target(), "93.184.216.34:80");
        assert_eq!(request.address, Address::Ipv4(Ipv4Addr::new(93, 184, 216, 34)));

        let mut expected = vec![0x05, 0x00];
        expected.extend_from_slice(&SUCCESS_REPLY);
        assert_eq!(written, expected);
    }

    #[tokio::test]
    async fn test_domain_request() {
        let mut request = vec![0x05, 0x02, 0x00, 0x02, 0x05, 0x01, 0x00, 0x03, 11];
        request.extend_from_slice(b"example.com");
        request.extend_from_slice(&443u16.to_be_bytes());

        let (result, written) = run(&request).await;
        assert_eq!(result.unwrap().target(), "example.com:443");
        assert_eq!(written.len(), 2 + SUCCESS_REPLY.len());
    }

    #[tokio::test]
    async fn test_unsupported_address_type() {
        let mut request = vec![0x05, 0x01, 0x00, 0x05, 0x01, 0x00, 0x04];
        request.extend_from_slice(&[0u8; 18]);

        let (result, written) = run(&request).await;
        assert!(matches!(result, Err(Error::UnsupportedAddressType(0x04))));
        // Only the method selection went out.
        assert_eq!(written, vec![0x05, 0x00]);
    }

    #[tokio::test]
    async fn test_wrong_version() {
        let (result, written) = run(&[0x04, 0x01, 0x00]).await;
        assert!(matches!(result, Err(Error::Negotiation(_))));
        assert!(written.is_empty());
    }

    #[tokio::test]
    async fn test_any_command_is_connect() {
        // BIND (0x02) is accepted and treated like CONNECT.
        let (result, _) = run(&[
            0x05, 0x01, 0x00, 0x05, 0x02, 0x00, 0x01, 10, 0, 0, 1, 0x1f, 0x90,
        ])
        .await;
        let request = result.unwrap();
        assert_eq!(request.command, 0x02);
        assert_eq!(request.target(), "10.0.0.1:8080");
    }

    #[tokio::test]
    async fn test_truncated_request() {
        let (result, _) = run(&[0x05, 0x01, 0x00, 0x05, 0x01, 0x00, 0x01, 127, 0]).await;
        assert!(matches!(result, Err(Error::Negotiation(_))));
    }
}
