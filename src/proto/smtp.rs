//! SMTP disguise: response builder and the banner exchange both sides run
//! before switching to the ciphered data phase.
use crate::crypto::SharedSecret;
use crate::{Error, Result};
use std::fmt;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

/// Longest handshake line either side will buffer
pub const MAX_LINE_LEN: usize = 1024;

/// Keyword the client sends to enter the data phase
pub const DATA_KEYWORD: &str = "DATA";

/// SMTP response codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseCode(pub u16);

impl ResponseCode {
    pub const READY: Self = Self(220);
    pub const OK: Self = Self(250);
    pub const START_INPUT: Self = Self(354);
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handshake steps, in wire order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Server banner (`220`)
    Greeting,
    /// Client identification line carrying the secret
    Identify,
    /// Server acceptance (`250-`/`250 `)
    Accepted,
    /// Client `DATA` line
    Data,
    /// Server go-ahead (`354`)
    Ready,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Step::Greeting => "greeting",
            Step::Identify => "identify",
            Step::Accepted => "accepted",
            Step::Data => "data",
            Step::Ready => "ready",
        };
        f.write_str(name)
    }
}

/// SMTP response builder
pub struct Response;

impl Response {
    /// Create a simple response
    pub fn new(code: ResponseCode, message: &str) -> String {
        format!("{} {}\r\n", code, message)
    }

    /// Create a multi-line response (last line has space after code)
    pub fn multi_line(code: ResponseCode, lines: &[&str]) -> String {
        if lines.is_empty() {
            return Self::new(code, "");
        }

        let mut result = String::new();
        for (i, line) in lines.iter().enumerate() {
            if i < lines.len() - 1 {
                result.push_str(&format!("{}-{line}\r\n", code));
            } else {
                result.push_str(&format!("{} {line}\r\n", code));
            }
        }
        result
    }

    /// Greeting banner
    pub fn greeting(hostname: &str) -> String {
        Self::new(ResponseCode::READY, &format!("{hostname} ESMTP"))
    }

    /// Reply to an accepted EHLO
    pub fn ehlo_accepted() -> String {
        Self::multi_line(ResponseCode::OK, &["OK", "STARTTLS"])
    }

    /// Go-ahead for the data phase
    pub fn start_input() -> String {
        Self::new(ResponseCode::START_INPUT, "Go ahead")
    }
}

fn mismatch(step: Step, detail: impl fmt::Display) -> Error {
    Error::Handshake(format!("{step}: {detail}"))
}

/// Read one `\n`-terminated line of at most [`MAX_LINE_LEN`] bytes.
async fn read_line<R>(reader: &mut R, step: Step) -> Result<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::with_capacity(128);
    let n = (&mut *reader)
        .take(MAX_LINE_LEN as u64)
        .read_until(b'\n', &mut line)
        .await
        .map_err(|e| mismatch(step, e))?;

    if n == 0 {
        return Err(mismatch(step, "connection closed"));
    }
    if line.last() != Some(&b'\n') {
        if n >= MAX_LINE_LEN {
            return Err(mismatch(step, "line too long"));
        }
        return Err(mismatch(step, "connection closed mid-line"));
    }
    Ok(line)
}

async fn send<W>(writer: &mut W, step: Step, bytes: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(bytes)
        .await
        .map_err(|e| mismatch(step, e))?;
    writer.flush().await.map_err(|e| mismatch(step, e))
}

/// Run the server side of the disguise.
///
/// `stream` should be a buffered reader over the physical connection; once
/// this returns `Ok`, the same reader must carry the ciphered layer so no
/// buffered byte is lost.
pub async fn server_handshake<S>(stream: &mut S, hostname: &str, secret: &SharedSecret) -> Result<()>
where
    S: AsyncBufRead + AsyncWrite + Unpin,
{
    send(stream, Step::Greeting, Response::greeting(hostname).as_bytes()).await?;

    // Substring match: the secret may sit anywhere in the identification line.
    let line = read_line(stream, Step::Identify).await?;
    if !secret.is_contained_in(&line) {
        return Err(mismatch(Step::Identify, "secret not presented"));
    }

    send(stream, Step::Accepted, Response::ehlo_accepted().as_bytes()).await?;

    let line = read_line(stream, Step::Data).await?;
    if !String::from_utf8_lossy(&line).contains(DATA_KEYWORD) {
        return Err(mismatch(
            Step::Data,
            format!("expected {DATA_KEYWORD}, got {:?}", String::from_utf8_lossy(&line).trim_end()),
        ));
    }

    send(stream, Step::Ready, Response::start_input().as_bytes()).await?;
    debug!("Server handshake complete");
    Ok(())
}

/// Run the client side of the disguise.
pub async fn client_handshake<S>(stream: &mut S, secret: &SharedSecret) -> Result<()>
where
    S: AsyncBufRead + AsyncWrite + Unpin,
{
    let line = read_line(stream, Step::Greeting).await?;
    let text = String::from_utf8_lossy(&line);
    if !text.starts_with("220") {
        return Err(mismatch(Step::Greeting, format!("unexpected {:?}", text.trim_end())));
    }
    trace!("Server greeting: {}", text.trim_end());

    let mut ehlo = Vec::with_capacity(secret.as_bytes().len() + 7);
    ehlo.extend_from_slice(b"EHLO ");
    ehlo.extend_from_slice(secret.as_bytes());
    ehlo.extend_from_slice(b"\r\n");
    send(stream, Step::Identify, &ehlo).await?;

    // Read EHLO response (multi-line)
    loop {
        let line = read_line(stream, Step::Accepted).await?;
        let text = String::from_utf8_lossy(&line);
        trace!("EHLO response: {}", text.trim_end());

        if text.starts_with("250 ") {
            break;
        }
        if !text.starts_with("250-") {
            return Err(mismatch(Step::Accepted, format!("unexpected {:?}", text.trim_end())));
        }
    }

    send(stream, Step::Data, format!("{DATA_KEYWORD}\r\n").as_bytes()).await?;

    let line = read_line(stream, Step::Ready).await?;
    let text = String::from_utf8_lossy(&line);
    if !text.starts_with("354") {
        return Err(mismatch(Step::Ready, format!("unexpected {:?}", text.trim_end())));
    }

    debug!("Client handshake complete");
    Ok(())
}
