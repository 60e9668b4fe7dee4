//! Repeating-key XOR obfuscation for the tunnel's data phase
//!
//! This is camouflage, not confidentiality: anyone holding the secret can
//! read the stream, and nothing detects tampering.

use crate::{Error, Result};
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf, ReadHalf, WriteHalf};

/// The shared secret both ends are configured with.
///
/// Never empty.
#[derive(Clone, PartialEq, Eq)]
pub struct SharedSecret(Arc<[u8]>);

impl SharedSecret {
    pub fn new(secret: impl AsRef<[u8]>) -> Result<Self> {
        let bytes = secret.as_ref();
        if bytes.is_empty() {
            return Err(Error::InvalidConfig("secret must not be empty".into()));
        }
        Ok(Self(Arc::from(bytes)))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Whether `haystack` contains the secret anywhere
    pub fn is_contained_in(&self, haystack: &[u8]) -> bool {
        haystack.windows(self.0.len()).any(|w| w == &*self.0)
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SharedSecret(<{} bytes>)", self.0.len())
    }
}

/// One direction's position in the repeating key.
#[derive(Debug, Clone)]
struct Keystream {
    key: SharedSecret,
    pos: usize,
}

impl Keystream {
    fn new(key: SharedSecret) -> Self {
        Self { key, pos: 0 }
    }

    /// XOR `buf` against the key starting at the current position, without
    /// moving it.
    fn apply(&self, buf: &mut [u8]) {
        let key = self.key.as_bytes();
        for (i, b) in buf.iter_mut().enumerate() {
            *b ^= key[(self.pos + i) % key.len()];
        }
    }

    fn advance(&mut self, n: usize) {
        self.pos = (self.pos + n) % self.key.as_bytes().len();
    }
}

fn poll_read_xor<R: AsyncRead + Unpin>(
    inner: &mut R,
    keystream: &mut Keystream,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
) -> Poll<io::Result<()>> {
    let before = buf.filled().len();
    ready!(Pin::new(inner).poll_read(cx, buf))?;
    let fresh = &mut buf.filled_mut()[before..];
    keystream.apply(fresh);
    keystream.advance(fresh.len());
    Poll::Ready(Ok(()))
}

fn poll_write_xor<W: AsyncWrite + Unpin>(
    inner: &mut W,
    keystream: &mut Keystream,
    scratch: &mut Vec<u8>,
    cx: &mut Context<'_>,
    buf: &[u8],
) -> Poll<io::Result<usize>> {
    scratch.clear();
    scratch.extend_from_slice(buf);
    keystream.apply(scratch);
    // Only bytes the carrier accepted consume keystream.
    let n = ready!(Pin::new(inner).poll_write(cx, scratch))?;
    keystream.advance(n);
    Poll::Ready(Ok(n))
}

/// A duplex stream whose bytes are XORed with the shared secret in both
/// directions, each direction keeping its own key position.
#[derive(Debug)]
pub struct ObfuscationStream<S> {
    inner: S,
    read: Keystream,
    write: Keystream,
    scratch: Vec<u8>,
}

impl<S> ObfuscationStream<S> {
    pub fn new(inner: S, secret: SharedSecret) -> Self {
        Self {
            inner,
            read: Keystream::new(secret.clone()),
            write: Keystream::new(secret),
            scratch: Vec::new(),
        }
    }
}

impl<S> ObfuscationStream<S>
where
    S: AsyncRead + AsyncWrite,
{
    /// Split into independently owned halves so each direction can be driven
    /// from its own task. Key positions carry over.
    pub fn into_split(self) -> (ObfuscatedReader<ReadHalf<S>>, ObfuscatedWriter<WriteHalf<S>>) {
        let (r, w) = tokio::io::split(self.inner);
        (
            ObfuscatedReader {
                inner: r,
                keystream: self.read,
            },
            ObfuscatedWriter {
                inner: w,
                keystream: self.write,
                scratch: self.scratch,
            },
        )
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ObfuscationStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        poll_read_xor(&mut this.inner, &mut this.read, cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ObfuscationStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        poll_write_xor(&mut this.inner, &mut this.write, &mut this.scratch, cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Read half of a split [`ObfuscationStream`]
#[derive(Debug)]
pub struct ObfuscatedReader<R> {
    inner: R,
    keystream: Keystream,
}

impl<R> ObfuscatedReader<R> {
    pub fn new(inner: R, secret: SharedSecret) -> Self {
        Self {
            inner,
            keystream: Keystream::new(secret),
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ObfuscatedReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        poll_read_xor(&mut this.inner, &mut this.keystream, cx, buf)
    }
}

/// Write half of a split [`ObfuscationStream`]
#[derive(Debug)]
pub struct ObfuscatedWriter<W> {
    inner: W,
    keystream: Keystream,
    scratch: Vec<u8>,
}

impl<W> ObfuscatedWriter<W> {
    pub fn new(inner: W, secret: SharedSecret) -> Self {
        Self {
            inner,
            keystream: Keystream::new(secret),
            scratch: Vec::new(),
        }
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for ObfuscatedWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        poll_write_xor(&mut this.inner, &mut this.keystream, &mut this.scratch, cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn secret() -> SharedSecret {
        SharedSecret::new("k3y!s").unwrap()
    }

    /// Reference keystream: `data` XORed with the key starting at `pos`.
    fn xor_at(key: &[u8], pos: usize, data: &[u8]) -> Vec<u8> {
        data.iter()
            .enumerate()
            .map(|(i, b)| b ^ key[(pos + i) % key.len()])
            .collect()
    }

    /// Writer that accepts at most `limit` bytes per call.
    struct Trickle {
        limit: usize,
        written: Vec<u8>,
    }

    impl AsyncWrite for Trickle {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            let this = self.get_mut();
            let n = buf.len().min(this.limit);
            this.written.extend_from_slice(&buf[..n]);
            Poll::Ready(Ok(n))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[test]
    fn test_empty_secret_rejected() {
        assert!(SharedSecret::new("").is_err());
    }

    #[test]
    fn test_keystream_position_wraps() {
        let secret = SharedSecret::new("abc").unwrap();
        let mut keystream = Keystream::new(secret);
        keystream.advance(7);
        assert_eq!(keystream.pos, 1);

        let mut buf = [0u8; 2];
        keystream.apply(&mut buf);
        assert_eq!(buf, [b'b', b'c']);
    }

    #[test]
    fn test_secret_containment() {
        let s = SharedSecret::new("hunter2").unwrap();
        assert!(s.is_contained_in(b"EHLO hunter2\r\n"));
        assert!(s.is_contained_in(b"xxhunter2xx"));
        assert!(!s.is_contained_in(b"EHLO hunter\r\n"));
        assert!(!s.is_contained_in(b"hun"));
    }

    #[tokio::test]
    async fn test_involution_across_chunks() {
        let data: Vec<u8> = (0..5000u32).map(|i| (i * 31 % 251) as u8).collect();
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut sender = ObfuscationStream::new(a, secret());
        let mut receiver = ObfuscationStream::new(b, secret());

        for chunk in data.chunks(7) {
            sender.write_all(chunk).await.unwrap();
        }
        sender.shutdown().await.unwrap();

        let mut out = Vec::new();
        let mut buf = [0u8; 13];
        loop {
            let n = receiver.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn test_wire_bytes_are_keyed() {
        let (a, mut raw) = tokio::io::duplex(1024);
        let mut stream = ObfuscationStream::new(a, secret());
        stream.write_all(b"hello world").await.unwrap();

        let mut wire = [0u8; 11];
        raw.read_exact(&mut wire).await.unwrap();
        assert_eq!(wire.to_vec(), xor_at(b"k3y!s", 0, b"hello world"));
    }

    #[tokio::test]
    async fn test_directions_keep_separate_positions() {
        let key = b"k3y!s";
        let (a, mut raw) = tokio::io::duplex(1024);
        let mut stream = ObfuscationStream::new(a, secret());

        stream.write_all(b"abc").await.unwrap();
        let mut wire = [0u8; 3];
        raw.read_exact(&mut wire).await.unwrap();
        assert_eq!(wire.to_vec(), xor_at(key, 0, b"abc"));

        raw.write_all(&xor_at(key, 0, b"12345")).await.unwrap();
        let mut plain = [0u8; 5];
        stream.read_exact(&mut plain).await.unwrap();
        assert_eq!(&plain, b"12345");

        // Write position is still 3 even though reads advanced to 5.
        stream.write_all(b"def").await.unwrap();
        raw.read_exact(&mut wire).await.unwrap();
        assert_eq!(wire.to_vec(), xor_at(key, 3, b"def"));

        raw.write_all(&xor_at(key, 5, b"xy")).await.unwrap();
        let mut plain = [0u8; 2];
        stream.read_exact(&mut plain).await.unwrap();
        assert_eq!(&plain, b"xy");
    }

    #[tokio::test]
    async fn test_partial_writes_stay_in_sync() {
        let data = b"partial writes must not skip any keystream bytes";
        let mut writer = ObfuscatedWriter::new(
            Trickle {
                limit: 3,
                written: Vec::new(),
            },
            secret(),
        );
        writer.write_all(data).await.unwrap();
        assert_eq!(writer.inner.written, xor_at(b"k3y!s", 0, data));
    }

    #[tokio::test]
    async fn test_split_halves_run_concurrently() {
        let (a, b) = tokio::io::duplex(4096);

        // Echo the raw wire bytes back; each direction's keystream undoes itself.
        tokio::spawn(async move {
            let (mut r, mut w) = tokio::io::split(b);
            let _ = tokio::io::copy(&mut r, &mut w).await;
        });

        let (mut reader, mut writer) = ObfuscationStream::new(a, secret()).into_split();
        let data: Vec<u8> = (0..20_000u32).map(|i| (i % 256) as u8).collect();
        let expected = data.clone();

        let write = tokio::spawn(async move {
            for chunk in data.chunks(1000) {
                writer.write_all(chunk).await.unwrap();
            }
            writer.shutdown().await.unwrap();
        });

        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        write.await.unwrap();
        assert_eq!(out, expected);
    }
}
