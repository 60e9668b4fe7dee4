//! Bidirectional relay between two duplex streams

use std::io;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

/// Default relay buffer size (32KB)
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

/// Idle buffers kept for reuse; extras are freed on return.
const MAX_POOLED: usize = 1024;

/// Shared pool of fixed-size copy buffers
#[derive(Debug, Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

#[derive(Debug)]
struct PoolInner {
    size: usize,
    free: Mutex<Vec<Box<[u8]>>>,
}

impl BufferPool {
    pub fn new(size: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                size,
                free: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Borrow a buffer; it goes back to the pool when dropped.
    pub fn get(&self) -> PooledBuffer {
        let buf = self
            .inner
            .free
            .lock()
            .ok()
            .and_then(|mut free| free.pop())
            .unwrap_or_else(|| vec![0u8; self.inner.size].into_boxed_slice());
        PooledBuffer {
            buf: Some(buf),
            pool: Arc::clone(&self.inner),
        }
    }

    /// Buffers currently idle in the pool
    pub fn idle(&self) -> usize {
        self.inner.free.lock().map(|free| free.len()).unwrap_or(0)
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE)
    }
}

/// A buffer on loan from a [`BufferPool`]
#[derive(Debug)]
pub struct PooledBuffer {
    buf: Option<Box<[u8]>>,
    pool: Arc<PoolInner>,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or_default()
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or_default()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let (Some(buf), Ok(mut free)) = (self.buf.take(), self.pool.free.lock()) {
            if free.len() < MAX_POOLED {
                free.push(buf);
            }
        }
    }
}

/// Bytes moved by one [`relay`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub a_to_b: u64,
    pub b_to_a: u64,
}

/// Copy `src` into `dst` until EOF or error, then half-close `dst`.
async fn pump<R, W>(mut src: R, mut dst: W, pool: BufferPool) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = pool.get();
    let mut total = 0u64;

    let result: io::Result<()> = async {
        loop {
            let n = src.read(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }
            dst.write_all(&buf[..n]).await?;
            total += n as u64;
        }
    }
    .await;

    if let Err(e) = result {
        debug!("Relay leg ended with error after {} bytes: {}", total, e);
    }

    // Signal EOF downstream; the peer may still be sending the other way.
    if let Err(e) = dst.shutdown().await {
        trace!("Half-close failed: {}", e);
    }
    total
}

/// Pump bytes both ways between `a` and `b` until both directions reach EOF
/// (or fail). Each direction half-closes its destination when its source
/// ends. Both streams are dropped, and so closed, on return.
///
/// Both directions run inside the returned future, so dropping it (as
/// shutdown does) closes both streams immediately.
pub async fn relay<A, B>(a: A, b: B, pool: &BufferPool) -> RelayStats
where
    A: AsyncRead + AsyncWrite,
    B: AsyncRead + AsyncWrite,
{
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);

    let (a_to_b, b_to_a) = tokio::join!(
        pump(a_read, b_write, pool.clone()),
        pump(b_read, a_write, pool.clone()),
    );
    let stats = RelayStats { a_to_b, b_to_a };
    trace!("Relay finished: {:?}", stats);
    stats
}
