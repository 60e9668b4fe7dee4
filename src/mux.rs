//! Stream multiplexing over one ciphered connection
//!
//! A [`Session`] carries many independent [`MuxStream`]s over a single
//! duplex carrier. The initiating side calls [`Session::open`], the other
//! side receives the stream from [`Session::accept`]. Each stream has its own
//! credit-based flow control, and keep-alive probes detect a dead carrier
//! without waiting for application timeouts.
//!
//! ```text
//!             ┌────────────┐  frames   ┌─────────────┐
//! MuxStream ─▶│ stream task│──────────▶│ write loop  │─▶ carrier
//! MuxStream ─▶│ stream task│──────────▶│             │
//!             └────────────┘           └─────────────┘
//!                   ▲                  ┌─────────────┐
//!                   └──────────────────│ read loop   │◀─ carrier
//!                                      └─────────────┘
//! ```

use crate::proto::{Frame, FrameCodec, FrameError, FrameType};
use crate::{Error, Result};
use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf, ReadHalf, WriteHalf,
};
use tokio::sync::{Semaphore, mpsc};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Initial per-stream window (256KB)
pub const DEFAULT_WINDOW: u32 = 256 * 1024;

/// Largest DATA payload a stream task emits
const MAX_DATA_CHUNK: usize = 16 * 1024;

/// Which end of the carrier this session is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Opens streams (odd ids)
    Client,
    /// Accepts streams (even ids for any it opens)
    Server,
}

/// Multiplex configuration
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// How often a keep-alive probe is sent (default: 15s)
    pub keepalive_interval: Duration,
    /// Silence after which the carrier is declared dead (default: 30s)
    pub keepalive_timeout: Duration,
    /// Per-stream receive window in bytes (default: 256KB)
    pub window: u32,
    /// Opened streams waiting for `accept` before new ones are reset
    pub accept_backlog: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self::with_keepalive(Duration::from_secs(15))
    }
}

impl MuxConfig {
    /// Default settings with the given keep-alive interval; the timeout is
    /// twice the interval.
    pub fn with_keepalive(interval: Duration) -> Self {
        Self {
            keepalive_interval: interval,
            keepalive_timeout: interval * 2,
            window: DEFAULT_WINDOW,
            accept_backlog: 256,
        }
    }
}

enum Inbound {
    Data(Bytes),
    Fin,
}

struct StreamEntry {
    inbound: mpsc::UnboundedSender<Inbound>,
    credit: Arc<Semaphore>,
    buffered: Arc<AtomicUsize>,
    reset: CancellationToken,
}

struct Shared {
    mode: Mode,
    config: MuxConfig,
    next_id: AtomicU32,
    streams: Mutex<HashMap<u32, StreamEntry>>,
    frames: mpsc::UnboundedSender<Frame>,
    closed: CancellationToken,
    last_seen: Mutex<Instant>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn send(&self, frame: Frame) -> bool {
        self.frames.send(frame).is_ok()
    }

    fn touch(&self) {
        *lock(&self.last_seen) = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        lock(&self.last_seen).elapsed()
    }

    fn is_remote_id(&self, id: u32) -> bool {
        match self.mode {
            Mode::Client => id != 0 && id % 2 == 0,
            Mode::Server => id % 2 == 1,
        }
    }

    fn window_chunk(&self) -> usize {
        MAX_DATA_CHUNK.min(self.config.window as usize).max(1)
    }

    /// Register stream `id` and start its task.
    fn register(self: &Arc<Self>, id: u32) -> MuxStream {
        let (app, mux_end) = tokio::io::duplex(self.config.window as usize);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let credit = Arc::new(Semaphore::new(self.config.window as usize));
        let buffered = Arc::new(AtomicUsize::new(0));
        let reset = self.closed.child_token();

        lock(&self.streams).insert(
            id,
            StreamEntry {
                inbound: inbound_tx,
                credit: Arc::clone(&credit),
                buffered: Arc::clone(&buffered),
                reset: reset.clone(),
            },
        );

        tokio::spawn(drive_stream(
            Arc::clone(self),
            id,
            mux_end,
            inbound_rx,
            credit,
            buffered,
            reset,
        ));

        MuxStream { id, io: app }
    }

    /// Abort stream `id` locally and tell the peer.
    fn reset_stream(&self, id: u32) {
        if let Some(entry) = lock(&self.streams).remove(&id) {
            entry.reset.cancel();
        }
        self.send(Frame::reset(id));
    }

    fn shutdown(&self) {
        self.closed.cancel();
        lock(&self.streams).clear();
    }

    /// Apply one received frame. An error ends the session.
    fn handle_frame(self: &Arc<Self>, frame: Frame, accept_tx: &mpsc::Sender<MuxStream>) -> Result<()> {
        let id = frame.stream_id;
        trace!("Received {:?} for stream {} ({} bytes)", frame.frame_type, id, frame.payload.len());

        match frame.frame_type {
            FrameType::Open => {
                if !self.is_remote_id(id) || lock(&self.streams).contains_key(&id) {
                    return Err(Error::Protocol(format!("invalid OPEN for stream {id}")));
                }
                let stream = self.register(id);
                if accept_tx.try_send(stream).is_err() {
                    warn!("Accept backlog full, resetting stream {}", id);
                    self.reset_stream(id);
                }
            }

            FrameType::Data => {
                let mut violated = false;
                if let Some(entry) = lock(&self.streams).get(&id) {
                    let len = frame.payload.len();
                    let pending = entry.buffered.fetch_add(len, Ordering::AcqRel) + len;
                    if pending > self.config.window as usize {
                        violated = true;
                    } else {
                        let _ = entry.inbound.send(Inbound::Data(frame.payload));
                    }
                } else {
                    trace!("DATA for unknown stream {}", id);
                }
                if violated {
                    warn!("Stream {} exceeded its window, resetting", id);
                    self.reset_stream(id);
                }
            }

            FrameType::Close => {
                if let Some(entry) = lock(&self.streams).get(&id) {
                    let _ = entry.inbound.send(Inbound::Fin);
                }
            }

            FrameType::Reset => {
                if let Some(entry) = lock(&self.streams).remove(&id) {
                    entry.reset.cancel();
                }
            }

            FrameType::WindowUpdate => {
                let increment = frame
                    .parse_window_update()
                    .ok_or_else(|| Error::Protocol("malformed WINDOW_UPDATE".into()))?;
                if let Some(entry) = lock(&self.streams).get(&id) {
                    let room =
                        (self.config.window as usize).saturating_sub(entry.credit.available_permits());
                    entry.credit.add_permits((increment as usize).min(room));
                }
            }

            FrameType::Keepalive => {
                self.send(Frame::keepalive_ack(frame.payload));
            }

            FrameType::KeepaliveAck => {}

            FrameType::GoAway => return Err(Error::SessionClosed),
        }
        Ok(())
    }
}

/// Carry one stream: application writes become DATA frames, received frames
/// become application reads.
async fn drive_stream(
    shared: Arc<Shared>,
    id: u32,
    io: DuplexStream,
    inbound: mpsc::UnboundedReceiver<Inbound>,
    credit: Arc<Semaphore>,
    buffered: Arc<AtomicUsize>,
    reset: CancellationToken,
) {
    let (rd, wr) = tokio::io::split(io);

    tokio::select! {
        _ = async {
            tokio::join!(
                send_side(&shared, id, rd, &credit),
                recv_side(&shared, id, wr, inbound, &buffered),
            )
        } => {}
        () = reset.cancelled() => {}
    }

    lock(&shared.streams).remove(&id);
    trace!("Stream {} finished", id);
}

async fn send_side(shared: &Shared, id: u32, mut rd: ReadHalf<DuplexStream>, credit: &Semaphore) {
    let mut buf = vec![0u8; shared.window_chunk()];
    loop {
        let n = match rd.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        match credit.acquire_many(n as u32).await {
            Ok(permits) => permits.forget(),
            Err(_) => return,
        }
        if !shared.send(Frame::data(id, Bytes::copy_from_slice(&buf[..n]))) {
            return;
        }
    }
    shared.send(Frame::close(id));
}

async fn recv_side(
    shared: &Shared,
    id: u32,
    mut wr: WriteHalf<DuplexStream>,
    mut inbound: mpsc::UnboundedReceiver<Inbound>,
    buffered: &AtomicUsize,
) {
    while let Some(msg) = inbound.recv().await {
        match msg {
            Inbound::Data(bytes) => {
                if wr.write_all(&bytes).await.is_err() {
                    // Application side is gone; stop the peer from sending more.
                    shared.reset_stream(id);
                    return;
                }
                buffered.fetch_sub(bytes.len(), Ordering::AcqRel);
                shared.send(Frame::window_update(id, bytes.len() as u32));
            }
            Inbound::Fin => {
                let _ = wr.shutdown().await;
                return;
            }
        }
    }
}

async fn write_loop<S>(mut sink: S, mut frames: mpsc::UnboundedReceiver<Frame>, closed: CancellationToken)
where
    S: Sink<Frame, Error = FrameError> + Unpin,
{
    loop {
        let result = tokio::select! {
            frame = frames.recv() => match frame {
                Some(frame) => write_batch(&mut sink, frame, &mut frames).await,
                None => break,
            },
            () = closed.cancelled() => {
                // Flush what was queued before the close, such as GOAWAY.
                let mut result = Ok(());
                while let Ok(frame) = frames.try_recv() {
                    result = sink.feed(frame).await;
                    if result.is_err() {
                        break;
                    }
                }
                if result.is_ok() {
                    let _ = tokio::time::timeout(Duration::from_secs(1), sink.flush()).await;
                }
                break;
            }
        };
        if let Err(e) = result {
            debug!("Session write failed: {}", e);
            break;
        }
    }

    closed.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(1), sink.close()).await;
}

/// Write `first` plus everything already queued, then flush once.
async fn write_batch<S>(
    sink: &mut S,
    first: Frame,
    frames: &mut mpsc::UnboundedReceiver<Frame>,
) -> std::result::Result<(), FrameError>
where
    S: Sink<Frame, Error = FrameError> + Unpin,
{
    sink.feed(first).await?;
    while let Ok(frame) = frames.try_recv() {
        sink.feed(frame).await?;
    }
    sink.flush().await
}

async fn read_loop<S>(mut stream: S, shared: Arc<Shared>, accept_tx: mpsc::Sender<MuxStream>)
where
    S: Stream<Item = std::result::Result<Frame, FrameError>> + Unpin,
{
    loop {
        let frame = tokio::select! {
            frame = stream.next() => frame,
            () = shared.closed.cancelled() => break,
        };
        let frame = match frame {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                debug!("Session read failed: {}", e);
                break;
            }
            None => {
                debug!("Session carrier closed");
                break;
            }
        };

        shared.touch();
        if let Err(e) = shared.handle_frame(frame, &accept_tx) {
            debug!("Session ending: {}", e);
            break;
        }
    }

    shared.shutdown();
    debug!("{:?} session closed", shared.mode);
}

async fn keepalive_loop(shared: Arc<Shared>) {
    let mut ticker = tokio::time::interval(shared.config.keepalive_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            () = shared.closed.cancelled() => return,
        }

        let idle = shared.idle_for();
        if idle > shared.config.keepalive_timeout {
            warn!("Session keep-alive timed out after {:?} of silence", idle);
            shared.shutdown();
            return;
        }
        shared.send(Frame::keepalive(rand::random()));
    }
}

/// A multiplexed session over one carrier. Cheap to clone.
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
    incoming: Arc<tokio::sync::Mutex<mpsc::Receiver<MuxStream>>>,
}

impl Session {
    /// Start the initiating side over `io`.
    pub fn client<T>(io: T, config: MuxConfig, cancel: &CancellationToken) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::new(io, Mode::Client, config, cancel)
    }

    /// Start the accepting side over `io`.
    pub fn server<T>(io: T, config: MuxConfig, cancel: &CancellationToken) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::new(io, Mode::Server, config, cancel)
    }

    /// The session stops when `cancel` fires, the carrier fails, or the
    /// peer goes silent for longer than the keep-alive timeout.
    pub fn new<T>(io: T, mode: Mode, config: MuxConfig, cancel: &CancellationToken) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (sink, stream) = Framed::new(io, FrameCodec).split();
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let (accept_tx, accept_rx) = mpsc::channel(config.accept_backlog.max(1));

        let shared = Arc::new(Shared {
            mode,
            next_id: AtomicU32::new(match mode {
                Mode::Client => 1,
                Mode::Server => 2,
            }),
            config,
            streams: Mutex::new(HashMap::new()),
            frames: frame_tx,
            closed: cancel.child_token(),
            last_seen: Mutex::new(Instant::now()),
        });

        tokio::spawn(write_loop(sink, frame_rx, shared.closed.clone()));
        tokio::spawn(read_loop(stream, Arc::clone(&shared), accept_tx));
        tokio::spawn(keepalive_loop(Arc::clone(&shared)));

        debug!("{:?} session established", mode);
        Self {
            shared,
            incoming: Arc::new(tokio::sync::Mutex::new(accept_rx)),
        }
    }

    /// Open a new stream. The peer learns of it with the first frame; no
    /// round trip is needed.
    pub fn open(&self) -> Result<MuxStream> {
        if !self.is_alive() {
            return Err(Error::SessionClosed);
        }
        let id = self
            .shared
            .next_id
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |id| id.checked_add(2))
            .map_err(|_| Error::Protocol("stream ids exhausted".into()))?;

        let stream = self.shared.register(id);
        if !self.shared.send(Frame::open(id)) {
            return Err(Error::SessionClosed);
        }
        trace!("Opened stream {}", id);
        Ok(stream)
    }

    /// Wait for the peer to open a stream.
    pub async fn accept(&self) -> Result<MuxStream> {
        let mut incoming = self.incoming.lock().await;
        tokio::select! {
            stream = incoming.recv() => stream.ok_or(Error::SessionClosed),
            () = self.shared.closed.cancelled() => Err(Error::SessionClosed),
        }
    }

    pub fn is_alive(&self) -> bool {
        !self.shared.closed.is_cancelled()
    }

    /// Resolves once the session has died.
    pub async fn closed(&self) {
        self.shared.closed.cancelled().await
    }

    /// Tell the peer we are leaving and tear the session down.
    pub fn close(&self) {
        if self.is_alive() {
            self.shared.send(Frame::go_away());
            self.shared.shutdown();
        }
    }

    /// Streams currently open
    pub fn num_streams(&self) -> usize {
        lock(&self.shared.streams).len()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("mode", &self.shared.mode)
            .field("alive", &self.is_alive())
            .field("streams", &self.num_streams())
            .finish()
    }
}

/// One virtual stream of a [`Session`].
///
/// `shutdown` half-closes; dropping it closes the write side and resets the
/// stream if the peer keeps sending.
#[derive(Debug)]
pub struct MuxStream {
    id: u32,
    io: DuplexStream,
}

impl MuxStream {
    pub fn id(&self) -> u32 {
        self.id
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_read(cx, buf)
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().io).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(config: MuxConfig) -> (Session, Session, CancellationToken) {
        let cancel = CancellationToken::new();
        let (a, b) = tokio::io::duplex(64 * 1024);
        let client = Session::client(a, config.clone(), &cancel);
        let server = Session::server(b, config, &cancel);
        (client, server, cancel)
    }

    async fn within<F: std::future::Future>(fut: F) -> F::Output {
        tokio::time::timeout(Duration::from_secs(10), fut)
            .await
            .expect("timed out")
    }

    #[tokio::test]
    async fn test_open_accept_and_half_close() {
        let (client, server, _cancel) = pair(MuxConfig::default());

        let mut c = client.open().unwrap();
        assert_eq!(c.id(), 1);
        c.write_all(b"ping").await.unwrap();
        c.shutdown().await.unwrap();

        let mut s = within(server.accept()).await.unwrap();
        assert_eq!(s.id(), 1);
        let mut got = Vec::new();
        within(s.read_to_end(&mut got)).await.unwrap();
        assert_eq!(got, b"ping");

        // Our side is half-closed; the reverse direction still works.
        s.write_all(b"pong").await.unwrap();
        s.shutdown().await.unwrap();
        let mut got = Vec::new();
        within(c.read_to_end(&mut got)).await.unwrap();
        assert_eq!(got, b"pong");
    }

    #[tokio::test]
    async fn test_transfer_larger_than_window() {
        let config = MuxConfig {
            window: 32 * 1024,
            ..MuxConfig::default()
        };
        let (client, server, _cancel) = pair(config);

        tokio::spawn(async move {
            while let Ok(stream) = server.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = tokio::io::split(stream);
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                    let _ = w.shutdown().await;
                });
            }
        });

        let data: Vec<u8> = (0..1_000_000u32).map(|i| (i % 241) as u8).collect();
        let expected = data.clone();
        let (mut r, mut w) = tokio::io::split(client.open().unwrap());

        let writer = tokio::spawn(async move {
            w.write_all(&data).await.unwrap();
            w.shutdown().await.unwrap();
        });
        let mut got = Vec::new();
        within(r.read_to_end(&mut got)).await.unwrap();
        writer.await.unwrap();
        assert_eq!(got.len(), expected.len());
        assert_eq!(got, expected);
    }

    #[tokio::test]
    async fn test_many_concurrent_streams() {
        let (client, server, _cancel) = pair(MuxConfig::default());

        tokio::spawn(async move {
            while let Ok(mut stream) = server.accept().await {
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    stream.read_to_end(&mut buf).await.unwrap();
                    buf.reverse();
                    stream.write_all(&buf).await.unwrap();
                    stream.shutdown().await.unwrap();
                });
            }
        });

        let mut tasks = Vec::new();
        for i in 0..32u32 {
            let mut stream = client.open().unwrap();
            tasks.push(tokio::spawn(async move {
                let msg = format!("stream number {i}");
                stream.write_all(msg.as_bytes()).await.unwrap();
                stream.shutdown().await.unwrap();
                let mut got = Vec::new();
                stream.read_to_end(&mut got).await.unwrap();
                let mut expected = msg.into_bytes();
                expected.reverse();
                assert_eq!(got, expected);
            }));
        }
        for task in tasks {
            within(task).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_dropped_stream_reads_as_eof() {
        let (client, server, _cancel) = pair(MuxConfig::default());

        let mut c = client.open().unwrap();
        c.write_all(b"bye").await.unwrap();
        drop(c);

        let mut s = within(server.accept()).await.unwrap();
        let mut got = Vec::new();
        within(s.read_to_end(&mut got)).await.unwrap();
        assert_eq!(got, b"bye");
    }

    #[tokio::test]
    async fn test_close_ends_peer_accept() {
        let (client, server, _cancel) = pair(MuxConfig::default());
        let mut c = client.open().unwrap();
        let _s = within(server.accept()).await.unwrap();

        client.close();
        assert!(!client.is_alive());
        assert!(matches!(client.open(), Err(Error::SessionClosed)));

        assert!(matches!(within(server.accept()).await, Err(Error::SessionClosed)));
        assert!(!server.is_alive());

        // Streams over the dead session are unusable.
        let mut buf = [0u8; 8];
        assert_eq!(within(c.read(&mut buf)).await.unwrap_or(0), 0);
    }

    #[tokio::test]
    async fn test_carrier_eof_kills_session() {
        let cancel = CancellationToken::new();
        let (a, b) = tokio::io::duplex(1024);
        let server = Session::server(b, MuxConfig::default(), &cancel);

        drop(a);
        assert!(within(server.accept()).await.is_err());
        within(server.closed()).await;
        assert!(!server.is_alive());
    }

    #[tokio::test]
    async fn test_keepalive_timeout_on_silent_peer() {
        let cancel = CancellationToken::new();
        // Hold the far end open but never answer.
        let (a, _silent) = tokio::io::duplex(64 * 1024);
        let config = MuxConfig {
            keepalive_interval: Duration::from_millis(50),
            keepalive_timeout: Duration::from_millis(200),
            ..MuxConfig::default()
        };
        let client = Session::client(a, config, &cancel);
        assert!(client.is_alive());

        within(client.closed()).await;
        assert!(!client.is_alive());
    }

    #[tokio::test]
    async fn test_keepalive_keeps_idle_session_alive() {
        let config = MuxConfig {
            keepalive_interval: Duration::from_millis(50),
            keepalive_timeout: Duration::from_millis(200),
            ..MuxConfig::default()
        };
        let (client, server, _cancel) = pair(config);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(client.is_alive());
        assert!(server.is_alive());
    }

    /// A server session facing a hand-driven frame peer.
    fn raw_peer(config: MuxConfig) -> (Session, Framed<DuplexStream, FrameCodec>, CancellationToken) {
        let cancel = CancellationToken::new();
        let (a, b) = tokio::io::duplex(64 * 1024);
        let server = Session::server(a, config, &cancel);
        (server, Framed::new(b, FrameCodec), cancel)
    }

    /// Next frame of `frame_type` for stream `id`, skipping everything else.
    async fn expect_frame(peer: &mut Framed<DuplexStream, FrameCodec>, frame_type: FrameType, id: u32) {
        loop {
            let frame = within(peer.next()).await.unwrap().unwrap();
            if frame.frame_type == frame_type && frame.stream_id == id {
                return;
            }
            assert_ne!(frame.frame_type, FrameType::GoAway);
        }
    }

    #[tokio::test]
    async fn test_window_overrun_resets_stream() {
        let config = MuxConfig {
            window: 1024,
            ..MuxConfig::default()
        };
        let (server, mut peer, _cancel) = raw_peer(config);

        peer.send(Frame::open(1)).await.unwrap();
        // Accepted but never read, so nothing beyond one window drains.
        let _held = within(server.accept()).await.unwrap();
        for _ in 0..3 {
            peer.send(Frame::data(1, vec![0xAAu8; 1024])).await.unwrap();
        }

        expect_frame(&mut peer, FrameType::Reset, 1).await;
        assert!(server.is_alive());
        assert_eq!(server.num_streams(), 0);
    }

    #[tokio::test]
    async fn test_full_backlog_resets_new_stream() {
        let config = MuxConfig {
            accept_backlog: 1,
            ..MuxConfig::default()
        };
        let (server, mut peer, _cancel) = raw_peer(config);

        peer.send(Frame::open(1)).await.unwrap();
        peer.send(Frame::open(3)).await.unwrap();
        expect_frame(&mut peer, FrameType::Reset, 3).await;

        // The queued stream is still delivered.
        let first = within(server.accept()).await.unwrap();
        assert_eq!(first.id(), 1);
        assert!(server.is_alive());
    }

    #[tokio::test]
    async fn test_data_after_drop_is_reset() {
        let (server, mut peer, _cancel) = raw_peer(MuxConfig::default());

        peer.send(Frame::open(1)).await.unwrap();
        let stream = within(server.accept()).await.unwrap();
        drop(stream);
        expect_frame(&mut peer, FrameType::Close, 1).await;

        peer.send(Frame::data(1, &b"too late"[..])).await.unwrap();
        expect_frame(&mut peer, FrameType::Reset, 1).await;
        assert!(server.is_alive());
    }

    #[tokio::test]
    async fn test_open_fails_once_ids_run_out() {
        let (client, _server, _cancel) = pair(MuxConfig::default());
        client.shared.next_id.store(u32::MAX - 2, Ordering::Relaxed);

        let last = client.open().unwrap();
        assert_eq!(last.id(), u32::MAX - 2);
        for _ in 0..3 {
            assert!(matches!(client.open(), Err(Error::Protocol(_))));
        }
        assert_eq!(client.shared.next_id.load(Ordering::Relaxed), u32::MAX);
        assert_eq!(client.num_streams(), 1);
    }

    #[tokio::test]
    async fn test_cancellation_stops_session() {
        let (client, server, cancel) = pair(MuxConfig::default());
        cancel.cancel();
        within(client.closed()).await;
        within(server.closed()).await;
        assert!(client.open().is_err());
    }
}
