//! One client socket: receive loop, send path, and teardown.
//!
//! A started connection runs two tasks. The receive task owns the read half
//! and the [`FrameDecoder`]; it dispatches frames strictly in arrival order.
//! The writer task owns the write half and the [`FrameEncoder`] and drains the
//! bounded outbound queue filled by [`Connection::send`].
//!
//! Teardown runs once, in this order: the closed flag flips and reading stops,
//! the frame being dispatched (if any) runs to completion, the writer flushes
//! everything queued up to that point and shuts the socket down, the
//! registry's disconnect hook runs, and finally the close notification (the
//! listener's map eviction) fires. Panics in the hook or the notification are
//! logged and do not interrupt teardown.

use std::any::Any;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::{FutureExt, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::codec::{CodecError, FrameDecoder, FrameEncoder, PacketCodec};
use crate::packet::{OutgoingPacket, PacketOutcome, PacketReader, PacketWriter};
use crate::registry::PacketRegistry;
use crate::session::{Session, SessionId};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type CloseNotify<S> = Box<dyn Fn(&Connection<S>) + Send + Sync>;

/// How long a closing connection waits for queued frames to reach the socket.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

tokio::task_local! {
    /// Address of the connection whose receive loop drives the current task.
    static RECEIVING: usize;
}

/// Errors returned by the send path. Sending never waits for the socket.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("connection is closed")]
    Closed,

    #[error("outbound queue is full")]
    QueueFull,

    #[error("packet body of {size} bytes exceeds maximum {max}")]
    TooLarge { size: usize, max: usize },
}

/// Per-connection tuning shared by every connection of a listener.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Close the connection when no bytes arrive for this long. Default: none.
    pub idle_timeout: Option<Duration>,
    /// Frames that may wait for the writer task. Default: 256.
    pub outbound_queue_capacity: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            idle_timeout: None,
            outbound_queue_capacity: 256,
        }
    }
}

enum Outbound {
    Frame(Bytes),
    ActivateTransforms,
}

struct PendingIo {
    reader: BoxedReader,
    writer: BoxedWriter,
    decoder: FrameDecoder,
    encoder: FrameEncoder,
    outbound: mpsc::Receiver<Outbound>,
}

enum Lifecycle {
    Pending(Box<PendingIo>),
    Running { writer: JoinHandle<()> },
    Stopped,
}

enum ReadEvent {
    Frame(Bytes),
    PeerClosed,
    Failed(CodecError),
    Idle,
    Cancelled,
}

/// A client connection bound to one session.
pub struct Connection<S: Session> {
    id: SessionId,
    session: Arc<S>,
    peer_addr: SocketAddr,
    connected_at: Instant,
    registry: Arc<PacketRegistry<S>>,
    idle_timeout: Option<Duration>,
    max_body_len: usize,
    outbound: mpsc::Sender<Outbound>,
    cancel: CancellationToken,
    closed: AtomicBool,
    started: AtomicBool,
    receive_done: CancellationToken,
    writer_stop: CancellationToken,
    finished: CancellationToken,
    lifecycle: Mutex<Lifecycle>,
    close_notify: OnceLock<CloseNotify<S>>,
}

impl<S: Session> Connection<S> {
    /// Bind a session to an established byte stream.
    ///
    /// Nothing is read or written until [`begin_receiving`](Self::begin_receiving).
    /// `cancel` stops the connection when cancelled; the listener passes a
    /// child of its own token.
    #[allow(clippy::too_many_arguments)]
    pub fn new<R, W>(
        session: Arc<S>,
        peer_addr: SocketAddr,
        reader: R,
        writer: W,
        codec: PacketCodec,
        registry: Arc<PacketRegistry<S>>,
        options: &ConnectionOptions,
        cancel: CancellationToken,
    ) -> Arc<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (decoder, encoder) = codec.into_parts();
        let (tx, rx) = mpsc::channel(options.outbound_queue_capacity.max(1));

        Arc::new(Self {
            id: session.id(),
            max_body_len: encoder.max_body_len(),
            session,
            peer_addr,
            connected_at: Instant::now(),
            registry,
            idle_timeout: options.idle_timeout,
            outbound: tx,
            cancel,
            closed: AtomicBool::new(false),
            started: AtomicBool::new(false),
            receive_done: CancellationToken::new(),
            writer_stop: CancellationToken::new(),
            finished: CancellationToken::new(),
            lifecycle: Mutex::new(Lifecycle::Pending(Box::new(PendingIo {
                reader: Box::new(reader),
                writer: Box::new(writer),
                decoder,
                encoder,
                outbound: rx,
            }))),
            close_notify: OnceLock::new(),
        })
    }

    /// Id of the session bound to this connection.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// The session bound to this connection.
    pub fn session(&self) -> &Arc<S> {
        &self.session
    }

    /// Remote address of the client.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// When the socket was accepted.
    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    /// Whether teardown has begun.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Callback run as the very last teardown step. Only the first call has
    /// any effect.
    pub(crate) fn set_close_notify(&self, notify: impl Fn(&Connection<S>) + Send + Sync + 'static) {
        let _ = self.close_notify.set(Box::new(notify));
    }

    /// Run the connect hook and spawn the receive and writer tasks.
    ///
    /// Returns `false` if the connection was already started or closed.
    pub fn begin_receiving(self: &Arc<Self>) -> bool {
        let mut lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_closed() {
            return false;
        }
        let io = match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
            Lifecycle::Pending(io) => io,
            other => {
                *lifecycle = other;
                return false;
            }
        };
        let PendingIo {
            reader,
            writer,
            decoder,
            encoder,
            outbound,
        } = *io;

        self.started.store(true, Ordering::Release);
        self.guarded("connect hook", || self.registry.on_connected(self));

        let writer = tokio::spawn(write_loop(
            self.id,
            FramedWrite::new(writer, encoder),
            outbound,
            self.writer_stop.clone(),
            self.cancel.clone(),
        ));
        *lifecycle = Lifecycle::Running { writer };
        drop(lifecycle);

        let receive = Arc::clone(self).receive_loop(FramedRead::new(reader, decoder));
        tokio::spawn(RECEIVING.scope(self.address(), receive));
        tracing::debug!(session = %self.id, peer = %self.peer_addr, "connection started");
        true
    }

    /// Queue `packet` for sending.
    pub fn send<P: OutgoingPacket + ?Sized>(&self, packet: &P) -> Result<(), SendError> {
        let mut writer = PacketWriter::new();
        packet.write(&mut writer);
        self.send_raw(writer.into_bytes())
    }

    /// Queue an already-written body (opcode included) for sending.
    ///
    /// A closing connection keeps accepting frames until the packet it was
    /// dispatching has finished, so that packet's replies still go out.
    pub fn send_raw(&self, body: Bytes) -> Result<(), SendError> {
        if body.len() > self.max_body_len {
            return Err(SendError::TooLarge {
                size: body.len(),
                max: self.max_body_len,
            });
        }
        self.outbound
            .try_send(Outbound::Frame(body))
            .map_err(|e| match e {
                TrySendError::Full(_) => SendError::QueueFull,
                TrySendError::Closed(_) => SendError::Closed,
            })
    }

    /// Close the connection. Idempotent: later callers wait for the first
    /// teardown to finish and have no other effect.
    ///
    /// Waits for the frame currently being dispatched to finish, unless called
    /// from that frame's own `process`.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            self.finished.cancelled().await;
            return;
        }
        let _finished = self.finished.clone().drop_guard();
        self.cancel.cancel();

        let lifecycle = {
            let mut guard = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *guard, Lifecycle::Stopped)
        };
        match lifecycle {
            Lifecycle::Running { mut writer } => {
                if !self.on_receive_task() {
                    self.receive_done.cancelled().await;
                }
                self.writer_stop.cancel();
                match tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::error!(session = %self.id, "writer task failed: {e}"),
                    Err(_) => {
                        tracing::warn!(session = %self.id, "peer stopped reading, dropping queued frames");
                        writer.abort();
                    }
                }
            }
            // Never started: dropping the halves releases the socket.
            Lifecycle::Pending(io) => drop(io),
            Lifecycle::Stopped => {}
        }

        if self.started.load(Ordering::Acquire) {
            self.guarded("disconnect hook", || self.registry.on_disconnected(self));
        }
        if let Some(notify) = self.close_notify.get() {
            self.guarded("close notification", || notify(self));
        }

        tracing::debug!(
            session = %self.id,
            peer = %self.peer_addr,
            "connection closed after {:?}",
            self.connected_at.elapsed()
        );
    }

    fn address(&self) -> usize {
        self as *const Self as usize
    }

    fn on_receive_task(&self) -> bool {
        RECEIVING
            .try_with(|address| *address == self.address())
            .unwrap_or(false)
    }

    /// Run a lifecycle callback, logging a panic instead of unwinding.
    fn guarded(&self, what: &str, callback: impl FnOnce()) {
        if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(callback)) {
            tracing::error!(session = %self.id, "{what} panicked: {}", panic_message(&*panic));
        }
    }

    async fn receive_loop(self: Arc<Self>, mut frames: FramedRead<BoxedReader, FrameDecoder>) {
        let dispatching = self.receive_done.clone().drop_guard();
        loop {
            let body = match self.next_frame(&mut frames).await {
                ReadEvent::Frame(body) => body,
                ReadEvent::PeerClosed => {
                    tracing::debug!(session = %self.id, "peer closed the connection");
                    break;
                }
                ReadEvent::Failed(e) => {
                    tracing::warn!(session = %self.id, peer = %self.peer_addr, "closing connection: {e}");
                    break;
                }
                ReadEvent::Idle => {
                    tracing::info!(session = %self.id, peer = %self.peer_addr, "idle timeout");
                    break;
                }
                ReadEvent::Cancelled => break,
            };

            if self.is_closed() {
                break;
            }
            if body.is_empty() {
                continue;
            }

            match self.dispatch_frame(&body).await {
                PacketOutcome::Continue => {}
                PacketOutcome::ActivateTransforms => {
                    frames.decoder_mut().activate_transforms();
                    // Ordered behind everything the packet already queued.
                    if self.outbound.send(Outbound::ActivateTransforms).await.is_err() {
                        break;
                    }
                }
                PacketOutcome::Disconnect => {
                    tracing::debug!(session = %self.id, "disconnect requested by packet");
                    break;
                }
            }
        }

        drop(dispatching);
        self.close().await;
    }

    async fn next_frame(&self, frames: &mut FramedRead<BoxedReader, FrameDecoder>) -> ReadEvent {
        let read = async {
            match self.idle_timeout {
                Some(limit) => match tokio::time::timeout(limit, frames.next()).await {
                    Ok(next) => Some(next),
                    Err(_) => None,
                },
                None => Some(frames.next().await),
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => ReadEvent::Cancelled,
            next = read => match next {
                None => ReadEvent::Idle,
                Some(None) => ReadEvent::PeerClosed,
                Some(Some(Ok(body))) => ReadEvent::Frame(body),
                Some(Some(Err(e))) => ReadEvent::Failed(e),
            },
        }
    }

    /// Resolve, parse and process one frame. Failures and panics end here.
    async fn dispatch_frame(&self, body: &[u8]) -> PacketOutcome {
        let registry = &self.registry;
        let mut reader = PacketReader::new(body);

        let code = match registry.read_code(&mut reader) {
            Ok(code) => code,
            Err(e) => {
                tracing::warn!(session = %self.id, "unreadable packet code: {e}");
                return PacketOutcome::Continue;
            }
        };
        let Some(descriptor) = registry.resolve(code) else {
            tracing::warn!(
                session = %self.id,
                code = %code,
                len = body.len(),
                "unknown packet, dropping frame"
            );
            return PacketOutcome::Continue;
        };

        let state = self.session.state();
        if !descriptor.is_allowed_in(state) {
            tracing::warn!(
                session = %self.id,
                code = %code,
                packet = descriptor.name(),
                "packet not allowed in state {state:?}, dropping frame"
            );
            return PacketOutcome::Continue;
        }

        tracing::trace!(session = %self.id, code = %code, packet = descriptor.name(), "dispatching");

        let handled = AssertUnwindSafe(async {
            let future = registry.dispatch(descriptor, &mut reader, self, &self.session)?;
            future.await
        })
        .catch_unwind()
        .await;

        match handled {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                tracing::warn!(
                    session = %self.id,
                    code = %code,
                    packet = descriptor.name(),
                    "packet failed: {e}"
                );
                PacketOutcome::Continue
            }
            Err(panic) => {
                tracing::error!(
                    session = %self.id,
                    code = %code,
                    packet = descriptor.name(),
                    "packet panicked: {}",
                    panic_message(&*panic)
                );
                PacketOutcome::Continue
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Drain the outbound queue until `stop`, then flush what is left and shut
/// the socket down. A write failure cancels the connection.
async fn write_loop(
    id: SessionId,
    mut frames: FramedWrite<BoxedWriter, FrameEncoder>,
    mut outbound: mpsc::Receiver<Outbound>,
    stop: CancellationToken,
    cancel: CancellationToken,
) {
    loop {
        let item = tokio::select! {
            biased;
            item = outbound.recv() => item,
            _ = stop.cancelled() => break,
        };
        match item {
            Some(item) => {
                if !write_item(id, &mut frames, item).await {
                    cancel.cancel();
                    return;
                }
            }
            None => break,
        }
    }

    // Refuse new frames, keep the ones already queued.
    outbound.close();
    while let Some(item) = outbound.recv().await {
        if !write_item(id, &mut frames, item).await {
            return;
        }
    }

    if let Err(e) = frames.flush().await {
        tracing::debug!(session = %id, "final flush failed: {e}");
    }
    if let Err(e) = frames.get_mut().shutdown().await {
        tracing::trace!(session = %id, "socket shutdown failed: {e}");
    }
}

/// Returns `false` once the socket is unusable.
async fn write_item(
    id: SessionId,
    frames: &mut FramedWrite<BoxedWriter, FrameEncoder>,
    item: Outbound,
) -> bool {
    let body = match item {
        Outbound::Frame(body) => body,
        Outbound::ActivateTransforms => {
            frames.encoder_mut().activate_transforms();
            return true;
        }
    };

    match frames.send(body).await {
        Ok(()) => true,
        Err(CodecError::FrameTooLarge { size, max }) => {
            tracing::warn!(session = %id, "dropping outbound frame of {size} bytes (max {max})");
            true
        }
        Err(e) => {
            tracing::warn!(session = %id, "write failed: {e}");
            false
        }
    }
}
