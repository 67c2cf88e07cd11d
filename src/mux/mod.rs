//! Thin attachment layer over the `yamux` stream multiplexer.
//!
//! `yamux` turns one connection into many independent, flow-controlled byte
//! streams; this module adds the little that the command protocol needs on
//! top and nothing more:
//!
//! - every logical channel opens with a 5-byte preamble — `kind: u8` +
//!   `id: u32` (big-endian) — so the receiving side knows what it is looking
//!   at before any payload arrives;
//! - inbound envelope channels are queued for the per-connection command
//!   loop, one queue entry per command submission;
//! - inbound stdio/status channels are parked in an [`Attachments`] table
//!   until the executor resolves the matching reference from a request.
//!
//! The session never interprets payload bytes. Everything above the
//! preamble is the message codec's business.

mod attachments;

use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio_util::compat::{Compat, FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt};
use tracing::{debug, warn};

pub use attachments::Attachments;

use crate::{AppError, Result};

/// A logical channel as seen by this crate: a multiplexed stream adapted to
/// tokio's I/O traits.
pub type ByteStream = Compat<yamux::Stream>;

/// How long the router waits for a new channel's preamble before giving up
/// on it.
const PREAMBLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Opaque per-connection channel identifier, allocated by the side that
/// opens channels and embedded in request messages as a reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(pub u32);

impl Display for ChannelId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Role of a logical channel, carried in its preamble.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// Carries exactly one `CommandRequest`.
    Envelope,
    /// Carries exactly one `CommandResponse`.
    Status,
    /// Raw bytes, client → remote process stdin.
    Stdin,
    /// Raw bytes, remote process stdout → client.
    Stdout,
    /// Raw bytes, remote process stderr → client.
    Stderr,
}

impl ChannelKind {
    const fn as_u8(self) -> u8 {
        match self {
            Self::Envelope => 0,
            Self::Status => 1,
            Self::Stdin => 2,
            Self::Stdout => 3,
            Self::Stderr => 4,
        }
    }

    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Envelope),
            1 => Some(Self::Status),
            2 => Some(Self::Stdin),
            3 => Some(Self::Stdout),
            4 => Some(Self::Stderr),
            _ => None,
        }
    }

    /// Human-readable tag for logs and error messages.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Envelope => "envelope",
            Self::Status => "status",
            Self::Stdin => "stdin",
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// Which end of the connection this session is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    /// The dialing side; opens channels.
    Client,
    /// The accepting side; receives channels.
    Server,
}

impl From<SessionMode> for yamux::Mode {
    fn from(mode: SessionMode) -> Self {
        match mode {
            SessionMode::Client => Self::Client,
            SessionMode::Server => Self::Server,
        }
    }
}

type OpenReply = oneshot::Sender<std::result::Result<yamux::Stream, yamux::ConnectionError>>;

/// One multiplexed connection: a driver task pumping the `yamux` state
/// machine, a router task sorting inbound channels, and the handles needed
/// to open channels and receive command submissions.
pub struct MuxSession {
    open_tx: mpsc::Sender<OpenReply>,
    envelope_rx: mpsc::UnboundedReceiver<ByteStream>,
    attachments: Arc<Attachments>,
    next_id: AtomicU32,
}

impl MuxSession {
    /// Start a session over an established socket.
    ///
    /// Spawns the driver and router tasks; both end when the connection
    /// does, taking every open channel with them.
    pub fn new<S>(socket: S, mode: SessionMode) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut config = yamux::Config::default();
        // The status channel delivers its one message right before the
        // remote side closes it; buffered data must survive the close.
        config.set_read_after_close(true);

        let connection = yamux::Connection::new(socket.compat(), config, mode.into());

        let (open_tx, open_rx) = mpsc::channel(16);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        tokio::spawn(drive(connection, open_rx, inbound_tx));

        let attachments = Arc::new(Attachments::new());
        let (envelope_tx, envelope_rx) = mpsc::unbounded_channel();
        tokio::spawn(route_inbound(
            inbound_rx,
            Arc::clone(&attachments),
            envelope_tx,
        ));

        Self {
            open_tx,
            envelope_rx,
            attachments,
            next_id: AtomicU32::new(1),
        }
    }

    /// Allocate a fresh channel id, unique within this session.
    #[must_use]
    pub fn allocate_id(&self) -> ChannelId {
        ChannelId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Open a new logical channel tagged with `kind` and `id`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Connection`] when the connection is closed or the
    /// multiplexer refuses the stream, and [`AppError::Io`] when writing the
    /// preamble fails.
    pub async fn open_channel(&self, kind: ChannelKind, id: ChannelId) -> Result<ByteStream> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.open_tx
            .send(reply_tx)
            .await
            .map_err(|_| AppError::Connection("connection closed".into()))?;

        let stream = reply_rx
            .await
            .map_err(|_| AppError::Connection("connection closed".into()))?
            .map_err(|err| AppError::Connection(format!("failed to open channel: {err}")))?;

        let mut stream = stream.compat();
        stream.write_u8(kind.as_u8()).await?;
        stream.write_u32(id.0).await?;
        stream.flush().await?;
        Ok(stream)
    }

    /// Wait for the next inbound envelope channel. Each one carries a single
    /// command submission. Returns `None` once the connection is gone.
    pub async fn next_command_channel(&mut self) -> Option<ByteStream> {
        self.envelope_rx.recv().await
    }

    /// Handle to this session's attachment table, used by the executor to
    /// resolve channel references.
    #[must_use]
    pub fn attachments(&self) -> Arc<Attachments> {
        Arc::clone(&self.attachments)
    }
}

// ── Driver ───────────────────────────────────────────────────────────────────

/// Pump the `yamux` connection: serve outbound open requests and hand
/// inbound streams to the router. Returns when the connection ends.
async fn drive<S>(
    mut connection: yamux::Connection<Compat<S>>,
    mut open_rx: mpsc::Receiver<OpenReply>,
    inbound_tx: mpsc::UnboundedSender<yamux::Stream>,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let mut pending_open: Option<OpenReply> = None;

    std::future::poll_fn(|cx| {
        loop {
            if pending_open.is_none() {
                if let Poll::Ready(Some(reply)) = open_rx.poll_recv(cx) {
                    pending_open = Some(reply);
                }
            }

            if let Some(reply) = pending_open.take() {
                match connection.poll_new_outbound(cx) {
                    Poll::Ready(result) => {
                        // A dropped receiver means the opener gave up; the
                        // stream (if any) is closed by the drop.
                        let _ = reply.send(result);
                        continue;
                    }
                    Poll::Pending => pending_open = Some(reply),
                }
            }

            match connection.poll_next_inbound(cx) {
                Poll::Ready(Some(Ok(stream))) => {
                    if inbound_tx.send(stream).is_err() {
                        debug!("inbound router gone, dropping stream");
                    }
                }
                Poll::Ready(Some(Err(err))) => {
                    debug!(%err, "connection failed");
                    return Poll::Ready(());
                }
                Poll::Ready(None) => return Poll::Ready(()),
                Poll::Pending => return Poll::Pending,
            }
        }
    })
    .await;
}

// ── Inbound routing ──────────────────────────────────────────────────────────

/// Sort each inbound stream by its preamble: envelope channels feed the
/// command loop, everything else is parked for resolution. Each preamble is
/// read on its own task so a silent channel cannot block the others.
async fn route_inbound(
    mut inbound_rx: mpsc::UnboundedReceiver<yamux::Stream>,
    attachments: Arc<Attachments>,
    envelope_tx: mpsc::UnboundedSender<ByteStream>,
) {
    while let Some(stream) = inbound_rx.recv().await {
        let attachments = Arc::clone(&attachments);
        let envelope_tx = envelope_tx.clone();
        tokio::spawn(async move {
            let mut stream = stream.compat();
            match tokio::time::timeout(PREAMBLE_TIMEOUT, read_preamble(&mut stream)).await {
                Ok(Ok((ChannelKind::Envelope, _))) => {
                    if envelope_tx.send(stream).is_err() {
                        debug!("command loop gone, dropping envelope channel");
                    }
                }
                Ok(Ok((kind, id))) => attachments.offer(id, kind, stream).await,
                Ok(Err(err)) => warn!(%err, "failed to read channel preamble"),
                Err(_) => warn!("timed out waiting for a channel preamble"),
            }
        });
    }
}

async fn read_preamble(stream: &mut ByteStream) -> Result<(ChannelKind, ChannelId)> {
    let kind = stream.read_u8().await?;
    let id = stream.read_u32().await?;
    let kind = ChannelKind::from_u8(kind)
        .ok_or_else(|| AppError::Protocol(format!("unknown channel kind byte {kind:#04x}")))?;
    Ok((kind, ChannelId(id)))
}
