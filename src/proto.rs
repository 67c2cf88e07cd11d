//! Wire messages and their codec.
//!
//! The two protocol messages travel as newline-delimited JSON over their
//! own logical channels: the envelope channel carries one
//! [`CommandRequest`], the status channel carries one [`CommandResponse`].
//! Framing is delegated to [`tokio_util::codec::LinesCodec`] behind a
//! maximum line length, so an unterminated or oversized message can never
//! allocate unbounded memory.
//!
//! Stream references inside a request are opaque [`ChannelId`]s; the mux
//! layer resolves them to live handles on the receiving side.

use bytes::BytesMut;
use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite, LinesCodec, LinesCodecError};

use crate::mux::ChannelId;
use crate::{AppError, Result};

/// Maximum accepted message line length: 64 KiB.
///
/// Far above any real request (a command line plus four channel ids) and
/// far below anything that could hurt.
pub const MAX_MESSAGE_BYTES: usize = 65_536;

// ── Messages ─────────────────────────────────────────────────────────────────

/// A command to execute remotely, with references to the channels that
/// carry its stdio and its response.
///
/// Created by the client dispatcher, consumed exactly once by one server
/// executor instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRequest {
    /// Executable name or path, resolved on the server.
    pub command: String,
    /// Arguments in invocation order.
    pub arguments: Vec<String>,
    /// Channel the server reads as the process's stdin.
    pub stdin: ChannelId,
    /// Channel the server writes the process's stdout to.
    pub stdout: ChannelId,
    /// Channel the server writes the process's stderr to.
    pub stderr: ChannelId,
    /// Channel the server sends the [`CommandResponse`] on.
    pub status_channel: ChannelId,
}

/// The outcome of one command invocation.
///
/// Sent exactly once per [`CommandRequest`] — on normal exit, signal exit,
/// spawn failure, or wait failure — never zero times, never twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResponse {
    /// Process result, or a negative sentinel for server-side failure.
    ///
    /// `0..=255` is a real process result: the exit code, or `128 + signal`
    /// for a signal death. Negative values are reserved sentinels, outside
    /// any exit code range a platform produces.
    pub status: i32,
}

/// Sentinel status: the command never started (spawn failure, or its
/// stream references could not be resolved).
pub const STATUS_SPAWN_FAILED: i32 = -1;

/// Sentinel status: the process started but its wait result was unusable.
pub const STATUS_WAIT_FAILED: i32 = -2;

// ── Codec ────────────────────────────────────────────────────────────────────

/// NDJSON line codec for protocol message channels.
///
/// Delegates framing to [`LinesCodec`] with a fixed [`MAX_MESSAGE_BYTES`]
/// limit. Overlong inbound lines fail with [`AppError::Protocol`] rather
/// than allocating; I/O failures map to [`AppError::Io`].
#[derive(Debug)]
pub struct WireCodec(LinesCodec);

impl WireCodec {
    /// Create a codec with the default [`MAX_MESSAGE_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self(LinesCodec::new_with_max_length(MAX_MESSAGE_BYTES))
    }
}

impl Default for WireCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for WireCodec {
    type Item = String;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.0.decode(src).map_err(map_codec_error)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.0.decode_eof(src).map_err(map_codec_error)
    }
}

impl Encoder<String> for WireCodec {
    type Error = AppError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<()> {
        self.0.encode(item, dst).map_err(map_codec_error)
    }
}

fn map_codec_error(err: LinesCodecError) -> AppError {
    match err {
        LinesCodecError::MaxLineLengthExceeded => AppError::Protocol(format!(
            "message too long: exceeded {MAX_MESSAGE_BYTES} bytes"
        )),
        LinesCodecError::Io(io_err) => AppError::Io(io_err.to_string()),
    }
}

// ── Typed channel ends ───────────────────────────────────────────────────────

/// Sending end of a typed message channel.
pub struct MessageSender<W> {
    framed: FramedWrite<W, WireCodec>,
}

impl<W> MessageSender<W>
where
    W: AsyncWrite + Unpin,
{
    /// Wrap a raw channel for sending messages.
    pub fn new(writer: W) -> Self {
        Self {
            framed: FramedWrite::new(writer, WireCodec::new()),
        }
    }

    /// Serialize and send one message, flushing it to the channel.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Protocol`] when serialization fails and the
    /// codec's errors when writing does.
    pub async fn send<T: Serialize>(&mut self, message: &T) -> Result<()> {
        let line = serde_json::to_string(message)
            .map_err(|err| AppError::Protocol(format!("failed to encode message: {err}")))?;
        self.framed.send(line).await
    }

    /// Unwrap the underlying channel, e.g. to half-close it after the last
    /// message so closure follows the data in order.
    pub fn into_inner(self) -> W {
        self.framed.into_inner()
    }
}

/// Receiving end of a typed message channel.
pub struct MessageReceiver<R> {
    framed: FramedRead<R, WireCodec>,
}

impl<R> MessageReceiver<R>
where
    R: AsyncRead + Unpin,
{
    /// Wrap a raw channel for receiving messages.
    pub fn new(reader: R) -> Self {
        Self {
            framed: FramedRead::new(reader, WireCodec::new()),
        }
    }

    /// Receive the next message, skipping blank lines.
    ///
    /// Returns `Ok(None)` when the channel closes cleanly before a message.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Protocol`] for malformed JSON or an overlong
    /// line — a message is never partially populated — and [`AppError::Io`]
    /// for transport failures.
    pub async fn recv<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        loop {
            match self.framed.next().await {
                None => return Ok(None),
                Some(Err(err)) => return Err(err),
                Some(Ok(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let message = serde_json::from_str(&line)
                        .map_err(|err| AppError::Protocol(format!("malformed message: {err}")))?;
                    return Ok(Some(message));
                }
            }
        }
    }
}
