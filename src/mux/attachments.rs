//! Rendezvous between a request's channel references and the live streams.
//!
//! The client opens its stdio and status channels independently of the
//! request envelope, so the two sides of a reference can arrive in either
//! order: the stream may be attached before the executor asks for it, or
//! the executor may ask first and wait. Each side resolves through this
//! table exactly once.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

use crate::mux::{ByteStream, ChannelId, ChannelKind};
use crate::{AppError, Result};

/// How long a claim waits for the referenced channel to arrive before the
/// command is abandoned. Bounds the damage of a client that sends a request
/// but never opens the streams it references.
const ATTACH_TIMEOUT: Duration = Duration::from_secs(30);

enum Slot {
    /// The stream arrived before anyone asked for it.
    Arrived(ChannelKind, ByteStream),
    /// A claimer is waiting for the stream to arrive.
    Claimed(oneshot::Sender<(ChannelKind, ByteStream)>),
}

/// Per-connection table of channels that have arrived but are not yet
/// resolved to a command, and of claims waiting for their channel.
pub struct Attachments {
    pending: Mutex<HashMap<ChannelId, Slot>>,
}

impl Attachments {
    pub(crate) fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Record an inbound channel under its preamble id, handing it over
    /// directly when a claimer is already waiting.
    pub(crate) async fn offer(&self, id: ChannelId, kind: ChannelKind, stream: ByteStream) {
        let mut pending = self.pending.lock().await;
        match pending.remove(&id) {
            Some(Slot::Claimed(reply)) => {
                if reply.send((kind, stream)).is_err() {
                    debug!(%id, "claimer gave up before the channel arrived");
                }
            }
            Some(occupied @ Slot::Arrived(..)) => {
                warn!(%id, "duplicate channel id, dropping the newcomer");
                pending.insert(id, occupied);
            }
            None => {
                pending.insert(id, Slot::Arrived(kind, stream));
            }
        }
    }

    /// Resolve a channel reference from a request to its live stream,
    /// waiting up to [`ATTACH_TIMEOUT`] for it to arrive.
    ///
    /// # Errors
    ///
    /// - [`AppError::Protocol`] when the channel never arrives, was already
    ///   claimed, or its preamble kind does not match `expected`.
    /// - [`AppError::Connection`] when the connection closes while waiting.
    pub async fn claim(&self, id: ChannelId, expected: ChannelKind) -> Result<ByteStream> {
        let reply_rx = {
            let mut pending = self.pending.lock().await;
            match pending.remove(&id) {
                Some(Slot::Arrived(kind, stream)) => return check_kind(id, kind, expected, stream),
                Some(Slot::Claimed(_)) => {
                    return Err(AppError::Protocol(format!("channel {id} claimed twice")));
                }
                None => {
                    let (reply_tx, reply_rx) = oneshot::channel();
                    pending.insert(id, Slot::Claimed(reply_tx));
                    reply_rx
                }
            }
        };

        match tokio::time::timeout(ATTACH_TIMEOUT, reply_rx).await {
            Ok(Ok((kind, stream))) => check_kind(id, kind, expected, stream),
            Ok(Err(_)) => Err(AppError::Connection(format!(
                "connection closed before channel {id} arrived"
            ))),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(AppError::Protocol(format!(
                    "channel {id} was never attached"
                )))
            }
        }
    }
}

fn check_kind(
    id: ChannelId,
    kind: ChannelKind,
    expected: ChannelKind,
    stream: ByteStream,
) -> Result<ByteStream> {
    if kind == expected {
        Ok(stream)
    } else {
        Err(AppError::Protocol(format!(
            "channel {id} is tagged {} but is referenced as {}",
            kind.label(),
            expected.label()
        )))
    }
}
