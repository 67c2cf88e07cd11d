//! Connection listener and per-connection command loop.
//!
//! The listener accepts connections indefinitely; only a bind failure is
//! fatal. Each accepted connection gets its own mux session and its own
//! loop waiting for command channels, so one connection can carry many
//! concurrent commands and a failure on one connection never touches the
//! others.

use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::ServerConfig;
use crate::mux::{MuxSession, SessionMode};
use crate::server::executor;
use crate::{tls, AppError, Result};

/// Bind the loopback listener described by `config` and serve forever.
///
/// # Errors
///
/// Returns [`AppError::Connection`] when the bind fails and
/// [`AppError::Config`] when the TLS material cannot be loaded.
pub async fn run(config: &ServerConfig) -> Result<()> {
    let listener = TcpListener::bind(("127.0.0.1", config.port))
        .await
        .map_err(|err| {
            AppError::Connection(format!("failed to bind 127.0.0.1:{}: {err}", config.port))
        })?;

    let acceptor = match &config.tls {
        Some(settings) => Some(tls::acceptor(settings)?),
        None => None,
    };

    serve(listener, acceptor).await
}

/// Accept loop over an already-bound listener.
///
/// Transient accept failures are logged and skipped; a TLS handshake
/// failure kills only the connection it happened on.
///
/// # Errors
///
/// Returns [`AppError::Connection`] when the listener's local address
/// cannot be read.
pub async fn serve(listener: TcpListener, acceptor: Option<TlsAcceptor>) -> Result<()> {
    let local = listener
        .local_addr()
        .map_err(|err| AppError::Connection(format!("listener address unavailable: {err}")))?;
    info!(address = %local, tls = acceptor.is_some(), "listening for connections");

    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(%err, "accept failed");
                continue;
            }
        };
        debug!(%peer, "connection accepted");

        match acceptor.clone() {
            Some(acceptor) => {
                tokio::spawn(async move {
                    match acceptor.accept(socket).await {
                        Ok(socket) => handle_connection(socket, peer).await,
                        Err(err) => warn!(%peer, %err, "tls handshake failed"),
                    }
                });
            }
            None => {
                tokio::spawn(handle_connection(socket, peer));
            }
        }
    }
}

/// Per-connection loop: wait for command channels and dispatch each on its
/// own task. Ends when the connection does.
async fn handle_connection<S>(socket: S, peer: SocketAddr)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let span = info_span!("connection", %peer);
    async move {
        let mut session = MuxSession::new(socket, SessionMode::Server);
        while let Some(envelope) = session.next_command_channel().await {
            let attachments = session.attachments();
            tokio::spawn(executor::handle_command_channel(envelope, attachments));
        }
        info!("connection closed");
    }
    .instrument(span)
    .await;
}
