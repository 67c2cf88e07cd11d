//! Client dispatcher: submit one command over a multiplexed connection and
//! relay its stdio and exit status.
//!
//! One invocation opens five logical channels — status, stdin, stdout,
//! stderr, and the request envelope — sends a single [`CommandRequest`]
//! referencing them, pumps the stdio channels while the remote process
//! runs, and blocks for exactly one [`CommandResponse`]. There is no retry
//! anywhere: a failure to submit or to receive is fatal to the invocation.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::config::ClientConfig;
use crate::mux::{ByteStream, ChannelKind, MuxSession, SessionMode};
use crate::proto::{
    CommandRequest, CommandResponse, MessageReceiver, MessageSender, STATUS_SPAWN_FAILED,
};
use crate::{tls, AppError, Result};

/// Exit code used by the `rexec` binary when the command could not be
/// submitted or its response never arrived. Distinct from every status the
/// tool itself relays (those go through [`exit_code_for_status`]).
pub const EXIT_TRANSPORT_FAILURE: i32 = 255;

/// Dial the server and run one command with the calling process's stdio.
///
/// Returns the wire status from the server; map it with
/// [`exit_code_for_status`] before exiting.
///
/// # Errors
///
/// Returns [`AppError::Connection`] when the dial or TLS handshake fails,
/// and whatever [`submit`] fails with after that.
pub async fn run(config: &ClientConfig, command: &str, arguments: &[String]) -> Result<i32> {
    let socket = TcpStream::connect(&config.address).await.map_err(|err| {
        AppError::Connection(format!("failed to connect to {}: {err}", config.address))
    })?;

    if config.use_tls {
        let host = config.host()?;
        let socket = tls::connect(socket, &host).await?;
        let session = MuxSession::new(socket, SessionMode::Client);
        submit(
            &session,
            command,
            arguments,
            tokio::io::stdin(),
            tokio::io::stdout(),
            tokio::io::stderr(),
        )
        .await
    } else {
        let session = MuxSession::new(socket, SessionMode::Client);
        submit(
            &session,
            command,
            arguments,
            tokio::io::stdin(),
            tokio::io::stdout(),
            tokio::io::stderr(),
        )
        .await
    }
}

/// Submit one command over an established session and relay its stdio.
///
/// The stdio endpoints are generic so tests can substitute buffers for the
/// process's own streams. All remote output is drained to `stdout`/`stderr`
/// before the status is returned; the stdin forwarder is detached once the
/// response arrives (local stdin may never reach EOF).
///
/// # Errors
///
/// - [`AppError::Connection`]/[`AppError::Io`] when a channel cannot be
///   opened or the request cannot be sent.
/// - [`AppError::Protocol`] when the status channel closes without a
///   response or delivers a malformed one.
pub async fn submit<I, O, E>(
    session: &MuxSession,
    command: &str,
    arguments: &[String],
    stdin: I,
    stdout: O,
    stderr: E,
) -> Result<i32>
where
    I: AsyncRead + Unpin + Send + 'static,
    O: AsyncWrite + Unpin + Send + 'static,
    E: AsyncWrite + Unpin + Send + 'static,
{
    let stdin_id = session.allocate_id();
    let stdout_id = session.allocate_id();
    let stderr_id = session.allocate_id();
    let status_id = session.allocate_id();

    // The status channel is opened first: the response path must exist
    // before the request that will answer on it.
    let status_channel = session.open_channel(ChannelKind::Status, status_id).await?;
    let mut status_channel = MessageReceiver::new(status_channel);

    let stdin_channel = session.open_channel(ChannelKind::Stdin, stdin_id).await?;
    let stdout_channel = session.open_channel(ChannelKind::Stdout, stdout_id).await?;
    let stderr_channel = session.open_channel(ChannelKind::Stderr, stderr_id).await?;

    let envelope = session
        .open_channel(ChannelKind::Envelope, session.allocate_id())
        .await?;
    let mut envelope = MessageSender::new(envelope);
    envelope
        .send(&CommandRequest {
            command: command.to_owned(),
            arguments: arguments.to_vec(),
            stdin: stdin_id,
            stdout: stdout_id,
            stderr: stderr_id,
            status_channel: status_id,
        })
        .await?;
    // One request per envelope channel; half-close it behind the message.
    let mut envelope = envelope.into_inner();
    let _ = envelope.shutdown().await;

    let stdin_task = tokio::spawn(forward_stdin(stdin, stdin_channel));
    let stdout_task = tokio::spawn(relay_output(stdout_channel, stdout));
    let stderr_task = tokio::spawn(relay_output(stderr_channel, stderr));

    let response: CommandResponse = status_channel
        .recv()
        .await?
        .ok_or_else(|| AppError::Protocol("status channel closed without a response".into()))?;

    // The server closes stdout/stderr before it responds; drain what is
    // still in flight so every byte lands locally before we report.
    let _ = tokio::join!(stdout_task, stderr_task);
    stdin_task.abort();

    Ok(response.status)
}

/// Map a wire status to this process's exit code.
///
/// Real process results pass through unchanged. [`STATUS_SPAWN_FAILED`]
/// becomes `127` (the shell's command-not-found convention); any other
/// out-of-range status becomes `254`.
#[must_use]
pub fn exit_code_for_status(status: i32) -> i32 {
    match status {
        0..=255 => status,
        STATUS_SPAWN_FAILED => 127,
        _ => 254,
    }
}

/// Copy local stdin into the stdin channel, half-closing it on EOF so the
/// remote process sees exactly one end-of-input.
async fn forward_stdin<I>(mut source: I, mut channel: ByteStream)
where
    I: AsyncRead + Unpin,
{
    match tokio::io::copy(&mut source, &mut channel).await {
        Ok(_) => {
            let _ = channel.shutdown().await;
        }
        Err(err) => debug!(%err, "stdin forwarding ended early"),
    }
}

/// Copy an output channel to its local stream until the remote side closes
/// it.
async fn relay_output<O>(mut channel: ByteStream, mut sink: O)
where
    O: AsyncWrite + Unpin,
{
    if let Err(err) = tokio::io::copy(&mut channel, &mut sink).await {
        debug!(%err, "output relay ended early");
    }
    let _ = sink.flush().await;
}
