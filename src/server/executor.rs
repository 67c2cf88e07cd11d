//! Per-command executor: spawn the process, bridge its stdio, report its
//! status.
//!
//! Each command moves through `Received → Spawning → Running → Exited →
//! ResponseSent`, with spawn failures short-circuiting to a degenerate
//! response. Whatever happens after the status channel is resolved,
//! exactly one [`CommandResponse`] goes out per request.
//!
//! Disconnect policy: a transport failure on any forwarder trips a
//! cancellation token and the child is killed rather than left running
//! against a dead connection; `kill_on_drop` backstops the rest.

use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::mux::{Attachments, ByteStream, ChannelKind};
use crate::proto::{
    CommandRequest, CommandResponse, MessageReceiver, MessageSender, STATUS_SPAWN_FAILED,
    STATUS_WAIT_FAILED,
};
use crate::{AppError, Result};

/// Copy buffer size for the stdio forwarders.
const COPY_BUFFER_BYTES: usize = 8192;

/// Entry point for one command channel: decode the request and execute it.
///
/// Decode failures and empty channels are logged and dropped — with no
/// request there is no status channel to answer on.
pub async fn handle_command_channel(envelope: ByteStream, attachments: Arc<Attachments>) {
    let mut envelope = MessageReceiver::new(envelope);
    let request: CommandRequest = match envelope.recv().await {
        Ok(Some(request)) => request,
        Ok(None) => {
            debug!("command channel closed without a request");
            return;
        }
        Err(err) => {
            warn!(%err, "failed to decode command request");
            return;
        }
    };

    let span = info_span!("command", command = %request.command);
    handle_request(request, attachments).instrument(span).await;
}

/// Resolve the request's channel references, run the command, and send the
/// one response.
async fn handle_request(request: CommandRequest, attachments: Arc<Attachments>) {
    // The status channel comes first: without it no response can be
    // delivered at all, so the request is dropped rather than half-served.
    let status_channel = match attachments
        .claim(request.status_channel, ChannelKind::Status)
        .await
    {
        Ok(channel) => channel,
        Err(err) => {
            warn!(%err, "cannot resolve status channel, dropping request");
            return;
        }
    };
    let mut status_channel = MessageSender::new(status_channel);

    let status = match claim_stdio(&request, &attachments).await {
        Ok((stdin, stdout, stderr)) => {
            run_command(&request.command, &request.arguments, stdin, stdout, stderr).await
        }
        Err(err) => {
            warn!(%err, "failed to resolve stdio channels");
            STATUS_SPAWN_FAILED
        }
    };

    info!(status, "command finished");
    if let Err(err) = status_channel.send(&CommandResponse { status }).await {
        // The client is unreachable and the command's side effects have
        // already happened; nothing to retry.
        warn!(%err, "failed to deliver command response");
        return;
    }

    // Half-close after the one response so closure follows it in order.
    let mut channel = status_channel.into_inner();
    let _ = channel.shutdown().await;
}

async fn claim_stdio(
    request: &CommandRequest,
    attachments: &Attachments,
) -> Result<(ByteStream, ByteStream, ByteStream)> {
    let stdin = attachments.claim(request.stdin, ChannelKind::Stdin).await?;
    let stdout = attachments
        .claim(request.stdout, ChannelKind::Stdout)
        .await?;
    let stderr = attachments
        .claim(request.stderr, ChannelKind::Stderr)
        .await?;
    Ok((stdin, stdout, stderr))
}

/// Spawn the command, bridge its stdio to the given channels, wait for it,
/// and map the outcome to a wire status. Never fails: every failure mode
/// maps to a status.
pub async fn run_command<I, O, E>(
    command: &str,
    arguments: &[String],
    stdin: I,
    stdout: O,
    stderr: E,
) -> i32
where
    I: AsyncRead + Unpin + Send + 'static,
    O: AsyncWrite + Unpin + Send + 'static,
    E: AsyncWrite + Unpin + Send + 'static,
{
    let mut child = match spawn_process(command, arguments) {
        Ok(child) => child,
        Err(err) => {
            warn!(%err, "spawn failed");
            return STATUS_SPAWN_FAILED;
        }
    };

    // The pipes are always present: spawn_process requested all three.
    let (Some(child_stdin), Some(child_stdout), Some(child_stderr)) =
        (child.stdin.take(), child.stdout.take(), child.stderr.take())
    else {
        warn!("spawned process is missing a stdio pipe");
        return STATUS_SPAWN_FAILED;
    };

    let broken = CancellationToken::new();
    let stdin_task = tokio::spawn(forward_stdin(stdin, child_stdin, broken.clone()));
    let stdout_task = tokio::spawn(forward_output(child_stdout, stdout, broken.clone()));
    let stderr_task = tokio::spawn(forward_output(child_stderr, stderr, broken.clone()));

    let wait_result = tokio::select! {
        result = child.wait() => result,
        () = broken.cancelled() => {
            warn!("stream forwarding failed, killing process");
            if let Err(err) = child.start_kill() {
                warn!(%err, "failed to kill process");
            }
            child.wait().await
        }
    };

    // Drain the output forwarders so both channels are closed — the remote
    // reader's EOF — before the status goes out. The stdin forwarder may
    // never end on its own (the client side may stay open); detach it.
    let _ = tokio::join!(stdout_task, stderr_task);
    stdin_task.abort();

    match wait_result {
        Ok(exit_status) => map_exit_status(exit_status),
        Err(err) => {
            warn!(%err, "failed to collect process exit status");
            STATUS_WAIT_FAILED
        }
    }
}

fn spawn_process(command: &str, arguments: &[String]) -> Result<Child> {
    let mut cmd = Command::new(command);
    cmd.args(arguments)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd.spawn()
        .map_err(|err| AppError::Spawn(format!("failed to spawn {command}: {err}")))
}

/// Map a raw wait result to the wire status.
///
/// Normal termination yields the exit code; termination by signal yields
/// `128 + signal` (the shell convention); anything else yields
/// [`STATUS_WAIT_FAILED`].
#[must_use]
pub fn map_exit_status(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    STATUS_WAIT_FAILED
}

/// Copy the request's stdin channel into the child's stdin pipe, closing
/// the pipe on EOF.
///
/// A read failure means the connection broke: the token is tripped so the
/// child is killed. A write failure means the child closed its own stdin —
/// not an error, forwarding just stops.
async fn forward_stdin<I>(mut source: I, mut sink: ChildStdin, broken: CancellationToken)
where
    I: AsyncRead + Unpin,
{
    let mut buffer = vec![0u8; COPY_BUFFER_BYTES];
    loop {
        match source.read(&mut buffer).await {
            Ok(0) => {
                let _ = sink.shutdown().await;
                break;
            }
            Ok(n) => {
                if sink.write_all(&buffer[..n]).await.is_err() {
                    debug!("process closed its stdin, stopping forwarder");
                    break;
                }
            }
            Err(err) => {
                debug!(%err, "stdin channel failed");
                broken.cancel();
                break;
            }
        }
    }
}

/// Copy a child output pipe to its channel, shutting the channel down on
/// pipe EOF so the remote reader sees closure.
///
/// A write failure means the connection broke: the token is tripped so the
/// child is killed instead of blocking forever on a full, unread pipe.
async fn forward_output<P, W>(mut source: P, mut sink: W, broken: CancellationToken)
where
    P: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; COPY_BUFFER_BYTES];
    loop {
        match source.read(&mut buffer).await {
            Ok(0) => {
                let _ = sink.shutdown().await;
                break;
            }
            Ok(n) => {
                if let Err(err) = sink.write_all(&buffer[..n]).await {
                    debug!(%err, "output channel failed");
                    broken.cancel();
                    break;
                }
            }
            Err(err) => {
                debug!(%err, "output pipe read failed");
                let _ = sink.shutdown().await;
                break;
            }
        }
    }
}
