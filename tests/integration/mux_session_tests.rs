//! Integration tests for the mux attachment layer over an in-memory
//! connection.
//!
//! A client-mode and a server-mode session share a duplex pipe, which
//! exercises the driver, the inbound router, the channel preambles, and
//! the attachment rendezvous without touching the network.

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use rexec::mux::{ChannelId, ChannelKind, MuxSession, SessionMode};
use rexec::proto::{CommandRequest, MessageReceiver, MessageSender};
use rexec::AppError;

fn session_pair() -> (MuxSession, MuxSession) {
    let (client_io, server_io) = tokio::io::duplex(256 * 1024);
    let client = MuxSession::new(client_io, SessionMode::Client);
    let server = MuxSession::new(server_io, SessionMode::Server);
    (client, server)
}

/// An envelope channel opened by the client surfaces in the server's
/// command loop with its request intact.
#[tokio::test]
async fn request_envelope_reaches_the_command_loop() {
    let (client, mut server) = session_pair();

    let envelope = client
        .open_channel(ChannelKind::Envelope, client.allocate_id())
        .await
        .expect("open envelope channel");
    let mut envelope = MessageSender::new(envelope);

    let request = CommandRequest {
        command: "true".to_owned(),
        arguments: vec![],
        stdin: ChannelId(1),
        stdout: ChannelId(2),
        stderr: ChannelId(3),
        status_channel: ChannelId(4),
    };
    envelope.send(&request).await.expect("send request");

    let inbound = server
        .next_command_channel()
        .await
        .expect("server must receive the envelope channel");
    let mut inbound = MessageReceiver::new(inbound);
    let received: CommandRequest = inbound
        .recv()
        .await
        .expect("decode request")
        .expect("request must be present");

    assert_eq!(received, request);
}

/// A stream attached before anyone claims it is parked and handed over on
/// claim, bytes intact.
#[tokio::test]
async fn attachment_arriving_first_is_parked_for_the_claimer() {
    let (client, server) = session_pair();

    let id = client.allocate_id();
    let mut channel = client
        .open_channel(ChannelKind::Stdin, id)
        .await
        .expect("open stdin channel");
    channel.write_all(b"ping").await.expect("write payload");
    channel.shutdown().await.expect("half-close channel");

    let mut claimed = server
        .attachments()
        .claim(id, ChannelKind::Stdin)
        .await
        .expect("claim stdin channel");

    let mut buffer = Vec::new();
    claimed.read_to_end(&mut buffer).await.expect("read payload");
    assert_eq!(buffer, b"ping");
}

/// A claim issued before the stream arrives waits for it instead of
/// failing.
#[tokio::test]
async fn claim_waits_for_a_late_attachment() {
    let (client, server) = session_pair();

    let id = ChannelId(77);
    let attachments = server.attachments();
    let claimer = tokio::spawn(async move { attachments.claim(id, ChannelKind::Stdout).await });

    // Give the claimer a chance to register before the stream shows up.
    tokio::task::yield_now().await;

    let mut channel = client
        .open_channel(ChannelKind::Stdout, id)
        .await
        .expect("open stdout channel");
    channel.write_all(b"late").await.expect("write payload");
    channel.shutdown().await.expect("half-close channel");

    let mut claimed = claimer
        .await
        .expect("claimer task")
        .expect("claim must succeed once the channel arrives");

    let mut buffer = Vec::new();
    claimed.read_to_end(&mut buffer).await.expect("read payload");
    assert_eq!(buffer, b"late");
}

/// A reference whose preamble kind disagrees with the request side fails
/// with a protocol error.
#[tokio::test]
async fn kind_mismatch_is_a_protocol_error() {
    let (client, server) = session_pair();

    let id = client.allocate_id();
    let channel = client
        .open_channel(ChannelKind::Stderr, id)
        .await
        .expect("open stderr channel");

    let result = server.attachments().claim(id, ChannelKind::Stdin).await;
    match result {
        Err(AppError::Protocol(msg)) => assert!(
            msg.contains("stderr") && msg.contains("stdin"),
            "error must name both kinds, got: {msg}"
        ),
        other => panic!("expected Err(AppError::Protocol), got: {other:?}"),
    }

    drop(channel);
}

/// Independent channels carry their payloads without interference.
#[tokio::test]
async fn concurrent_channels_stay_independent() {
    let (client, server) = session_pair();

    let first_id = client.allocate_id();
    let second_id = client.allocate_id();

    let mut first = client
        .open_channel(ChannelKind::Stdout, first_id)
        .await
        .expect("open first channel");
    let mut second = client
        .open_channel(ChannelKind::Stderr, second_id)
        .await
        .expect("open second channel");

    first.write_all(b"alpha").await.expect("write first");
    second.write_all(b"beta").await.expect("write second");
    first.shutdown().await.expect("close first");
    second.shutdown().await.expect("close second");

    let attachments = server.attachments();
    let mut claimed_second = attachments
        .claim(second_id, ChannelKind::Stderr)
        .await
        .expect("claim second");
    let mut claimed_first = attachments
        .claim(first_id, ChannelKind::Stdout)
        .await
        .expect("claim first");

    let mut buffer = Vec::new();
    claimed_first
        .read_to_end(&mut buffer)
        .await
        .expect("read first");
    assert_eq!(buffer, b"alpha");

    buffer.clear();
    claimed_second
        .read_to_end(&mut buffer)
        .await
        .expect("read second");
    assert_eq!(buffer, b"beta");
}
