use std::net::SocketAddr;

use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    select,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    broadcast::{BroadcastMessage, Broadcaster, welcome_line},
    framing::PayloadReader,
    registry::{ClientHandle, ClientId},
};

/// Runs a session for an accepted TCP connection.
pub async fn handle_connection(
    stream: TcpStream,
    id: ClientId,
    broadcaster: &Broadcaster,
    closed: CancellationToken,
) {
    let peer = stream.peer_addr().ok();
    let (reader, writer) = stream.into_split();
    run_session(reader, writer, id, peer, broadcaster, closed).await;
}

/// Drives one client from handshake to teardown.
///
/// The session ends when the peer closes the stream, a read fails, or
/// `closed` is cancelled (server shutdown, or eviction by the broadcaster).
pub async fn run_session<R, W>(
    reader: R,
    writer: W,
    id: ClientId,
    peer: Option<SocketAddr>,
    broadcaster: &Broadcaster,
    closed: CancellationToken,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let mut payloads = broadcaster.framing().reader(reader);
    let handle = ClientHandle::new(id, writer, closed);

    let Some(nickname) = perform_handshake(&mut payloads, &handle).await else {
        debug!(?peer, "connection closed before handshake");
        handle.close().await;
        return;
    };

    info!(?peer, %nickname, "client joined");
    match register_and_welcome(broadcaster, &handle, &nickname).await {
        Ok(()) => {
            broadcaster
                .broadcast(BroadcastMessage::joined(&nickname), Some(id))
                .await;
            run_read_loop(broadcaster, &mut payloads, &handle, &nickname).await;
        }
        Err(err) => debug!(?peer, %nickname, ?err, "failed to send welcome"),
    }

    teardown(broadcaster, &handle, peer).await;
}

async fn perform_handshake<R>(
    payloads: &mut PayloadReader<R>,
    handle: &ClientHandle,
) -> Option<String>
where
    R: AsyncRead + Unpin,
{
    select! {
        _ = handle.closed() => None,
        payload = payloads.next_payload() => match payload {
            Ok(nickname) => nickname,
            Err(err) => {
                debug!(?err, "handshake read failed");
                None
            }
        },
    }
}

/// Registers the client and greets it. The writer stays locked from insert
/// until the welcome is flushed, so the welcome is always the first line the
/// client sees even if a broadcast picks it up in between.
async fn register_and_welcome(
    broadcaster: &Broadcaster,
    handle: &ClientHandle,
    nickname: &str,
) -> std::io::Result<()> {
    let mut writer = handle.lock_writer().await;
    broadcaster
        .registry()
        .insert(handle.clone(), nickname.to_string())
        .await;
    let welcome = broadcaster.framing().encode(&welcome_line(nickname));
    writer.send(&welcome).await
}

async fn run_read_loop<R>(
    broadcaster: &Broadcaster,
    payloads: &mut PayloadReader<R>,
    handle: &ClientHandle,
    nickname: &str,
) where
    R: AsyncRead + Unpin,
{
    loop {
        select! {
            _ = handle.closed() => {
                debug!(%nickname, "session closed externally");
                break;
            }
            payload = payloads.next_payload() => match payload {
                Ok(Some(text)) => {
                    if text.is_empty() {
                        continue;
                    }
                    info!(%nickname, "message: {text}");
                    broadcaster.broadcast_from(handle.id(), text).await;
                }
                Ok(None) => break,
                Err(err) => {
                    debug!(%nickname, ?err, "read failed");
                    break;
                }
            },
        }
    }
}

/// Removes the client and closes its handle. Only the caller whose removal
/// actually took the entry out announces the departure, so a session and a
/// broadcaster that both notice the same dead client produce a single notice.
async fn teardown(broadcaster: &Broadcaster, handle: &ClientHandle, peer: Option<SocketAddr>) {
    let removed = broadcaster.registry().remove(handle.id()).await;
    handle.close().await;

    if let Some(entry) = removed {
        info!(?peer, nickname = %entry.nickname, "client disconnected");
        broadcaster
            .broadcast(BroadcastMessage::left(&entry.nickname), None)
            .await;
    }
}
