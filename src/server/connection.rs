//! Per-connection read and write tasks (server side).
//!
//! Each accepted stream gets a read task that decodes messages into
//! [`ServerEvent::Message`]s and a write task that drains a bounded queue
//! of encoded broadcasts. Queuing keeps a slow subscriber from stalling the
//! event loop; a subscriber that falls [`SUBSCRIBER_QUEUE_LIMIT`] broadcasts
//! behind is dropped by the event loop.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc::{self, Receiver, UnboundedSender};
use tokio_util::sync::CancellationToken;

use super::events::ServerEvent;
use crate::constants::{READ_BUFFER_SIZE, SUBSCRIBER_QUEUE_LIMIT};
use crate::message::MessageDecoder;
use crate::transport::{ReadHalf, Stream, WriteHalf};

/// Register `stream` with the event loop and spawn its read/write tasks.
///
/// `ClientConnected` is sent before the read task starts, so the event
/// loop always learns about a connection before any of its messages.
pub(crate) fn attach(
    conn_id: u64,
    stream: Stream,
    events: &UnboundedSender<ServerEvent>,
    shutdown: &CancellationToken,
) -> bool {
    let (reader, writer) = stream.into_split();
    let (frame_tx, frame_rx) = mpsc::channel::<Vec<u8>>(SUBSCRIBER_QUEUE_LIMIT);

    if events
        .send(ServerEvent::ClientConnected {
            conn_id,
            sender: frame_tx,
        })
        .is_err()
    {
        return false;
    }

    tokio::spawn(write_loop(conn_id, writer, frame_rx));
    tokio::spawn(read_loop(conn_id, reader, events.clone(), shutdown.clone()));
    true
}

/// Read loop: decode messages from the socket and forward them.
async fn read_loop(
    conn_id: u64,
    mut reader: ReadHalf,
    events: UnboundedSender<ServerEvent>,
    shutdown: CancellationToken,
) {
    let mut decoder = MessageDecoder::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let read = tokio::select! {
            () = shutdown.cancelled() => break,
            read = reader.read(&mut buf) => read,
        };

        match read {
            Ok(0) => {
                log::debug!("[Server] Connection {conn_id} closed by peer");
                break;
            }
            Ok(n) => {
                for message in decoder.feed(&buf[..n]) {
                    if events.send(ServerEvent::Message { conn_id, message }).is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                log::warn!("[Server] Read error on connection {conn_id}: {e}");
                break;
            }
        }
    }

    let _ = events.send(ServerEvent::ClientDisconnected { conn_id });
}

/// Write loop: drain queued bytes to the socket, then close the write side
/// once the event loop drops the sender.
async fn write_loop(conn_id: u64, mut writer: WriteHalf, mut frame_rx: Receiver<Vec<u8>>) {
    while let Some(data) = frame_rx.recv().await {
        if let Err(e) = writer.write_all(&data).await {
            log::debug!("[Server] Write error on connection {conn_id}: {e}");
            return;
        }
    }
    let _ = writer.shutdown().await;
}
