//! Per-connection socket tasks
//!
//! Each accepted socket is split into a reader task and a writer task. The
//! reader frames incoming bytes into lines and forwards them as events to
//! the server loop, which is the only place shared state is touched. The
//! writer drains the connection's outbound queue in enqueue order.

use crate::buffer::LineBuffer;
use crate::client::ClientId;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Events fed from connection tasks into the server loop.
#[derive(Debug)]
pub enum ServerEvent {
    /// A complete protocol line arrived on a connection: the decoded text
    /// plus its wire length in bytes, terminator excluded. Length limits
    /// apply to the wire length, not the decoded text.
    Line(ClientId, String, usize),
    /// A connection's socket is gone: EOF or an I/O failure.
    Closed(ClientId, String),
}

/// Spawn the reader task for one connection.
///
/// Reads until EOF, error, or cancellation; every framed line is forwarded
/// in arrival order. EOF and read errors are reported as [`ServerEvent::Closed`]
/// so the server performs the one cleanup path for all disconnect causes.
pub fn spawn_reader(
    id: ClientId,
    mut read: OwnedReadHalf,
    events: mpsc::UnboundedSender<ServerEvent>,
    token: CancellationToken,
) {
    tokio::spawn(async move {
        let mut inbuf = LineBuffer::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = tokio::select! {
                _ = token.cancelled() => return,
                res = read.read(&mut chunk) => match res {
                    Ok(0) => {
                        let _ = events.send(ServerEvent::Closed(id, "EOF".to_string()));
                        return;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        tracing::warn!("read error on client {}: {}", id, e);
                        let _ = events.send(ServerEvent::Closed(id, "recv error".to_string()));
                        return;
                    }
                },
            };
            inbuf.extend(&chunk[..n]);
            while let Some((line, wire_len)) = inbuf.next_line() {
                tracing::trace!("client {} <- {:?}", id, line);
                if events.send(ServerEvent::Line(id, line, wire_len)).is_err() {
                    // server loop is gone
                    return;
                }
            }
        }
    });
}

/// Spawn the writer task for one connection.
///
/// Drains the outbound queue front-to-back; `write_all` retries short writes
/// so bytes are delivered exactly once, in enqueue order. The task ends when
/// the server drops the queue's sender, shutting the socket down.
pub fn spawn_writer(
    id: ClientId,
    mut write: OwnedWriteHalf,
    mut outq: mpsc::UnboundedReceiver<String>,
    events: mpsc::UnboundedSender<ServerEvent>,
) {
    tokio::spawn(async move {
        while let Some(chunk) = outq.recv().await {
            if let Err(e) = write.write_all(chunk.as_bytes()).await {
                tracing::warn!("write error on client {}: {}", id, e);
                let _ = events.send(ServerEvent::Closed(id, "send error".to_string()));
                return;
            }
        }
        let _ = write.shutdown().await;
    });
}
