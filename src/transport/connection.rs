//! One live TCP connection: reader task feeding the frame buffer, writer
//! task draining the send queue.

use super::framing::{encode_frame, FrameBuffer};
use super::{TransportError, TransportEvent};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const READ_CHUNK: usize = 8 * 1024;

/// Sending half of a live connection. Cloneable; all clones feed the same
/// per-connection writer task, which preserves send order.
#[derive(Debug, Clone)]
pub struct Connection {
    peer: SocketAddr,
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl Connection {
    /// Queue a payload for this peer. Framing happens here; the writer
    /// task only moves bytes.
    ///
    /// # Errors
    ///
    /// [`TransportError::Closed`] once the writer task has exited.
    pub fn send(&self, payload: &[u8]) -> Result<(), TransportError> {
        self.tx
            .send(encode_frame(payload))
            .map_err(|_| TransportError::Closed(self.peer))
    }

    /// Remote address of this connection.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

/// Spawn the reader and writer tasks for an established stream and hand
/// back the sending half. Inbound payloads and the final disconnect are
/// delivered to `events`.
pub(crate) fn spawn_io(
    stream: TcpStream,
    peer: SocketAddr,
    events: mpsc::UnboundedSender<TransportEvent>,
) -> Connection {
    let (mut read_half, mut write_half) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();

    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = write_half.write_all(&frame).await {
                warn!(%peer, error = %e, "write failed; dropping connection");
                break;
            }
        }
        debug!(%peer, "writer task done");
    });

    tokio::spawn(async move {
        let mut framer = FrameBuffer::new();
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            match read_half.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => {
                    framer.extend(&chunk[..n]);
                    for payload in framer.drain_frames() {
                        if events
                            .send(TransportEvent::Message { peer, payload })
                            .is_err()
                        {
                            return;
                        }
                    }
                }
                Err(e) => {
                    warn!(%peer, error = %e, "read failed; dropping connection");
                    break;
                }
            }
        }
        let _ = events.send(TransportEvent::Disconnected(peer));
        debug!(%peer, "reader task done");
    });

    Connection { peer, tx }
}
