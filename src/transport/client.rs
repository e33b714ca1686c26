//! Outbound endpoint used by workers. A refused connect is fatal: the
//! caller exits rather than retrying.

use super::connection::{spawn_io, Connection};
use super::{TransportError, TransportEvent};
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::info;

/// Client side of the transport: one connection to the control node.
#[derive(Debug)]
pub struct TransportClient {
    connection: Connection,
}

impl TransportClient {
    /// Connect to the control node. Returns the client and its inbound
    /// event stream ([`TransportEvent::Message`] payloads followed by one
    /// [`TransportEvent::Disconnected`]).
    ///
    /// # Errors
    ///
    /// [`TransportError::Connect`] when the node is unreachable or
    /// refuses; callers treat this as fatal.
    pub async fn connect(
        addr: SocketAddr,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TransportEvent>), TransportError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| TransportError::Connect { addr, source })?;
        stream.set_nodelay(true)?;
        info!(%addr, "connected to control node");

        let (tx, rx) = mpsc::unbounded_channel();
        let connection = spawn_io(stream, addr, tx);
        Ok((Self { connection }, rx))
    }

    /// Queue a payload for the control node.
    ///
    /// # Errors
    ///
    /// [`TransportError::Closed`] once the connection is gone.
    pub fn send(&self, payload: &[u8]) -> Result<(), TransportError> {
        self.connection.send(payload)
    }

    /// Cloneable sending half, for hooks that outlive the client borrow.
    pub fn sender(&self) -> Connection {
        self.connection.clone()
    }

    /// Address of the control node.
    pub fn peer(&self) -> SocketAddr {
        self.connection.peer()
    }
}
