//! Accepting endpoint: connection registry, fan-out sends, event stream.

use super::connection::{spawn_io, Connection};
use super::{TransportError, TransportEvent};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Listening transport endpoint used by the control node.
///
/// All inbound events from every connection funnel into the single
/// receiver returned by [`TransportServer::bind`]; a disconnect removes
/// the peer from the registry before the event is surfaced.
pub struct TransportServer {
    local_addr: SocketAddr,
    connections: Arc<DashMap<SocketAddr, Connection>>,
    accept_task: JoinHandle<()>,
    forward_task: JoinHandle<()>,
}

impl TransportServer {
    /// Bind and start accepting. Returns the server handle and the merged
    /// event stream.
    ///
    /// # Errors
    ///
    /// [`TransportError::Bind`] when the address cannot be bound.
    pub async fn bind(
        addr: SocketAddr,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TransportEvent>), TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TransportError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "transport server listening");

        let connections: Arc<DashMap<SocketAddr, Connection>> = Arc::new(DashMap::new());
        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<TransportEvent>();
        let (out_tx, out_rx) = mpsc::unbounded_channel::<TransportEvent>();

        let accept_connections = connections.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            warn!(%peer, error = %e, "set_nodelay failed");
                        }
                        // Connected goes through the same funnel as the
                        // reader's messages so observers never see a
                        // message before the connect.
                        if raw_tx.send(TransportEvent::Connected(peer)).is_err() {
                            break;
                        }
                        let connection = spawn_io(stream, peer, raw_tx.clone());
                        accept_connections.insert(peer, connection);
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                    }
                }
            }
        });

        let forward_connections = connections.clone();
        let forward_task = tokio::spawn(async move {
            while let Some(event) = raw_rx.recv().await {
                if let TransportEvent::Disconnected(peer) = event {
                    forward_connections.remove(&peer);
                    info!(%peer, "peer disconnected");
                }
                if out_tx.send(event).is_err() {
                    break;
                }
            }
        });

        Ok((
            Self {
                local_addr,
                connections,
                accept_task,
                forward_task,
            },
            out_rx,
        ))
    }

    /// Address the server actually bound (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Send a payload to one peer.
    ///
    /// # Errors
    ///
    /// [`TransportError::UnknownPeer`] if the peer is not registered,
    /// [`TransportError::Closed`] if its writer is gone.
    pub fn send_to(&self, peer: SocketAddr, payload: &[u8]) -> Result<(), TransportError> {
        let connection = self
            .connections
            .get(&peer)
            .ok_or(TransportError::UnknownPeer(peer))?;
        connection.send(payload)
    }

    /// Send a payload to every live connection. Per-peer failures are
    /// logged, not propagated; the disconnect event follows separately.
    pub fn broadcast(&self, payload: &[u8]) {
        for entry in self.connections.iter() {
            if let Err(e) = entry.value().send(payload) {
                warn!(peer = %entry.key(), error = %e, "broadcast send failed");
            }
        }
    }
}

impl Drop for TransportServer {
    fn drop(&mut self) {
        self.accept_task.abort();
        self.forward_task.abort();
    }
}

impl std::fmt::Debug for TransportServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportServer")
            .field("local_addr", &self.local_addr)
            .field("connections", &self.connections.len())
            .finish()
    }
}
