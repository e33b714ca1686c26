//! # Stage: Transport
//!
//! ## Responsibility
//! Sentinel-framed TCP plumbing shared by the control node and the
//! workers: byte framing, per-connection send queues with dedicated
//! writer tasks, the accepting server with its connection registry, and
//! the outbound client.
//!
//! ## Guarantees
//! - Framed: every payload travels between `OPMsgB`/`OPMsgE` sentinels
//!   and is reassembled across arbitrary TCP segmentation
//! - Ordered per peer: one writer task per connection drains an unbounded
//!   queue, so sends from many tasks never interleave bytes
//! - Self-cleaning: a disconnect removes the peer from the registry
//!   before observers see the event
//!
//! ## NOT Responsible For
//! - Payload meaning (see: `protocol`)
//! - Reconnection policy: a refused connect is fatal to the caller

pub mod client;
pub mod connection;
pub mod framing;
pub mod server;

pub use client::TransportClient;
pub use connection::Connection;
pub use framing::{encode_frame, FrameBuffer, FRAME_BEGIN, FRAME_END};
pub use server::TransportServer;

use std::net::SocketAddr;
use thiserror::Error;

/// Errors raised by the transport layer.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The listening socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested listen address.
        addr: SocketAddr,
        /// Underlying socket error.
        source: std::io::Error,
    },

    /// The outbound connection was refused or failed. Fatal to a worker.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        /// Target address.
        addr: SocketAddr,
        /// Underlying socket error.
        source: std::io::Error,
    },

    /// Miscellaneous socket error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The peer's writer task is gone; the connection is dead.
    #[error("connection to {0} is closed")]
    Closed(SocketAddr),

    /// No registered connection for this peer.
    #[error("unknown peer {0}")]
    UnknownPeer(SocketAddr),
}

/// What a transport endpoint observes, in per-peer order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A peer connected (server side only).
    Connected(SocketAddr),
    /// One complete framed payload arrived from a peer.
    Message {
        /// Sending peer.
        peer: SocketAddr,
        /// De-framed payload bytes.
        payload: Vec<u8>,
    },
    /// The peer hung up or its socket failed.
    Disconnected(SocketAddr),
}
