//! Transport seam: one trait over the stream (TCP) and datagram (UDP) adapters.
//!
//! The event loop only sees channel handles and whole frames; how a frame is
//! delimited and where it came from is the adapter's business.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use async_trait::async_trait;
use peerchat_core::{ChannelHandle, ChannelId, PeerAddr};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("cannot listen on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),

    #[error("connect to {peer} failed: {source}")]
    Connect {
        peer: PeerAddr,
        #[source]
        source: io::Error,
    },

    #[error("send on {channel} failed: {source}")]
    Send {
        channel: ChannelHandle,
        #[source]
        source: io::Error,
    },

    #[error("receive failed: {0}")]
    Receive(#[source] io::Error),

    #[error("no open channel {0}")]
    UnknownChannel(ChannelHandle),

    #[error("transport event queue closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Something the transport observed without being asked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A stream connection was accepted on the listening socket.
    Accepted {
        channel: ChannelId,
        address: Ipv4Addr,
        local_address: Ipv4Addr,
    },
    /// One complete frame. Datagram sources carry the sender's socket address.
    Frame { source: ChannelHandle, bytes: Vec<u8> },
    /// A stream connection ended (EOF, read error, or an unframeable byte stream).
    Closed(ChannelId),
}

#[async_trait]
pub trait Transport: Send {
    /// Port actually bound (resolves a requested port of 0).
    fn local_port(&self) -> u16;

    /// Open a channel to `peer`. Returns the handle and our own address on it.
    async fn connect(&mut self, peer: PeerAddr) -> Result<(ChannelHandle, Ipv4Addr)>;

    /// Wait for the next event. Cancel-safe: dropping the future loses nothing.
    async fn next_event(&mut self) -> Result<TransportEvent>;

    async fn send(&mut self, channel: ChannelHandle, frame: &[u8]) -> Result<()>;

    /// Close a channel. Closing an unknown channel is a no-op.
    async fn close(&mut self, channel: ChannelHandle);
}

pub(crate) fn ipv4(addr: SocketAddr) -> Ipv4Addr {
    match addr.ip() {
        IpAddr::V4(ip) => ip,
        IpAddr::V6(ip) => ip.to_ipv4_mapped().unwrap_or(Ipv4Addr::UNSPECIFIED),
    }
}
