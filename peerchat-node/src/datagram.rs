//! Datagram transport: one UDP socket, one frame per datagram. There are no
//! connections, so a channel is just the peer's socket address.

use std::net::{Ipv4Addr, SocketAddr};

use async_trait::async_trait;
use peerchat_core::{ChannelHandle, PeerAddr, MAX_FRAME_LEN};
use tokio::net::UdpSocket;
use tracing::debug;

use crate::transport::{Result, Transport, TransportError, TransportEvent};

pub struct DatagramTransport {
    socket: UdpSocket,
    port: u16,
    buf: Vec<u8>,
}

impl DatagramTransport {
    pub async fn bind(port: u16) -> Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))
            .await
            .map_err(|source| TransportError::Bind { port, source })?;
        let port = socket
            .local_addr()
            .map_err(|source| TransportError::Bind { port, source })?
            .port();
        Ok(Self {
            socket,
            port,
            buf: vec![0u8; MAX_FRAME_LEN],
        })
    }
}

#[async_trait]
impl Transport for DatagramTransport {
    fn local_port(&self) -> u16 {
        self.port
    }

    async fn connect(&mut self, peer: PeerAddr) -> Result<(ChannelHandle, Ipv4Addr)> {
        Ok((ChannelHandle::Datagram(peer), Ipv4Addr::UNSPECIFIED))
    }

    async fn next_event(&mut self) -> Result<TransportEvent> {
        loop {
            let (n, from) = self
                .socket
                .recv_from(&mut self.buf)
                .await
                .map_err(TransportError::Receive)?;
            match from {
                SocketAddr::V4(from) => {
                    return Ok(TransportEvent::Frame {
                        source: ChannelHandle::Datagram(PeerAddr::new(*from.ip(), from.port())),
                        bytes: self.buf[..n].to_vec(),
                    })
                }
                SocketAddr::V6(from) => debug!(%from, "ignoring IPv6 datagram"),
            }
        }
    }

    async fn send(&mut self, channel: ChannelHandle, frame: &[u8]) -> Result<()> {
        let ChannelHandle::Datagram(peer) = channel else {
            return Err(TransportError::UnknownChannel(channel));
        };
        self.socket
            .send_to(frame, (peer.address, peer.port))
            .await
            .map(|_| ())
            .map_err(|source| TransportError::Send { channel, source })
    }

    async fn close(&mut self, _channel: ChannelHandle) {}
}
