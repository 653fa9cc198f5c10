//! Stream transport: TCP listener plus one reader task per connection.
//! Frames are delimited by their tag: read one byte, then the rest of that tag's fixed size.

use std::collections::HashMap;
use std::io;
use std::net::Ipv4Addr;

use async_trait::async_trait;
use peerchat_core::{frame_len, ChannelHandle, ChannelId, PeerAddr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::transport::{ipv4, Result, Transport, TransportError, TransportEvent};

pub struct StreamTransport {
    listener: TcpListener,
    port: u16,
    writers: HashMap<ChannelId, OwnedWriteHalf>,
    readers: HashMap<ChannelId, JoinHandle<()>>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: mpsc::UnboundedReceiver<TransportEvent>,
    next_id: u64,
}

impl StreamTransport {
    /// Listen on all interfaces at `port` (0 picks a free port).
    pub async fn bind(port: u16) -> Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))
            .await
            .map_err(|source| TransportError::Bind { port, source })?;
        let port = listener
            .local_addr()
            .map_err(|source| TransportError::Bind { port, source })?
            .port();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Ok(Self {
            listener,
            port,
            writers: HashMap::new(),
            readers: HashMap::new(),
            events_tx,
            events_rx,
            next_id: 0,
        })
    }

    fn register(&mut self, stream: TcpStream) -> (ChannelId, Ipv4Addr) {
        let local = stream
            .local_addr()
            .map(ipv4)
            .unwrap_or(Ipv4Addr::UNSPECIFIED);
        self.next_id += 1;
        let channel = ChannelId(self.next_id);
        let (reader, writer) = stream.into_split();
        let task = tokio::spawn(read_frames(channel, reader, self.events_tx.clone()));
        self.readers.insert(channel, task);
        self.writers.insert(channel, writer);
        (channel, local)
    }

    fn forget(&mut self, channel: ChannelId) {
        self.writers.remove(&channel);
        if let Some(task) = self.readers.remove(&channel) {
            task.abort();
        }
    }
}

impl Drop for StreamTransport {
    fn drop(&mut self) {
        for task in self.readers.values() {
            task.abort();
        }
    }
}

#[async_trait]
impl Transport for StreamTransport {
    fn local_port(&self) -> u16 {
        self.port
    }

    async fn connect(&mut self, peer: PeerAddr) -> Result<(ChannelHandle, Ipv4Addr)> {
        let stream = TcpStream::connect((peer.address, peer.port))
            .await
            .map_err(|source| TransportError::Connect { peer, source })?;
        let (channel, local) = self.register(stream);
        debug!(%peer, %channel, "connected");
        Ok((ChannelHandle::Stream(channel), local))
    }

    async fn next_event(&mut self) -> Result<TransportEvent> {
        tokio::select! {
            accepted = self.listener.accept() => {
                let (stream, from) = accepted.map_err(TransportError::Accept)?;
                let (channel, local_address) = self.register(stream);
                debug!(%from, %channel, "accepted");
                Ok(TransportEvent::Accepted {
                    channel,
                    address: ipv4(from),
                    local_address,
                })
            }
            event = self.events_rx.recv() => {
                let event = event.ok_or(TransportError::Closed)?;
                if let TransportEvent::Closed(channel) = event {
                    self.forget(channel);
                }
                Ok(event)
            }
        }
    }

    async fn send(&mut self, channel: ChannelHandle, frame: &[u8]) -> Result<()> {
        let ChannelHandle::Stream(id) = channel else {
            return Err(TransportError::UnknownChannel(channel));
        };
        let writer = self
            .writers
            .get_mut(&id)
            .ok_or(TransportError::UnknownChannel(channel))?;
        writer
            .write_all(frame)
            .await
            .map_err(|source| TransportError::Send { channel, source })
    }

    async fn close(&mut self, channel: ChannelHandle) {
        if let ChannelHandle::Stream(id) = channel {
            self.forget(id);
        }
    }
}

async fn read_frames(
    channel: ChannelId,
    mut reader: OwnedReadHalf,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    loop {
        match read_frame(&mut reader).await {
            Ok(Some(bytes)) => {
                let frame = TransportEvent::Frame {
                    source: ChannelHandle::Stream(channel),
                    bytes,
                };
                if events.send(frame).is_err() {
                    return;
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(%channel, "read failed: {e}");
                break;
            }
        }
    }
    let _ = events.send(TransportEvent::Closed(channel));
}

/// Read exactly one frame. `Ok(None)` is a clean EOF between frames.
async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut tag = [0u8; 1];
    if reader.read(&mut tag).await? == 0 {
        return Ok(None);
    }
    let len = frame_len(tag[0]).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unknown frame tag {}", tag[0]),
        )
    })?;
    let mut frame = vec![0u8; len];
    frame[0] = tag[0];
    reader.read_exact(&mut frame[1..]).await?;
    Ok(Some(frame))
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerchat_core::{encode_frame, SelfIdentity, WireMessage};

    const LO: Ipv4Addr = Ipv4Addr::LOCALHOST;

    fn chat(text: &str) -> Vec<u8> {
        encode_frame(&WireMessage::Message {
            username: None,
            text: text.into(),
        })
    }

    async fn pair() -> (StreamTransport, StreamTransport, ChannelHandle, ChannelId) {
        let mut a = StreamTransport::bind(0).await.unwrap();
        let mut b = StreamTransport::bind(0).await.unwrap();
        let (handle, local) = a.connect(PeerAddr::new(LO, b.local_port())).await.unwrap();
        assert_eq!(local, LO);
        let accepted = match b.next_event().await.unwrap() {
            TransportEvent::Accepted {
                channel, address, ..
            } => {
                assert_eq!(address, LO);
                channel
            }
            other => panic!("expected Accepted, got {other:?}"),
        };
        (a, b, handle, accepted)
    }

    #[tokio::test]
    async fn frames_cross_a_connection() {
        let (mut a, mut b, handle, accepted) = pair().await;
        a.send(handle, &chat("one")).await.unwrap();
        assert_eq!(
            b.next_event().await.unwrap(),
            TransportEvent::Frame {
                source: ChannelHandle::Stream(accepted),
                bytes: chat("one"),
            }
        );
    }

    #[tokio::test]
    async fn coalesced_writes_split_into_frames() {
        let (mut a, mut b, handle, _) = pair().await;
        let identity = encode_frame(&SelfIdentity::new("a", 1, 2, 3).identity_message(vec![]));
        let mut burst = chat("first");
        burst.extend_from_slice(&identity);
        a.send(handle, &burst).await.unwrap();

        let mut sizes = Vec::new();
        for _ in 0..2 {
            match b.next_event().await.unwrap() {
                TransportEvent::Frame { bytes, .. } => sizes.push(bytes.len()),
                other => panic!("expected Frame, got {other:?}"),
            }
        }
        assert_eq!(sizes, vec![chat("").len(), identity.len()]);
    }

    #[tokio::test]
    async fn close_is_seen_by_remote() {
        let (mut a, mut b, handle, accepted) = pair().await;
        a.close(handle).await;
        assert_eq!(b.next_event().await.unwrap(), TransportEvent::Closed(accepted));
        assert!(matches!(
            b.send(ChannelHandle::Stream(accepted), &chat("gone")).await,
            Err(TransportError::UnknownChannel(_))
        ));
    }

    #[tokio::test]
    async fn unknown_tag_closes_connection() {
        let mut b = StreamTransport::bind(0).await.unwrap();
        let mut raw = TcpStream::connect((LO, b.local_port())).await.unwrap();
        raw.write_all(&[9u8, 0, 0]).await.unwrap();
        let accepted = match b.next_event().await.unwrap() {
            TransportEvent::Accepted { channel, .. } => channel,
            other => panic!("expected Accepted, got {other:?}"),
        };
        assert_eq!(b.next_event().await.unwrap(), TransportEvent::Closed(accepted));
    }

    #[tokio::test]
    async fn connect_to_closed_port_fails() {
        let port = StreamTransport::bind(0).await.unwrap().local_port();
        let mut a = StreamTransport::bind(0).await.unwrap();
        assert!(matches!(
            a.connect(PeerAddr::new(LO, port)).await,
            Err(TransportError::Connect { .. })
        ));
    }

    #[tokio::test]
    async fn read_frame_reports_clean_eof() {
        let mut empty: &[u8] = &[];
        assert!(read_frame(&mut empty).await.unwrap().is_none());

        let truncated = chat("x");
        let mut short: &[u8] = &truncated[..10];
        assert_eq!(
            read_frame(&mut short).await.unwrap_err().kind(),
            io::ErrorKind::UnexpectedEof
        );
    }
}
