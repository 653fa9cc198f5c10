//! Framing: one tag byte selects a fixed-size body. Integers are big-endian,
//! strings are NUL-terminated inside fixed-capacity fields.

use std::net::Ipv4Addr;

use crate::protocol::{PeerAddr, WireMessage, MAX_PEERS, MESSAGE_LENGTH, USERNAME_LENGTH};

const TAG_MESSAGE: u8 = 0;
const TAG_IDENTITY: u8 = 1;
const TAG_LEAVE: u8 = 2;
const TAG_PEER_LIST: u8 = 3;

const TAG_SIZE: usize = 1;
const PEER_ENTRY_SIZE: usize = 4 + 2;
const PEER_ARRAY_SIZE: usize = 4 + MAX_PEERS * PEER_ENTRY_SIZE;

/// Size of a Message frame.
pub const MESSAGE_FRAME_LEN: usize = TAG_SIZE + USERNAME_LENGTH + MESSAGE_LENGTH;
/// Size of an Identity/Join frame.
pub const IDENTITY_FRAME_LEN: usize = TAG_SIZE + USERNAME_LENGTH + 2 + 4 + 1 + PEER_ARRAY_SIZE;
/// Size of a Leave frame.
pub const LEAVE_FRAME_LEN: usize = TAG_SIZE + USERNAME_LENGTH + 2;
/// Size of a PeerList frame.
pub const PEER_LIST_FRAME_LEN: usize = TAG_SIZE + PEER_ARRAY_SIZE;
/// Largest frame of any kind; receive buffers of this size always fit one frame.
pub const MAX_FRAME_LEN: usize = IDENTITY_FRAME_LEN;

/// Total frame length for a tag byte, or None if the tag is unknown.
pub fn frame_len(tag: u8) -> Option<usize> {
    match tag {
        TAG_MESSAGE => Some(MESSAGE_FRAME_LEN),
        TAG_IDENTITY => Some(IDENTITY_FRAME_LEN),
        TAG_LEAVE => Some(LEAVE_FRAME_LEN),
        TAG_PEER_LIST => Some(PEER_LIST_FRAME_LEN),
        _ => None,
    }
}

/// Encode a message into a freshly allocated fixed-size frame.
/// Strings longer than their field are truncated; peer lists are capped at MAX_PEERS.
pub fn encode_frame(msg: &WireMessage) -> Vec<u8> {
    let mut out = Vec::with_capacity(MAX_FRAME_LEN);
    match msg {
        WireMessage::Message { username, text } => {
            out.push(TAG_MESSAGE);
            put_str(&mut out, username.as_deref().unwrap_or(""), USERNAME_LENGTH);
            put_str(&mut out, text, MESSAGE_LENGTH);
        }
        WireMessage::Identity {
            username,
            port,
            zip_code,
            age,
            peers,
        } => {
            out.push(TAG_IDENTITY);
            put_str(&mut out, username, USERNAME_LENGTH);
            out.extend_from_slice(&port.to_be_bytes());
            out.extend_from_slice(&zip_code.to_be_bytes());
            out.push(*age);
            put_peers(&mut out, peers);
        }
        WireMessage::Leave { username, port } => {
            out.push(TAG_LEAVE);
            put_str(&mut out, username, USERNAME_LENGTH);
            out.extend_from_slice(&port.to_be_bytes());
        }
        WireMessage::PeerList { peers } => {
            out.push(TAG_PEER_LIST);
            put_peers(&mut out, peers);
        }
    }
    out
}

/// Decode one frame from the front of `bytes`. Returns the message and the number of bytes consumed.
pub fn decode_frame(bytes: &[u8]) -> Result<(WireMessage, usize), FrameDecodeError> {
    let tag = *bytes.first().ok_or(FrameDecodeError::Empty)?;
    let len = frame_len(tag).ok_or(FrameDecodeError::UnknownTag(tag))?;
    if bytes.len() < len {
        return Err(FrameDecodeError::Truncated {
            expected: len,
            actual: bytes.len(),
        });
    }
    let mut r = Reader::new(&bytes[TAG_SIZE..len]);
    let msg = match tag {
        TAG_MESSAGE => {
            let username = r.string(USERNAME_LENGTH, "username")?;
            let text = r.string(MESSAGE_LENGTH, "message")?;
            WireMessage::Message {
                username: (!username.is_empty()).then_some(username),
                text,
            }
        }
        TAG_IDENTITY => WireMessage::Identity {
            username: r.string(USERNAME_LENGTH, "username")?,
            port: r.u16(),
            zip_code: r.u32(),
            age: r.u8(),
            peers: r.peers(),
        },
        TAG_LEAVE => WireMessage::Leave {
            username: r.string(USERNAME_LENGTH, "username")?,
            port: r.u16(),
        },
        _ => WireMessage::PeerList { peers: r.peers() },
    };
    Ok((msg, len))
}

/// Error decoding a frame (empty, unknown tag, short buffer, or unterminated string).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("empty frame")]
    Empty,
    #[error("unknown message tag {0}")]
    UnknownTag(u8),
    #[error("truncated frame: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("{field} field is not NUL-terminated")]
    Unterminated { field: &'static str },
}

fn put_str(out: &mut Vec<u8>, s: &str, capacity: usize) {
    let mut end = s.len().min(capacity - 1);
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    out.extend_from_slice(&s.as_bytes()[..end]);
    out.resize(out.len() + capacity - end, 0);
}

fn put_peers(out: &mut Vec<u8>, peers: &[PeerAddr]) {
    let count = peers.len().min(MAX_PEERS);
    out.extend_from_slice(&(count as u32).to_be_bytes());
    for peer in &peers[..count] {
        out.extend_from_slice(&peer.address.octets());
        out.extend_from_slice(&peer.port.to_be_bytes());
    }
    out.resize(out.len() + (MAX_PEERS - count) * PEER_ENTRY_SIZE, 0);
}

/// Cursor over a body whose length was already checked against the tag's frame size.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> &'a [u8] {
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        s
    }

    fn u8(&mut self) -> u8 {
        self.take(1)[0]
    }

    fn u16(&mut self) -> u16 {
        let b = self.take(2);
        u16::from_be_bytes([b[0], b[1]])
    }

    fn u32(&mut self) -> u32 {
        let b = self.take(4);
        u32::from_be_bytes([b[0], b[1], b[2], b[3]])
    }

    fn string(&mut self, capacity: usize, field: &'static str) -> Result<String, FrameDecodeError> {
        let raw = self.take(capacity);
        let end = raw
            .iter()
            .position(|&b| b == 0)
            .ok_or(FrameDecodeError::Unterminated { field })?;
        Ok(String::from_utf8_lossy(&raw[..end]).into_owned())
    }

    fn peers(&mut self) -> Vec<PeerAddr> {
        let count = (self.u32() as usize).min(MAX_PEERS);
        let mut peers = Vec::with_capacity(count);
        for _ in 0..MAX_PEERS {
            let b = self.take(4);
            let address = Ipv4Addr::new(b[0], b[1], b[2], b[3]);
            let port = self.u16();
            if peers.len() < count {
                peers.push(PeerAddr::new(address, port));
            }
        }
        peers
    }
}
