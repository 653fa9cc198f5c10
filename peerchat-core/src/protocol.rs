//! PeerChat wire protocol: message types and fixed field capacities.

use std::fmt;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

/// Maximum number of peers held in the registry and carried in a peer list.
pub const MAX_PEERS: usize = 32;

/// Username field capacity in bytes, including the terminating NUL.
pub const USERNAME_LENGTH: usize = 32;

/// Chat text field capacity in bytes, including the terminating NUL.
pub const MESSAGE_LENGTH: usize = 128;

/// Listening port used when `-p` is not given.
pub const DEFAULT_PORT: u16 = 8129;

/// Transport a node runs on. Both ends of a mesh must agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// One connection per peer; a closed connection is the leave signal.
    #[default]
    Stream,
    /// One shared socket; an explicit Leave is the leave signal.
    Datagram,
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportMode::Stream => f.write_str("stream"),
            TransportMode::Datagram => f.write_str("datagram"),
        }
    }
}

impl std::str::FromStr for TransportMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stream" | "tcp" => Ok(TransportMode::Stream),
            "datagram" | "udp" => Ok(TransportMode::Datagram),
            other => Err(format!("unknown transport '{other}' (expected stream or datagram)")),
        }
    }
}

/// Address a peer can be reached on: IPv4 address plus its listening port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerAddr {
    pub address: Ipv4Addr,
    pub port: u16,
}

impl PeerAddr {
    pub fn new(address: Ipv4Addr, port: u16) -> Self {
        Self { address, port }
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// All wire message types. Layout is fixed-size per variant (see wire module).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    /// Chat text. Stream mode leaves `username` empty; the channel names the sender.
    Message {
        username: Option<String>,
        text: String,
    },
    /// Handshake: sender identity plus the Active peers it knows (minus the receiver).
    /// Stream mode calls this Identity; datagram mode calls it Join.
    Identity {
        username: String,
        port: u16,
        zip_code: u32,
        age: u8,
        peers: Vec<PeerAddr>,
    },
    /// Graceful leave (datagram mode).
    Leave { username: String, port: u16 },
    /// Known Active peers, sent by an acceptor once the newcomer has identified itself.
    PeerList { peers: Vec<PeerAddr> },
}

impl WireMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            WireMessage::Message { .. } => "message",
            WireMessage::Identity { .. } => "identity",
            WireMessage::Leave { .. } => "leave",
            WireMessage::PeerList { .. } => "peer-list",
        }
    }
}
