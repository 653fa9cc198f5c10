//! Peer registry: bounded, arena-style storage of known peers keyed by (address, listening port).

use std::fmt;
use std::net::Ipv4Addr;

use crate::protocol::{PeerAddr, MAX_PEERS};

/// Host-assigned id for one stream connection. Never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Transport-specific reference to a peer: a connection (stream) or a socket address (datagram).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelHandle {
    Stream(ChannelId),
    Datagram(PeerAddr),
}

impl fmt::Display for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelHandle::Stream(id) => write!(f, "stream {id}"),
            ChannelHandle::Datagram(addr) => write!(f, "datagram {addr}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Handshake outstanding; identity not yet confirmed.
    Pending,
    /// Identity confirmed; participates in broadcasts and queries.
    Active,
}

/// Which side opened the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Outbound,
    Inbound,
}

/// Identity fields learned from a peer's Identity/Join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerProfile {
    pub username: String,
    pub listening_port: u16,
    pub zip_code: u32,
    pub age: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub username: String,
    /// Address the peer was reached on or connected from.
    pub address: Ipv4Addr,
    /// Unknown for an inbound stream peer until its identity arrives.
    pub listening_port: Option<u16>,
    pub zip_code: u32,
    pub age: u8,
    pub state: ConnectionState,
    pub channel: ChannelHandle,
    pub origin: Origin,
    /// Our own address on this peer's connection, when the transport reports one.
    pub local_address: Option<Ipv4Addr>,
}

impl PeerRecord {
    /// Pending record for a channel we opened toward `addr`.
    pub fn outbound(addr: PeerAddr, channel: ChannelHandle, local_address: Option<Ipv4Addr>) -> Self {
        Self {
            username: String::new(),
            address: normalize_address(addr.address),
            listening_port: Some(addr.port),
            zip_code: 0,
            age: 0,
            state: ConnectionState::Pending,
            channel,
            origin: Origin::Outbound,
            local_address,
        }
    }

    /// Pending record for a connection accepted from `address`.
    pub fn inbound(address: Ipv4Addr, channel: ChannelHandle, local_address: Option<Ipv4Addr>) -> Self {
        Self {
            username: String::new(),
            address: normalize_address(address),
            listening_port: None,
            zip_code: 0,
            age: 0,
            state: ConnectionState::Pending,
            channel,
            origin: Origin::Inbound,
            local_address,
        }
    }

    /// Active record built straight from a self-identifying Join (datagram).
    pub fn joined(address: Ipv4Addr, profile: PeerProfile, channel: ChannelHandle) -> Self {
        Self {
            username: profile.username,
            address: normalize_address(address),
            listening_port: Some(profile.listening_port),
            zip_code: profile.zip_code,
            age: profile.age,
            state: ConnectionState::Active,
            channel,
            origin: Origin::Inbound,
            local_address: None,
        }
    }

    pub fn key(&self) -> Option<PeerAddr> {
        self.listening_port.map(|port| PeerAddr::new(self.address, port))
    }

    pub fn is_active(&self) -> bool {
        self.state == ConnectionState::Active
    }
}

/// `0.0.0.0` as a source address means the local host.
pub fn normalize_address(address: Ipv4Addr) -> Ipv4Addr {
    if address.is_unspecified() {
        Ipv4Addr::LOCALHOST
    } else {
        address
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("peer registry is at capacity ({0} peers)")]
    Full(usize),
    #[error("peer {0} is already registered")]
    Duplicate(PeerAddr),
    #[error("no peer registered on {0}")]
    UnknownChannel(ChannelHandle),
}

/// Known peers. Insertion order is kept only until a removal swaps the last entry into the gap.
#[derive(Debug)]
pub struct PeerRegistry {
    peers: Vec<PeerRecord>,
    capacity: usize,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::with_capacity(MAX_PEERS)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            peers: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.peers.len() >= self.capacity
    }

    pub fn has(&self, addr: PeerAddr) -> bool {
        self.position(addr).is_some()
    }

    pub fn find(&self, addr: PeerAddr) -> Option<&PeerRecord> {
        self.position(addr).map(|i| &self.peers[i])
    }

    pub fn find_by_channel(&self, channel: ChannelHandle) -> Option<&PeerRecord> {
        self.peers.iter().find(|p| p.channel == channel)
    }

    /// Insert a record. Refuses when full or when another record already holds its key.
    pub fn add(&mut self, record: PeerRecord) -> Result<&PeerRecord, RegistryError> {
        if self.is_full() {
            return Err(RegistryError::Full(self.capacity));
        }
        if let Some(key) = record.key() {
            if self.has(key) {
                return Err(RegistryError::Duplicate(key));
            }
        }
        self.peers.push(record);
        Ok(&self.peers[self.peers.len() - 1])
    }

    /// Record a peer's identity and mark it Active. Fails if the resulting key
    /// belongs to a different record.
    pub fn promote(
        &mut self,
        channel: ChannelHandle,
        profile: PeerProfile,
    ) -> Result<&PeerRecord, RegistryError> {
        let index = self
            .peers
            .iter()
            .position(|p| p.channel == channel)
            .ok_or(RegistryError::UnknownChannel(channel))?;
        let key = PeerAddr::new(self.peers[index].address, profile.listening_port);
        if self.position(key).is_some_and(|other| other != index) {
            return Err(RegistryError::Duplicate(key));
        }
        let peer = &mut self.peers[index];
        peer.username = profile.username;
        peer.listening_port = Some(profile.listening_port);
        peer.zip_code = profile.zip_code;
        peer.age = profile.age;
        peer.state = ConnectionState::Active;
        Ok(&self.peers[index])
    }

    /// Remove by key. Removing an absent key is a no-op.
    pub fn remove(&mut self, addr: PeerAddr) -> Option<PeerRecord> {
        let index = self.position(addr)?;
        Some(self.peers.swap_remove(index))
    }

    pub fn remove_by_channel(&mut self, channel: ChannelHandle) -> Option<PeerRecord> {
        let index = self.peers.iter().position(|p| p.channel == channel)?;
        Some(self.peers.swap_remove(index))
    }

    /// Remove every record, returning them for the caller to notify and close.
    pub fn remove_all(&mut self) -> Vec<PeerRecord> {
        std::mem::take(&mut self.peers)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerRecord> {
        self.peers.iter()
    }

    pub fn active_peers(&self) -> impl Iterator<Item = &PeerRecord> {
        self.peers.iter().filter(|p| p.is_active())
    }

    pub fn active_by_age(&self, age: u8) -> impl Iterator<Item = &PeerRecord> {
        self.active_peers().filter(move |p| p.age == age)
    }

    pub fn active_by_zip(&self, zip_code: u32) -> impl Iterator<Item = &PeerRecord> {
        self.active_peers().filter(move |p| p.zip_code == zip_code)
    }

    /// Addresses of Active peers except the one on `exclude`, for a peer list.
    pub fn active_addrs_except(&self, exclude: ChannelHandle) -> Vec<PeerAddr> {
        self.active_peers()
            .filter(|p| p.channel != exclude)
            .filter_map(PeerRecord::key)
            .collect()
    }

    fn position(&self, addr: PeerAddr) -> Option<usize> {
        self.peers.iter().position(|p| p.key() == Some(addr))
    }
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
