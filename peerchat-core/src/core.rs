//! Host-driven API: PeerChatCore receives events from the host, returns actions.
//!
//! The core owns the peer registry and runs the membership protocol: handshake,
//! transitive discovery through peer lists, leave handling and deduplication.
//! It performs no I/O. The host opens and closes channels, moves frames, prints
//! notices, and feeds every outcome back in.

use std::collections::HashSet;
use std::fmt;
use std::net::Ipv4Addr;

use tracing::{debug, info, warn};

use crate::command::Command;
use crate::identity::SelfIdentity;
use crate::protocol::{PeerAddr, TransportMode, WireMessage};
use crate::registry::{
    normalize_address, ChannelHandle, ChannelId, Origin, PeerProfile, PeerRecord, PeerRegistry,
    RegistryError,
};
use crate::wire::{self, FrameDecodeError};

/// Action for host to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Open a stream channel to the peer, then report `on_connected` or `on_connect_failed`.
    Connect(PeerAddr),
    /// Write one encoded frame to the channel.
    Send { channel: ChannelHandle, frame: Vec<u8> },
    /// Close a stream channel and stop watching it.
    Close(ChannelId),
    /// Show a line to the user.
    Notify(Notice),
    /// Terminate the process with success.
    Shutdown,
}

/// User-facing notices. Display gives the exact line printed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    JoinedMesh { members: usize },
    PeerJoined { username: String, addr: PeerAddr, zip_code: u32, age: u8 },
    PeerLeft { username: String, addr: PeerAddr },
    Profile { username: String, zip_code: u32, age: u8 },
    Chat { username: String, text: String },
    LeftChat,
    Exited,
    AlreadyInMesh,
    JoinFailed,
    AtCapacity,
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::JoinedMesh { members } => write!(f, "[Joined chat with {members} members]"),
            Notice::PeerJoined {
                username,
                addr,
                zip_code,
                age,
            } => write!(f, "[{username}@{addr} has joined (Zip: {zip_code}, Age: {age})]"),
            Notice::PeerLeft { username, addr } => write!(f, "[{username}@{addr} left the chat]"),
            Notice::Profile {
                username,
                zip_code,
                age,
            } => write!(f, "[Username: {username} | Zip: {zip_code} | Age: {age}]"),
            Notice::Chat { username, text } => write!(f, "<{username}> {text}"),
            Notice::LeftChat => f.write_str("[Left chat]"),
            Notice::Exited => f.write_str("[Exited]"),
            Notice::AlreadyInMesh => f.write_str("[Join Failure - Already connected to peers]"),
            Notice::JoinFailed => f.write_str("[Join Failure - Unable to establish connection]"),
            Notice::AtCapacity => f.write_str("[Warning: Attempted to add user while at capacity]"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("failed to decode frame: {0}")]
    Decode(#[from] FrameDecodeError),
    #[error("{kind} frame is not used on {mode} transport")]
    Unexpected {
        kind: &'static str,
        mode: TransportMode,
    },
}

/// Main coordinator. Host passes events; core returns actions.
pub struct PeerChatCore {
    me: SelfIdentity,
    mode: TransportMode,
    peers: PeerRegistry,
    /// Stream connects handed to the host and not yet reported back.
    connecting: HashSet<PeerAddr>,
    /// First outbound stream peer whose PeerList will size the mesh announcement.
    roster_from: Option<ChannelHandle>,
}

impl PeerChatCore {
    pub fn new(me: SelfIdentity, mode: TransportMode) -> Self {
        Self {
            me,
            mode,
            peers: PeerRegistry::new(),
            connecting: HashSet::new(),
            roster_from: None,
        }
    }

    pub fn identity(&self) -> &SelfIdentity {
        &self.me
    }

    pub fn mode(&self) -> TransportMode {
        self.mode
    }

    pub fn peers(&self) -> &PeerRegistry {
        &self.peers
    }

    /// Handle one user intent.
    pub fn on_command(&mut self, command: Command) -> Vec<Action> {
        let mut actions = Vec::new();
        match command {
            Command::Join { address, port } => {
                let target = PeerAddr::new(normalize_address(address), port);
                if !self.peers.is_empty() || !self.connecting.is_empty() {
                    actions.push(Action::Notify(Notice::AlreadyInMesh));
                } else if self.is_self(target, None) {
                    warn!(peer = %target, "refusing to join own address");
                    actions.push(Action::Notify(Notice::JoinFailed));
                } else {
                    self.join(target, None, &mut actions);
                }
            }
            Command::Leave => {
                self.leave_mesh(&mut actions);
                actions.push(Action::Notify(Notice::LeftChat));
            }
            Command::Exit => {
                self.leave_mesh(&mut actions);
                actions.push(Action::Notify(Notice::Exited));
                actions.push(Action::Shutdown);
            }
            Command::Age(age) => {
                if self.me.age() == age {
                    actions.push(self.self_profile());
                }
                actions.extend(self.peers.active_by_age(age).map(profile_notice));
            }
            Command::Zip(zip_code) => {
                if self.me.zip_code() == zip_code {
                    actions.push(self.self_profile());
                }
                actions.extend(self.peers.active_by_zip(zip_code).map(profile_notice));
            }
            Command::Who => {
                actions.push(self.self_profile());
                actions.extend(self.peers.active_peers().map(profile_notice));
            }
            Command::Message(text) => {
                let username = match self.mode {
                    TransportMode::Stream => None,
                    TransportMode::Datagram => Some(self.me.username().to_string()),
                };
                let frame = wire::encode_frame(&WireMessage::Message { username, text });
                for peer in self.peers.active_peers() {
                    actions.push(Action::Send {
                        channel: peer.channel,
                        frame: frame.clone(),
                    });
                }
            }
        }
        actions
    }

    /// A stream connect requested through `Action::Connect` succeeded.
    pub fn on_connected(
        &mut self,
        addr: PeerAddr,
        channel: ChannelId,
        local_address: Ipv4Addr,
    ) -> Vec<Action> {
        let addr = PeerAddr::new(normalize_address(addr.address), addr.port);
        self.connecting.remove(&addr);
        let handle = ChannelHandle::Stream(channel);
        let mut actions = Vec::new();
        if self.is_self(addr, Some(local_address)) {
            debug!(peer = %addr, %channel, "connected to own listener, closing");
            actions.push(Action::Close(channel));
            if self.peers.is_empty() {
                actions.push(Action::Notify(Notice::JoinFailed));
            }
            return actions;
        }
        let record = PeerRecord::outbound(addr, handle, Some(local_address));
        if let Err(e) = self.peers.add(record) {
            self.refuse(e, channel, &mut actions);
            return actions;
        }
        debug!(peer = %addr, %channel, "connected, sending identity");
        let known = self.peers.active_addrs_except(handle);
        actions.push(self.send_identity(handle, known));
        actions
    }

    /// A stream connect requested through `Action::Connect` failed. Not retried.
    pub fn on_connect_failed(&mut self, addr: PeerAddr) -> Vec<Action> {
        let addr = PeerAddr::new(normalize_address(addr.address), addr.port);
        self.connecting.remove(&addr);
        warn!(peer = %addr, "join attempt abandoned");
        vec![Action::Notify(Notice::JoinFailed)]
    }

    /// The listening channel accepted a connection from `address`.
    pub fn on_accepted(
        &mut self,
        address: Ipv4Addr,
        channel: ChannelId,
        local_address: Ipv4Addr,
    ) -> Vec<Action> {
        let handle = ChannelHandle::Stream(channel);
        let mut actions = Vec::new();
        if let Err(e) = self
            .peers
            .add(PeerRecord::inbound(address, handle, Some(local_address)))
        {
            self.refuse(e, channel, &mut actions);
            return actions;
        }
        debug!(%address, %channel, "accepted, sending identity");
        // Peer list goes out once the newcomer has identified itself.
        actions.push(self.send_identity(handle, Vec::new()));
        actions
    }

    /// A stream channel reported end-of-stream or a read error.
    pub fn on_closed(&mut self, channel: ChannelId) -> Vec<Action> {
        let handle = ChannelHandle::Stream(channel);
        if self.roster_from == Some(handle) {
            self.roster_from = None;
        }
        match self.peers.remove_by_channel(handle) {
            Some(peer) => departure(&peer).into_iter().collect(),
            None => Vec::new(),
        }
    }

    /// Process one received frame. Decode failures leave all state untouched.
    pub fn on_frame(
        &mut self,
        source: ChannelHandle,
        bytes: &[u8],
    ) -> Result<Vec<Action>, MessageError> {
        let (msg, _consumed) = wire::decode_frame(bytes)?;
        let mut actions = Vec::new();
        match (source, self.mode) {
            (ChannelHandle::Stream(channel), TransportMode::Stream) => {
                self.on_stream_message(channel, msg, &mut actions)?
            }
            (ChannelHandle::Datagram(from), TransportMode::Datagram) => {
                self.on_datagram_message(from, msg, &mut actions)?
            }
            _ => {
                return Err(MessageError::Unexpected {
                    kind: msg.kind(),
                    mode: self.mode,
                })
            }
        }
        Ok(actions)
    }

    fn on_stream_message(
        &mut self,
        channel: ChannelId,
        msg: WireMessage,
        actions: &mut Vec<Action>,
    ) -> Result<(), MessageError> {
        // Stream peers leave by closing the connection.
        if let WireMessage::Leave { .. } = msg {
            return Err(MessageError::Unexpected {
                kind: msg.kind(),
                mode: TransportMode::Stream,
            });
        }
        let handle = ChannelHandle::Stream(channel);
        let Some(peer) = self.peers.find_by_channel(handle) else {
            debug!(%channel, kind = msg.kind(), "frame from unregistered channel dropped");
            return Ok(());
        };
        let active = peer.is_active();
        let local = peer.local_address;
        match msg {
            WireMessage::Identity {
                username,
                port,
                zip_code,
                age,
                peers,
            } => {
                let profile = PeerProfile {
                    username,
                    listening_port: port,
                    zip_code,
                    age,
                };
                self.on_stream_identity(channel, profile, peers, actions);
            }
            WireMessage::Message { text, .. } if active => {
                actions.push(Action::Notify(Notice::Chat {
                    username: peer.username.clone(),
                    text,
                }));
            }
            WireMessage::PeerList { peers } if active => {
                if self.roster_from == Some(handle) {
                    self.roster_from = None;
                    actions.push(Action::Notify(Notice::JoinedMesh {
                        members: peers.len() + 1,
                    }));
                }
                for addr in peers {
                    self.join(addr, local, actions);
                }
            }
            other => {
                debug!(%channel, kind = other.kind(), "frame ignored");
            }
        }
        Ok(())
    }

    fn on_stream_identity(
        &mut self,
        channel: ChannelId,
        profile: PeerProfile,
        advertised: Vec<PeerAddr>,
        actions: &mut Vec<Action>,
    ) {
        let handle = ChannelHandle::Stream(channel);
        let Some(peer) = self.peers.find_by_channel(handle) else {
            return;
        };
        if peer.is_active() {
            debug!(%channel, "repeated identity ignored");
            return;
        }
        let key = PeerAddr::new(peer.address, profile.listening_port);
        let local = peer.local_address;
        if self.is_self(key, local) {
            debug!(%channel, "own identity echoed back, closing");
            self.peers.remove_by_channel(handle);
            actions.push(Action::Close(channel));
            return;
        }
        let origin = peer.origin;
        let first = self.peers.active_peers().next().is_none();
        let mut quiet = false;

        if let Some(other) = self.peers.find(key).filter(|o| o.channel != handle) {
            // Both sides dialed each other. Keep the connection opened by the
            // smaller (port, address) key; the other end reaches the same verdict.
            let me = PeerAddr::new(local.unwrap_or(Ipv4Addr::LOCALHOST), self.me.port());
            let ours_wins = other.origin == Origin::Outbound && order_key(me) < order_key(key);
            let other_channel = other.channel;
            let other_active = other.is_active();
            let remove = if ours_wins || other.origin == Origin::Inbound {
                handle
            } else {
                other_channel
            };
            info!(peer = %key, "duplicate connection, closing {remove}");
            self.peers.remove_by_channel(remove);
            if self.roster_from == Some(remove) {
                self.roster_from = None;
            }
            if let ChannelHandle::Stream(id) = remove {
                actions.push(Action::Close(id));
            }
            if remove == handle {
                return;
            }
            quiet = other_active;
        }

        let peer = match self.peers.promote(handle, profile) {
            Ok(peer) => peer.clone(),
            Err(e) => {
                warn!(%channel, "cannot promote peer: {e}");
                return;
            }
        };
        info!(peer = %key, username = %peer.username, "peer active");
        if !quiet {
            if first && origin == Origin::Outbound {
                self.roster_from = Some(handle);
            } else if first {
                actions.push(Action::Notify(Notice::JoinedMesh {
                    members: advertised.len() + 1,
                }));
            }
            actions.push(Action::Notify(joined_notice(&peer)));
        }
        if origin == Origin::Inbound {
            let known = self.peers.active_addrs_except(handle);
            actions.push(Action::Send {
                channel: handle,
                frame: wire::encode_frame(&WireMessage::PeerList { peers: known }),
            });
        }
        for addr in advertised {
            self.join(addr, local, actions);
        }
    }

    fn on_datagram_message(
        &mut self,
        from: PeerAddr,
        msg: WireMessage,
        actions: &mut Vec<Action>,
    ) -> Result<(), MessageError> {
        let address = normalize_address(from.address);
        match msg {
            WireMessage::Identity {
                username,
                port,
                zip_code,
                age,
                peers,
            } => {
                let profile = PeerProfile {
                    username,
                    listening_port: port,
                    zip_code,
                    age,
                };
                self.on_datagram_join(address, profile, peers, actions);
            }
            WireMessage::Message { username, text } => {
                let username = username.or_else(|| {
                    self.peers
                        .find(PeerAddr::new(address, from.port))
                        .map(|p| p.username.clone())
                });
                match username {
                    Some(username) => actions.push(Action::Notify(Notice::Chat { username, text })),
                    None => debug!(%from, "anonymous message from unknown sender dropped"),
                }
            }
            WireMessage::Leave { port, .. } => {
                if let Some(peer) = self.peers.remove(PeerAddr::new(address, port)) {
                    actions.extend(departure(&peer));
                }
            }
            // Datagram peers learn the mesh from the Join's peer array.
            WireMessage::PeerList { .. } => {
                return Err(MessageError::Unexpected {
                    kind: msg.kind(),
                    mode: TransportMode::Datagram,
                });
            }
        }
        Ok(())
    }

    fn on_datagram_join(
        &mut self,
        address: Ipv4Addr,
        profile: PeerProfile,
        advertised: Vec<PeerAddr>,
        actions: &mut Vec<Action>,
    ) {
        let key = PeerAddr::new(address, profile.listening_port);
        let handle = ChannelHandle::Datagram(key);
        let first = self.peers.active_peers().next().is_none();
        let peer = match self.peers.find(key) {
            Some(existing) if existing.is_active() => {
                debug!(peer = %key, "repeated join ignored");
                return;
            }
            Some(existing) => {
                let channel = existing.channel;
                match self.peers.promote(channel, profile) {
                    Ok(peer) => peer.clone(),
                    Err(e) => {
                        warn!(peer = %key, "cannot promote peer: {e}");
                        return;
                    }
                }
            }
            None => {
                match self.peers.add(PeerRecord::joined(address, profile, handle)) {
                    Ok(peer) => peer.clone(),
                    Err(e) => {
                        warn!(peer = %key, "join refused: {e}");
                        actions.push(Action::Notify(Notice::AtCapacity));
                        return;
                    }
                }
            }
        };
        // A sender we had not addressed yet needs our Join in reply.
        if peer.origin == Origin::Inbound {
            let known = self.peers.active_addrs_except(peer.channel);
            actions.push(self.send_identity(peer.channel, known));
        }
        info!(peer = %key, username = %peer.username, "peer active");
        if first {
            actions.push(Action::Notify(Notice::JoinedMesh {
                members: advertised.len() + 1,
            }));
        }
        actions.push(Action::Notify(joined_notice(&peer)));
        for addr in advertised {
            self.join(addr, None, actions);
        }
    }

    /// Outbound join toward `addr`. Known, in-flight and self addresses are skipped.
    fn join(&mut self, addr: PeerAddr, local: Option<Ipv4Addr>, actions: &mut Vec<Action>) {
        let addr = PeerAddr::new(normalize_address(addr.address), addr.port);
        if self.peers.has(addr) || self.connecting.contains(&addr) {
            return;
        }
        if self.is_self(addr, local) {
            debug!(peer = %addr, "skipping own address");
            return;
        }
        match self.mode {
            TransportMode::Stream => {
                self.connecting.insert(addr);
                actions.push(Action::Connect(addr));
            }
            TransportMode::Datagram => {
                let handle = ChannelHandle::Datagram(addr);
                let known = self.peers.active_addrs_except(handle);
                if let Err(e) = self.peers.add(PeerRecord::outbound(addr, handle, None)) {
                    warn!(peer = %addr, "join refused: {e}");
                    actions.push(Action::Notify(Notice::AtCapacity));
                    return;
                }
                actions.push(self.send_identity(handle, known));
            }
        }
    }

    /// Own listening port on a loopback address or on the interface `local` names.
    fn is_self(&self, addr: PeerAddr, local: Option<Ipv4Addr>) -> bool {
        addr.port == self.me.port() && (addr.address.is_loopback() || Some(addr.address) == local)
    }

    /// Drop every peer. Datagram peers get a best-effort Leave; stream channels are closed.
    fn leave_mesh(&mut self, actions: &mut Vec<Action>) {
        self.connecting.clear();
        self.roster_from = None;
        let leave = wire::encode_frame(&self.me.leave_message());
        for peer in self.peers.remove_all() {
            match peer.channel {
                ChannelHandle::Datagram(_) => actions.push(Action::Send {
                    channel: peer.channel,
                    frame: leave.clone(),
                }),
                ChannelHandle::Stream(id) => actions.push(Action::Close(id)),
            }
            actions.extend(departure(&peer));
        }
    }

    fn refuse(&self, e: RegistryError, channel: ChannelId, actions: &mut Vec<Action>) {
        warn!(%channel, "peer refused: {e}");
        if matches!(e, RegistryError::Full(_)) {
            actions.push(Action::Notify(Notice::AtCapacity));
        }
        actions.push(Action::Close(channel));
    }

    fn send_identity(&self, channel: ChannelHandle, peers: Vec<PeerAddr>) -> Action {
        Action::Send {
            channel,
            frame: wire::encode_frame(&self.me.identity_message(peers)),
        }
    }

    fn self_profile(&self) -> Action {
        Action::Notify(Notice::Profile {
            username: self.me.username().to_string(),
            zip_code: self.me.zip_code(),
            age: self.me.age(),
        })
    }
}

fn order_key(addr: PeerAddr) -> (u16, Ipv4Addr) {
    (addr.port, addr.address)
}

fn profile_notice(peer: &PeerRecord) -> Action {
    Action::Notify(Notice::Profile {
        username: peer.username.clone(),
        zip_code: peer.zip_code,
        age: peer.age,
    })
}

fn joined_notice(peer: &PeerRecord) -> Notice {
    Notice::PeerJoined {
        username: peer.username.clone(),
        addr: PeerAddr::new(peer.address, peer.listening_port.unwrap_or_default()),
        zip_code: peer.zip_code,
        age: peer.age,
    }
}

/// Departure notice, only for peers that completed the handshake.
fn departure(peer: &PeerRecord) -> Option<Action> {
    let addr = peer.key()?;
    peer.is_active().then(|| {
        Action::Notify(Notice::PeerLeft {
            username: peer.username.clone(),
            addr,
        })
    })
}
