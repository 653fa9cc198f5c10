//! PeerChat membership protocol.
//! Host-driven: no I/O; host passes events and receives actions.

pub mod command;
pub mod identity;
pub mod protocol;
pub mod registry;
pub mod wire;

pub use command::{Command, UserInputError};
pub use identity::SelfIdentity;
pub use protocol::{PeerAddr, TransportMode, WireMessage, DEFAULT_PORT, MAX_PEERS};
pub use registry::{ChannelHandle, ChannelId, PeerRecord, PeerRegistry};
pub use wire::{decode_frame, encode_frame, frame_len, FrameDecodeError, MAX_FRAME_LEN};
pub use core::{Action, MessageError, Notice, PeerChatCore};

pub mod core;
