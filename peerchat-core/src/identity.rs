//! Node identity: who this process is on the mesh. Fixed at startup.

use crate::protocol::{PeerAddr, WireMessage, USERNAME_LENGTH};

/// This node's identity. Immutable after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelfIdentity {
    username: String,
    port: u16,
    zip_code: u32,
    age: u8,
}

impl SelfIdentity {
    /// Build an identity. The username is cut to what fits in the wire field.
    pub fn new(username: &str, port: u16, zip_code: u32, age: u8) -> Self {
        Self {
            username: truncate_username(username),
            port,
            zip_code,
            age,
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn zip_code(&self) -> u32 {
        self.zip_code
    }

    pub fn age(&self) -> u8 {
        self.age
    }

    /// Identity/Join message advertising `peers` to the receiver.
    pub fn identity_message(&self, peers: Vec<PeerAddr>) -> WireMessage {
        WireMessage::Identity {
            username: self.username.clone(),
            port: self.port,
            zip_code: self.zip_code,
            age: self.age,
            peers,
        }
    }

    pub fn leave_message(&self) -> WireMessage {
        WireMessage::Leave {
            username: self.username.clone(),
            port: self.port,
        }
    }
}

fn truncate_username(name: &str) -> String {
    let mut end = name.len().min(USERNAME_LENGTH - 1);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_username_truncated_to_field() {
        let id = SelfIdentity::new(&"n".repeat(64), 8129, 1, 2);
        assert_eq!(id.username().len(), USERNAME_LENGTH - 1);
    }

    #[test]
    fn identity_message_carries_fields() {
        let id = SelfIdentity::new("alice", 9000, 11111, 30);
        match id.identity_message(vec![]) {
            WireMessage::Identity {
                username,
                port,
                zip_code,
                age,
                peers,
            } => {
                assert_eq!(username, "alice");
                assert_eq!((port, zip_code, age), (9000, 11111, 30));
                assert!(peers.is_empty());
            }
            other => panic!("expected Identity, got {other:?}"),
        }
    }
}
