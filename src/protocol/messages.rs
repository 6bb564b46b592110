//! Protocol message types for the chat relay
//!
//! All message payloads that can be serialized/deserialized within frames.
//! Uses serde for JSON serialization (can be swapped for a binary format).

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::net::{AddrParseError, IpAddr, SocketAddr};

/// Unique identifier types
pub type ConnId = u64;
pub type FileId = u64;

/// Display format for the timestamp clause of a rendered message line
const LABEL_TIME_FORMAT: &str = "%Y-%m-%d, %H:%M";

// =============================================================================
// Client -> server
// =============================================================================

/// A package sent by a client over the chat channel
///
/// One package can carry a registration, a chat message, or both (mixed
/// use); the registration part is always applied first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Package {
    /// Proposed display name, present only on registration
    pub sender_name: Option<String>,
    /// Registration flag
    pub is_for_connection: bool,
    /// Broadcast flag
    pub is_for_all: bool,
    /// Target connection, meaningful only when not broadcast
    pub receiver_id: ConnId,
    /// Message body; an empty body means nothing is routed
    pub message: String,
    /// Attachment identifiers (opaque references, never resolved here)
    pub files: Vec<FileId>,
}

impl Package {
    /// Registration package carrying a proposed display name
    pub fn registration(name: impl Into<String>) -> Self {
        Self {
            sender_name: Some(name.into()),
            is_for_connection: true,
            ..Self::default()
        }
    }

    /// Broadcast chat package for the global conversation
    pub fn broadcast(message: impl Into<String>, files: Vec<FileId>) -> Self {
        Self {
            is_for_all: true,
            message: message.into(),
            files,
            ..Self::default()
        }
    }

    /// Direct chat package addressed to one connection
    pub fn direct(receiver_id: ConnId, message: impl Into<String>, files: Vec<FileId>) -> Self {
        Self {
            receiver_id,
            message: message.into(),
            files,
            ..Self::default()
        }
    }

    /// Whether the package carries a registration
    pub fn has_registration(&self) -> bool {
        self.is_for_connection
    }

    /// Whether the package carries a routable body
    pub fn has_body(&self) -> bool {
        !self.message.is_empty()
    }
}

// =============================================================================
// Conversation store
// =============================================================================

/// Identity of one message log
///
/// `Direct` keys are ordered pairs; the unordered-pair identity of a private
/// chat is realized by the mirroring invariant: whenever `Direct { a, b }`
/// exists in the store, `Direct { b, a }` exists with identical content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConversationKey {
    /// The broadcast-visible log, always present
    Global,
    /// Private chat between two connections, as seen from `a`'s side
    Direct { a: ConnId, b: ConnId },
}

impl ConversationKey {
    pub fn direct(a: ConnId, b: ConnId) -> Self {
        ConversationKey::Direct { a, b }
    }

    /// The same pair seen from the other side; Global mirrors to itself
    pub fn mirror(&self) -> Self {
        match *self {
            ConversationKey::Global => ConversationKey::Global,
            ConversationKey::Direct { a, b } => ConversationKey::Direct { a: b, b: a },
        }
    }

    /// Whether the key involves the given connection
    pub fn mentions(&self, id: ConnId) -> bool {
        match *self {
            ConversationKey::Global => false,
            ConversationKey::Direct { a, b } => a == id || b == id,
        }
    }

}

/// One entry of a conversation log
///
/// Immutable once appended; logs are append-only and insertion-ordered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Unix timestamp in milliseconds
    pub timestamp: u64,
    /// Rendered sender label (`"[<date>, <time>] {<N> files} <name>"`);
    /// empty for system messages
    pub label: String,
    /// Attachment identifiers
    pub files: Vec<FileId>,
    /// Message body
    pub body: String,
}

impl ChatMessage {
    /// Build a user message stamped with the current local time
    pub fn user(sender: &str, body: impl Into<String>, files: Vec<FileId>) -> Self {
        Self::user_at(Local::now(), sender, body, files)
    }

    /// Build a user message stamped with an explicit time
    pub fn user_at(
        at: DateTime<Local>,
        sender: &str,
        body: impl Into<String>,
        files: Vec<FileId>,
    ) -> Self {
        let files_clause = if files.is_empty() {
            String::new()
        } else {
            format!("{{{} files}} ", files.len())
        };
        let label = format!("[{}] {}{}", at.format(LABEL_TIME_FORMAT), files_clause, sender);

        Self {
            timestamp: at.timestamp_millis() as u64,
            label,
            files,
            body: body.into(),
        }
    }

    /// Build a system message (join/leave announcements); no sender label
    pub fn system(body: impl Into<String>) -> Self {
        Self {
            timestamp: crate::current_timestamp(),
            label: String::new(),
            files: Vec::new(),
            body: body.into(),
        }
    }

    /// The line a chat view renders for this message
    pub fn display_line(&self) -> String {
        if self.label.is_empty() {
            self.body.clone()
        } else {
            format!("{}: {}", self.label, self.body)
        }
    }
}

// =============================================================================
// Server -> client pushes
// =============================================================================

/// One conversation log within a store sync
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationEntry {
    pub key: ConversationKey,
    pub messages: Vec<ChatMessage>,
}

/// Full-state push of the conversation store
///
/// Sent to every registered connection after any append; a client's local
/// chat view converges to this authoritative state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSync {
    pub conversations: Vec<ConversationEntry>,
}

impl StoreSync {
    /// Look up one conversation log by key
    pub fn conversation(&self, key: &ConversationKey) -> Option<&[ChatMessage]> {
        self.conversations
            .iter()
            .find(|entry| entry.key == *key)
            .map(|entry| entry.messages.as_slice())
    }

    /// The global log; present in every well-formed sync
    pub fn global(&self) -> &[ChatMessage] {
        self.conversation(&ConversationKey::Global).unwrap_or(&[])
    }
}

/// Roster push: the id -> name mapping, personalized with the recipient's
/// own id so a client learns how to address direct messages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RosterSync {
    /// The recipient's own connection id
    pub you: ConnId,
    /// Registered users, ordered by connection id
    pub users: Vec<RosterEntry>,
}

impl RosterSync {
    /// Look up a display name by connection id
    pub fn name_of(&self, id: ConnId) -> Option<&str> {
        self.users
            .iter()
            .find(|entry| entry.id == id)
            .map(|entry| entry.name.as_str())
    }
}

/// One roster line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub id: ConnId,
    pub name: String,
}

// =============================================================================
// Discovery datagrams
// =============================================================================

/// Payload of both the discovery probe and the discovery reply
///
/// A probe identifies the requester (where the reply should be sent); a
/// reply identifies the server's chat listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAddr {
    pub ip: String,
    pub port: u16,
}

impl NodeAddr {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
        }
    }

    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        Self {
            ip: addr.ip().to_string(),
            port: addr.port(),
        }
    }

    pub fn to_socket_addr(&self) -> Result<SocketAddr, AddrParseError> {
        self.ip
            .parse::<IpAddr>()
            .map(|ip| SocketAddr::new(ip, self.port))
    }
}
