//! LanChat wire protocol: discovery announcement, stream frame types and version.

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Millis;

/// Current protocol version. Carried in announcements and in the connection hello.
pub const PROTOCOL_VERSION: u8 = 1;

/// Unique message identifier (UUID v4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new() -> Self {
        MessageId(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Unique file transfer identifier (UUID v4). Shared by sender and receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransferId(pub Uuid);

impl TransferId {
    pub fn new() -> Self {
        TransferId(Uuid::new_v4())
    }
}

impl Default for TransferId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for TransferId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(TransferId)
    }
}

/// Discovery packet broadcast on the subnet. Carries the announcing Identity and a
/// sequence number that increases with every announcement of one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    pub protocol_version: u8,
    pub display_name: String,
    pub device_label: String,
    /// Address the peer accepts connections on.
    pub address: SocketAddr,
    pub platform_tag: String,
    pub session_start: Millis,
    pub sequence_number: u64,
    pub sent_at: Millis,
}

/// All stream frame types. Encoding is bincode; framing is length-prefix (see wire module).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Frame {
    /// First frame on every connection: who is connecting and where it listens.
    Hello {
        protocol_version: u8,
        address: SocketAddr,
    },
    /// Text message.
    Text {
        message_id: MessageId,
        body: String,
        sent_at: Millis,
    },
    /// Delivery acknowledgment for a text message.
    TextAck { message_id: MessageId },
    /// Sender proposes (or re-proposes, on resume) a file transfer.
    TransferOffer {
        transfer_id: TransferId,
        file_name: String,
        total_bytes: u64,
        chunk_size: u64,
    },
    /// Receiver accepts and names the next sequence number it needs.
    TransferAccept {
        transfer_id: TransferId,
        next_sequence: u64,
    },
    /// One chunk of file data with its SHA-256 checksum.
    ChunkData {
        transfer_id: TransferId,
        sequence: u64,
        checksum: [u8; 32],
        payload: Vec<u8>,
    },
    /// Chunk received, verified and stored.
    ChunkAck { transfer_id: TransferId, sequence: u64 },
    /// Chunk rejected (checksum mismatch); sender should resend it.
    ChunkNack { transfer_id: TransferId, sequence: u64 },
    /// Either side abandons the transfer.
    TransferCancel { transfer_id: TransferId, reason: String },
}
