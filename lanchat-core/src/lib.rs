//! LanChat protocol core.
//! Host-driven: no I/O; host passes observations, frames, ticks and file I/O
//! completions, and receives actions.

/// Unix time in milliseconds, supplied by the host.
pub type Millis = u64;

pub mod channel;
pub mod chunk;
pub mod config;
pub mod core;
pub mod discovery;
pub mod error;
pub mod event;
pub mod identity;
pub mod integrity;
pub mod protocol;
pub mod registry;
pub mod transfer;
pub mod wire;

pub use channel::{DeliveryState, Message};
pub use config::{CoreConfig, LivenessWindows, RetryPolicy};
pub use core::{ChatCore, ConnectionId, Lane, Link, OutboundAction};
pub use discovery::{Announcer, PacketFilter};
pub use error::{ConfigError, Error, NetworkError, ProtocolError, ResourceError, ValidationError};
pub use event::Event;
pub use identity::{Identity, SessionSummary};
pub use protocol::{MessageId, TransferId, PROTOCOL_VERSION};
pub use registry::{PeerRecord, PeerStatus};
pub use transfer::{Direction, FileTransfer, TransferState};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
