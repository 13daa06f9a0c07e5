//! Error taxonomy: validation, network, protocol and resource failures.

use thiserror::Error;

use crate::wire::{FrameDecodeError, FrameEncodeError};

/// Top-level error returned by core operations invoked by the shell.
#[derive(Error, Debug)]
pub enum Error {
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("resource error: {0}")]
    Resource(#[from] ResourceError),

    #[error("unknown transfer")]
    UnknownTransfer,

    #[error("transfer is {0:?} and cannot be {1}")]
    InvalidTransferState(crate::transfer::TransferState, &'static str),

    #[error("session has ended")]
    SessionEnded,
}

/// Bad user input. Surfaced to the shell as a field-level message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Display name is required")]
    NameRequired,

    #[error("Display name must be at least {min} characters")]
    NameTooShort { min: usize },

    #[error("Display name must be at most {max} characters")]
    NameTooLong { max: usize },

    #[error("Display name contains invalid characters")]
    NameInvalidCharacters,

    #[error("Message is empty")]
    EmptyMessage,

    #[error("Message exceeds {max} bytes")]
    MessageTooLarge { max: usize },

    #[error("File is empty")]
    EmptyFile,

    #[error("File name is missing")]
    FileNameMissing,
}

/// Socket or connection failure. Retried per component policy; surfaced only once
/// the retry budget is exhausted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("connection to {0} failed")]
    ConnectionFailed(std::net::SocketAddr),

    #[error("acknowledgment timed out")]
    AckTimeout,

    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<NetworkError> },

    #[error("peer {0} was evicted")]
    PeerEvicted(std::net::SocketAddr),

    #[error("session ended")]
    SessionEnded,
}

/// Malformed packet, frame or chunk. Dropped and logged, never surfaced to the user.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("frame: {0}")]
    Frame(#[from] FrameDecodeError),

    #[error("encode: {0}")]
    Encode(#[from] FrameEncodeError),

    #[error("bad magic header")]
    BadMagic,

    #[error("unsupported protocol version {0}")]
    Version(u8),

    #[error("invalid address {0}")]
    InvalidAddress(std::net::SocketAddr),

    #[error("invalid display name: {0}")]
    InvalidName(ValidationError),

    #[error("unexpected chunk sequence {got}, expected {expected}")]
    UnexpectedSequence { expected: u64, got: u64 },

    #[error("chunk checksum mismatch")]
    ChecksumMismatch,

    #[error("chunk length {got} does not match expected {expected}")]
    ChunkLength { expected: u64, got: u64 },

    #[error("connection did not start with a hello frame")]
    MissingHello,
}

/// Local resource failure (disk full, unreadable source). Fatal to one transfer only.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResourceError {
    #[error("cannot read source: {0}")]
    Read(String),

    #[error("cannot write destination: {0}")]
    Write(String),
}

/// Invalid configuration value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("liveness windows must satisfy online < away < eviction")]
    WindowOrder,

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("chunk size must be at most {max} bytes")]
    ChunkTooLarge { max: u64 },
}
