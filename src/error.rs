//! Error types for the chain-replicated store.
//!
//! Application outcomes (`!key_not_found`, `!duplicate_key`, redirects) are
//! never errors: they travel back to the caller as status tags in the
//! response. The variants below cover protocol misuse, transport failures,
//! directory faults and persistence problems.

use crate::types::BlockId;
use std::io;
use thiserror::Error;

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the store.
#[derive(Error, Debug)]
pub enum Error {
    /// Chain transport errors.
    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    /// Chain protocol violations.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Block storage errors.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Directory errors.
    #[error("directory error: {0}")]
    Directory(#[from] DirectoryError),

    /// Snapshot persistence errors.
    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// The operation timed out waiting for the tail.
    #[error("operation timed out")]
    Timeout,

    /// A response carried a status the caller cannot act on.
    #[error("request rejected: {0}")]
    Rejected(String),

    /// The client kept getting redirected without reaching an owner.
    #[error("gave up after {attempts} redirects")]
    RedirectLimit { attempts: usize },

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the error came from a lost connection or an unresponsive
    /// member, which callers recover from through chain repair.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Network(_) | Error::Timeout)
    }
}

/// Chain transport errors.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// No live endpoint is registered for the block.
    #[error("block {0} is unreachable")]
    Unreachable(BlockId),

    /// The connection was torn down.
    #[error("connection closed")]
    ConnectionClosed,

    /// The link has no downstream connection.
    #[error("block {0} has no next link")]
    NoNextLink(BlockId),

    /// Failed to send message.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// A frame could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),
}

/// Violations of the chain replication protocol.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A client request reached a mid link.
    #[error("client request at mid link {0}")]
    RequestAtMid(BlockId),

    /// A mutator reached a tail that is not also the head.
    #[error("mutator `{op}` sent directly to tail {block}")]
    MutatorAtTail { block: BlockId, op: String },

    /// An accessor reached the head of a multi-link chain.
    #[error("accessor `{op}` sent to non-tail link {block}")]
    AccessorAtHead { block: BlockId, op: String },

    /// A chain request arrived at the head.
    #[error("chain request at head {0}")]
    ChainRequestAtHead(BlockId),

    /// An accessor was forwarded down the chain.
    #[error("accessor `{op}` forwarded to block {block}")]
    AccessorInChain { block: BlockId, op: String },

    /// A chain request carried an unknown command.
    #[error("unknown command `{0}` in chain request")]
    UnknownCommand(String),

    /// An empty argument list.
    #[error("empty command")]
    EmptyCommand,
}

/// Block storage errors.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Block not found.
    #[error("block not found: {0}")]
    BlockNotFound(BlockId),

    /// Block has no partition.
    #[error("block {0} holds no partition")]
    NoPartition(BlockId),

    /// Not enough free blocks.
    #[error("not enough free blocks: wanted {wanted}, have {available}")]
    OutOfBlocks { wanted: usize, available: usize },

    /// Unknown partition kind.
    #[error("unknown partition type: {0}")]
    UnknownPartitionType(String),
}

/// Directory errors.
#[derive(Error, Debug)]
pub enum DirectoryError {
    /// File not found.
    #[error("file not found: {0}")]
    FileNotFound(String),

    /// File already exists.
    #[error("file already exists: {0}")]
    FileExists(String),

    /// No chain with the given partition name.
    #[error("no partition named `{name}` in {path}")]
    PartitionNotFound { path: String, name: String },

    /// Every replica of a chain failed.
    #[error("all replicas of `{0}` failed")]
    ChainLost(String),

    /// The directory was dropped.
    #[error("directory unavailable")]
    Unavailable,
}

/// Snapshot persistence errors.
#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("invalid magic number")]
    InvalidMagic,

    #[error("unsupported version: {0}")]
    UnsupportedVersion(u32),

    #[error("invalid header: {0}")]
    InvalidHeader(String),

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("entry corrupted: expected crc {expected}, got {actual}")]
    EntryCorrupted { expected: u32, actual: u32 },

    #[error("entry is not valid utf-8")]
    InvalidUtf8,

    #[error("unsupported storage scheme: {0}")]
    UnsupportedScheme(String),

    #[error("compression failed: {0}")]
    CompressionFailed(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}
