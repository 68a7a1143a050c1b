//! Core types used throughout the store.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier of a physical storage block.
pub type BlockId = u64;

/// Response to a command: `response[0]` is a status tag, the rest is payload.
pub type Response = Vec<String>;

/// Number of hash slots. Slot ranges are inclusive, so the full key space is
/// conventionally written `[0, SLOT_MAX]`.
pub const SLOT_MAX: u32 = 65536;

/// Trailing argument appended by migration traffic so an importing shard
/// accepts keys from its import range.
pub const REDIRECTED_MARKER: &str = "!redirected";

/// Orders a request within a chain.
///
/// `client_id` and `client_seq_no` identify the request from the client's
/// point of view; `server_seq_no` is assigned once by the head as the request
/// enters the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SequenceId {
    pub client_id: i64,
    pub client_seq_no: i64,
    pub server_seq_no: i64,
}

impl SequenceId {
    /// A sequence id for a fresh client request, not yet numbered by a head.
    pub fn new(client_id: i64, client_seq_no: i64) -> Self {
        Self {
            client_id,
            client_seq_no,
            server_seq_no: -1,
        }
    }
}

impl fmt::Display for SequenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}/{}",
            self.client_id, self.client_seq_no, self.server_seq_no
        )
    }
}

/// Position of a link inside its chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChainRole {
    Singleton,
    Head,
    Mid,
    Tail,
}

impl ChainRole {
    /// Role of the member at `index` in a chain of `len` links.
    pub fn for_position(index: usize, len: usize) -> Self {
        match (index, len) {
            (_, 1) => ChainRole::Singleton,
            (0, _) => ChainRole::Head,
            (i, n) if i + 1 == n => ChainRole::Tail,
            _ => ChainRole::Mid,
        }
    }

    /// Whether this link accepts client mutators.
    pub fn is_head(self) -> bool {
        matches!(self, ChainRole::Head | ChainRole::Singleton)
    }

    /// Whether this link answers clients.
    pub fn is_tail(self) -> bool {
        matches!(self, ChainRole::Tail | ChainRole::Singleton)
    }
}

impl fmt::Display for ChainRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChainRole::Singleton => "singleton",
            ChainRole::Head => "head",
            ChainRole::Mid => "mid",
            ChainRole::Tail => "tail",
        };
        f.write_str(s)
    }
}

/// An ordered list of blocks replicating one partition, as recorded by the
/// directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaChain {
    /// Partition name (the slot range for hash tables, e.g. `0_65536`).
    pub name: String,
    /// Partition metadata, e.g. `regular` or `importing`.
    pub metadata: String,
    /// Member blocks, head first.
    pub block_ids: Vec<BlockId>,
}

impl ReplicaChain {
    pub fn new(name: impl Into<String>, metadata: impl Into<String>, block_ids: Vec<BlockId>) -> Self {
        Self {
            name: name.into(),
            metadata: metadata.into(),
            block_ids,
        }
    }

    /// A chain known only by its members, as carried in an `!exporting` redirect.
    pub fn from_blocks(block_ids: Vec<BlockId>) -> Self {
        Self::new("", "", block_ids)
    }

    pub fn head(&self) -> Option<BlockId> {
        self.block_ids.first().copied()
    }

    pub fn tail(&self) -> Option<BlockId> {
        self.block_ids.last().copied()
    }

    pub fn len(&self) -> usize {
        self.block_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.block_ids.is_empty()
    }

    /// Role and successor of `block` in this chain.
    pub fn position_of(&self, block: BlockId) -> Option<(ChainRole, Option<BlockId>)> {
        let index = self.block_ids.iter().position(|b| *b == block)?;
        let role = ChainRole::for_position(index, self.block_ids.len());
        Some((role, self.block_ids.get(index + 1).copied()))
    }

    /// Member ids joined with `!`, the form used in redirect tags.
    pub fn target_string(&self) -> String {
        self.block_ids
            .iter()
            .map(|b| b.to_string())
            .collect::<Vec<_>>()
            .join("!")
    }

    /// Parse the output of [`ReplicaChain::target_string`].
    pub fn parse_target(s: &str) -> Option<Self> {
        let ids = s
            .split('!')
            .map(|p| p.parse::<BlockId>().ok())
            .collect::<Option<Vec<_>>>()?;
        if ids.is_empty() {
            return None;
        }
        Some(Self::from_blocks(ids))
    }
}

impl fmt::Display for ReplicaChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.name, self.target_string())
    }
}

/// Inclusive range of hash slots owned by a shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlotRange {
    pub begin: u32,
    pub end: u32,
}

impl SlotRange {
    pub const FULL: SlotRange = SlotRange {
        begin: 0,
        end: SLOT_MAX,
    };

    pub fn new(begin: u32, end: u32) -> Self {
        Self { begin, end }
    }

    pub fn contains(&self, slot: u32) -> bool {
        self.begin <= slot && slot <= self.end
    }

    /// Whether `other` starts right after this range ends, or the reverse.
    pub fn is_adjacent(&self, other: &SlotRange) -> bool {
        self.end.checked_add(1) == Some(other.begin) || other.end.checked_add(1) == Some(self.begin)
    }

    /// Smallest range covering both.
    pub fn union(&self, other: &SlotRange) -> SlotRange {
        SlotRange::new(self.begin.min(other.begin), self.end.max(other.end))
    }

    /// Split point used by auto-scaling: the upper half `[mid, end]` moves out.
    pub fn midpoint(&self) -> u32 {
        self.begin + (self.end - self.begin) / 2
    }

    /// Partition name for this range, e.g. `0_65536`.
    pub fn name(&self) -> String {
        format!("{}_{}", self.begin, self.end)
    }

    /// Parse a partition name of the form `begin_end`.
    pub fn parse(name: &str) -> Option<Self> {
        let (begin, end) = name.split_once('_')?;
        let begin = begin.parse().ok()?;
        let end = end.parse().ok()?;
        (begin <= end).then_some(SlotRange { begin, end })
    }
}

impl fmt::Display for SlotRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.begin, self.end)
    }
}

/// Status tag carried in `response[0]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    Ok,
    KeyNotFound,
    DuplicateKey,
    /// The key is outside every range this shard serves.
    BlockMoved,
    /// The key has already moved to the given chain; resend there.
    Exporting(ReplicaChain),
    ArgsError,
    UnknownCommand,
    BlockNotLocked,
    OutOfCapacity,
    Fail,
}

const EXPORTING_PREFIX: &str = "!exporting!";

impl Status {
    /// A response holding only this status.
    pub fn reply(self) -> Response {
        vec![self.to_string()]
    }

    /// A response holding this status followed by `value`.
    pub fn reply_with(self, value: impl Into<String>) -> Response {
        vec![self.to_string(), value.into()]
    }

    /// Status of a response, if its first element is a known tag.
    pub fn of(response: &[String]) -> Option<Status> {
        response.first().and_then(|s| s.parse().ok())
    }

    /// Whether the caller should resend elsewhere.
    pub fn is_redirect(&self) -> bool {
        matches!(self, Status::BlockMoved | Status::Exporting(_))
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Ok => f.write_str("!ok"),
            Status::KeyNotFound => f.write_str("!key_not_found"),
            Status::DuplicateKey => f.write_str("!duplicate_key"),
            Status::BlockMoved => f.write_str("!block_moved"),
            Status::Exporting(chain) => write!(f, "{}{}", EXPORTING_PREFIX, chain.target_string()),
            Status::ArgsError => f.write_str("!args_error"),
            Status::UnknownCommand => f.write_str("!unknown_command"),
            Status::BlockNotLocked => f.write_str("!block_not_locked"),
            Status::OutOfCapacity => f.write_str("!out_of_capacity"),
            Status::Fail => f.write_str("!fail"),
        }
    }
}

impl FromStr for Status {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if let Some(target) = s.strip_prefix(EXPORTING_PREFIX) {
            return ReplicaChain::parse_target(target).map(Status::Exporting).ok_or(());
        }
        match s {
            "!ok" => Ok(Status::Ok),
            "!key_not_found" => Ok(Status::KeyNotFound),
            "!duplicate_key" => Ok(Status::DuplicateKey),
            "!block_moved" => Ok(Status::BlockMoved),
            "!args_error" => Ok(Status::ArgsError),
            "!unknown_command" => Ok(Status::UnknownCommand),
            "!block_not_locked" => Ok(Status::BlockNotLocked),
            "!out_of_capacity" => Ok(Status::OutOfCapacity),
            "!fail" => Ok(Status::Fail),
            _ => Err(()),
        }
    }
}
