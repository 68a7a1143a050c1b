//! Snapshot file format.
//!
//! # File Format
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │ MAGIC_NUMBER: [u8; 4] = "CHST"                  │
//! ├─────────────────────────────────────────────────┤
//! │ VERSION: u32 = 1                                │
//! ├─────────────────────────────────────────────────┤
//! │ FLAGS: u32                                      │
//! │   bit 0: compressed (LZ4)                       │
//! ├─────────────────────────────────────────────────┤
//! │ SLOT_BEGIN: u32                                 │
//! ├─────────────────────────────────────────────────┤
//! │ SLOT_END: u32                                   │
//! ├─────────────────────────────────────────────────┤
//! │ TIMESTAMP: u64 (Unix timestamp seconds)         │
//! ├─────────────────────────────────────────────────┤
//! │ ENTRY_COUNT: u64                                │
//! ├─────────────────────────────────────────────────┤
//! │ DATA_SIZE: u64 (uncompressed size)              │
//! ├─────────────────────────────────────────────────┤
//! │ RESERVED: [u8; 20]                              │
//! ├─────────────────────────────────────────────────┤
//! │                   DATA BLOCK                    │
//! │ (possibly LZ4 compressed)                       │
//! │ ┌─────────────────────────────────────────────┐ │
//! │ │ Entry:                                      │ │
//! │ │  - Length: u32                              │ │
//! │ │  - bincode {key, value}                     │ │
//! │ │  - CRC32: u32                               │ │
//! │ └─────────────────────────────────────────────┘ │
//! ├─────────────────────────────────────────────────┤
//! │ CRC32: u32                                      │
//! └─────────────────────────────────────────────────┘
//!
//! Total header size: 64 bytes
//! ```

use crate::error::SnapshotError;
use crate::types::SlotRange;
use crc::{Crc, CRC_32_ISCSI};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

/// Magic number for snapshot files: "CHST"
pub const MAGIC: [u8; 4] = [b'C', b'H', b'S', b'T'];

/// Current format version
pub const VERSION: u32 = 1;

/// Header size in bytes
pub const HEADER_SIZE: usize = 64;

/// Flag: data is LZ4 compressed
pub const FLAG_COMPRESSED: u32 = 1 << 0;

/// Scheme prefix accepted on snapshot paths.
pub const LOCAL_SCHEME: &str = "local://";

/// CRC-32 calculator (iSCSI polynomial)
pub(crate) const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Snapshot file header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotHeader {
    pub version: u32,
    pub flags: u32,
    /// First slot of the shard that wrote the snapshot
    pub slot_begin: u32,
    /// Last slot (inclusive)
    pub slot_end: u32,
    /// Unix timestamp when the snapshot was created
    pub timestamp: u64,
    pub entry_count: u64,
    /// Uncompressed data size
    pub data_size: u64,
}

impl SnapshotHeader {
    pub fn new(range: SlotRange) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        Self {
            version: VERSION,
            flags: 0,
            slot_begin: range.begin,
            slot_end: range.end,
            timestamp,
            entry_count: 0,
            data_size: 0,
        }
    }

    pub fn is_compressed(&self) -> bool {
        self.flags & FLAG_COMPRESSED != 0
    }

    pub fn set_compressed(&mut self, compressed: bool) {
        if compressed {
            self.flags |= FLAG_COMPRESSED;
        } else {
            self.flags &= !FLAG_COMPRESSED;
        }
    }

    pub fn slot_range(&self) -> SlotRange {
        SlotRange::new(self.slot_begin, self.slot_end)
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..12].copy_from_slice(&self.flags.to_le_bytes());
        buf[12..16].copy_from_slice(&self.slot_begin.to_le_bytes());
        buf[16..20].copy_from_slice(&self.slot_end.to_le_bytes());
        buf[20..28].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[28..36].copy_from_slice(&self.entry_count.to_le_bytes());
        buf[36..44].copy_from_slice(&self.data_size.to_le_bytes());
        // Reserved (44-63) - already zeros
        buf
    }

    /// Parse header from bytes
    pub fn from_bytes(buf: &[u8]) -> Result<Self, SnapshotError> {
        if buf.len() < HEADER_SIZE {
            return Err(SnapshotError::InvalidHeader("header too short".into()));
        }
        if buf[0..4] != MAGIC {
            return Err(SnapshotError::InvalidMagic);
        }

        let version = read_u32(buf, 4);
        if version > VERSION {
            return Err(SnapshotError::UnsupportedVersion(version));
        }

        let header = Self {
            version,
            flags: read_u32(buf, 8),
            slot_begin: read_u32(buf, 12),
            slot_end: read_u32(buf, 16),
            timestamp: read_u64(buf, 20),
            entry_count: read_u64(buf, 28),
            data_size: read_u64(buf, 36),
        };
        if header.slot_begin > header.slot_end {
            return Err(SnapshotError::InvalidHeader(format!(
                "slot range {}_{} is reversed",
                header.slot_begin, header.slot_end
            )));
        }
        Ok(header)
    }
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(bytes)
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(bytes)
}

/// A single entry in the snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub key: String,
    pub value: String,
}

/// Filesystem path for a snapshot location, which is either a plain path or
/// a `local://` URI.
pub fn resolve_path(location: &str) -> Result<PathBuf, SnapshotError> {
    if let Some(path) = location.strip_prefix(LOCAL_SCHEME) {
        return Ok(PathBuf::from(path));
    }
    match location.split_once("://") {
        Some((scheme, _)) => Err(SnapshotError::UnsupportedScheme(scheme.to_string())),
        None => Ok(PathBuf::from(location)),
    }
}
