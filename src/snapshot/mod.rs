//! Shard snapshots.
//!
//! A snapshot captures the key/value pairs of one hash table shard together
//! with the slot range it owned. Files are written through a temporary file
//! and renamed into place, so a crash never leaves a half-written snapshot
//! at the destination.
//!
//! # Example
//!
//! ```ignore
//! let meta = snapshot::write_snapshot("local:///var/lib/chainstore/0_65536.snap",
//!     range, true, entries.iter().map(|(k, v)| (k.as_str(), v.as_str())))?;
//! let (header, entries) = snapshot::read_snapshot("/var/lib/chainstore/0_65536.snap")?;
//! ```

pub mod format;
pub mod reader;
pub mod writer;

pub use format::{resolve_path, SnapshotEntry, SnapshotHeader, HEADER_SIZE, LOCAL_SCHEME};
pub use reader::SnapshotReader;
pub use writer::{SnapshotMetadata, SnapshotWriter};

use crate::error::SnapshotError;
use crate::types::SlotRange;

/// Write `entries` as a snapshot of a shard owning `range`.
pub fn write_snapshot<'a>(
    location: &str,
    range: SlotRange,
    compress: bool,
    entries: impl IntoIterator<Item = (&'a str, &'a str)>,
) -> Result<SnapshotMetadata, SnapshotError> {
    let mut writer = SnapshotWriter::create(resolve_path(location)?, range, compress)?;
    for (key, value) in entries {
        writer.write(key, value)?;
    }
    writer.finalize()
}

/// Read a whole snapshot, verifying every checksum.
pub fn read_snapshot(location: &str) -> Result<(SnapshotHeader, Vec<SnapshotEntry>), SnapshotError> {
    let mut reader = SnapshotReader::open(resolve_path(location)?)?;
    let entries = reader.read_all()?;
    Ok((reader.header().clone(), entries))
}
