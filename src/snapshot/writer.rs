//! Snapshot writer with streaming LZ4 compression and CRC32 integrity.
//!
//! Data goes to a temporary file next to the destination, which is renamed
//! into place once the header and checksum are final.

use crate::error::SnapshotError;
use crate::snapshot::format::{SnapshotHeader, CRC32, HEADER_SIZE};
use crate::types::SlotRange;
use lz4_flex::frame::FrameEncoder;
use std::fs::{self, File};
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Inner writer that handles compression transparently.
enum WriterInner {
    Compressed {
        encoder: FrameEncoder<CrcWriter<BufWriter<File>>>,
    },
    Uncompressed {
        writer: CrcWriter<BufWriter<File>>,
    },
}

/// Wrapper that calculates CRC32 while writing.
struct CrcWriter<W: Write> {
    inner: W,
    digest: crc::Digest<'static, u32>,
}

impl<W: Write> CrcWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            digest: CRC32.digest(),
        }
    }

    fn finalize_crc(self) -> (W, u32) {
        (self.inner, self.digest.finalize())
    }
}

impl<W: Write> Write for CrcWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.digest.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Streams key/value entries into a snapshot file.
pub struct SnapshotWriter {
    inner: WriterInner,
    header: SnapshotHeader,
    path: PathBuf,
    tmp_path: PathBuf,
    entry_count: u64,
    data_size: u64,
}

impl SnapshotWriter {
    /// Start a snapshot of a shard owning `range`.
    pub fn create(path: impl AsRef<Path>, range: SlotRange, compress: bool) -> Result<Self, SnapshotError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut tmp_name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        tmp_name.push(".tmp");
        let tmp_path = path.with_file_name(tmp_name);

        let mut buf_writer = BufWriter::new(File::create(&tmp_path)?);

        // placeholder, rewritten by finalize
        let mut header = SnapshotHeader::new(range);
        header.set_compressed(compress);
        buf_writer.write_all(&header.to_bytes())?;

        let crc_writer = CrcWriter::new(buf_writer);
        let inner = if compress {
            WriterInner::Compressed {
                encoder: FrameEncoder::new(crc_writer),
            }
        } else {
            WriterInner::Uncompressed { writer: crc_writer }
        };

        Ok(Self {
            inner,
            header,
            path,
            tmp_path,
            entry_count: 0,
            data_size: 0,
        })
    }

    /// Append one entry.
    pub fn write(&mut self, key: &str, value: &str) -> Result<(), SnapshotError> {
        let body = bincode::serialize(&(key, value))
            .map_err(|e| SnapshotError::Io(io::Error::other(e.to_string())))?;
        let crc = CRC32.checksum(&body);

        let writer: &mut dyn Write = match &mut self.inner {
            WriterInner::Compressed { encoder } => encoder,
            WriterInner::Uncompressed { writer } => writer,
        };
        writer.write_all(&(body.len() as u32).to_le_bytes())?;
        writer.write_all(&body)?;
        writer.write_all(&crc.to_le_bytes())?;

        self.entry_count += 1;
        self.data_size += (4 + body.len() + 4) as u64;
        Ok(())
    }

    /// Finish the data block, write the checksum and final header, sync and
    /// move the file into place.
    pub fn finalize(self) -> Result<SnapshotMetadata, SnapshotError> {
        let (mut buf_writer, crc) = match self.inner {
            WriterInner::Compressed { encoder } => encoder
                .finish()
                .map_err(|e| SnapshotError::CompressionFailed(e.to_string()))?
                .finalize_crc(),
            WriterInner::Uncompressed { writer } => writer.finalize_crc(),
        };
        let data_end = buf_writer.stream_position()?;

        buf_writer.write_all(&crc.to_le_bytes())?;

        let mut header = self.header;
        header.entry_count = self.entry_count;
        header.data_size = self.data_size;
        buf_writer.seek(SeekFrom::Start(0))?;
        buf_writer.write_all(&header.to_bytes())?;
        buf_writer.flush()?;

        let file = buf_writer
            .into_inner()
            .map_err(|e| SnapshotError::Io(io::Error::other(e.to_string())))?;
        file.sync_all()?;
        let file_size = file.metadata()?.len();
        drop(file);

        fs::rename(&self.tmp_path, &self.path)?;

        Ok(SnapshotMetadata {
            slot_range: header.slot_range(),
            timestamp: header.timestamp,
            entry_count: self.entry_count,
            uncompressed_size: self.data_size,
            compressed_size: data_end.saturating_sub(HEADER_SIZE as u64),
            file_size,
            checksum: crc,
        })
    }
}

/// Metadata about a written snapshot.
#[derive(Debug, Clone)]
pub struct SnapshotMetadata {
    pub slot_range: SlotRange,
    pub timestamp: u64,
    pub entry_count: u64,
    pub uncompressed_size: u64,
    /// Size of the data block on disk
    pub compressed_size: u64,
    /// Total file size including header and checksum
    pub file_size: u64,
    /// CRC32 of the data block
    pub checksum: u32,
}

impl SnapshotMetadata {
    /// Uncompressed to on-disk ratio (1.0 means no compression benefit)
    pub fn compression_ratio(&self) -> f64 {
        if self.compressed_size == 0 {
            1.0
        } else {
            self.uncompressed_size as f64 / self.compressed_size as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_write_uncompressed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("snapshot.dat");

        let mut writer = SnapshotWriter::create(&path, SlotRange::new(0, 100), false).unwrap();
        writer.write("key1", "value1").unwrap();
        writer.write("key2", "value2").unwrap();
        let metadata = writer.finalize().unwrap();

        assert_eq!(metadata.entry_count, 2);
        assert_eq!(metadata.slot_range, SlotRange::new(0, 100));
        assert_eq!(metadata.compressed_size, metadata.uncompressed_size);
        assert!(metadata.file_size > HEADER_SIZE as u64);
        assert!(path.exists());
        assert!(!dir.path().join("snapshot.dat.tmp").exists());
    }

    #[test]
    fn test_write_compressed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("snapshot.lz4");

        let mut writer = SnapshotWriter::create(&path, SlotRange::FULL, true).unwrap();
        for i in 0..1000 {
            writer.write(&format!("key{:04}", i), "the same value every time").unwrap();
        }
        let metadata = writer.finalize().unwrap();

        assert_eq!(metadata.entry_count, 1000);
        assert!(metadata.compression_ratio() > 1.0);
    }

    #[test]
    fn test_abandoned_writer_leaves_destination_alone() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("snapshot.dat");
        fs::write(&path, b"previous").unwrap();

        let mut writer = SnapshotWriter::create(&path, SlotRange::FULL, false).unwrap();
        writer.write("k", "v").unwrap();
        drop(writer);

        assert_eq!(fs::read(&path).unwrap(), b"previous");
    }
}
