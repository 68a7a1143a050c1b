//! Snapshot reader with streaming LZ4 decompression.

use crate::error::SnapshotError;
use crate::snapshot::format::{SnapshotEntry, SnapshotHeader, CRC32, HEADER_SIZE};
use lz4_flex::frame::FrameDecoder;
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom, Take};
use std::path::Path;

/// Wrapper that calculates CRC32 while reading.
struct CrcReader<R: Read> {
    inner: R,
    digest: crc::Digest<'static, u32>,
}

impl<R: Read> CrcReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            digest: CRC32.digest(),
        }
    }

    fn current_crc(&self) -> u32 {
        self.digest.clone().finalize()
    }
}

impl<R: Read> Read for CrcReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.digest.update(&buf[..n]);
        Ok(n)
    }
}

type DataBlock = CrcReader<Take<BufReader<File>>>;

enum ReaderInner {
    Compressed { decoder: FrameDecoder<DataBlock> },
    Uncompressed { reader: DataBlock },
}

/// Reads entries back from a snapshot file.
pub struct SnapshotReader {
    header: SnapshotHeader,
    inner: ReaderInner,
    stored_crc: u32,
    entries_read: u64,
}

impl SnapshotReader {
    /// Open a snapshot file. Only the header and trailing checksum are read
    /// up front.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SnapshotError> {
        let file = File::open(path.as_ref())?;
        let file_size = file.metadata()?.len();
        if file_size < HEADER_SIZE as u64 + 4 {
            return Err(SnapshotError::InvalidHeader("file too small".into()));
        }
        let mut reader = BufReader::new(file);

        let mut header_buf = [0u8; HEADER_SIZE];
        reader.read_exact(&mut header_buf)?;
        let header = SnapshotHeader::from_bytes(&header_buf)?;

        // Layout: [header][data][crc32]
        reader.seek(SeekFrom::End(-4))?;
        let mut crc_buf = [0u8; 4];
        reader.read_exact(&mut crc_buf)?;
        let stored_crc = u32::from_le_bytes(crc_buf);
        reader.seek(SeekFrom::Start(HEADER_SIZE as u64))?;

        let data_len = file_size - HEADER_SIZE as u64 - 4;
        let block = CrcReader::new(reader.take(data_len));
        let inner = if header.is_compressed() {
            ReaderInner::Compressed {
                decoder: FrameDecoder::new(block),
            }
        } else {
            ReaderInner::Uncompressed { reader: block }
        };

        Ok(Self {
            header,
            inner,
            stored_crc,
            entries_read: 0,
        })
    }

    pub fn header(&self) -> &SnapshotHeader {
        &self.header
    }

    pub fn entries_read(&self) -> u64 {
        self.entries_read
    }

    pub fn has_more(&self) -> bool {
        self.entries_read < self.header.entry_count
    }

    /// Next entry, or `None` after the last one. Verifies the entry CRC.
    pub fn read_entry(&mut self) -> Result<Option<SnapshotEntry>, SnapshotError> {
        if !self.has_more() {
            return Ok(None);
        }

        let mut len_buf = [0u8; 4];
        self.read_exact(&mut len_buf)?;
        let mut body = vec![0u8; u32::from_le_bytes(len_buf) as usize];
        self.read_exact(&mut body)?;

        let mut crc_buf = [0u8; 4];
        self.read_exact(&mut crc_buf)?;
        let stored = u32::from_le_bytes(crc_buf);
        let computed = CRC32.checksum(&body);
        if stored != computed {
            return Err(SnapshotError::EntryCorrupted {
                expected: stored,
                actual: computed,
            });
        }

        let entry: SnapshotEntry =
            bincode::deserialize(&body).map_err(|_| SnapshotError::InvalidUtf8)?;
        self.entries_read += 1;
        Ok(Some(entry))
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), SnapshotError> {
        match &mut self.inner {
            ReaderInner::Compressed { decoder } => decoder.read_exact(buf)?,
            ReaderInner::Uncompressed { reader } => reader.read_exact(buf)?,
        }
        Ok(())
    }

    /// Read all remaining entries, then verify the data block checksum.
    pub fn read_all(&mut self) -> Result<Vec<SnapshotEntry>, SnapshotError> {
        let mut entries = Vec::with_capacity(self.header.entry_count.min(1 << 16) as usize);
        while let Some(entry) = self.read_entry()? {
            entries.push(entry);
        }
        self.verify_checksum()?;
        Ok(entries)
    }

    /// Compare the CRC of the on-disk data block with the stored one.
    pub fn verify_checksum(&mut self) -> Result<(), SnapshotError> {
        let mut drain = [0u8; 4096];
        loop {
            let n = match &mut self.inner {
                ReaderInner::Compressed { decoder } => decoder.read(&mut drain)?,
                ReaderInner::Uncompressed { reader } => reader.read(&mut drain)?,
            };
            if n == 0 {
                break;
            }
        }

        let computed = match &self.inner {
            ReaderInner::Compressed { decoder } => decoder.get_ref().current_crc(),
            ReaderInner::Uncompressed { reader } => reader.current_crc(),
        };
        if computed != self.stored_crc {
            return Err(SnapshotError::ChecksumMismatch {
                expected: self.stored_crc,
                actual: computed,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::writer::SnapshotWriter;
    use crate::types::SlotRange;
    use std::fs;
    use tempfile::tempdir;

    fn create_test_snapshot(path: &Path, compress: bool, count: usize) {
        let mut writer = SnapshotWriter::create(path, SlotRange::new(0, 32767), compress).unwrap();
        for i in 0..count {
            writer.write(&format!("key{}", i), &format!("value{}", i)).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn test_read_uncompressed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("plain.snap");
        create_test_snapshot(&path, false, 10);

        let mut reader = SnapshotReader::open(&path).unwrap();
        assert_eq!(reader.header().entry_count, 10);
        assert_eq!(reader.header().slot_range(), SlotRange::new(0, 32767));

        let entries = reader.read_all().unwrap();
        assert_eq!(entries.len(), 10);
        assert_eq!(entries[3].key, "key3");
        assert_eq!(entries[3].value, "value3");
        assert!(!reader.has_more());
    }

    #[test]
    fn test_read_compressed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("packed.snap");
        create_test_snapshot(&path, true, 500);

        let mut reader = SnapshotReader::open(&path).unwrap();
        assert!(reader.header().is_compressed());
        let entries = reader.read_all().unwrap();
        assert_eq!(entries.len(), 500);
        assert_eq!(entries[499].value, "value499");
    }

    #[test]
    fn test_detects_corruption() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("corrupt.snap");
        create_test_snapshot(&path, false, 5);

        let mut bytes = fs::read(&path).unwrap();
        // first entry: 4 length bytes, then the bincode body
        bytes[HEADER_SIZE + 12] ^= 0xff;
        fs::write(&path, &bytes).unwrap();

        let mut reader = SnapshotReader::open(&path).unwrap();
        assert!(matches!(
            reader.read_entry(),
            Err(SnapshotError::EntryCorrupted { .. })
        ));
    }

    #[test]
    fn test_detects_bad_trailer() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("trailer.snap");
        create_test_snapshot(&path, false, 5);

        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(&path, &bytes).unwrap();

        let mut reader = SnapshotReader::open(&path).unwrap();
        assert!(matches!(
            reader.read_all(),
            Err(SnapshotError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_rejects_truncated_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("short.snap");
        fs::write(&path, b"CHST").unwrap();
        assert!(matches!(
            SnapshotReader::open(&path),
            Err(SnapshotError::InvalidHeader(_))
        ));
    }
}
