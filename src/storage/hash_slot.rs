//! Key to hash slot mapping.

use crc::{Crc, CRC_16_XMODEM};

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// Hash slot of a key: CRC16/XMODEM over its bytes.
pub fn hash_slot(key: &str) -> u32 {
    u32::from(CRC16.checksum(key.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_checksums() {
        assert_eq!(hash_slot("123456789"), 0x31C3);
        assert_eq!(hash_slot(""), 0);
    }

    #[test]
    fn test_slots_cover_both_halves() {
        let (low, high): (Vec<u32>, Vec<u32>) = (0..1000)
            .map(|i| hash_slot(&i.to_string()))
            .partition(|slot| *slot < 32768);
        assert!(!low.is_empty());
        assert!(!high.is_empty());
    }
}
