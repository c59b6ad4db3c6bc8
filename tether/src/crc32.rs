//! CRC32 checksum utilities.

pub use crc32fast::Hasher;

/// Calculate the CRC32 checksum of a byte slice.
#[inline]
pub fn crc32(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Continue a CRC32 from a previous checksum.
#[inline]
pub fn crc32_incremental(initial_crc: u32, data: &[u8]) -> u32 {
    let mut hasher = Hasher::new_with_initial(initial_crc);
    hasher.update(data);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incremental_matches_whole() {
        let data = b"the quick brown fox jumps over the lazy dog";
        let whole = crc32(data);
        let split = crc32_incremental(crc32(&data[..20]), &data[20..]);
        assert_eq!(whole, split);
    }

    #[test]
    fn checksum_changes_with_input() {
        assert_ne!(crc32(b"abc"), crc32(b"abd"));
    }
}
