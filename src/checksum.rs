// CRC32 primitives shared across the engine.
//
// Two polynomial configurations are in play: the ISO-HDLC variant for
// package, journal and metadata checksums, and the JAMCRC variant (same
// polynomial, no final xor) stamped into UBI on-media headers.

use crc::{Crc, CRC_32_ISO_HDLC, CRC_32_JAMCRC};

pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);
const UBI_CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_JAMCRC);

/// CRC32 of `data` in one shot.
pub fn crc32(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

/// Continue a CRC32 computation from a previously finalized value.
///
/// The result equals `crc32` of the concatenated inputs, so a running
/// checksum suspends as a plain `u32` and resumes after a restart.
pub fn crc32_extend(prev: u32, data: &[u8]) -> u32 {
    // Undo the final xor, then un-reflect so digest_with_initial lands on
    // the internal state the previous computation ended with.
    let mut digest = CRC32.digest_with_initial((prev ^ u32::MAX).reverse_bits());
    digest.update(data);
    digest.finalize()
}

/// Header CRC used by the UBI layer.
pub fn ubi_crc32(data: &[u8]) -> u32 {
    UBI_CRC32.checksum(data)
}

/// A running CRC32 whose entire state is its current value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Crc32 {
    value: u32,
}

impl Crc32 {
    /// CRC32 of zero bytes; the starting state.
    pub const START: u32 = 0;

    pub fn new() -> Self {
        Crc32 { value: Self::START }
    }

    /// Rebuild from a value previously obtained with [`Crc32::value`].
    pub fn from_value(value: u32) -> Self {
        Crc32 { value }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.value = crc32_extend(self.value, data);
    }

    pub fn value(&self) -> u32 {
        self.value
    }

    pub fn reset(&mut self) {
        self.value = Self::START;
    }
}

impl Default for Crc32 {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn known_vector() {
        assert_eq!(crc32(b"123456789"), 0xcbf4_3926);
    }

    #[test]
    fn empty_input_is_start() {
        assert_eq!(crc32(b""), Crc32::START);
    }

    #[test]
    fn chaining_matches_one_shot() {
        let mut rolling = Crc32::new();
        rolling.update(b"12345");
        let mut resumed = Crc32::from_value(rolling.value());
        resumed.update(b"6789");
        assert_eq!(resumed.value(), crc32(b"123456789"));
    }

    #[test]
    fn chaining_from_scratch_matches() {
        assert_eq!(crc32_extend(Crc32::START, b"123456789"), crc32(b"123456789"));
    }

    #[test]
    fn ubi_variant() {
        assert_eq!(ubi_crc32(b"123456789"), 0x340b_c6d9);
        assert_ne!(ubi_crc32(b"123456789"), crc32(b"123456789"));
    }
}
