//! State checksums for desync detection.
//!
//! After a frame is finalized (its remote input confirmed and, if needed, resimulated), the
//! authoritative side computes a checksum over the slot's serialized state and sends it to
//! the peer, which compares it against its own. Both sides must therefore hash the exact
//! same bytes with the exact same algorithm.
//!
//! The algorithm is CRC-32 as used by zlib, PNG and Ethernet: reflected polynomial
//! `0xEDB88320`, initial value `0xFFFFFFFF`, final XOR `0xFFFFFFFF`. It is cheap enough to
//! run over a multi-kilobyte emulator state every frame and detects any single-byte
//! corruption.
//!
//! ```
//! use delta_rollback::checksum::crc32;
//!
//! assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
//! ```
//!
//! For states that arrive in pieces, [`Crc32`] computes the same value incrementally:
//!
//! ```
//! use delta_rollback::checksum::{crc32, Crc32};
//!
//! let mut crc = Crc32::new();
//! crc.update(b"1234");
//! crc.update(b"56789");
//! assert_eq!(crc.finalize(), crc32(b"123456789"));
//! ```

const POLYNOMIAL: u32 = 0xEDB8_8320;

const TABLE: [u32; 256] = build_table();

const fn build_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut n = 0;
    while n < 256 {
        let mut c = n as u32;
        let mut k = 0;
        while k < 8 {
            c = if c & 1 != 0 {
                POLYNOMIAL ^ (c >> 1)
            } else {
                c >> 1
            };
            k += 1;
        }
        table[n] = c;
        n += 1;
    }
    table
}

/// Computes the CRC-32 of a byte slice.
///
/// # Example
///
/// ```
/// use delta_rollback::checksum::crc32;
///
/// let state = [0u8; 64];
/// assert_eq!(crc32(&state), crc32(&state));
/// ```
#[inline]
#[must_use]
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc = Crc32::new();
    crc.update(data);
    crc.finalize()
}

/// Incremental CRC-32 state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Crc32 {
    value: u32,
}

impl Crc32 {
    /// Starts a new checksum.
    #[must_use]
    pub const fn new() -> Self {
        Self { value: 0xFFFF_FFFF }
    }

    /// Feeds more bytes into the checksum.
    pub fn update(&mut self, data: &[u8]) {
        let mut value = self.value;
        for &byte in data {
            value = TABLE[((value ^ u32::from(byte)) & 0xFF) as usize] ^ (value >> 8);
        }
        self.value = value;
    }

    /// Returns the checksum of everything fed so far.
    #[must_use]
    pub const fn finalize(self) -> u32 {
        self.value ^ 0xFFFF_FFFF
    }
}

impl Default for Crc32 {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn crc32_check_value() {
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn crc32_empty_is_zero() {
        assert_eq!(crc32(&[]), 0);
    }

    #[test]
    fn crc32_known_values() {
        assert_eq!(crc32(b"a"), 0xE8B7_BE43);
        assert_eq!(
            crc32(b"The quick brown fox jumps over the lazy dog"),
            0x414F_A339
        );
    }

    #[test]
    fn table_matches_reference_entries() {
        assert_eq!(TABLE[0], 0);
        assert_eq!(TABLE[1], 0x7707_3096);
        assert_eq!(TABLE[255], 0x2D02_EF8D);
    }

    #[test]
    fn single_byte_change_is_detected() {
        let mut state = vec![0u8; 4096];
        let before = crc32(&state);
        state[2048] = 1;
        assert_ne!(before, crc32(&state));
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Property: splitting the input anywhere yields the same checksum
        #[test]
        fn prop_incremental_matches_one_shot(
            data in proptest::collection::vec(any::<u8>(), 0..512),
            split in any::<prop::sample::Index>(),
        ) {
            let at = if data.is_empty() { 0 } else { split.index(data.len()) };
            let (head, tail) = data.split_at(at);

            let mut crc = Crc32::new();
            crc.update(head);
            crc.update(tail);

            prop_assert_eq!(crc.finalize(), crc32(&data));
        }

        /// Property: flipping any bit changes the checksum
        #[test]
        fn prop_bit_flip_detected(
            data in proptest::collection::vec(any::<u8>(), 1..256),
            byte in any::<prop::sample::Index>(),
            bit in 0u8..8,
        ) {
            let mut flipped = data.clone();
            let i = byte.index(flipped.len());
            flipped[i] ^= 1 << bit;
            prop_assert_ne!(crc32(&data), crc32(&flipped));
        }
    }
}
