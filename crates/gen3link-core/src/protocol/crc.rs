//! iButton/Maxim 8-bit CRC
//!
//! The same algorithm as avr-libc's `_crc_ibutton_update`, which the
//! controller firmware uses to check every packet. It must stay
//! bit-for-bit identical to the firmware.

/// Reflected polynomial applied when the shifted-out bit is set
const POLY: u8 = 0x8C;

/// Running CRC-8 accumulator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Crc8 {
    crc: u8,
}

impl Crc8 {
    /// Create a zeroed accumulator
    pub fn new() -> Self {
        Self { crc: 0 }
    }

    /// Fold one byte into the CRC
    pub fn update(&mut self, byte: u8) {
        let mut crc = self.crc ^ byte;
        for _ in 0..8 {
            if crc & 0x01 != 0 {
                crc = (crc >> 1) ^ POLY;
            } else {
                crc >>= 1;
            }
        }
        self.crc = crc;
    }

    /// Fold a run of bytes into the CRC
    pub fn update_slice(&mut self, data: &[u8]) {
        for &byte in data {
            self.update(byte);
        }
    }

    /// Current CRC value
    pub fn value(&self) -> u8 {
        self.crc
    }

    /// Zero the accumulator
    pub fn reset(&mut self) {
        self.crc = 0;
    }
}

/// CRC-8 of a complete buffer
pub fn crc8(data: &[u8]) -> u8 {
    let mut crc = Crc8::new();
    crc.update_slice(data);
    crc.value()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_empty_is_zero() {
        assert_eq!(crc8(&[]), 0);
    }

    #[test]
    fn test_known_vectors() {
        // Dallas/Maxim CRC-8 check value
        assert_eq!(crc8(b"123456789"), 0xA1);
        assert_eq!(crc8(&[0x01]), 0x5E);
        // A byte followed by its own CRC always folds to zero
        assert_eq!(crc8(&[0x01, 0x5E]), 0x00);
    }

    #[test]
    fn test_reset() {
        let mut crc = Crc8::new();
        crc.update_slice(&[1, 2, 3]);
        assert_ne!(crc.value(), 0);
        crc.reset();
        assert_eq!(crc.value(), 0);
    }

    proptest! {
        #[test]
        fn prop_incremental_matches_one_shot(data in prop::collection::vec(any::<u8>(), 0..512)) {
            let mut crc = Crc8::new();
            for &b in &data {
                crc.update(b);
            }
            prop_assert_eq!(crc.value(), crc8(&data));
        }

        #[test]
        fn prop_split_anywhere(data in prop::collection::vec(any::<u8>(), 1..256), split in any::<prop::sample::Index>()) {
            let at = split.index(data.len());
            let mut crc = Crc8::new();
            crc.update_slice(&data[..at]);
            crc.update_slice(&data[at..]);
            prop_assert_eq!(crc.value(), crc8(&data));
        }
    }
}
