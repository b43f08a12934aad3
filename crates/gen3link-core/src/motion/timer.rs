//! Step timer quantization
//!
//! The stage firmware times steps with a 16-bit counter behind a
//! selectable clock prescaler. A delay in clock ticks is expressed as the
//! smallest prescaler band whose range covers it, plus a counter value.

use serde::{Deserialize, Serialize};

/// Controller clock frequency
pub const CLOCK_HZ: u64 = 16_000_000;

/// Clock ticks per minute, the unit conversion for mm/min feedrates
pub const TICKS_PER_MINUTE: u64 = CLOCK_HZ * 60;

/// Prescaler divisor of each band, in band order
pub const BAND_FACTORS: [u32; 5] = [1, 8, 64, 256, 1024];

/// Largest counter value
pub const MAX_COUNTER: u16 = u16::MAX;

/// Divisor of a band index. Out-of-range indices use the largest band.
pub fn band_factor(band: u8) -> u32 {
    BAND_FACTORS[(band as usize).min(BAND_FACTORS.len() - 1)]
}

/// Prescaler band and counter for one step delay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TimerSetting {
    /// Zero-based index into [`BAND_FACTORS`]
    pub band: u8,
    /// Counter value within the band
    pub counter: u16,
}

impl TimerSetting {
    /// Clock ticks this setting actually produces
    pub fn ticks(&self) -> u64 {
        u64::from(self.counter) * u64::from(band_factor(self.band))
    }
}

/// Quantize a delay of `ticks` clock ticks.
///
/// Delays beyond the slowest band saturate at its largest counter; the
/// machine then steps faster than requested.
pub fn quantize(ticks: u64) -> TimerSetting {
    for (band, &factor) in BAND_FACTORS.iter().enumerate() {
        if u64::from(MAX_COUNTER) * u64::from(factor) >= ticks {
            return TimerSetting {
                band: band as u8,
                counter: (ticks / u64::from(factor)) as u16,
            };
        }
    }
    TimerSetting {
        band: (BAND_FACTORS.len() - 1) as u8,
        counter: MAX_COUNTER,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn setting(band: u8, counter: u16) -> TimerSetting {
        TimerSetting { band, counter }
    }

    #[test]
    fn test_band_boundaries() {
        assert_eq!(quantize(0), setting(0, 0));
        assert_eq!(quantize(1), setting(0, 1));
        assert_eq!(quantize(65535), setting(0, 65535));
        assert_eq!(quantize(65536), setting(1, 8192));
        assert_eq!(quantize(65535 * 8), setting(1, 65535));
        assert_eq!(quantize(65535 * 8 + 1), setting(2, 8191));
        assert_eq!(quantize(65535 * 1024), setting(4, 65535));
    }

    #[test]
    fn test_saturates_past_last_band() {
        assert_eq!(quantize(65535 * 1024 + 1), setting(4, 65535));
        assert_eq!(quantize(u64::MAX), setting(4, 65535));
    }

    #[test]
    fn test_band_factor_clamps() {
        assert_eq!(band_factor(0), 1);
        assert_eq!(band_factor(4), 1024);
        assert_eq!(band_factor(9), 1024);
    }

    proptest! {
        #[test]
        fn quantized_delay_never_exceeds_request(ticks in 0u64..(65535 * 1024)) {
            let t = quantize(ticks);
            let factor = u64::from(band_factor(t.band));
            prop_assert!(t.ticks() <= ticks);
            prop_assert!(ticks - t.ticks() < factor);
        }

        #[test]
        fn smallest_band_is_chosen(ticks in 1u64..(65535 * 1024)) {
            let t = quantize(ticks);
            if t.band > 0 {
                let previous = u64::from(band_factor(t.band - 1));
                prop_assert!(65535 * previous < ticks);
            }
        }
    }
}
