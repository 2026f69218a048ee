//! On-board SPI magnetic encoder (AS5047P, MA732-compatible framing).
//!
//! Sampled synchronously inside the control ISR: a single 16-bit
//! transfer at 10 MHz costs ~2 µs, well inside the cycle budget, and
//! gives a fresh angle every PWM period with no cross-context handoff.

use embassy_stm32::gpio::Output;
use embassy_stm32::mode::Blocking;
use embassy_stm32::spi::Spi;

use crate::encoder::{commit, SourceCounters, SourceSample};

/// ANGLECOM read command: address 0x3FFF, read bit, even parity.
const READ_ANGLE: u16 = 0xFFFF;

/// Consecutive all-ones frames before the sensor is presumed
/// disconnected (MISO floating high).
const DISCONNECT_LIMIT: u8 = 8;

/// Validate one AS5047 frame: even parity over the low 15 bits must
/// match bit 15, and the error flag (bit 14) must be clear. Returns
/// the 14-bit angle left-aligned to the 16-bit source convention.
pub fn parse_frame(frame: u16) -> Option<u16> {
    let parity = ((frame & 0x7FFF).count_ones() & 1) as u16;
    if parity != (frame >> 15) {
        return None;
    }
    if frame & 0x4000 != 0 {
        return None;
    }
    Some((frame & 0x3FFF) << 2)
}

pub struct As5047 {
    spi: Spi<'static, Blocking>,
    cs: Output<'static>,
    disconnect_count: u8,
    pub counters: SourceCounters,
}

impl As5047 {
    pub fn new(spi: Spi<'static, Blocking>, cs: Output<'static>) -> Self {
        Self {
            spi,
            cs,
            disconnect_count: 0,
            counters: Default::default(),
        }
    }

    /// One transfer per control cycle; never blocks longer than the
    /// SPI frame itself.
    pub fn isr_update(&mut self, sample: &mut SourceSample) {
        let mut rx = [READ_ANGLE];
        self.cs.set_low();
        let result = self.spi.blocking_transfer_in_place(&mut rx);
        self.cs.set_high();

        if result.is_err() {
            self.counters.timeouts = self.counters.timeouts.wrapping_add(1);
            self.mark_bad(sample);
            return;
        }

        let frame = rx[0];
        if frame == 0xFFFF {
            // Floating MISO reads all-ones; a few in a row means the
            // sensor is gone.
            self.disconnect_count = self.disconnect_count.saturating_add(1);
            if self.disconnect_count >= DISCONNECT_LIMIT {
                sample.active = false;
            }
            return;
        }
        self.disconnect_count = 0;

        match parse_frame(frame) {
            Some(value) => commit(sample, value as u32),
            None => {
                self.counters.checksum_errors = self.counters.checksum_errors.wrapping_add(1);
            }
        }
    }

    fn mark_bad(&mut self, sample: &mut SourceSample) {
        self.disconnect_count = self.disconnect_count.saturating_add(1);
        if self.disconnect_count >= DISCONNECT_LIMIT {
            sample.active = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_parity(angle: u16) -> u16 {
        let body = angle & 0x3FFF;
        let parity = (body.count_ones() & 1) as u16;
        (parity << 15) | body
    }

    #[test]
    fn test_parse_good_frame() {
        let frame = with_parity(0x1234);
        assert_eq!(parse_frame(frame), Some(0x1234 << 2));
    }

    #[test]
    fn test_parse_bad_parity() {
        let frame = with_parity(0x1234) ^ 0x0001;
        assert_eq!(parse_frame(frame), None);
    }

    #[test]
    fn test_parse_error_flag() {
        // Error bit set, parity recomputed to be consistent.
        let body = 0x4000u16 | 0x0123;
        let parity = ((body & 0x7FFF).count_ones() & 1) as u16;
        let frame = (parity << 15) | body;
        assert_eq!(parse_frame(frame), None);
    }

    #[test]
    fn test_left_alignment() {
        let frame = with_parity(0x3FFF);
        assert_eq!(parse_frame(frame), Some(0xFFFC));
    }
}
