//! Hall-effect commutation sensors.
//!
//! Three digital inputs produce a six-state Gray sequence per
//! electrical revolution. Any of the two invalid codes (000, 111)
//! increments the error counter and holds the last count.

use crate::encoder::{commit, SourceCounters, SourceSample};

/// Map a 3-bit hall code to its position in the electrical cycle, or
/// 0xFF for the two invalid codes.
const HALL_ORDER: [u8; 8] = [0xFF, 0, 2, 1, 4, 5, 3, 0xFF];

pub struct HallSource {
    /// XOR mask applied to the raw pins (per-phase polarity).
    polarity: u8,
    cpr: u32,
    count: u32,
    last_position: u8,
    initialized: bool,
    pub counters: SourceCounters,
}

impl HallSource {
    /// `cpr` is the total counts per revolution of the attached body:
    /// 6 * pole_pairs for a rotor-mounted set.
    pub fn new(polarity: u8, cpr: u32) -> Self {
        Self {
            polarity: polarity & 0x07,
            cpr,
            count: 0,
            last_position: 0,
            initialized: false,
            counters: Default::default(),
        }
    }

    /// Feed one (h1, h2, h3) pin snapshot.
    pub fn update(&mut self, pins: u8, sample: &mut SourceSample) {
        let code = (pins ^ self.polarity) & 0x07;
        let position = HALL_ORDER[code as usize];
        if position == 0xFF {
            self.counters.checksum_errors = self.counters.checksum_errors.wrapping_add(1);
            return;
        }

        if !self.initialized {
            self.last_position = position;
            self.initialized = true;
            self.count = position as u32 % self.cpr;
            commit(sample, self.count);
            return;
        }

        // Steps around the 6-cycle: -2..3 folded from the raw
        // difference; |2| or 3 means we skipped states.
        let mut step = position as i32 - self.last_position as i32;
        if step > 3 {
            step -= 6;
        } else if step < -2 {
            step += 6;
        }
        self.last_position = position;

        match step {
            0 => {}
            -1 | 1 => {
                let cpr = self.cpr as i64;
                self.count = ((self.count as i64 + step as i64).rem_euclid(cpr)) as u32;
                commit(sample, self.count);
            }
            _ => {
                // Skipped at least one state; keep the last count but
                // record the glitch.
                self.counters.checksum_errors = self.counters.checksum_errors.wrapping_add(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The canonical forward sequence of hall codes.
    const FORWARD: [u8; 6] = [0b001, 0b011, 0b010, 0b110, 0b100, 0b101];

    #[test]
    fn test_order_table_is_cyclic() {
        for (i, code) in FORWARD.iter().enumerate() {
            assert_eq!(HALL_ORDER[*code as usize] as usize, i);
        }
    }

    #[test]
    fn test_forward_counts_up() {
        let mut hall = HallSource::new(0, 42);
        let mut sample = SourceSample::default();
        hall.update(FORWARD[0], &mut sample);
        let start = sample.value;
        for cycle in 0..3 {
            for &code in FORWARD.iter().skip(if cycle == 0 { 1 } else { 0 }) {
                hall.update(code, &mut sample);
            }
        }
        assert_eq!(sample.value, (start + 17) % 42);
        assert_eq!(hall.counters.checksum_errors, 0);
    }

    #[test]
    fn test_invalid_code_holds_count() {
        let mut hall = HallSource::new(0, 42);
        let mut sample = SourceSample::default();
        hall.update(FORWARD[0], &mut sample);
        let value = sample.value;
        let nonce = sample.nonce;
        hall.update(0b000, &mut sample);
        hall.update(0b111, &mut sample);
        assert_eq!(sample.value, value);
        assert_eq!(sample.nonce, nonce);
        assert_eq!(hall.counters.checksum_errors, 2);
    }

    #[test]
    fn test_skipped_state_counts_error() {
        let mut hall = HallSource::new(0, 42);
        let mut sample = SourceSample::default();
        hall.update(FORWARD[0], &mut sample);
        // Jump two states ahead.
        hall.update(FORWARD[2], &mut sample);
        assert_eq!(hall.counters.checksum_errors, 1);
    }

    #[test]
    fn test_polarity_mask() {
        let mut plain = HallSource::new(0, 42);
        let mut inverted = HallSource::new(0b111, 42);
        let mut sample_a = SourceSample::default();
        let mut sample_b = SourceSample::default();
        // With all three phases inverted, the complement code lands on
        // the same position.
        plain.update(0b001, &mut sample_a);
        inverted.update(0b110, &mut sample_b);
        assert_eq!(sample_a.value, sample_b.value);
    }

    #[test]
    fn test_reverse_counts_down() {
        let mut hall = HallSource::new(0, 42);
        let mut sample = SourceSample::default();
        hall.update(FORWARD[1], &mut sample);
        hall.update(FORWARD[0], &mut sample);
        assert_eq!(sample.value, 0);
        hall.update(FORWARD[5], &mut sample);
        assert_eq!(sample.value, 41);
    }
}
