//! Analog sin/cos resolver input.
//!
//! Two ADC channels carry quadrature sinusoids centered on a common
//! mode; the angle is their atan2, scaled to the configured CPR.

use libm::atan2f;

use crate::encoder::{commit, SourceSample};

pub struct SinCosSource {
    /// ADC counts at the electrical zero of each channel.
    common_mode: f32,
    cpr: u32,
}

impl SinCosSource {
    pub fn new(common_mode: u16, cpr: u32) -> Self {
        Self {
            common_mode: common_mode as f32,
            cpr,
        }
    }

    /// Convert one pair of ADC readings.
    pub fn update(&mut self, sin_raw: u16, cos_raw: u16, sample: &mut SourceSample) {
        let s = sin_raw as f32 - self.common_mode;
        let c = cos_raw as f32 - self.common_mode;
        let mut fraction = atan2f(s, c) / core::f32::consts::TAU;
        if fraction < 0.0 {
            fraction += 1.0;
        }
        let value = (fraction * self.cpr as f32) as u32 % self.cpr;
        commit(sample, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cardinal_angles() {
        let mut source = SinCosSource::new(2048, 4096);
        let mut sample = SourceSample::default();

        // cos only, positive: angle 0.
        source.update(2048, 3000, &mut sample);
        assert_eq!(sample.value, 0);

        // sin only, positive: quarter turn.
        source.update(3000, 2048, &mut sample);
        assert_eq!(sample.value, 1024);

        // cos negative: half turn.
        source.update(2048, 1000, &mut sample);
        assert_eq!(sample.value, 2048);

        // sin negative: three quarters.
        source.update(1000, 2048, &mut sample);
        assert_eq!(sample.value, 3072);
    }

    #[test]
    fn test_output_in_range() {
        let mut source = SinCosSource::new(2048, 4096);
        let mut sample = SourceSample::default();
        for sin in (0..4096u16).step_by(97) {
            for cos in (0..4096u16).step_by(97) {
                if sin == 2048 && cos == 2048 {
                    continue;
                }
                source.update(sin, cos, &mut sample);
                assert!(sample.value < 4096);
            }
        }
    }
}
