//! Current, voltage, and temperature sampling.
//!
//! The PWM timer triggers injected ADC conversions at the center of
//! the low-side window; the ISR collects the raw counts and this
//! module turns them into calibrated engineering units. Phase currents
//! are delivered unfiltered to the current loop (latency matters); a
//! filtered copy plus the slow channels feed telemetry and protection.

/// Raw injected-conversion results for one cycle.
#[derive(Debug, Clone, Copy, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RawSamples {
    pub i_a: u16,
    pub i_b: u16,
    pub i_c: u16,
    pub vsense: u16,
    pub tsense: u16,
    pub msense: u16,
}

/// Calibrated per-cycle measurements.
#[derive(Debug, Clone, Copy, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Samples {
    /// Unfiltered phase currents (A), offset-corrected.
    pub i_abc: (f32, f32, f32),
    /// Filtered copy for telemetry and protection.
    pub i_abc_filtered: (f32, f32, f32),
    pub v_bus: f32,
    pub fet_temp_c: f32,
    /// NaN when no motor thermistor is fitted.
    pub motor_temp_c: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingConfig {
    /// Amps per ADC count through the shunt + current-sense amplifier.
    pub i_scale_a: f32,
    /// Bus volts per ADC count through the divider.
    pub vsense_adc_scale: f32,
    /// Single-pole IIR coefficient for the slow channels, [0, 1].
    pub filter_alpha: f32,
    pub motor_thermistor_fitted: bool,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            // 0.5 mΩ shunt, gain 20, 12-bit at 3.3 V full scale.
            i_scale_a: 0.08057,
            vsense_adc_scale: 0.00884,
            filter_alpha: 0.01,
            motor_thermistor_fitted: false,
        }
    }
}

/// NTC linearization: temperature (°C) at each of 17 evenly spaced
/// ADC counts (0, 256, ... 4096) for the 47 kΩ divider.
const THERMISTOR_TABLE: [f32; 17] = [
    -74.17, -11.36, 1.53, 9.97, 16.51, 22.05, 27.01, 31.65, 36.13, 40.61, 45.24, 50.20, 55.70,
    62.09, 69.96, 80.73, 100.0,
];

/// Interpolate the thermistor table at a raw ADC count.
pub fn thermistor_temp_c(raw: u16) -> f32 {
    let scaled = raw as f32 / 256.0;
    let index = (scaled as usize).min(THERMISTOR_TABLE.len() - 2);
    let frac = scaled - index as f32;
    THERMISTOR_TABLE[index] * (1.0 - frac) + THERMISTOR_TABLE[index + 1] * frac
}

pub struct CurrentSampler {
    config: SamplingConfig,
    /// Per-phase current offsets (A), from the current calibration.
    offsets: [f32; 3],
    filtered: Samples,
    initialized: bool,
}

impl CurrentSampler {
    pub fn new(config: SamplingConfig, offsets: [f32; 3]) -> Self {
        Self {
            config,
            offsets,
            filtered: Default::default(),
            initialized: false,
        }
    }

    /// Convert one cycle of raw counts. The unfiltered currents are
    /// what FOC consumes; everything else is filtered.
    pub fn update(&mut self, raw: &RawSamples) -> Samples {
        let i_a = raw.i_a as f32 * self.config.i_scale_a - self.offsets[0];
        let i_b = raw.i_b as f32 * self.config.i_scale_a - self.offsets[1];
        let i_c = raw.i_c as f32 * self.config.i_scale_a - self.offsets[2];

        let v_bus = raw.vsense as f32 * self.config.vsense_adc_scale;
        let fet_temp = thermistor_temp_c(raw.tsense);
        let motor_temp = if self.config.motor_thermistor_fitted {
            thermistor_temp_c(raw.msense)
        } else {
            f32::NAN
        };

        if !self.initialized {
            // Seed the filters with the first reading so startup does
            // not report a slow voltage ramp from zero.
            self.filtered.v_bus = v_bus;
            self.filtered.fet_temp_c = fet_temp;
            self.filtered.motor_temp_c = motor_temp;
            self.filtered.i_abc_filtered = (i_a, i_b, i_c);
            self.initialized = true;
        } else {
            let alpha = self.config.filter_alpha;
            self.filtered.v_bus += alpha * (v_bus - self.filtered.v_bus);
            self.filtered.fet_temp_c += alpha * (fet_temp - self.filtered.fet_temp_c);
            if self.config.motor_thermistor_fitted {
                self.filtered.motor_temp_c += alpha * (motor_temp - self.filtered.motor_temp_c);
            }
            self.filtered.i_abc_filtered.0 += alpha * (i_a - self.filtered.i_abc_filtered.0);
            self.filtered.i_abc_filtered.1 += alpha * (i_b - self.filtered.i_abc_filtered.1);
            self.filtered.i_abc_filtered.2 += alpha * (i_c - self.filtered.i_abc_filtered.2);
        }

        Samples {
            i_abc: (i_a, i_b, i_c),
            i_abc_filtered: self.filtered.i_abc_filtered,
            v_bus: self.filtered.v_bus,
            fet_temp_c: self.filtered.fet_temp_c,
            motor_temp_c: self.filtered.motor_temp_c,
        }
    }

    /// Raw currents without offset correction, for the calibration
    /// averager.
    pub fn raw_currents_a(&self, raw: &RawSamples) -> (f32, f32, f32) {
        (
            raw.i_a as f32 * self.config.i_scale_a,
            raw.i_b as f32 * self.config.i_scale_a,
            raw.i_c as f32 * self.config.i_scale_a,
        )
    }

    pub fn set_offsets(&mut self, offsets: [f32; 3]) {
        self.offsets = offsets;
    }

    pub fn offsets(&self) -> &[f32; 3] {
        &self.offsets
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offsets_subtracted() {
        let config = SamplingConfig {
            i_scale_a: 0.01,
            ..Default::default()
        };
        let mut sampler = CurrentSampler::new(config, [1.0, 2.0, 3.0]);
        let samples = sampler.update(&RawSamples {
            i_a: 100,
            i_b: 200,
            i_c: 300,
            ..Default::default()
        });
        assert!((samples.i_abc.0 - 0.0).abs() < 1e-6);
        assert!((samples.i_abc.1 - 0.0).abs() < 1e-6);
        assert!((samples.i_abc.2 - 0.0).abs() < 1e-6);
    }

    #[test]
    fn test_filter_seeds_then_tracks() {
        let config = SamplingConfig {
            vsense_adc_scale: 0.01,
            filter_alpha: 0.5,
            ..Default::default()
        };
        let mut sampler = CurrentSampler::new(config, [0.0; 3]);
        let first = sampler.update(&RawSamples {
            vsense: 2400,
            ..Default::default()
        });
        // First sample seeds the filter directly.
        assert!((first.v_bus - 24.0).abs() < 1e-3);

        let second = sampler.update(&RawSamples {
            vsense: 2600,
            ..Default::default()
        });
        assert!((second.v_bus - 25.0).abs() < 1e-3);
    }

    #[test]
    fn test_phase_currents_not_filtered() {
        let config = SamplingConfig {
            i_scale_a: 0.01,
            filter_alpha: 0.001,
            ..Default::default()
        };
        let mut sampler = CurrentSampler::new(config, [0.0; 3]);
        sampler.update(&RawSamples::default());
        let samples = sampler.update(&RawSamples {
            i_a: 1000,
            ..Default::default()
        });
        // The FOC copy jumps instantly; the filtered copy lags.
        assert!((samples.i_abc.0 - 10.0).abs() < 1e-3);
        assert!(samples.i_abc_filtered.0 < 1.0);
    }

    #[test]
    fn test_thermistor_monotonic() {
        let mut last = thermistor_temp_c(0);
        for raw in (256..=4096u16).step_by(64) {
            let temp = thermistor_temp_c(raw);
            assert!(temp >= last, "non-monotonic at {}", raw);
            last = temp;
        }
    }

    #[test]
    fn test_thermistor_interpolates() {
        let mid = thermistor_temp_c(128);
        assert!(mid > THERMISTOR_TABLE[0] && mid < THERMISTOR_TABLE[1]);
    }

    #[test]
    fn test_motor_temp_nan_when_not_fitted() {
        let mut sampler = CurrentSampler::new(SamplingConfig::default(), [0.0; 3]);
        let samples = sampler.update(&RawSamples {
            msense: 2000,
            ..Default::default()
        });
        assert!(samples.motor_temp_c.is_nan());
    }
}
