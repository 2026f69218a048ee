//! Calibration sequencers.
//!
//! Each calibration mode is a staged state machine stepped once per
//! control cycle; the sequencer returns the open-loop drive for that
//! cycle and reports completion or failure, at which point the mode
//! machine exits to stopped (or faults).

use crate::errors::FaultCode;
use crate::foc::wrap_tau;
use core::f32::consts::TAU;

pub const COMMUTATION_TABLE_LEN: usize = 64;

/// Phase-current offset calibration: hold all phases at 50 % duty and
/// average the current readings.
pub struct CurrentOffsetCalibration {
    state: OffsetCalState,
    settle_cycles: u32,
    sample_target: u32,
    samples: u32,
    sum: [f32; 3],
    pub offsets: [f32; 3],
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum OffsetCalState {
    Settle,
    Accumulate,
    Completed,
}

impl CurrentOffsetCalibration {
    pub fn new(settle_cycles: u32, sample_target: u32) -> Self {
        Self {
            state: OffsetCalState::Settle,
            settle_cycles,
            sample_target,
            samples: 0,
            sum: [0.0; 3],
            offsets: [0.0; 3],
        }
    }

    pub fn start(&mut self) {
        self.state = OffsetCalState::Settle;
        self.samples = 0;
        self.sum = [0.0; 3];
    }

    /// Step with raw (uncorrected) phase currents. Returns true when
    /// the offsets are ready.
    pub fn update(&mut self, raw: (f32, f32, f32)) -> bool {
        match self.state {
            OffsetCalState::Settle => {
                if self.settle_cycles == 0 {
                    self.state = OffsetCalState::Accumulate;
                } else {
                    self.settle_cycles -= 1;
                }
                false
            }
            OffsetCalState::Accumulate => {
                self.sum[0] += raw.0;
                self.sum[1] += raw.1;
                self.sum[2] += raw.2;
                self.samples += 1;
                if self.samples >= self.sample_target {
                    let n = self.samples as f32;
                    self.offsets = [self.sum[0] / n, self.sum[1] / n, self.sum[2] / n];
                    self.state = OffsetCalState::Completed;
                }
                self.state == OffsetCalState::Completed
            }
            OffsetCalState::Completed => true,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.state == OffsetCalState::Completed
    }
}

/// Result of an encoder calibration sweep.
#[derive(Debug, Clone, Copy)]
pub struct EncoderCalResult {
    /// Commutation offsets, one per electrical-angle bin.
    pub table: [f32; COMMUTATION_TABLE_LEN],
    pub direction_inversed: bool,
    pub success: bool,
}

impl Default for EncoderCalResult {
    fn default() -> Self {
        Self {
            table: [0.0; COMMUTATION_TABLE_LEN],
            direction_inversed: false,
            success: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum EncoderCalState {
    Init,
    FindDirection,
    SweepForward,
    ReturnToStart,
    Completed,
}

/// Open-loop encoder calibration.
///
/// Drives a slow voltage-mode rotation through one full mechanical
/// revolution while recording the difference between the driven
/// electrical angle and the sensed one, binned into the commutation
/// table.
pub struct EncoderCalibration {
    state: EncoderCalState,
    pole_pairs: u8,
    voltage: f32,
    /// Driven electrical angle (rad, unwrapped).
    drive_angle: f32,
    /// rad of electrical angle advanced per cycle.
    step: f32,
    start_sensor_angle: f32,
    bin_sum: [f32; COMMUTATION_TABLE_LEN],
    bin_count: [u16; COMMUTATION_TABLE_LEN],
    result: EncoderCalResult,
}

impl EncoderCalibration {
    /// `sweep_rate_rad_s` is the electrical-angle rate of the sweep.
    pub fn new(pole_pairs: u8, voltage: f32, sweep_rate_rad_s: f32, rate_hz: u32) -> Self {
        Self {
            state: EncoderCalState::Init,
            pole_pairs,
            voltage,
            drive_angle: 0.0,
            step: sweep_rate_rad_s / rate_hz as f32,
            start_sensor_angle: 0.0,
            bin_sum: [0.0; COMMUTATION_TABLE_LEN],
            bin_count: [0; COMMUTATION_TABLE_LEN],
            result: Default::default(),
        }
    }

    pub fn start(&mut self) {
        self.state = EncoderCalState::Init;
        self.drive_angle = 0.0;
        self.bin_sum = [0.0; COMMUTATION_TABLE_LEN];
        self.bin_count = [0; COMMUTATION_TABLE_LEN];
        self.result = Default::default();
    }

    pub fn result(&self) -> &EncoderCalResult {
        &self.result
    }

    pub fn is_completed(&self) -> bool {
        self.state == EncoderCalState::Completed
    }

    /// Step the sweep. `sensor_electrical` is the sensed rotor angle
    /// scaled to electrical radians (mechanical * pole_pairs,
    /// unwrapped across the sweep).
    ///
    /// Returns (drive_theta, voltage) for the FOC stage.
    pub fn update(&mut self, sensor_electrical: f32) -> Result<(f32, f32), FaultCode> {
        let total_sweep = self.pole_pairs as f32 * TAU;
        match self.state {
            EncoderCalState::Init => {
                self.start_sensor_angle = sensor_electrical;
                self.state = EncoderCalState::FindDirection;
                Ok((0.0, self.voltage))
            }
            EncoderCalState::FindDirection => {
                self.drive_angle += self.step;
                if self.drive_angle >= TAU {
                    let moved = sensor_electrical - self.start_sensor_angle;
                    if moved.abs() < 0.05 * TAU {
                        self.state = EncoderCalState::Completed;
                        return Err(FaultCode::CalibrationFault);
                    }
                    self.result.direction_inversed = moved < 0.0;
                    self.state = EncoderCalState::SweepForward;
                }
                Ok((wrap_tau(self.drive_angle), self.voltage))
            }
            EncoderCalState::SweepForward => {
                self.drive_angle += self.step;

                let sensed = if self.result.direction_inversed {
                    -sensor_electrical
                } else {
                    sensor_electrical
                };
                // Bin on the sensed angle: at lookup time the consumer
                // only has the sensor reading.
                let bin = ((wrap_tau(sensed) / TAU) * COMMUTATION_TABLE_LEN as f32) as usize
                    % COMMUTATION_TABLE_LEN;
                // Offset between where we drove and where the sensor
                // says we are, folded to [-π, π).
                let mut offset = (self.drive_angle - sensed) % TAU;
                if offset > TAU / 2.0 {
                    offset -= TAU;
                } else if offset < -TAU / 2.0 {
                    offset += TAU;
                }
                self.bin_sum[bin] += offset;
                self.bin_count[bin] += 1;

                if self.drive_angle >= total_sweep + TAU {
                    for i in 0..COMMUTATION_TABLE_LEN {
                        if self.bin_count[i] == 0 {
                            self.state = EncoderCalState::Completed;
                            return Err(FaultCode::CalibrationFault);
                        }
                        self.result.table[i] = self.bin_sum[i] / self.bin_count[i] as f32;
                    }
                    self.state = EncoderCalState::ReturnToStart;
                }
                Ok((wrap_tau(self.drive_angle), self.voltage))
            }
            EncoderCalState::ReturnToStart => {
                self.drive_angle -= self.step;
                if self.drive_angle <= 0.0 {
                    self.result.success = true;
                    self.state = EncoderCalState::Completed;
                    return Ok((0.0, 0.0));
                }
                Ok((wrap_tau(self.drive_angle), self.voltage))
            }
            EncoderCalState::Completed => Ok((0.0, 0.0)),
        }
    }
}

/// Inductance measurement: a square-wave d-axis voltage at a fixed
/// rotor angle; L = V * dt / di per half period.
pub struct InductanceMeasurement {
    voltage: f32,
    half_period_cycles: u32,
    periods_target: u32,
    cycle: u32,
    periods: u32,
    sign: f32,
    last_current: f32,
    delta_sum: f32,
    pub inductance_h: f32,
    completed: bool,
}

impl InductanceMeasurement {
    pub fn new(voltage: f32, half_period_cycles: u32, periods_target: u32) -> Self {
        Self {
            voltage,
            half_period_cycles,
            periods_target,
            cycle: 0,
            periods: 0,
            sign: 1.0,
            last_current: 0.0,
            delta_sum: 0.0,
            inductance_h: 0.0,
            completed: false,
        }
    }

    /// Step with the measured d-axis current; returns the d voltage to
    /// apply, or None when done.
    pub fn update(&mut self, i_d: f32, dt: f32) -> Option<f32> {
        if self.completed {
            return None;
        }
        self.cycle += 1;
        if self.cycle >= self.half_period_cycles {
            self.cycle = 0;
            // Skip the very first half period; it starts from rest.
            if self.periods > 0 || self.sign < 0.0 {
                self.delta_sum += (i_d - self.last_current).abs();
            }
            self.last_current = i_d;
            self.sign = -self.sign;
            if self.sign > 0.0 {
                self.periods += 1;
                if self.periods >= self.periods_target {
                    let half_period_s = self.half_period_cycles as f32 * dt;
                    let avg_delta = self.delta_sum / (2.0 * self.periods as f32);
                    if avg_delta > 0.0 {
                        self.inductance_h = self.voltage * half_period_s / avg_delta;
                    }
                    self.completed = true;
                    return None;
                }
            }
        }
        Some(self.sign * self.voltage)
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }
}
