//! Motor position subsystem.
//!
//! Fuses up to three angle sources into a rotor electrical angle for
//! commutation and an unwrapped output position for the outer loops.
//! One PLL runs per source; fusion consumes the reference source's
//! filtered output and only uses the others for consistency checking.

use crate::control::COMMUTATION_TABLE_LEN;
use crate::encoder::SourceSample;
use crate::errors::FaultCode;
use crate::foc::wrap_tau;
use core::f32::consts::TAU;

pub const MAX_SOURCES: usize = 3;
pub const OFFSET_TABLE_LEN: usize = 32;

/// What a source's angle is mechanically attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SourceReference {
    Rotor,
    Output,
}

/// Per-source configuration.
#[derive(Debug, Clone, Copy)]
pub struct SourceConfig {
    pub enabled: bool,
    /// Which device feeds this slot; bring-up uses it to construct
    /// the matching driver.
    pub kind: crate::encoder::SourceKind,
    /// Counts per revolution of the thing the source is attached to.
    pub cpr: u32,
    /// +1 or -1.
    pub sign: i8,
    pub reference: SourceReference,
    /// True for the single source fusion commutates from.
    pub is_reference: bool,
    /// PLL natural frequency (Hz).
    pub pll_bandwidth_hz: f32,
    /// Linearization offsets (turns), binned over one source
    /// revolution, linearly interpolated.
    pub offset: [f32; OFFSET_TABLE_LEN],
    /// Test hook: when set, replaces the raw reading.
    pub debug_override: Option<u32>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            kind: crate::encoder::SourceKind::None,
            cpr: 16384,
            sign: 1,
            reference: SourceReference::Rotor,
            is_reference: false,
            pll_bandwidth_hz: 100.0,
            offset: [0.0; OFFSET_TABLE_LEN],
            debug_override: None,
        }
    }
}

/// Aggregate configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionConfig {
    pub sources: [SourceConfig; MAX_SOURCES],
    pub pole_pairs: u8,
    /// Output turns per rotor turn (< 1 for a reduction).
    pub rotor_to_output_ratio: f32,
    /// Max |PLL error| (turns) for the position to stay valid, and max
    /// disagreement between two rotor sources.
    pub tolerance: f32,
    /// Consecutive cycles without a nonce change before a source is
    /// considered inactive.
    pub nonce_stall_cycles: u32,
    /// An index pulse input is configured; homing waits for it.
    pub index_configured: bool,
}

impl Default for PositionConfig {
    fn default() -> Self {
        Self {
            sources: [Default::default(); MAX_SOURCES],
            // Zero until the motor is configured; theta-dependent
            // modes are gated on that anyway.
            pole_pairs: 0,
            rotor_to_output_ratio: 1.0,
            tolerance: 0.05,
            nonce_stall_cycles: 8,
            index_configured: false,
        }
    }
}

/// How far homing has progressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Homed {
    Never,
    Rotor,
    Output,
}

/// Second-order tracker: smoothed angle plus rate from a noisy,
/// possibly stale, wrapped angle input. Angles in turns.
struct SourcePll {
    kp: f32,
    ki: f32,
    angle: f32,
    velocity: f32,
    error: f32,
    initialized: bool,
}

impl SourcePll {
    fn new(bandwidth_hz: f32) -> Self {
        // Critically damped: kp = 2ζωn, ki = ωn², ζ = 1.
        let omega_n = bandwidth_hz * TAU;
        Self {
            kp: 2.0 * omega_n,
            ki: omega_n * omega_n,
            angle: 0.0,
            velocity: 0.0,
            error: 0.0,
            initialized: false,
        }
    }

    /// Track a fresh measurement (turns, [0, 1)).
    fn update(&mut self, measured: f32, dt: f32) {
        if !self.initialized {
            self.angle = measured;
            self.velocity = 0.0;
            self.error = 0.0;
            self.initialized = true;
            return;
        }
        self.error = wrap_half(measured - self.angle);
        self.velocity += self.ki * self.error * dt;
        self.angle = wrap_turn(self.angle + (self.velocity + self.kp * self.error) * dt);
    }

    /// Propagate with no new measurement.
    fn predict(&mut self, dt: f32) {
        if self.initialized {
            self.angle = wrap_turn(self.angle + self.velocity * dt);
        }
    }

    fn reset(&mut self) {
        self.initialized = false;
        self.angle = 0.0;
        self.velocity = 0.0;
        self.error = 0.0;
    }
}

struct SourceTracker {
    config: SourceConfig,
    pll: SourcePll,
    last_nonce: u8,
    stale_cycles: u32,
    active: bool,
    seen: bool,
}

impl SourceTracker {
    fn new(config: SourceConfig) -> Self {
        Self {
            config,
            pll: SourcePll::new(config.pll_bandwidth_hz),
            last_nonce: 0,
            stale_cycles: 0,
            active: false,
            seen: false,
        }
    }

    fn update(&mut self, sample: &SourceSample, stall_limit: u32, dt: f32) {
        if !self.config.enabled {
            return;
        }
        let raw = self.config.debug_override.unwrap_or(sample.value);

        let fresh = sample.active && (!self.seen || sample.nonce != self.last_nonce);
        if fresh {
            self.last_nonce = sample.nonce;
            self.seen = true;
            self.stale_cycles = 0;
            self.active = true;
            self.pll.update(self.convert(raw), dt);
        } else {
            self.stale_cycles = self.stale_cycles.saturating_add(1);
            if !sample.active || self.stale_cycles >= stall_limit {
                self.active = false;
                self.pll.reset();
            } else {
                self.pll.predict(dt);
            }
        }
    }

    /// Raw counts to a wrapped angle (turns), applying sign and the
    /// 32-bin linearization table.
    fn convert(&self, raw: u32) -> f32 {
        let mut fraction = (raw % self.config.cpr) as f32 / self.config.cpr as f32;
        if self.config.sign < 0 {
            fraction = wrap_turn(1.0 - fraction);
        }
        let scaled = fraction * OFFSET_TABLE_LEN as f32;
        let bin = scaled as usize % OFFSET_TABLE_LEN;
        let next = (bin + 1) % OFFSET_TABLE_LEN;
        let frac = scaled - scaled as u32 as f32;
        let offset =
            self.config.offset[bin] * (1.0 - frac) + self.config.offset[next] * frac;
        wrap_turn(fraction + offset)
    }
}

/// Published rotor/output state, refreshed every control cycle.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PositionStatus {
    /// Electrical angle (rad), [0, 2π).
    pub electrical_theta: f32,
    /// Electrical rate (rad/s).
    pub electrical_omega: f32,
    /// Rotor mechanical angle (turns), [0, 1).
    pub mechanical_theta_wrapped: f32,
    /// Unwrapped output position (turns).
    pub output_position: f32,
    /// Output rate (turns/s).
    pub output_velocity: f32,
    pub homed: Homed,
    pub theta_valid: bool,
    pub position_valid: bool,
    pub error: FaultCode,
}

impl Default for PositionStatus {
    fn default() -> Self {
        Self {
            electrical_theta: 0.0,
            electrical_omega: 0.0,
            mechanical_theta_wrapped: 0.0,
            output_position: 0.0,
            output_velocity: 0.0,
            homed: Homed::Never,
            theta_valid: false,
            position_valid: false,
            error: FaultCode::Success,
        }
    }
}

pub struct MotorPosition {
    config: PositionConfig,
    trackers: [SourceTracker; MAX_SOURCES],
    /// Commutation offsets (rad) over one electrical revolution.
    commutation_offset: [f32; COMMUTATION_TABLE_LEN],
    status: PositionStatus,
    last_rotor_angle: f32,
    rotor_angle_seen: bool,
}

impl MotorPosition {
    pub fn new(config: PositionConfig, commutation_offset: [f32; COMMUTATION_TABLE_LEN]) -> Self {
        Self {
            config,
            trackers: [
                SourceTracker::new(config.sources[0]),
                SourceTracker::new(config.sources[1]),
                SourceTracker::new(config.sources[2]),
            ],
            commutation_offset,
            status: Default::default(),
            last_rotor_angle: 0.0,
            rotor_angle_seen: false,
        }
    }

    pub fn status(&self) -> &PositionStatus {
        &self.status
    }

    pub fn config(&self) -> &PositionConfig {
        &self.config
    }

    /// One control cycle: fold in the latest samples and refresh the
    /// published state. Constant time, ISR-safe.
    pub fn isr_update(&mut self, samples: &[SourceSample; MAX_SOURCES], dt: f32) {
        for (tracker, sample) in self.trackers.iter_mut().zip(samples.iter()) {
            tracker.update(sample, self.config.nonce_stall_cycles, dt);
        }

        self.status.error = FaultCode::Success;

        let reference = self.reference_rotor_index();
        let Some(reference) = reference else {
            self.invalidate();
            return;
        };
        let tracker = &self.trackers[reference];
        if !tracker.active || !tracker.pll.initialized {
            // Any required source dead: theta is unusable.
            if tracker.seen {
                self.status.error = FaultCode::EncoderFault;
            }
            self.invalidate();
            return;
        }

        // Consistency: a second rotor source within tolerance is
        // ignored; beyond it we flag the encoder chain.
        for (i, other) in self.trackers.iter().enumerate() {
            if i == reference
                || !other.config.enabled
                || !other.active
                || other.config.reference != SourceReference::Rotor
            {
                continue;
            }
            let disagreement = wrap_half(other.pll.angle - tracker.pll.angle);
            if disagreement.abs() > self.config.tolerance {
                self.status.error = FaultCode::EncoderFault;
                self.invalidate();
                return;
            }
        }

        let mech = tracker.pll.angle;
        let mech_velocity = tracker.pll.velocity;
        let pll_error = tracker.pll.error;

        self.status.mechanical_theta_wrapped = mech;
        self.status.electrical_theta = self.electrical_from_mechanical(mech);
        self.status.electrical_omega = mech_velocity * self.config.pole_pairs as f32 * TAU;
        self.status.theta_valid = pll_error.abs() <= self.config.tolerance;
        if !self.status.theta_valid {
            self.status.error = FaultCode::ThetaInvalid;
        }

        // Unwrap the output from the rotor delta.
        if self.rotor_angle_seen {
            let delta = wrap_half(mech - self.last_rotor_angle);
            self.status.output_position += delta * self.config.rotor_to_output_ratio;
        }
        self.last_rotor_angle = mech;
        self.rotor_angle_seen = true;
        self.status.output_velocity = mech_velocity * self.config.rotor_to_output_ratio;

        // An absolute output source seeds and re-snaps the unwrap.
        if let Some(output_idx) = self.output_source_index() {
            let output_tracker = &self.trackers[output_idx];
            if output_tracker.active && output_tracker.pll.initialized {
                let absolute = output_tracker.pll.angle;
                if self.status.homed != Homed::Output {
                    self.status.output_position = absolute;
                    self.status.homed = Homed::Output;
                } else {
                    // Snap within one turn; the integer turn count is
                    // ours to keep.
                    let correction = wrap_half(absolute - self.status.output_position);
                    self.status.output_position += correction;
                }
            }
        }

        self.status.position_valid = self.status.theta_valid && self.status.homed != Homed::Never;
        if self.status.theta_valid && self.status.homed == Homed::Never {
            // Relative-only configurations home implicitly at startup.
            if !self.config.index_configured && self.output_source_index().is_none() {
                self.status.homed = Homed::Rotor;
                self.status.position_valid = true;
            }
        }
    }

    /// Rotor-referenced index pulse observed; establishes rotor homing
    /// and pins the output position to the index location.
    pub fn on_index_pulse(&mut self) {
        if self.status.homed == Homed::Never {
            self.status.homed = Homed::Rotor;
        }
    }

    /// Host command: define the current output position.
    pub fn set_output_position(&mut self, position: f32) {
        self.status.output_position = position;
        if self.status.homed == Homed::Never {
            self.status.homed = Homed::Output;
        }
    }

    /// Host command: pick the representation of the current absolute
    /// angle closest to `position`.
    pub fn set_output_position_nearest(&mut self, position: f32) {
        let fraction = self.status.output_position - libm::floorf(self.status.output_position);
        let base = libm::floorf(position) + fraction;
        let mut best = base;
        for candidate in [base - 1.0, base + 1.0] {
            if (candidate - position).abs() < (best - position).abs() {
                best = candidate;
            }
        }
        self.set_output_position(best);
    }

    /// Drop homing; position is invalid until re-homed.
    pub fn require_reindex(&mut self) {
        self.status.homed = Homed::Never;
        self.status.position_valid = false;
    }

    pub fn set_commutation_offset(&mut self, table: [f32; COMMUTATION_TABLE_LEN]) {
        self.commutation_offset = table;
    }

    fn electrical_from_mechanical(&self, mech: f32) -> f32 {
        let electrical = mech * self.config.pole_pairs as f32 * TAU;
        let bin = ((wrap_tau(electrical) / TAU) * COMMUTATION_TABLE_LEN as f32) as usize
            % COMMUTATION_TABLE_LEN;
        wrap_tau(electrical + self.commutation_offset[bin])
    }

    fn reference_rotor_index(&self) -> Option<usize> {
        // The marked reference wins; otherwise the first enabled rotor
        // source.
        self.trackers
            .iter()
            .position(|t| {
                t.config.enabled
                    && t.config.reference == SourceReference::Rotor
                    && t.config.is_reference
            })
            .or_else(|| {
                self.trackers.iter().position(|t| {
                    t.config.enabled && t.config.reference == SourceReference::Rotor
                })
            })
    }

    fn output_source_index(&self) -> Option<usize> {
        self.trackers
            .iter()
            .position(|t| t.config.enabled && t.config.reference == SourceReference::Output)
    }

    fn invalidate(&mut self) {
        self.status.theta_valid = false;
        self.status.position_valid = false;
        if self.status.error == FaultCode::Success {
            self.status.error = FaultCode::EncoderFault;
        }
    }
}

/// Wrap to [0, 1).
#[inline]
fn wrap_turn(value: f32) -> f32 {
    let mut wrapped = value - libm::floorf(value);
    if wrapped >= 1.0 {
        wrapped = 0.0;
    }
    wrapped
}

/// Fold to [-0.5, 0.5).
#[inline]
fn wrap_half(value: f32) -> f32 {
    let wrapped = wrap_turn(value);
    if wrapped >= 0.5 {
        wrapped - 1.0
    } else {
        wrapped
    }
}
