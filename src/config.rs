//! Runtime configuration: the aggregate every subsystem is built
//! from, its defaults, and the flash persistence layer.

pub mod params;
pub mod storage;

use crate::control::{OuterLimits, PidConfig, COMMUTATION_TABLE_LEN};
use crate::encoder::SourceKind;
use crate::foc::CurrentLoopConfig;
use crate::position::{PositionConfig, SourceConfig};
use crate::safety::SafetyConfig;
use crate::sampling::SamplingConfig;

/// Motor electrical parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotorParams {
    pub pole_pairs: u8,
    pub resistance_ohm: f32,
    pub inductance_h: f32,
    pub torque_constant: f32,
    pub current_cutoff_a: f32,
    pub current_scale: f32,
    pub torque_scale: f32,
}

impl Default for MotorParams {
    fn default() -> Self {
        Self {
            pole_pairs: 0,
            resistance_ohm: 0.0,
            inductance_h: 0.0,
            torque_constant: params::DEFAULT_TORQUE_CONSTANT,
            current_cutoff_a: params::DEFAULT_CURRENT_CUTOFF_A,
            current_scale: params::DEFAULT_CURRENT_SCALE,
            torque_scale: params::DEFAULT_TORQUE_SCALE,
        }
    }
}

impl MotorParams {
    /// Closed-loop modes refuse to start until these are known.
    pub fn configured(&self) -> bool {
        self.pole_pairs > 0 && self.torque_constant > 0.0
    }
}

/// Results of the calibration procedures, persisted with the config.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationData {
    pub current_offsets: [f32; 3],
    pub commutation_offset: [f32; COMMUTATION_TABLE_LEN],
    pub valid: bool,
}

impl Default for CalibrationData {
    fn default() -> Self {
        Self {
            current_offsets: [0.0; 3],
            commutation_offset: [0.0; COMMUTATION_TABLE_LEN],
            valid: false,
        }
    }
}

/// The whole runtime configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RuntimeConfig {
    pub pwm_rate_hz: u32,
    pub motor: MotorParams,
    pub current_loop: CurrentLoopConfig,
    pub position_pid: PidConfig,
    pub limits: OuterLimits,
    pub safety: SafetyConfig,
    pub sampling: SamplingConfig,
    pub position: PositionConfig,
    pub calibration: CalibrationData,
    /// Watchdog default and the zero-velocity dwell after a timeout.
    pub default_timeout_s: f32,
    pub position_timeout_s: f32,
    /// Position-mode entry refuses a larger initial error.
    pub start_position_limit: f32,
    /// Bus node address and CAN id prefix.
    pub can_address: u8,
    pub can_prefix: u16,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            pwm_rate_hz: params::DEFAULT_PWM_RATE_HZ,
            motor: Default::default(),
            current_loop: Default::default(),
            position_pid: PidConfig {
                kp: params::DEFAULT_POSITION_KP,
                ki: params::DEFAULT_POSITION_KI,
                kd: params::DEFAULT_POSITION_KD,
                ilimit: params::DEFAULT_POSITION_ILIMIT,
                // The PID error is measured - desired; torque must
                // oppose it.
                sign: -1,
                ..Default::default()
            },
            limits: Default::default(),
            safety: Default::default(),
            sampling: Default::default(),
            position: {
                let mut position = PositionConfig::default();
                // The on-board magnetic encoder ships populated; it is
                // the rotor reference until configured otherwise.
                position.sources[0] = SourceConfig {
                    enabled: true,
                    kind: SourceKind::OnboardSpi,
                    cpr: 65536,
                    is_reference: true,
                    ..Default::default()
                };
                position
            },
            calibration: Default::default(),
            default_timeout_s: params::DEFAULT_WATCHDOG_TIMEOUT_S,
            position_timeout_s: params::DEFAULT_POSITION_TIMEOUT_S,
            start_position_limit: f32::NAN,
            can_address: params::DEFAULT_CAN_ADDRESS,
            can_prefix: params::DEFAULT_CAN_PREFIX,
        }
    }
}
