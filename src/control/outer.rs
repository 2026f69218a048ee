//! Outer loops: translate the active mode and host command into dq
//! current references for the FOC stage, enforcing every configured
//! limit on the way.

use super::modes::{CommandData, Mode};
use super::pid::{self, ApplyOptions, PidConfig, PidState};
use crate::foc::TorqueModel;

/// What the FOC stage should do this cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LoopCommand {
    /// Gates off (high-Z).
    Idle,
    /// All three low sides on.
    Brake,
    /// Closed-loop dq current references (A).
    Dq { id_a: f32, iq_a: f32 },
    /// Open-loop phase voltage, fixed electrical angle.
    VoltageFoc { theta: f32, voltage: f32 },
    /// Open-loop dq voltage at the measured angle.
    VoltageDq { v_d: f32, v_q: f32 },
}

/// Static limits from the runtime configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OuterLimits {
    pub max_torque_nm: f32,
    pub max_velocity: f32,
    /// Output position bounds (turns); NaN disables each side.
    pub position_min: f32,
    pub position_max: f32,
    pub max_power_w: f32,
    /// Default velocity/accel limits when the command carries NaN.
    pub default_velocity_limit: f32,
    pub default_accel_limit: f32,
    /// Field weakening ceiling (A of negative d current); 0 disables.
    pub field_weaken_max_a: f32,
}

impl Default for OuterLimits {
    fn default() -> Self {
        Self {
            max_torque_nm: f32::NAN,
            max_velocity: 500.0,
            position_min: f32::NAN,
            position_max: f32::NAN,
            max_power_w: f32::NAN,
            default_velocity_limit: f32::NAN,
            default_accel_limit: f32::NAN,
            field_weaken_max_a: 0.0,
        }
    }
}

/// Measured state consumed by the outer loops each cycle.
#[derive(Debug, Clone, Copy, Default)]
pub struct Measured {
    pub position: f32,
    pub velocity: f32,
    pub velocity_rad_s: f32,
}

/// Per-cycle outer loop result.
#[derive(Debug, Clone, Copy)]
pub struct OuterOutput {
    pub command: LoopCommand,
    pub torque_nm: f32,
    /// True when any limit clipped the torque this cycle.
    pub torque_limited: bool,
}

pub struct OuterLoop {
    pub pid_config: PidConfig,
    pub pid_state: PidState,
    limits: OuterLimits,
    torque_model: TorqueModel,
    /// Acceleration-limited velocity command state.
    ramp_velocity: f32,
    /// Stop-position latch: once crossed, hold here.
    stop_position_reached: bool,
    /// Zero-velocity anchor position.
    hold_position: f32,
    /// Negative d current currently commanded for field weakening.
    fw_current_a: f32,
}

impl OuterLoop {
    pub fn new(pid_config: PidConfig, limits: OuterLimits, torque_model: TorqueModel) -> Self {
        Self {
            pid_config,
            pid_state: Default::default(),
            limits,
            torque_model,
            ramp_velocity: 0.0,
            stop_position_reached: false,
            hold_position: f32::NAN,
            fw_current_a: 0.0,
        }
    }

    /// Reset loop state on mode entry.
    ///
    /// The PID integral survives switches inside the PID family only
    /// when `keep_integral` is set (the gains did not change).
    pub fn enter(&mut self, measured: &Measured, keep_integral: bool) {
        let integral = self.pid_state.integral;
        self.pid_state.clear();
        if keep_integral {
            self.pid_state.integral = integral;
        }
        self.ramp_velocity = measured.velocity;
        self.stop_position_reached = false;
        self.hold_position = measured.position;
        self.fw_current_a = 0.0;
    }

    /// Field weakening: walk negative d current in while the voltage
    /// clamp is active at speed, back out when headroom returns.
    pub fn note_voltage_clamp(&mut self, clamped: bool, rate_hz: u32) {
        let max = self.limits.field_weaken_max_a;
        if max <= 0.0 {
            self.fw_current_a = 0.0;
            return;
        }
        // Full range in ~50 ms either direction.
        let step = max / (0.05 * rate_hz as f32);
        if clamped {
            self.fw_current_a = (self.fw_current_a + step).min(max);
        } else {
            self.fw_current_a = (self.fw_current_a - step).max(0.0);
        }
    }

    fn d_reference(&self) -> f32 {
        -self.fw_current_a
    }

    /// Run the outer loop for the current cycle.
    ///
    /// `derate` scales the torque ceiling in [0, 1] (thermal derating).
    pub fn update(
        &mut self,
        mode: Mode,
        command: &CommandData,
        measured: &Measured,
        rate_hz: u32,
        derate: f32,
    ) -> OuterOutput {
        match mode {
            Mode::Stopped | Mode::Fault | Mode::Enabling => OuterOutput {
                command: LoopCommand::Idle,
                torque_nm: 0.0,
                torque_limited: false,
            },
            Mode::Brake => OuterOutput {
                command: LoopCommand::Brake,
                torque_nm: 0.0,
                torque_limited: false,
            },
            Mode::VoltageFoc => OuterOutput {
                command: LoopCommand::VoltageFoc {
                    theta: command.voltage_theta,
                    voltage: command.voltage,
                },
                torque_nm: 0.0,
                torque_limited: false,
            },
            Mode::Voltage => OuterOutput {
                // Fixed stator voltage vector at angle zero.
                command: LoopCommand::VoltageFoc {
                    theta: 0.0,
                    voltage: command.voltage,
                },
                torque_nm: 0.0,
                torque_limited: false,
            },
            Mode::VoltageDq => OuterOutput {
                command: LoopCommand::VoltageDq {
                    v_d: command.i_d_a,
                    v_q: command.i_q_a,
                },
                torque_nm: 0.0,
                torque_limited: false,
            },
            Mode::Current => OuterOutput {
                command: LoopCommand::Dq {
                    id_a: command.i_d_a,
                    iq_a: command.i_q_a,
                },
                torque_nm: self.torque_model.current_to_torque(command.i_q_a),
                torque_limited: false,
            },
            Mode::Torque => {
                let (torque, limited) =
                    self.limit_torque(command.feedforward_torque, command, measured, derate);
                OuterOutput {
                    command: LoopCommand::Dq {
                        id_a: self.d_reference(),
                        iq_a: self.torque_model.torque_to_current(torque),
                    },
                    torque_nm: torque,
                    torque_limited: limited,
                }
            }
            Mode::Position | Mode::PositionHold | Mode::PositionWait | Mode::Homing => {
                self.run_pid(command.position, command.velocity, command, measured, rate_hz, derate)
            }
            Mode::Velocity => {
                // Stop-position handling: run velocity until the stop
                // position is crossed, then hold there.
                if command.stop_position.is_finite() {
                    let arrived = self.stop_position_reached
                        || (command.velocity > 0.0 && measured.position >= command.stop_position)
                        || (command.velocity < 0.0 && measured.position <= command.stop_position);
                    if arrived {
                        self.stop_position_reached = true;
                        return self.run_pid(
                            command.stop_position,
                            0.0,
                            command,
                            measured,
                            rate_hz,
                            derate,
                        );
                    }
                }
                let velocity = self.apply_velocity_ramp(command, rate_hz);
                self.run_pid(f32::NAN, velocity, command, measured, rate_hz, derate)
            }
            Mode::ZeroVelocity | Mode::PositionTimeout => {
                // Stand-still regulator: position floats, velocity 0.
                self.run_pid(f32::NAN, 0.0, command, measured, rate_hz, derate)
            }
            Mode::StayWithin => {
                let lo = command.position.min(command.stop_position);
                let hi = command.position.max(command.stop_position);
                let target = if measured.position < lo {
                    lo
                } else if measured.position > hi {
                    hi
                } else {
                    // Inside the band: coast, and re-seed the PID so
                    // re-engagement starts from here.
                    self.pid_state.clear();
                    self.hold_position = measured.position;
                    return OuterOutput {
                        command: LoopCommand::Dq {
                            id_a: 0.0,
                            iq_a: self
                                .torque_model
                                .torque_to_current(command.feedforward_torque),
                        },
                        torque_nm: command.feedforward_torque,
                        torque_limited: false,
                    };
                };
                self.run_pid(target, 0.0, command, measured, rate_hz, derate)
            }
            // The calibration modes drive the FOC stage directly from
            // the calibration sequencer, not from here.
            Mode::CalibratingCurrent | Mode::CalibratingEncoder | Mode::MeasureInductance => {
                OuterOutput {
                    command: LoopCommand::Idle,
                    torque_nm: 0.0,
                    torque_limited: false,
                }
            }
        }
    }

    fn apply_velocity_ramp(&mut self, command: &CommandData, rate_hz: u32) -> f32 {
        let accel = if command.accel_limit.is_finite() {
            command.accel_limit
        } else {
            self.limits.default_accel_limit
        };
        let target = command
            .velocity
            .clamp(-self.limits.max_velocity, self.limits.max_velocity);
        if !accel.is_finite() || accel <= 0.0 {
            self.ramp_velocity = target;
            return target;
        }
        let max_step = accel / rate_hz as f32;
        let step = (target - self.ramp_velocity).clamp(-max_step, max_step);
        self.ramp_velocity += step;
        self.ramp_velocity
    }

    fn run_pid(
        &mut self,
        target_position: f32,
        target_velocity: f32,
        command: &CommandData,
        measured: &Measured,
        rate_hz: u32,
        derate: f32,
    ) -> OuterOutput {
        // NaN position means velocity-only: servo the velocity around
        // the floating hold position so kd does the work.
        let (position_target, velocity_target) = if target_position.is_nan() {
            (measured.position, target_velocity)
        } else {
            let clamped = clamp_position(
                target_position,
                self.limits.position_min,
                self.limits.position_max,
            );
            (clamped, target_velocity)
        };

        let integral_before = self.pid_state.integral;
        let options = ApplyOptions {
            kp_scale: command.kp_scale,
            kd_scale: command.kd_scale,
            ki_scale: 1.0,
        };
        let pid_torque = pid::apply(
            &self.pid_config,
            &mut self.pid_state,
            measured.position,
            position_target,
            measured.velocity,
            velocity_target,
            rate_hz,
            &options,
        );

        let unlimited = pid_torque + command.feedforward_torque;
        let (torque, limited) = self.limit_torque(unlimited, command, measured, derate);

        // Freeze the integrator while any limit is clipping.
        if limited {
            self.pid_state.integral = integral_before;
        }

        OuterOutput {
            command: LoopCommand::Dq {
                id_a: self.d_reference(),
                iq_a: self.torque_model.torque_to_current(torque),
            },
            torque_nm: torque,
            torque_limited: limited,
        }
    }

    /// Apply command, configuration, thermal, and power torque limits.
    fn limit_torque(
        &self,
        torque: f32,
        command: &CommandData,
        measured: &Measured,
        derate: f32,
    ) -> (f32, bool) {
        let mut limit = if command.max_torque.is_finite() {
            command.max_torque
        } else {
            f32::INFINITY
        };
        if self.limits.max_torque_nm.is_finite() {
            limit = limit.min(self.limits.max_torque_nm);
        }
        limit *= derate.clamp(0.0, 1.0);

        if self.limits.max_power_w.is_finite() {
            let omega = measured.velocity_rad_s.abs();
            if omega > 1.0 {
                limit = limit.min(self.limits.max_power_w / omega);
            }
        }

        let limited_torque = torque.clamp(-limit, limit);
        (limited_torque, limited_torque != torque)
    }

    pub fn set_limits(&mut self, limits: OuterLimits) {
        self.limits = limits;
    }

    pub fn set_torque_model(&mut self, model: TorqueModel) {
        self.torque_model = model;
    }

    pub fn limits(&self) -> &OuterLimits {
        &self.limits
    }
}

fn clamp_position(value: f32, min: f32, max: f32) -> f32 {
    let mut out = value;
    if min.is_finite() && out < min {
        out = min;
    }
    if max.is_finite() && out > max {
        out = max;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: u32 = 30_000;

    fn outer() -> OuterLoop {
        OuterLoop::new(
            PidConfig {
                kp: 10.0,
                kd: 1.0,
                ki: 0.0,
                ilimit: 0.0,
                sign: -1,
                ..Default::default()
            },
            OuterLimits::default(),
            TorqueModel::new(0.1, 20.0, 0.3, 0.6),
        )
    }

    fn dq_iq(out: &OuterOutput) -> f32 {
        match out.command {
            LoopCommand::Dq { iq_a, .. } => iq_a,
            _ => panic!("expected dq command"),
        }
    }

    #[test]
    fn test_position_mode_direction() {
        let mut loop_ = outer();
        let command = CommandData {
            mode: Mode::Position,
            position: 1.0,
            ..Default::default()
        };
        let measured = Measured::default();
        loop_.enter(&measured, false);
        let out = loop_.update(Mode::Position, &command, &measured, RATE, 1.0);
        // Positive position error (target ahead) => positive torque.
        assert!(out.torque_nm > 0.0);
        assert!(dq_iq(&out) > 0.0);
    }

    #[test]
    fn test_max_torque_clamp() {
        let mut loop_ = outer();
        let command = CommandData {
            mode: Mode::Position,
            position: 100.0,
            max_torque: 1.5,
            ..Default::default()
        };
        let measured = Measured::default();
        loop_.enter(&measured, false);
        let out = loop_.update(Mode::Position, &command, &measured, RATE, 1.0);
        assert!((out.torque_nm - 1.5).abs() < 1e-6);
        assert!(out.torque_limited);
    }

    #[test]
    fn test_derate_scales_limit() {
        let mut loop_ = outer();
        let command = CommandData {
            mode: Mode::Position,
            position: 100.0,
            max_torque: 2.0,
            ..Default::default()
        };
        let measured = Measured::default();
        loop_.enter(&measured, false);
        let out = loop_.update(Mode::Position, &command, &measured, RATE, 0.5);
        assert!((out.torque_nm - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_power_limit() {
        let mut loop_ = outer();
        loop_.set_limits(OuterLimits {
            max_power_w: 10.0,
            ..Default::default()
        });
        let command = CommandData {
            mode: Mode::Torque,
            feedforward_torque: 5.0,
            ..Default::default()
        };
        let measured = Measured {
            velocity_rad_s: 100.0,
            ..Default::default()
        };
        let out = loop_.update(Mode::Torque, &command, &measured, RATE, 1.0);
        assert!((out.torque_nm - 0.1).abs() < 1e-6); // 10 W / 100 rad/s
        assert!(out.torque_limited);
    }

    #[test]
    fn test_zero_velocity_damps() {
        let mut loop_ = outer();
        let command = CommandData::default();
        let measured = Measured {
            velocity: 2.0,
            ..Default::default()
        };
        loop_.enter(&measured, false);
        let out = loop_.update(Mode::ZeroVelocity, &command, &measured, RATE, 1.0);
        // Moving forward with zero velocity target => braking torque.
        assert!(out.torque_nm < 0.0);
    }

    #[test]
    fn test_stay_within_coasts_inside_band() {
        let mut loop_ = outer();
        let command = CommandData {
            position: -1.0,
            stop_position: 1.0,
            ..Default::default()
        };
        let measured = Measured::default();
        loop_.enter(&measured, false);
        let out = loop_.update(Mode::StayWithin, &command, &measured, RATE, 1.0);
        assert_eq!(out.torque_nm, 0.0);

        // Outside the band: pushes back toward the nearest bound.
        let measured = Measured {
            position: 2.0,
            ..Default::default()
        };
        let out = loop_.update(Mode::StayWithin, &command, &measured, RATE, 1.0);
        assert!(out.torque_nm < 0.0);
    }

    #[test]
    fn test_velocity_stop_position_latch() {
        let mut loop_ = outer();
        let command = CommandData {
            velocity: 1.0,
            stop_position: 0.5,
            ..Default::default()
        };
        loop_.enter(&Measured::default(), false);

        // Before the stop position: plain velocity servo.
        let measured = Measured {
            position: 0.0,
            ..Default::default()
        };
        loop_.update(Mode::Velocity, &command, &measured, RATE, 1.0);
        assert!(!loop_.stop_position_reached);

        // Crossing it latches position hold even if we overshoot back.
        let measured = Measured {
            position: 0.6,
            ..Default::default()
        };
        loop_.update(Mode::Velocity, &command, &measured, RATE, 1.0);
        assert!(loop_.stop_position_reached);

        let measured = Measured {
            position: 0.4,
            ..Default::default()
        };
        let out = loop_.update(Mode::Velocity, &command, &measured, RATE, 1.0);
        // Held at 0.5: positive torque pulls back up.
        assert!(out.torque_nm > 0.0);
    }

    #[test]
    fn test_accel_limited_ramp() {
        let mut loop_ = outer();
        let command = CommandData {
            velocity: 10.0,
            accel_limit: 30_000.0, // 1 turn/s per cycle at 30 kHz
            ..Default::default()
        };
        loop_.enter(&Measured::default(), false);
        loop_.update(Mode::Velocity, &command, &Measured::default(), RATE, 1.0);
        assert!((loop_.ramp_velocity - 1.0).abs() < 1e-3);
        loop_.update(Mode::Velocity, &command, &Measured::default(), RATE, 1.0);
        assert!((loop_.ramp_velocity - 2.0).abs() < 1e-3);
    }

    #[test]
    fn test_field_weakening_walks_in_and_out() {
        let mut loop_ = outer();
        loop_.set_limits(OuterLimits {
            field_weaken_max_a: 4.0,
            ..Default::default()
        });
        // Sustained clamp walks d current in, bounded by the ceiling.
        for _ in 0..10_000 {
            loop_.note_voltage_clamp(true, RATE);
        }
        assert!((loop_.fw_current_a - 4.0).abs() < 1e-3);
        assert_eq!(loop_.d_reference(), -loop_.fw_current_a);

        // Headroom back: walks out to zero.
        for _ in 0..10_000 {
            loop_.note_voltage_clamp(false, RATE);
        }
        assert_eq!(loop_.fw_current_a, 0.0);
    }

    #[test]
    fn test_field_weakening_disabled_by_default() {
        let mut loop_ = outer();
        loop_.note_voltage_clamp(true, RATE);
        assert_eq!(loop_.fw_current_a, 0.0);
    }

    #[test]
    fn test_integrator_frozen_when_limited() {
        let mut loop_ = outer();
        loop_.pid_config.ki = 100.0;
        loop_.pid_config.ilimit = 10.0;
        let command = CommandData {
            position: 100.0,
            max_torque: 0.5,
            ..Default::default()
        };
        let measured = Measured::default();
        loop_.enter(&measured, false);
        loop_.update(Mode::Position, &command, &measured, RATE, 1.0);
        assert_eq!(loop_.pid_state.integral, 0.0);
    }
}
