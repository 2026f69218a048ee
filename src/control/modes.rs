//! Controller mode machine.
//!
//! The mode is a tagged state selected once per control cycle; every
//! transition goes through `validate_entry` so safety preconditions
//! live in one place. Faults latch: only an explicit stop command
//! leaves `Fault`, and only after the condition has cleared.

use crate::errors::FaultCode;

/// What the control cycle tries to do.
///
/// Numeric values are part of the register protocol ABI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Mode {
    Stopped = 0,
    Fault = 1,
    Enabling = 2,
    CalibratingCurrent = 3,
    CalibratingEncoder = 4,
    Voltage = 5,
    VoltageFoc = 6,
    VoltageDq = 7,
    Current = 8,
    Position = 9,
    PositionTimeout = 10,
    ZeroVelocity = 11,
    StayWithin = 12,
    MeasureInductance = 13,
    Brake = 14,
    Velocity = 15,
    Torque = 16,
    PositionHold = 17,
    PositionWait = 18,
    Homing = 19,
}

impl Mode {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Mode::Stopped,
            1 => Mode::Fault,
            2 => Mode::Enabling,
            3 => Mode::CalibratingCurrent,
            4 => Mode::CalibratingEncoder,
            5 => Mode::Voltage,
            6 => Mode::VoltageFoc,
            7 => Mode::VoltageDq,
            8 => Mode::Current,
            9 => Mode::Position,
            10 => Mode::PositionTimeout,
            11 => Mode::ZeroVelocity,
            12 => Mode::StayWithin,
            13 => Mode::MeasureInductance,
            14 => Mode::Brake,
            15 => Mode::Velocity,
            16 => Mode::Torque,
            17 => Mode::PositionHold,
            18 => Mode::PositionWait,
            19 => Mode::Homing,
            _ => return None,
        })
    }

    /// Modes that drive the gates and therefore need the pre-driver
    /// enabled and the bus voltage in range.
    pub fn is_active(&self) -> bool {
        !matches!(self, Mode::Stopped | Mode::Fault)
    }

    /// Modes that commutate from the rotor electrical angle.
    /// VoltageFoc drives a commanded angle open loop and is exempt.
    pub fn requires_theta(&self) -> bool {
        matches!(
            self,
            Mode::VoltageDq
                | Mode::Current
                | Mode::Position
                | Mode::PositionTimeout
                | Mode::ZeroVelocity
                | Mode::StayWithin
                | Mode::Velocity
                | Mode::Torque
                | Mode::PositionHold
                | Mode::PositionWait
                | Mode::Homing
        )
    }

    /// Modes that additionally need a valid unwrapped output position.
    pub fn requires_position(&self) -> bool {
        matches!(
            self,
            Mode::Position
                | Mode::PositionTimeout
                | Mode::StayWithin
                | Mode::PositionHold
                | Mode::PositionWait
                | Mode::Homing
        )
    }

    /// Closed-loop modes between which switching is allowed instantly.
    pub fn is_pid_family(&self) -> bool {
        matches!(
            self,
            Mode::Position
                | Mode::Velocity
                | Mode::Torque
                | Mode::ZeroVelocity
                | Mode::PositionHold
                | Mode::PositionWait
        )
    }
}

impl Default for Mode {
    fn default() -> Self {
        Mode::Stopped
    }
}

/// Host command, written through the mailbox and consumed once per
/// cycle by the ISR.
#[derive(Debug, Clone, Copy)]
pub struct CommandData {
    pub mode: Mode,
    /// Target position (turns); NaN means velocity-only.
    pub position: f32,
    /// Target velocity (turns/s).
    pub velocity: f32,
    /// Feedforward torque (Nm).
    pub feedforward_torque: f32,
    pub kp_scale: f32,
    pub kd_scale: f32,
    pub max_torque: f32,
    /// Position at which a velocity command stops; NaN disables.
    pub stop_position: f32,
    /// Watchdog timeout (s); NaN uses the configured default, 0 means
    /// never time out.
    pub watchdog_timeout: f32,
    pub velocity_limit: f32,
    pub accel_limit: f32,
    /// Voltage commands (Voltage / VoltageFoc / VoltageDq modes).
    pub voltage: f32,
    pub voltage_theta: f32,
    pub i_d_a: f32,
    pub i_q_a: f32,
}

impl CommandData {
    /// Const default for the static mailbox.
    pub const fn new_const() -> Self {
        Self {
            mode: Mode::Stopped,
            position: f32::NAN,
            velocity: 0.0,
            feedforward_torque: 0.0,
            kp_scale: 1.0,
            kd_scale: 1.0,
            max_torque: f32::NAN,
            stop_position: f32::NAN,
            watchdog_timeout: f32::NAN,
            velocity_limit: f32::NAN,
            accel_limit: f32::NAN,
            voltage: 0.0,
            voltage_theta: 0.0,
            i_d_a: 0.0,
            i_q_a: 0.0,
        }
    }
}

impl Default for CommandData {
    fn default() -> Self {
        Self {
            mode: Mode::Stopped,
            position: f32::NAN,
            velocity: 0.0,
            feedforward_torque: 0.0,
            kp_scale: 1.0,
            kd_scale: 1.0,
            max_torque: f32::NAN,
            stop_position: f32::NAN,
            watchdog_timeout: f32::NAN,
            velocity_limit: f32::NAN,
            accel_limit: f32::NAN,
            voltage: 0.0,
            voltage_theta: 0.0,
            i_d_a: 0.0,
            i_q_a: 0.0,
        }
    }
}

/// Snapshot of the preconditions `validate_entry` needs; gathered by
/// the ISR from the rest of the cycle state.
#[derive(Debug, Clone, Copy, Default)]
pub struct EntryChecks {
    pub motor_configured: bool,
    pub config_dirty: bool,
    pub voltage_ok: bool,
    pub theta_valid: bool,
    pub position_valid: bool,
    /// |measured - commanded| position, used for the start limit.
    pub position_error: f32,
    pub start_position_limit: f32,
}

/// Result of a mode-entry request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Entry {
    /// Go directly to the target.
    Direct(Mode),
    /// Pass through `Enabling` first (driver enable + settle delay).
    ViaEnabling(Mode),
    /// Refused; latch this fault.
    Refused(FaultCode),
}

/// Validate a requested transition.
pub fn validate_entry(current: Mode, target: Mode, checks: &EntryChecks) -> Entry {
    // Stop is always allowed and is the only way out of Fault.
    if target == Mode::Stopped {
        return Entry::Direct(Mode::Stopped);
    }
    if current == Mode::Fault {
        return Entry::Refused(FaultCode::Success);
    }
    // Fault entry is never requested through a command.
    if matches!(target, Mode::Fault | Mode::Enabling | Mode::PositionTimeout) {
        return Entry::Refused(FaultCode::Success);
    }

    if target.is_active() {
        if !checks.motor_configured && target.requires_theta() {
            return Entry::Refused(FaultCode::MotorNotConfigured);
        }
        if checks.config_dirty {
            return Entry::Refused(FaultCode::ConfigChanged);
        }
        if !checks.voltage_ok {
            return Entry::Refused(FaultCode::UnderVoltage);
        }
        if target.requires_theta() && !checks.theta_valid {
            return Entry::Refused(FaultCode::ThetaInvalid);
        }
        if target.requires_position() && !checks.position_valid {
            return Entry::Refused(FaultCode::PositionInvalid);
        }
        if target == Mode::Position
            && checks.start_position_limit.is_finite()
            && checks.position_error.is_finite()
            && checks.position_error.abs() > checks.start_position_limit
        {
            return Entry::Refused(FaultCode::StartOutsideLimit);
        }
    }

    // Within the PID family the switch is instant; from Stopped the
    // driver has to be enabled first.
    if current == Mode::Stopped {
        Entry::ViaEnabling(target)
    } else {
        Entry::Direct(target)
    }
}

/// Command-freshness watchdog.
///
/// Aging past the timeout demotes the controller to zero-velocity;
/// staying there past `position_timeout_s` releases to stopped.
pub struct Watchdog {
    age_s: f32,
    timeout_s: f32,
    default_timeout_s: f32,
    position_timeout_s: f32,
}

impl Watchdog {
    pub fn new(default_timeout_s: f32, position_timeout_s: f32) -> Self {
        Self {
            age_s: 0.0,
            timeout_s: default_timeout_s,
            default_timeout_s,
            position_timeout_s,
        }
    }

    /// Called when a fresh command arrives.
    pub fn feed(&mut self, command_timeout: f32) {
        self.age_s = 0.0;
        self.timeout_s = if command_timeout.is_nan() {
            self.default_timeout_s
        } else {
            command_timeout
        };
    }

    /// Advance by one control period; returns the demotion to apply,
    /// if any.
    pub fn tick(&mut self, dt: f32, mode: Mode) -> Option<Mode> {
        self.age_s += dt;
        if self.timeout_s <= 0.0 {
            return None;
        }
        match mode {
            Mode::Position
            | Mode::PositionHold
            | Mode::PositionWait
            | Mode::Velocity
            | Mode::Torque
            | Mode::Current
            | Mode::Voltage
            | Mode::VoltageFoc
            | Mode::VoltageDq
            | Mode::StayWithin
            | Mode::Homing => {
                if self.age_s > self.timeout_s {
                    Some(Mode::PositionTimeout)
                } else {
                    None
                }
            }
            Mode::PositionTimeout | Mode::ZeroVelocity => {
                if self.age_s > self.timeout_s + self.position_timeout_s {
                    Some(Mode::Stopped)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    pub fn age_s(&self) -> f32 {
        self.age_s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok_checks() -> EntryChecks {
        EntryChecks {
            motor_configured: true,
            config_dirty: false,
            voltage_ok: true,
            theta_valid: true,
            position_valid: true,
            position_error: 0.0,
            start_position_limit: f32::NAN,
        }
    }

    #[test]
    fn test_mode_round_trip() {
        for raw in 0..=20u8 {
            if let Some(mode) = Mode::from_u8(raw) {
                assert_eq!(mode as u8, raw);
            }
        }
        assert!(Mode::from_u8(20).is_none());
    }

    #[test]
    fn test_stop_always_allowed() {
        for current in [Mode::Fault, Mode::Position, Mode::Brake] {
            assert_eq!(
                validate_entry(current, Mode::Stopped, &Default::default()),
                Entry::Direct(Mode::Stopped)
            );
        }
    }

    #[test]
    fn test_fault_only_leaves_via_stop() {
        assert_eq!(
            validate_entry(Mode::Fault, Mode::Position, &ok_checks()),
            Entry::Refused(FaultCode::Success)
        );
    }

    #[test]
    fn test_stopped_passes_through_enabling() {
        assert_eq!(
            validate_entry(Mode::Stopped, Mode::Position, &ok_checks()),
            Entry::ViaEnabling(Mode::Position)
        );
        // Already running: instant switch.
        assert_eq!(
            validate_entry(Mode::Velocity, Mode::Position, &ok_checks()),
            Entry::Direct(Mode::Position)
        );
    }

    #[test]
    fn test_entry_preconditions() {
        let mut checks = ok_checks();
        checks.theta_valid = false;
        assert_eq!(
            validate_entry(Mode::Stopped, Mode::Position, &checks),
            Entry::Refused(FaultCode::ThetaInvalid)
        );

        let mut checks = ok_checks();
        checks.position_valid = false;
        assert_eq!(
            validate_entry(Mode::Stopped, Mode::Position, &checks),
            Entry::Refused(FaultCode::PositionInvalid)
        );
        // Velocity mode runs without a homed output position.
        assert_eq!(
            validate_entry(Mode::Stopped, Mode::Velocity, &checks),
            Entry::ViaEnabling(Mode::Velocity)
        );

        let mut checks = ok_checks();
        checks.config_dirty = true;
        assert_eq!(
            validate_entry(Mode::Stopped, Mode::Velocity, &checks),
            Entry::Refused(FaultCode::ConfigChanged)
        );

        let mut checks = ok_checks();
        checks.motor_configured = false;
        assert_eq!(
            validate_entry(Mode::Stopped, Mode::Current, &checks),
            Entry::Refused(FaultCode::MotorNotConfigured)
        );
        // Plain voltage mode works on an unconfigured motor.
        assert_eq!(
            validate_entry(Mode::Stopped, Mode::Voltage, &checks),
            Entry::ViaEnabling(Mode::Voltage)
        );
    }

    #[test]
    fn test_start_outside_limit() {
        let mut checks = ok_checks();
        checks.position_error = 0.6;
        checks.start_position_limit = 0.5;
        assert_eq!(
            validate_entry(Mode::Stopped, Mode::Position, &checks),
            Entry::Refused(FaultCode::StartOutsideLimit)
        );
        checks.position_error = 0.4;
        assert_eq!(
            validate_entry(Mode::Stopped, Mode::Position, &checks),
            Entry::ViaEnabling(Mode::Position)
        );
    }

    #[test]
    fn test_watchdog_demotion_chain() {
        let mut wd = Watchdog::new(0.1, 0.5);
        wd.feed(0.2);

        let dt = 0.01;
        let mut mode = Mode::Position;
        let mut elapsed = 0.0f32;
        while elapsed < 0.25 {
            if let Some(next) = wd.tick(dt, mode) {
                mode = next;
            }
            elapsed += dt;
        }
        assert_eq!(mode, Mode::PositionTimeout);

        while elapsed < 0.9 {
            if let Some(next) = wd.tick(dt, mode) {
                mode = next;
            }
            elapsed += dt;
        }
        assert_eq!(mode, Mode::Stopped);
    }

    #[test]
    fn test_watchdog_zero_disables() {
        let mut wd = Watchdog::new(0.1, 0.5);
        wd.feed(0.0);
        for _ in 0..10_000 {
            assert!(wd.tick(0.01, Mode::Position).is_none());
        }
    }
}
