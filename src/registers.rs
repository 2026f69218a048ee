//! Register file: the flat namespace of scalar fields exposed over
//! the bus protocol and the CLI.
//!
//! Every register is a f32-valued quantity with a mapping class that
//! fixes its integer encodings; the same addresses double as the TLV
//! tags of the persisted configuration.

use crate::config::RuntimeConfig;
use crate::control::{CommandData, Mode};
use crate::firmware_info::FirmwareInfo;
use crate::telemetry::ControlCycle;

/// Register addresses.
pub mod regs {
    // Status (read-only unless noted).
    pub const MODE: u16 = 0x000; // RW: writing requests a mode switch
    pub const POSITION: u16 = 0x001;
    pub const VELOCITY: u16 = 0x002;
    pub const TORQUE: u16 = 0x003;
    pub const Q_CURRENT: u16 = 0x004;
    pub const D_CURRENT: u16 = 0x005;
    pub const ABS_POSITION: u16 = 0x006; // RW: writes re-seed output position
    pub const MOTOR_TEMPERATURE: u16 = 0x00A;
    pub const VOLTAGE: u16 = 0x00D;
    pub const TEMPERATURE: u16 = 0x00E;
    pub const FAULT: u16 = 0x00F;

    // Command block (RW).
    pub const COMMAND_POSITION: u16 = 0x020;
    pub const COMMAND_VELOCITY: u16 = 0x021;
    pub const COMMAND_FEEDFORWARD_TORQUE: u16 = 0x022;
    pub const COMMAND_KP_SCALE: u16 = 0x023;
    pub const COMMAND_KD_SCALE: u16 = 0x024;
    pub const COMMAND_MAX_TORQUE: u16 = 0x025;
    pub const COMMAND_STOP_POSITION: u16 = 0x026;
    pub const COMMAND_WATCHDOG_TIMEOUT: u16 = 0x027;
    pub const COMMAND_VELOCITY_LIMIT: u16 = 0x028;
    pub const COMMAND_ACCEL_LIMIT: u16 = 0x029;
    pub const COMMAND_Q_CURRENT: u16 = 0x02A;
    pub const COMMAND_D_CURRENT: u16 = 0x02B;
    pub const COMMAND_VOLTAGE: u16 = 0x02C;
    pub const COMMAND_VOLTAGE_THETA: u16 = 0x02D;

    // Configuration (RW, also TLV tags).
    pub const CONFIG_POSITION_KP: u16 = 0x040;
    pub const CONFIG_POSITION_KI: u16 = 0x041;
    pub const CONFIG_POSITION_KD: u16 = 0x042;
    pub const CONFIG_POSITION_ILIMIT: u16 = 0x043;
    pub const CONFIG_MAX_DESIRED_RATE: u16 = 0x045;
    pub const CONFIG_START_POSITION_LIMIT: u16 = 0x046;
    pub const CONFIG_DEFAULT_TIMEOUT: u16 = 0x047;
    pub const CONFIG_POSITION_TIMEOUT: u16 = 0x048;

    pub const CONFIG_CURRENT_KP: u16 = 0x050;
    pub const CONFIG_CURRENT_KI: u16 = 0x051;
    pub const CONFIG_DEADTIME_COMP: u16 = 0x053;

    pub const CONFIG_MAX_TORQUE: u16 = 0x058;
    pub const CONFIG_MAX_VELOCITY: u16 = 0x059;
    pub const CONFIG_POSITION_MIN: u16 = 0x05A;
    pub const CONFIG_POSITION_MAX: u16 = 0x05B;
    pub const CONFIG_MAX_POWER: u16 = 0x05C;
    pub const CONFIG_FIELD_WEAKEN_MAX: u16 = 0x05D;

    pub const CONFIG_V_MIN: u16 = 0x060;
    pub const CONFIG_V_MAX: u16 = 0x061;
    pub const CONFIG_FET_DERATE_TEMP: u16 = 0x062;
    pub const CONFIG_FET_FAULT_TEMP: u16 = 0x063;
    pub const CONFIG_MOTOR_DERATE_TEMP: u16 = 0x064;
    pub const CONFIG_MOTOR_FAULT_TEMP: u16 = 0x065;

    pub const CONFIG_POLE_PAIRS: u16 = 0x070;
    pub const CONFIG_RESISTANCE: u16 = 0x071;
    pub const CONFIG_INDUCTANCE: u16 = 0x072;
    pub const CONFIG_TORQUE_CONSTANT: u16 = 0x073;
    pub const CONFIG_CURRENT_CUTOFF: u16 = 0x074;
    pub const CONFIG_CURRENT_SCALE: u16 = 0x075;
    pub const CONFIG_TORQUE_SCALE: u16 = 0x076;
    pub const CONFIG_ROTOR_TO_OUTPUT: u16 = 0x077;
    pub const CONFIG_PWM_RATE: u16 = 0x078;

    // TLV-only calibration blobs (not addressable as scalars).
    pub const CAL_CURRENT_OFFSETS: u16 = 0x080;
    pub const CAL_COMMUTATION_TABLE: u16 = 0x081;
    pub const SOURCE_CONFIG_BASE: u16 = 0x090; // +index

    // Identity (read-only). The 96-bit UUID does not fit the scalar
    // value pipeline; it is reported through the CLI instead.
    pub const FIRMWARE_VERSION: u16 = 0x100;
    pub const HARDWARE_FAMILY: u16 = 0x101;
    pub const HARDWARE_REV: u16 = 0x102;
}

/// Scalar wire types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum IntType {
    I8,
    I16,
    I32,
    F32,
}

/// A typed register value as it appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RegisterValue {
    I8(i8),
    I16(i16),
    I32(i32),
    F32(f32),
}

impl RegisterValue {
    pub fn int_type(&self) -> IntType {
        match self {
            RegisterValue::I8(_) => IntType::I8,
            RegisterValue::I16(_) => IntType::I16,
            RegisterValue::I32(_) => IntType::I32,
            RegisterValue::F32(_) => IntType::F32,
        }
    }
}

/// Mapping class: fixes the physical unit scales of the integer
/// encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Map {
    /// Raw integer, no scaling.
    Int,
    Position,
    Velocity,
    Torque,
    /// Dimensionless scale factors.
    Pwm,
    Voltage,
    Temperature,
    Time,
    Current,
}

impl Map {
    /// (i8, i16, i32) scales: one LSB in physical units.
    fn scales(&self) -> (f32, f32, f32) {
        match self {
            Map::Int => (1.0, 1.0, 1.0),
            Map::Position => (0.01, 0.0001, 0.00001),
            Map::Velocity => (0.1, 0.00025, 0.00001),
            Map::Torque => (0.5, 0.01, 0.001),
            Map::Pwm => (1.0 / 127.0, 1.0 / 32767.0, 1.0 / 2147483647.0),
            Map::Voltage => (0.5, 0.1, 0.001),
            Map::Temperature => (1.0, 0.1, 0.001),
            Map::Time => (0.01, 0.001, 0.000001),
            Map::Current => (1.0, 0.1, 0.001),
        }
    }
}

/// Encode a physical value to a typed wire value. NaN maps to the
/// type's minimum.
pub fn encode(value: f32, map: Map, int_type: IntType) -> RegisterValue {
    let (s8, s16, s32) = map.scales();
    match int_type {
        IntType::F32 => RegisterValue::F32(value),
        IntType::I8 => RegisterValue::I8(if value.is_nan() {
            i8::MIN
        } else {
            (value / s8) as i32 as i8
        }),
        IntType::I16 => RegisterValue::I16(if value.is_nan() {
            i16::MIN
        } else {
            (value / s16) as i32 as i16
        }),
        IntType::I32 => RegisterValue::I32(if value.is_nan() {
            i32::MIN
        } else {
            (value / s32) as i32
        }),
    }
}

/// Decode a wire value into a physical value.
pub fn decode(value: RegisterValue, map: Map) -> f32 {
    let (s8, s16, s32) = map.scales();
    match value {
        RegisterValue::F32(f) => f,
        RegisterValue::I8(i) => {
            if i == i8::MIN {
                f32::NAN
            } else {
                i as f32 * s8
            }
        }
        RegisterValue::I16(i) => {
            if i == i16::MIN {
                f32::NAN
            } else {
                i as f32 * s16
            }
        }
        RegisterValue::I32(i) => {
            if i == i32::MIN {
                f32::NAN
            } else {
                i as f32 * s32
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RegisterError {
    UnknownRegister,
    ReadOnly,
}

/// Side effects a write can request beyond storing the value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WriteEffect {
    None,
    /// The command mailbox must be republished.
    CommandTouched,
    /// A mode switch was requested.
    ModeRequested(Mode),
    /// The output position was re-seeded.
    OutputPositionSet(f32),
}

/// Borrowed view of everything the register file maps onto.
pub struct RegisterAccess<'a> {
    pub telemetry: &'a ControlCycle,
    pub command: &'a mut CommandData,
    pub config: &'a mut RuntimeConfig,
    pub config_dirty: &'a mut bool,
    pub firmware: &'a FirmwareInfo,
}

/// Read a register as its physical value plus mapping class.
pub fn read_register(access: &RegisterAccess, addr: u16) -> Result<(f32, Map), RegisterError> {
    use regs::*;
    let t = access.telemetry;
    let c = &*access.command;
    let cfg = &*access.config;
    Ok(match addr {
        MODE => (t.mode as u8 as f32, Map::Int),
        POSITION => (t.position, Map::Position),
        VELOCITY => (t.velocity, Map::Velocity),
        TORQUE => (t.torque_nm, Map::Torque),
        Q_CURRENT => (t.i_q_a, Map::Current),
        D_CURRENT => (t.i_d_a, Map::Current),
        ABS_POSITION => (t.position, Map::Position),
        MOTOR_TEMPERATURE => (t.motor_temp_c, Map::Temperature),
        VOLTAGE => (t.v_bus, Map::Voltage),
        TEMPERATURE => (t.fet_temp_c, Map::Temperature),
        FAULT => (t.fault as u8 as f32, Map::Int),

        COMMAND_POSITION => (c.position, Map::Position),
        COMMAND_VELOCITY => (c.velocity, Map::Velocity),
        COMMAND_FEEDFORWARD_TORQUE => (c.feedforward_torque, Map::Torque),
        COMMAND_KP_SCALE => (c.kp_scale, Map::Pwm),
        COMMAND_KD_SCALE => (c.kd_scale, Map::Pwm),
        COMMAND_MAX_TORQUE => (c.max_torque, Map::Torque),
        COMMAND_STOP_POSITION => (c.stop_position, Map::Position),
        COMMAND_WATCHDOG_TIMEOUT => (c.watchdog_timeout, Map::Time),
        COMMAND_VELOCITY_LIMIT => (c.velocity_limit, Map::Velocity),
        COMMAND_ACCEL_LIMIT => (c.accel_limit, Map::Velocity),
        COMMAND_Q_CURRENT => (c.i_q_a, Map::Current),
        COMMAND_D_CURRENT => (c.i_d_a, Map::Current),
        COMMAND_VOLTAGE => (c.voltage, Map::Voltage),
        COMMAND_VOLTAGE_THETA => (c.voltage_theta, Map::Pwm),

        CONFIG_POSITION_KP => (cfg.position_pid.kp, Map::Pwm),
        CONFIG_POSITION_KI => (cfg.position_pid.ki, Map::Pwm),
        CONFIG_POSITION_KD => (cfg.position_pid.kd, Map::Pwm),
        CONFIG_POSITION_ILIMIT => (cfg.position_pid.ilimit, Map::Torque),
        CONFIG_MAX_DESIRED_RATE => (cfg.position_pid.max_desired_rate, Map::Velocity),
        CONFIG_START_POSITION_LIMIT => (cfg.start_position_limit, Map::Position),
        CONFIG_DEFAULT_TIMEOUT => (cfg.default_timeout_s, Map::Time),
        CONFIG_POSITION_TIMEOUT => (cfg.position_timeout_s, Map::Time),

        CONFIG_CURRENT_KP => (cfg.current_loop.kp, Map::Pwm),
        CONFIG_CURRENT_KI => (cfg.current_loop.ki, Map::Pwm),
        CONFIG_DEADTIME_COMP => (cfg.current_loop.deadtime_comp_v, Map::Voltage),

        CONFIG_MAX_TORQUE => (cfg.limits.max_torque_nm, Map::Torque),
        CONFIG_MAX_VELOCITY => (cfg.limits.max_velocity, Map::Velocity),
        CONFIG_POSITION_MIN => (cfg.limits.position_min, Map::Position),
        CONFIG_POSITION_MAX => (cfg.limits.position_max, Map::Position),
        CONFIG_MAX_POWER => (cfg.limits.max_power_w, Map::Voltage),
        CONFIG_FIELD_WEAKEN_MAX => (cfg.limits.field_weaken_max_a, Map::Current),

        CONFIG_V_MIN => (cfg.safety.v_min, Map::Voltage),
        CONFIG_V_MAX => (cfg.safety.v_max, Map::Voltage),
        CONFIG_FET_DERATE_TEMP => (cfg.safety.fet_derate_temp_c, Map::Temperature),
        CONFIG_FET_FAULT_TEMP => (cfg.safety.fet_fault_temp_c, Map::Temperature),
        CONFIG_MOTOR_DERATE_TEMP => (cfg.safety.motor_derate_temp_c, Map::Temperature),
        CONFIG_MOTOR_FAULT_TEMP => (cfg.safety.motor_fault_temp_c, Map::Temperature),

        CONFIG_POLE_PAIRS => (cfg.motor.pole_pairs as f32, Map::Int),
        CONFIG_RESISTANCE => (cfg.motor.resistance_ohm, Map::Pwm),
        CONFIG_INDUCTANCE => (cfg.motor.inductance_h, Map::Pwm),
        CONFIG_TORQUE_CONSTANT => (cfg.motor.torque_constant, Map::Torque),
        CONFIG_CURRENT_CUTOFF => (cfg.motor.current_cutoff_a, Map::Current),
        CONFIG_CURRENT_SCALE => (cfg.motor.current_scale, Map::Pwm),
        CONFIG_TORQUE_SCALE => (cfg.motor.torque_scale, Map::Pwm),
        CONFIG_ROTOR_TO_OUTPUT => (cfg.position.rotor_to_output_ratio, Map::Pwm),
        CONFIG_PWM_RATE => (cfg.pwm_rate_hz as f32, Map::Int),

        FIRMWARE_VERSION => (access.firmware.abi_version as f32, Map::Int),
        HARDWARE_FAMILY => (access.firmware.hardware_family as f32, Map::Int),
        HARDWARE_REV => (access.firmware.hardware_rev as f32, Map::Int),

        _ => return Err(RegisterError::UnknownRegister),
    })
}

/// Write a register with a physical value.
pub fn write_register(
    access: &mut RegisterAccess,
    addr: u16,
    value: f32,
) -> Result<WriteEffect, RegisterError> {
    use regs::*;
    match addr {
        MODE => {
            let mode = Mode::from_u8(value as u8).ok_or(RegisterError::UnknownRegister)?;
            access.command.mode = mode;
            return Ok(WriteEffect::ModeRequested(mode));
        }
        ABS_POSITION => return Ok(WriteEffect::OutputPositionSet(value)),

        COMMAND_POSITION => access.command.position = value,
        COMMAND_VELOCITY => access.command.velocity = value,
        COMMAND_FEEDFORWARD_TORQUE => access.command.feedforward_torque = value,
        COMMAND_KP_SCALE => access.command.kp_scale = value,
        COMMAND_KD_SCALE => access.command.kd_scale = value,
        COMMAND_MAX_TORQUE => access.command.max_torque = value,
        COMMAND_STOP_POSITION => access.command.stop_position = value,
        COMMAND_WATCHDOG_TIMEOUT => access.command.watchdog_timeout = value,
        COMMAND_VELOCITY_LIMIT => access.command.velocity_limit = value,
        COMMAND_ACCEL_LIMIT => access.command.accel_limit = value,
        COMMAND_Q_CURRENT => access.command.i_q_a = value,
        COMMAND_D_CURRENT => access.command.i_d_a = value,
        COMMAND_VOLTAGE => access.command.voltage = value,
        COMMAND_VOLTAGE_THETA => access.command.voltage_theta = value,

        _ => {
            return write_config_register(access, addr, value);
        }
    }
    Ok(WriteEffect::CommandTouched)
}

fn write_config_register(
    access: &mut RegisterAccess,
    addr: u16,
    value: f32,
) -> Result<WriteEffect, RegisterError> {
    use regs::*;
    let cfg = &mut *access.config;
    match addr {
        CONFIG_POSITION_KP => cfg.position_pid.kp = value,
        CONFIG_POSITION_KI => cfg.position_pid.ki = value,
        CONFIG_POSITION_KD => cfg.position_pid.kd = value,
        CONFIG_POSITION_ILIMIT => cfg.position_pid.ilimit = value,
        CONFIG_MAX_DESIRED_RATE => cfg.position_pid.max_desired_rate = value,
        CONFIG_START_POSITION_LIMIT => cfg.start_position_limit = value,
        CONFIG_DEFAULT_TIMEOUT => cfg.default_timeout_s = value,
        CONFIG_POSITION_TIMEOUT => cfg.position_timeout_s = value,

        CONFIG_CURRENT_KP => cfg.current_loop.kp = value,
        CONFIG_CURRENT_KI => cfg.current_loop.ki = value,
        CONFIG_DEADTIME_COMP => cfg.current_loop.deadtime_comp_v = value,

        CONFIG_MAX_TORQUE => cfg.limits.max_torque_nm = value,
        CONFIG_MAX_VELOCITY => cfg.limits.max_velocity = value,
        CONFIG_POSITION_MIN => cfg.limits.position_min = value,
        CONFIG_POSITION_MAX => cfg.limits.position_max = value,
        CONFIG_MAX_POWER => cfg.limits.max_power_w = value,
        CONFIG_FIELD_WEAKEN_MAX => cfg.limits.field_weaken_max_a = value,

        CONFIG_V_MIN => cfg.safety.v_min = value,
        CONFIG_V_MAX => cfg.safety.v_max = value,
        CONFIG_FET_DERATE_TEMP => cfg.safety.fet_derate_temp_c = value,
        CONFIG_FET_FAULT_TEMP => cfg.safety.fet_fault_temp_c = value,
        CONFIG_MOTOR_DERATE_TEMP => cfg.safety.motor_derate_temp_c = value,
        CONFIG_MOTOR_FAULT_TEMP => cfg.safety.motor_fault_temp_c = value,

        CONFIG_POLE_PAIRS => {
            // The position subsystem scales mechanical to electrical
            // with the same constant; keep them in lock step.
            cfg.motor.pole_pairs = value as u8;
            cfg.position.pole_pairs = value as u8;
        }
        CONFIG_RESISTANCE => cfg.motor.resistance_ohm = value,
        CONFIG_INDUCTANCE => cfg.motor.inductance_h = value,
        CONFIG_TORQUE_CONSTANT => cfg.motor.torque_constant = value,
        CONFIG_CURRENT_CUTOFF => cfg.motor.current_cutoff_a = value,
        CONFIG_CURRENT_SCALE => cfg.motor.current_scale = value,
        CONFIG_TORQUE_SCALE => cfg.motor.torque_scale = value,
        CONFIG_ROTOR_TO_OUTPUT => cfg.position.rotor_to_output_ratio = value,
        CONFIG_PWM_RATE => cfg.pwm_rate_hz = value as u32,

        FIRMWARE_VERSION | HARDWARE_FAMILY | HARDWARE_REV | POSITION
        | VELOCITY | TORQUE | Q_CURRENT | D_CURRENT | MOTOR_TEMPERATURE | VOLTAGE
        | TEMPERATURE | FAULT => return Err(RegisterError::ReadOnly),

        _ => return Err(RegisterError::UnknownRegister),
    }
    *access.config_dirty = true;
    Ok(WriteEffect::None)
}

/// Name table for `tel get` / `conf set`.
pub const NAME_TABLE: &[(&str, u16)] = &[
    ("mode", regs::MODE),
    ("position", regs::POSITION),
    ("velocity", regs::VELOCITY),
    ("torque", regs::TORQUE),
    ("q_current", regs::Q_CURRENT),
    ("d_current", regs::D_CURRENT),
    ("voltage", regs::VOLTAGE),
    ("temperature", regs::TEMPERATURE),
    ("motor_temperature", regs::MOTOR_TEMPERATURE),
    ("fault", regs::FAULT),
    ("servo.pid_position.kp", regs::CONFIG_POSITION_KP),
    ("servo.pid_position.ki", regs::CONFIG_POSITION_KI),
    ("servo.pid_position.kd", regs::CONFIG_POSITION_KD),
    ("servo.pid_position.ilimit", regs::CONFIG_POSITION_ILIMIT),
    ("servo.max_desired_rate", regs::CONFIG_MAX_DESIRED_RATE),
    ("servo.start_position_limit", regs::CONFIG_START_POSITION_LIMIT),
    ("servo.default_timeout_s", regs::CONFIG_DEFAULT_TIMEOUT),
    ("servo.position_timeout_s", regs::CONFIG_POSITION_TIMEOUT),
    ("servo.pid_dq.kp", regs::CONFIG_CURRENT_KP),
    ("servo.pid_dq.ki", regs::CONFIG_CURRENT_KI),
    ("servo.deadtime_comp_v", regs::CONFIG_DEADTIME_COMP),
    ("servo.max_torque", regs::CONFIG_MAX_TORQUE),
    ("servo.max_velocity", regs::CONFIG_MAX_VELOCITY),
    ("servopos.position_min", regs::CONFIG_POSITION_MIN),
    ("servopos.position_max", regs::CONFIG_POSITION_MAX),
    ("servo.max_power_w", regs::CONFIG_MAX_POWER),
    ("servo.field_weaken_max_a", regs::CONFIG_FIELD_WEAKEN_MAX),
    ("servo.flux_brake_min_voltage", regs::CONFIG_V_MIN),
    ("servo.max_voltage", regs::CONFIG_V_MAX),
    ("servo.derate_temperature", regs::CONFIG_FET_DERATE_TEMP),
    ("servo.fault_temperature", regs::CONFIG_FET_FAULT_TEMP),
    ("servo.motor_derate_temperature", regs::CONFIG_MOTOR_DERATE_TEMP),
    ("servo.motor_fault_temperature", regs::CONFIG_MOTOR_FAULT_TEMP),
    ("motor.poles", regs::CONFIG_POLE_PAIRS),
    ("motor.resistance_ohm", regs::CONFIG_RESISTANCE),
    ("motor.inductance_h", regs::CONFIG_INDUCTANCE),
    ("motor.kt", regs::CONFIG_TORQUE_CONSTANT),
    ("motor.current_cutoff_a", regs::CONFIG_CURRENT_CUTOFF),
    ("motor.current_scale", regs::CONFIG_CURRENT_SCALE),
    ("motor.torque_scale", regs::CONFIG_TORQUE_SCALE),
    ("motor.rotor_to_output", regs::CONFIG_ROTOR_TO_OUTPUT),
    ("servo.pwm_rate_hz", regs::CONFIG_PWM_RATE),
    ("firmware.version", regs::FIRMWARE_VERSION),
];

pub fn lookup_name(name: &str) -> Option<u16> {
    NAME_TABLE
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, addr)| *addr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::FaultCode;

    fn fixture() -> (ControlCycle, CommandData, RuntimeConfig, bool, FirmwareInfo) {
        (
            ControlCycle::default(),
            CommandData::default(),
            RuntimeConfig::default(),
            false,
            FirmwareInfo::fixed([0x11111111, 0x22222222, 0x33333333]),
        )
    }

    #[test]
    fn test_encode_decode_round_trip() {
        for map in [Map::Position, Map::Velocity, Map::Torque, Map::Voltage] {
            for int_type in [IntType::I16, IntType::I32, IntType::F32] {
                let original = 1.25f32;
                let encoded = encode(original, map, int_type);
                let decoded = decode(encoded, map);
                assert!(
                    (decoded - original).abs() < 0.02,
                    "map={:?} type={:?} decoded={}",
                    map,
                    int_type,
                    decoded
                );
            }
        }
    }

    #[test]
    fn test_nan_maps_to_int_min() {
        assert_eq!(encode(f32::NAN, Map::Position, IntType::I8), RegisterValue::I8(i8::MIN));
        assert_eq!(
            encode(f32::NAN, Map::Position, IntType::I16),
            RegisterValue::I16(i16::MIN)
        );
        assert!(decode(RegisterValue::I16(i16::MIN), Map::Position).is_nan());
    }

    #[test]
    fn test_read_after_write_verbatim() {
        let (telemetry, mut command, mut config, mut dirty, firmware) = fixture();
        let mut access = RegisterAccess {
            telemetry: &telemetry,
            command: &mut command,
            config: &mut config,
            config_dirty: &mut dirty,
            firmware: &firmware,
        };
        // Every RW register in the command and config ranges.
        let rw: &[u16] = &[
            regs::COMMAND_POSITION,
            regs::COMMAND_VELOCITY,
            regs::COMMAND_FEEDFORWARD_TORQUE,
            regs::COMMAND_KP_SCALE,
            regs::COMMAND_MAX_TORQUE,
            regs::COMMAND_STOP_POSITION,
            regs::COMMAND_WATCHDOG_TIMEOUT,
            regs::CONFIG_POSITION_KP,
            regs::CONFIG_MAX_TORQUE,
            regs::CONFIG_V_MIN,
            regs::CONFIG_TORQUE_CONSTANT,
        ];
        for &addr in rw {
            write_register(&mut access, addr, 0.5).unwrap();
            let (value, _) = read_register(&access, addr).unwrap();
            assert_eq!(value, 0.5, "addr={:#x}", addr);
        }
    }

    #[test]
    fn test_config_write_sets_dirty() {
        let (telemetry, mut command, mut config, mut dirty, firmware) = fixture();
        let mut access = RegisterAccess {
            telemetry: &telemetry,
            command: &mut command,
            config: &mut config,
            config_dirty: &mut dirty,
            firmware: &firmware,
        };
        write_register(&mut access, regs::COMMAND_POSITION, 1.0).unwrap();
        assert!(!dirty);

        let mut access = RegisterAccess {
            telemetry: &telemetry,
            command: &mut command,
            config: &mut config,
            config_dirty: &mut dirty,
            firmware: &firmware,
        };
        write_register(&mut access, regs::CONFIG_POSITION_KP, 2.0).unwrap();
        assert!(dirty);
    }

    #[test]
    fn test_mode_write_requests_switch() {
        let (telemetry, mut command, mut config, mut dirty, firmware) = fixture();
        let mut access = RegisterAccess {
            telemetry: &telemetry,
            command: &mut command,
            config: &mut config,
            config_dirty: &mut dirty,
            firmware: &firmware,
        };
        let effect = write_register(&mut access, regs::MODE, Mode::Position as u8 as f32).unwrap();
        assert_eq!(effect, WriteEffect::ModeRequested(Mode::Position));
    }

    #[test]
    fn test_read_only_rejected() {
        let (telemetry, mut command, mut config, mut dirty, firmware) = fixture();
        let mut access = RegisterAccess {
            telemetry: &telemetry,
            command: &mut command,
            config: &mut config,
            config_dirty: &mut dirty,
            firmware: &firmware,
        };
        assert_eq!(
            write_register(&mut access, regs::FAULT, 0.0),
            Err(RegisterError::ReadOnly)
        );
        assert_eq!(
            write_register(&mut access, regs::FIRMWARE_VERSION, 0.0),
            Err(RegisterError::ReadOnly)
        );
    }

    #[test]
    fn test_fault_register_reads_code() {
        let (mut telemetry, mut command, mut config, mut dirty, firmware) = fixture();
        telemetry.fault = FaultCode::MotorDriverFault;
        let access = RegisterAccess {
            telemetry: &telemetry,
            command: &mut command,
            config: &mut config,
            config_dirty: &mut dirty,
            firmware: &firmware,
        };
        let (value, map) = read_register(&access, regs::FAULT).unwrap();
        assert_eq!(value, 33.0);
        assert_eq!(map, Map::Int);
    }

    #[test]
    fn test_unknown_register() {
        let (telemetry, mut command, mut config, mut dirty, firmware) = fixture();
        let access = RegisterAccess {
            telemetry: &telemetry,
            command: &mut command,
            config: &mut config,
            config_dirty: &mut dirty,
            firmware: &firmware,
        };
        assert_eq!(
            read_register(&access, 0x3FF),
            Err(RegisterError::UnknownRegister)
        );
    }

    #[test]
    fn test_name_lookup() {
        assert_eq!(lookup_name("mode"), Some(regs::MODE));
        assert_eq!(lookup_name("servo.pid_position.kp"), Some(regs::CONFIG_POSITION_KP));
        assert_eq!(lookup_name("bogus"), None);
    }
}
