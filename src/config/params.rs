//! Default configuration values.

/// Control/PWM rate (both loops run at the PWM rate).
pub const DEFAULT_PWM_RATE_HZ: u32 = 30_000;

/// Supported PWM rate window.
pub const MIN_PWM_RATE_HZ: u32 = 15_000;
pub const MAX_PWM_RATE_HZ: u32 = 60_000;

/// Position loop gains (Nm per turn / per turn-second).
pub const DEFAULT_POSITION_KP: f32 = 4.0;
pub const DEFAULT_POSITION_KI: f32 = 1.0;
pub const DEFAULT_POSITION_KD: f32 = 0.05;
pub const DEFAULT_POSITION_ILIMIT: f32 = 0.0;

/// Torque model defaults for an unconfigured motor.
pub const DEFAULT_TORQUE_CONSTANT: f32 = 0.0;
pub const DEFAULT_CURRENT_CUTOFF_A: f32 = 20.0;
pub const DEFAULT_CURRENT_SCALE: f32 = 0.3;
pub const DEFAULT_TORQUE_SCALE: f32 = 0.6;

/// Command watchdog default and the zero-velocity dwell before the
/// controller releases to stopped.
pub const DEFAULT_WATCHDOG_TIMEOUT_S: f32 = 0.1;
pub const DEFAULT_POSITION_TIMEOUT_S: f32 = 10.0;

/// Current-offset calibration length (cycles at 50 % duty).
pub const CURRENT_CAL_SETTLE_CYCLES: u32 = 128;
pub const CURRENT_CAL_SAMPLES: u32 = 256;

/// Encoder calibration drive voltage and electrical sweep rate.
pub const ENCODER_CAL_VOLTAGE: f32 = 1.0;
pub const ENCODER_CAL_RATE_RAD_S: f32 = 20.0;

/// Inductance measurement excitation.
pub const INDUCTANCE_VOLTAGE: f32 = 2.0;
pub const INDUCTANCE_HALF_PERIOD_CYCLES: u32 = 16;
pub const INDUCTANCE_PERIODS: u32 = 32;

/// Pre-driver enable settle time before gates may switch.
pub const DRIVER_ENABLE_DELAY_MS: u64 = 2;

pub mod pwm {
    /// TIM1 dead-time register value (~200 ns at 170 MHz).
    pub const DEFAULT_DEAD_TIME: u16 = 34;
}

pub mod can {
    /// Nominal / data bitrates (FDCAN with BRS).
    pub const DEFAULT_BITRATE: u32 = 1_000_000;
    pub const DEFAULT_DATA_BITRATE: u32 = 5_000_000;
}

pub const DEFAULT_CAN_ADDRESS: u8 = 1;
pub const DEFAULT_CAN_PREFIX: u16 = 0x0000;

/// Background encoder poll cadence.
pub const DEFAULT_UART_POLL_RATE_US: u32 = 200;
pub const DEFAULT_I2C_POLL_RATE_US: u32 = 500;
