//! Fault taxonomy shared by the control loop, the safety monitor, the
//! register file, and the CLI.
//!
//! Values 1..7 are transient peripheral conditions that are counted and
//! retried; values 32.. are latched faults that stop the motor and are
//! cleared only by an explicit stop command.

/// Every error condition the controller can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum FaultCode {
    Success = 0,

    DmaStreamTransfer = 1,
    DmaStreamFifo = 2,
    UartOverrun = 3,
    UartFraming = 4,
    UartNoise = 5,
    UartBufferOverrun = 6,
    UartParity = 7,

    CalibrationFault = 32,
    MotorDriverFault = 33,
    OverVoltage = 34,
    EncoderFault = 35,
    MotorNotConfigured = 36,
    PwmCycleOverrun = 37,
    OverTemperature = 38,
    StartOutsideLimit = 39,
    UnderVoltage = 40,
    ConfigChanged = 41,
    ThetaInvalid = 42,
    PositionInvalid = 43,
    DriverEnableFault = 44,
    TimingViolation = 46,
}

impl FaultCode {
    /// True for conditions that latch the controller into the fault
    /// mode until a stop command clears them.
    pub fn is_latched(&self) -> bool {
        (*self as u8) >= 32
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => FaultCode::Success,
            1 => FaultCode::DmaStreamTransfer,
            2 => FaultCode::DmaStreamFifo,
            3 => FaultCode::UartOverrun,
            4 => FaultCode::UartFraming,
            5 => FaultCode::UartNoise,
            6 => FaultCode::UartBufferOverrun,
            7 => FaultCode::UartParity,
            32 => FaultCode::CalibrationFault,
            33 => FaultCode::MotorDriverFault,
            34 => FaultCode::OverVoltage,
            35 => FaultCode::EncoderFault,
            36 => FaultCode::MotorNotConfigured,
            37 => FaultCode::PwmCycleOverrun,
            38 => FaultCode::OverTemperature,
            39 => FaultCode::StartOutsideLimit,
            40 => FaultCode::UnderVoltage,
            41 => FaultCode::ConfigChanged,
            42 => FaultCode::ThetaInvalid,
            43 => FaultCode::PositionInvalid,
            44 => FaultCode::DriverEnableFault,
            46 => FaultCode::TimingViolation,
            _ => return None,
        })
    }

    /// Short name used by `tel get fault` and error replies.
    pub fn as_str(&self) -> &'static str {
        match self {
            FaultCode::Success => "ok",
            FaultCode::DmaStreamTransfer => "dma stream transfer",
            FaultCode::DmaStreamFifo => "dma stream fifo",
            FaultCode::UartOverrun => "uart overrun",
            FaultCode::UartFraming => "uart framing",
            FaultCode::UartNoise => "uart noise",
            FaultCode::UartBufferOverrun => "uart buffer overrun",
            FaultCode::UartParity => "uart parity",
            FaultCode::CalibrationFault => "calibration fault",
            FaultCode::MotorDriverFault => "motor driver fault",
            FaultCode::OverVoltage => "over voltage",
            FaultCode::EncoderFault => "encoder fault",
            FaultCode::MotorNotConfigured => "motor not configured",
            FaultCode::PwmCycleOverrun => "pwm cycle overrun",
            FaultCode::OverTemperature => "over temperature",
            FaultCode::StartOutsideLimit => "start outside limit",
            FaultCode::UnderVoltage => "under voltage",
            FaultCode::ConfigChanged => "config changed",
            FaultCode::ThetaInvalid => "theta invalid",
            FaultCode::PositionInvalid => "position invalid",
            FaultCode::DriverEnableFault => "driver enable fault",
            FaultCode::TimingViolation => "timing violation",
        }
    }
}

impl Default for FaultCode {
    fn default() -> Self {
        FaultCode::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latched_split() {
        assert!(!FaultCode::Success.is_latched());
        assert!(!FaultCode::UartParity.is_latched());
        assert!(FaultCode::CalibrationFault.is_latched());
        assert!(FaultCode::TimingViolation.is_latched());
    }

    #[test]
    fn test_round_trip() {
        for raw in 0..=255u8 {
            if let Some(code) = FaultCode::from_u8(raw) {
                assert_eq!(code as u8, raw);
            }
        }
        // 45 was retired along with the deprecated stop-position fault.
        assert!(FaultCode::from_u8(45).is_none());
    }
}
