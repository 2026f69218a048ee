//! Safety and fault monitoring.
//!
//! `FaultMonitor::check` runs in the ISR every cycle, in priority
//! order; the first failing check wins and is latched by the mode
//! machine. Voltage checks carry 0.2 V of hysteresis so a rail sitting
//! on a threshold cannot flap, and the thermal path provides a linear
//! derate band below the hard cutoff.

use crate::errors::FaultCode;

pub const VOLTAGE_HYSTERESIS: f32 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SafetyConfig {
    pub v_min: f32,
    pub v_max: f32,
    /// FET temperature where torque derating starts / where we fault.
    pub fet_derate_temp_c: f32,
    pub fet_fault_temp_c: f32,
    pub motor_derate_temp_c: f32,
    pub motor_fault_temp_c: f32,
    /// Fraction of the PWM period the ISR may consume.
    pub max_isr_fraction: f32,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            v_min: 10.0,
            v_max: 44.0,
            fet_derate_temp_c: 50.0,
            fet_fault_temp_c: 75.0,
            motor_derate_temp_c: 100.0,
            motor_fault_temp_c: 120.0,
            max_isr_fraction: 0.9,
        }
    }
}

/// Everything the monitor needs from the current cycle.
#[derive(Debug, Clone, Copy, Default)]
pub struct SafetyInputs {
    /// Pre-driver nFAULT pin asserted.
    pub driver_fault: bool,
    pub v_bus: f32,
    pub fet_temp_c: f32,
    /// NaN when no motor thermistor is fitted.
    pub motor_temp_c: f32,
    /// The active mode commutates from theta.
    pub theta_required: bool,
    pub theta_valid: bool,
    /// The active mode consumes the output position.
    pub position_required: bool,
    pub position_valid: bool,
    /// Why the position subsystem invalidated itself (Success when it
    /// did not). An encoder-chain failure is its own check, ranked
    /// below the cycle-overrun gate but replacing the generic
    /// theta/position codes.
    pub position_fault: FaultCode,
    /// Previous ISR runtime, in timer counts, against the budget.
    pub isr_cycles: u32,
    pub pwm_period_cycles: u32,
}

pub struct FaultMonitor {
    config: SafetyConfig,
    under_voltage: bool,
    over_voltage: bool,
}

impl FaultMonitor {
    pub fn new(config: SafetyConfig) -> Self {
        Self {
            config,
            under_voltage: false,
            over_voltage: false,
        }
    }

    /// Priority-ordered checks; the first hit is returned.
    pub fn check(&mut self, inputs: &SafetyInputs) -> Option<FaultCode> {
        if inputs.driver_fault {
            return Some(FaultCode::MotorDriverFault);
        }

        self.update_voltage_flags(inputs.v_bus);
        if self.under_voltage {
            return Some(FaultCode::UnderVoltage);
        }
        if self.over_voltage {
            return Some(FaultCode::OverVoltage);
        }

        if inputs.fet_temp_c > self.config.fet_fault_temp_c {
            return Some(FaultCode::OverTemperature);
        }
        if !inputs.motor_temp_c.is_nan() && inputs.motor_temp_c > self.config.motor_fault_temp_c {
            return Some(FaultCode::OverTemperature);
        }

        // An encoder-chain failure is checked separately below; here
        // only the generic validity gates fire.
        let encoder_dead = inputs.position_fault == FaultCode::EncoderFault;
        if inputs.theta_required && !inputs.theta_valid && !encoder_dead {
            return Some(FaultCode::ThetaInvalid);
        }
        if inputs.position_required && !inputs.position_valid && !encoder_dead {
            return Some(FaultCode::PositionInvalid);
        }

        if inputs.pwm_period_cycles > 0 {
            let budget =
                (inputs.pwm_period_cycles as f32 * self.config.max_isr_fraction) as u32;
            if inputs.isr_cycles > budget {
                return Some(FaultCode::PwmCycleOverrun);
            }
        }

        if (inputs.theta_required || inputs.position_required) && encoder_dead {
            return Some(FaultCode::EncoderFault);
        }

        None
    }

    /// True while the bus is inside [v_min, v_max] (with hysteresis);
    /// gates mode entry.
    pub fn voltage_ok(&self) -> bool {
        !self.under_voltage && !self.over_voltage
    }

    /// Thermal torque derating factor in [0, 1]: 1 below the derate
    /// temperature, linear to 0 at the fault temperature.
    pub fn derate(&self, fet_temp_c: f32, motor_temp_c: f32) -> f32 {
        let fet = derate_band(
            fet_temp_c,
            self.config.fet_derate_temp_c,
            self.config.fet_fault_temp_c,
        );
        let motor = if motor_temp_c.is_nan() {
            1.0
        } else {
            derate_band(
                motor_temp_c,
                self.config.motor_derate_temp_c,
                self.config.motor_fault_temp_c,
            )
        };
        fet.min(motor)
    }

    fn update_voltage_flags(&mut self, v_bus: f32) {
        if self.under_voltage {
            if v_bus > self.config.v_min + VOLTAGE_HYSTERESIS {
                self.under_voltage = false;
            }
        } else if v_bus < self.config.v_min {
            self.under_voltage = true;
        }

        if self.over_voltage {
            if v_bus < self.config.v_max - VOLTAGE_HYSTERESIS {
                self.over_voltage = false;
            }
        } else if v_bus > self.config.v_max {
            self.over_voltage = true;
        }
    }
}

fn derate_band(temp: f32, start: f32, end: f32) -> f32 {
    if temp <= start {
        1.0
    } else if temp >= end {
        0.0
    } else {
        (end - temp) / (end - start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nominal() -> SafetyInputs {
        SafetyInputs {
            v_bus: 24.0,
            fet_temp_c: 30.0,
            motor_temp_c: f32::NAN,
            theta_valid: true,
            position_valid: true,
            position_fault: FaultCode::Success,
            pwm_period_cycles: 5666,
            ..Default::default()
        }
    }

    #[test]
    fn test_nominal_passes() {
        let mut monitor = FaultMonitor::new(Default::default());
        assert_eq!(monitor.check(&nominal()), None);
        assert!(monitor.voltage_ok());
    }

    #[test]
    fn test_driver_fault_first() {
        let mut monitor = FaultMonitor::new(Default::default());
        let inputs = SafetyInputs {
            driver_fault: true,
            v_bus: 0.0, // would also be undervoltage
            ..nominal()
        };
        assert_eq!(monitor.check(&inputs), Some(FaultCode::MotorDriverFault));
    }

    #[test]
    fn test_undervoltage_hysteresis() {
        let mut monitor = FaultMonitor::new(Default::default());
        let mut inputs = nominal();

        inputs.v_bus = 9.9;
        assert_eq!(monitor.check(&inputs), Some(FaultCode::UnderVoltage));

        // Back above the threshold but inside the hysteresis band:
        // still under-voltage, no flap.
        inputs.v_bus = 10.05;
        assert_eq!(monitor.check(&inputs), Some(FaultCode::UnderVoltage));

        inputs.v_bus = 10.3;
        assert_eq!(monitor.check(&inputs), None);
    }

    #[test]
    fn test_overvoltage() {
        let mut monitor = FaultMonitor::new(Default::default());
        let mut inputs = nominal();
        inputs.v_bus = 44.5;
        assert_eq!(monitor.check(&inputs), Some(FaultCode::OverVoltage));
    }

    #[test]
    fn test_over_temperature() {
        let mut monitor = FaultMonitor::new(Default::default());
        let mut inputs = nominal();
        inputs.fet_temp_c = 80.0;
        assert_eq!(monitor.check(&inputs), Some(FaultCode::OverTemperature));

        inputs.fet_temp_c = 30.0;
        inputs.motor_temp_c = 130.0;
        assert_eq!(monitor.check(&inputs), Some(FaultCode::OverTemperature));
    }

    #[test]
    fn test_theta_and_position_gates() {
        let mut monitor = FaultMonitor::new(Default::default());
        let mut inputs = nominal();
        inputs.theta_required = true;
        inputs.theta_valid = false;
        assert_eq!(monitor.check(&inputs), Some(FaultCode::ThetaInvalid));

        inputs.theta_valid = true;
        inputs.position_required = true;
        inputs.position_valid = false;
        assert_eq!(monitor.check(&inputs), Some(FaultCode::PositionInvalid));

        // Not required: no fault.
        inputs.position_required = false;
        assert_eq!(monitor.check(&inputs), None);
    }

    #[test]
    fn test_encoder_fault_outranks_theta_invalid() {
        let mut monitor = FaultMonitor::new(Default::default());
        let mut inputs = nominal();
        inputs.theta_required = true;
        inputs.theta_valid = false;
        inputs.position_fault = FaultCode::EncoderFault;
        assert_eq!(monitor.check(&inputs), Some(FaultCode::EncoderFault));
    }

    #[test]
    fn test_overrun_outranks_encoder_fault() {
        // A cycle where the encoder chain died AND the previous ISR
        // blew its budget: the overrun check ranks higher.
        let mut monitor = FaultMonitor::new(Default::default());
        let mut inputs = nominal();
        inputs.theta_required = true;
        inputs.theta_valid = false;
        inputs.position_fault = FaultCode::EncoderFault;
        inputs.isr_cycles = 5200; // > 90 % of 5666
        assert_eq!(monitor.check(&inputs), Some(FaultCode::PwmCycleOverrun));
    }

    #[test]
    fn test_isr_overrun() {
        let mut monitor = FaultMonitor::new(Default::default());
        let mut inputs = nominal();
        inputs.isr_cycles = 5200; // > 90 % of 5666
        assert_eq!(monitor.check(&inputs), Some(FaultCode::PwmCycleOverrun));
    }

    #[test]
    fn test_derate_band() {
        let monitor = FaultMonitor::new(Default::default());
        assert_eq!(monitor.derate(40.0, f32::NAN), 1.0);
        let mid = monitor.derate(62.5, f32::NAN);
        assert!((mid - 0.5).abs() < 1e-6);
        assert_eq!(monitor.derate(80.0, f32::NAN), 0.0);
    }
}
