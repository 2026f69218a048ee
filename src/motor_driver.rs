//! Pre-driver and power-stage interface (DRV8323 + TIM1).
//!
//! Owns the complementary PWM timer, the pre-driver enable line, and
//! the nFAULT input. Everything the control loop does to the power
//! stage goes through here; only the ISR context touches it after
//! bring-up.

use embassy_stm32::gpio::{Input, Output};
use embassy_stm32::peripherals::TIM1;
use embassy_stm32::timer::complementary_pwm::ComplementaryPwm;
use embassy_stm32::timer::Channel;

use crate::foc::PwmDuties;

pub struct MotorDriver {
    pwm: ComplementaryPwm<'static, TIM1>,
    enable: Output<'static>,
    fault_n: Input<'static>,
    max_duty: u16,
    outputs_on: bool,
}

impl MotorDriver {
    pub fn new(
        pwm: ComplementaryPwm<'static, TIM1>,
        enable: Output<'static>,
        fault_n: Input<'static>,
    ) -> Self {
        let max_duty = pwm.get_max_duty();
        Self {
            pwm,
            enable,
            fault_n,
            max_duty,
            outputs_on: false,
        }
    }

    /// PWM timer period in timer counts (the ISR budget reference).
    pub fn period_counts(&self) -> u16 {
        self.max_duty
    }

    /// Raise the pre-driver enable line. Gates stay off until
    /// `enable_outputs`.
    pub fn enable_driver(&mut self) {
        self.enable.set_high();
    }

    /// Drop the enable line; the pre-driver goes to sleep.
    pub fn disable_driver(&mut self) {
        self.stop();
        self.enable.set_low();
    }

    /// nFAULT is active low.
    pub fn fault_asserted(&self) -> bool {
        self.fault_n.is_low()
    }

    /// Write the three duties for the next PWM reload.
    pub fn write_duties(&mut self, duties: &PwmDuties) {
        if !self.outputs_on {
            self.pwm.enable(Channel::Ch1);
            self.pwm.enable(Channel::Ch2);
            self.pwm.enable(Channel::Ch3);
            self.outputs_on = true;
        }
        let scale = self.max_duty as f32;
        self.pwm
            .set_duty(Channel::Ch1, (duties.a * scale) as u16);
        self.pwm
            .set_duty(Channel::Ch2, (duties.b * scale) as u16);
        self.pwm
            .set_duty(Channel::Ch3, (duties.c * scale) as u16);
    }

    /// Short all three phases to ground (dynamic brake): low sides on
    /// continuously.
    pub fn brake(&mut self) {
        if !self.outputs_on {
            self.pwm.enable(Channel::Ch1);
            self.pwm.enable(Channel::Ch2);
            self.pwm.enable(Channel::Ch3);
            self.outputs_on = true;
        }
        self.pwm.set_duty(Channel::Ch1, 0);
        self.pwm.set_duty(Channel::Ch2, 0);
        self.pwm.set_duty(Channel::Ch3, 0);
    }

    /// All gates off (high-Z), duties zeroed.
    pub fn stop(&mut self) {
        self.pwm.set_duty(Channel::Ch1, 0);
        self.pwm.set_duty(Channel::Ch2, 0);
        self.pwm.set_duty(Channel::Ch3, 0);
        self.pwm.disable(Channel::Ch1);
        self.pwm.disable(Channel::Ch2);
        self.pwm.disable(Channel::Ch3);
        self.outputs_on = false;
    }
}
