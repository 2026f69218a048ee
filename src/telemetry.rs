//! Per-cycle control snapshot.
//!
//! Assembled piecewise during the ISR and published whole at ISR exit;
//! the register file and the CLI read the last published copy.

use crate::control::Mode;
use crate::errors::FaultCode;
use crate::foc::PwmDuties;

/// Everything the host can observe about one control cycle.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ControlCycle {
    pub timestamp_us: u32,

    /// Unfiltered phase currents (A).
    pub i_abc: (f32, f32, f32),
    /// Filtered copy for protection/telemetry.
    pub i_abc_filtered: (f32, f32, f32),
    pub v_bus: f32,
    pub fet_temp_c: f32,
    pub motor_temp_c: f32,

    /// Electrical angle used for commutation this cycle (rad).
    pub electrical_theta: f32,
    pub i_d_a: f32,
    pub i_q_a: f32,
    pub i_d_ref_a: f32,
    pub i_q_ref_a: f32,
    pub v_d: f32,
    pub v_q: f32,
    pub duties: PwmDuties,

    pub position: f32,
    pub velocity: f32,
    pub torque_nm: f32,

    pub mode: Mode,
    pub fault: FaultCode,

    /// Previous ISR runtime in timer cycles (budget check input).
    pub isr_cycles: u32,
}

impl ControlCycle {
    /// Const zero-state for static ring initialization.
    pub const fn new_const() -> Self {
        Self {
            timestamp_us: 0,
            i_abc: (0.0, 0.0, 0.0),
            i_abc_filtered: (0.0, 0.0, 0.0),
            v_bus: 0.0,
            fet_temp_c: 0.0,
            motor_temp_c: f32::NAN,
            electrical_theta: 0.0,
            i_d_a: 0.0,
            i_q_a: 0.0,
            i_d_ref_a: 0.0,
            i_q_ref_a: 0.0,
            v_d: 0.0,
            v_q: 0.0,
            duties: PwmDuties { a: 0.0, b: 0.0, c: 0.0 },
            position: 0.0,
            velocity: 0.0,
            torque_nm: 0.0,
            mode: Mode::Stopped,
            fault: FaultCode::Success,
            isr_cycles: 0,
        }
    }
}

impl Default for ControlCycle {
    fn default() -> Self {
        Self {
            timestamp_us: 0,
            i_abc: (0.0, 0.0, 0.0),
            i_abc_filtered: (0.0, 0.0, 0.0),
            v_bus: 0.0,
            fet_temp_c: 0.0,
            motor_temp_c: f32::NAN,
            electrical_theta: 0.0,
            i_d_a: 0.0,
            i_q_a: 0.0,
            i_d_ref_a: 0.0,
            i_q_ref_a: 0.0,
            v_d: 0.0,
            v_q: 0.0,
            duties: Default::default(),
            position: 0.0,
            velocity: 0.0,
            torque_nm: 0.0,
            mode: Mode::Stopped,
            fault: FaultCode::Success,
            isr_cycles: 0,
        }
    }
}
