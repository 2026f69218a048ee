// FOC (Field Oriented Control) module
// Synchronous-frame current control for the BLDC servo loop.

pub mod current_loop;
pub mod pi_controller;
pub mod svpwm;
pub mod torque_model;
pub mod transforms;

pub use current_loop::{CurrentLoop, CurrentLoopConfig, CurrentLoopOutput};
pub use pi_controller::PiController;
pub use svpwm::{calculate_svpwm, PwmDuties};
pub use torque_model::TorqueModel;
pub use transforms::{
    clarke, inverse_clarke, inverse_park, park, sin_cos, wrap_half_rad, wrap_tau,
};
