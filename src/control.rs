// Outer control: mode machine, position PID, setpoint generation, and
// the calibration sequencers.

pub mod calibration;
pub mod modes;
pub mod outer;
pub mod pid;

pub use calibration::{
    CurrentOffsetCalibration, EncoderCalibration, InductanceMeasurement, COMMUTATION_TABLE_LEN,
};
pub use modes::{validate_entry, CommandData, Entry, EntryChecks, Mode, Watchdog};
pub use outer::{LoopCommand, Measured, OuterLimits, OuterLoop, OuterOutput};
pub use pid::{ApplyOptions, PidConfig, PidState};
