//! Background tasks.

pub mod can;
pub mod cli;
pub mod encoder_poll;
pub mod led;

pub use can::can_task;
pub use cli::cli_task;
pub use encoder_poll::encoder_poll_task;
pub use led::led_task;

use embassy_sync::blocking_mutex::raw::ThreadModeRawMutex;
use embassy_sync::mutex::Mutex;

use crate::config::RuntimeConfig;
use crate::control::CommandData;
use crate::firmware_info::FirmwareInfo;

/// Background-side server state shared by the CAN and CLI front ends.
/// Changes flow to the ISR only through the mailboxes and the shared
/// config slot in `state`.
pub struct ServerState {
    pub config: RuntimeConfig,
    pub command: CommandData,
    pub config_dirty: bool,
    pub firmware: FirmwareInfo,
}

pub type SharedServer = Mutex<ThreadModeRawMutex, ServerState>;
