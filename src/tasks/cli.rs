//! Debug CLI task: line-buffered UART front end for the register
//! file, calibration, and config persistence.

use core::sync::atomic::Ordering;

use embassy_stm32::flash::{Blocking, Flash};
use embassy_stm32::mode::Async;
use embassy_stm32::usart::Uart;

use crate::cli::{self, CliAction, MAX_LINE};
use crate::config::storage;
use crate::registers::RegisterAccess;
use crate::state::{
    PositionRequest, CALIBRATION_RESULT, COMMAND_MAILBOX, CONFIG_DIRTY, CONFIG_SHARED,
    INDUCTANCE_RESULT, POSITION_REQUEST, TELEMETRY,
};
use crate::tasks::SharedServer;

#[embassy_executor::task]
pub async fn cli_task(
    mut uart: Uart<'static, Async>,
    mut flash: Flash<'static, Blocking>,
    server: &'static SharedServer,
) {
    info!("CLI started");

    let mut line = [0u8; MAX_LINE];
    let mut len = 0usize;

    loop {
        let mut byte = [0u8; 1];
        if uart.read(&mut byte).await.is_err() {
            continue;
        }
        match byte[0] {
            b'\r' | b'\n' => {
                if len == 0 {
                    continue;
                }
                let Ok(text) = core::str::from_utf8(&line[..len]) else {
                    len = 0;
                    let _ = uart.write(b"ERR invalid utf-8\r\n").await;
                    continue;
                };
                handle_line(text, &mut uart, &mut flash, server).await;
                len = 0;
            }
            byte => {
                if len < MAX_LINE {
                    line[len] = byte;
                    len += 1;
                }
            }
        }
    }
}

async fn handle_line(
    text: &str,
    uart: &mut Uart<'static, Async>,
    flash: &mut Flash<'static, Blocking>,
    server: &'static SharedServer,
) {
    let result = {
        let mut guard = server.lock().await;
        let state = &mut *guard;

        // Merge any calibration results the ISR has produced so a
        // following `conf write` persists them.
        if let Some(calibration) = CALIBRATION_RESULT.read() {
            state.config.calibration = calibration;
        }
        if let Some(inductance) = INDUCTANCE_RESULT.read() {
            state.config.motor.inductance_h = inductance;
        }

        let telemetry = TELEMETRY.latest();
        let mut access = RegisterAccess {
            telemetry: &telemetry,
            command: &mut state.command,
            config: &mut state.config,
            config_dirty: &mut state.config_dirty,
            firmware: &state.firmware,
        };
        cli::execute(text, &mut access)
    };

    match result {
        Ok(output) => {
            let mut guard = server.lock().await;
            let state = &mut *guard;
            match output.action {
                CliAction::None => {}
                CliAction::CommandUpdate => {
                    COMMAND_MAILBOX.publish(state.command);
                }
                CliAction::ModeRequest(_) => {
                    COMMAND_MAILBOX.publish(state.command);
                }
                CliAction::SetOutputPosition(position) => {
                    POSITION_REQUEST.publish(PositionRequest::SetOutputPositionNearest(position));
                }
                CliAction::RequireReindex => {
                    POSITION_REQUEST.publish(PositionRequest::RequireReindex);
                }
                CliAction::ConfigWrite => {
                    if let Err(e) = storage::write_to_flash(flash, &state.config) {
                        drop(guard);
                        let _ = uart.write(b"ERR flash write failed\r\n").await;
                        error!("conf write failed: {:?}", e);
                        return;
                    }
                }
                CliAction::ConfigLoad => {
                    state.config = storage::load_or_default(flash);
                    state.config_dirty = true;
                }
            }
            // The local flag tracks "changed since last publish"; the
            // atomic stays set until the ISR adopts the new config.
            if state.config_dirty {
                CONFIG_SHARED.write(Some(state.config));
                CONFIG_DIRTY.store(true, Ordering::Release);
                state.config_dirty = false;
            }
            drop(guard);

            if !output.response.is_empty() {
                let _ = uart.write(output.response.as_bytes()).await;
            }
            let _ = uart.write(b"OK\r\n").await;
        }
        Err(message) => {
            let _ = uart.write(b"ERR ").await;
            let _ = uart.write(message.as_bytes()).await;
            let _ = uart.write(b"\r\n").await;
        }
    }
}
