//! FDCAN register server task.
//!
//! Two concurrent concerns in one select loop: register-protocol
//! frames addressed to this node are applied and answered with the
//! source/destination swapped, and a 100 ms ticker broadcasts a status
//! frame (mode, position block, voltage/temperature, fault) to the
//! host address. Command and config changes are forwarded to the ISR
//! through the mailboxes.

use core::sync::atomic::Ordering;

use embassy_futures::select::{select, Either};
use embassy_stm32::can;
use embassy_time::{Duration, Ticker};
use embedded_can::Id;

use crate::protocol;
use crate::registers::RegisterAccess;
use crate::state::{
    PositionRequest, COMMAND_MAILBOX, CONFIG_DIRTY, CONFIG_SHARED, POSITION_REQUEST, TELEMETRY,
};
use crate::tasks::SharedServer;

/// Destination of unsolicited status frames.
const HOST_ADDRESS: u8 = 0;

#[embassy_executor::task]
pub async fn can_task(can: can::Can<'static>, server: &'static SharedServer) {
    let (mut tx, mut rx, _properties) = can.split();

    info!("CAN register server started");

    let mut status_ticker = Ticker::every(Duration::from_millis(100));

    loop {
        match select(rx.read_fd(), status_ticker.next()).await {
            Either::First(Ok(envelope)) => {
                handle_frame(&mut tx, envelope, server).await;
            }
            Either::First(Err(e)) => {
                error!("CAN RX error: {:?}", e);
            }
            Either::Second(()) => {
                let (payload, reply_id) = {
                    let mut guard = server.lock().await;
                    let state = &mut *guard;
                    let telemetry = TELEMETRY.latest();
                    let access = RegisterAccess {
                        telemetry: &telemetry,
                        command: &mut state.command,
                        config: &mut state.config,
                        config_dirty: &mut state.config_dirty,
                        firmware: &state.firmware,
                    };
                    let payload = protocol::build_status_payload(&access);
                    let reply_id = protocol::encode_id(
                        state.config.can_prefix,
                        state.config.can_address,
                        HOST_ADDRESS,
                    );
                    (payload, reply_id)
                };
                send_payload(&mut tx, reply_id, &payload).await;
            }
        }
    }
}

async fn handle_frame(
    tx: &mut can::CanTx<'static>,
    envelope: can::frame::FdEnvelope,
    server: &'static SharedServer,
) {
    let frame = envelope.frame;
    let raw_id = match frame.header().id() {
        Id::Extended(id) => id.as_raw(),
        // Standard-id traffic is not ours.
        Id::Standard(_) => return,
    };
    let (prefix, source, destination) = protocol::decode_id(raw_id);

    let (reply, our_prefix, our_address) = {
        let mut guard = server.lock().await;
        let state = &mut *guard;
        if destination != state.config.can_address || prefix != state.config.can_prefix {
            return;
        }

        let telemetry = TELEMETRY.latest();
        let mut access = RegisterAccess {
            telemetry: &telemetry,
            command: &mut state.command,
            config: &mut state.config,
            config_dirty: &mut state.config_dirty,
            firmware: &state.firmware,
        };
        let (reply, effects) = protocol::process_frame(frame.data(), &mut access);

        // Forward the effects to the ISR. The local flag tracks
        // "changed since last publish"; the atomic stays set until
        // the ISR adopts the new config.
        if state.config_dirty {
            CONFIG_SHARED.write(Some(state.config));
            CONFIG_DIRTY.store(true, Ordering::Release);
            state.config_dirty = false;
        }
        if effects.command_touched || effects.mode_request.is_some() {
            COMMAND_MAILBOX.publish(state.command);
        }
        if let Some(position) = effects.output_position_set {
            POSITION_REQUEST.publish(PositionRequest::SetOutputPosition(position));
        }

        (reply, state.config.can_prefix, state.config.can_address)
    };

    if reply.is_empty() {
        return;
    }

    // Swap source/destination; keep our prefix.
    let reply_id = protocol::encode_id(our_prefix, our_address, source);
    send_payload(tx, reply_id, &reply).await;
}

/// Pad to the next valid DLC with the NOP byte and transmit.
async fn send_payload(tx: &mut can::CanTx<'static>, reply_id: u32, payload: &[u8]) {
    let padded_len = protocol::round_up_dlc(payload.len());
    let mut padded = [protocol::PAD_BYTE; protocol::MAX_PAYLOAD];
    padded[..payload.len()].copy_from_slice(payload);

    match can::frame::FdFrame::new_extended(reply_id, &padded[..padded_len]) {
        Ok(frame) => {
            let _ = tx.write_fd(&frame).await;
        }
        Err(_) => {
            error!("frame construction failed, len={}", padded_len);
        }
    }
}
