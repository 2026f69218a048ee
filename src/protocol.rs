//! Bus register protocol: the subframe stream carried in FDCAN
//! payloads.
//!
//! A payload is a sequence of subframes {opcode, [count], varuint
//! start register, values...}. Writes are applied in frame order;
//! reads accumulate reply subframes which are sent in a single
//! response frame after the whole payload has been processed.

use heapless::Vec;

use crate::control::Mode;
use crate::registers::{
    decode, encode, read_register, regs, write_register, IntType, RegisterAccess, RegisterError,
    RegisterValue, WriteEffect,
};

/// Valid FDCAN payload sizes.
pub const DLC_SIZES: [usize; 16] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 12, 16, 20, 24, 32, 48, 64];

/// Padding byte; decodes as NOP so padded frames parse cleanly.
pub const PAD_BYTE: u8 = 0x50;

pub const MAX_PAYLOAD: usize = 64;

// Subframe opcode bases; low two bits carry an inline count of 1..3,
// or 0 meaning an explicit count byte follows. Writes occupy
// 0x00..0x0f.
const READ_BASE: u8 = 0x10;
const REPLY_BASE: u8 = 0x20;
const WRITE_ERROR: u8 = 0x30;
const READ_ERROR: u8 = 0x31;
const NOP: u8 = 0x50;

// Error codes carried in error subframes.
const ERR_UNKNOWN_REGISTER: u8 = 1;
const ERR_READ_ONLY: u8 = 2;
const ERR_OVERFLOW: u8 = 3;

/// Round a payload length up to the next valid DLC size.
pub fn round_up_dlc(len: usize) -> usize {
    for &size in DLC_SIZES.iter() {
        if size >= len {
            return size;
        }
    }
    MAX_PAYLOAD
}

/// CAN id layout: (prefix << 16) | (source << 8) | destination.
pub fn encode_id(prefix: u16, source: u8, destination: u8) -> u32 {
    ((prefix as u32) << 16) | ((source as u32) << 8) | destination as u32
}

pub fn decode_id(id: u32) -> (u16, u8, u8) {
    ((id >> 16) as u16, (id >> 8) as u8, id as u8)
}

/// Append a varuint (7-bit groups, LSB first, high bit = continue).
pub fn write_varuint(out: &mut Vec<u8, MAX_PAYLOAD>, mut value: u32) -> Result<(), ()> {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte).map_err(|_| ())?;
        if value == 0 {
            return Ok(());
        }
    }
}

/// Read a varuint; advances the cursor.
pub fn read_varuint(data: &[u8], cursor: &mut usize) -> Option<u32> {
    let mut value: u32 = 0;
    let mut shift = 0;
    loop {
        let byte = *data.get(*cursor)?;
        *cursor += 1;
        value |= ((byte & 0x7F) as u32) << shift;
        if byte & 0x80 == 0 {
            return Some(value);
        }
        shift += 7;
        if shift > 28 {
            return None;
        }
    }
}

fn int_type_of(opcode: u8) -> IntType {
    match (opcode >> 2) & 0x03 {
        0 => IntType::I8,
        1 => IntType::I16,
        2 => IntType::I32,
        _ => IntType::F32,
    }
}

fn width(int_type: IntType) -> usize {
    match int_type {
        IntType::I8 => 1,
        IntType::I16 => 2,
        IntType::I32 | IntType::F32 => 4,
    }
}

fn type_code(int_type: IntType) -> u8 {
    match int_type {
        IntType::I8 => 0,
        IntType::I16 => 1,
        IntType::I32 => 2,
        IntType::F32 => 3,
    }
}

fn read_value(data: &[u8], cursor: &mut usize, int_type: IntType) -> Option<RegisterValue> {
    let w = width(int_type);
    if *cursor + w > data.len() {
        return None;
    }
    let bytes = &data[*cursor..*cursor + w];
    *cursor += w;
    Some(match int_type {
        IntType::I8 => RegisterValue::I8(bytes[0] as i8),
        IntType::I16 => RegisterValue::I16(i16::from_le_bytes([bytes[0], bytes[1]])),
        IntType::I32 => RegisterValue::I32(i32::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3],
        ])),
        IntType::F32 => RegisterValue::F32(f32::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3],
        ])),
    })
}

fn push_value(out: &mut Vec<u8, MAX_PAYLOAD>, value: RegisterValue) -> Result<(), ()> {
    let result = match value {
        RegisterValue::I8(v) => out.push(v as u8).map_err(|_| ()),
        RegisterValue::I16(v) => out.extend_from_slice(&v.to_le_bytes()).map_err(|_| ()),
        RegisterValue::I32(v) => out.extend_from_slice(&v.to_le_bytes()).map_err(|_| ()),
        RegisterValue::F32(v) => out.extend_from_slice(&v.to_le_bytes()).map_err(|_| ()),
    };
    result
}

fn push_error(out: &mut Vec<u8, MAX_PAYLOAD>, opcode: u8, register: u32, code: u8) {
    // Best effort: if even the error subframe does not fit, drop it.
    let mut scratch: Vec<u8, MAX_PAYLOAD> = Vec::new();
    if scratch.push(opcode).is_ok()
        && write_varuint(&mut scratch, register).is_ok()
        && scratch.push(code).is_ok()
        && out.len() + scratch.len() <= MAX_PAYLOAD
    {
        let _ = out.extend_from_slice(&scratch);
    }
}

/// Side effects of one processed frame, for the transport task to act
/// on.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameEffects {
    /// Any command-block register was written: republish the mailbox.
    pub command_touched: bool,
    pub mode_request: Option<Mode>,
    pub output_position_set: Option<f32>,
}

/// Process one payload and build the reply payload.
///
/// Writes take effect immediately in frame order; replies (including
/// error subframes) are accumulated and returned for transmission in
/// one response frame. A reply that would exceed 64 bytes is truncated
/// with an overflow error subframe.
pub fn process_frame(
    payload: &[u8],
    access: &mut RegisterAccess,
) -> (Vec<u8, MAX_PAYLOAD>, FrameEffects) {
    let mut reply: Vec<u8, MAX_PAYLOAD> = Vec::new();
    let mut effects = FrameEffects::default();
    let mut cursor = 0usize;

    while cursor < payload.len() {
        let opcode = payload[cursor];
        cursor += 1;

        match opcode {
            NOP => continue,
            WRITE_ERROR | READ_ERROR => {
                // Only meaningful in replies; skip their body.
                let _ = read_varuint(payload, &mut cursor);
                cursor += 1;
            }
            op if op < READ_BASE => {
                let int_type = int_type_of(op);
                let count = match inline_count(payload, &mut cursor, op) {
                    Some(count) => count,
                    None => break,
                };
                let Some(start) = read_varuint(payload, &mut cursor) else {
                    break;
                };
                for i in 0..count {
                    let Some(value) = read_value(payload, &mut cursor, int_type) else {
                        return (reply, effects);
                    };
                    let register = start + i;
                    let map = match read_register(access, register as u16) {
                        Ok((_, map)) => map,
                        Err(_) => {
                            push_error(&mut reply, WRITE_ERROR, register, ERR_UNKNOWN_REGISTER);
                            continue;
                        }
                    };
                    let physical = decode(value, map);
                    match write_register(access, register as u16, physical) {
                        Ok(WriteEffect::None) => {}
                        Ok(WriteEffect::CommandTouched) => effects.command_touched = true,
                        Ok(WriteEffect::ModeRequested(mode)) => {
                            effects.command_touched = true;
                            effects.mode_request = Some(mode);
                        }
                        Ok(WriteEffect::OutputPositionSet(position)) => {
                            effects.output_position_set = Some(position);
                        }
                        Err(RegisterError::ReadOnly) => {
                            push_error(&mut reply, WRITE_ERROR, register, ERR_READ_ONLY);
                        }
                        Err(RegisterError::UnknownRegister) => {
                            push_error(&mut reply, WRITE_ERROR, register, ERR_UNKNOWN_REGISTER);
                        }
                    }
                }
            }
            op if op >= READ_BASE && op < REPLY_BASE => {
                let int_type = int_type_of(op);
                let count = match inline_count(payload, &mut cursor, op) {
                    Some(count) => count,
                    None => break,
                };
                let Some(start) = read_varuint(payload, &mut cursor) else {
                    break;
                };

                // Build the reply subframe into scratch so a mid-run
                // unknown register can split cleanly.
                let mut emitted = 0u32;
                let mut scratch: Vec<u8, MAX_PAYLOAD> = Vec::new();
                for i in 0..count {
                    let register = start + i;
                    match read_register(access, register as u16) {
                        Ok((value, map)) => {
                            if emitted == 0 {
                                scratch.clear();
                                let _ = scratch.push(REPLY_BASE | (type_code(int_type) << 2));
                                let _ = write_varuint(&mut scratch, register);
                            }
                            if push_value(&mut scratch, encode(value, map, int_type)).is_err() {
                                break;
                            }
                            emitted += 1;
                        }
                        Err(_) => {
                            flush_reply(&mut reply, &mut scratch, &mut emitted);
                            push_error(&mut reply, READ_ERROR, register, ERR_UNKNOWN_REGISTER);
                        }
                    }
                }
                flush_reply(&mut reply, &mut scratch, &mut emitted);
            }
            _ => {
                // Unknown opcode: cannot establish framing past it.
                break;
            }
        }
    }

    (reply, effects)
}

/// Build the periodic status payload: reply subframes for mode, the
/// position/velocity/torque block, voltage/temperature, and the fault
/// code. Every status frame carries the fault register.
pub fn build_status_payload(access: &RegisterAccess) -> Vec<u8, MAX_PAYLOAD> {
    let mut out: Vec<u8, MAX_PAYLOAD> = Vec::new();
    emit_status_group(&mut out, access, regs::MODE, 1, IntType::I8);
    emit_status_group(&mut out, access, regs::POSITION, 3, IntType::F32);
    emit_status_group(&mut out, access, regs::VOLTAGE, 2, IntType::F32);
    emit_status_group(&mut out, access, regs::FAULT, 1, IntType::I8);
    out
}

/// One reply subframe of `count` (1..3) consecutive registers.
fn emit_status_group(
    out: &mut Vec<u8, MAX_PAYLOAD>,
    access: &RegisterAccess,
    start: u16,
    count: u8,
    int_type: IntType,
) {
    let mut scratch: Vec<u8, MAX_PAYLOAD> = Vec::new();
    if scratch
        .push(REPLY_BASE | (type_code(int_type) << 2) | count)
        .is_err()
        || write_varuint(&mut scratch, start as u32).is_err()
    {
        return;
    }
    for i in 0..count as u16 {
        let Ok((value, map)) = read_register(access, start + i) else {
            return;
        };
        if push_value(&mut scratch, encode(value, map, int_type)).is_err() {
            return;
        }
    }
    if out.len() + scratch.len() <= MAX_PAYLOAD {
        let _ = out.extend_from_slice(&scratch);
    }
}

fn inline_count(payload: &[u8], cursor: &mut usize, opcode: u8) -> Option<u32> {
    let inline = (opcode & 0x03) as u32;
    if inline != 0 {
        return Some(inline);
    }
    let count = *payload.get(*cursor)? as u32;
    *cursor += 1;
    Some(count)
}

/// Move a pending reply subframe into the output, patching its count
/// bits, honoring the 64-byte budget.
fn flush_reply(
    reply: &mut Vec<u8, MAX_PAYLOAD>,
    scratch: &mut Vec<u8, MAX_PAYLOAD>,
    emitted: &mut u32,
) {
    if *emitted == 0 {
        return;
    }
    if *emitted <= 3 {
        scratch[0] |= *emitted as u8;
    } else {
        // Explicit count byte needs inserting after the opcode.
        let mut with_count: Vec<u8, MAX_PAYLOAD> = Vec::new();
        let _ = with_count.push(scratch[0]);
        let _ = with_count.push(*emitted as u8);
        let _ = with_count.extend_from_slice(&scratch[1..]);
        core::mem::swap(scratch, &mut with_count);
    }
    if reply.len() + scratch.len() <= MAX_PAYLOAD {
        let _ = reply.extend_from_slice(scratch);
    } else {
        push_error(reply, WRITE_ERROR, 0, ERR_OVERFLOW);
    }
    scratch.clear();
    *emitted = 0;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::control::CommandData;
    use crate::firmware_info::FirmwareInfo;
    use crate::registers::regs;
    use crate::telemetry::ControlCycle;

    struct Fixture {
        telemetry: ControlCycle,
        command: CommandData,
        config: RuntimeConfig,
        dirty: bool,
        firmware: FirmwareInfo,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                telemetry: ControlCycle::default(),
                command: CommandData::default(),
                config: RuntimeConfig::default(),
                dirty: false,
                firmware: FirmwareInfo::fixed([1, 2, 3]),
            }
        }

        fn process(&mut self, payload: &[u8]) -> (Vec<u8, MAX_PAYLOAD>, FrameEffects) {
            let mut access = RegisterAccess {
                telemetry: &self.telemetry,
                command: &mut self.command,
                config: &mut self.config,
                config_dirty: &mut self.dirty,
                firmware: &self.firmware,
            };
            process_frame(payload, &mut access)
        }
    }

    #[test]
    fn test_dlc_round_up_table() {
        assert_eq!(round_up_dlc(0), 0);
        assert_eq!(round_up_dlc(8), 8);
        assert_eq!(round_up_dlc(9), 12);
        assert_eq!(round_up_dlc(13), 16);
        assert_eq!(round_up_dlc(21), 24);
        assert_eq!(round_up_dlc(25), 32);
        assert_eq!(round_up_dlc(33), 48);
        assert_eq!(round_up_dlc(49), 64);
    }

    #[test]
    fn test_id_round_trip() {
        let id = encode_id(0x7F, 0x80, 0x01);
        assert_eq!(id, 0x7F_8001);
        assert_eq!(decode_id(id), (0x7F, 0x80, 0x01));
    }

    #[test]
    fn test_varuint_round_trip() {
        for value in [0u32, 1, 0x7F, 0x80, 0x3FFF, 0x4000, 1_000_000] {
            let mut buffer: Vec<u8, MAX_PAYLOAD> = Vec::new();
            write_varuint(&mut buffer, value).unwrap();
            let mut cursor = 0;
            assert_eq!(read_varuint(&buffer, &mut cursor), Some(value));
            assert_eq!(cursor, buffer.len());
        }
    }

    #[test]
    fn test_write_f32_then_read_back() {
        let mut fixture = Fixture::new();

        // WRITE_F32 count=1, register 0x025 (max torque), value 0.5.
        let mut payload: Vec<u8, MAX_PAYLOAD> = Vec::new();
        payload.push(0x0C | 1).unwrap();
        write_varuint(&mut payload, regs::COMMAND_MAX_TORQUE as u32).unwrap();
        payload.extend_from_slice(&0.5f32.to_le_bytes()).unwrap();

        let (reply, effects) = fixture.process(&payload);
        assert!(reply.is_empty());
        assert!(effects.command_touched);
        assert_eq!(fixture.command.max_torque, 0.5);

        // READ_F32 count=1 of the same register.
        let mut payload: Vec<u8, MAX_PAYLOAD> = Vec::new();
        payload.push(0x1C | 1).unwrap();
        write_varuint(&mut payload, regs::COMMAND_MAX_TORQUE as u32).unwrap();
        let (reply, _) = fixture.process(&payload);

        // Reply: opcode 0x2C|1, varuint reg, 4 value bytes.
        assert_eq!(reply[0], 0x2C | 1);
        let mut cursor = 1;
        assert_eq!(
            read_varuint(&reply, &mut cursor),
            Some(regs::COMMAND_MAX_TORQUE as u32)
        );
        let value = f32::from_le_bytes([
            reply[cursor],
            reply[cursor + 1],
            reply[cursor + 2],
            reply[cursor + 3],
        ]);
        assert_eq!(value, 0.5);
    }

    #[test]
    fn test_write_applied_before_reply_in_frame_order() {
        let mut fixture = Fixture::new();
        // One frame: write max torque then read it back.
        let mut payload: Vec<u8, MAX_PAYLOAD> = Vec::new();
        payload.push(0x0C | 1).unwrap();
        write_varuint(&mut payload, regs::COMMAND_MAX_TORQUE as u32).unwrap();
        payload.extend_from_slice(&1.25f32.to_le_bytes()).unwrap();
        payload.push(0x1C | 1).unwrap();
        write_varuint(&mut payload, regs::COMMAND_MAX_TORQUE as u32).unwrap();

        let (reply, _) = fixture.process(&payload);
        let value = f32::from_le_bytes([reply[2], reply[3], reply[4], reply[5]]);
        assert_eq!(value, 1.25);
    }

    #[test]
    fn test_multi_register_read() {
        let mut fixture = Fixture::new();
        fixture.telemetry.position = 1.0;
        fixture.telemetry.velocity = 2.0;
        fixture.telemetry.torque_nm = 3.0;

        // READ_F32 count=3 starting at POSITION.
        let mut payload: Vec<u8, MAX_PAYLOAD> = Vec::new();
        payload.push(0x1C | 3).unwrap();
        write_varuint(&mut payload, regs::POSITION as u32).unwrap();
        let (reply, _) = fixture.process(&payload);

        assert_eq!(reply[0], 0x2C | 3);
        assert_eq!(reply[1], regs::POSITION as u8);
        let values: [f32; 3] = core::array::from_fn(|i| {
            let base = 2 + i * 4;
            f32::from_le_bytes([reply[base], reply[base + 1], reply[base + 2], reply[base + 3]])
        });
        assert_eq!(values, [1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_int16_scaling_on_wire() {
        let mut fixture = Fixture::new();
        fixture.telemetry.position = 0.5; // 5000 in i16 position scale

        let mut payload: Vec<u8, MAX_PAYLOAD> = Vec::new();
        payload.push(0x14 | 1).unwrap(); // READ_I16
        write_varuint(&mut payload, regs::POSITION as u32).unwrap();
        let (reply, _) = fixture.process(&payload);

        assert_eq!(reply[0], 0x24 | 1);
        let raw = i16::from_le_bytes([reply[2], reply[3]]);
        assert_eq!(raw, 5000);
    }

    #[test]
    fn test_mode_write_effect() {
        let mut fixture = Fixture::new();
        // WRITE_I8 count=1, register 0 (mode), value = Position.
        let payload = [0x00 | 1, 0x00, Mode::Position as u8];
        let (_, effects) = fixture.process(&payload);
        assert_eq!(effects.mode_request, Some(Mode::Position));
    }

    #[test]
    fn test_unknown_register_error_subframe() {
        let mut fixture = Fixture::new();
        let mut payload: Vec<u8, MAX_PAYLOAD> = Vec::new();
        payload.push(0x1C | 1).unwrap();
        write_varuint(&mut payload, 0x3F0).unwrap();
        let (reply, _) = fixture.process(&payload);
        assert_eq!(reply[0], READ_ERROR);
        let mut cursor = 1;
        assert_eq!(read_varuint(&reply, &mut cursor), Some(0x3F0));
        assert_eq!(reply[cursor], ERR_UNKNOWN_REGISTER);
    }

    #[test]
    fn test_nop_padding_ignored() {
        let mut fixture = Fixture::new();
        let mut payload: Vec<u8, MAX_PAYLOAD> = Vec::new();
        payload.push(NOP).unwrap();
        payload.push(NOP).unwrap();
        payload.push(0x1C | 1).unwrap();
        write_varuint(&mut payload, regs::VOLTAGE as u32).unwrap();
        payload.push(PAD_BYTE).unwrap();
        payload.push(PAD_BYTE).unwrap();
        let (reply, _) = fixture.process(&payload);
        assert_eq!(reply[0], 0x2C | 1);
    }

    #[test]
    fn test_truncated_value_stops_cleanly() {
        let mut fixture = Fixture::new();
        // WRITE_F32 announcing one value but carrying only 2 bytes.
        let mut payload: Vec<u8, MAX_PAYLOAD> = Vec::new();
        payload.push(0x0C | 1).unwrap();
        write_varuint(&mut payload, regs::COMMAND_POSITION as u32).unwrap();
        payload.extend_from_slice(&[0x00, 0x00]).unwrap();
        let (reply, effects) = fixture.process(&payload);
        assert!(reply.is_empty());
        assert!(!effects.command_touched);
    }

    #[test]
    fn test_reply_overflow_flagged() {
        let mut fixture = Fixture::new();
        // Ask for the whole command block three times over: far more
        // than 64 bytes of reply.
        let mut payload: Vec<u8, MAX_PAYLOAD> = Vec::new();
        for _ in 0..3 {
            payload.push(0x1C).unwrap(); // explicit count
            payload.push(14).unwrap();
            write_varuint(&mut payload, regs::COMMAND_POSITION as u32).unwrap();
        }
        let (reply, _) = fixture.process(&payload);
        assert!(reply.len() <= MAX_PAYLOAD);
        // The overflow marker is a WRITE_ERROR subframe with code 3.
        let mut found = false;
        for window in reply.windows(3) {
            if window[0] == WRITE_ERROR && window[2] == ERR_OVERFLOW {
                found = true;
            }
        }
        assert!(found, "no overflow marker in reply");
    }

    #[test]
    fn test_status_payload_carries_fault() {
        let mut fixture = Fixture::new();
        fixture.telemetry.mode = Mode::Position;
        fixture.telemetry.position = 1.5;
        fixture.telemetry.v_bus = 24.0;
        fixture.telemetry.fault = crate::errors::FaultCode::MotorDriverFault;

        let payload = {
            let access = RegisterAccess {
                telemetry: &fixture.telemetry,
                command: &mut fixture.command,
                config: &mut fixture.config,
                config_dirty: &mut fixture.dirty,
                firmware: &fixture.firmware,
            };
            build_status_payload(&access)
        };
        assert!(payload.len() <= MAX_PAYLOAD);

        // Leads with the mode subframe: REPLY_I8 count=1, register 0.
        assert_eq!(payload[0], 0x20 | 1);
        assert_eq!(payload[1], regs::MODE as u8);
        assert_eq!(payload[2], Mode::Position as u8);

        // The fault subframe is always present.
        let mut fault_seen = false;
        for window in payload.windows(3) {
            if window[0] == 0x20 | 1 && window[1] == regs::FAULT as u8 {
                assert_eq!(window[2], 33);
                fault_seen = true;
            }
        }
        assert!(fault_seen, "no fault subframe in status payload");

        // Reply traffic is inert when looped back into the processor:
        // no effects, no reply.
        let (reply, effects) = fixture.process(&payload);
        assert!(reply.is_empty());
        assert!(!effects.command_touched);
    }

    #[test]
    fn test_readback_after_int_write_round_trips() {
        let mut fixture = Fixture::new();
        // Write position command as i16: 0.25 turns = 2500.
        let mut payload: Vec<u8, MAX_PAYLOAD> = Vec::new();
        payload.push(0x04 | 1).unwrap(); // WRITE_I16
        write_varuint(&mut payload, regs::COMMAND_POSITION as u32).unwrap();
        payload.extend_from_slice(&2500i16.to_le_bytes()).unwrap();
        fixture.process(&payload);
        assert!((fixture.command.position - 0.25).abs() < 1e-6);
    }
}
