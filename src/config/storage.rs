//! Persisted configuration: a TLV blob in the last flash pages.
//!
//! Layout: {magic u32, schema u32, crc u32, [tag u16, len u16,
//! bytes...]...}. Scalar tags are exactly the config register
//! addresses, so the persisted set is a superset of the register file;
//! unknown tags are skipped on load for forward compatibility.

use embassy_stm32::flash::{Blocking, Flash};

use crate::config::RuntimeConfig;
use crate::control::{CommandData, COMMUTATION_TABLE_LEN};
use crate::firmware_info::FirmwareInfo;
use crate::position::MAX_SOURCES;
use crate::registers::{self, regs, RegisterAccess};
use crate::telemetry::ControlCycle;

/// "G4SV" in little-endian byte order.
pub const CONFIG_MAGIC: u32 = 0x5653_3447;

pub const CONFIG_SCHEMA: u32 = 1;

/// Reserved region: the last two 2 KiB pages of a 128 KiB part,
/// as an offset from the flash base.
pub const CONFIG_FLASH_OFFSET: u32 = 0x1F000;
pub const CONFIG_FLASH_SIZE: u32 = 0x1000;

pub const MAX_BLOB: usize = 2048;

const HEADER_LEN: usize = 12;

/// Scalar configuration tags, persisted through the register mapping.
const SCALAR_TAGS: &[u16] = &[
    regs::CONFIG_POSITION_KP,
    regs::CONFIG_POSITION_KI,
    regs::CONFIG_POSITION_KD,
    regs::CONFIG_POSITION_ILIMIT,
    regs::CONFIG_MAX_DESIRED_RATE,
    regs::CONFIG_START_POSITION_LIMIT,
    regs::CONFIG_DEFAULT_TIMEOUT,
    regs::CONFIG_POSITION_TIMEOUT,
    regs::CONFIG_CURRENT_KP,
    regs::CONFIG_CURRENT_KI,
    regs::CONFIG_DEADTIME_COMP,
    regs::CONFIG_MAX_TORQUE,
    regs::CONFIG_MAX_VELOCITY,
    regs::CONFIG_POSITION_MIN,
    regs::CONFIG_POSITION_MAX,
    regs::CONFIG_MAX_POWER,
    regs::CONFIG_FIELD_WEAKEN_MAX,
    regs::CONFIG_V_MIN,
    regs::CONFIG_V_MAX,
    regs::CONFIG_FET_DERATE_TEMP,
    regs::CONFIG_FET_FAULT_TEMP,
    regs::CONFIG_MOTOR_DERATE_TEMP,
    regs::CONFIG_MOTOR_FAULT_TEMP,
    regs::CONFIG_POLE_PAIRS,
    regs::CONFIG_RESISTANCE,
    regs::CONFIG_INDUCTANCE,
    regs::CONFIG_TORQUE_CONSTANT,
    regs::CONFIG_CURRENT_CUTOFF,
    regs::CONFIG_CURRENT_SCALE,
    regs::CONFIG_TORQUE_SCALE,
    regs::CONFIG_ROTOR_TO_OUTPUT,
    regs::CONFIG_PWM_RATE,
];

const TAG_CAL_VALID: u16 = 0x082;
const TAG_SOURCE_OFFSET_BASE: u16 = 0x0A0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StorageError {
    InvalidMagic,
    SchemaMismatch,
    CrcMismatch,
    Truncated,
    FlashWrite,
    FlashErase,
}

/// CRC-32 with the STM32 CRC unit's default parameters (poly
/// 0x04C11DB7, init 0xFFFFFFFF, no reflection), computed in software
/// so the blob can be verified anywhere.
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFF_FFFF;
    for &byte in data {
        crc ^= (byte as u32) << 24;
        for _ in 0..8 {
            crc = if crc & 0x8000_0000 != 0 {
                (crc << 1) ^ 0x04C1_1DB7
            } else {
                crc << 1
            };
        }
    }
    crc
}

struct TlvWriter<'a> {
    buffer: &'a mut [u8],
    cursor: usize,
}

impl<'a> TlvWriter<'a> {
    fn entry(&mut self, tag: u16, bytes: &[u8]) {
        let end = self.cursor + 4 + bytes.len();
        debug_assert!(end <= self.buffer.len());
        self.buffer[self.cursor..self.cursor + 2].copy_from_slice(&tag.to_le_bytes());
        self.buffer[self.cursor + 2..self.cursor + 4]
            .copy_from_slice(&(bytes.len() as u16).to_le_bytes());
        self.buffer[self.cursor + 4..end].copy_from_slice(bytes);
        self.cursor = end;
    }
}

/// Serialize a configuration into `buffer`; returns the blob length.
pub fn serialize(config: &RuntimeConfig, buffer: &mut [u8; MAX_BLOB]) -> usize {
    let mut writer = TlvWriter {
        buffer: &mut buffer[HEADER_LEN..],
        cursor: 0,
    };

    // Scalars through the register mapping.
    let telemetry = ControlCycle::default();
    let mut command = CommandData::default();
    let mut scratch_config = *config;
    let mut dirty = false;
    let firmware = FirmwareInfo::fixed([0; 3]);
    let access = RegisterAccess {
        telemetry: &telemetry,
        command: &mut command,
        config: &mut scratch_config,
        config_dirty: &mut dirty,
        firmware: &firmware,
    };
    for &tag in SCALAR_TAGS {
        if let Ok((value, _)) = registers::read_register(&access, tag) {
            writer.entry(tag, &value.to_le_bytes());
        }
    }

    // Calibration blobs.
    let mut offsets = [0u8; 12];
    for (i, value) in config.calibration.current_offsets.iter().enumerate() {
        offsets[i * 4..i * 4 + 4].copy_from_slice(&value.to_le_bytes());
    }
    writer.entry(regs::CAL_CURRENT_OFFSETS, &offsets);

    let mut table = [0u8; COMMUTATION_TABLE_LEN * 4];
    for (i, value) in config.calibration.commutation_offset.iter().enumerate() {
        table[i * 4..i * 4 + 4].copy_from_slice(&value.to_le_bytes());
    }
    writer.entry(regs::CAL_COMMUTATION_TABLE, &table);
    writer.entry(TAG_CAL_VALID, &[config.calibration.valid as u8]);

    // Position sources.
    for (i, source) in config.position.sources.iter().enumerate() {
        let mut packed = [0u8; 16];
        packed[0] = source.enabled as u8;
        packed[1] = source.sign as u8;
        packed[2] = matches!(source.reference, crate::position::SourceReference::Output) as u8;
        packed[3] = source.is_reference as u8;
        packed[4..8].copy_from_slice(&source.cpr.to_le_bytes());
        packed[8..12].copy_from_slice(&source.pll_bandwidth_hz.to_le_bytes());
        packed[12] = source.kind as u8;
        writer.entry(regs::SOURCE_CONFIG_BASE + i as u16, &packed);

        let mut offset_table = [0u8; crate::position::OFFSET_TABLE_LEN * 4];
        for (j, value) in source.offset.iter().enumerate() {
            offset_table[j * 4..j * 4 + 4].copy_from_slice(&value.to_le_bytes());
        }
        writer.entry(TAG_SOURCE_OFFSET_BASE + i as u16, &offset_table);
    }

    let len = HEADER_LEN + writer.cursor;
    let crc = crc32(&buffer[HEADER_LEN..len]);
    buffer[0..4].copy_from_slice(&CONFIG_MAGIC.to_le_bytes());
    buffer[4..8].copy_from_slice(&CONFIG_SCHEMA.to_le_bytes());
    buffer[8..12].copy_from_slice(&crc.to_le_bytes());
    len
}

/// Parse a blob into a configuration, starting from defaults so
/// missing tags keep their default values.
pub fn parse(blob: &[u8]) -> Result<RuntimeConfig, StorageError> {
    if blob.len() < HEADER_LEN {
        return Err(StorageError::Truncated);
    }
    let magic = u32::from_le_bytes([blob[0], blob[1], blob[2], blob[3]]);
    if magic != CONFIG_MAGIC {
        return Err(StorageError::InvalidMagic);
    }
    let schema = u32::from_le_bytes([blob[4], blob[5], blob[6], blob[7]]);
    if schema != CONFIG_SCHEMA {
        return Err(StorageError::SchemaMismatch);
    }
    let stored_crc = u32::from_le_bytes([blob[8], blob[9], blob[10], blob[11]]);
    if crc32(&blob[HEADER_LEN..]) != stored_crc {
        return Err(StorageError::CrcMismatch);
    }

    let mut config = RuntimeConfig::default();
    let mut cursor = HEADER_LEN;
    while cursor + 4 <= blob.len() {
        let tag = u16::from_le_bytes([blob[cursor], blob[cursor + 1]]);
        let len = u16::from_le_bytes([blob[cursor + 2], blob[cursor + 3]]) as usize;
        cursor += 4;
        if cursor + len > blob.len() {
            return Err(StorageError::Truncated);
        }
        let bytes = &blob[cursor..cursor + len];
        cursor += len;
        apply_entry(&mut config, tag, bytes);
    }
    Ok(config)
}

fn apply_entry(config: &mut RuntimeConfig, tag: u16, bytes: &[u8]) {
    match tag {
        regs::CAL_CURRENT_OFFSETS if bytes.len() == 12 => {
            for i in 0..3 {
                config.calibration.current_offsets[i] = f32_at(bytes, i * 4);
            }
        }
        regs::CAL_COMMUTATION_TABLE if bytes.len() == COMMUTATION_TABLE_LEN * 4 => {
            for i in 0..COMMUTATION_TABLE_LEN {
                config.calibration.commutation_offset[i] = f32_at(bytes, i * 4);
            }
        }
        TAG_CAL_VALID if bytes.len() == 1 => {
            config.calibration.valid = bytes[0] != 0;
        }
        tag if (regs::SOURCE_CONFIG_BASE..regs::SOURCE_CONFIG_BASE + MAX_SOURCES as u16)
            .contains(&tag)
            && bytes.len() == 16 =>
        {
            let source = &mut config.position.sources[(tag - regs::SOURCE_CONFIG_BASE) as usize];
            source.enabled = bytes[0] != 0;
            source.sign = if (bytes[1] as i8) < 0 { -1 } else { 1 };
            source.reference = if bytes[2] != 0 {
                crate::position::SourceReference::Output
            } else {
                crate::position::SourceReference::Rotor
            };
            source.is_reference = bytes[3] != 0;
            source.cpr = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
            source.pll_bandwidth_hz = f32_at(bytes, 8);
            source.kind = crate::encoder::SourceKind::from_u8(bytes[12]);
        }
        tag if (TAG_SOURCE_OFFSET_BASE..TAG_SOURCE_OFFSET_BASE + MAX_SOURCES as u16)
            .contains(&tag)
            && bytes.len() == crate::position::OFFSET_TABLE_LEN * 4 =>
        {
            let source = &mut config.position.sources[(tag - TAG_SOURCE_OFFSET_BASE) as usize];
            for i in 0..crate::position::OFFSET_TABLE_LEN {
                source.offset[i] = f32_at(bytes, i * 4);
            }
        }
        tag if bytes.len() == 4 => {
            // Scalar through the register mapping; unknown tags fall
            // out of write_register and are skipped.
            let value = f32_at(bytes, 0);
            let telemetry = ControlCycle::default();
            let mut command = CommandData::default();
            let mut dirty = false;
            let firmware = FirmwareInfo::fixed([0; 3]);
            let mut access = RegisterAccess {
                telemetry: &telemetry,
                command: &mut command,
                config,
                config_dirty: &mut dirty,
                firmware: &firmware,
            };
            let _ = registers::write_register(&mut access, tag, value);
        }
        _ => {} // unknown tag: skip
    }
}

fn f32_at(bytes: &[u8], offset: usize) -> f32 {
    f32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

/// Write the configuration blob: erase the reserved pages, program
/// double-words.
pub fn write_to_flash(flash: &mut Flash<'_, Blocking>, config: &RuntimeConfig) -> Result<(), StorageError> {
    let mut buffer = [0u8; MAX_BLOB];
    let len = serialize(config, &mut buffer);

    info!("Writing config to flash: {} bytes", len);
    flash
        .blocking_erase(CONFIG_FLASH_OFFSET, CONFIG_FLASH_OFFSET + CONFIG_FLASH_SIZE)
        .map_err(|_| StorageError::FlashErase)?;

    // Program in 8-byte units; the tail pads with the buffer's zeros.
    let padded = (len + 7) & !7;
    flash
        .blocking_write(CONFIG_FLASH_OFFSET, &buffer[..padded])
        .map_err(|_| StorageError::FlashWrite)?;

    info!("Config saved");
    Ok(())
}

/// Read the blob back from the reserved region.
pub fn read_from_flash(flash: &mut Flash<'_, Blocking>) -> Result<RuntimeConfig, StorageError> {
    let mut buffer = [0u8; MAX_BLOB];
    flash
        .blocking_read(CONFIG_FLASH_OFFSET, &mut buffer)
        .map_err(|_| StorageError::Truncated)?;
    parse(&buffer)
}

/// Load the stored configuration, falling back to defaults when the
/// region is blank or corrupt.
pub fn load_or_default(flash: &mut Flash<'_, Blocking>) -> RuntimeConfig {
    match read_from_flash(flash) {
        Ok(config) => {
            info!("Config loaded from flash");
            config
        }
        Err(e) => {
            warn!("No stored config ({:?}), using defaults", e);
            RuntimeConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::SourceReference;

    #[test]
    fn test_crc32_known_values() {
        // CRC-32/MPEG-2 test vector for "123456789".
        assert_eq!(crc32(b"123456789"), 0x0376_E6E7);
        assert_eq!(crc32(b""), 0xFFFF_FFFF);
    }

    #[test]
    fn test_round_trip_defaults() {
        let config = RuntimeConfig::default();
        let mut buffer = [0u8; MAX_BLOB];
        let len = serialize(&config, &mut buffer);
        assert!(len > HEADER_LEN && len < MAX_BLOB);

        let parsed = parse(&buffer[..len]).unwrap();
        assert_eq!(parsed.position_pid.kp, config.position_pid.kp);
        assert_eq!(parsed.safety.v_max, config.safety.v_max);
        assert_eq!(parsed.motor.pole_pairs, config.motor.pole_pairs);
    }

    #[test]
    fn test_round_trip_modified() {
        let mut config = RuntimeConfig::default();
        config.position_pid.kp = 12.5;
        config.motor.pole_pairs = 21;
        config.motor.torque_constant = 0.091;
        config.limits.max_torque_nm = 3.0;
        config.calibration.valid = true;
        config.calibration.current_offsets = [0.1, -0.2, 0.3];
        config.calibration.commutation_offset[17] = 0.5;
        config.position.sources[0].enabled = true;
        config.position.sources[0].cpr = 4096;
        config.position.sources[0].sign = -1;
        config.position.sources[0].is_reference = true;
        config.position.sources[0].kind = crate::encoder::SourceKind::Aksim2;
        config.position.sources[1].enabled = true;
        config.position.sources[1].reference = SourceReference::Output;
        config.position.sources[1].offset[3] = 0.007;

        let mut buffer = [0u8; MAX_BLOB];
        let len = serialize(&config, &mut buffer);
        let parsed = parse(&buffer[..len]).unwrap();

        assert_eq!(parsed.position_pid.kp, 12.5);
        assert_eq!(parsed.motor.pole_pairs, 21);
        assert_eq!(parsed.motor.torque_constant, 0.091);
        assert_eq!(parsed.limits.max_torque_nm, 3.0);
        assert!(parsed.calibration.valid);
        assert_eq!(parsed.calibration.current_offsets, [0.1, -0.2, 0.3]);
        assert_eq!(parsed.calibration.commutation_offset[17], 0.5);
        assert!(parsed.position.sources[0].enabled);
        assert_eq!(parsed.position.sources[0].cpr, 4096);
        assert_eq!(parsed.position.sources[0].sign, -1);
        assert!(parsed.position.sources[0].is_reference);
        assert_eq!(
            parsed.position.sources[0].kind,
            crate::encoder::SourceKind::Aksim2
        );
        assert_eq!(parsed.position.sources[1].reference, SourceReference::Output);
        assert_eq!(parsed.position.sources[1].offset[3], 0.007);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut buffer = [0u8; MAX_BLOB];
        let len = serialize(&RuntimeConfig::default(), &mut buffer);
        buffer[0] ^= 0xFF;
        assert_eq!(parse(&buffer[..len]), Err(StorageError::InvalidMagic));
    }

    #[test]
    fn test_corrupt_body_rejected() {
        let mut buffer = [0u8; MAX_BLOB];
        let len = serialize(&RuntimeConfig::default(), &mut buffer);
        buffer[len - 1] ^= 0xFF;
        assert_eq!(parse(&buffer[..len]), Err(StorageError::CrcMismatch));
    }

    #[test]
    fn test_unknown_tag_skipped() {
        let mut buffer = [0u8; MAX_BLOB];
        let mut config = RuntimeConfig::default();
        config.position_pid.kp = 3.5;
        let len = serialize(&config, &mut buffer);

        // Append an unknown 2-byte tag and redo the CRC.
        buffer[len..len + 4].copy_from_slice(&[0xF0, 0x03, 0x02, 0x00]);
        buffer[len + 4] = 0xAB;
        buffer[len + 5] = 0xCD;
        let new_len = len + 6;
        let crc = crc32(&buffer[HEADER_LEN..new_len]);
        buffer[8..12].copy_from_slice(&crc.to_le_bytes());

        let parsed = parse(&buffer[..new_len]).unwrap();
        assert_eq!(parsed.position_pid.kp, 3.5);
    }

    #[test]
    fn test_erased_flash_rejected() {
        let blank = [0xFFu8; 64];
        assert_eq!(parse(&blank), Err(StorageError::InvalidMagic));
    }
}
