//! Rotor/output angle sources.
//!
//! Every variant produces the same output record each time it commits
//! a fresh sample: a raw value of known bit width, a wrapping nonce,
//! and an `active` flag. Consumers detect staleness purely from the
//! nonce, so sources never need to push.

pub mod aksim2;
pub mod amt21;
pub mod as5047;
pub mod hall;
pub mod i2c;
pub mod index;
pub mod quadrature;
pub mod sincos;

/// Which kind of device feeds a source slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum SourceKind {
    None = 0,
    /// On-board SPI magnetic encoder (AS5047P / MA732), ISR-sampled.
    OnboardSpi = 1,
    /// External SPI magnetic encoder.
    ExternalSpi = 2,
    /// RLS AkSIM-2 over UART.
    Aksim2 = 3,
    /// CUI AMT21 over RS-485 UART.
    CuiAmt21 = 4,
    /// AS5048B / AS5600 over I2C.
    I2c = 5,
    /// Quadrature, software-decoded from GPIO.
    QuadratureSw = 6,
    /// Quadrature, hardware timer counter.
    QuadratureHw = 7,
    Hall = 8,
    SinCos = 9,
    Index = 10,
}

impl SourceKind {
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => SourceKind::OnboardSpi,
            2 => SourceKind::ExternalSpi,
            3 => SourceKind::Aksim2,
            4 => SourceKind::CuiAmt21,
            5 => SourceKind::I2c,
            6 => SourceKind::QuadratureSw,
            7 => SourceKind::QuadratureHw,
            8 => SourceKind::Hall,
            9 => SourceKind::SinCos,
            10 => SourceKind::Index,
            _ => SourceKind::None,
        }
    }
}

impl Default for SourceKind {
    fn default() -> Self {
        SourceKind::None
    }
}

/// One committed sample from a source.
///
/// Published through a seqlock slot by background pollers, or written
/// in place by ISR-sampled sources. `nonce` increments exactly when a
/// new `value` has been committed.
#[derive(Debug, Clone, Copy, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SourceSample {
    pub value: u32,
    pub nonce: u8,
    pub active: bool,
    /// Device-specific warning (AkSIM-2 warn bit); does not clear
    /// `active`.
    pub warn: bool,
}

impl SourceSample {
    /// Const zero-state for static slot initialization.
    pub const fn new_const() -> Self {
        Self {
            value: 0,
            nonce: 0,
            active: false,
            warn: false,
        }
    }
}

/// Counters every source keeps for diagnostics.
#[derive(Debug, Clone, Copy, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SourceCounters {
    pub checksum_errors: u32,
    pub timeouts: u32,
    pub resyncs: u32,
}

/// Commit helper shared by all sources: bump the nonce only when a
/// fresh value lands.
#[inline]
pub fn commit(sample: &mut SourceSample, value: u32) {
    sample.value = value;
    sample.nonce = sample.nonce.wrapping_add(1);
    sample.active = true;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_bumps_nonce() {
        let mut sample = SourceSample::default();
        commit(&mut sample, 100);
        assert_eq!(sample.nonce, 1);
        assert_eq!(sample.value, 100);
        assert!(sample.active);

        commit(&mut sample, 101);
        assert_eq!(sample.nonce, 2);
    }

    #[test]
    fn test_nonce_wraps() {
        let mut sample = SourceSample {
            nonce: 255,
            ..Default::default()
        };
        commit(&mut sample, 7);
        assert_eq!(sample.nonce, 0);
    }
}
