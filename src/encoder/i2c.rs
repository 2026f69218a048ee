//! I2C magnetic encoders: AMS AS5048B and AS5600.
//!
//! Polled from the background loop at the configured per-device
//! cadence. A NACK or arbitration loss aborts the transaction and the
//! bus controller is re-initialized on the next poll rather than left
//! wedged.

use embassy_stm32::i2c::I2c;
use embassy_stm32::mode::Async;
use embassy_time::{with_timeout, Duration};

use crate::encoder::{commit, SourceCounters, SourceSample};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum I2cDevice {
    /// 14-bit, angle registers 0xFE/0xFF.
    As5048b,
    /// 12-bit, angle registers 0x0E/0x0F.
    As5600,
}

impl I2cDevice {
    pub fn default_address(&self) -> u8 {
        match self {
            I2cDevice::As5048b => 0x40,
            I2cDevice::As5600 => 0x36,
        }
    }

    pub fn angle_register(&self) -> u8 {
        match self {
            I2cDevice::As5048b => 0xFE,
            I2cDevice::As5600 => 0x0E,
        }
    }

    pub fn bits(&self) -> u8 {
        match self {
            I2cDevice::As5048b => 14,
            I2cDevice::As5600 => 12,
        }
    }
}

/// Combine the two angle bytes into a right-aligned count.
pub fn decode_angle(device: I2cDevice, high: u8, low: u8) -> u32 {
    match device {
        // AS5048B: high byte is [13:6], low byte carries [5:0].
        I2cDevice::As5048b => ((high as u32) << 6) | (low as u32 & 0x3F),
        // AS5600: high nibble is [11:8], low byte [7:0].
        I2cDevice::As5600 => ((high as u32 & 0x0F) << 8) | low as u32,
    }
}

pub struct I2cEncoder {
    i2c: I2c<'static, Async>,
    device: I2cDevice,
    address: u8,
    poll_rate_us: u32,
    /// Set after a bus error; the next poll issues a recovery probe
    /// before trusting data again.
    needs_reinit: bool,
    pub counters: SourceCounters,
}

impl I2cEncoder {
    pub fn new(i2c: I2c<'static, Async>, device: I2cDevice, address: u8, poll_rate_us: u32) -> Self {
        Self {
            i2c,
            device,
            address,
            poll_rate_us,
            needs_reinit: false,
            counters: Default::default(),
        }
    }

    pub async fn poll(&mut self, sample: &mut SourceSample) {
        let timeout = Duration::from_micros(self.poll_rate_us as u64);

        if self.needs_reinit {
            // Probe with a bare register-pointer write; success clears
            // the flag, failure leaves the source inactive.
            let probe = with_timeout(
                timeout,
                self.i2c.write(self.address, &[self.device.angle_register()]),
            )
            .await;
            match probe {
                Ok(Ok(())) => self.needs_reinit = false,
                _ => {
                    sample.active = false;
                    return;
                }
            }
        }

        let mut data = [0u8; 2];
        let result = with_timeout(
            timeout,
            self.i2c
                .write_read(self.address, &[self.device.angle_register()], &mut data),
        )
        .await;

        match result {
            Ok(Ok(())) => {
                commit(sample, decode_angle(self.device, data[0], data[1]));
            }
            Ok(Err(_)) => {
                // NACK or arbitration loss: abort and re-init next time.
                self.counters.checksum_errors = self.counters.checksum_errors.wrapping_add(1);
                self.needs_reinit = true;
                sample.active = false;
            }
            Err(_) => {
                self.counters.timeouts = self.counters.timeouts.wrapping_add(1);
                self.needs_reinit = true;
                sample.active = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_as5048b_decode() {
        // 14-bit full scale.
        assert_eq!(decode_angle(I2cDevice::As5048b, 0xFF, 0x3F), 0x3FFF);
        // High bits land in [13:6].
        assert_eq!(decode_angle(I2cDevice::As5048b, 0x01, 0x00), 0x40);
        // Stray upper bits in the low byte are masked.
        assert_eq!(decode_angle(I2cDevice::As5048b, 0x00, 0xC1), 0x01);
    }

    #[test]
    fn test_as5600_decode() {
        assert_eq!(decode_angle(I2cDevice::As5600, 0x0F, 0xFF), 0xFFF);
        assert_eq!(decode_angle(I2cDevice::As5600, 0x01, 0x00), 0x100);
        // Upper nibble of the high byte is ignored.
        assert_eq!(decode_angle(I2cDevice::As5600, 0xF1, 0x00), 0x100);
    }

    #[test]
    fn test_device_metadata() {
        assert_eq!(I2cDevice::As5048b.bits(), 14);
        assert_eq!(I2cDevice::As5600.bits(), 12);
        assert_eq!(I2cDevice::As5600.default_address(), 0x36);
    }
}
