//! RLS AkSIM-2 absolute encoder over UART.
//!
//! Request/response: we send the 'd' detailed-position command, the
//! encoder echoes the marker followed by a 24-bit position, error and
//! warning flags, and a 16-bit detailed status word. Polled from the
//! background loop; the control ISR only ever sees the committed
//! sample slot.

use embassy_stm32::mode::Async;
use embassy_stm32::usart::Uart;
use embassy_time::{with_timeout, Duration};

use crate::encoder::{commit, SourceCounters, SourceSample};

/// Bytes we are willing to discard while hunting for the marker after
/// losing framing.
const RESYNC_BYTES: usize = 3;

const MARKER: u8 = b'd';

/// Reply: marker, pos[23:16], pos[15:8], pos[7:0] with the low two
/// bits carrying (err, warn), status[15:8], status[7:0].
pub const REPLY_LEN: usize = 6;

/// Decoded detailed-position reply.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aksim2Reading {
    pub position: u32,
    pub error: bool,
    pub warn: bool,
    pub status: u16,
}

/// Parse a reply buffer positioned at the marker.
pub fn parse_reply(buffer: &[u8]) -> Option<Aksim2Reading> {
    if buffer.len() < REPLY_LEN || buffer[0] != MARKER {
        return None;
    }
    let raw = ((buffer[1] as u32) << 16) | ((buffer[2] as u32) << 8) | buffer[3] as u32;
    // The bottom two bits of the 24-bit field are status flags; the
    // position itself is 22 bits, kept left-aligned in 24.
    let error = raw & 0x02 == 0;
    let warn = raw & 0x01 == 0;
    let position = raw & !0x03;
    let status = ((buffer[4] as u16) << 8) | buffer[5] as u16;
    Some(Aksim2Reading {
        position,
        error,
        warn,
        status,
    })
}

/// Locate the marker within the first `RESYNC_BYTES` bytes.
pub fn resync_offset(buffer: &[u8]) -> Option<usize> {
    buffer
        .iter()
        .take(RESYNC_BYTES + 1)
        .position(|&b| b == MARKER)
}

pub struct Aksim2 {
    uart: Uart<'static, Async>,
    poll_rate_us: u32,
    pub counters: SourceCounters,
    pub last_status: u16,
}

impl Aksim2 {
    pub fn new(uart: Uart<'static, Async>, poll_rate_us: u32) -> Self {
        Self {
            uart,
            poll_rate_us,
            counters: Default::default(),
            last_status: 0,
        }
    }

    /// Issue one query and retire it. Called from the background
    /// poller at the configured cadence; the timeout is twice the poll
    /// period so a wedged transfer cannot stall the loop.
    pub async fn poll(&mut self, sample: &mut SourceSample) {
        if self.uart.write(&[MARKER]).await.is_err() {
            self.fail(sample);
            return;
        }

        // Allow a little slack for resync garbage ahead of the marker.
        let mut buffer = [0u8; REPLY_LEN + RESYNC_BYTES];
        let timeout = Duration::from_micros(2 * self.poll_rate_us as u64);
        let read = with_timeout(timeout, self.uart.read_until_idle(&mut buffer)).await;

        let len = match read {
            Ok(Ok(len)) => len,
            _ => {
                self.counters.timeouts = self.counters.timeouts.wrapping_add(1);
                self.fail(sample);
                return;
            }
        };

        let Some(offset) = resync_offset(&buffer[..len]) else {
            // Used up the resync budget without a marker; drop the
            // whole buffer and try again next period.
            self.counters.resyncs = self.counters.resyncs.wrapping_add(1);
            self.fail(sample);
            return;
        };
        if offset != 0 {
            self.counters.resyncs = self.counters.resyncs.wrapping_add(1);
        }

        match parse_reply(&buffer[offset..len]) {
            Some(reading) => {
                self.last_status = reading.status;
                if reading.error {
                    self.fail(sample);
                } else {
                    commit(sample, reading.position);
                    sample.warn = reading.warn;
                }
            }
            None => {
                self.counters.checksum_errors = self.counters.checksum_errors.wrapping_add(1);
                self.fail(sample);
            }
        }
    }

    fn fail(&mut self, sample: &mut SourceSample) {
        sample.active = false;
    }
}
