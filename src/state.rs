//! Cross-context state exchange.
//!
//! The ISR and the background loop never share a lock. Everything
//! crossing that boundary goes through one of three single-writer
//! structures: seqlock slots (background writes, ISR reads), the
//! command mailbox (same direction, with a generation counter), and
//! the telemetry ring (ISR writes, background reads).

use core::cell::UnsafeCell;
use core::sync::atomic::{fence, AtomicBool, AtomicU32, Ordering};

use crate::config::{CalibrationData, RuntimeConfig};
use crate::control::CommandData;
use crate::encoder::SourceSample;
use crate::position::MAX_SOURCES;
use crate::telemetry::ControlCycle;

/// Single-writer seqlock.
///
/// The writer bumps the sequence to odd, stores the payload, bumps to
/// even; the reader retries while the sequence is odd or changed
/// across the copy. Reads are wait-free in practice because the writer
/// is the slow background loop.
pub struct SeqLock<T: Copy> {
    seq: AtomicU32,
    value: UnsafeCell<T>,
}

// The protocol itself provides the synchronization; T is always plain
// data here.
unsafe impl<T: Copy + Send> Sync for SeqLock<T> {}

impl<T: Copy> SeqLock<T> {
    pub const fn new(initial: T) -> Self {
        Self {
            seq: AtomicU32::new(0),
            value: UnsafeCell::new(initial),
        }
    }

    /// Publish a new value. Must only ever be called from one context.
    pub fn write(&self, value: T) {
        let seq = self.seq.load(Ordering::Relaxed);
        self.seq.store(seq.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);
        unsafe { *self.value.get() = value };
        fence(Ordering::Release);
        self.seq.store(seq.wrapping_add(2), Ordering::Release);
    }

    /// Read a consistent copy.
    pub fn read(&self) -> T {
        loop {
            let before = self.seq.load(Ordering::Acquire);
            if before & 1 != 0 {
                continue;
            }
            let value = unsafe { *self.value.get() };
            fence(Ordering::Acquire);
            let after = self.seq.load(Ordering::Acquire);
            if before == after {
                return value;
            }
        }
    }
}

/// Single-slot mailbox with a generation counter so the consumer can
/// tell a fresh publication from a re-read.
pub struct Mailbox<T: Copy> {
    slot: SeqLock<T>,
    generation: AtomicU32,
}

impl<T: Copy> Mailbox<T> {
    pub const fn new(initial: T) -> Self {
        Self {
            slot: SeqLock::new(initial),
            generation: AtomicU32::new(0),
        }
    }

    pub fn publish(&self, value: T) {
        self.slot.write(value);
        self.generation.fetch_add(1, Ordering::Release);
    }

    /// Returns the payload and its generation; the caller tracks the
    /// last generation it consumed.
    pub fn read(&self) -> (u32, T) {
        // Generation first: a publication between the two reads makes
        // the generation look stale, never fresh-with-old-payload.
        let generation = self.generation.load(Ordering::Acquire);
        let value = self.slot.read();
        (generation, value)
    }
}

/// Telemetry ring: the ISR publishes a snapshot per cycle, the
/// background reads whatever is newest.
pub const TELEMETRY_RING_LEN: usize = 8;

pub struct TelemetryRing {
    slots: [UnsafeCell<ControlCycle>; TELEMETRY_RING_LEN],
    /// Count of completed publications; slot = (count - 1) % LEN.
    count: AtomicU32,
}

unsafe impl Sync for TelemetryRing {}

impl TelemetryRing {
    pub const fn new() -> Self {
        const INIT: UnsafeCell<ControlCycle> = UnsafeCell::new(ControlCycle::new_const());
        Self {
            slots: [INIT; TELEMETRY_RING_LEN],
            count: AtomicU32::new(0),
        }
    }

    /// ISR-side: write the next slot and advance. The slot being
    /// written is never the one `latest` hands out.
    pub fn publish(&self, cycle: &ControlCycle) {
        let count = self.count.load(Ordering::Relaxed);
        let slot = (count as usize) % TELEMETRY_RING_LEN;
        unsafe { *self.slots[slot].get() = *cycle };
        self.count.store(count.wrapping_add(1), Ordering::Release);
    }

    /// Background-side: newest completed snapshot.
    pub fn latest(&self) -> ControlCycle {
        let count = self.count.load(Ordering::Acquire);
        if count == 0 {
            return ControlCycle::new_const();
        }
        let slot = ((count.wrapping_sub(1)) as usize) % TELEMETRY_RING_LEN;
        unsafe { *self.slots[slot].get() }
    }

    pub fn publications(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }
}

/// Position bookkeeping requests from the host (rezero, reindex).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PositionRequest {
    None,
    SetOutputPosition(f32),
    SetOutputPositionNearest(f32),
    RequireReindex,
}

/// Background-written, ISR-read slots for the three sources.
pub static SOURCE_SLOTS: [SeqLock<SourceSample>; MAX_SOURCES] = [
    SeqLock::new(SourceSample::new_const()),
    SeqLock::new(SourceSample::new_const()),
    SeqLock::new(SourceSample::new_const()),
];

/// Host commands into the ISR.
pub static COMMAND_MAILBOX: Mailbox<CommandData> = Mailbox::new(CommandData::new_const());

/// Rezero/reindex requests into the ISR.
pub static POSITION_REQUEST: Mailbox<PositionRequest> = Mailbox::new(PositionRequest::None);

/// Cycle snapshots out of the ISR.
pub static TELEMETRY: TelemetryRing = TelemetryRing::new();

/// Background-published configuration; the ISR adopts it on stop and
/// on mode entry from stopped, never mid-flight.
pub static CONFIG_SHARED: SeqLock<Option<RuntimeConfig>> = SeqLock::new(None);

/// Set by the command server on any config write; a dirty config in a
/// closed-loop mode raises `ConfigChanged`. Cleared when the ISR
/// adopts the published config.
pub static CONFIG_DIRTY: AtomicBool = AtomicBool::new(false);

/// Calibration results out of the ISR, for the background to merge
/// into its configuration and persist on `conf write`.
pub static CALIBRATION_RESULT: SeqLock<Option<CalibrationData>> = SeqLock::new(None);

/// Measured inductance out of the ISR.
pub static INDUCTANCE_RESULT: SeqLock<Option<f32>> = SeqLock::new(None);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seqlock_round_trip() {
        let lock: SeqLock<u64> = SeqLock::new(0);
        lock.write(42);
        assert_eq!(lock.read(), 42);
        lock.write(43);
        assert_eq!(lock.read(), 43);
    }

    #[test]
    fn test_seqlock_sequence_parity() {
        let lock: SeqLock<u32> = SeqLock::new(0);
        for i in 0..10 {
            lock.write(i);
            // After every complete write the sequence is even.
            assert_eq!(lock.seq.load(Ordering::Relaxed) % 2, 0);
        }
        assert_eq!(lock.seq.load(Ordering::Relaxed), 20);
    }

    #[test]
    fn test_mailbox_generation() {
        let mailbox: Mailbox<u32> = Mailbox::new(0);
        let (gen0, _) = mailbox.read();
        mailbox.publish(7);
        let (gen1, value) = mailbox.read();
        assert_eq!(value, 7);
        assert_eq!(gen1, gen0 + 1);
        // Re-reading does not advance the generation.
        let (gen2, _) = mailbox.read();
        assert_eq!(gen2, gen1);
    }

    #[test]
    fn test_telemetry_ring_latest() {
        let ring = TelemetryRing::new();
        assert_eq!(ring.publications(), 0);

        let mut cycle = ControlCycle::new_const();
        for i in 1..=20u32 {
            cycle.timestamp_us = i;
            ring.publish(&cycle);
            assert_eq!(ring.latest().timestamp_us, i);
        }
        assert_eq!(ring.publications(), 20);
    }
}
