//! Background encoder pollers.
//!
//! Non-ISR sources run their bus transactions here and publish fresh
//! samples into the seqlock slots; the control ISR only ever reads the
//! slots. Digital sources (hall, software quadrature) are sampled
//! every pass; bused sources pace themselves with their own timeouts.

use embassy_stm32::gpio::Input;
use embassy_time::{Duration, Ticker};

use crate::encoder::aksim2::Aksim2;
use crate::encoder::amt21::CuiAmt21;
use crate::encoder::hall::HallSource;
use crate::encoder::i2c::I2cEncoder;
use crate::encoder::quadrature::{QuadratureHw, QuadratureSw};
use crate::encoder::SourceSample;
use crate::state::SOURCE_SLOTS;

/// A background-polled source bound to its slot index.
pub enum BackgroundSource {
    Aksim2(Aksim2),
    Amt21(CuiAmt21),
    I2c(I2cEncoder),
    Hall {
        decoder: HallSource,
        pins: [Input<'static>; 3],
    },
    QuadratureSw {
        decoder: QuadratureSw,
        a: Input<'static>,
        b: Input<'static>,
    },
    QuadratureHw {
        decoder: QuadratureHw,
        /// Reads the hardware quadrature counter.
        read_counter: fn() -> u16,
    },
    SinCos {
        decoder: crate::encoder::sincos::SinCosSource,
        /// Reads the (sin, cos) analog channels.
        read_channels: fn() -> (u16, u16),
    },
}

impl BackgroundSource {
    async fn poll(&mut self, sample: &mut SourceSample) {
        match self {
            BackgroundSource::Aksim2(encoder) => encoder.poll(sample).await,
            BackgroundSource::Amt21(encoder) => encoder.poll(sample).await,
            BackgroundSource::I2c(encoder) => encoder.poll(sample).await,
            BackgroundSource::Hall { decoder, pins } => {
                let code = (pins[0].is_high() as u8)
                    | ((pins[1].is_high() as u8) << 1)
                    | ((pins[2].is_high() as u8) << 2);
                decoder.update(code, sample);
            }
            BackgroundSource::QuadratureSw { decoder, a, b } => {
                decoder.update(a.is_high(), b.is_high(), sample);
            }
            BackgroundSource::QuadratureHw {
                decoder,
                read_counter,
            } => {
                decoder.update(read_counter(), sample);
            }
            BackgroundSource::SinCos {
                decoder,
                read_channels,
            } => {
                let (sin, cos) = read_channels();
                decoder.update(sin, cos, sample);
            }
        }
    }
}

/// One slot's poller state: the local sample copy is published to the
/// seqlock after every change.
pub struct SlotPoller {
    pub slot: usize,
    pub source: BackgroundSource,
    sample: SourceSample,
}

impl SlotPoller {
    pub fn new(slot: usize, source: BackgroundSource) -> Self {
        Self {
            slot,
            source,
            sample: SourceSample::new_const(),
        }
    }
}

#[embassy_executor::task]
pub async fn encoder_poll_task(mut pollers: heapless::Vec<SlotPoller, 3>) {
    info!("Encoder poll loop started ({} sources)", pollers.len());

    let mut ticker = Ticker::every(Duration::from_micros(200));
    loop {
        for poller in pollers.iter_mut() {
            let before = (poller.sample.nonce, poller.sample.active);
            poller.source.poll(&mut poller.sample).await;
            if (poller.sample.nonce, poller.sample.active) != before {
                SOURCE_SLOTS[poller.slot].write(poller.sample);
            }
        }
        ticker.next().await;
    }
}
