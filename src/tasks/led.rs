//! Status LED: slow heartbeat when healthy, 2.5 Hz blink while
//! faulted.

use embassy_stm32::gpio::Output;
use embassy_time::{Duration, Timer};

use crate::errors::FaultCode;
use crate::state::TELEMETRY;

#[embassy_executor::task]
pub async fn led_task(mut status: Output<'static>, mut fault: Output<'static>) {
    let mut counter = 0u32;
    loop {
        let cycle = TELEMETRY.latest();
        if cycle.fault != FaultCode::Success {
            fault.toggle();
            status.set_low();
            Timer::after(Duration::from_millis(200)).await;
            continue;
        }
        fault.set_low();

        // 1 Hz heartbeat with a short on-time.
        counter = counter.wrapping_add(1);
        if counter % 10 == 0 {
            status.set_high();
        } else {
            status.set_low();
        }
        Timer::after(Duration::from_millis(100)).await;
    }
}
