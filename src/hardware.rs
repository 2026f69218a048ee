//! Hardware bring-up: clock tree, interrupt bindings, and the few
//! register-level pokes the HAL does not cover (injected ADC
//! sequencing, the PWM update interrupt, the cycle counter).
//!
//! All PAC access is confined to this module; the rest of the core
//! sees typed interfaces only.

use embassy_stm32::{bind_interrupts, can, i2c, pac, peripherals, usart, Config};

use crate::sampling::RawSamples;

bind_interrupts!(pub struct Irqs {
    FDCAN1_IT0 => can::IT0InterruptHandler<peripherals::FDCAN1>;
    FDCAN1_IT1 => can::IT1InterruptHandler<peripherals::FDCAN1>;
    USART2 => usart::InterruptHandler<peripherals::USART2>;
    USART3 => usart::InterruptHandler<peripherals::USART3>;
    I2C1_EV => i2c::EventInterruptHandler<peripherals::I2C1>;
    I2C1_ER => i2c::ErrorInterruptHandler<peripherals::I2C1>;
});

/// Board-level identity and wiring facts decided once at boot.
#[derive(Debug, Clone, Copy)]
pub struct HardwareProfile {
    pub hardware_rev: u32,
    /// Timer clock feeding TIM1 (Hz).
    pub timer_clock_hz: u32,
    pub motor_thermistor_fitted: bool,
}

impl HardwareProfile {
    pub fn detect() -> Self {
        // Revision strapping would be read from option-byte area pins
        // on boards that carry it; the current board is rev 0.
        Self {
            hardware_rev: 0,
            timer_clock_hz: 170_000_000,
            motor_thermistor_fitted: false,
        }
    }
}

/// RCC setup: HSI → PLL (÷4 × 85 ÷ 2) for 170 MHz, PLL1_Q to FDCAN,
/// system clock to the ADCs.
pub fn create_clock_config() -> Config {
    let mut config = Config::default();
    {
        use embassy_stm32::rcc::mux::{Adcsel, ClockMux, Fdcansel};
        use embassy_stm32::rcc::{Pll, PllMul, PllPreDiv, PllQDiv, PllRDiv, PllSource, Sysclk};

        config.rcc.hsi = true;
        config.rcc.pll = Some(Pll {
            source: PllSource::HSI,
            prediv: PllPreDiv::DIV4,
            mul: PllMul::MUL85,
            divp: None,
            divq: Some(PllQDiv::DIV2),
            divr: Some(PllRDiv::DIV2),
        });
        config.rcc.sys = Sysclk::PLL1_R;

        let mut clock_mux = ClockMux::default();
        clock_mux.adc12sel = Adcsel::SYS;
        clock_mux.adc345sel = Adcsel::SYS;
        clock_mux.fdcansel = Fdcansel::PLL1_Q;
        config.rcc.mux = clock_mux;
    }
    config
}

/// Configure injected conversions: ADC1/2/3 sample one phase current
/// each, ADC4 the bus voltage, ADC5 the thermistors, all triggered by
/// TIM1 TRGO2 at the center of the low-side window.
///
/// # Safety
/// Direct register access; call once after the HAL has powered and
/// calibrated the ADCs, before the control interrupt is armed.
pub unsafe fn init_injected_sampling() {
    // Single injected conversion per trigger on the fast chains:
    // phase currents on ADC1/2/3, bus voltage on ADC4.
    let singles = [
        (pac::ADC1, 1u8), // PA0: phase A shunt amp
        (pac::ADC2, 2u8), // PA1: phase C shunt amp
        (pac::ADC3, 5u8), // PB13: phase B shunt amp
        (pac::ADC4, 3u8), // PB12: bus divider
    ];
    for (adc, channel) in singles {
        adc.jsqr().write(|w| {
            // JEXTSEL 8 = tim1_trgo2 on the G4 injected mux.
            w.set_jexten(pac::adc::vals::Exten::RISING_EDGE);
            w.set_jextsel(8);
            w.set_jl(0);
            w.set_jsq(0, channel);
        });
        adc.cr().modify(|w| w.set_jadstart(true));
    }

    // ADC5 runs a two-rank sequence: FET thermistor then motor
    // thermistor.
    pac::ADC5.jsqr().write(|w| {
        w.set_jexten(pac::adc::vals::Exten::RISING_EDGE);
        w.set_jextsel(8);
        w.set_jl(1);
        w.set_jsq(0, 1); // PA8
        w.set_jsq(1, 2); // PA9
    });
    pac::ADC5.cr().modify(|w| w.set_jadstart(true));

    // TRGO2 on update so the injected sequence fires every PWM period.
    pac::TIM1
        .cr2()
        .modify(|w| w.set_mms2(pac::timer::vals::Mms2::UPDATE));
}

/// Latest injected conversion results, one set per PWM period.
#[inline]
pub fn read_injected() -> RawSamples {
    RawSamples {
        i_a: pac::ADC1.jdr(0).read().jdata(),
        i_b: pac::ADC3.jdr(0).read().jdata(),
        i_c: pac::ADC2.jdr(0).read().jdata(),
        vsense: pac::ADC4.jdr(0).read().jdata(),
        tsense: pac::ADC5.jdr(0).read().jdata(),
        msense: pac::ADC5.jdr(1).read().jdata(),
    }
}

/// Configure TIM3 as a hardware quadrature counter on CH1/CH2.
///
/// # Safety
/// Direct register access; call once during bring-up, before the
/// encoder poll loop starts reading the counter.
pub unsafe fn init_qei_counter() {
    pac::TIM3.smcr().modify(|w| w.set_sms(pac::timer::vals::Sms::ENCODER_MODE_3));
    pac::TIM3.arr().write(|w| w.set_arr(0xFFFF));
    pac::TIM3.cr1().modify(|w| w.set_cen(true));
}

/// Current hardware quadrature counter value.
pub fn read_qei_counter() -> u16 {
    pac::TIM3.cnt().read().cnt()
}

/// Software-triggered regular conversions of the sin/cos analog
/// inputs on ADC2 (channels 10/11, PF1/PF0). Background-only; the
/// injected sequence owns the fast channels.
pub fn read_sincos_adc() -> (u16, u16) {
    let mut results = [0u16; 2];
    for (i, channel) in [10u8, 11u8].iter().enumerate() {
        pac::ADC2.sqr1().modify(|w| {
            w.set_l(0);
            w.set_sq(0, *channel);
        });
        pac::ADC2.cr().modify(|w| w.set_adstart(true));
        while !pac::ADC2.isr().read().eoc() {}
        results[i] = pac::ADC2.dr().read().rdata();
    }
    (results[0], results[1])
}

/// Enable the DWT cycle counter (ISR budget measurement).
///
/// # Safety
/// Steals the Cortex-M peripherals; call once during bring-up.
pub unsafe fn enable_cycle_counter() {
    let mut cp = cortex_m::Peripherals::steal();
    cp.DCB.enable_trace();
    cp.DWT.enable_cycle_counter();
}

#[inline]
pub fn cycle_count() -> u32 {
    cortex_m::peripheral::DWT::cycle_count()
}

/// Unmask the TIM1 update interrupt that drives the control cycle.
/// The control context must be installed first.
///
/// # Safety
/// Enables an interrupt that accesses the ISR-owned static state.
pub unsafe fn arm_control_interrupt() {
    use embassy_stm32::interrupt;
    use embassy_stm32::interrupt::InterruptExt;

    pac::TIM1.dier().modify(|w| w.set_uie(true));
    // Highest priority: the control deadline beats everything else.
    interrupt::TIM1_UP_TIM16.set_priority(interrupt::Priority::P0);
    interrupt::TIM1_UP_TIM16.enable();
}

/// Clear the TIM1 update flag at ISR entry.
#[inline]
pub fn clear_control_interrupt() {
    pac::TIM1.sr().modify(|w| w.set_uif(false));
}
