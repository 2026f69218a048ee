#![no_std]
#![no_main]

mod fmt;

mod cli;
mod config;
mod control;
mod encoder;
mod errors;
mod firmware_info;
mod foc;
mod hardware;
mod isr;
mod motor_driver;
mod position;
mod protocol;
mod registers;
mod safety;
mod sampling;
mod state;
mod tasks;
mod telemetry;

#[cfg(not(feature = "defmt"))]
use panic_halt as _;
#[cfg(feature = "defmt")]
use {defmt_rtt as _, panic_probe as _};

use embassy_executor::Spawner;
use embassy_stm32::{
    adc::Adc,
    can,
    flash::Flash,
    gpio::{Input, Level, Output, Pull, Speed},
    spi,
    time::Hertz,
    timer::{
        complementary_pwm::{ComplementaryPwm, ComplementaryPwmPin},
        low_level::CountingMode,
        simple_pwm::PwmPin,
        Channel,
    },
    usart::{self, Uart},
};
use embassy_sync::mutex::Mutex;
use embassy_time::{Duration, Timer};
use static_cell::StaticCell;

use crate::config::{params, storage};
use crate::encoder::as5047::As5047;
use crate::encoder::SourceKind;
use crate::firmware_info::FirmwareInfo;
use crate::hardware::{HardwareProfile, Irqs};
use crate::isr::ControlContext;
use crate::motor_driver::MotorDriver;
use crate::position::MotorPosition;
use crate::sampling::CurrentSampler;
use crate::state::CONFIG_SHARED;
use crate::tasks::{
    can_task, cli_task, encoder_poll_task,
    encoder_poll::{BackgroundSource, SlotPoller},
    led_task, ServerState, SharedServer,
};

static SERVER: StaticCell<SharedServer> = StaticCell::new();

#[embassy_executor::main]
async fn main(spawner: Spawner) {
    let clock_config = hardware::create_clock_config();
    let p = embassy_stm32::init(clock_config);

    let profile = HardwareProfile::detect();
    let firmware = FirmwareInfo::read(profile.hardware_rev);
    info!(
        "g4-servo starting: abi {:#06x}, hw rev {}",
        firmware.abi_version, firmware.hardware_rev
    );

    // Configuration comes up first; everything else is built from it.
    let mut flash = Flash::new_blocking(p.FLASH);
    let mut runtime_config = storage::load_or_default(&mut flash);
    runtime_config.sampling.motor_thermistor_fitted = profile.motor_thermistor_fitted;
    runtime_config.pwm_rate_hz = runtime_config
        .pwm_rate_hz
        .clamp(params::MIN_PWM_RATE_HZ, params::MAX_PWM_RATE_HZ);
    CONFIG_SHARED.write(Some(runtime_config));

    info!(
        "Config: pwm {} Hz, poles {}, kt {}",
        runtime_config.pwm_rate_hz,
        runtime_config.motor.pole_pairs,
        runtime_config.motor.torque_constant
    );

    // Status LEDs.
    let status_led = Output::new(p.PC13, Level::Low, Speed::Low);
    let fault_led = Output::new(p.PC14, Level::Low, Speed::Low);
    unwrap!(spawner.spawn(led_task(status_led, fault_led)));

    // FDCAN register server.
    let mut can_configurator = can::CanConfigurator::new(p.FDCAN1, p.PA11, p.PA12, Irqs);
    can_configurator.properties().set_extended_filter(
        can::filter::ExtendedFilterSlot::_0,
        can::filter::ExtendedFilter::accept_all_into_fifo0(),
    );
    can_configurator.set_bitrate(params::can::DEFAULT_BITRATE);
    can_configurator.set_fd_data_bitrate(params::can::DEFAULT_DATA_BITRATE, true);
    let can = can_configurator.start(can::OperatingMode::NormalOperationMode);

    let server = SERVER.init(Mutex::new(ServerState {
        config: runtime_config,
        command: Default::default(),
        config_dirty: false,
        firmware,
    }));
    unwrap!(spawner.spawn(can_task(can, server)));

    // Debug CLI on USART3; it also owns the flash for `conf write`.
    let mut uart_config = usart::Config::default();
    uart_config.baudrate = 460_800;
    let cli_uart = unwrap!(Uart::new(
        p.USART3, p.PC11, p.PC10, Irqs, p.DMA1_CH1, p.DMA1_CH2, uart_config,
    ));
    unwrap!(spawner.spawn(cli_task(cli_uart, flash, server)));

    // ADCs: powered and calibrated by the HAL, then handed to the
    // injected sequencer triggered from TIM1.
    let _adc1 = Adc::new(p.ADC1);
    let _adc2 = Adc::new(p.ADC2);
    let _adc3 = Adc::new(p.ADC3);
    let _adc4 = Adc::new(p.ADC4);
    let _adc5 = Adc::new(p.ADC5);
    unsafe { hardware::init_injected_sampling() };

    // Three-phase complementary PWM on TIM1, center-aligned so the
    // injected trigger lands mid low-side window.
    let mut pwm = ComplementaryPwm::new(
        p.TIM1,
        Some(PwmPin::new_ch1(p.PE9, embassy_stm32::gpio::OutputType::PushPull)),
        Some(ComplementaryPwmPin::new_ch1(
            p.PE8,
            embassy_stm32::gpio::OutputType::PushPull,
        )),
        Some(PwmPin::new_ch2(p.PE11, embassy_stm32::gpio::OutputType::PushPull)),
        Some(ComplementaryPwmPin::new_ch2(
            p.PE10,
            embassy_stm32::gpio::OutputType::PushPull,
        )),
        Some(PwmPin::new_ch3(p.PE13, embassy_stm32::gpio::OutputType::PushPull)),
        Some(ComplementaryPwmPin::new_ch3(
            p.PE12,
            embassy_stm32::gpio::OutputType::PushPull,
        )),
        None,
        None,
        Hertz(runtime_config.pwm_rate_hz),
        CountingMode::CenterAlignedUpInterrupts,
    );
    pwm.set_dead_time(params::pwm::DEFAULT_DEAD_TIME);
    pwm.disable(Channel::Ch1);
    pwm.disable(Channel::Ch2);
    pwm.disable(Channel::Ch3);

    // DRV8323 pre-driver control lines.
    let drv_enable = Output::new(p.PB5, Level::Low, Speed::Low);
    let drv_fault_n = Input::new(p.PB4, Pull::Up);
    let driver = MotorDriver::new(pwm, drv_enable, drv_fault_n);

    // On-board SPI encoder, sampled from the control ISR.
    // External SPI encoders share the port and framing; only the CS
    // routing differs on this board.
    let onboard = if matches!(
        runtime_config.position.sources[0].kind,
        SourceKind::OnboardSpi | SourceKind::ExternalSpi
    ) {
        let mut spi_config = spi::Config::default();
        spi_config.frequency = Hertz(10_000_000);
        spi_config.mode = spi::MODE_1;
        let spi = spi::Spi::new_blocking(p.SPI1, p.PA5, p.PA7, p.PA6, spi_config);
        let cs = Output::new(p.PA4, Level::High, Speed::VeryHigh);
        Some(As5047::new(spi, cs))
    } else {
        None
    };

    // Background sources for the remaining slots. Each bused source
    // takes its peripheral singleton; a second source of the same kind
    // cannot bind and is skipped with a warning.
    let mut aux_uart = Some((p.USART2, p.PA3, p.PA2, p.DMA1_CH3, p.DMA1_CH4));
    let mut aux_i2c = Some((p.I2C1, p.PB8, p.PB9, p.DMA1_CH5, p.DMA1_CH6));
    let mut aux_quad_pins = Some((p.PB6, p.PB7));
    let mut aux_hall_pins = Some((p.PC6, p.PC7, p.PC8));

    let mut pollers: heapless::Vec<SlotPoller, 3> = heapless::Vec::new();
    for (slot, source_config) in runtime_config.position.sources.iter().enumerate() {
        if !source_config.enabled {
            continue;
        }
        let source = match source_config.kind {
            SourceKind::None | SourceKind::OnboardSpi | SourceKind::ExternalSpi => None,
            SourceKind::Aksim2 => aux_uart.take().map(|(peri, rx, tx, tx_dma, rx_dma)| {
                let mut uart_config = usart::Config::default();
                uart_config.baudrate = 2_000_000;
                let uart =
                    unwrap!(Uart::new(peri, rx, tx, Irqs, tx_dma, rx_dma, uart_config));
                BackgroundSource::Aksim2(encoder::aksim2::Aksim2::new(
                    uart,
                    params::DEFAULT_UART_POLL_RATE_US,
                ))
            }),
            SourceKind::CuiAmt21 => aux_uart.take().map(|(peri, rx, tx, tx_dma, rx_dma)| {
                let mut uart_config = usart::Config::default();
                uart_config.baudrate = 115_200;
                let uart =
                    unwrap!(Uart::new(peri, rx, tx, Irqs, tx_dma, rx_dma, uart_config));
                BackgroundSource::Amt21(encoder::amt21::CuiAmt21::new(
                    uart,
                    0x54,
                    params::DEFAULT_UART_POLL_RATE_US,
                ))
            }),
            SourceKind::I2c => aux_i2c.take().map(|(peri, scl, sda, tx_dma, rx_dma)| {
                let i2c = embassy_stm32::i2c::I2c::new(
                    peri,
                    scl,
                    sda,
                    Irqs,
                    tx_dma,
                    rx_dma,
                    Hertz(400_000),
                    Default::default(),
                );
                let device = encoder::i2c::I2cDevice::As5048b;
                BackgroundSource::I2c(encoder::i2c::I2cEncoder::new(
                    i2c,
                    device,
                    device.default_address(),
                    params::DEFAULT_I2C_POLL_RATE_US,
                ))
            }),
            SourceKind::QuadratureSw => aux_quad_pins.take().map(|(a, b)| {
                BackgroundSource::QuadratureSw {
                    decoder: encoder::quadrature::QuadratureSw::new(source_config.cpr),
                    a: Input::new(a, Pull::Up),
                    b: Input::new(b, Pull::Up),
                }
            }),
            SourceKind::QuadratureHw => {
                unsafe { hardware::init_qei_counter() };
                Some(BackgroundSource::QuadratureHw {
                    decoder: encoder::quadrature::QuadratureHw::new(source_config.cpr),
                    read_counter: hardware::read_qei_counter,
                })
            }
            SourceKind::Hall => aux_hall_pins.take().map(|(h1, h2, h3)| {
                BackgroundSource::Hall {
                    decoder: encoder::hall::HallSource::new(0, source_config.cpr),
                    pins: [
                        Input::new(h1, Pull::Up),
                        Input::new(h2, Pull::Up),
                        Input::new(h3, Pull::Up),
                    ],
                }
            }),
            SourceKind::SinCos => Some(BackgroundSource::SinCos {
                decoder: encoder::sincos::SinCosSource::new(2048, source_config.cpr),
                read_channels: hardware::read_sincos_adc,
            }),
            SourceKind::Index => None, // handled by the EXTI watcher below
        };
        match source {
            Some(source) => {
                let _ = pollers.push(SlotPoller::new(slot, source));
            }
            None if !matches!(
                source_config.kind,
                SourceKind::None
                    | SourceKind::OnboardSpi
                    | SourceKind::ExternalSpi
                    | SourceKind::Index
            ) =>
            {
                warn!("source {} of kind {:?} could not bind", slot, source_config.kind);
            }
            None => {}
        }
    }
    unwrap!(spawner.spawn(encoder_poll_task(pollers)));

    if runtime_config.position.index_configured {
        let index_pin = embassy_stm32::exti::ExtiInput::new(p.PC4, p.EXTI4, Pull::Down);
        unwrap!(spawner.spawn(index_task(index_pin)));
    }

    unsafe { hardware::enable_cycle_counter() };

    // Control context: everything the ISR owns, built last and then
    // armed.
    let sampler = CurrentSampler::new(
        runtime_config.sampling,
        runtime_config.calibration.current_offsets,
    );
    let motor_position = MotorPosition::new(
        runtime_config.position,
        runtime_config.calibration.commutation_offset,
    );
    let context = ControlContext::new(
        driver,
        onboard,
        sampler,
        motor_position,
        runtime_config,
        profile.timer_clock_hz,
    );
    isr::install(context);
    info!("Control loop armed at {} Hz", runtime_config.pwm_rate_hz);

    loop {
        Timer::after(Duration::from_millis(100)).await;
    }
}

#[embassy_executor::task]
async fn index_task(pin: embassy_stm32::exti::ExtiInput<'static>) {
    encoder::index::watch_index(pin, &isr::INDEX_LATCH).await;
}
