//! The PWM-synchronized control cycle.
//!
//! Runs in the TIM1 update interrupt at the PWM rate. Strict per-cycle
//! order: sample → position → host input → safety → mode machine →
//! outer loop → current loop → PWM write → telemetry publish. No
//! allocation, no locks, no blocking.

use core::f32::consts::TAU;
use core::ptr::addr_of_mut;
use core::sync::atomic::Ordering;

use embassy_stm32::interrupt;

use crate::config::{params, RuntimeConfig};
use crate::control::{
    validate_entry, CommandData, CurrentOffsetCalibration, EncoderCalibration, Entry,
    EntryChecks, InductanceMeasurement, LoopCommand, Measured, Mode, OuterLoop, Watchdog,
};
use crate::encoder::as5047::As5047;
use crate::encoder::index::IndexLatch;
use crate::encoder::SourceSample;
use crate::errors::FaultCode;
use crate::foc::{
    calculate_svpwm, clarke, inverse_park, park, sin_cos, wrap_half_rad, CurrentLoop, PwmDuties,
    TorqueModel,
};
use crate::hardware;
use crate::motor_driver::MotorDriver;
use crate::position::{MotorPosition, MAX_SOURCES};
use crate::safety::{FaultMonitor, SafetyInputs};
use crate::sampling::{CurrentSampler, Samples};
use crate::state::{
    PositionRequest, CALIBRATION_RESULT, COMMAND_MAILBOX, CONFIG_DIRTY, CONFIG_SHARED,
    INDUCTANCE_RESULT, POSITION_REQUEST, SOURCE_SLOTS, TELEMETRY,
};
use crate::telemetry::ControlCycle;

/// Index pulse latch, written by the EXTI waiter task.
pub static INDEX_LATCH: IndexLatch = IndexLatch::new();

pub struct ControlContext {
    driver: MotorDriver,
    /// On-board SPI encoder, sampled inside the ISR; feeds source 0.
    onboard: Option<As5047>,
    onboard_sample: SourceSample,
    sampler: CurrentSampler,
    position: MotorPosition,
    current_loop: CurrentLoop,
    outer: OuterLoop,
    monitor: FaultMonitor,
    watchdog: Watchdog,

    config: RuntimeConfig,
    command: CommandData,
    last_command_generation: u32,
    last_position_request_generation: u32,

    mode: Mode,
    fault: FaultCode,
    /// Enabling pass-through state.
    pending_mode: Mode,
    enabling_cycles_left: u32,

    current_cal: CurrentOffsetCalibration,
    encoder_cal: EncoderCalibration,
    inductance: InductanceMeasurement,
    /// Unwrapped sensed electrical angle fed to the encoder sweep.
    cal_sensed_electrical: f32,
    cal_last_mech: f32,
    /// Rotor angle frozen at inductance-measurement entry.
    inductance_theta: f32,

    rate_hz: u32,
    dt: f32,
    pwm_period_cycles: u32,
    /// Above 40 kHz the outer loop runs every other cycle.
    outer_divisor: u32,
    cycle_index: u32,
    last_outer: Option<crate::control::OuterOutput>,
    timestamp_us: u32,
    last_isr_cycles: u32,
}

impl ControlContext {
    pub fn new(
        driver: MotorDriver,
        onboard: Option<As5047>,
        sampler: CurrentSampler,
        position: MotorPosition,
        config: RuntimeConfig,
        timer_clock_hz: u32,
    ) -> Self {
        let rate_hz = config
            .pwm_rate_hz
            .clamp(params::MIN_PWM_RATE_HZ, params::MAX_PWM_RATE_HZ);
        let torque_model = TorqueModel::new(
            config.motor.torque_constant,
            config.motor.current_cutoff_a,
            config.motor.current_scale,
            config.motor.torque_scale,
        );
        Self {
            driver,
            onboard,
            onboard_sample: SourceSample::new_const(),
            sampler,
            position,
            current_loop: CurrentLoop::new(config.current_loop),
            outer: OuterLoop::new(config.position_pid, config.limits, torque_model),
            monitor: FaultMonitor::new(config.safety),
            watchdog: Watchdog::new(config.default_timeout_s, config.position_timeout_s),
            config,
            command: CommandData::default(),
            last_command_generation: 0,
            last_position_request_generation: 0,
            mode: Mode::Stopped,
            fault: FaultCode::Success,
            pending_mode: Mode::Stopped,
            enabling_cycles_left: 0,
            current_cal: CurrentOffsetCalibration::new(
                params::CURRENT_CAL_SETTLE_CYCLES,
                params::CURRENT_CAL_SAMPLES,
            ),
            encoder_cal: EncoderCalibration::new(
                config.position.pole_pairs.max(1),
                params::ENCODER_CAL_VOLTAGE,
                params::ENCODER_CAL_RATE_RAD_S,
                rate_hz,
            ),
            inductance: InductanceMeasurement::new(
                params::INDUCTANCE_VOLTAGE,
                params::INDUCTANCE_HALF_PERIOD_CYCLES,
                params::INDUCTANCE_PERIODS,
            ),
            cal_sensed_electrical: 0.0,
            cal_last_mech: 0.0,
            inductance_theta: 0.0,
            rate_hz,
            dt: 1.0 / rate_hz as f32,
            pwm_period_cycles: timer_clock_hz / rate_hz,
            outer_divisor: if rate_hz > 40_000 { 2 } else { 1 },
            cycle_index: 0,
            last_outer: None,
            timestamp_us: 0,
            last_isr_cycles: 0,
        }
    }

    /// One full control cycle.
    pub fn isr_cycle(&mut self) {
        let start = hardware::cycle_count();
        self.timestamp_us = self
            .timestamp_us
            .wrapping_add((1_000_000 / self.rate_hz).max(1));

        // 1. Sampling.
        let raw = hardware::read_injected();
        let samples = self.sampler.update(&raw);

        // 2. Position: on-board SPI sampled here, background sources
        //    from their slots.
        let mut source_samples: [SourceSample; MAX_SOURCES] = [
            SOURCE_SLOTS[0].read(),
            SOURCE_SLOTS[1].read(),
            SOURCE_SLOTS[2].read(),
        ];
        if let Some(encoder) = self.onboard.as_mut() {
            encoder.isr_update(&mut self.onboard_sample);
            source_samples[0] = self.onboard_sample;
        }
        self.position.isr_update(&source_samples, self.dt);
        if INDEX_LATCH.take() {
            self.position.on_index_pulse();
        }

        // 3. Host input.
        self.consume_mailboxes();

        // 4. Safety.
        let status = *self.position.status();
        let inputs = SafetyInputs {
            driver_fault: self.mode.is_active() && self.driver.fault_asserted(),
            v_bus: samples.v_bus,
            fet_temp_c: samples.fet_temp_c,
            motor_temp_c: samples.motor_temp_c,
            theta_required: self.mode.requires_theta(),
            theta_valid: status.theta_valid,
            position_required: self.mode.requires_position(),
            position_valid: status.position_valid,
            position_fault: status.error,
            isr_cycles: self.last_isr_cycles,
            pwm_period_cycles: self.pwm_period_cycles,
        };
        if let Some(code) = self.monitor.check(&inputs) {
            if self.mode != Mode::Fault {
                self.latch_fault(code);
            }
        }

        // Config edits apply immediately while stopped; mid-flight
        // they force a re-entry instead.
        if CONFIG_DIRTY.load(Ordering::Acquire) {
            if self.mode == Mode::Stopped {
                self.adopt_published_config();
            } else if self.mode.is_active() && self.mode != Mode::Enabling {
                self.latch_fault(FaultCode::ConfigChanged);
            }
        }

        // 5. Watchdog.
        if let Some(demoted) = self.watchdog.tick(self.dt, self.mode) {
            if self.mode != Mode::Fault {
                self.enter_mode(demoted);
            }
        }

        // 6. Mode machine + control.
        let measured = Measured {
            position: status.output_position,
            velocity: status.output_velocity,
            velocity_rad_s: status.output_velocity * TAU,
        };
        let output = self.run_mode(&samples, &status, &measured);

        // 7. Publish the cycle.
        let mut cycle = ControlCycle {
            timestamp_us: self.timestamp_us,
            i_abc: samples.i_abc,
            i_abc_filtered: samples.i_abc_filtered,
            v_bus: samples.v_bus,
            fet_temp_c: samples.fet_temp_c,
            motor_temp_c: samples.motor_temp_c,
            electrical_theta: status.electrical_theta,
            position: status.output_position,
            velocity: status.output_velocity,
            mode: self.mode,
            fault: self.fault,
            isr_cycles: self.last_isr_cycles,
            ..ControlCycle::new_const()
        };
        cycle.i_d_a = output.i_d_a;
        cycle.i_q_a = output.i_q_a;
        cycle.i_d_ref_a = output.i_d_ref_a;
        cycle.i_q_ref_a = output.i_q_ref_a;
        cycle.v_d = output.v_d;
        cycle.v_q = output.v_q;
        cycle.duties = output.duties;
        cycle.torque_nm = output.torque_nm;
        TELEMETRY.publish(&cycle);

        self.last_isr_cycles = hardware::cycle_count().wrapping_sub(start);
    }

    fn consume_mailboxes(&mut self) {
        let (generation, command) = COMMAND_MAILBOX.read();
        if generation != self.last_command_generation {
            self.last_command_generation = generation;
            self.watchdog.feed(command.watchdog_timeout);
            let target = command.mode;
            self.command = command;
            if target != self.mode {
                self.request_mode(target);
            }
        }

        let (generation, request) = POSITION_REQUEST.read();
        if generation != self.last_position_request_generation {
            self.last_position_request_generation = generation;
            match request {
                PositionRequest::None => {}
                PositionRequest::SetOutputPosition(position) => {
                    self.position.set_output_position(position);
                }
                PositionRequest::SetOutputPositionNearest(position) => {
                    self.position.set_output_position_nearest(position);
                }
                PositionRequest::RequireReindex => {
                    self.position.require_reindex();
                }
            }
        }
    }

    fn request_mode(&mut self, target: Mode) {
        let status = self.position.status();
        let checks = EntryChecks {
            motor_configured: self.config.motor.configured(),
            config_dirty: CONFIG_DIRTY.load(Ordering::Acquire),
            voltage_ok: self.monitor.voltage_ok(),
            theta_valid: status.theta_valid,
            position_valid: status.position_valid,
            position_error: status.output_position - self.command.position,
            start_position_limit: self.config.start_position_limit,
        };
        match validate_entry(self.mode, target, &checks) {
            Entry::Direct(mode) => self.enter_mode(mode),
            Entry::ViaEnabling(pending) => {
                self.driver.enable_driver();
                self.pending_mode = pending;
                self.enabling_cycles_left =
                    (params::DRIVER_ENABLE_DELAY_MS as u32 * self.rate_hz) / 1000;
                self.enter_mode(Mode::Enabling);
            }
            Entry::Refused(FaultCode::Success) => {}
            Entry::Refused(code) => self.latch_fault(code),
        }
    }

    fn enter_mode(&mut self, mode: Mode) {
        let previous = self.mode;
        self.mode = mode;
        self.last_outer = None;

        match mode {
            Mode::Stopped => {
                self.driver.disable_driver();
                // An explicit stop clears the latch; if the condition
                // persists the next cycle's checks re-latch it.
                self.fault = FaultCode::Success;
                self.adopt_published_config();
                self.current_loop.reset();
                self.outer.pid_state.clear();
            }
            Mode::Fault => {
                // latch_fault handles the power stage.
            }
            Mode::Enabling => {}
            Mode::CalibratingCurrent => {
                self.current_cal =
                    CurrentOffsetCalibration::new(
                        params::CURRENT_CAL_SETTLE_CYCLES,
                        params::CURRENT_CAL_SAMPLES,
                    );
                self.current_cal.start();
            }
            Mode::CalibratingEncoder => {
                self.encoder_cal = EncoderCalibration::new(
                    self.config.position.pole_pairs.max(1),
                    params::ENCODER_CAL_VOLTAGE,
                    params::ENCODER_CAL_RATE_RAD_S,
                    self.rate_hz,
                );
                self.encoder_cal.start();
                self.cal_sensed_electrical = 0.0;
                self.cal_last_mech = self.position.status().mechanical_theta_wrapped;
            }
            Mode::MeasureInductance => {
                self.inductance = InductanceMeasurement::new(
                    params::INDUCTANCE_VOLTAGE,
                    params::INDUCTANCE_HALF_PERIOD_CYCLES,
                    params::INDUCTANCE_PERIODS,
                );
                self.inductance_theta = self.position.status().electrical_theta;
                self.current_loop.reset();
            }
            _ => {
                let keep_integral = previous.is_pid_family() && mode.is_pid_family();
                let status = self.position.status();
                let measured = Measured {
                    position: status.output_position,
                    velocity: status.output_velocity,
                    velocity_rad_s: status.output_velocity * TAU,
                };
                self.outer.enter(&measured, keep_integral);
                if !(previous.is_pid_family() && mode.is_pid_family()) {
                    self.current_loop.reset();
                }
            }
        }
    }

    fn latch_fault(&mut self, code: FaultCode) {
        self.driver.disable_driver();
        self.fault = code;
        self.mode = Mode::Fault;
    }

    /// Pick up the background's config copy; only safe when the power
    /// stage is off.
    fn adopt_published_config(&mut self) {
        if let Some(config) = CONFIG_SHARED.read() {
            self.config = config;
            self.current_loop = CurrentLoop::new(config.current_loop);
            let torque_model = TorqueModel::new(
                config.motor.torque_constant,
                config.motor.current_cutoff_a,
                config.motor.current_scale,
                config.motor.torque_scale,
            );
            self.outer = OuterLoop::new(config.position_pid, config.limits, torque_model);
            self.monitor = FaultMonitor::new(config.safety);
            self.watchdog =
                Watchdog::new(config.default_timeout_s, config.position_timeout_s);
            self.sampler
                .set_offsets(config.calibration.current_offsets);
            self.position
                .set_commutation_offset(config.calibration.commutation_offset);
            CONFIG_DIRTY.store(false, Ordering::Release);
        }
    }

    /// Outputs of the mode-specific control path, for telemetry.
    fn run_mode(
        &mut self,
        samples: &Samples,
        status: &crate::position::PositionStatus,
        measured: &Measured,
    ) -> CycleOutput {
        let i_abc = &samples.i_abc;
        let v_bus = samples.v_bus;
        let mut out = CycleOutput::default();
        // Measured dq at the commutation angle, for telemetry in every
        // mode (the current loop recomputes its own).
        let (sin, cos) = sin_cos(status.electrical_theta);
        let (i_alpha, i_beta) = clarke(i_abc.0, i_abc.1, i_abc.2);
        let (i_d, i_q) = park(i_alpha, i_beta, sin, cos);
        out.i_d_a = i_d;
        out.i_q_a = i_q;

        match self.mode {
            Mode::Stopped | Mode::Fault => {
                self.driver.stop();
            }
            Mode::Enabling => {
                if self.enabling_cycles_left > 0 {
                    self.enabling_cycles_left -= 1;
                    return out;
                }
                if self.driver.fault_asserted() {
                    self.latch_fault(FaultCode::DriverEnableFault);
                } else {
                    let pending = self.pending_mode;
                    self.enter_mode(pending);
                }
            }
            Mode::CalibratingCurrent => {
                // 50 % on all phases: zero average phase voltage.
                let duties = PwmDuties { a: 0.5, b: 0.5, c: 0.5 };
                self.driver.write_duties(&duties);
                out.duties = duties;
                // The sampler already subtracted the stale offsets;
                // undo that to average the raw readings.
                let offsets = *self.sampler.offsets();
                let raw = (
                    i_abc.0 + offsets[0],
                    i_abc.1 + offsets[1],
                    i_abc.2 + offsets[2],
                );
                if self.current_cal.update(raw) {
                    self.sampler.set_offsets(self.current_cal.offsets);
                    self.config.calibration.current_offsets = self.current_cal.offsets;
                    CALIBRATION_RESULT.write(Some(self.config.calibration));
                    self.enter_mode(Mode::Stopped);
                }
            }
            Mode::CalibratingEncoder => {
                // Track the unwrapped sensed electrical angle.
                let mech = status.mechanical_theta_wrapped;
                let delta = wrap_half_rad((mech - self.cal_last_mech) * TAU);
                self.cal_last_mech = mech;
                self.cal_sensed_electrical +=
                    delta * self.config.position.pole_pairs.max(1) as f32;

                match self.encoder_cal.update(self.cal_sensed_electrical) {
                    Ok((theta, voltage)) => {
                        let (s, c) = sin_cos(theta);
                        let (va, vb) = inverse_park(voltage, 0.0, s, c);
                        let duties = calculate_svpwm(
                            va,
                            vb,
                            v_bus,
                            self.config.current_loop.d_min,
                            self.config.current_loop.d_max,
                        );
                        self.driver.write_duties(&duties);
                        out.duties = duties;
                        if self.encoder_cal.is_completed() {
                            let result = *self.encoder_cal.result();
                            if result.success {
                                self.config.calibration.commutation_offset = result.table;
                                self.config.calibration.valid = true;
                                self.position.set_commutation_offset(result.table);
                                CALIBRATION_RESULT.write(Some(self.config.calibration));
                                self.enter_mode(Mode::Stopped);
                            }
                        }
                    }
                    Err(code) => self.latch_fault(code),
                }
            }
            Mode::MeasureInductance => {
                let (s, c) = sin_cos(self.inductance_theta);
                let (i_d_meas, _) = park(i_alpha, i_beta, s, c);
                match self.inductance.update(i_d_meas, self.dt) {
                    Some(v_d) => {
                        let (va, vb) = inverse_park(v_d, 0.0, s, c);
                        let duties = calculate_svpwm(
                            va,
                            vb,
                            v_bus,
                            self.config.current_loop.d_min,
                            self.config.current_loop.d_max,
                        );
                        self.driver.write_duties(&duties);
                        out.duties = duties;
                        out.v_d = v_d;
                    }
                    None => {
                        self.config.motor.inductance_h = self.inductance.inductance_h;
                        INDUCTANCE_RESULT.write(Some(self.inductance.inductance_h));
                        self.enter_mode(Mode::Stopped);
                    }
                }
            }
            _ => {
                // The current loop runs every cycle; at high PWM rates
                // the outer loop is decimated and its last references
                // are held in between.
                self.cycle_index = self.cycle_index.wrapping_add(1);
                let outer = match self.last_outer {
                    Some(last)
                        if self.outer_divisor > 1
                            && self.cycle_index % self.outer_divisor != 0 =>
                    {
                        last
                    }
                    _ => {
                        let derate = self
                            .monitor
                            .derate(samples.fet_temp_c, samples.motor_temp_c);
                        let outer_rate = self.rate_hz / self.outer_divisor;
                        let output = self.outer.update(
                            self.mode,
                            &self.command,
                            measured,
                            outer_rate,
                            derate,
                        );
                        self.last_outer = Some(output);
                        output
                    }
                };
                out.torque_nm = outer.torque_nm;
                match outer.command {
                    LoopCommand::Idle => self.driver.stop(),
                    LoopCommand::Brake => self.driver.brake(),
                    LoopCommand::Dq { id_a, iq_a } => {
                        out.i_d_ref_a = id_a;
                        out.i_q_ref_a = iq_a;
                        let loop_out = self.current_loop.update(
                            *i_abc,
                            v_bus,
                            status.electrical_theta,
                            id_a,
                            iq_a,
                            outer.torque_limited,
                            self.dt,
                        );
                        self.driver.write_duties(&loop_out.duties);
                        self.outer
                            .note_voltage_clamp(loop_out.clamped, self.rate_hz);
                        out.i_d_a = loop_out.i_d_a;
                        out.i_q_a = loop_out.i_q_a;
                        out.v_d = loop_out.v_d;
                        out.v_q = loop_out.v_q;
                        out.duties = loop_out.duties;
                    }
                    LoopCommand::VoltageFoc { theta, voltage } => {
                        let (s, c) = sin_cos(theta);
                        let (va, vb) = inverse_park(voltage, 0.0, s, c);
                        let duties = calculate_svpwm(
                            va,
                            vb,
                            v_bus,
                            self.config.current_loop.d_min,
                            self.config.current_loop.d_max,
                        );
                        self.driver.write_duties(&duties);
                        out.v_d = voltage;
                        out.duties = duties;
                        self.current_loop.reset();
                    }
                    LoopCommand::VoltageDq { v_d, v_q } => {
                        let (va, vb) = inverse_park(v_d, v_q, sin, cos);
                        let duties = calculate_svpwm(
                            va,
                            vb,
                            v_bus,
                            self.config.current_loop.d_min,
                            self.config.current_loop.d_max,
                        );
                        self.driver.write_duties(&duties);
                        out.v_d = v_d;
                        out.v_q = v_q;
                        out.duties = duties;
                        self.current_loop.reset();
                    }
                }
            }
        }
        out
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct CycleOutput {
    i_d_a: f32,
    i_q_a: f32,
    i_d_ref_a: f32,
    i_q_ref_a: f32,
    v_d: f32,
    v_q: f32,
    duties: PwmDuties,
    torque_nm: f32,
}

static mut CONTROL: Option<ControlContext> = None;

/// Install the control context and arm the timer interrupt. Called
/// once at the end of bring-up.
pub fn install(context: ControlContext) {
    cortex_m::interrupt::free(|_| unsafe {
        *addr_of_mut!(CONTROL) = Some(context);
    });
    unsafe { hardware::arm_control_interrupt() };
}

#[interrupt]
fn TIM1_UP_TIM16() {
    hardware::clear_control_interrupt();
    // Sole consumer: the context is installed before the interrupt is
    // armed and never removed.
    let control = unsafe { (*addr_of_mut!(CONTROL)).as_mut() };
    if let Some(control) = control {
        control.isr_cycle();
    }
}
