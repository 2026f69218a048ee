// Synchronous-frame current loop: measured phase currents in, PWM
// duties out. Runs once per PWM period inside the control ISR.

use super::pi_controller::PiController;
use super::svpwm::{calculate_svpwm, PwmDuties};
use super::transforms::{clarke, inverse_park, limit_voltage, park, sin_cos};

/// Per-cycle result of the current loop, retained for telemetry.
#[derive(Debug, Clone, Copy, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CurrentLoopOutput {
    pub i_d_a: f32,
    pub i_q_a: f32,
    pub v_d: f32,
    pub v_q: f32,
    pub duties: PwmDuties,
    pub clamped: bool,
}

/// Configuration for the current loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CurrentLoopConfig {
    pub kp: f32,
    pub ki: f32,
    /// Fraction of the bus voltage available as dq magnitude, ≈1/√3.
    pub k_svm: f32,
    /// Per-phase dead-time compensation voltage.
    pub deadtime_comp_v: f32,
    pub d_min: f32,
    pub d_max: f32,
}

impl Default for CurrentLoopConfig {
    fn default() -> Self {
        Self {
            kp: 0.2,
            ki: 90.0,
            k_svm: 0.57,
            deadtime_comp_v: 0.0,
            d_min: 0.02,
            d_max: 0.98,
        }
    }
}

pub struct CurrentLoop {
    config: CurrentLoopConfig,
    pid_d: PiController,
    pid_q: PiController,
}

impl CurrentLoop {
    pub fn new(config: CurrentLoopConfig) -> Self {
        // The output limit tracks the worst-case bus; the real clamp is
        // applied per cycle against the measured bus voltage.
        let limit = 60.0 * config.k_svm;
        Self {
            config,
            pid_d: PiController::new(config.kp, config.ki, limit),
            pid_q: PiController::new(config.kp, config.ki, limit),
        }
    }

    /// Run one cycle of the current loop.
    ///
    /// # Arguments
    /// * `i_abc` - measured phase currents (A)
    /// * `v_bus` - measured bus voltage (V)
    /// * `theta` - electrical angle (rad, [0, 2π))
    /// * `id_ref`, `iq_ref` - current setpoints (A)
    /// * `d_priority` - give Vd the clamp budget first (torque limited)
    /// * `dt` - control period (s)
    pub fn update(
        &mut self,
        i_abc: (f32, f32, f32),
        v_bus: f32,
        theta: f32,
        id_ref: f32,
        iq_ref: f32,
        d_priority: bool,
        dt: f32,
    ) -> CurrentLoopOutput {
        let (sin, cos) = sin_cos(theta);
        let (i_alpha, i_beta) = clarke(i_abc.0, i_abc.1, i_abc.2);
        let (i_d, i_q) = park(i_alpha, i_beta, sin, cos);

        let vd_raw = self.pid_d.update(id_ref, i_d, dt);
        let vq_raw = self.pid_q.update(iq_ref, i_q, dt);

        let v_max = v_bus * self.config.k_svm;
        let (v_d, v_q, clamped) = limit_voltage(vd_raw, vq_raw, v_max, d_priority);
        self.pid_d.set_saturated(clamped && v_d != vd_raw);
        self.pid_q.set_saturated(clamped && v_q != vq_raw);

        let (mut v_alpha, mut v_beta) = inverse_park(v_d, v_q, sin, cos);

        // Dead-time compensation: nudge each phase by the sign of its
        // current, then fold back into αβ (a/b/c shifts commute with
        // the common-mode injection, so applying in αβ is equivalent
        // up to the zero-sequence term SVPWM discards).
        if self.config.deadtime_comp_v > 0.0 {
            let comp = self.config.deadtime_comp_v;
            let (ca, cb, cc) = (
                comp * i_abc.0.signum(),
                comp * i_abc.1.signum(),
                comp * i_abc.2.signum(),
            );
            let (comp_alpha, comp_beta) = clarke(ca, cb, cc);
            v_alpha += comp_alpha * 1.5;
            v_beta += comp_beta;
        }

        let duties = calculate_svpwm(
            v_alpha,
            v_beta,
            v_bus,
            self.config.d_min,
            self.config.d_max,
        );

        CurrentLoopOutput {
            i_d_a: i_d,
            i_q_a: i_q,
            v_d,
            v_q,
            duties,
            clamped,
        }
    }

    /// Drop accumulated state; called on every mode entry so stale
    /// integrators never kick the motor.
    pub fn reset(&mut self) {
        self.pid_d.reset();
        self.pid_q.reset();
    }

    pub fn set_gains(&mut self, kp: f32, ki: f32) {
        self.config.kp = kp;
        self.config.ki = ki;
        self.pid_d.set_gains(kp, ki);
        self.pid_q.set_gains(kp, ki);
    }

    pub fn config(&self) -> &CurrentLoopConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foc::transforms::{inverse_clarke, inverse_park, sin_cos};

    const DT: f32 = 1.0 / 30_000.0;

    /// First-order RL phase model driven by the loop's duty output.
    fn plant_step(duties: &PwmDuties, v_bus: f32, i_abc: &mut (f32, f32, f32)) {
        let r = 0.5f32;
        let l = 100e-6f32;
        let mid = (duties.a + duties.b + duties.c) / 3.0;
        let va = (duties.a - mid) * v_bus;
        let vb = (duties.b - mid) * v_bus;
        let vc = (duties.c - mid) * v_bus;
        i_abc.0 += (va - i_abc.0 * r) / l * DT;
        i_abc.1 += (vb - i_abc.1 * r) / l * DT;
        i_abc.2 += (vc - i_abc.2 * r) / l * DT;
    }

    #[test]
    fn test_converges_to_q_setpoint() {
        let mut lp = CurrentLoop::new(CurrentLoopConfig {
            kp: 0.1,
            ki: 400.0,
            ..Default::default()
        });
        let theta = 1.1f32;
        let mut i_abc = (0.0, 0.0, 0.0);
        let mut out = CurrentLoopOutput::default();
        for _ in 0..3000 {
            out = lp.update(i_abc, 24.0, theta, 0.0, 5.0, false, DT);
            plant_step(&out.duties, 24.0, &mut i_abc);
        }
        assert!((out.i_q_a - 5.0).abs() < 0.25, "i_q={}", out.i_q_a);
        assert!(out.i_d_a.abs() < 0.25, "i_d={}", out.i_d_a);
    }

    #[test]
    fn test_voltage_clamp_invariant() {
        let mut lp = CurrentLoop::new(CurrentLoopConfig::default());
        let v_bus = 10.0f32;
        let mut theta = 0.0f32;
        // Unreachable setpoint: the vector clamp must hold every cycle.
        for _ in 0..500 {
            let out = lp.update((0.0, 0.0, 0.0), v_bus, theta, 0.0, 100.0, false, DT);
            let mag = libm::sqrtf(out.v_d * out.v_d + out.v_q * out.v_q);
            assert!(mag <= v_bus * lp.config().k_svm + 1e-3);
            theta = crate::foc::transforms::wrap_tau(theta + 0.01);
        }
    }

    #[test]
    fn test_duty_window_invariant() {
        let mut lp = CurrentLoop::new(CurrentLoopConfig::default());
        let out = lp.update((3.0, -1.5, -1.5), 24.0, 0.3, 0.0, 40.0, false, DT);
        let cfg = lp.config();
        for d in [out.duties.a, out.duties.b, out.duties.c] {
            assert!(d >= cfg.d_min && d <= cfg.d_max);
        }
    }

    #[test]
    fn test_measured_currents_recovered() {
        // Feed phase currents synthesized from a known dq vector and
        // check the Park projection reproduces it.
        let mut lp = CurrentLoop::new(CurrentLoopConfig::default());
        let theta = 2.3f32;
        let (s, c) = sin_cos(theta);
        let (alpha, beta) = inverse_park(1.0, -2.0, s, c);
        let (a, b, cc) = inverse_clarke(alpha, beta);
        let out = lp.update((a, b, cc), 24.0, theta, 0.0, 0.0, false, DT);
        assert!((out.i_d_a - 1.0).abs() < 1e-3);
        assert!((out.i_q_a + 2.0).abs() < 1e-3);
    }
}
