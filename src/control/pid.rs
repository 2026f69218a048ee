// Full PID for the outer position loop.
//
// Unlike the current-loop PI, this one carries a derivative path fed
// by the measured velocity, per-cycle integral rate limiting, and a
// first-order rate limiter on the desired position.

/// Gains and limits; lives in the runtime configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PidConfig {
    pub kp: f32,
    pub ki: f32,
    pub kd: f32,
    /// Maximum integral change per second; <= 0 disables the limit.
    pub iratelimit: f32,
    /// Symmetric clamp on the integral term.
    pub ilimit: f32,
    /// Maximum slew of the desired position per second; 0 is unlimited.
    pub max_desired_rate: f32,
    /// +1 or -1, flips the output direction.
    pub sign: i8,
}

impl Default for PidConfig {
    fn default() -> Self {
        Self {
            kp: 0.0,
            ki: 0.0,
            kd: 0.0,
            iratelimit: -1.0,
            ilimit: 0.0,
            max_desired_rate: 0.0,
            sign: 1,
        }
    }
}

/// Mutable controller state, logged as part of the control snapshot.
#[derive(Debug, Clone, Copy)]
pub struct PidState {
    pub integral: f32,
    /// Rate-limited desired value. NaN until the first apply so the
    /// first command is accepted without limiting.
    pub desired: f32,
    pub error: f32,
    pub error_rate: f32,
    pub p: f32,
    pub d: f32,
    pub command: f32,
}

impl Default for PidState {
    fn default() -> Self {
        Self {
            integral: 0.0,
            desired: f32::NAN,
            error: 0.0,
            error_rate: 0.0,
            p: 0.0,
            d: 0.0,
            command: 0.0,
        }
    }
}

impl PidState {
    pub fn clear(&mut self) {
        *self = Default::default();
    }
}

/// Per-command scaling of the gain terms.
#[derive(Debug, Clone, Copy)]
pub struct ApplyOptions {
    pub kp_scale: f32,
    pub kd_scale: f32,
    pub ki_scale: f32,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            kp_scale: 1.0,
            kd_scale: 1.0,
            ki_scale: 1.0,
        }
    }
}

/// Compute one PID step.
///
/// # Arguments
/// * `measured` / `input_desired` - position (turns)
/// * `measured_rate` / `input_desired_rate` - velocity (turns/s)
/// * `rate_hz` - control frequency
pub fn apply(
    config: &PidConfig,
    state: &mut PidState,
    measured: f32,
    input_desired: f32,
    measured_rate: f32,
    input_desired_rate: f32,
    rate_hz: u32,
    options: &ApplyOptions,
) -> f32 {
    let rate = rate_hz as f32;

    let (desired, desired_rate) = if config.max_desired_rate != 0.0 && state.desired.is_finite() {
        let max_step = config.max_desired_rate / rate;
        let proposed = input_desired - state.desired;
        let step = proposed.clamp(-max_step, max_step);
        (
            state.desired + step,
            input_desired_rate.clamp(-config.max_desired_rate, config.max_desired_rate),
        )
    } else {
        (input_desired, input_desired_rate)
    };

    state.desired = desired;
    state.error = measured - desired;
    state.error_rate = measured_rate - desired_rate;

    let mut i_update = state.error * config.ki / rate;
    if config.iratelimit > 0.0 {
        let max_i_update = config.iratelimit / rate;
        i_update = i_update.clamp(-max_i_update, max_i_update);
    }
    state.integral = (state.integral + i_update).clamp(-config.ilimit, config.ilimit);

    state.p = options.kp_scale * config.kp * state.error;
    state.d = options.kd_scale * config.kd * state.error_rate;

    state.command =
        config.sign as f32 * (state.p + state.d + options.ki_scale * state.integral);
    state.command
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: u32 = 1000;

    #[test]
    fn test_pure_proportional() {
        let config = PidConfig {
            kp: 2.0,
            ..Default::default()
        };
        let mut state = PidState::default();
        let out = apply(
            &config,
            &mut state,
            1.5,
            1.0,
            0.0,
            0.0,
            RATE,
            &Default::default(),
        );
        assert!((out - 2.0 * 0.5).abs() < 1e-6);
        assert!((state.error - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_sign_flip() {
        let config = PidConfig {
            kp: 2.0,
            sign: -1,
            ..Default::default()
        };
        let mut state = PidState::default();
        let out = apply(
            &config,
            &mut state,
            1.5,
            1.0,
            0.0,
            0.0,
            RATE,
            &Default::default(),
        );
        assert!((out + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_first_command_unlimited() {
        // state.desired starts NaN: the first target is accepted as-is
        // even with a rate limit configured.
        let config = PidConfig {
            kp: 1.0,
            max_desired_rate: 0.1,
            ..Default::default()
        };
        let mut state = PidState::default();
        apply(
            &config,
            &mut state,
            0.0,
            5.0,
            0.0,
            0.0,
            RATE,
            &Default::default(),
        );
        assert!((state.desired - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_desired_rate_limit() {
        let config = PidConfig {
            kp: 1.0,
            max_desired_rate: 1.0, // 1 turn/s at 1 kHz => 0.001/cycle
            ..Default::default()
        };
        let mut state = PidState::default();
        apply(&config, &mut state, 0.0, 0.0, 0.0, 0.0, RATE, &Default::default());
        apply(&config, &mut state, 0.0, 10.0, 0.0, 0.0, RATE, &Default::default());
        assert!((state.desired - 0.001).abs() < 1e-6);
    }

    #[test]
    fn test_integral_limit_and_rate() {
        let config = PidConfig {
            ki: 100.0,
            ilimit: 0.05,
            iratelimit: 10.0,
            ..Default::default()
        };
        let mut state = PidState::default();
        // error = 1.0 => raw i_update = 0.1/cycle, rate-limited to 0.01.
        apply(&config, &mut state, 1.0, 0.0, 0.0, 0.0, RATE, &Default::default());
        assert!((state.integral - 0.01).abs() < 1e-6);
        for _ in 0..100 {
            apply(&config, &mut state, 1.0, 0.0, 0.0, 0.0, RATE, &Default::default());
        }
        assert!((state.integral - 0.05).abs() < 1e-6);
    }

    #[test]
    fn test_scales() {
        let config = PidConfig {
            kp: 1.0,
            kd: 1.0,
            ..Default::default()
        };
        let mut state = PidState::default();
        let options = ApplyOptions {
            kp_scale: 0.5,
            kd_scale: 0.25,
            ki_scale: 1.0,
        };
        let out = apply(&config, &mut state, 1.0, 0.0, 2.0, 0.0, RATE, &options);
        assert!((out - (0.5 + 0.5)).abs() < 1e-6);
    }
}
