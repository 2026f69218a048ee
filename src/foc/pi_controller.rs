// PI controller for the dq current axes with clamp-aware anti-windup.

/// PI controller with anti-windup and output limiting.
///
/// The current loop runs two of these (one per axis). Anti-windup is
/// driven externally: after the dq voltage clamp, the caller reports
/// whether the clamp was active via `set_saturated`, and the next
/// update skips integration if the error would push further into the
/// saturated direction.
pub struct PiController {
    kp: f32,
    ki: f32,
    integral: f32,
    output_limit: f32,
    last_output: f32,
    saturated: bool,
}

impl PiController {
    /// Create a new PI controller with a symmetric output limit.
    pub fn new(kp: f32, ki: f32, output_limit: f32) -> Self {
        Self {
            kp,
            ki,
            integral: 0.0,
            output_limit,
            last_output: 0.0,
            saturated: false,
        }
    }

    /// Update the controller.
    ///
    /// # Arguments
    /// * `setpoint` - desired value (A)
    /// * `measured` - measured value (A)
    /// * `dt` - control period (s)
    ///
    /// # Returns
    /// Pre-clamp output voltage; the caller applies the vector clamp
    /// across both axes and reports back with `set_saturated`.
    pub fn update(&mut self, setpoint: f32, measured: f32, dt: f32) -> f32 {
        let error = setpoint - measured;

        // Skip integration only while the downstream clamp is active
        // and the error would deepen the saturation.
        let pushes_deeper = error * self.last_output > 0.0;
        if !(self.saturated && pushes_deeper) {
            self.integral += error * self.ki * dt;
            self.integral = self.integral.clamp(-self.output_limit, self.output_limit);
        }

        self.last_output = self.kp * error + self.integral;
        self.last_output
    }

    /// Report whether the downstream vector clamp limited this axis.
    pub fn set_saturated(&mut self, saturated: bool) {
        self.saturated = saturated;
    }

    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.last_output = 0.0;
        self.saturated = false;
    }

    pub fn set_gains(&mut self, kp: f32, ki: f32) {
        self.kp = kp;
        self.ki = ki;
    }

    pub fn set_output_limit(&mut self, limit: f32) {
        self.output_limit = limit;
    }

    pub fn kp(&self) -> f32 {
        self.kp
    }

    pub fn ki(&self) -> f32 {
        self.ki
    }

    pub fn integral(&self) -> f32 {
        self.integral
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proportional_only() {
        let mut pi = PiController::new(2.0, 0.0, 100.0);
        assert_eq!(pi.update(5.0, 0.0, 0.001), 10.0);
    }

    #[test]
    fn test_integral_accumulation() {
        let mut pi = PiController::new(0.0, 1000.0, 100.0);
        pi.update(10.0, 0.0, 0.001);
        assert!((pi.integral() - 10.0).abs() < 1e-6);
        pi.update(10.0, 0.0, 0.001);
        assert!((pi.integral() - 20.0).abs() < 1e-6);
    }

    #[test]
    fn test_anti_windup_blocks_deepening() {
        let mut pi = PiController::new(1.0, 1000.0, 100.0);
        pi.update(10.0, 0.0, 0.001);
        let before = pi.integral();

        // Clamp engaged, error keeps the same sign as the output:
        // integration must pause.
        pi.set_saturated(true);
        pi.update(10.0, 0.0, 0.001);
        assert_eq!(pi.integral(), before);

        // Error flips sign (would leave saturation): integrates again.
        pi.update(-10.0, 0.0, 0.001);
        assert!(pi.integral() < before);
    }

    #[test]
    fn test_reset() {
        let mut pi = PiController::new(1.0, 1000.0, 100.0);
        pi.update(10.0, 0.0, 0.001);
        pi.reset();
        assert_eq!(pi.integral(), 0.0);
        assert_eq!(pi.update(0.0, 0.0, 0.001), 0.0);
    }
}
