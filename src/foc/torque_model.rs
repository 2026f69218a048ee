// Torque <-> phase current conversion.
//
// Below the cutoff current the motor is linear (torque = Kt * i).
// Above it the magnetic circuit saturates and torque only grows
// logarithmically with additional current.

/// Fast base-2 logarithm, good to ~1e-4 relative over normal floats.
///
/// Bit-level approximation so the conversion stays cheap inside the
/// control ISR.
#[inline]
pub fn log2f_approx(x: f32) -> f32 {
    let vx = x.to_bits();
    let mx = f32::from_bits((vx & 0x007F_FFFF) | 0x3F00_0000);
    let y = vx as f32 * 1.192_092_9e-7;
    y - 124.225_52 - 1.498_030_3 * mx - 1.725_88 / (0.352_088_72 + mx)
}

/// Fast 2^p, the inverse of `log2f_approx`.
#[inline]
pub fn pow2f_approx(p: f32) -> f32 {
    let offset: f32 = if p < 0.0 { 1.0 } else { 0.0 };
    let clipp = if p < -126.0 { -126.0 } else { p };
    let w = clipp as i32;
    let z = clipp - w as f32 + offset;
    let v = ((1 << 23) as f32
        * (clipp + 121.274_06 + 27.728_02 / (4.842_525_5 - z) - 1.490_129_1 * z))
        as u32;
    f32::from_bits(v)
}

/// Converts between torque and phase current for a given motor.
#[derive(Debug, Clone, Copy)]
pub struct TorqueModel {
    pub torque_constant: f32,
    pub current_cutoff_a: f32,
    pub current_scale: f32,
    pub torque_scale: f32,
}

impl TorqueModel {
    pub fn new(
        torque_constant: f32,
        current_cutoff_a: f32,
        current_scale: f32,
        torque_scale: f32,
    ) -> Self {
        Self {
            torque_constant,
            current_cutoff_a,
            current_scale,
            torque_scale,
        }
    }

    /// Torque produced by a given q-axis current.
    #[inline]
    pub fn current_to_torque(&self, current: f32) -> f32 {
        // The rotation region term is evaluated unconditionally so the
        // cycle time stays flat when crossing the cutoff.
        let excess = (current.abs() - self.current_cutoff_a).max(0.0);
        let rotation_extra =
            self.torque_scale * log2f_approx(1.0 + excess * self.current_scale);

        if current.abs() < self.current_cutoff_a {
            // rotation_extra is exactly zero here; adding it keeps the
            // computation above from being optimized away.
            current * self.torque_constant + current.signum() * rotation_extra
        } else {
            (self.current_cutoff_a * self.torque_constant + rotation_extra)
                * current.signum()
        }
    }

    /// Current required for a given torque; inverse of
    /// `current_to_torque`.
    #[inline]
    pub fn torque_to_current(&self, torque: f32) -> f32 {
        let cutoff_torque = self.current_cutoff_a * self.torque_constant;
        if torque.abs() < cutoff_torque {
            torque / self.torque_constant
        } else {
            let a = (torque.abs() - cutoff_torque) / self.torque_scale;
            let rotation_extra = (pow2f_approx(a) - 1.0) / self.current_scale;
            (self.current_cutoff_a + rotation_extra) * torque.signum()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> TorqueModel {
        TorqueModel::new(0.1, 10.0, 0.3, 0.6)
    }

    #[test]
    fn test_log2_pow2_inverse() {
        let mut x = 0.05f32;
        while x < 300.0 {
            let roundtrip = pow2f_approx(log2f_approx(x));
            assert!(
                (roundtrip - x).abs() / x < 2e-3,
                "x={} roundtrip={}",
                x,
                roundtrip
            );
            x *= 1.37;
        }
    }

    #[test]
    fn test_linear_region() {
        let m = model();
        assert!((m.current_to_torque(5.0) - 0.5).abs() < 1e-6);
        assert!((m.current_to_torque(-5.0) + 0.5).abs() < 1e-6);
        assert!((m.torque_to_current(0.5) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_saturation_region_monotonic() {
        let m = model();
        let mut last = m.current_to_torque(10.0);
        let mut i = 11.0f32;
        while i < 40.0 {
            let t = m.current_to_torque(i);
            assert!(t > last);
            // Saturated torque grows slower than linear.
            assert!(t < i * m.torque_constant);
            last = t;
            i += 1.0;
        }
    }

    #[test]
    fn test_round_trip_within_half_percent() {
        // Inverse must hold to 0.5 % for |i| up to twice the cutoff.
        let m = model();
        let mut i = -20.0f32;
        while i <= 20.0 {
            let roundtrip = m.torque_to_current(m.current_to_torque(i));
            let tolerance = (i.abs() * 0.005).max(1e-3);
            assert!(
                (roundtrip - i).abs() < tolerance,
                "i={} roundtrip={}",
                i,
                roundtrip
            );
            i += 0.25;
        }
    }
}
