// Coordinate transformations for FOC (Field Oriented Control)
// Clarke/Park forward and inverse pairs plus the dq voltage clamp.

use libm::sqrtf;

const SQRT3: f32 = 1.732_050_8; // sqrt(3)

/// Fast (sin, cos) of an electrical angle.
///
/// Uses idsp::cossin() (~40 cycles on Cortex-M) instead of
/// libm::cosf/sinf (~100-200 cycles); the control ISR calls this once
/// per cycle so the difference matters at 30 kHz.
///
/// # Arguments
/// * `theta` - Electrical angle in radians, [0, 2π)
///
/// # Returns
/// Tuple of (sin, cos), each in [-1, 1]
#[inline]
pub fn sin_cos(theta: f32) -> (f32, f32) {
    use core::f32::consts::{PI, TAU};

    // idsp represents -π..π as the full i32 range.
    let normalized = if theta > PI { theta - TAU } else { theta };
    const SCALE: f32 = 2147483648.0 / PI; // 2^31 / π
    let phase: i32 = (normalized * SCALE) as i32;

    let (cos_i32, sin_i32) = idsp::cossin(phase);

    const I32_TO_F32: f32 = 1.0 / 2147483648.0;
    (sin_i32 as f32 * I32_TO_F32, cos_i32 as f32 * I32_TO_F32)
}

/// Clarke transformation (abc → αβ)
///
/// Projects three measured phase currents onto the stationary two-axis
/// frame. Uses the power-invariant form that tolerates an unbalanced
/// zero-sequence component:
/// iα = (2a − b − c) / 3, iβ = (b − c) / √3.
#[inline]
pub fn clarke(a: f32, b: f32, c: f32) -> (f32, f32) {
    let alpha = (2.0 * a - b - c) * (1.0 / 3.0);
    let beta = (b - c) * (1.0 / SQRT3);
    (alpha, beta)
}

/// Inverse Clarke transformation (αβ → abc)
#[inline]
pub fn inverse_clarke(alpha: f32, beta: f32) -> (f32, f32, f32) {
    const SQRT3_DIV_2: f32 = 0.866_025_4; // sqrt(3) / 2

    let a = alpha;
    let b = -0.5 * alpha + SQRT3_DIV_2 * beta;
    let c = -0.5 * alpha - SQRT3_DIV_2 * beta;
    (a, b, c)
}

/// Park transformation (αβ → dq) with precomputed (sin, cos).
///
/// d = cα + sβ, q = cβ − sα.
#[inline]
pub fn park(alpha: f32, beta: f32, sin: f32, cos: f32) -> (f32, f32) {
    let d = cos * alpha + sin * beta;
    let q = cos * beta - sin * alpha;
    (d, q)
}

/// Inverse Park transformation (dq → αβ) with precomputed (sin, cos).
#[inline]
pub fn inverse_park(d: f32, q: f32, sin: f32, cos: f32) -> (f32, f32) {
    let alpha = cos * d - sin * q;
    let beta = sin * d + cos * q;
    (alpha, beta)
}

/// Limit the dq voltage vector to a maximum magnitude.
///
/// When `d_priority` is set the d axis keeps its full request (up to
/// the budget) and only the q axis is trimmed; this is what the torque
/// limiter wants so field weakening keeps working at the voltage
/// ceiling. Otherwise both axes scale proportionally.
///
/// # Returns
/// (vd_limited, vq_limited, clamped)
pub fn limit_voltage(vd: f32, vq: f32, max_voltage: f32, d_priority: bool) -> (f32, f32, bool) {
    let magnitude = sqrtf(vd * vd + vq * vq);
    if magnitude <= max_voltage {
        return (vd, vq, false);
    }

    if d_priority {
        let vd_limited = vd.clamp(-max_voltage, max_voltage);
        let q_budget_sq = max_voltage * max_voltage - vd_limited * vd_limited;
        let q_budget = sqrtf(q_budget_sq.max(0.0));
        (vd_limited, vq.clamp(-q_budget, q_budget), true)
    } else {
        let scale = max_voltage / magnitude;
        (vd * scale, vq * scale, true)
    }
}

/// Fold an angle to [-π, π).
#[inline]
pub fn wrap_half_rad(angle: f32) -> f32 {
    use core::f32::consts::PI;

    let wrapped = wrap_tau(angle);
    if wrapped >= PI {
        wrapped - 2.0 * PI
    } else {
        wrapped
    }
}

/// Normalize an angle to [0, 2π).
#[inline]
pub fn wrap_tau(angle: f32) -> f32 {
    use core::f32::consts::TAU;

    let mut normalized = angle % TAU;
    if normalized < 0.0 {
        normalized += TAU;
    }
    // The remainder of a value just below TAU can round back up to TAU.
    if normalized >= TAU {
        normalized = 0.0;
    }
    normalized
}
