//! Per-sample basis and weighting functions
//!
//! Each sample defines a local frame with `x` along its normal.  The basis is
//! the derivative of a Gaussian along `x` (negated so that it is positive in
//! front of the sample), and the weight is a compactly supported polynomial
//! that falls off faster behind the surface than in front of it.
use super::sample::Sample;
use nalgebra::Vector3;

/// Returns `(x, r)`: the distance along the sample's normal and the radial
/// distance from the normal's axis
pub fn sample_frame(s: &Sample, pos: &Vector3<f64>) -> (f64, f64) {
    let d = pos - s.pos.cast::<f64>();
    let n = s.normal.cast::<f64>();
    let x = d.dot(&n);
    let r = (d.norm_squared() - x * x).max(0.0).sqrt();
    (x, r)
}

/// Gaussian-derivative basis function with standard deviation `sigma`
pub fn basis(sigma: f64, x: f64, r: f64) -> f64 {
    let s2 = sigma * sigma;
    let norm = (2.0 * std::f64::consts::PI).powf(1.5) * s2 * sigma;
    x / s2 * (-(x * x + r * r) / (2.0 * s2)).exp() / norm
}

/// Weight along the normal, supported on `(-factor * sigma, factor * sigma)`
pub fn weight_x(sigma: f64, factor: f64, x: f64) -> f64 {
    let t = x / (factor * sigma);
    if t <= -1.0 || t >= 1.0 {
        0.0
    } else if t < 0.0 {
        (t + 1.0) * (t + 1.0)
    } else {
        2.0 * t * t * t - 3.0 * t * t + 1.0
    }
}

/// Radial weight, supported on `[0, factor * sigma)`
pub fn weight_yz(sigma: f64, factor: f64, r: f64) -> f64 {
    let t = r / (factor * sigma);
    if t >= 1.0 { 0.0 } else { (1.0 - t) * (1.0 - t) }
}

/// Combined weight in the sample frame
pub fn weight(sigma: f64, factor: f64, x: f64, r: f64) -> f64 {
    weight_x(sigma, factor, x) * weight_yz(sigma, factor, r)
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_sample_frame() {
        let s = Sample {
            pos: Vector3::new(1.0, 0.0, 0.0),
            normal: Vector3::x(),
            color: Vector3::zeros(),
            scale: 1.0,
            confidence: 1.0,
        };
        let (x, r) = sample_frame(&s, &Vector3::new(3.0, 3.0, 4.0));
        assert_relative_eq!(x, 2.0);
        assert_relative_eq!(r, 5.0);
    }

    #[test]
    fn test_basis_sign() {
        assert!(basis(1.0, 0.5, 0.2) > 0.0);
        assert!(basis(1.0, -0.5, 0.2) < 0.0);
        assert_eq!(basis(1.0, 0.0, 0.2), 0.0);
        // Antisymmetric along the normal
        assert_relative_eq!(basis(0.3, 0.1, 0.05), -basis(0.3, -0.1, 0.05));
    }

    #[test]
    fn test_weights() {
        for sigma in [0.5, 1.0, 2.0] {
            let k = 3.0;
            assert_relative_eq!(weight_x(sigma, k, 0.0), 1.0);
            assert_relative_eq!(weight_x(sigma, k, -k * sigma), 0.0);
            assert_relative_eq!(weight_x(sigma, k, k * sigma), 0.0);
            assert_relative_eq!(weight_x(sigma, k, 1.5 * sigma), 0.5);
            assert_relative_eq!(weight_x(sigma, k, -1.5 * sigma), 0.25);
            assert_relative_eq!(weight_yz(sigma, k, 0.0), 1.0);
            assert_relative_eq!(weight_yz(sigma, k, 1.5 * sigma), 0.25);
            assert_eq!(weight_yz(sigma, k, 4.0 * sigma), 0.0);
            assert_eq!(weight(sigma, k, 10.0 * sigma, 0.0), 0.0);
        }
    }

    #[test]
    fn test_weight_monotonic() {
        let mut prev = weight_x(1.0, 3.0, 0.0);
        for i in 1..=30 {
            let w = weight_x(1.0, 3.0, f64::from(i) * 0.1);
            assert!(w <= prev, "weight increased at {i}: {w} > {prev}");
            prev = w;
        }
    }
}
