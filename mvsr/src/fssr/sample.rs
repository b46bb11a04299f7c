//! Oriented point samples with a support scale
use nalgebra::Vector3;

/// Oriented point sample
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Sample {
    /// World position
    pub pos: Vector3<f32>,
    /// Unit normal, pointing out of the surface
    pub normal: Vector3<f32>,
    /// Color, in the `[0, 1]` range
    pub color: Vector3<f32>,
    /// Support radius
    pub scale: f32,
    /// Confidence, used as a multiplicative weight
    pub confidence: f32,
}

/// Counts reported by [`sanitize`]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct SanitizeStats {
    /// Samples kept
    pub kept: usize,
    /// Samples dropped for a non-positive or non-finite scale
    pub bad_scale: usize,
    /// Samples dropped for a non-positive or non-finite confidence
    pub bad_confidence: usize,
    /// Samples dropped for a non-finite position or a zero normal
    pub bad_geometry: usize,
    /// Kept samples whose normal was renormalized
    pub renormalized: usize,
}

/// Normals within this squared-norm distance of 1 are accepted as-is
const NORMAL_TOLERANCE: f32 = 1e-5;

/// Validates samples, dropping unusable ones and renormalizing normals
///
/// Problems are never fatal; they are counted and logged as warnings.
pub fn sanitize<I>(samples: I) -> (Vec<Sample>, SanitizeStats)
where
    I: IntoIterator<Item = Sample>,
{
    let mut stats = SanitizeStats::default();
    let mut out = vec![];
    for mut s in samples {
        if !(s.scale.is_finite() && s.scale > 0.0) {
            stats.bad_scale += 1;
            continue;
        }
        if !(s.confidence.is_finite() && s.confidence > 0.0) {
            stats.bad_confidence += 1;
            continue;
        }
        let n2 = s.normal.norm_squared();
        if !s.pos.iter().all(|v| v.is_finite())
            || !n2.is_finite()
            || n2 == 0.0
        {
            stats.bad_geometry += 1;
            continue;
        }
        if (n2 - 1.0).abs() > NORMAL_TOLERANCE {
            s.normal /= n2.sqrt();
            stats.renormalized += 1;
        }
        out.push(s);
    }
    stats.kept = out.len();

    let skipped = stats.bad_scale + stats.bad_confidence + stats.bad_geometry;
    if skipped > 0 {
        log::warn!(
            "skipped {skipped} samples ({} bad scale, {} bad confidence, \
             {} bad geometry)",
            stats.bad_scale,
            stats.bad_confidence,
            stats.bad_geometry
        );
    }
    if stats.renormalized > 0 {
        log::warn!("renormalized {} sample normals", stats.renormalized);
    }
    (out, stats)
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_relative_eq;

    fn sample(scale: f32, confidence: f32, normal: Vector3<f32>) -> Sample {
        Sample {
            pos: Vector3::zeros(),
            normal,
            color: Vector3::zeros(),
            scale,
            confidence,
        }
    }

    #[test]
    fn test_sanitize() {
        let (out, stats) = sanitize([
            sample(1.0, 1.0, Vector3::z()),
            sample(0.0, 1.0, Vector3::z()),
            sample(1.0, -1.0, Vector3::z()),
            sample(1.0, 1.0, Vector3::zeros()),
            sample(1.0, 1.0, Vector3::new(0.0, 3.0, 4.0)),
            sample(f32::NAN, 1.0, Vector3::z()),
        ]);
        assert_eq!(
            stats,
            SanitizeStats {
                kept: 2,
                bad_scale: 2,
                bad_confidence: 1,
                bad_geometry: 1,
                renormalized: 1,
            }
        );
        assert_eq!(out.len(), 2);
        assert_relative_eq!(out[1].normal, Vector3::new(0.0, 0.6, 0.8));
    }
}
