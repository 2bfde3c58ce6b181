//! Stereo direction and core from the image major axes.
//!
//! Every telescope contributes a line: in the field of view the image major
//! axis (through the centroid, at angle `psi`), on the ground a line through
//! the telescope position at the same angle. Camera coordinates become
//! field-of-view angles by dividing by the focal length (small-angle
//! approximation around the pointing). The camera frame is taken as
//! aligned with the ground frame, so both sets of lines meet at the shower
//! direction and core respectively.
//!
//! Lines are intersected pairwise. Each crossing is weighted by the product
//! of the two image intensities and the sine of the angle between the lines;
//! near-parallel pairs are skipped. The weighted mean crossing is the
//! estimate, the weighted spread its uncertainty.

/// One telescope's input to the fit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisImage {
    /// Telescope position on the ground (x, y), m.
    pub position: [f64; 2],
    /// Equivalent focal length, m.
    pub focal_length: f64,
    /// Image centroid in the camera, m.
    pub x: f64,
    /// Image centroid in the camera, m.
    pub y: f64,
    /// Major axis angle, deg.
    pub psi: f64,
    /// Image intensity, p.e.
    pub intensity: f64,
}

/// Result of a successful fit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StereoGeometry {
    /// Altitude, deg.
    pub alt: f64,
    /// Altitude uncertainty, deg.
    pub alt_uncert: f64,
    /// Azimuth in [0, 360), deg.
    pub az: f64,
    /// Azimuth uncertainty, deg.
    pub az_uncert: f64,
    /// Core position on the ground, m.
    pub core_x: f64,
    /// Core position on the ground, m.
    pub core_y: f64,
    /// Telescopes that contributed to at least one crossing.
    pub n_tels: usize,
}

/// Lines closer to parallel than this (sine of the angle) are not crossed.
const MIN_SIN_ANGLE: f64 = 0.02;

struct Line {
    point: [f64; 2],
    angle: f64,
    weight: f64,
}

struct Crossing {
    mean: [f64; 2],
    spread: [f64; 2],
    used: Vec<bool>,
}

fn intersect(lines: &[Line]) -> Option<Crossing> {
    let mut points = Vec::new();
    let mut used = vec![false; lines.len()];
    for i in 0..lines.len() {
        for j in (i + 1)..lines.len() {
            let (a, b) = (&lines[i], &lines[j]);
            let (sa, ca) = a.angle.sin_cos();
            let (sb, cb) = b.angle.sin_cos();
            let cross = ca * sb - sa * cb;
            if cross.abs() < MIN_SIN_ANGLE {
                continue;
            }
            let dx = b.point[0] - a.point[0];
            let dy = b.point[1] - a.point[1];
            let t = (dx * sb - dy * cb) / cross;
            let point = [a.point[0] + t * ca, a.point[1] + t * sa];
            points.push((point, a.weight * b.weight * cross.abs()));
            used[i] = true;
            used[j] = true;
        }
    }

    let total: f64 = points.iter().map(|(_, w)| w).sum();
    if points.is_empty() || total <= 0.0 {
        return None;
    }
    let mut mean = [0.0; 2];
    for (p, w) in &points {
        mean[0] += w * p[0] / total;
        mean[1] += w * p[1] / total;
    }
    let mut spread = [0.0; 2];
    for (p, w) in &points {
        spread[0] += w * (p[0] - mean[0]).powi(2) / total;
        spread[1] += w * (p[1] - mean[1]).powi(2) / total;
    }
    Some(Crossing {
        mean,
        spread: [spread[0].sqrt(), spread[1].sqrt()],
        used,
    })
}

/// Fit direction and core. `None` when fewer than two non-parallel axes are
/// available.
pub fn reconstruct(
    images: &[AxisImage],
    pointing_alt: f64,
    pointing_az: f64,
) -> Option<StereoGeometry> {
    let sky: Vec<Line> = images
        .iter()
        .map(|im| Line {
            point: [im.x / im.focal_length, im.y / im.focal_length],
            angle: im.psi.to_radians(),
            weight: im.intensity,
        })
        .collect();
    let ground: Vec<Line> = images
        .iter()
        .map(|im| Line {
            point: im.position,
            angle: im.psi.to_radians(),
            weight: im.intensity,
        })
        .collect();

    let direction = intersect(&sky)?;
    let core = intersect(&ground)?;

    let alt = pointing_alt + direction.mean[1].to_degrees();
    let cos_alt = alt.to_radians().cos().max(1e-6);
    let az = (pointing_az + direction.mean[0].to_degrees() / cos_alt).rem_euclid(360.0);
    Some(StereoGeometry {
        alt,
        alt_uncert: direction.spread[1].to_degrees(),
        az,
        az_uncert: direction.spread[0].to_degrees() / cos_alt,
        core_x: core.mean[0],
        core_y: core.mean[1],
        n_tels: direction.used.iter().filter(|&&u| u).count(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Telescopes on a ring looking at a shower with core `core` and a
    /// direction offset `offset` (m in the camera).
    fn images(core: [f64; 2], offset: [f64; 2]) -> Vec<AxisImage> {
        [[150.0, 0.0], [0.0, 150.0], [-150.0, 0.0], [0.0, -150.0]]
            .into_iter()
            .map(|position| {
                let dx = core[0] - position[0];
                let dy = core[1] - position[1];
                let psi = dy.atan2(dx);
                AxisImage {
                    position,
                    focal_length: 16.0,
                    x: offset[0] + 0.1 * psi.cos(),
                    y: offset[1] + 0.1 * psi.sin(),
                    psi: psi.to_degrees(),
                    intensity: 100.0,
                }
            })
            .collect()
    }

    #[test]
    fn test_axes_meet_at_core_and_direction() {
        let fit = reconstruct(&images([30.0, -40.0], [0.0, 0.0]), 70.0, 0.0).unwrap();
        assert!((fit.core_x - 30.0).abs() < 1e-6);
        assert!((fit.core_y + 40.0).abs() < 1e-6);
        assert!((fit.alt - 70.0).abs() < 1e-9);
        // azimuth wraps, so 359.99... is as good as 0
        assert!(((fit.az + 180.0).rem_euclid(360.0) - 180.0).abs() < 1e-9);
        assert!(fit.alt_uncert < 1e-9);
        assert_eq!(fit.n_tels, 4);
    }

    #[test]
    fn test_offset_direction() {
        // 0.16 m at 16 m focal length is 0.01 rad
        let fit = reconstruct(&images([10.0, 20.0], [0.0, 0.16]), 70.0, 180.0).unwrap();
        assert!((fit.alt - (70.0 + 0.01f64.to_degrees())).abs() < 1e-6);
        assert!((fit.az - 180.0).abs() < 1e-6);
    }

    #[test]
    fn test_parallel_axes_fail() {
        let mut images = images([0.0, 0.0], [0.0, 0.0]);
        images.truncate(3);
        // telescopes at +x and -x both see psi along the x axis
        images.remove(1);
        assert!(reconstruct(&images, 70.0, 0.0).is_none());
    }
}
