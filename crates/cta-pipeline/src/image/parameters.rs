//! Image parameterisation of a cleaned image.

use std::collections::VecDeque;

use cta_core::containers::{HillasParameters, LeakageParameters, MorphologyParameters};

use super::cleaning::CameraTopology;

/// Second moments of the surviving pixels.
///
/// `None` when the cleaned image carries no positive charge. Skewness and
/// kurtosis are missing for a zero-length image.
pub fn hillas_parameters(
    topology: &CameraTopology,
    image: &[f32],
    mask: &[bool],
) -> Option<HillasParameters> {
    let pixels: Vec<(f64, f64, f64)> = (0..image.len())
        .filter(|&p| mask[p])
        .map(|p| (topology.pix_x[p], topology.pix_y[p], f64::from(image[p])))
        .collect();
    let size: f64 = pixels.iter().map(|p| p.2).sum();
    if size <= 0.0 {
        return None;
    }

    let x = pixels.iter().map(|p| p.0 * p.2).sum::<f64>() / size;
    let y = pixels.iter().map(|p| p.1 * p.2).sum::<f64>() / size;

    let (mut cxx, mut cyy, mut cxy) = (0.0, 0.0, 0.0);
    for &(px, py, q) in &pixels {
        let (dx, dy) = (px - x, py - y);
        cxx += q * dx * dx;
        cyy += q * dy * dy;
        cxy += q * dx * dy;
    }
    cxx /= size;
    cyy /= size;
    cxy /= size;

    let mean = (cxx + cyy) / 2.0;
    let spread = ((cxx - cyy) / 2.0).hypot(cxy);
    let length = (mean + spread).max(0.0).sqrt();
    let width = (mean - spread).max(0.0).sqrt();
    let psi = 0.5 * (2.0 * cxy).atan2(cxx - cyy);

    let (mut m3, mut m4) = (0.0, 0.0);
    for &(px, py, q) in &pixels {
        let along = (px - x) * psi.cos() + (py - y) * psi.sin();
        m3 += q * along.powi(3);
        m4 += q * along.powi(4);
    }
    let (skewness, kurtosis) = if length > 0.0 {
        (
            Some(m3 / size / length.powi(3)),
            Some(m4 / size / length.powi(4)),
        )
    } else {
        (None, None)
    };

    Some(HillasParameters {
        intensity: Some(size),
        x: Some(x),
        y: Some(y),
        r: Some(x.hypot(y)),
        phi: Some(y.atan2(x).to_degrees()),
        length: Some(length),
        width: Some(width),
        psi: Some(psi.to_degrees()),
        skewness,
        kurtosis,
    })
}

/// Share of the surviving pixels and charge in the camera border rings.
///
/// Pixel fractions are relative to the whole camera, charge fractions to the
/// cleaned intensity.
pub fn leakage_parameters(
    topology: &CameraTopology,
    image: &[f32],
    mask: &[bool],
) -> LeakageParameters {
    let n_pixels = topology.n_pixels() as f64;
    let size: f64 = (0..image.len())
        .filter(|&p| mask[p])
        .map(|p| f64::from(image[p]))
        .sum();

    let ring = |border: &[bool]| {
        let mut pixels = 0usize;
        let mut charge = 0.0;
        for p in (0..image.len()).filter(|&p| mask[p] && border[p]) {
            pixels += 1;
            charge += f64::from(image[p]);
        }
        let intensity = (size > 0.0).then(|| charge / size);
        (pixels as f64 / n_pixels, intensity)
    };
    let (pixels_width_1, intensity_width_1) = ring(&topology.border_width_1);
    let (pixels_width_2, intensity_width_2) = ring(&topology.border_width_2);

    LeakageParameters {
        pixels_width_1: Some(pixels_width_1),
        pixels_width_2: Some(pixels_width_2),
        intensity_width_1,
        intensity_width_2,
    }
}

/// Surviving pixel count and number of connected groups.
pub fn morphology_parameters(topology: &CameraTopology, mask: &[bool]) -> MorphologyParameters {
    let mut seen = vec![false; mask.len()];
    let mut islands = 0i64;
    let mut queue = VecDeque::new();
    for start in 0..mask.len() {
        if !mask[start] || seen[start] {
            continue;
        }
        islands += 1;
        seen[start] = true;
        queue.push_back(start);
        while let Some(pixel) = queue.pop_front() {
            for &n in &topology.neighbors[pixel] {
                if mask[n] && !seen[n] {
                    seen[n] = true;
                    queue.push_back(n);
                }
            }
        }
    }
    MorphologyParameters {
        n_pixels: Some(mask.iter().filter(|&&m| m).count() as i64),
        n_islands: Some(islands),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cta_core::subarray::CameraDescription;

    fn topology() -> CameraTopology {
        CameraTopology::from_camera(&CameraDescription::square("Sq", 5, 0.1, 1.0))
    }

    #[test]
    fn test_hillas_of_a_diagonal_line() {
        let topology = topology();
        // pixels 6, 12, 18 lie on the 45 degree diagonal through the centre
        let mut image = vec![0.0; 25];
        let mut mask = vec![false; 25];
        for p in [6, 12, 18] {
            image[p] = 10.0;
            mask[p] = true;
        }
        let hillas = hillas_parameters(&topology, &image, &mask).unwrap();
        assert_eq!(hillas.intensity, Some(30.0));
        assert!(hillas.x.unwrap().abs() < 1e-12);
        assert!(hillas.r.unwrap().abs() < 1e-12);
        assert!((hillas.psi.unwrap() - 45.0).abs() < 1e-9);
        assert!(hillas.width.unwrap() < 1e-9);
        let expected_length = (2.0f64 * 0.02 / 3.0).sqrt();
        assert!((hillas.length.unwrap() - expected_length).abs() < 1e-12);
        assert!(hillas.skewness.unwrap().abs() < 1e-9);
        assert!((hillas.kurtosis.unwrap() - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_hillas_centroid_and_skew() {
        let topology = topology();
        let mut image = vec![0.0; 25];
        let mut mask = vec![false; 25];
        // row 2, columns 2..5 with a bright head
        for (p, q) in [(12, 30.0), (13, 10.0), (14, 10.0)] {
            image[p] = q;
            mask[p] = true;
        }
        let hillas = hillas_parameters(&topology, &image, &mask).unwrap();
        assert!((hillas.x.unwrap() - 0.06).abs() < 1e-12);
        assert!(hillas.y.unwrap().abs() < 1e-12);
        assert!(hillas.phi.unwrap().abs() < 1e-9);
        assert!(hillas.psi.unwrap().abs() < 1e-9);
        assert!(hillas.skewness.unwrap() > 0.0);
    }

    #[test]
    fn test_hillas_needs_charge() {
        let topology = topology();
        assert!(hillas_parameters(&topology, &[0.0; 25], &[false; 25]).is_none());
        let mut mask = vec![false; 25];
        mask[12] = true;
        let single = hillas_parameters(&topology, &[1.0; 25], &mask).unwrap();
        assert_eq!(single.length, Some(0.0));
        assert_eq!(single.skewness, None);
    }

    #[test]
    fn test_leakage_fractions() {
        let topology = topology();
        let mut image = vec![0.0; 25];
        let mut mask = vec![false; 25];
        for (p, q) in [(0, 15.0), (7, 6.0), (12, 20.0), (13, 12.0)] {
            image[p] = q;
            mask[p] = true;
        }
        let leakage = leakage_parameters(&topology, &image, &mask);
        assert_eq!(leakage.pixels_width_1, Some(1.0 / 25.0));
        assert_eq!(leakage.pixels_width_2, Some(3.0 / 25.0));
        assert!((leakage.intensity_width_1.unwrap() - 15.0 / 53.0).abs() < 1e-12);
        assert!((leakage.intensity_width_2.unwrap() - 33.0 / 53.0).abs() < 1e-12);
    }

    #[test]
    fn test_morphology_counts_islands() {
        let topology = topology();
        let mut mask = vec![false; 25];
        for p in [0, 7, 12, 13] {
            mask[p] = true;
        }
        let morphology = morphology_parameters(&topology, &mask);
        assert_eq!(morphology.n_pixels, Some(4));
        assert_eq!(morphology.n_islands, Some(2));
    }
}
