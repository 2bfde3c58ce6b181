//! Two-threshold (tailcuts) image cleaning and the pixel topology it needs.

use cta_core::config::{ComponentSchema, ParamSpec, ParamType};
use cta_core::subarray::CameraDescription;
use serde::Deserialize;

/// Pixel adjacency and border rings of one camera.
///
/// Derived once per camera type from the pixel positions and shared by all
/// telescopes using that camera.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraTopology {
    /// Pixel x positions, m.
    pub pix_x: Vec<f64>,
    /// Pixel y positions, m.
    pub pix_y: Vec<f64>,
    /// Adjacency lists.
    pub neighbors: Vec<Vec<usize>>,
    /// Outermost pixel ring.
    pub border_width_1: Vec<bool>,
    /// Two outermost pixel rings.
    pub border_width_2: Vec<bool>,
}

impl CameraTopology {
    /// Derive the topology of `camera`.
    pub fn from_camera(camera: &CameraDescription) -> Self {
        let neighbors = camera.neighbors();
        let border_width_1 = camera.border_pixels(&neighbors);
        let mut border_width_2 = border_width_1.clone();
        for (pixel, &outer) in border_width_1.iter().enumerate() {
            if outer {
                for &n in &neighbors[pixel] {
                    border_width_2[n] = true;
                }
            }
        }
        Self {
            pix_x: camera.pix_x.clone(),
            pix_y: camera.pix_y.clone(),
            neighbors,
            border_width_1,
            border_width_2,
        }
    }

    /// Number of pixels.
    pub fn n_pixels(&self) -> usize {
        self.pix_x.len()
    }

    fn any_neighbor(&self, pixel: usize, selected: &[bool]) -> bool {
        self.neighbors[pixel].iter().any(|&n| selected[n])
    }

    fn count_neighbors(&self, pixel: usize, selected: &[bool]) -> usize {
        self.neighbors[pixel].iter().filter(|&&n| selected[n]).count()
    }
}

/// Picture/boundary threshold cleaning.
///
/// A pixel survives if it is above the picture threshold and has a
/// neighbour above the boundary threshold, or if it is above the boundary
/// threshold and has a neighbour that survived as a picture pixel.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Tailcuts {
    /// Picture threshold, p.e.
    pub picture_threshold_pe: f64,
    /// Boundary threshold, p.e.
    pub boundary_threshold_pe: f64,
    /// Picture pixels need at least this many picture neighbours.
    pub min_picture_neighbors: usize,
    /// Keep picture pixels without any surviving neighbour.
    pub keep_isolated_pixels: bool,
}

impl Default for Tailcuts {
    fn default() -> Self {
        Self {
            picture_threshold_pe: 10.0,
            boundary_threshold_pe: 5.0,
            min_picture_neighbors: 0,
            keep_isolated_pixels: false,
        }
    }
}

impl Tailcuts {
    pub(crate) fn schema() -> ComponentSchema {
        ComponentSchema::new("tailcuts", "Picture/boundary threshold cleaning")
            .param(
                ParamSpec::new("picture_threshold_pe", ParamType::Float)
                    .default(10.0)
                    .range(Some(0.0), None)
                    .help("Charge a core pixel must reach"),
            )
            .param(
                ParamSpec::new("boundary_threshold_pe", ParamType::Float)
                    .default(5.0)
                    .range(Some(0.0), None)
                    .help("Charge a pixel next to a core pixel must reach"),
            )
            .param(
                ParamSpec::new("min_picture_neighbors", ParamType::Int)
                    .default(0)
                    .range(Some(0.0), None)
                    .help("Minimum number of core neighbours of a core pixel"),
            )
            .param(
                ParamSpec::new("keep_isolated_pixels", ParamType::Bool)
                    .default(false)
                    .help("Keep core pixels that have no surviving neighbour"),
            )
    }

    /// Cleaning mask of `image`.
    pub fn mask(&self, topology: &CameraTopology, image: &[f32]) -> Vec<bool> {
        let above_picture: Vec<bool> = image
            .iter()
            .map(|&q| f64::from(q) >= self.picture_threshold_pe)
            .collect();
        let above_boundary: Vec<bool> = image
            .iter()
            .map(|&q| f64::from(q) >= self.boundary_threshold_pe)
            .collect();

        let in_picture: Vec<bool> = if self.keep_isolated_pixels || self.min_picture_neighbors == 0
        {
            above_picture
        } else {
            (0..image.len())
                .map(|p| {
                    above_picture[p]
                        && topology.count_neighbors(p, &above_picture) >= self.min_picture_neighbors
                })
                .collect()
        };

        (0..image.len())
            .map(|p| {
                let boundary = above_boundary[p] && topology.any_neighbor(p, &in_picture);
                let picture = in_picture[p]
                    && (self.keep_isolated_pixels || topology.any_neighbor(p, &above_boundary));
                boundary || picture
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 5x5 camera. Pixel `i` sits at row `i / 5`, column `i % 5`.
    fn topology() -> CameraTopology {
        CameraTopology::from_camera(&CameraDescription::square("Sq", 5, 0.1, 1.0))
    }

    fn image() -> Vec<f32> {
        let mut image = vec![0.0; 25];
        image[12] = 20.0;
        image[13] = 12.0;
        image[7] = 6.0;
        image[0] = 15.0;
        image[24] = 6.0;
        image
    }

    fn selected(mask: &[bool]) -> Vec<usize> {
        mask.iter()
            .enumerate()
            .filter(|(_, &m)| m)
            .map(|(i, _)| i)
            .collect()
    }

    #[test]
    fn test_border_rings() {
        let topology = topology();
        assert_eq!(topology.border_width_1.iter().filter(|&&b| b).count(), 16);
        let inner: Vec<bool> = topology.border_width_2.iter().map(|&b| !b).collect();
        assert_eq!(selected(&inner), vec![12]);
        assert_eq!(topology.neighbors[12], vec![7, 11, 13, 17]);
    }

    #[test]
    fn test_tailcuts_drops_isolated_pixels() {
        let mask = Tailcuts::default().mask(&topology(), &image());
        assert_eq!(selected(&mask), vec![7, 12, 13]);
    }

    #[test]
    fn test_tailcuts_keeps_isolated_on_request() {
        let cleaner = Tailcuts {
            keep_isolated_pixels: true,
            ..Default::default()
        };
        assert_eq!(selected(&cleaner.mask(&topology(), &image())), vec![0, 7, 12, 13]);
    }

    #[test]
    fn test_min_picture_neighbors() {
        let cleaner = Tailcuts {
            min_picture_neighbors: 2,
            ..Default::default()
        };
        // 12 and 13 only have each other
        assert!(selected(&cleaner.mask(&topology(), &image())).is_empty());
    }
}
