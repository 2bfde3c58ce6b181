//! Instrument geometry.
//!
//! A [`SubarrayDescription`] is built once when a source is opened and then
//! shared through `Arc` with every event the source yields. Nothing mutates
//! it afterwards; code that needs a reduced view calls
//! [`SubarrayDescription::select`], which returns a copy.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::containers::TelId;

/// Optical system of one telescope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpticsDescription {
    /// Optics name, e.g. `"LST"`.
    pub name: String,
    /// Equivalent focal length, m.
    pub equivalent_focal_length: f64,
    /// Total mirror area, m².
    pub mirror_area: f64,
}

/// Camera of one telescope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraDescription {
    /// Camera name, e.g. `"LSTCam"`.
    pub name: String,
    /// Pixel x positions in the camera frame, m.
    pub pix_x: Vec<f64>,
    /// Pixel y positions in the camera frame, m.
    pub pix_y: Vec<f64>,
    /// Pixel areas, m².
    pub pix_area: Vec<f64>,
    /// Readout sampling rate, GHz.
    pub sampling_rate: f64,
    /// Number of gain channels.
    pub n_channels: usize,
}

impl CameraDescription {
    /// Number of pixels.
    pub fn n_pixels(&self) -> usize {
        self.pix_x.len()
    }

    /// Pixel adjacency lists.
    ///
    /// Two pixels are neighbours when their distance is below 1.4 times the
    /// smallest pixel spacing of the camera, which picks up the 4 or 6
    /// nearest pixels of square and hexagonal grids.
    pub fn neighbors(&self) -> Vec<Vec<usize>> {
        let n = self.n_pixels();
        let dist = |i: usize, j: usize| {
            let dx = self.pix_x[i] - self.pix_x[j];
            let dy = self.pix_y[i] - self.pix_y[j];
            (dx * dx + dy * dy).sqrt()
        };

        let mut min_spacing = f64::INFINITY;
        for i in 0..n {
            for j in (i + 1)..n {
                let d = dist(i, j);
                if d > 0.0 && d < min_spacing {
                    min_spacing = d;
                }
            }
        }

        let mut neighbors = vec![Vec::new(); n];
        if !min_spacing.is_finite() {
            return neighbors;
        }
        let limit = 1.4 * min_spacing;
        for i in 0..n {
            for j in (i + 1)..n {
                if dist(i, j) < limit {
                    neighbors[i].push(j);
                    neighbors[j].push(i);
                }
            }
        }
        neighbors
    }

    /// Pixels with fewer neighbours than the camera maximum, i.e. the
    /// outermost ring.
    pub fn border_pixels(&self, neighbors: &[Vec<usize>]) -> Vec<bool> {
        let max = neighbors.iter().map(Vec::len).max().unwrap_or(0);
        neighbors.iter().map(|n| n.len() < max).collect()
    }

    /// Square camera of `side` x `side` pixels with the given pitch, centred
    /// on the optical axis.
    pub fn square(name: impl Into<String>, side: usize, pitch: f64, sampling_rate: f64) -> Self {
        let offset = (side as f64 - 1.0) / 2.0;
        let mut pix_x = Vec::with_capacity(side * side);
        let mut pix_y = Vec::with_capacity(side * side);
        for row in 0..side {
            for col in 0..side {
                pix_x.push((col as f64 - offset) * pitch);
                pix_y.push((row as f64 - offset) * pitch);
            }
        }
        Self {
            name: name.into(),
            pix_area: vec![pitch * pitch; side * side],
            pix_x,
            pix_y,
            sampling_rate,
            n_channels: 1,
        }
    }
}

/// One telescope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelescopeDescription {
    /// Telescope type name, e.g. `"LST_LST_LSTCam"`.
    pub name: String,
    /// Optics.
    pub optics: OpticsDescription,
    /// Camera.
    pub camera: CameraDescription,
}

/// The set of telescopes active for a dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubarrayDescription {
    /// Subarray name.
    pub name: String,
    /// Telescopes by id.
    pub tels: BTreeMap<TelId, TelescopeDescription>,
    /// Telescope positions on the ground (x, y, z), m.
    pub positions: BTreeMap<TelId, [f64; 3]>,
}

impl SubarrayDescription {
    /// Empty subarray.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tels: BTreeMap::new(),
            positions: BTreeMap::new(),
        }
    }

    /// Add a telescope.
    pub fn with_telescope(
        mut self,
        tel_id: TelId,
        position: [f64; 3],
        telescope: TelescopeDescription,
    ) -> Self {
        self.tels.insert(tel_id, telescope);
        self.positions.insert(tel_id, position);
        self
    }

    /// Number of telescopes.
    pub fn n_tels(&self) -> usize {
        self.tels.len()
    }

    /// Telescope ids, ascending.
    pub fn tel_ids(&self) -> Vec<TelId> {
        self.tels.keys().copied().collect()
    }

    /// Telescope description by id.
    pub fn tel(&self, tel_id: TelId) -> Option<&TelescopeDescription> {
        self.tels.get(&tel_id)
    }

    /// Copy restricted to the given telescopes. Unknown ids are ignored.
    pub fn select(&self, tel_ids: &[TelId]) -> Self {
        Self {
            name: self.name.clone(),
            tels: self
                .tels
                .iter()
                .filter(|(id, _)| tel_ids.contains(id))
                .map(|(id, t)| (*id, t.clone()))
                .collect(),
            positions: self
                .positions
                .iter()
                .filter(|(id, _)| tel_ids.contains(id))
                .map(|(id, p)| (*id, *p))
                .collect(),
        }
    }

    /// First field that differs from `other`, as a path such as
    /// `n_telescopes` or `tel[3].camera.pix_x`. `None` if equal.
    ///
    /// The subarray name is not compared.
    pub fn diff(&self, other: &Self) -> Option<String> {
        if self.n_tels() != other.n_tels() {
            return Some("n_telescopes".into());
        }
        if self.tel_ids() != other.tel_ids() {
            return Some("tel_ids".into());
        }
        for (id, a) in &self.tels {
            let b = &other.tels[id];
            if self.positions.get(id) != other.positions.get(id) {
                return Some(format!("tel[{id}].position"));
            }
            let checks: [(&str, bool); 10] = [
                ("name", a.name == b.name),
                ("optics.name", a.optics.name == b.optics.name),
                (
                    "optics.equivalent_focal_length",
                    a.optics.equivalent_focal_length == b.optics.equivalent_focal_length,
                ),
                ("optics.mirror_area", a.optics.mirror_area == b.optics.mirror_area),
                ("camera.name", a.camera.name == b.camera.name),
                ("camera.pix_x", a.camera.pix_x == b.camera.pix_x),
                ("camera.pix_y", a.camera.pix_y == b.camera.pix_y),
                ("camera.pix_area", a.camera.pix_area == b.camera.pix_area),
                ("camera.sampling_rate", a.camera.sampling_rate == b.camera.sampling_rate),
                ("camera.n_channels", a.camera.n_channels == b.camera.n_channels),
            ];
            if let Some((field, _)) = checks.iter().find(|(_, equal)| !equal) {
                return Some(format!("tel[{id}].{field}"));
            }
        }
        None
    }
}
