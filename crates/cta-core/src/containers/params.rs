//! Scalar parameter containers.

use serde::{Deserialize, Serialize};

use super::{Container, FieldValue};

container! {
    /// Second-moment (Hillas) parameterisation of a cleaned image.
    HillasParameters, prefix = "hillas" {
        intensity: f64, "p.e.", "Total charge of the cleaned image";
        x: f64, "m", "Centroid x in the camera frame";
        y: f64, "m", "Centroid y in the camera frame";
        r: f64, "m", "Centroid distance from the camera centre";
        phi: f64, "deg", "Centroid polar angle";
        length: f64, "m", "Standard deviation along the major axis";
        width: f64, "m", "Standard deviation along the minor axis";
        psi: f64, "deg", "Major axis rotation angle";
        skewness: f64, "", "Third moment along the major axis";
        kurtosis: f64, "", "Fourth moment along the major axis";
    }
}

container! {
    /// Fraction of the image near the camera border.
    LeakageParameters, prefix = "leakage" {
        pixels_width_1: f64, "", "Fraction of image pixels in the outermost pixel ring";
        pixels_width_2: f64, "", "Fraction of image pixels in the two outermost rings";
        intensity_width_1: f64, "", "Fraction of image charge in the outermost pixel ring";
        intensity_width_2: f64, "", "Fraction of image charge in the two outermost rings";
    }
}

container! {
    /// Topology of the cleaning mask.
    MorphologyParameters, prefix = "morphology" {
        n_pixels: i64, "", "Number of pixels surviving cleaning";
        n_islands: i64, "", "Number of connected pixel groups";
    }
}

container! {
    /// Monte Carlo truth of a simulated air shower.
    SimulatedShower, prefix = "true" {
        energy: f64, "TeV", "Primary particle energy";
        alt: f64, "deg", "Primary direction altitude";
        az: f64, "deg", "Primary direction azimuth";
        core_x: f64, "m", "Shower core x on the ground";
        core_y: f64, "m", "Shower core y on the ground";
        h_first_int: f64, "m", "Height of the first interaction";
        x_max: f64, "g cm-2", "Depth of shower maximum";
        shower_primary_id: i64, "", "Primary particle id (0 gamma, 1 electron, 101 proton)";
    }
}

container! {
    /// Array pointing direction.
    PointingInfo, prefix = "pointing" {
        array_altitude: f64, "deg", "Array pointing altitude";
        array_azimuth: f64, "deg", "Array pointing azimuth";
    }
}

container! {
    /// Stereo direction and core reconstruction.
    ReconstructedGeometry, prefix = "reco" {
        alt: f64, "deg", "Reconstructed altitude";
        alt_uncert: f64, "deg", "Altitude uncertainty";
        az: f64, "deg", "Reconstructed azimuth";
        az_uncert: f64, "deg", "Azimuth uncertainty";
        core_x: f64, "m", "Reconstructed core x on the ground";
        core_y: f64, "m", "Reconstructed core y on the ground";
        n_tels: i64, "", "Number of telescopes used";
        is_valid: bool, "", "Whether the reconstruction succeeded";
    }
}

container! {
    /// Reconstructed primary energy.
    ReconstructedEnergy, prefix = "reco" {
        energy: f64, "TeV", "Reconstructed energy";
        energy_uncert: f64, "TeV", "Energy uncertainty";
        is_valid: bool, "", "Whether the reconstruction succeeded";
    }
}

container! {
    /// Gamma/hadron separation score.
    ParticleClassification, prefix = "gh" {
        score: f64, "", "Gammaness, 1 for gamma-like and 0 for hadron-like";
        score_uncert: f64, "", "Score uncertainty";
        is_valid: bool, "", "Whether the classification succeeded";
    }
}

/// All DL1 parameters of one telescope image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageParameters {
    /// Hillas moments.
    pub hillas: HillasParameters,
    /// Border leakage.
    pub leakage: LeakageParameters,
    /// Mask topology.
    pub morphology: MorphologyParameters,
}

impl ImageParameters {
    /// Every column name that [`ImageParameters::get`] understands.
    pub fn column_names() -> Vec<String> {
        let mut names = HillasParameters::column_names();
        names.extend(LeakageParameters::column_names());
        names.extend(MorphologyParameters::column_names());
        names
    }

    /// Look up a parameter by column name, e.g. `"hillas_intensity"`.
    pub fn get(&self, column: &str) -> Option<FieldValue> {
        self.hillas
            .get(column)
            .or_else(|| self.leakage.get(column))
            .or_else(|| self.morphology.get(column))
    }

    /// Numeric value of a column, `None` if unknown or missing.
    pub fn value(&self, column: &str) -> Option<f64> {
        self.get(column).and_then(|v| v.as_f64())
    }
}
