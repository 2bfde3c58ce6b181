//! Stereo reconstruction: DL1 parameters to DL2.
//!
//! ```text
//!   tel 1 params ─┐                    ┌─▶ geometry       (major-axis fit)
//!   tel 2 params ─┼─▶ telescope query ─┼─▶ energy         (regressor, stereo mean)
//!   tel N params ─┘                    └─▶ classification (classifier, stereo mean)
//! ```
//!
//! Only telescopes passing the quality query take part. The three DL2
//! containers are always written; `is_valid` tells whether each one could be
//! computed. Per-telescope predictions are combined into an intensity
//! weighted mean whose uncertainty is the weighted spread, or the model's own
//! uncertainty for a single telescope.
//!
//! Events that already carry all DL2 containers pass through unchanged.

pub mod geometry;
pub mod model;

use std::collections::BTreeMap;
use std::sync::Arc;

use cta_core::config::{Component, ComponentConfig, ComponentSchema, ParamSpec, ParamType};
use cta_core::containers::{
    ImageParameters, ParticleClassification, ReconstructedEnergy, ReconstructedGeometry,
};
use cta_core::{
    ArrayEvent, ConfigurationError, DataField, RunContext, StageComputationError,
    SubarrayDescription, TelId,
};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

pub use geometry::{reconstruct, AxisImage, StereoGeometry};
pub use model::{
    FeatureMatrix, LinearModel, LogisticModel, Model, ModelError, ModelSpec, Prediction,
};

use crate::quality::QualityQuery;
use crate::stage::{Stage, StageFactory};

const NAME: &str = "shower_processor";

#[derive(Debug, Clone, Deserialize)]
struct ShowerProcessorParams {
    quality_criteria: Vec<(String, String)>,
    min_telescopes: usize,
}

#[derive(Debug, Clone, Copy, Default)]
struct Counts {
    events: u64,
    valid_geometry: u64,
    valid_energy: u64,
    valid_classification: u64,
}

/// DL1 parameter to DL2 stage.
#[derive(Debug)]
pub struct ShowerProcessor {
    quality: QualityQuery,
    min_telescopes: usize,
    energy_regressor: Box<dyn Model>,
    particle_classifier: Box<dyn Model>,
    /// Ground position (x, y) and focal length per telescope.
    telescopes: BTreeMap<TelId, ([f64; 2], f64)>,
    counts: Counts,
}

impl Component for ShowerProcessor {
    const NAME: &'static str = NAME;

    fn schema() -> ComponentSchema {
        ComponentSchema::new(NAME, "Stereo reconstruction of direction, energy and particle type")
            .param(
                ParamSpec::new("quality_criteria", ParamType::StrPairList)
                    .default(json!([
                        ["enough_intensity", "hillas_intensity > 50"],
                        ["not_truncated", "leakage_intensity_width_2 < 0.8"],
                    ]))
                    .help("Criteria a telescope image must pass to be used"),
            )
            .param(
                ParamSpec::new("min_telescopes", ParamType::Int)
                    .default(2)
                    .range(Some(2.0), None)
                    .help("Telescopes needed for a geometry fit"),
            )
            .child(model::regressor_schema("energy_regressor"))
            .child(model::classifier_schema("particle_classifier"))
    }

    fn from_config(config: &ComponentConfig) -> Result<Self, ConfigurationError> {
        Self::build(config, &SubarrayDescription::new(""))
    }
}

impl ShowerProcessor {
    /// Build for the telescopes of `subarray`.
    pub fn build(
        config: &ComponentConfig,
        subarray: &SubarrayDescription,
    ) -> Result<Self, ConfigurationError> {
        let params: ShowerProcessorParams = config.extract()?;
        let quality = QualityQuery::new(
            &config.key("quality_criteria"),
            &params.quality_criteria,
            &ImageParameters::column_names(),
        )?;
        let energy_regressor = model::build_model(config.child("energy_regressor")?, "linear")?;
        let particle_classifier =
            model::build_model(config.child("particle_classifier")?, "logistic")?;

        let telescopes = subarray
            .tels
            .iter()
            .filter_map(|(&tel_id, tel)| {
                let position = subarray.positions.get(&tel_id)?;
                Some((
                    tel_id,
                    (
                        [position[0], position[1]],
                        tel.optics.equivalent_focal_length,
                    ),
                ))
            })
            .collect();
        debug!(
            energy_model = energy_regressor.kind(),
            classifier_model = particle_classifier.kind(),
            min_telescopes = params.min_telescopes,
            "Shower processor configured"
        );

        Ok(Self {
            quality,
            min_telescopes: params.min_telescopes,
            energy_regressor,
            particle_classifier,
            telescopes,
            counts: Counts::default(),
        })
    }

    fn geometry(
        &self,
        event: &ArrayEvent,
        selected: &[(TelId, &ImageParameters)],
    ) -> Result<ReconstructedGeometry, String> {
        let mut images = Vec::with_capacity(selected.len());
        for &(tel_id, params) in selected {
            let h = &params.hillas;
            let (Some(x), Some(y), Some(psi), Some(intensity)) = (h.x, h.y, h.psi, h.intensity)
            else {
                continue;
            };
            let &(position, focal_length) = self
                .telescopes
                .get(&tel_id)
                .ok_or_else(|| format!("telescope {tel_id} is not in the subarray"))?;
            images.push(AxisImage {
                position,
                focal_length,
                x,
                y,
                psi,
                intensity,
            });
        }

        let invalid = ReconstructedGeometry {
            n_tels: Some(images.len() as i64),
            is_valid: Some(false),
            ..Default::default()
        };
        if images.len() < self.min_telescopes {
            return Ok(invalid);
        }
        let (Some(alt), Some(az)) = (event.pointing.array_altitude, event.pointing.array_azimuth)
        else {
            return Err("event has no array pointing".into());
        };
        Ok(match reconstruct(&images, alt, az) {
            Some(fit) => ReconstructedGeometry {
                alt: Some(fit.alt),
                alt_uncert: Some(fit.alt_uncert),
                az: Some(fit.az),
                az_uncert: Some(fit.az_uncert),
                core_x: Some(fit.core_x),
                core_y: Some(fit.core_y),
                n_tels: Some(fit.n_tels as i64),
                is_valid: Some(true),
            },
            None => invalid,
        })
    }
}

/// Run `model` on every selected telescope that has all its features and
/// combine the results. `None` when no telescope qualifies.
fn stereo_prediction(
    model: &dyn Model,
    selected: &[(TelId, &ImageParameters)],
) -> Result<Option<Prediction>, ModelError> {
    let mut features = FeatureMatrix::new(model.features().to_vec());
    let mut weights = Vec::new();
    for (_, params) in selected {
        let row: Option<Vec<f64>> = model.features().iter().map(|c| params.value(c)).collect();
        if let Some(row) = row {
            features.rows.push(row);
            weights.push(params.value("hillas_intensity").unwrap_or(1.0).max(0.0));
        }
    }
    if features.is_empty() {
        return Ok(None);
    }
    let predictions = model.predict(&features)?;
    Ok(Some(combine(&predictions, &weights)))
}

fn combine(predictions: &[Prediction], weights: &[f64]) -> Prediction {
    if let [single] = predictions {
        return *single;
    }
    let mut total: f64 = weights.iter().sum();
    let uniform;
    let weights = if total > 0.0 {
        weights
    } else {
        uniform = vec![1.0; predictions.len()];
        total = predictions.len() as f64;
        &uniform[..]
    };
    let mean = predictions
        .iter()
        .zip(weights)
        .map(|(p, w)| p.value * w)
        .sum::<f64>()
        / total;
    let variance = predictions
        .iter()
        .zip(weights)
        .map(|(p, w)| w * (p.value - mean).powi(2))
        .sum::<f64>()
        / total;
    Prediction {
        value: mean,
        uncertainty: variance.sqrt(),
    }
}

impl Stage for ShowerProcessor {
    fn name(&self) -> &'static str {
        NAME
    }

    fn reads(&self) -> &'static [DataField] {
        &[DataField::Dl1Parameters]
    }

    fn writes(&self) -> &'static [DataField] {
        &[
            DataField::Dl2Geometry,
            DataField::Dl2Energy,
            DataField::Dl2Classification,
        ]
    }

    fn process(
        &mut self,
        event: &mut ArrayEvent,
        _ctx: &RunContext,
    ) -> Result<(), StageComputationError> {
        let dl2 = &event.dl2;
        if dl2.geometry.is_some() && dl2.energy.is_some() && dl2.classification.is_some() {
            return Ok(());
        }
        let fail = |e: String| StageComputationError::new(NAME, e);

        let mut selected = Vec::new();
        for (&tel_id, tel) in &event.tel {
            let Some(params) = &tel.dl1.parameters else {
                continue;
            };
            if self.quality.check(|column| params.value(column)) {
                selected.push((tel_id, params));
            }
        }

        let geometry = self.geometry(event, &selected).map_err(fail)?;
        let energy = stereo_prediction(self.energy_regressor.as_ref(), &selected)
            .map_err(|e| fail(format!("energy_regressor: {e}")))?;
        let classification = stereo_prediction(self.particle_classifier.as_ref(), &selected)
            .map_err(|e| fail(format!("particle_classifier: {e}")))?;

        self.counts.events += 1;
        self.counts.valid_geometry += u64::from(geometry.is_valid == Some(true));
        self.counts.valid_energy += u64::from(energy.is_some());
        self.counts.valid_classification += u64::from(classification.is_some());

        event.dl2.geometry = Some(geometry);
        event.dl2.energy = Some(match energy {
            Some(p) => ReconstructedEnergy {
                energy: Some(p.value),
                energy_uncert: Some(p.uncertainty),
                is_valid: Some(true),
            },
            None => ReconstructedEnergy {
                is_valid: Some(false),
                ..Default::default()
            },
        });
        event.dl2.classification = Some(match classification {
            Some(p) => ParticleClassification {
                score: Some(p.value),
                score_uncert: Some(p.uncertainty),
                is_valid: Some(true),
            },
            None => ParticleClassification {
                is_valid: Some(false),
                ..Default::default()
            },
        });
        Ok(())
    }

    fn finish(&mut self, ctx: &mut RunContext) {
        ctx.provenance.set_counter(
            NAME,
            json!({
                "events": self.counts.events,
                "valid_geometry": self.counts.valid_geometry,
                "valid_energy": self.counts.valid_energy,
                "valid_classification": self.counts.valid_classification,
                "telescope_quality": self.quality.summary(),
            }),
        );
    }
}

/// Factory for [`ShowerProcessor`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ShowerProcessorFactory;

impl StageFactory for ShowerProcessorFactory {
    fn name(&self) -> &'static str {
        NAME
    }

    fn description(&self) -> &'static str {
        "Direction, energy and particle type reconstruction (dl1.parameters -> dl2.*)"
    }

    fn schema(&self) -> ComponentSchema {
        ShowerProcessor::schema()
    }

    fn build(
        &self,
        config: &ComponentConfig,
        subarray: &Arc<SubarrayDescription>,
    ) -> Result<Box<dyn Stage>, ConfigurationError> {
        Ok(Box::new(ShowerProcessor::build(config, subarray)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cta_core::config::{resolve, ConfigSources};
    use cta_core::containers::{HillasParameters, LeakageParameters, TelescopeEvent};
    use cta_core::subarray::{CameraDescription, OpticsDescription, TelescopeDescription};
    use cta_core::EventIndex;

    const POSITIONS: [[f64; 2]; 4] = [[150.0, 0.0], [0.0, 150.0], [-150.0, 0.0], [0.0, -150.0]];

    fn subarray() -> Arc<SubarrayDescription> {
        let tel = TelescopeDescription {
            name: "T".into(),
            optics: OpticsDescription {
                name: "O".into(),
                equivalent_focal_length: 16.0,
                mirror_area: 100.0,
            },
            camera: CameraDescription::square("Sq", 5, 0.1, 1.0),
        };
        let mut subarray = SubarrayDescription::new("ring");
        for (i, p) in POSITIONS.iter().enumerate() {
            subarray = subarray.with_telescope(i as TelId + 1, [p[0], p[1], 0.0], tel.clone());
        }
        Arc::new(subarray)
    }

    fn processor() -> ShowerProcessor {
        let config = resolve(&ShowerProcessor::schema(), &ConfigSources::default()).unwrap();
        ShowerProcessor::build(&config, &subarray()).unwrap()
    }

    /// Shower with core (30, -40) on the pointing axis, seen by all four
    /// telescopes with the given intensities.
    fn event(intensities: [f64; 4]) -> ArrayEvent {
        let mut event = ArrayEvent::new(EventIndex::new(1, 1), 0, subarray());
        event.pointing.array_altitude = Some(70.0);
        event.pointing.array_azimuth = Some(0.0);
        for (i, (p, intensity)) in POSITIONS.iter().zip(intensities).enumerate() {
            let psi = (-40.0 - p[1]).atan2(30.0 - p[0]);
            let mut tel = TelescopeEvent::default();
            tel.dl1.parameters = Some(ImageParameters {
                hillas: HillasParameters {
                    intensity: Some(intensity),
                    x: Some(0.1 * psi.cos()),
                    y: Some(0.1 * psi.sin()),
                    psi: Some(psi.to_degrees()),
                    width: Some(0.02),
                    length: Some(0.05),
                    ..Default::default()
                },
                leakage: LeakageParameters {
                    intensity_width_2: Some(0.0),
                    ..Default::default()
                },
                ..Default::default()
            });
            event.tel.insert(i as TelId + 1, tel);
        }
        event
    }

    #[test]
    fn test_full_reconstruction() {
        let mut stage = processor();
        let mut event = event([200.0; 4]);
        stage.process(&mut event, &RunContext::new(false)).unwrap();

        let geometry = event.dl2.geometry.as_ref().unwrap();
        assert_eq!(geometry.is_valid, Some(true));
        assert_eq!(geometry.n_tels, Some(4));
        assert!((geometry.core_x.unwrap() - 30.0).abs() < 1e-6);
        assert!((geometry.core_y.unwrap() + 40.0).abs() < 1e-6);
        assert!((geometry.alt.unwrap() - 70.0).abs() < 1e-6);

        // log10(200) - 2.7
        let energy = event.dl2.energy.as_ref().unwrap();
        assert_eq!(energy.is_valid, Some(true));
        assert!((energy.energy.unwrap() - 10f64.powf(200f64.log10() - 2.7)).abs() < 1e-9);

        let gh = event.dl2.classification.as_ref().unwrap();
        let expected = 1.0 / (1.0 + (-(3.0 - 60.0 * 0.02 - 10.0 * 0.05f64)).exp());
        assert!((gh.score.unwrap() - expected).abs() < 1e-9);
    }

    #[test]
    fn test_single_telescope_has_no_geometry() {
        let mut stage = processor();
        let mut event = event([200.0, 10.0, 10.0, 10.0]);
        stage.process(&mut event, &RunContext::new(false)).unwrap();

        let geometry = event.dl2.geometry.as_ref().unwrap();
        assert_eq!(geometry.is_valid, Some(false));
        assert_eq!(geometry.n_tels, Some(1));
        assert_eq!(geometry.alt, None);

        let energy = event.dl2.energy.as_ref().unwrap();
        assert_eq!(energy.is_valid, Some(true));
        let value = energy.energy.unwrap();
        let expected = value * std::f64::consts::LN_10 * 0.1;
        assert!((energy.energy_uncert.unwrap() - expected).abs() < 1e-12);
    }

    #[test]
    fn test_no_usable_telescope() {
        let mut stage = processor();
        let mut event = event([10.0; 4]);
        stage.process(&mut event, &RunContext::new(false)).unwrap();
        assert_eq!(event.dl2.energy.as_ref().unwrap().is_valid, Some(false));
        assert_eq!(event.dl2.classification.as_ref().unwrap().score, None);

        let mut ctx = RunContext::new(false);
        ctx.provenance.start_activity("test");
        stage.finish(&mut ctx);
        let counters = &ctx.provenance.current().unwrap().counters[NAME];
        assert_eq!(counters["events"], 1);
        assert_eq!(counters["valid_energy"], 0);
        assert_eq!(counters["telescope_quality"]["evaluated"], 4);
    }

    #[test]
    fn test_missing_pointing_fails_the_event() {
        let mut stage = processor();
        let mut event = event([200.0; 4]);
        event.pointing.array_altitude = None;
        let err = stage.process(&mut event, &RunContext::new(false)).unwrap_err();
        assert_eq!(err.stage, NAME);
        assert!(event.dl2.geometry.is_none());
    }

    #[test]
    fn test_existing_dl2_passes_through() {
        let mut stage = processor();
        let mut event = event([200.0; 4]);
        event.dl2.geometry = Some(ReconstructedGeometry::default());
        event.dl2.energy = Some(ReconstructedEnergy {
            energy: Some(42.0),
            ..Default::default()
        });
        event.dl2.classification = Some(ParticleClassification::default());
        stage.process(&mut event, &RunContext::new(false)).unwrap();
        assert_eq!(event.dl2.energy.as_ref().unwrap().energy, Some(42.0));
    }

    #[test]
    fn test_combine_uses_intensity_weights() {
        let predictions = [
            Prediction {
                value: 1.0,
                uncertainty: 0.5,
            },
            Prediction {
                value: 4.0,
                uncertainty: 0.5,
            },
        ];
        let combined = combine(&predictions, &[3.0, 1.0]);
        assert!((combined.value - 1.75).abs() < 1e-12);
        // sqrt((3 * 0.5625 + 1 * 5.0625) / 4)
        assert!((combined.uncertainty - 1.299038105676658).abs() < 1e-12);
    }
}
