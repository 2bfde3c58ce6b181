//! Image cleaning and parameterisation: DL1 images to DL1 parameters.
//!
//! For every telescope image the processor
//!
//! 1. computes the [`Tailcuts`] cleaning mask,
//! 2. derives Hillas, leakage and morphology parameters from the surviving
//!    pixels,
//! 3. applies the image quality query. Images failing it keep their
//!    morphology but have Hillas and leakage parameters reset to missing,
//!    so no later stage uses them.
//!
//! An image without surviving charge is not an error; its parameters simply
//! stay missing.

pub mod cleaning;
pub mod parameters;

use std::collections::BTreeMap;
use std::sync::Arc;

use cta_core::config::{Component, ComponentConfig, ComponentSchema, ParamSpec, ParamType};
use cta_core::containers::{ImageParameters, TelescopeEvent};
use cta_core::{
    ArrayEvent, ConfigurationError, DataField, RunContext, StageComputationError,
    SubarrayDescription, TelId,
};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

pub use cleaning::{CameraTopology, Tailcuts};
pub use parameters::{hillas_parameters, leakage_parameters, morphology_parameters};

use crate::quality::QualityQuery;
use crate::stage::{Stage, StageFactory};

const NAME: &str = "image_processor";

#[derive(Debug, Clone, Deserialize)]
struct ImageProcessorParams {
    image_quality_criteria: Vec<(String, String)>,
}

/// DL1 image to DL1 parameter stage.
#[derive(Debug)]
pub struct ImageProcessor {
    cleaner: Tailcuts,
    quality: QualityQuery,
    topologies: BTreeMap<TelId, Arc<CameraTopology>>,
    parameterized: u64,
    without_signal: u64,
}

impl Component for ImageProcessor {
    const NAME: &'static str = NAME;

    fn schema() -> ComponentSchema {
        ComponentSchema::new(NAME, "Image cleaning and parameterisation")
            .param(
                ParamSpec::new("image_quality_criteria", ParamType::StrPairList)
                    .default(json!([["size_greater_0", "hillas_intensity > 0"]]))
                    .help("Criteria an image must pass to keep its Hillas and leakage parameters"),
            )
            .child(Tailcuts::schema())
    }

    /// Builds without any telescope; every image is then rejected.
    fn from_config(config: &ComponentConfig) -> Result<Self, ConfigurationError> {
        Self::build(config, &SubarrayDescription::new(""))
    }
}

impl ImageProcessor {
    /// Build for the cameras of `subarray`.
    pub fn build(
        config: &ComponentConfig,
        subarray: &SubarrayDescription,
    ) -> Result<Self, ConfigurationError> {
        let params: ImageProcessorParams = config.extract()?;
        let cleaner: Tailcuts = config.child("tailcuts")?.extract()?;
        let quality = QualityQuery::new(
            &config.key("image_quality_criteria"),
            &params.image_quality_criteria,
            &ImageParameters::column_names(),
        )?;

        let mut by_camera: BTreeMap<&str, Arc<CameraTopology>> = BTreeMap::new();
        let mut topologies = BTreeMap::new();
        for (&tel_id, tel) in &subarray.tels {
            let topology = by_camera
                .entry(tel.camera.name.as_str())
                .or_insert_with(|| Arc::new(CameraTopology::from_camera(&tel.camera)));
            topologies.insert(tel_id, Arc::clone(topology));
        }
        debug!(
            cameras = by_camera.len(),
            picture_threshold_pe = cleaner.picture_threshold_pe,
            boundary_threshold_pe = cleaner.boundary_threshold_pe,
            "Image processor configured"
        );

        Ok(Self {
            cleaner,
            quality,
            topologies,
            parameterized: 0,
            without_signal: 0,
        })
    }

    /// Active cleaning settings.
    pub fn cleaner(&self) -> &Tailcuts {
        &self.cleaner
    }

    fn process_telescope(&mut self, tel_id: TelId, tel: &mut TelescopeEvent) -> Result<(), String> {
        let Some(image) = &tel.dl1.image else {
            return Ok(());
        };
        let topology = self
            .topologies
            .get(&tel_id)
            .ok_or_else(|| format!("telescope {tel_id} is not in the subarray"))?;
        if image.len() != topology.n_pixels() {
            return Err(format!(
                "telescope {tel_id}: image has {} pixels, camera has {}",
                image.len(),
                topology.n_pixels()
            ));
        }

        let mask = self.cleaner.mask(topology, image);
        let mut parameters = ImageParameters {
            morphology: morphology_parameters(topology, &mask),
            ..Default::default()
        };
        match hillas_parameters(topology, image, &mask) {
            Some(hillas) => {
                parameters.hillas = hillas;
                parameters.leakage = leakage_parameters(topology, image, &mask);
            }
            None => self.without_signal += 1,
        }
        if !self.quality.check(|column| parameters.value(column)) {
            parameters.hillas = Default::default();
            parameters.leakage = Default::default();
        }

        tel.dl1.image_mask = Some(mask);
        tel.dl1.parameters = Some(parameters);
        self.parameterized += 1;
        Ok(())
    }
}

impl Stage for ImageProcessor {
    fn name(&self) -> &'static str {
        NAME
    }

    fn reads(&self) -> &'static [DataField] {
        &[DataField::Dl1Image]
    }

    fn writes(&self) -> &'static [DataField] {
        &[DataField::Dl1Parameters]
    }

    fn process(
        &mut self,
        event: &mut ArrayEvent,
        _ctx: &RunContext,
    ) -> Result<(), StageComputationError> {
        for (&tel_id, tel) in event.tel.iter_mut() {
            if tel.dl1.parameters.is_some() {
                continue;
            }
            self.process_telescope(tel_id, tel)
                .map_err(|e| StageComputationError::new(NAME, e))?;
        }
        Ok(())
    }

    fn finish(&mut self, ctx: &mut RunContext) {
        ctx.provenance.set_counter(
            NAME,
            json!({
                "telescope_events": self.parameterized,
                "without_signal": self.without_signal,
                "image_quality": self.quality.summary(),
            }),
        );
    }
}

/// Factory for [`ImageProcessor`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageProcessorFactory;

impl StageFactory for ImageProcessorFactory {
    fn name(&self) -> &'static str {
        NAME
    }

    fn description(&self) -> &'static str {
        "Tailcuts cleaning and Hillas/leakage/morphology parameters (dl1.image -> dl1.parameters)"
    }

    fn schema(&self) -> ComponentSchema {
        ImageProcessor::schema()
    }

    fn build(
        &self,
        config: &ComponentConfig,
        subarray: &Arc<SubarrayDescription>,
    ) -> Result<Box<dyn Stage>, ConfigurationError> {
        Ok(Box::new(ImageProcessor::build(config, subarray)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cta_core::config::{resolve, ConfigSources};
    use cta_core::subarray::{CameraDescription, OpticsDescription, TelescopeDescription};
    use cta_core::EventIndex;

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
        Arc::new(
            SubarrayDescription::new("t")
                .with_telescope(1, [0.0; 3], tel.clone())
                .with_telescope(2, [100.0, 0.0, 0.0], tel),
        )
    }

    fn processor(sources: ConfigSources) -> ImageProcessor {
        let config = resolve(&ImageProcessor::schema(), &sources).unwrap();
        ImageProcessor::build(&config, &subarray()).unwrap()
    }

    /// Telescope 1 sees a three pixel horizontal streak, telescope 2 nothing.
    fn event() -> ArrayEvent {
        let mut event = ArrayEvent::new(EventIndex::new(1, 1), 0, subarray());
        let mut image = vec![0.0; 25];
        image[11] = 12.0;
        image[12] = 30.0;
        image[13] = 12.0;
        for (tel_id, image) in [(1, image), (2, vec![0.0; 25])] {
            let mut tel = TelescopeEvent::default();
            tel.dl1.image = Some(image);
            event.tel.insert(tel_id, tel);
        }
        event
    }

    #[test]
    fn test_parameters_are_filled() {
        let mut stage = processor(ConfigSources::default());
        let mut event = event();
        stage.process(&mut event, &RunContext::new(false)).unwrap();

        let params = event.tel[&1].dl1.parameters.as_ref().unwrap();
        assert_eq!(params.hillas.intensity, Some(54.0));
        assert_eq!(params.morphology.n_pixels, Some(3));
        assert_eq!(params.morphology.n_islands, Some(1));
        assert_eq!(params.leakage.pixels_width_1, Some(0.0));
        let mask = event.tel[&1].dl1.image_mask.as_ref().unwrap();
        assert_eq!(mask.iter().filter(|&&m| m).count(), 3);

        // empty image: parameters exist but carry no Hillas values
        let empty = event.tel[&2].dl1.parameters.as_ref().unwrap();
        assert_eq!(empty.hillas.intensity, None);
        assert_eq!(empty.morphology.n_pixels, Some(0));
    }

    #[test]
    fn test_failed_quality_resets_hillas() {
        let mut stage = processor(
            ConfigSources::default()
                .set("image_quality_criteria", r#"[["bright", "hillas_intensity > 100"]]"#),
        );
        let mut event = event();
        stage.process(&mut event, &RunContext::new(false)).unwrap();
        let params = event.tel[&1].dl1.parameters.as_ref().unwrap();
        assert_eq!(params.hillas.intensity, None);
        assert_eq!(params.morphology.n_pixels, Some(3));

        let mut ctx = RunContext::new(false);
        ctx.provenance.start_activity("test");
        stage.finish(&mut ctx);
        let counters = &ctx.provenance.current().unwrap().counters;
        assert_eq!(counters[NAME]["image_quality"]["criteria"][0]["passed"], 0);
        assert_eq!(counters[NAME]["telescope_events"], 2);
    }

    #[test]
    fn test_cleaning_thresholds_are_scoped() {
        let stage = processor(ConfigSources::default().set("tailcuts.picture_threshold_pe", 8));
        assert_eq!(stage.cleaner().picture_threshold_pe, 8.0);
        assert_eq!(stage.cleaner().boundary_threshold_pe, 5.0);
    }

    #[test]
    fn test_unknown_quality_column_is_a_configuration_error() {
        let sources = ConfigSources::default()
            .set("image_quality_criteria", r#"[["x", "hillas_size > 0"]]"#);
        let config = resolve(&ImageProcessor::schema(), &sources).unwrap();
        let err = ImageProcessor::build(&config, &subarray()).unwrap_err();
        assert!(err.to_string().contains("image_quality_criteria"));
    }

    #[test]
    fn test_wrong_image_length_fails_the_event() {
        let mut stage = processor(ConfigSources::default());
        let mut event = event();
        event.tel.get_mut(&1).unwrap().dl1.image = Some(vec![1.0; 7]);
        let err = stage.process(&mut event, &RunContext::new(false)).unwrap_err();
        assert_eq!(err.stage, NAME);
        assert!(err.message.contains("7 pixels"));
    }
}
