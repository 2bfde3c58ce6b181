//! Camera calibration: raw waveforms to charge images.
//!
//! Per telescope:
//!
//! 1. gain selection: the low gain channel is used for pixels whose high
//!    gain trace reaches `gain_selection_threshold` ADC counts,
//! 2. pedestal subtraction per sample,
//! 3. charge extraction with the configured [`ImageExtractor`],
//! 4. conversion to photo-electrons with the per-pixel `dc_to_pe` factor.
//!
//! Telescopes that already carry an image (DL1 inputs) are left untouched.

use std::sync::Arc;

use cta_core::config::{Component, ComponentConfig, ComponentSchema, ParamSpec, ParamType};
use cta_core::containers::{CalibrationCoefficients, TelescopeEvent};
use cta_core::{
    ArrayEvent, ConfigurationError, DataField, RunContext, StageComputationError,
    SubarrayDescription, TelId,
};
use serde::Deserialize;
use tracing::debug;

use crate::stage::{Stage, StageFactory};

const NAME: &str = "calibrator";

/// Charge and pulse time extraction from one pedestal-subtracted trace.
pub trait ImageExtractor: std::fmt::Debug {
    /// Extractor name, equal to its configuration section key.
    fn name(&self) -> &'static str;

    /// Integrated charge (ADC counts) and charge-weighted peak position
    /// (samples).
    fn extract(&self, trace: &[f32]) -> (f32, f32);
}

/// Weighted mean sample index of the positive part of `window`, offset by
/// `start`. The window centre when nothing is positive.
fn peak_position(window: &[f32], start: usize) -> f32 {
    let mut sum = 0.0;
    let mut weighted = 0.0;
    for (i, &v) in window.iter().enumerate() {
        if v > 0.0 {
            sum += v;
            weighted += v * i as f32;
        }
    }
    if sum > 0.0 {
        start as f32 + weighted / sum
    } else {
        start as f32 + (window.len() as f32 - 1.0).max(0.0) / 2.0
    }
}

/// Sum of the whole trace.
#[derive(Debug, Clone, Default)]
pub struct FullWaveformSum;

impl ImageExtractor for FullWaveformSum {
    fn name(&self) -> &'static str {
        "full_waveform_sum"
    }

    fn extract(&self, trace: &[f32]) -> (f32, f32) {
        (trace.iter().sum(), peak_position(trace, 0))
    }
}

/// Sum of a fixed-width window placed around the brightest sample.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LocalPeakWindowSum {
    /// Samples in the window.
    pub window_width: usize,
    /// Samples of the window before the peak.
    pub window_shift: usize,
}

impl LocalPeakWindowSum {
    fn schema() -> ComponentSchema {
        ComponentSchema::new("local_peak_window_sum", "Window around the brightest sample")
            .param(
                ParamSpec::new("window_width", ParamType::Int)
                    .default(7)
                    .range(Some(1.0), None)
                    .help("Number of samples summed"),
            )
            .param(
                ParamSpec::new("window_shift", ParamType::Int)
                    .default(3)
                    .range(Some(0.0), None)
                    .help("Samples of the window before the peak"),
            )
    }
}

impl ImageExtractor for LocalPeakWindowSum {
    fn name(&self) -> &'static str {
        "local_peak_window_sum"
    }

    fn extract(&self, trace: &[f32]) -> (f32, f32) {
        if trace.is_empty() {
            return (0.0, 0.0);
        }
        let peak = trace
            .iter()
            .enumerate()
            .fold((0, f32::MIN), |best, (i, &v)| if v > best.1 { (i, v) } else { best })
            .0;
        let width = self.window_width.min(trace.len());
        let start = peak
            .saturating_sub(self.window_shift)
            .min(trace.len() - width);
        let window = &trace[start..start + width];
        (window.iter().sum(), peak_position(window, start))
    }
}

#[derive(Debug, Clone, Deserialize)]
struct CalibratorParams {
    image_extractor_type: String,
    gain_selection_threshold: f64,
}

/// Raw-to-DL1 calibration stage.
#[derive(Debug)]
pub struct CameraCalibrator {
    extractor: Box<dyn ImageExtractor + Send>,
    gain_selection_threshold: f64,
    subarray: Arc<SubarrayDescription>,
    calibrated: u64,
    low_gain_pixels: u64,
}

impl Component for CameraCalibrator {
    const NAME: &'static str = NAME;

    fn schema() -> ComponentSchema {
        ComponentSchema::new(NAME, "Waveform calibration and charge extraction")
            .param(
                ParamSpec::new("image_extractor_type", ParamType::Str)
                    .default("local_peak_window_sum")
                    .choices(["full_waveform_sum", "local_peak_window_sum"])
                    .help("Charge extraction algorithm"),
            )
            .param(
                ParamSpec::new("gain_selection_threshold", ParamType::Float)
                    .default(3500.0)
                    .range(Some(0.0), None)
                    .help("High gain ADC level above which the low gain is used"),
            )
            .child(ComponentSchema::new("full_waveform_sum", "Sum of all samples"))
            .child(LocalPeakWindowSum::schema())
    }

    /// Without a subarray every camera is assumed to sample at 1 GHz.
    fn from_config(config: &ComponentConfig) -> Result<Self, ConfigurationError> {
        Self::build(config, Arc::new(SubarrayDescription::new("")))
    }
}

impl CameraCalibrator {
    /// Build for events of `subarray`.
    pub fn build(
        config: &ComponentConfig,
        subarray: Arc<SubarrayDescription>,
    ) -> Result<Self, ConfigurationError> {
        let params: CalibratorParams = config.extract()?;
        let extractor: Box<dyn ImageExtractor + Send> = match params.image_extractor_type.as_str()
        {
            "full_waveform_sum" => Box::new(FullWaveformSum),
            "local_peak_window_sum" => {
                Box::new(config.child("local_peak_window_sum")?.extract::<LocalPeakWindowSum>()?)
            }
            other => {
                return Err(ConfigurationError::invalid(
                    config.key("image_extractor_type"),
                    other,
                    "full_waveform_sum or local_peak_window_sum",
                ))
            }
        };
        debug!(extractor = extractor.name(), "Calibrator configured");
        Ok(Self {
            extractor,
            gain_selection_threshold: params.gain_selection_threshold,
            subarray,
            calibrated: 0,
            low_gain_pixels: 0,
        })
    }

    /// Name of the active extractor.
    pub fn extractor_name(&self) -> &'static str {
        self.extractor.name()
    }

    fn calibrate_telescope(
        &self,
        tel_id: TelId,
        tel: &mut TelescopeEvent,
    ) -> Result<u64, String> {
        let Some(raw) = &tel.raw else {
            return Ok(0);
        };
        let calib: &CalibrationCoefficients = tel
            .calibration
            .as_deref()
            .ok_or_else(|| format!("telescope {tel_id} has no calibration coefficients"))?;
        if raw.n_channels == 0 {
            return Err(format!("telescope {tel_id}: waveform has no gain channels"));
        }
        if raw.samples.len() != raw.n_channels * raw.n_pixels * raw.n_samples {
            return Err(format!(
                "telescope {tel_id}: waveform has {} samples for shape {}x{}x{}",
                raw.samples.len(),
                raw.n_channels,
                raw.n_pixels,
                raw.n_samples
            ));
        }
        let coefficients = raw.n_channels * raw.n_pixels;
        if calib.n_pixels != raw.n_pixels
            || calib.n_channels < raw.n_channels
            || calib.pedestal_per_sample.len() < coefficients
            || calib.dc_to_pe.len() < coefficients
        {
            return Err(format!(
                "telescope {tel_id}: calibration for {}x{} ({} pedestals, {} factors) \
                 does not fit waveform {}x{}",
                calib.n_channels,
                calib.n_pixels,
                calib.pedestal_per_sample.len(),
                calib.dc_to_pe.len(),
                raw.n_channels,
                raw.n_pixels
            ));
        }
        let sampling_rate = self
            .subarray
            .tel(tel_id)
            .map_or(1.0, |t| t.camera.sampling_rate) as f32;

        let mut image = Vec::with_capacity(raw.n_pixels);
        let mut peak_time = Vec::with_capacity(raw.n_pixels);
        let mut gains = Vec::with_capacity(raw.n_pixels);
        let mut low_gain = 0;
        let mut trace = Vec::with_capacity(raw.n_samples);
        for pixel in 0..raw.n_pixels {
            let saturated = raw.n_channels > 1
                && raw
                    .trace(0, pixel)
                    .iter()
                    .any(|&s| f64::from(s) >= self.gain_selection_threshold);
            let channel = usize::from(saturated);
            low_gain += u64::from(saturated);

            let pedestal = calib.pedestal(channel, pixel);
            trace.clear();
            trace.extend(raw.trace(channel, pixel).iter().map(|&s| f32::from(s) - pedestal));
            let (charge, peak) = self.extractor.extract(&trace);

            image.push(charge * calib.dc_to_pe(channel, pixel));
            peak_time.push(peak / sampling_rate);
            gains.push(channel as u8);
        }

        tel.dl1.image = Some(image);
        tel.dl1.peak_time = Some(peak_time);
        tel.selected_gain_channel = Some(gains);
        Ok(low_gain)
    }
}

impl Stage for CameraCalibrator {
    fn name(&self) -> &'static str {
        NAME
    }

    fn reads(&self) -> &'static [DataField] {
        &[DataField::Raw]
    }

    fn writes(&self) -> &'static [DataField] {
        &[DataField::Dl1Image]
    }

    fn process(
        &mut self,
        event: &mut ArrayEvent,
        _ctx: &RunContext,
    ) -> Result<(), StageComputationError> {
        for (&tel_id, tel) in event.tel.iter_mut() {
            if tel.dl1.image.is_some() {
                continue;
            }
            let low_gain = self
                .calibrate_telescope(tel_id, tel)
                .map_err(|e| StageComputationError::new(NAME, e))?;
            if tel.dl1.image.is_some() {
                self.calibrated += 1;
                self.low_gain_pixels += low_gain;
            }
        }
        Ok(())
    }

    fn finish(&mut self, ctx: &mut RunContext) {
        ctx.provenance.set_counter(
            "calibrator",
            serde_json::json!({
                "telescope_events": self.calibrated,
                "low_gain_pixels": self.low_gain_pixels,
            }),
        );
    }
}

/// Factory for [`CameraCalibrator`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CalibratorFactory;

impl StageFactory for CalibratorFactory {
    fn name(&self) -> &'static str {
        NAME
    }

    fn description(&self) -> &'static str {
        "Gain selection, pedestal subtraction and charge extraction (raw -> dl1.image)"
    }

    fn schema(&self) -> ComponentSchema {
        CameraCalibrator::schema()
    }

    fn build(
        &self,
        config: &ComponentConfig,
        subarray: &Arc<SubarrayDescription>,
    ) -> Result<Box<dyn Stage>, ConfigurationError> {
        Ok(Box::new(CameraCalibrator::build(config, Arc::clone(subarray))?))
    }
}
