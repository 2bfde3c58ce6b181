//! The per-event record.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::params::{
    ImageParameters, ParticleClassification, PointingInfo, ReconstructedEnergy,
    ReconstructedGeometry, SimulatedShower,
};
use crate::error::RecoverableDecodeError;
use crate::subarray::SubarrayDescription;

/// Telescope identifier.
pub type TelId = u16;

/// Composite event key, unique within one dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventIndex {
    /// Observation block (run) id.
    pub obs_id: u64,
    /// Event id within the observation.
    pub event_id: u64,
}

impl EventIndex {
    /// Create an index.
    pub fn new(obs_id: u64, event_id: u64) -> Self {
        Self { obs_id, event_id }
    }
}

impl fmt::Display for EventIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(obs_id={}, event_id={})", self.obs_id, self.event_id)
    }
}

/// Kind of trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Regular air shower trigger.
    #[default]
    Subarray,
    /// Flat-field calibration event.
    Flatfield,
    /// Pedestal calibration event.
    Pedestal,
    /// Anything else.
    Unknown,
}

impl EventType {
    /// Integer code used on disk.
    pub fn code(self) -> i64 {
        match self {
            EventType::Subarray => 32,
            EventType::Flatfield => 0,
            EventType::Pedestal => 2,
            EventType::Unknown => 255,
        }
    }

    /// Inverse of [`EventType::code`].
    pub fn from_code(code: i64) -> Self {
        match code {
            32 => EventType::Subarray,
            0 => EventType::Flatfield,
            2 => EventType::Pedestal,
            _ => EventType::Unknown,
        }
    }
}

/// Central trigger information.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriggerInfo {
    /// Trigger time in seconds since the Unix epoch.
    pub time: Option<f64>,
    /// Trigger type.
    pub event_type: EventType,
    /// Telescopes that took part in the trigger.
    pub tels_with_trigger: Vec<TelId>,
}

/// Raw ADC samples of one telescope, laid out `[channel][pixel][sample]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Waveform {
    /// Gain channels.
    pub n_channels: usize,
    /// Camera pixels.
    pub n_pixels: usize,
    /// Samples per pixel.
    pub n_samples: usize,
    /// Flattened samples.
    pub samples: Vec<u16>,
}

impl Waveform {
    /// Create a waveform, checking that the sample count matches the shape.
    pub fn new(
        n_channels: usize,
        n_pixels: usize,
        n_samples: usize,
        samples: Vec<u16>,
    ) -> Result<Self, String> {
        let expected = n_channels * n_pixels * n_samples;
        if samples.len() != expected {
            return Err(format!(
                "waveform has {} samples, expected {} ({}x{}x{})",
                samples.len(),
                expected,
                n_channels,
                n_pixels,
                n_samples
            ));
        }
        Ok(Self {
            n_channels,
            n_pixels,
            n_samples,
            samples,
        })
    }

    /// Samples of one pixel in one gain channel.
    pub fn trace(&self, channel: usize, pixel: usize) -> &[u16] {
        let start = (channel * self.n_pixels + pixel) * self.n_samples;
        &self.samples[start..start + self.n_samples]
    }
}

/// Per-telescope calibration coefficients, laid out `[channel][pixel]`.
///
/// Shared by every event of a run through an `Arc`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationCoefficients {
    /// Gain channels.
    pub n_channels: usize,
    /// Camera pixels.
    pub n_pixels: usize,
    /// Pedestal per sample, ADC counts.
    pub pedestal_per_sample: Vec<f32>,
    /// Conversion from integrated ADC counts to photo-electrons.
    pub dc_to_pe: Vec<f32>,
}

impl CalibrationCoefficients {
    /// Pedestal of one pixel in one channel.
    pub fn pedestal(&self, channel: usize, pixel: usize) -> f32 {
        self.pedestal_per_sample[channel * self.n_pixels + pixel]
    }

    /// Conversion factor of one pixel in one channel.
    pub fn dc_to_pe(&self, channel: usize, pixel: usize) -> f32 {
        self.dc_to_pe[channel * self.n_pixels + pixel]
    }
}

/// DL1 data of one telescope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dl1Camera {
    /// Calibrated charge per pixel, p.e.
    pub image: Option<Vec<f32>>,
    /// Pulse time per pixel, ns.
    pub peak_time: Option<Vec<f32>>,
    /// Cleaning mask.
    pub image_mask: Option<Vec<bool>>,
    /// Image parameters.
    pub parameters: Option<ImageParameters>,
}

/// Everything known about one telescope in one event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TelescopeEvent {
    /// Raw waveform (R0/R1).
    pub raw: Option<Waveform>,
    /// Calibration coefficients for this telescope.
    pub calibration: Option<Arc<CalibrationCoefficients>>,
    /// Gain channel chosen per pixel by the calibrator.
    pub selected_gain_channel: Option<Vec<u8>>,
    /// DL1 data.
    pub dl1: Dl1Camera,
}

/// Reconstructed quantities of one event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dl2 {
    /// Direction and core.
    pub geometry: Option<ReconstructedGeometry>,
    /// Energy.
    pub energy: Option<ReconstructedEnergy>,
    /// Particle type.
    pub classification: Option<ParticleClassification>,
}

/// Field groups of an [`ArrayEvent`], used to declare what a stage reads
/// and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataField {
    /// Raw waveforms.
    Raw,
    /// Calibrated images and peak times.
    Dl1Image,
    /// Cleaning masks and image parameters.
    Dl1Parameters,
    /// Reconstructed direction.
    Dl2Geometry,
    /// Reconstructed energy.
    Dl2Energy,
    /// Particle classification.
    Dl2Classification,
}

impl DataField {
    /// All field groups in pipeline order.
    pub const ALL: [DataField; 6] = [
        DataField::Raw,
        DataField::Dl1Image,
        DataField::Dl1Parameters,
        DataField::Dl2Geometry,
        DataField::Dl2Energy,
        DataField::Dl2Classification,
    ];

    /// Name used in logs and configuration.
    pub fn name(self) -> &'static str {
        match self {
            DataField::Raw => "raw",
            DataField::Dl1Image => "dl1.image",
            DataField::Dl1Parameters => "dl1.parameters",
            DataField::Dl2Geometry => "dl2.geometry",
            DataField::Dl2Energy => "dl2.energy",
            DataField::Dl2Classification => "dl2.classification",
        }
    }
}

impl fmt::Display for DataField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One array event as it flows through the pipeline.
#[derive(Debug, Clone)]
pub struct ArrayEvent {
    /// Event key.
    pub index: EventIndex,
    /// Position of the event in its source (0-based).
    pub count: u64,
    /// Instrument description shared with every other event of the source.
    pub subarray: Arc<SubarrayDescription>,
    /// Central trigger.
    pub trigger: TriggerInfo,
    /// Pointing.
    pub pointing: PointingInfo,
    /// Simulation truth, if the source is simulated.
    pub simulation: Option<SimulatedShower>,
    /// Per-telescope data, keyed by telescope id.
    pub tel: BTreeMap<TelId, TelescopeEvent>,
    /// Reconstructed quantities.
    pub dl2: Dl2,
    /// Set when the source could not decode this event's payload.
    pub decode_error: Option<RecoverableDecodeError>,
}

impl ArrayEvent {
    /// An event with every field missing.
    pub fn new(index: EventIndex, count: u64, subarray: Arc<SubarrayDescription>) -> Self {
        Self {
            index,
            count,
            subarray,
            trigger: TriggerInfo::default(),
            pointing: PointingInfo::default(),
            simulation: None,
            tel: BTreeMap::new(),
            dl2: Dl2::default(),
            decode_error: None,
        }
    }

    /// Whether a field group holds data for at least one telescope (or for
    /// the event, for DL2 groups).
    pub fn has(&self, field: DataField) -> bool {
        match field {
            DataField::Raw => self.tel.values().any(|t| t.raw.is_some()),
            DataField::Dl1Image => self.tel.values().any(|t| t.dl1.image.is_some()),
            DataField::Dl1Parameters => self.tel.values().any(|t| t.dl1.parameters.is_some()),
            DataField::Dl2Geometry => self.dl2.geometry.is_some(),
            DataField::Dl2Energy => self.dl2.energy.is_some(),
            DataField::Dl2Classification => self.dl2.classification.is_some(),
        }
    }

    /// Reset a field group to missing.
    pub fn clear(&mut self, field: DataField) {
        match field {
            DataField::Raw => self.tel.values_mut().for_each(|t| t.raw = None),
            DataField::Dl1Image => self.tel.values_mut().for_each(|t| {
                t.dl1.image = None;
                t.dl1.peak_time = None;
                t.selected_gain_channel = None;
            }),
            DataField::Dl1Parameters => self.tel.values_mut().for_each(|t| {
                t.dl1.image_mask = None;
                t.dl1.parameters = None;
            }),
            DataField::Dl2Geometry => self.dl2.geometry = None,
            DataField::Dl2Energy => self.dl2.energy = None,
            DataField::Dl2Classification => self.dl2.classification = None,
        }
    }

    /// Telescope ids with data in this event, ascending.
    pub fn tel_ids(&self) -> Vec<TelId> {
        self.tel.keys().copied().collect()
    }
}
