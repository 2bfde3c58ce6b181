//! Toy air-shower simulation producing block streams.
//!
//! Generates on-axis gamma-like showers for a ring of identical telescopes
//! with square cameras. Each shower becomes an elliptical Gaussian image per
//! telescope, oriented along the impact direction, which is then turned into
//! two-gain ADC waveforms using the same calibration coefficients that are
//! written into the stream. Calibrating the waveforms recovers the image
//! charge up to noise.
//!
//! The output is deterministic for a given seed.

use std::collections::BTreeMap;
use std::f64::consts::PI;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use cta_core::containers::EventType;
use cta_core::subarray::{CameraDescription, OpticsDescription, TelescopeDescription};
use cta_core::{SubarrayDescription, TelId};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use crate::eventio::{
    block_type, AdcSamples, BlockStreamWriter, CameraSettings, CentralTrigger, McEvent, McShower,
    RunHeader, TelescopeCalibration,
};

const PIXEL_PITCH: f64 = 0.05;
const FOCAL_LENGTH: f64 = 16.0;
const MIRROR_AREA: f64 = 106.0;
const SAMPLING_RATE: f64 = 1.0;
const ARRAY_RADIUS: f64 = 150.0;
const POINTING_ALT: f64 = 70.0;
const POINTING_AZ: f64 = 0.0;
const RUN_START: f64 = 1.7e9;

const PEDESTAL: f64 = 100.0;
const HIGH_GAIN_DC_TO_PE: f64 = 0.1;
const LOW_GAIN_DC_TO_PE: f64 = 2.0;
const ADC_MAX: f64 = 4095.0;
const PULSE_WIDTH: f64 = 1.5;
const ELECTRONIC_NOISE: f64 = 1.0;
const NSB_NOISE_PE: f64 = 0.8;

const TRIGGER_THRESHOLD_PE: f64 = 60.0;
const MAX_REDRAWS: usize = 100;

/// Parameters of a toy run.
#[derive(Debug, Clone, PartialEq)]
pub struct ToySimulationConfig {
    /// Observation id of the run.
    pub obs_id: u32,
    /// Events to generate.
    pub n_events: u32,
    /// Telescopes in the array.
    pub n_tels: u16,
    /// Random seed.
    pub seed: u64,
    /// Pixels per camera side.
    pub camera_side: usize,
    /// Samples per waveform.
    pub n_samples: u16,
    /// Event positions (0-based) whose array-event payload is replaced by
    /// garbage.
    pub corrupt_events: Vec<u32>,
}

impl Default for ToySimulationConfig {
    fn default() -> Self {
        Self {
            obs_id: 1,
            n_events: 10,
            n_tels: 4,
            seed: 42,
            camera_side: 15,
            n_samples: 20,
            corrupt_events: Vec::new(),
        }
    }
}

struct Shower {
    energy: f64,
    core_x: f64,
    core_y: f64,
    h_first_int: f64,
    x_max: f64,
}

/// Deterministic toy event generator.
#[derive(Debug)]
pub struct ToySimulation {
    config: ToySimulationConfig,
    subarray: SubarrayDescription,
    calibration: BTreeMap<TelId, TelescopeCalibration>,
    rng: StdRng,
}

impl ToySimulation {
    /// Set up the array and its calibration.
    pub fn new(config: ToySimulationConfig) -> Self {
        let mut rng = StdRng::seed_from_u64(config.seed);
        let subarray = Self::build_subarray(config.n_tels, config.camera_side);

        let calibration = subarray
            .tels
            .iter()
            .map(|(&tel_id, tel)| {
                let n_pixels = tel.camera.n_pixels();
                let pedestal = (0..2 * n_pixels)
                    .map(|_| (PEDESTAL + rng.gen_range(-5.0..5.0)) as f32)
                    .collect();
                let dc_to_pe = [HIGH_GAIN_DC_TO_PE, LOW_GAIN_DC_TO_PE]
                    .iter()
                    .flat_map(|&gain| std::iter::repeat(gain).take(n_pixels))
                    .map(|gain| (gain * (1.0 + 0.05 * normal(&mut rng))) as f32)
                    .collect();
                let calib = TelescopeCalibration {
                    tel_id,
                    n_channels: 2,
                    n_pixels: n_pixels as u32,
                    pedestal,
                    dc_to_pe,
                };
                (tel_id, calib)
            })
            .collect();

        Self {
            config,
            subarray,
            calibration,
            rng,
        }
    }

    fn build_subarray(n_tels: u16, camera_side: usize) -> SubarrayDescription {
        let mut camera =
            CameraDescription::square("ToyCam", camera_side, PIXEL_PITCH, SAMPLING_RATE);
        camera.n_channels = 2;
        let description = TelescopeDescription {
            name: "MST_MST_ToyCam".into(),
            optics: OpticsDescription {
                name: "MST".into(),
                equivalent_focal_length: FOCAL_LENGTH,
                mirror_area: MIRROR_AREA,
            },
            camera,
        };

        let mut subarray = SubarrayDescription::new("ToyArray");
        for i in 0..n_tels {
            let position = if n_tels == 1 {
                [0.0, 0.0, 0.0]
            } else {
                let angle = 2.0 * PI * f64::from(i) / f64::from(n_tels);
                [ARRAY_RADIUS * angle.cos(), ARRAY_RADIUS * angle.sin(), 0.0]
            };
            subarray = subarray.with_telescope(i + 1, position, description.clone());
        }
        subarray
    }

    /// Array the simulation generates images for.
    pub fn subarray(&self) -> &SubarrayDescription {
        &self.subarray
    }

    /// Write a complete run and return the number of array events written.
    pub fn write<W: Write>(&mut self, out: &mut BlockStreamWriter<W>) -> io::Result<u64> {
        out.write_run_header(&RunHeader {
            obs_id: self.config.obs_id,
            time: RUN_START,
            pointing_alt: POINTING_ALT,
            pointing_az: POINTING_AZ,
            is_simulation: true,
            tels: self
                .subarray
                .positions
                .iter()
                .map(|(&id, &pos)| (id, pos))
                .collect(),
        })?;

        for (&tel_id, tel) in &self.subarray.tels {
            out.write_camera_settings(&CameraSettings {
                tel_id,
                tel_name: tel.name.clone(),
                optics_name: tel.optics.name.clone(),
                camera_name: tel.camera.name.clone(),
                focal_length: tel.optics.equivalent_focal_length,
                mirror_area: tel.optics.mirror_area,
                sampling_rate: tel.camera.sampling_rate,
                n_channels: tel.camera.n_channels as u16,
                pix_x: tel.camera.pix_x.clone(),
                pix_y: tel.camera.pix_y.clone(),
                pix_area: tel.camera.pix_area.clone(),
            })?;
        }
        for calibration in self.calibration.values() {
            out.write_calibration(calibration)?;
        }

        for position in 0..self.config.n_events {
            let event_id = position + 1;
            let (shower, telescopes) = self.draw_triggered_shower();

            out.write_mc_shower(&McShower {
                shower_num: event_id,
                primary_id: 0,
                energy: shower.energy,
                alt: POINTING_ALT,
                az: POINTING_AZ,
                h_first_int: shower.h_first_int,
                x_max: shower.x_max,
            })?;
            out.write_mc_event(&McEvent {
                event_id,
                shower_num: event_id,
                core_x: shower.core_x,
                core_y: shower.core_y,
            })?;

            if self.config.corrupt_events.contains(&position) {
                debug!(event_id, "Writing corrupt array event");
                out.write_block(block_type::ARRAY_EVENT, event_id, true, &[0xFF; 11])?;
                continue;
            }

            let trigger = CentralTrigger {
                time: RUN_START + f64::from(position) * 0.01,
                event_type: EventType::Subarray,
                tels: telescopes.iter().map(|(id, _)| *id).collect(),
            };
            let samples: Vec<(TelId, AdcSamples)> = telescopes
                .iter()
                .map(|(tel_id, image)| (*tel_id, self.digitize(*tel_id, image)))
                .collect();
            out.write_array_event(event_id, &trigger, &samples)?;
        }

        out.write_end_of_run(self.config.obs_id, u64::from(self.config.n_events))?;
        info!(
            obs_id = self.config.obs_id,
            n_events = self.config.n_events,
            n_tels = self.config.n_tels,
            "Toy run generated"
        );
        Ok(u64::from(self.config.n_events))
    }

    /// Write a complete run to a file.
    pub fn write_file(&mut self, path: &Path) -> io::Result<u64> {
        let mut writer = BlockStreamWriter::new(File::create(path)?);
        let n = self.write(&mut writer)?;
        writer.finish()?.sync_all()?;
        Ok(n)
    }

    /// Draw showers until at least two telescopes trigger (or give up and
    /// keep the last draw). Returns the shower and per-telescope images.
    fn draw_triggered_shower(&mut self) -> (Shower, Vec<(TelId, Vec<f64>)>) {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let log_e = self.rng.gen_range(-1.3..1.7);
            let shower = Shower {
                energy: 10f64.powf(log_e),
                core_x: self.rng.gen_range(-250.0..250.0),
                core_y: self.rng.gen_range(-250.0..250.0),
                h_first_int: 25_000.0 + 5_000.0 * normal(&mut self.rng),
                x_max: 300.0 + 60.0 * (log_e + 1.3) + 20.0 * normal(&mut self.rng),
            };

            let tel_ids: Vec<TelId> = self.subarray.tel_ids();
            let mut triggered = Vec::new();
            for tel_id in tel_ids {
                let image = self.image(tel_id, &shower);
                if image.iter().sum::<f64>() > TRIGGER_THRESHOLD_PE {
                    triggered.push((tel_id, image));
                }
            }
            if triggered.len() >= 2 || attempt >= MAX_REDRAWS {
                return (shower, triggered);
            }
        }
    }

    /// Noisy charge image in p.e.
    fn image(&mut self, tel_id: TelId, shower: &Shower) -> Vec<f64> {
        let (Some(tel), Some(pos)) = (
            self.subarray.tel(tel_id),
            self.subarray.positions.get(&tel_id),
        ) else {
            return Vec::new();
        };
        let camera = &tel.camera;

        let dx = shower.core_x - pos[0];
        let dy = shower.core_y - pos[1];
        let impact = dx.hypot(dy);
        let (ux, uy) = if impact > 1.0 {
            (dx / impact, dy / impact)
        } else {
            (1.0, 0.0)
        };

        let log_e = (shower.energy / 0.05).log10().max(0.0);
        let cog = 0.02 + 0.3 * impact / (impact + 200.0);
        let (cx, cy) = (cog * ux, cog * uy);
        let length = 0.03 + 0.015 * log_e;
        let width = 0.012 + 0.004 * log_e;
        let size = 800.0 * shower.energy * (-impact / 250.0).exp();
        let norm = size / (2.0 * PI * length * width);

        (0..camera.n_pixels())
            .map(|pix| {
                let px = camera.pix_x[pix] - cx;
                let py = camera.pix_y[pix] - cy;
                let along = px * ux + py * uy;
                let across = -px * uy + py * ux;
                let density =
                    norm * (-0.5 * ((along / length).powi(2) + (across / width).powi(2))).exp();
                let mean = density * camera.pix_area[pix];
                mean + mean.sqrt() * normal(&mut self.rng) + NSB_NOISE_PE * normal(&mut self.rng)
            })
            .collect()
    }

    /// Turn an image into two-gain waveforms.
    fn digitize(&mut self, tel_id: TelId, image: &[f64]) -> AdcSamples {
        let n_pixels = image.len();
        let n_samples = usize::from(self.config.n_samples);
        let peak = (n_samples as f64 / 2.0 - 2.0).max(1.0);
        let shape: Vec<f64> = {
            let raw: Vec<f64> = (0..n_samples)
                .map(|s| (-0.5 * ((s as f64 - peak) / PULSE_WIDTH).powi(2)).exp())
                .collect();
            let total: f64 = raw.iter().sum();
            raw.into_iter().map(|v| v / total).collect()
        };

        let mut samples = Vec::with_capacity(2 * n_pixels * n_samples);
        if let Some(calib) = self.calibration.get(&tel_id) {
            for channel in 0..2 {
                for (pix, charge) in image.iter().enumerate() {
                    let idx = channel * n_pixels + pix;
                    let pedestal = f64::from(calib.pedestal[idx]);
                    let counts = charge / f64::from(calib.dc_to_pe[idx]);
                    for weight in &shape {
                        let value = pedestal
                            + counts * weight
                            + ELECTRONIC_NOISE * normal(&mut self.rng);
                        samples.push(value.round().clamp(0.0, ADC_MAX) as u16);
                    }
                }
            }
        }

        AdcSamples {
            n_channels: 2,
            n_pixels: n_pixels as u32,
            n_samples: self.config.n_samples,
            samples,
        }
    }
}

/// Truncate a file by `bytes`, simulating an interrupted transfer.
pub fn truncate_file(path: &Path, bytes: u64) -> io::Result<()> {
    let file = OpenOptions::new().write(true).open(path)?;
    let len = file.metadata()?.len();
    file.set_len(len.saturating_sub(bytes))
}

fn normal(rng: &mut StdRng) -> f64 {
    let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
    let u2: f64 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
}
