//! Event source over the block-structured simulation stream.
//!
//! Open reads the run header, every camera-settings and calibration block,
//! and stops at the first header of anything else, which is kept for the
//! first `next_event` call. From then on each call reads blocks until one
//! array event is complete; simulated shower and event blocks preceding it
//! are attached as truth.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cta_core::containers::{
    CalibrationCoefficients, PointingInfo, TelescopeEvent, TriggerInfo, Waveform,
};
use cta_core::subarray::{CameraDescription, OpticsDescription, TelescopeDescription};
use cta_core::{
    ArrayEvent, DataField, EventIndex, RecoverableDecodeError, SourceError, SubarrayDescription,
    TelId,
};
use tracing::{debug, warn};

use super::{EventSource, EventSourceFactory, SourceConfig};
use crate::eventio::{
    block_type, decode_array_event, ArrayEventPayload, BlockHeader, CameraSettings, DecodeError,
    McEvent, McShower, RunHeader, TelescopeCalibration, SYNC_MARKER,
};

const DATALEVELS: &[DataField] = &[DataField::Raw];

/// Factory for [`BlockStreamSource`].
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockStreamFactory;

impl EventSourceFactory for BlockStreamFactory {
    fn name(&self) -> &'static str {
        "block_stream"
    }

    fn description(&self) -> &'static str {
        "Block-structured simulation stream (run header, camera settings, array events)"
    }

    fn probe(&self, path: &Path) -> bool {
        let Ok(mut file) = File::open(path) else {
            return false;
        };
        let mut marker = [0u8; 4];
        file.read_exact(&mut marker).is_ok() && u32::from_le_bytes(marker) == SYNC_MARKER
    }

    fn open(
        &self,
        path: &Path,
        config: &SourceConfig,
    ) -> Result<Box<dyn EventSource>, SourceError> {
        Ok(Box::new(BlockStreamSource::open(path, config)?))
    }
}

/// Forward-only reader of one simulation run.
#[derive(Debug)]
pub struct BlockStreamSource {
    path: PathBuf,
    reader: BufReader<File>,
    subarray: Arc<SubarrayDescription>,
    obs_ids: Vec<u64>,
    is_simulation: bool,
    pointing: PointingInfo,
    calibration: BTreeMap<TelId, Arc<CalibrationCoefficients>>,
    allowed_tels: Option<BTreeSet<TelId>>,
    max_events: Option<u64>,
    pending: Option<BlockHeader>,
    shower: Option<McShower>,
    mc_event: Option<McEvent>,
    events_read: u64,
    exhausted: bool,
}

impl BlockStreamSource {
    /// Open `path` and decode the run setup.
    pub fn open(path: &Path, config: &SourceConfig) -> Result<Self, SourceError> {
        let open_error = |message: String| SourceError::Open {
            path: path.to_path_buf(),
            message,
        };
        let file = File::open(path).map_err(|source| SourceError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut reader = BufReader::new(file);

        let first = BlockHeader::read_top_level(&mut reader)
            .map_err(|e| open_error(e.to_string()))?
            .ok_or_else(|| open_error("empty stream".into()))?;
        if first.block_type != block_type::RUN_HEADER {
            return Err(open_error(format!(
                "stream starts with block type {}, expected run header {}",
                first.block_type,
                block_type::RUN_HEADER
            )));
        }
        let payload = read_exact_payload(&mut reader, first.length)
            .map_err(|e| open_error(e.to_string()))?;
        let run = RunHeader::decode(first.id, &payload).map_err(|e| open_error(e.to_string()))?;

        let mut cameras: BTreeMap<TelId, CameraSettings> = BTreeMap::new();
        let mut calibrations: BTreeMap<TelId, TelescopeCalibration> = BTreeMap::new();
        let pending = loop {
            let Some(header) =
                BlockHeader::read_top_level(&mut reader).map_err(|e| open_error(e.to_string()))?
            else {
                break None;
            };
            match header.block_type {
                block_type::CAMERA_SETTINGS => {
                    let payload = read_exact_payload(&mut reader, header.length)
                        .map_err(|e| open_error(e.to_string()))?;
                    let settings = CameraSettings::decode(header.id, &payload)
                        .map_err(|e| open_error(format!("camera settings: {e}")))?;
                    cameras.insert(settings.tel_id, settings);
                }
                block_type::TEL_CALIBRATION => {
                    let payload = read_exact_payload(&mut reader, header.length)
                        .map_err(|e| open_error(e.to_string()))?;
                    let calibration = TelescopeCalibration::decode(header.id, &payload)
                        .map_err(|e| open_error(format!("calibration: {e}")))?;
                    calibrations.insert(calibration.tel_id, calibration);
                }
                _ => break Some(header),
            }
        };

        let full = build_subarray(&run, &cameras).map_err(open_error)?;
        let subarray = config.restrict(full);

        let mut calibration = BTreeMap::new();
        for (tel_id, calib) in calibrations {
            let Some(tel) = subarray.tel(tel_id) else {
                continue;
            };
            let n_pixels = calib.n_pixels as usize;
            if n_pixels != tel.camera.n_pixels() {
                return Err(open_error(format!(
                    "calibration of telescope {tel_id} has {n_pixels} pixels, camera has {}",
                    tel.camera.n_pixels()
                )));
            }
            calibration.insert(
                tel_id,
                Arc::new(CalibrationCoefficients {
                    n_channels: usize::from(calib.n_channels),
                    n_pixels,
                    pedestal_per_sample: calib.pedestal,
                    dc_to_pe: calib.dc_to_pe,
                }),
            );
        }

        debug!(
            path = %path.display(),
            obs_id = run.obs_id,
            n_tels = subarray.n_tels(),
            "Block stream opened"
        );

        Ok(Self {
            path: path.to_path_buf(),
            reader,
            obs_ids: vec![u64::from(run.obs_id)],
            is_simulation: run.is_simulation,
            pointing: PointingInfo {
                array_altitude: Some(run.pointing_alt),
                array_azimuth: Some(run.pointing_az),
            },
            subarray: Arc::new(subarray),
            calibration,
            allowed_tels: config.allowed_set(),
            max_events: config.max_events,
            pending,
            shower: None,
            mc_event: None,
            events_read: 0,
            exhausted: false,
        })
    }

    fn stream_error(&self, message: impl Into<String>) -> SourceError {
        SourceError::Stream {
            path: self.path.clone(),
            message: message.into(),
        }
    }

    fn keeps(&self, tel_id: TelId) -> bool {
        self.allowed_tels
            .as_ref()
            .map_or(true, |allowed| allowed.contains(&tel_id))
    }

    /// Read a payload, tolerating a short read at the end of the stream.
    /// Returns the bytes and whether they are complete.
    fn read_payload(&mut self, length: u32) -> Result<(Vec<u8>, bool), SourceError> {
        let mut buf = Vec::new();
        let read = (&mut self.reader).take(u64::from(length)).read_to_end(&mut buf);
        let n = read.map_err(|e| self.stream_error(e.to_string()))?;
        Ok((buf, n == length as usize))
    }

    fn next_header(&mut self) -> Result<Option<BlockHeader>, SourceError> {
        if let Some(header) = self.pending.take() {
            return Ok(Some(header));
        }
        match BlockHeader::read_top_level(&mut self.reader) {
            Ok(header) => Ok(header),
            Err(DecodeError::Truncated { available, .. }) => {
                warn!(
                    path = %self.path.display(),
                    bytes = available,
                    "Stream ends inside a block header"
                );
                Ok(None)
            }
            Err(e) => Err(self.stream_error(e.to_string())),
        }
    }

    fn build_event(&mut self, header: BlockHeader, payload: &[u8], complete: bool) -> ArrayEvent {
        let index = EventIndex::new(self.obs_ids[0], u64::from(header.id));
        let mut event = ArrayEvent::new(index, self.events_read, Arc::clone(&self.subarray));
        event.pointing = self.pointing.clone();

        if self.is_simulation {
            if let (Some(mc), Some(shower)) = (&self.mc_event, &self.shower) {
                if mc.event_id == header.id && mc.shower_num == shower.shower_num {
                    event.simulation = Some(mc.truth(shower));
                }
            }
        }
        self.mc_event = None;

        let decoded = if complete {
            decode_array_event(payload, |tel_id| self.keeps(tel_id)).map_err(|e| e.to_string())
        } else {
            Err(format!(
                "array event truncated: {} of {} bytes",
                payload.len(),
                header.length
            ))
        };
        let result = decoded.and_then(|payload| self.fill_telescopes(&mut event, payload));

        if let Err(message) = result {
            warn!(
                obs_id = index.obs_id,
                event_id = index.event_id,
                stage = "source",
                "Recoverable decode error: {message}"
            );
            event.tel.clear();
            event.decode_error = Some(RecoverableDecodeError::new(Some(index), message));
        }
        event
    }

    fn fill_telescopes(
        &self,
        event: &mut ArrayEvent,
        payload: ArrayEventPayload,
    ) -> Result<(), String> {
        event.trigger = TriggerInfo {
            time: Some(payload.trigger.time),
            event_type: payload.trigger.event_type,
            tels_with_trigger: payload
                .trigger
                .tels
                .iter()
                .copied()
                .filter(|id| self.keeps(*id))
                .collect(),
        };

        for (tel_id, adc) in payload.telescopes {
            let camera = self
                .subarray
                .tel(tel_id)
                .map(|t| &t.camera)
                .ok_or_else(|| format!("telescope {tel_id} is not part of the subarray"))?;
            if adc.n_pixels as usize != camera.n_pixels() {
                return Err(format!(
                    "telescope {tel_id} sent {} pixels, camera has {}",
                    adc.n_pixels,
                    camera.n_pixels()
                ));
            }
            let n_channels = usize::from(adc.n_channels);
            if n_channels == 0 || n_channels > camera.n_channels {
                return Err(format!(
                    "telescope {tel_id} sent {n_channels} gain channels, camera has {}",
                    camera.n_channels
                ));
            }
            let waveform = Waveform::new(
                usize::from(adc.n_channels),
                adc.n_pixels as usize,
                usize::from(adc.n_samples),
                adc.samples,
            )?;
            event.tel.insert(
                tel_id,
                TelescopeEvent {
                    raw: Some(waveform),
                    calibration: self.calibration.get(&tel_id).cloned(),
                    ..Default::default()
                },
            );
        }
        Ok(())
    }
}

impl EventSource for BlockStreamSource {
    fn name(&self) -> &'static str {
        "block_stream"
    }

    fn input_path(&self) -> &Path {
        &self.path
    }

    fn subarray(&self) -> &Arc<SubarrayDescription> {
        &self.subarray
    }

    fn obs_ids(&self) -> &[u64] {
        &self.obs_ids
    }

    fn is_simulation(&self) -> bool {
        self.is_simulation
    }

    fn datalevels(&self) -> &[DataField] {
        DATALEVELS
    }

    fn max_events(&self) -> Option<u64> {
        self.max_events
    }

    fn allowed_tels(&self) -> Option<&BTreeSet<TelId>> {
        self.allowed_tels.as_ref()
    }

    fn n_events_hint(&self) -> Option<u64> {
        self.max_events
    }

    fn events_read(&self) -> u64 {
        self.events_read
    }

    fn next_event(&mut self) -> Result<Option<ArrayEvent>, SourceError> {
        if self.exhausted || self.max_events.is_some_and(|max| self.events_read >= max) {
            return Ok(None);
        }

        loop {
            let Some(header) = self.next_header()? else {
                self.exhausted = true;
                return Ok(None);
            };
            let (payload, complete) = self.read_payload(header.length)?;
            if !complete {
                self.exhausted = true;
            }

            match header.block_type {
                block_type::ARRAY_EVENT => {
                    let event = self.build_event(header, &payload, complete);
                    self.events_read += 1;
                    return Ok(Some(event));
                }
                block_type::MC_SHOWER if complete => match McShower::decode(header.id, &payload) {
                    Ok(shower) => self.shower = Some(shower),
                    Err(e) => {
                        warn!(shower = header.id, "Cannot decode simulated shower: {e}");
                        self.shower = None;
                    }
                },
                block_type::MC_EVENT if complete => match McEvent::decode(header.id, &payload) {
                    Ok(mc) => self.mc_event = Some(mc),
                    Err(e) => {
                        warn!(event_id = header.id, "Cannot decode simulated event: {e}");
                        self.mc_event = None;
                    }
                },
                block_type::END_OF_RUN => {
                    debug!(obs_id = header.id, events = self.events_read, "End of run");
                    self.exhausted = true;
                    return Ok(None);
                }
                other => debug!(block_type = other, length = header.length, "Skipping block"),
            }

            if self.exhausted {
                warn!(path = %self.path.display(), "Stream truncated");
                return Ok(None);
            }
        }
    }
}

fn read_exact_payload(reader: &mut impl Read, length: u32) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    let n = reader.take(u64::from(length)).read_to_end(&mut buf)?;
    if n != length as usize {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("block payload truncated: {n} of {length} bytes"),
        ));
    }
    Ok(buf)
}

fn build_subarray(
    run: &RunHeader,
    cameras: &BTreeMap<TelId, CameraSettings>,
) -> Result<SubarrayDescription, String> {
    let mut subarray = SubarrayDescription::new(format!("obs{}", run.obs_id));
    for &(tel_id, position) in &run.tels {
        let settings = cameras
            .get(&tel_id)
            .ok_or_else(|| format!("telescope {tel_id} has no camera settings"))?;
        let n_pixels = settings.pix_x.len();
        if settings.pix_y.len() != n_pixels || settings.pix_area.len() != n_pixels {
            return Err(format!("camera settings of telescope {tel_id} are inconsistent"));
        }
        let description = TelescopeDescription {
            name: settings.tel_name.clone(),
            optics: OpticsDescription {
                name: settings.optics_name.clone(),
                equivalent_focal_length: settings.focal_length,
                mirror_area: settings.mirror_area,
            },
            camera: CameraDescription {
                name: settings.camera_name.clone(),
                pix_x: settings.pix_x.clone(),
                pix_y: settings.pix_y.clone(),
                pix_area: settings.pix_area.clone(),
                sampling_rate: settings.sampling_rate,
                n_channels: usize::from(settings.n_channels),
            },
        };
        subarray = subarray.with_telescope(tel_id, position, description);
    }
    Ok(subarray)
}
