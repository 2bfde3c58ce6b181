//! Block stream encoder.

use std::io::{self, BufWriter, Write};

use cta_core::TelId;

use super::{
    block_type, encode_array_event, AdcSamples, BlockHeader, CameraSettings, CentralTrigger,
    McEvent, McShower, RunHeader, TelescopeCalibration,
};

/// Writes blocks to any byte sink.
#[derive(Debug)]
pub struct BlockStreamWriter<W: Write> {
    inner: BufWriter<W>,
    blocks: u64,
}

impl<W: Write> BlockStreamWriter<W> {
    /// Wrap a sink.
    pub fn new(inner: W) -> Self {
        Self {
            inner: BufWriter::new(inner),
            blocks: 0,
        }
    }

    /// Top-level blocks written so far.
    pub fn blocks_written(&self) -> u64 {
        self.blocks
    }

    /// Write one top-level block with an arbitrary payload.
    pub fn write_block(
        &mut self,
        block_type: u32,
        id: u32,
        has_subobjects: bool,
        payload: &[u8],
    ) -> io::Result<()> {
        let length = u32::try_from(payload.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "block payload too large"))?;
        let header = BlockHeader::new(block_type, id, length, has_subobjects);
        self.inner.write_all(&header.encode_top_level())?;
        self.inner.write_all(payload)?;
        self.blocks += 1;
        Ok(())
    }

    /// Write the run header.
    pub fn write_run_header(&mut self, header: &RunHeader) -> io::Result<()> {
        self.write_block(block_type::RUN_HEADER, header.obs_id, false, &header.encode())
    }

    /// Write the camera settings of one telescope.
    pub fn write_camera_settings(&mut self, settings: &CameraSettings) -> io::Result<()> {
        self.write_block(
            block_type::CAMERA_SETTINGS,
            u32::from(settings.tel_id),
            false,
            &settings.encode(),
        )
    }

    /// Write the calibration of one telescope.
    pub fn write_calibration(&mut self, calibration: &TelescopeCalibration) -> io::Result<()> {
        self.write_block(
            block_type::TEL_CALIBRATION,
            u32::from(calibration.tel_id),
            false,
            &calibration.encode(),
        )
    }

    /// Write a simulated shower.
    pub fn write_mc_shower(&mut self, shower: &McShower) -> io::Result<()> {
        self.write_block(block_type::MC_SHOWER, shower.shower_num, false, &shower.encode())
    }

    /// Write a simulated event record.
    pub fn write_mc_event(&mut self, event: &McEvent) -> io::Result<()> {
        self.write_block(block_type::MC_EVENT, event.event_id, false, &event.encode())
    }

    /// Write an array event.
    pub fn write_array_event(
        &mut self,
        event_id: u32,
        trigger: &CentralTrigger,
        telescopes: &[(TelId, AdcSamples)],
    ) -> io::Result<()> {
        let payload = encode_array_event(trigger, telescopes);
        self.write_block(block_type::ARRAY_EVENT, event_id, true, &payload)
    }

    /// Write the end-of-run marker.
    pub fn write_end_of_run(&mut self, obs_id: u32, n_events: u64) -> io::Result<()> {
        self.write_block(block_type::END_OF_RUN, obs_id, false, &n_events.to_le_bytes())
    }

    /// Flush and return the sink.
    pub fn finish(self) -> io::Result<W> {
        self.inner.into_inner().map_err(|e| e.into_error())
    }
}
