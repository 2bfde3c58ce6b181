//! Block-structured simulation stream codec.
//!
//! The stream is a sequence of typed blocks, all little endian:
//!
//! ```text
//! top-level block
//! ┌────────────┬──────────────────────┬──────────┬────────────────────────────────┬─────────┐
//! │ 0xD41F8A37 │ type | version << 20 │    id    │ length | has_subobjects << 30  │ payload │
//! │    u32     │         u32          │   u32    │              u32               │ length  │
//! └────────────┴──────────────────────┴──────────┴────────────────────────────────┴─────────┘
//! sub-block: the same without the sync marker
//! ```
//!
//! Block types used:
//!
//! | type | id         | content |
//! |------|------------|---------|
//! | 2000 | obs_id     | run header: time, pointing, telescope positions |
//! | 2002 | tel_id     | camera settings: names, optics, pixel geometry |
//! | 2005 | tel_id     | calibration: pedestal and dc-to-pe per channel and pixel |
//! | 2020 | shower_num | simulated shower |
//! | 2021 | event_id   | simulated event: shower reference and core position |
//! | 2010 | event_id   | array event; sub-blocks 2009 (central trigger) and 2012 (telescope event, holding 2015 ADC samples) |
//! | 2100 | obs_id     | end of run |
//!
//! Decoding is keyed on the block type; unknown top-level blocks are skipped
//! by their length.

mod writer;

pub use writer::BlockStreamWriter;

use std::io::{self, Read};

use cta_core::containers::{EventType, SimulatedShower};
use cta_core::TelId;
use thiserror::Error;

/// Sync marker preceding every top-level block.
pub const SYNC_MARKER: u32 = 0xD41F_8A37;

/// Block type codes.
pub mod block_type {
    /// Run header.
    pub const RUN_HEADER: u32 = 2000;
    /// Camera settings of one telescope.
    pub const CAMERA_SETTINGS: u32 = 2002;
    /// Calibration coefficients of one telescope.
    pub const TEL_CALIBRATION: u32 = 2005;
    /// Central trigger (sub-block of an array event).
    pub const CENTRAL_TRIGGER: u32 = 2009;
    /// Array event.
    pub const ARRAY_EVENT: u32 = 2010;
    /// Telescope event (sub-block of an array event).
    pub const TEL_EVENT: u32 = 2012;
    /// ADC samples (sub-block of a telescope event).
    pub const ADC_SAMPLES: u32 = 2015;
    /// Simulated shower.
    pub const MC_SHOWER: u32 = 2020;
    /// Simulated event.
    pub const MC_EVENT: u32 = 2021;
    /// End of run.
    pub const END_OF_RUN: u32 = 2100;
}

const LENGTH_MASK: u32 = 0x3FFF_FFFF;
const SUBOBJECT_FLAG: u32 = 1 << 30;
const TYPE_MASK: u32 = 0xF_FFFF;

/// Errors while decoding blocks.
#[derive(Error, Debug)]
pub enum DecodeError {
    /// Underlying read failed.
    #[error("read failed: {0}")]
    Io(#[from] io::Error),

    /// A top-level block did not start with the sync marker.
    #[error("bad sync marker 0x{0:08X}")]
    BadMarker(u32),

    /// A payload or sub-block ended early.
    #[error("truncated data: needed {needed} bytes, {available} available")]
    Truncated {
        /// Bytes requested.
        needed: usize,
        /// Bytes left.
        available: usize,
    },

    /// Structurally valid bytes with inconsistent content.
    #[error("invalid content: {0}")]
    Invalid(String),
}

/// Header of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    /// Block type code.
    pub block_type: u32,
    /// Block version.
    pub version: u32,
    /// Block id (meaning depends on the type).
    pub id: u32,
    /// Payload length in bytes.
    pub length: u32,
    /// Whether the payload consists of sub-blocks.
    pub has_subobjects: bool,
}

impl BlockHeader {
    /// Header for a new block.
    pub fn new(block_type: u32, id: u32, length: u32, has_subobjects: bool) -> Self {
        Self {
            block_type,
            version: 0,
            id,
            length,
            has_subobjects,
        }
    }

    fn unpack(type_version: u32, id: u32, length_flags: u32) -> Self {
        Self {
            block_type: type_version & TYPE_MASK,
            version: type_version >> 20,
            id,
            length: length_flags & LENGTH_MASK,
            has_subobjects: length_flags & SUBOBJECT_FLAG != 0,
        }
    }

    fn pack(&self, out: &mut ByteWriter) {
        out.put_u32((self.block_type & TYPE_MASK) | (self.version << 20));
        out.put_u32(self.id);
        let flag = if self.has_subobjects { SUBOBJECT_FLAG } else { 0 };
        out.put_u32((self.length & LENGTH_MASK) | flag);
    }

    /// Read a top-level header. Returns `Ok(None)` on a clean end of stream.
    pub fn read_top_level<R: Read>(reader: &mut R) -> Result<Option<Self>, DecodeError> {
        let mut raw = [0u8; 16];
        let mut filled = 0;
        while filled < raw.len() {
            let n = reader.read(&mut raw[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            return Ok(None);
        }
        if filled < raw.len() {
            return Err(DecodeError::Truncated {
                needed: raw.len(),
                available: filled,
            });
        }
        let word = |i: usize| u32::from_le_bytes([raw[i], raw[i + 1], raw[i + 2], raw[i + 3]]);
        if word(0) != SYNC_MARKER {
            return Err(DecodeError::BadMarker(word(0)));
        }
        Ok(Some(Self::unpack(word(4), word(8), word(12))))
    }

    /// Encode as a top-level header (with sync marker).
    pub fn encode_top_level(&self) -> Vec<u8> {
        let mut out = ByteWriter::new();
        out.put_u32(SYNC_MARKER);
        self.pack(&mut out);
        out.into_inner()
    }
}

/// Cursor over an in-memory payload.
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    /// Read from the start of `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Consume `n` bytes.
    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if n > self.remaining() {
            return Err(DecodeError::Truncated {
                needed: n,
                available: self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    /// Read a `u8`.
    pub fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.array::<1>()?[0])
    }

    /// Read a `u16`.
    pub fn u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    /// Read a `u32`.
    pub fn u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    /// Read an `i32`.
    pub fn i32(&mut self) -> Result<i32, DecodeError> {
        Ok(i32::from_le_bytes(self.array()?))
    }

    /// Read a `u64`.
    pub fn u64(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    /// Read an `f32`.
    pub fn f32(&mut self) -> Result<f32, DecodeError> {
        Ok(f32::from_le_bytes(self.array()?))
    }

    /// Read an `f64`.
    pub fn f64(&mut self) -> Result<f64, DecodeError> {
        Ok(f64::from_le_bytes(self.array()?))
    }

    /// Read a `u16`-length-prefixed UTF-8 string.
    pub fn string(&mut self) -> Result<String, DecodeError> {
        let len = usize::from(self.u16()?);
        let bytes = self.bytes(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|e| DecodeError::Invalid(e.to_string()))
    }

    /// Read `n` values with `item`, checking the length up front.
    pub fn vec<T>(
        &mut self,
        n: usize,
        size: usize,
        mut item: impl FnMut(&mut Self) -> Result<T, DecodeError>,
    ) -> Result<Vec<T>, DecodeError> {
        let needed = n.saturating_mul(size);
        if needed > self.remaining() {
            return Err(DecodeError::Truncated {
                needed,
                available: self.remaining(),
            });
        }
        (0..n).map(|_| item(self)).collect()
    }

    /// Read a sub-block header and return it with a cursor over its payload.
    pub fn sub_block(&mut self) -> Result<(BlockHeader, ByteReader<'a>), DecodeError> {
        let type_version = self.u32()?;
        let id = self.u32()?;
        let length_flags = self.u32()?;
        let header = BlockHeader::unpack(type_version, id, length_flags);
        let payload = self.bytes(header.length as usize)?;
        Ok((header, ByteReader::new(payload)))
    }
}

/// Little-endian payload builder.
#[derive(Debug, Default)]
pub struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    /// Empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes written.
    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    /// Append a `u8`.
    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    /// Append a `u16`.
    pub fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Append a `u32`.
    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Append an `i32`.
    pub fn put_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Append a `u64`.
    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Append an `f32`.
    pub fn put_f32(&mut self, v: f32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Append an `f64`.
    pub fn put_f64(&mut self, v: f64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Append a `u16`-length-prefixed string, truncated to at most 65535
    /// bytes on a character boundary.
    pub fn put_string(&mut self, s: &str) {
        let max = usize::from(u16::MAX);
        let end = if s.len() <= max {
            s.len()
        } else {
            s.char_indices()
                .map(|(i, c)| i + c.len_utf8())
                .take_while(|&end| end <= max)
                .last()
                .unwrap_or(0)
        };
        let bytes = &s.as_bytes()[..end];
        self.put_u16(bytes.len() as u16);
        self.buf.extend_from_slice(bytes);
    }

    /// Append a sub-block.
    pub fn put_sub_block(
        &mut self,
        block_type: u32,
        id: u32,
        has_subobjects: bool,
        payload: &[u8],
    ) {
        BlockHeader::new(block_type, id, payload.len() as u32, has_subobjects).pack(self);
        self.buf.extend_from_slice(payload);
    }
}

// =============================================================================
// Payloads
// =============================================================================

/// Run header (type 2000).
#[derive(Debug, Clone, PartialEq)]
pub struct RunHeader {
    /// Observation id (block id).
    pub obs_id: u32,
    /// Run start, Unix seconds.
    pub time: f64,
    /// Pointing altitude, deg.
    pub pointing_alt: f64,
    /// Pointing azimuth, deg.
    pub pointing_az: f64,
    /// Whether events carry simulation truth.
    pub is_simulation: bool,
    /// Telescope ids and ground positions.
    pub tels: Vec<(TelId, [f64; 3])>,
}

impl RunHeader {
    /// Encode the payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = ByteWriter::new();
        out.put_f64(self.time);
        out.put_f64(self.pointing_alt);
        out.put_f64(self.pointing_az);
        out.put_u8(u8::from(self.is_simulation));
        out.put_u32(self.tels.len() as u32);
        for (id, pos) in &self.tels {
            out.put_u16(*id);
            pos.iter().for_each(|p| out.put_f64(*p));
        }
        out.into_inner()
    }

    /// Decode the payload of block `id`.
    pub fn decode(id: u32, payload: &[u8]) -> Result<Self, DecodeError> {
        let mut r = ByteReader::new(payload);
        let time = r.f64()?;
        let pointing_alt = r.f64()?;
        let pointing_az = r.f64()?;
        let is_simulation = r.u8()? != 0;
        let n = r.u32()? as usize;
        let tels = r.vec(n, 26, |r| Ok((r.u16()?, [r.f64()?, r.f64()?, r.f64()?])))?;
        Ok(Self {
            obs_id: id,
            time,
            pointing_alt,
            pointing_az,
            is_simulation,
            tels,
        })
    }
}

/// Camera settings of one telescope (type 2002).
#[derive(Debug, Clone, PartialEq)]
pub struct CameraSettings {
    /// Telescope id (block id).
    pub tel_id: TelId,
    /// Telescope type name.
    pub tel_name: String,
    /// Optics name.
    pub optics_name: String,
    /// Camera name.
    pub camera_name: String,
    /// Equivalent focal length, m.
    pub focal_length: f64,
    /// Mirror area, m².
    pub mirror_area: f64,
    /// Sampling rate, GHz.
    pub sampling_rate: f64,
    /// Gain channels.
    pub n_channels: u16,
    /// Pixel x, m.
    pub pix_x: Vec<f64>,
    /// Pixel y, m.
    pub pix_y: Vec<f64>,
    /// Pixel area, m².
    pub pix_area: Vec<f64>,
}

impl CameraSettings {
    /// Encode the payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = ByteWriter::new();
        out.put_string(&self.tel_name);
        out.put_string(&self.optics_name);
        out.put_string(&self.camera_name);
        out.put_f64(self.focal_length);
        out.put_f64(self.mirror_area);
        out.put_f64(self.sampling_rate);
        out.put_u16(self.n_channels);
        out.put_u32(self.pix_x.len() as u32);
        for i in 0..self.pix_x.len() {
            out.put_f64(self.pix_x[i]);
            out.put_f64(self.pix_y.get(i).copied().unwrap_or(0.0));
            out.put_f64(self.pix_area.get(i).copied().unwrap_or(0.0));
        }
        out.into_inner()
    }

    /// Decode the payload of block `id`.
    pub fn decode(id: u32, payload: &[u8]) -> Result<Self, DecodeError> {
        let tel_id = TelId::try_from(id)
            .map_err(|_| DecodeError::Invalid(format!("telescope id {id} out of range")))?;
        let mut r = ByteReader::new(payload);
        let tel_name = r.string()?;
        let optics_name = r.string()?;
        let camera_name = r.string()?;
        let focal_length = r.f64()?;
        let mirror_area = r.f64()?;
        let sampling_rate = r.f64()?;
        let n_channels = r.u16()?;
        let n = r.u32()? as usize;
        let pixels = r.vec(n, 24, |r| Ok((r.f64()?, r.f64()?, r.f64()?)))?;
        Ok(Self {
            tel_id,
            tel_name,
            optics_name,
            camera_name,
            focal_length,
            mirror_area,
            sampling_rate,
            n_channels,
            pix_x: pixels.iter().map(|p| p.0).collect(),
            pix_y: pixels.iter().map(|p| p.1).collect(),
            pix_area: pixels.iter().map(|p| p.2).collect(),
        })
    }
}

/// Calibration coefficients of one telescope (type 2005).
#[derive(Debug, Clone, PartialEq)]
pub struct TelescopeCalibration {
    /// Telescope id (block id).
    pub tel_id: TelId,
    /// Gain channels.
    pub n_channels: u16,
    /// Pixels.
    pub n_pixels: u32,
    /// Pedestal per sample, `[channel][pixel]`.
    pub pedestal: Vec<f32>,
    /// dc-to-pe factor, `[channel][pixel]`.
    pub dc_to_pe: Vec<f32>,
}

impl TelescopeCalibration {
    /// Encode the payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = ByteWriter::new();
        out.put_u16(self.n_channels);
        out.put_u32(self.n_pixels);
        self.pedestal.iter().for_each(|v| out.put_f32(*v));
        self.dc_to_pe.iter().for_each(|v| out.put_f32(*v));
        out.into_inner()
    }

    /// Decode the payload of block `id`.
    pub fn decode(id: u32, payload: &[u8]) -> Result<Self, DecodeError> {
        let tel_id = TelId::try_from(id)
            .map_err(|_| DecodeError::Invalid(format!("telescope id {id} out of range")))?;
        let mut r = ByteReader::new(payload);
        let n_channels = r.u16()?;
        let n_pixels = r.u32()?;
        let n = usize::from(n_channels) * n_pixels as usize;
        let pedestal = r.vec(n, 4, ByteReader::f32)?;
        let dc_to_pe = r.vec(n, 4, ByteReader::f32)?;
        Ok(Self {
            tel_id,
            n_channels,
            n_pixels,
            pedestal,
            dc_to_pe,
        })
    }
}

/// Simulated shower (type 2020).
#[derive(Debug, Clone, PartialEq)]
pub struct McShower {
    /// Shower number (block id).
    pub shower_num: u32,
    /// Primary id.
    pub primary_id: i32,
    /// Energy, TeV.
    pub energy: f64,
    /// Altitude, deg.
    pub alt: f64,
    /// Azimuth, deg.
    pub az: f64,
    /// First interaction height, m.
    pub h_first_int: f64,
    /// Shower maximum, g cm-2.
    pub x_max: f64,
}

impl McShower {
    /// Encode the payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = ByteWriter::new();
        out.put_i32(self.primary_id);
        for v in [self.energy, self.alt, self.az, self.h_first_int, self.x_max] {
            out.put_f64(v);
        }
        out.into_inner()
    }

    /// Decode the payload of block `id`.
    pub fn decode(id: u32, payload: &[u8]) -> Result<Self, DecodeError> {
        let mut r = ByteReader::new(payload);
        Ok(Self {
            shower_num: id,
            primary_id: r.i32()?,
            energy: r.f64()?,
            alt: r.f64()?,
            az: r.f64()?,
            h_first_int: r.f64()?,
            x_max: r.f64()?,
        })
    }
}

/// Simulated event (type 2021).
#[derive(Debug, Clone, PartialEq)]
pub struct McEvent {
    /// Event id (block id).
    pub event_id: u32,
    /// Shower this event belongs to.
    pub shower_num: u32,
    /// Core x, m.
    pub core_x: f64,
    /// Core y, m.
    pub core_y: f64,
}

impl McEvent {
    /// Encode the payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = ByteWriter::new();
        out.put_u32(self.shower_num);
        out.put_f64(self.core_x);
        out.put_f64(self.core_y);
        out.into_inner()
    }

    /// Decode the payload of block `id`.
    pub fn decode(id: u32, payload: &[u8]) -> Result<Self, DecodeError> {
        let mut r = ByteReader::new(payload);
        Ok(Self {
            event_id: id,
            shower_num: r.u32()?,
            core_x: r.f64()?,
            core_y: r.f64()?,
        })
    }

    /// Combine with its shower into the truth container.
    pub fn truth(&self, shower: &McShower) -> SimulatedShower {
        SimulatedShower {
            energy: Some(shower.energy),
            alt: Some(shower.alt),
            az: Some(shower.az),
            core_x: Some(self.core_x),
            core_y: Some(self.core_y),
            h_first_int: Some(shower.h_first_int),
            x_max: Some(shower.x_max),
            shower_primary_id: Some(i64::from(shower.primary_id)),
        }
    }
}

/// Central trigger (sub-block 2009).
#[derive(Debug, Clone, PartialEq)]
pub struct CentralTrigger {
    /// Trigger time, Unix seconds.
    pub time: f64,
    /// Trigger type.
    pub event_type: EventType,
    /// Triggered telescopes.
    pub tels: Vec<TelId>,
}

/// ADC samples of one telescope (sub-block 2015).
#[derive(Debug, Clone, PartialEq)]
pub struct AdcSamples {
    /// Gain channels.
    pub n_channels: u16,
    /// Pixels.
    pub n_pixels: u32,
    /// Samples per pixel.
    pub n_samples: u16,
    /// `[channel][pixel][sample]`.
    pub samples: Vec<u16>,
}

/// Decoded array event payload (type 2010).
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayEventPayload {
    /// Central trigger.
    pub trigger: CentralTrigger,
    /// Samples of the telescopes accepted by the filter.
    pub telescopes: Vec<(TelId, AdcSamples)>,
}

/// Encode an array event payload.
pub fn encode_array_event(trigger: &CentralTrigger, telescopes: &[(TelId, AdcSamples)]) -> Vec<u8> {
    let mut out = ByteWriter::new();

    let mut trig = ByteWriter::new();
    trig.put_f64(trigger.time);
    trig.put_i32(trigger.event_type.code() as i32);
    trig.put_u16(trigger.tels.len() as u16);
    trigger.tels.iter().for_each(|t| trig.put_u16(*t));
    out.put_sub_block(block_type::CENTRAL_TRIGGER, 0, false, &trig.into_inner());

    for (tel_id, adc) in telescopes {
        let mut samples = ByteWriter::new();
        samples.put_u16(adc.n_channels);
        samples.put_u32(adc.n_pixels);
        samples.put_u16(adc.n_samples);
        adc.samples.iter().for_each(|s| samples.put_u16(*s));

        let mut tel = ByteWriter::new();
        let id = u32::from(*tel_id);
        tel.put_sub_block(block_type::ADC_SAMPLES, id, false, &samples.into_inner());
        out.put_sub_block(block_type::TEL_EVENT, u32::from(*tel_id), true, &tel.into_inner());
    }
    out.into_inner()
}

/// Decode an array event payload, decoding samples only for telescopes
/// accepted by `keep`.
pub fn decode_array_event(
    payload: &[u8],
    keep: impl Fn(TelId) -> bool,
) -> Result<ArrayEventPayload, DecodeError> {
    let mut r = ByteReader::new(payload);
    let mut trigger = None;
    let mut telescopes = Vec::new();

    while r.remaining() > 0 {
        let (header, mut body) = r.sub_block()?;
        match header.block_type {
            block_type::CENTRAL_TRIGGER => {
                let time = body.f64()?;
                let event_type = EventType::from_code(i64::from(body.i32()?));
                let n = usize::from(body.u16()?);
                let tels = body.vec(n, 2, ByteReader::u16)?;
                trigger = Some(CentralTrigger {
                    time,
                    event_type,
                    tels,
                });
            }
            block_type::TEL_EVENT => {
                let tel_id = TelId::try_from(header.id).map_err(|_| {
                    DecodeError::Invalid(format!("telescope id {} out of range", header.id))
                })?;
                if !keep(tel_id) {
                    continue;
                }
                while body.remaining() > 0 {
                    let (sub, mut data) = body.sub_block()?;
                    if sub.block_type != block_type::ADC_SAMPLES {
                        continue;
                    }
                    let n_channels = data.u16()?;
                    let n_pixels = data.u32()?;
                    let n_samples = data.u16()?;
                    let n = usize::from(n_channels) * n_pixels as usize * usize::from(n_samples);
                    let samples = data.vec(n, 2, ByteReader::u16)?;
                    telescopes.push((
                        tel_id,
                        AdcSamples {
                            n_channels,
                            n_pixels,
                            n_samples,
                            samples,
                        },
                    ));
                }
            }
            other => {
                return Err(DecodeError::Invalid(format!(
                    "unexpected sub-block type {other} in array event"
                )))
            }
        }
    }

    let trigger =
        trigger.ok_or_else(|| DecodeError::Invalid("array event without central trigger".into()))?;
    Ok(ArrayEventPayload {
        trigger,
        telescopes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_long_string_truncates_on_char_boundary() {
        let long = "é".repeat(40_000);
        let mut out = ByteWriter::new();
        out.put_string(&long);
        out.put_string("tail");
        let bytes = out.into_inner();

        let mut r = ByteReader::new(&bytes);
        let back = r.string().unwrap();
        assert_eq!(back.len(), 65_534);
        assert!(back.chars().all(|c| c == 'é'));
        assert_eq!(r.string().unwrap(), "tail");

        let mut out = ByteWriter::new();
        out.put_string("short");
        assert_eq!(ByteReader::new(&out.into_inner()).string().unwrap(), "short");
    }

    #[test]
    fn test_header_roundtrip() {
        let header = BlockHeader::new(block_type::ARRAY_EVENT, 17, 1234, true);
        let bytes = header.encode_top_level();
        assert_eq!(&bytes[..4], &[0x37, 0x8A, 0x1F, 0xD4]);
        let back = BlockHeader::read_top_level(&mut bytes.as_slice()).unwrap().unwrap();
        assert_eq!(back, header);
    }

    #[test]
    fn test_header_end_of_stream_and_truncation() {
        let empty: &[u8] = &[];
        assert!(BlockHeader::read_top_level(&mut { empty }).unwrap().is_none());
        let partial: &[u8] = &[0x37, 0x8A, 0x1F];
        assert!(matches!(
            BlockHeader::read_top_level(&mut { partial }),
            Err(DecodeError::Truncated { .. })
        ));
        let bad = [0u8; 16];
        assert!(matches!(
            BlockHeader::read_top_level(&mut bad.as_slice()),
            Err(DecodeError::BadMarker(0))
        ));
    }

    #[test]
    fn test_array_event_filter() {
        let trigger = CentralTrigger {
            time: 1.5e9,
            event_type: EventType::Subarray,
            tels: vec![1, 2],
        };
        let adc = |v: u16| AdcSamples {
            n_channels: 1,
            n_pixels: 2,
            n_samples: 3,
            samples: vec![v; 6],
        };
        let payload = encode_array_event(&trigger, &[(1, adc(10)), (2, adc(20))]);

        let all = decode_array_event(&payload, |_| true).unwrap();
        assert_eq!(all.trigger, trigger);
        assert_eq!(all.telescopes.len(), 2);

        let only_two = decode_array_event(&payload, |t| t == 2).unwrap();
        assert_eq!(only_two.telescopes.len(), 1);
        assert_eq!(only_two.telescopes[0].1.samples[0], 20);
    }

    #[test]
    fn test_corrupt_array_event_is_an_error() {
        assert!(decode_array_event(&[0xFF; 7], |_| true).is_err());
        let trigger = CentralTrigger {
            time: 0.0,
            event_type: EventType::Subarray,
            tels: vec![],
        };
        let mut payload = encode_array_event(&trigger, &[]);
        payload.truncate(payload.len() - 1);
        assert!(matches!(
            decode_array_event(&payload, |_| true),
            Err(DecodeError::Truncated { .. })
        ));
    }

    #[test]
    fn test_camera_settings_roundtrip() {
        let settings = CameraSettings {
            tel_id: 4,
            tel_name: "MST_MST_Toy".into(),
            optics_name: "MST".into(),
            camera_name: "ToyCam".into(),
            focal_length: 16.0,
            mirror_area: 106.0,
            sampling_rate: 1.0,
            n_channels: 1,
            pix_x: vec![0.0, 0.05],
            pix_y: vec![0.0, 0.0],
            pix_area: vec![0.0025, 0.0025],
        };
        let back = CameraSettings::decode(4, &settings.encode()).unwrap();
        assert_eq!(back, settings);
    }
}
