//! Event source over a columnar dataset directory.
//!
//! The trigger table drives iteration: one row, one event. Every other table
//! present is read through its own cursor and merge-joined on
//! [`EventIndex`], relying on all tables sharing the trigger table's event
//! order. `max_events` becomes a row limit on the trigger table, so nothing
//! past the cap is decoded.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cta_core::containers::{
    EventType, FieldType, HillasParameters, ImageParameters, LeakageParameters,
    MorphologyParameters, TriggerInfo,
};
use cta_core::{
    ArrayEvent, DataField, RecoverableDecodeError, SourceError, SubarrayDescription, TelId,
    DATA_SCHEMA_VERSION,
};
use serde_json::Value;
use tracing::{debug, warn};

use super::{EventSource, EventSourceFactory, SourceConfig};
use crate::dataset::{is_dataset, DatasetMetadata, FORMAT_TAG};
use crate::table::{ReadOptions, RowRef, Table, TableReader};

/// Factory for [`ColumnarSource`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ColumnarFactory;

impl EventSourceFactory for ColumnarFactory {
    fn name(&self) -> &'static str {
        "columnar"
    }

    fn description(&self) -> &'static str {
        "Columnar dataset directory (metadata.json + Parquet tables)"
    }

    fn probe(&self, path: &Path) -> bool {
        is_dataset(path)
    }

    fn open(
        &self,
        path: &Path,
        config: &SourceConfig,
    ) -> Result<Box<dyn EventSource>, SourceError> {
        Ok(Box::new(ColumnarSource::open(path, config)?))
    }
}

/// Whether a stored schema version can be read by this build (same major).
pub fn compatible_version(version: &str) -> bool {
    let major = |v: &str| v.split('.').next().map(str::to_owned);
    major(version) == major(DATA_SCHEMA_VERSION)
}

/// Reader of one columnar dataset.
#[derive(Debug)]
pub struct ColumnarSource {
    path: PathBuf,
    metadata: DatasetMetadata,
    subarray: Arc<SubarrayDescription>,
    datalevels: Vec<DataField>,
    allowed_tels: Option<BTreeSet<TelId>>,
    max_events: Option<u64>,
    trigger: TableReader,
    joined: Vec<TableReader>,
    events_read: u64,
}

impl ColumnarSource {
    /// Open the dataset at `path`.
    pub fn open(path: &Path, config: &SourceConfig) -> Result<Self, SourceError> {
        let open_error = |message: String| SourceError::Open {
            path: path.to_path_buf(),
            message,
        };

        let metadata = DatasetMetadata::read(path).map_err(open_error)?;
        if metadata.format != FORMAT_TAG {
            return Err(open_error(format!(
                "format '{}' is not '{FORMAT_TAG}'",
                metadata.format
            )));
        }
        if !compatible_version(&metadata.schema_version) {
            return Err(open_error(format!(
                "schema version {} cannot be read (supported: {DATA_SCHEMA_VERSION})",
                metadata.schema_version
            )));
        }

        let tables = metadata.known_tables();
        if !tables.contains(&Table::Trigger) {
            return Err(open_error("dataset has no trigger table".into()));
        }

        let limit = config
            .max_events
            .map(|m| usize::try_from(m).unwrap_or(usize::MAX));
        let trigger = TableReader::open(
            path,
            Table::Trigger,
            ReadOptions {
                columns: None,
                limit,
            },
        )
        .map_err(open_error)?;

        let joined = tables
            .iter()
            .filter(|t| **t != Table::Trigger)
            .map(|&t| TableReader::open(path, t, ReadOptions::default()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(open_error)?;

        let datalevels: Vec<DataField> = tables.iter().filter_map(|t| t.data_field()).collect();
        let subarray = config.restrict(metadata.subarray.clone());

        debug!(
            path = %path.display(),
            n_events = trigger.n_rows(),
            tables = tables.len(),
            "Columnar dataset opened"
        );

        Ok(Self {
            path: path.to_path_buf(),
            subarray: Arc::new(subarray),
            datalevels,
            allowed_tels: config.allowed_set(),
            max_events: config.max_events,
            trigger,
            joined,
            metadata,
            events_read: 0,
        })
    }

    /// Metadata document of the dataset.
    pub fn metadata(&self) -> &DatasetMetadata {
        &self.metadata
    }

    fn stream_error(&self, message: String) -> SourceError {
        SourceError::Stream {
            path: self.path.clone(),
            message,
        }
    }
}

fn keeps(allowed: Option<&BTreeSet<TelId>>, tel_id: TelId) -> bool {
    allowed.map_or(true, |a| a.contains(&tel_id))
}

fn event_from_trigger(
    row: RowRef<'_>,
    count: u64,
    subarray: &Arc<SubarrayDescription>,
    allowed: Option<&BTreeSet<TelId>>,
) -> Result<ArrayEvent, String> {
    let index = row.index()?;
    let mut event = ArrayEvent::new(index, count, Arc::clone(subarray));
    event.trigger = TriggerInfo {
        time: row.value("time", FieldType::F64)?.as_f64(),
        event_type: row
            .value("event_type", FieldType::I64)?
            .as_f64()
            .map_or(EventType::Unknown, |code| EventType::from_code(code as i64)),
        tels_with_trigger: row
            .list_u16("tels_with_trigger")?
            .into_iter()
            .filter(|id| keeps(allowed, *id))
            .collect(),
    };
    event.pointing = row.container()?;
    event.decode_error = row
        .text("decode_error")?
        .map(|message| RecoverableDecodeError::new(Some(index), message));
    Ok(event)
}

/// Join the rows of one table into `event`. Row-level inconsistencies are
/// collected into `problems`; structural errors are returned.
fn join_rows(
    reader: &mut TableReader,
    event: &mut ArrayEvent,
    allowed: Option<&BTreeSet<TelId>>,
    problems: &mut Vec<String>,
) -> Result<(), String> {
    let table = reader.table();
    let index = event.index;
    reader.rows_for(index, |row| {
        match table {
            Table::Trigger => {}
            Table::Shower => event.simulation = Some(row.container()?),
            Table::Geometry => event.dl2.geometry = Some(row.container()?),
            Table::Energy => event.dl2.energy = Some(row.container()?),
            Table::Classification => event.dl2.classification = Some(row.container()?),
            Table::Images | Table::Parameters => {
                let tel_id = row.u16("tel_id")?;
                if !keeps(allowed, tel_id) {
                    return Ok(());
                }
                let Some(camera) = event.subarray.tel(tel_id).map(|t| &t.camera) else {
                    problems.push(format!("{table} has a row for unknown telescope {tel_id}"));
                    return Ok(());
                };
                let n_pixels = camera.n_pixels();
                if table == Table::Images {
                    let image = row.list_f32("image")?;
                    let peak_time = row.list_f32("peak_time")?;
                    let image_mask = row.list_bool("image_mask")?;
                    let gains = row.list_u8("selected_gain_channel")?;
                    let lengths = [
                        image.as_ref().map(Vec::len),
                        peak_time.as_ref().map(Vec::len),
                        image_mask.as_ref().map(Vec::len),
                        gains.as_ref().map(Vec::len),
                    ];
                    if lengths.iter().flatten().any(|&len| len != n_pixels) {
                        problems.push(format!(
                            "image of telescope {tel_id} does not match the {n_pixels} \
                             camera pixels"
                        ));
                        return Ok(());
                    }
                    let tel = event.tel.entry(tel_id).or_default();
                    tel.selected_gain_channel = gains;
                    tel.dl1.image = image;
                    tel.dl1.peak_time = peak_time;
                    tel.dl1.image_mask = image_mask;
                } else {
                    let parameters = ImageParameters {
                        hillas: row.container::<HillasParameters>()?,
                        leakage: row.container::<LeakageParameters>()?,
                        morphology: row.container::<MorphologyParameters>()?,
                    };
                    event.tel.entry(tel_id).or_default().dl1.parameters = Some(parameters);
                }
            }
        }
        Ok(())
    })
}

impl EventSource for ColumnarSource {
    fn name(&self) -> &'static str {
        "columnar"
    }

    fn input_path(&self) -> &Path {
        &self.path
    }

    fn subarray(&self) -> &Arc<SubarrayDescription> {
        &self.subarray
    }

    fn obs_ids(&self) -> &[u64] {
        &self.metadata.obs_ids
    }

    fn is_simulation(&self) -> bool {
        self.metadata.is_simulation
    }

    fn datalevels(&self) -> &[DataField] {
        &self.datalevels
    }

    fn max_events(&self) -> Option<u64> {
        self.max_events
    }

    fn allowed_tels(&self) -> Option<&BTreeSet<TelId>> {
        self.allowed_tels.as_ref()
    }

    fn n_events_hint(&self) -> Option<u64> {
        let rows = self.trigger.n_rows();
        Some(self.max_events.map_or(rows, |max| max.min(rows)))
    }

    fn events_read(&self) -> u64 {
        self.events_read
    }

    fn provenance_chain(&self) -> Vec<Value> {
        self.metadata.provenance.clone()
    }

    fn next_event(&mut self) -> Result<Option<ArrayEvent>, SourceError> {
        if self.max_events.is_some_and(|max| self.events_read >= max) {
            return Ok(None);
        }

        let count = self.events_read;
        let allowed = self.allowed_tels.as_ref();
        let subarray = &self.subarray;
        let next = self
            .trigger
            .next_row(|row| event_from_trigger(row, count, subarray, allowed));
        let mut event = match next {
            Ok(Some(event)) => event,
            Ok(None) => return Ok(None),
            Err(message) => return Err(self.stream_error(message)),
        };

        let mut problems = Vec::new();
        for reader in &mut self.joined {
            if let Err(message) = join_rows(reader, &mut event, allowed, &mut problems) {
                return Err(SourceError::Stream {
                    path: self.path.clone(),
                    message,
                });
            }
        }

        if !problems.is_empty() && event.decode_error.is_none() {
            let message = problems.join("; ");
            warn!(
                obs_id = event.index.obs_id,
                event_id = event.index.event_id,
                stage = "source",
                "Recoverable decode error: {message}"
            );
            event.tel.clear();
            event.decode_error = Some(RecoverableDecodeError::new(Some(event.index), message));
        }

        self.events_read += 1;
        Ok(Some(event))
    }
}
