//! Event writer producing columnar datasets.
//!
//! [`DataWriter`] turns [`ArrayEvent`]s into rows of the fixed tables,
//! buffers them per table, and flushes a record batch every `chunk_size`
//! rows. Only tables whose data can exist are created: the configuration
//! flags are intersected with the field groups the run makes available (the
//! source datalevels plus whatever the stages write).

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cta_core::config::{Component, ComponentConfig, ComponentSchema, ParamSpec, ParamType};
use cta_core::containers::{Container, FieldValue};
use cta_core::{
    ArrayEvent, ConfigurationError, DataField, EventIndex, SubarrayDescription, WriteError,
};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::dataset::{DatasetMetadata, DatasetWriter, TableCompression};
use crate::table::{Cell, Table, TableBuffer};

/// Writer parameters.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DataWriterConfig {
    /// Write calibrated images.
    pub write_dl1_images: bool,
    /// Write image parameters.
    pub write_dl1_parameters: bool,
    /// Write reconstructed quantities.
    pub write_dl2: bool,
    /// Write simulation truth, if present.
    pub write_simulation: bool,
    /// Rows buffered per table before a flush.
    pub chunk_size: usize,
    /// Table compression.
    pub compression: TableCompression,
    /// Replace an existing output.
    pub overwrite: bool,
}

impl Default for DataWriterConfig {
    fn default() -> Self {
        Self {
            write_dl1_images: true,
            write_dl1_parameters: true,
            write_dl2: true,
            write_simulation: true,
            chunk_size: 1000,
            compression: TableCompression::Snappy,
            overwrite: false,
        }
    }
}

impl Component for DataWriterConfig {
    const NAME: &'static str = "writer";

    fn schema() -> ComponentSchema {
        ComponentSchema::new(Self::NAME, "Output dataset writer")
            .param(
                ParamSpec::new("write_dl1_images", ParamType::Bool)
                    .default(true)
                    .help("Write calibrated images, peak times and masks"),
            )
            .param(
                ParamSpec::new("write_dl1_parameters", ParamType::Bool)
                    .default(true)
                    .help("Write image parameters"),
            )
            .param(
                ParamSpec::new("write_dl2", ParamType::Bool)
                    .default(true)
                    .help("Write reconstructed geometry, energy and classification"),
            )
            .param(
                ParamSpec::new("write_simulation", ParamType::Bool)
                    .default(true)
                    .help("Write simulated shower truth when the input is simulated"),
            )
            .param(
                ParamSpec::new("chunk_size", ParamType::Int)
                    .default(1000)
                    .range(Some(1.0), None)
                    .help("Rows buffered per table before writing a batch"),
            )
            .param(
                ParamSpec::new("compression", ParamType::Str)
                    .default("snappy")
                    .choices(["snappy", "none"])
                    .help("Compression of the Parquet tables"),
            )
            .param(
                ParamSpec::new("overwrite", ParamType::Bool)
                    .default(false)
                    .help("Replace the output if it exists"),
            )
    }

    fn from_config(config: &ComponentConfig) -> Result<Self, ConfigurationError> {
        config.extract()
    }
}

impl DataWriterConfig {
    /// Tables to create given the field groups available in the run.
    pub fn tables(&self, available: &BTreeSet<DataField>, is_simulation: bool) -> Vec<Table> {
        Table::ALL
            .into_iter()
            .filter(|table| match table {
                Table::Trigger => true,
                Table::Shower => self.write_simulation && is_simulation,
                Table::Images => self.write_dl1_images && available.contains(&DataField::Dl1Image),
                Table::Parameters => {
                    self.write_dl1_parameters && available.contains(&DataField::Dl1Parameters)
                }
                Table::Geometry | Table::Energy | Table::Classification => {
                    self.write_dl2
                        && table.data_field().is_some_and(|f| available.contains(&f))
                }
            })
            .collect()
    }
}

fn index_cells(event: &ArrayEvent) -> Vec<Cell> {
    vec![
        Cell::U64(event.index.obs_id),
        Cell::U64(event.index.event_id),
    ]
}

fn container_cells<C: Container>(container: &C) -> impl Iterator<Item = Cell> {
    container.values().into_iter().map(Cell::Value)
}

/// Rows of `table` for one event.
fn rows(table: Table, event: &ArrayEvent) -> Vec<Vec<Cell>> {
    let with_index = |extra: Vec<Cell>| {
        let mut row = index_cells(event);
        row.extend(extra);
        row
    };
    match table {
        Table::Trigger => {
            let mut cells = vec![
                Cell::Value(FieldValue::F64(event.trigger.time)),
                Cell::Value(FieldValue::I64(Some(event.trigger.event_type.code()))),
                Cell::ListU16(event.trigger.tels_with_trigger.clone()),
            ];
            cells.extend(container_cells(&event.pointing));
            cells.push(Cell::Text(
                event.decode_error.as_ref().map(|e| e.message.clone()),
            ));
            vec![with_index(cells)]
        }
        Table::Shower => event
            .simulation
            .iter()
            .map(|sim| with_index(container_cells(sim).collect()))
            .collect(),
        Table::Images => event
            .tel
            .iter()
            .filter(|(_, tel)| tel.dl1.image.is_some())
            .map(|(tel_id, tel)| {
                with_index(vec![
                    Cell::U16(*tel_id),
                    Cell::ListF32(tel.dl1.image.clone()),
                    Cell::ListF32(tel.dl1.peak_time.clone()),
                    Cell::ListBool(tel.dl1.image_mask.clone()),
                    Cell::ListU8(tel.selected_gain_channel.clone()),
                ])
            })
            .collect(),
        Table::Parameters => event
            .tel
            .iter()
            .filter_map(|(tel_id, tel)| tel.dl1.parameters.as_ref().map(|p| (tel_id, p)))
            .map(|(tel_id, params)| {
                let mut cells = vec![Cell::U16(*tel_id)];
                cells.extend(container_cells(&params.hillas));
                cells.extend(container_cells(&params.leakage));
                cells.extend(container_cells(&params.morphology));
                with_index(cells)
            })
            .collect(),
        Table::Geometry => event
            .dl2
            .geometry
            .iter()
            .map(|c| with_index(container_cells(c).collect()))
            .collect(),
        Table::Energy => event
            .dl2
            .energy
            .iter()
            .map(|c| with_index(container_cells(c).collect()))
            .collect(),
        Table::Classification => event
            .dl2
            .classification
            .iter()
            .map(|c| with_index(container_cells(c).collect()))
            .collect(),
    }
}

/// Buffered, append-only writer of one output dataset.
#[derive(Debug)]
pub struct DataWriter {
    config: DataWriterConfig,
    inner: DatasetWriter,
    buffers: BTreeMap<Table, TableBuffer>,
    subarray: Arc<SubarrayDescription>,
    obs_ids: BTreeSet<u64>,
    is_simulation: bool,
    written: BTreeSet<EventIndex>,
}

impl DataWriter {
    /// Create the output. Fails if it exists and `overwrite` is off.
    pub fn create(
        output: &Path,
        config: &DataWriterConfig,
        subarray: Arc<SubarrayDescription>,
        is_simulation: bool,
        available: &BTreeSet<DataField>,
    ) -> Result<Self, WriteError> {
        let tables = config.tables(available, is_simulation);
        let inner = DatasetWriter::create(output, config.overwrite, config.compression, &tables)?;
        debug!(
            output = %output.display(),
            tables = ?tables.iter().map(|t| t.name()).collect::<Vec<_>>(),
            "Writer created"
        );
        Ok(Self {
            config: config.clone(),
            inner,
            buffers: tables.iter().map(|&t| (t, TableBuffer::new(t))).collect(),
            subarray,
            obs_ids: BTreeSet::new(),
            is_simulation,
            written: BTreeSet::new(),
        })
    }

    /// Tables being written.
    pub fn tables(&self) -> Vec<Table> {
        self.buffers.keys().copied().collect()
    }

    /// Final output path.
    pub fn output(&self) -> &Path {
        self.inner.output()
    }

    /// Events accepted so far.
    pub fn events_written(&self) -> u64 {
        self.written.len() as u64
    }

    /// Append one event. Any failure is fatal for the output, including an
    /// event index that was already written.
    pub fn write_event(&mut self, event: &ArrayEvent) -> Result<(), WriteError> {
        let output = self.inner.output().to_path_buf();
        if !self.written.insert(event.index) {
            return Err(WriteError::new(
                &output,
                format!("event {} was already written", event.index),
            ));
        }
        for (table, buffer) in &mut self.buffers {
            for row in rows(*table, event) {
                buffer
                    .push_row(row)
                    .map_err(|e| WriteError::new(&output, e))?;
            }
        }
        self.obs_ids.insert(event.index.obs_id);

        let full: Vec<Table> = self
            .buffers
            .iter()
            .filter(|(_, b)| b.len() >= self.config.chunk_size)
            .map(|(t, _)| *t)
            .collect();
        for table in full {
            self.flush(table)?;
        }
        Ok(())
    }

    fn flush(&mut self, table: Table) -> Result<(), WriteError> {
        let Some(buffer) = self.buffers.get_mut(&table) else {
            return Ok(());
        };
        if buffer.is_empty() {
            return Ok(());
        }
        let rows = buffer.len();
        let batch = buffer
            .take_batch()
            .map_err(|e| WriteError::new(self.inner.output(), e.to_string()))?;
        self.inner.write_batch(table, &batch)?;
        debug!(table = %table, rows, "Flushed batch");
        Ok(())
    }

    /// Flush remaining rows, write the metadata, and move the dataset into
    /// place. `provenance` is the activity chain, newest first.
    pub fn finish(
        mut self,
        config: Option<Value>,
        provenance: Vec<Value>,
    ) -> Result<PathBuf, WriteError> {
        for table in self.tables() {
            self.flush(table)?;
        }
        let mut metadata = DatasetMetadata::new(
            (*self.subarray).clone(),
            self.obs_ids.iter().copied().collect(),
            self.is_simulation,
        );
        metadata.config = config;
        metadata.provenance = provenance;
        self.inner.finish(metadata)
    }
}
