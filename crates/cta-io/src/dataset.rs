//! Columnar dataset on disk.
//!
//! A dataset is a directory:
//!
//! ```text
//! gamma_run1.dl1/
//! ├── metadata.json                         format, schema version, subarray, provenance
//! ├── dl1/event/subarray/trigger.parquet
//! ├── dl1/event/telescope/images.parquet
//! ├── dl1/event/telescope/parameters.parquet
//! └── ...
//! ```
//!
//! [`DatasetWriter`] writes everything below `<output>.partial/`, writes
//! `metadata.json` last, and renames the directory onto the output path.
//! A crashed run therefore never leaves something that probes as a dataset.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use arrow::record_batch::RecordBatch;
use cta_core::{SubarrayDescription, WriteError, DATA_SCHEMA_VERSION};
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::table::Table;

/// Name of the metadata document inside a dataset directory.
pub const METADATA_FILE: &str = "metadata.json";

/// Format tag stored in the metadata.
pub const FORMAT_TAG: &str = "cta-pipe-columnar";

/// Contents of `metadata.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetMetadata {
    /// Always [`FORMAT_TAG`].
    pub format: String,
    /// Table layout version.
    pub schema_version: String,
    /// Instrument description shared by all events.
    pub subarray: SubarrayDescription,
    /// Observation blocks contained.
    pub obs_ids: Vec<u64>,
    /// Whether the events are simulated.
    pub is_simulation: bool,
    /// Tables present, by name.
    pub tables: Vec<String>,
    /// Number of events (rows of the trigger table).
    pub n_events: u64,
    /// Resolved configuration of the run that wrote the dataset.
    pub config: Option<Value>,
    /// Provenance activities, newest first.
    pub provenance: Vec<Value>,
}

impl DatasetMetadata {
    /// Metadata for a new dataset with the current format and version.
    pub fn new(subarray: SubarrayDescription, obs_ids: Vec<u64>, is_simulation: bool) -> Self {
        Self {
            format: FORMAT_TAG.into(),
            schema_version: DATA_SCHEMA_VERSION.into(),
            subarray,
            obs_ids,
            is_simulation,
            tables: Vec::new(),
            n_events: 0,
            config: None,
            provenance: Vec::new(),
        }
    }

    /// Read `metadata.json` of a dataset directory.
    pub fn read(root: &Path) -> Result<Self, String> {
        let path = root.join(METADATA_FILE);
        let text = fs::read_to_string(&path).map_err(|e| format!("{}: {e}", path.display()))?;
        serde_json::from_str(&text).map_err(|e| format!("{}: {e}", path.display()))
    }

    /// Tables listed in the metadata that this build knows.
    pub fn known_tables(&self) -> Vec<Table> {
        self.tables.iter().filter_map(|t| Table::from_name(t)).collect()
    }
}

/// Whether `path` looks like a finished dataset.
pub fn is_dataset(path: &Path) -> bool {
    path.is_dir() && path.join(METADATA_FILE).is_file()
}

/// Compression of written tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableCompression {
    /// Snappy block compression.
    #[default]
    Snappy,
    /// Uncompressed.
    None,
}

impl TableCompression {
    fn codec(self) -> Compression {
        match self {
            TableCompression::Snappy => Compression::SNAPPY,
            TableCompression::None => Compression::UNCOMPRESSED,
        }
    }
}

/// Partial path used while a dataset is being written.
pub fn partial_path(output: &Path) -> PathBuf {
    let mut name = output.as_os_str().to_os_string();
    name.push(".partial");
    PathBuf::from(name)
}

/// Low-level dataset writer: one Parquet writer per table.
pub struct DatasetWriter {
    output: PathBuf,
    partial: PathBuf,
    overwrite: bool,
    writers: BTreeMap<Table, ArrowWriter<File>>,
    rows: BTreeMap<Table, u64>,
}

impl std::fmt::Debug for DatasetWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatasetWriter")
            .field("output", &self.output)
            .field("tables", &self.writers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl DatasetWriter {
    /// Start a dataset with the given tables.
    ///
    /// Fails if the output exists and `overwrite` is false. A stale partial
    /// directory from an earlier crashed run is removed.
    pub fn create(
        output: &Path,
        overwrite: bool,
        compression: TableCompression,
        tables: &[Table],
    ) -> Result<Self, WriteError> {
        if output.exists() && !overwrite {
            return Err(WriteError::new(
                output,
                "output already exists (set overwrite to replace it)",
            ));
        }
        let partial = partial_path(output);
        if partial.exists() {
            debug!(path = %partial.display(), "Removing stale partial output");
            fs::remove_dir_all(&partial).map_err(|e| WriteError::new(&partial, e.to_string()))?;
        }
        fs::create_dir_all(&partial).map_err(|e| WriteError::new(&partial, e.to_string()))?;

        let props = WriterProperties::builder()
            .set_compression(compression.codec())
            .build();

        let mut writers = BTreeMap::new();
        for &table in tables {
            let path = table.file_path(&partial);
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir).map_err(|e| WriteError::new(dir, e.to_string()))?;
            }
            let file = File::create(&path).map_err(|e| WriteError::new(&path, e.to_string()))?;
            let writer = ArrowWriter::try_new(file, table.schema(), Some(props.clone()))
                .map_err(|e| WriteError::new(&path, e.to_string()))?;
            writers.insert(table, writer);
        }

        Ok(Self {
            output: output.to_path_buf(),
            partial,
            overwrite,
            rows: tables.iter().map(|t| (*t, 0)).collect(),
            writers,
        })
    }

    /// Final output path.
    pub fn output(&self) -> &Path {
        &self.output
    }

    /// Tables being written.
    pub fn tables(&self) -> Vec<Table> {
        self.writers.keys().copied().collect()
    }

    /// Rows written to a table so far.
    pub fn rows(&self, table: Table) -> u64 {
        self.rows.get(&table).copied().unwrap_or(0)
    }

    /// Append a batch to a table.
    pub fn write_batch(&mut self, table: Table, batch: &RecordBatch) -> Result<(), WriteError> {
        let path = table.file_path(&self.partial);
        let writer = self
            .writers
            .get_mut(&table)
            .ok_or_else(|| WriteError::new(&path, "table not opened for writing"))?;
        writer
            .write(batch)
            .map_err(|e| WriteError::new(&path, e.to_string()))?;
        *self.rows.entry(table).or_insert(0) += batch.num_rows() as u64;
        Ok(())
    }

    /// Close all tables, write the metadata, and move the dataset into
    /// place. `tables` and `n_events` of the metadata are filled in here.
    pub fn finish(mut self, mut metadata: DatasetMetadata) -> Result<PathBuf, WriteError> {
        for (table, writer) in std::mem::take(&mut self.writers) {
            let path = table.file_path(&self.partial);
            writer
                .close()
                .map_err(|e| WriteError::new(&path, e.to_string()))?;
        }

        metadata.tables = self.rows.keys().map(|t| t.name().to_string()).collect();
        metadata.n_events = self.rows(Table::Trigger);
        let meta_path = self.partial.join(METADATA_FILE);
        let json = serde_json::to_string_pretty(&metadata)
            .map_err(|e| WriteError::new(&meta_path, e.to_string()))?;
        fs::write(&meta_path, json).map_err(|e| WriteError::new(&meta_path, e.to_string()))?;

        if self.output.exists() {
            if !self.overwrite {
                return Err(WriteError::new(&self.output, "output appeared while writing"));
            }
            let removed = if self.output.is_dir() {
                fs::remove_dir_all(&self.output)
            } else {
                fs::remove_file(&self.output)
            };
            removed.map_err(|e| WriteError::new(&self.output, e.to_string()))?;
        }
        fs::rename(&self.partial, &self.output)
            .map_err(|e| WriteError::new(&self.output, e.to_string()))?;

        info!(
            output = %self.output.display(),
            n_events = metadata.n_events,
            tables = metadata.tables.len(),
            "Dataset written"
        );
        Ok(self.output.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::{Cell, TableBuffer};
    use cta_core::containers::FieldValue;

    fn trigger_batch(event_ids: &[u64]) -> RecordBatch {
        let mut buffer = TableBuffer::new(Table::Trigger);
        for &id in event_ids {
            buffer
                .push_row(vec![
                    Cell::U64(1),
                    Cell::U64(id),
                    Cell::Value(FieldValue::F64(None)),
                    Cell::Value(FieldValue::I64(Some(32))),
                    Cell::ListU16(vec![1]),
                    Cell::Value(FieldValue::F64(Some(70.0))),
                    Cell::Value(FieldValue::F64(Some(0.0))),
                    Cell::Text(None),
                ])
                .unwrap();
        }
        buffer.take_batch().unwrap()
    }

    #[test]
    fn test_dataset_appears_only_after_finish() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("run.dl1");
        let mut writer =
            DatasetWriter::create(&output, false, TableCompression::Snappy, &[Table::Trigger])
                .unwrap();
        writer.write_batch(Table::Trigger, &trigger_batch(&[1, 2, 3])).unwrap();
        assert!(!is_dataset(&output));
        assert!(partial_path(&output).is_dir());

        let metadata = DatasetMetadata::new(SubarrayDescription::new("toy"), vec![1], true);
        writer.finish(metadata).unwrap();
        assert!(is_dataset(&output));
        assert!(!partial_path(&output).exists());

        let back = DatasetMetadata::read(&output).unwrap();
        assert_eq!(back.n_events, 3);
        assert_eq!(back.tables, vec![Table::Trigger.name().to_string()]);
        assert_eq!(back.schema_version, DATA_SCHEMA_VERSION);
    }

    #[test]
    fn test_existing_output_requires_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("run.dl1");
        fs::create_dir(&output).unwrap();
        let err = DatasetWriter::create(&output, false, TableCompression::None, &[Table::Trigger])
            .unwrap_err();
        assert_eq!(err.path, output);

        let tables = [Table::Trigger];
        let writer = DatasetWriter::create(&output, true, TableCompression::None, &tables).unwrap();
        let metadata = DatasetMetadata::new(SubarrayDescription::new("toy"), vec![], false);
        writer.finish(metadata).unwrap();
        assert!(is_dataset(&output));
    }

    #[test]
    fn test_dropped_writer_leaves_no_dataset() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("run.dl1");
        {
            let mut writer =
                DatasetWriter::create(&output, false, TableCompression::Snappy, &[Table::Trigger])
                    .unwrap();
            writer.write_batch(Table::Trigger, &trigger_batch(&[1])).unwrap();
        }
        assert!(!output.exists());
        assert!(!is_dataset(&partial_path(&output)));
    }
}
