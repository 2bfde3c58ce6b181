//! Merging of columnar datasets written by independent runs.
//!
//! # All-or-nothing
//!
//! ```text
//!  inputs ──► validate ──────────────────────────────► write
//!             │ readable dataset, format, version      │ DatasetWriter (<out>.partial)
//!             │ subarray (field by field)              │ input order, row order kept
//!             │ table set, Arrow schemas               │ metadata: merge activity
//!             │ EventIndex disjoint (index cols only)  │   + every input's chain
//!             │ output path free (or overwrite)        │ rename onto output
//!             ▼                                        ▼
//!         MergeError, nothing written             MergeSummary
//! ```
//!
//! Every check runs before the output path is touched.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use arrow::record_batch::RecordBatch;
use cta_core::config::{Component, ComponentConfig, ComponentSchema, ParamSpec, ParamType};
use cta_core::provenance::ActivityStatus;
use cta_core::{ConfigurationError, EventIndex, MergeError, RunContext, WriteError};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::dataset::{is_dataset, DatasetMetadata, DatasetWriter, TableCompression, FORMAT_TAG};
use crate::source::compatible_version;
use crate::table::{read_index, ReadOptions, Table, TableReader};

/// What goes into the merged output.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MergeOptions {
    /// Keep calibrated images.
    pub include_dl1_images: bool,
    /// Keep image parameters.
    pub include_dl1_parameters: bool,
    /// Keep reconstructed quantities.
    pub include_dl2: bool,
    /// Keep simulation truth.
    pub include_simulation: bool,
    /// Table compression of the output.
    pub compression: TableCompression,
    /// Replace an existing output.
    pub overwrite: bool,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            include_dl1_images: true,
            include_dl1_parameters: true,
            include_dl2: true,
            include_simulation: true,
            compression: TableCompression::Snappy,
            overwrite: false,
        }
    }
}

impl Component for MergeOptions {
    const NAME: &'static str = "options";

    fn schema() -> ComponentSchema {
        ComponentSchema::new(Self::NAME, "What the merged output keeps")
            .param(
                ParamSpec::new("include_dl1_images", ParamType::Bool)
                    .default(true)
                    .help("Keep calibrated images (dropping them shrinks the output)"),
            )
            .param(
                ParamSpec::new("include_dl1_parameters", ParamType::Bool)
                    .default(true)
                    .help("Keep image parameters"),
            )
            .param(
                ParamSpec::new("include_dl2", ParamType::Bool)
                    .default(true)
                    .help("Keep reconstructed geometry, energy and classification"),
            )
            .param(
                ParamSpec::new("include_simulation", ParamType::Bool)
                    .default(true)
                    .help("Keep simulated shower truth"),
            )
            .param(
                ParamSpec::new("compression", ParamType::Str)
                    .default("snappy")
                    .choices(["snappy", "none"])
                    .help("Compression of the merged tables"),
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

impl MergeOptions {
    fn keeps(&self, table: Table) -> bool {
        match table {
            Table::Trigger => true,
            Table::Shower => self.include_simulation,
            Table::Images => self.include_dl1_images,
            Table::Parameters => self.include_dl1_parameters,
            Table::Geometry | Table::Energy | Table::Classification => self.include_dl2,
        }
    }
}

/// A validated merge input.
#[derive(Debug, Clone)]
struct MergeInput {
    path: PathBuf,
    metadata: DatasetMetadata,
    tables: Vec<Table>,
}

/// Outcome of a merge.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeSummary {
    /// Merged dataset.
    pub output: PathBuf,
    /// Number of inputs.
    pub n_inputs: usize,
    /// Events in the output.
    pub n_events: u64,
    /// Tables written.
    pub tables: Vec<Table>,
}

fn unreadable(file: &Path, message: impl Into<String>) -> MergeError {
    MergeError::Unreadable {
        file: file.to_path_buf(),
        message: message.into(),
    }
}

fn schema_mismatch(file: &Path, field: impl Into<String>, detail: impl Into<String>) -> MergeError {
    MergeError::SchemaMismatch {
        file: file.to_path_buf(),
        field: field.into(),
        detail: detail.into(),
    }
}

fn open_input(path: &Path) -> Result<MergeInput, MergeError> {
    if !is_dataset(path) {
        return Err(unreadable(path, "not a columnar dataset (no metadata.json)"));
    }
    let metadata = DatasetMetadata::read(path).map_err(|e| unreadable(path, e))?;
    if metadata.format != FORMAT_TAG {
        return Err(schema_mismatch(
            path,
            "format",
            format!("'{}' is not '{FORMAT_TAG}'", metadata.format),
        ));
    }
    if !compatible_version(&metadata.schema_version) {
        return Err(schema_mismatch(
            path,
            "schema_version",
            format!("{} cannot be read by this version", metadata.schema_version),
        ));
    }
    let unknown: Vec<&String> = metadata
        .tables
        .iter()
        .filter(|t| Table::from_name(t).is_none())
        .collect();
    if let Some(name) = unknown.first() {
        return Err(schema_mismatch(path, name.as_str(), "unknown table"));
    }
    let tables = metadata.known_tables();
    for &table in &tables {
        TableReader::open(path, table, ReadOptions::default())
            .map_err(|e| schema_mismatch(path, table.name(), e))?;
    }
    Ok(MergeInput {
        path: path.to_path_buf(),
        metadata,
        tables,
    })
}

fn describe_tables(tables: &BTreeSet<Table>) -> String {
    tables.iter().map(|t| t.name()).collect::<Vec<_>>().join(", ")
}

/// Check every input against the first and against each other. Nothing is
/// written.
fn validate(
    inputs: &[PathBuf],
    output: &Path,
    options: &MergeOptions,
) -> Result<Vec<MergeInput>, MergeError> {
    if inputs.is_empty() {
        return Err(MergeError::NoInputs);
    }

    let mut opened: Vec<MergeInput> = Vec::with_capacity(inputs.len());
    for path in inputs {
        let input = open_input(path)?;
        if let Some(first) = opened.first() {
            if input.metadata.schema_version != first.metadata.schema_version {
                return Err(schema_mismatch(
                    path,
                    "schema_version",
                    format!(
                        "{} differs from {} of {}",
                        input.metadata.schema_version,
                        first.metadata.schema_version,
                        first.path.display()
                    ),
                ));
            }
            if let Some(field) = first.metadata.subarray.diff(&input.metadata.subarray) {
                return Err(MergeError::SubarrayMismatch {
                    file: path.clone(),
                    field,
                });
            }
            if input.metadata.is_simulation != first.metadata.is_simulation {
                return Err(schema_mismatch(
                    path,
                    "is_simulation",
                    "simulated and observed data cannot be merged",
                ));
            }
            let expected: BTreeSet<Table> = first.tables.iter().copied().collect();
            let actual: BTreeSet<Table> = input.tables.iter().copied().collect();
            if expected != actual {
                let missing: BTreeSet<Table> = expected.difference(&actual).copied().collect();
                let extra: BTreeSet<Table> = actual.difference(&expected).copied().collect();
                return Err(schema_mismatch(
                    path,
                    "tables",
                    format!(
                        "missing [{}], extra [{}]",
                        describe_tables(&missing),
                        describe_tables(&extra)
                    ),
                ));
            }
        }
        debug!(input = %path.display(), events = input.metadata.n_events, "Merge input accepted");
        opened.push(input);
    }

    let mut seen: HashMap<EventIndex, usize> = HashMap::new();
    for (i, input) in opened.iter().enumerate() {
        let indices = read_index(&input.path, Table::Trigger)
            .map_err(|e| schema_mismatch(&input.path, Table::Trigger.name(), e))?;
        for index in indices {
            if let Some(&first) = seen.get(&index) {
                return Err(MergeError::DuplicateEvent {
                    index,
                    file: input.path.clone(),
                    first_file: opened[first].path.clone(),
                });
            }
            seen.insert(index, i);
        }
    }

    let output_is_input = opened.iter().any(|input| same_path(&input.path, output));
    if output_is_input || (output.exists() && !options.overwrite) {
        return Err(MergeError::OutputExists {
            path: output.to_path_buf(),
        });
    }
    Ok(opened)
}

fn same_path(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

fn conform(table: Table, batch: &RecordBatch) -> Result<RecordBatch, String> {
    RecordBatch::try_new(table.schema(), batch.columns().to_vec()).map_err(|e| e.to_string())
}

/// Merge `inputs` into `output`.
///
/// Validation completes before anything is written; a failure leaves the
/// output path untouched. Inputs are concatenated in the given order with
/// each input's event order preserved. The run's `merge` activity is
/// recorded in `ctx` and stored first in the output's provenance chain,
/// followed by the chains of all inputs.
pub fn merge(
    inputs: &[PathBuf],
    output: &Path,
    options: &MergeOptions,
    ctx: &mut RunContext,
) -> Result<MergeSummary, MergeError> {
    let id = ctx.provenance.start_activity("merge");
    let result = merge_inner(inputs, output, options, ctx);
    // on success the activity was finished before the metadata was written
    let still_running = ctx
        .provenance
        .current()
        .is_some_and(|a| a.activity_uuid == id);
    if still_running {
        ctx.provenance.finish_activity(ActivityStatus::Failed);
    }
    result
}

fn merge_inner(
    inputs: &[PathBuf],
    output: &Path,
    options: &MergeOptions,
    ctx: &mut RunContext,
) -> Result<MergeSummary, MergeError> {
    let opened = validate(inputs, output, options)?;
    let first = &opened[0];

    let tables: Vec<Table> = first
        .tables
        .iter()
        .copied()
        .filter(|t| options.keeps(*t))
        .collect();
    for input in &opened {
        ctx.provenance.add_input_file(&input.path);
    }
    ctx.provenance.add_output_file(output);
    let config = serde_json::json!({
        "options": {
            "include_dl1_images": options.include_dl1_images,
            "include_dl1_parameters": options.include_dl1_parameters,
            "include_dl2": options.include_dl2,
            "include_simulation": options.include_simulation,
            "overwrite": options.overwrite,
        }
    });
    ctx.provenance.add_config(config.clone());

    let mut writer =
        DatasetWriter::create(output, options.overwrite, options.compression, &tables)?;
    for input in &opened {
        for &table in &tables {
            let mut reader = TableReader::open(&input.path, table, ReadOptions::default())
                .map_err(|e| WriteError::new(&input.path, e))?;
            while let Some(batch) = reader
                .next_batch()
                .map_err(|e| WriteError::new(&input.path, e))?
            {
                let batch = conform(table, &batch).map_err(|e| WriteError::new(&input.path, e))?;
                writer.write_batch(table, &batch)?;
            }
        }
        info!(input = %input.path.display(), events = input.metadata.n_events, "Merged input");
    }

    let obs_ids: BTreeSet<u64> = opened
        .iter()
        .flat_map(|i| i.metadata.obs_ids.iter().copied())
        .collect();
    let n_events = writer.rows(Table::Trigger);
    ctx.provenance.set_counter("n_inputs", opened.len());
    ctx.provenance.set_counter("n_events", n_events);

    let activity = ctx
        .provenance
        .finish_activity(ActivityStatus::Completed)
        .map(|a| serde_json::to_value(a).unwrap_or(Value::Null));
    let mut chain: Vec<Value> = activity.into_iter().collect();
    for input in &opened {
        chain.extend(input.metadata.provenance.iter().cloned());
    }

    let mut metadata = DatasetMetadata::new(
        first.metadata.subarray.clone(),
        obs_ids.into_iter().collect(),
        first.metadata.is_simulation,
    );
    metadata.config = Some(config);
    metadata.provenance = chain;
    let output = writer.finish(metadata)?;

    info!(
        output = %output.display(),
        inputs = opened.len(),
        n_events,
        "Merge complete"
    );
    Ok(MergeSummary {
        output,
        n_inputs: opened.len(),
        n_events,
        tables,
    })
}
