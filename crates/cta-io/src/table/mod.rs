//! Fixed table layout of the columnar dataset.
//!
//! Each [`Table`] stores one subtree of the event record, one row per event
//! (subarray tables) or per telescope event (telescope tables), keyed by
//! `obs_id` and `event_id`:
//!
//! ```text
//! dl1/event/subarray/trigger        obs_id event_id time event_type tels_with_trigger pointing_* decode_error
//! simulation/event/subarray/shower  obs_id event_id true_*
//! dl1/event/telescope/images        obs_id event_id tel_id image peak_time image_mask selected_gain_channel
//! dl1/event/telescope/parameters    obs_id event_id tel_id hillas_* leakage_* morphology_*
//! dl2/event/subarray/geometry       obs_id event_id reco_alt ... reco_is_valid
//! dl2/event/subarray/energy         obs_id event_id reco_energy ... reco_is_valid
//! dl2/event/subarray/classification obs_id event_id gh_score ... gh_is_valid
//! ```
//!
//! The trigger table always has one row per event and drives reading; all
//! other tables are written in the same event order and joined to it.

mod buffer;
mod reader;
mod row;

pub use buffer::{Cell, TableBuffer};
pub use reader::{read_index, ReadOptions, TableReader};
pub use row::RowRef;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use cta_core::containers::{
    Container, FieldMeta, FieldType, HillasParameters, LeakageParameters, MorphologyParameters,
    ParticleClassification, PointingInfo, ReconstructedEnergy, ReconstructedGeometry,
    SimulatedShower,
};
use cta_core::DataField;

/// Physical type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    /// Non-null `u64`.
    UInt64,
    /// Non-null `u16`.
    UInt16,
    /// Nullable `f64`.
    Float64,
    /// Nullable `i64`.
    Int64,
    /// Nullable bool.
    Boolean,
    /// Nullable UTF-8 text.
    Utf8,
    /// Non-null list of `u16`.
    ListUInt16,
    /// Nullable list of `f32`.
    ListFloat32,
    /// Nullable list of bool.
    ListBoolean,
    /// Nullable list of `u8`.
    ListUInt8,
}

impl ColumnKind {
    fn data_type(self) -> DataType {
        let item = |dt: DataType| DataType::List(Arc::new(Field::new("item", dt, true)));
        match self {
            ColumnKind::UInt64 => DataType::UInt64,
            ColumnKind::UInt16 => DataType::UInt16,
            ColumnKind::Float64 => DataType::Float64,
            ColumnKind::Int64 => DataType::Int64,
            ColumnKind::Boolean => DataType::Boolean,
            ColumnKind::Utf8 => DataType::Utf8,
            ColumnKind::ListUInt16 => item(DataType::UInt16),
            ColumnKind::ListFloat32 => item(DataType::Float32),
            ColumnKind::ListBoolean => item(DataType::Boolean),
            ColumnKind::ListUInt8 => item(DataType::UInt8),
        }
    }

    fn nullable(self) -> bool {
        !matches!(
            self,
            ColumnKind::UInt64 | ColumnKind::UInt16 | ColumnKind::ListUInt16
        )
    }

    fn from_field_type(dtype: FieldType) -> Self {
        match dtype {
            FieldType::F64 => ColumnKind::Float64,
            FieldType::I64 => ColumnKind::Int64,
            FieldType::Bool => ColumnKind::Boolean,
        }
    }
}

/// Definition of one column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    /// Column name.
    pub name: String,
    /// Physical type.
    pub kind: ColumnKind,
    /// Unit, stored as Arrow field metadata.
    pub unit: &'static str,
    /// Description, stored as Arrow field metadata.
    pub description: &'static str,
}

impl ColumnDef {
    fn new(
        name: impl Into<String>,
        kind: ColumnKind,
        unit: &'static str,
        description: &'static str,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            unit,
            description,
        }
    }

    fn from_meta<C: Container>(meta: &FieldMeta) -> Self {
        Self::new(
            C::column_name(meta),
            ColumnKind::from_field_type(meta.dtype),
            meta.unit,
            meta.description,
        )
    }

    fn to_field(&self) -> Field {
        let mut metadata = HashMap::new();
        metadata.insert("unit".to_string(), self.unit.to_string());
        metadata.insert("description".to_string(), self.description.to_string());
        Field::new(&self.name, self.kind.data_type(), self.kind.nullable()).with_metadata(metadata)
    }
}

fn container_columns<C: Container>() -> impl Iterator<Item = ColumnDef> {
    C::fields().iter().map(ColumnDef::from_meta::<C>)
}

/// Tables of the columnar dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Table {
    /// Central trigger and pointing, one row per event.
    Trigger,
    /// Simulated shower truth.
    Shower,
    /// Calibrated images.
    Images,
    /// Image parameters.
    Parameters,
    /// Reconstructed direction.
    Geometry,
    /// Reconstructed energy.
    Energy,
    /// Particle classification.
    Classification,
}

impl Table {
    /// All tables in write order.
    pub const ALL: [Table; 7] = [
        Table::Trigger,
        Table::Shower,
        Table::Images,
        Table::Parameters,
        Table::Geometry,
        Table::Energy,
        Table::Classification,
    ];

    /// Hierarchical table name.
    pub fn name(self) -> &'static str {
        match self {
            Table::Trigger => "dl1/event/subarray/trigger",
            Table::Shower => "simulation/event/subarray/shower",
            Table::Images => "dl1/event/telescope/images",
            Table::Parameters => "dl1/event/telescope/parameters",
            Table::Geometry => "dl2/event/subarray/geometry",
            Table::Energy => "dl2/event/subarray/energy",
            Table::Classification => "dl2/event/subarray/classification",
        }
    }

    /// Inverse of [`Table::name`].
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.name() == name)
    }

    /// Parquet file of this table below a dataset root.
    pub fn file_path(self, root: &Path) -> PathBuf {
        root.join(format!("{}.parquet", self.name()))
    }

    /// Whether rows are per telescope.
    pub fn is_telescope(self) -> bool {
        matches!(self, Table::Images | Table::Parameters)
    }

    /// Event field group stored in this table, if any.
    pub fn data_field(self) -> Option<DataField> {
        match self {
            Table::Trigger | Table::Shower => None,
            Table::Images => Some(DataField::Dl1Image),
            Table::Parameters => Some(DataField::Dl1Parameters),
            Table::Geometry => Some(DataField::Dl2Geometry),
            Table::Energy => Some(DataField::Dl2Energy),
            Table::Classification => Some(DataField::Dl2Classification),
        }
    }

    /// Column definitions, index columns first.
    pub fn columns(self) -> Vec<ColumnDef> {
        let mut cols = vec![
            ColumnDef::new("obs_id", ColumnKind::UInt64, "", "Observation block id"),
            ColumnDef::new("event_id", ColumnKind::UInt64, "", "Event id"),
        ];
        if self.is_telescope() {
            cols.push(ColumnDef::new("tel_id", ColumnKind::UInt16, "", "Telescope id"));
        }
        match self {
            Table::Trigger => {
                cols.push(ColumnDef::new("time", ColumnKind::Float64, "s", "Trigger time (Unix)"));
                cols.push(ColumnDef::new("event_type", ColumnKind::Int64, "", "Trigger type code"));
                cols.push(ColumnDef::new(
                    "tels_with_trigger",
                    ColumnKind::ListUInt16,
                    "",
                    "Telescopes in the trigger",
                ));
                cols.extend(container_columns::<PointingInfo>());
                cols.push(ColumnDef::new(
                    "decode_error",
                    ColumnKind::Utf8,
                    "",
                    "Recoverable decode error of the event payload",
                ));
            }
            Table::Shower => cols.extend(container_columns::<SimulatedShower>()),
            Table::Images => {
                cols.push(ColumnDef::new(
                    "image",
                    ColumnKind::ListFloat32,
                    "p.e.",
                    "Calibrated charge",
                ));
                cols.push(ColumnDef::new(
                    "peak_time",
                    ColumnKind::ListFloat32,
                    "ns",
                    "Pulse time",
                ));
                cols.push(ColumnDef::new(
                    "image_mask",
                    ColumnKind::ListBoolean,
                    "",
                    "Cleaning mask",
                ));
                cols.push(ColumnDef::new(
                    "selected_gain_channel",
                    ColumnKind::ListUInt8,
                    "",
                    "Gain channel used per pixel",
                ));
            }
            Table::Parameters => {
                cols.extend(container_columns::<HillasParameters>());
                cols.extend(container_columns::<LeakageParameters>());
                cols.extend(container_columns::<MorphologyParameters>());
            }
            Table::Geometry => cols.extend(container_columns::<ReconstructedGeometry>()),
            Table::Energy => cols.extend(container_columns::<ReconstructedEnergy>()),
            Table::Classification => cols.extend(container_columns::<ParticleClassification>()),
        }
        cols
    }

    /// Arrow schema.
    pub fn schema(self) -> SchemaRef {
        let fields: Vec<Field> = self.columns().iter().map(ColumnDef::to_field).collect();
        Arc::new(Schema::new(fields))
    }
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Check that a file's schema carries every expected column with the
/// expected type. Returns the first problem found.
pub fn check_schema(table: Table, schema: &Schema) -> Result<(), String> {
    for col in table.columns() {
        match schema.field_with_name(&col.name) {
            Ok(field) if field.data_type() == &col.kind.data_type() => {}
            Ok(field) => {
                return Err(format!(
                    "column '{}' of {} has type {}, expected {}",
                    col.name,
                    table,
                    field.data_type(),
                    col.kind.data_type()
                ))
            }
            Err(_) => return Err(format!("table {} has no column '{}'", table, col.name)),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_names_roundtrip() {
        for table in Table::ALL {
            assert_eq!(Table::from_name(table.name()), Some(table));
        }
        assert_eq!(Table::from_name("dl3/whatever"), None);
    }

    #[test]
    fn test_schema_carries_units() {
        let schema = Table::Energy.schema();
        let field = schema.field_with_name("reco_energy").unwrap();
        assert_eq!(field.metadata().get("unit").map(String::as_str), Some("TeV"));
        assert_eq!(schema.field(0).name(), "obs_id");
        assert!(!schema.field(0).is_nullable());
    }

    #[test]
    fn test_telescope_tables_have_tel_id() {
        assert!(Table::Images.schema().field_with_name("tel_id").is_ok());
        assert!(Table::Energy.schema().field_with_name("tel_id").is_err());
    }

    #[test]
    fn test_check_schema_detects_missing_column() {
        assert!(check_schema(Table::Geometry, &Table::Geometry.schema()).is_ok());
        let err = check_schema(Table::Geometry, &Table::Energy.schema()).unwrap_err();
        assert!(err.contains("reco_alt"));
    }
}
