//! Row-wise buffering of table output into Arrow record batches.

use std::sync::Arc;

use arrow::array::{
    ArrayRef, BooleanArray, BooleanBuilder, Float32Builder, Float64Array, Int64Array,
    ListBuilder, StringArray, UInt16Array, UInt16Builder, UInt64Array, UInt8Builder,
};
use arrow::datatypes::SchemaRef;
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use cta_core::containers::FieldValue;

use super::{ColumnKind, Table};

/// One value of a row, matching a [`ColumnKind`].
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    /// [`ColumnKind::UInt64`].
    U64(u64),
    /// [`ColumnKind::UInt16`].
    U16(u16),
    /// [`ColumnKind::Float64`], [`ColumnKind::Int64`] or [`ColumnKind::Boolean`].
    Value(FieldValue),
    /// [`ColumnKind::Utf8`].
    Text(Option<String>),
    /// [`ColumnKind::ListUInt16`].
    ListU16(Vec<u16>),
    /// [`ColumnKind::ListFloat32`].
    ListF32(Option<Vec<f32>>),
    /// [`ColumnKind::ListBoolean`].
    ListBool(Option<Vec<bool>>),
    /// [`ColumnKind::ListUInt8`].
    ListU8(Option<Vec<u8>>),
}

#[derive(Debug)]
enum ColumnData {
    U64(Vec<u64>),
    U16(Vec<u16>),
    F64(Vec<Option<f64>>),
    I64(Vec<Option<i64>>),
    Bool(Vec<Option<bool>>),
    Utf8(Vec<Option<String>>),
    ListU16(Vec<Vec<u16>>),
    ListF32(Vec<Option<Vec<f32>>>),
    ListBool(Vec<Option<Vec<bool>>>),
    ListU8(Vec<Option<Vec<u8>>>),
}

impl ColumnData {
    fn new(kind: ColumnKind) -> Self {
        match kind {
            ColumnKind::UInt64 => ColumnData::U64(Vec::new()),
            ColumnKind::UInt16 => ColumnData::U16(Vec::new()),
            ColumnKind::Float64 => ColumnData::F64(Vec::new()),
            ColumnKind::Int64 => ColumnData::I64(Vec::new()),
            ColumnKind::Boolean => ColumnData::Bool(Vec::new()),
            ColumnKind::Utf8 => ColumnData::Utf8(Vec::new()),
            ColumnKind::ListUInt16 => ColumnData::ListU16(Vec::new()),
            ColumnKind::ListFloat32 => ColumnData::ListF32(Vec::new()),
            ColumnKind::ListBoolean => ColumnData::ListBool(Vec::new()),
            ColumnKind::ListUInt8 => ColumnData::ListU8(Vec::new()),
        }
    }

    fn accepts(&self, cell: &Cell) -> bool {
        matches!(
            (self, cell),
            (ColumnData::U64(_), Cell::U64(_))
                | (ColumnData::U16(_), Cell::U16(_))
                | (ColumnData::F64(_), Cell::Value(FieldValue::F64(_)))
                | (ColumnData::I64(_), Cell::Value(FieldValue::I64(_)))
                | (ColumnData::Bool(_), Cell::Value(FieldValue::Bool(_)))
                | (ColumnData::Utf8(_), Cell::Text(_))
                | (ColumnData::ListU16(_), Cell::ListU16(_))
                | (ColumnData::ListF32(_), Cell::ListF32(_))
                | (ColumnData::ListBool(_), Cell::ListBool(_))
                | (ColumnData::ListU8(_), Cell::ListU8(_))
        )
    }

    fn push(&mut self, cell: Cell) {
        match (self, cell) {
            (ColumnData::U64(v), Cell::U64(x)) => v.push(x),
            (ColumnData::U16(v), Cell::U16(x)) => v.push(x),
            (ColumnData::F64(v), Cell::Value(FieldValue::F64(x))) => v.push(x),
            (ColumnData::I64(v), Cell::Value(FieldValue::I64(x))) => v.push(x),
            (ColumnData::Bool(v), Cell::Value(FieldValue::Bool(x))) => v.push(x),
            (ColumnData::Utf8(v), Cell::Text(x)) => v.push(x),
            (ColumnData::ListU16(v), Cell::ListU16(x)) => v.push(x),
            (ColumnData::ListF32(v), Cell::ListF32(x)) => v.push(x),
            (ColumnData::ListBool(v), Cell::ListBool(x)) => v.push(x),
            (ColumnData::ListU8(v), Cell::ListU8(x)) => v.push(x),
            // guarded by `accepts`
            _ => {}
        }
    }

    fn finish(&mut self) -> ArrayRef {
        match self {
            ColumnData::U64(v) => Arc::new(UInt64Array::from(std::mem::take(v))),
            ColumnData::U16(v) => Arc::new(UInt16Array::from(std::mem::take(v))),
            ColumnData::F64(v) => Arc::new(Float64Array::from(std::mem::take(v))),
            ColumnData::I64(v) => Arc::new(Int64Array::from(std::mem::take(v))),
            ColumnData::Bool(v) => Arc::new(BooleanArray::from(std::mem::take(v))),
            ColumnData::Utf8(v) => Arc::new(StringArray::from(std::mem::take(v))),
            ColumnData::ListU16(v) => {
                let mut builder = ListBuilder::new(UInt16Builder::new());
                for items in v.drain(..) {
                    builder.values().append_slice(&items);
                    builder.append(true);
                }
                Arc::new(builder.finish())
            }
            ColumnData::ListF32(v) => {
                let mut builder = ListBuilder::new(Float32Builder::new());
                for items in v.drain(..) {
                    match items {
                        Some(items) => {
                            builder.values().append_slice(&items);
                            builder.append(true);
                        }
                        None => builder.append(false),
                    }
                }
                Arc::new(builder.finish())
            }
            ColumnData::ListBool(v) => {
                let mut builder = ListBuilder::new(BooleanBuilder::new());
                for items in v.drain(..) {
                    match items {
                        Some(items) => {
                            builder.values().append_slice(&items);
                            builder.append(true);
                        }
                        None => builder.append(false),
                    }
                }
                Arc::new(builder.finish())
            }
            ColumnData::ListU8(v) => {
                let mut builder = ListBuilder::new(UInt8Builder::new());
                for items in v.drain(..) {
                    match items {
                        Some(items) => {
                            builder.values().append_slice(&items);
                            builder.append(true);
                        }
                        None => builder.append(false),
                    }
                }
                Arc::new(builder.finish())
            }
        }
    }
}

/// Column buffers of one table, drained into record batches.
#[derive(Debug)]
pub struct TableBuffer {
    table: Table,
    schema: SchemaRef,
    columns: Vec<ColumnData>,
    n_rows: usize,
}

impl TableBuffer {
    /// Empty buffer for `table`.
    pub fn new(table: Table) -> Self {
        Self {
            table,
            schema: table.schema(),
            columns: table
                .columns()
                .iter()
                .map(|c| ColumnData::new(c.kind))
                .collect(),
            n_rows: 0,
        }
    }

    /// Table this buffer belongs to.
    pub fn table(&self) -> Table {
        self.table
    }

    /// Buffered rows.
    pub fn len(&self) -> usize {
        self.n_rows
    }

    /// Whether no rows are buffered.
    pub fn is_empty(&self) -> bool {
        self.n_rows == 0
    }

    /// Append a row. The row is rejected as a whole if its length or any
    /// cell type does not match the table.
    pub fn push_row(&mut self, cells: Vec<Cell>) -> Result<(), String> {
        if cells.len() != self.columns.len() {
            return Err(format!(
                "row for {} has {} cells, expected {}",
                self.table,
                cells.len(),
                self.columns.len()
            ));
        }
        if let Some(i) = self
            .columns
            .iter()
            .zip(&cells)
            .position(|(col, cell)| !col.accepts(cell))
        {
            return Err(format!(
                "cell {:?} does not fit column '{}' of {}",
                cells[i],
                self.schema.field(i).name(),
                self.table
            ));
        }
        for (col, cell) in self.columns.iter_mut().zip(cells) {
            col.push(cell);
        }
        self.n_rows += 1;
        Ok(())
    }

    /// Drain buffered rows into a record batch.
    pub fn take_batch(&mut self) -> Result<RecordBatch, ArrowError> {
        let arrays: Vec<ArrayRef> = self.columns.iter_mut().map(ColumnData::finish).collect();
        self.n_rows = 0;
        RecordBatch::try_new(self.schema.clone(), arrays)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Array, AsArray};

    fn energy_row(event_id: u64, energy: Option<f64>) -> Vec<Cell> {
        vec![
            Cell::U64(1),
            Cell::U64(event_id),
            Cell::Value(FieldValue::F64(energy)),
            Cell::Value(FieldValue::F64(None)),
            Cell::Value(FieldValue::Bool(Some(energy.is_some()))),
        ]
    }

    #[test]
    fn test_batch_from_rows() {
        let mut buffer = TableBuffer::new(Table::Energy);
        buffer.push_row(energy_row(1, Some(1.5))).unwrap();
        buffer.push_row(energy_row(2, None)).unwrap();
        assert_eq!(buffer.len(), 2);

        let batch = buffer.take_batch().unwrap();
        assert!(buffer.is_empty());
        assert_eq!(batch.num_rows(), 2);
        let energy = batch.column_by_name("reco_energy").unwrap();
        assert!(energy.is_null(1));
        assert_eq!(
            energy.as_primitive::<arrow::datatypes::Float64Type>().value(0),
            1.5
        );
    }

    #[test]
    fn test_rejects_mistyped_row() {
        let mut buffer = TableBuffer::new(Table::Energy);
        let mut row = energy_row(1, Some(1.0));
        row[2] = Cell::Value(FieldValue::I64(Some(1)));
        let err = buffer.push_row(row).unwrap_err();
        assert!(err.contains("reco_energy"));
        assert!(buffer.is_empty());
        assert!(buffer.push_row(vec![Cell::U64(1)]).is_err());
    }

    #[test]
    fn test_list_columns() {
        let mut buffer = TableBuffer::new(Table::Images);
        buffer
            .push_row(vec![
                Cell::U64(1),
                Cell::U64(7),
                Cell::U16(3),
                Cell::ListF32(Some(vec![1.0, 2.0])),
                Cell::ListF32(None),
                Cell::ListBool(Some(vec![true, false])),
                Cell::ListU8(Some(vec![0, 1])),
            ])
            .unwrap();
        let batch = buffer.take_batch().unwrap();
        let peak_time = batch.column_by_name("peak_time").unwrap();
        assert!(peak_time.is_null(0));
        let image = batch.column_by_name("image").unwrap().as_list::<i32>().value(0);
        assert_eq!(image.len(), 2);
        let gains = batch
            .column_by_name("selected_gain_channel")
            .unwrap()
            .as_list::<i32>()
            .value(0);
        assert_eq!(
            gains.as_primitive::<arrow::datatypes::UInt8Type>().values().to_vec(),
            vec![0u8, 1]
        );
    }
}
