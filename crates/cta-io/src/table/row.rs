//! Typed access to one row of a record batch.

use arrow::array::{Array, ArrayRef, AsArray};
use arrow::datatypes::{Float32Type, Float64Type, Int64Type, UInt16Type, UInt64Type, UInt8Type};
use arrow::record_batch::RecordBatch;
use cta_core::containers::{Container, FieldType, FieldValue};
use cta_core::EventIndex;

/// Borrowed view of one row.
#[derive(Debug, Clone, Copy)]
pub struct RowRef<'a> {
    batch: &'a RecordBatch,
    row: usize,
}

impl<'a> RowRef<'a> {
    /// View row `row` of `batch`.
    pub fn new(batch: &'a RecordBatch, row: usize) -> Self {
        Self { batch, row }
    }

    fn column(&self, name: &str) -> Result<&'a ArrayRef, String> {
        self.batch
            .column_by_name(name)
            .ok_or_else(|| format!("missing column '{name}'"))
    }

    fn mistyped(name: &str) -> String {
        format!("column '{name}' has an unexpected type")
    }

    /// Non-null `u64` column.
    pub fn u64(&self, name: &str) -> Result<u64, String> {
        let col = self.column(name)?;
        col.as_primitive_opt::<UInt64Type>()
            .map(|a| a.value(self.row))
            .ok_or_else(|| Self::mistyped(name))
    }

    /// Non-null `u16` column.
    pub fn u16(&self, name: &str) -> Result<u16, String> {
        let col = self.column(name)?;
        col.as_primitive_opt::<UInt16Type>()
            .map(|a| a.value(self.row))
            .ok_or_else(|| Self::mistyped(name))
    }

    /// `(obs_id, event_id)` of the row.
    pub fn index(&self) -> Result<EventIndex, String> {
        Ok(EventIndex::new(self.u64("obs_id")?, self.u64("event_id")?))
    }

    /// Nullable scalar column; null reads as missing.
    pub fn value(&self, name: &str, dtype: FieldType) -> Result<FieldValue, String> {
        let col = self.column(name)?;
        if col.is_null(self.row) {
            return Ok(FieldValue::missing(dtype));
        }
        let value = match dtype {
            FieldType::F64 => col
                .as_primitive_opt::<Float64Type>()
                .map(|a| FieldValue::F64(Some(a.value(self.row)))),
            FieldType::I64 => col
                .as_primitive_opt::<Int64Type>()
                .map(|a| FieldValue::I64(Some(a.value(self.row)))),
            FieldType::Bool => col
                .as_boolean_opt()
                .map(|a| FieldValue::Bool(Some(a.value(self.row)))),
        };
        value.ok_or_else(|| Self::mistyped(name))
    }

    /// Rebuild a scalar container from its prefixed columns.
    pub fn container<C: Container>(&self) -> Result<C, String> {
        let values = C::fields()
            .iter()
            .map(|f| self.value(&C::column_name(f), f.dtype))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(C::from_values(&values))
    }

    /// Nullable text column.
    pub fn text(&self, name: &str) -> Result<Option<String>, String> {
        let col = self.column(name)?;
        if col.is_null(self.row) {
            return Ok(None);
        }
        col.as_string_opt::<i32>()
            .map(|a| Some(a.value(self.row).to_string()))
            .ok_or_else(|| Self::mistyped(name))
    }

    fn list(&self, name: &str) -> Result<Option<ArrayRef>, String> {
        let col = self.column(name)?;
        if col.is_null(self.row) {
            return Ok(None);
        }
        col.as_list_opt::<i32>()
            .map(|a| Some(a.value(self.row)))
            .ok_or_else(|| Self::mistyped(name))
    }

    /// Non-null list of `u16`.
    pub fn list_u16(&self, name: &str) -> Result<Vec<u16>, String> {
        match self.list(name)? {
            Some(items) => items
                .as_primitive_opt::<UInt16Type>()
                .map(|a| a.values().to_vec())
                .ok_or_else(|| Self::mistyped(name)),
            None => Ok(Vec::new()),
        }
    }

    /// Nullable list of `f32`.
    pub fn list_f32(&self, name: &str) -> Result<Option<Vec<f32>>, String> {
        self.list(name)?
            .map(|items| {
                items
                    .as_primitive_opt::<Float32Type>()
                    .map(|a| a.values().to_vec())
                    .ok_or_else(|| Self::mistyped(name))
            })
            .transpose()
    }

    /// Nullable list of `u8`.
    pub fn list_u8(&self, name: &str) -> Result<Option<Vec<u8>>, String> {
        self.list(name)?
            .map(|items| {
                items
                    .as_primitive_opt::<UInt8Type>()
                    .map(|a| a.values().to_vec())
                    .ok_or_else(|| Self::mistyped(name))
            })
            .transpose()
    }

    /// Nullable list of bool.
    pub fn list_bool(&self, name: &str) -> Result<Option<Vec<bool>>, String> {
        self.list(name)?
            .map(|items| {
                items
                    .as_boolean_opt()
                    .map(|a| a.iter().map(|b| b.unwrap_or(false)).collect())
                    .ok_or_else(|| Self::mistyped(name))
            })
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::{Cell, Table, TableBuffer};
    use cta_core::containers::PointingInfo;

    #[test]
    fn test_trigger_row_roundtrip() {
        let mut buffer = TableBuffer::new(Table::Trigger);
        buffer
            .push_row(vec![
                Cell::U64(5),
                Cell::U64(11),
                Cell::Value(FieldValue::F64(Some(1.7e9))),
                Cell::Value(FieldValue::I64(Some(32))),
                Cell::ListU16(vec![1, 3]),
                Cell::Value(FieldValue::F64(Some(70.0))),
                Cell::Value(FieldValue::F64(None)),
                Cell::Text(Some("bad block".into())),
            ])
            .unwrap();
        let batch = buffer.take_batch().unwrap();
        let row = RowRef::new(&batch, 0);

        assert_eq!(row.index().unwrap(), EventIndex::new(5, 11));
        assert_eq!(row.list_u16("tels_with_trigger").unwrap(), vec![1, 3]);
        let pointing: PointingInfo = row.container().unwrap();
        assert_eq!(pointing.array_altitude, Some(70.0));
        assert_eq!(pointing.array_azimuth, None);
        assert_eq!(row.text("decode_error").unwrap().as_deref(), Some("bad block"));
        assert!(row.u64("nope").is_err());
        assert!(row.u16("obs_id").is_err());
    }
}
