//! Streaming reads of one table file.

use std::fs::File;
use std::path::Path;

use arrow::record_batch::RecordBatch;
use cta_core::EventIndex;
use parquet::arrow::arrow_reader::{ParquetRecordBatchReader, ParquetRecordBatchReaderBuilder};
use parquet::arrow::ProjectionMask;

use super::{check_schema, RowRef, Table};

const BATCH_SIZE: usize = 1024;

/// Options for opening a table.
#[derive(Debug, Clone, Default)]
pub struct ReadOptions<'a> {
    /// Read only these columns (all when `None`).
    pub columns: Option<&'a [&'a str]>,
    /// Stop after this many rows.
    pub limit: Option<usize>,
}

/// Forward cursor over the rows of one table of a dataset.
pub struct TableReader {
    table: Table,
    reader: ParquetRecordBatchReader,
    n_rows: u64,
    batch: Option<RecordBatch>,
    row: usize,
}

impl std::fmt::Debug for TableReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableReader")
            .field("table", &self.table)
            .field("n_rows", &self.n_rows)
            .field("row", &self.row)
            .finish()
    }
}

impl TableReader {
    /// Open `table` below the dataset `root`. The full schema is checked
    /// against the table layout before any projection is applied.
    pub fn open(root: &Path, table: Table, options: ReadOptions<'_>) -> Result<Self, String> {
        let path = table.file_path(root);
        let file = File::open(&path).map_err(|e| format!("{}: {e}", path.display()))?;
        let mut builder = ParquetRecordBatchReaderBuilder::try_new(file)
            .map_err(|e| format!("{}: {e}", path.display()))?
            .with_batch_size(BATCH_SIZE);

        check_schema(table, builder.schema())?;
        let n_rows = u64::try_from(builder.metadata().file_metadata().num_rows()).unwrap_or(0);

        if let Some(columns) = options.columns {
            let schema = builder.schema().clone();
            let indices: Vec<usize> = columns
                .iter()
                .filter_map(|name| schema.index_of(name).ok())
                .collect();
            let mask = ProjectionMask::roots(builder.parquet_schema(), indices);
            builder = builder.with_projection(mask);
        }
        if let Some(limit) = options.limit {
            builder = builder.with_limit(limit);
        }

        let reader = builder
            .build()
            .map_err(|e| format!("{}: {e}", path.display()))?;
        Ok(Self {
            table,
            reader,
            n_rows,
            batch: None,
            row: 0,
        })
    }

    /// Table being read.
    pub fn table(&self) -> Table {
        self.table
    }

    /// Rows in the file (ignoring any limit).
    pub fn n_rows(&self) -> u64 {
        self.n_rows
    }

    /// Make sure a row is available. `false` at the end of the table.
    fn fill(&mut self) -> Result<bool, String> {
        loop {
            if let Some(batch) = &self.batch {
                if self.row < batch.num_rows() {
                    return Ok(true);
                }
            }
            match self.reader.next() {
                Some(Ok(batch)) => {
                    self.batch = Some(batch);
                    self.row = 0;
                }
                Some(Err(e)) => return Err(format!("{}: {e}", self.table)),
                None => {
                    self.batch = None;
                    return Ok(false);
                }
            }
        }
    }

    /// Visit the next row, if any.
    pub fn next_row<T>(
        &mut self,
        visit: impl FnOnce(RowRef<'_>) -> Result<T, String>,
    ) -> Result<Option<T>, String> {
        if !self.fill()? {
            return Ok(None);
        }
        let Some(batch) = &self.batch else {
            return Ok(None);
        };
        let value = visit(RowRef::new(batch, self.row))?;
        self.row += 1;
        Ok(Some(value))
    }

    /// Visit every consecutive row keyed by `index`, starting at the current
    /// position. Rows of a table are stored in the same event order as the
    /// trigger table, so the run of matching rows ends at the first row with
    /// another key.
    pub fn rows_for(
        &mut self,
        index: EventIndex,
        mut visit: impl FnMut(RowRef<'_>) -> Result<(), String>,
    ) -> Result<(), String> {
        while self.fill()? {
            let Some(batch) = &self.batch else {
                break;
            };
            let row = RowRef::new(batch, self.row);
            if row.index()? != index {
                break;
            }
            visit(row)?;
            self.row += 1;
        }
        Ok(())
    }

    /// Next batch of rows not yet visited.
    pub fn next_batch(&mut self) -> Result<Option<RecordBatch>, String> {
        if let Some(batch) = self.batch.take() {
            let row = std::mem::take(&mut self.row);
            if row < batch.num_rows() {
                return Ok(Some(batch.slice(row, batch.num_rows() - row)));
            }
        }
        match self.reader.next() {
            Some(Ok(batch)) => Ok(Some(batch)),
            Some(Err(e)) => Err(format!("{}: {e}", self.table)),
            None => Ok(None),
        }
    }

    /// Drain the remaining batches.
    pub fn into_batches(mut self) -> Result<Vec<RecordBatch>, String> {
        let mut batches = Vec::new();
        while let Some(batch) = self.next_batch()? {
            batches.push(batch);
        }
        Ok(batches)
    }
}

/// Read every `EventIndex` of a table, touching only the index columns.
pub fn read_index(root: &Path, table: Table) -> Result<Vec<EventIndex>, String> {
    let options = ReadOptions {
        columns: Some(&["obs_id", "event_id"]),
        limit: None,
    };
    let mut reader = TableReader::open(root, table, options)?;
    let mut out = Vec::with_capacity(reader.n_rows() as usize);
    while let Some(index) = reader.next_row(|row| row.index())? {
        out.push(index);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{DatasetMetadata, DatasetWriter, TableCompression};
    use crate::table::{Cell, TableBuffer};
    use cta_core::containers::FieldValue;
    use cta_core::SubarrayDescription;

    fn energy_rows(ids: &[u64]) -> RecordBatch {
        let mut buffer = TableBuffer::new(Table::Energy);
        for &id in ids {
            buffer
                .push_row(vec![
                    Cell::U64(1),
                    Cell::U64(id),
                    Cell::Value(FieldValue::F64(Some(id as f64))),
                    Cell::Value(FieldValue::F64(None)),
                    Cell::Value(FieldValue::Bool(Some(true))),
                ])
                .unwrap();
        }
        buffer.take_batch().unwrap()
    }

    fn dataset(dir: &Path) -> std::path::PathBuf {
        let output = dir.join("d.dl2");
        let tables = [Table::Energy];
        let mut writer =
            DatasetWriter::create(&output, false, TableCompression::None, &tables).unwrap();
        writer.write_batch(Table::Energy, &energy_rows(&[1, 2, 2, 5])).unwrap();
        writer
            .finish(DatasetMetadata::new(SubarrayDescription::new("t"), vec![1], false))
            .unwrap()
    }

    #[test]
    fn test_rows_for_groups_consecutive_keys() {
        let dir = tempfile::tempdir().unwrap();
        let root = dataset(dir.path());
        let mut reader = TableReader::open(&root, Table::Energy, ReadOptions::default()).unwrap();
        assert_eq!(reader.n_rows(), 4);

        let mut seen = Vec::new();
        for id in [1, 2, 3, 5] {
            reader
                .rows_for(EventIndex::new(1, id), |row| {
                    seen.push(row.u64("event_id")?);
                    Ok(())
                })
                .unwrap();
        }
        assert_eq!(seen, vec![1, 2, 2, 5]);
    }

    #[test]
    fn test_index_projection_and_limit() {
        let dir = tempfile::tempdir().unwrap();
        let root = dataset(dir.path());
        let ids: Vec<u64> = read_index(&root, Table::Energy)
            .unwrap()
            .iter()
            .map(|i| i.event_id)
            .collect();
        assert_eq!(ids, vec![1, 2, 2, 5]);

        let options = ReadOptions {
            columns: None,
            limit: Some(2),
        };
        let batches = TableReader::open(&root, Table::Energy, options)
            .unwrap()
            .into_batches()
            .unwrap();
        assert_eq!(batches.iter().map(RecordBatch::num_rows).sum::<usize>(), 2);
    }

    #[test]
    fn test_schema_mismatch_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let root = dataset(dir.path());
        std::fs::create_dir_all(Table::Geometry.file_path(&root).parent().unwrap()).unwrap();
        std::fs::copy(Table::Energy.file_path(&root), Table::Geometry.file_path(&root)).unwrap();
        let err = TableReader::open(&root, Table::Geometry, ReadOptions::default()).unwrap_err();
        assert!(err.contains("reco_alt"));
    }
}
