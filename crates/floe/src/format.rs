//! Parquet serialization of change batches.
//!
//! Output columns are the source columns in source order, then
//! `__rowOrdinal__` (int64) and `__rowMarker__` (int32, always last).
//! The first schema written for a table is locked; any later batch with a
//! different column set is a schema mismatch, never coerced.

use std::io::Write;
use std::sync::Arc;

use arrow::array::{
    ArrayRef, BinaryBuilder, BooleanBuilder, Date32Builder, Float64Builder, Int32Array,
    Int64Array, Int64Builder, RecordBatch, StringBuilder, TimestampMicrosecondBuilder,
};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use bytes::Bytes;
use parquet::arrow::ArrowWriter;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::basic::{Compression, GzipLevel, ZstdLevel};
use parquet::file::properties::WriterProperties;
use snafu::ResultExt;

use floe_core::ParquetCompression;

use crate::batch::{ChangeRow, Column, ColumnType, TableSchema, Value};
use crate::error::{ArrowSnafu, FormatError, ParquetSnafu};

pub const ROW_ORDINAL_COLUMN: &str = "__rowOrdinal__";
pub const ROW_MARKER_COLUMN: &str = "__rowMarker__";

const UTC: &str = "UTC";

fn arrow_type(data_type: ColumnType) -> DataType {
    match data_type {
        ColumnType::Boolean => DataType::Boolean,
        ColumnType::Int64 => DataType::Int64,
        ColumnType::Float64 => DataType::Float64,
        ColumnType::Utf8 => DataType::Utf8,
        ColumnType::Binary => DataType::Binary,
        ColumnType::Date => DataType::Date32,
        ColumnType::Timestamp => DataType::Timestamp(TimeUnit::Microsecond, Some(UTC.into())),
    }
}

/// Arrow schema of the data files written for `schema`.
///
/// Source columns are always nullable: delete rows only carry key values.
pub fn arrow_schema(schema: &TableSchema) -> SchemaRef {
    let fields = schema
        .columns()
        .iter()
        .map(|c| Field::new(&c.name, arrow_type(c.data_type), true))
        .chain([
            Field::new(ROW_ORDINAL_COLUMN, DataType::Int64, false),
            Field::new(ROW_MARKER_COLUMN, DataType::Int32, false),
        ]);
    Arc::new(Schema::new(fields.collect::<Vec<_>>()))
}

fn describe(schema: &Schema) -> String {
    schema
        .fields()
        .iter()
        .map(|f| format!("{}: {}", f.name(), f.data_type()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Same names, order and types. Nullability and metadata are ignored.
fn same_columns(a: &Schema, b: &Schema) -> bool {
    a.fields().len() == b.fields().len()
        && a
            .fields()
            .iter()
            .zip(b.fields().iter())
            .all(|(x, y)| x.name() == y.name() && x.data_type() == y.data_type())
}

fn writer_properties(compression: ParquetCompression) -> WriterProperties {
    let compression = match compression {
        ParquetCompression::Uncompressed => Compression::UNCOMPRESSED,
        ParquetCompression::Snappy => Compression::SNAPPY,
        ParquetCompression::Gzip => Compression::GZIP(GzipLevel::default()),
        ParquetCompression::Zstd => Compression::ZSTD(ZstdLevel::default()),
        ParquetCompression::Lz4 => Compression::LZ4,
    };
    WriterProperties::builder()
        .set_compression(compression)
        .build()
}

/// Serializes batches for one table and enforces schema stability.
#[derive(Debug)]
pub struct ParquetFormatWriter {
    compression: ParquetCompression,
    locked: Option<SchemaRef>,
}

impl ParquetFormatWriter {
    pub fn new(compression: ParquetCompression) -> Self {
        Self {
            compression,
            locked: None,
        }
    }

    pub fn locked_schema(&self) -> Option<&SchemaRef> {
        self.locked.as_ref()
    }

    /// Lock the table schema to that of an already published data file.
    pub fn seed_from_file(&mut self, data: Bytes) -> Result<(), FormatError> {
        let builder = ParquetRecordBatchReaderBuilder::try_new(data).context(ParquetSnafu)?;
        self.locked = Some(builder.schema().clone());
        Ok(())
    }

    /// Check `schema` against the locked schema, locking it on first use.
    pub fn lock(&mut self, schema: &TableSchema) -> Result<SchemaRef, FormatError> {
        let candidate = arrow_schema(schema);
        match &self.locked {
            Some(locked) if same_columns(locked, &candidate) => Ok(candidate),
            Some(locked) => Err(FormatError::SchemaMismatch {
                expected: describe(locked),
                found: describe(&candidate),
            }),
            None => {
                self.locked = Some(candidate.clone());
                Ok(candidate)
            }
        }
    }

    /// Write `rows` as one Parquet file into `out`. Returns the row count.
    ///
    /// `schema` must come from [`ParquetFormatWriter::lock`].
    pub fn serialize<W: Write + Send>(
        &self,
        table_schema: &TableSchema,
        schema: SchemaRef,
        rows: &[ChangeRow],
        first_ordinal: i64,
        out: W,
    ) -> Result<usize, FormatError> {
        let batch = record_batch(table_schema, schema.clone(), rows, first_ordinal)?;

        let mut writer = ArrowWriter::try_new(out, schema, Some(writer_properties(self.compression)))
            .context(ParquetSnafu)?;
        writer.write(&batch).context(ParquetSnafu)?;
        writer.close().context(ParquetSnafu)?;
        Ok(batch.num_rows())
    }
}

fn record_batch(
    table_schema: &TableSchema,
    schema: SchemaRef,
    rows: &[ChangeRow],
    first_ordinal: i64,
) -> Result<RecordBatch, FormatError> {
    let width = table_schema.len();
    if let Some((row, bad)) = rows.iter().enumerate().find(|(_, r)| r.values.len() != width) {
        return Err(FormatError::RowWidth {
            row,
            expected: width,
            found: bad.values.len(),
        });
    }

    let mut columns = table_schema
        .columns()
        .iter()
        .enumerate()
        .map(|(index, column)| build_column(column, index, rows))
        .collect::<Result<Vec<ArrayRef>, _>>()?;

    let count = rows.len() as i64;
    columns.push(Arc::new(Int64Array::from_iter_values(
        first_ordinal..first_ordinal + count,
    )));
    columns.push(Arc::new(Int32Array::from_iter_values(
        rows.iter().map(|r| r.marker.as_i32()),
    )));

    RecordBatch::try_new(schema, columns).context(ArrowSnafu)
}

fn mismatch(column: &Column, row: usize, found: &Value) -> FormatError {
    FormatError::ValueType {
        column: column.name.clone(),
        expected: column.data_type.to_string(),
        found: found
            .column_type()
            .map(|t| t.to_string())
            .unwrap_or_else(|| "null".to_string()),
        row,
    }
}

macro_rules! fill {
    ($builder:expr, $column:expr, $index:expr, $rows:expr, $variant:ident($v:ident) => $append:expr) => {{
        let mut builder = $builder;
        for (row, change) in $rows.iter().enumerate() {
            match &change.values[$index] {
                Value::Null => builder.append_null(),
                Value::$variant($v) => builder.append_value($append),
                other => return Err(mismatch($column, row, other)),
            }
        }
        Arc::new(builder.finish()) as ArrayRef
    }};
}

fn build_column(column: &Column, index: usize, rows: &[ChangeRow]) -> Result<ArrayRef, FormatError> {
    let n = rows.len();
    let array = match column.data_type {
        ColumnType::Boolean => {
            fill!(BooleanBuilder::with_capacity(n), column, index, rows, Boolean(v) => *v)
        }
        ColumnType::Int64 => {
            fill!(Int64Builder::with_capacity(n), column, index, rows, Int64(v) => *v)
        }
        ColumnType::Float64 => {
            fill!(Float64Builder::with_capacity(n), column, index, rows, Float64(v) => *v)
        }
        ColumnType::Utf8 => {
            fill!(StringBuilder::with_capacity(n, n * 16), column, index, rows, Utf8(v) => v)
        }
        ColumnType::Binary => {
            fill!(BinaryBuilder::with_capacity(n, n * 16), column, index, rows, Binary(v) => v)
        }
        ColumnType::Date => {
            fill!(Date32Builder::with_capacity(n), column, index, rows, Date(v) => *v)
        }
        ColumnType::Timestamp => fill!(
            TimestampMicrosecondBuilder::with_capacity(n).with_timezone(UTC),
            column, index, rows,
            Timestamp(v) => *v
        ),
    };
    Ok(array)
}

/// Read a published data file back into record batches.
pub fn read_data_file(data: Bytes) -> Result<(SchemaRef, Vec<RecordBatch>), FormatError> {
    let builder = ParquetRecordBatchReaderBuilder::try_new(data).context(ParquetSnafu)?;
    let schema = builder.schema().clone();
    let reader = builder.build().context(ParquetSnafu)?;
    let batches = reader
        .collect::<Result<Vec<_>, _>>()
        .context(ArrowSnafu)?;
    Ok((schema, batches))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{ChangeBatch, RowMarker};
    use arrow::array::{Array, AsArray};
    use arrow::datatypes::{Int32Type, Int64Type};

    fn customers() -> TableSchema {
        TableSchema::new(vec![
            Column::new("CustomerId", ColumnType::Int64),
            Column::new("Name", ColumnType::Utf8),
            Column::new("Active", ColumnType::Boolean),
            Column::new("Joined", ColumnType::Date),
            Column::new("UpdatedAt", ColumnType::Timestamp),
        ])
        .unwrap()
    }

    fn row(id: i64, name: &str) -> Vec<Value> {
        vec![
            Value::Int64(id),
            Value::Utf8(name.to_string()),
            Value::Boolean(id % 2 == 0),
            Value::Date(19_000),
            Value::Timestamp(1_700_000_000_000_000 + id),
        ]
    }

    fn write(writer: &mut ParquetFormatWriter, batch: &ChangeBatch, first: i64) -> Bytes {
        let schema = writer.lock(batch.schema()).unwrap();
        let mut buf = Vec::new();
        writer
            .serialize(batch.schema(), schema, batch.rows(), first, &mut buf)
            .unwrap();
        Bytes::from(buf)
    }

    #[test]
    fn test_read_back_preserves_rows_markers_and_order() {
        let mut writer = ParquetFormatWriter::new(ParquetCompression::Snappy);
        let batch = ChangeBatch::new(
            customers(),
            vec![
                ChangeRow::upsert(row(1, "Ada")),
                ChangeRow::upsert(row(2, "Grace")),
                ChangeRow::delete(vec![
                    Value::Int64(3),
                    Value::Null,
                    Value::Null,
                    Value::Null,
                    Value::Null,
                ]),
            ],
        );

        let (schema, batches) = read_data_file(write(&mut writer, &batch, 10)).unwrap();
        let names: Vec<_> = schema.fields().iter().map(|f| f.name().as_str()).collect();
        assert_eq!(
            names,
            vec!["CustomerId", "Name", "Active", "Joined", "UpdatedAt", ROW_ORDINAL_COLUMN, ROW_MARKER_COLUMN]
        );

        assert_eq!(batches.len(), 1);
        let out = &batches[0];
        assert_eq!(out.num_rows(), 3);

        let ids = out.column(0).as_primitive::<Int64Type>();
        assert_eq!(ids.values(), &[1, 2, 3]);
        let names = out.column(1).as_string::<i32>();
        assert_eq!(names.value(1), "Grace");
        assert!(names.is_null(2));

        let ordinals = out.column(5).as_primitive::<Int64Type>();
        assert_eq!(ordinals.values(), &[10, 11, 12]);
        let markers = out.column(6).as_primitive::<Int32Type>();
        assert_eq!(
            markers.values(),
            &[RowMarker::Upsert as i32, RowMarker::Upsert as i32, RowMarker::Delete as i32]
        );
    }

    #[test]
    fn test_schema_change_is_rejected() {
        let mut writer = ParquetFormatWriter::new(ParquetCompression::Zstd);
        writer.lock(&customers()).unwrap();

        let changed = TableSchema::new(vec![
            Column::new("CustomerId", ColumnType::Utf8),
            Column::new("Name", ColumnType::Utf8),
        ])
        .unwrap();
        let err = writer.lock(&changed).unwrap_err();
        assert!(matches!(err, FormatError::SchemaMismatch { .. }));
        assert!(err.to_string().contains("CustomerId: Int64"));
    }

    #[test]
    fn test_seeded_schema_accepts_same_columns() {
        let mut first = ParquetFormatWriter::new(ParquetCompression::Snappy);
        let batch = ChangeBatch::snapshot(customers(), vec![row(1, "Ada")]);
        let bytes = write(&mut first, &batch, 0);

        let mut restarted = ParquetFormatWriter::new(ParquetCompression::Snappy);
        assert!(restarted.locked_schema().is_none());
        restarted.seed_from_file(bytes).unwrap();
        assert_eq!(
            restarted.locked_schema().map(|s| s.fields().len()),
            first.locked_schema().map(|s| s.fields().len())
        );
        assert!(restarted.lock(&customers()).is_ok());

        let narrower = TableSchema::new(vec![Column::new("CustomerId", ColumnType::Int64)]).unwrap();
        assert!(restarted.lock(&narrower).is_err());
    }

    #[test]
    fn test_wrong_value_type_reported_with_row() {
        let mut writer = ParquetFormatWriter::new(ParquetCompression::Uncompressed);
        let schema = TableSchema::new(vec![Column::new("Id", ColumnType::Int64)]).unwrap();
        let arrow = writer.lock(&schema).unwrap();
        let rows = vec![
            ChangeRow::upsert(vec![Value::Int64(1)]),
            ChangeRow::upsert(vec![Value::Utf8("two".into())]),
        ];

        let err = writer
            .serialize(&schema, arrow, &rows, 0, Vec::new())
            .unwrap_err();
        assert!(matches!(err, FormatError::ValueType { row: 1, .. }));
    }

    #[test]
    fn test_row_width_checked() {
        let mut writer = ParquetFormatWriter::new(ParquetCompression::Snappy);
        let schema = TableSchema::new(vec![Column::new("Id", ColumnType::Int64)]).unwrap();
        let arrow = writer.lock(&schema).unwrap();
        let rows = vec![ChangeRow::upsert(vec![Value::Int64(1), Value::Int64(2)])];

        let err = writer
            .serialize(&schema, arrow, &rows, 0, Vec::new())
            .unwrap_err();
        assert!(matches!(err, FormatError::RowWidth { expected: 1, found: 2, .. }));
    }
}
