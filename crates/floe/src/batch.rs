//! In-memory change sets handed from a source to the format writer.

use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime};

use crate::error::SourceError;

/// Column types a source can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    Boolean,
    Int64,
    Float64,
    Utf8,
    Binary,
    Date,
    /// Microseconds since the Unix epoch, UTC.
    Timestamp,
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ColumnType::Boolean => "boolean",
            ColumnType::Int64 => "int64",
            ColumnType::Float64 => "float64",
            ColumnType::Utf8 => "utf8",
            ColumnType::Binary => "binary",
            ColumnType::Date => "date",
            ColumnType::Timestamp => "timestamp",
        };
        f.write_str(name)
    }
}

/// A single cell.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    Int64(i64),
    Float64(f64),
    Utf8(String),
    Binary(Vec<u8>),
    /// Days since the Unix epoch.
    Date(i32),
    /// Microseconds since the Unix epoch, UTC.
    Timestamp(i64),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// The column type this value naturally belongs to; `None` for null.
    pub fn column_type(&self) -> Option<ColumnType> {
        match self {
            Value::Null => None,
            Value::Boolean(_) => Some(ColumnType::Boolean),
            Value::Int64(_) => Some(ColumnType::Int64),
            Value::Float64(_) => Some(ColumnType::Float64),
            Value::Utf8(_) => Some(ColumnType::Utf8),
            Value::Binary(_) => Some(ColumnType::Binary),
            Value::Date(_) => Some(ColumnType::Date),
            Value::Timestamp(_) => Some(ColumnType::Timestamp),
        }
    }

    pub fn from_date(date: NaiveDate) -> Self {
        Value::Date(date.signed_duration_since(NaiveDate::default()).num_days() as i32)
    }

    pub fn from_datetime(datetime: NaiveDateTime) -> Self {
        Value::Timestamp(datetime.and_utc().timestamp_micros())
    }

    /// Convert to `target`, widening ints to floats and rendering anything
    /// else as text. Used when a loosely typed source mixes cell types.
    pub fn coerce(self, target: ColumnType) -> Value {
        match (self, target) {
            (Value::Null, _) => Value::Null,
            (Value::Int64(v), ColumnType::Float64) => Value::Float64(v as f64),
            (value, target) if value.column_type() == Some(target) => value,
            (value, ColumnType::Utf8) => Value::Utf8(value.to_string()),
            (_, _) => Value::Null,
        }
    }

    /// Bytes fed to the row and key hashes of diff sources.
    pub(crate) fn hash_into(&self, hasher: &mut xxhash_rust::xxh3::Xxh3) {
        match self {
            Value::Null => hasher.update(&[0]),
            Value::Boolean(v) => hasher.update(&[1, *v as u8]),
            Value::Int64(v) => {
                hasher.update(&[2]);
                hasher.update(&v.to_le_bytes());
            }
            Value::Float64(v) => {
                hasher.update(&[3]);
                hasher.update(&v.to_bits().to_le_bytes());
            }
            Value::Utf8(v) => {
                hasher.update(&[4]);
                hasher.update(&(v.len() as u64).to_le_bytes());
                hasher.update(v.as_bytes());
            }
            Value::Binary(v) => {
                hasher.update(&[5]);
                hasher.update(&(v.len() as u64).to_le_bytes());
                hasher.update(v);
            }
            Value::Date(v) => {
                hasher.update(&[6]);
                hasher.update(&v.to_le_bytes());
            }
            Value::Timestamp(v) => {
                hasher.update(&[7]);
                hasher.update(&v.to_le_bytes());
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Boolean(v) => write!(f, "{v}"),
            Value::Int64(v) => write!(f, "{v}"),
            Value::Float64(v) => write!(f, "{v}"),
            Value::Utf8(v) => f.write_str(v),
            Value::Binary(v) => v.iter().try_for_each(|b| write!(f, "{b:02x}")),
            Value::Date(days) => match NaiveDate::default().checked_add_signed(chrono::Duration::days(*days as i64)) {
                Some(date) => write!(f, "{date}"),
                None => write!(f, "{days}"),
            },
            Value::Timestamp(micros) => match DateTime::from_timestamp_micros(*micros) {
                Some(ts) => write!(f, "{}", ts.naive_utc()),
                None => write!(f, "{micros}"),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Column {
    pub name: String,
    pub data_type: ColumnType,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            data_type,
        }
    }
}

/// Ordered source columns.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct TableSchema {
    columns: Vec<Column>,
}

impl TableSchema {
    /// Fails on duplicate column names.
    pub fn new(columns: Vec<Column>) -> Result<Self, SourceError> {
        for (i, column) in columns.iter().enumerate() {
            if columns[..i].iter().any(|c| c.name == column.name) {
                return Err(SourceError::DuplicateColumn {
                    column: column.name.clone(),
                });
            }
        }
        Ok(Self { columns })
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Positions of `keys`, failing on the first one the source lacks.
    pub fn key_indices(&self, keys: &[String]) -> Result<Vec<usize>, SourceError> {
        keys.iter()
            .map(|key| {
                self.index_of(key).ok_or_else(|| SourceError::MissingKeyColumn {
                    column: key.clone(),
                })
            })
            .collect()
    }
}

impl fmt::Display for TableSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for column in &self.columns {
            if !first {
                f.write_str(", ")?;
            }
            first = false;
            write!(f, "{}: {}", column.name, column.data_type)?;
        }
        Ok(())
    }
}

/// Mirroring row marker stored in `__rowMarker__`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum RowMarker {
    Upsert = 1,
    Delete = 2,
}

impl RowMarker {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RowMarker::Upsert => "upsert",
            RowMarker::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRow {
    pub marker: RowMarker,
    pub values: Vec<Value>,
}

impl ChangeRow {
    pub fn upsert(values: Vec<Value>) -> Self {
        Self {
            marker: RowMarker::Upsert,
            values,
        }
    }

    pub fn delete(values: Vec<Value>) -> Self {
        Self {
            marker: RowMarker::Delete,
            values,
        }
    }
}

/// Rows captured by one poll of one table, in capture order.
///
/// The row ordinal written to data files is the row's position in the batch,
/// so it increases monotonically across every file the batch is split into.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChangeBatch {
    schema: TableSchema,
    rows: Vec<ChangeRow>,
}

impl ChangeBatch {
    pub fn new(schema: TableSchema, rows: Vec<ChangeRow>) -> Self {
        Self { schema, rows }
    }

    pub fn empty(schema: TableSchema) -> Self {
        Self::new(schema, Vec::new())
    }

    /// Every row tagged as an upsert; used for full extracts.
    pub fn snapshot(schema: TableSchema, rows: Vec<Vec<Value>>) -> Self {
        Self::new(schema, rows.into_iter().map(ChangeRow::upsert).collect())
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    pub fn rows(&self) -> &[ChangeRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn count(&self, marker: RowMarker) -> usize {
        self.rows.iter().filter(|r| r.marker == marker).count()
    }

    /// Consecutive slices of at most `max_rows`, each with the ordinal of its
    /// first row.
    pub fn chunks(&self, max_rows: usize) -> impl Iterator<Item = (i64, &[ChangeRow])> {
        self.rows
            .chunks(max_rows.max(1))
            .scan(0i64, |ordinal, chunk| {
                let first = *ordinal;
                *ordinal += chunk.len() as i64;
                Some((first, chunk))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> TableSchema {
        TableSchema::new(vec![
            Column::new("CustomerId", ColumnType::Int64),
            Column::new("Name", ColumnType::Utf8),
        ])
        .unwrap()
    }

    #[test]
    fn test_duplicate_columns_rejected() {
        let err = TableSchema::new(vec![
            Column::new("Id", ColumnType::Int64),
            Column::new("Id", ColumnType::Utf8),
        ])
        .unwrap_err();
        assert!(matches!(err, SourceError::DuplicateColumn { column } if column == "Id"));
    }

    #[test]
    fn test_key_indices() {
        let schema = schema();
        assert_eq!(schema.key_indices(&["Name".into()]).unwrap(), vec![1]);
        let err = schema.key_indices(&["Email".into()]).unwrap_err();
        assert!(matches!(err, SourceError::MissingKeyColumn { .. }));
    }

    #[test]
    fn test_chunks_carry_ordinals() {
        let rows = (0..5)
            .map(|i| vec![Value::Int64(i), Value::Utf8(format!("c{i}"))])
            .collect();
        let batch = ChangeBatch::snapshot(schema(), rows);

        let chunks: Vec<_> = batch.chunks(2).map(|(ord, rows)| (ord, rows.len())).collect();
        assert_eq!(chunks, vec![(0, 2), (2, 2), (4, 1)]);
    }

    #[test]
    fn test_coerce() {
        assert_eq!(Value::Int64(3).coerce(ColumnType::Float64), Value::Float64(3.0));
        assert_eq!(Value::Boolean(true).coerce(ColumnType::Utf8), Value::Utf8("true".into()));
        assert_eq!(Value::Utf8("x".into()).coerce(ColumnType::Utf8), Value::Utf8("x".into()));
        assert_eq!(Value::Null.coerce(ColumnType::Int64), Value::Null);
    }

    #[test]
    fn test_date_and_timestamp_values() {
        let date = NaiveDate::from_ymd_opt(1970, 1, 11).unwrap();
        assert_eq!(Value::from_date(date), Value::Date(10));
        assert_eq!(Value::Date(10).to_string(), "1970-01-11");

        let ts = date.and_hms_opt(0, 0, 1).unwrap();
        assert_eq!(Value::from_datetime(ts), Value::Timestamp(10 * 86_400_000_000 + 1_000_000));
    }

    #[test]
    fn test_schema_display() {
        assert_eq!(schema().to_string(), "CustomerId: int64, Name: utf8");
    }
}
