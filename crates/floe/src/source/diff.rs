//! Snapshot-diff change sources for files without a change log.
//!
//! Each poll hashes the whole file. An unchanged hash yields an empty batch.
//! A changed hash re-parses the file and compares every row against the
//! cached previous snapshot by key: new or changed rows become upserts and,
//! with `emit_deletes`, vanished keys become deletes. Without a usable
//! baseline (first run, expired cache, changed column set) the whole file is
//! emitted as upserts.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use snafu::ResultExt;
use tracing::{debug, info};
use xxhash_rust::xxh3::{Xxh3, xxh3_64};

use crate::batch::{ChangeBatch, ChangeRow, Column, ColumnType, TableSchema, Value};
use crate::error::{BlockingSnafu, CsvSnafu, ReadFileSnafu, SourceError};
use crate::watermark::Watermark;

use super::{ChangeSource, SourcePoll};

/// Parses one kind of snapshot file into rows.
pub trait SnapshotReader: Send + Sync + 'static {
    fn kind(&self) -> &'static str;

    fn path(&self) -> &Path;

    fn parse(&self, data: &[u8]) -> Result<(TableSchema, Vec<Vec<Value>>), SourceError>;
}

/// Delimited text with a header row. Every column is text; empty cells are null.
#[derive(Debug, Clone)]
pub struct CsvReader {
    path: PathBuf,
    delimiter: u8,
}

impl CsvReader {
    pub fn new(path: impl Into<PathBuf>, delimiter: u8) -> Self {
        Self {
            path: path.into(),
            delimiter,
        }
    }
}

impl SnapshotReader for CsvReader {
    fn kind(&self) -> &'static str {
        "csv_diff"
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn parse(&self, data: &[u8]) -> Result<(TableSchema, Vec<Vec<Value>>), SourceError> {
        let path = self.path.display().to_string();
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(self.delimiter)
            .has_headers(true)
            .from_reader(data);

        let headers = reader.headers().context(CsvSnafu { path: &path })?.clone();
        if headers.is_empty() {
            return Err(SourceError::MissingHeader { path });
        }
        let schema = TableSchema::new(
            headers
                .iter()
                .map(|h| Column::new(h.trim(), ColumnType::Utf8))
                .collect(),
        )?;

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.context(CsvSnafu { path: &path })?;
            rows.push(
                record
                    .iter()
                    .map(|cell| match cell {
                        "" => Value::Null,
                        text => Value::Utf8(text.to_string()),
                    })
                    .collect(),
            );
        }
        Ok((schema, rows))
    }
}

/// First worksheet (or the named one) of an xlsx/xls/xlsb/ods workbook.
///
/// The first row holds the column names. A column whose non-empty cells all
/// share one type keeps it; integer and float mixes become float; anything
/// else becomes text.
#[cfg(feature = "excel")]
#[derive(Debug, Clone)]
pub struct ExcelReader {
    path: PathBuf,
    sheet: Option<String>,
}

#[cfg(feature = "excel")]
impl ExcelReader {
    pub fn new(path: impl Into<PathBuf>, sheet: Option<String>) -> Self {
        Self {
            path: path.into(),
            sheet,
        }
    }

    fn cell(data: &calamine::Data) -> Value {
        use calamine::{Data, DataType};

        match data {
            Data::Empty | Data::Error(_) => Value::Null,
            Data::Int(v) => Value::Int64(*v),
            Data::Float(v) => Value::Float64(*v),
            Data::Bool(v) => Value::Boolean(*v),
            Data::String(v) if v.is_empty() => Value::Null,
            Data::String(v) | Data::DateTimeIso(v) | Data::DurationIso(v) => Value::Utf8(v.clone()),
            Data::DateTime(_) => match data.as_datetime() {
                Some(ts) => Value::from_datetime(ts),
                None => Value::Utf8(data.to_string()),
            },
        }
    }
}

/// Narrowest common type of a column's non-null values.
#[cfg(feature = "excel")]
fn unify(values: impl Iterator<Item = Option<ColumnType>>) -> ColumnType {
    let mut unified: Option<ColumnType> = None;
    for found in values.flatten() {
        unified = Some(match (unified, found) {
            (None, t) => t,
            (Some(a), b) if a == b => a,
            (Some(ColumnType::Int64), ColumnType::Float64)
            | (Some(ColumnType::Float64), ColumnType::Int64) => ColumnType::Float64,
            _ => return ColumnType::Utf8,
        });
    }
    unified.unwrap_or(ColumnType::Utf8)
}

#[cfg(feature = "excel")]
impl SnapshotReader for ExcelReader {
    fn kind(&self) -> &'static str {
        "excel_diff"
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn parse(&self, data: &[u8]) -> Result<(TableSchema, Vec<Vec<Value>>), SourceError> {
        use crate::error::ExcelSnafu;
        use calamine::{Reader, open_workbook_auto_from_rs};

        let path = self.path.display().to_string();
        let mut workbook = open_workbook_auto_from_rs(std::io::Cursor::new(data.to_vec()))
            .context(ExcelSnafu { path: &path })?;

        let sheet = match &self.sheet {
            Some(sheet) => sheet.clone(),
            None => workbook
                .sheet_names()
                .first()
                .cloned()
                .ok_or_else(|| SourceError::MissingSheet {
                    path: path.clone(),
                    sheet: "<first>".to_string(),
                })?,
        };
        if !workbook.sheet_names().contains(&sheet) {
            return Err(SourceError::MissingSheet { path, sheet });
        }
        let range = workbook
            .worksheet_range(&sheet)
            .context(ExcelSnafu { path: &path })?;

        let mut rows = range.rows();
        let header = rows
            .next()
            .ok_or_else(|| SourceError::MissingHeader { path: path.clone() })?;
        let names: Vec<String> = header
            .iter()
            .enumerate()
            .map(|(i, cell)| match cell.to_string().trim() {
                "" => format!("Column{}", i + 1),
                name => name.to_string(),
            })
            .collect();

        let raw: Vec<Vec<Value>> = rows
            .map(|row| {
                let mut values: Vec<Value> = row.iter().map(Self::cell).collect();
                values.resize(names.len(), Value::Null);
                values
            })
            .filter(|values| values.iter().any(|v| !v.is_null()))
            .collect();

        let types: Vec<ColumnType> = (0..names.len())
            .map(|i| unify(raw.iter().map(|row| row[i].column_type())))
            .collect();

        let schema = TableSchema::new(
            names
                .into_iter()
                .zip(&types)
                .map(|(name, data_type)| Column::new(name, *data_type))
                .collect(),
        )?;
        let rows = raw
            .into_iter()
            .map(|row| row.into_iter().zip(&types).map(|(v, t)| v.coerce(*t)).collect())
            .collect();
        Ok((schema, rows))
    }
}

#[derive(Debug, Clone)]
struct CachedRow {
    hash: u64,
    key: Vec<Value>,
}

/// A parsed snapshot reduced to per-key row hashes.
#[derive(Debug, Clone)]
pub struct CachedSnapshot {
    content_hash: String,
    schema: TableSchema,
    rows: HashMap<u128, CachedRow>,
    loaded_at: Instant,
}

impl CachedSnapshot {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Previous-snapshot state owned by one [`FileDiff`].
///
/// Holds the baseline that matches the last committed watermark plus the
/// snapshot staged by the latest poll. The staged snapshot only becomes the
/// baseline once a poll arrives carrying its hash as the watermark, so a
/// batch that failed to publish is diffed against the same baseline again.
/// Entries older than the TTL are dropped.
#[derive(Debug)]
pub struct SnapshotCache {
    ttl: Duration,
    baseline: Option<CachedSnapshot>,
    staged: Option<CachedSnapshot>,
}

impl SnapshotCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            baseline: None,
            staged: None,
        }
    }

    /// Snapshot matching `content_hash`, if it is cached and fresh.
    pub fn baseline(&mut self, content_hash: Option<&str>) -> Option<&CachedSnapshot> {
        let ttl = self.ttl;
        let fresh = |s: &CachedSnapshot| s.loaded_at.elapsed() <= ttl;
        self.baseline = self.baseline.take().filter(fresh);
        self.staged = self.staged.take().filter(fresh);

        let content_hash = content_hash?;
        if self
            .staged
            .as_ref()
            .is_some_and(|s| s.content_hash == content_hash)
        {
            self.baseline = self.staged.take();
        }
        self.baseline
            .as_ref()
            .filter(|s| s.content_hash == content_hash)
    }

    fn stage(&mut self, snapshot: CachedSnapshot) {
        self.staged = Some(snapshot);
    }

    pub fn clear(&mut self) {
        self.baseline = None;
        self.staged = None;
    }
}

fn key_hash(values: &[Value], key_indices: &[usize]) -> u128 {
    let mut hasher = Xxh3::new();
    for &i in key_indices {
        values[i].hash_into(&mut hasher);
    }
    hasher.digest128()
}

fn row_hash(values: &[Value]) -> u64 {
    let mut hasher = Xxh3::new();
    for value in values {
        value.hash_into(&mut hasher);
    }
    hasher.digest()
}

/// Diff `rows` against `previous`, returning the change rows and the new cache state.
fn diff_rows(
    schema: &TableSchema,
    rows: Vec<Vec<Value>>,
    key_indices: &[usize],
    previous: Option<&CachedSnapshot>,
    emit_deletes: bool,
) -> (Vec<ChangeRow>, HashMap<u128, CachedRow>) {
    let mut current = HashMap::with_capacity(rows.len());
    let mut changes = Vec::new();

    for values in rows {
        let key = key_hash(&values, key_indices);
        let hash = row_hash(&values);
        let changed = previous
            .and_then(|p| p.rows.get(&key))
            .is_none_or(|old| old.hash != hash);
        current.insert(
            key,
            CachedRow {
                hash,
                key: key_indices.iter().map(|&i| values[i].clone()).collect(),
            },
        );
        if changed {
            changes.push(ChangeRow::upsert(values));
        }
    }

    if emit_deletes && let Some(previous) = previous {
        let mut removed: Vec<&CachedRow> = previous
            .rows
            .iter()
            .filter(|(key, _)| !current.contains_key(*key))
            .map(|(_, row)| row)
            .collect();
        removed.sort_by_key(|row| row.key.iter().map(|v| v.to_string()).collect::<Vec<_>>());
        for row in removed {
            let mut values = vec![Value::Null; schema.len()];
            for (&i, v) in key_indices.iter().zip(&row.key) {
                values[i] = v.clone();
            }
            changes.push(ChangeRow::delete(values));
        }
    }

    (changes, current)
}

/// Change source over a snapshot file.
pub struct FileDiff<R> {
    reader: Arc<R>,
    key_columns: Vec<String>,
    cache: SnapshotCache,
    emit_deletes: bool,
}

impl<R: SnapshotReader> FileDiff<R> {
    pub fn new(reader: R, key_columns: Vec<String>, cache: SnapshotCache, emit_deletes: bool) -> Self {
        Self {
            reader: Arc::new(reader),
            key_columns,
            cache,
            emit_deletes,
        }
    }

    pub fn cache(&self) -> &SnapshotCache {
        &self.cache
    }

    async fn parse(&self, data: Vec<u8>) -> Result<(TableSchema, Vec<Vec<Value>>), SourceError> {
        let reader = self.reader.clone();
        tokio::task::spawn_blocking(move || reader.parse(&data))
            .await
            .context(BlockingSnafu)?
    }
}

#[async_trait]
impl<R: SnapshotReader> ChangeSource for FileDiff<R> {
    fn kind(&self) -> &'static str {
        self.reader.kind()
    }

    async fn poll(&mut self, watermark: Option<&Watermark>) -> Result<SourcePoll, SourceError> {
        let previous_hash = match watermark {
            None => None,
            Some(Watermark::ContentHash(hash)) => Some(hash.as_str()),
            Some(other) => {
                return Err(SourceError::UnsupportedWatermark {
                    found: other.to_string(),
                    source_kind: self.kind().to_string(),
                });
            }
        };

        let path = self.reader.path().to_path_buf();
        let data = tokio::fs::read(&path).await.context(ReadFileSnafu {
            path: path.display().to_string(),
        })?;
        let content_hash = format!("{:016x}", xxh3_64(&data));
        let unchanged = previous_hash == Some(content_hash.as_str());

        if unchanged && let Some(baseline) = self.cache.baseline(previous_hash) {
            debug!(path = %path.display(), "Snapshot unchanged");
            return Ok(SourcePoll {
                batch: ChangeBatch::empty(baseline.schema.clone()),
                watermark: Watermark::ContentHash(content_hash),
            });
        }

        let (schema, rows) = self.parse(data).await?;
        let key_indices = schema.key_indices(&self.key_columns)?;

        let previous = match self.cache.baseline(previous_hash) {
            Some(baseline) if baseline.schema == schema => Some(baseline),
            Some(_) => {
                info!(path = %path.display(), "Snapshot columns changed, emitting full table");
                None
            }
            None => None,
        };

        let (changes, current) = if unchanged {
            // Restarted on an already committed file: only rebuild the cache.
            let (_, current) = diff_rows(&schema, rows, &key_indices, None, false);
            (Vec::new(), current)
        } else {
            diff_rows(&schema, rows, &key_indices, previous, self.emit_deletes)
        };

        debug!(
            path = %path.display(),
            rows = current.len(),
            changes = changes.len(),
            full = previous.is_none(),
            "Snapshot diffed"
        );

        self.cache.stage(CachedSnapshot {
            content_hash: content_hash.clone(),
            schema: schema.clone(),
            rows: current,
            loaded_at: Instant::now(),
        });

        Ok(SourcePoll {
            batch: ChangeBatch::new(schema, changes),
            watermark: Watermark::ContentHash(content_hash),
        })
    }
}
