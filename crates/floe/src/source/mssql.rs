//! SQL Server client for [`SqlChangeTracking`](super::SqlChangeTracking).
//!
//! The configured key columns must be the table's primary key:
//! `CHANGETABLE(CHANGES ...)` only exposes primary-key columns.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use snafu::ResultExt;
use tiberius::error::Error as SqlError;
use tiberius::{Client, ColumnData, Config, FromSql, Row, ToSql};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, info};

use crate::batch::{ChangeBatch, ChangeRow, Column, ColumnType, TableSchema, Value};
use crate::error::{ConnectSnafu, ErrorKind, SourceError, SqlSnafu};

use super::sql::ChangeTrackingClient;

/// Login failed.
const LOGIN_FAILED: u32 = 18456;
/// Invalid object name.
const INVALID_OBJECT: u32 = 208;
/// Deadlock victim, then Azure SQL throttling and failover codes.
const RETRYABLE: [u32; 5] = [1205, 40197, 40501, 40613, 49918];

/// Map a driver error onto the writer's error taxonomy.
pub(crate) fn classify(e: &SqlError) -> ErrorKind {
    match e {
        SqlError::Server(token) if token.code() == LOGIN_FAILED => ErrorKind::SourceAuth,
        SqlError::Server(token) if token.code() == INVALID_OBJECT => ErrorKind::TableNotFound,
        SqlError::Server(token) if RETRYABLE.contains(&token.code()) => ErrorKind::TransientIo,
        SqlError::Io { .. } | SqlError::Tls(_) | SqlError::Routing { .. } => ErrorKind::TransientIo,
        _ => ErrorKind::Fatal,
    }
}

/// `[name]` with embedded `]` doubled.
pub fn quote_ident(name: &str) -> String {
    format!("[{}]", name.replace(']', "]]"))
}

fn column_type(data_type: &str) -> ColumnType {
    match data_type.to_ascii_lowercase().as_str() {
        "bit" => ColumnType::Boolean,
        "tinyint" | "smallint" | "int" | "bigint" => ColumnType::Int64,
        "real" | "float" | "decimal" | "numeric" | "money" | "smallmoney" => ColumnType::Float64,
        "date" => ColumnType::Date,
        "datetime" | "datetime2" | "smalldatetime" | "datetimeoffset" => ColumnType::Timestamp,
        "binary" | "varbinary" | "image" | "timestamp" | "rowversion" => ColumnType::Binary,
        _ => ColumnType::Utf8,
    }
}

fn cell(data: &ColumnData<'static>, target: ColumnType) -> Result<Value, SqlError> {
    let value = match (target, data) {
        (ColumnType::Boolean, _) => bool::from_sql(data)?.map(Value::Boolean),
        (ColumnType::Int64, ColumnData::U8(v)) => v.map(|v| Value::Int64(v.into())),
        (ColumnType::Int64, ColumnData::I16(v)) => v.map(|v| Value::Int64(v.into())),
        (ColumnType::Int64, ColumnData::I32(v)) => v.map(|v| Value::Int64(v.into())),
        (ColumnType::Int64, ColumnData::I64(v)) => v.map(Value::Int64),
        (ColumnType::Float64, ColumnData::F32(v)) => v.map(|v| Value::Float64(v.into())),
        (ColumnType::Float64, ColumnData::F64(v)) => v.map(Value::Float64),
        (ColumnType::Float64, ColumnData::Numeric(v)) => v.map(|n| {
            Value::Float64(n.value() as f64 / 10f64.powi(i32::from(n.scale())))
        }),
        (ColumnType::Date, _) => NaiveDate::from_sql(data)?.map(Value::from_date),
        (ColumnType::Timestamp, ColumnData::DateTimeOffset(_)) => DateTime::<Utc>::from_sql(data)?
            .map(|ts| Value::Timestamp(ts.timestamp_micros())),
        (ColumnType::Timestamp, _) => NaiveDateTime::from_sql(data)?.map(Value::from_datetime),
        (ColumnType::Binary, ColumnData::Binary(v)) => v.as_ref().map(|b| Value::Binary(b.to_vec())),
        (ColumnType::Utf8, ColumnData::String(v)) => v.as_ref().map(|s| Value::Utf8(s.to_string())),
        (ColumnType::Utf8, ColumnData::Guid(v)) => v.map(|g| Value::Utf8(g.to_string())),
        (ColumnType::Utf8, ColumnData::Xml(v)) => v.as_ref().map(|x| Value::Utf8((**x).to_string())),
        (ColumnType::Utf8, ColumnData::Time(_)) => {
            NaiveTime::from_sql(data)?.map(|t| Value::Utf8(t.to_string()))
        }
        _ => None,
    };
    Ok(value.unwrap_or(Value::Null))
}

/// One change-tracked table over a lazily (re)opened TDS connection.
pub struct MssqlClient {
    config: Config,
    client: Option<Client<Compat<TcpStream>>>,
    source_schema: String,
    source_table: String,
    key_columns: Vec<String>,
}

impl MssqlClient {
    /// `connection_string` is an ADO.NET string,
    /// e.g. `server=tcp:host,1433;database=Sales;user=...;password=...`.
    pub fn new(
        connection_string: &str,
        source_schema: impl Into<String>,
        source_table: impl Into<String>,
        key_columns: Vec<String>,
    ) -> Result<Self, SourceError> {
        let config = Config::from_ado_string(connection_string).context(SqlSnafu)?;
        Ok(Self {
            config,
            client: None,
            source_schema: source_schema.into(),
            source_table: source_table.into(),
            key_columns,
        })
    }

    fn qualified(&self) -> String {
        format!(
            "{}.{}",
            quote_ident(&self.source_schema),
            quote_ident(&self.source_table)
        )
    }

    async fn connection(&mut self) -> Result<&mut Client<Compat<TcpStream>>, SourceError> {
        let client = match self.client.take() {
            Some(client) => client,
            None => {
                let addr = self.config.get_addr();
                let tcp = TcpStream::connect(&addr)
                    .await
                    .context(ConnectSnafu { addr: addr.clone() })?;
                tcp.set_nodelay(true).context(ConnectSnafu { addr: addr.clone() })?;
                let client = Client::connect(self.config.clone(), tcp.compat_write())
                    .await
                    .context(SqlSnafu)?;
                info!(addr = %addr, table = %self.qualified(), "Connected to SQL Server");
                client
            }
        };
        Ok(self.client.insert(client))
    }

    /// Run `sql` and collect its first result set. A failed query drops the
    /// connection so the next poll starts on a fresh one.
    async fn query(&mut self, sql: &str, params: &[&dyn ToSql]) -> Result<Vec<Row>, SourceError> {
        let client = self.connection().await?;
        let result = match client.query(sql, params).await {
            Ok(stream) => stream.into_first_result().await,
            Err(e) => Err(e),
        };
        result.map_err(|source| {
            self.client = None;
            SourceError::Sql { source }
        })
    }

    async fn scalar(&mut self, sql: &str, params: &[&dyn ToSql]) -> Result<Option<i64>, SourceError> {
        let rows = self.query(sql, params).await?;
        match rows.first() {
            Some(row) => row.try_get::<i64, _>(0).context(SqlSnafu),
            None => Ok(None),
        }
    }

    async fn load_schema(&mut self) -> Result<TableSchema, SourceError> {
        let schema_name = self.source_schema.clone();
        let table_name = self.source_table.clone();
        let rows = self
            .query(
                "SELECT COLUMN_NAME, DATA_TYPE FROM INFORMATION_SCHEMA.COLUMNS \
                 WHERE TABLE_SCHEMA = @P1 AND TABLE_NAME = @P2 ORDER BY ORDINAL_POSITION",
                &[&schema_name, &table_name],
            )
            .await?;

        if rows.is_empty() {
            return Err(SourceError::SourceTableMissing {
                table: self.qualified(),
            });
        }

        let columns = rows
            .iter()
            .map(|row| {
                let name = row.try_get::<&str, _>(0).context(SqlSnafu)?.unwrap_or_default();
                let data_type = row.try_get::<&str, _>(1).context(SqlSnafu)?.unwrap_or_default();
                Ok(Column::new(name, column_type(data_type)))
            })
            .collect::<Result<Vec<_>, SourceError>>()?;
        let schema = TableSchema::new(columns)?;
        schema.key_indices(&self.key_columns)?;
        Ok(schema)
    }

    fn values(row: &Row, schema: &TableSchema) -> Result<Vec<Value>, SourceError> {
        row.cells()
            .zip(schema.columns())
            .map(|((_, data), column)| cell(data, column.data_type).context(SqlSnafu))
            .collect()
    }
}

#[async_trait]
impl ChangeTrackingClient for MssqlClient {
    fn table(&self) -> String {
        self.qualified()
    }

    async fn current_version(&mut self) -> Result<Option<i64>, SourceError> {
        self.scalar("SELECT CHANGE_TRACKING_CURRENT_VERSION()", &[])
            .await
    }

    async fn min_valid_version(&mut self) -> Result<Option<i64>, SourceError> {
        let object = self.qualified();
        self.scalar(
            "SELECT CHANGE_TRACKING_MIN_VALID_VERSION(OBJECT_ID(@P1))",
            &[&object],
        )
        .await
    }

    async fn snapshot(&mut self) -> Result<ChangeBatch, SourceError> {
        let schema = self.load_schema().await?;
        let select = schema
            .columns()
            .iter()
            .map(|c| quote_ident(&c.name))
            .collect::<Vec<_>>()
            .join(", ");
        let order = self
            .key_columns
            .iter()
            .map(|k| quote_ident(k))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!("SELECT {select} FROM {} ORDER BY {order}", self.qualified());

        let rows = self.query(&sql, &[]).await?;
        let values = rows
            .iter()
            .map(|row| Self::values(row, &schema))
            .collect::<Result<Vec<_>, _>>()?;
        debug!(table = %self.qualified(), rows = values.len(), "Snapshot extracted");
        Ok(ChangeBatch::snapshot(schema, values))
    }

    async fn changes_since(&mut self, version: i64) -> Result<ChangeBatch, SourceError> {
        let schema = self.load_schema().await?;
        let select = schema
            .columns()
            .iter()
            .map(|c| {
                let alias = if self.key_columns.contains(&c.name) { "CT" } else { "T" };
                format!("{alias}.{}", quote_ident(&c.name))
            })
            .collect::<Vec<_>>()
            .join(", ");
        let join = self
            .key_columns
            .iter()
            .map(|k| format!("T.{0} = CT.{0}", quote_ident(k)))
            .collect::<Vec<_>>()
            .join(" AND ");
        let sql = format!(
            "SELECT {select}, CT.SYS_CHANGE_OPERATION \
             FROM CHANGETABLE(CHANGES {table}, @P1) AS CT \
             LEFT JOIN {table} AS T ON {join} \
             ORDER BY CT.SYS_CHANGE_VERSION",
            table = self.qualified()
        );

        let rows = self.query(&sql, &[&version]).await?;
        let width = schema.len();
        let changes = rows
            .iter()
            .map(|row| {
                let values = Self::values(row, &schema)?;
                let operation = row.try_get::<&str, _>(width).context(SqlSnafu)?;
                Ok(match operation {
                    Some("D") => ChangeRow::delete(values),
                    _ => ChangeRow::upsert(values),
                })
            })
            .collect::<Result<Vec<_>, SourceError>>()?;
        debug!(table = %self.qualified(), version, rows = changes.len(), "Changes extracted");
        Ok(ChangeBatch::new(schema, changes))
    }
}
