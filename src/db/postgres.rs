//! PostgreSQL provider implementation.
//!
//! Provides `PgProvider`, a [`CommandProvider`] backed by a sqlx pool, and
//! `PgCursor`, the forward-only cursor it returns. Rows are pumped from the
//! sqlx row stream by a background task into a one-slot channel so the cursor
//! itself owns no borrowed state.

use super::{AsyncCursor, CommandKind, CommandProvider, CommandSpec, DataRecord, Param, Value};
use crate::config::ConnectionConfig;
use crate::error::{Result, RowpipeError};
use async_trait::async_trait;
use futures::StreamExt;
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::types::chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use sqlx::types::{BigDecimal, JsonValue, Uuid};
use sqlx::{Column as SqlxColumn, Executor, Postgres, Row as SqlxRow, TypeInfo};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Maximum pooled connections per provider.
const MAX_CONNECTIONS: u32 = 5;

/// Time allowed to acquire a pooled connection.
const ACQUIRE_TIMEOUT_SECS: u64 = 10;

type RowMessage = std::result::Result<PgRow, sqlx::Error>;

/// PostgreSQL command provider.
#[derive(Debug, Clone)]
pub struct PgProvider {
    pool: PgPool,
}

impl PgProvider {
    /// Creates a provider from an existing connection pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects a new pool using the given configuration.
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        let conn_str = config.to_connection_string()?;

        let pool = PgPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .acquire_timeout(Duration::from_secs(ACQUIRE_TIMEOUT_SECS))
            .connect(&conn_str)
            .await
            .map_err(|e| map_connection_error(e, config))?;

        debug!("Connected to {}", config.display_string());
        Ok(Self { pool })
    }

    /// Closes the underlying pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Best-effort column names for a statement that produced no rows.
    async fn describe_columns(&self, sql: &str) -> Vec<(String, String)> {
        match (&self.pool).describe(sql).await {
            Ok(describe) => describe
                .columns()
                .iter()
                .map(|col| (col.name().to_string(), col.type_info().name().to_string()))
                .collect(),
            Err(e) => {
                debug!("Could not describe empty result: {e}");
                Vec::new()
            }
        }
    }
}

#[async_trait]
impl CommandProvider for PgProvider {
    type Cursor = PgCursor;

    async fn open_cursor(&self, command: &CommandSpec) -> Result<PgCursor> {
        let sql = command_sql(command);
        let params = command.params.clone();
        let pool = self.pool.clone();
        let (tx, mut rx) = mpsc::channel::<RowMessage>(1);

        let pump_sql = sql.clone();
        let pump = tokio::spawn(async move {
            let mut query = sqlx::query(&pump_sql);
            for param in &params {
                query = bind_param(query, param);
            }
            let mut rows = query.fetch(&pool);
            while let Some(row) = rows.next().await {
                let failed = row.is_err();
                if tx.send(row).await.is_err() || failed {
                    break;
                }
            }
        });

        // The first row is fetched eagerly so the schema is known before the
        // caller's first read.
        let first = tokio::time::timeout(command.timeout, rx.recv())
            .await
            .map_err(|_| {
                pump.abort();
                RowpipeError::cursor(format!(
                    "Query timed out after {} seconds",
                    command.timeout.as_secs()
                ))
            })?;

        let (pending, columns) = match first {
            Some(Ok(row)) => {
                let columns = row
                    .columns()
                    .iter()
                    .map(|col| (col.name().to_string(), col.type_info().name().to_string()))
                    .collect();
                (Some(row), columns)
            }
            Some(Err(e)) => return Err(RowpipeError::cursor(format_query_error(e))),
            None => (None, self.describe_columns(&sql).await),
        };

        let (names, types) = columns.into_iter().unzip();
        Ok(PgCursor {
            names,
            types,
            pending,
            current: None,
            started: false,
            rows: Some(rx),
            pump: Some(pump),
            timeout: command.timeout,
        })
    }

    async fn execute_non_query(&self, command: &CommandSpec) -> Result<u64> {
        let sql = command_sql(command);
        let mut query = sqlx::query(&sql);
        for param in &command.params {
            query = bind_param(query, param);
        }

        let result = tokio::time::timeout(command.timeout, query.execute(&self.pool))
            .await
            .map_err(|_| {
                RowpipeError::cursor(format!(
                    "Query timed out after {} seconds",
                    command.timeout.as_secs()
                ))
            })?
            .map_err(|e| RowpipeError::cursor(format_query_error(e)))?;

        Ok(result.rows_affected())
    }
}

/// Forward-only cursor over a PostgreSQL result set.
pub struct PgCursor {
    names: Vec<String>,
    types: Vec<String>,
    pending: Option<PgRow>,
    current: Option<PgRow>,
    started: bool,
    rows: Option<mpsc::Receiver<RowMessage>>,
    pump: Option<JoinHandle<()>>,
    timeout: Duration,
}

impl DataRecord for PgCursor {
    fn field_count(&self) -> usize {
        self.names.len()
    }

    fn name(&self, ordinal: usize) -> Result<&str> {
        self.names
            .get(ordinal)
            .map(String::as_str)
            .ok_or_else(|| RowpipeError::invalid_argument(format!("ordinal {ordinal} out of range")))
    }

    fn value(&self, ordinal: usize) -> Result<Value> {
        let row = self
            .current
            .as_ref()
            .ok_or_else(|| RowpipeError::cursor("cursor is not positioned on a row"))?;
        let type_name = self
            .types
            .get(ordinal)
            .ok_or_else(|| RowpipeError::cursor(format!("ordinal {ordinal} out of range")))?;
        convert_value(row, ordinal, type_name)
    }

    fn close(&mut self) {
        self.rows = None;
        self.pending = None;
        self.current = None;
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

#[async_trait]
impl AsyncCursor for PgCursor {
    async fn read_async(&mut self) -> Result<bool> {
        if !self.started {
            self.started = true;
            self.current = self.pending.take();
            return Ok(self.current.is_some());
        }

        let rows = self
            .rows
            .as_mut()
            .ok_or_else(|| RowpipeError::cursor("cursor is closed"))?;

        let next = tokio::time::timeout(self.timeout, rows.recv())
            .await
            .map_err(|_| {
                RowpipeError::cursor(format!(
                    "Read timed out after {} seconds",
                    self.timeout.as_secs()
                ))
            })?;

        match next {
            Some(Ok(row)) => {
                self.current = Some(row);
                Ok(true)
            }
            Some(Err(e)) => {
                self.current = None;
                warn!("Row stream failed: {e}");
                Err(RowpipeError::cursor(format_query_error(e)))
            }
            None => {
                self.current = None;
                Ok(false)
            }
        }
    }
}

impl Drop for PgCursor {
    fn drop(&mut self) {
        self.close();
    }
}

/// Builds the statement text, turning a stored procedure name into a CALL.
fn command_sql(command: &CommandSpec) -> String {
    match command.kind {
        CommandKind::Text => command.text.clone(),
        CommandKind::StoredProcedure => {
            let placeholders: Vec<String> =
                (1..=command.params.len()).map(|i| format!("${i}")).collect();
            format!("CALL {}({})", command.text, placeholders.join(", "))
        }
    }
}

/// Binds one parameter; NULLs are typed from the hint when one is given.
fn bind_param<'q>(
    query: Query<'q, Postgres, PgArguments>,
    param: &Param,
) -> Query<'q, Postgres, PgArguments> {
    match &param.value {
        Value::Null => match param.type_hint.as_deref().map(str::to_lowercase).as_deref() {
            Some("bool" | "boolean") => query.bind(None::<bool>),
            Some("int2" | "int4" | "int8" | "integer" | "bigint") => query.bind(None::<i64>),
            Some("float4" | "float8" | "real" | "double precision") => query.bind(None::<f64>),
            Some("bytea") => query.bind(None::<Vec<u8>>),
            _ => query.bind(None::<String>),
        },
        Value::Bool(b) => query.bind(*b),
        Value::Int(i) => query.bind(*i),
        Value::Float(f) => query.bind(*f),
        Value::String(s) => query.bind(s.clone()),
        Value::Bytes(b) => query.bind(b.clone()),
    }
}

/// Converts a single column value from a PgRow to our Value type.
///
/// Numeric, temporal, UUID and JSON columns are rendered as text. Types with
/// no decoding here are reported as a cursor fault rather than nulled.
fn convert_value(row: &PgRow, index: usize, type_name: &str) -> Result<Value> {
    let value = match type_name.to_uppercase().as_str() {
        "BOOL" | "BOOLEAN" => decode::<bool>(row, index)?.map(Value::Bool),
        "INT2" | "SMALLINT" => decode::<i16>(row, index)?.map(|v| Value::Int(v as i64)),
        "INT4" | "INT" | "INTEGER" => decode::<i32>(row, index)?.map(|v| Value::Int(v as i64)),
        "INT8" | "BIGINT" => decode::<i64>(row, index)?.map(Value::Int),
        "FLOAT4" | "REAL" => decode::<f32>(row, index)?.map(|v| Value::Float(v as f64)),
        "FLOAT8" | "DOUBLE PRECISION" => decode::<f64>(row, index)?.map(Value::Float),
        "BYTEA" => decode::<Vec<u8>>(row, index)?.map(Value::Bytes),

        "NUMERIC" | "DECIMAL" => decode::<BigDecimal>(row, index)?.map(|v| text(&v)),
        "TIMESTAMPTZ" => {
            decode::<DateTime<Utc>>(row, index)?.map(|v| Value::String(v.to_rfc3339()))
        }
        "TIMESTAMP" => decode::<NaiveDateTime>(row, index)?.map(|v| text(&v)),
        "DATE" => decode::<NaiveDate>(row, index)?.map(|v| text(&v)),
        "TIME" => decode::<NaiveTime>(row, index)?.map(|v| text(&v)),
        "UUID" => decode::<Uuid>(row, index)?.map(|v| text(&v)),
        "JSON" | "JSONB" => decode::<JsonValue>(row, index)?.map(|v| text(&v)),

        _ => decode::<String>(row, index)?.map(Value::String),
    };

    Ok(value.unwrap_or(Value::Null))
}

fn text(value: &impl std::fmt::Display) -> Value {
    Value::String(value.to_string())
}

fn decode<'r, T>(row: &'r PgRow, index: usize) -> Result<Option<T>>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get::<Option<T>, _>(index)
        .map_err(|e| RowpipeError::cursor(format!("Failed to decode column {index}: {e}")))
}

/// Maps sqlx connection errors to user-friendly messages.
fn map_connection_error(error: sqlx::Error, config: &ConnectionConfig) -> RowpipeError {
    let host = config.host.as_deref().unwrap_or("localhost");
    let port = config.port;
    let user = config.user.as_deref().unwrap_or("unknown");
    let database = config.database.as_deref().unwrap_or("unknown");

    let error_str = error.to_string().to_lowercase();

    if error_str.contains("connection refused") || error_str.contains("could not connect") {
        RowpipeError::connection(format!(
            "Cannot connect to {host}:{port}. Check that the server is running."
        ))
    } else if error_str.contains("password authentication failed")
        || error_str.contains("authentication failed")
    {
        RowpipeError::connection(format!(
            "Authentication failed for user '{user}'. Check your credentials."
        ))
    } else if error_str.contains("does not exist") && error_str.contains("database") {
        RowpipeError::connection(format!("Database '{database}' does not exist."))
    } else if error_str.contains("timed out") || error_str.contains("timeout") {
        RowpipeError::connection(format!(
            "Connection to {host}:{port} timed out. The server may be overloaded or unreachable."
        ))
    } else {
        RowpipeError::connection(error.to_string())
    }
}

/// Formats a query error with hints if available.
fn format_query_error(error: sqlx::Error) -> String {
    let Some(db_error) = error.as_database_error() else {
        return error.to_string();
    };

    let mut result = String::from("ERROR: ");
    result.push_str(db_error.message());

    if let Some(pg_error) = db_error.try_downcast_ref::<sqlx::postgres::PgDatabaseError>() {
        if let Some(detail) = pg_error.detail() {
            result.push_str("\n  DETAIL: ");
            result.push_str(detail);
        }
        if let Some(hint) = pg_error.hint() {
            result.push_str("\n  HINT: ");
            result.push_str(hint);
        }
        if let Some(column) = pg_error.column() {
            result.push_str("\n  COLUMN: ");
            result.push_str(column);
        }
    }

    result
}
