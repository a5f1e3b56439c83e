//! Buffered query results.
//!
//! A [`BufferedResult`] is the frozen product of a drain-all walk: the column
//! list resolved at call time plus every row the cursor produced.

use super::extract::{extract, to_map, RowMap};
use super::walker::{AsyncWalker, WalkEnd, Walker};
use super::{Column, ColumnSelection};
use crate::db::{AsyncCursor, Cursor, Row, Value};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::ops::ControlFlow;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// An immutable, fully drained result set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferedResult {
    columns: Vec<Column>,
    rows: Vec<Row>,
    end: WalkEnd,
    #[serde(with = "duration_serde")]
    execution_time: Duration,
}

impl BufferedResult {
    /// Creates a result from already materialized rows.
    pub fn with_data(columns: Vec<Column>, rows: Vec<Row>) -> Self {
        Self {
            columns,
            rows,
            end: WalkEnd::Exhausted,
            execution_time: Duration::ZERO,
        }
    }

    /// Column metadata fixed when the result was drained.
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Rows in cursor order.
    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Returns true if the result set is empty.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Time spent draining the cursor.
    pub fn execution_time(&self) -> Duration {
        self.execution_time
    }

    /// Why the drain ended.
    pub fn end(&self) -> WalkEnd {
        self.end
    }

    /// False if cancellation cut the drain short.
    pub fn is_complete(&self) -> bool {
        self.end == WalkEnd::Exhausted
    }

    /// Position of the named column in each row (case-insensitive).
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name == name)
            .or_else(|| {
                self.columns
                    .iter()
                    .position(|c| c.name.eq_ignore_ascii_case(name))
            })
    }

    /// Value of the named column in the given row.
    pub fn get(&self, row: usize, column: &str) -> Option<&Value> {
        let index = self.column_index(column)?;
        self.rows.get(row)?.get(index)
    }

    /// Consumes the result, returning its rows.
    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }

    /// Consumes the result, returning one name-keyed map per row.
    pub fn into_dictionaries(self) -> Vec<RowMap> {
        let columns = self.columns;
        self.rows
            .into_iter()
            .map(|row| to_map(&columns, row))
            .collect()
    }
}

/// Drains a synchronous cursor into a buffer using pre-resolved columns.
pub fn drain_to_buffer<C: Cursor + ?Sized>(
    cursor: &mut C,
    columns: Vec<Column>,
) -> Result<BufferedResult> {
    let start = Instant::now();
    let mut rows = Vec::new();
    let outcome = Walker::new(cursor).drive(|record| {
        rows.push(extract(record, &columns)?);
        Ok(ControlFlow::Continue(()))
    })?;

    Ok(BufferedResult {
        columns,
        rows,
        end: outcome.end,
        execution_time: start.elapsed(),
    })
}

/// Drains an asynchronous cursor into a buffer using pre-resolved columns.
///
/// A cancelled drain returns the rows read so far with `is_complete() == false`.
/// A cursor fault discards everything.
pub async fn drain_to_buffer_async<C: AsyncCursor + ?Sized>(
    cursor: &mut C,
    columns: Vec<Column>,
    cancel: Option<CancellationToken>,
) -> Result<BufferedResult> {
    let start = Instant::now();
    let mut rows = Vec::new();
    let outcome = AsyncWalker::new(cursor)
        .with_cancel(cancel)
        .drive(|record| {
            rows.push(extract(record, &columns)?);
            Ok(ControlFlow::Continue(()))
        })
        .await?;

    Ok(BufferedResult {
        columns,
        rows,
        end: outcome.end,
        execution_time: start.elapsed(),
    })
}

/// Resolves `selection` and drains the cursor.
pub fn retrieve<C: Cursor + ?Sized>(
    cursor: &mut C,
    selection: &ColumnSelection,
) -> Result<BufferedResult> {
    let columns = selection.resolve(&*cursor)?;
    drain_to_buffer(cursor, columns)
}

/// Resolves `selection` and drains the cursor asynchronously.
pub async fn retrieve_async<C: AsyncCursor + ?Sized>(
    cursor: &mut C,
    selection: &ColumnSelection,
    cancel: Option<CancellationToken>,
) -> Result<BufferedResult> {
    let columns = selection.resolve(&*cursor)?;
    drain_to_buffer_async(cursor, columns, cancel).await
}

/// Serde support for Duration (not natively supported by serde).
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_nanos().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let nanos = u128::deserialize(deserializer)?;
        u64::try_from(nanos)
            .map(Duration::from_nanos)
            .map_err(serde::de::Error::custom)
    }
}
