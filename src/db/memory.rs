//! In-memory data source.
//!
//! Provides a scripted cursor and provider used by tests and by the
//! `--mock-db` flag. Read and close calls are counted so callers can verify
//! exactly how far a walk advanced the cursor.

use super::{AsyncCursor, CommandProvider, CommandSpec, Cursor, DataRecord, Row, Value};
use crate::error::{Result, RowpipeError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A scripted result set.
#[derive(Debug, Clone, Default)]
pub struct MemoryResult {
    columns: Vec<String>,
    rows: Vec<Row>,
    /// 1-based read call that fails with a cursor fault.
    fault_on_read: Option<usize>,
    /// Delay applied before each asynchronous read.
    read_delay: Option<Duration>,
}

impl MemoryResult {
    /// Creates an empty result set with the given column names.
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Appends a row.
    pub fn with_row(mut self, row: Row) -> Self {
        self.rows.push(row);
        self
    }

    /// Appends several rows.
    pub fn with_rows(mut self, rows: impl IntoIterator<Item = Row>) -> Self {
        self.rows.extend(rows);
        self
    }

    /// Makes the `n`th read call (1-based) fail.
    pub fn fail_on_read(mut self, n: usize) -> Self {
        self.fault_on_read = Some(n);
        self
    }

    /// Delays every asynchronous read.
    pub fn with_read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = Some(delay);
        self
    }

    /// Number of rows in the script.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns true if the script has no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Counters shared between a provider and the cursors it opens.
#[derive(Debug, Default)]
pub struct CursorStats {
    reads: AtomicUsize,
    closes: AtomicUsize,
    opened: AtomicUsize,
}

impl CursorStats {
    /// Number of read calls made, including the final one that reported exhaustion.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Number of cursors that have been closed (each counted once).
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Number of cursors opened.
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

/// A forward-only cursor over a [`MemoryResult`].
#[derive(Debug)]
pub struct MemoryCursor {
    result: MemoryResult,
    /// Index of the current row; `None` before the first read.
    position: Option<usize>,
    closed: bool,
    stats: Arc<CursorStats>,
}

impl MemoryCursor {
    /// Creates a cursor with its own counters.
    pub fn new(result: MemoryResult) -> Self {
        Self::with_stats(result, Arc::new(CursorStats::default()))
    }

    fn with_stats(result: MemoryResult, stats: Arc<CursorStats>) -> Self {
        stats.opened.fetch_add(1, Ordering::SeqCst);
        Self {
            result,
            position: None,
            closed: false,
            stats,
        }
    }

    /// Counters for this cursor.
    pub fn stats(&self) -> Arc<CursorStats> {
        Arc::clone(&self.stats)
    }

    /// Returns true once `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn current(&self) -> Result<&Row> {
        if self.closed {
            return Err(RowpipeError::cursor("cursor is closed"));
        }
        self.position
            .and_then(|i| self.result.rows.get(i))
            .ok_or_else(|| RowpipeError::cursor("cursor is not positioned on a row"))
    }

    fn advance(&mut self) -> Result<bool> {
        if self.closed {
            return Err(RowpipeError::cursor("cursor is closed"));
        }
        let call = self.stats.reads.fetch_add(1, Ordering::SeqCst) + 1;
        if self.result.fault_on_read == Some(call) {
            return Err(RowpipeError::cursor(format!("scripted fault on read {call}")));
        }

        let next = self.position.map_or(0, |i| i + 1).min(self.result.rows.len());
        self.position = Some(next);
        Ok(next < self.result.rows.len())
    }
}

impl DataRecord for MemoryCursor {
    fn field_count(&self) -> usize {
        self.result.columns.len()
    }

    fn name(&self, ordinal: usize) -> Result<&str> {
        self.result
            .columns
            .get(ordinal)
            .map(String::as_str)
            .ok_or_else(|| RowpipeError::invalid_argument(format!("ordinal {ordinal} out of range")))
    }

    fn value(&self, ordinal: usize) -> Result<Value> {
        self.current()?
            .get(ordinal)
            .cloned()
            .ok_or_else(|| RowpipeError::cursor(format!("ordinal {ordinal} out of range")))
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.stats.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl Cursor for MemoryCursor {
    fn read(&mut self) -> Result<bool> {
        self.advance()
    }
}

#[async_trait]
impl AsyncCursor for MemoryCursor {
    async fn read_async(&mut self) -> Result<bool> {
        if let Some(delay) = self.result.read_delay {
            tokio::time::sleep(delay).await;
        }
        self.advance()
    }
}

/// A provider that serves scripted results.
///
/// Results are looked up by command text, falling back to the default result.
#[derive(Debug, Default)]
pub struct MemoryProvider {
    default: MemoryResult,
    by_text: HashMap<String, MemoryResult>,
    affected_rows: u64,
    open_error: Option<String>,
    stats: Arc<CursorStats>,
}

impl MemoryProvider {
    /// Creates a provider that answers every command with `result`.
    pub fn new(result: MemoryResult) -> Self {
        Self {
            default: result,
            ..Self::default()
        }
    }

    /// Registers a result for a specific command text.
    pub fn with_result_for(mut self, text: impl Into<String>, result: MemoryResult) -> Self {
        self.by_text.insert(text.into(), result);
        self
    }

    /// Sets the count reported by `execute_non_query`.
    pub fn with_affected_rows(mut self, rows: u64) -> Self {
        self.affected_rows = rows;
        self
    }

    /// Makes every `open_cursor` call fail.
    pub fn failing(mut self, msg: impl Into<String>) -> Self {
        self.open_error = Some(msg.into());
        self
    }

    /// Counters aggregated across every cursor this provider opened.
    pub fn stats(&self) -> Arc<CursorStats> {
        Arc::clone(&self.stats)
    }
}

#[async_trait]
impl CommandProvider for MemoryProvider {
    type Cursor = MemoryCursor;

    async fn open_cursor(&self, command: &CommandSpec) -> Result<MemoryCursor> {
        if let Some(msg) = &self.open_error {
            return Err(RowpipeError::connection(msg.clone()));
        }
        let result = self
            .by_text
            .get(&command.text)
            .unwrap_or(&self.default)
            .clone();
        Ok(MemoryCursor::with_stats(result, Arc::clone(&self.stats)))
    }

    async fn execute_non_query(&self, _command: &CommandSpec) -> Result<u64> {
        if let Some(msg) = &self.open_error {
            return Err(RowpipeError::connection(msg.clone()));
        }
        Ok(self.affected_rows)
    }
}
