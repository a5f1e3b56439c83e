//! Command façade.
//!
//! A [`Command`] pairs one [`CommandSpec`] with a provider and runs it
//! exactly once through one of the caller-facing operations. Every operation
//! acquires a single cursor, performs a single walk and closes the cursor on
//! every exit path.

use super::buffer::{retrieve_async, BufferedResult};
use super::coerce::{coerce, FromValue, StandardConverter, ValueConverter};
use super::extract::{extract, extract_map, RowMap};
use super::project::{Projectable, Projector};
use super::stream::{channel, pump, Backpressure, RowStream};
use super::walker::{AsyncWalker, WalkEnd, WalkOutcome};
use super::{Column, ColumnSelection};
use crate::db::{CommandProvider, CommandSpec, DataRecord, Param, Row, Value};
use crate::error::{Result, RowpipeError};
use futures::future::BoxFuture;
use std::ops::{ControlFlow, Deref, DerefMut};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Lifecycle of a [`Command`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    Unexecuted,
    Executing,
    Completed,
    Cancelled,
    Failed,
}

impl ExecutionState {
    /// Returns true once the command can no longer run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

/// Closes the wrapped cursor when dropped.
struct CursorGuard<C: DataRecord> {
    cursor: C,
}

impl<C: DataRecord> Deref for CursorGuard<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.cursor
    }
}

impl<C: DataRecord> DerefMut for CursorGuard<C> {
    fn deref_mut(&mut self) -> &mut C {
        &mut self.cursor
    }
}

impl<C: DataRecord> Drop for CursorGuard<C> {
    fn drop(&mut self) {
        self.cursor.close();
    }
}

/// A single-use command bound to a provider.
pub struct Command<P: CommandProvider> {
    provider: Arc<P>,
    spec: CommandSpec,
    cancel: Option<CancellationToken>,
    converter: Arc<dyn ValueConverter>,
    backpressure: Backpressure,
    state: Arc<Mutex<ExecutionState>>,
}

impl<P: CommandProvider> Command<P> {
    pub fn new(provider: Arc<P>, spec: CommandSpec) -> Self {
        Self {
            provider,
            spec,
            cancel: None,
            converter: Arc::new(StandardConverter),
            backpressure: Backpressure::default(),
            state: Arc::new(Mutex::new(ExecutionState::Unexecuted)),
        }
    }

    /// Creates a plain-text command.
    pub fn text(provider: Arc<P>, sql: impl Into<String>) -> Self {
        Self::new(provider, CommandSpec::text(sql))
    }

    /// Creates a stored procedure call.
    pub fn stored_procedure(provider: Arc<P>, name: impl Into<String>) -> Self {
        Self::new(provider, CommandSpec::stored_procedure(name))
    }

    /// Appends a parameter.
    pub fn param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.spec.params.push(Param::new(name, value));
        self
    }

    /// Appends a prebuilt parameter.
    pub fn with_param(mut self, param: Param) -> Self {
        self.spec.params.push(param);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.spec.timeout = timeout;
        self
    }

    /// Cancels the walk when `token` fires.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Replaces the value converter used for scalars and records.
    pub fn with_converter(mut self, converter: Arc<dyn ValueConverter>) -> Self {
        self.converter = converter;
        self
    }

    /// Sets how far stream producers may read ahead.
    pub fn with_backpressure(mut self, backpressure: Backpressure) -> Self {
        self.backpressure = backpressure;
        self
    }

    pub fn spec(&self) -> &CommandSpec {
        &self.spec
    }

    pub fn state(&self) -> ExecutionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != ExecutionState::Unexecuted {
            return Err(RowpipeError::invalid_state(format!(
                "command has already been executed (state: {:?})",
                *state
            )));
        }
        *state = ExecutionState::Executing;
        debug!("Executing command: {}", self.spec.text);
        Ok(())
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|t| t.is_cancelled())
    }

    async fn open(&self) -> Result<CursorGuard<P::Cursor>> {
        let cursor = self.provider.open_cursor(&self.spec).await?;
        Ok(CursorGuard { cursor })
    }

    fn walker<'c>(&self, cursor: &'c mut P::Cursor) -> AsyncWalker<'c, P::Cursor> {
        AsyncWalker::new(cursor).with_cancel(self.cancel.clone())
    }

    /// Hands the open cursor to `handler`.
    ///
    /// The handler owns the walk; the cursor is closed once its future
    /// completes.
    pub async fn execute<T, H>(&self, handler: H) -> Result<T>
    where
        H: for<'c> FnOnce(&'c mut P::Cursor) -> BoxFuture<'c, Result<T>>,
    {
        self.begin()?;
        let result: Result<T> = async {
            let mut cursor = self.open().await?;
            handler(&mut *cursor).await
        }
        .await;

        let end = if self.is_cancelled() {
            WalkEnd::Cancelled
        } else {
            WalkEnd::Exhausted
        };
        settle(&self.state, "execute", result.map(|value| (value, end)))
    }

    /// Returns the first column of the first row, coerced to `T`.
    ///
    /// An empty result, or one cancelled before its first row, yields NULL,
    /// which only nullable targets accept.
    pub async fn execute_scalar<T: FromValue>(&self) -> Result<T> {
        self.begin()?;
        let result: Result<(T, WalkEnd)> = async {
            let mut cursor = self.open().await?;
            let mut walker = self.walker(&mut cursor);
            let value = match walker.advance().await? {
                Some(record) if record.field_count() > 0 => record.value(0)?,
                _ => Value::Null,
            };
            walker.stop();
            let end = walker.outcome().end;
            Ok((coerce::<T>(value, self.converter.as_ref())?, end))
        }
        .await;

        settle(&self.state, "execute_scalar", result)
    }

    /// Runs the command for its side effects and returns the affected row count.
    pub async fn execute_non_query(&self) -> Result<u64> {
        self.begin()?;
        let run = self.provider.execute_non_query(&self.spec);
        let result = match &self.cancel {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => Ok((0, WalkEnd::Cancelled)),
                affected = run => affected.map(|n| (n, WalkEnd::Exhausted)),
            },
            None => run.await.map(|n| (n, WalkEnd::Exhausted)),
        };
        settle(&self.state, "execute_non_query", result)
    }

    /// Calls `on_row` for every row.
    pub async fn iterate<F>(&self, mut on_row: F) -> Result<WalkOutcome>
    where
        F: FnMut(&P::Cursor) -> Result<()>,
    {
        self.begin()?;
        let result: Result<WalkOutcome> = async {
            let mut cursor = self.open().await?;
            self.walker(&mut cursor)
                .drive(|record| {
                    on_row(record)?;
                    Ok(ControlFlow::Continue(()))
                })
                .await
        }
        .await;

        settle_walk(&self.state, "iterate", result)
    }

    /// Calls `predicate` for every row until it returns false.
    ///
    /// No row after the one that stopped the walk is read.
    pub async fn iterate_while<F>(&self, mut predicate: F) -> Result<WalkOutcome>
    where
        F: FnMut(&P::Cursor) -> Result<bool>,
    {
        self.begin()?;
        let result: Result<WalkOutcome> = async {
            let mut cursor = self.open().await?;
            self.walker(&mut cursor)
                .drive(|record| {
                    Ok(if predicate(record)? {
                        ControlFlow::Continue(())
                    } else {
                        ControlFlow::Break(())
                    })
                })
                .await
        }
        .await;

        settle_walk(&self.state, "iterate_while", result)
    }

    /// Collects `transform(row)` for every row.
    ///
    /// A cancelled walk returns the items produced so far.
    pub async fn to_list<T, F>(&self, mut transform: F) -> Result<Vec<T>>
    where
        F: FnMut(&P::Cursor) -> Result<T>,
    {
        self.begin()?;
        let result: Result<(Vec<T>, WalkEnd)> = async {
            let mut cursor = self.open().await?;
            let mut items = Vec::new();
            let outcome = self
                .walker(&mut cursor)
                .drive(|record| {
                    items.push(transform(record)?);
                    Ok(ControlFlow::Continue(()))
                })
                .await?;
            Ok((items, outcome.end))
        }
        .await;

        settle(&self.state, "to_list", result)
    }

    /// Collects every row as a name-keyed map restricted to `names`.
    ///
    /// Names with no matching column are skipped; an empty list keeps every
    /// column.
    pub async fn to_dictionaries<I, S>(&self, names: I) -> Result<Vec<RowMap>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let selection = ColumnSelection::present(names);
        self.begin()?;
        let result: Result<(Vec<RowMap>, WalkEnd)> = async {
            let mut cursor = self.open().await?;
            let columns = selection.resolve(&*cursor)?;
            let mut maps = Vec::new();
            let outcome = self
                .walker(&mut cursor)
                .drive(|record| {
                    maps.push(extract_map(record, &columns)?);
                    Ok(ControlFlow::Continue(()))
                })
                .await?;
            Ok((maps, outcome.end))
        }
        .await;

        settle(&self.state, "to_dictionaries", result)
    }

    /// Projects every row into a `T`.
    pub async fn to_records<T: Projectable>(&self) -> Result<Vec<T>> {
        self.begin()?;
        let result: Result<(Vec<T>, WalkEnd)> = async {
            let mut cursor = self.open().await?;
            let projector = Projector::<T>::with_converter(Arc::clone(&self.converter));
            let columns = ColumnSelection::present(projector.candidate_names().to_vec())
                .resolve(&*cursor)?;
            let plan = projector.plan(&columns);

            let mut records = Vec::new();
            let outcome = self
                .walker(&mut cursor)
                .drive(|record| {
                    let index = records.len();
                    records.push(projector.project_record(&plan, &columns, record, index)?);
                    Ok(ControlFlow::Continue(()))
                })
                .await?;
            Ok((records, outcome.end))
        }
        .await;

        settle(&self.state, "to_records", result)
    }

    /// Drains the selected columns into a [`BufferedResult`].
    pub async fn to_buffer(&self, selection: &ColumnSelection) -> Result<BufferedResult> {
        self.begin()?;
        let result: Result<(BufferedResult, WalkEnd)> = async {
            let mut cursor = self.open().await?;
            let buffer = retrieve_async(&mut *cursor, selection, self.cancel.clone()).await?;
            let end = buffer.end();
            Ok((buffer, end))
        }
        .await;

        settle(&self.state, "to_buffer", result)
    }

    /// Sends `transform(row)` for every row into `sender`.
    ///
    /// Each row is read only once the channel has room for it. The walk stops
    /// without error when the receiver is closed.
    pub async fn forward_to<T, F>(&self, mut transform: F, sender: mpsc::Sender<T>) -> Result<WalkOutcome>
    where
        F: FnMut(&P::Cursor) -> Result<T>,
    {
        self.begin()?;
        let result: Result<WalkOutcome> = async {
            let mut cursor = self.open().await?;
            let mut walker = self.walker(&mut cursor);
            loop {
                let permit = match &self.cancel {
                    Some(token) => tokio::select! {
                        biased;
                        _ = token.cancelled() => {
                            walker.cancel();
                            break;
                        }
                        permit = sender.reserve() => permit,
                    },
                    None => sender.reserve().await,
                };
                let Ok(permit) = permit else {
                    debug!("Receiver closed after {} rows", walker.rows());
                    walker.stop();
                    break;
                };

                match walker.advance().await? {
                    Some(record) => permit.send(transform(record)?),
                    None => break,
                }
            }
            Ok(walker.outcome())
        }
        .await;

        settle_walk(&self.state, "forward_to", result)
    }

    /// Streams `transform(row)` for every row.
    ///
    /// Returns immediately; the cursor is opened and walked on a spawned
    /// task, so this must be called from within a Tokio runtime. Failures,
    /// including failure to open the cursor, arrive as the final item.
    pub fn to_stream<T, F>(&self, transform: F) -> Result<RowStream<T>>
    where
        T: Send + 'static,
        F: FnMut(&P::Cursor) -> Result<T> + Send + 'static,
    {
        self.spawn_stream("to_stream", move |_| Ok(transform))
    }

    /// Streams `transform(columns, row)` for every row.
    ///
    /// `selection` is resolved against the cursor schema before the first
    /// read, so an unknown column is the only item and no row is read.
    pub fn to_stream_with_columns<T, F>(
        &self,
        selection: ColumnSelection,
        transform: F,
    ) -> Result<RowStream<T>>
    where
        T: Send + 'static,
        F: FnMut(&[Column], &P::Cursor) -> Result<T> + Send + 'static,
    {
        self.selected_stream("to_stream_with_columns", selection, transform)
    }

    /// Streams the selected columns of every row.
    pub fn to_row_stream(&self, selection: ColumnSelection) -> Result<RowStream<Row>> {
        self.selected_stream("to_row_stream", selection, |columns, record: &P::Cursor| {
            extract(record, columns)
        })
    }

    fn selected_stream<T, F>(
        &self,
        op: &'static str,
        selection: ColumnSelection,
        mut transform: F,
    ) -> Result<RowStream<T>>
    where
        T: Send + 'static,
        F: FnMut(&[Column], &P::Cursor) -> Result<T> + Send + 'static,
    {
        self.spawn_stream(op, move |cursor| {
            let columns = selection.resolve(cursor)?;
            Ok(move |record: &P::Cursor| transform(columns.as_slice(), record))
        })
    }

    /// Streams every row projected into a `T`.
    pub fn to_record_stream<T: Projectable>(&self) -> Result<RowStream<T>> {
        let converter = Arc::clone(&self.converter);
        self.spawn_stream("to_record_stream", move |cursor| {
            let projector = Projector::<T>::with_converter(converter);
            let columns =
                ColumnSelection::present(projector.candidate_names().to_vec()).resolve(cursor)?;
            let plan = projector.plan(&columns);
            let mut index = 0;
            Ok(move |record: &P::Cursor| {
                let projected = projector.project_record(&plan, &columns, record, index);
                index += 1;
                projected
            })
        })
    }

    /// Opens the cursor on a spawned task, builds the row transform from its
    /// schema with `prepare`, then pumps rows into the returned stream.
    fn spawn_stream<T, F, G>(&self, op: &'static str, prepare: G) -> Result<RowStream<T>>
    where
        T: Send + 'static,
        F: FnMut(&P::Cursor) -> Result<T> + Send + 'static,
        G: FnOnce(&P::Cursor) -> Result<F> + Send + 'static,
    {
        self.begin()?;

        let provider = Arc::clone(&self.provider);
        let spec = self.spec.clone();
        let cancel = self.cancel.clone();
        let state = Arc::clone(&self.state);
        let (outlet, stream) = channel(self.backpressure);

        tokio::spawn(async move {
            let opened: Result<(CursorGuard<P::Cursor>, F)> = async {
                let cursor = CursorGuard {
                    cursor: provider.open_cursor(&spec).await?,
                };
                let transform = prepare(&*cursor)?;
                Ok((cursor, transform))
            }
            .await;

            let result = match opened {
                Ok((mut cursor, transform)) => {
                    pump(&mut *cursor, transform, &outlet, cancel).await
                }
                Err(e) => {
                    outlet.push(Err(e.clone()));
                    Err(e)
                }
            };

            // Settle before the outlet drops so a finished stream implies a final state.
            let _ = settle_walk(&state, op, result);
            drop(outlet);
        });

        Ok(stream)
    }
}

fn settle_walk(
    state: &Mutex<ExecutionState>,
    op: &str,
    result: Result<WalkOutcome>,
) -> Result<WalkOutcome> {
    settle(state, op, result.map(|outcome| (outcome, outcome.end)))
}

/// Records the terminal state for `result` and unwraps it.
fn settle<T>(state: &Mutex<ExecutionState>, op: &str, result: Result<(T, WalkEnd)>) -> Result<T> {
    let (next, result) = match result {
        Ok((value, WalkEnd::Cancelled)) => {
            debug!("{op} cancelled");
            (ExecutionState::Cancelled, Ok(value))
        }
        Ok((value, end)) => {
            debug!("{op} completed ({end:?})");
            (ExecutionState::Completed, Ok(value))
        }
        Err(e) => {
            warn!("{op} failed: {e}");
            (ExecutionState::Failed, Err(e))
        }
    };
    *state.lock().unwrap_or_else(PoisonError::into_inner) = next;
    result
}
