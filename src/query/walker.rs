//! Cursor walking.
//!
//! A walker advances a cursor one row at a time and hands each positioned
//! row to a continuation. It never reads ahead: once a continuation asks to
//! stop, or cancellation is observed, the cursor is not advanced again.
//!
//! Both walkers expose a step API (`advance`) for callers that need to do
//! work between rows, and `drive` for the common callback loop.

use crate::db::{AsyncCursor, Cursor};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::ops::ControlFlow;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Why a walk ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WalkEnd {
    /// The cursor reported no more rows.
    Exhausted,
    /// The continuation asked to stop.
    Stopped,
    /// The cancellation token fired.
    Cancelled,
}

/// Summary of a finished walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalkOutcome {
    /// Rows delivered to the continuation.
    pub rows: usize,
    pub end: WalkEnd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// The cursor is already positioned on a row that has not been delivered.
    Primed,
    Active,
    Ended(WalkEnd),
    Failed,
}

impl State {
    fn initial(read_started: bool) -> Self {
        if read_started {
            Self::Primed
        } else {
            Self::Active
        }
    }
}

/// Drives a synchronous cursor.
pub struct Walker<'c, C: ?Sized> {
    cursor: &'c mut C,
    cancel: Option<CancellationToken>,
    rows: usize,
    state: State,
}

impl<'c, C: Cursor + ?Sized> Walker<'c, C> {
    /// Walks from before the first row.
    pub fn new(cursor: &'c mut C) -> Self {
        Self::starting(cursor, false)
    }

    /// Walks a cursor that is already positioned on an undelivered row.
    pub fn resume(cursor: &'c mut C) -> Self {
        Self::starting(cursor, true)
    }

    fn starting(cursor: &'c mut C, read_started: bool) -> Self {
        Self {
            cursor,
            cancel: None,
            rows: 0,
            state: State::initial(read_started),
        }
    }

    /// Checks `token` before every advance.
    pub fn with_cancel(mut self, token: Option<CancellationToken>) -> Self {
        self.cancel = token;
        self
    }

    /// Moves to the next row and returns it, or `None` once the walk has ended.
    pub fn advance(&mut self) -> Result<Option<&C>> {
        let has_row = match self.state {
            State::Ended(_) | State::Failed => return Ok(None),
            _ if self.cancel.as_ref().is_some_and(|t| t.is_cancelled()) => {
                self.state = State::Ended(WalkEnd::Cancelled);
                return Ok(None);
            }
            State::Primed => true,
            State::Active => match self.cursor.read() {
                Ok(has_row) => has_row,
                Err(e) => {
                    self.state = State::Failed;
                    warn!("Cursor read failed after {} rows: {e}", self.rows);
                    return Err(e);
                }
            },
        };

        if !has_row {
            self.state = State::Ended(WalkEnd::Exhausted);
            return Ok(None);
        }

        self.state = State::Active;
        self.rows += 1;
        Ok(Some(&*self.cursor))
    }

    /// Ends the walk without reading further.
    pub fn stop(&mut self) {
        halt(&mut self.state, WalkEnd::Stopped);
    }

    /// Rows delivered so far.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Delivers every row to `on_row` until it breaks, the token fires, or the
    /// cursor is exhausted.
    pub fn drive<F>(mut self, mut on_row: F) -> Result<WalkOutcome>
    where
        F: FnMut(&C) -> Result<ControlFlow<()>>,
    {
        while let Some(record) = self.advance()? {
            match on_row(record) {
                Ok(ControlFlow::Continue(())) => {}
                Ok(ControlFlow::Break(())) => self.stop(),
                Err(e) => {
                    self.state = State::Failed;
                    return Err(e);
                }
            }
        }
        Ok(finish(self.rows, self.state))
    }
}

/// Drives an asynchronous cursor with cooperative cancellation.
pub struct AsyncWalker<'c, C: ?Sized> {
    cursor: &'c mut C,
    cancel: Option<CancellationToken>,
    rows: usize,
    state: State,
}

impl<'c, C: AsyncCursor + ?Sized> AsyncWalker<'c, C> {
    /// Walks from before the first row.
    pub fn new(cursor: &'c mut C) -> Self {
        Self::starting(cursor, false)
    }

    /// Walks a cursor that is already positioned on an undelivered row.
    pub fn resume(cursor: &'c mut C) -> Self {
        Self::starting(cursor, true)
    }

    fn starting(cursor: &'c mut C, read_started: bool) -> Self {
        Self {
            cursor,
            cancel: None,
            rows: 0,
            state: State::initial(read_started),
        }
    }

    /// Checks `token` before every advance and abandons a pending read when it fires.
    pub fn with_cancel(mut self, token: Option<CancellationToken>) -> Self {
        self.cancel = token;
        self
    }

    /// Moves to the next row and returns it, or `None` once the walk has ended.
    pub async fn advance(&mut self) -> Result<Option<&C>> {
        match self.state {
            State::Ended(_) | State::Failed => return Ok(None),
            _ if self.is_cancelled() => {
                self.state = State::Ended(WalkEnd::Cancelled);
                return Ok(None);
            }
            _ => {}
        }

        let has_row = if self.state == State::Primed {
            true
        } else {
            let read = match self.cancel.clone() {
                Some(token) => tokio::select! {
                    biased;
                    _ = token.cancelled() => None,
                    read = self.cursor.read_async() => Some(read),
                },
                None => Some(self.cursor.read_async().await),
            };

            match read {
                None => {
                    self.state = State::Ended(WalkEnd::Cancelled);
                    return Ok(None);
                }
                Some(Ok(has_row)) => has_row,
                Some(Err(e)) => {
                    self.state = State::Failed;
                    warn!("Cursor read failed after {} rows: {e}", self.rows);
                    return Err(e);
                }
            }
        };

        if !has_row {
            self.state = State::Ended(WalkEnd::Exhausted);
            return Ok(None);
        }

        self.state = State::Active;
        self.rows += 1;
        Ok(Some(&*self.cursor))
    }

    /// Ends the walk without reading further.
    pub fn stop(&mut self) {
        halt(&mut self.state, WalkEnd::Stopped);
    }

    /// Ends the walk as cancelled without reading further.
    pub(crate) fn cancel(&mut self) {
        halt(&mut self.state, WalkEnd::Cancelled);
    }

    /// Marks the walk as failed by something other than the cursor.
    pub(crate) fn fail(&mut self) {
        self.state = State::Failed;
    }

    /// Returns true once the walk's token has fired.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|t| t.is_cancelled())
    }

    /// Rows delivered so far.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// The outcome so far; meaningful once `advance` has returned `None`.
    pub fn outcome(&self) -> WalkOutcome {
        finish(self.rows, self.state)
    }

    /// Delivers every row to `on_row` until it breaks, the token fires, or the
    /// cursor is exhausted.
    pub async fn drive<F>(mut self, mut on_row: F) -> Result<WalkOutcome>
    where
        F: FnMut(&C) -> Result<ControlFlow<()>>,
    {
        while let Some(record) = self.advance().await? {
            match on_row(record) {
                Ok(ControlFlow::Continue(())) => {}
                Ok(ControlFlow::Break(())) => self.stop(),
                Err(e) => {
                    self.state = State::Failed;
                    return Err(e);
                }
            }
        }
        Ok(finish(self.rows, self.state))
    }
}

fn halt(state: &mut State, end: WalkEnd) {
    if matches!(state, State::Primed | State::Active) {
        *state = State::Ended(end);
    }
}

fn finish(rows: usize, state: State) -> WalkOutcome {
    let end = match state {
        State::Ended(end) => end,
        // Only reachable when a step-driven caller asks before the walk ended.
        _ => WalkEnd::Stopped,
    };
    debug!("Walk finished: {rows} rows ({end:?})");
    WalkOutcome { rows, end }
}
