//! Data source boundary for rowpipe.
//!
//! Provides the trait-based interface the core consumes from drivers: a
//! forward-only cursor over one result set, and a provider that turns a
//! command description into such a cursor. Connection pooling, transactions
//! and parameter binding all live behind [`CommandProvider`].

mod memory;
mod postgres;
mod types;

pub use memory::{MemoryCursor, MemoryProvider, MemoryResult};
pub use postgres::{PgCursor, PgProvider};
pub use types::{Row, Value, ValueKind};

use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Default command timeout.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Schema and value access for the row a cursor is positioned on.
pub trait DataRecord: Send {
    /// Number of columns in the active result set.
    fn field_count(&self) -> usize;

    /// Name of the column at `ordinal`.
    fn name(&self, ordinal: usize) -> Result<&str>;

    /// Value of the column at `ordinal` on the current row.
    ///
    /// Only valid while the cursor is positioned on a row.
    fn value(&self, ordinal: usize) -> Result<Value>;

    /// Ordinal of the named column: exact match first, then case-insensitive.
    fn ordinal(&self, name: &str) -> Option<usize> {
        let count = self.field_count();
        let names: Vec<&str> = (0..count).filter_map(|i| self.name(i).ok()).collect();
        names
            .iter()
            .position(|n| *n == name)
            .or_else(|| names.iter().position(|n| n.eq_ignore_ascii_case(name)))
    }

    /// Releases the cursor. Must be idempotent.
    fn close(&mut self);
}

/// A forward-only, single-pass cursor advanced synchronously.
pub trait Cursor: DataRecord {
    /// Advances to the next row, returning false once the result set is exhausted.
    fn read(&mut self) -> Result<bool>;
}

/// A forward-only, single-pass cursor advanced asynchronously.
#[async_trait]
pub trait AsyncCursor: DataRecord {
    /// Advances to the next row, returning false once the result set is exhausted.
    async fn read_async(&mut self) -> Result<bool>;
}

/// How the command text is interpreted by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommandKind {
    #[default]
    Text,
    StoredProcedure,
}

/// A named command parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub value: Value,
    /// Provider-specific type name, if the value alone is ambiguous.
    pub type_hint: Option<String>,
}

impl Param {
    pub fn new(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            type_hint: None,
        }
    }

    pub fn with_type_hint(mut self, hint: impl Into<String>) -> Self {
        self.type_hint = Some(hint.into());
        self
    }
}

/// Everything a provider needs to run one command.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSpec {
    pub text: String,
    pub kind: CommandKind,
    pub params: Vec<Param>,
    pub timeout: Duration,
}

impl CommandSpec {
    /// Creates a plain-text command with no parameters.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            kind: CommandKind::Text,
            params: Vec::new(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    /// Creates a stored procedure call with no parameters.
    pub fn stored_procedure(name: impl Into<String>) -> Self {
        Self {
            kind: CommandKind::StoredProcedure,
            ..Self::text(name)
        }
    }
}

/// Trait implemented by drivers that can execute commands.
///
/// The provider owns connection acquisition; each returned cursor is
/// exclusively owned by the caller until it is closed or dropped.
#[async_trait]
pub trait CommandProvider: Send + Sync + 'static {
    type Cursor: AsyncCursor + 'static;

    /// Executes the command and returns a cursor over its first result set.
    async fn open_cursor(&self, command: &CommandSpec) -> Result<Self::Cursor>;

    /// Executes the command and returns the number of affected rows.
    async fn execute_non_query(&self, command: &CommandSpec) -> Result<u64>;
}
