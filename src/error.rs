//! Error types for rowpipe.
//!
//! Defines the error taxonomy shared by the column resolver, the cursor
//! walkers, the type projector and the command façade.

use thiserror::Error;

/// Main error type for rowpipe operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RowpipeError {
    /// Caller-supplied arguments are malformed (mismatched ordinal/name
    /// counts, duplicate or out-of-range columns). Always raised before the
    /// cursor is advanced.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A requested column name is absent from the live result schema.
    #[error("Unknown column: '{0}'")]
    UnknownColumn(String),

    /// A value could not be coerced to the requested type.
    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    /// A row could not be projected into the target type.
    #[error("Projection failed at row {row}, column '{column}' -> '{member}': {message}")]
    Projection {
        /// Zero-based index of the offending row within the walk.
        row: usize,
        /// Source column name.
        column: String,
        /// Target member name.
        member: String,
        /// Underlying coercion failure.
        message: String,
    },

    /// Failure surfaced by the underlying cursor while advancing or reading.
    #[error("Cursor fault: {0}")]
    CursorFault(String),

    /// Database connection errors (host unreachable, auth failed, etc.)
    #[error("Connection error: {0}")]
    Connection(String),

    /// Configuration errors (invalid config file, missing required fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// A command was used after it reached a terminal state.
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl RowpipeError {
    /// Creates an invalid argument error with the given message.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Creates an unknown column error for the given column name.
    pub fn unknown_column(name: impl Into<String>) -> Self {
        Self::UnknownColumn(name.into())
    }

    /// Creates a type mismatch error with the given message.
    pub fn type_mismatch(msg: impl Into<String>) -> Self {
        Self::TypeMismatch(msg.into())
    }

    /// Creates a cursor fault with the given message.
    pub fn cursor(msg: impl Into<String>) -> Self {
        Self::CursorFault(msg.into())
    }

    /// Creates a connection error with the given message.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Creates a configuration error with the given message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Creates an invalid state error with the given message.
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Returns the error category as a string for display purposes.
    pub fn category(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "Invalid Argument",
            Self::UnknownColumn(_) => "Unknown Column",
            Self::TypeMismatch(_) => "Type Mismatch",
            Self::Projection { .. } => "Projection Error",
            Self::CursorFault(_) => "Cursor Fault",
            Self::Connection(_) => "Connection Error",
            Self::Config(_) => "Configuration Error",
            Self::InvalidState(_) => "Invalid State",
        }
    }
}

/// Result type alias using RowpipeError.
pub type Result<T> = std::result::Result<T, RowpipeError>;
