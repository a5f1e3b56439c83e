//! Column resolution.
//!
//! Turns a caller's column request into an ordered list of `(ordinal, name)`
//! pairs checked against the live schema of a cursor. Resolution only reads
//! schema metadata and never advances the cursor.

use crate::db::DataRecord;
use crate::error::{Result, RowpipeError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A resolved result column.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Column {
    /// Position of the column in the cursor's natural order.
    pub ordinal: usize,

    /// Column name as reported by the cursor, or as supplied by the caller
    /// for ordinal requests with explicit names.
    pub name: String,
}

impl Column {
    pub fn new(ordinal: usize, name: impl Into<String>) -> Self {
        Self {
            ordinal,
            name: name.into(),
        }
    }
}

/// Which columns of a result set a caller wants.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ColumnSelection {
    /// Every column, in natural order.
    #[default]
    All,

    /// The given ordinals, in the given order, optionally renamed.
    Ordinals {
        ordinals: Vec<usize>,
        names: Option<Vec<String>>,
    },

    /// The given names, all of which must exist.
    Names {
        names: Vec<String>,
        /// Reorder the result by ascending ordinal instead of request order.
        normalize_order: bool,
    },

    /// Whichever of the given names exist, in natural order. Names with no
    /// matching column are skipped; an empty list selects every column.
    Present(Vec<String>),
}

impl ColumnSelection {
    /// Selects columns by ordinal.
    pub fn ordinals(ordinals: impl IntoIterator<Item = usize>) -> Self {
        Self::Ordinals {
            ordinals: ordinals.into_iter().collect(),
            names: None,
        }
    }

    /// Selects columns by name, in request order.
    pub fn names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Names {
            names: names.into_iter().map(Into::into).collect(),
            normalize_order: false,
        }
    }

    /// Selects the named columns that exist.
    pub fn present<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Present(names.into_iter().map(Into::into).collect())
    }

    /// Orders a name selection by ordinal. Other selections are unchanged.
    pub fn normalized(self) -> Self {
        match self {
            Self::Names { names, .. } => Self::Names {
                names,
                normalize_order: true,
            },
            other => other,
        }
    }

    /// Resolves the selection against the cursor's schema.
    pub fn resolve<R: DataRecord + ?Sized>(&self, record: &R) -> Result<Vec<Column>> {
        match self {
            Self::All => resolve_all(record),
            Self::Ordinals { ordinals, names } => {
                resolve_ordinals(record, ordinals, names.as_deref())
            }
            Self::Names {
                names,
                normalize_order,
            } => resolve_names(record, names.as_slice(), *normalize_order),
            Self::Present(names) if names.is_empty() => resolve_all(record),
            Self::Present(names) => resolve_present(record, names.as_slice()),
        }
    }
}

/// Resolves every column in natural order.
pub fn resolve_all<R: DataRecord + ?Sized>(record: &R) -> Result<Vec<Column>> {
    (0..record.field_count())
        .map(|ordinal| Ok(Column::new(ordinal, record.name(ordinal)?)))
        .collect()
}

/// Resolves the given ordinals, in the given order.
///
/// When `names` is supplied it must have one entry per ordinal and is used
/// instead of the live column names.
pub fn resolve_ordinals<R: DataRecord + ?Sized>(
    record: &R,
    ordinals: &[usize],
    names: Option<&[String]>,
) -> Result<Vec<Column>> {
    if let Some(names) = names {
        if names.len() != ordinals.len() {
            return Err(RowpipeError::invalid_argument(
                "Mismatched array lengths of ordinals and names.",
            ));
        }
        ensure_distinct_names(names)?;
    }

    let field_count = record.field_count();
    let mut seen = HashSet::with_capacity(ordinals.len());
    let mut columns = Vec::with_capacity(ordinals.len());

    for (i, &ordinal) in ordinals.iter().enumerate() {
        if ordinal >= field_count {
            return Err(RowpipeError::invalid_argument(format!(
                "Ordinal {ordinal} is out of range for a result with {field_count} columns."
            )));
        }
        if !seen.insert(ordinal) {
            return Err(RowpipeError::invalid_argument(format!(
                "Ordinal {ordinal} was requested more than once."
            )));
        }
        let name = match names {
            Some(names) => names[i].clone(),
            None => record.name(ordinal)?.to_string(),
        };
        columns.push(Column::new(ordinal, name));
    }

    Ok(columns)
}

/// Resolves the given column names to their live ordinals.
///
/// Fails with `UnknownColumn` if any name is absent from the schema.
pub fn resolve_names<R, S>(record: &R, names: &[S], normalize_order: bool) -> Result<Vec<Column>>
where
    R: DataRecord + ?Sized,
    S: AsRef<str>,
{
    ensure_distinct_names(names)?;

    let mut seen = HashSet::with_capacity(names.len());
    let mut columns = Vec::with_capacity(names.len());

    for name in names {
        let name = name.as_ref();
        let ordinal = record
            .ordinal(name)
            .ok_or_else(|| RowpipeError::unknown_column(name))?;
        if !seen.insert(ordinal) {
            return Err(RowpipeError::invalid_argument(format!(
                "Column '{name}' resolves to ordinal {ordinal}, which was already requested."
            )));
        }
        columns.push(Column::new(ordinal, record.name(ordinal)?));
    }

    if normalize_order {
        columns.sort_by_key(|c| c.ordinal);
    }

    Ok(columns)
}

/// Resolves the named columns that exist, in natural order.
fn resolve_present<R, S>(record: &R, names: &[S]) -> Result<Vec<Column>>
where
    R: DataRecord + ?Sized,
    S: AsRef<str>,
{
    let wanted: HashSet<String> = names.iter().map(|n| n.as_ref().to_lowercase()).collect();

    let mut columns = Vec::new();
    for ordinal in 0..record.field_count() {
        let name = record.name(ordinal)?;
        if wanted.contains(&name.to_lowercase()) {
            columns.push(Column::new(ordinal, name));
        }
    }
    Ok(columns)
}

fn ensure_distinct_names<S: AsRef<str>>(names: &[S]) -> Result<()> {
    let mut seen = HashSet::with_capacity(names.len());
    for name in names {
        if !seen.insert(name.as_ref().to_lowercase()) {
            return Err(RowpipeError::invalid_argument(format!(
                "Column '{}' was requested more than once.",
                name.as_ref()
            )));
        }
    }
    Ok(())
}
