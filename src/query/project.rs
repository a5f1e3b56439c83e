//! Typed record projection.
//!
//! A type opts in by implementing [`Projectable`], listing its settable
//! members once. The resulting member table is built on first use per type
//! and shared by every later projection of that type. Matching is
//! case-insensitive; columns with no matching member are ignored and members
//! with no matching column keep their default value.

use super::coerce::{convert_to, FromValue, StandardConverter, ValueConverter};
use super::extract::RowMap;
use super::{BufferedResult, Column};
use crate::db::{DataRecord, Value, ValueKind};
use crate::error::{Result, RowpipeError};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};
use tracing::{debug, warn};

type Assign<T> =
    Box<dyn Fn(&mut T, Value, &dyn ValueConverter) -> std::result::Result<(), String> + Send + Sync>;

/// One settable member of a projectable type.
pub struct Member<T> {
    name: &'static str,
    kind: ValueKind,
    nullable: bool,
    assign: Assign<T>,
}

impl<T: 'static> Member<T> {
    /// A member backed by a field of type `F`.
    pub fn field<F: FromValue + 'static>(name: &'static str, access: fn(&mut T) -> &mut F) -> Self {
        Self {
            name,
            kind: F::KIND,
            nullable: F::NULLABLE,
            assign: Box::new(move |target, value, converter| {
                *access(target) = convert_to::<F>(value, converter)?;
                Ok(())
            }),
        }
    }

    /// A member assigned through a setter.
    pub fn setter<F: FromValue + 'static>(name: &'static str, set: fn(&mut T, F)) -> Self {
        Self {
            name,
            kind: F::KIND,
            nullable: F::NULLABLE,
            assign: Box::new(move |target, value, converter| {
                set(target, convert_to::<F>(value, converter)?);
                Ok(())
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn kind(&self) -> ValueKind {
        self.kind
    }

    pub fn is_nullable(&self) -> bool {
        self.nullable
    }
}

/// Caller configuration for how columns map onto members.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Mapping {
    excluded: Vec<String>,
    aliases: Vec<(String, String)>,
}

impl Mapping {
    /// Never populate `member`.
    pub fn exclude(mut self, member: impl Into<String>) -> Self {
        self.excluded.push(member.into());
        self
    }

    /// Populate `member` from the column named `source`.
    ///
    /// When several aliases target the same member, the one declared last
    /// wins if more than one of their columns is present.
    pub fn alias(mut self, source: impl Into<String>, member: impl Into<String>) -> Self {
        self.aliases.push((source.into(), member.into()));
        self
    }
}

/// A type rows can be projected into.
pub trait Projectable: Default + Send + 'static {
    /// The settable members of the type.
    fn members() -> Vec<Member<Self>>;

    /// Exclusions and aliases. Defaults to matching every member by name.
    fn mapping() -> Mapping {
        Mapping::default()
    }
}

/// Declares a [`Projectable`] implementation from a list of fields.
///
/// ```
/// use db_rowpipe::projectable;
///
/// #[derive(Debug, Default)]
/// struct User {
///     id: i64,
///     name: String,
///     email: Option<String>,
/// }
///
/// projectable!(User { id, name, email });
/// ```
#[macro_export]
macro_rules! projectable {
    ($ty:ty { $($field:ident),* $(,)? }) => {
        impl $crate::query::Projectable for $ty {
            fn members() -> Vec<$crate::query::Member<Self>> {
                vec![$($crate::query::Member::field(stringify!($field), |t: &mut Self| &mut t.$field)),*]
            }
        }
    };
}

/// Cached per-type member lookup.
struct MemberTable<T> {
    members: Vec<Member<T>>,
    /// Lowercase member name to member index.
    by_name: HashMap<String, usize>,
    /// Lowercase source column to (member index, declaration order).
    aliases: HashMap<String, (usize, usize)>,
    candidate_names: Vec<String>,
}

impl<T: Projectable> MemberTable<T> {
    fn build() -> Self {
        let mapping = T::mapping();
        let excluded: Vec<String> = mapping.excluded.iter().map(|m| m.to_lowercase()).collect();

        let members: Vec<Member<T>> = T::members()
            .into_iter()
            .filter(|m| !excluded.contains(&m.name.to_lowercase()))
            .collect();

        let mut by_name: HashMap<String, usize> = HashMap::with_capacity(members.len());
        for (i, member) in members.iter().enumerate() {
            match by_name.get(&member.name.to_lowercase()) {
                Some(&first) => {
                    warn!(
                        "Member '{}' of {} differs from '{}' only in case and is never populated",
                        member.name,
                        std::any::type_name::<T>(),
                        members[first].name
                    );
                }
                None => {
                    by_name.insert(member.name.to_lowercase(), i);
                }
            }
        }

        let mut aliases = HashMap::new();
        for (order, (source, member)) in mapping.aliases.iter().enumerate() {
            match by_name.get(&member.to_lowercase()) {
                Some(&index) => {
                    aliases.insert(source.to_lowercase(), (index, order));
                }
                None => debug!(
                    "Alias '{source}' targets unknown member '{member}' of {}",
                    std::any::type_name::<T>()
                ),
            }
        }

        let mut candidate_names: Vec<String> = members
            .iter()
            .enumerate()
            .filter(|(i, m)| by_name.get(&m.name.to_lowercase()) == Some(i))
            .map(|(_, m)| m.name.to_string())
            .collect();
        for (source, member) in &mapping.aliases {
            if by_name.contains_key(&member.to_lowercase())
                && !candidate_names.iter().any(|c| c.eq_ignore_ascii_case(source))
            {
                candidate_names.push(source.clone());
            }
        }

        Self {
            members,
            by_name,
            aliases,
            candidate_names,
        }
    }
}

type TableCache = RwLock<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>;

fn table_cache() -> &'static TableCache {
    static CACHE: OnceLock<TableCache> = OnceLock::new();
    CACHE.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Returns the member table for `T`, building it on first use.
fn member_table<T: Projectable>() -> Arc<MemberTable<T>> {
    let key = TypeId::of::<T>();

    let cached = table_cache()
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&key)
        .cloned();
    if let Some(table) = cached.and_then(|t| t.downcast::<MemberTable<T>>().ok()) {
        return table;
    }

    let mut cache = table_cache().write().unwrap_or_else(PoisonError::into_inner);
    let entry = cache
        .entry(key)
        .or_insert_with(|| Arc::new(MemberTable::<T>::build()) as Arc<dyn Any + Send + Sync>)
        .clone();
    drop(cache);

    match entry.downcast::<MemberTable<T>>() {
        Ok(table) => table,
        // Keys are TypeIds, so an entry always holds the table for its own type.
        Err(_) => Arc::new(MemberTable::build()),
    }
}

/// How each resolved column feeds a member, computed once per walk.
#[derive(Debug, Clone)]
pub struct ProjectionPlan {
    /// (position in row, column name, member index), in application order.
    assignments: Vec<(usize, String, usize)>,
}

impl ProjectionPlan {
    /// Number of columns that feed a member.
    pub fn len(&self) -> usize {
        self.assignments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }
}

/// Projects rows into instances of `T`.
pub struct Projector<T: Projectable> {
    table: Arc<MemberTable<T>>,
    converter: Arc<dyn ValueConverter>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Projectable> Default for Projector<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Projectable> Projector<T> {
    pub fn new() -> Self {
        Self::with_converter(Arc::new(StandardConverter))
    }

    /// Uses `converter` for member coercion.
    pub fn with_converter(converter: Arc<dyn ValueConverter>) -> Self {
        Self {
            table: member_table::<T>(),
            converter,
            _marker: PhantomData,
        }
    }

    /// Column names that can feed a member: member names plus aliases.
    pub fn candidate_names(&self) -> &[String] {
        &self.table.candidate_names
    }

    /// Matches resolved columns to members.
    ///
    /// Direct name matches are applied first, then aliases in declaration
    /// order, so the last applicable mapping for a member wins.
    pub fn plan(&self, columns: &[Column]) -> ProjectionPlan {
        let mut ranked = Vec::with_capacity(columns.len());
        for (position, column) in columns.iter().enumerate() {
            let key = column.name.to_lowercase();
            let matched = match self.table.by_name.get(&key) {
                Some(&index) => Some((0, index)),
                None => self
                    .table
                    .aliases
                    .get(&key)
                    .map(|&(index, order)| (order + 1, index)),
            };
            if let Some((priority, index)) = matched {
                ranked.push((priority, position, column.name.clone(), index));
            }
        }
        ranked.sort_by_key(|(priority, position, _, _)| (*priority, *position));

        ProjectionPlan {
            assignments: ranked
                .into_iter()
                .map(|(_, position, name, index)| (position, name, index))
                .collect(),
        }
    }

    /// Builds one instance from a positional row laid out like the planned columns.
    pub fn project_row(&self, plan: &ProjectionPlan, row: &[Value], row_index: usize) -> Result<T> {
        let mut target = T::default();
        for (position, column, index) in &plan.assignments {
            let value = row.get(*position).cloned().unwrap_or(Value::Null);
            self.assign(&mut target, *index, column, value, row_index)?;
        }
        Ok(target)
    }

    /// Builds one instance straight from a positioned cursor.
    pub fn project_record<R: DataRecord + ?Sized>(
        &self,
        plan: &ProjectionPlan,
        columns: &[Column],
        record: &R,
        row_index: usize,
    ) -> Result<T> {
        let mut target = T::default();
        for (position, column, index) in &plan.assignments {
            let ordinal = columns.get(*position).map(|c| c.ordinal).ok_or_else(|| {
                RowpipeError::invalid_argument("Projection plan does not match the resolved columns.")
            })?;
            let value = record.value(ordinal)?;
            self.assign(&mut target, *index, column, value, row_index)?;
        }
        Ok(target)
    }

    /// Builds one instance from a name-keyed row.
    pub fn project_map(&self, row: &RowMap, row_index: usize) -> Result<T> {
        let columns: Vec<Column> = row
            .keys()
            .enumerate()
            .map(|(i, name)| Column::new(i, name.clone()))
            .collect();
        let values: Vec<Value> = row.values().cloned().collect();
        let plan = self.plan(&columns);
        self.project_row(&plan, &values, row_index)
    }

    /// Projects every row of a buffered result.
    pub fn project(&self, result: &BufferedResult) -> Result<Vec<T>> {
        let plan = self.plan(result.columns());
        result
            .rows()
            .iter()
            .enumerate()
            .map(|(i, row)| self.project_row(&plan, row, i))
            .collect()
    }

    fn assign(
        &self,
        target: &mut T,
        index: usize,
        column: &str,
        value: Value,
        row_index: usize,
    ) -> Result<()> {
        let member = &self.table.members[index];
        if value.is_null() && !member.nullable {
            return Ok(());
        }

        (member.assign)(target, value, self.converter.as_ref()).map_err(|message| {
            warn!(
                "Projection failed at row {row_index}: column '{column}' -> '{}'",
                member.name
            );
            RowpipeError::Projection {
                row: row_index,
                column: column.to_string(),
                member: member.name.to_string(),
                message,
            }
        })
    }
}
