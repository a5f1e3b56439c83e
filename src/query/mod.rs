//! Row streaming and materialization for rowpipe.
//!
//! This module turns a forward-only cursor into buffered results, typed
//! records and push-based streams, independent of the driver underneath.

mod buffer;
mod coerce;
mod columns;
mod command;
mod extract;
mod project;
mod stream;
mod walker;

pub use buffer::{drain_to_buffer, drain_to_buffer_async, retrieve, retrieve_async, BufferedResult};
pub use coerce::{coerce, FromValue, StandardConverter, ValueConverter};
pub use columns::{resolve_all, resolve_names, resolve_ordinals, Column, ColumnSelection};
pub use command::{Command, ExecutionState};
pub use extract::{extract, extract_map, to_map, RowMap};
pub use project::{Mapping, Member, ProjectionPlan, Projectable, Projector};
pub use stream::{expose_as_stream, Backpressure, RowStream};
pub use walker::{AsyncWalker, WalkEnd, WalkOutcome, Walker};
