//! Query building, compilation, and execution.
//!
//! This module contains the complete query pipeline:
//!
//! - [`lookups`] - `field__operator` keys parsed into validated conditions
//! - [`tree`] - The immutable expression tree, windows, projections and aggregates
//! - [`compiler`] - SQL compilation for one dialect
//! - [`queryset`] - QuerySet and Manager for lazy query building
//! - [`materialize`] - Turning result rows into instances, records and scalars
//! - [`raw`] - Raw SQL query support

pub mod compiler;
pub mod lookups;
pub mod materialize;
pub mod queryset;
pub mod raw;
pub(crate) mod session;
pub mod tree;

pub use compiler::{CompiledQuery, SqlCompiler};
pub use lookups::{Condition, FieldPath, LookupKind};
pub use materialize::{
    AsInstance, AsModel, AsRecord, AsScalar, AsTuple, Instance, Materialized, Record, Related,
    Shape,
};
pub use queryset::{Manager, Pending, QuerySet};
pub use raw::RawQuerySet;
pub use tree::{Aggregate, AggregateFunc, ExpressionTree, Projection, SortField, SortKey, Window};
