//! # strata-test
//!
//! Testing utilities for the strata query engine: an in-memory
//! [`TestDatabase`] that counts the statements run against it, connection
//! factories for exercising the router ([`RecordingFactory`],
//! [`UnreachableFactory`]), and round-trip assertions
//! ([`assert_num_queries`], [`assert_max_queries`]).

pub mod assert_queries;
pub mod factories;
pub mod test_database;

pub use assert_queries::{assert_max_queries, assert_num_queries};
pub use factories::{CallLog, RecordingFactory, UnreachableFactory};
pub use test_database::TestDatabase;
