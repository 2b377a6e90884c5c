//! # strata
//!
//! A lazy, chainable query builder for relational databases.
//!
//! This is the meta-crate that re-exports the sub-crates for convenient
//! access. Depend on `strata` to get the engine and the backends selected by
//! feature, or depend on individual crates for finer-grained control.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use strata::prelude::*;
//!
//! # async fn run() -> StrataResult<()> {
//! let settings = strata::core::settings_loader::from_toml_file_with_env("strata.toml")?;
//! strata::logging::setup_logging(&settings);
//! strata::db_backends::install_from_settings(&settings)?;
//! # Ok(())
//! # }
//! ```

/// Errors, settings, and logging setup.
pub use strata_core as core;

/// The query engine: models, lookups, `QuerySet`, compiler, and router.
pub use strata_db as db;

/// Connection providers: `PostgreSQL`, `MySQL`, `SQLite`.
pub use strata_db_backends as db_backends;

/// Testing utilities: in-memory database, recording factories, query counts.
#[cfg(feature = "testing")]
pub use strata_test as test;

pub use strata_core::logging;

/// The types most programs need, in one import.
pub mod prelude {
    pub use strata_core::{Settings, StrataError, StrataResult};
    pub use strata_db::lookups;
    pub use strata_db::{
        Aggregate, ColumnDef, ConnectionRouter, Instance, Manager, Model, ModelDescriptor,
        QuerySet, Record, RelationDef, SemanticType, Value,
    };
}
