//! # strata-db-backends
//!
//! Connection providers for the strata query engine. Each backend implements
//! [`ConnectionFactory`](strata_db::ConnectionFactory) and
//! [`Connection`](strata_db::Connection) for one database engine, and
//! [`build_router`] assembles them into a primary/replica router from
//! settings.
//!
//! Supported backends, each behind a cargo feature:
//! - `SQLite` (`sqlite`, enabled by default)
//! - `PostgreSQL` (`postgres`)
//! - `MySQL` (`mysql`)

pub mod base;
#[cfg(feature = "mysql")]
pub mod mysql;
#[cfg(feature = "postgres")]
pub mod postgresql;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use base::{build_router, factory, install_from_settings};
#[cfg(feature = "mysql")]
pub use mysql::{MySqlConnection, MySqlFactory};
#[cfg(feature = "postgres")]
pub use postgresql::{PostgresConnection, PostgresFactory};
#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteConnection, SqliteFactory};
