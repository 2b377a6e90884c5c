//! # strata-core
//!
//! Core types shared by every strata crate: errors, settings and logging.
//! This crate has no engine dependencies and provides the foundation for the
//! query engine and its backends.
//!
//! ## Modules
//!
//! - [`error`] - Error types, categories and result aliases
//! - [`settings`] - Database and routing settings and global configuration
//! - [`settings_loader`] - Loading settings from TOML, JSON and the environment
//! - [`logging`] - Tracing-based logging integration

pub mod error;
pub mod logging;
pub mod settings;
pub mod settings_loader;

// Re-export the most commonly used types at the crate root.
pub use error::{ErrorCategory, StrataError, StrataResult};
pub use settings::{Settings, SETTINGS};
