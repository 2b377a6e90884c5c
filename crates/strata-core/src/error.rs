//! Core error types for the strata query engine.
//!
//! Every fallible operation in the workspace returns [`StrataResult`]. The
//! variants of [`StrataError`] fall into four groups, reported by
//! [`StrataError::category`]:
//!
//! - **construction** errors are raised synchronously while a query chain is
//!   being built (an unknown field, a lookup that does not fit the column, a
//!   malformed projection). They indicate a programming error and are never
//!   retried.
//! - **data** errors come back from a terminal call whose result did not have
//!   the expected cardinality (`get()` on zero or several rows).
//! - **I/O** errors come from the connection layer. Replica acquisition is
//!   retried at most once against the primary; everything else surfaces as is.
//! - **configuration** errors come from settings and router setup.

use thiserror::Error;

/// Broad classification of a [`StrataError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Raised while building a query chain.
    Construction,
    /// Raised by a terminal call because of the rows it found.
    Data,
    /// Raised by the connection or the store.
    Io,
    /// Raised by settings or router configuration.
    Configuration,
}

/// The primary error type for the strata workspace.
#[derive(Error, Debug)]
pub enum StrataError {
    // ── Construction errors ──────────────────────────────────────────

    /// A field path does not resolve on the model or its declared relations.
    #[error("Unknown field '{field}' on model '{model}'")]
    UnknownField {
        /// The table of the model the path was resolved against.
        model: String,
        /// The offending field path, as written by the caller.
        field: String,
    },

    /// The lookup operator is unknown or not valid for the column's type.
    #[error("Invalid lookup '{lookup}' for field '{field}': {reason}")]
    InvalidLookup {
        /// The field path the lookup was applied to.
        field: String,
        /// The lookup operator.
        lookup: String,
        /// Why the lookup was rejected.
        reason: String,
    },

    /// The value passed to a lookup has the wrong shape.
    #[error("Lookup '{lookup}' on field '{field}' expects {expected}")]
    LookupArity {
        /// The field path the lookup was applied to.
        field: String,
        /// The lookup operator.
        lookup: String,
        /// A description of the expected value shape.
        expected: String,
    },

    /// A relation name does not exist on the model.
    #[error("Unknown relation '{relation}' on model '{model}'")]
    UnknownRelation {
        /// The table of the model.
        model: String,
        /// The offending relation name.
        relation: String,
    },

    /// A projection was requested with the wrong number of fields.
    #[error("Projection error: {0}")]
    ProjectionArity(String),

    /// The operation cannot be combined with the current query state.
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    // ── Data errors ──────────────────────────────────────────────────

    /// Raised when a query expected exactly one result but found none.
    #[error("Object does not exist: {0}")]
    DoesNotExist(String),

    /// Raised when a query expected exactly one result but found multiple.
    #[error("Multiple objects returned when one expected: {0}")]
    MultipleObjectsReturned(String),

    // ── I/O errors ───────────────────────────────────────────────────

    /// No replica could be reached and fallback to the primary is disabled.
    #[error("Replica unavailable: {0}")]
    ReplicaUnavailable(String),

    /// A connection could not be opened or was lost.
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// The store rejected or failed to run a statement.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    // ── Configuration ────────────────────────────────────────────────

    /// A configuration value is missing or invalid.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// An error occurred during serialization or deserialization.
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl StrataError {
    /// Returns the broad category this error belongs to.
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::UnknownField { .. }
            | Self::InvalidLookup { .. }
            | Self::LookupArity { .. }
            | Self::UnknownRelation { .. }
            | Self::ProjectionArity(_)
            | Self::UnsupportedOperation(_) => ErrorCategory::Construction,
            Self::DoesNotExist(_) | Self::MultipleObjectsReturned(_) => ErrorCategory::Data,
            Self::ReplicaUnavailable(_)
            | Self::ConnectionError(_)
            | Self::DatabaseError(_)
            | Self::IoError(_) => ErrorCategory::Io,
            Self::ConfigurationError(_) | Self::SerializationError(_) => {
                ErrorCategory::Configuration
            }
        }
    }

    /// Returns `true` for errors raised while building a query chain.
    pub const fn is_construction(&self) -> bool {
        matches!(self.category(), ErrorCategory::Construction)
    }
}

/// A convenience type alias for `Result<T, StrataError>`.
pub type StrataResult<T> = Result<T, StrataError>;
