//! Connection factories for routing tests.
//!
//! [`RecordingFactory`] wraps a real factory and appends its alias to a
//! shared [`CallLog`] every time the router asks it for a connection, so a
//! test can assert which database a terminal call was dispatched to.
//! [`UnreachableFactory`] never connects, standing in for a replica that is
//! down.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use strata_db::router::ConnectionRouter;
//! use strata_test::{CallLog, RecordingFactory, TestDatabase};
//!
//! let db = TestDatabase::new();
//! let log = CallLog::new();
//! let router = ConnectionRouter::new(Arc::new(RecordingFactory::new("primary", db.clone(), &log)))
//!     .with_replicas(vec![Arc::new(RecordingFactory::new("replica", db, &log))]);
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use strata_core::{StrataError, StrataResult};
use strata_db::connection::{Connection, ConnectionFactory};

/// An ordered log of the aliases that were asked for a connection.
///
/// Clones share the log.
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, alias: &str) {
        if let Ok(mut entries) = self.0.lock() {
            entries.push(alias.to_string());
        }
    }

    /// Returns the recorded aliases in call order.
    pub fn entries(&self) -> Vec<String> {
        self.0.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Returns how many times `alias` was asked for a connection.
    pub fn count(&self, alias: &str) -> usize {
        self.entries().iter().filter(|a| *a == alias).count()
    }

    /// Forgets every recorded call.
    pub fn clear(&self) {
        if let Ok(mut entries) = self.0.lock() {
            entries.clear();
        }
    }
}

/// A factory that records every `connect()` before delegating.
pub struct RecordingFactory<F> {
    alias: String,
    inner: F,
    log: CallLog,
}

impl<F: ConnectionFactory> RecordingFactory<F> {
    /// Wraps `inner`, recording calls under `alias` in `log`.
    pub fn new(alias: impl Into<String>, inner: F, log: &CallLog) -> Self {
        Self {
            alias: alias.into(),
            inner,
            log: log.clone(),
        }
    }
}

impl<F> std::fmt::Debug for RecordingFactory<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingFactory")
            .field("alias", &self.alias)
            .field("log", &self.log)
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl<F: ConnectionFactory> ConnectionFactory for RecordingFactory<F> {
    fn alias(&self) -> &str {
        &self.alias
    }

    async fn connect(&self) -> StrataResult<Arc<dyn Connection>> {
        self.log.push(&self.alias);
        self.inner.connect().await
    }
}

/// A factory whose every `connect()` fails with a connection error.
#[derive(Debug, Default)]
pub struct UnreachableFactory {
    alias: String,
    attempts: AtomicUsize,
}

impl UnreachableFactory {
    /// Creates an unreachable database named `alias`.
    pub fn new(alias: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            attempts: AtomicUsize::new(0),
        }
    }

    /// Returns how many times a connection was attempted.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ConnectionFactory for UnreachableFactory {
    fn alias(&self) -> &str {
        &self.alias
    }

    async fn connect(&self) -> StrataResult<Arc<dyn Connection>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(StrataError::ConnectionError(format!(
            "{}: connection refused",
            self.alias
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_database::TestDatabase;

    #[tokio::test]
    async fn test_recording_factory_logs_and_delegates() {
        let log = CallLog::new();
        let factory = RecordingFactory::new("replica", TestDatabase::new(), &log);
        let conn = factory.connect().await.unwrap();
        assert_eq!(conn.alias(), "default");
        factory.connect().await.unwrap();
        assert_eq!(log.entries(), ["replica", "replica"]);
        assert_eq!(log.count("replica"), 2);
        assert_eq!(log.count("primary"), 0);
        log.clear();
        assert!(log.entries().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_factory_counts_attempts() {
        let factory = UnreachableFactory::new("replica");
        let err = factory.connect().await.err().unwrap();
        assert!(matches!(err, StrataError::ConnectionError(_)));
        assert!(factory.connect().await.is_err());
        assert_eq!(factory.attempts(), 2);
    }
}
