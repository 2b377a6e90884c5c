//! Primary/replica connection routing.
//!
//! A [`ConnectionRouter`] decides which database a terminal call talks to:
//!
//! - an explicit connection (`QuerySet::using`) always wins and is returned
//!   untouched;
//! - writes go to the primary;
//! - reads go to the replicas in round-robin order, or to the primary when
//!   none are configured.
//!
//! If a replica cannot be reached and fallback is enabled, the read is retried
//! exactly once on the primary. Writes are never retried.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use strata_db::router::{ConnectionRouter, OperationKind};
//! # async fn demo(
//! #     primary: Arc<dyn strata_db::ConnectionFactory>,
//! #     replica: Arc<dyn strata_db::ConnectionFactory>,
//! # ) -> strata_core::StrataResult<()> {
//! let router = ConnectionRouter::new(primary)
//!     .with_replicas(vec![replica])
//!     .with_fallback(true);
//!
//! let lease = router.resolve(OperationKind::Read, None).await?;
//! lease.connection().execute("SELECT 1", &[]).await?;
//! lease.release().await;
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use strata_core::{StrataError, StrataResult};

use crate::connection::{Connection, ConnectionFactory};

/// Whether a statement reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// `SELECT` and other side-effect-free statements.
    Read,
    /// Everything else.
    Write,
}

/// Routes terminal calls to the primary or a replica.
pub struct ConnectionRouter {
    primary: Arc<dyn ConnectionFactory>,
    replicas: Vec<Arc<dyn ConnectionFactory>>,
    cursor: AtomicUsize,
    fallback: bool,
    fallbacks: AtomicU64,
}

impl ConnectionRouter {
    /// Creates a router with only a primary. Fallback is enabled.
    pub fn new(primary: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            primary,
            replicas: Vec::new(),
            cursor: AtomicUsize::new(0),
            fallback: true,
            fallbacks: AtomicU64::new(0),
        }
    }

    /// Sets the replicas, in round-robin order.
    #[must_use]
    pub fn with_replicas(mut self, replicas: Vec<Arc<dyn ConnectionFactory>>) -> Self {
        self.replicas = replicas;
        self
    }

    /// Enables or disables falling back to the primary when a replica fails.
    #[must_use]
    pub fn with_fallback(mut self, enabled: bool) -> Self {
        self.fallback = enabled;
        self
    }

    /// Returns the primary's alias.
    pub fn primary_alias(&self) -> &str {
        self.primary.alias()
    }

    /// Returns the replica aliases in round-robin order.
    pub fn replica_aliases(&self) -> Vec<&str> {
        self.replicas.iter().map(|r| r.alias()).collect()
    }

    /// Returns `true` if replica failures fall back to the primary.
    pub const fn fallback_enabled(&self) -> bool {
        self.fallback
    }

    /// Returns how many reads fell back to the primary so far.
    pub fn fallback_count(&self) -> u64 {
        self.fallbacks.load(Ordering::Relaxed)
    }

    /// Resolves the connection for one terminal call.
    pub async fn resolve(
        &self,
        kind: OperationKind,
        explicit: Option<Arc<dyn Connection>>,
    ) -> StrataResult<Lease> {
        if let Some(connection) = explicit {
            tracing::trace!(alias = connection.alias(), "using explicit connection");
            return Ok(Lease::borrowed(connection));
        }

        if kind == OperationKind::Write || self.replicas.is_empty() {
            tracing::trace!(alias = self.primary.alias(), ?kind, "routing to primary");
            return self.primary.connect().await.map(Lease::owned);
        }

        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.replicas.len();
        let replica = &self.replicas[index];
        tracing::trace!(alias = replica.alias(), "routing read to replica");
        match replica.connect().await {
            Ok(connection) => Ok(Lease::owned(connection)),
            Err(err) if self.fallback => {
                self.fallbacks.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    replica = replica.alias(),
                    primary = self.primary.alias(),
                    error = %err,
                    "replica unavailable, falling back to primary"
                );
                self.primary.connect().await.map(Lease::owned)
            }
            Err(err) => Err(StrataError::ReplicaUnavailable(format!(
                "{}: {err}",
                replica.alias()
            ))),
        }
    }
}

impl std::fmt::Debug for ConnectionRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRouter")
            .field("primary", &self.primary.alias())
            .field("replicas", &self.replica_aliases())
            .field("fallback", &self.fallback)
            .field("fallbacks", &self.fallback_count())
            .finish_non_exhaustive()
    }
}

/// A connection checked out for one terminal call.
///
/// Connections opened by the router are closed by [`Lease::release`]; an
/// explicit connection is only borrowed and stays open. A lease dropped
/// without being released (on error or cancellation) simply drops its
/// handle, which returns pooled connections to their pool.
pub struct Lease {
    connection: Arc<dyn Connection>,
    owned: bool,
}

impl Lease {
    pub(crate) fn owned(connection: Arc<dyn Connection>) -> Self {
        Self {
            connection,
            owned: true,
        }
    }

    pub(crate) fn borrowed(connection: Arc<dyn Connection>) -> Self {
        Self {
            connection,
            owned: false,
        }
    }

    /// Returns the leased connection.
    pub fn connection(&self) -> &dyn Connection {
        self.connection.as_ref()
    }

    /// Returns `true` if the router opened this connection.
    pub const fn is_owned(&self) -> bool {
        self.owned
    }

    /// Gives the connection back, closing it if the router opened it.
    pub async fn release(self) {
        if !self.owned {
            return;
        }
        if let Err(err) = self.connection.close().await {
            tracing::warn!(alias = self.connection.alias(), error = %err, "failed to close connection");
        }
    }
}

static GLOBAL_ROUTER: OnceLock<Arc<ConnectionRouter>> = OnceLock::new();

/// Installs the process-wide router used by query sets without one of their own.
pub fn install(router: ConnectionRouter) -> StrataResult<Arc<ConnectionRouter>> {
    let router = Arc::new(router);
    GLOBAL_ROUTER
        .set(Arc::clone(&router))
        .map_err(|_| StrataError::ConfigurationError("a router is already installed".to_string()))?;
    Ok(router)
}

/// Returns the process-wide router, if one was installed.
pub fn global() -> Option<Arc<ConnectionRouter>> {
    GLOBAL_ROUTER.get().cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::RowSet;
    use crate::dialect::DatabaseBackendType;
    use crate::value::Value;
    use std::sync::Mutex;

    struct StubConnection {
        alias: String,
        closed: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl Connection for StubConnection {
        fn alias(&self) -> &str {
            &self.alias
        }

        fn backend(&self) -> DatabaseBackendType {
            DatabaseBackendType::SQLite
        }

        async fn execute(&self, _sql: &str, _params: &[Value]) -> StrataResult<RowSet> {
            Ok(RowSet::default())
        }

        async fn close(&self) -> StrataResult<()> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct StubFactory {
        alias: String,
        up: bool,
        log: Arc<Mutex<Vec<String>>>,
        closed: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl ConnectionFactory for StubFactory {
        fn alias(&self) -> &str {
            &self.alias
        }

        async fn connect(&self) -> StrataResult<Arc<dyn Connection>> {
            self.log.lock().unwrap().push(self.alias.clone());
            if !self.up {
                return Err(StrataError::ConnectionError(format!("{} is down", self.alias)));
            }
            Ok(Arc::new(StubConnection {
                alias: self.alias.clone(),
                closed: Arc::clone(&self.closed),
            }))
        }
    }

    struct Fixture {
        log: Arc<Mutex<Vec<String>>>,
        closed: Arc<AtomicUsize>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                log: Arc::new(Mutex::new(Vec::new())),
                closed: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn factory(&self, alias: &str, up: bool) -> Arc<dyn ConnectionFactory> {
            Arc::new(StubFactory {
                alias: alias.to_string(),
                up,
                log: Arc::clone(&self.log),
                closed: Arc::clone(&self.closed),
            })
        }

        fn log(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    #[tokio::test]
    async fn test_reads_round_robin_over_replicas() {
        let fx = Fixture::new();
        let router = ConnectionRouter::new(fx.factory("primary", true))
            .with_replicas(vec![fx.factory("r1", true), fx.factory("r2", true)]);
        for _ in 0..4 {
            router.resolve(OperationKind::Read, None).await.unwrap().release().await;
        }
        assert_eq!(fx.log(), vec!["r1", "r2", "r1", "r2"]);
        assert_eq!(fx.closed.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_writes_go_to_primary() {
        let fx = Fixture::new();
        let router =
            ConnectionRouter::new(fx.factory("primary", true)).with_replicas(vec![fx.factory("r1", true)]);
        let lease = router.resolve(OperationKind::Write, None).await.unwrap();
        assert_eq!(lease.connection().alias(), "primary");
        assert!(lease.is_owned());
        assert_eq!(fx.log(), vec!["primary"]);
    }

    #[tokio::test]
    async fn test_reads_without_replicas_use_primary() {
        let fx = Fixture::new();
        let router = ConnectionRouter::new(fx.factory("primary", true));
        let lease = router.resolve(OperationKind::Read, None).await.unwrap();
        assert_eq!(lease.connection().alias(), "primary");
    }

    #[tokio::test]
    async fn test_explicit_connection_wins_and_is_not_closed() {
        let fx = Fixture::new();
        let router = ConnectionRouter::new(fx.factory("primary", true));
        let explicit: Arc<dyn Connection> = Arc::new(StubConnection {
            alias: "pinned".to_string(),
            closed: Arc::clone(&fx.closed),
        });
        let lease = router.resolve(OperationKind::Write, Some(explicit)).await.unwrap();
        assert_eq!(lease.connection().alias(), "pinned");
        assert!(!lease.is_owned());
        lease.release().await;
        assert!(fx.log().is_empty());
        assert_eq!(fx.closed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_replica_failure_falls_back_once() {
        let fx = Fixture::new();
        let router = ConnectionRouter::new(fx.factory("primary", true))
            .with_replicas(vec![fx.factory("r1", false)]);
        let lease = router.resolve(OperationKind::Read, None).await.unwrap();
        assert_eq!(lease.connection().alias(), "primary");
        assert_eq!(fx.log(), vec!["r1", "primary"]);
        assert_eq!(router.fallback_count(), 1);
    }

    #[tokio::test]
    async fn test_replica_failure_without_fallback() {
        let fx = Fixture::new();
        let router = ConnectionRouter::new(fx.factory("primary", true))
            .with_replicas(vec![fx.factory("r1", false)])
            .with_fallback(false);
        let err = router.resolve(OperationKind::Read, None).await.err().unwrap();
        assert!(matches!(err, StrataError::ReplicaUnavailable(_)));
        assert_eq!(fx.log(), vec!["r1"]);
        assert_eq!(router.fallback_count(), 0);
    }

    #[tokio::test]
    async fn test_primary_failure_after_fallback_surfaces() {
        let fx = Fixture::new();
        let router = ConnectionRouter::new(fx.factory("primary", false))
            .with_replicas(vec![fx.factory("r1", false)]);
        let err = router.resolve(OperationKind::Read, None).await.err().unwrap();
        assert!(matches!(err, StrataError::ConnectionError(_)));
        assert_eq!(fx.log(), vec!["r1", "primary"]);
    }

    #[tokio::test]
    async fn test_write_failure_is_not_retried() {
        let fx = Fixture::new();
        let router = ConnectionRouter::new(fx.factory("primary", false))
            .with_replicas(vec![fx.factory("r1", true)]);
        assert!(router.resolve(OperationKind::Write, None).await.is_err());
        assert_eq!(fx.log(), vec!["primary"]);
    }

    #[test]
    fn test_debug_and_aliases() {
        let fx = Fixture::new();
        let router = ConnectionRouter::new(fx.factory("primary", true))
            .with_replicas(vec![fx.factory("r1", true)]);
        assert_eq!(router.primary_alias(), "primary");
        assert_eq!(router.replica_aliases(), vec!["r1"]);
        assert!(router.fallback_enabled());
        assert!(format!("{router:?}").contains("r1"));
    }
}
