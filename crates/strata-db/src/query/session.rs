//! Connection handling for one terminal call.
//!
//! A [`Target`] records where a query set's statements should go: an
//! explicit connection, its own router, or the global router. A [`Session`]
//! holds the lease for one terminal call together with a compiler for the
//! leased connection's dialect.

use std::sync::Arc;

use strata_core::{StrataError, StrataResult};

use crate::connection::{Connection, RowSet};
use crate::query::compiler::{CompiledQuery, SqlCompiler};
use crate::router::{self, ConnectionRouter, Lease, OperationKind};
use crate::value::Value;

/// Where a query set sends its statements.
#[derive(Clone, Default)]
pub(crate) struct Target {
    pub(crate) connection: Option<Arc<dyn Connection>>,
    pub(crate) router: Option<Arc<ConnectionRouter>>,
}

impl Target {
    fn router(&self) -> StrataResult<Arc<ConnectionRouter>> {
        self.router.clone().or_else(router::global).ok_or_else(|| {
            StrataError::ConfigurationError(
                "no connection router installed; call router::install() or bind a connection with using()"
                    .to_string(),
            )
        })
    }

    async fn lease(&self, kind: OperationKind) -> StrataResult<Lease> {
        match (&self.connection, self.router()) {
            (Some(connection), Err(_)) => Ok(Lease::borrowed(Arc::clone(connection))),
            (explicit, Ok(router)) => router.resolve(kind, explicit.clone()).await,
            (None, Err(err)) => Err(err),
        }
    }
}

impl std::fmt::Debug for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Target")
            .field("connection", &self.connection.as_ref().map(|c| c.alias().to_string()))
            .field("router", &self.router)
            .finish()
    }
}

/// A leased connection and the compiler for its dialect.
pub(crate) struct Session {
    lease: Lease,
    compiler: SqlCompiler,
}

impl Session {
    pub(crate) async fn open(target: &Target, kind: OperationKind) -> StrataResult<Self> {
        let lease = target.lease(kind).await?;
        let compiler = SqlCompiler::new(lease.connection().backend());
        Ok(Self { lease, compiler })
    }

    pub(crate) const fn compiler(&self) -> &SqlCompiler {
        &self.compiler
    }

    pub(crate) async fn run(&self, query: &CompiledQuery) -> StrataResult<RowSet> {
        self.run_sql(&query.sql, &query.params).await
    }

    pub(crate) async fn run_sql(&self, sql: &str, params: &[Value]) -> StrataResult<RowSet> {
        let connection = self.lease.connection();
        tracing::debug!(
            alias = connection.alias(),
            sql = %sql,
            params = params.len(),
            "executing statement"
        );
        connection.execute(sql, params).await
    }

    pub(crate) async fn close(self) {
        self.lease.release().await;
    }
}

/// Opens a session, evaluates the body with it and releases the lease whatever the
/// outcome.
macro_rules! with_session {
    ($target:expr, $kind:expr, |$session:ident| $body:expr) => {{
        let $session = $crate::query::session::Session::open($target, $kind).await?;
        let result = async {
            let outcome: strata_core::StrataResult<_> = { $body };
            outcome
        }
        .await;
        $session.close().await;
        result
    }};
}

pub(crate) use with_session;
