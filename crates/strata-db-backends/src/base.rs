//! Building connection factories and routers from settings.
//!
//! [`factory`] turns one [`DatabaseSettings`] entry into a
//! [`ConnectionFactory`] for its engine. [`build_router`] does that for the
//! primary and every replica named in [`RoutingSettings`](strata_core::settings::RoutingSettings)
//! and wires them into a [`ConnectionRouter`].
//!
//! Each engine is behind a cargo feature (`sqlite`, `postgres`, `mysql`); a
//! settings entry naming a disabled engine is a configuration error.

use std::sync::Arc;

use strata_core::settings::{DatabaseSettings, Settings};
use strata_core::{StrataError, StrataResult};
use strata_db::connection::ConnectionFactory;
use strata_db::dialect::DatabaseBackendType;
use strata_db::router::{self, ConnectionRouter};

/// Creates the connection factory for one configured database.
///
/// # Errors
///
/// Returns a configuration error for an unknown engine, an engine whose
/// feature is disabled, or settings the driver rejects.
pub fn factory(alias: &str, settings: &DatabaseSettings) -> StrataResult<Arc<dyn ConnectionFactory>> {
    let backend = DatabaseBackendType::from_engine(&settings.engine).ok_or_else(|| {
        StrataError::ConfigurationError(format!(
            "{alias}: unknown database engine '{}'",
            settings.engine
        ))
    })?;

    tracing::debug!(alias, engine = %backend, name = %settings.name, "creating connection factory");
    match backend {
        #[cfg(feature = "sqlite")]
        DatabaseBackendType::SQLite => Ok(Arc::new(crate::sqlite::SqliteFactory::open(
            alias,
            &settings.name,
        )?)),
        #[cfg(feature = "postgres")]
        DatabaseBackendType::PostgreSQL => Ok(Arc::new(
            crate::postgresql::PostgresFactory::from_settings(alias, settings)?,
        )),
        #[cfg(feature = "mysql")]
        DatabaseBackendType::MySQL => Ok(Arc::new(crate::mysql::MySqlFactory::from_settings(
            alias, settings,
        )?)),
        #[allow(unreachable_patterns)]
        other => Err(StrataError::ConfigurationError(format!(
            "{alias}: the {other} backend is not enabled in this build"
        ))),
    }
}

/// Builds a router from the `databases` and `routing` settings.
///
/// # Errors
///
/// Returns a configuration error if the primary or a replica alias is not
/// configured, or if one of their factories cannot be created.
pub fn build_router(settings: &Settings) -> StrataResult<ConnectionRouter> {
    let routing = &settings.routing;
    let primary = factory(&routing.primary, settings.database(&routing.primary)?)?;
    let replicas = routing
        .replicas
        .iter()
        .map(|alias| factory(alias, settings.database(alias)?))
        .collect::<StrataResult<Vec<_>>>()?;

    tracing::info!(
        primary = %routing.primary,
        replicas = ?routing.replicas,
        fallback = routing.replica_fallback,
        "connection router configured"
    );
    Ok(ConnectionRouter::new(primary)
        .with_replicas(replicas)
        .with_fallback(routing.replica_fallback))
}

/// Builds a router from settings and installs it as the global router.
///
/// # Errors
///
/// Returns an error if the router cannot be built or one is already installed.
pub fn install_from_settings(settings: &Settings) -> StrataResult<Arc<ConnectionRouter>> {
    router::install(build_router(settings)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(feature = "sqlite")]
    fn sqlite(name: &str) -> DatabaseSettings {
        DatabaseSettings {
            engine: "sqlite".to_string(),
            name: name.to_string(),
            ..DatabaseSettings::default()
        }
    }

    #[test]
    fn test_unknown_engine() {
        let settings = DatabaseSettings {
            engine: "oracle".to_string(),
            ..DatabaseSettings::default()
        };
        let err = factory("default", &settings).err().unwrap();
        assert!(matches!(err, StrataError::ConfigurationError(_)));
        assert!(err.to_string().contains("oracle"));
    }

    #[cfg(feature = "sqlite")]
    #[test]
    fn test_missing_replica_alias() {
        let mut settings = Settings::default();
        settings.databases.insert("default".to_string(), sqlite(":memory:"));
        settings.routing.replicas = vec!["replica".to_string()];
        let err = build_router(&settings).err().unwrap();
        assert!(err.to_string().contains("replica"));
    }

    #[cfg(feature = "sqlite")]
    #[test]
    fn test_build_router_with_replicas() {
        let mut settings = Settings::default();
        settings.databases.insert("default".to_string(), sqlite(":memory:"));
        settings.databases.insert("r1".to_string(), sqlite(":memory:"));
        settings.databases.insert("r2".to_string(), sqlite(":memory:"));
        settings.routing.replicas = vec!["r1".to_string(), "r2".to_string()];
        settings.routing.replica_fallback = false;

        let router = build_router(&settings).unwrap();
        assert_eq!(router.primary_alias(), "default");
        assert_eq!(router.replica_aliases(), vec!["r1", "r2"]);
        assert!(!router.fallback_enabled());
    }

    #[cfg(not(feature = "mysql"))]
    #[test]
    fn test_disabled_backend() {
        let settings = DatabaseSettings {
            engine: "mysql".to_string(),
            ..DatabaseSettings::default()
        };
        let err = factory("default", &settings).err().unwrap();
        assert!(err.to_string().contains("not enabled"));
    }
}
