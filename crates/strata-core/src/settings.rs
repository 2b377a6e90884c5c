//! Settings for the strata workspace.
//!
//! This module provides the [`Settings`] struct, which holds the database
//! connections and the primary/replica routing policy, and [`LazySettings`],
//! a globally-accessible, set-once settings instance.

use std::collections::HashMap;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use crate::error::{StrataError, StrataResult};

/// Database connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    /// The database engine: `sqlite`, `postgresql` or `mysql`.
    pub engine: String,
    /// The database name (or file path for `SQLite`, `:memory:` for a private
    /// in-memory database).
    pub name: String,
    /// The database user.
    pub user: String,
    /// The database password.
    pub password: String,
    /// The database host.
    pub host: String,
    /// The database port.
    pub port: u16,
    /// Additional engine-specific options (e.g. `pool_size`).
    pub options: HashMap<String, String>,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            engine: "sqlite".to_string(),
            name: "strata.sqlite3".to_string(),
            user: String::new(),
            password: String::new(),
            host: String::new(),
            port: 0,
            options: HashMap::new(),
        }
    }
}

/// Primary/replica routing policy.
///
/// Aliases refer to entries of [`Settings::databases`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingSettings {
    /// Alias of the primary (read-write) database.
    pub primary: String,
    /// Aliases of the read replicas, in round-robin order.
    pub replicas: Vec<String>,
    /// Whether a read retries once on the primary when a replica cannot be reached.
    pub replica_fallback: bool,
}

impl Default for RoutingSettings {
    fn default() -> Self {
        Self {
            primary: "default".to_string(),
            replicas: Vec::new(),
            replica_fallback: true,
        }
    }
}

/// The complete set of settings.
///
/// # Examples
///
/// ```
/// use strata_core::settings::Settings;
///
/// let settings = Settings::default();
/// assert!(settings.debug);
/// assert_eq!(settings.routing.primary, "default");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Whether debug mode is enabled (pretty logs instead of JSON).
    pub debug: bool,

    // ── Database ─────────────────────────────────────────────────────

    /// Database configurations, keyed by alias (e.g. "default").
    pub databases: HashMap<String, DatabaseSettings>,
    /// Which aliases serve writes and which serve reads.
    pub routing: RoutingSettings,

    // ── Logging ──────────────────────────────────────────────────────

    /// The log filter (e.g. "info", "strata_db=debug").
    pub log_level: String,

    // ── Escape hatch ─────────────────────────────────────────────────

    /// Custom settings that don't fit into the above categories.
    pub extra: HashMap<String, serde_json::Value>,
}

impl Default for Settings {
    fn default() -> Self {
        let mut databases = HashMap::new();
        databases.insert("default".to_string(), DatabaseSettings::default());

        Self {
            debug: true,
            databases,
            routing: RoutingSettings::default(),
            log_level: "info".to_string(),
            extra: HashMap::new(),
        }
    }
}

impl Settings {
    /// Returns the configuration for `alias`.
    pub fn database(&self, alias: &str) -> StrataResult<&DatabaseSettings> {
        self.databases.get(alias).ok_or_else(|| {
            StrataError::ConfigurationError(format!("database alias '{alias}' is not configured"))
        })
    }
}

/// A globally-accessible, set-once settings container.
///
/// Call [`configure`](LazySettings::configure) once at startup, then use
/// [`get`](LazySettings::get) to access the settings.
pub struct LazySettings {
    inner: OnceLock<Settings>,
}

impl Default for LazySettings {
    fn default() -> Self {
        Self::new()
    }
}

impl LazySettings {
    /// Creates a new, unconfigured `LazySettings`.
    pub const fn new() -> Self {
        Self {
            inner: OnceLock::new(),
        }
    }

    /// Configures the settings. Only the first call succeeds.
    pub fn configure(&self, settings: Settings) -> StrataResult<()> {
        self.inner.set(settings).map_err(|_| {
            StrataError::ConfigurationError("Settings have already been configured".to_string())
        })
    }

    /// Returns the configured settings.
    pub fn get(&self) -> StrataResult<&Settings> {
        self.inner.get().ok_or_else(|| {
            StrataError::ConfigurationError(
                "Settings have not been configured. Call SETTINGS.configure() first.".to_string(),
            )
        })
    }

    /// Returns `true` if settings have been configured.
    pub fn is_configured(&self) -> bool {
        self.inner.get().is_some()
    }
}

/// The global settings instance.
pub static SETTINGS: LazySettings = LazySettings::new();
