//! Settings loading from configuration files.
//!
//! ## Loading Order
//!
//! 1. Start with default settings.
//! 2. Load from a TOML or JSON file (deep-merged over the defaults).
//! 3. Apply environment variable overrides (highest priority).
//!
//! ## Environment Variable Mapping
//!
//! | Env Var | Setting |
//! |---|---|
//! | `STRATA_DEBUG` | `debug` |
//! | `STRATA_LOG_LEVEL` | `log_level` |
//! | `STRATA_PRIMARY` | `routing.primary` |
//! | `STRATA_REPLICAS` | `routing.replicas` (comma-separated) |
//! | `STRATA_REPLICA_FALLBACK` | `routing.replica_fallback` |
//!
//! ## Examples
//!
//! ```rust,no_run
//! use strata_core::settings_loader;
//!
//! let settings = settings_loader::from_toml_file_with_env("config/strata.toml").unwrap();
//! ```

use std::path::Path;

use crate::error::StrataError;
use crate::settings::Settings;

/// Loads settings from a TOML string.
///
/// Any fields not present in the TOML keep their default values.
///
/// # Examples
///
/// ```
/// use strata_core::settings_loader::from_toml_str;
///
/// let settings = from_toml_str(r#"
///     [databases.replica]
///     engine = "sqlite"
///     name = "replica.sqlite3"
///
///     [routing]
///     replicas = ["replica"]
/// "#).unwrap();
/// assert_eq!(settings.routing.replicas, vec!["replica".to_string()]);
/// assert_eq!(settings.routing.primary, "default");
/// ```
pub fn from_toml_str(toml_str: &str) -> Result<Settings, StrataError> {
    let toml_value: toml::Value = toml::from_str(toml_str)
        .map_err(|e| StrataError::ConfigurationError(format!("Failed to parse TOML: {e}")))?;
    merge_over_defaults(toml_to_json(toml_value), "TOML")
}

/// Loads settings from a TOML file.
pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Settings, StrataError> {
    let content = read_config(path.as_ref(), "TOML")?;
    from_toml_str(&content)
}

/// Loads settings from a TOML file and then applies environment variable overrides.
pub fn from_toml_file_with_env(path: impl AsRef<Path>) -> Result<Settings, StrataError> {
    let mut settings = from_toml_file(path)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

/// Loads settings from a JSON string.
pub fn from_json_str(json_str: &str) -> Result<Settings, StrataError> {
    let json_value: serde_json::Value = serde_json::from_str(json_str)
        .map_err(|e| StrataError::ConfigurationError(format!("Failed to parse JSON: {e}")))?;
    merge_over_defaults(json_value, "JSON")
}

/// Loads settings from a JSON file.
pub fn from_json_file(path: impl AsRef<Path>) -> Result<Settings, StrataError> {
    let content = read_config(path.as_ref(), "JSON")?;
    from_json_str(&content)
}

/// Loads settings from just environment variables (starting from defaults).
pub fn from_env() -> Settings {
    let mut settings = Settings::default();
    apply_env_overrides(&mut settings);
    settings
}

/// Applies `STRATA_*` environment variable overrides to a settings struct.
pub fn apply_env_overrides(settings: &mut Settings) {
    apply_overrides(settings, |key| std::env::var(key).ok());
}

/// Applies overrides read through `lookup`, keyed by environment variable name.
pub fn apply_overrides(settings: &mut Settings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(val) = lookup("STRATA_DEBUG") {
        settings.debug = parse_flag(&val);
    }

    if let Some(val) = lookup("STRATA_LOG_LEVEL") {
        settings.log_level = val;
    }

    if let Some(val) = lookup("STRATA_PRIMARY") {
        settings.routing.primary = val;
    }

    if let Some(val) = lookup("STRATA_REPLICAS") {
        settings.routing.replicas = val
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }

    if let Some(val) = lookup("STRATA_REPLICA_FALLBACK") {
        settings.routing.replica_fallback = parse_flag(&val);
    }
}

// ============================================================
// Helpers
// ============================================================

fn parse_flag(val: &str) -> bool {
    matches!(val.to_lowercase().as_str(), "true" | "1" | "yes")
}

fn read_config(path: &Path, format: &str) -> Result<String, StrataError> {
    std::fs::read_to_string(path).map_err(|e| {
        StrataError::ConfigurationError(format!(
            "Failed to read {format} file '{}': {e}",
            path.display()
        ))
    })
}

fn merge_over_defaults(value: serde_json::Value, format: &str) -> Result<Settings, StrataError> {
    let default_json = serde_json::to_value(Settings::default()).map_err(|e| {
        StrataError::ConfigurationError(format!("Failed to serialize default settings: {e}"))
    })?;

    let merged = merge_json(default_json, value);
    serde_json::from_value(merged).map_err(|e| {
        StrataError::ConfigurationError(format!("Failed to deserialize settings from {format}: {e}"))
    })
}

/// Converts a TOML value to a `serde_json::Value`.
fn toml_to_json(value: toml::Value) -> serde_json::Value {
    match value {
        toml::Value::String(s) => serde_json::Value::String(s),
        toml::Value::Integer(i) => serde_json::json!(i),
        toml::Value::Float(f) => serde_json::json!(f),
        toml::Value::Boolean(b) => serde_json::Value::Bool(b),
        toml::Value::Datetime(dt) => serde_json::Value::String(dt.to_string()),
        toml::Value::Array(arr) => {
            serde_json::Value::Array(arr.into_iter().map(toml_to_json).collect())
        }
        toml::Value::Table(table) => {
            let map: serde_json::Map<String, serde_json::Value> = table
                .into_iter()
                .map(|(k, v)| (k, toml_to_json(v)))
                .collect();
            serde_json::Value::Object(map)
        }
    }
}

/// Deep-merges two JSON values. The `override_val` takes precedence.
fn merge_json(base: serde_json::Value, override_val: serde_json::Value) -> serde_json::Value {
    match (base, override_val) {
        (serde_json::Value::Object(mut base_map), serde_json::Value::Object(override_map)) => {
            for (key, override_v) in override_map {
                let merged = if let Some(base_v) = base_map.remove(&key) {
                    merge_json(base_v, override_v)
                } else {
                    override_v
                };
                base_map.insert(key, merged);
            }
            serde_json::Value::Object(base_map)
        }
        (_, override_val) => override_val,
    }
}
