//! Tracing subscriber setup shared by the binary and integration tests.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("invalid log filter '{directives}': {message}")]
    InvalidFilter { directives: String, message: String },
    #[error("failed to install subscriber: {0}")]
    Init(String),
}

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub level: String,
    /// Emit one JSON object per event instead of human-readable lines.
    pub json: bool,
    /// Per-module level overrides (e.g. "mirage_store" => "debug").
    pub modules: BTreeMap<String, String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
            modules: BTreeMap::new(),
        }
    }
}

impl TelemetryConfig {
    /// `EnvFilter` directive string for this config.
    pub fn directives(&self) -> String {
        directives(&self.level, &self.modules)
    }
}

fn directives(level: &str, modules: &BTreeMap<String, String>) -> String {
    let mut out = level.trim().to_lowercase();
    for (module, level) in modules {
        out.push_str(&format!(",{}={}", module, level.trim().to_lowercase()));
    }
    out
}

fn build_filter(directives: &str) -> Result<EnvFilter, TelemetryError> {
    EnvFilter::try_new(directives).map_err(|e| TelemetryError::InvalidFilter {
        directives: directives.to_string(),
        message: e.to_string(),
    })
}

/// Handle to the installed subscriber. Keeps the reload handle so module
/// levels can be changed while the server runs.
pub struct TelemetryGuard {
    config: TelemetryConfig,
    from_env: bool,
    modules: Arc<RwLock<BTreeMap<String, String>>>,
    reload: reload::Handle<EnvFilter, Registry>,
}

impl TelemetryGuard {
    pub fn config(&self) -> &TelemetryConfig {
        &self.config
    }

    /// Whether RUST_LOG supplied the filter.
    pub fn filter_from_env(&self) -> bool {
        self.from_env
    }

    /// Change the log level for a specific module at runtime.
    pub fn set_module_level(&self, module: &str, level: &str) -> Result<(), TelemetryError> {
        let mut modules = self.modules.write();
        let mut next = modules.clone();
        next.insert(module.to_string(), level.to_string());
        let filter = build_filter(&directives(&self.config.level, &next))?;
        self.reload
            .reload(filter)
            .map_err(|e| TelemetryError::Init(e.to_string()))?;
        *modules = next;
        Ok(())
    }

    pub fn module_levels(&self) -> BTreeMap<String, String> {
        self.modules.read().clone()
    }
}

/// Initialize the telemetry subsystem. Call once at startup.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    let (filter, from_env) = match EnvFilter::try_from_default_env() {
        Ok(filter) => (filter, true),
        Err(_) => (build_filter(&config.directives())?, false),
    };
    let (filter_layer, reload) = reload::Layer::new(filter);

    let json_layer = config
        .json
        .then(|| tracing_subscriber::fmt::layer().json().with_target(true).with_span_list(true));
    let pretty_layer = (!config.json).then(|| tracing_subscriber::fmt::layer().with_target(true));

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(json_layer)
        .with(pretty_layer)
        .try_init()
        .map_err(|e| TelemetryError::Init(e.to_string()))?;

    Ok(TelemetryGuard {
        modules: Arc::new(RwLock::new(config.modules.clone())),
        config,
        from_env,
        reload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directives_include_module_overrides() {
        let mut config = TelemetryConfig::default();
        config.modules.insert("mirage_store".into(), "DEBUG".into());
        config.modules.insert("hyper".into(), "warn".into());
        assert_eq!(config.directives(), "info,hyper=warn,mirage_store=debug");
    }

    #[test]
    fn invalid_level_is_rejected() {
        let err = build_filter("info,mirage=loud").unwrap_err();
        assert!(matches!(err, TelemetryError::InvalidFilter { .. }));
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: TelemetryConfig = serde_json::from_str(r#"{"json": true}"#).unwrap();
        assert!(config.json);
        assert_eq!(config.level, "info");
        assert!(config.modules.is_empty());
    }

    #[test]
    fn init_then_adjust_module_level() {
        let guard = init_telemetry(TelemetryConfig::default()).unwrap();
        guard.set_module_level("mirage_server", "trace").unwrap();
        assert_eq!(guard.module_levels().get("mirage_server").map(String::as_str), Some("trace"));
        assert!(guard.set_module_level("mirage_server", "nope").is_err());
        assert_eq!(guard.module_levels().get("mirage_server").map(String::as_str), Some("trace"));
        // second global install fails
        assert!(init_telemetry(TelemetryConfig::default()).is_err());
    }
}
