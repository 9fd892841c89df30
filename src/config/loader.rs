//! Configuration Loader
//!
//! Layers built-in defaults, an optional configuration file and
//! `REALTIME_SYNC_*` environment variables into a validated [`SyncConfig`].

use super::error::{ConfigResult, ConfigurationError};
use super::SyncConfig;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Prefix for environment overrides, e.g. `REALTIME_SYNC_MAX_RETRIES=5`
pub const ENV_PREFIX: &str = "REALTIME_SYNC";

/// Nesting separator for environment overrides, e.g. `REALTIME_SYNC_ENDPOINT__URL`
pub const ENV_SEPARATOR: &str = "__";

/// Builder that assembles configuration sources in precedence order
#[derive(Debug, Default)]
pub struct ConfigLoader {
    file: Option<PathBuf>,
    file_required: bool,
    env_overrides: Option<HashMap<String, String>>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read an optional file; the format follows the extension (yaml, toml, json)
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self.file_required = false;
        self
    }

    /// Read a file that must exist
    pub fn with_required_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self.file_required = true;
        self
    }

    /// Use an explicit variable map instead of the process environment
    pub fn with_env_overrides(mut self, vars: HashMap<String, String>) -> Self {
        self.env_overrides = Some(vars);
        self
    }

    /// Load, merge and validate the configuration
    pub fn load(self) -> ConfigResult<SyncConfig> {
        let mut builder = config::Config::builder();

        if let Some(path) = &self.file {
            if self.file_required && !path.exists() {
                return Err(ConfigurationError::file_not_found(path.display().to_string()));
            }
            debug!(path = %path.display(), "Adding configuration file source");
            builder = builder.add_source(
                config::File::from(path.as_path()).required(self.file_required),
            );
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator(ENV_SEPARATOR)
                .try_parsing(true)
                .source(self.env_overrides.clone()),
        );

        let source_name = self
            .file
            .as_deref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "environment".to_string());

        let config: SyncConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| ConfigurationError::load_failed(source_name.clone(), e))?;

        config.validate()?;

        debug!(
            config = %sanitize_config_for_logging(&config),
            "Realtime sync configuration resolved"
        );
        info!(
            source = %source_name,
            max_retries = config.max_retries,
            circuit_breaker_threshold = config.circuit_breaker_threshold,
            polling_interval_ms = config.polling_interval_ms,
            "Configuration loaded successfully"
        );

        Ok(config)
    }

    /// Load from a file path only (plus environment)
    pub fn load_file(path: &Path) -> ConfigResult<SyncConfig> {
        Self::new().with_required_file(path).load()
    }
}

/// JSON view of the configuration with credentials masked
pub fn sanitize_config_for_logging(config: &SyncConfig) -> serde_json::Value {
    let mut value = serde_json::json!(config);
    let sensitive_patterns = ["key", "secret", "token", "password", "credential"];
    sanitize_json_recursive(&mut value, &sensitive_patterns);
    value
}

fn sanitize_json_recursive(value: &mut serde_json::Value, sensitive_patterns: &[&str]) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, val) in map.iter_mut() {
                let key_lower = key.to_lowercase();
                let is_sensitive = sensitive_patterns
                    .iter()
                    .any(|pattern| key_lower.contains(pattern));

                if is_sensitive {
                    *val = match val {
                        serde_json::Value::String(s) if s.is_empty() => {
                            serde_json::Value::String("[EMPTY]".to_string())
                        }
                        serde_json::Value::String(s) if s.chars().count() > 4 => {
                            let head: String = s.chars().take(2).collect();
                            let mut tail: Vec<char> = s.chars().rev().take(2).collect();
                            tail.reverse();
                            let tail: String = tail.into_iter().collect();
                            serde_json::Value::String(format!("[MASKED: {head}***{tail}]"))
                        }
                        _ => serde_json::Value::String("[MASKED]".to_string()),
                    };
                } else {
                    sanitize_json_recursive(val, sensitive_patterns);
                }
            }
        }
        serde_json::Value::Array(items) => {
            for item in items.iter_mut() {
                sanitize_json_recursive(item, sensitive_patterns);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_defaults_without_sources() {
        let config = ConfigLoader::new()
            .with_env_overrides(HashMap::new())
            .load()
            .unwrap();
        assert_eq!(config, SyncConfig::default());
    }

    #[test]
    fn test_yaml_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "max_retries: 6\npolling_interval_ms: 2500\nendpoint:\n  url: wss://realtime.example\n"
        )
        .unwrap();

        let config = ConfigLoader::new()
            .with_required_file(file.path())
            .with_env_overrides(HashMap::new())
            .load()
            .unwrap();

        assert_eq!(config.max_retries, 6);
        assert_eq!(config.polling_interval_ms, 2_500);
        assert_eq!(config.endpoint.url, "wss://realtime.example");
        assert_eq!(config.reconnection_interval_ms, 60_000);
    }

    #[test]
    fn test_environment_wins_over_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "max_retries = 6\ncircuit_breaker_threshold = 8").unwrap();

        let mut vars = HashMap::new();
        vars.insert("REALTIME_SYNC_MAX_RETRIES".to_string(), "2".to_string());
        vars.insert(
            "REALTIME_SYNC_ENDPOINT__API_KEY".to_string(),
            "anon-key-123".to_string(),
        );

        let config = ConfigLoader::new()
            .with_file(file.path())
            .with_env_overrides(vars)
            .load()
            .unwrap();

        assert_eq!(config.max_retries, 2);
        assert_eq!(config.circuit_breaker_threshold, 8);
        assert_eq!(config.endpoint.api_key, "anon-key-123");
    }

    #[test]
    fn test_missing_required_file() {
        let result = ConfigLoader::load_file(Path::new("/nonexistent/realtime-sync.yaml"));
        assert!(matches!(result, Err(ConfigurationError::FileNotFound { .. })));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let mut vars = HashMap::new();
        vars.insert("REALTIME_SYNC_MAX_RETRIES".to_string(), "0".to_string());
        let result = ConfigLoader::new().with_env_overrides(vars).load();
        assert!(matches!(result, Err(ConfigurationError::InvalidValue { .. })));
    }

    #[test]
    fn test_sanitize_masks_api_key() {
        let config = SyncConfig::default().with_endpoint(super::super::BackendEndpoint::new(
            "wss://rt",
            "super-secret-key",
        ));
        let sanitized = sanitize_config_for_logging(&config);
        assert_eq!(sanitized["endpoint"]["api_key"], "[MASKED: su***ey]");
        assert_eq!(sanitized["endpoint"]["url"], "wss://rt");
    }

    #[test]
    fn test_sanitize_masks_multibyte_api_key() {
        let config = SyncConfig::default().with_endpoint(super::super::BackendEndpoint::new(
            "wss://rt",
            "xé-secret-ké",
        ));
        let sanitized = sanitize_config_for_logging(&config);
        assert_eq!(sanitized["endpoint"]["api_key"], "[MASKED: xé***ké]");

        let short = SyncConfig::default()
            .with_endpoint(super::super::BackendEndpoint::new("wss://rt", "ééé"));
        assert_eq!(
            sanitize_config_for_logging(&short)["endpoint"]["api_key"],
            "[MASKED]"
        );
    }

    #[test]
    fn test_load_with_multibyte_secret_and_debug_logging() {
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .finish();

        let mut vars = HashMap::new();
        vars.insert(
            "REALTIME_SYNC_ENDPOINT__API_KEY".to_string(),
            "xé-secret-key".to_string(),
        );

        let config = tracing::subscriber::with_default(subscriber, || {
            ConfigLoader::new().with_env_overrides(vars).load()
        })
        .unwrap();
        assert_eq!(config.endpoint.api_key, "xé-secret-key");
    }
}
