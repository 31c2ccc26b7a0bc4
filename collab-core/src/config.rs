use collab_analytics::AnalyticsConfig;
use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Environment variable naming an explicit config file
pub const CONFIG_PATH_ENV: &str = "COLLAB_CONFIG_PATH";

/// Application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub analytics: AnalyticsConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            } else {
                return Err(ConfigError::NotFound(path.to_string()));
            }
        }

        // Nested keys use a double underscore:
        // COLLAB_ANALYTICS__QUALITY__DOWNGRADE_SUSTAIN_CYCLES=5
        builder = builder.add_source(
            Environment::with_prefix("COLLAB")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Check the whole configuration, collecting every problem found
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if crate::logging::parse_log_level(&self.logging.level).is_err() {
            errors.push(format!("logging.level '{}' is not a valid level", self.logging.level));
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be 'json' or 'pretty', got '{}'",
                self.logging.format
            ));
        }
        if let Err(analytics_errors) = self.analytics.validate() {
            errors.extend(analytics_errors.into_iter().map(|e| format!("analytics.{e}")));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Load and validate configuration
///
/// Config file search order:
/// 1. Explicit `path` argument
/// 2. `COLLAB_CONFIG_PATH` environment variable
/// 3. ./collab.yaml (current working directory)
/// 4. Fall back to environment variables only
pub fn load_config(path: Option<&str>) -> anyhow::Result<Config> {
    let config_path = path
        .map(str::to_string)
        .or_else(|| {
            std::env::var(CONFIG_PATH_ENV)
                .ok()
                .filter(|p| Path::new(p).exists())
        })
        .or_else(|| {
            let cwd = "collab.yaml";
            Path::new(cwd).exists().then(|| cwd.to_string())
        });

    let config = match &config_path {
        Some(path) => Config::from_file(path)
            .map_err(|e| anyhow::anyhow!("Failed to load config from {path}: {e}"))?,
        None => Config::from_env()?,
    };

    // Fail fast on misconfigurations
    if let Err(errors) = config.validate() {
        for error in &errors {
            tracing::error!("Config validation error: {}", error);
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s): {}",
            errors.len(),
            errors.join("; ")
        ));
    }

    info!(
        source = config_path.as_deref().unwrap_or("environment"),
        "Configuration loaded and validated"
    );
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.analytics.quality.downgrade_sustain_cycles, 3);
    }

    #[test]
    fn test_from_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "logging:\n  format: json\nanalytics:\n  window:\n    network_horizon_ms: 30000\n  quality:\n    thresholds:\n      high:\n        lower: 0.8\n        upper: 0.95"
        )
        .unwrap();

        let config = Config::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.logging.format, "json");
        assert_eq!(config.analytics.window.network_horizon_ms, 30_000);
        assert_eq!(config.analytics.window.engagement_horizon_ms, 600_000);
        assert!((config.analytics.quality.thresholds.high.upper - 0.95).abs() < f64::EPSILON);
        assert!((config.analytics.quality.thresholds.low.lower - 0.30).abs() < f64::EPSILON);
    }

    #[test]
    fn test_env_overrides() {
        std::env::set_var("COLLAB_ANALYTICS__QUALITY__UPGRADE_SUSTAIN_CYCLES", "9");
        let config = Config::from_env();
        std::env::remove_var("COLLAB_ANALYTICS__QUALITY__UPGRADE_SUSTAIN_CYCLES");

        assert_eq!(config.unwrap().analytics.quality.upgrade_sustain_cycles, 9);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(Config::from_file("/nonexistent/collab.yaml").is_err());
    }

    #[test]
    fn test_validate_collects_errors() {
        let mut config = Config::default();
        config.logging.format = "xml".to_string();
        config.analytics.coordinator.evaluation_interval_ms = 0;

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 2);
        assert!(errors[1].starts_with("analytics.coordinator"));
    }
}
