//! Configuration Loader
//!
//! Environment-aware layering on top of the `config` crate. Files are optional; the
//! directory itself is only required when passed explicitly.

use super::error::{ConfigResult, ConfigurationError};
use super::OrchestratorConfig;
use config::{Config, Environment, File};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

const CONFIG_BASENAME: &str = "orchestrator";
const CONFIG_EXTENSIONS: [&str; 3] = ["toml", "yaml", "yml"];
const ENV_PREFIX: &str = "ORCHESTRATOR";

pub struct ConfigManager {
    config: OrchestratorConfig,
    environment: String,
    config_directory: PathBuf,
}

impl ConfigManager {
    /// Load configuration with environment auto-detection
    pub fn load() -> ConfigResult<Arc<ConfigManager>> {
        let environment = Self::detect_environment();
        Self::build(PathBuf::from("config"), &environment)
    }

    /// Load from an explicit directory and environment without touching process env
    /// detection. The directory must exist.
    pub fn load_from_directory_with_env(
        config_dir: impl Into<PathBuf>,
        environment: &str,
    ) -> ConfigResult<Arc<ConfigManager>> {
        let config_directory = config_dir.into();
        if !config_directory.is_dir() {
            return Err(ConfigurationError::DirectoryNotFound {
                path: config_directory,
            });
        }
        Self::build(config_directory, environment)
    }

    /// Wrap an already-built configuration, e.g. in tests.
    pub fn from_config(config: OrchestratorConfig) -> ConfigResult<Arc<ConfigManager>> {
        config.validate()?;
        let environment = config.execution.environment.clone();
        Ok(Arc::new(ConfigManager {
            config,
            environment,
            config_directory: PathBuf::from("config"),
        }))
    }

    fn build(config_directory: PathBuf, environment: &str) -> ConfigResult<Arc<ConfigManager>> {
        debug!(
            "Loading configuration for environment '{}' from directory: {}",
            environment,
            config_directory.display()
        );

        let mut config = Self::load_and_merge_config(&config_directory, environment)?;
        config.execution.environment = environment.to_string();
        config.validate()?;

        debug!(
            "Configuration loaded: {}",
            serde_json::to_string(&Self::sanitize_config_for_logging(&config))
                .unwrap_or_else(|_| "[serialization error]".to_string())
        );

        info!(
            environment = environment,
            dispatch_workers = config.workers.dispatch_workers,
            max_retries = config.retry.max_retries,
            "⚙️ CONFIG: Configuration loaded successfully"
        );

        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
            config_directory,
        }))
    }

    fn load_and_merge_config(
        config_directory: &Path,
        environment: &str,
    ) -> ConfigResult<OrchestratorConfig> {
        let defaults = Config::try_from(&OrchestratorConfig::default())
            .map_err(|e| ConfigurationError::load_error(environment, e))?;

        let mut builder = Config::builder().add_source(defaults);
        for stem in [
            CONFIG_BASENAME.to_string(),
            format!("{CONFIG_BASENAME}.{environment}"),
        ] {
            if let Some(path) = Self::find_config_file(config_directory, &stem) {
                debug!("Found configuration file: {}", path.display());
                builder = builder.add_source(File::from(path));
            }
        }

        builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("retry.delays_seconds"),
            )
            .build()
            .and_then(|merged| merged.try_deserialize::<OrchestratorConfig>())
            .map_err(|e| ConfigurationError::load_error(environment, e))
    }

    fn find_config_file(config_directory: &Path, stem: &str) -> Option<PathBuf> {
        CONFIG_EXTENSIONS
            .iter()
            .map(|ext| config_directory.join(format!("{stem}.{ext}")))
            .find(|path| path.is_file())
    }

    /// Mask credentials embedded in the database URL.
    fn sanitize_config_for_logging(config: &OrchestratorConfig) -> serde_json::Value {
        let mut json = serde_json::json!(config);
        if let Some(url) = json.pointer_mut("/database/url") {
            if let Some(raw) = url.as_str() {
                *url = serde_json::Value::String(Self::mask_url_credentials(raw));
            }
        }
        json
    }

    fn mask_url_credentials(url: &str) -> String {
        match (url.find("://"), url.rfind('@')) {
            (Some(scheme_end), Some(at)) if at > scheme_end => {
                format!("{}://***{}", &url[..scheme_end], &url[at..])
            }
            _ => url.to_string(),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn config_directory(&self) -> &Path {
        &self.config_directory
    }

    /// `ORCHESTRATOR_ENV || APP_ENV || 'development'`
    pub fn detect_environment() -> String {
        env::var("ORCHESTRATOR_ENV")
            .or_else(|_| env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string())
            .to_lowercase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_empty_directory_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let manager = ConfigManager::load_from_directory_with_env(dir.path(), "test").unwrap();

        assert_eq!(manager.environment(), "test");
        assert!(manager.config().is_test_environment());
        assert_eq!(manager.config().retry.max_retries, 3);
    }

    #[test]
    fn test_environment_file_overrides_base_file() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("orchestrator.toml"),
            "[retry]\nmax_retries = 5\n\n[selector]\ncpu_divisor = 20.0\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("orchestrator.staging.toml"),
            "[retry]\nmax_retries = 7\n",
        )
        .unwrap();

        let manager = ConfigManager::load_from_directory_with_env(dir.path(), "staging").unwrap();
        assert_eq!(manager.config().retry.max_retries, 7);
        assert_eq!(manager.config().selector.cpu_divisor, 20.0);
        assert_eq!(manager.config().retry.delays_seconds, vec![10, 20, 30]);
    }

    #[test]
    fn test_invalid_file_values_fail_validation() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("orchestrator.toml"),
            "[locks]\nexpiry_seconds = -1\n",
        )
        .unwrap();

        let result = ConfigManager::load_from_directory_with_env(dir.path(), "test");
        assert!(matches!(
            result,
            Err(ConfigurationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_missing_directory_is_an_error() {
        let result = ConfigManager::load_from_directory_with_env("/nonexistent/orchestrator", "test");
        assert!(matches!(
            result,
            Err(ConfigurationError::DirectoryNotFound { .. })
        ));
    }

    #[test]
    fn test_url_credentials_are_masked() {
        assert_eq!(
            ConfigManager::mask_url_credentials("postgresql://user:secret@db:5432/app"),
            "postgresql://***@db:5432/app"
        );
        assert_eq!(
            ConfigManager::mask_url_credentials("postgresql://db/app"),
            "postgresql://db/app"
        );
    }
}
