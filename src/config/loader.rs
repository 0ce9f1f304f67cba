//! Configuration loader with 3-tier precedence
//!
//! Priority order (highest to lowest):
//! 1. `MCP_*` environment variables
//! 2. Config file (`--config`, `$DBWS_MCP_CONFIG`, `./dbws-mcp.toml`,
//!    or `~/.config/dbws-mcp/config.toml`)
//! 3. Built-in defaults
//!
//! CLI flags are applied on top by the binary.

use crate::config::defaults::{CONFIG_PATH_ENV, PROJECT_CONFIG_FILE};
use crate::config::ServerConfig;
use crate::security::IpRule;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid value for {var}: {value:?}")]
    InvalidEnv { var: String, value: String },

    #[error("Configuration validation failed: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

pub struct ConfigLoader {
    config: ServerConfig,
    source: Option<PathBuf>,
}

impl ConfigLoader {
    /// Load configuration from the process environment.
    pub fn new(explicit: Option<PathBuf>) -> Result<Self, ConfigError> {
        Self::with_env(explicit, |name| std::env::var(name).ok())
    }

    /// Load configuration with a custom environment lookup.
    pub fn with_env<F>(explicit: Option<PathBuf>, env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let source = Self::find_config_file(explicit, &env)?;

        let mut config = match &source {
            Some(path) => {
                info!("Loading configuration from {}", path.display());
                Self::load_file(path)?
            }
            None => {
                debug!("No config file found, using built-in defaults");
                ServerConfig::default()
            }
        };

        Self::apply_env(&mut config, &env)?;

        Ok(Self { config, source })
    }

    fn find_config_file<F>(explicit: Option<PathBuf>, env: &F) -> Result<Option<PathBuf>, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        // An explicitly requested file must exist
        if let Some(path) = explicit {
            if !path.exists() {
                return Err(ConfigError::NotFound(path));
            }
            return Ok(Some(path));
        }

        let mut candidates = Vec::new();

        if let Some(path) = env(CONFIG_PATH_ENV) {
            candidates.push(PathBuf::from(path));
        }

        if let Ok(cwd) = std::env::current_dir() {
            candidates.push(cwd.join(PROJECT_CONFIG_FILE));
        }

        if let Some(config_dir) = dirs::config_dir() {
            candidates.push(config_dir.join("dbws-mcp").join("config.toml"));
        }

        Ok(candidates.into_iter().find(|path| path.exists()))
    }

    fn load_file(path: &Path) -> Result<ServerConfig, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn apply_env<F>(config: &mut ServerConfig, env: &F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = env("MCP_HOST") {
            config.server.host = v;
        }
        if let Some(v) = env("MCP_PORT") {
            config.server.port = parse_env("MCP_PORT", &v)?;
        }
        if let Some(v) = env("MCP_MAX_CONNECTIONS") {
            config.server.max_connections = parse_env("MCP_MAX_CONNECTIONS", &v)?;
        }
        if let Some(v) = env("MCP_IDLE_TIMEOUT") {
            config.server.idle_timeout_secs = parse_env("MCP_IDLE_TIMEOUT", &v)?;
        }

        if let Some(v) = env("MCP_AUTH_ENABLED") {
            config.security.auth_enabled = parse_bool("MCP_AUTH_ENABLED", &v)?;
        }
        if let Some(v) = env("MCP_AUTH_TOKEN") {
            config.security.auth_token = Some(v);
        }
        if let Some(v) = env("MCP_ALLOWED_IPS") {
            config.security.allowed_ips = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }

        if let Some(v) = env("MCP_RATE_LIMIT_REQUESTS") {
            config.rate_limiting.requests_per_window = parse_env("MCP_RATE_LIMIT_REQUESTS", &v)?;
        }
        if let Some(v) = env("MCP_RATE_LIMIT_WINDOW") {
            config.rate_limiting.window_seconds = parse_env("MCP_RATE_LIMIT_WINDOW", &v)?;
        }

        if let Some(v) = env("MCP_LOG_LEVEL") {
            config.logging.level = v;
        }
        if let Some(v) = env("MCP_LOG_FILE") {
            config.logging.file = Some(PathBuf::from(v));
        }

        if let Some(v) = env("MCP_DATABASE_SERVICE_URL") {
            config.database_service.url = v;
        }
        if let Some(v) = env("MCP_DATABASE_SERVICE_TIMEOUT") {
            config.database_service.timeout_secs = parse_env("MCP_DATABASE_SERVICE_TIMEOUT", &v)?;
        }
        if let Some(v) = env("MCP_DATABASE_SERVICE_RETRY_ATTEMPTS") {
            config.database_service.retry_attempts =
                parse_env("MCP_DATABASE_SERVICE_RETRY_ATTEMPTS", &v)?;
        }

        if let Some(v) = env("MCP_FILESYSTEM_ROOT") {
            config.filesystem.root = Some(PathBuf::from(v));
        }

        Ok(())
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn into_config(self) -> ServerConfig {
        self.config
    }

    /// Path of the config file that was loaded, if any
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }
}

impl ServerConfig {
    /// Check the whole configuration, reporting every problem at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.server.host.trim().is_empty() {
            errors.push("Host is required".to_string());
        }
        if self.server.port == 0 {
            errors.push("Port must be between 1 and 65535".to_string());
        }
        if self.server.max_connections == 0 {
            errors.push("max_connections must be greater than 0".to_string());
        }
        if self.server.idle_timeout_secs == 0 {
            errors.push("idle_timeout_secs must be greater than 0".to_string());
        }

        if self.security.auth_enabled
            && self.security.auth_token.as_deref().map_or(true, |t| t.is_empty())
        {
            errors.push("Auth token is required when authentication is enabled".to_string());
        }
        for entry in &self.security.allowed_ips {
            if let Err(e) = IpRule::parse(entry) {
                errors.push(e);
            }
        }

        if self.rate_limiting.requests_per_window == 0 {
            errors.push("requests_per_window must be greater than 0".to_string());
        }
        if self.rate_limiting.window_seconds == 0 {
            errors.push("window_seconds must be greater than 0".to_string());
        }

        match url::Url::parse(&self.database_service.url) {
            Ok(url) if url.scheme() == "http" || url.scheme() == "https" => {}
            Ok(url) => errors.push(format!(
                "Database service URL must be http(s), got scheme '{}'",
                url.scheme()
            )),
            Err(e) => errors.push(format!("Invalid database service URL: {}", e)),
        }
        if self.database_service.retry_attempts == 0 {
            errors.push("retry_attempts must be at least 1".to_string());
        }
        if self.database_service.timeout_secs == 0 {
            errors.push("Database service timeout_secs must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }
}

fn parse_env<T: FromStr>(var: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        var: var.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(var: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidEnv {
            var: var.to_string(),
            value: value.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_file_overrides_defaults() {
        let file = write_config(
            r#"
            [server]
            port = 4100

            [database_service]
            url = "http://db:9000"
            "#,
        );

        let loader =
            ConfigLoader::with_env(Some(file.path().to_path_buf()), env_from(&[])).unwrap();
        let config = loader.config();

        assert_eq!(config.server.port, 4100);
        assert_eq!(config.database_service.url, "http://db:9000");
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(loader.source(), Some(file.path()));
    }

    #[test]
    fn test_env_overrides_file() {
        let file = write_config(
            r#"
            [server]
            port = 4100

            [security]
            auth_token = "from-file"
            "#,
        );

        let env = env_from(&[
            ("MCP_PORT", "5200"),
            ("MCP_AUTH_TOKEN", "from-env"),
            ("MCP_AUTH_ENABLED", "false"),
            ("MCP_ALLOWED_IPS", "127.0.0.1, 10.0.0.0/8"),
            ("MCP_RATE_LIMIT_REQUESTS", "3"),
        ]);

        let config = ConfigLoader::with_env(Some(file.path().to_path_buf()), env)
            .unwrap()
            .into_config();

        assert_eq!(config.server.port, 5200);
        assert_eq!(config.security.auth_token.as_deref(), Some("from-env"));
        assert!(!config.security.auth_enabled);
        assert_eq!(config.security.allowed_ips, vec!["127.0.0.1", "10.0.0.0/8"]);
        assert_eq!(config.rate_limiting.requests_per_window, 3);
    }

    #[test]
    fn test_invalid_env_value_is_reported() {
        let file = write_config("");
        let result = ConfigLoader::with_env(
            Some(file.path().to_path_buf()),
            env_from(&[("MCP_PORT", "not-a-port")]),
        );

        match result {
            Err(ConfigError::InvalidEnv { var, .. }) => assert_eq!(var, "MCP_PORT"),
            other => panic!("expected InvalidEnv, got {:?}", other.map(|l| l.into_config())),
        }
    }

    #[test]
    fn test_missing_explicit_file() {
        let result = ConfigLoader::with_env(
            Some(PathBuf::from("/definitely/not/here.toml")),
            env_from(&[]),
        );
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_malformed_file() {
        let file = write_config("[server\nport = ");
        let result = ConfigLoader::with_env(Some(file.path().to_path_buf()), env_from(&[]));
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let mut config = ServerConfig::default();
        config.server.host = String::new();
        config.security.auth_enabled = true;
        config.security.auth_token = None;
        config.security.allowed_ips = vec!["not-an-ip".to_string()];
        config.rate_limiting.requests_per_window = 0;
        config.database_service.url = "ftp://db".to_string();

        match config.validate() {
            Err(ConfigError::Invalid(errors)) => {
                assert_eq!(errors.len(), 5, "{:?}", errors);
            }
            other => panic!("expected Invalid, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_rejects_zero_timeouts() {
        let mut config = ServerConfig::default();
        config.security.auth_token = Some("secret".to_string());
        config.server.idle_timeout_secs = 0;
        config.database_service.timeout_secs = 0;

        match config.validate() {
            Err(ConfigError::Invalid(errors)) => {
                assert_eq!(errors.len(), 2, "{:?}", errors);
                assert!(errors[0].contains("idle_timeout_secs"));
                assert!(errors[1].contains("timeout_secs"));
            }
            other => panic!("expected Invalid, got {:?}", other),
        }
    }

    #[test]
    fn test_zero_idle_timeout_from_env_is_rejected() {
        let loader = ConfigLoader::with_env(None, |name| match name {
            "MCP_IDLE_TIMEOUT" => Some("0".to_string()),
            "MCP_AUTH_TOKEN" => Some("secret".to_string()),
            _ => None,
        })
        .unwrap();
        assert!(matches!(loader.config().validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_accepts_auth_disabled_without_token() {
        let mut config = ServerConfig::default();
        config.security.auth_enabled = false;
        assert!(config.validate().is_ok());
    }
}
