//! Configuration loading and types for blobdrop.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct.  Every field has a default, so a missing file or an
//! empty document yields a runnable configuration.  The flash-cookie
//! signing key is the one value that should always come from outside:
//! `SECRET_KEY` in the environment wins over the file.

use serde::Deserialize;
use std::path::Path;

/// Environment variable that overrides `session.secret_key`.
pub const SECRET_KEY_ENV: &str = "SECRET_KEY";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Session (flash cookie) settings.
    #[serde(default)]
    pub session: SessionConfig,

    /// Blob storage settings.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Observability settings.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind host address.
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Graceful shutdown timeout in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,

    /// Maximum accepted file size in bytes (default 16 MiB).
    #[serde(default = "default_max_upload_size")]
    pub max_upload_size: usize,

    /// HTML template for the upload form.  Falls back to an inline page
    /// when the file cannot be read.
    #[serde(default = "default_template_path")]
    pub template_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            shutdown_timeout: default_shutdown_timeout(),
            max_upload_size: default_max_upload_size(),
            template_path: default_template_path(),
        }
    }
}

/// Flash-message cookie settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionConfig {
    /// HMAC key used to sign the flash cookie.  There is no
    /// built-in value; see [`Config::resolve_secret_key`].
    #[serde(default)]
    pub secret_key: Option<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Observability settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Enable Prometheus metrics collection and the `/metrics` endpoint.
    #[serde(default = "default_true")]
    pub metrics: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self { metrics: true }
    }
}

/// Blob storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Backend type: `azure` or `memory`.
    #[serde(default = "default_storage_backend")]
    pub backend: String,

    /// Azure Blob Storage settings.
    #[serde(default)]
    pub azure: AzureStorageConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            azure: AzureStorageConfig::default(),
        }
    }
}

/// Azure Blob Storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AzureStorageConfig {
    /// Storage account name.
    #[serde(default = "default_account")]
    pub account: String,

    /// Target container, created on first upload.
    #[serde(default = "default_container")]
    pub container: String,

    /// Blob service endpoint override.  Defaults to
    /// `https://{account}.blob.core.windows.net`.
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Client id of a user-assigned managed identity.  When unset the
    /// system-assigned identity is used.
    #[serde(default)]
    pub managed_identity_client_id: Option<String>,
}

impl Default for AzureStorageConfig {
    fn default() -> Self {
        Self {
            account: default_account(),
            container: default_container(),
            endpoint: None,
            managed_identity_client_id: None,
        }
    }
}

impl AzureStorageConfig {
    /// The blob service base URL, without a trailing slash.
    pub fn endpoint_url(&self) -> String {
        match &self.endpoint {
            Some(endpoint) => endpoint.trim_end_matches('/').to_string(),
            None => format!("https://{}.blob.core.windows.net", self.account),
        }
    }
}

impl Config {
    /// `host:port` for the HTTP listener.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Resolve the flash-cookie signing key.
    ///
    /// `SECRET_KEY` from the environment takes precedence over the config
    /// file.  Returns `None` when neither is set (or both are blank); the
    /// caller decides what to do about it.
    pub fn resolve_secret_key(&self) -> Option<String> {
        Self::pick_secret(
            std::env::var(SECRET_KEY_ENV).ok(),
            self.session.secret_key.clone(),
        )
    }

    fn pick_secret(env: Option<String>, file: Option<String>) -> Option<String> {
        env.into_iter()
            .chain(file)
            .find(|key| !key.trim().is_empty())
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_max_upload_size() -> usize {
    16 * 1024 * 1024
}

fn default_template_path() -> String {
    "templates/index.html".to_string()
}

fn default_storage_backend() -> String {
    "azure".to_string()
}

fn default_account() -> String {
    "stfiledevo7bbcldbbn".to_string()
}

fn default_container() -> String {
    "uploads".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

// -- Loader ------------------------------------------------------------------

/// Load and parse configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    parse_config(&contents)
}

/// Parse configuration from YAML text.  An empty document yields defaults.
pub fn parse_config(contents: &str) -> anyhow::Result<Config> {
    if contents.trim().is_empty() {
        return Ok(Config::default());
    }
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.bind_addr(), "0.0.0.0:8000");
        assert_eq!(config.server.max_upload_size, 16 * 1024 * 1024);
        assert_eq!(config.storage.backend, "azure");
        assert_eq!(config.storage.azure.container, "uploads");
        assert!(config.session.secret_key.is_none());
    }

    #[test]
    fn test_empty_document_is_default() {
        let config = parse_config("  \n").unwrap();
        assert_eq!(config.server.port, 8000);
    }

    #[test]
    fn test_partial_yaml() {
        let yaml = r#"
server:
  port: 9100
storage:
  backend: memory
  azure:
    account: devaccount
    endpoint: http://127.0.0.1:10000/devaccount/
"#;
        let config = parse_config(yaml).unwrap();
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.storage.backend, "memory");
        assert_eq!(config.storage.azure.container, "uploads");
        assert_eq!(
            config.storage.azure.endpoint_url(),
            "http://127.0.0.1:10000/devaccount"
        );
    }

    #[test]
    fn test_default_endpoint_url() {
        let azure = AzureStorageConfig::default();
        assert_eq!(
            azure.endpoint_url(),
            "https://stfiledevo7bbcldbbn.blob.core.windows.net"
        );
    }

    #[test]
    fn test_secret_env_wins_over_file() {
        let picked = Config::pick_secret(Some("from-env".into()), Some("from-file".into()));
        assert_eq!(picked.as_deref(), Some("from-env"));
    }

    #[test]
    fn test_secret_blank_values_ignored() {
        let picked = Config::pick_secret(Some("   ".into()), Some("from-file".into()));
        assert_eq!(picked.as_deref(), Some("from-file"));
        assert!(Config::pick_secret(None, Some(String::new())).is_none());
        assert!(Config::pick_secret(None, None).is_none());
    }

    #[test]
    fn test_example_file_parses() {
        let config = parse_config(include_str!("../blobdrop.example.yaml")).unwrap();
        assert_eq!(config.bind_addr(), "0.0.0.0:8000");
        assert_eq!(config.server.max_upload_size, 16 * 1024 * 1024);
        assert_eq!(config.storage.azure.account, "stfiledevo7bbcldbbn");
        assert!(config.session.secret_key.is_none());
        assert!(config.observability.metrics);
    }

    #[test]
    fn test_unknown_backend_parses() {
        let config = parse_config("storage:\n  backend: nope\n").unwrap();
        assert_eq!(config.storage.backend, "nope");
    }
}
