//! Gateway configuration management
//!
//! This module handles loading and validating configuration from TOML files.
//! All configuration is validated at startup so a misconfigured gateway
//! never starts serving.

use crate::core::backend::BackendType;
use crate::core::template::ChatTemplate;
use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// Default TGI endpoint
const DEFAULT_TGI_BASE_URL: &str = "http://127.0.0.1:8080";

/// Default OpenAI-compatible endpoint
const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// Default generation length when the client sends no `max_tokens`
const DEFAULT_MAX_TOKENS: u32 = 256;

/// Maximum token limit default
const DEFAULT_MAX_TOKENS_LIMIT: u32 = 4096;

/// Minimum token limit default
const DEFAULT_MIN_TOKENS_LIMIT: u32 = 1;

/// Default request timeout in seconds
const DEFAULT_REQUEST_TIMEOUT: u64 = 120;

/// Default maximum retries
const DEFAULT_MAX_RETRIES: u32 = 2;

/// Default server port
const DEFAULT_PORT: u16 = 3000;

const DEFAULT_MAX_MESSAGES: u32 = 64;

const DEFAULT_MAX_INPUT_CHARS: usize = 32_000;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TgiConfig {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenAIConfig {
    pub api_key: String,
    #[serde(default)]
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    pub id: String,
    #[serde(default)]
    pub served_model: Option<String>,
    #[serde(default = "default_chat_template")]
    pub chat_template: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub api_key: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RequestConfig {
    #[serde(default = "default_max_tokens")]
    pub default_max_tokens: u32,
    #[serde(default = "default_max_tokens_limit")]
    pub max_tokens_limit: u32,
    #[serde(default = "default_min_tokens_limit")]
    pub min_tokens_limit: u32,
    #[serde(default = "default_max_messages")]
    pub max_messages_limit: u32,
    #[serde(default = "default_max_input_chars")]
    pub max_input_chars: usize,
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            default_max_tokens: default_max_tokens(),
            max_tokens_limit: default_max_tokens_limit(),
            min_tokens_limit: default_min_tokens_limit(),
            max_messages_limit: default_max_messages(),
            max_input_chars: default_max_input_chars(),
            request_timeout: default_request_timeout(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_chat_template() -> String {
    "chatml".to_string()
}

fn default_max_tokens() -> u32 {
    DEFAULT_MAX_TOKENS
}

fn default_max_tokens_limit() -> u32 {
    DEFAULT_MAX_TOKENS_LIMIT
}

fn default_min_tokens_limit() -> u32 {
    DEFAULT_MIN_TOKENS_LIMIT
}

fn default_max_messages() -> u32 {
    DEFAULT_MAX_MESSAGES
}

fn default_max_input_chars() -> usize {
    DEFAULT_MAX_INPUT_CHARS
}

fn default_request_timeout() -> u64 {
    DEFAULT_REQUEST_TIMEOUT
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

#[derive(Debug, Clone, Deserialize)]
pub struct TomlConfig {
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default)]
    pub tgi: Option<TgiConfig>,
    #[serde(default)]
    pub openai: Option<OpenAIConfig>,
    pub model: ModelConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub request: RequestConfig,
}

fn default_backend() -> String {
    "tgi".to_string()
}

/// Token and size limits applied to every request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestLimits {
    pub default_max_tokens: u32,
    pub min_tokens: u32,
    pub max_tokens: u32,
    pub max_messages: usize,
    pub max_input_chars: usize,
}

impl Default for RequestLimits {
    fn default() -> Self {
        Self {
            default_max_tokens: DEFAULT_MAX_TOKENS,
            min_tokens: DEFAULT_MIN_TOKENS_LIMIT,
            max_tokens: DEFAULT_MAX_TOKENS_LIMIT,
            max_messages: DEFAULT_MAX_MESSAGES as usize,
            max_input_chars: DEFAULT_MAX_INPUT_CHARS,
        }
    }
}

/// Gateway configuration loaded from a TOML file
#[derive(Debug, Clone)]
pub struct Config {
    /// Backend type (TGI native or OpenAI-compatible)
    pub backend: BackendType,

    /// Backend base URL
    pub backend_url: String,

    /// Token sent to the backend as a bearer token
    pub backend_api_key: Option<String>,

    /// Model id advertised to clients
    pub model_id: String,

    /// Model name sent upstream (defaults to `model_id`)
    pub served_model: String,

    /// Prompt template used when the backend takes raw text
    pub chat_template: ChatTemplate,

    /// Server host address
    pub host: String,

    /// Server port
    pub port: u16,

    /// Logging level
    pub log_level: String,

    /// Optional key clients must present
    pub client_api_key: Option<String>,

    /// Per-request limits
    pub limits: RequestLimits,

    /// Request timeout in seconds
    pub request_timeout: u64,

    /// Maximum number of retries for non-streaming backend calls
    pub max_retries: u32,
}

impl Config {
    /// Load configuration from TOML file
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - The TOML file cannot be read or parsed
    /// - Required configuration values are missing
    /// - Configuration values are invalid
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path).context("Failed to read configuration file")?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: TomlConfig =
            toml::from_str(content).context("Failed to parse TOML configuration")?;

        let backend = BackendType::from_name(&config.backend)
            .context("Invalid backend value. Must be one of: tgi, openai")?;

        let (backend_url, backend_api_key) = match backend {
            BackendType::Tgi => {
                let tgi = config.tgi.unwrap_or_default();
                (
                    tgi.base_url
                        .unwrap_or_else(|| DEFAULT_TGI_BASE_URL.to_string()),
                    tgi.api_token,
                )
            }
            BackendType::OpenAI => {
                let openai = config
                    .openai
                    .context("OpenAI configuration missing for openai backend")?;
                if openai.api_key.trim().is_empty() {
                    bail!("openai.api_key must not be empty");
                }
                (
                    openai
                        .base_url
                        .unwrap_or_else(|| DEFAULT_OPENAI_BASE_URL.to_string()),
                    Some(openai.api_key),
                )
            }
        };

        let chat_template = ChatTemplate::from_name(&config.model.chat_template)
            .context("Invalid chat_template. Must be one of: chatml, llama2, zephyr, plain")?;

        if config.model.id.trim().is_empty() {
            bail!("model.id must not be empty");
        }

        let request = config.request;
        if request.min_tokens_limit == 0 {
            bail!("request.min_tokens_limit must be at least 1");
        }
        if request.min_tokens_limit > request.max_tokens_limit {
            bail!(
                "request.min_tokens_limit ({}) exceeds request.max_tokens_limit ({})",
                request.min_tokens_limit,
                request.max_tokens_limit
            );
        }
        if request.request_timeout == 0 {
            bail!("request.request_timeout must be at least 1 second");
        }
        if request.max_messages_limit == 0 {
            bail!("request.max_messages_limit must be at least 1");
        }

        let served_model = config
            .model
            .served_model
            .unwrap_or_else(|| config.model.id.clone());

        Ok(Config {
            backend,
            backend_url: backend_url.trim_end_matches('/').to_string(),
            backend_api_key,
            model_id: config.model.id,
            served_model,
            chat_template,
            host: config.server.host,
            port: config.server.port,
            log_level: config.server.log_level,
            client_api_key: config.server.api_key,
            limits: RequestLimits {
                default_max_tokens: request
                    .default_max_tokens
                    .clamp(request.min_tokens_limit, request.max_tokens_limit),
                min_tokens: request.min_tokens_limit,
                max_tokens: request.max_tokens_limit,
                max_messages: request.max_messages_limit as usize,
                max_input_chars: request.max_input_chars,
            },
            request_timeout: request.request_timeout,
            max_retries: request.max_retries,
        })
    }

    /// Load configuration from the path in `CONFIG_PATH`
    ///
    /// Looks for config.toml in current directory by default
    pub fn from_env() -> Result<Self> {
        let config_path =
            std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
        Self::from_file(config_path)
    }

    /// Validate client's API key
    ///
    /// If a client key is configured, the presented key must match.
    /// If not set, validation is skipped and returns true.
    pub fn validate_client_api_key(&self, client_api_key: &str) -> bool {
        match &self.client_api_key {
            Some(expected_key) => client_api_key == expected_key,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_test_config() -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
            backend = "tgi"

            [tgi]
            base_url = "http://tgi:8080/"

            [model]
            id = "HuggingFaceH4/zephyr-7b-beta"
            chat_template = "zephyr"

            [server]
            host = "127.0.0.1"
            port = 3001
            log_level = "debug"
            api_key = "client-key"

            [request]
            default_max_tokens = 128
            max_tokens_limit = 1024
            min_tokens_limit = 1
            max_messages_limit = 16
            request_timeout = 30
            max_retries = 1
        "#
        )
        .unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_load_config() {
        let file = create_test_config();
        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.backend, BackendType::Tgi);
        assert_eq!(config.backend_url, "http://tgi:8080");
        assert_eq!(config.chat_template, ChatTemplate::Zephyr);
        assert_eq!(config.served_model, "HuggingFaceH4/zephyr-7b-beta");
        assert_eq!(config.limits.default_max_tokens, 128);
        assert_eq!(config.limits.max_messages, 16);
        assert_eq!(config.port, 3001);
    }

    #[test]
    fn test_defaults_applied() {
        let config = Config::from_toml_str(
            r#"
            [model]
            id = "tgi"
        "#,
        )
        .unwrap();
        assert_eq!(config.backend, BackendType::Tgi);
        assert_eq!(config.backend_url, DEFAULT_TGI_BASE_URL);
        assert_eq!(config.chat_template, ChatTemplate::ChatMl);
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.limits, RequestLimits::default());
        assert!(config.client_api_key.is_none());
    }

    #[test]
    fn test_openai_backend_requires_section() {
        let result = Config::from_toml_str(
            r#"
            backend = "openai"
            [model]
            id = "gpt-4o-mini"
        "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_token_limits_rejected() {
        let result = Config::from_toml_str(
            r#"
            [model]
            id = "tgi"
            [request]
            min_tokens_limit = 500
            max_tokens_limit = 100
        "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_request_timeout_rejected() {
        let result = Config::from_toml_str(
            r#"
            [model]
            id = "tgi"
            [request]
            request_timeout = 0
        "#,
        );
        let err = result.unwrap_err();
        assert!(err.to_string().contains("request_timeout"));
    }

    #[test]
    fn test_unknown_template_rejected() {
        let result = Config::from_toml_str(
            r#"
            [model]
            id = "tgi"
            chat_template = "alpaca"
        "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_client_api_key() {
        let file = create_test_config();
        let config = Config::from_file(file.path()).unwrap();
        assert!(config.validate_client_api_key("client-key"));
        assert!(!config.validate_client_api_key("wrong-key"));
    }
}
