//! Configuration models for qmd-repair.
//!
//! All I^R (resolvable ignorance) is parameterized here. Every section
//! defaults, so the tool runs without a config file against the standard
//! dataset file names.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Default literal that marks a templated, low-quality hyde field.
pub const DEFAULT_BAD_PATTERN: &str = "comprehensive guide covers everything";

/// Default number of queries per generation call.
pub const DEFAULT_BATCH_SIZE: usize = 25;

/// Upper bound on `endpoint.max_retries`.
pub const MAX_RETRIES_LIMIT: u32 = 10;

/// Top-level configuration for qmd-repair.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Generation service endpoint
    #[serde(default)]
    pub endpoint: EndpointConfig,

    /// Model used to regenerate hyde fields
    #[serde(default)]
    pub model: ModelSpec,

    /// Hyde regeneration pipeline settings
    #[serde(default)]
    pub hyde: HydeConfig,

    /// Lex filler normalizer settings
    #[serde(default)]
    pub lex: LexConfig,
}

/// OpenAI-compatible chat-completions endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// API key (can also be set via the `api_key_env` variable)
    #[serde(default)]
    pub api_key: Option<String>,

    /// Environment variable name for API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Base URL for the API
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Transport attempts per generation call (1 to 10)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_timeout() -> u64 {
    180
}

fn default_max_retries() -> u32 {
    3
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_key_env: default_api_key_env(),
            base_url: default_base_url(),
            timeout_secs: default_timeout(),
            max_retries: default_max_retries(),
        }
    }
}

/// Specification for the generation model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Model ID as understood by the endpoint
    #[serde(default = "default_model_id")]
    pub id: String,

    /// Maximum completion tokens
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Sampling temperature
    #[serde(default = "default_temperature")]
    pub temperature: f64,
}

fn default_model_id() -> String {
    "gpt-4o-mini".to_string()
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_temperature() -> f64 {
    0.7
}

impl Default for ModelSpec {
    fn default() -> Self {
        Self {
            id: default_model_id(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
        }
    }
}

/// Hyde regeneration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HydeConfig {
    /// Input JSONL dataset
    #[serde(default = "default_input")]
    pub input: PathBuf,

    /// Output JSONL dataset
    #[serde(default = "default_hyde_output")]
    pub output: PathBuf,

    /// Checkpoint document
    #[serde(default = "default_checkpoint")]
    pub checkpoint: PathBuf,

    /// Literal substring marking a defective hyde field
    #[serde(default = "default_bad_pattern")]
    pub bad_pattern: String,

    /// Queries per generation call
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_input() -> PathBuf {
    PathBuf::from("qmd_expansion_v2.jsonl")
}

fn default_hyde_output() -> PathBuf {
    PathBuf::from("qmd_expansion_v3.jsonl")
}

fn default_checkpoint() -> PathBuf {
    PathBuf::from("fix_hyde_checkpoint.json")
}

fn default_bad_pattern() -> String {
    DEFAULT_BAD_PATTERN.to_string()
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

impl Default for HydeConfig {
    fn default() -> Self {
        Self {
            input: default_input(),
            output: default_hyde_output(),
            checkpoint: default_checkpoint(),
            bad_pattern: default_bad_pattern(),
            batch_size: default_batch_size(),
        }
    }
}

/// Lex normalizer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LexConfig {
    /// Input JSONL dataset
    #[serde(default = "default_input")]
    pub input: PathBuf,

    /// Output JSONL dataset
    #[serde(default = "default_lex_output")]
    pub output: PathBuf,

    /// Filler terms, applied in order
    #[serde(default = "default_fillers")]
    pub fillers: Vec<String>,

    /// Number of before/after samples to log
    #[serde(default = "default_sample_limit")]
    pub sample_limit: usize,
}

fn default_lex_output() -> PathBuf {
    PathBuf::from("qmd_expansion_v3_lex_fixed.jsonl")
}

/// The standard filler list.
pub fn default_fillers() -> Vec<String> {
    [
        "overview",
        "tutorial",
        "guide",
        "examples",
        "documentation",
        "best practices",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_sample_limit() -> usize {
    15
}

impl Default for LexConfig {
    fn default() -> Self {
        Self {
            input: default_input(),
            output: default_lex_output(),
            fillers: default_fillers(),
            sample_limit: default_sample_limit(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_owned(),
            source: e,
        })?;

        Self::from_toml(&content).map_err(|e| ConfigError::Parse {
            path: path.to_owned(),
            source: e,
        })
    }

    /// Parse configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Resolve the endpoint API key from config or environment.
    pub fn resolve_api_key(&self) -> Result<String, ConfigError> {
        if let Some(key) = &self.endpoint.api_key {
            return Ok(expand_env_vars(key));
        }

        std::env::var(&self.endpoint.api_key_env).map_err(|_| ConfigError::MissingApiKey {
            env_var: self.endpoint.api_key_env.clone(),
        })
    }

    /// Check values that deserialize fine but cannot run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_RETRIES_LIMIT).contains(&self.endpoint.max_retries) {
            return Err(ConfigError::Invalid(format!(
                "endpoint.max_retries must be between 1 and {MAX_RETRIES_LIMIT}"
            )));
        }
        if self.hyde.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "hyde.batch_size must be at least 1".to_string(),
            ));
        }
        if self.hyde.bad_pattern.is_empty() {
            return Err(ConfigError::Invalid(
                "hyde.bad_pattern must not be empty".to_string(),
            ));
        }
        if self.lex.fillers.iter().any(|f| f.trim().is_empty()) {
            return Err(ConfigError::Invalid(
                "lex.fillers must not contain empty terms".to_string(),
            ));
        }
        Ok(())
    }
}

/// Expand environment variables in a string.
///
/// Supports ${VAR_NAME} syntax.
/// If the variable is not set, the placeholder is left unchanged.
pub fn expand_env_vars(s: &str) -> String {
    static ENV_VAR: OnceLock<Regex> = OnceLock::new();
    let re = ENV_VAR.get_or_init(|| Regex::new(r"\$\{([^}]+)\}").expect("valid env var regex"));

    let mut result = s.to_string();
    for cap in re.captures_iter(s) {
        if let Ok(value) = std::env::var(&cap[1]) {
            result = result.replace(&cap[0], &value);
        }
    }
    result
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Missing API key: set {env_var} env var or endpoint.api_key in config")]
    MissingApiKey { env_var: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.hyde.batch_size, 25);
        assert_eq!(config.hyde.bad_pattern, DEFAULT_BAD_PATTERN);
        assert_eq!(config.model.id, "gpt-4o-mini");
        assert_eq!(config.lex.fillers.len(), 6);
        assert_eq!(config.lex.fillers[5], "best practices");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_sections_override() {
        let config = Config::from_toml(
            r#"
[hyde]
batch_size = 10
checkpoint = "state/ckpt.json"

[model]
id = "local-model"
temperature = 0.2
"#,
        )
        .unwrap();

        assert_eq!(config.hyde.batch_size, 10);
        assert_eq!(config.hyde.checkpoint, PathBuf::from("state/ckpt.json"));
        assert_eq!(config.hyde.output, PathBuf::from("qmd_expansion_v3.jsonl"));
        assert_eq!(config.model.id, "local-model");
        assert_eq!(config.model.max_tokens, 4096);
        assert_eq!(config.endpoint.base_url, "https://api.openai.com/v1");
    }

    #[test]
    fn test_validate_rejects_zero_batch() {
        let mut config = Config::default();
        config.hyde.batch_size = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_bounds_max_retries() {
        let mut config = Config::default();
        config.endpoint.max_retries = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        config.endpoint.max_retries = 65;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        config.endpoint.max_retries = MAX_RETRIES_LIMIT;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_explicit_api_key_wins() {
        let mut config = Config::default();
        config.endpoint.api_key = Some("sk-test".to_string());
        config.endpoint.api_key_env = "QMD_REPAIR_TEST_UNSET_VAR".to_string();
        assert_eq!(config.resolve_api_key().unwrap(), "sk-test");
    }

    #[test]
    fn test_missing_api_key() {
        let mut config = Config::default();
        config.endpoint.api_key_env = "QMD_REPAIR_TEST_SURELY_UNSET".to_string();
        assert!(matches!(
            config.resolve_api_key(),
            Err(ConfigError::MissingApiKey { .. })
        ));
    }

    #[test]
    fn test_expand_env_vars_leaves_unknown() {
        assert_eq!(
            expand_env_vars("${QMD_REPAIR_TEST_SURELY_UNSET}"),
            "${QMD_REPAIR_TEST_SURELY_UNSET}"
        );
        assert_eq!(expand_env_vars("plain"), "plain");
    }
}
