use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config failed: {0}")]
    Read(String),
    #[error("parse config failed: {0}")]
    Parse(String),
    #[error("schema load failed: {0}")]
    SchemaLoad(String),
    #[error("schema validation failed: {0}")]
    SchemaValidation(String),
    #[error("unsupported config: {0}")]
    UnsupportedConfig(String),
    #[error("missing required setting: {0}")]
    MissingSetting(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: Server,
    pub store: Store,
    #[serde(default)]
    pub feed: Feed,
    pub classifier: Classifier,
    pub actions: Actions,
    #[serde(default)]
    pub validation: Validation,
    #[serde(default)]
    pub security: Security,
    #[serde(default)]
    pub rate_limit: RateLimit,
    #[serde(default)]
    pub resolution: Resolution,
    pub audit: Audit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub listen_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Store {
    #[serde(rename = "type")]
    pub kind: String,
    pub sqlite_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feed {
    #[serde(default = "default_reconnect_max_attempts")]
    pub reconnect_max_attempts: u32,
    #[serde(default = "default_reconnect_initial_delay_ms")]
    pub reconnect_initial_delay_ms: u64,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for Feed {
    fn default() -> Self {
        Self {
            reconnect_max_attempts: default_reconnect_max_attempts(),
            reconnect_initial_delay_ms: default_reconnect_initial_delay_ms(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classifier {
    pub endpoint: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_call_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    #[serde(default = "default_rate_limit_retry_delay_ms")]
    pub rate_limit_retry_delay_ms: u64,
    #[serde(default)]
    pub examples_always: bool,
    #[serde(default = "default_short_description_threshold")]
    pub short_description_threshold: usize,
    #[serde(default = "default_long_description_threshold")]
    pub long_description_threshold: usize,
    #[serde(default = "default_reasoning_max_chars")]
    pub reasoning_max_chars: usize,
    #[serde(default = "default_input_max_chars")]
    pub input_max_chars: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Actions {
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_call_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,
    #[serde(default = "default_retry_initial_delay_ms")]
    pub retry_initial_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Validation {
    #[serde(default = "default_min_description_length")]
    pub min_description_length: usize,
    #[serde(default = "default_max_description_length")]
    pub max_description_length: usize,
    #[serde(default)]
    pub max_request_age_hours: Option<f64>,
}

impl Default for Validation {
    fn default() -> Self {
        Self {
            min_description_length: default_min_description_length(),
            max_description_length: default_max_description_length(),
            max_request_age_hours: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Security {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_prompt_injection_keywords")]
    pub prompt_injection_keywords: Vec<String>,
    #[serde(default = "default_dangerous_instruction_patterns")]
    pub dangerous_instruction_patterns: Vec<String>,
    #[serde(default = "default_bypass_phrases")]
    pub bypass_phrases: Vec<String>,
    #[serde(default = "default_code_injection_markers")]
    pub code_injection_markers: Vec<String>,
}

impl Default for Security {
    fn default() -> Self {
        Self {
            enabled: true,
            prompt_injection_keywords: default_prompt_injection_keywords(),
            dangerous_instruction_patterns: default_dangerous_instruction_patterns(),
            bypass_phrases: default_bypass_phrases(),
            code_injection_markers: default_code_injection_markers(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimit {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_requests_per_user")]
    pub max_requests_per_user: usize,
    #[serde(default = "default_window_hours")]
    pub window_hours: u32,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            enabled: true,
            max_requests_per_user: default_max_requests_per_user(),
            window_hours: default_window_hours(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resolution {
    #[serde(default = "default_resolver_id")]
    pub resolver_id: String,
}

impl Default for Resolution {
    fn default() -> Self {
        Self {
            resolver_id: default_resolver_id(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Audit {
    pub jsonl_path: String,
}

fn default_true() -> bool {
    true
}

fn default_reconnect_max_attempts() -> u32 {
    5
}

fn default_reconnect_initial_delay_ms() -> u64 {
    5_000
}

fn default_channel_capacity() -> usize {
    256
}

fn default_model() -> String {
    "gemini-2.5-flash".to_string()
}

fn default_call_timeout_ms() -> u64 {
    30_000
}

fn default_temperature() -> f64 {
    0.2
}

fn default_max_output_tokens() -> u32 {
    500
}

fn default_rate_limit_retry_delay_ms() -> u64 {
    5_000
}

fn default_short_description_threshold() -> usize {
    20
}

fn default_long_description_threshold() -> usize {
    500
}

fn default_reasoning_max_chars() -> usize {
    200
}

fn default_input_max_chars() -> usize {
    500
}

fn default_retry_max_attempts() -> u32 {
    3
}

fn default_retry_initial_delay_ms() -> u64 {
    2_000
}

fn default_min_description_length() -> usize {
    10
}

fn default_max_description_length() -> usize {
    4_000
}

fn default_max_requests_per_user() -> usize {
    5
}

fn default_window_hours() -> u32 {
    24
}

fn default_resolver_id() -> String {
    "agent-ms".to_string()
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn default_prompt_injection_keywords() -> Vec<String> {
    strings(&[
        "ignore", "actúa", "ejecuta", "revela", "bypass", "override", "ignora", "ejecutar",
        "revelar",
    ])
}

fn default_dangerous_instruction_patterns() -> Vec<String> {
    strings(&[
        "debes hacer",
        "necesito que hagas",
        "por favor ejecuta",
        "debes",
        "necesitas",
        "tienes que",
    ])
}

fn default_bypass_phrases() -> Vec<String> {
    strings(&[
        "ignore previous instructions",
        "ignora las instrucciones anteriores",
        "olvida todo lo anterior",
        "forget everything",
        "system prompt",
        "```",
        "exec(",
        "eval(",
        "execute(",
    ])
}

fn default_code_injection_markers() -> Vec<String> {
    strings(&["<script", "<?php", "javascript:", "python:", "import "])
}

impl Config {
    pub fn classifier_api_key(&self) -> Result<String, ConfigError> {
        resolve_secret(
            self.classifier.api_key.as_deref(),
            self.classifier.api_key_env.as_deref(),
            "classifier.api_key",
        )
    }

    pub fn actions_api_key(&self) -> Result<String, ConfigError> {
        resolve_secret(
            self.actions.api_key.as_deref(),
            self.actions.api_key_env.as_deref(),
            "actions.api_key",
        )
    }
}

/// Inline value wins; otherwise the named environment variable must be set
/// and non-empty.
pub fn resolve_secret(
    inline: Option<&str>,
    env_name: Option<&str>,
    setting: &str,
) -> Result<String, ConfigError> {
    if let Some(v) = inline.map(str::trim).filter(|v| !v.is_empty()) {
        return Ok(v.to_string());
    }
    let Some(name) = env_name.map(str::trim).filter(|v| !v.is_empty()) else {
        return Err(ConfigError::MissingSetting(format!(
            "{setting} (set {setting} or {setting}_env)"
        )));
    };
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ConfigError::MissingSetting(format!(
            "{setting} (environment variable {name} is unset)"
        ))),
    }
}

pub fn load_and_validate(path: &str) -> Result<Config, ConfigError> {
    let config_text =
        std::fs::read_to_string(path).map_err(|e| ConfigError::Read(e.to_string()))?;
    let value: serde_yaml::Value =
        serde_yaml::from_str(&config_text).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let instance = serde_json::to_value(value).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_against_schema(&instance)?;

    let cfg: Config =
        serde_json::from_value(instance).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_runtime_support(&cfg)?;
    cfg.classifier_api_key()?;
    cfg.actions_api_key()?;
    Ok(cfg)
}

fn validate_against_schema(instance: &serde_json::Value) -> Result<(), ConfigError> {
    let schema_path = [
        std::path::PathBuf::from("config/config.schema.json"),
        std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .join("config/config.schema.json"),
    ]
    .into_iter()
    .find(|p| p.exists())
    .ok_or_else(|| {
        ConfigError::SchemaLoad(
            "config schema not found at config/config.schema.json or workspace config path"
                .to_string(),
        )
    })?;

    let schema_text =
        std::fs::read_to_string(schema_path).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    let schema: serde_json::Value =
        serde_json::from_str(&schema_text).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;

    let validator =
        jsonschema::validator_for(&schema).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    if let Err(first) = validator.validate(instance) {
        return Err(ConfigError::SchemaValidation(first.to_string()));
    }
    Ok(())
}

pub fn validate_runtime_support(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.store.kind != "memory" && cfg.store.kind != "sqlite" {
        return Err(ConfigError::UnsupportedConfig(format!(
            "store.type={} is not implemented; supported: memory, sqlite",
            cfg.store.kind
        )));
    }
    if cfg.store.kind == "memory" && cfg.store.sqlite_path.is_some() {
        return Err(ConfigError::UnsupportedConfig(
            "store.sqlite_path is not supported when store.type=memory".to_string(),
        ));
    }
    if cfg.store.kind == "sqlite"
        && cfg
            .store
            .sqlite_path
            .as_ref()
            .map(|v| v.trim().is_empty())
            .unwrap_or(true)
    {
        return Err(ConfigError::UnsupportedConfig(
            "store.sqlite_path is required when store.type=sqlite".to_string(),
        ));
    }
    if cfg.validation.min_description_length > cfg.validation.max_description_length {
        return Err(ConfigError::UnsupportedConfig(
            "validation.min_description_length must be <= max_description_length".to_string(),
        ));
    }
    if cfg.classifier.reasoning_max_chars < 4 || cfg.classifier.reasoning_max_chars > 200 {
        return Err(ConfigError::UnsupportedConfig(
            "classifier.reasoning_max_chars must be within 4..=200".to_string(),
        ));
    }
    if cfg.actions.retry_max_attempts == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "actions.retry_max_attempts must be >= 1".to_string(),
        ));
    }
    if cfg.feed.reconnect_max_attempts == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "feed.reconnect_max_attempts must be >= 1".to_string(),
        ));
    }
    if cfg.rate_limit.window_hours == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "rate_limit.window_hours must be >= 1".to_string(),
        ));
    }
    Ok(())
}
