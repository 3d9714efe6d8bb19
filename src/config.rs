//! Configuration management
//!
//! Two layers of configuration exist. `BridgeConfig` is process-level and is
//! loaded once at startup from YAML plus `NL_BRIDGE_`-prefixed environment
//! variables. `ApiConfig` is per-API, parsed from the plugin data the host
//! gateway attaches to each API document, and republished wholesale on every
//! update.

use std::{collections::BTreeMap, collections::HashMap, env, path::Path, path::PathBuf, time::Duration};

use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Error, Result};

/// Default chat-completions endpoint when the plugin data does not name one
pub const DEFAULT_OPENAI_ENDPOINT: &str = "https://api.openai.com/v1";
/// Default model deployment
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";
/// Default embedding model name (a directory under the models path holding
/// the ONNX graph and tokenizer)
pub const DEFAULT_EMBEDDING_MODEL: &str = "jina-embeddings-v2-base-en";
/// Default directory searched for embedding models
pub const DEFAULT_MODELS_DIR: &str = "models";
/// Minimum relevance for an operation match unless the API overrides it
pub const DEFAULT_RELEVANCE_THRESHOLD: f64 = 0.5;
/// Utterances longer than this are skipped at indexing time
pub const MAX_UTTERANCE_LENGTH: usize = 1500;

/// Process-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct BridgeConfig {
    /// Server configuration
    pub server: ServerConfig,
    /// Redis connection for the cross-API utterance store
    pub store: StoreConfig,
    /// APIs registered with the bridge, keyed by host-assigned identifier.
    /// Stands in for the host gateway's per-request API document injection.
    pub apis: HashMap<String, ApiEntry>,
    /// MCP server table
    pub mcp_servers: HashMap<String, McpServerConfig>,
}

impl BridgeConfig {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or the merged configuration
    /// does not deserialize.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed("NL_BRIDGE_").split("__"));

        figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Request timeout
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8640,
            request_timeout: Duration::from_secs(60),
        }
    }
}

/// Redis connection settings for the utterance store
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Redis URL
    pub url: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
        }
    }
}

/// One API registered with the bridge
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiEntry {
    /// Gateway-visible path prefix for this API
    pub listen_path: String,
    /// Path to the OpenAPI document (JSON) carrying the plugin extension
    pub spec_path: PathBuf,
    /// Upstream base URL requests are forwarded to after a rewrite
    #[serde(default)]
    pub upstream_url: Option<String>,
}

/// LLM provider settings for one API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Chat-completions endpoint
    pub endpoint: String,
    /// API key. Sensitive: never logged.
    pub api_key: String,
    /// Model deployment name
    pub deployment: String,
}

/// Per-API configuration, immutable once published into the config cache
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Host-assigned API identifier (never the listen path)
    pub api_id: String,
    /// Gateway-visible path prefix
    pub listen_path: String,
    /// LLM provider settings
    pub llm: LlmConfig,
    /// Embedding model name
    pub embedding_model: String,
    /// Directory holding embedding models
    pub embedding_model_dir: PathBuf,
    /// Minimum matching score to select an operation
    pub relevance_threshold: f64,
    /// Byte cap on request bodies; 0 means unlimited
    pub max_request_length: u64,
    /// Operation id -> input examples used to build the selection index.
    /// BTreeMap keeps iteration deterministic for logs and tests.
    pub select_operations: BTreeMap<String, Vec<String>>,
}

impl ApiConfig {
    /// Union of all input examples, published to the utterance store
    #[must_use]
    pub fn utterances(&self) -> Vec<String> {
        self.select_operations
            .values()
            .flat_map(|examples| examples.iter().cloned())
            .collect()
    }
}

/// Resolve one configuration value: plugin data overrides the default, the
/// environment overrides both.
fn config_value(default: &str, data: &Value, key: &str, env_var: &str) -> String {
    let mut ret = default.to_string();
    if let Some(v) = data.get(key).and_then(Value::as_str) {
        ret = v.to_string();
    }
    if let Ok(v) = env::var(env_var) {
        if !v.is_empty() {
            ret = v;
        }
    }
    ret
}

/// Parse an LLM configuration block. The environment overrides the block,
/// the block overrides the defaults; the credential is required.
///
/// # Errors
///
/// Returns an error if the credential is absent after environment overrides.
pub fn parse_llm_config(data: &Value) -> Result<LlmConfig> {
    let llm = LlmConfig {
        endpoint: config_value(DEFAULT_OPENAI_ENDPOINT, data, "endpoint", "OPENAI_ENDPOINT"),
        api_key: config_value("", data, "apiKey", "OPENAI_API_KEY"),
        deployment: config_value(DEFAULT_OPENAI_MODEL, data, "deployment", "OPENAI_MODEL"),
    };

    if llm.api_key.is_empty() {
        return Err(Error::Config(
            "missing required config for llmConfig.apiKey".to_string(),
        ));
    }
    Ok(llm)
}

/// Parse the per-API plugin data into an [`ApiConfig`] without the select
/// operations (those come from the API document's operations).
///
/// # Errors
///
/// Returns an error if the credential is absent after environment overrides.
pub fn parse_plugin_data(api_id: &str, listen_path: &str, data: &Value) -> Result<ApiConfig> {
    tracing::debug!(api_id = %api_id, "Parsing plugin data");

    let llm_data = data.get("llmConfig").cloned().unwrap_or(Value::Null);

    let relevance_threshold = match data.get("relevanceThreshold") {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(DEFAULT_RELEVANCE_THRESHOLD),
        Some(other) => {
            tracing::warn!(
                api_id = %api_id,
                value = %other,
                "Invalid relevanceThreshold, using default"
            );
            DEFAULT_RELEVANCE_THRESHOLD
        }
        None => DEFAULT_RELEVANCE_THRESHOLD,
    };

    let max_request_length = env::var("MAX_REQUEST_SIZE")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .or_else(|| data.get("maxRequestLength").and_then(Value::as_u64))
        .unwrap_or(0);

    let llm = parse_llm_config(&llm_data)?;

    let embedding_model = data
        .get("embeddingModel")
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_EMBEDDING_MODEL)
        .to_string();
    let embedding_model_dir = data
        .get("embeddingModelDir")
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_MODELS_DIR)
        .into();

    Ok(ApiConfig {
        api_id: api_id.to_string(),
        listen_path: listen_path.to_string(),
        llm,
        embedding_model,
        embedding_model_dir,
        relevance_threshold,
        max_request_length,
        select_operations: BTreeMap::new(),
    })
}

/// Log one published configuration with the credential redacted
pub fn log_api_config(config: &ApiConfig) {
    tracing::info!(
        api_id = %config.api_id,
        endpoint = %config.llm.endpoint,
        deployment = %config.llm.deployment,
        api_key = "**REDACTED**",
        operations = config.select_operations.len(),
        embedding_model = %config.embedding_model_dir.join(&config.embedding_model).display(),
        "Published API configuration"
    );
}

/// MCP server configuration. Exactly one of `url` (SSE) or `command` (stdio)
/// must be set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct McpServerConfig {
    /// SSE endpoint URL
    pub url: Option<String>,
    /// Command to spawn for stdio transport
    pub command: Option<String>,
    /// Arguments for the stdio command
    pub args: Vec<String>,
    /// Environment entries; values of the form `${VAR}` are resolved against
    /// the process environment at init
    pub env: HashMap<String, String>,
}

impl McpServerConfig {
    /// Validate that exactly one transport is configured
    ///
    /// # Errors
    ///
    /// Returns an error when neither or both of `url` and `command` are set.
    pub fn validate(&self, name: &str) -> Result<()> {
        match (&self.url, &self.command) {
            (Some(_), None) | (None, Some(_)) => Ok(()),
            (Some(_), Some(_)) => Err(Error::Config(format!(
                "MCP server {name}: both url and command configured"
            ))),
            (None, None) => Err(Error::Config(format!(
                "MCP server {name}: neither url nor command configured"
            ))),
        }
    }

    /// Resolve `${VAR}` references in the env block. A reference to an
    /// absent variable is fatal.
    ///
    /// # Errors
    ///
    /// Returns an error if a referenced variable is not set.
    pub fn resolved_env(&self, name: &str) -> Result<HashMap<String, String>> {
        let re = Regex::new(r"^\$\{([A-Za-z_][A-Za-z0-9_]*)\}$").expect("static regex");

        let mut resolved = HashMap::with_capacity(self.env.len());
        for (key, value) in &self.env {
            let value = if let Some(caps) = re.captures(value) {
                let var = &caps[1];
                env::var(var).map_err(|_| {
                    Error::Config(format!(
                        "MCP server {name}: environment variable {var} is not set"
                    ))
                })?
            } else {
                value.clone()
            };
            resolved.insert(key.clone(), value);
        }
        Ok(resolved)
    }
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to a human-readable string (e.g., "30s")
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}s", duration.as_secs()))
    }

    /// Deserialize a human-readable duration string (e.g., "30s", "5m", "100ms")
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;

        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(serde::de::Error::custom)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>()
                .map(|m| Duration::from_secs(m * 60))
                .map_err(serde::de::Error::custom)
        } else {
            s.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn clear_llm_env() {
        env::remove_var("OPENAI_ENDPOINT");
        env::remove_var("OPENAI_API_KEY");
        env::remove_var("OPENAI_MODEL");
        env::remove_var("MAX_REQUEST_SIZE");
    }

    #[test]
    fn plugin_data_defaults() {
        clear_llm_env();
        let data = json!({"llmConfig": {"apiKey": "k"}});
        let config = parse_plugin_data("api-1", "/svc/", &data).unwrap();
        assert_eq!(config.llm.endpoint, DEFAULT_OPENAI_ENDPOINT);
        assert_eq!(config.llm.deployment, DEFAULT_OPENAI_MODEL);
        assert_eq!(config.relevance_threshold, DEFAULT_RELEVANCE_THRESHOLD);
        assert_eq!(config.max_request_length, 0);
        assert_eq!(config.api_id, "api-1");
        assert_eq!(config.listen_path, "/svc/");
    }

    #[test]
    fn plugin_data_missing_credential_is_fatal() {
        clear_llm_env();
        let data = json!({});
        let err = parse_plugin_data("api-1", "/svc/", &data).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn plugin_data_threshold_override() {
        let data = json!({"llmConfig": {"apiKey": "k"}, "relevanceThreshold": 0.8});
        let config = parse_plugin_data("api-1", "/svc/", &data).unwrap();
        assert_eq!(config.relevance_threshold, 0.8);
    }

    #[test]
    fn plugin_data_bad_threshold_falls_back() {
        let data = json!({"llmConfig": {"apiKey": "k"}, "relevanceThreshold": "high"});
        let config = parse_plugin_data("api-1", "/svc/", &data).unwrap();
        assert_eq!(config.relevance_threshold, DEFAULT_RELEVANCE_THRESHOLD);
    }

    #[test]
    fn utterances_union_all_examples() {
        let data = json!({"llmConfig": {"apiKey": "k"}});
        let mut config = parse_plugin_data("api-1", "/svc/", &data).unwrap();
        config
            .select_operations
            .insert("a".to_string(), vec!["one".to_string(), "two".to_string()]);
        config
            .select_operations
            .insert("b".to_string(), vec!["three".to_string()]);
        assert_eq!(config.utterances(), vec!["one", "two", "three"]);
    }

    #[test]
    fn mcp_config_requires_exactly_one_transport() {
        let neither = McpServerConfig::default();
        assert!(neither.validate("s").is_err());

        let sse = McpServerConfig {
            url: Some("http://127.0.0.1:8088/sse".to_string()),
            ..Default::default()
        };
        assert!(sse.validate("s").is_ok());

        let both = McpServerConfig {
            url: Some("http://x/sse".to_string()),
            command: Some("python".to_string()),
            ..Default::default()
        };
        assert!(both.validate("s").is_err());
    }

    #[test]
    fn mcp_env_resolution() {
        env::set_var("NL_BRIDGE_TEST_TOKEN", "tok-123");
        let config = McpServerConfig {
            command: Some("docker".to_string()),
            env: HashMap::from([
                ("TOKEN".to_string(), "${NL_BRIDGE_TEST_TOKEN}".to_string()),
                ("PLAIN".to_string(), "as-is".to_string()),
            ]),
            ..Default::default()
        };
        let resolved = config.resolved_env("s").unwrap();
        assert_eq!(resolved.get("TOKEN").unwrap(), "tok-123");
        assert_eq!(resolved.get("PLAIN").unwrap(), "as-is");
    }

    #[test]
    fn mcp_env_missing_variable_is_fatal() {
        let config = McpServerConfig {
            command: Some("docker".to_string()),
            env: HashMap::from([(
                "TOKEN".to_string(),
                "${NL_BRIDGE_DEFINITELY_UNSET_VAR}".to_string(),
            )]),
            ..Default::default()
        };
        assert!(config.resolved_env("s").is_err());
    }

    #[test]
    fn duration_parsing() {
        #[derive(Deserialize)]
        struct Wrapper {
            #[serde(with = "humantime_serde")]
            d: Duration,
        }
        let w: Wrapper = serde_yaml::from_str("d: 5m").unwrap();
        assert_eq!(w.d, Duration::from_secs(300));
        let w: Wrapper = serde_yaml::from_str("d: 100ms").unwrap();
        assert_eq!(w.d, Duration::from_millis(100));
    }
}
