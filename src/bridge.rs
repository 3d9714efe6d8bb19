//! Bridge service
//!
//! The single owning service behind the HTTP surface: per-API config cache,
//! embedding model cache, selection indexes, the cross-API utterance store,
//! and the MCP orchestrator live here. Methods snapshot shared state under
//! read locks and release them before any embedding, LLM, store, or tool
//! call blocks.

use std::collections::HashMap;
use std::env;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, info};

use crate::config::{
    log_api_config, parse_llm_config, parse_plugin_data, ApiConfig, BridgeConfig, LlmConfig,
    McpServerConfig, DEFAULT_EMBEDDING_MODEL, DEFAULT_MODELS_DIR,
};
use crate::embedding::EmbedderCache;
use crate::index::ApiIndexStore;
use crate::llm::{ChatCompletions, OpenAiChatClient};
use crate::mcp::McpOrchestrator;
use crate::naturalize::{naturalize, UpstreamResponse};
use crate::openapi::Document;
use crate::router::{
    select_endpoint_matches, select_operation, CrossApiIndex, SelectionReply,
};
use crate::store::{service_url, UtteranceBundle, UtteranceStore, VersionedStore};
use crate::synth::{synthesize_plan, RequestParts, RewritePlan};
use crate::{Error, Result};

/// Content type of natural-language requests
pub const CONTENT_TYPE_NLQ: &str = "application/nlq";
/// Header opting a request into query rewriting
pub const HEADER_X_NL_QUERY_ENABLED: &str = "X-Nl-Query-Enabled";
/// Header selecting the response mode
pub const HEADER_X_NL_RESPONSE_TYPE: &str = "X-Nl-Response-Type";
/// Header marking configuration mutations
pub const HEADER_X_NL_CONFIG: &str = "X-Nl-Config";

/// Rewrite the response to natural language
pub const RESPONSE_TYPE_NL: &str = "nl";
/// Keep the upstream response as it is
pub const RESPONSE_TYPE_UPSTREAM: &str = "upstream";

/// Timeout for LLM calls
const LLM_TIMEOUT: Duration = Duration::from_secs(120);

/// Parse a Content-Type header and decide whether it denotes
/// `application/nlq`. Parameters are ignored; matching is case-insensitive.
#[must_use]
pub fn is_nlq_content_type(content_type: &str) -> bool {
    content_type
        .parse::<mime::Mime>()
        .map(|m| m.essence_str().eq_ignore_ascii_case(CONTENT_TYPE_NLQ))
        .unwrap_or(false)
}

/// Whether a header value counts as an opt-in
#[must_use]
pub fn is_enabled(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "yes" | "1" | "ok"
    )
}

/// Strip the listen path prefix from a request path
#[must_use]
pub fn strip_listen_path(listen_path: &str, path: &str) -> String {
    if listen_path.is_empty() {
        return path.to_string();
    }
    let stripped = path.strip_prefix(listen_path).unwrap_or(path);
    if stripped.starts_with('/') {
        stripped.to_string()
    } else {
        format!("/{stripped}")
    }
}

/// Per-request session metadata, set on receipt and read on the response
/// path
#[derive(Debug, Clone, Default)]
pub struct Session {
    /// The original natural-language query
    pub nl_query: String,
    /// Requested response mode
    pub response_type: String,
}

impl Session {
    /// Session for a natural-language request
    #[must_use]
    pub fn nl(query: impl Into<String>, response_type: impl Into<String>) -> Self {
        Self {
            nl_query: query.into(),
            response_type: response_type.into(),
        }
    }

    /// Whether the response should be rewritten to natural language
    #[must_use]
    pub fn wants_nl_response(&self) -> bool {
        self.response_type.trim().eq_ignore_ascii_case(RESPONSE_TYPE_NL)
    }
}

/// Host-supplied context for one API: identity plus its parsed document
#[derive(Clone)]
pub struct HostApi {
    /// Host-assigned API identifier
    pub api_id: String,
    /// Gateway-visible path prefix
    pub listen_path: String,
    /// The API document
    pub document: Arc<Document>,
}

impl HostApi {
    /// Build the context from a document carrying the bridge extension
    ///
    /// # Errors
    ///
    /// Returns an error when the extension is absent.
    pub fn from_document(document: Arc<Document>) -> Result<Self> {
        let bridge = document
            .bridge
            .as_ref()
            .ok_or_else(|| Error::HostContext("API document has no x-nl-bridge extension".to_string()))?;
        Ok(Self {
            api_id: bridge.id.clone(),
            listen_path: bridge.listen_path.clone(),
            document,
        })
    }
}

/// Factory building a chat client for an API's LLM configuration,
/// injectable for tests
pub type LlmFactory =
    Box<dyn Fn(&LlmConfig) -> Result<Arc<dyn ChatCompletions>> + Send + Sync>;

/// A published configuration together with its chat client
struct ApiRuntime {
    config: Arc<ApiConfig>,
    llm: Arc<dyn ChatCompletions>,
}

/// The owning bridge service
pub struct BridgeService {
    configs: RwLock<HashMap<String, Arc<ApiRuntime>>>,
    embedders: EmbedderCache,
    indexes: ApiIndexStore,
    cross_index: CrossApiIndex,
    store: VersionedStore,
    mcp: McpOrchestrator,
    mcp_servers: HashMap<String, McpServerConfig>,
    llm_factory: LlmFactory,
    /// Provider-side strict validation of the synthesis response format
    strict_synthesis: bool,
    /// Byte cap for cross-API request bodies, from `MAX_REQUEST_SIZE`
    max_request_length: u64,
}

impl BridgeService {
    /// Production service with the OpenAI-compatible chat client
    #[must_use]
    pub fn new(config: &BridgeConfig, store: Arc<dyn UtteranceStore>) -> Self {
        Self::with_parts(
            store,
            EmbedderCache::new(),
            Box::new(|llm_config| {
                Ok(Arc::new(OpenAiChatClient::new(llm_config, LLM_TIMEOUT)?)
                    as Arc<dyn ChatCompletions>)
            }),
            config.mcp_servers.clone(),
        )
    }

    /// Service with injected embedder cache and LLM factory (used by tests)
    #[must_use]
    pub fn with_parts(
        store: Arc<dyn UtteranceStore>,
        embedders: EmbedderCache,
        llm_factory: LlmFactory,
        mcp_servers: HashMap<String, McpServerConfig>,
    ) -> Self {
        Self {
            configs: RwLock::new(HashMap::new()),
            embedders,
            indexes: ApiIndexStore::new(),
            cross_index: CrossApiIndex::new(),
            store: VersionedStore::new(store),
            mcp: McpOrchestrator::new(),
            mcp_servers,
            llm_factory,
            strict_synthesis: false,
            max_request_length: env::var("MAX_REQUEST_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
        }
    }

    /// Current utterance store version
    #[must_use]
    pub fn store_version(&self) -> u64 {
        self.store.version()
    }

    /// Whether an API has a published configuration
    #[must_use]
    pub fn has_config(&self, api_id: &str) -> bool {
        self.configs.read().contains_key(api_id)
    }

    /// Whether an API has an installed selection index
    #[must_use]
    pub fn has_index(&self, api_id: &str) -> bool {
        self.indexes.contains(api_id)
    }

    /// Get the published runtime for an API, initializing it from the host
    /// context on first use.
    async fn get_or_init(&self, host: &HostApi) -> Result<Arc<ApiRuntime>> {
        if let Some(runtime) = self.configs.read().get(&host.api_id) {
            return Ok(Arc::clone(runtime));
        }

        let runtime = self.init_from_host(host).await?;
        self.configs
            .write()
            .insert(host.api_id.clone(), Arc::clone(&runtime));
        log_api_config(&runtime.config);
        Ok(runtime)
    }

    /// Parse, index, and publish one API configuration. The selection index
    /// is installed before the configuration becomes visible so a reader
    /// observing the config also observes its index.
    async fn init_from_host(&self, host: &HostApi) -> Result<Arc<ApiRuntime>> {
        let plugin_data = host
            .document
            .bridge
            .as_ref()
            .map(|b| b.plugin_config.clone())
            .unwrap_or(Value::Null);

        let mut config = parse_plugin_data(&host.api_id, &host.listen_path, &plugin_data)?;
        config.select_operations = materialize_select_operations(&host.document);

        if !config.select_operations.is_empty() {
            // Load the embedder before building indices
            let embedder = self
                .embedders
                .get(&config.embedding_model_dir, &config.embedding_model)?;
            self.indexes
                .rebuild(&host.api_id, &config.select_operations, embedder.as_ref());
        }

        let bundle = UtteranceBundle {
            name: config.api_id.clone(),
            url: service_url(&config.api_id, &config.listen_path),
            utterances: config.utterances(),
        };
        self.store.save(&host.api_id, &bundle).await?;

        let llm = (self.llm_factory)(&config.llm)?;
        Ok(Arc::new(ApiRuntime {
            config: Arc::new(config),
            llm,
        }))
    }

    /// Replace an API's configuration wholesale
    ///
    /// # Errors
    ///
    /// Returns an error if re-initialization fails; the previous
    /// configuration stays published then.
    pub async fn update_config(&self, host: &HostApi) -> Result<()> {
        info!(api_id = %host.api_id, "Updating API configuration");
        let runtime = self.init_from_host(host).await?;
        self.configs
            .write()
            .insert(host.api_id.clone(), Arc::clone(&runtime));
        log_api_config(&runtime.config);
        Ok(())
    }

    /// Drop an API: cache entry, selection index, and store record
    ///
    /// # Errors
    ///
    /// Returns an error if the store record cannot be removed.
    pub async fn delete_config(&self, api_id: &str) -> Result<()> {
        info!(api_id = %api_id, "Deleting API configuration");
        self.store.delete(api_id).await?;
        self.configs.write().remove(api_id);
        self.indexes.remove(api_id);
        Ok(())
    }

    /// Intra-API flow: select the best operation for the utterance and
    /// synthesize a rewrite plan for it. Returns the session to attach to
    /// the request.
    ///
    /// # Errors
    ///
    /// `NoMatchingOperation` when nothing clears the API's threshold,
    /// `PayloadTooLarge` when the utterance exceeds the configured cap, or
    /// a synthesis error.
    pub async fn select_and_plan(
        &self,
        host: &HostApi,
        utterance: &str,
    ) -> Result<(RewritePlan, Session)> {
        let runtime = self.get_or_init(host).await?;
        let config = &runtime.config;

        if config.max_request_length > 0 && utterance.len() as u64 > config.max_request_length {
            return Err(Error::PayloadTooLarge);
        }

        let session = Session::nl(utterance, RESPONSE_TYPE_NL);

        // Snapshot index and embedder, then embed without locks held
        let index = self.indexes.get(&host.api_id)?;
        let embedder = self
            .embedders
            .get(&config.embedding_model_dir, &config.embedding_model)?;

        let matched = select_operation(index.as_ref(), embedder.as_ref(), utterance)?
            .filter(|m| m.relevance >= config.relevance_threshold)
            .ok_or(Error::NoMatchingOperation)?;
        debug!(
            operation = %matched.operation_id,
            relevance = matched.relevance,
            "Selected operation"
        );

        let route = host
            .document
            .find_by_operation_id(&matched.operation_id)
            .ok_or(Error::NoMatchingOperation)?;

        let resolver = host.document.resolver();
        let plan = synthesize_plan(
            runtime.llm.as_ref(),
            &route,
            &resolver,
            utterance,
            self.strict_synthesis,
        )
        .await?;

        Ok((plan, session))
    }

    /// Opt-in flow: the request already names a concrete route; rewrite it
    /// in place from the utterance.
    ///
    /// # Errors
    ///
    /// `RouteNotFound` when the path does not map to an operation, or a
    /// synthesis error.
    pub async fn plan_for_route(
        &self,
        host: &HostApi,
        parts: &RequestParts,
        utterance: &str,
    ) -> Result<(RewritePlan, HashMap<String, String>)> {
        let runtime = self.get_or_init(host).await?;

        let stripped = strip_listen_path(&host.listen_path, &parts.path);
        let (route, path_params) = host
            .document
            .match_route(parts.method.as_str(), &stripped)
            .ok_or(Error::RouteNotFound)?;

        let resolver = host.document.resolver();
        let plan = synthesize_plan(
            runtime.llm.as_ref(),
            &route,
            &resolver,
            utterance,
            self.strict_synthesis,
        )
        .await?;

        Ok((plan, path_params))
    }

    /// Cross-API flow: select a target service for the utterance
    ///
    /// # Errors
    ///
    /// `PayloadTooLarge` above the `MAX_REQUEST_SIZE` cap, `NoService` when
    /// nothing clears the floor, or a store/embedding error.
    pub async fn select_service(&self, utterance: &str) -> Result<url::Url> {
        if self.max_request_length > 0 && utterance.len() as u64 > self.max_request_length {
            return Err(Error::PayloadTooLarge);
        }

        let embedder = self
            .embedders
            .get(std::path::Path::new(DEFAULT_MODELS_DIR), DEFAULT_EMBEDDING_MODEL)?;

        self.cross_index
            .ensure_fresh(&self.store, embedder.as_ref())
            .await?;

        let target = self.cross_index.select(embedder.as_ref(), utterance)?;
        url::Url::parse(&target).map_err(|e| Error::Internal(format!("bad service URL: {e}")))
    }

    /// Selection debug endpoint: run each query against the API's index
    ///
    /// # Errors
    ///
    /// Returns an error when the API cannot be initialized.
    pub async fn selection_matches(
        &self,
        host: &HostApi,
        queries: &[String],
    ) -> Result<SelectionReply> {
        let runtime = self.get_or_init(host).await?;
        let index = self.indexes.get(&host.api_id)?;
        let embedder = self.embedders.get(
            &runtime.config.embedding_model_dir,
            &runtime.config.embedding_model,
        )?;
        Ok(select_endpoint_matches(
            index.as_ref(),
            embedder.as_ref(),
            queries,
        ))
    }

    /// Response path: rewrite the upstream response to natural language iff
    /// the session asked for it. Returns `None` when no rewrite applies.
    ///
    /// # Errors
    ///
    /// Returns an error if the LLM call or decompression fails.
    pub async fn naturalize_response(
        &self,
        host: &HostApi,
        session: &Session,
        response: &UpstreamResponse,
    ) -> Result<Option<String>> {
        if !session.wants_nl_response() {
            debug!("Response rewrite not requested, ignoring");
            return Ok(None);
        }

        let runtime = self.get_or_init(host).await?;
        let text = naturalize(runtime.llm.as_ref(), &session.nl_query, response).await?;
        Ok(Some(text))
    }

    /// Re-initialize the MCP subsystem: teardown, reconnect every configured
    /// server, rebuild the dispatch map.
    ///
    /// # Errors
    ///
    /// Returns an error if the LLM configuration is invalid or any server
    /// fails to connect.
    pub async fn mcp_reinit(&self) -> Result<()> {
        let llm_config = parse_llm_config(&Value::Null)?;
        let llm = (self.llm_factory)(&llm_config)?;
        self.mcp.reinit(&self.mcp_servers, llm).await
    }

    /// Run an MCP query, initializing the subsystem first when no clients
    /// exist yet.
    ///
    /// # Errors
    ///
    /// Returns an error if initialization or the query loop fails.
    pub async fn mcp_query(&self, utterance: &str) -> Result<String> {
        if !self.mcp.is_initialized() {
            self.mcp_reinit().await?;
        }
        self.mcp.query(utterance).await
    }

    /// Direct access to the orchestrator (used by tests)
    #[must_use]
    pub fn mcp(&self) -> &McpOrchestrator {
        &self.mcp
    }
}

/// Collect the select operations of a document: operations carrying
/// explicit input examples, or, when none do, every identified operation
/// with its description and summary as substitutes.
fn materialize_select_operations(
    document: &Document,
) -> std::collections::BTreeMap<String, Vec<String>> {
    let mut select = std::collections::BTreeMap::new();

    for route in document.routes() {
        let operation = route.operation;
        if operation.input_examples.is_empty() {
            continue;
        }
        let Some(operation_id) = operation.operation_id.clone() else {
            continue;
        };
        select
            .entry(operation_id)
            .or_insert_with(Vec::new)
            .extend(operation.input_examples.iter().cloned());
    }

    if select.is_empty() {
        for route in document.routes() {
            let operation = route.operation;
            let Some(operation_id) = operation.operation_id.clone() else {
                continue;
            };
            let mut examples = Vec::new();
            if let Some(description) = &operation.description {
                examples.push(description.clone());
            }
            if let Some(summary) = &operation.summary {
                examples.push(summary.clone());
            }
            select.insert(operation_id, examples);
        }
    }

    select
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nlq_content_type_matching() {
        assert!(is_nlq_content_type("application/nlq"));
        assert!(is_nlq_content_type("application/NLQ; charset=utf-8"));
        assert!(is_nlq_content_type("APPLICATION/NLQ"));
        assert!(!is_nlq_content_type("application/json"));
        assert!(!is_nlq_content_type("application/nlq+xml"));
        assert!(!is_nlq_content_type(""));
    }

    #[test]
    fn enabled_values() {
        for value in ["true", "YES", " 1 ", "ok", "Ok"] {
            assert!(is_enabled(value), "{value} should enable");
        }
        for value in ["false", "no", "0", "", "enabled"] {
            assert!(!is_enabled(value), "{value} should not enable");
        }
    }

    #[test]
    fn listen_path_stripping() {
        assert_eq!(strip_listen_path("/github/", "/github/repos"), "/repos");
        assert_eq!(strip_listen_path("", "/repos"), "/repos");
        assert_eq!(strip_listen_path("/svc", "/svc/a/b"), "/a/b");
    }

    #[test]
    fn session_response_mode() {
        assert!(Session::nl("q", "nl").wants_nl_response());
        assert!(Session::nl("q", " NL ").wants_nl_response());
        assert!(!Session::nl("q", "upstream").wants_nl_response());
        assert!(!Session::default().wants_nl_response());
    }

    #[test]
    fn select_operations_prefer_explicit_examples() {
        let document = Document::from_json(
            &serde_json::json!({
                "paths": {
                    "/a": {"get": {
                        "operationId": "a/get",
                        "summary": "s",
                        "x-nl-input-examples": ["example one"]
                    }},
                    "/b": {"get": {"operationId": "b/get", "summary": "other"}}
                }
            })
            .to_string(),
        )
        .unwrap();

        let select = materialize_select_operations(&document);
        assert_eq!(select.len(), 1);
        assert_eq!(select["a/get"], vec!["example one"]);
    }

    #[test]
    fn select_operations_fall_back_to_descriptions() {
        let document = Document::from_json(
            &serde_json::json!({
                "paths": {
                    "/a": {"get": {
                        "operationId": "a/get",
                        "description": "fetch a",
                        "summary": "a"
                    }},
                    "/b": {"get": {"summary": "unidentified"}}
                }
            })
            .to_string(),
        )
        .unwrap();

        let select = materialize_select_operations(&document);
        assert_eq!(select.len(), 1);
        assert_eq!(select["a/get"], vec!["fetch a", "a"]);
    }
}
