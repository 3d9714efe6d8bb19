//! HTTP router and handlers
//!
//! Maps the bridge's HTTP surface onto the [`BridgeService`]:
//!
//! - `POST /mcp/init` re-initializes the MCP subsystem
//! - `POST /mcp/` runs an MCP query (`Content-Type: application/nlq`)
//! - `POST /select/` resolves a cross-API service for an utterance
//! - everything under a registered listen path is the per-API surface:
//!   config mutations (`X-Nl-Config`), natural-language requests
//!   (`application/nlq` or the `X-Nl-Query-Enabled` opt-in), and the
//!   selection debug endpoint

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::{debug, error, info};

use crate::bridge::{
    is_enabled, is_nlq_content_type, BridgeService, HostApi, Session, HEADER_X_NL_CONFIG,
    HEADER_X_NL_QUERY_ENABLED, HEADER_X_NL_RESPONSE_TYPE, RESPONSE_TYPE_NL,
};
use crate::naturalize::UpstreamResponse;
use crate::synth::RequestParts;
use crate::{Error, Result};

/// Header carrying the resolved cross-API rewrite target back to the host
pub const HEADER_X_NL_REWRITE_TARGET: &str = "X-Nl-Rewrite-Target";

/// One API registered with the router
#[derive(Clone)]
pub struct RegisteredApi {
    /// Host context for the API
    pub host: HostApi,
    /// Upstream base URL requests are forwarded to
    pub upstream_url: Option<String>,
}

/// Shared application state
pub struct AppState {
    /// The owning bridge service
    pub bridge: Arc<BridgeService>,
    /// Registered APIs in listen-path order
    pub apis: Vec<RegisteredApi>,
    /// Client used to forward rewritten requests upstream
    pub upstream: reqwest::Client,
}

impl AppState {
    /// Resolve the API owning a request path by longest listen-path prefix
    #[must_use]
    pub fn resolve(&self, path: &str) -> Option<&RegisteredApi> {
        self.apis
            .iter()
            .filter(|api| path.starts_with(&api.host.listen_path))
            .max_by_key(|api| api.host.listen_path.len())
    }
}

/// Create the router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/mcp/init", post(mcp_init_handler))
        .route("/mcp/", post(mcp_query_handler))
        .route("/select/", post(select_service_handler))
        .fallback(api_handler)
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn error_response(e: &Error) -> Response {
    (e.status(), e.user_message().to_string()).into_response()
}

/// POST /mcp/init
async fn mcp_init_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.bridge.mcp_reinit().await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => {
            error!(error = %e, "MCP re-init failed");
            error_response(&e)
        }
    }
}

/// POST /mcp/ with Content-Type: application/nlq
async fn mcp_query_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    if !has_nlq_content_type(&headers) {
        debug!("Content-Type is not application/nlq, ignoring");
        return StatusCode::OK.into_response();
    }

    match state.bridge.mcp_query(&body).await {
        Ok(answer) => (StatusCode::OK, answer).into_response(),
        Err(e) => {
            error!(error = %e, "MCP query failed");
            error_response(&e)
        }
    }
}

/// POST /select/ with Content-Type: application/nlq; answers with the
/// resolved target in a header, the way the host consumes a URL-rewrite
/// target.
async fn select_service_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    if !has_nlq_content_type(&headers) {
        debug!("Content-Type is not application/nlq, ignoring");
        return StatusCode::OK.into_response();
    }

    match state.bridge.select_service(&body).await {
        Ok(target) => {
            info!(target = %target, "Cross-API service selected");
            let mut response = StatusCode::OK.into_response();
            if let Ok(value) = HeaderValue::from_str(target.as_str()) {
                response
                    .headers_mut()
                    .insert(HEADER_X_NL_REWRITE_TARGET, value);
            }
            response
        }
        Err(e) => error_response(&e),
    }
}

fn has_nlq_content_type(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(is_nlq_content_type)
}

/// Repeated `query` parameters of the selection debug endpoint
fn selection_queries(uri: &Uri) -> Vec<String> {
    uri.query()
        .map(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .filter(|(name, _)| name == "query")
                .map(|(_, value)| value.into_owned())
                .collect()
        })
        .unwrap_or_default()
}

/// Per-API fallback handler
async fn api_handler(State(state): State<Arc<AppState>>, request: Request) -> Response {
    let path = request.uri().path().to_string();
    let Some(api) = state.resolve(&path).cloned() else {
        return StatusCode::NOT_FOUND.into_response();
    };

    // Configuration mutations
    if request.headers().contains_key(HEADER_X_NL_CONFIG) {
        return config_mutation(&state, &api.host, request.method()).await;
    }

    // Selection debug endpoint
    if request.method() == Method::GET && path.ends_with("/selection") {
        let queries = selection_queries(request.uri());
        return match state.bridge.selection_matches(&api.host, &queries).await {
            Ok(reply) => Json(reply).into_response(),
            Err(e) => error_response(&e),
        };
    }

    match nl_request(state, api, request).await {
        Ok(response) => response,
        Err(e) => error_response(&e),
    }
}

async fn config_mutation(
    state: &Arc<AppState>,
    host: &HostApi,
    method: &Method,
) -> Response {
    let result = if *method == Method::DELETE {
        state.bridge.delete_config(&host.api_id).await
    } else if *method == Method::PUT {
        state.bridge.update_config(host).await
    } else {
        Ok(())
    };

    match result {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => {
            error!(api_id = %host.api_id, error = %e, "Configuration mutation failed");
            error_response(&e)
        }
    }
}

/// Natural-language request handling: rewrite, forward, and optionally
/// naturalize the upstream response.
async fn nl_request(
    state: Arc<AppState>,
    api: RegisteredApi,
    request: Request,
) -> Result<Response> {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let headers = request.headers().clone();

    let nlq = method == Method::POST && has_nlq_content_type(&headers);
    let opt_in = should_rewrite_query(&headers);

    if !nlq && !opt_in {
        debug!("Not a natural-language request, ignoring");
        return Ok(StatusCode::OK.into_response());
    }

    let body = axum::body::to_bytes(request.into_body(), usize::MAX)
        .await
        .map_err(|e| Error::Internal(format!("failed to read request body: {e}")))?;
    let utterance = String::from_utf8_lossy(&body).to_string();

    let mut parts = request_parts(&method, &uri, &headers, &utterance);

    let session;
    if nlq {
        let (plan, bound_session) = state.bridge.select_and_plan(&api.host, &utterance).await?;
        plan.apply(&mut parts, &HashMap::new());
        debug!(path = %parts.path, method = %parts.method, "Request rewritten from selection");
        session = bound_session;
    } else {
        // Opt-in flow: the route comes from the request path. The response
        // mode header moves into the session and is stripped.
        let response_type = parts
            .headers
            .get(HEADER_X_NL_RESPONSE_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(RESPONSE_TYPE_NL)
            .to_string();
        parts.headers.remove(HEADER_X_NL_RESPONSE_TYPE);
        parts.headers.remove(HEADER_X_NL_QUERY_ENABLED);
        session = Session::nl(utterance.clone(), response_type);

        let (plan, path_params) = state
            .bridge
            .plan_for_route(&api.host, &parts, &utterance)
            .await?;
        plan.apply(&mut parts, &path_params);
        debug!(path = %parts.path, method = %parts.method, "Request rewritten for route");
    }

    forward_upstream(&state, &api, parts, &session).await
}

/// Build the mutable request view handed to the rewrite plan
fn request_parts(method: &Method, uri: &Uri, headers: &HeaderMap, body: &str) -> RequestParts {
    let query = uri
        .query()
        .map(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect()
        })
        .unwrap_or_default();

    RequestParts {
        method: method.clone(),
        path: uri.path().to_string(),
        query,
        headers: headers.clone(),
        body: if body.is_empty() {
            None
        } else {
            Some(body.to_string())
        },
    }
}

/// Forward a rewritten request upstream and run the response path
async fn forward_upstream(
    state: &Arc<AppState>,
    api: &RegisteredApi,
    parts: RequestParts,
    session: &Session,
) -> Result<Response> {
    let Some(upstream_url) = &api.upstream_url else {
        return Err(Error::Config(format!(
            "no upstream configured for api: {}",
            api.host.api_id
        )));
    };

    let mut target = url::Url::parse(upstream_url)
        .map_err(|e| Error::Config(format!("bad upstream URL: {e}")))?;
    target.set_path(&parts.path);
    target.set_query(None);
    if !parts.query.is_empty() {
        let mut pairs = target.query_pairs_mut();
        for (name, value) in &parts.query {
            pairs.append_pair(name, value);
        }
    }

    let method = reqwest::Method::from_bytes(parts.method.as_str().as_bytes())
        .map_err(|e| Error::Internal(e.to_string()))?;
    let mut builder = state.upstream.request(method, target);
    for (name, value) in &parts.headers {
        if name == header::HOST || name == header::CONTENT_LENGTH {
            continue;
        }
        builder = builder.header(name, value);
    }
    if let Some(body) = parts.body {
        builder = builder.body(body);
    }

    let upstream_response = builder.send().await.map_err(Error::from)?;
    let status =
        StatusCode::from_u16(upstream_response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut response_headers = HeaderMap::new();
    for (name, value) in upstream_response.headers() {
        if let (Ok(n), Ok(v)) = (
            header::HeaderName::from_bytes(name.as_str().as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            response_headers.insert(n, v);
        }
    }
    let body = upstream_response.bytes().await.map_err(Error::from)?.to_vec();

    let upstream = UpstreamResponse {
        status,
        headers: response_headers.clone(),
        body,
    };

    match state
        .bridge
        .naturalize_response(&api.host, session, &upstream)
        .await?
    {
        Some(text) => {
            let mut response = (StatusCode::OK, text).into_response();
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/plain; charset=utf-8"),
            );
            Ok(response)
        }
        None => {
            response_headers.remove(header::CONTENT_LENGTH);
            let mut response = Response::builder()
                .status(upstream.status)
                .body(Body::from(upstream.body))
                .map_err(|e| Error::Internal(e.to_string()))?;
            *response.headers_mut() = response_headers;
            Ok(response)
        }
    }
}

/// Whether the opt-in header asks for a rewrite. Only honored when the
/// content type is empty or text/plain.
fn should_rewrite_query(headers: &HeaderMap) -> bool {
    let Some(enabled) = headers
        .get(HEADER_X_NL_QUERY_ENABLED)
        .and_then(|v| v.to_str().ok())
    else {
        return false;
    };

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_ascii_lowercase();
    if !content_type.is_empty() && content_type != "text/plain" {
        debug!("Rewrite requested but Content-Type is not text/plain, ignoring");
        return false;
    }

    is_enabled(enabled)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opt_in_requires_plain_or_absent_content_type() {
        let mut headers = HeaderMap::new();
        headers.insert(HEADER_X_NL_QUERY_ENABLED, "true".parse().unwrap());
        assert!(should_rewrite_query(&headers));

        headers.insert(header::CONTENT_TYPE, "text/plain".parse().unwrap());
        assert!(should_rewrite_query(&headers));

        headers.insert(header::CONTENT_TYPE, "application/json".parse().unwrap());
        assert!(!should_rewrite_query(&headers));
    }

    #[test]
    fn opt_in_requires_enabled_value() {
        let mut headers = HeaderMap::new();
        headers.insert(HEADER_X_NL_QUERY_ENABLED, "no".parse().unwrap());
        assert!(!should_rewrite_query(&headers));

        let empty = HeaderMap::new();
        assert!(!should_rewrite_query(&empty));
    }

    #[test]
    fn request_parts_split_query() {
        let uri: Uri = "/repos/x/issues?state=open&page=2".parse().unwrap();
        let parts = request_parts(&Method::GET, &uri, &HeaderMap::new(), "");
        assert_eq!(parts.path, "/repos/x/issues");
        assert_eq!(
            parts.query,
            vec![
                ("state".to_string(), "open".to_string()),
                ("page".to_string(), "2".to_string())
            ]
        );
        assert!(parts.body.is_none());
    }
}
