//! Schema-constrained request synthesizer
//!
//! Turns a natural-language sentence into a structured request against a
//! selected API operation. The operation is pruned into a deterministic
//! text description (parameters dereferenced to first level, the chosen
//! request-body media type, and the sorted transitive `$ref` closure); the
//! LLM is then called with a fixed JSON-schema response shape and the result
//! is applied to the request as a pure [`RewritePlan`].

use std::collections::{BTreeMap, HashMap};

use axum::http::{HeaderMap, HeaderName, HeaderValue, Method};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, error};

use crate::llm::{ChatCompletions, ChatMessage, ChatRequest, JsonSchemaFormat, MAX_TOKENS};
use crate::openapi::{MediaType, RefResolver, Route};
use crate::{Error, Result};

/// Headers the synthesizer must never replace
pub const PROTECTED_HEADERS: &[&str] = &["Authorization"];

/// Name of the structured response schema sent to the provider
const RESPONSE_SCHEMA_NAME: &str = "convert_to_openapi";

const QUERY_SYSTEM_PROMPT: &str = "\
You are given an OpenAPI operation description with:
- a list of parameters defined as OpenAPI parameters,
- an optional request body described as OpenAPI MediaType object,
- a list of references ($ref) if used in the parameters or the request body.

Your goal is to convert the natural language sentence to a JSON object following the OpenAPI operation description.
- Only use required parameters,
- You MUST use the exact name of the parameters.
- DO NOT invent. If information is missing, DO NOT include it.

The OpenAPI operation description:
====
{operation}
====";

const QUERY_USER_PROMPT: &str = "\
The natural language sentence:
====
{sentence}
====";

/// JSON schema constraining the synthesis response
#[must_use]
pub fn structured_response_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "in_path_params": {
                "description": "The parameters that are inside the path",
                "type": "object",
                "additionalProperties": {"type": "string"}
            },
            "in_query_params": {
                "description": "The parameters that are part of the query string. Each parameter is an array of strings",
                "type": "object",
                "additionalProperties": {"type": "array", "items": {"type": "string"}}
            },
            "in_header_params": {
                "description": "The parameters that are in the headers. Each parameter is an array of strings",
                "type": "object",
                "additionalProperties": {"type": "array", "items": {"type": "string"}}
            },
            "request_body": {
                "description": "The optional content of the body",
                "type": "string"
            }
        },
        "required": ["in_path_params", "in_query_params", "in_header_params", "request_body"],
        "additionalProperties": false
    })
}

/// Build the deterministic text description of an operation. Pure in the
/// operation and document; references render in lexicographic order.
///
/// # Errors
///
/// Returns an error if a schema cannot be serialized.
pub fn build_operation_description(
    route: &Route<'_>,
    media_type: Option<&MediaType>,
    resolver: &RefResolver<'_>,
) -> Result<String> {
    let operation = route.operation;
    let mut refs: BTreeMap<String, Value> = BTreeMap::new();
    let mut out = String::new();

    if let Some(description) = operation.description.as_deref().filter(|s| !s.is_empty()) {
        out.push_str(&format!("Operation description: {description}\n"));
    } else if let Some(summary) = operation.summary.as_deref().filter(|s| !s.is_empty()) {
        out.push_str(&format!("Operation summary: {summary}\n"));
    }

    if !operation.parameters.is_empty() {
        out.push_str("The list of Parameters:\n");
        for parameter in &operation.parameters {
            let Some(resolved) = resolver.resolve_parameter(parameter) else {
                continue;
            };
            if let Some(schema) = resolved.get("schema") {
                resolver.collect_schema_refs(schema, &mut refs);
            }
            out.push_str(&format!("- {}\n", serde_json::to_string(resolved)?));
        }
    }

    if operation.request_body.is_some() {
        if let Some(media_type) = media_type {
            if let Some(schema) = &media_type.schema {
                resolver.collect_schema_refs(schema, &mut refs);
                let effective = resolver.effective_schema(schema).unwrap_or(schema);
                out.push_str("The request body:\n");
                out.push_str(&format!("{}\n", serde_json::to_string(effective)?));
            }
        }
    }

    if !refs.is_empty() {
        out.push_str("The list of References:\n");
        for (name, schema) in &refs {
            out.push_str(&format!("- {name}: {}\n", serde_json::to_string(schema)?));
        }
    }

    Ok(out)
}

/// The structured result of a synthesis call
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SynthesizedParams {
    /// Path parameter substitutions
    pub in_path_params: HashMap<String, String>,
    /// Query parameters to install
    pub in_query_params: HashMap<String, Vec<String>>,
    /// Header parameters to install
    pub in_header_params: HashMap<String, Vec<String>>,
    /// Request body, empty for none
    pub request_body: String,
}

/// A pure description of how to rewrite a request for a route. Produced by
/// [`synthesize_plan`]; the host-integration layer applies it.
#[derive(Debug, Clone)]
pub struct RewritePlan {
    /// Method of the selected route
    pub method: String,
    /// Path template of the selected route
    pub path_template: String,
    /// Selected request-body media type, empty when the operation has none
    pub content_type: String,
    /// Synthesized parameters
    pub params: SynthesizedParams,
}

/// Call the LLM to synthesize request parameters for a route and wrap them
/// into a plan.
///
/// # Errors
///
/// Returns [`Error::QueryNotUnderstood`] on any LLM or parse failure so the
/// caller surfaces a stable user-facing message.
pub async fn synthesize_plan(
    llm: &dyn ChatCompletions,
    route: &Route<'_>,
    resolver: &RefResolver<'_>,
    utterance: &str,
    strict: bool,
) -> Result<RewritePlan> {
    let selected = route
        .operation
        .request_body
        .as_ref()
        .and_then(|body| body.select_media_type());
    let content_type = selected.map(|(ct, _)| ct.to_string()).unwrap_or_default();

    let operation_text =
        build_operation_description(route, selected.map(|(_, mt)| mt), resolver)?;

    let system = QUERY_SYSTEM_PROMPT.replace("{operation}", &operation_text);
    let user = QUERY_USER_PROMPT.replace("{sentence}", utterance);

    let request = ChatRequest {
        messages: vec![ChatMessage::system(system), ChatMessage::user(user)],
        tools: Vec::new(),
        response_format: Some(JsonSchemaFormat {
            name: RESPONSE_SCHEMA_NAME.to_string(),
            description: String::new(),
            schema: structured_response_schema(),
            strict,
        }),
        max_tokens: Some(MAX_TOKENS),
    };

    let translation = match llm.complete(request).await.and_then(crate::llm::ChatOutcome::text) {
        Ok(text) => text,
        Err(e) => {
            error!(error = %e, "Synthesis call failed");
            return Err(Error::QueryNotUnderstood);
        }
    };
    debug!(translation = %translation, "Synthesis result");

    let mut params: SynthesizedParams = serde_json::from_str(&translation).map_err(|e| {
        error!(error = %e, "Synthesis result did not parse");
        Error::QueryNotUnderstood
    })?;

    // The transport owns the encoding; anything the model emitted is noise
    params
        .in_header_params
        .retain(|name, _| !name.eq_ignore_ascii_case("Content-Encoding"));

    Ok(RewritePlan {
        method: route.method.to_string(),
        path_template: route.path.to_string(),
        content_type,
        params,
    })
}

/// Mutable view of the request being rewritten
#[derive(Debug, Clone, Default)]
pub struct RequestParts {
    /// HTTP method
    pub method: Method,
    /// URL path
    pub path: String,
    /// Query pairs in order
    pub query: Vec<(String, String)>,
    /// Headers
    pub headers: HeaderMap,
    /// Body, `None` when absent
    pub body: Option<String>,
}

impl RewritePlan {
    /// Apply the plan to a request. Protected headers stay untouched, the
    /// content type is forced to the selected media type (an explicit empty
    /// value when the operation has no body), query parameters are replaced
    /// by name with unmentioned ones preserved, and path placeholders are
    /// filled first from the synthesized parameters and then from
    /// `existing_path_params`.
    pub fn apply(&self, parts: &mut RequestParts, existing_path_params: &HashMap<String, String>) {
        parts.method = self
            .method
            .parse()
            .unwrap_or(Method::GET);

        for (name, values) in &self.params.in_header_params {
            if PROTECTED_HEADERS
                .iter()
                .any(|protected| protected.eq_ignore_ascii_case(name))
            {
                continue;
            }
            let Ok(header_name) = name.parse::<HeaderName>() else {
                continue;
            };
            parts.headers.remove(&header_name);
            for value in values {
                if let Ok(header_value) = HeaderValue::from_str(value) {
                    parts.headers.append(header_name.clone(), header_value);
                }
            }
        }

        // Always an explicit header, empty when the operation has no body
        let content_type = HeaderValue::from_str(&self.content_type)
            .unwrap_or_else(|_| HeaderValue::from_static(""));
        parts
            .headers
            .insert(axum::http::header::CONTENT_TYPE, content_type);

        for (name, values) in &self.params.in_query_params {
            parts.query.retain(|(existing, _)| existing != name);
            for value in values {
                parts.query.push((name.clone(), value.clone()));
            }
        }

        let mut path = self.path_template.clone();
        for (name, value) in &self.params.in_path_params {
            path = path.replace(&format!("{{{name}}}"), value);
        }
        for (name, value) in existing_path_params {
            path = path.replace(&format!("{{{name}}}"), value);
        }
        parts.path = path;

        if self.params.request_body.is_empty() {
            parts.body = None;
        } else {
            parts.body = Some(self.params.request_body.clone());
        }

        // The transport recomputes the length for the rewritten body
        parts.headers.remove(axum::http::header::CONTENT_LENGTH);
    }
}
