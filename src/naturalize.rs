//! Response naturalizer
//!
//! Rewrites an upstream HTTP response into plain natural language keyed to
//! the utterance that produced the request. Runs only when the request
//! session asked for a natural-language response.

use std::io::Read;

use axum::http::{header, HeaderMap, StatusCode};
use flate2::read::GzDecoder;
use tracing::debug;

use crate::llm::{ChatCompletions, ChatMessage, ChatRequest, MAX_TOKENS};
use crate::{Error, Result};

const RESPONSE_SYSTEM_PROMPT: &str = "\
Given a API response body, and an instruction from a user. You must convert it to a natural language text, according to the user's request.

The API response body:
====
{response_body}
====
";

const RESPONSE_USER_PROMPT: &str = "\
The user's request:

====
{user_request}
====
";

/// The upstream response as handed over by the host
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    /// Upstream status
    pub status: StatusCode,
    /// Upstream headers
    pub headers: HeaderMap,
    /// Raw upstream body
    pub body: Vec<u8>,
}

/// Decompress a gzip body
///
/// # Errors
///
/// Returns an error when the data is not valid gzip.
pub fn gunzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| Error::Internal(format!("failed to unzip response body: {e}")))?;
    Ok(out)
}

fn is_gzip(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("gzip"))
}

/// Convert an upstream response into natural language. The rendered prompt
/// sees `"<status> <body>"`; the LLM call is unconstrained.
///
/// # Errors
///
/// Returns an error if decompression or the LLM call fails.
pub async fn naturalize(
    llm: &dyn ChatCompletions,
    original_query: &str,
    response: &UpstreamResponse,
) -> Result<String> {
    let body = if is_gzip(&response.headers) {
        gunzip(&response.body)?
    } else {
        response.body.clone()
    };
    let body = String::from_utf8_lossy(&body);

    let status = format!(
        "{} {}",
        response.status.as_u16(),
        response.status.canonical_reason().unwrap_or("")
    );
    let response_body = format!("{status} {body}");
    debug!(status = %status, "Naturalizing upstream response");

    let system = RESPONSE_SYSTEM_PROMPT.replace("{response_body}", &response_body);
    let user = RESPONSE_USER_PROMPT.replace("{user_request}", original_query);

    let request = ChatRequest {
        messages: vec![ChatMessage::system(system), ChatMessage::user(user)],
        tools: Vec::new(),
        response_format: None,
        max_tokens: Some(MAX_TOKENS),
    };

    llm.complete(request).await?.text()
}
