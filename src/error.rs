//! Error types for the NL bridge

use std::io;

use axum::http::StatusCode;
use thiserror::Error;

/// Result type alias for the NL bridge
pub type Result<T> = std::result::Result<T, Error>;

/// Generic message returned for internal failures. Error details never reach
/// user-visible output.
pub const INTERNAL_ERROR_MSG: &str =
    "I'm sorry, but I wasn't able to process your request, it's an internal error";

/// NL bridge errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error (malformed plugin data, missing credential, ...)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Required host-supplied context is missing (no API document, ...)
    #[error("Host context missing: {0}")]
    HostContext(String),

    /// The API has no utterance index to select against
    #[error("No input examples indexed for API: {0}")]
    NoExamples(String),

    /// No operation matched the utterance above the relevance threshold
    #[error("No matching operation found")]
    NoMatchingOperation,

    /// No service matched the utterance above the relevance floor
    #[error("No service found for the query")]
    NoService,

    /// Request body exceeds the configured limit
    #[error("Query is too large")]
    PayloadTooLarge,

    /// The utterance could not be turned into a valid request
    #[error("unable to understand the query")]
    QueryNotUnderstood,

    /// The request path does not map to any operation of the API
    #[error("no route found for the request")]
    RouteNotFound,

    /// Embedding runtime failure
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// LLM provider failure
    #[error("LLM error: {0}")]
    Llm(String),

    /// Utterance store failure
    #[error("Store error: {0}")]
    Store(#[from] redis::RedisError),

    /// MCP transport failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// MCP protocol failure
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The MCP tool-call loop did not converge
    #[error("reached the limit of rounds")]
    RoundLimit,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// HTTP status to surface to the client
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NoMatchingOperation | Self::NoService => StatusCode::NOT_FOUND,
            Self::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// User-visible message. Generic for internal failures; specific only
    /// for the retriable not-found cases.
    #[must_use]
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::NoMatchingOperation => "No matching operation found",
            Self::NoService => "No service found for the query",
            Self::PayloadTooLarge => "Query is too large",
            Self::QueryNotUnderstood => {
                "I'm sorry but I was not able to understand your query"
            }
            Self::RouteNotFound => {
                "I'm sorry but I was not able to find the service you are asking for"
            }
            _ => INTERNAL_ERROR_MSG,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_errors_map_to_404() {
        assert_eq!(Error::NoMatchingOperation.status(), StatusCode::NOT_FOUND);
        assert_eq!(Error::NoService.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn payload_too_large_maps_to_413() {
        assert_eq!(
            Error::PayloadTooLarge.status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
    }

    #[test]
    fn internal_errors_stay_generic() {
        let err = Error::Llm("api key sk-secret leaked".to_string());
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.user_message(), INTERNAL_ERROR_MSG);
        assert!(!err.user_message().contains("sk-secret"));
    }

    #[test]
    fn round_limit_message() {
        assert_eq!(Error::RoundLimit.to_string(), "reached the limit of rounds");
    }
}
