//! Live selection tests against a real embedding model
//!
//! These run the semantic router with the actual ONNX embedding model and
//! are ignored by default; they need the model files under
//! `models/jina-embeddings-v2-base-en/` (override the directory with
//! `NL_BRIDGE_MODELS_DIR`). Run with `cargo test -- --ignored`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use nl_bridge::bridge::{BridgeService, HostApi};
use nl_bridge::embedding::EmbedderCache;
use nl_bridge::llm::{ChatCompletions, ChatOutcome, ChatRequest, FinishReason};
use nl_bridge::openapi::Document;
use nl_bridge::store::MemoryUtteranceStore;
use nl_bridge::Result;

struct UnusedLlm;

#[async_trait]
impl ChatCompletions for UnusedLlm {
    async fn complete(&self, _request: ChatRequest) -> Result<ChatOutcome> {
        Ok(ChatOutcome {
            content: None,
            tool_calls: Vec::new(),
            finish_reason: FinishReason::Stop,
        })
    }
}

fn live_service() -> BridgeService {
    if let Ok(dir) = std::env::var("NL_BRIDGE_MODELS_DIR") {
        // The embedder cache resolves models under this directory
        std::env::set_current_dir(dir).expect("models dir not accessible");
    }
    BridgeService::with_parts(
        Arc::new(MemoryUtteranceStore::new()),
        EmbedderCache::new(),
        Box::new(|_| Ok(Arc::new(UnusedLlm) as Arc<dyn ChatCompletions>)),
        HashMap::new(),
    )
}

fn github_host() -> HostApi {
    let document = Document::from_file(std::path::Path::new("tests/testdata/github.oas.json"))
        .expect("testdata spec");
    HostApi::from_document(Arc::new(document)).expect("bridge extension")
}

async fn expect_selection(service: &BridgeService, host: &HostApi, query: &str, expected: &str) {
    let reply = service
        .selection_matches(host, &[query.to_string()])
        .await
        .expect("selection failed");
    let result = &reply.results[0];
    assert_eq!(
        result.operation_id.as_deref(),
        Some(expected),
        "query: {query}"
    );
    assert!(
        result.relevance.unwrap_or(0.0) >= 0.5,
        "relevance below threshold for: {query}"
    );
}

#[tokio::test]
#[ignore = "needs the embedding model on disk"]
async fn pull_request_listing_is_selected() {
    let service = live_service();
    let host = github_host();
    expect_selection(
        &service,
        &host,
        "Give me the list of pull requests for repository",
        "pulls/list",
    )
    .await;
}

#[tokio::test]
#[ignore = "needs the embedding model on disk"]
async fn bug_creation_maps_to_issue_creation() {
    let service = live_service();
    let host = github_host();
    expect_selection(
        &service,
        &host,
        "Create a bug in the repo 'thelasttoto/apiclarity'",
        "issues/create",
    )
    .await;
}

#[tokio::test]
#[ignore = "needs a multilingual embedding model on disk"]
async fn french_commit_query_maps_to_commit_listing() {
    let service = live_service();
    let host = github_host();
    expect_selection(
        &service,
        &host,
        "Donnes moi les 5 derniers commits du repo apiclarity de thelasttoto",
        "repos/list-commits",
    )
    .await;
}
