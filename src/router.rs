//! Semantic router
//!
//! Intra-API selection maps an utterance to an operation id within one API's
//! index; the caller compares the returned score against the API's relevance
//! threshold. Inter-API selection maps an utterance to a service URL across
//! every configured API, rebuilding its index lazily whenever the utterance
//! store version moves.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info};

use crate::embedding::Embedder;
use crate::index::VectorIndex;
use crate::store::VersionedStore;
use crate::{Error, Result};

/// Nearest neighbours retrieved per selection. Raise above 1 only when
/// debugging runner-up relevance.
pub const SELECT_RESULTS: usize = 1;

/// Fixed relevance floor for cross-API selection
pub const CROSS_API_THRESHOLD: f64 = 0.5;

/// An intra-API selection result
#[derive(Debug, Clone, PartialEq)]
pub struct OperationMatch {
    /// Selected operation id
    pub operation_id: String,
    /// Relevance in `[0, 1]`
    pub relevance: f64,
}

/// Select the best operation for an utterance against a snapshot of an API's
/// index. Returns `None` when the index is empty. Threshold acceptance is
/// the caller's decision.
///
/// # Errors
///
/// Returns an error if embedding fails.
pub fn select_operation(
    index: &VectorIndex,
    embedder: &dyn Embedder,
    utterance: &str,
) -> Result<Option<OperationMatch>> {
    let embedding = embedder.embed(utterance)?;
    let hits = index.search(&embedding, SELECT_RESULTS);

    if SELECT_RESULTS > 1 {
        for (i, hit) in hits.iter().enumerate() {
            debug!(rank = i, label = %hit.label, relevance = hit.relevance, "selection candidate");
        }
    }

    Ok(hits.into_iter().next().map(|hit| OperationMatch {
        operation_id: hit.label,
        relevance: hit.relevance,
    }))
}

/// One entry of the selection debug reply
#[derive(Debug, Clone, Serialize)]
pub struct SelectionMatch {
    /// The query that was matched
    pub query: String,
    /// Selected operation id, absent when nothing matched
    #[serde(rename = "operationId", skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<String>,
    /// Relevance of the selection
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relevance: Option<f64>,
    /// Error description when the selection failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Selection debug reply
#[derive(Debug, Clone, Serialize)]
pub struct SelectionReply {
    /// One result per non-empty query
    pub results: Vec<SelectionMatch>,
}

/// Run the selection debug queries. Empty queries are skipped; results carry
/// no placeholder entries.
pub fn select_endpoint_matches(
    index: &VectorIndex,
    embedder: &dyn Embedder,
    queries: &[String],
) -> SelectionReply {
    let mut results = Vec::new();
    for query in queries {
        if query.is_empty() {
            continue;
        }
        match select_operation(index, embedder, query) {
            Ok(Some(m)) => results.push(SelectionMatch {
                query: query.clone(),
                operation_id: Some(m.operation_id),
                relevance: Some(m.relevance),
                error: None,
            }),
            Ok(None) => results.push(SelectionMatch {
                query: query.clone(),
                operation_id: None,
                relevance: None,
                error: None,
            }),
            Err(e) => results.push(SelectionMatch {
                query: query.clone(),
                operation_id: None,
                relevance: None,
                error: Some(e.to_string()),
            }),
        }
    }
    SelectionReply { results }
}

struct CrossState {
    index: Arc<VectorIndex>,
    observed_version: u64,
    services: usize,
}

/// Cross-API service index, rebuilt lazily from the utterance store
#[derive(Default)]
pub struct CrossApiIndex {
    state: RwLock<Option<CrossState>>,
}

impl CrossApiIndex {
    /// Empty index; the first request triggers a rebuild
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn is_fresh(&self, current_version: u64) -> bool {
        self.state
            .read()
            .as_ref()
            .is_some_and(|s| s.services > 0 && s.observed_version == current_version)
    }

    /// Reload the services table and rebuild the index when it is empty or
    /// the store version changed since the last build. Embedding and store
    /// IO run without the lock; only the final install is exclusive.
    ///
    /// # Errors
    ///
    /// Returns an error if the store read or an utterance embedding fails.
    pub async fn ensure_fresh(
        &self,
        store: &VersionedStore,
        embedder: &dyn Embedder,
    ) -> Result<()> {
        if self.is_fresh(store.version()) {
            return Ok(());
        }

        let (observed_version, bundles) = store.load_all().await?;
        info!(version = observed_version, services = bundles.len(), "Rebuilding cross-API index");

        let mut index = VectorIndex::new();
        for bundle in &bundles {
            for utterance in &bundle.utterances {
                let embedding = embedder.embed(utterance).map_err(|e| {
                    Error::Embedding(format!(
                        "embedding failed for utterance of {}: {e}",
                        bundle.name
                    ))
                })?;
                index.add(embedding, bundle.url.clone());
            }
        }

        *self.state.write() = Some(CrossState {
            index: Arc::new(index),
            observed_version,
            services: bundles.len(),
        });
        Ok(())
    }

    /// Select a service URL for an utterance
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoService`] when nothing clears the fixed floor, or
    /// an embedding error.
    pub fn select(&self, embedder: &dyn Embedder, utterance: &str) -> Result<String> {
        let index = {
            let state = self.state.read();
            state
                .as_ref()
                .map(|s| Arc::clone(&s.index))
                .ok_or(Error::NoService)?
        };

        let embedding = embedder.embed(utterance)?;
        let hits = index.search(&embedding, SELECT_RESULTS);

        match hits.into_iter().next() {
            Some(hit) if hit.relevance >= CROSS_API_THRESHOLD => Ok(hit.label),
            _ => Err(Error::NoService),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryUtteranceStore, UtteranceBundle, VersionedStore};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Embeds the first byte of the text onto one of two axes so that
    /// queries sharing a first letter are maximally similar.
    struct PrefixEmbedder {
        calls: AtomicUsize,
    }

    impl PrefixEmbedder {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl Embedder for PrefixEmbedder {
        fn embed(&self, text: &str) -> Result<Vec<f32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let first = text.bytes().next().unwrap_or(0);
            Ok(if first < b'm' {
                vec![1.0, 0.0]
            } else {
                vec![0.0, 1.0]
            })
        }
    }

    fn bundle(name: &str, utterances: &[&str]) -> UtteranceBundle {
        UtteranceBundle {
            name: name.to_string(),
            url: format!("tyk://{name}/svc/"),
            utterances: utterances.iter().map(|s| (*s).to_string()).collect(),
        }
    }

    #[test]
    fn select_operation_returns_top_hit() {
        let embedder = PrefixEmbedder::new();
        let mut index = VectorIndex::new();
        index.add(vec![1.0, 0.0], "early/op");
        index.add(vec![0.0, 1.0], "late/op");

        let m = select_operation(&index, &embedder, "abc").unwrap().unwrap();
        assert_eq!(m.operation_id, "early/op");
        assert!((m.relevance - 1.0).abs() < 1e-9);
    }

    #[test]
    fn select_operation_empty_index_is_none() {
        let embedder = PrefixEmbedder::new();
        let index = VectorIndex::new();
        assert!(select_operation(&index, &embedder, "abc").unwrap().is_none());
    }

    #[test]
    fn debug_matches_skip_empty_queries_without_placeholders() {
        let embedder = PrefixEmbedder::new();
        let mut index = VectorIndex::new();
        index.add(vec![1.0, 0.0], "op");

        let reply = select_endpoint_matches(
            &index,
            &embedder,
            &[String::new(), "abc".to_string(), String::new()],
        );
        assert_eq!(reply.results.len(), 1);
        assert_eq!(reply.results[0].operation_id.as_deref(), Some("op"));
    }

    #[tokio::test]
    async fn cross_index_rebuilds_once_per_version_change() {
        let store = VersionedStore::new(Arc::new(MemoryUtteranceStore::new()));
        store.save("alpha", &bundle("alpha", &["abc"])).await.unwrap();

        let embedder = PrefixEmbedder::new();
        let cross = CrossApiIndex::new();

        cross.ensure_fresh(&store, &embedder).await.unwrap();
        let after_first = embedder.calls.load(Ordering::SeqCst);

        // Same version: no rebuild, no further embedding
        cross.ensure_fresh(&store, &embedder).await.unwrap();
        assert_eq!(embedder.calls.load(Ordering::SeqCst), after_first);

        // Version moves: exactly one more rebuild
        store.save("zulu", &bundle("zulu", &["zzz"])).await.unwrap();
        cross.ensure_fresh(&store, &embedder).await.unwrap();
        assert!(embedder.calls.load(Ordering::SeqCst) > after_first);

        let url = cross.select(&embedder, "abacus").unwrap();
        assert_eq!(url, "tyk://alpha/svc/");
    }

    /// Embeds 'z'-prefixed text opposite to everything else, driving the
    /// mapped relevance to 0.
    struct OppositeEmbedder;

    impl Embedder for OppositeEmbedder {
        fn embed(&self, text: &str) -> Result<Vec<f32>> {
            Ok(if text.starts_with('z') {
                vec![-1.0, 0.0]
            } else {
                vec![1.0, 0.0]
            })
        }
    }

    #[tokio::test]
    async fn cross_select_rejects_below_threshold() {
        let store = VersionedStore::new(Arc::new(MemoryUtteranceStore::new()));
        store.save("alpha", &bundle("alpha", &["abc"])).await.unwrap();

        let cross = CrossApiIndex::new();
        cross.ensure_fresh(&store, &OppositeEmbedder).await.unwrap();

        assert!(cross.select(&OppositeEmbedder, "abacus").is_ok());
        assert!(matches!(
            cross.select(&OppositeEmbedder, "zoo"),
            Err(Error::NoService)
        ));
    }

    #[test]
    fn cross_select_without_state_is_no_service() {
        let cross = CrossApiIndex::new();
        let embedder = PrefixEmbedder::new();
        assert!(matches!(
            cross.select(&embedder, "anything"),
            Err(Error::NoService)
        ));
    }
}
