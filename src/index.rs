//! Vector indexes for semantic selection
//!
//! A [`VectorIndex`] maps example-utterance embeddings to labels (operation
//! ids or service URLs) and answers nearest-neighbour queries with a
//! relevance score in `[0, 1]`. Indexes are built off to the side and
//! installed wholesale; they are never mutated after publication.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::config::MAX_UTTERANCE_LENGTH;
use crate::embedding::Embedder;
use crate::{Error, Result};

/// One nearest-neighbour hit
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    /// The label attached at indexing time
    pub label: String,
    /// Relevance in `[0, 1]`, higher is better
    pub relevance: f64,
}

/// Append-only vector index over `(embedding, label)` pairs
#[derive(Default)]
pub struct VectorIndex {
    entries: Vec<(Vec<f32>, String)>,
}

impl VectorIndex {
    /// Empty index
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one embedding with its label
    pub fn add(&mut self, embedding: Vec<f32>, label: impl Into<String>) {
        self.entries.push((embedding, label.into()));
    }

    /// Number of indexed entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the index holds no entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Top-`k` entries by relevance. Cosine similarity is mapped into
    /// `[0, 1]`; ties keep insertion order.
    #[must_use]
    pub fn search(&self, query: &[f32], k: usize) -> Vec<SearchHit> {
        let mut hits: Vec<SearchHit> = self
            .entries
            .iter()
            .map(|(embedding, label)| SearchHit {
                label: label.clone(),
                relevance: relevance(query, embedding),
            })
            .collect();
        hits.sort_by(|a, b| b.relevance.total_cmp(&a.relevance));
        hits.truncate(k);
        hits
    }
}

/// Cosine similarity mapped into `[0, 1]`
fn relevance(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    let cosine = f64::from(dot / (norm_a * norm_b));
    (cosine.clamp(-1.0, 1.0) + 1.0) / 2.0
}

/// Build an index from per-operation input examples. Examples longer than
/// [`MAX_UTTERANCE_LENGTH`] are skipped with a warning, as are examples the
/// embedder rejects.
pub fn build_index(
    select_operations: &BTreeMap<String, Vec<String>>,
    embedder: &dyn Embedder,
) -> VectorIndex {
    let mut index = VectorIndex::new();
    for (operation_id, examples) in select_operations {
        for example in examples {
            if example.len() > MAX_UTTERANCE_LENGTH {
                warn!(operation = %operation_id, "example too long, skipping");
                continue;
            }
            match embedder.embed(example) {
                Ok(embedding) => index.add(embedding, operation_id.clone()),
                Err(e) => {
                    warn!(operation = %operation_id, error = %e, "embedding failed, skipping example");
                }
            }
        }
    }
    index
}

/// Per-API selection indexes, swapped wholesale on config updates
#[derive(Default)]
pub struct ApiIndexStore {
    indices: RwLock<HashMap<String, Arc<VectorIndex>>>,
}

impl ApiIndexStore {
    /// Empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build and install the index for an API, replacing any prior one.
    /// Embedding happens before the lock is taken; only the final swap is
    /// exclusive.
    pub fn rebuild(
        &self,
        api_id: &str,
        select_operations: &BTreeMap<String, Vec<String>>,
        embedder: &dyn Embedder,
    ) {
        let index = build_index(select_operations, embedder);
        debug!(api_id = %api_id, entries = index.len(), "Installing selection index");
        self.indices
            .write()
            .insert(api_id.to_string(), Arc::new(index));
    }

    /// Snapshot the index for an API
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoExamples`] when the API has no index.
    pub fn get(&self, api_id: &str) -> Result<Arc<VectorIndex>> {
        self.indices
            .read()
            .get(api_id)
            .map(Arc::clone)
            .ok_or_else(|| Error::NoExamples(api_id.to_string()))
    }

    /// Drop the index for an API
    pub fn remove(&self, api_id: &str) {
        self.indices.write().remove(api_id);
    }

    /// Whether an API has an installed index
    #[must_use]
    pub fn contains(&self, api_id: &str) -> bool {
        self.indices.read().contains_key(api_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AxisEmbedder;

    impl Embedder for AxisEmbedder {
        fn embed(&self, text: &str) -> Result<Vec<f32>> {
            // Deterministic toy embedding: map the first byte onto two axes
            let b = text.bytes().next().unwrap_or(0) as f32;
            Ok(vec![b, 1.0])
        }
    }

    #[test]
    fn search_returns_most_similar_first() {
        let mut index = VectorIndex::new();
        index.add(vec![1.0, 0.0], "x");
        index.add(vec![0.0, 1.0], "y");

        let hits = index.search(&[0.9, 0.1], 2);
        assert_eq!(hits[0].label, "x");
        assert!(hits[0].relevance > hits[1].relevance);
    }

    #[test]
    fn relevance_is_bounded() {
        let mut index = VectorIndex::new();
        index.add(vec![1.0, 0.0], "same");
        index.add(vec![-1.0, 0.0], "opposite");

        let hits = index.search(&[1.0, 0.0], 2);
        assert!((hits[0].relevance - 1.0).abs() < 1e-9);
        assert!(hits[1].relevance.abs() < 1e-9);
    }

    #[test]
    fn search_truncates_to_k() {
        let mut index = VectorIndex::new();
        for i in 0..5 {
            index.add(vec![i as f32, 1.0], format!("l{i}"));
        }
        assert_eq!(index.search(&[1.0, 1.0], 1).len(), 1);
    }

    #[test]
    fn empty_index_returns_no_hits() {
        let index = VectorIndex::new();
        assert!(index.search(&[1.0], 1).is_empty());
    }

    #[test]
    fn build_index_skips_long_examples() {
        let mut ops = BTreeMap::new();
        ops.insert(
            "op".to_string(),
            vec!["short".to_string(), "x".repeat(MAX_UTTERANCE_LENGTH + 1)],
        );
        let index = build_index(&ops, &AxisEmbedder);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn multiple_examples_produce_multiple_entries() {
        let mut ops = BTreeMap::new();
        ops.insert(
            "op".to_string(),
            vec!["one".to_string(), "two".to_string(), "three".to_string()],
        );
        let index = build_index(&ops, &AxisEmbedder);
        assert_eq!(index.len(), 3);
    }

    #[test]
    fn store_swap_replaces_previous_index() {
        let store = ApiIndexStore::new();
        let mut ops = BTreeMap::new();
        ops.insert("a".to_string(), vec!["one".to_string()]);
        store.rebuild("api", &ops, &AxisEmbedder);
        let before = store.get("api").unwrap();

        ops.insert("b".to_string(), vec!["two".to_string()]);
        store.rebuild("api", &ops, &AxisEmbedder);
        let after = store.get("api").unwrap();

        assert_eq!(before.len(), 1);
        assert_eq!(after.len(), 2);
        assert!(!Arc::ptr_eq(&before, &after));
    }

    #[test]
    fn missing_index_is_no_examples() {
        let store = ApiIndexStore::new();
        assert!(matches!(
            store.get("unknown"),
            Err(Error::NoExamples(id)) if id == "unknown"
        ));
    }
}
