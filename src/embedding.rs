//! Embedding runtime
//!
//! The bridge talks to the vectorizer through the narrow [`Embedder`] trait.
//! The production implementation runs a local ONNX model; tests inject their
//! own. Loaded models are cached process-wide by name and never evicted.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use parking_lot::{Mutex, RwLock};
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::{Error, Result};

/// Maximum token sequence fed to the model
const MAX_SEQUENCE_LENGTH: usize = 512;

/// Text vectorizer contract. Calls are assumed bounded-latency and are not
/// cancellable; hold no cache lock while embedding.
pub trait Embedder: Send + Sync {
    /// Embed one text into a unit-length vector
    ///
    /// # Errors
    ///
    /// Returns an error if tokenization or inference fails.
    fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Loader signature used by the cache, injectable for tests
pub type EmbedderLoader =
    Box<dyn Fn(&Path, &str) -> Result<Arc<dyn Embedder>> + Send + Sync>;

/// Process-wide cache of loaded embedding models, keyed by model name.
/// Load-on-first-use; a failed load leaves the cache unchanged.
pub struct EmbedderCache {
    models: RwLock<HashMap<String, Arc<dyn Embedder>>>,
    loader: EmbedderLoader,
}

impl EmbedderCache {
    /// Cache backed by the local ONNX embedder
    #[must_use]
    pub fn new() -> Self {
        Self::with_loader(Box::new(|dir, name| {
            Ok(Arc::new(OnnxEmbedder::load(dir, name)?) as Arc<dyn Embedder>)
        }))
    }

    /// Cache with a custom loader (used by tests)
    #[must_use]
    pub fn with_loader(loader: EmbedderLoader) -> Self {
        Self {
            models: RwLock::new(HashMap::new()),
            loader,
        }
    }

    /// Get the embedder for `name`, loading it from `dir` on first use.
    /// Concurrent misses on the same name all observe the same instance.
    ///
    /// # Errors
    ///
    /// Returns an error if the model fails to load; the cache is unchanged.
    pub fn get(&self, dir: &Path, name: &str) -> Result<Arc<dyn Embedder>> {
        if let Some(model) = self.models.read().get(name) {
            return Ok(Arc::clone(model));
        }

        // Exclusive lock for the whole load so a racing miss cannot
        // construct a second instance.
        let mut models = self.models.write();
        if let Some(model) = models.get(name) {
            return Ok(Arc::clone(model));
        }

        info!(model = %name, dir = %dir.display(), "Loading embedding model");
        let model = (self.loader)(dir, name)?;
        models.insert(name.to_string(), Arc::clone(&model));
        Ok(model)
    }

    /// Whether a model is already loaded
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.models.read().contains_key(name)
    }
}

impl Default for EmbedderCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Local embedder running an ONNX model with its tokenizer
pub struct OnnxEmbedder {
    session: Mutex<Session>,
    tokenizer: Tokenizer,
    model_name: String,
}

impl OnnxEmbedder {
    /// Load `<dir>/<name>/model.onnx` and `<dir>/<name>/tokenizer.json`
    ///
    /// # Errors
    ///
    /// Returns an error if either file is missing or fails to load.
    pub fn load(dir: &Path, name: &str) -> Result<Self> {
        let model_dir = dir.join(name);
        let model_path = model_dir.join("model.onnx");
        let tokenizer_path = model_dir.join("tokenizer.json");

        if !model_path.exists() {
            return Err(Error::Embedding(format!(
                "model file not found: {}",
                model_path.display()
            )));
        }

        let session = Session::builder()
            .and_then(|b| Ok(b.with_optimization_level(GraphOptimizationLevel::Level3)?))
            .and_then(|mut b| b.commit_from_file(&model_path))
            .map_err(|e| Error::Embedding(format!("failed to create session: {e}")))?;

        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| Error::Embedding(format!("failed to load tokenizer: {e}")))?;

        debug!(model = %name, "Embedding model loaded");

        Ok(Self {
            session: Mutex::new(session),
            tokenizer,
            model_name: name.to_string(),
        })
    }

    fn encode(&self, text: &str) -> Result<(Vec<i64>, Vec<i64>)> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| Error::Embedding(format!("tokenization failed: {e}")))?;

        let mut input_ids: Vec<i64> = encoding.get_ids().iter().map(|&id| i64::from(id)).collect();
        let mut attention_mask: Vec<i64> = encoding
            .get_attention_mask()
            .iter()
            .map(|&m| i64::from(m))
            .collect();

        input_ids.truncate(MAX_SEQUENCE_LENGTH);
        attention_mask.truncate(MAX_SEQUENCE_LENGTH);

        Ok((input_ids, attention_mask))
    }
}

impl Embedder for OnnxEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let (input_ids, attention_mask) = self.encode(text)?;
        let seq_len = input_ids.len();

        let input_ids =
            Tensor::from_array(([1usize, seq_len], input_ids.into_boxed_slice()))
                .map_err(|e| Error::Embedding(e.to_string()))?;
        let attention_mask =
            Tensor::from_array(([1usize, seq_len], attention_mask.into_boxed_slice()))
                .map_err(|e| Error::Embedding(e.to_string()))?;
        let token_type_ids = Tensor::from_array((
            [1usize, seq_len],
            vec![0i64; seq_len].into_boxed_slice(),
        ))
        .map_err(|e| Error::Embedding(e.to_string()))?;

        let mut session = self.session.lock();
        let outputs = session
            .run(ort::inputs![input_ids, attention_mask, token_type_ids])
            .map_err(|e| Error::Embedding(format!("{}: inference failed: {e}", self.model_name)))?;

        let output = outputs
            .iter()
            .next()
            .ok_or_else(|| Error::Embedding("no output tensor".to_string()))?
            .1;
        let (shape, data) = output
            .try_extract_tensor::<f32>()
            .map_err(|e| Error::Embedding(e.to_string()))?;

        // [batch, seq, hidden] needs mean pooling; [batch, hidden] is done
        let embedding = match shape.len() {
            3 => {
                let seq = usize::try_from(shape[1]).unwrap_or(0);
                let hidden = usize::try_from(shape[2]).unwrap_or(0);
                let mut pooled = vec![0.0f32; hidden];
                for (i, value) in pooled.iter_mut().enumerate() {
                    let mut sum = 0.0;
                    for j in 0..seq {
                        sum += data[j * hidden + i];
                    }
                    *value = sum / seq as f32;
                }
                pooled
            }
            2 => data.to_vec(),
            _ => {
                return Err(Error::Embedding(format!(
                    "unexpected output shape: {shape:?}"
                )))
            }
        };

        Ok(normalize(embedding))
    }
}

/// Normalize a vector to unit length
fn normalize(mut v: Vec<f32>) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedEmbedder(Vec<f32>);

    impl Embedder for FixedEmbedder {
        fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn cache_loads_once_per_name() {
        let loads = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&loads);
        let cache = EmbedderCache::with_loader(Box::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(FixedEmbedder(vec![1.0])) as Arc<dyn Embedder>)
        }));

        let dir = Path::new("models");
        let a = cache.get(dir, "m").unwrap();
        let b = cache.get(dir, "m").unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn failed_load_leaves_cache_unchanged() {
        let cache = EmbedderCache::with_loader(Box::new(|_, _| {
            Err(Error::Embedding("no such model".to_string()))
        }));
        assert!(cache.get(Path::new("models"), "missing").is_err());
        assert!(!cache.contains("missing"));
    }

    #[test]
    fn normalize_produces_unit_vector() {
        let v = normalize(vec![3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn normalize_zero_vector_is_noop() {
        let v = normalize(vec![0.0, 0.0]);
        assert_eq!(v, vec![0.0, 0.0]);
    }
}
