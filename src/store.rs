//! Cross-API utterance store
//!
//! Every configured API publishes its utterance bundle (name, target URL,
//! input examples) so the cross-API router can select a service for a free
//! -form query. The store is Redis in production and in-memory in tests;
//! both sit behind [`UtteranceStore`]. A process-wide monotonic version is
//! bumped on every successful mutation and drives lazy re-indexing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::Result;

/// Key prefix for bundles in Redis
pub const STORE_KEY_PREFIX: &str = "agent_bridge:";

/// Utterance bundle persisted per API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UtteranceBundle {
    /// API identifier
    pub name: String,
    /// Target URL the host resolves, `tyk://{api_id}{listen_path}`
    pub url: String,
    /// Union of all input examples for the API
    pub utterances: Vec<String>,
}

/// Canonical service URL for an API
#[must_use]
pub fn service_url(api_id: &str, listen_path: &str) -> String {
    format!("tyk://{api_id}{listen_path}")
}

/// Narrow persistence contract for utterance bundles
#[async_trait]
pub trait UtteranceStore: Send + Sync {
    /// Persist the bundle for an API, replacing any previous one
    async fn save(&self, api_id: &str, bundle: &UtteranceBundle) -> Result<()>;

    /// Remove the bundle for an API if present. Returns whether a record
    /// was removed; deleting an absent bundle is not an error.
    async fn delete(&self, api_id: &str) -> Result<bool>;

    /// Load every stored bundle (warm rebuild)
    async fn load_all(&self) -> Result<Vec<UtteranceBundle>>;
}

/// Utterance store with the process-wide store version attached. Mutations
/// go through here so the version bump is serialized with the write.
pub struct VersionedStore {
    inner: Arc<dyn UtteranceStore>,
    version: AtomicU64,
    mutation: tokio::sync::Mutex<()>,
}

impl VersionedStore {
    /// Wrap a store implementation
    #[must_use]
    pub fn new(inner: Arc<dyn UtteranceStore>) -> Self {
        Self {
            inner,
            version: AtomicU64::new(0),
            mutation: tokio::sync::Mutex::new(()),
        }
    }

    /// Current store version
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Persist a bundle and bump the version
    ///
    /// # Errors
    ///
    /// Returns the underlying store error; the version is not bumped then.
    pub async fn save(&self, api_id: &str, bundle: &UtteranceBundle) -> Result<()> {
        let _guard = self.mutation.lock().await;
        self.inner.save(api_id, bundle).await?;
        let version = self.version.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(api_id = %api_id, version, "Utterance bundle saved");
        Ok(())
    }

    /// Delete a bundle and bump the version. Deleting an absent bundle is a
    /// no-op: it succeeds without moving the version.
    ///
    /// # Errors
    ///
    /// Returns the underlying store error; the version is not bumped then.
    pub async fn delete(&self, api_id: &str) -> Result<()> {
        let _guard = self.mutation.lock().await;
        if self.inner.delete(api_id).await? {
            let version = self.version.fetch_add(1, Ordering::AcqRel) + 1;
            debug!(api_id = %api_id, version, "Utterance bundle deleted");
        } else {
            debug!(api_id = %api_id, "No utterance bundle to delete");
        }
        Ok(())
    }

    /// Load every bundle together with the version observed before the read
    ///
    /// # Errors
    ///
    /// Returns the underlying store error.
    pub async fn load_all(&self) -> Result<(u64, Vec<UtteranceBundle>)> {
        // Snapshot the version BEFORE reading so a concurrent mutation makes
        // the loaded table look stale rather than fresh.
        let version = self.version();
        let bundles = self.inner.load_all().await?;
        Ok((version, bundles))
    }
}

/// Redis-backed store. Keys are `agent_bridge:<api_id>`, values JSON, no TTL.
pub struct RedisUtteranceStore {
    manager: redis::aio::ConnectionManager,
}

impl RedisUtteranceStore {
    /// Connect to Redis
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let manager = client.get_connection_manager().await?;
        Ok(Self { manager })
    }

    fn key(api_id: &str) -> String {
        format!("{STORE_KEY_PREFIX}{api_id}")
    }
}

#[async_trait]
impl UtteranceStore for RedisUtteranceStore {
    async fn save(&self, api_id: &str, bundle: &UtteranceBundle) -> Result<()> {
        let payload = serde_json::to_string(bundle)?;
        let mut con = self.manager.clone();
        con.set::<_, _, ()>(Self::key(api_id), payload).await?;
        Ok(())
    }

    async fn delete(&self, api_id: &str) -> Result<bool> {
        let mut con = self.manager.clone();
        let removed: u64 = con.del(Self::key(api_id)).await?;
        Ok(removed > 0)
    }

    async fn load_all(&self) -> Result<Vec<UtteranceBundle>> {
        let mut con = self.manager.clone();
        let keys: Vec<String> = con.keys(format!("{STORE_KEY_PREFIX}*")).await?;
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let values: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut con)
            .await?;

        let mut bundles = Vec::with_capacity(values.len());
        for value in values.into_iter().flatten() {
            bundles.push(serde_json::from_str(&value)?);
        }
        Ok(bundles)
    }
}

/// In-memory store used by tests and single-process deployments
#[derive(Default)]
pub struct MemoryUtteranceStore {
    bundles: RwLock<HashMap<String, UtteranceBundle>>,
}

impl MemoryUtteranceStore {
    /// Empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UtteranceStore for MemoryUtteranceStore {
    async fn save(&self, api_id: &str, bundle: &UtteranceBundle) -> Result<()> {
        self.bundles
            .write()
            .insert(api_id.to_string(), bundle.clone());
        Ok(())
    }

    async fn delete(&self, api_id: &str) -> Result<bool> {
        Ok(self.bundles.write().remove(api_id).is_some())
    }

    async fn load_all(&self) -> Result<Vec<UtteranceBundle>> {
        Ok(self.bundles.read().values().cloned().collect())
    }
}
