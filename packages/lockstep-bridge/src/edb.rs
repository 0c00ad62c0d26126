//! Embedding-store driver
//!
//! `EmbedStore` is the seam to the vector side. A collection holds one
//! entry per document (id = doc_id) plus derived chunk entries
//! (id = `<doc_id>_chunk_<n>`, `chunk_of` metadata pointing back).
//! Embedding itself happens inside the store; the bridge only moves
//! content and metadata.
//!
//! `MemoryEmbedStore` is the bundled local backend and the test double.
//! `CountCache` makes the count optimisation explicit and addressable so
//! a reset can invalidate it precisely.

use crate::error::{BridgeError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Metadata key marking a chunk entry and naming its parent document.
pub const META_CHUNK_OF: &str = "chunk_of";
/// Metadata key carrying the parent document's content hash.
pub const META_CONTENT_HASH: &str = "content_hash";
/// Metadata keys written by the namespace import strategy.
pub const META_ORIGINAL_DOC_ID: &str = "original_doc_id";
pub const META_NAMESPACED_FROM: &str = "namespaced_from";

/// One record in an embedding-store collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdbEntry {
    pub id: String,
    pub content: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl EdbEntry {
    pub fn new(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn is_chunk(&self) -> bool {
        self.metadata.contains_key(META_CHUNK_OF)
    }

    /// Parent doc id for chunk entries, own id for document entries.
    pub fn doc_id(&self) -> &str {
        match self.metadata.get(META_CHUNK_OF).and_then(|v| v.as_str()) {
            Some(parent) => parent,
            None => &self.id,
        }
    }

    pub fn content_hash(&self) -> Option<&str> {
        self.metadata.get(META_CONTENT_HASH).and_then(|v| v.as_str())
    }
}

/// CRUD surface over embedding-store collections.
#[async_trait]
pub trait EmbedStore: Send + Sync {
    async fn list_collections(&self) -> Result<Vec<String>>;

    async fn get_or_create(&self, name: &str) -> Result<()>;

    /// Add new entries. A batch containing duplicate ids, or an id that
    /// already exists in the collection, is rejected outright.
    async fn add(&self, name: &str, entries: Vec<EdbEntry>) -> Result<usize>;

    /// Replace existing entries by id.
    async fn update(&self, name: &str, entries: Vec<EdbEntry>) -> Result<usize>;

    /// Delete by id; unknown ids are ignored. Returns entries removed.
    async fn delete(&self, name: &str, ids: &[String]) -> Result<usize>;

    async fn count(&self, name: &str) -> Result<usize>;

    async fn get_by_ids(&self, name: &str, ids: &[String]) -> Result<Vec<EdbEntry>>;

    async fn get_all(&self, name: &str) -> Result<Vec<EdbEntry>>;
}

/// Doc-level view of a collection, as the delta detector consumes it.
#[derive(Debug, Default, Clone)]
pub struct CollectionSnapshot {
    /// doc_id -> content_hash (from the document entry's metadata)
    pub doc_hashes: HashMap<String, String>,
    /// doc_id -> every entry id belonging to it (document entry + chunks)
    pub entry_ids: HashMap<String, Vec<String>>,
}

impl CollectionSnapshot {
    pub fn doc_count(&self) -> usize {
        self.doc_hashes.len()
    }

    /// All entry ids for a document, for deletion.
    pub fn ids_for(&self, doc_id: &str) -> Vec<String> {
        self.entry_ids.get(doc_id).cloned().unwrap_or_default()
    }
}

/// Build the doc-level snapshot of a collection.
pub async fn collection_snapshot(
    store: &dyn EmbedStore,
    name: &str,
) -> Result<CollectionSnapshot> {
    let mut snapshot = CollectionSnapshot::default();
    for entry in store.get_all(name).await? {
        let doc_id = entry.doc_id().to_string();
        if !entry.is_chunk() {
            let hash = entry.content_hash().unwrap_or_default().to_string();
            snapshot.doc_hashes.insert(doc_id.clone(), hash);
        }
        snapshot.entry_ids.entry(doc_id).or_default().push(entry.id);
    }
    Ok(snapshot)
}

/// In-memory embedding store backed by a concurrent map.
#[derive(Default)]
pub struct MemoryEmbedStore {
    collections: DashMap<String, BTreeMap<String, EdbEntry>>,
    write_ops: AtomicUsize,
}

impl MemoryEmbedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total mutating calls that changed at least one entry. Used by
    /// idempotence tests to assert that a repeated sync writes nothing.
    pub fn write_ops(&self) -> usize {
        self.write_ops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbedStore for MemoryEmbedStore {
    async fn list_collections(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.collections.iter().map(|e| e.key().clone()).collect();
        names.sort();
        Ok(names)
    }

    async fn get_or_create(&self, name: &str) -> Result<()> {
        self.collections.entry(name.to_string()).or_default();
        Ok(())
    }

    async fn add(&self, name: &str, entries: Vec<EdbEntry>) -> Result<usize> {
        let mut seen = HashSet::new();
        for entry in &entries {
            if !seen.insert(entry.id.clone()) {
                return Err(BridgeError::Validation(format!(
                    "duplicate id in add batch: {}",
                    entry.id
                )));
            }
        }
        let mut collection = self.collections.entry(name.to_string()).or_default();
        for entry in &entries {
            if collection.contains_key(&entry.id) {
                return Err(BridgeError::Validation(format!(
                    "id already exists in collection {}: {}",
                    name, entry.id
                )));
            }
        }
        let added = entries.len();
        for entry in entries {
            collection.insert(entry.id.clone(), entry);
        }
        if added > 0 {
            self.write_ops.fetch_add(1, Ordering::SeqCst);
        }
        Ok(added)
    }

    async fn update(&self, name: &str, entries: Vec<EdbEntry>) -> Result<usize> {
        let mut collection = self
            .collections
            .get_mut(name)
            .ok_or_else(|| BridgeError::Validation(format!("unknown collection: {name}")))?;
        let mut updated = 0;
        for entry in entries {
            if collection.contains_key(&entry.id) {
                collection.insert(entry.id.clone(), entry);
                updated += 1;
            }
        }
        if updated > 0 {
            self.write_ops.fetch_add(1, Ordering::SeqCst);
        }
        Ok(updated)
    }

    async fn delete(&self, name: &str, ids: &[String]) -> Result<usize> {
        let mut removed = 0;
        if let Some(mut collection) = self.collections.get_mut(name) {
            for id in ids {
                if collection.remove(id).is_some() {
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            self.write_ops.fetch_add(1, Ordering::SeqCst);
        }
        Ok(removed)
    }

    async fn count(&self, name: &str) -> Result<usize> {
        Ok(self.collections.get(name).map(|c| c.len()).unwrap_or(0))
    }

    async fn get_by_ids(&self, name: &str, ids: &[String]) -> Result<Vec<EdbEntry>> {
        let collection = match self.collections.get(name) {
            Some(c) => c,
            None => return Ok(Vec::new()),
        };
        Ok(ids
            .iter()
            .filter_map(|id| collection.get(id).cloned())
            .collect())
    }

    async fn get_all(&self, name: &str) -> Result<Vec<EdbEntry>> {
        let collection = match self.collections.get(name) {
            Some(c) => c,
            None => return Ok(Vec::new()),
        };
        Ok(collection.values().cloned().collect())
    }
}

/// Process-local entry-count cache with a version token; `force` bypasses.
#[derive(Default)]
pub struct CountCache {
    entries: DashMap<String, (u64, usize)>,
    version: AtomicU64,
}

impl CountCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn count(
        &self,
        store: &dyn EmbedStore,
        collection: &str,
        force: bool,
    ) -> Result<usize> {
        let current = self.version.load(Ordering::SeqCst);
        if !force {
            if let Some(cached) = self.entries.get(collection) {
                let (token, count) = *cached;
                if token == current {
                    return Ok(count);
                }
            }
        }
        let count = store.count(collection).await?;
        self.entries
            .insert(collection.to_string(), (current, count));
        Ok(count)
    }

    /// Invalidate everything (e.g. after a reset or merge).
    pub fn invalidate_all(&self) {
        self.version.fetch_add(1, Ordering::SeqCst);
    }

    /// Invalidate a single collection.
    pub fn invalidate(&self, collection: &str) {
        self.entries.remove(collection);
    }
}
