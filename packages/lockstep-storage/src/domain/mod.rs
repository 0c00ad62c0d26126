//! Domain layer for the sync sidecar
//!
//! # Domain Models
//!
//! - `Document`: a versioned-store document mirrored into the embedding store
//! - `SyncState`: per (branch, collection) sync bookkeeping
//! - `DeletionRecord`: a deletion observed locally but not yet committed
//! - `Manifest`: the durable pointer to `{remote, branch, commit}`
//!
//! Documents are owned by the versioned store; everything here is derived
//! bookkeeping that lets a reconciliation resume after interruption.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A document as the bridge sees it: identity `(collection, doc_id)`,
/// UTF-8 content and an ordered scalar metadata map.
///
/// `content_hash` is the SHA-256 of the canonicalised content and is the
/// sole modification signal between the two stores.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub collection: String,
    pub doc_id: String,
    pub content: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub content_hash: String,
    /// Set when the document was written under a namespaced id during import.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_doc_id: Option<String>,
}

impl Document {
    pub fn new(
        collection: impl Into<String>,
        doc_id: impl Into<String>,
        content: impl Into<String>,
        content_hash: impl Into<String>,
    ) -> Self {
        Self {
            collection: collection.into(),
            doc_id: doc_id.into(),
            content: content.into(),
            metadata: BTreeMap::new(),
            content_hash: content_hash.into(),
            original_doc_id: None,
        }
    }

    pub fn with_metadata(mut self, metadata: BTreeMap<String, serde_json::Value>) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Sync status for a (branch, collection) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Synced,
    Pending,
    InProgress,
    Error,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Synced => "synced",
            SyncStatus::Pending => "pending",
            SyncStatus::InProgress => "in_progress",
            SyncStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "synced" => Some(SyncStatus::Synced),
            "pending" => Some(SyncStatus::Pending),
            "in_progress" => Some(SyncStatus::InProgress),
            "error" => Some(SyncStatus::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-collection sync bookkeeping, one record per (branch, collection).
///
/// Invariant: `status == Synced` implies `last_sync_commit` is an ancestor
/// of the branch head at the time of the last write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    pub branch: String,
    pub collection: String,
    pub last_sync_commit: Option<String>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub doc_count: usize,
    pub chunk_count: usize,
    pub embedding_model: String,
    pub status: SyncStatus,
    pub error_message: Option<String>,
}

impl SyncState {
    /// Fresh record for a collection that has never synced.
    pub fn pending(
        branch: impl Into<String>,
        collection: impl Into<String>,
        embedding_model: impl Into<String>,
    ) -> Self {
        Self {
            branch: branch.into(),
            collection: collection.into(),
            last_sync_commit: None,
            last_sync_at: None,
            doc_count: 0,
            chunk_count: 0,
            embedding_model: embedding_model.into(),
            status: SyncStatus::Pending,
            error_message: None,
        }
    }
}

/// A deletion observed on a branch, pending until a versioned-store commit
/// on that branch contains it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletionRecord {
    pub branch: String,
    pub collection: String,
    pub doc_id: String,
    pub deleted_at: DateTime<Utc>,
    pub committed_at: Option<DateTime<Utc>>,
}

impl DeletionRecord {
    pub fn pending(
        branch: impl Into<String>,
        collection: impl Into<String>,
        doc_id: impl Into<String>,
    ) -> Self {
        Self {
            branch: branch.into(),
            collection: collection.into(),
            doc_id: doc_id.into(),
            deleted_at: Utc::now(),
            committed_at: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.committed_at.is_none()
    }

    /// Records older than the retention window are garbage-collected.
    pub fn is_stale(&self, now: DateTime<Utc>, retention: Duration) -> bool {
        now - self.deleted_at > retention
    }
}

/// Deletion records older than this are eligible for GC.
pub const DELETION_RETENTION_DAYS: i64 = 30;

/// Current manifest schema version
pub const MANIFEST_SCHEMA_VERSION: u32 = 1;

/// The durable project pointer, a single JSON object at the project root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub remote_url: String,
    pub default_branch: String,
    pub current_branch: String,
    pub current_commit: Option<String>,
    pub schema_version: u32,
}

impl Manifest {
    pub fn new(remote_url: impl Into<String>, default_branch: impl Into<String>) -> Self {
        let default_branch = default_branch.into();
        Self {
            remote_url: remote_url.into(),
            current_branch: default_branch.clone(),
            default_branch,
            current_commit: None,
            schema_version: MANIFEST_SCHEMA_VERSION,
        }
    }
}

/// Per-document action recorded in the `document_sync_log` audit table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentAction {
    Added,
    Updated,
    Deleted,
}

impl DocumentAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentAction::Added => "added",
            DocumentAction::Updated => "updated",
            DocumentAction::Deleted => "deleted",
        }
    }
}

/// Outcome recorded in the `sync_operations` audit table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationOutcome {
    Succeeded,
    Failed,
    Cancelled,
}

impl OperationOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationOutcome::Succeeded => "succeeded",
            OperationOutcome::Failed => "failed",
            OperationOutcome::Cancelled => "cancelled",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_status_roundtrip() {
        for status in &[
            SyncStatus::Synced,
            SyncStatus::Pending,
            SyncStatus::InProgress,
            SyncStatus::Error,
        ] {
            let s = status.as_str();
            let parsed = SyncStatus::parse(s).unwrap();
            assert_eq!(*status, parsed);
        }
    }

    #[test]
    fn test_sync_status_parse_invalid() {
        assert!(SyncStatus::parse("done").is_none());
    }

    #[test]
    fn test_pending_sync_state() {
        let state = SyncState::pending("main", "notes", "all-minilm-l6-v2");
        assert_eq!(state.status, SyncStatus::Pending);
        assert!(state.last_sync_commit.is_none());
        assert_eq!(state.doc_count, 0);
    }

    #[test]
    fn test_deletion_record_staleness() {
        let mut rec = DeletionRecord::pending("main", "notes", "doc-1");
        assert!(rec.is_pending());

        let now = Utc::now();
        rec.deleted_at = now - Duration::days(31);
        assert!(rec.is_stale(now, Duration::days(DELETION_RETENTION_DAYS)));

        rec.deleted_at = now - Duration::days(2);
        assert!(!rec.is_stale(now, Duration::days(DELETION_RETENTION_DAYS)));
    }

    #[test]
    fn test_manifest_new_defaults() {
        let manifest = Manifest::new("https://dolt.example/repo", "main");
        assert_eq!(manifest.current_branch, "main");
        assert_eq!(manifest.default_branch, "main");
        assert!(manifest.current_commit.is_none());
        assert_eq!(manifest.schema_version, MANIFEST_SCHEMA_VERSION);
    }

    #[test]
    fn test_document_serde_shape() {
        let mut metadata = BTreeMap::new();
        metadata.insert("source".to_string(), serde_json::json!("import"));
        let doc = Document::new("notes", "n-1", "hello", "abc123").with_metadata(metadata);

        let json = serde_json::to_value(&doc).unwrap();
        assert_eq!(json["doc_id"], "n-1");
        assert_eq!(json["metadata"]["source"], "import");
        // original_doc_id is omitted when unset
        assert!(json.get("original_doc_id").is_none());
    }
}
