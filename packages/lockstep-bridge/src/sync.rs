//! Bidirectional sync engine
//!
//! Reconciles the embedding store with the versioned store at a commit.
//! Per collection the order is always Delete -> Update -> Add: deleting
//! first frees ids so an add can never hit a stale collision. The
//! `in_progress` state is persisted before the first embedding-store
//! mutation; a failure or cancellation leaves `error` with partial
//! counts, and the next `full_sync(force: true)` completes the work
//! idempotently.

use crate::config::BridgeConfig;
use crate::content::Chunker;
use crate::delta::{self, Delta};
use crate::dolt::{ChangeKind, DoltRepo};
use crate::edb::{
    collection_snapshot, CollectionSnapshot, CountCache, EdbEntry, EmbedStore, META_CHUNK_OF,
    META_CONTENT_HASH,
};
use crate::error::Result;
use chrono::Utc;
use lockstep_storage::{
    Document, DocumentAction, OperationOutcome, SidecarDb, SyncState, SyncStatus,
};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// Per-collection outcome of one engine pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectionSyncReport {
    pub collection: String,
    pub added: usize,
    pub updated: usize,
    pub deleted: usize,
    pub chunks_written: usize,
    pub skipped_fast_path: bool,
    pub error: Option<String>,
}

/// Aggregated outcome of one engine pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncReport {
    pub branch: String,
    pub commit: String,
    pub collections: Vec<CollectionSyncReport>,
    pub duration_ms: u64,
    pub cancelled: bool,
}

impl SyncReport {
    pub fn total_added(&self) -> usize {
        self.collections.iter().map(|c| c.added).sum()
    }

    pub fn total_updated(&self) -> usize {
        self.collections.iter().map(|c| c.updated).sum()
    }

    pub fn total_deleted(&self) -> usize {
        self.collections.iter().map(|c| c.deleted).sum()
    }

    pub fn has_errors(&self) -> bool {
        self.collections.iter().any(|c| c.error.is_some())
    }
}

/// Prepared embedding-store entries for one document.
struct PreparedDoc {
    doc_id: String,
    doc_entry: EdbEntry,
    chunk_entries: Vec<EdbEntry>,
}

pub struct SyncEngine {
    dolt: Arc<dyn DoltRepo>,
    edb: Arc<dyn EmbedStore>,
    sidecar: Arc<SidecarDb>,
    counts: Arc<CountCache>,
    chunker: Chunker,
    embedding_model: String,
}

impl SyncEngine {
    pub fn new(
        dolt: Arc<dyn DoltRepo>,
        edb: Arc<dyn EmbedStore>,
        sidecar: Arc<SidecarDb>,
        counts: Arc<CountCache>,
        config: &BridgeConfig,
    ) -> Result<Self> {
        Ok(Self {
            dolt,
            edb,
            sidecar,
            counts,
            chunker: Chunker::new(config.chunk_size, config.chunk_overlap)?,
            embedding_model: config.embedding_model.clone(),
        })
    }

    /// Reconcile every collection against the branch head.
    pub async fn full_sync(&self, force: bool, cancel: &CancellationToken) -> Result<SyncReport> {
        let start = Instant::now();
        let branch = self.dolt.current_branch().await?;
        let head = self.dolt.head_commit().await?;
        let collections = self.dolt.list_collections().await?;

        info!(
            branch = %branch,
            commit = %head,
            collections = collections.len(),
            force,
            "full sync starting"
        );

        let operation_id = self.begin_operation("full_sync", &branch);
        let mut report = SyncReport {
            branch: branch.clone(),
            commit: head.clone(),
            ..SyncReport::default()
        };

        for collection in &collections {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let collection_report = self
                .sync_collection(&branch, &head, collection, force, cancel, operation_id)
                .await;
            report.collections.push(collection_report);
        }

        report.duration_ms = start.elapsed().as_millis() as u64;
        self.finish_operation(operation_id, &report);

        info!(
            added = report.total_added(),
            updated = report.total_updated(),
            deleted = report.total_deleted(),
            duration_ms = report.duration_ms,
            cancelled = report.cancelled,
            "full sync finished"
        );
        Ok(report)
    }

    /// Reconcile from a versioned-store diff. Falls back to a full sync
    /// when `from` does not resolve to a known commit.
    pub async fn incremental_sync(
        &self,
        from: &str,
        to: &str,
        cancel: &CancellationToken,
    ) -> Result<SyncReport> {
        if self.dolt.resolve_ref(from).await?.is_none() {
            warn!(from, "base commit unknown, falling back to full sync");
            return self.full_sync(false, cancel).await;
        }

        let start = Instant::now();
        let branch = self.dolt.current_branch().await?;
        let operation_id = self.begin_operation("incremental_sync", &branch);

        let mut by_collection: HashMap<String, Delta> = HashMap::new();
        for entry in self.dolt.diff(from, to).await? {
            let slot = by_collection.entry(entry.collection.clone()).or_default();
            match entry.change {
                ChangeKind::Added => slot.added.push(entry.doc_id),
                ChangeKind::Modified => slot.modified.push(entry.doc_id),
                ChangeKind::Removed => slot.deleted.push(entry.doc_id),
            }
        }

        info!(
            from,
            to,
            collections = by_collection.len(),
            "incremental sync starting"
        );

        let mut report = SyncReport {
            branch: branch.clone(),
            commit: to.to_string(),
            ..SyncReport::default()
        };

        let mut collections: Vec<String> = by_collection.keys().cloned().collect();
        collections.sort();
        for collection in collections {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let mut planned = by_collection.remove(&collection).unwrap_or_default();
            // Deletions observed in the commit range clear their pending
            // records; the rest of the pending set still re-applies.
            for doc_id in &planned.deleted {
                if let Err(e) = self
                    .sidecar
                    .mark_deletion_committed(&branch, &collection, doc_id)
                {
                    warn!(error = %e, doc_id, "failed to mark deletion committed");
                }
            }
            let pending = self.sidecar.pending_doc_ids(&branch, &collection)?;
            let snapshot = collection_snapshot(self.edb.as_ref(), &collection).await?;
            for doc_id in &pending {
                if snapshot.entry_ids.contains_key(doc_id)
                    && !planned.deleted.contains(doc_id)
                {
                    planned.deleted.push(doc_id.clone());
                }
            }
            planned.deleted.sort();

            let collection_report = self
                .apply_planned(
                    &branch,
                    to,
                    &collection,
                    planned,
                    snapshot,
                    operation_id,
                    cancel,
                )
                .await;
            report.collections.push(collection_report);
        }

        report.duration_ms = start.elapsed().as_millis() as u64;
        self.finish_operation(operation_id, &report);
        Ok(report)
    }

    /// After a hard reset: force-sync, then clear the branch's pending
    /// deletions and GC stale records. Tracker cleanup is best-effort.
    pub async fn post_reset_reconcile(
        &self,
        branch: &str,
        cancel: &CancellationToken,
    ) -> Result<SyncReport> {
        self.counts.invalidate_all();
        let report = self.full_sync(true, cancel).await?;

        if let Err(e) = self.sidecar.discard_pending_for_branch(branch) {
            warn!(error = %e, branch, "failed to discard pending deletions");
        }
        if let Err(e) = self.sidecar.cleanup_stale_deletions(None) {
            warn!(error = %e, "failed to GC stale deletion records");
        }
        Ok(report)
    }

    /// Mark pending deletions committed when the document is gone from
    /// the versioned store at `reference`. Used after a merge commit.
    pub async fn observe_committed_deletions(&self, branch: &str, reference: &str) -> Result<()> {
        let pending = self.sidecar.pending_deletions(branch)?;
        let mut by_collection: HashMap<String, Vec<String>> = HashMap::new();
        for record in pending {
            by_collection
                .entry(record.collection)
                .or_default()
                .push(record.doc_id);
        }
        for (collection, doc_ids) in by_collection {
            let present: HashSet<String> = self
                .dolt
                .docs_at(&collection, reference)
                .await?
                .into_iter()
                .map(|d| d.doc_id)
                .collect();
            for doc_id in doc_ids {
                if !present.contains(&doc_id) {
                    if let Err(e) =
                        self.sidecar
                            .mark_deletion_committed(branch, &collection, &doc_id)
                    {
                        warn!(error = %e, doc_id, "failed to mark deletion committed");
                    }
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------

    async fn sync_collection(
        &self,
        branch: &str,
        head: &str,
        collection: &str,
        force: bool,
        cancel: &CancellationToken,
        operation_id: Option<Uuid>,
    ) -> CollectionSyncReport {
        let mut report = CollectionSyncReport {
            collection: collection.to_string(),
            ..CollectionSyncReport::default()
        };

        // Fast path: commit and counts agree, nothing to do.
        if !force {
            if let Ok(Some(state)) = self.sidecar.get_sync_state(branch, collection) {
                if state.status == SyncStatus::Synced
                    && state.last_sync_commit.as_deref() == Some(head)
                {
                    let expected = state.doc_count + state.chunk_count;
                    match self.counts.count(self.edb.as_ref(), collection, false).await {
                        Ok(count) if count == expected => {
                            report.skipped_fast_path = true;
                            return report;
                        }
                        Ok(_) | Err(_) => {}
                    }
                }
            }
        }

        let result: Result<CollectionSyncReport> = async {
            let vdb_docs = self.dolt.docs_at(collection, head).await?;
            let snapshot = collection_snapshot(self.edb.as_ref(), collection).await?;
            let pending = self.sidecar.pending_doc_ids(branch, collection)?;

            let vdb_hashes: HashMap<String, String> = vdb_docs
                .iter()
                .map(|d| (d.doc_id.clone(), d.content_hash.clone()))
                .collect();
            let planned = delta::compute(&vdb_hashes, &snapshot.doc_hashes, &pending);

            if planned.is_empty() {
                let mut state = self
                    .sidecar
                    .get_sync_state(branch, collection)?
                    .unwrap_or_else(|| {
                        SyncState::pending(branch, collection, &self.embedding_model)
                    });
                state.status = SyncStatus::Synced;
                state.last_sync_commit = Some(head.to_string());
                state.last_sync_at = Some(Utc::now());
                self.sidecar.upsert_sync_state(&state)?;
                return Ok(CollectionSyncReport {
                    collection: collection.to_string(),
                    ..CollectionSyncReport::default()
                });
            }

            if cancel.is_cancelled() {
                // Nothing mutated yet; leave the persisted state untouched.
                return Ok(CollectionSyncReport {
                    collection: collection.to_string(),
                    error: Some("cancelled before apply".to_string()),
                    ..CollectionSyncReport::default()
                });
            }

            self.apply_delta(
                branch,
                head,
                collection,
                planned,
                snapshot,
                &vdb_docs,
                operation_id,
                cancel,
            )
            .await
        }
        .await;

        match result {
            Ok(applied) => applied,
            Err(e) => {
                let message = e.to_string();
                if let Err(mark_err) = self.sidecar.mark_error(branch, collection, &message) {
                    warn!(error = %mark_err, collection, "failed to persist error state");
                }
                report.error = Some(message);
                report
            }
        }
    }

    /// Incremental path: deltas come from the diff, documents are fetched
    /// by id at `reference`.
    #[allow(clippy::too_many_arguments)]
    async fn apply_planned(
        &self,
        branch: &str,
        reference: &str,
        collection: &str,
        planned: Delta,
        snapshot: CollectionSnapshot,
        operation_id: Option<Uuid>,
        cancel: &CancellationToken,
    ) -> CollectionSyncReport {
        let result: Result<CollectionSyncReport> = async {
            let docs = self.dolt.docs_at(collection, reference).await?;
            self.apply_delta(
                branch,
                reference,
                collection,
                planned,
                snapshot,
                &docs,
                operation_id,
                cancel,
            )
            .await
        }
        .await;

        match result {
            Ok(applied) => applied,
            Err(e) => {
                let message = e.to_string();
                if let Err(mark_err) = self.sidecar.mark_error(branch, collection, &message) {
                    warn!(error = %mark_err, collection, "failed to persist error state");
                }
                CollectionSyncReport {
                    collection: collection.to_string(),
                    error: Some(message),
                    ..CollectionSyncReport::default()
                }
            }
        }
    }

    /// Apply one collection's delta in Delete -> Update -> Add order.
    #[allow(clippy::too_many_arguments)]
    async fn apply_delta(
        &self,
        branch: &str,
        head: &str,
        collection: &str,
        planned: Delta,
        snapshot: CollectionSnapshot,
        vdb_docs: &[Document],
        operation_id: Option<Uuid>,
        cancel: &CancellationToken,
    ) -> Result<CollectionSyncReport> {
        let mut report = CollectionSyncReport {
            collection: collection.to_string(),
            ..CollectionSyncReport::default()
        };

        // A "modified" doc the embedding store never saw is an add.
        let mut planned = planned;
        let (present, missing): (Vec<String>, Vec<String>) = planned
            .modified
            .drain(..)
            .partition(|id| snapshot.doc_hashes.contains_key(id));
        planned.modified = present;
        planned.added.extend(missing);
        planned.added.sort();

        info!(
            collection,
            added = planned.added.len(),
            modified = planned.modified.len(),
            deleted = planned.deleted.len(),
            "applying delta"
        );

        // State must be durable before the first embedding-store write.
        self.sidecar
            .mark_in_progress(branch, collection, &self.embedding_model)?;
        self.edb.get_or_create(collection).await?;

        let docs_by_id: HashMap<&str, &Document> = vdb_docs
            .iter()
            .map(|d| (d.doc_id.as_str(), d))
            .collect();

        // Delete first so adds can never collide with stale ids.
        if !planned.deleted.is_empty() {
            let mut ids = Vec::new();
            for doc_id in &planned.deleted {
                ids.extend(snapshot.ids_for(doc_id));
            }
            self.edb.delete(collection, &ids).await?;
            report.deleted = planned.deleted.len();
            for doc_id in &planned.deleted {
                self.log_action(operation_id, branch, collection, doc_id, DocumentAction::Deleted, None);
            }
        }

        self.check_cancelled(cancel)?;

        // Updates: replace the document entry, swap chunk entries.
        if !planned.modified.is_empty() {
            let prepared = self.prepare_docs(&planned.modified, &docs_by_id);
            let stale_chunk_ids: Vec<String> = planned
                .modified
                .iter()
                .flat_map(|doc_id| {
                    snapshot
                        .ids_for(doc_id)
                        .into_iter()
                        .filter(move |id| id != doc_id)
                })
                .collect();
            self.edb.delete(collection, &stale_chunk_ids).await?;
            let doc_entries: Vec<EdbEntry> =
                prepared.iter().map(|p| p.doc_entry.clone()).collect();
            self.edb.update(collection, doc_entries).await?;
            let chunk_entries: Vec<EdbEntry> = prepared
                .iter()
                .flat_map(|p| p.chunk_entries.clone())
                .collect();
            report.chunks_written += chunk_entries.len();
            if !chunk_entries.is_empty() {
                self.edb.add(collection, chunk_entries).await?;
            }
            report.updated = prepared.len();
            for p in &prepared {
                let hash = p.doc_entry.content_hash().map(str::to_string);
                self.log_action(
                    operation_id,
                    branch,
                    collection,
                    &p.doc_id,
                    DocumentAction::Updated,
                    hash.as_deref(),
                );
            }
        }

        self.check_cancelled(cancel)?;

        // Adds last.
        if !planned.added.is_empty() {
            let prepared = self.prepare_docs(&planned.added, &docs_by_id);
            let mut entries = Vec::new();
            for p in &prepared {
                entries.push(p.doc_entry.clone());
                entries.extend(p.chunk_entries.clone());
                report.chunks_written += p.chunk_entries.len();
            }
            self.edb.add(collection, entries).await?;
            report.added = prepared.len();
            for p in &prepared {
                let hash = p.doc_entry.content_hash().map(str::to_string);
                self.log_action(
                    operation_id,
                    branch,
                    collection,
                    &p.doc_id,
                    DocumentAction::Added,
                    hash.as_deref(),
                );
            }
        }

        // Finalise bookkeeping. Counts describe the embedding store, not
        // the versioned store: a pending deletion can keep a document out
        // of the embedding side while it still exists at head.
        let removed_docs = planned
            .deleted
            .iter()
            .filter(|id| snapshot.doc_hashes.contains_key(*id))
            .count();
        let doc_count = snapshot.doc_count() - removed_docs + planned.added.len();
        let chunk_count = self
            .counts
            .count(self.edb.as_ref(), collection, true)
            .await?
            .saturating_sub(doc_count);
        let state = SyncState {
            branch: branch.to_string(),
            collection: collection.to_string(),
            last_sync_commit: Some(head.to_string()),
            last_sync_at: Some(Utc::now()),
            doc_count,
            chunk_count,
            embedding_model: self.embedding_model.clone(),
            status: SyncStatus::Synced,
            error_message: None,
        };
        self.sidecar.upsert_sync_state(&state)?;
        Ok(report)
    }

    /// Chunk and wrap documents into store entries, in parallel.
    fn prepare_docs(
        &self,
        doc_ids: &[String],
        docs_by_id: &HashMap<&str, &Document>,
    ) -> Vec<PreparedDoc> {
        let chunker = self.chunker;
        let docs: Vec<&Document> = doc_ids
            .iter()
            .filter_map(|id| docs_by_id.get(id.as_str()).copied())
            .collect();
        docs.par_iter()
            .map(|doc| {
                let mut doc_entry = EdbEntry::new(&doc.doc_id, &doc.content);
                doc_entry.metadata = doc.metadata.clone();
                doc_entry
                    .metadata
                    .insert(META_CONTENT_HASH.to_string(), doc.content_hash.clone().into());
                let chunk_entries = chunker
                    .split(&doc.doc_id, &doc.content)
                    .into_iter()
                    .map(|piece| {
                        EdbEntry::new(piece.id, piece.text)
                            .with_meta(META_CHUNK_OF, doc.doc_id.clone())
                            .with_meta(META_CONTENT_HASH, doc.content_hash.clone())
                            .with_meta("chunk_index", piece.index)
                    })
                    .collect();
                PreparedDoc {
                    doc_id: doc.doc_id.clone(),
                    doc_entry,
                    chunk_entries,
                }
            })
            .collect()
    }

    /// A cancel between `in_progress` and `synced` surfaces as an error
    /// with a resumable marker, never a corrupt `synced`.
    fn check_cancelled(&self, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(crate::error::BridgeError::Cancelled(
                "sync interrupted; run a forced full sync to complete".to_string(),
            ));
        }
        Ok(())
    }

    fn log_action(
        &self,
        operation_id: Option<Uuid>,
        branch: &str,
        collection: &str,
        doc_id: &str,
        action: DocumentAction,
        content_hash: Option<&str>,
    ) {
        if let Err(e) = self.sidecar.log_document_action(
            operation_id,
            branch,
            collection,
            doc_id,
            action,
            content_hash,
        ) {
            warn!(error = %e, doc_id, "failed to write document sync log");
        }
    }

    fn begin_operation(&self, kind: &str, branch: &str) -> Option<Uuid> {
        match self.sidecar.begin_operation(kind, branch) {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(error = %e, kind, "failed to record sync operation");
                None
            }
        }
    }

    fn finish_operation(&self, operation_id: Option<Uuid>, report: &SyncReport) {
        let Some(id) = operation_id else {
            return;
        };
        let outcome = if report.cancelled {
            OperationOutcome::Cancelled
        } else if report.has_errors() {
            OperationOutcome::Failed
        } else {
            OperationOutcome::Succeeded
        };
        let error = report
            .collections
            .iter()
            .find_map(|c| c.error.as_deref().map(str::to_string));
        if let Err(e) = self.sidecar.finish_operation(id, outcome, error.as_deref()) {
            warn!(error = %e, "failed to finish sync operation record");
        }
    }
}
