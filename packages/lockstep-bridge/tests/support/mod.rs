//! In-memory test doubles: a fake versioned store implementing the
//! driver seam, a failure-injecting embedding store, and a context
//! builder wiring everything over temp directories.
#![allow(dead_code)]

use async_trait::async_trait;
use lockstep_storage::{Document, ManifestStore, SidecarDb};
use lockstep_bridge::dolt::{
    ChangeKind, CommitInfo, ConflictDocVersions, ConflictSide, DiffEntry, DoltRepo, DryRunReport,
    MergeBegin,
};
use lockstep_bridge::edb::{EdbEntry, EmbedStore, MemoryEmbedStore};
use lockstep_bridge::error::{BridgeError, Result};
use lockstep_bridge::{BridgeConfig, BridgeContext};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

type Snapshot = HashMap<String, BTreeMap<String, Document>>;

struct MergeInProgress {
    pre_working: Snapshot,
    conflicts: Vec<ConflictDocVersions>,
    source_head: String,
}

struct RepoData {
    initialized: bool,
    current: String,
    /// Commit hashes per branch, oldest first.
    branches: HashMap<String, Vec<String>>,
    snapshots: HashMap<String, Snapshot>,
    working: Snapshot,
    remote: HashMap<String, String>,
    merge: Option<MergeInProgress>,
    counter: usize,
}

/// In-memory versioned store with branches, commits and three-way merge.
pub struct FakeDolt {
    data: Mutex<RepoData>,
}

impl FakeDolt {
    /// Completely uninitialized repository.
    pub fn new() -> Self {
        Self {
            data: Mutex::new(RepoData {
                initialized: false,
                current: "main".to_string(),
                branches: HashMap::new(),
                snapshots: HashMap::new(),
                working: Snapshot::new(),
                remote: HashMap::new(),
                merge: None,
                counter: 0,
            }),
        }
    }

    /// Initialized on `main` with one empty root commit.
    pub fn initialized() -> Arc<Self> {
        let fake = Self::new();
        {
            let mut data = fake.data.lock().unwrap();
            data.initialized = true;
            let hash = next_hash(&mut data);
            data.snapshots.insert(hash.clone(), Snapshot::new());
            data.branches.insert("main".to_string(), vec![hash]);
        }
        Arc::new(fake)
    }

    pub fn stage_doc(&self, collection: &str, doc_id: &str, content: &str) {
        self.stage_doc_with_meta(collection, doc_id, content, &[]);
    }

    pub fn stage_doc_with_meta(
        &self,
        collection: &str,
        doc_id: &str,
        content: &str,
        meta: &[(&str, &str)],
    ) {
        let mut data = self.data.lock().unwrap();
        let mut doc = Document::new(
            collection,
            doc_id,
            content,
            lockstep_bridge::content_hash(content),
        );
        for (key, value) in meta {
            doc.metadata
                .insert(key.to_string(), serde_json::json!(value));
        }
        data.working
            .entry(collection.to_string())
            .or_default()
            .insert(doc_id.to_string(), doc);
    }

    pub fn stage_delete(&self, collection: &str, doc_id: &str) {
        let mut data = self.data.lock().unwrap();
        if let Some(docs) = data.working.get_mut(collection) {
            docs.remove(doc_id);
        }
    }

    /// Register a remote branch head with the given snapshot.
    pub fn set_remote_branch(&self, branch: &str, snapshot_docs: &[(&str, &str, &str)]) -> String {
        let mut data = self.data.lock().unwrap();
        let mut snapshot = Snapshot::new();
        for (collection, doc_id, content) in snapshot_docs {
            let doc = Document::new(
                *collection,
                *doc_id,
                *content,
                lockstep_bridge::content_hash(content),
            );
            snapshot
                .entry(collection.to_string())
                .or_default()
                .insert(doc_id.to_string(), doc);
        }
        let hash = next_hash(&mut data);
        data.snapshots.insert(hash.clone(), snapshot);
        data.remote.insert(format!("origin/{branch}"), hash.clone());
        hash
    }
}

fn next_hash(data: &mut RepoData) -> String {
    data.counter += 1;
    format!("c{:04}", data.counter)
}

fn head_of(data: &RepoData, branch: &str) -> Option<String> {
    data.branches.get(branch).and_then(|h| h.last().cloned())
}

fn snapshot_at(data: &RepoData, reference: &str) -> Result<Snapshot> {
    if reference == "WORKING" {
        return Ok(data.working.clone());
    }
    let hash = if reference == "HEAD" {
        head_of(data, &data.current)
    } else if let Some(remote_hash) = data.remote.get(reference) {
        Some(remote_hash.clone())
    } else if data.branches.contains_key(reference) {
        head_of(data, reference)
    } else if data.snapshots.contains_key(reference) {
        Some(reference.to_string())
    } else {
        None
    };
    let hash = hash.ok_or_else(|| BridgeError::CommitNotFound(reference.to_string()))?;
    data.snapshots
        .get(&hash)
        .cloned()
        .ok_or_else(|| BridgeError::CommitNotFound(reference.to_string()))
}

fn diff_snapshots(from: &Snapshot, to: &Snapshot) -> Vec<DiffEntry> {
    let mut entries = Vec::new();
    let mut collections: Vec<&String> = from.keys().chain(to.keys()).collect();
    collections.sort();
    collections.dedup();
    for collection in collections {
        let empty = BTreeMap::new();
        let from_docs = from.get(collection).unwrap_or(&empty);
        let to_docs = to.get(collection).unwrap_or(&empty);
        for (doc_id, doc) in to_docs {
            match from_docs.get(doc_id) {
                None => entries.push(DiffEntry {
                    collection: collection.clone(),
                    doc_id: doc_id.clone(),
                    change: ChangeKind::Added,
                }),
                Some(old) if old != doc => entries.push(DiffEntry {
                    collection: collection.clone(),
                    doc_id: doc_id.clone(),
                    change: ChangeKind::Modified,
                }),
                Some(_) => {}
            }
        }
        for doc_id in from_docs.keys() {
            if !to_docs.contains_key(doc_id) {
                entries.push(DiffEntry {
                    collection: collection.clone(),
                    doc_id: doc_id.clone(),
                    change: ChangeKind::Removed,
                });
            }
        }
    }
    entries
}

/// Last commit shared by both branch histories.
fn common_ancestor(data: &RepoData, target: &str, source_head: &str) -> Snapshot {
    let target_history = data.branches.get(target).cloned().unwrap_or_default();
    // Source history: the branch whose head matches, otherwise just the head.
    let source_history: Vec<String> = data
        .branches
        .values()
        .find(|h| h.last().map(String::as_str) == Some(source_head))
        .cloned()
        .unwrap_or_else(|| vec![source_head.to_string()]);
    for hash in target_history.iter().rev() {
        if source_history.contains(hash) {
            return data.snapshots.get(hash).cloned().unwrap_or_default();
        }
    }
    Snapshot::new()
}

#[async_trait]
impl DoltRepo for FakeDolt {
    async fn is_initialized(&self) -> bool {
        self.data.lock().unwrap().initialized
    }

    async fn current_branch(&self) -> Result<String> {
        Ok(self.data.lock().unwrap().current.clone())
    }

    async fn head_commit(&self) -> Result<String> {
        let data = self.data.lock().unwrap();
        head_of(&data, &data.current)
            .ok_or_else(|| BridgeError::NotInitialized("no commits".to_string()))
    }

    async fn log(&self, limit: usize) -> Result<Vec<CommitInfo>> {
        let data = self.data.lock().unwrap();
        let history = data.branches.get(&data.current).cloned().unwrap_or_default();
        Ok(history
            .iter()
            .rev()
            .take(limit)
            .map(|hash| CommitInfo {
                hash: hash.clone(),
                message: String::new(),
                committed_at: String::new(),
            })
            .collect())
    }

    async fn resolve_ref(&self, reference: &str) -> Result<Option<String>> {
        let data = self.data.lock().unwrap();
        if reference == "HEAD" {
            return Ok(head_of(&data, &data.current));
        }
        if let Some(hash) = data.remote.get(reference) {
            return Ok(Some(hash.clone()));
        }
        if data.branches.contains_key(reference) {
            return Ok(head_of(&data, reference));
        }
        if data.snapshots.contains_key(reference) {
            return Ok(Some(reference.to_string()));
        }
        Ok(None)
    }

    async fn list_collections(&self) -> Result<Vec<String>> {
        let data = self.data.lock().unwrap();
        let snapshot = snapshot_at(&data, "HEAD")?;
        let mut names: Vec<String> = snapshot.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn docs_at(&self, collection: &str, reference: &str) -> Result<Vec<Document>> {
        let data = self.data.lock().unwrap();
        let snapshot = snapshot_at(&data, reference)?;
        Ok(snapshot
            .get(collection)
            .map(|docs| docs.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn diff(&self, from: &str, to: &str) -> Result<Vec<DiffEntry>> {
        let data = self.data.lock().unwrap();
        let from_snapshot = snapshot_at(&data, from)?;
        let to_snapshot = snapshot_at(&data, to)?;
        Ok(diff_snapshots(&from_snapshot, &to_snapshot))
    }

    async fn local_changes(&self) -> Result<Vec<DiffEntry>> {
        self.diff("HEAD", "WORKING").await
    }

    async fn has_conflicts(&self) -> Result<bool> {
        let data = self.data.lock().unwrap();
        Ok(data
            .merge
            .as_ref()
            .map(|m| !m.conflicts.is_empty())
            .unwrap_or(false))
    }

    async fn commit(&self, _message: &str) -> Result<String> {
        let mut data = self.data.lock().unwrap();
        let hash = next_hash(&mut data);
        let snapshot = data.working.clone();
        data.snapshots.insert(hash.clone(), snapshot);
        let branch = data.current.clone();
        data.branches.entry(branch).or_default().push(hash.clone());
        Ok(hash)
    }

    async fn reset_hard(&self, target: &str) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        let snapshot = snapshot_at(&data, target)?;
        let hash = if target == "HEAD" {
            head_of(&data, &data.current)
                .ok_or_else(|| BridgeError::CommitNotFound(target.to_string()))?
        } else if let Some(remote) = data.remote.get(target) {
            remote.clone()
        } else if data.branches.contains_key(target) {
            head_of(&data, target)
                .ok_or_else(|| BridgeError::CommitNotFound(target.to_string()))?
        } else {
            target.to_string()
        };
        data.working = snapshot;
        let branch = data.current.clone();
        let history = data.branches.entry(branch).or_default();
        if let Some(pos) = history.iter().position(|h| *h == hash) {
            history.truncate(pos + 1);
        } else {
            history.push(hash);
        }
        data.merge = None;
        Ok(())
    }

    async fn fetch(&self, _remote: &str) -> Result<()> {
        Ok(())
    }

    async fn checkout_branch(&self, name: &str, create: bool) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        if create {
            let history = data
                .branches
                .get(&data.current)
                .cloned()
                .unwrap_or_default();
            data.branches.insert(name.to_string(), history);
        } else if !data.branches.contains_key(name) {
            return Err(BridgeError::CommitNotFound(name.to_string()));
        }
        data.current = name.to_string();
        let snapshot = snapshot_at(&data, "HEAD")?;
        data.working = snapshot;
        Ok(())
    }

    async fn init(&self) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        data.initialized = true;
        if head_of(&data, "main").is_none() {
            let hash = next_hash(&mut data);
            data.snapshots.insert(hash.clone(), Snapshot::new());
            data.branches.insert("main".to_string(), vec![hash]);
        }
        Ok(())
    }

    async fn clone_from(&self, _remote: &str) -> Result<()> {
        self.init().await
    }

    async fn merge_dry_run(&self, source: &str) -> Result<DryRunReport> {
        let head = self.head_commit().await?;
        let begun = self.begin_merge(source).await?;
        let mut report = DryRunReport {
            conflicts: begun.conflicts,
            ..DryRunReport::default()
        };
        if !begun.already_up_to_date {
            for entry in self.diff(&head, "WORKING").await? {
                match entry.change {
                    ChangeKind::Added => report.added += 1,
                    ChangeKind::Modified => report.modified += 1,
                    ChangeKind::Removed => report.deleted += 1,
                }
            }
        }
        self.abort_merge().await?;
        Ok(report)
    }

    async fn begin_merge(&self, source: &str) -> Result<MergeBegin> {
        let mut data = self.data.lock().unwrap();
        let source_head = if let Some(hash) = data.remote.get(source) {
            hash.clone()
        } else {
            head_of(&data, source)
                .ok_or_else(|| BridgeError::CommitNotFound(source.to_string()))?
        };
        let target = data.current.clone();
        let target_history = data.branches.get(&target).cloned().unwrap_or_default();
        if target_history.contains(&source_head) {
            return Ok(MergeBegin {
                already_up_to_date: true,
                conflicts: Vec::new(),
            });
        }

        let pre_working = data.working.clone();
        let source_snapshot = data
            .snapshots
            .get(&source_head)
            .cloned()
            .unwrap_or_default();
        let target_snapshot = snapshot_at(&data, "HEAD")?;
        let ancestor = common_ancestor(&data, &target, &source_head);

        let mut conflicts = Vec::new();
        let mut collections: Vec<String> = target_snapshot
            .keys()
            .chain(source_snapshot.keys())
            .cloned()
            .collect();
        collections.sort();
        collections.dedup();
        for collection in collections {
            let empty = BTreeMap::new();
            let ours_docs = target_snapshot.get(&collection).unwrap_or(&empty);
            let theirs_docs = source_snapshot.get(&collection).unwrap_or(&empty);
            let base_docs = ancestor.get(&collection).unwrap_or(&empty);
            let mut doc_ids: Vec<&String> =
                ours_docs.keys().chain(theirs_docs.keys()).collect();
            doc_ids.sort();
            doc_ids.dedup();
            for doc_id in doc_ids {
                let ours = ours_docs.get(doc_id);
                let theirs = theirs_docs.get(doc_id);
                let base = base_docs.get(doc_id);
                if ours == theirs || theirs == base {
                    continue;
                }
                if ours == base {
                    // Fast-forward their change into the working set.
                    let slot = data.working.entry(collection.clone()).or_default();
                    match theirs {
                        Some(doc) => {
                            slot.insert(doc_id.clone(), doc.clone());
                        }
                        None => {
                            slot.remove(doc_id);
                        }
                    }
                    continue;
                }
                conflicts.push(ConflictDocVersions {
                    collection: collection.clone(),
                    doc_id: doc_id.clone(),
                    base: base.cloned(),
                    ours: ours.cloned(),
                    theirs: theirs.cloned(),
                });
            }
        }

        data.merge = Some(MergeInProgress {
            pre_working,
            conflicts: conflicts.clone(),
            source_head,
        });
        Ok(MergeBegin {
            already_up_to_date: false,
            conflicts,
        })
    }

    async fn resolve_conflict(
        &self,
        collection: &str,
        doc_id: &str,
        side: &ConflictSide,
    ) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        let merge = data
            .merge
            .as_mut()
            .ok_or_else(|| BridgeError::ConflictState("no merge in progress".to_string()))?;
        let position = merge
            .conflicts
            .iter()
            .position(|c| c.collection == collection && c.doc_id == doc_id)
            .ok_or_else(|| {
                BridgeError::Validation(format!("no conflict for {collection}/{doc_id}"))
            })?;
        let conflict = merge.conflicts.remove(position);
        let resolved = match side {
            ConflictSide::Ours => conflict.ours.clone(),
            ConflictSide::Theirs => conflict.theirs.clone(),
            ConflictSide::Document(doc) => Some(doc.clone()),
        };
        let slot = data.working.entry(collection.to_string()).or_default();
        match resolved {
            Some(doc) => {
                slot.insert(doc_id.to_string(), doc);
            }
            None => {
                slot.remove(doc_id);
            }
        }
        Ok(())
    }

    async fn commit_merge(&self, _message: &str) -> Result<String> {
        {
            let data = self.data.lock().unwrap();
            match &data.merge {
                None => {
                    return Err(BridgeError::MergeCommitFailed(
                        "no merge in progress".to_string(),
                    ))
                }
                Some(merge) if !merge.conflicts.is_empty() => {
                    return Err(BridgeError::MergeCommitFailed(format!(
                        "{} conflicts remain",
                        merge.conflicts.len()
                    )))
                }
                Some(_) => {}
            }
        }
        let mut data = self.data.lock().unwrap();
        data.merge = None;
        let hash = next_hash(&mut data);
        let snapshot = data.working.clone();
        data.snapshots.insert(hash.clone(), snapshot);
        let branch = data.current.clone();
        data.branches.entry(branch).or_default().push(hash.clone());
        Ok(hash)
    }

    async fn abort_merge(&self) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        if let Some(merge) = data.merge.take() {
            data.working = merge.pre_working;
            let _ = merge.source_head;
        }
        Ok(())
    }
}

/// Embedding store that can be told to fail its next add batches.
pub struct FailingEmbedStore {
    inner: MemoryEmbedStore,
    fail_adds: AtomicBool,
}

impl FailingEmbedStore {
    pub fn new() -> Self {
        Self {
            inner: MemoryEmbedStore::new(),
            fail_adds: AtomicBool::new(false),
        }
    }

    pub fn fail_adds(&self, fail: bool) {
        self.fail_adds.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl EmbedStore for FailingEmbedStore {
    async fn list_collections(&self) -> Result<Vec<String>> {
        self.inner.list_collections().await
    }

    async fn get_or_create(&self, name: &str) -> Result<()> {
        self.inner.get_or_create(name).await
    }

    async fn add(&self, name: &str, entries: Vec<EdbEntry>) -> Result<usize> {
        if self.fail_adds.load(Ordering::SeqCst) {
            let first = entries.first().map(|e| e.id.clone()).unwrap_or_default();
            return Err(BridgeError::Validation(format!(
                "injected add failure at {first}"
            )));
        }
        self.inner.add(name, entries).await
    }

    async fn update(&self, name: &str, entries: Vec<EdbEntry>) -> Result<usize> {
        self.inner.update(name, entries).await
    }

    async fn delete(&self, name: &str, ids: &[String]) -> Result<usize> {
        self.inner.delete(name, ids).await
    }

    async fn count(&self, name: &str) -> Result<usize> {
        self.inner.count(name).await
    }

    async fn get_by_ids(&self, name: &str, ids: &[String]) -> Result<Vec<EdbEntry>> {
        self.inner.get_by_ids(name, ids).await
    }

    async fn get_all(&self, name: &str) -> Result<Vec<EdbEntry>> {
        self.inner.get_all(name).await
    }
}

/// A fully wired context over temp directories and in-memory stores.
pub struct TestBridge {
    pub ctx: BridgeContext,
    pub dolt: Arc<FakeDolt>,
    pub edb: Arc<MemoryEmbedStore>,
    pub external: Arc<MemoryEmbedStore>,
    pub sidecar: Arc<SidecarDb>,
    #[allow(dead_code)]
    pub dir: TempDir,
}

pub fn bridge_with(dolt: Arc<FakeDolt>) -> TestBridge {
    let dir = tempfile::tempdir().unwrap();
    let config = BridgeConfig::default()
        .with_project_root(dir.path())
        .with_repo_path(dir.path().join("repo"))
        .with_edb_data_path(dir.path().join("edb"));
    let edb = Arc::new(MemoryEmbedStore::new());
    let external = Arc::new(MemoryEmbedStore::new());
    let sidecar = Arc::new(SidecarDb::open_in_memory().unwrap());
    let manifest = Arc::new(ManifestStore::at_default(dir.path()));
    let ctx = BridgeContext::new(
        config,
        dolt.clone(),
        edb.clone(),
        external.clone(),
        sidecar.clone(),
        manifest,
    )
    .unwrap();
    TestBridge {
        ctx,
        dolt,
        edb,
        external,
        sidecar,
        dir,
    }
}

/// Seed the external store with one doc-level entry.
pub async fn seed_external(store: &MemoryEmbedStore, collection: &str, doc_id: &str, content: &str) {
    store.get_or_create(collection).await.unwrap();
    let entry = EdbEntry::new(doc_id, content).with_meta(
        lockstep_bridge::edb::META_CONTENT_HASH,
        lockstep_bridge::content_hash(content),
    );
    store.add(collection, vec![entry]).await.unwrap();
}
