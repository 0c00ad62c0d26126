//! Tool operations
//!
//! The flat operation surface an agent drives over RPC: status,
//! bootstrap, merge preview/execute, reset, import preview/execute.
//! Everything runs against a `BridgeContext` threaded through explicitly;
//! no component holds a reference back to its caller. Mutating tools
//! take the branch's write lock from the first versioned-store read to
//! the last sidecar write; read-only tools share a read lock.

use crate::config::BridgeConfig;
use crate::conflicts::Resolution;
use crate::dolt::{ChangeKind, DoltRepo};
use crate::edb::{CountCache, EmbedStore};
use crate::error::{BridgeError, ErrorCode, Result};
use crate::import::{ImportMapping, ImportPreview, ImportResult, ImportStrategy, Importer};
use crate::merge::{MergeEngine, MergePreview, MergeResult, ResolutionChoice};
use crate::sync::{SyncEngine, SyncReport};
use dashmap::DashMap;
use lockstep_storage::{Manifest, ManifestStore, SidecarDb};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Per-branch writer serialisation. The map itself is the only
/// process-wide state in the bridge.
#[derive(Default)]
pub struct BranchLocks {
    locks: DashMap<String, Arc<RwLock<()>>>,
}

impl BranchLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_branch(&self, branch: &str) -> Arc<RwLock<()>> {
        self.locks
            .entry(branch.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }
}

/// Everything a tool operation needs, constructed once and threaded
/// through explicitly.
pub struct BridgeContext {
    pub config: BridgeConfig,
    pub dolt: Arc<dyn DoltRepo>,
    pub edb: Arc<dyn EmbedStore>,
    /// External store that imports consolidate from.
    pub external_edb: Arc<dyn EmbedStore>,
    pub sidecar: Arc<SidecarDb>,
    pub manifest: Arc<ManifestStore>,
    pub counts: Arc<CountCache>,
    pub sync: Arc<SyncEngine>,
    pub merge: MergeEngine,
    locks: BranchLocks,
}

impl BridgeContext {
    pub fn new(
        config: BridgeConfig,
        dolt: Arc<dyn DoltRepo>,
        edb: Arc<dyn EmbedStore>,
        external_edb: Arc<dyn EmbedStore>,
        sidecar: Arc<SidecarDb>,
        manifest: Arc<ManifestStore>,
    ) -> Result<Self> {
        let counts = Arc::new(CountCache::new());
        let sync = Arc::new(SyncEngine::new(
            dolt.clone(),
            edb.clone(),
            sidecar.clone(),
            counts.clone(),
            &config,
        )?);
        let merge = MergeEngine::new(
            dolt.clone(),
            sync.clone(),
            sidecar.clone(),
            manifest.clone(),
            counts.clone(),
        );
        Ok(Self {
            config,
            dolt,
            edb,
            external_edb,
            sidecar,
            manifest,
            counts,
            sync,
            merge,
            locks: BranchLocks::new(),
        })
    }

    async fn lock_branch(&self) -> Arc<RwLock<()>> {
        let branch = self
            .dolt
            .current_branch()
            .await
            .unwrap_or_else(|_| "main".to_string());
        self.locks.for_branch(&branch)
    }
}

// ----------------------------------------------------------------------
// Repository status
// ----------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RepoState {
    Ready,
    Uninitialized,
    #[serde(rename = "ManifestOnly_NeedsVDBBootstrap")]
    ManifestOnlyNeedsVdbBootstrap,
    #[serde(rename = "ManifestOnly_NeedsEDBBootstrap")]
    ManifestOnlyNeedsEdbBootstrap,
    #[serde(rename = "ManifestOnly_NeedsFullBootstrap")]
    ManifestOnlyNeedsFullBootstrap,
    #[serde(rename = "PathMisaligned_VDBNested")]
    PathMisalignedVdbNested,
    #[serde(rename = "InfrastructureOnly_NeedsManifest")]
    InfrastructureOnlyNeedsManifest,
    Inconsistent,
}

impl RepoState {
    pub fn description(&self) -> &'static str {
        match self {
            RepoState::Ready => "manifest, versioned store and embedding store all present",
            RepoState::Uninitialized => "nothing is set up yet",
            RepoState::ManifestOnlyNeedsVdbBootstrap => {
                "manifest and embedding store present; versioned store missing"
            }
            RepoState::ManifestOnlyNeedsEdbBootstrap => {
                "manifest and versioned store present; embedding store missing"
            }
            RepoState::ManifestOnlyNeedsFullBootstrap => {
                "manifest present; both stores missing"
            }
            RepoState::PathMisalignedVdbNested => {
                "a versioned store exists nested below the configured path"
            }
            RepoState::InfrastructureOnlyNeedsManifest => {
                "stores exist but the project manifest is missing"
            }
            RepoState::Inconsistent => "on-disk state does not match any known layout",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreProbe {
    pub exists: bool,
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestProbe {
    pub exists: bool,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest: Option<Manifest>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryStatusReport {
    pub state: RepoState,
    pub state_description: String,
    pub is_ready: bool,
    pub available_actions: Vec<String>,
    pub recommended_action: String,
    pub project_root: String,
    pub manifest: ManifestProbe,
    pub vdb: StoreProbe,
    pub edb: StoreProbe,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path_issue: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Find a `.dolt` directory one level below `repo_path`.
fn find_nested_store(repo_path: &Path) -> Option<std::path::PathBuf> {
    let entries = std::fs::read_dir(repo_path).ok()?;
    for entry in entries.flatten() {
        let candidate = entry.path();
        if candidate.is_dir() && candidate.join(".dolt").is_dir() {
            return Some(candidate);
        }
    }
    None
}

impl BridgeContext {
    /// Classify the on-disk layout and report what an agent can do next.
    pub async fn repository_status(&self) -> Result<RepositoryStatusReport> {
        let lock = self.lock_branch().await;
        let _guard = lock.read().await;

        let vdb_exists = self.dolt.is_initialized().await;
        let edb_exists = self.config.edb_data_path.is_dir();
        let manifest_exists = self.manifest.exists();

        let (manifest_value, manifest_error) = if manifest_exists {
            match self.manifest.load() {
                Ok(m) => (Some(m), None),
                Err(e) => (None, Some(e.to_string())),
            }
        } else {
            (None, None)
        };

        let nested = if vdb_exists {
            None
        } else {
            find_nested_store(&self.config.repo_path)
        };

        let state = if manifest_error.is_some() {
            RepoState::Inconsistent
        } else if nested.is_some() {
            RepoState::PathMisalignedVdbNested
        } else if manifest_exists && vdb_exists && edb_exists {
            RepoState::Ready
        } else if manifest_exists && vdb_exists {
            RepoState::ManifestOnlyNeedsEdbBootstrap
        } else if manifest_exists && edb_exists {
            RepoState::ManifestOnlyNeedsVdbBootstrap
        } else if manifest_exists {
            RepoState::ManifestOnlyNeedsFullBootstrap
        } else if vdb_exists || edb_exists {
            RepoState::InfrastructureOnlyNeedsManifest
        } else {
            RepoState::Uninitialized
        };

        let (available_actions, recommended_action) = match state {
            RepoState::Ready => (
                vec![
                    "FullSync".to_string(),
                    "PreviewMerge".to_string(),
                    "Reset".to_string(),
                    "PreviewImport".to_string(),
                ],
                "None".to_string(),
            ),
            RepoState::Uninitialized => (
                vec!["Bootstrap".to_string()],
                "DoltClone or DoltInit".to_string(),
            ),
            RepoState::PathMisalignedVdbNested => (
                vec!["Bootstrap".to_string()],
                "Bootstrap with a path_fix_strategy".to_string(),
            ),
            RepoState::InfrastructureOnlyNeedsManifest => (
                vec!["Bootstrap".to_string()],
                "Bootstrap to create the manifest".to_string(),
            ),
            RepoState::Inconsistent => (vec![], "Inspect the project root by hand".to_string()),
            _ => (vec!["Bootstrap".to_string()], "Bootstrap".to_string()),
        };

        Ok(RepositoryStatusReport {
            state,
            state_description: state.description().to_string(),
            is_ready: state == RepoState::Ready,
            available_actions,
            recommended_action,
            project_root: self.config.project_root.display().to_string(),
            manifest: ManifestProbe {
                exists: manifest_exists,
                path: self.manifest.path().display().to_string(),
                manifest: manifest_value,
            },
            vdb: StoreProbe {
                exists: vdb_exists,
                path: self.config.repo_path.display().to_string(),
            },
            edb: StoreProbe {
                exists: edb_exists,
                path: self.config.edb_data_path.display().to_string(),
            },
            path_issue: nested.map(|p| {
                format!(
                    "versioned store found at {} instead of {}",
                    p.display(),
                    self.config.repo_path.display()
                )
            }),
            error: manifest_error,
        })
    }
}

// ----------------------------------------------------------------------
// Bootstrap
// ----------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PathFixStrategy {
    MoveToConfiguredPath,
    UpdateConfiguration,
    CloneFreshDiscardMisaligned,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BootstrapOptions {
    pub bootstrap_vdb: bool,
    pub bootstrap_edb: bool,
    pub sync_to_manifest_commit: bool,
    pub create_work_branch: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_branch_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_fix_strategy: Option<PathFixStrategy>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapResult {
    pub actions: Vec<String>,
    pub state: RepoState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub work_branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync: Option<SyncReport>,
}

impl BridgeContext {
    pub async fn bootstrap(
        &self,
        options: &BootstrapOptions,
        cancel: &CancellationToken,
    ) -> Result<BootstrapResult> {
        let lock = self.lock_branch().await;
        let _guard = lock.write().await;

        let mut actions = Vec::new();

        // Path repair comes first; everything else assumes the
        // configured layout.
        if !self.dolt.is_initialized().await {
            if let Some(nested) = find_nested_store(&self.config.repo_path) {
                match options.path_fix_strategy {
                    Some(PathFixStrategy::MoveToConfiguredPath) => {
                        std::fs::rename(
                            nested.join(".dolt"),
                            self.config.repo_path.join(".dolt"),
                        )?;
                        actions.push(format!(
                            "moved versioned store from {} to {}",
                            nested.display(),
                            self.config.repo_path.display()
                        ));
                    }
                    Some(PathFixStrategy::UpdateConfiguration) => {
                        actions.push(format!(
                            "set {} to {} to adopt the nested store",
                            crate::config::ENV_REPO_PATH,
                            nested.display()
                        ));
                    }
                    Some(PathFixStrategy::CloneFreshDiscardMisaligned) => {
                        std::fs::remove_dir_all(&nested)?;
                        actions.push(format!("discarded misaligned store at {}", nested.display()));
                    }
                    None => {
                        return Err(BridgeError::Validation(
                            "nested versioned store found; pass a path_fix_strategy".to_string(),
                        ));
                    }
                }
            }
        }

        // Manifest before stores so a clone knows its remote.
        if !self.manifest.exists() {
            let manifest = Manifest::new("", "main");
            self.manifest.save(&manifest)?;
            actions.push("created manifest".to_string());
        }
        let manifest = self.manifest.load()?;

        if options.bootstrap_vdb && !self.dolt.is_initialized().await {
            if manifest.remote_url.is_empty() {
                self.dolt.init().await?;
                actions.push("initialized versioned store".to_string());
            } else {
                DoltRepo::clone_from(&*self.dolt, &manifest.remote_url).await?;
                actions.push(format!("cloned {}", manifest.remote_url));
            }
        }

        if options.bootstrap_edb && !self.config.edb_data_path.is_dir() {
            std::fs::create_dir_all(&self.config.edb_data_path)?;
            actions.push("created embedding store data directory".to_string());
        }

        if options.sync_to_manifest_commit {
            if let Some(commit) = &manifest.current_commit {
                if self.dolt.resolve_ref(commit).await?.is_none() {
                    return Err(BridgeError::CommitNotFound(commit.clone()));
                }
                self.dolt.reset_hard(commit).await?;
                actions.push(format!("moved to manifest commit {commit}"));
            }
        }

        let mut work_branch = None;
        if options.create_work_branch {
            let name = options
                .work_branch_name
                .clone()
                .unwrap_or_else(|| "work".to_string());
            self.dolt.checkout_branch(&name, true).await?;
            actions.push(format!("created work branch {name}"));
            work_branch = Some(name);
        }

        // Populate the embedding store whenever a versioned store exists.
        let sync = if self.dolt.is_initialized().await {
            let report = self.sync.full_sync(true, cancel).await?;
            let branch = report.branch.clone();
            let commit = report.commit.clone();
            if let Err(e) = self.manifest.update_pointer(&branch, &commit) {
                warn!(error = %e, "failed to update manifest pointer after bootstrap");
            }
            Some(report)
        } else {
            None
        };

        let state = self.repository_status_unlocked().await?;
        info!(actions = actions.len(), "bootstrap finished");
        Ok(BootstrapResult {
            actions,
            state,
            work_branch,
            sync,
        })
    }

    /// Status classification without taking the read lock (callers that
    /// already hold the write lock).
    async fn repository_status_unlocked(&self) -> Result<RepoState> {
        let vdb_exists = self.dolt.is_initialized().await;
        let edb_exists = self.config.edb_data_path.is_dir();
        let manifest_exists = self.manifest.exists();
        Ok(match (manifest_exists, vdb_exists, edb_exists) {
            (true, true, true) => RepoState::Ready,
            (true, true, false) => RepoState::ManifestOnlyNeedsEdbBootstrap,
            (true, false, true) => RepoState::ManifestOnlyNeedsVdbBootstrap,
            (true, false, false) => RepoState::ManifestOnlyNeedsFullBootstrap,
            (false, false, false) => RepoState::Uninitialized,
            _ => RepoState::InfrastructureOnlyNeedsManifest,
        })
    }
}

// ----------------------------------------------------------------------
// Reset
// ----------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocalChanges {
    pub added: usize,
    pub modified: usize,
    pub deleted: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ResetOutcome {
    /// Refused: local changes exist and the caller did not confirm.
    ConfirmationRequired {
        error: String,
        local_changes: LocalChanges,
        message: String,
    },
    Complete {
        target: String,
        new_head: String,
        discarded_changes: usize,
        sync: SyncReport,
    },
}

impl BridgeContext {
    /// Hard-reset the branch and force the embedding store back into
    /// agreement. Refuses to discard local changes unless confirmed.
    pub async fn reset(
        &self,
        target: &str,
        confirm_discard: bool,
        cancel: &CancellationToken,
    ) -> Result<ResetOutcome> {
        let lock = self.lock_branch().await;
        let _guard = lock.write().await;

        let status = self.dolt.status().await?;
        let branch = status.branch.clone();
        let changes = status.changes;
        if !changes.is_empty() && !confirm_discard {
            let mut local = LocalChanges {
                total: changes.len(),
                ..LocalChanges::default()
            };
            for change in &changes {
                match change.change {
                    ChangeKind::Added => local.added += 1,
                    ChangeKind::Modified => local.modified += 1,
                    ChangeKind::Removed => local.deleted += 1,
                }
            }
            return Ok(ResetOutcome::ConfirmationRequired {
                error: ErrorCode::ConfirmationRequired.as_str().to_string(),
                local_changes: local,
                message: format!(
                    "{} local changes would be discarded; re-run with confirm_discard",
                    changes.len()
                ),
            });
        }

        let resolved = self.resolve_reset_target(target).await?;
        info!(branch = %branch, target, commit = %resolved, "hard reset");
        self.dolt.reset_hard(&resolved).await?;

        let sync = self.sync.post_reset_reconcile(&branch, cancel).await?;

        if self.manifest.exists() {
            if let Err(e) = self.manifest.update_pointer(&branch, &resolved) {
                warn!(error = %e, "failed to update manifest pointer after reset");
            }
        }

        Ok(ResetOutcome::Complete {
            target: target.to_string(),
            new_head: resolved,
            discarded_changes: changes.len(),
            sync,
        })
    }

    /// `HEAD`, a commit hash, or `origin/<branch>` (resolved by fetching
    /// first, then reading the remote ref's latest commit).
    async fn resolve_reset_target(&self, target: &str) -> Result<String> {
        if target == "HEAD" {
            return self.dolt.head_commit().await;
        }
        if let Some(remote_branch) = target.strip_prefix("origin/") {
            self.dolt.fetch("origin").await?;
            return self
                .dolt
                .resolve_ref(&format!("origin/{remote_branch}"))
                .await?
                .ok_or_else(|| BridgeError::CommitNotFound(target.to_string()));
        }
        self.dolt
            .resolve_ref(target)
            .await?
            .ok_or_else(|| BridgeError::CommitNotFound(target.to_string()))
    }
}

// ----------------------------------------------------------------------
// Merge tools
// ----------------------------------------------------------------------

impl BridgeContext {
    pub async fn preview_merge(
        &self,
        source: &str,
        target: Option<&str>,
        include_content_preview: bool,
    ) -> Result<MergePreview> {
        let lock = self.lock_branch().await;
        let _guard = lock.read().await;
        self.merge
            .preview(source, target, include_content_preview, false)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn execute_merge(
        &self,
        source: &str,
        target: Option<&str>,
        conflict_resolutions: Option<&serde_json::Value>,
        auto_resolve_remaining: bool,
        force: bool,
        message: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<MergeResult> {
        let lock = self.lock_branch().await;
        let _guard = lock.write().await;

        let resolutions = match conflict_resolutions {
            Some(raw) => parse_conflict_resolutions(raw)?,
            None => HashMap::new(),
        };
        self.merge
            .execute(
                source,
                target,
                &resolutions,
                auto_resolve_remaining,
                force,
                message,
                cancel,
            )
            .await
    }
}

/// Parse the caller's `{conflict_id: resolution}` JSON. A resolution is
/// either a strategy string or `{"strategy": "custom", "content": ...,
/// "metadata": {...}}`.
pub fn parse_conflict_resolutions(
    raw: &serde_json::Value,
) -> Result<HashMap<String, ResolutionChoice>> {
    let object = raw.as_object().ok_or_else(|| {
        BridgeError::InvalidResolutionJson("resolutions must be a JSON object".to_string())
    })?;
    let mut resolutions = HashMap::new();
    for (conflict_id, value) in object {
        let choice = match value {
            serde_json::Value::String(s) => ResolutionChoice::Named(
                Resolution::parse(s)
                    .map_err(|e| BridgeError::InvalidResolutionJson(e.to_string()))?,
            ),
            serde_json::Value::Object(map) => {
                let strategy = map
                    .get("strategy")
                    .and_then(|v| v.as_str())
                    .unwrap_or("custom");
                if !strategy.eq_ignore_ascii_case("custom") {
                    ResolutionChoice::Named(Resolution::parse(strategy).map_err(|e| {
                        BridgeError::InvalidResolutionJson(e.to_string())
                    })?)
                } else {
                    let content = map
                        .get("content")
                        .and_then(|v| v.as_str())
                        .ok_or_else(|| {
                            BridgeError::InvalidResolutionJson(format!(
                                "custom resolution for {conflict_id} is missing content"
                            ))
                        })?
                        .to_string();
                    let metadata: BTreeMap<String, serde_json::Value> = map
                        .get("metadata")
                        .and_then(|v| v.as_object())
                        .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                        .unwrap_or_default();
                    ResolutionChoice::Custom { content, metadata }
                }
            }
            other => {
                return Err(BridgeError::InvalidResolutionJson(format!(
                    "resolution for {conflict_id} must be a string or object, got {other}"
                )));
            }
        };
        resolutions.insert(conflict_id.clone(), choice);
    }
    Ok(resolutions)
}

// ----------------------------------------------------------------------
// Import tools
// ----------------------------------------------------------------------

impl BridgeContext {
    pub async fn preview_import(
        &self,
        filter: &[ImportMapping],
        include_content_preview: bool,
    ) -> Result<ImportPreview> {
        let lock = self.lock_branch().await;
        let _guard = lock.read().await;
        Importer::new(self.external_edb.clone(), self.edb.clone())
            .preview(filter, include_content_preview)
            .await
    }

    pub async fn execute_import(
        &self,
        filter: &[ImportMapping],
        resolutions: Option<&HashMap<String, String>>,
        default_strategy: Option<&str>,
    ) -> Result<ImportResult> {
        let lock = self.lock_branch().await;
        let _guard = lock.write().await;

        let default_strategy = match default_strategy {
            Some(raw) => Some(ImportStrategy::parse(raw)?),
            None => None,
        };
        let empty = HashMap::new();
        let result = Importer::new(self.external_edb.clone(), self.edb.clone())
            .execute(filter, resolutions.unwrap_or(&empty), default_strategy)
            .await?;
        self.counts.invalidate_all();
        Ok(result)
    }
}

/// JSON error envelope for the RPC boundary: the taxonomy code plus the
/// human message.
pub fn error_payload(err: &BridgeError) -> serde_json::Value {
    serde_json::json!({
        "error": err.code().as_str(),
        "message": err.to_string(),
    })
}
