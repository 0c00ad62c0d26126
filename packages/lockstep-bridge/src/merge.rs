//! Merge reconciliation state machine
//!
//! `Idle -> Previewing -> AwaitingResolution -> Executing -> Reconciling
//! -> Done | Failed`. Preview is a pure read (the driver's dry run
//! restores the working state). Execute applies caller resolutions by
//! conflict id, auto-resolves the remainder when asked, refuses to
//! commit while anything stays unresolved, and reconciles the embedding
//! store from the new head before the manifest pointer moves.

use crate::conflicts::{self, ConflictInfo, Resolution, CONTENT_FIELD};
use crate::dolt::{ConflictDocVersions, ConflictSide, DoltRepo};
use crate::edb::CountCache;
use crate::error::{BridgeError, Result};
use crate::sync::{SyncEngine, SyncReport};
use lockstep_storage::{Document, ManifestStore, SidecarDb, SyncStatus};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePhase {
    Idle,
    Previewing,
    AwaitingResolution,
    Executing,
    Reconciling,
    Done,
    Failed,
}

impl MergePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergePhase::Idle => "idle",
            MergePhase::Previewing => "previewing",
            MergePhase::AwaitingResolution => "awaiting_resolution",
            MergePhase::Executing => "executing",
            MergePhase::Reconciling => "reconciling",
            MergePhase::Done => "done",
            MergePhase::Failed => "failed",
        }
    }

    fn can_transition_to(&self, next: MergePhase) -> bool {
        use MergePhase::*;
        matches!(
            (self, next),
            (Idle, Previewing)
                | (Done, Previewing)
                | (Failed, Previewing)
                | (Previewing, AwaitingResolution)
                | (Previewing, Idle)
                | (Previewing, Failed)
                | (Idle, Executing)
                | (Done, Executing)
                | (Failed, Executing)
                | (AwaitingResolution, Executing)
                | (AwaitingResolution, Previewing)
                | (Executing, Reconciling)
                | (Executing, Failed)
                | (Executing, Done)
                | (Reconciling, Done)
                | (Reconciling, Failed)
        )
    }
}

/// Heads captured at preview time; execute compares against them to
/// detect drift.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PreviewStamp {
    source: String,
    target: String,
    source_head: String,
    target_head: String,
}

/// Sidecar-table health reported alongside a preview.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuxiliaryTableStatus {
    pub collections_tracked: usize,
    pub collections_in_error: Vec<String>,
    pub pending_deletions: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergePreview {
    pub source: String,
    pub target: String,
    pub source_head: String,
    pub target_head: String,
    pub can_auto_merge: bool,
    pub added: usize,
    pub modified: usize,
    pub deleted: usize,
    pub conflicts: Vec<ConflictInfo>,
    pub auxiliary_tables: AuxiliaryTableStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeResult {
    pub source: String,
    pub target: String,
    pub merge_commit: Option<String>,
    pub already_up_to_date: bool,
    pub resolved_conflicts: usize,
    pub auto_resolved_conflicts: usize,
    pub sync: Option<SyncReport>,
    pub message: String,
}

/// A caller-supplied resolution for one conflict id.
#[derive(Debug, Clone)]
pub enum ResolutionChoice {
    Named(Resolution),
    Custom {
        content: String,
        metadata: BTreeMap<String, serde_json::Value>,
    },
}

pub struct MergeEngine {
    dolt: Arc<dyn DoltRepo>,
    sync: Arc<SyncEngine>,
    sidecar: Arc<SidecarDb>,
    manifest: Arc<ManifestStore>,
    counts: Arc<CountCache>,
    phase: Mutex<MergePhase>,
    last_preview: Mutex<Option<PreviewStamp>>,
}

impl MergeEngine {
    pub fn new(
        dolt: Arc<dyn DoltRepo>,
        sync: Arc<SyncEngine>,
        sidecar: Arc<SidecarDb>,
        manifest: Arc<ManifestStore>,
        counts: Arc<CountCache>,
    ) -> Self {
        Self {
            dolt,
            sync,
            sidecar,
            manifest,
            counts,
            phase: Mutex::new(MergePhase::Idle),
            last_preview: Mutex::new(None),
        }
    }

    pub fn phase(&self) -> MergePhase {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn transition(&self, next: MergePhase) -> Result<()> {
        let mut phase = self.phase.lock().unwrap_or_else(|e| e.into_inner());
        if !phase.can_transition_to(next) {
            return Err(BridgeError::InvalidPhaseTransition {
                from: phase.as_str().to_string(),
                to: next.as_str().to_string(),
            });
        }
        *phase = next;
        Ok(())
    }

    fn force_phase(&self, next: MergePhase) {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner()) = next;
    }

    /// Dry-run analysis of merging `source` into `target`. Requires a
    /// clean working tree unless `force`.
    pub async fn preview(
        &self,
        source: &str,
        target: Option<&str>,
        include_content_preview: bool,
        force: bool,
    ) -> Result<MergePreview> {
        let target = self.resolve_target(target).await?;
        self.ensure_clean_or_forced(force).await?;
        self.transition(MergePhase::Previewing)?;

        let result = self
            .preview_inner(source, &target, include_content_preview)
            .await;
        match &result {
            Ok(preview) if preview.conflicts.is_empty() => {
                self.force_phase(MergePhase::Idle);
            }
            Ok(_) => self.force_phase(MergePhase::AwaitingResolution),
            Err(_) => self.force_phase(MergePhase::Failed),
        }
        result
    }

    async fn preview_inner(
        &self,
        source: &str,
        target: &str,
        include_content_preview: bool,
    ) -> Result<MergePreview> {
        let source_head = self
            .dolt
            .resolve_ref(source)
            .await?
            .ok_or_else(|| BridgeError::CommitNotFound(source.to_string()))?;
        let target_head = self.dolt.head_commit().await?;

        let dry = self.dolt.merge_dry_run(source).await?;
        let mut conflict_infos: Vec<ConflictInfo> = dry
            .conflicts
            .iter()
            .map(|v| conflicts::analyze(v, source, target))
            .collect();
        if !include_content_preview {
            for info in &mut conflict_infos {
                strip_content_preview(info);
            }
        }
        let can_auto_merge = conflict_infos.iter().all(|c| c.auto_resolvable);

        *self.last_preview.lock().unwrap_or_else(|e| e.into_inner()) = Some(PreviewStamp {
            source: source.to_string(),
            target: target.to_string(),
            source_head: source_head.clone(),
            target_head: target_head.clone(),
        });

        info!(
            source,
            target,
            conflicts = conflict_infos.len(),
            can_auto_merge,
            "merge preview complete"
        );

        Ok(MergePreview {
            source: source.to_string(),
            target: target.to_string(),
            source_head,
            target_head,
            can_auto_merge,
            added: dry.added,
            modified: dry.modified,
            deleted: dry.deleted,
            conflicts: conflict_infos,
            auxiliary_tables: self.auxiliary_status(target)?,
        })
    }

    /// Merge `source` into `target`, resolving conflicts, committing, and
    /// reconciling the embedding store. Non-cancellable past the commit
    /// point.
    #[allow(clippy::too_many_arguments)]
    pub async fn execute(
        &self,
        source: &str,
        target: Option<&str>,
        resolutions: &HashMap<String, ResolutionChoice>,
        auto_resolve_remaining: bool,
        force: bool,
        message: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<MergeResult> {
        let target = self.resolve_target(target).await?;
        self.ensure_clean_or_forced(force).await?;

        let source_head = self
            .dolt
            .resolve_ref(source)
            .await?
            .ok_or_else(|| BridgeError::CommitNotFound(source.to_string()))?;
        let target_head = self.dolt.head_commit().await?;

        // Drift check: a stale preview id map must not be applied to
        // branches that moved after the preview.
        let stamp = self
            .last_preview
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(stamp) = stamp {
            if stamp.source == source
                && stamp.target == target
                && (stamp.source_head != source_head || stamp.target_head != target_head)
            {
                return Err(BridgeError::DriftedSincePreview(format!(
                    "{source} or {target} advanced since preview; re-run preview"
                )));
            }
        }

        self.transition(MergePhase::Executing)?;
        let result = self
            .execute_inner(source, &target, resolutions, auto_resolve_remaining, message, cancel)
            .await;
        match &result {
            Ok(_) => self.force_phase(MergePhase::Done),
            Err(_) => self.force_phase(MergePhase::Failed),
        }
        result
    }

    async fn execute_inner(
        &self,
        source: &str,
        target: &str,
        resolutions: &HashMap<String, ResolutionChoice>,
        auto_resolve_remaining: bool,
        message: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<MergeResult> {
        let begun = self.dolt.begin_merge(source).await?;
        if begun.already_up_to_date {
            return Ok(MergeResult {
                source: source.to_string(),
                target: target.to_string(),
                merge_commit: None,
                already_up_to_date: true,
                resolved_conflicts: 0,
                auto_resolved_conflicts: 0,
                sync: None,
                message: "already up to date".to_string(),
            });
        }

        // Plan every conflict before touching any of them.
        let total = begun.conflicts.len();
        let mut planned: Vec<(&ConflictDocVersions, ConflictSide)> = Vec::new();
        let mut auto_resolved = 0;
        let mut unresolved = 0;
        for versions in &begun.conflicts {
            let info = conflicts::analyze(versions, source, target);
            let choice = match resolutions.get(&info.conflict_id) {
                Some(choice) => Some(choice.clone()),
                None if auto_resolve_remaining => {
                    if info.suggested_resolution == Resolution::Manual {
                        None
                    } else {
                        auto_resolved += 1;
                        Some(ResolutionChoice::Named(info.suggested_resolution))
                    }
                }
                None => None,
            };
            match choice.and_then(|c| plan_side(versions, &info, c)) {
                Some(side) => planned.push((versions, side)),
                None => unresolved += 1,
            }
        }

        if unresolved > 0 {
            self.dolt.abort_merge().await?;
            return Err(BridgeError::UnresolvedConflicts { total, unresolved });
        }

        for (versions, side) in &planned {
            self.dolt
                .resolve_conflict(&versions.collection, &versions.doc_id, side)
                .await?;
        }

        let default_message = format!("Merge {source} into {target}");
        let merge_commit = self
            .dolt
            .commit_merge(message.unwrap_or(&default_message))
            .await?;

        info!(source, target, commit = %merge_commit, "merge committed");

        // Past the commit point: reconcile failures never roll back.
        self.force_phase(MergePhase::Reconciling);
        self.counts.invalidate_all();
        let (sync, sync_note) = match self.sync.full_sync(true, cancel).await {
            Ok(report) => {
                let note = if report.has_errors() || report.cancelled {
                    "; reconcile incomplete, run a forced full sync"
                } else {
                    ""
                };
                (Some(report), note)
            }
            Err(e) => {
                warn!(error = %e, "post-merge reconcile failed");
                (None, "; reconcile failed, run a forced full sync")
            }
        };

        if let Err(e) = self
            .sync
            .observe_committed_deletions(target, &merge_commit)
            .await
        {
            warn!(error = %e, "failed to observe committed deletions");
        }

        if self.manifest.exists() {
            if let Err(e) = self.manifest.update_pointer(target, &merge_commit) {
                warn!(error = %e, "failed to update manifest pointer");
            }
        }

        Ok(MergeResult {
            source: source.to_string(),
            target: target.to_string(),
            merge_commit: Some(merge_commit),
            already_up_to_date: false,
            resolved_conflicts: planned.len(),
            auto_resolved_conflicts: auto_resolved,
            sync,
            message: format!("merged {source} into {target}{sync_note}"),
        })
    }

    async fn resolve_target(&self, target: Option<&str>) -> Result<String> {
        let current = self.dolt.current_branch().await?;
        match target {
            Some(t) if t != current => Err(BridgeError::Validation(format!(
                "target branch {t} is not checked out (current: {current})"
            ))),
            _ => Ok(current),
        }
    }

    async fn ensure_clean_or_forced(&self, force: bool) -> Result<()> {
        let status = self.dolt.status().await?;
        if status.has_conflicts {
            return Err(BridgeError::ConflictState(
                "repository has unresolved conflicts from an earlier merge".to_string(),
            ));
        }
        if force {
            return Ok(());
        }
        if !status.changes.is_empty() {
            return Err(BridgeError::Validation(format!(
                "working tree has {} local changes; commit, reset, or pass force",
                status.changes.len()
            )));
        }
        Ok(())
    }

    fn auxiliary_status(&self, branch: &str) -> Result<AuxiliaryTableStatus> {
        let states = self.sidecar.sync_states_for_branch(branch)?;
        let collections_in_error = states
            .iter()
            .filter(|s| s.status == SyncStatus::Error)
            .map(|s| s.collection.clone())
            .collect();
        Ok(AuxiliaryTableStatus {
            collections_tracked: states.len(),
            collections_in_error,
            pending_deletions: self.sidecar.pending_deletions(branch)?.len(),
        })
    }
}

/// Turn a resolution choice into the concrete side to write, or None
/// when the choice cannot be applied (stays unresolved).
fn plan_side(
    versions: &ConflictDocVersions,
    info: &ConflictInfo,
    choice: ResolutionChoice,
) -> Option<ConflictSide> {
    let named = match choice {
        ResolutionChoice::Custom { content, metadata } => {
            let hash = crate::content::content_hash(&content);
            let doc = Document::new(&versions.collection, &versions.doc_id, content, hash)
                .with_metadata(metadata);
            return Some(ConflictSide::Document(doc));
        }
        ResolutionChoice::Named(named) => named,
    };
    match named {
        Resolution::Ours => Some(ConflictSide::Ours),
        Resolution::Theirs => Some(ConflictSide::Theirs),
        Resolution::FieldMerge => conflicts::field_merge(versions).map(ConflictSide::Document),
        Resolution::Auto => match info.suggested_resolution {
            Resolution::Manual => None,
            suggested => plan_side(versions, info, ResolutionChoice::Named(suggested)),
        },
        Resolution::Custom | Resolution::Manual | Resolution::Namespace => None,
    }
}

/// Drop full content values from a conflict report, keeping field names
/// and auto-merge flags.
fn strip_content_preview(info: &mut ConflictInfo) {
    info.base_values.remove(CONTENT_FIELD);
    info.our_values.remove(CONTENT_FIELD);
    info.their_values.remove(CONTENT_FIELD);
    for field in &mut info.field_conflicts {
        if field.field == CONTENT_FIELD {
            field.base_value = None;
            field.our_value = None;
            field.their_value = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_transitions() {
        use MergePhase::*;
        assert!(Idle.can_transition_to(Previewing));
        assert!(Previewing.can_transition_to(AwaitingResolution));
        assert!(AwaitingResolution.can_transition_to(Executing));
        assert!(Executing.can_transition_to(Reconciling));
        assert!(Reconciling.can_transition_to(Done));

        assert!(!Idle.can_transition_to(Reconciling));
        assert!(!Reconciling.can_transition_to(Executing));
        assert!(!Done.can_transition_to(Reconciling));
    }

    #[test]
    fn test_phase_as_str() {
        assert_eq!(MergePhase::AwaitingResolution.as_str(), "awaiting_resolution");
        assert_eq!(MergePhase::Idle.as_str(), "idle");
    }

    #[test]
    fn test_plan_side_named() {
        let doc = Document::new("notes", "n-1", "base", crate::content::content_hash("base"));
        let versions = ConflictDocVersions {
            collection: "notes".to_string(),
            doc_id: "n-1".to_string(),
            base: Some(doc.clone()),
            ours: Some(Document::new(
                "notes",
                "n-1",
                "ours",
                crate::content::content_hash("ours"),
            )),
            theirs: Some(doc),
        };
        let info = conflicts::analyze(&versions, "feature", "main");

        assert!(matches!(
            plan_side(&versions, &info, ResolutionChoice::Named(Resolution::Ours)),
            Some(ConflictSide::Ours)
        ));
        assert!(matches!(
            plan_side(&versions, &info, ResolutionChoice::Named(Resolution::Theirs)),
            Some(ConflictSide::Theirs)
        ));
        // Only ours changed: auto resolves to ours
        assert!(matches!(
            plan_side(&versions, &info, ResolutionChoice::Named(Resolution::Auto)),
            Some(ConflictSide::Ours)
        ));
        // A bare "custom" without payload stays unresolved
        assert!(plan_side(&versions, &info, ResolutionChoice::Named(Resolution::Custom)).is_none());
    }

    #[test]
    fn test_plan_side_custom_payload() {
        let versions = ConflictDocVersions {
            collection: "notes".to_string(),
            doc_id: "n-1".to_string(),
            base: None,
            ours: None,
            theirs: None,
        };
        let info_stub = ConflictInfo {
            conflict_id: "x".to_string(),
            collection: "notes".to_string(),
            doc_id: "n-1".to_string(),
            conflict_type: crate::conflicts::ConflictType::Modification,
            auto_resolvable: false,
            field_conflicts: vec![],
            base_values: BTreeMap::new(),
            our_values: BTreeMap::new(),
            their_values: BTreeMap::new(),
            suggested_resolution: Resolution::Manual,
            resolution_options: vec![],
        };
        let side = plan_side(
            &versions,
            &info_stub,
            ResolutionChoice::Custom {
                content: "merged by hand".to_string(),
                metadata: BTreeMap::new(),
            },
        );
        match side {
            Some(ConflictSide::Document(doc)) => {
                assert_eq!(doc.content, "merged by hand");
                assert_eq!(
                    doc.content_hash,
                    crate::content::content_hash("merged by hand")
                );
            }
            other => panic!("expected custom document side, got {other:?}"),
        }
    }

    #[test]
    fn test_strip_content_preview() {
        let base = Document::new("notes", "n-1", "base", crate::content::content_hash("base"));
        let ours = Document::new("notes", "n-1", "ours", crate::content::content_hash("ours"));
        let theirs = Document::new(
            "notes",
            "n-1",
            "theirs",
            crate::content::content_hash("theirs"),
        );
        let versions = ConflictDocVersions {
            collection: "notes".to_string(),
            doc_id: "n-1".to_string(),
            base: Some(base),
            ours: Some(ours),
            theirs: Some(theirs),
        };
        let mut info = conflicts::analyze(&versions, "feature", "main");
        assert!(info.our_values.contains_key(CONTENT_FIELD));

        strip_content_preview(&mut info);
        assert!(!info.our_values.contains_key(CONTENT_FIELD));
        assert!(!info.their_values.contains_key(CONTENT_FIELD));
        // The conflict itself is still reported
        assert_eq!(info.field_conflicts.len(), 1);
        assert!(info.field_conflicts[0].our_value.is_none());
    }
}
