/// Integration tests for the tool surface: status classification,
/// bootstrap, and the confirm-then-reset flow.
mod support;

use lockstep_bridge::{
    BootstrapOptions, DoltRepo, EmbedStore, ErrorCode, RepoState, ResetOutcome,
};
use lockstep_storage::{Manifest, SyncStatus};
use std::sync::Arc;
use support::{bridge_with, FakeDolt};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_status_of_empty_project() {
    let b = bridge_with(Arc::new(FakeDolt::new()));

    let status = b.ctx.repository_status().await.unwrap();
    assert_eq!(status.state, RepoState::Uninitialized);
    assert_eq!(status.recommended_action, "DoltClone or DoltInit");
    assert!(!status.is_ready);
    assert!(!status.manifest.exists);
    assert!(!status.vdb.exists);
    assert!(!status.edb.exists);
    assert!(status.path_issue.is_none());
    assert!(status.error.is_none());
}

#[tokio::test]
async fn test_status_of_ready_project() {
    let b = bridge_with(FakeDolt::initialized());
    std::fs::create_dir_all(&b.ctx.config.edb_data_path).unwrap();
    b.ctx
        .manifest
        .save(&Manifest::new("https://dolt.example/repo", "main"))
        .unwrap();

    let status = b.ctx.repository_status().await.unwrap();
    assert_eq!(status.state, RepoState::Ready);
    assert!(status.is_ready);
    assert_eq!(status.recommended_action, "None");
    assert!(status.manifest.manifest.is_some());
}

#[tokio::test]
async fn test_status_manifest_only_variants() {
    // Manifest alone
    let b = bridge_with(Arc::new(FakeDolt::new()));
    b.ctx
        .manifest
        .save(&Manifest::new("https://dolt.example/repo", "main"))
        .unwrap();
    let status = b.ctx.repository_status().await.unwrap();
    assert_eq!(status.state, RepoState::ManifestOnlyNeedsFullBootstrap);

    // Manifest plus versioned store, embedding store missing
    let b = bridge_with(FakeDolt::initialized());
    b.ctx
        .manifest
        .save(&Manifest::new("https://dolt.example/repo", "main"))
        .unwrap();
    let status = b.ctx.repository_status().await.unwrap();
    assert_eq!(status.state, RepoState::ManifestOnlyNeedsEdbBootstrap);

    // Stores without a manifest
    let b = bridge_with(FakeDolt::initialized());
    let status = b.ctx.repository_status().await.unwrap();
    assert_eq!(status.state, RepoState::InfrastructureOnlyNeedsManifest);
}

#[tokio::test]
async fn test_status_detects_nested_store() {
    let b = bridge_with(Arc::new(FakeDolt::new()));
    let nested = b.ctx.config.repo_path.join("inner").join(".dolt");
    std::fs::create_dir_all(&nested).unwrap();

    let status = b.ctx.repository_status().await.unwrap();
    assert_eq!(status.state, RepoState::PathMisalignedVdbNested);
    assert!(status.path_issue.unwrap().contains("inner"));
}

#[tokio::test]
async fn test_bootstrap_from_scratch() {
    let b = bridge_with(Arc::new(FakeDolt::new()));
    let cancel = CancellationToken::new();

    let options = BootstrapOptions {
        bootstrap_vdb: true,
        bootstrap_edb: true,
        ..BootstrapOptions::default()
    };
    let result = b.ctx.bootstrap(&options, &cancel).await.unwrap();

    assert!(b.dolt.is_initialized().await);
    assert!(b.ctx.config.edb_data_path.is_dir());
    assert!(b.ctx.manifest.exists());
    assert_eq!(result.state, RepoState::Ready);
    assert!(result.sync.is_some());
    assert!(result.actions.iter().any(|a| a.contains("manifest")));
}

#[tokio::test]
async fn test_bootstrap_creates_work_branch() {
    let b = bridge_with(FakeDolt::initialized());
    let cancel = CancellationToken::new();

    let options = BootstrapOptions {
        bootstrap_edb: true,
        create_work_branch: true,
        work_branch_name: Some("agent-work".to_string()),
        ..BootstrapOptions::default()
    };
    let result = b.ctx.bootstrap(&options, &cancel).await.unwrap();
    assert_eq!(result.work_branch.as_deref(), Some("agent-work"));
    assert_eq!(b.dolt.current_branch().await.unwrap(), "agent-work");
}

async fn seeded_for_reset() -> support::TestBridge {
    let dolt = FakeDolt::initialized();
    dolt.stage_doc("notes", "n-1", "one");
    dolt.stage_doc("notes", "n-2", "two");
    dolt.stage_doc("notes", "n-3", "three");
    dolt.commit("seed").await.unwrap();

    let b = bridge_with(dolt);
    b.ctx
        .manifest
        .save(&Manifest::new("https://dolt.example/repo", "main"))
        .unwrap();
    b.ctx
        .sync
        .full_sync(false, &CancellationToken::new())
        .await
        .unwrap();

    // 3 added + 2 modified + 1 deleted local documents
    b.dolt.stage_doc("notes", "n-a1", "new a1");
    b.dolt.stage_doc("notes", "n-a2", "new a2");
    b.dolt.stage_doc("notes", "n-a3", "new a3");
    b.dolt.stage_doc("notes", "n-1", "one, edited");
    b.dolt.stage_doc("notes", "n-2", "two, edited");
    b.dolt.stage_delete("notes", "n-3");
    b
}

#[tokio::test]
async fn test_reset_refuses_without_confirmation() {
    let b = seeded_for_reset().await;
    let cancel = CancellationToken::new();

    let outcome = b.ctx.reset("HEAD", false, &cancel).await.unwrap();
    match outcome {
        ResetOutcome::ConfirmationRequired {
            error,
            local_changes,
            ..
        } => {
            assert_eq!(error, "CONFIRMATION_REQUIRED");
            assert_eq!(local_changes.total, 6);
            assert_eq!(local_changes.added, 3);
            assert_eq!(local_changes.modified, 2);
            assert_eq!(local_changes.deleted, 1);
        }
        other => panic!("expected confirmation refusal, got {other:?}"),
    }

    // No state mutation: local changes are still there
    assert_eq!(b.dolt.local_changes().await.unwrap().len(), 6);
}

#[tokio::test]
async fn test_reset_with_confirmation_discards_and_resyncs() {
    let b = seeded_for_reset().await;
    b.sidecar.record_deletion("main", "notes", "n-3").unwrap();
    let cancel = CancellationToken::new();
    let head = b.dolt.head_commit().await.unwrap();

    let outcome = b.ctx.reset("HEAD", true, &cancel).await.unwrap();
    match outcome {
        ResetOutcome::Complete {
            new_head,
            discarded_changes,
            sync,
            ..
        } => {
            assert_eq!(new_head, head);
            assert_eq!(discarded_changes, 6);
            assert!(!sync.has_errors());
        }
        other => panic!("expected completion, got {other:?}"),
    }

    assert!(b.dolt.local_changes().await.unwrap().is_empty());

    let state = b.sidecar.get_sync_state("main", "notes").unwrap().unwrap();
    assert_eq!(state.status, SyncStatus::Synced);
    assert_eq!(state.last_sync_commit.as_deref(), Some(head.as_str()));

    // Deletion tracker for the branch is empty after the reconcile
    assert!(b.sidecar.pending_deletions("main").unwrap().is_empty());

    let manifest = b.ctx.manifest.load().unwrap();
    assert_eq!(manifest.current_commit.as_deref(), Some(head.as_str()));
}

#[tokio::test]
async fn test_reset_to_remote_branch_resolves_via_fetch() {
    let b = seeded_for_reset().await;
    let cancel = CancellationToken::new();
    let remote_head =
        b.dolt
            .set_remote_branch("main", &[("notes", "n-9", "remote truth")]);

    let outcome = b.ctx.reset("origin/main", true, &cancel).await.unwrap();
    match outcome {
        ResetOutcome::Complete { new_head, .. } => assert_eq!(new_head, remote_head),
        other => panic!("expected completion, got {other:?}"),
    }

    // The embedding store now mirrors the remote snapshot
    let got = b.edb.get_by_ids("notes", &["n-9".to_string()]).await.unwrap();
    assert_eq!(got.len(), 1);
    assert!(b
        .edb
        .get_by_ids("notes", &["n-1".to_string()])
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_reset_to_unknown_commit_fails_typed() {
    let b = bridge_with(FakeDolt::initialized());
    let cancel = CancellationToken::new();

    let err = b.ctx.reset("deadbeef", true, &cancel).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::CommitNotFound);
}
