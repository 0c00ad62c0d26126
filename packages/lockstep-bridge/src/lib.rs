/*
 * Lockstep Bridge
 *
 * Keeps a versioned SQL store (Dolt) and an embedding store in
 * lock-step. Documents live in versioned tables as the source of truth;
 * derived chunks live in embedding collections.
 *
 * Architecture:
 * - Drivers (Dolt CLI, embedding store) behind trait seams
 * - Sync engine (full / incremental / post-reset reconciliation)
 * - Merge state machine (preview -> resolve -> execute -> reconcile)
 * - Import planner/executor (cross-collection collision handling)
 * - Tool operations over an explicitly threaded context
 */

pub mod config;
pub mod conflicts;
pub mod content;
pub mod delta;
pub mod dolt;
pub mod edb;
pub mod error;
pub mod import;
pub mod merge;
pub mod sync;
pub mod tools;

pub use config::BridgeConfig;
pub use conflicts::{
    cross_collection_conflict_id, merge_conflict_id, ConflictInfo, ConflictType, FieldConflict,
    Resolution,
};
pub use content::{canonicalize, chunk_id, content_hash, ChunkPiece, Chunker};
pub use delta::Delta;
pub use dolt::{
    ChangeKind, CliOutcome, CommitInfo, ConflictDocVersions, ConflictSide, DiffEntry, DoltCli,
    DoltRepo, DryRunReport, MergeBegin, WorkingStatus,
};
pub use edb::{
    collection_snapshot, CollectionSnapshot, CountCache, EdbEntry, EmbedStore, MemoryEmbedStore,
};
pub use error::{BridgeError, ErrorCode, Result};
pub use import::{ImportCounts, ImportMapping, ImportPreview, ImportResult, ImportStrategy, Importer};
pub use merge::{
    AuxiliaryTableStatus, MergeEngine, MergePhase, MergePreview, MergeResult, ResolutionChoice,
};
pub use sync::{CollectionSyncReport, SyncEngine, SyncReport};
pub use tools::{
    error_payload, parse_conflict_resolutions, BootstrapOptions, BootstrapResult, BranchLocks,
    BridgeContext, LocalChanges, ManifestProbe, PathFixStrategy, RepoState,
    RepositoryStatusReport, ResetOutcome, StoreProbe,
};
