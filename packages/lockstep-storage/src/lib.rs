//! lockstep-storage - durable sidecar state for the sync bridge
//!
//! The bridge keeps a versioned SQL store and an embedding store in
//! lock-step; this crate owns everything that has to survive a process
//! restart while doing so:
//!
//! - domain models (`Document`, `SyncState`, `DeletionRecord`, `Manifest`)
//! - the SQLite sidecar (`sync_state`, `deletion_tracker`,
//!   `document_sync_log`, `sync_operations`)
//! - the project manifest JSON at the project root
//!
//! Nothing in here talks to the versioned store or the embedding store;
//! the engines in `lockstep-bridge` drive these records.

pub mod domain;
pub mod error;
pub mod manifest;
pub mod sidecar;

pub use domain::{
    DeletionRecord, Document, DocumentAction, Manifest, OperationOutcome, SyncState, SyncStatus,
    DELETION_RETENTION_DAYS, MANIFEST_SCHEMA_VERSION,
};
pub use error::{ErrorKind, Result, StorageError};
pub use manifest::{ManifestStore, DEFAULT_MANIFEST_NAME};
pub use sidecar::SidecarDb;
