//! Manifest persistence
//!
//! The manifest is a single JSON object at `<project_root>/<name>.json`
//! pointing at `{remote, branch, commit}`. Writes go through a temp file
//! and rename so a crashed write never leaves a torn manifest.

use crate::domain::Manifest;
use crate::error::{Result, StorageError};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_MANIFEST_NAME: &str = "lockstep.manifest.json";

/// Reads and writes the project manifest.
pub struct ManifestStore {
    path: PathBuf,
}

impl ManifestStore {
    pub fn new(project_root: impl AsRef<Path>, manifest_name: &str) -> Self {
        Self {
            path: project_root.as_ref().join(manifest_name),
        }
    }

    pub fn at_default(project_root: impl AsRef<Path>) -> Self {
        Self::new(project_root, DEFAULT_MANIFEST_NAME)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    pub fn load(&self) -> Result<Manifest> {
        if !self.exists() {
            return Err(StorageError::manifest_not_found(self.path.display().to_string()));
        }
        let raw = fs::read_to_string(&self.path)?;
        let manifest: Manifest = serde_json::from_str(&raw)?;
        Ok(manifest)
    }

    pub fn save(&self, manifest: &Manifest) -> Result<()> {
        let raw = serde_json::to_string_pretty(manifest)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, raw)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Advance the durable pointer after a successful mutation.
    pub fn update_pointer(&self, branch: &str, commit: &str) -> Result<Manifest> {
        let mut manifest = self.load()?;
        manifest.current_branch = branch.to_string();
        manifest.current_commit = Some(commit.to_string());
        self.save(&manifest)?;
        Ok(manifest)
    }
}
