//! Bridge configuration
//!
//! A plain value constructed once (from the environment or defaults) and
//! injected into everything that needs it. No global statics; the
//! per-branch lock map in `tools` is the only process-wide state.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

pub const ENV_REPO_PATH: &str = "VDB_REPOSITORY_PATH";
pub const ENV_EDB_DATA_PATH: &str = "EDB_DATA_PATH";
pub const ENV_EXECUTABLE: &str = "VDB_EXECUTABLE";
pub const ENV_PROJECT_ROOT: &str = "PROJECT_ROOT";
pub const ENV_AUTO_DETECT_ROOT: &str = "AUTO_DETECT_PROJECT_ROOT";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Versioned repository working directory
    pub repo_path: PathBuf,
    /// Embedding store data directory
    pub edb_data_path: PathBuf,
    /// Versioned-store CLI executable name or path
    pub executable: String,
    /// Project root holding the manifest
    pub project_root: PathBuf,
    pub auto_detect_project_root: bool,
    /// Deadline applied to every CLI invocation
    pub cli_timeout: Duration,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub embedding_model: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            repo_path: PathBuf::from("."),
            edb_data_path: PathBuf::from("./edb-data"),
            executable: "dolt".to_string(),
            project_root: PathBuf::from("."),
            auto_detect_project_root: false,
            cli_timeout: Duration::from_secs(30),
            chunk_size: 1000,
            chunk_overlap: 200,
            embedding_model: "all-minilm-l6-v2".to_string(),
        }
    }
}

impl BridgeConfig {
    /// Build a config from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let project_root = env::var(ENV_PROJECT_ROOT)
            .map(PathBuf::from)
            .unwrap_or(defaults.project_root);
        Self {
            repo_path: env::var(ENV_REPO_PATH)
                .map(PathBuf::from)
                .unwrap_or_else(|_| project_root.clone()),
            edb_data_path: env::var(ENV_EDB_DATA_PATH)
                .map(PathBuf::from)
                .unwrap_or(defaults.edb_data_path),
            executable: env::var(ENV_EXECUTABLE).unwrap_or(defaults.executable),
            project_root,
            auto_detect_project_root: env::var(ENV_AUTO_DETECT_ROOT)
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "yes"))
                .unwrap_or(defaults.auto_detect_project_root),
            cli_timeout: defaults.cli_timeout,
            chunk_size: defaults.chunk_size,
            chunk_overlap: defaults.chunk_overlap,
            embedding_model: defaults.embedding_model,
        }
    }

    pub fn with_repo_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.repo_path = path.into();
        self
    }

    pub fn with_project_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.project_root = path.into();
        self
    }

    pub fn with_edb_data_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.edb_data_path = path.into();
        self
    }
}
