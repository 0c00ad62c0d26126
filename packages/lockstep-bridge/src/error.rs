use lockstep_storage::StorageError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BridgeError>;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Invalid parameters: {0}")]
    Validation(String),

    #[error("Versioned-store executable not found: {0}")]
    ExecutableNotFound(String),

    #[error("Repository not initialized: {0}")]
    NotInitialized(String),

    #[error("Repository busy: {0}")]
    Busy(String),

    #[error("Repository is in a conflicted state: {0}")]
    ConflictState(String),

    #[error("Branches diverged since preview: {0}")]
    DriftedSincePreview(String),

    #[error("Unexpected CLI output: {0}")]
    UnexpectedOutput(String),

    #[error("Invalid resolution JSON: {0}")]
    InvalidResolutionJson(String),

    #[error("{unresolved} of {total} conflicts unresolved")]
    UnresolvedConflicts { total: usize, unresolved: usize },

    #[error("Merge commit failed: {0}")]
    MergeCommitFailed(String),

    #[error("Commit not found: {0}")]
    CommitNotFound(String),

    #[error("Remote unreachable: {0}")]
    RemoteUnreachable(String),

    #[error("Timed out after {timeout_secs}s: {command}")]
    Timeout { command: String, timeout_secs: u64 },

    #[error("Command failed ({command}): {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidPhaseTransition { from: String, to: String },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BridgeError {
    pub fn validation<E: std::fmt::Display>(e: E) -> Self {
        Self::Validation(e.to_string())
    }

    pub fn unexpected_output<E: std::fmt::Display>(e: E) -> Self {
        Self::UnexpectedOutput(e.to_string())
    }

    /// The stringly-typed code surfaced at the tool boundary.
    pub fn code(&self) -> ErrorCode {
        match self {
            BridgeError::Validation(_) => ErrorCode::InvalidParameters,
            BridgeError::ExecutableNotFound(_) => ErrorCode::VdbExecutableNotFound,
            BridgeError::NotInitialized(_) => ErrorCode::NotInitialized,
            BridgeError::InvalidResolutionJson(_) => ErrorCode::InvalidResolutionJson,
            BridgeError::UnresolvedConflicts { .. } => ErrorCode::UnresolvedConflicts,
            BridgeError::MergeCommitFailed(_) => ErrorCode::MergeCommitFailed,
            BridgeError::CommitNotFound(_) => ErrorCode::CommitNotFound,
            BridgeError::DriftedSincePreview(_) => ErrorCode::DriftedSincePreview,
            _ => ErrorCode::OperationFailed,
        }
    }
}

/// Closed error taxonomy surfaced in tool results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorCode {
    VdbExecutableNotFound,
    NotInitialized,
    ConfirmationRequired,
    InvalidParameters,
    InvalidResolutionJson,
    UnresolvedConflicts,
    MergeCommitFailed,
    CommitNotFound,
    OperationFailed,
    DriftedSincePreview,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::VdbExecutableNotFound => "VDB_EXECUTABLE_NOT_FOUND",
            ErrorCode::NotInitialized => "NOT_INITIALIZED",
            ErrorCode::ConfirmationRequired => "CONFIRMATION_REQUIRED",
            ErrorCode::InvalidParameters => "INVALID_PARAMETERS",
            ErrorCode::InvalidResolutionJson => "INVALID_RESOLUTION_JSON",
            ErrorCode::UnresolvedConflicts => "UNRESOLVED_CONFLICTS",
            ErrorCode::MergeCommitFailed => "MERGE_COMMIT_FAILED",
            ErrorCode::CommitNotFound => "COMMIT_NOT_FOUND",
            ErrorCode::OperationFailed => "OPERATION_FAILED",
            ErrorCode::DriftedSincePreview => "DRIFTED_SINCE_PREVIEW",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "VDB_EXECUTABLE_NOT_FOUND" => Ok(ErrorCode::VdbExecutableNotFound),
            "NOT_INITIALIZED" => Ok(ErrorCode::NotInitialized),
            "CONFIRMATION_REQUIRED" => Ok(ErrorCode::ConfirmationRequired),
            "INVALID_PARAMETERS" => Ok(ErrorCode::InvalidParameters),
            "INVALID_RESOLUTION_JSON" => Ok(ErrorCode::InvalidResolutionJson),
            "UNRESOLVED_CONFLICTS" => Ok(ErrorCode::UnresolvedConflicts),
            "MERGE_COMMIT_FAILED" => Ok(ErrorCode::MergeCommitFailed),
            "COMMIT_NOT_FOUND" => Ok(ErrorCode::CommitNotFound),
            "OPERATION_FAILED" => Ok(ErrorCode::OperationFailed),
            "DRIFTED_SINCE_PREVIEW" => Ok(ErrorCode::DriftedSincePreview),
            _ => Err(BridgeError::validation(format!(
                "Unknown error code: {}",
                s
            ))),
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
