//! Versioned-store driver
//!
//! Wraps the Dolt CLI. Queries go through `dolt sql -r json` over the
//! system tables (`dolt_log`, `dolt_status`, `dolt_diff_<table>`,
//! `dolt_conflicts_<table>`) so every read parses as JSON rather than
//! whitespace-split text; mutations use the porcelain commands. Each
//! invocation is bounded by the configured deadline and killed on expiry.
//!
//! `DoltRepo` is the seam the engines are written against; `DoltCli` is
//! the production implementation.

use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use async_trait::async_trait;
use lockstep_storage::Document;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Raw outcome of one CLI invocation.
#[derive(Debug, Clone)]
pub struct CliOutcome {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// One document-level change between two commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

impl ChangeKind {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "added" => Ok(ChangeKind::Added),
            "modified" => Ok(ChangeKind::Modified),
            "removed" => Ok(ChangeKind::Removed),
            _ => Err(BridgeError::UnexpectedOutput(format!(
                "unknown diff type: {s}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffEntry {
    pub collection: String,
    pub doc_id: String,
    pub change: ChangeKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub hash: String,
    pub message: String,
    pub committed_at: String,
}

/// Three-way snapshots of one conflicted document.
#[derive(Debug, Clone)]
pub struct ConflictDocVersions {
    pub collection: String,
    pub doc_id: String,
    pub base: Option<Document>,
    pub ours: Option<Document>,
    pub theirs: Option<Document>,
}

/// Result of a merge dry run: preview counts plus conflicted documents.
#[derive(Debug, Clone, Default)]
pub struct DryRunReport {
    pub added: usize,
    pub modified: usize,
    pub deleted: usize,
    pub conflicts: Vec<ConflictDocVersions>,
}

/// State right after `begin_merge`.
#[derive(Debug, Clone)]
pub struct MergeBegin {
    pub already_up_to_date: bool,
    pub conflicts: Vec<ConflictDocVersions>,
}

/// Which side wins when resolving one conflicted document.
#[derive(Debug, Clone)]
pub enum ConflictSide {
    Ours,
    Theirs,
    /// Write this exact document (field merge / custom payload).
    Document(Document),
}

/// Working-set summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkingStatus {
    pub branch: String,
    pub changes: Vec<DiffEntry>,
    pub has_conflicts: bool,
}

impl WorkingStatus {
    pub fn is_clean(&self) -> bool {
        self.changes.is_empty() && !self.has_conflicts
    }
}

/// Driver seam over the versioned store.
#[async_trait]
pub trait DoltRepo: Send + Sync {
    async fn is_initialized(&self) -> bool;

    /// Branch, working-set changes and conflict flag in one report.
    async fn status(&self) -> Result<WorkingStatus> {
        Ok(WorkingStatus {
            branch: self.current_branch().await?,
            changes: self.local_changes().await?,
            has_conflicts: self.has_conflicts().await?,
        })
    }

    async fn current_branch(&self) -> Result<String>;
    async fn head_commit(&self) -> Result<String>;
    async fn log(&self, limit: usize) -> Result<Vec<CommitInfo>>;
    /// Resolve a reference (commit hash, `HEAD`, `origin/<branch>`) to a
    /// commit hash, if it exists.
    async fn resolve_ref(&self, reference: &str) -> Result<Option<String>>;
    async fn list_collections(&self) -> Result<Vec<String>>;
    async fn docs_at(&self, collection: &str, reference: &str) -> Result<Vec<Document>>;
    async fn diff(&self, from: &str, to: &str) -> Result<Vec<DiffEntry>>;
    /// Working-set changes relative to HEAD.
    async fn local_changes(&self) -> Result<Vec<DiffEntry>>;
    async fn has_conflicts(&self) -> Result<bool>;

    async fn commit(&self, message: &str) -> Result<String>;
    async fn reset_hard(&self, target: &str) -> Result<()>;
    async fn fetch(&self, remote: &str) -> Result<()>;
    async fn checkout_branch(&self, name: &str, create: bool) -> Result<()>;
    async fn init(&self) -> Result<()>;
    async fn clone_from(&self, remote: &str) -> Result<()>;

    /// Run the merge without committing, collect counts and conflict
    /// snapshots, then restore the working state. No observable side
    /// effects on the repository.
    async fn merge_dry_run(&self, source: &str) -> Result<DryRunReport>;
    /// Start a real merge, leaving conflicts in place for resolution.
    async fn begin_merge(&self, source: &str) -> Result<MergeBegin>;
    async fn resolve_conflict(
        &self,
        collection: &str,
        doc_id: &str,
        side: &ConflictSide,
    ) -> Result<()>;
    async fn commit_merge(&self, message: &str) -> Result<String>;
    async fn abort_merge(&self) -> Result<()>;
}

/// CLI-backed driver.
pub struct DoltCli {
    executable: String,
    repo_path: PathBuf,
    timeout: Duration,
}

impl DoltCli {
    pub fn new(config: &BridgeConfig) -> Self {
        Self {
            executable: config.executable.clone(),
            repo_path: config.repo_path.clone(),
            timeout: config.cli_timeout,
        }
    }

    /// Run one CLI invocation under the configured deadline.
    async fn run(&self, args: &[&str]) -> Result<CliOutcome> {
        let rendered = format!("{} {}", self.executable, args.join(" "));
        debug!(command = %rendered, "running versioned-store CLI");

        let mut child = Command::new(&self.executable)
            .args(args)
            .current_dir(&self.repo_path)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    BridgeError::ExecutableNotFound(self.executable.clone())
                }
                _ => BridgeError::Io(e),
            })?;

        let waited = tokio::time::timeout(self.timeout, child.wait_with_output()).await;
        let output = match waited {
            Ok(output) => output?,
            Err(_) => {
                return Err(BridgeError::Timeout {
                    command: rendered,
                    timeout_secs: self.timeout.as_secs(),
                });
            }
        };

        Ok(CliOutcome {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    /// Run and classify a non-zero exit into a typed error.
    async fn run_checked(&self, args: &[&str]) -> Result<CliOutcome> {
        let outcome = self.run(args).await?;
        if outcome.success {
            return Ok(outcome);
        }
        Err(classify_failure(
            &format!("{} {}", self.executable, args.join(" ")),
            &outcome.stderr,
        ))
    }

    async fn sql_rows(&self, query: &str) -> Result<Vec<serde_json::Map<String, serde_json::Value>>> {
        let outcome = self.run_checked(&["sql", "-r", "json", "-q", query]).await?;
        parse_sql_rows(&outcome.stdout)
    }
}

#[async_trait]
impl DoltRepo for DoltCli {
    async fn is_initialized(&self) -> bool {
        self.repo_path.join(".dolt").is_dir()
    }

    async fn current_branch(&self) -> Result<String> {
        let rows = self.sql_rows("SELECT active_branch() AS branch").await?;
        rows.first()
            .and_then(|row| row.get("branch"))
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| BridgeError::UnexpectedOutput("active_branch() returned no rows".into()))
    }

    async fn head_commit(&self) -> Result<String> {
        let mut log = self.log(1).await?;
        log.pop()
            .map(|c| c.hash)
            .ok_or_else(|| BridgeError::UnexpectedOutput("empty commit log".into()))
    }

    async fn log(&self, limit: usize) -> Result<Vec<CommitInfo>> {
        let rows = self
            .sql_rows(&format!(
                "SELECT commit_hash, message, date FROM dolt_log LIMIT {limit}"
            ))
            .await?;
        rows.iter().map(parse_commit_row).collect()
    }

    async fn resolve_ref(&self, reference: &str) -> Result<Option<String>> {
        let outcome = self
            .run(&["log", "-n", "1", "--oneline", reference])
            .await?;
        if !outcome.success {
            return Ok(None);
        }
        Ok(parse_oneline_hash(&outcome.stdout))
    }

    async fn list_collections(&self) -> Result<Vec<String>> {
        let outcome = self.run_checked(&["table", "ls"]).await?;
        parse_table_list(&outcome.stdout)
    }

    async fn docs_at(&self, collection: &str, reference: &str) -> Result<Vec<Document>> {
        let rows = self
            .sql_rows(&format!(
                "SELECT doc_id, content, metadata FROM `{collection}` AS OF '{reference}' ORDER BY doc_id"
            ))
            .await?;
        rows.iter()
            .map(|row| parse_document_row(collection, row))
            .collect()
    }

    async fn diff(&self, from: &str, to: &str) -> Result<Vec<DiffEntry>> {
        let mut entries = Vec::new();
        for collection in self.list_collections().await? {
            let rows = self
                .sql_rows(&format!(
                    "SELECT COALESCE(to_doc_id, from_doc_id) AS doc_id, diff_type \
                     FROM dolt_diff('{from}', '{to}', '{collection}') ORDER BY doc_id"
                ))
                .await?;
            for row in &rows {
                entries.push(parse_diff_row(&collection, row)?);
            }
        }
        Ok(entries)
    }

    async fn local_changes(&self) -> Result<Vec<DiffEntry>> {
        self.diff("HEAD", "WORKING").await
    }

    async fn has_conflicts(&self) -> Result<bool> {
        let rows = self
            .sql_rows("SELECT SUM(num_conflicts) AS total FROM dolt_conflicts")
            .await?;
        let total = rows
            .first()
            .and_then(|row| row.get("total"))
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        Ok(total > 0)
    }

    async fn commit(&self, message: &str) -> Result<String> {
        self.run_checked(&["add", "-A"]).await?;
        self.run_checked(&["commit", "-m", message]).await?;
        self.head_commit().await
    }

    async fn reset_hard(&self, target: &str) -> Result<()> {
        self.run_checked(&["reset", "--hard", target]).await?;
        Ok(())
    }

    async fn fetch(&self, remote: &str) -> Result<()> {
        self.run_checked(&["fetch", remote]).await?;
        Ok(())
    }

    async fn checkout_branch(&self, name: &str, create: bool) -> Result<()> {
        if create {
            self.run_checked(&["checkout", "-b", name]).await?;
        } else {
            self.run_checked(&["checkout", name]).await?;
        }
        Ok(())
    }

    async fn init(&self) -> Result<()> {
        self.run_checked(&["init"]).await?;
        Ok(())
    }

    async fn clone_from(&self, remote: &str) -> Result<()> {
        self.run_checked(&["clone", remote, "."]).await?;
        Ok(())
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

        // Dry run: always restore the pre-merge working state.
        self.abort_merge().await?;
        self.reset_hard(&head).await?;
        Ok(report)
    }

    async fn begin_merge(&self, source: &str) -> Result<MergeBegin> {
        let outcome = self.run(&["merge", "--no-commit", source]).await?;
        if !outcome.success && !outcome.stderr.to_lowercase().contains("conflict") {
            return Err(classify_failure("merge", &outcome.stderr));
        }
        if outcome.stdout.contains("Everything up-to-date") {
            return Ok(MergeBegin {
                already_up_to_date: true,
                conflicts: Vec::new(),
            });
        }

        let mut conflicts = Vec::new();
        let tables = self
            .sql_rows("SELECT `table` AS table_name FROM dolt_conflicts")
            .await?;
        for row in &tables {
            let collection = row
                .get("table_name")
                .and_then(|v| v.as_str())
                .ok_or_else(|| {
                    BridgeError::UnexpectedOutput("dolt_conflicts row without table".into())
                })?
                .to_string();
            let rows = self
                .sql_rows(&format!(
                    "SELECT base_doc_id, base_content, base_metadata, \
                            our_doc_id, our_content, our_metadata, \
                            their_doc_id, their_content, their_metadata \
                     FROM `dolt_conflicts_{collection}` ORDER BY COALESCE(our_doc_id, their_doc_id, base_doc_id)"
                ))
                .await?;
            for conflict_row in &rows {
                conflicts.push(parse_conflict_row(&collection, conflict_row)?);
            }
        }
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
        match side {
            ConflictSide::Ours => {
                // Working side already holds ours; just clear the marker.
            }
            ConflictSide::Theirs => {
                self.sql_rows(&format!(
                    "REPLACE INTO `{collection}` (doc_id, content, metadata) \
                     SELECT their_doc_id, their_content, their_metadata \
                     FROM `dolt_conflicts_{collection}` WHERE their_doc_id = '{doc_id}'"
                ))
                .await?;
            }
            ConflictSide::Document(doc) => {
                let metadata = serde_json::to_string(&doc.metadata)?;
                self.sql_rows(&format!(
                    "REPLACE INTO `{collection}` (doc_id, content, metadata) VALUES \
                     ('{}', '{}', '{}')",
                    doc.doc_id,
                    sql_escape(&doc.content),
                    sql_escape(&metadata)
                ))
                .await?;
            }
        }
        self.sql_rows(&format!(
            "DELETE FROM `dolt_conflicts_{collection}` \
             WHERE COALESCE(our_doc_id, their_doc_id, base_doc_id) = '{doc_id}'"
        ))
        .await?;
        Ok(())
    }

    async fn commit_merge(&self, message: &str) -> Result<String> {
        let outcome = self.run(&["commit", "-A", "-m", message]).await?;
        if !outcome.success {
            return Err(BridgeError::MergeCommitFailed(outcome.stderr));
        }
        self.head_commit().await
    }

    async fn abort_merge(&self) -> Result<()> {
        // Nothing to abort is fine; the caller is converging on clean state.
        let _ = self.run(&["merge", "--abort"]).await?;
        Ok(())
    }
}

// ----------------------------------------------------------------------
// Parsing (strict; record-separated formats only)
// ----------------------------------------------------------------------

/// Classify a non-zero CLI exit by its stderr.
pub fn classify_failure(command: &str, stderr: &str) -> BridgeError {
    let lowered = stderr.to_lowercase();
    if lowered.contains("not a valid dolt repository")
        || lowered.contains("no dolt database")
        || lowered.contains("run `dolt init`")
    {
        BridgeError::NotInitialized(stderr.trim().to_string())
    } else if lowered.contains("database is locked") || lowered.contains("already in use") {
        BridgeError::Busy(stderr.trim().to_string())
    } else if lowered.contains("unresolved conflicts") || lowered.contains("merge active") {
        BridgeError::ConflictState(stderr.trim().to_string())
    } else if lowered.contains("could not resolve")
        || lowered.contains("connection refused")
        || lowered.contains("remote not found")
    {
        BridgeError::RemoteUnreachable(stderr.trim().to_string())
    } else {
        BridgeError::CommandFailed {
            command: command.to_string(),
            stderr: stderr.trim().to_string(),
        }
    }
}

/// Parse `dolt sql -r json` output: `{"rows": [ {...}, ... ]}`.
pub fn parse_sql_rows(stdout: &str) -> Result<Vec<serde_json::Map<String, serde_json::Value>>> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let value: serde_json::Value = serde_json::from_str(trimmed)
        .map_err(|e| BridgeError::UnexpectedOutput(format!("SQL output is not JSON: {e}")))?;
    let rows = value
        .get("rows")
        .and_then(|r| r.as_array())
        .ok_or_else(|| BridgeError::UnexpectedOutput("SQL output has no rows array".into()))?;
    rows.iter()
        .map(|row| {
            row.as_object().cloned().ok_or_else(|| {
                BridgeError::UnexpectedOutput("SQL row is not an object".to_string())
            })
        })
        .collect()
}

fn parse_commit_row(row: &serde_json::Map<String, serde_json::Value>) -> Result<CommitInfo> {
    let field = |name: &str| -> Result<String> {
        row.get(name)
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| BridgeError::UnexpectedOutput(format!("log row missing {name}")))
    };
    Ok(CommitInfo {
        hash: field("commit_hash")?,
        message: field("message")?,
        committed_at: field("date")?,
    })
}

fn parse_diff_row(
    collection: &str,
    row: &serde_json::Map<String, serde_json::Value>,
) -> Result<DiffEntry> {
    let doc_id = row
        .get("doc_id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| BridgeError::UnexpectedOutput("diff row missing doc_id".into()))?;
    let diff_type = row
        .get("diff_type")
        .and_then(|v| v.as_str())
        .ok_or_else(|| BridgeError::UnexpectedOutput("diff row missing diff_type".into()))?;
    Ok(DiffEntry {
        collection: collection.to_string(),
        doc_id: doc_id.to_string(),
        change: ChangeKind::parse(diff_type)?,
    })
}

/// Parse a document row; `metadata` may arrive as a JSON object or as a
/// JSON-encoded string column.
pub fn parse_document_row(
    collection: &str,
    row: &serde_json::Map<String, serde_json::Value>,
) -> Result<Document> {
    let doc_id = row
        .get("doc_id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| BridgeError::UnexpectedOutput("document row missing doc_id".into()))?;
    let content = row
        .get("content")
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    let metadata = match row.get("metadata") {
        Some(serde_json::Value::Object(map)) => map
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect::<BTreeMap<_, _>>(),
        Some(serde_json::Value::String(raw)) if !raw.is_empty() => serde_json::from_str(raw)
            .map_err(|e| {
                BridgeError::UnexpectedOutput(format!("document metadata is not JSON: {e}"))
            })?,
        _ => BTreeMap::new(),
    };
    let hash = crate::content::content_hash(content);
    Ok(Document::new(collection, doc_id, content, hash).with_metadata(metadata))
}

fn parse_versioned_doc(
    collection: &str,
    row: &serde_json::Map<String, serde_json::Value>,
    prefix: &str,
) -> Result<Option<Document>> {
    let doc_id = match row
        .get(&format!("{prefix}_doc_id"))
        .and_then(|v| v.as_str())
    {
        Some(id) => id,
        None => return Ok(None),
    };
    let mut projected = serde_json::Map::new();
    projected.insert("doc_id".to_string(), serde_json::json!(doc_id));
    if let Some(content) = row.get(&format!("{prefix}_content")) {
        projected.insert("content".to_string(), content.clone());
    }
    if let Some(metadata) = row.get(&format!("{prefix}_metadata")) {
        projected.insert("metadata".to_string(), metadata.clone());
    }
    parse_document_row(collection, &projected).map(Some)
}

fn parse_conflict_row(
    collection: &str,
    row: &serde_json::Map<String, serde_json::Value>,
) -> Result<ConflictDocVersions> {
    let base = parse_versioned_doc(collection, row, "base")?;
    let ours = parse_versioned_doc(collection, row, "our")?;
    let theirs = parse_versioned_doc(collection, row, "their")?;
    let doc_id = ours
        .as_ref()
        .or(theirs.as_ref())
        .or(base.as_ref())
        .map(|d| d.doc_id.clone())
        .ok_or_else(|| BridgeError::UnexpectedOutput("conflict row with no versions".into()))?;
    Ok(ConflictDocVersions {
        collection: collection.to_string(),
        doc_id,
        base,
        ours,
        theirs,
    })
}

/// First token of `log --oneline` output.
fn parse_oneline_hash(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().next())
        .map(str::to_string)
}

/// Parse `table ls` output. Newer CLIs print one name per line; older
/// ones print a human listing with a header and box-drawing borders.
/// Both are accepted; anything else is an error.
pub fn parse_table_list(stdout: &str) -> Result<Vec<String>> {
    let mut tables = Vec::new();
    for line in stdout.lines() {
        let line = line.trim();
        if line.is_empty() || line == "Tables in working set:" {
            continue;
        }
        if line.starts_with('+') || line.chars().all(|c| matches!(c, '+' | '-' | '|' | ' ')) {
            continue;
        }
        let name = if line.starts_with('|') {
            line.trim_matches('|').trim()
        } else {
            line
        };
        if name.eq_ignore_ascii_case("tables") {
            continue;
        }
        if name.contains(char::is_whitespace) {
            return Err(BridgeError::UnexpectedOutput(format!(
                "unparseable table listing line: {line}"
            )));
        }
        tables.push(name.to_string());
    }
    tables.retain(|t| !t.starts_with("dolt_"));
    tables.sort();
    Ok(tables)
}

fn sql_escape(raw: &str) -> String {
    raw.replace('\'', "''")
}
