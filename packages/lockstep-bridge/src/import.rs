//! Cross-collection import planner and executor
//!
//! Consolidates documents from external embedding-store collections into
//! target collections. When several sources fan into one target, the
//! planner detects doc-id collisions up front (the target store rejects
//! duplicate-id batches, so collisions must be resolved before any write)
//! and the executor applies the chosen strategy per colliding document.

use crate::conflicts::{cross_collection_conflict_id, ConflictInfo, ConflictType, Resolution};
use crate::content::content_hash;
use crate::edb::{EdbEntry, EmbedStore, META_CONTENT_HASH, META_NAMESPACED_FROM, META_ORIGINAL_DOC_ID};
use crate::error::{BridgeError, Result};
use globset::Glob;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportMapping {
    pub source_pattern: String,
    pub target_collection: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc_patterns: Option<Vec<String>>,
}

/// Strategy applied to a colliding document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportStrategy {
    Namespace,
    KeepFirst,
    KeepLast,
    Skip,
}

impl ImportStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportStrategy::Namespace => "namespace",
            ImportStrategy::KeepFirst => "keep_first",
            ImportStrategy::KeepLast => "keep_last",
            ImportStrategy::Skip => "skip",
        }
    }

    /// Case-insensitive, with `first`/`last` accepted as aliases.
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "namespace" => Ok(ImportStrategy::Namespace),
            "keep_first" | "first" => Ok(ImportStrategy::KeepFirst),
            "keep_last" | "last" => Ok(ImportStrategy::KeepLast),
            "skip" => Ok(ImportStrategy::Skip),
            _ => Err(BridgeError::validation(format!(
                "unknown import strategy: {s}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImportCounts {
    pub sources: usize,
    pub documents: usize,
    pub targets: usize,
    pub collisions: usize,
    pub updates: usize,
    pub additions: usize,
    pub unchanged: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportPreview {
    pub can_auto_import: bool,
    pub conflicts: Vec<ConflictInfo>,
    pub counts: ImportCounts,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImportResult {
    pub added: usize,
    pub updated: usize,
    pub namespaced: usize,
    pub skipped: usize,
    pub unchanged: usize,
    pub targets: Vec<String>,
}

/// One source collection resolved against a wildcard mapping.
#[derive(Debug, Clone)]
struct ResolvedSource {
    source: String,
    target: String,
    docs: Vec<EdbEntry>,
}

/// Shared output of the planning pass.
struct ImportPlan {
    resolved: Vec<ResolvedSource>,
    /// target -> doc_id -> sources (sorted) fanning that id in
    collisions: HashMap<String, HashMap<String, Vec<String>>>,
    conflicts: Vec<ConflictInfo>,
    counts: ImportCounts,
}

/// Overlapping mappings can plan the same entry twice; keep the last.
fn dedup_by_id(entries: Vec<EdbEntry>) -> Vec<EdbEntry> {
    let mut by_id: BTreeMap<String, EdbEntry> = BTreeMap::new();
    for entry in entries {
        by_id.insert(entry.id.clone(), entry);
    }
    by_id.into_values().collect()
}

/// Stable id for a target-vs-source modification finding.
fn import_conflict_id(source: &str, target: &str, doc_id: &str) -> String {
    let digest = Sha256::digest(format!("IMPORT_{source}_{target}_{doc_id}").as_bytes());
    format!("{digest:x}")[..12].to_string()
}

fn entry_hash(entry: &EdbEntry) -> String {
    match entry.content_hash() {
        Some(hash) => hash.to_string(),
        None => content_hash(&entry.content),
    }
}

fn entry_values(entry: &EdbEntry) -> BTreeMap<String, serde_json::Value> {
    let mut values = BTreeMap::new();
    values.insert(
        crate::conflicts::CONTENT_FIELD.to_string(),
        serde_json::json!(entry.content.clone()),
    );
    for (key, value) in &entry.metadata {
        values.insert(key.clone(), value.clone());
    }
    values
}

pub struct Importer {
    external: Arc<dyn EmbedStore>,
    target_store: Arc<dyn EmbedStore>,
}

impl Importer {
    pub fn new(external: Arc<dyn EmbedStore>, target_store: Arc<dyn EmbedStore>) -> Self {
        Self {
            external,
            target_store,
        }
    }

    /// Detect collisions and modifications without writing anything.
    /// Full document content is only echoed back when asked for.
    pub async fn preview(
        &self,
        filter: &[ImportMapping],
        include_content_preview: bool,
    ) -> Result<ImportPreview> {
        let plan = self.plan(filter).await?;
        let can_auto_import = !plan
            .conflicts
            .iter()
            .any(|c| c.conflict_type == ConflictType::IdCollision);
        let mut conflicts = plan.conflicts;
        if !include_content_preview {
            for conflict in &mut conflicts {
                conflict.our_values.remove(crate::conflicts::CONTENT_FIELD);
                conflict
                    .their_values
                    .remove(crate::conflicts::CONTENT_FIELD);
            }
        }
        Ok(ImportPreview {
            can_auto_import,
            conflicts,
            counts: plan.counts,
        })
    }

    /// Run the import, applying `resolutions` (keyed by conflict id) and
    /// `default_strategy` to colliding documents.
    pub async fn execute(
        &self,
        filter: &[ImportMapping],
        resolutions: &HashMap<String, String>,
        default_strategy: Option<ImportStrategy>,
    ) -> Result<ImportResult> {
        let plan = self.plan(filter).await?;
        let mut result = ImportResult::default();

        // Per-target batches, applied after the whole pass is planned.
        let mut adds: HashMap<String, Vec<EdbEntry>> = HashMap::new();
        let mut updates: HashMap<String, Vec<EdbEntry>> = HashMap::new();

        let mut target_hashes: HashMap<String, HashMap<String, String>> = HashMap::new();
        for resolved in &plan.resolved {
            if !target_hashes.contains_key(&resolved.target) {
                let snapshot = crate::edb::collection_snapshot(
                    self.target_store.as_ref(),
                    &resolved.target,
                )
                .await?;
                target_hashes.insert(resolved.target.clone(), snapshot.doc_hashes);
            }
        }

        for resolved in &plan.resolved {
            let existing = target_hashes
                .get(&resolved.target)
                .cloned()
                .unwrap_or_default();
            for doc in &resolved.docs {
                let collision_sources = plan
                    .collisions
                    .get(&resolved.target)
                    .and_then(|by_doc| by_doc.get(&doc.id));

                if let Some(sources) = collision_sources {
                    let strategy = self.strategy_for(
                        &plan,
                        &resolved.target,
                        &doc.id,
                        resolutions,
                        default_strategy,
                    )?;
                    match strategy {
                        ImportStrategy::Namespace => {
                            let namespaced_id = format!("{}__{}", resolved.source, doc.id);
                            let entry = EdbEntry::new(namespaced_id.clone(), doc.content.clone())
                                .with_meta(META_CONTENT_HASH, entry_hash(doc))
                                .with_meta(META_ORIGINAL_DOC_ID, doc.id.clone())
                                .with_meta(META_NAMESPACED_FROM, resolved.source.clone());
                            let mut entry = entry;
                            for (key, value) in &doc.metadata {
                                entry
                                    .metadata
                                    .entry(key.clone())
                                    .or_insert_with(|| value.clone());
                            }
                            if existing.contains_key(&namespaced_id) {
                                updates.entry(resolved.target.clone()).or_default().push(entry);
                                result.updated += 1;
                            } else {
                                adds.entry(resolved.target.clone()).or_default().push(entry);
                            }
                            result.namespaced += 1;
                        }
                        ImportStrategy::KeepFirst => {
                            if sources.first().map(String::as_str)
                                == Some(resolved.source.as_str())
                            {
                                self.plan_regular(
                                    resolved, doc, &existing, resolutions, &mut adds,
                                    &mut updates, &mut result,
                                );
                            } else {
                                result.skipped += 1;
                            }
                        }
                        ImportStrategy::KeepLast => {
                            if sources.last().map(String::as_str)
                                == Some(resolved.source.as_str())
                            {
                                self.plan_regular(
                                    resolved, doc, &existing, resolutions, &mut adds,
                                    &mut updates, &mut result,
                                );
                            } else {
                                result.skipped += 1;
                            }
                        }
                        ImportStrategy::Skip => {
                            result.skipped += 1;
                        }
                    }
                } else {
                    self.plan_regular(
                        resolved, doc, &existing, resolutions, &mut adds, &mut updates,
                        &mut result,
                    );
                }
            }
        }

        let mut targets: Vec<String> = adds
            .keys()
            .chain(updates.keys())
            .cloned()
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();
        result.targets.append(&mut targets);

        for (target, entries) in updates {
            self.target_store.get_or_create(&target).await?;
            self.target_store.update(&target, dedup_by_id(entries)).await?;
        }
        for (target, entries) in adds {
            self.target_store.get_or_create(&target).await?;
            let entries = dedup_by_id(entries);
            result.added += entries.len();
            self.target_store.add(&target, entries).await?;
        }

        info!(
            added = result.added,
            updated = result.updated,
            namespaced = result.namespaced,
            skipped = result.skipped,
            "import executed"
        );
        Ok(result)
    }

    // ------------------------------------------------------------------

    async fn plan(&self, filter: &[ImportMapping]) -> Result<ImportPlan> {
        if filter.is_empty() {
            return Err(BridgeError::validation("import filter is empty"));
        }
        let resolved = self.resolve_mappings(filter).await?;

        let mut counts = ImportCounts {
            sources: resolved.len(),
            ..ImportCounts::default()
        };
        let mut conflicts = Vec::new();

        // Group by target and index docs by id.
        let mut by_target: HashMap<String, Vec<&ResolvedSource>> = HashMap::new();
        for source in &resolved {
            by_target.entry(source.target.clone()).or_default().push(source);
        }
        counts.targets = by_target.len();

        let mut collisions: HashMap<String, HashMap<String, Vec<String>>> = HashMap::new();
        for (target, sources) in &by_target {
            if sources.len() < 2 {
                continue;
            }
            // doc_id -> (source, entry) occurrences across all sources
            let mut occurrences: BTreeMap<String, Vec<(&str, &EdbEntry)>> = BTreeMap::new();
            for source in sources {
                for doc in &source.docs {
                    occurrences
                        .entry(doc.id.clone())
                        .or_default()
                        .push((source.source.as_str(), doc));
                }
            }
            for (doc_id, mut hits) in occurrences {
                if hits.len() < 2 {
                    continue;
                }
                hits.sort_by_key(|(source, _)| source.to_string());
                let source_names: Vec<String> =
                    hits.iter().map(|(source, _)| source.to_string()).collect();
                let (first_source, first_doc) = hits[0];
                for (other_source, other_doc) in &hits[1..] {
                    counts.collisions += 1;
                    conflicts.push(ConflictInfo {
                        conflict_id: cross_collection_conflict_id(
                            first_source,
                            other_source,
                            target,
                            &doc_id,
                        ),
                        collection: target.clone(),
                        doc_id: doc_id.clone(),
                        conflict_type: ConflictType::IdCollision,
                        auto_resolvable: false,
                        field_conflicts: Vec::new(),
                        base_values: BTreeMap::new(),
                        our_values: entry_values(first_doc),
                        their_values: entry_values(other_doc),
                        suggested_resolution: Resolution::Namespace,
                        resolution_options: vec![
                            "namespace".to_string(),
                            "keep_first".to_string(),
                            "keep_last".to_string(),
                            "skip".to_string(),
                        ],
                    });
                }
                collisions
                    .entry(target.clone())
                    .or_default()
                    .insert(doc_id, source_names);
            }
        }

        // Per-pair modification analysis against the existing target.
        for source in &resolved {
            counts.documents += source.docs.len();
            let snapshot =
                crate::edb::collection_snapshot(self.target_store.as_ref(), &source.target)
                    .await?;
            for doc in &source.docs {
                match snapshot.doc_hashes.get(&doc.id) {
                    None => counts.additions += 1,
                    Some(existing_hash) if *existing_hash == entry_hash(doc) => {
                        counts.unchanged += 1;
                    }
                    Some(_) => {
                        counts.updates += 1;
                        let in_collision = collisions
                            .get(&source.target)
                            .map(|by_doc| by_doc.contains_key(&doc.id))
                            .unwrap_or(false);
                        if !in_collision {
                            conflicts.push(ConflictInfo {
                                conflict_id: import_conflict_id(
                                    &source.source,
                                    &source.target,
                                    &doc.id,
                                ),
                                collection: source.target.clone(),
                                doc_id: doc.id.clone(),
                                conflict_type: ConflictType::Modification,
                                auto_resolvable: true,
                                field_conflicts: Vec::new(),
                                base_values: BTreeMap::new(),
                                our_values: BTreeMap::new(),
                                their_values: entry_values(doc),
                                suggested_resolution: Resolution::Theirs,
                                resolution_options: vec![
                                    "theirs".to_string(),
                                    "ours".to_string(),
                                    "skip".to_string(),
                                ],
                            });
                        }
                    }
                }
            }
        }

        Ok(ImportPlan {
            resolved,
            collisions,
            conflicts,
            counts,
        })
    }

    /// Resolve wildcard source patterns against the external store.
    async fn resolve_mappings(&self, filter: &[ImportMapping]) -> Result<Vec<ResolvedSource>> {
        let available = self.external.list_collections().await?;
        let mut resolved = Vec::new();
        for mapping in filter {
            let matcher = Glob::new(&mapping.source_pattern)
                .map_err(|e| {
                    BridgeError::validation(format!(
                        "bad source pattern {}: {e}",
                        mapping.source_pattern
                    ))
                })?
                .compile_matcher();
            let doc_matchers = match &mapping.doc_patterns {
                Some(patterns) => {
                    let mut matchers = Vec::new();
                    for pattern in patterns {
                        matchers.push(
                            Glob::new(pattern)
                                .map_err(|e| {
                                    BridgeError::validation(format!(
                                        "bad doc pattern {pattern}: {e}"
                                    ))
                                })?
                                .compile_matcher(),
                        );
                    }
                    Some(matchers)
                }
                None => None,
            };

            for collection in &available {
                if !matcher.is_match(collection) {
                    continue;
                }
                let mut docs: Vec<EdbEntry> = self
                    .external
                    .get_all(collection)
                    .await?
                    .into_iter()
                    .filter(|entry| !entry.is_chunk())
                    .filter(|entry| match &doc_matchers {
                        Some(matchers) => matchers.iter().any(|m| m.is_match(&entry.id)),
                        None => true,
                    })
                    .collect();
                docs.sort_by(|a, b| a.id.cmp(&b.id));
                resolved.push(ResolvedSource {
                    source: collection.clone(),
                    target: mapping.target_collection.clone(),
                    docs,
                });
            }
        }
        resolved.sort_by(|a, b| (&a.target, &a.source).cmp(&(&b.target, &b.source)));
        Ok(resolved)
    }

    /// Pick the strategy for one colliding (target, doc_id): an explicit
    /// resolution for any of its conflict ids wins, then the default,
    /// then the suggested `namespace`.
    fn strategy_for(
        &self,
        plan: &ImportPlan,
        target: &str,
        doc_id: &str,
        resolutions: &HashMap<String, String>,
        default_strategy: Option<ImportStrategy>,
    ) -> Result<ImportStrategy> {
        for conflict in &plan.conflicts {
            if conflict.conflict_type == ConflictType::IdCollision
                && conflict.collection == target
                && conflict.doc_id == doc_id
            {
                if let Some(raw) = resolutions.get(&conflict.conflict_id) {
                    return ImportStrategy::parse(raw);
                }
            }
        }
        Ok(default_strategy.unwrap_or(ImportStrategy::Namespace))
    }

    /// Regular single-source path: add when absent, update when changed,
    /// skip when identical. A modification resolution of `ours`/`skip`
    /// keeps the existing target document.
    #[allow(clippy::too_many_arguments)]
    fn plan_regular(
        &self,
        resolved: &ResolvedSource,
        doc: &EdbEntry,
        existing: &HashMap<String, String>,
        resolutions: &HashMap<String, String>,
        adds: &mut HashMap<String, Vec<EdbEntry>>,
        updates: &mut HashMap<String, Vec<EdbEntry>>,
        result: &mut ImportResult,
    ) {
        let hash = entry_hash(doc);
        let entry = EdbEntry::new(doc.id.clone(), doc.content.clone())
            .with_meta(META_CONTENT_HASH, hash.clone());
        let mut entry = entry;
        for (key, value) in &doc.metadata {
            entry
                .metadata
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }

        match existing.get(&doc.id) {
            None => {
                adds.entry(resolved.target.clone()).or_default().push(entry);
            }
            Some(existing_hash) if *existing_hash == hash => {
                result.unchanged += 1;
            }
            Some(_) => {
                let conflict_id = import_conflict_id(&resolved.source, &resolved.target, &doc.id);
                let keep_existing = resolutions
                    .get(&conflict_id)
                    .map(|raw| {
                        matches!(raw.to_ascii_lowercase().as_str(), "ours" | "skip")
                    })
                    .unwrap_or(false);
                if keep_existing {
                    result.skipped += 1;
                } else {
                    updates.entry(resolved.target.clone()).or_default().push(entry);
                    result.updated += 1;
                }
            }
        }
    }
}
