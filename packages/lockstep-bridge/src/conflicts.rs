//! Conflict analysis
//!
//! Produces per-document, field-level conflict reports with identifiers
//! that are deterministic across runs, so an id handed out by a preview
//! is still valid at execute time. Fields are the document content plus
//! each metadata key; a field can auto-merge when exactly one side
//! changed it relative to base.

use crate::dolt::ConflictDocVersions;
use crate::error::{BridgeError, Result};
use lockstep_storage::Document;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

pub const CONTENT_FIELD: &str = "content";

/// 12-hex-char fingerprint for a merge conflict. The tuple is sorted, so
/// the id is independent of which side of the (source, target) pair is
/// observed first.
pub fn merge_conflict_id(collection: &str, doc_id: &str, target: &str, source: &str) -> String {
    let mut parts = [collection, doc_id, target, source];
    parts.sort_unstable();
    let digest = Sha256::digest(format!("MERGE_{}", parts.join("_")).as_bytes());
    format!("{digest:x}")[..12].to_string()
}

/// Fingerprint for a cross-collection id collision: `xc_` + 12 hex chars,
/// independent of the order the two sources were discovered in.
pub fn cross_collection_conflict_id(
    src_a: &str,
    src_b: &str,
    target: &str,
    doc_id: &str,
) -> String {
    let (first, second) = if src_a <= src_b {
        (src_a, src_b)
    } else {
        (src_b, src_a)
    };
    let digest =
        Sha256::digest(format!("CROSS_{first}_{second}_{target}_{doc_id}").as_bytes());
    format!("xc_{}", &format!("{digest:x}")[..12])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictType {
    Modification,
    Deletion,
    IdCollision,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Ours,
    Theirs,
    FieldMerge,
    Custom,
    Auto,
    Manual,
    /// Import-side suggestion for id collisions.
    Namespace,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::Ours => "ours",
            Resolution::Theirs => "theirs",
            Resolution::FieldMerge => "field_merge",
            Resolution::Custom => "custom",
            Resolution::Auto => "auto",
            Resolution::Manual => "manual",
            Resolution::Namespace => "namespace",
        }
    }

    /// Case-insensitive parse.
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ours" => Ok(Resolution::Ours),
            "theirs" => Ok(Resolution::Theirs),
            "field_merge" => Ok(Resolution::FieldMerge),
            "custom" => Ok(Resolution::Custom),
            "auto" => Ok(Resolution::Auto),
            "manual" => Ok(Resolution::Manual),
            "namespace" => Ok(Resolution::Namespace),
            _ => Err(BridgeError::validation(format!(
                "unknown resolution: {s}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldConflict {
    pub field: String,
    pub base_value: Option<serde_json::Value>,
    pub our_value: Option<serde_json::Value>,
    pub their_value: Option<serde_json::Value>,
    pub can_auto_merge: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictInfo {
    pub conflict_id: String,
    pub collection: String,
    pub doc_id: String,
    #[serde(rename = "type")]
    pub conflict_type: ConflictType,
    pub auto_resolvable: bool,
    pub field_conflicts: Vec<FieldConflict>,
    pub base_values: BTreeMap<String, serde_json::Value>,
    pub our_values: BTreeMap<String, serde_json::Value>,
    pub their_values: BTreeMap<String, serde_json::Value>,
    pub suggested_resolution: Resolution,
    pub resolution_options: Vec<String>,
}

/// Flatten a document into its comparable fields.
fn field_values(doc: Option<&Document>) -> BTreeMap<String, serde_json::Value> {
    let mut values = BTreeMap::new();
    if let Some(doc) = doc {
        values.insert(
            CONTENT_FIELD.to_string(),
            serde_json::json!(doc.content.clone()),
        );
        for (key, value) in &doc.metadata {
            values.insert(key.clone(), value.clone());
        }
    }
    values
}

/// Analyze one conflicted document against base/ours/theirs snapshots.
pub fn analyze(versions: &ConflictDocVersions, source: &str, target: &str) -> ConflictInfo {
    let base_values = field_values(versions.base.as_ref());
    let our_values = field_values(versions.ours.as_ref());
    let their_values = field_values(versions.theirs.as_ref());

    let conflict_type = if versions.ours.is_none() || versions.theirs.is_none() {
        ConflictType::Deletion
    } else {
        ConflictType::Modification
    };

    let mut fields: BTreeSet<String> = BTreeSet::new();
    fields.extend(base_values.keys().cloned());
    fields.extend(our_values.keys().cloned());
    fields.extend(their_values.keys().cloned());

    let mut field_conflicts = Vec::new();
    for field in &fields {
        let base = base_values.get(field);
        let ours = our_values.get(field);
        let theirs = their_values.get(field);
        if ours == theirs {
            continue;
        }
        let ours_changed = ours != base;
        let theirs_changed = theirs != base;
        field_conflicts.push(FieldConflict {
            field: field.clone(),
            base_value: base.cloned(),
            our_value: ours.cloned(),
            their_value: theirs.cloned(),
            can_auto_merge: ours_changed != theirs_changed,
        });
    }

    let theirs_is_base = field_conflicts.iter().all(|f| f.their_value == f.base_value);
    let ours_is_base = field_conflicts.iter().all(|f| f.our_value == f.base_value);
    let all_auto = !field_conflicts.is_empty() && field_conflicts.iter().all(|f| f.can_auto_merge);

    let suggested_resolution = if conflict_type == ConflictType::Deletion {
        if theirs_is_base {
            Resolution::Ours
        } else if ours_is_base {
            Resolution::Theirs
        } else {
            Resolution::Manual
        }
    } else if theirs_is_base {
        Resolution::Ours
    } else if ours_is_base {
        Resolution::Theirs
    } else if all_auto {
        Resolution::FieldMerge
    } else {
        Resolution::Manual
    };

    let auto_resolvable = suggested_resolution != Resolution::Manual;
    let mut resolution_options = vec!["ours".to_string(), "theirs".to_string()];
    if all_auto && conflict_type == ConflictType::Modification {
        resolution_options.push("field_merge".to_string());
    }
    resolution_options.push("custom".to_string());

    ConflictInfo {
        conflict_id: merge_conflict_id(&versions.collection, &versions.doc_id, target, source),
        collection: versions.collection.clone(),
        doc_id: versions.doc_id.clone(),
        conflict_type,
        auto_resolvable,
        field_conflicts,
        base_values,
        our_values,
        their_values,
        suggested_resolution,
        resolution_options,
    }
}

/// Build the merged document for a field-merge resolution: every field
/// takes the side that changed it. Returns None when any field conflicts
/// on both sides.
pub fn field_merge(versions: &ConflictDocVersions) -> Option<Document> {
    let ours = versions.ours.as_ref()?;
    let theirs = versions.theirs.as_ref()?;
    let base_values = field_values(versions.base.as_ref());

    let mut merged = ours.clone();
    // Content
    let our_content_changed =
        base_values.get(CONTENT_FIELD).and_then(|v| v.as_str()) != Some(ours.content.as_str());
    let their_content_changed =
        base_values.get(CONTENT_FIELD).and_then(|v| v.as_str()) != Some(theirs.content.as_str());
    if ours.content != theirs.content {
        match (our_content_changed, their_content_changed) {
            (true, false) => {}
            (false, true) => merged.content = theirs.content.clone(),
            _ => return None,
        }
    }

    // Metadata fields
    let mut keys: BTreeSet<&String> = ours.metadata.keys().collect();
    keys.extend(theirs.metadata.keys());
    let keys: Vec<String> = keys.into_iter().cloned().collect();
    for key in keys {
        let our_value = ours.metadata.get(&key);
        let their_value = theirs.metadata.get(&key);
        if our_value == their_value {
            continue;
        }
        let base_value = base_values.get(&key);
        let ours_changed = our_value != base_value;
        let theirs_changed = their_value != base_value;
        match (ours_changed, theirs_changed) {
            (true, false) => {}
            (false, true) => match their_value {
                Some(value) => {
                    merged.metadata.insert(key, value.clone());
                }
                None => {
                    merged.metadata.remove(&key);
                }
            },
            _ => return None,
        }
    }

    merged.content_hash = crate::content::content_hash(&merged.content);
    Some(merged)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(collection: &str, id: &str, content: &str) -> Document {
        Document::new(collection, id, content, crate::content::content_hash(content))
    }

    fn doc_with_meta(collection: &str, id: &str, content: &str, key: &str, value: &str) -> Document {
        let mut d = doc(collection, id, content);
        d.metadata.insert(key.to_string(), serde_json::json!(value));
        d
    }

    fn versions(
        base: Option<Document>,
        ours: Option<Document>,
        theirs: Option<Document>,
    ) -> ConflictDocVersions {
        ConflictDocVersions {
            collection: "notes".to_string(),
            doc_id: "n-1".to_string(),
            base,
            ours,
            theirs,
        }
    }

    #[test]
    fn test_merge_conflict_id_stable_and_order_independent() {
        let a = merge_conflict_id("notes", "n-1", "main", "feature");
        let b = merge_conflict_id("notes", "n-1", "feature", "main");
        assert_eq!(a, b);
        assert_eq!(a.len(), 12);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        // Deterministic across calls
        assert_eq!(a, merge_conflict_id("notes", "n-1", "main", "feature"));
    }

    #[test]
    fn test_merge_conflict_id_distinguishes_documents() {
        let a = merge_conflict_id("notes", "n-1", "main", "feature");
        let b = merge_conflict_id("notes", "n-2", "main", "feature");
        assert_ne!(a, b);
    }

    #[test]
    fn test_cross_collection_id_shape_and_symmetry() {
        let a = cross_collection_conflict_id("SE-405", "PP02-186", "issueLogs", "e2e");
        let b = cross_collection_conflict_id("PP02-186", "SE-405", "issueLogs", "e2e");
        assert_eq!(a, b);
        assert!(a.starts_with("xc_"));
        assert_eq!(a.len(), 15);
    }

    #[test]
    fn test_analyze_only_ours_changed_suggests_ours() {
        let base = doc("notes", "n-1", "original");
        let ours = doc("notes", "n-1", "changed by us");
        let theirs = base.clone();
        let info = analyze(&versions(Some(base), Some(ours), Some(theirs)), "feature", "main");

        assert_eq!(info.conflict_type, ConflictType::Modification);
        assert_eq!(info.suggested_resolution, Resolution::Ours);
        assert!(info.auto_resolvable);
    }

    #[test]
    fn test_analyze_only_theirs_changed_suggests_theirs() {
        let base = doc("notes", "n-1", "original");
        let theirs = doc("notes", "n-1", "changed by them");
        let ours = base.clone();
        let info = analyze(&versions(Some(base), Some(ours), Some(theirs)), "feature", "main");
        assert_eq!(info.suggested_resolution, Resolution::Theirs);
    }

    #[test]
    fn test_analyze_disjoint_field_changes_suggest_field_merge() {
        let base = doc_with_meta("notes", "n-1", "original", "status", "open");
        let ours = doc_with_meta("notes", "n-1", "changed by us", "status", "open");
        let theirs = doc_with_meta("notes", "n-1", "original", "status", "closed");
        let info = analyze(&versions(Some(base), Some(ours), Some(theirs)), "feature", "main");

        assert_eq!(info.suggested_resolution, Resolution::FieldMerge);
        assert!(info.auto_resolvable);
        assert_eq!(info.field_conflicts.len(), 2);
        assert!(info.field_conflicts.iter().all(|f| f.can_auto_merge));
        assert!(info
            .resolution_options
            .contains(&"field_merge".to_string()));
    }

    #[test]
    fn test_analyze_both_changed_same_field_is_manual() {
        let base = doc("notes", "n-1", "original");
        let ours = doc("notes", "n-1", "our version");
        let theirs = doc("notes", "n-1", "their version");
        let info = analyze(&versions(Some(base), Some(ours), Some(theirs)), "feature", "main");

        assert_eq!(info.suggested_resolution, Resolution::Manual);
        assert!(!info.auto_resolvable);
        let content = &info.field_conflicts[0];
        assert!(!content.can_auto_merge);
    }

    #[test]
    fn test_analyze_deletion_conflict() {
        let base = doc("notes", "n-1", "original");
        let theirs = doc("notes", "n-1", "their edit");
        let info = analyze(&versions(Some(base), None, Some(theirs)), "feature", "main");

        assert_eq!(info.conflict_type, ConflictType::Deletion);
        // We deleted, they edited: no side equals base, manual.
        assert_eq!(info.suggested_resolution, Resolution::Manual);
    }

    #[test]
    fn test_analyze_deletion_with_untouched_other_side() {
        let base = doc("notes", "n-1", "original");
        let theirs = base.clone();
        let info = analyze(&versions(Some(base), None, Some(theirs)), "feature", "main");
        // They kept base; our deletion wins automatically.
        assert_eq!(info.suggested_resolution, Resolution::Ours);
    }

    #[test]
    fn test_field_merge_combines_disjoint_changes() {
        let base = doc_with_meta("notes", "n-1", "original", "status", "open");
        let ours = doc_with_meta("notes", "n-1", "new content", "status", "open");
        let theirs = doc_with_meta("notes", "n-1", "original", "status", "closed");

        let merged = field_merge(&versions(Some(base), Some(ours), Some(theirs))).unwrap();
        assert_eq!(merged.content, "new content");
        assert_eq!(merged.metadata.get("status").unwrap(), "closed");
        assert_eq!(
            merged.content_hash,
            crate::content::content_hash("new content")
        );
    }

    #[test]
    fn test_field_merge_refuses_double_change() {
        let base = doc("notes", "n-1", "original");
        let ours = doc("notes", "n-1", "ours");
        let theirs = doc("notes", "n-1", "theirs");
        assert!(field_merge(&versions(Some(base), Some(ours), Some(theirs))).is_none());
    }

    #[test]
    fn test_resolution_parse_case_insensitive() {
        assert_eq!(Resolution::parse("OURS").unwrap(), Resolution::Ours);
        assert_eq!(Resolution::parse("Field_Merge").unwrap(), Resolution::FieldMerge);
        assert!(Resolution::parse("nope").is_err());
    }

    #[test]
    fn test_resolution_roundtrip() {
        for resolution in &[
            Resolution::Ours,
            Resolution::Theirs,
            Resolution::FieldMerge,
            Resolution::Custom,
            Resolution::Auto,
            Resolution::Manual,
            Resolution::Namespace,
        ] {
            assert_eq!(
                Resolution::parse(resolution.as_str()).unwrap(),
                *resolution
            );
        }
    }
}
