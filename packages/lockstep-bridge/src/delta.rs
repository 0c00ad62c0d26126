//! Delta detection between the versioned store and the embedding store
//!
//! Given the doc-level hashes on each side plus the branch's pending
//! deletions, produce the (added, modified, deleted) sets that drive a
//! reconciliation. Hash equality is a no-op.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub deleted: Vec<String>,
}

impl Delta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }

    pub fn total(&self) -> usize {
        self.added.len() + self.modified.len() + self.deleted.len()
    }
}

/// Compute the delta for one collection.
///
/// - added: in the versioned store, absent from the embedding store
/// - modified: in both, differing content hash
/// - deleted: in the embedding store but not the versioned store, unioned
///   with the branch's pending deletions that are still present in the
///   embedding store
///
/// A doc with a pending deletion is never added or modified: the commit
/// containing its deletion may not exist yet, and re-adding it would
/// resurrect a document the user already deleted.
pub fn compute(
    vdb_hashes: &HashMap<String, String>,
    edb_hashes: &HashMap<String, String>,
    pending_deletions: &HashSet<String>,
) -> Delta {
    let mut delta = Delta::default();

    for (doc_id, vdb_hash) in vdb_hashes {
        if pending_deletions.contains(doc_id) {
            continue;
        }
        match edb_hashes.get(doc_id) {
            None => delta.added.push(doc_id.clone()),
            Some(edb_hash) if edb_hash != vdb_hash => delta.modified.push(doc_id.clone()),
            Some(_) => {}
        }
    }

    for doc_id in edb_hashes.keys() {
        let gone_from_vdb = !vdb_hashes.contains_key(doc_id);
        let pending = pending_deletions.contains(doc_id);
        if gone_from_vdb || pending {
            delta.deleted.push(doc_id.clone());
        }
    }

    delta.added.sort();
    delta.modified.sort();
    delta.deleted.sort();
    delta
}
