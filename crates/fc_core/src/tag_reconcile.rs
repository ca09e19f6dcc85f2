//! Canonical tag identities for one apply.
//!
//! Replicas mint tag ids independently, so "Network" authored on two machines arrives under two
//! ids. Reconciliation maps every incoming id onto the single id the target treats as
//! authoritative for that normalized name: an existing live tag first, then the first live
//! incoming tag in file order that claimed the name. Deleted incoming rows only claim names no
//! live row wants. The pass only reads; the applier does the writes.

use crate::types::{IncomingLink, TagRecord};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Trimmed, case-folded name; `None` for blank names, which never take part in matching.
pub fn normalize_tag_name(name: &str) -> Option<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_lowercase())
    }
}

/// `incoming tag id → canonical tag id`, holding only ids that must not be used verbatim.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagRemap {
    entries: BTreeMap<String, String>,
}

impl TagRemap {
    pub fn resolve<'a>(&'a self, tag_id: &'a str) -> &'a str {
        self.entries.get(tag_id).map(|s| s.as_str()).unwrap_or(tag_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.entries.iter()
    }

    fn record(&mut self, incoming: &str, canonical: &str) {
        if incoming != canonical {
            self.entries
                .entry(incoming.to_string())
                .or_insert_with(|| canonical.to_string());
        }
    }
}

/// A tag referenced by links but shipped without a Tag row and unknown to the target's live
/// set. The applier reconstructs it from the link's denormalized name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnbackedTag {
    pub tag_id: String,
    pub name: String,
    pub is_deleted: bool,
}

#[derive(Debug, Clone, Default)]
pub struct TagReconciliation {
    pub remap: TagRemap,
    /// Incoming Tag rows, one per final id, names trimmed, in file order.
    pub tags: Vec<TagRecord>,
    /// Incoming links with tag ids rewritten to canonical ids.
    pub links: Vec<IncomingLink>,
    pub unbacked: Vec<UnbackedTag>,
}

struct NameTable {
    existing: HashMap<String, String>,
    claimed: HashMap<String, String>,
}

impl NameTable {
    /// Existing name, else a name claimed earlier in the batch, else `tag_id` claims it.
    fn canonical_for(&mut self, normalized: &str, tag_id: &str) -> String {
        if let Some(id) = self.existing.get(normalized) {
            return id.clone();
        }
        self.claimed
            .entry(normalized.to_string())
            .or_insert_with(|| tag_id.to_string())
            .clone()
    }
}

pub fn reconcile_tags(
    existing_live: &[TagRecord],
    incoming_tags: &[TagRecord],
    incoming_links: &[IncomingLink],
) -> TagReconciliation {
    let mut existing = HashMap::new();
    for tag in existing_live.iter().filter(|t| !t.is_deleted) {
        if let Some(name) = normalize_tag_name(&tag.name) {
            existing.entry(name).or_insert_with(|| tag.tag_id.clone());
        }
    }
    let existing_ids: HashSet<&str> = existing_live.iter().map(|t| t.tag_id.as_str()).collect();
    let mut names = NameTable {
        existing,
        claimed: HashMap::new(),
    };

    // Live rows claim first so a tombstone never holds a name a live tag needs.
    let mut remap = TagRemap::default();
    let live_first = incoming_tags
        .iter()
        .filter(|t| !t.is_deleted)
        .chain(incoming_tags.iter().filter(|t| t.is_deleted));
    for tag in live_first {
        if let Some(name) = normalize_tag_name(&tag.name) {
            let canonical = names.canonical_for(&name, &tag.tag_id);
            remap.record(&tag.tag_id, &canonical);
        }
    }

    // One row per final id in order of first appearance; a live row beats a deleted one.
    let mut tags: Vec<TagRecord> = Vec::new();
    let mut slot_by_id: HashMap<String, usize> = HashMap::new();
    for tag in incoming_tags {
        let final_id = remap.resolve(&tag.tag_id).to_string();
        let row = TagRecord {
            tag_id: final_id.clone(),
            name: tag.name.trim().to_string(),
            ..tag.clone()
        };
        match slot_by_id.get(&final_id) {
            Some(&slot) => {
                if tags[slot].is_deleted && !row.is_deleted {
                    tags[slot] = row;
                }
            }
            None => {
                slot_by_id.insert(final_id, tags.len());
                tags.push(row);
            }
        }
    }

    // Links are canonicalized by their own name; Tag rows may be absent or disagree.
    let row_ids: HashSet<String> = tags.iter().map(|t| t.tag_id.clone()).collect();
    let mut links = Vec::with_capacity(incoming_links.len());
    let mut unbacked = Vec::new();
    let mut unbacked_ids = HashSet::new();
    for link in incoming_links {
        let canonical = match normalize_tag_name(&link.tag_name) {
            Some(name) => {
                let canonical = names.canonical_for(&name, &link.tag_id);
                if !row_ids.contains(&link.tag_id) {
                    remap.record(&link.tag_id, &canonical);
                }
                canonical
            }
            None => remap.resolve(&link.tag_id).to_string(),
        };

        let backed = row_ids.contains(&canonical) || existing_ids.contains(canonical.as_str());
        if !backed && !link.tag_name.trim().is_empty() && unbacked_ids.insert(canonical.clone()) {
            unbacked.push(UnbackedTag {
                tag_id: canonical.clone(),
                name: link.tag_name.trim().to_string(),
                is_deleted: link.tag_is_deleted,
            });
        }

        links.push(IncomingLink {
            tag_id: canonical,
            ..link.clone()
        });
    }

    TagReconciliation {
        remap,
        tags,
        links,
        unbacked,
    }
}

#[cfg(test)]
mod tests {
    use super::normalize_tag_name;

    #[test]
    fn normalization_trims_and_folds_case() {
        assert_eq!(normalize_tag_name("  NetWork "), Some("network".to_string()));
        assert_eq!(normalize_tag_name(" \t "), None);
    }
}
