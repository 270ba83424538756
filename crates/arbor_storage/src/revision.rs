//! Materialized object revisions.
//!
//! A revision is one immutable state of one object on one branch, valid over
//! `[created, revised)`. An open `revised` marks the branch head. Superseding a
//! revision never mutates it in place: the revision store swaps in a copy with
//! `revised` set.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use arbor_common::types::{BranchId, BranchPoint, ObjectId, RevisionKey, Timestamp, Version};
use arbor_common::value::{FieldValue, IdMap};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Revision {
    pub id: ObjectId,
    pub class: String,
    pub branch: BranchId,
    pub version: Version,
    pub created: Timestamp,
    /// Exclusive upper validity bound; `None` while this is the head.
    pub revised: Option<Timestamp>,
    pub container: Option<ObjectId>,
    pub fields: BTreeMap<String, FieldValue>,
    /// Tombstone written when the object is detached. Carries no data.
    pub detached: bool,
}

impl Revision {
    /// A fresh, uncommitted revision as a client would build it for a new object.
    pub fn new(id: ObjectId, class: &str) -> Self {
        Self {
            id,
            class: class.to_string(),
            branch: BranchId::MAIN,
            version: Version::FIRST,
            created: Timestamp::UNSPECIFIED,
            revised: None,
            container: None,
            fields: BTreeMap::new(),
            detached: false,
        }
    }

    pub fn with_field(mut self, feature: &str, value: FieldValue) -> Self {
        self.fields.insert(feature.to_string(), value);
        self
    }

    pub fn with_container(mut self, container: ObjectId) -> Self {
        self.container = Some(container);
        self
    }

    /// Tombstone that follows the last live revision of a detached object.
    pub fn detached_marker(
        id: ObjectId,
        class: &str,
        branch: BranchId,
        version: Version,
        created: Timestamp,
    ) -> Self {
        Self {
            id,
            class: class.to_string(),
            branch,
            version,
            created,
            revised: None,
            container: None,
            fields: BTreeMap::new(),
            detached: true,
        }
    }

    pub fn key(&self) -> RevisionKey {
        RevisionKey::new(self.id, self.branch, self.version)
    }

    pub fn branch_point(&self) -> BranchPoint {
        BranchPoint::new(self.branch, self.created)
    }

    pub fn is_current(&self) -> bool {
        self.revised.is_none()
    }

    /// True if this revision is the visible state at `ts` (head when unspecified).
    pub fn is_valid(&self, ts: Timestamp) -> bool {
        if !ts.is_specified() {
            return self.is_current();
        }
        self.created <= ts && self.revised.map_or(true, |r| ts < r)
    }

    pub fn get(&self, feature: &str) -> Option<&FieldValue> {
        self.fields.get(feature)
    }

    /// Copy for applying a delta; the copy is open-ended again.
    pub fn copy_for_change(&self) -> Revision {
        let mut copy = self.clone();
        copy.revised = None;
        copy
    }

    /// Re-address a changed copy to the commit branch and timestamp.
    /// Staying on the same branch bumps the version; landing on a new branch starts at 1.
    pub fn adjust_for_commit(&mut self, branch: BranchId, ts: Timestamp) {
        if branch == self.branch {
            self.version = self.version.next();
        } else {
            self.branch = branch;
            self.version = Version::FIRST;
        }
        self.created = ts;
        self.revised = None;
    }

    /// Stamp a brand-new object with its commit coordinates.
    pub fn stamp_new(&mut self, branch: BranchId, ts: Timestamp) {
        self.branch = branch;
        self.version = Version::FIRST;
        self.created = ts;
        self.revised = None;
    }

    pub fn revised_at(&self, ts: Timestamp) -> Revision {
        let mut copy = self.clone();
        copy.revised = Some(ts);
        copy
    }

    /// All outgoing references: the container plus every reference in the fields.
    pub fn references(&self) -> Vec<ObjectId> {
        let mut out = Vec::new();
        if let Some(c) = self.container {
            out.push(c);
        }
        for value in self.fields.values() {
            value.collect_references(&mut out);
        }
        out
    }

    /// Outgoing references grouped by feature, container excluded.
    pub fn references_by_feature(&self) -> Vec<(&str, ObjectId)> {
        let mut out = Vec::new();
        for (feature, value) in &self.fields {
            for id in value.references() {
                out.push((feature.as_str(), id));
            }
        }
        out
    }

    /// Rewrite the own id, the container and every field reference found in `map`.
    pub fn remap_references(&mut self, map: &IdMap) -> usize {
        let mut n = 0;
        if let Some(new_id) = map.get(&self.id) {
            self.id = *new_id;
            n += 1;
        }
        if let Some(c) = self.container {
            if let Some(new_c) = map.get(&c) {
                self.container = Some(*new_c);
                n += 1;
            }
        }
        for value in self.fields.values_mut() {
            n += value.remap_references(map);
        }
        n
    }
}
