//! Revision deltas: the per-feature change list a transaction sends instead of
//! the full object. Applied copy-on-write to the base revision at commit time.

use serde::{Deserialize, Serialize};

use arbor_common::error::StorageError;
use arbor_common::schema::ModelRegistry;
use arbor_common::types::{BranchId, ObjectId, RevisionKey, Version};
use arbor_common::value::{FieldValue, IdMap};

use crate::revision::Revision;

/// One change to one feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FeatureDelta {
    /// Replace the whole value, or the list element at `index`.
    Set {
        feature: String,
        index: Option<usize>,
        value: FieldValue,
    },
    /// Append to a list, or insert at `index`.
    Add {
        feature: String,
        index: Option<usize>,
        value: FieldValue,
    },
    Remove { feature: String, index: usize },
    Move { feature: String, from: usize, to: usize },
    /// Empty a list feature.
    Clear { feature: String },
    /// Drop the feature value entirely.
    Unset { feature: String },
}

impl FeatureDelta {
    pub fn feature(&self) -> &str {
        match self {
            FeatureDelta::Set { feature, .. }
            | FeatureDelta::Add { feature, .. }
            | FeatureDelta::Remove { feature, .. }
            | FeatureDelta::Move { feature, .. }
            | FeatureDelta::Clear { feature }
            | FeatureDelta::Unset { feature } => feature,
        }
    }

    /// Value introduced by this op, if any.
    pub fn value(&self) -> Option<&FieldValue> {
        match self {
            FeatureDelta::Set { value, .. } | FeatureDelta::Add { value, .. } => Some(value),
            _ => None,
        }
    }

    fn remap_references(&mut self, map: &IdMap) -> usize {
        match self {
            FeatureDelta::Set { value, .. } | FeatureDelta::Add { value, .. } => {
                value.remap_references(map)
            }
            _ => 0,
        }
    }
}

/// Changes to one object, computed against the revision identified by
/// `(id, branch, version)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevisionDelta {
    pub id: ObjectId,
    pub branch: BranchId,
    pub version: Version,
    /// `Some(new)` when the object moves to another container (or to none).
    pub container: Option<Option<ObjectId>>,
    pub ops: Vec<FeatureDelta>,
}

impl RevisionDelta {
    pub fn new(base: RevisionKey) -> Self {
        Self {
            id: base.id,
            branch: base.branch,
            version: base.version,
            container: None,
            ops: Vec::new(),
        }
    }

    pub fn with_op(mut self, op: FeatureDelta) -> Self {
        self.ops.push(op);
        self
    }

    pub fn with_container(mut self, container: Option<ObjectId>) -> Self {
        self.container = Some(container);
        self
    }

    /// Key of the base revision.
    pub fn key(&self) -> RevisionKey {
        RevisionKey::new(self.id, self.branch, self.version)
    }

    /// Field-level diff: `Set` for changed or added features, `Unset` for removed ones.
    pub fn between(base: &Revision, working: &Revision) -> RevisionDelta {
        let mut delta = RevisionDelta::new(base.key());
        for (feature, value) in &working.fields {
            if base.fields.get(feature) != Some(value) {
                delta.ops.push(FeatureDelta::Set {
                    feature: feature.clone(),
                    index: None,
                    value: value.clone(),
                });
            }
        }
        for feature in base.fields.keys() {
            if !working.fields.contains_key(feature) {
                delta.ops.push(FeatureDelta::Unset {
                    feature: feature.clone(),
                });
            }
        }
        if base.container != working.container {
            delta.container = Some(working.container);
        }
        delta
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty() && self.container.is_none()
    }

    /// True if applying this delta moves the object or rewires a containment feature.
    pub fn has_containment_changes(&self, model: &ModelRegistry, class: &str) -> bool {
        self.container.is_some()
            || self
                .ops
                .iter()
                .any(|op| model.is_containment(class, op.feature()))
    }

    /// Object ids introduced by `Set`/`Add` values and by a container change.
    pub fn added_references(&self) -> Vec<ObjectId> {
        let mut out = Vec::new();
        if let Some(Some(c)) = self.container {
            out.push(c);
        }
        for op in &self.ops {
            if let Some(v) = op.value() {
                v.collect_references(&mut out);
            }
        }
        out
    }

    pub fn remap_references(&mut self, map: &IdMap) -> usize {
        let mut n = 0;
        if let Some(Some(c)) = self.container {
            if let Some(new_c) = map.get(&c) {
                self.container = Some(Some(*new_c));
                n += 1;
            }
        }
        for op in &mut self.ops {
            n += op.remap_references(map);
        }
        n
    }

    /// Apply every op, in order, to `rev`.
    pub fn apply(&self, rev: &mut Revision) -> Result<(), StorageError> {
        if let Some(container) = self.container {
            rev.container = container;
        }
        for op in &self.ops {
            self.apply_op(op, rev)?;
        }
        Ok(())
    }

    fn apply_op(&self, op: &FeatureDelta, rev: &mut Revision) -> Result<(), StorageError> {
        match op {
            FeatureDelta::Set {
                feature,
                index: None,
                value,
            } => {
                rev.fields.insert(feature.clone(), value.clone());
            }
            FeatureDelta::Set {
                feature,
                index: Some(i),
                value,
            } => {
                let list = self.list_mut(rev, feature)?;
                let slot = list
                    .get_mut(*i)
                    .ok_or_else(|| self.invalid(format!("{}[{}] out of bounds", feature, i)))?;
                *slot = value.clone();
            }
            FeatureDelta::Add {
                feature,
                index,
                value,
            } => {
                let list = self.list_mut(rev, feature)?;
                match index {
                    None => list.push(value.clone()),
                    Some(i) if *i <= list.len() => list.insert(*i, value.clone()),
                    Some(i) => {
                        return Err(self.invalid(format!("{}[{}] out of bounds", feature, i)))
                    }
                }
            }
            FeatureDelta::Remove { feature, index } => {
                let list = self.list_mut(rev, feature)?;
                if *index >= list.len() {
                    return Err(self.invalid(format!("{}[{}] out of bounds", feature, index)));
                }
                list.remove(*index);
            }
            FeatureDelta::Move { feature, from, to } => {
                let list = self.list_mut(rev, feature)?;
                if *from >= list.len() || *to >= list.len() {
                    return Err(self.invalid(format!(
                        "move {}[{}] -> [{}] out of bounds",
                        feature, from, to
                    )));
                }
                let item = list.remove(*from);
                list.insert(*to, item);
            }
            FeatureDelta::Clear { feature } => {
                rev.fields
                    .insert(feature.clone(), FieldValue::List(Vec::new()));
            }
            FeatureDelta::Unset { feature } => {
                rev.fields.remove(feature);
            }
        }
        Ok(())
    }

    fn list_mut<'a>(
        &self,
        rev: &'a mut Revision,
        feature: &str,
    ) -> Result<&'a mut Vec<FieldValue>, StorageError> {
        let value = rev
            .fields
            .entry(feature.to_string())
            .or_insert_with(|| FieldValue::List(Vec::new()));
        match value {
            FieldValue::List(items) => Ok(items),
            other => Err(StorageError::InvalidDelta {
                id: self.id,
                reason: format!("{} is not a list (found {})", feature, other),
            }),
        }
    }

    fn invalid(&self, reason: String) -> StorageError {
        StorageError::InvalidDelta {
            id: self.id,
            reason,
        }
    }
}
