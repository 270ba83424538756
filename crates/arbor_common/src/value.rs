//! Field values carried by revisions and delta operations.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::ObjectId;

/// Substitution applied when temporary ids become persistent.
pub type IdMap = HashMap<ObjectId, ObjectId>;

/// A single feature value. Many-valued features hold a `List`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Ref(ObjectId),
    List(Vec<FieldValue>),
}

impl FieldValue {
    pub fn as_ref_id(&self) -> Option<ObjectId> {
        match self {
            FieldValue::Ref(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&Vec<FieldValue>> {
        match self {
            FieldValue::List(items) => Some(items),
            _ => None,
        }
    }

    /// Push every object id referenced by this value (recursively) into `out`.
    pub fn collect_references(&self, out: &mut Vec<ObjectId>) {
        match self {
            FieldValue::Ref(id) => out.push(*id),
            FieldValue::List(items) => {
                for item in items {
                    item.collect_references(out);
                }
            }
            _ => {}
        }
    }

    pub fn references(&self) -> Vec<ObjectId> {
        let mut out = Vec::new();
        self.collect_references(&mut out);
        out
    }

    /// Rewrite references found in `map`. Returns the number of rewritten references.
    pub fn remap_references(&mut self, map: &IdMap) -> usize {
        match self {
            FieldValue::Ref(id) => match map.get(id) {
                Some(new_id) => {
                    *id = *new_id;
                    1
                }
                None => 0,
            },
            FieldValue::List(items) => items.iter_mut().map(|v| v.remap_references(map)).sum(),
            _ => 0,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Bool(b) => write!(f, "{}", b),
            FieldValue::Int(i) => write!(f, "{}", i),
            FieldValue::Float(x) => write!(f, "{}", x),
            FieldValue::Text(s) => write!(f, "'{}'", s),
            FieldValue::Ref(id) => write!(f, "->{}", id),
            FieldValue::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
        }
    }
}
