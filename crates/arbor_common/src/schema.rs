use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Kind of a persistent feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureKind {
    /// Plain data (numbers, strings, flags).
    Attribute,
    /// Cross reference to another object; the target stays independent.
    Reference,
    /// Containment reference: the target is owned by the referencing object.
    Containment,
}

/// One persistent feature of a class.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureDef {
    pub name: String,
    pub kind: FeatureKind,
    /// True for list-valued features.
    pub many: bool,
}

impl FeatureDef {
    pub fn attribute(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: FeatureKind::Attribute,
            many: false,
        }
    }

    pub fn reference(name: &str, many: bool) -> Self {
        Self {
            name: name.to_string(),
            kind: FeatureKind::Reference,
            many,
        }
    }

    pub fn containment(name: &str, many: bool) -> Self {
        Self {
            name: name.to_string(),
            kind: FeatureKind::Containment,
            many,
        }
    }

    pub fn is_reference(&self) -> bool {
        matches!(self.kind, FeatureKind::Reference | FeatureKind::Containment)
    }
}

/// Persistent class metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassDef {
    pub name: String,
    pub features: Vec<FeatureDef>,
}

impl ClassDef {
    pub fn new(name: &str, features: Vec<FeatureDef>) -> Self {
        Self {
            name: name.to_string(),
            features,
        }
    }

    pub fn feature(&self, name: &str) -> Option<&FeatureDef> {
        self.features.iter().find(|f| f.name == name)
    }

    pub fn containment_features(&self) -> impl Iterator<Item = &FeatureDef> {
        self.features
            .iter()
            .filter(|f| f.kind == FeatureKind::Containment)
    }
}

/// The domain model known to a repository: which classes exist and which of
/// their features are containment references.
///
/// Populated once by the embedding layer before the repository opens, read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    classes: HashMap<String, ClassDef>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, class: ClassDef) {
        self.classes.insert(class.name.clone(), class);
    }

    pub fn with_class(mut self, class: ClassDef) -> Self {
        self.register(class);
        self
    }

    pub fn class(&self, name: &str) -> Option<&ClassDef> {
        self.classes.get(name)
    }

    pub fn is_containment(&self, class: &str, feature: &str) -> bool {
        self.class(class)
            .and_then(|c| c.feature(feature))
            .map(|f| f.kind == FeatureKind::Containment)
            .unwrap_or(false)
    }

    pub fn class_names(&self) -> impl Iterator<Item = &str> {
        self.classes.keys().map(|s| s.as_str())
    }
}
