#![allow(dead_code, unused_imports)]

pub use std::sync::Arc;
pub use std::time::Duration;

pub use arbor_common::config::ArborConfig;
pub use arbor_common::error::{ArborError, CommitError, LockError};
pub use arbor_common::schema::{ClassDef, FeatureDef, ModelRegistry};
pub use arbor_common::types::{BranchId, BranchPoint, LockType, ObjectId, RevisionKey, Timestamp, Version, ViewId};
pub use arbor_common::value::FieldValue;
pub use arbor_server::{NotificationScope, Query, QueryEnd, QueryRow, Repository, SessionEvent};
pub use arbor_storage::{FeatureDelta, MemStore, Revision, RevisionDelta, Store};
pub use arbor_txn::{CommitOutcome, CommitRequest};

pub fn model() -> ModelRegistry {
    ModelRegistry::new()
        .with_class(ClassDef::new("Concept", vec![FeatureDef::attribute("term")]))
        .with_class(ClassDef::new(
            "Link",
            vec![FeatureDef::reference("source", false), FeatureDef::reference("target", false)],
        ))
}

pub fn test_config() -> ArborConfig {
    let mut config = ArborConfig::default();
    config.repository.name = "scenario".into();
    config.query.workers = 2;
    config
}

/// A repository over a fresh in-memory store created at t=1.
pub fn setup() -> (Repository, MemStore) {
    setup_with(test_config())
}

pub fn setup_with(config: ArborConfig) -> (Repository, MemStore) {
    arbor_observability::init_tracing();
    let store = MemStore::with_creation_time(Timestamp(1));
    let repo = Repository::open(config, Arc::new(store.clone()), model()).unwrap();
    (repo, store)
}

pub fn concept(tmp: u32, term: &str) -> Revision {
    Revision::new(ObjectId::Temp(tmp), "Concept").with_field("term", FieldValue::Text(term.into()))
}

pub fn link(tmp: u32, source: ObjectId, target: ObjectId) -> Revision {
    Revision::new(ObjectId::Temp(tmp), "Link")
        .with_field("source", FieldValue::Ref(source))
        .with_field("target", FieldValue::Ref(target))
}

pub fn set_term(base: RevisionKey, term: &str) -> RevisionDelta {
    RevisionDelta::new(base).with_op(FeatureDelta::Set {
        feature: "term".into(),
        index: None,
        value: FieldValue::Text(term.into()),
    })
}

pub fn main_head() -> BranchPoint {
    BranchPoint::head(BranchId::MAIN)
}

/// Open a session with one writable view on main.
pub fn writer(repo: &Repository, user: &str) -> ViewId {
    let session = repo.open_session(user, false);
    repo.open_view(session, main_head(), false).unwrap()
}

pub fn head_key(repo: &Repository, id: ObjectId, branch: BranchId) -> RevisionKey {
    repo.revisions()
        .resolve(id, BranchPoint::head(branch))
        .unwrap()
        .unwrap()
        .key()
}

pub fn term_at(repo: &Repository, id: ObjectId, point: BranchPoint) -> Option<String> {
    let resolved = repo.revisions().resolve(id, point).unwrap()?;
    match resolved.revision().get("term") {
        Some(FieldValue::Text(t)) => Some(t.clone()),
        _ => None,
    }
}
