use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use arbor_common::error::{CommitError, StorageError};
use arbor_common::schema::{ClassDef, FeatureDef, ModelRegistry};
use arbor_common::types::{
    BranchId, BranchPoint, LockType, ObjectId, RevisionKey, SessionId, Timestamp, Version, ViewId,
};
use arbor_common::value::FieldValue;
use arbor_storage::{
    Branch, BranchTree, CommitBatch, CommitInfo, FeatureDelta, MemLockAreaStore, MemStore, Revision, RevisionDelta,
    RevisionStore, Segment, Store, StoreWriter,
};

use crate::commit::{CommitContext, CommitOutcome, CommitPipeline, CommitRequest, CommitSettings, CommitState};
use crate::handler::{AccessHandlers, WriteAccessHandler};
use crate::locking::{LockHolder, LockOwner, LockingManager};
use crate::timestamp::TimestampAuthority;

// ── Fixture ─────────────────────────────────────────────────────────────────

/// Store wrapper whose writer fails on `commit` while `fail` is set.
#[derive(Clone)]
struct FailingStore {
    inner: MemStore,
    fail: Arc<AtomicBool>,
}

struct FailingWriter {
    inner: Box<dyn StoreWriter>,
    fail: Arc<AtomicBool>,
}

impl StoreWriter for FailingWriter {
    fn write(&mut self, batch: &CommitBatch) -> Result<(), StorageError> {
        self.inner.write(batch)
    }

    fn commit(&mut self) -> Result<(), StorageError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("injected failure".into()));
        }
        self.inner.commit()
    }

    fn rollback(&mut self) {
        self.inner.rollback()
    }
}

impl Store for FailingStore {
    fn read_revision(&self, id: ObjectId, point: BranchPoint) -> Result<Option<Revision>, StorageError> {
        self.inner.read_revision(id, point)
    }

    fn read_revision_by_version(
        &self,
        id: ObjectId,
        branch: BranchId,
        version: Version,
    ) -> Result<Option<Revision>, StorageError> {
        self.inner.read_revision_by_version(id, branch, version)
    }

    fn read_change_set(&self, segments: &[Segment]) -> Result<std::collections::HashSet<ObjectId>, StorageError> {
        self.inner.read_change_set(segments)
    }

    fn object_ids(&self) -> Result<Vec<ObjectId>, StorageError> {
        self.inner.object_ids()
    }

    fn load_branches(&self) -> Result<Vec<Branch>, StorageError> {
        self.inner.load_branches()
    }

    fn create_branch(&self, branch: &Branch) -> Result<(), StorageError> {
        self.inner.create_branch(branch)
    }

    fn rename_branch(&self, branch: &Branch) -> Result<(), StorageError> {
        self.inner.rename_branch(branch)
    }

    fn commit_infos(
        &self,
        branch: Option<BranchId>,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<CommitInfo>, StorageError> {
        self.inner.commit_infos(branch, start, end)
    }

    fn last_object_id(&self) -> u64 {
        self.inner.last_object_id()
    }

    fn new_object_id(&self) -> ObjectId {
        self.inner.new_object_id()
    }

    fn creation_time(&self) -> Timestamp {
        self.inner.creation_time()
    }

    fn writer(&self) -> Box<dyn StoreWriter> {
        Box::new(FailingWriter {
            inner: self.inner.writer(),
            fail: self.fail.clone(),
        })
    }
}

struct Fixture {
    store: FailingStore,
    tree: Arc<BranchTree>,
    revisions: Arc<RevisionStore>,
    locking: Arc<LockingManager>,
    timestamps: Arc<TimestampAuthority>,
    handlers: Arc<AccessHandlers>,
    pipeline: Arc<CommitPipeline>,
}

fn model() -> ModelRegistry {
    ModelRegistry::new()
        .with_class(ClassDef::new("Concept", vec![FeatureDef::attribute("term")]))
        .with_class(ClassDef::new(
            "Relationship",
            vec![FeatureDef::reference("source", false), FeatureDef::reference("destination", false)],
        ))
        .with_class(ClassDef::new(
            "Folder",
            vec![FeatureDef::attribute("name"), FeatureDef::containment("children", true)],
        ))
}

fn setup_with(settings: CommitSettings) -> Fixture {
    let store = FailingStore {
        inner: MemStore::with_creation_time(Timestamp(1)),
        fail: Arc::new(AtomicBool::new(false)),
    };
    let tree = Arc::new(BranchTree::new(Timestamp(1)));
    let revisions = Arc::new(RevisionStore::new(Arc::new(store.clone()), tree.clone()));
    let model = Arc::new(model());
    let locking = Arc::new(LockingManager::new(
        true,
        revisions.clone(),
        model.clone(),
        Arc::new(MemLockAreaStore::new()),
    ));
    let timestamps = Arc::new(TimestampAuthority::with_system_clock(
        Timestamp(1),
        false,
        Duration::from_millis(50),
    ));
    let handlers = Arc::new(AccessHandlers::new());
    let pipeline = Arc::new(CommitPipeline::new(
        settings,
        revisions.clone(),
        locking.clone(),
        timestamps.clone(),
        handlers.clone(),
        model,
    ));
    Fixture {
        store,
        tree,
        revisions,
        locking,
        timestamps,
        handlers,
        pipeline,
    }
}

fn setup() -> Fixture {
    setup_with(CommitSettings::default())
}

fn tmp(n: u32) -> ObjectId {
    ObjectId::Temp(n)
}

fn text(s: &str) -> FieldValue {
    FieldValue::Text(s.into())
}

fn concept(id: ObjectId, term: &str) -> Revision {
    Revision::new(id, "Concept").with_field("term", text(term))
}

fn relationship(id: ObjectId, source: ObjectId, destination: ObjectId) -> Revision {
    Revision::new(id, "Relationship")
        .with_field("source", FieldValue::Ref(source))
        .with_field("destination", FieldValue::Ref(destination))
}

fn set_term(base: RevisionKey, term: &str) -> RevisionDelta {
    RevisionDelta::new(base).with_op(FeatureDelta::Set {
        feature: "term".into(),
        index: None,
        value: text(term),
    })
}

fn owner_on(view: u64, branch: BranchId) -> LockOwner {
    LockOwner::new(ViewId(view), BranchPoint::head(branch))
}

fn request(view: u64) -> CommitRequest {
    CommitRequest::new(SessionId(1), owner_on(view, BranchId::MAIN), "tester")
}

impl Fixture {
    fn create(&self, revisions: Vec<Revision>) -> CommitOutcome {
        let mut req = request(1);
        for r in revisions {
            req = req.with_new_object(r);
        }
        self.pipeline.commit(req).unwrap()
    }

    fn head_on(&self, id: ObjectId, branch: BranchId) -> Option<Arc<Revision>> {
        self.revisions
            .resolve(id, BranchPoint::head(branch))
            .unwrap()
            .map(|r| r.revision().clone())
    }

    fn head(&self, id: ObjectId) -> Arc<Revision> {
        self.head_on(id, BranchId::MAIN).unwrap()
    }

    /// Fork time that is never behind the last issued commit timestamp.
    fn fork_time(&self) -> Timestamp {
        Timestamp::now().max(self.timestamps.last_issued())
    }

    fn change_term(&self, view: u64, id: ObjectId, term: &str) -> Result<CommitOutcome, CommitError> {
        let base = self.head(id).key();
        self.pipeline.commit(request(view).with_delta(set_term(base, term)))
    }
}

// ── Commit basics ───────────────────────────────────────────────────────────

#[test]
fn test_new_objects_get_permanent_ids_and_references_follow() {
    let f = setup();
    let out = f.create(vec![concept(tmp(1), "heart"), relationship(tmp(2), tmp(1), tmp(1))]);
    assert_eq!(out.id_mappings.len(), 2);
    let c = out.id_mappings[&tmp(1)];
    let r = out.id_mappings[&tmp(2)];
    assert!(!c.is_temporary() && !r.is_temporary());
    assert_ne!(c, r);

    let rel = f.head(r);
    assert_eq!(rel.get("source"), Some(&FieldValue::Ref(c)));
    assert_eq!(rel.version, Version::FIRST);
    assert_eq!(rel.created, out.timestamp());
    assert!(out.timestamp() > out.previous_timestamp());
    assert_eq!(f.timestamps.last_finished(), out.timestamp());
}

#[test]
fn test_version_increments_without_gaps() {
    let f = setup();
    let id = f.create(vec![concept(tmp(1), "v1")]).id_mappings[&tmp(1)];
    for n in 2..=6 {
        let out = f.change_term(1, id, &format!("v{}", n)).unwrap();
        assert_eq!(out.changed, vec![RevisionKey::new(id, BranchId::MAIN, Version(n))]);
    }
    let history = f.store.inner.revisions_of(id, BranchId::MAIN);
    let versions: Vec<u32> = history.iter().map(|r| r.version.0).collect();
    assert_eq!(versions, vec![1, 2, 3, 4, 5, 6]);
    for pair in history.windows(2) {
        assert_eq!(pair[0].revised, Some(pair[1].created));
    }
    assert_eq!(f.head(id).get("term"), Some(&text("v6")));
}

#[test]
fn test_stale_base_is_a_conflict() {
    let f = setup();
    let id = f.create(vec![concept(tmp(1), "v1")]).id_mappings[&tmp(1)];
    f.change_term(1, id, "v2").unwrap();
    f.change_term(1, id, "v3").unwrap();
    let v3 = f.head(id).key();
    assert_eq!(v3.version, Version(3));

    let first = f.pipeline.commit(request(1).with_delta(set_term(v3, "from t1"))).unwrap();
    assert_eq!(first.changed[0].version, Version(4));
    let err = f
        .pipeline
        .commit(request(2).with_delta(set_term(v3, "from t2")))
        .unwrap_err();
    assert!(matches!(err, CommitError::ConcurrentModification { .. }), "{err}");
    assert_eq!(f.head(id).get("term"), Some(&text("from t1")));
    assert_eq!(f.locking.stats().locked_keys, 0);
    assert_eq!(f.pipeline.stats().conflicts, 1);
}

#[test]
fn test_stale_base_applied_on_head_when_allowed() {
    let f = setup_with(CommitSettings {
        allow_commit_with_stale_revisions: true,
        ..CommitSettings::default()
    });
    let id = f.create(vec![concept(tmp(1), "v1")]).id_mappings[&tmp(1)];
    let v1 = f.head(id).key();
    f.change_term(1, id, "v2").unwrap();
    let out = f.pipeline.commit(request(2).with_delta(set_term(v1, "late"))).unwrap();
    assert_eq!(out.changed[0].version, Version(3));
    assert_eq!(f.head(id).get("term"), Some(&text("late")));
}

#[test]
fn test_stale_base_is_a_conflict_without_passive_updates() {
    let f = setup_with(CommitSettings {
        allow_commit_with_stale_revisions: true,
        ..CommitSettings::default()
    });
    let id = f.create(vec![concept(tmp(1), "v1")]).id_mappings[&tmp(1)];
    let v1 = f.head(id).key();
    f.change_term(1, id, "v2").unwrap();
    let err = f
        .pipeline
        .commit(request(2).with_passive_updates(false).with_delta(set_term(v1, "late")))
        .unwrap_err();
    assert!(matches!(err, CommitError::ConcurrentModification { .. }), "{err}");
    assert_eq!(f.head(id).version, Version(2));
    assert_eq!(f.head(id).get("term"), Some(&text("v2")));
}

// ── Referential integrity ───────────────────────────────────────────────────

#[test]
fn test_detach_with_live_reference_is_rejected() {
    let f = setup();
    let out = f.create(vec![
        concept(tmp(1), "target"),
        concept(tmp(2), "other"),
        relationship(tmp(3), tmp(2), tmp(1)),
    ]);
    let target = out.id_mappings[&tmp(1)];
    let rel = out.id_mappings[&tmp(3)];
    let before = f.head(rel).version;

    let err = f.pipeline.commit(request(1).with_detached(target)).unwrap_err();
    assert!(matches!(err, CommitError::ReferentialIntegrityViolation(_)), "{err}");
    assert!(f.head_on(target, BranchId::MAIN).is_some());
    assert_eq!(f.head(rel).version, before);
    assert_eq!(f.pipeline.stats().integrity_violations, 1);

    // detaching the referrer along with the target is fine
    let ok = f
        .pipeline
        .commit(request(1).with_detached(target).with_detached(rel))
        .unwrap();
    assert_eq!(ok.detached.len(), 2);
    assert!(f.head_on(target, BranchId::MAIN).is_none());
    assert!(f.head_on(rel, BranchId::MAIN).is_none());
    let tombstone = f.store.inner.revisions_of(target, BranchId::MAIN);
    assert!(tombstone.last().unwrap().detached);
    assert_eq!(tombstone.last().unwrap().version, Version(2));
}

#[test]
fn test_reference_to_object_detached_in_same_commit() {
    let f = setup();
    let out = f.create(vec![concept(tmp(1), "a"), concept(tmp(2), "b")]);
    let a = out.id_mappings[&tmp(1)];
    let b = out.id_mappings[&tmp(2)];
    let err = f
        .pipeline
        .commit(
            request(1)
                .with_detached(a)
                .with_new_object(relationship(tmp(9), b, a)),
        )
        .unwrap_err();
    match err {
        CommitError::ReferentialIntegrityViolation(msg) => {
            assert!(msg.contains("deletes an object and adds a reference to it"))
        }
        other => panic!("unexpected {other}"),
    }
}

#[test]
fn test_dirty_revision_pointing_at_detached_object_is_caught() {
    let f = setup();
    let out = f.create(vec![
        concept(tmp(1), "a"),
        concept(tmp(2), "b"),
        relationship(tmp(3), tmp(1), tmp(1)),
    ]);
    let a = out.id_mappings[&tmp(1)];
    let b = out.id_mappings[&tmp(2)];
    let rel = out.id_mappings[&tmp(3)];
    // retarget one end only; the other still points at `a`
    let delta = RevisionDelta::new(f.head(rel).key()).with_op(FeatureDelta::Set {
        feature: "destination".into(),
        index: None,
        value: FieldValue::Ref(b),
    });
    let err = f
        .pipeline
        .commit(request(1).with_delta(delta).with_detached(a))
        .unwrap_err();
    assert!(matches!(err, CommitError::ReferentialIntegrityViolation(_)));
}

// ── Rollback ────────────────────────────────────────────────────────────────

#[test]
fn test_storage_failure_leaves_no_trace() {
    let f = setup();
    let id = f.create(vec![concept(tmp(1), "v1")]).id_mappings[&tmp(1)];
    let head_before = f.head(id);
    let finished_before = f.timestamps.last_finished();
    let infos_before = f
        .store
        .commit_infos(None, Timestamp::UNSPECIFIED, Timestamp::UNSPECIFIED)
        .unwrap()
        .len();

    f.store.fail.store(true, Ordering::SeqCst);
    let err = f.change_term(1, id, "v2").unwrap_err();
    assert!(matches!(err, CommitError::Storage(_)));
    assert_eq!(err.rollback_message(), "Storage failure: Backend failure: injected failure");

    assert_eq!(f.head(id), head_before);
    assert_eq!(f.store.inner.revisions_of(id, BranchId::MAIN).len(), 1);
    assert_eq!(f.locking.stats().locked_keys, 0);
    assert_eq!(f.timestamps.last_finished(), finished_before);
    assert_eq!(f.timestamps.stats().failed, 1);
    assert_eq!(f.timestamps.stats().running, 0);
    assert_eq!(
        f.store
            .commit_infos(None, Timestamp::UNSPECIFIED, Timestamp::UNSPECIFIED)
            .unwrap()
            .len(),
        infos_before
    );

    // no version was consumed
    f.store.fail.store(false, Ordering::SeqCst);
    let out = f.change_term(1, id, "v2").unwrap();
    assert_eq!(out.changed[0].version, Version(2));
    assert!(f.timestamps.last_finished() > finished_before);
}

#[test]
fn test_rollback_runs_once() {
    let f = setup();
    let id = f.create(vec![concept(tmp(1), "v1")]).id_mappings[&tmp(1)];
    let v1 = f.head(id).key();
    f.change_term(1, id, "v2").unwrap();

    let mut ctx = f.pipeline.prepare(request(2).with_delta(set_term(v1, "stale")));
    let err = f.pipeline.execute(&mut ctx).unwrap_err();
    assert_eq!(ctx.state(), CommitState::RolledBack);
    let first_reason = ctx.rollback_reason().map(str::to_string);
    assert_eq!(first_reason.as_deref(), Some(err.rollback_message().as_str()));

    f.pipeline.rollback(&mut ctx, "second attempt");
    assert_eq!(ctx.rollback_reason().map(str::to_string), first_reason);
    assert_eq!(f.timestamps.stats().failed, 1);

    // a rolled back context cannot be executed again
    let again = f.pipeline.execute(&mut ctx).unwrap_err();
    assert!(matches!(again, CommitError::InvalidTransition { .. }));
}

#[test]
fn test_state_machine_transitions() {
    use CommitState::*;
    assert!(Prepared.can_advance_to(Locked));
    assert!(Written.can_advance_to(Committed));
    assert!(!Prepared.can_advance_to(Validated));
    assert!(!Committed.can_advance_to(RolledBack));
    assert!(Validated.can_advance_to(RolledBack));
    assert!(!RolledBack.can_advance_to(RolledBack));
}

// ── Handlers ────────────────────────────────────────────────────────────────

#[derive(Default)]
struct RecordingHandler {
    veto: AtomicBool,
    after: AtomicUsize,
    rollbacks: AtomicUsize,
}

impl WriteAccessHandler for RecordingHandler {
    fn before_commit(&self, ctx: &CommitContext) -> Result<(), String> {
        assert_eq!(ctx.state(), CommitState::Validated);
        if self.veto.load(Ordering::SeqCst) {
            return Err("terms must not be empty".into());
        }
        Ok(())
    }

    fn after_commit(&self, _ctx: &CommitContext) -> Result<(), String> {
        self.after.fetch_add(1, Ordering::SeqCst);
        Err("index unavailable".into())
    }

    fn on_rollback(&self, _ctx: &CommitContext, _reason: &str) -> Result<(), String> {
        self.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[test]
fn test_before_commit_handler_can_veto() {
    let f = setup();
    let handler = Arc::new(RecordingHandler::default());
    f.handlers.add_write_handler(handler.clone());

    // after_commit errors are only logged
    let id = f.create(vec![concept(tmp(1), "v1")]).id_mappings[&tmp(1)];
    assert_eq!(handler.after.load(Ordering::SeqCst), 1);

    handler.veto.store(true, Ordering::SeqCst);
    let err = f.change_term(1, id, "").unwrap_err();
    match &err {
        CommitError::Vetoed(msg) => assert_eq!(msg, "terms must not be empty"),
        other => panic!("unexpected {other}"),
    }
    assert_eq!(handler.rollbacks.load(Ordering::SeqCst), 1);
    assert_eq!(f.head(id).version, Version::FIRST);
    assert_eq!(f.pipeline.stats().vetoes, 1);
}

// ── Locking ─────────────────────────────────────────────────────────────────

#[test]
fn test_commit_times_out_on_foreign_write_lock() {
    let f = setup_with(CommitSettings {
        lock_timeout: Duration::from_millis(20),
        ..CommitSettings::default()
    });
    let id = f.create(vec![concept(tmp(1), "v1")]).id_mappings[&tmp(1)];
    let other = owner_on(9, BranchId::MAIN);
    assert!(f
        .locking
        .lock_objects(&other, LockType::Write, &[id], false, Duration::ZERO)
        .unwrap()
        .is_granted());

    let err = f.change_term(1, id, "v2").unwrap_err();
    assert!(matches!(err, CommitError::LockTimeout { timeout_ms: 20 }));
    assert_eq!(f.timestamps.stats().failed, 0, "no timestamp was issued");
    let key = f.locking.key(id, BranchId::MAIN);
    assert_eq!(f.locking.table().writer_of(&key), Some(LockHolder::View(ViewId(9))));
}

#[test]
fn test_own_explicit_lock_survives_commit() {
    let f = setup();
    let id = f.create(vec![concept(tmp(1), "v1")]).id_mappings[&tmp(1)];
    let owner = owner_on(1, BranchId::MAIN);
    assert!(f
        .locking
        .lock_objects(&owner, LockType::Write, &[id], false, Duration::ZERO)
        .unwrap()
        .is_granted());
    f.change_term(1, id, "v2").unwrap();
    let key = f.locking.key(id, BranchId::MAIN);
    assert_eq!(f.locking.table().writer_of(&key), Some(LockHolder::View(ViewId(1))));
}

#[test]
fn test_rollback_keeps_locks_taken_before_the_commit() {
    let f = setup();
    let id = f.create(vec![concept(tmp(1), "v1")]).id_mappings[&tmp(1)];
    let owner = owner_on(1, BranchId::MAIN);
    assert!(f
        .locking
        .lock_objects(&owner, LockType::Write, &[id], false, Duration::ZERO)
        .unwrap()
        .is_granted());
    let key = f.locking.key(id, BranchId::MAIN);

    f.store.fail.store(true, Ordering::SeqCst);
    let err = f.pipeline.commit(request(1).with_detached(id)).unwrap_err();
    assert!(matches!(err, CommitError::Storage(_)));
    assert_eq!(f.locking.table().writer_of(&key), Some(LockHolder::View(ViewId(1))));
    assert!(f.head_on(id, BranchId::MAIN).is_some());

    // exactly one write level is left: a single unlock frees the key
    f.locking.unlock_objects(&owner, Some(LockType::Write), &[id], false).unwrap();
    assert!(f.locking.table().lock_state(&key).is_none());
}

#[test]
fn test_detach_clears_durable_area_grades() {
    let f = setup();
    let id = f.create(vec![concept(tmp(1), "v1")]).id_mappings[&tmp(1)];
    let mut owner = owner_on(1, BranchId::MAIN);
    let area = f.locking.create_lock_area(&owner, "tester").unwrap();
    owner.durable = Some(area.id.clone());
    assert!(f
        .locking
        .lock_objects(&owner, LockType::Write, &[id], false, Duration::ZERO)
        .unwrap()
        .is_granted());
    assert_eq!(f.locking.lock_area(&area.id).unwrap().unwrap().lock_count(), 1);

    f.pipeline
        .commit(CommitRequest::new(SessionId(1), owner, "tester").with_detached(id))
        .unwrap();
    let key = f.locking.key(id, BranchId::MAIN);
    assert!(f.locking.table().lock_state(&key).is_none());
    assert!(f.locking.lock_area(&area.id).unwrap().unwrap().locks.is_empty());
}

/// Reports when the commit holds its locks, then stalls it for a moment.
struct StallBeforeWrite {
    locked: Mutex<Option<std::sync::mpsc::Sender<()>>>,
}

impl WriteAccessHandler for StallBeforeWrite {
    fn before_commit(&self, _ctx: &CommitContext) -> Result<(), String> {
        if let Some(tx) = self.locked.lock().take() {
            let _ = tx.send(());
            std::thread::sleep(Duration::from_millis(20));
        }
        Ok(())
    }
}

#[test]
fn test_commit_is_visible_once_its_locks_are_released() {
    let f = setup();
    let id = f.create(vec![concept(tmp(1), "v1")]).id_mappings[&tmp(1)];
    let (tx, rx) = std::sync::mpsc::channel();
    f.handlers.add_write_handler(Arc::new(StallBeforeWrite {
        locked: Mutex::new(Some(tx)),
    }));

    let base = f.head(id).key();
    let pipeline = f.pipeline.clone();
    let committer = std::thread::spawn(move || pipeline.commit(request(1).with_delta(set_term(base, "v2"))));
    rx.recv().unwrap();

    let key = f.locking.key(id, BranchId::MAIN);
    let waiter = LockHolder::View(ViewId(9));
    assert!(f
        .locking
        .lock_keys(LockType::Write, &waiter, &[key], Duration::from_secs(5))
        .is_granted());
    let seen = f.timestamps.last_finished();
    let out = committer.join().unwrap().unwrap();
    assert!(seen >= out.timestamp(), "lock released before {} was finished", out.timestamp());
}

#[test]
fn test_locks_on_new_objects_and_auto_release() {
    let f = setup();
    let out = f
        .pipeline
        .commit(
            request(1)
                .with_new_object(concept(tmp(1), "locked"))
                .with_lock_on_new_object(tmp(1), LockType::Write),
        )
        .unwrap();
    let id = out.id_mappings[&tmp(1)];
    assert_eq!(out.new_object_locks.len(), 1);
    let key = f.locking.key(id, BranchId::MAIN);
    assert_eq!(f.locking.table().writer_of(&key), Some(LockHolder::View(ViewId(1))));

    let out = f
        .pipeline
        .commit(
            request(1)
                .with_delta(set_term(f.head(id).key(), "v2"))
                .with_auto_release(true),
        )
        .unwrap();
    assert_eq!(out.released_locks, vec![(key, LockType::Write)]);
    assert!(f.locking.table().lock_state(&key).is_none());
}

/// Runs a second commit while the first one holds its locks.
struct NestedCommit {
    pipeline: Mutex<Option<Arc<CommitPipeline>>>,
    nested: Mutex<Option<CommitRequest>>,
    result: Mutex<Option<Result<CommitOutcome, CommitError>>>,
}

impl WriteAccessHandler for NestedCommit {
    fn before_commit(&self, _ctx: &CommitContext) -> Result<(), String> {
        let pipeline = self.pipeline.lock().clone();
        if let (Some(pipeline), Some(req)) = (pipeline, self.nested.lock().take()) {
            *self.result.lock() = Some(pipeline.commit(req));
        }
        Ok(())
    }
}

#[test]
fn test_containment_change_under_moving_container_is_a_cycle() {
    let f = setup();
    // root contains mid, mid contains leaf
    let out = f.create(vec![
        Revision::new(tmp(1), "Folder")
            .with_field("name", text("root"))
            .with_field("children", FieldValue::List(vec![FieldValue::Ref(tmp(2))])),
        Revision::new(tmp(2), "Folder")
            .with_field("name", text("mid"))
            .with_field("children", FieldValue::List(vec![FieldValue::Ref(tmp(3))]))
            .with_container(tmp(1)),
        Revision::new(tmp(3), "Folder")
            .with_field("name", text("leaf"))
            .with_container(tmp(2)),
    ]);
    let root = out.id_mappings[&tmp(1)];
    let mid = out.id_mappings[&tmp(2)];
    let leaf = out.id_mappings[&tmp(3)];
    assert_eq!(f.head(leaf).container, Some(mid));

    let handler = Arc::new(NestedCommit {
        pipeline: Mutex::new(Some(f.pipeline.clone())),
        nested: Mutex::new(Some(request(2).with_delta(
            RevisionDelta::new(f.head(leaf).key()).with_container(Some(root)),
        ))),
        result: Mutex::new(None),
    });
    f.handlers.add_write_handler(handler.clone());

    // view 1 rewires mid's children while view 2 tries to move leaf
    f.pipeline
        .commit(request(1).with_delta(
            RevisionDelta::new(f.head(mid).key()).with_op(FeatureDelta::Clear {
                feature: "children".into(),
            }),
        ))
        .unwrap();

    let nested = handler.result.lock().take().unwrap();
    assert!(matches!(nested, Err(CommitError::ContainmentCycle(_))));
    assert_eq!(f.pipeline.stats().containment_cycles, 1);
    assert_eq!(f.locking.stats().locked_keys, 0);
    *handler.pipeline.lock() = None;
}

// ── Branches ────────────────────────────────────────────────────────────────

#[test]
fn test_branch_commit_starts_at_version_one() {
    let f = setup();
    let id = f.create(vec![concept(tmp(1), "main")]).id_mappings[&tmp(1)];
    let base = f.head(id).key();
    let b = f
        .tree
        .create_branch(BranchId::MAIN, "task", Timestamp::UNSPECIFIED, f.fork_time(), |_| Ok(()))
        .unwrap()
        .id;
    let on_branch = |view| CommitRequest::new(SessionId(1), owner_on(view, b), "tester");

    let out = f
        .pipeline
        .commit(on_branch(1).with_delta(set_term(base, "branch")))
        .unwrap();
    assert_eq!(out.changed, vec![RevisionKey::new(id, b, Version::FIRST)]);
    assert_eq!(f.head_on(id, b).unwrap().get("term"), Some(&text("branch")));
    assert_eq!(f.head(id).get("term"), Some(&text("main")));

    // someone else already created the first revision on the branch
    let err = f
        .pipeline
        .commit(on_branch(2).with_delta(set_term(base, "late")))
        .unwrap_err();
    assert!(matches!(err, CommitError::ConcurrentModification { .. }));
}

#[test]
fn test_detach_on_branch_leaves_main_untouched() {
    let f = setup();
    let id = f.create(vec![concept(tmp(1), "main")]).id_mappings[&tmp(1)];
    let b = f
        .tree
        .create_branch(BranchId::MAIN, "task", Timestamp::UNSPECIFIED, f.fork_time(), |_| Ok(()))
        .unwrap()
        .id;
    f.pipeline
        .commit(CommitRequest::new(SessionId(1), owner_on(1, b), "tester").with_detached(id))
        .unwrap();
    assert!(f.head_on(id, b).is_none());
    assert!(f.head_on(id, BranchId::MAIN).is_some());
}

// ── Concurrency ─────────────────────────────────────────────────────────────

#[test]
fn test_concurrent_commits_on_disjoint_objects() {
    let f = setup();
    let out = f.create((1..=4).map(|n| concept(tmp(n), "v1")).collect());
    let ids: Vec<ObjectId> = (1..=4).map(|n| out.id_mappings[&tmp(n)]).collect();
    let f = Arc::new(f);
    let handles: Vec<_> = ids
        .iter()
        .enumerate()
        .map(|(i, id)| {
            let f = f.clone();
            let id = *id;
            std::thread::spawn(move || {
                let mut stamps = Vec::new();
                for n in 0..10 {
                    let out = f.change_term(i as u64 + 1, id, &format!("t{}", n)).unwrap();
                    stamps.push(out.timestamp());
                }
                stamps
            })
        })
        .collect();
    let mut all: Vec<Timestamp> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
    let count = all.len();
    all.sort();
    all.dedup();
    assert_eq!(all.len(), count, "commit timestamps must be unique");
    for id in ids {
        assert_eq!(f.head(id).version, Version(11));
    }
    assert_eq!(f.timestamps.last_finished(), *all.last().unwrap());
    assert_eq!(f.locking.stats().locked_keys, 0);
}

#[test]
fn test_racing_commits_on_one_object_never_both_win() {
    let f = Arc::new(setup());
    let id = f.create(vec![concept(tmp(1), "v1")]).id_mappings[&tmp(1)];
    let base = f.head(id).key();
    let handles: Vec<_> = (1..=4)
        .map(|view| {
            let f = f.clone();
            std::thread::spawn(move || {
                f.pipeline
                    .commit(request(view).with_delta(set_term(base, &format!("view {}", view))))
                    .is_ok()
            })
        })
        .collect();
    let wins = handles.into_iter().map(|h| h.join().unwrap()).filter(|w| *w).count();
    assert_eq!(wins, 1);
    assert_eq!(f.head(id).version, Version(2));
}
