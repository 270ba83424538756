//! In-memory reference backend.
//!
//! Keeps every revision ever committed as a version-ordered list per
//! `(object, branch)`. Nothing survives a restart; it backs tests and embedded
//! deployments that rebuild their content on start-up.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use arbor_common::error::StorageError;
use arbor_common::types::{BranchId, BranchPoint, ObjectId, Timestamp, Version};

use crate::accessor::{CommitBatch, CommitInfo, Segment, Store, StoreWriter};
use crate::branch::Branch;
use crate::revision::Revision;

type ListKey = (ObjectId, BranchId);

struct MemInner {
    revisions: RwLock<HashMap<ListKey, Vec<Revision>>>,
    branches: RwLock<BTreeMap<BranchId, Branch>>,
    commit_infos: RwLock<Vec<CommitInfo>>,
    last_object_id: AtomicU64,
    created: Timestamp,
}

#[derive(Clone)]
pub struct MemStore {
    inner: Arc<MemInner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::with_creation_time(Timestamp::now())
    }

    pub fn with_creation_time(created: Timestamp) -> Self {
        let mut branches = BTreeMap::new();
        branches.insert(BranchId::MAIN, Branch::main(created));
        Self {
            inner: Arc::new(MemInner {
                revisions: RwLock::new(HashMap::new()),
                branches: RwLock::new(branches),
                commit_infos: RwLock::new(Vec::new()),
                last_object_id: AtomicU64::new(0),
                created,
            }),
        }
    }

    /// Total number of stored revisions, tombstones included.
    pub fn revision_count(&self) -> usize {
        self.inner.revisions.read().values().map(|l| l.len()).sum()
    }

    /// All revisions of `id` on `branch`, oldest first.
    pub fn revisions_of(&self, id: ObjectId, branch: BranchId) -> Vec<Revision> {
        self.inner
            .revisions
            .read()
            .get(&(id, branch))
            .cloned()
            .unwrap_or_default()
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

fn find_valid(list: &[Revision], ts: Timestamp) -> Option<&Revision> {
    if !ts.is_specified() {
        return list.last().filter(|r| r.is_current());
    }
    list.iter().rev().find(|r| r.is_valid(ts))
}

impl Store for MemStore {
    fn read_revision(&self, id: ObjectId, point: BranchPoint) -> Result<Option<Revision>, StorageError> {
        let revisions = self.inner.revisions.read();
        Ok(revisions
            .get(&(id, point.branch))
            .and_then(|list| find_valid(list, point.timestamp))
            .cloned())
    }

    fn read_revision_by_version(
        &self,
        id: ObjectId,
        branch: BranchId,
        version: Version,
    ) -> Result<Option<Revision>, StorageError> {
        let revisions = self.inner.revisions.read();
        Ok(revisions
            .get(&(id, branch))
            .and_then(|list| list.iter().find(|r| r.version == version))
            .cloned())
    }

    fn read_change_set(&self, segments: &[Segment]) -> Result<HashSet<ObjectId>, StorageError> {
        let revisions = self.inner.revisions.read();
        let mut ids = HashSet::new();
        for ((id, branch), list) in revisions.iter() {
            let hit = segments
                .iter()
                .filter(|s| s.branch == *branch)
                .any(|s| list.iter().any(|r| s.covers(r.created)));
            if hit {
                ids.insert(*id);
            }
        }
        Ok(ids)
    }

    fn object_ids(&self) -> Result<Vec<ObjectId>, StorageError> {
        let revisions = self.inner.revisions.read();
        let mut ids: Vec<ObjectId> = revisions
            .keys()
            .map(|(id, _)| *id)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        ids.sort();
        Ok(ids)
    }

    fn load_branches(&self) -> Result<Vec<Branch>, StorageError> {
        Ok(self.inner.branches.read().values().cloned().collect())
    }

    fn create_branch(&self, branch: &Branch) -> Result<(), StorageError> {
        let mut branches = self.inner.branches.write();
        if branches.contains_key(&branch.id) {
            return Err(StorageError::Backend(format!("{} already stored", branch.id)));
        }
        branches.insert(branch.id, branch.clone());
        Ok(())
    }

    fn rename_branch(&self, branch: &Branch) -> Result<(), StorageError> {
        let mut branches = self.inner.branches.write();
        match branches.get_mut(&branch.id) {
            Some(b) => {
                b.name = branch.name.clone();
                Ok(())
            }
            None => Err(StorageError::BranchNotFound(branch.id)),
        }
    }

    fn commit_infos(
        &self,
        branch: Option<BranchId>,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<CommitInfo>, StorageError> {
        let infos = self.inner.commit_infos.read();
        Ok(infos
            .iter()
            .filter(|i| branch.map_or(true, |b| i.branch == b))
            .filter(|i| i.timestamp >= start && (!end.is_specified() || i.timestamp <= end))
            .cloned()
            .collect())
    }

    fn last_object_id(&self) -> u64 {
        self.inner.last_object_id.load(Ordering::SeqCst)
    }

    fn new_object_id(&self) -> ObjectId {
        ObjectId::Persistent(self.inner.last_object_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn creation_time(&self) -> Timestamp {
        self.inner.created
    }

    fn writer(&self) -> Box<dyn StoreWriter> {
        Box::new(MemStoreWriter {
            inner: self.inner.clone(),
            staged: None,
        })
    }
}

struct MemStoreWriter {
    inner: Arc<MemInner>,
    staged: Option<CommitBatch>,
}

impl MemStoreWriter {
    /// Check the whole batch against current contents before touching anything.
    fn validate(batch: &CommitBatch, revisions: &HashMap<ListKey, Vec<Revision>>) -> Result<(), StorageError> {
        for rev in &batch.new_revisions {
            if let Some(list) = revisions.get(&(rev.id, rev.branch)) {
                if !list.is_empty() {
                    return Err(StorageError::ConcurrentModification(format!(
                        "new object {} already exists on {}",
                        rev.id, rev.branch
                    )));
                }
            }
        }
        let successors = batch
            .dirty_revisions
            .iter()
            .map(|r| (r.id, r.branch, r.version))
            .chain(batch.detached.iter().map(|(id, _, v)| (*id, batch.info.branch, *v)));
        for (id, branch, version) in successors {
            let last = revisions
                .get(&(id, branch))
                .and_then(|l| l.last())
                .map(|r| r.version);
            let ok = match last {
                Some(last) => last.next() == version,
                None => version == Version::FIRST,
            };
            if !ok {
                return Err(StorageError::ConcurrentModification(format!(
                    "{} on {} cannot move from {:?} to {}",
                    id, branch, last, version
                )));
            }
        }
        Ok(())
    }

    fn push_successor(list: &mut Vec<Revision>, rev: Revision) {
        if let Some(last) = list.last_mut() {
            if last.revised.is_none() {
                last.revised = Some(rev.created);
            }
        }
        list.push(rev);
    }
}

impl StoreWriter for MemStoreWriter {
    fn write(&mut self, batch: &CommitBatch) -> Result<(), StorageError> {
        if let Some(rev) = batch
            .new_revisions
            .iter()
            .chain(batch.dirty_revisions.iter())
            .find(|r| r.id.is_temporary() || r.references().iter().any(|id| id.is_temporary()))
        {
            return Err(StorageError::Corrupt(format!(
                "temporary id left in revision of {}",
                rev.id
            )));
        }
        self.staged = Some(batch.clone());
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StorageError> {
        let batch = match self.staged.take() {
            Some(b) => b,
            None => return Ok(()),
        };
        let ts = batch.info.timestamp;
        let mut revisions = self.inner.revisions.write();
        Self::validate(&batch, &revisions)?;

        let mut max_id = 0;
        for rev in batch.new_revisions {
            if let ObjectId::Persistent(v) = rev.id {
                max_id = max_id.max(v);
            }
            revisions.entry((rev.id, rev.branch)).or_default().push(rev);
        }
        for rev in batch.dirty_revisions {
            let list = revisions.entry((rev.id, rev.branch)).or_default();
            Self::push_successor(list, rev);
        }
        for (id, class, version) in batch.detached {
            let marker = Revision::detached_marker(id, &class, batch.info.branch, version, ts);
            let list = revisions.entry((id, batch.info.branch)).or_default();
            Self::push_successor(list, marker);
        }
        drop(revisions);

        self.inner.last_object_id.fetch_max(max_id, Ordering::SeqCst);
        self.inner.commit_infos.write().push(batch.info);
        Ok(())
    }

    fn rollback(&mut self) {
        self.staged = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_common::value::{FieldValue, IdMap};

    fn info(ts: i64) -> CommitInfo {
        CommitInfo {
            branch: BranchId::MAIN,
            timestamp: Timestamp(ts),
            previous_timestamp: Timestamp::UNSPECIFIED,
            user: "admin".into(),
            comment: String::new(),
        }
    }

    fn batch(ts: i64) -> CommitBatch {
        CommitBatch {
            info: info(ts),
            new_revisions: vec![],
            dirty_revisions: vec![],
            deltas: vec![],
            detached: vec![],
            id_mappings: IdMap::new(),
        }
    }

    fn new_rev(id: u64, ts: i64) -> Revision {
        let mut r = Revision::new(ObjectId::Persistent(id), "Concept")
            .with_field("term", FieldValue::Text(format!("t{}", id)));
        r.stamp_new(BranchId::MAIN, Timestamp(ts));
        r
    }

    fn commit(store: &MemStore, b: CommitBatch) -> Result<(), StorageError> {
        let mut w = store.writer();
        w.write(&b)?;
        w.commit()
    }

    #[test]
    fn test_commit_then_read_at_time() {
        let store = MemStore::with_creation_time(Timestamp(1));
        let mut b = batch(100);
        b.new_revisions.push(new_rev(1, 100));
        commit(&store, b).unwrap();

        let mut changed = new_rev(1, 100).copy_for_change();
        changed.adjust_for_commit(BranchId::MAIN, Timestamp(200));
        let mut b = batch(200);
        b.dirty_revisions.push(changed);
        commit(&store, b).unwrap();

        let id = ObjectId::Persistent(1);
        let at = |ts| store.read_revision(id, BranchPoint::new(BranchId::MAIN, Timestamp(ts))).unwrap();
        assert!(at(99).is_none());
        assert_eq!(at(150).unwrap().version, Version(1));
        assert_eq!(at(150).unwrap().revised, Some(Timestamp(200)));
        assert_eq!(at(250).unwrap().version, Version(2));
        let head = store.read_revision(id, BranchPoint::head(BranchId::MAIN)).unwrap().unwrap();
        assert_eq!(head.version, Version(2));
        assert_eq!(store.last_object_id(), 1);
        assert_eq!(store.commit_infos(None, Timestamp(0), Timestamp::UNSPECIFIED).unwrap().len(), 2);
    }

    #[test]
    fn test_duplicate_version_is_concurrent_modification() {
        let store = MemStore::with_creation_time(Timestamp(1));
        let mut b = batch(100);
        b.new_revisions.push(new_rev(1, 100));
        commit(&store, b).unwrap();

        let mut changed = new_rev(1, 100).copy_for_change();
        changed.adjust_for_commit(BranchId::MAIN, Timestamp(200));
        let mut b = batch(200);
        b.dirty_revisions.push(changed.clone());
        commit(&store, b).unwrap();

        let mut b = batch(300);
        b.dirty_revisions.push(changed);
        assert!(matches!(
            commit(&store, b),
            Err(StorageError::ConcurrentModification(_))
        ));
        assert_eq!(store.revision_count(), 2);
    }

    #[test]
    fn test_detach_writes_tombstone() {
        let store = MemStore::with_creation_time(Timestamp(1));
        let mut b = batch(100);
        b.new_revisions.push(new_rev(1, 100));
        commit(&store, b).unwrap();
        let mut b = batch(200);
        b.detached.push((ObjectId::Persistent(1), "Concept".into(), Version(2)));
        commit(&store, b).unwrap();
        let head = store
            .read_revision(ObjectId::Persistent(1), BranchPoint::head(BranchId::MAIN))
            .unwrap()
            .unwrap();
        assert!(head.detached);
        assert_eq!(head.version, Version(2));
    }

    #[test]
    fn test_temporary_ids_rejected_on_write() {
        let store = MemStore::new();
        let mut b = batch(100);
        b.new_revisions.push(Revision::new(ObjectId::Temp(1), "Concept"));
        let mut w = store.writer();
        assert!(matches!(w.write(&b), Err(StorageError::Corrupt(_))));
    }

    #[test]
    fn test_rollback_discards_staged_batch() {
        let store = MemStore::new();
        let mut b = batch(100);
        b.new_revisions.push(new_rev(1, 100));
        let mut w = store.writer();
        w.write(&b).unwrap();
        w.rollback();
        w.commit().unwrap();
        assert_eq!(store.revision_count(), 0);
    }

    #[test]
    fn test_change_set_by_segment() {
        let store = MemStore::with_creation_time(Timestamp(1));
        let mut b = batch(100);
        b.new_revisions.push(new_rev(1, 100));
        commit(&store, b).unwrap();
        let mut b = batch(200);
        b.new_revisions.push(new_rev(2, 200));
        commit(&store, b).unwrap();
        let ids = store
            .read_change_set(&[Segment::new(BranchId::MAIN, Timestamp(150), Timestamp::UNSPECIFIED)])
            .unwrap();
        assert_eq!(ids, HashSet::from([ObjectId::Persistent(2)]));
    }
}
