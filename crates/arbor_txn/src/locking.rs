//! Object locking on top of the generic lock table.
//!
//! Keys are object ids, qualified by branch when the repository branches.
//! Holders are live views or the placeholder of a durable lock area whose
//! view is closed. Explicit locks of a view that has a durable locking id are
//! mirrored into its lock area so they survive disconnects and restarts.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use arbor_common::error::{ArborResult, LockError, StorageError};
use arbor_common::schema::ModelRegistry;
use arbor_common::types::{BranchId, BranchPoint, DurableLockingId, LockGrade, LockType, ObjectId, ViewId};
use arbor_storage::{LockArea, LockAreaStore, RevisionStore};

use crate::lock::{LockOutcome, LockState, LockStatsSnapshot, LockTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockKey {
    pub id: ObjectId,
    /// `None` in non-branching repositories.
    pub branch: Option<BranchId>,
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.branch {
            Some(b) => write!(f, "{}@{}", self.id, b),
            None => write!(f, "{}", self.id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LockHolder {
    View(ViewId),
    /// Locks parked for a durable area while no view has it open.
    Durable(DurableLockingId),
}

impl fmt::Display for LockHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockHolder::View(v) => write!(f, "{}", v),
            LockHolder::Durable(id) => write!(f, "durable {}", id),
        }
    }
}

pub type ObjectLockState = LockState<LockKey, LockHolder>;
pub type ObjectLockOutcome = LockOutcome<LockKey, LockHolder>;

/// The view-side facts needed to take explicit locks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockOwner {
    pub view: ViewId,
    pub branch_point: BranchPoint,
    pub read_only: bool,
    pub durable: Option<DurableLockingId>,
}

impl LockOwner {
    pub fn new(view: ViewId, branch_point: BranchPoint) -> Self {
        Self {
            view,
            branch_point,
            read_only: false,
            durable: None,
        }
    }

    pub fn holder(&self) -> LockHolder {
        LockHolder::View(self.view)
    }
}

pub struct LockingManager {
    table: LockTable<LockKey, LockHolder>,
    branching: bool,
    revisions: Arc<RevisionStore>,
    model: Arc<ModelRegistry>,
    areas: Arc<dyn LockAreaStore>,
    /// Durable areas currently attached to a live view.
    open_areas: Mutex<HashMap<DurableLockingId, ViewId>>,
}

impl LockingManager {
    pub fn new(
        branching: bool,
        revisions: Arc<RevisionStore>,
        model: Arc<ModelRegistry>,
        areas: Arc<dyn LockAreaStore>,
    ) -> Self {
        Self {
            table: LockTable::new(),
            branching,
            revisions,
            model,
            areas,
            open_areas: Mutex::new(HashMap::new()),
        }
    }

    pub fn key(&self, id: ObjectId, branch: BranchId) -> LockKey {
        LockKey {
            id,
            branch: self.branching.then_some(branch),
        }
    }

    pub fn keys(&self, ids: &[ObjectId], branch: BranchId) -> Vec<LockKey> {
        ids.iter().map(|id| self.key(*id, branch)).collect()
    }

    pub fn table(&self) -> &LockTable<LockKey, LockHolder> {
        &self.table
    }

    // ── Raw key locking, used by the commit pipeline ───────────────────────

    pub fn lock_keys(
        &self,
        lock_type: LockType,
        holder: &LockHolder,
        keys: &[LockKey],
        timeout: Duration,
    ) -> ObjectLockOutcome {
        self.table.lock(lock_type, holder, keys, timeout)
    }

    pub fn unlock_keys(
        &self,
        lock_type: LockType,
        holder: &LockHolder,
        keys: &[LockKey],
    ) -> Result<Vec<ObjectLockState>, LockError> {
        self.table.unlock(lock_type, holder, keys)
    }

    /// Drop every lock `owner` holds on objects that no longer exist,
    /// including their grades in the owner's lock area.
    pub fn release_detached(&self, owner: &LockOwner, ids: &[ObjectId]) -> ArborResult<Vec<(LockKey, LockType)>> {
        let keys = self.keys(ids, owner.branch_point.branch);
        let released = self.table.unlock_keys(&owner.holder(), &keys);
        if let Some(area) = &owner.durable {
            self.mirror_release(area, &released)?;
        }
        Ok(released)
    }

    pub fn release_all(&self, holder: &LockHolder) -> Vec<(LockKey, LockType)> {
        self.table.unlock_all(holder)
    }

    pub fn has_lock_by_others(&self, lock_type: LockType, holder: &LockHolder, key: &LockKey) -> bool {
        self.table.has_lock_by_others(lock_type, holder, key)
    }

    // ── Explicit locking on behalf of a view ───────────────────────────────

    /// Lock `ids` for `owner`, expanding to the containment subtree when
    /// `recursive`. Granted locks are mirrored into the owner's lock area.
    pub fn lock_objects(
        &self,
        owner: &LockOwner,
        lock_type: LockType,
        ids: &[ObjectId],
        recursive: bool,
        timeout: Duration,
    ) -> ArborResult<ObjectLockOutcome> {
        if owner.read_only && lock_type != LockType::Read {
            return Err(LockError::ReadOnlyView(owner.view).into());
        }
        let ids = if recursive {
            self.expand_containment(ids, owner.branch_point)?
        } else {
            ids.to_vec()
        };
        let keys = self.keys(&ids, owner.branch_point.branch);
        let outcome = self.table.lock(lock_type, &owner.holder(), &keys, timeout);
        match &outcome {
            LockOutcome::Granted(_) => {
                tracing::debug!(view = %owner.view, count = keys.len(), "{} locks granted", lock_type);
                if let Some(area) = &owner.durable {
                    self.areas.update_locks(area, lock_type, &ids, true)?;
                }
            }
            LockOutcome::TimedOut { blocked } => {
                tracing::warn!(view = %owner.view, blocked = blocked.len(), "{} lock request timed out", lock_type);
            }
        }
        Ok(outcome)
    }

    /// Release `lock_type` (or every type when `None`) on `ids` for `owner`.
    /// Releasing a specific type that is not held is an error.
    pub fn unlock_objects(
        &self,
        owner: &LockOwner,
        lock_type: Option<LockType>,
        ids: &[ObjectId],
        recursive: bool,
    ) -> ArborResult<Vec<(LockKey, LockType)>> {
        let ids = if recursive {
            self.expand_containment(ids, owner.branch_point)?
        } else {
            ids.to_vec()
        };
        let keys = self.keys(&ids, owner.branch_point.branch);
        let holder = owner.holder();
        let released = match lock_type {
            Some(t) => {
                self.table.unlock(t, &holder, &keys)?;
                keys.into_iter().map(|k| (k, t)).collect()
            }
            None => self.table.unlock_keys(&holder, &keys),
        };
        if let Some(area) = &owner.durable {
            self.mirror_release(area, &released)?;
        }
        Ok(released)
    }

    /// Release everything `owner` holds.
    pub fn unlock_all_objects(&self, owner: &LockOwner) -> ArborResult<Vec<(LockKey, LockType)>> {
        let released = self.table.unlock_all(&owner.holder());
        if let Some(area) = &owner.durable {
            self.mirror_release(area, &released)?;
        }
        Ok(released)
    }

    fn mirror_release(&self, area: &DurableLockingId, released: &[(LockKey, LockType)]) -> Result<(), StorageError> {
        for lock_type in LockType::ALL {
            let ids: Vec<ObjectId> = released
                .iter()
                .filter(|(_, t)| *t == lock_type)
                .map(|(k, _)| k.id)
                .collect();
            if !ids.is_empty() {
                self.areas.update_locks(area, lock_type, &ids, false)?;
            }
        }
        Ok(())
    }

    /// `ids` plus every object reachable from them through containment
    /// features, resolved at `point`.
    pub fn expand_containment(&self, ids: &[ObjectId], point: BranchPoint) -> ArborResult<Vec<ObjectId>> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        let mut queue: VecDeque<ObjectId> = ids.iter().copied().collect();
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            out.push(id);
            let Some(resolved) = self.revisions.resolve(id, point)? else {
                continue;
            };
            let rev = resolved.revision();
            let Some(class) = self.model.class(&rev.class) else {
                continue;
            };
            for feature in class.containment_features() {
                if let Some(value) = rev.get(&feature.name) {
                    queue.extend(value.references());
                }
            }
        }
        Ok(out)
    }

    // ── Durable lock areas ─────────────────────────────────────────────────

    /// Persist the current locks of `owner`'s view as a new lock area and
    /// attach it to that view.
    pub fn create_lock_area(&self, owner: &LockOwner, user: &str) -> ArborResult<LockArea> {
        let mut grades: BTreeMap<ObjectId, LockGrade> = BTreeMap::new();
        for (key, lock_type) in self.table.locks_of(&owner.holder()) {
            let grade = grades.entry(key.id).or_default();
            *grade = grade.update(lock_type, true);
        }
        let area = self
            .areas
            .create(user, owner.branch_point, owner.read_only, grades)?;
        self.open_areas.lock().insert(area.id.clone(), owner.view);
        tracing::info!(area = %area.id, view = %owner.view, locks = area.lock_count(), "lock area created");
        Ok(area)
    }

    /// Attach the durable area `id` to `view`, handing it the parked locks.
    pub fn open_durable_view(&self, id: &DurableLockingId, view: ViewId, read_only: bool) -> ArborResult<LockArea> {
        let area = self
            .areas
            .get(id)?
            .ok_or_else(|| StorageError::LockAreaNotFound(id.clone()))?;
        if area.read_only != read_only {
            return Err(LockError::ReadOnlyMismatch(id.clone()).into());
        }
        {
            let mut open = self.open_areas.lock();
            if open.contains_key(id) {
                return Err(LockError::AreaAlreadyOpen(id.clone()).into());
            }
            open.insert(id.clone(), view);
        }
        let moved = self
            .table
            .change_holder(&LockHolder::Durable(id.clone()), &LockHolder::View(view));
        tracing::info!(area = %id, view = %view, keys = moved, "durable view reattached");
        Ok(area)
    }

    /// A view closed: park its locks under its durable area, or release them.
    pub fn view_closed(&self, view: ViewId, durable: Option<&DurableLockingId>) -> Vec<(LockKey, LockType)> {
        match durable {
            Some(id) => {
                self.open_areas.lock().remove(id);
                let moved = self
                    .table
                    .change_holder(&LockHolder::View(view), &LockHolder::Durable(id.clone()));
                tracing::debug!(area = %id, view = %view, keys = moved, "locks parked on durable holder");
                Vec::new()
            }
            None => self.table.unlock_all(&LockHolder::View(view)),
        }
    }

    pub fn delete_lock_area(&self, id: &DurableLockingId) -> ArborResult<()> {
        self.areas.delete(id)?;
        let released = self.table.unlock_all(&LockHolder::Durable(id.clone()));
        self.open_areas.lock().remove(id);
        tracing::info!(area = %id, released = released.len(), "lock area deleted");
        Ok(())
    }

    pub fn lock_area(&self, id: &DurableLockingId) -> ArborResult<Option<LockArea>> {
        Ok(self.areas.get(id)?)
    }

    pub fn lock_areas(&self, user: Option<&str>) -> ArborResult<Vec<LockArea>> {
        Ok(self.areas.list(user)?)
    }

    pub fn is_area_open(&self, id: &DurableLockingId) -> bool {
        self.open_areas.lock().contains_key(id)
    }

    /// Re-acquire every persisted grade under its durable holder. Returns the
    /// number of areas reloaded.
    pub fn reload_locks(&self) -> ArborResult<usize> {
        let areas = self.areas.list(None)?;
        for area in &areas {
            let holder = LockHolder::Durable(area.id.clone());
            for (id, grade) in &area.locks {
                let key = self.key(*id, area.branch_point.branch);
                for lock_type in grade.types() {
                    if !self
                        .table
                        .lock(lock_type, &holder, &[key], Duration::ZERO)
                        .is_granted()
                    {
                        tracing::warn!(area = %area.id, key = %key, "could not reload {} lock", lock_type);
                    }
                }
            }
        }
        tracing::info!(areas = areas.len(), "durable locks reloaded");
        Ok(areas.len())
    }

    pub fn stats(&self) -> LockStatsSnapshot {
        self.table.stats()
    }
}
