//! Branch tree.
//!
//! Branches form a tree rooted at `BranchId::MAIN`. Creating a branch copies
//! nothing: a branch is just `(parent, base timestamp)`, and lookups that find
//! no local revision fall through to the parent at the base timestamp.
//!
//! The tree is append-only. Branches are never deleted, only renamed, so
//! readers take a shared lock and creation is serialized by a dedicated mutex.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use arbor_common::error::{ArborError, ArborResult, BranchError, StorageError};
use arbor_common::types::{BranchId, BranchPoint, Timestamp};

pub const MAIN_BRANCH_NAME: &str = "MAIN";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    pub id: BranchId,
    pub name: String,
    /// Parent branch point; `None` only for the main branch.
    pub base: Option<BranchPoint>,
    pub created: Timestamp,
}

impl Branch {
    pub fn main(created: Timestamp) -> Self {
        Self {
            id: BranchId::MAIN,
            name: MAIN_BRANCH_NAME.to_string(),
            base: None,
            created,
        }
    }

    pub fn is_main(&self) -> bool {
        self.base.is_none()
    }

    pub fn parent(&self) -> Option<BranchId> {
        self.base.map(|b| b.branch)
    }

    pub fn head(&self) -> BranchPoint {
        BranchPoint::head(self.id)
    }
}

/// `min` where an unspecified timestamp means "head", i.e. later than everything.
pub fn min_ts(a: Timestamp, b: Timestamp) -> Timestamp {
    match (a.is_specified(), b.is_specified()) {
        (false, _) => b,
        (_, false) => a,
        _ => a.min(b),
    }
}

/// `a <= b` where an unspecified timestamp means "head".
pub fn ts_le(a: Timestamp, b: Timestamp) -> bool {
    match (a.is_specified(), b.is_specified()) {
        (_, false) => true,
        (false, true) => false,
        _ => a <= b,
    }
}

pub struct BranchTree {
    branches: RwLock<HashMap<BranchId, Branch>>,
    create_lock: Mutex<()>,
    next_id: AtomicU32,
}

impl BranchTree {
    /// A tree holding only the main branch.
    pub fn new(created: Timestamp) -> Self {
        let mut map = HashMap::new();
        map.insert(BranchId::MAIN, Branch::main(created));
        Self {
            branches: RwLock::new(map),
            create_lock: Mutex::new(()),
            next_id: AtomicU32::new(1),
        }
    }

    /// Rebuild from persisted branches. The main branch must be among them.
    pub fn from_branches(branches: Vec<Branch>) -> ArborResult<Self> {
        let mut map = HashMap::new();
        let mut max_id = 0;
        for b in branches {
            max_id = max_id.max(b.id.0);
            map.insert(b.id, b);
        }
        if !map.contains_key(&BranchId::MAIN) {
            return Err(BranchError::NotFound(BranchId::MAIN).into());
        }
        for b in map.values() {
            if let Some(parent) = b.parent() {
                if !map.contains_key(&parent) {
                    return Err(StorageError::Corrupt(format!(
                        "{} references missing parent {}",
                        b.id, parent
                    ))
                    .into());
                }
            }
        }
        Ok(Self {
            branches: RwLock::new(map),
            create_lock: Mutex::new(()),
            next_id: AtomicU32::new(max_id + 1),
        })
    }

    pub fn get(&self, id: BranchId) -> Option<Branch> {
        self.branches.read().get(&id).cloned()
    }

    pub fn require(&self, id: BranchId) -> Result<Branch, BranchError> {
        self.get(id).ok_or(BranchError::NotFound(id))
    }

    pub fn main(&self) -> Branch {
        self.get(BranchId::MAIN)
            .unwrap_or_else(|| Branch::main(Timestamp::UNSPECIFIED))
    }

    pub fn len(&self) -> usize {
        self.branches.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Direct children of `id`, ordered by id.
    pub fn sub_branches(&self, id: BranchId) -> Vec<Branch> {
        let mut subs: Vec<Branch> = self
            .branches
            .read()
            .values()
            .filter(|b| b.parent() == Some(id))
            .cloned()
            .collect();
        subs.sort_by_key(|b| b.id);
        subs
    }

    pub fn all(&self) -> Vec<Branch> {
        let mut all: Vec<Branch> = self.branches.read().values().cloned().collect();
        all.sort_by_key(|b| b.id);
        all
    }

    /// Create a child of `parent` forked at `base`. An unspecified base, or
    /// one later than `now`, forks at `now`. `persist` runs under the creation
    /// mutex before the branch becomes visible; its failure aborts creation.
    pub fn create_branch<F>(
        &self,
        parent: BranchId,
        name: &str,
        base: Timestamp,
        now: Timestamp,
        persist: F,
    ) -> ArborResult<Branch>
    where
        F: FnOnce(&Branch) -> Result<(), StorageError>,
    {
        validate_name(name)?;
        let _guard = self.create_lock.lock();
        let parent_branch = self.require(parent)?;
        let base = if !base.is_specified() || base > now {
            now
        } else {
            base
        };
        if base < parent_branch.created {
            return Err(BranchError::BaseBeforeParent {
                parent,
                base,
                parent_created: parent_branch.created,
            }
            .into());
        }
        if self.sub_branches(parent).iter().any(|b| b.name == name) {
            return Err(BranchError::DuplicateName(name.to_string()).into());
        }
        let branch = Branch {
            id: BranchId(self.next_id.fetch_add(1, Ordering::SeqCst)),
            name: name.to_string(),
            base: Some(BranchPoint::new(parent, base)),
            created: base,
        };
        persist(&branch)?;
        self.branches.write().insert(branch.id, branch.clone());
        tracing::info!(branch = %branch.id, parent = %parent, base = %base, "branch created: {}", name);
        Ok(branch)
    }

    pub fn rename_branch<F>(&self, id: BranchId, new_name: &str, persist: F) -> ArborResult<Branch>
    where
        F: FnOnce(&Branch) -> Result<(), StorageError>,
    {
        if id.is_main() {
            return Err(BranchError::RenameMain.into());
        }
        validate_name(new_name)?;
        let _guard = self.create_lock.lock();
        let mut branch = self.require(id)?;
        if let Some(parent) = branch.parent() {
            if self
                .sub_branches(parent)
                .iter()
                .any(|b| b.id != id && b.name == new_name)
            {
                return Err(BranchError::DuplicateName(new_name.to_string()).into());
            }
        }
        branch.name = new_name.to_string();
        persist(&branch)?;
        self.branches.write().insert(id, branch.clone());
        Ok(branch)
    }

    /// The chain of branch points visible from `point`, nearest first, ending on main.
    /// Each parent entry is the fork point, clamped to `point`'s own time.
    pub fn path(&self, point: BranchPoint) -> Result<Vec<BranchPoint>, BranchError> {
        let branches = self.branches.read();
        let mut out = Vec::new();
        let mut current = point;
        loop {
            let branch = branches
                .get(&current.branch)
                .ok_or(BranchError::NotFound(current.branch))?;
            out.push(current);
            match branch.base {
                Some(base) => {
                    current = BranchPoint::new(base.branch, min_ts(current.timestamp, base.timestamp));
                }
                None => return Ok(out),
            }
        }
    }

    /// Ancestor chain of `id` including itself, nearest first.
    pub fn lineage(&self, id: BranchId) -> Result<Vec<Branch>, BranchError> {
        let branches = self.branches.read();
        let mut out = Vec::new();
        let mut current = Some(id);
        while let Some(cur) = current {
            let branch = branches.get(&cur).ok_or(BranchError::NotFound(cur))?;
            out.push(branch.clone());
            current = branch.parent();
        }
        Ok(out)
    }

    /// True if `point` lies on the history visible from `other`.
    pub fn is_contained_by(&self, point: BranchPoint, other: BranchPoint) -> Result<bool, BranchError> {
        Ok(self
            .path(other)?
            .iter()
            .any(|p| p.branch == point.branch && ts_le(point.timestamp, p.timestamp)))
    }

    /// The latest branch point visible from both `a` and `b`.
    pub fn common_ancestor(&self, a: BranchPoint, b: BranchPoint) -> Result<BranchPoint, BranchError> {
        let path_a = self.path(a)?;
        let path_b = self.path(b)?;
        for pb in &path_b {
            if let Some(pa) = path_a.iter().find(|pa| pa.branch == pb.branch) {
                return Ok(BranchPoint::new(pb.branch, min_ts(pa.timestamp, pb.timestamp)));
            }
        }
        // Both paths end on main.
        Ok(BranchPoint::new(
            BranchId::MAIN,
            min_ts(
                path_a.last().map(|p| p.timestamp).unwrap_or_default(),
                path_b.last().map(|p| p.timestamp).unwrap_or_default(),
            ),
        ))
    }
}

fn validate_name(name: &str) -> Result<(), ArborError> {
    if name.is_empty() || name.contains('/') || name.trim() != name {
        return Err(BranchError::InvalidName(name.to_string()).into());
    }
    Ok(())
}
