//! Branch-aware revision lookups on top of a `Store`.
//!
//! Golden path for `resolve(id, branch@ts)`:
//!   1. `BranchTree::path` gives the branch points visible from `branch@ts`
//!   2. the first branch in that chain with a revision valid at its point wins
//!   3. a hit on an ancestor branch comes back as a `Pointer` to the ancestor revision
//!   4. a tombstone anywhere on the chain means "detached": nothing resolves
//!
//! Head revisions and pointers are cached. The head cache is updated only by
//! `add_revision`, which the commit pipeline calls after the store has
//! committed. Pointers for an object are dropped whenever it changes.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use arbor_common::error::{ArborResult, StorageError};
use arbor_common::types::{BranchId, BranchPoint, ObjectId, RevisionKey, Timestamp, Version};

use crate::accessor::{Segment, Store, XRef};
use crate::branch::{ts_le, BranchTree};
use crate::revision::Revision;

/// An object as seen from one branch point.
#[derive(Debug, Clone)]
pub enum ResolvedRevision {
    /// Materialized on the requested branch.
    Materialized(Arc<Revision>),
    /// Inherited unchanged from an ancestor branch. Not authoritative: it
    /// only records where the data actually lives.
    Pointer(PointerRevision),
}

#[derive(Debug, Clone)]
pub struct PointerRevision {
    pub id: ObjectId,
    pub point: BranchPoint,
    pub target: Arc<Revision>,
}

impl ResolvedRevision {
    pub fn revision(&self) -> &Arc<Revision> {
        match self {
            ResolvedRevision::Materialized(r) => r,
            ResolvedRevision::Pointer(p) => &p.target,
        }
    }

    pub fn is_pointer(&self) -> bool {
        matches!(self, ResolvedRevision::Pointer(_))
    }

    /// Key of the revision the data comes from.
    pub fn key(&self) -> RevisionKey {
        self.revision().key()
    }
}

/// Result of `merge_data`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeData {
    /// Common ancestor used for a three-way comparison; `None` when one
    /// point contains the other.
    pub ancestor: Option<BranchPoint>,
    pub ids: HashSet<ObjectId>,
}

#[derive(Debug, Default)]
struct CacheStats {
    head_hits: AtomicU64,
    head_misses: AtomicU64,
    pointer_hits: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RevisionCacheSnapshot {
    pub cached_heads: usize,
    pub cached_pointers: usize,
    pub head_hits: u64,
    pub head_misses: u64,
    pub pointer_hits: u64,
}

pub struct RevisionStore {
    store: Arc<dyn Store>,
    tree: Arc<BranchTree>,
    /// `None` caches "no revision on this branch".
    heads: DashMap<(ObjectId, BranchId), Option<Arc<Revision>>>,
    pointers: DashMap<ObjectId, HashMap<BranchPoint, Arc<Revision>>>,
    stats: CacheStats,
}

impl RevisionStore {
    pub fn new(store: Arc<dyn Store>, tree: Arc<BranchTree>) -> Self {
        Self {
            store,
            tree,
            heads: DashMap::new(),
            pointers: DashMap::new(),
            stats: CacheStats::default(),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn tree(&self) -> &Arc<BranchTree> {
        &self.tree
    }

    /// The revision stored on exactly `point.branch`, tombstones included.
    pub fn materialized(&self, id: ObjectId, point: BranchPoint) -> Result<Option<Arc<Revision>>, StorageError> {
        if point.is_head() {
            if let Some(entry) = self.heads.get(&(id, point.branch)) {
                self.stats.head_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(entry.value().clone());
            }
            self.stats.head_misses.fetch_add(1, Ordering::Relaxed);
            let loaded = self.store.read_revision(id, point)?.map(Arc::new);
            // A concurrent add_revision may have cached a newer head already.
            let entry = self
                .heads
                .entry((id, point.branch))
                .or_insert(loaded);
            return Ok(entry.value().clone());
        }
        Ok(self.store.read_revision(id, point)?.map(Arc::new))
    }

    /// Resolve including tombstones. The returned revision may be `detached`.
    pub fn resolve_raw(&self, id: ObjectId, point: BranchPoint) -> ArborResult<Option<ResolvedRevision>> {
        if let Some(cached) = self.pointers.get(&id).and_then(|m| m.get(&point).cloned()) {
            self.stats.pointer_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(ResolvedRevision::Pointer(PointerRevision {
                id,
                point,
                target: cached,
            })));
        }
        for p in self.tree.path(point)? {
            if let Some(rev) = self.materialized(id, p)? {
                if p.branch == point.branch {
                    return Ok(Some(ResolvedRevision::Materialized(rev)));
                }
                self.pointers
                    .entry(id)
                    .or_default()
                    .insert(point, rev.clone());
                return Ok(Some(ResolvedRevision::Pointer(PointerRevision {
                    id,
                    point,
                    target: rev,
                })));
            }
        }
        Ok(None)
    }

    /// The live state of `id` at `point`, walking ancestor branches.
    /// Detached or never-created objects resolve to `None`.
    pub fn resolve(&self, id: ObjectId, point: BranchPoint) -> ArborResult<Option<ResolvedRevision>> {
        Ok(self
            .resolve_raw(id, point)?
            .filter(|r| !r.revision().detached))
    }

    pub fn resolve_many(
        &self,
        ids: &[ObjectId],
        point: BranchPoint,
    ) -> ArborResult<Vec<Option<ResolvedRevision>>> {
        ids.iter().map(|id| self.resolve(*id, point)).collect()
    }

    pub fn revision_by_version(
        &self,
        id: ObjectId,
        branch: BranchId,
        version: Version,
    ) -> Result<Option<Arc<Revision>>, StorageError> {
        if let Some(entry) = self.heads.get(&(id, branch)) {
            if let Some(head) = entry.value() {
                if head.version == version {
                    return Ok(Some(head.clone()));
                }
            }
        }
        Ok(self
            .store
            .read_revision_by_version(id, branch, version)?
            .map(Arc::new))
    }

    /// Publish a committed revision (or tombstone) as the new head of its branch.
    pub fn add_revision(&self, rev: Revision) {
        let id = rev.id;
        self.heads.insert((id, rev.branch), Some(Arc::new(rev)));
        self.pointers.remove(&id);
    }

    /// Drop everything cached for `id`.
    pub fn evict(&self, id: ObjectId) {
        self.heads.retain(|(oid, _), _| *oid != id);
        self.pointers.remove(&id);
    }

    // ── Change sets ─────────────────────────────────────────────────────────

    /// Ids changed between `start` and `end`, where `start` lies on the history of `end`.
    fn directed_change_set(&self, start: BranchPoint, end: BranchPoint) -> ArborResult<HashSet<ObjectId>> {
        let mut segments = Vec::new();
        for p in self.tree.path(end)? {
            if p.branch == start.branch {
                if start.is_head() || !ts_le(start.timestamp, p.timestamp) || start.timestamp == p.timestamp {
                    break;
                }
                segments.push(Segment::new(p.branch, start.timestamp.next(), p.timestamp));
                break;
            }
            let branch = self.tree.require(p.branch)?;
            segments.push(Segment::new(p.branch, branch.created, p.timestamp));
        }
        if segments.is_empty() {
            return Ok(HashSet::new());
        }
        Ok(self.store.read_change_set(&segments)?)
    }

    /// Objects that differ between two branch points.
    ///
    /// Two-way when one point lies on the other's history (only the path
    /// between them counts); otherwise three-way, the union of both sides'
    /// changes since their common ancestor.
    pub fn change_set(&self, a: BranchPoint, b: BranchPoint) -> ArborResult<HashSet<ObjectId>> {
        Ok(self.merge_data(a, b)?.ids)
    }

    pub fn merge_data(&self, source: BranchPoint, target: BranchPoint) -> ArborResult<MergeData> {
        if self.tree.is_contained_by(source, target)? {
            return Ok(MergeData {
                ancestor: None,
                ids: self.directed_change_set(source, target)?,
            });
        }
        if self.tree.is_contained_by(target, source)? {
            return Ok(MergeData {
                ancestor: None,
                ids: self.directed_change_set(target, source)?,
            });
        }
        let ancestor = self.tree.common_ancestor(source, target)?;
        let mut ids = self.directed_change_set(ancestor, target)?;
        ids.extend(self.directed_change_set(ancestor, source)?);
        Ok(MergeData {
            ancestor: Some(ancestor),
            ids,
        })
    }

    // ── Scans ───────────────────────────────────────────────────────────────

    /// Live references at `point` that point at any of `targets`.
    pub fn xrefs(&self, targets: &HashSet<ObjectId>, point: BranchPoint) -> ArborResult<Vec<XRef>> {
        let mut out = Vec::new();
        if targets.is_empty() {
            return Ok(out);
        }
        for id in self.store.object_ids()? {
            let Some(resolved) = self.resolve(id, point)? else {
                continue;
            };
            for (feature, target) in resolved.revision().references_by_feature() {
                if targets.contains(&target) {
                    out.push(XRef {
                        source: id,
                        feature: feature.to_string(),
                        target,
                    });
                }
            }
        }
        Ok(out)
    }

    /// Live objects of `class` at `point`.
    pub fn instances(&self, class: &str, point: BranchPoint) -> ArborResult<Vec<Arc<Revision>>> {
        let mut out = Vec::new();
        for id in self.store.object_ids()? {
            if let Some(resolved) = self.resolve(id, point)? {
                if resolved.revision().class == class {
                    out.push(resolved.revision().clone());
                }
            }
        }
        Ok(out)
    }

    /// Newest creation timestamp among the heads of `keys`' objects on their branches.
    pub fn newest_head_timestamp(&self, keys: &[RevisionKey]) -> ArborResult<Timestamp> {
        let mut newest = Timestamp::UNSPECIFIED;
        for key in keys {
            if let Some(r) = self.resolve_raw(key.id, BranchPoint::head(key.branch))? {
                newest = newest.max(r.revision().created);
            }
        }
        Ok(newest)
    }

    pub fn cache_snapshot(&self) -> RevisionCacheSnapshot {
        RevisionCacheSnapshot {
            cached_heads: self.heads.len(),
            cached_pointers: self.pointers.iter().map(|e| e.value().len()).sum(),
            head_hits: self.stats.head_hits.load(Ordering::Relaxed),
            head_misses: self.stats.head_misses.load(Ordering::Relaxed),
            pointer_hits: self.stats.pointer_hits.load(Ordering::Relaxed),
        }
    }
}
