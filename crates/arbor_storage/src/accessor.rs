//! Persistence backend contract.
//!
//! The engine treats the backend as opaque. It needs point reads of
//! materialized revisions on one exact branch, a few scans (change sets, cross
//! references, instances), branch and commit-info bookkeeping, and a
//! per-commit writer whose `write` + `commit` pair is atomic.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use arbor_common::error::StorageError;
use arbor_common::types::{BranchId, BranchPoint, ObjectId, Timestamp, Version};
use arbor_common::value::IdMap;

use crate::branch::Branch;
use crate::delta::RevisionDelta;
use crate::revision::Revision;

/// A slice of one branch's history, `[start, end]` inclusive. An unspecified
/// `end` runs to the head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub branch: BranchId,
    pub start: Timestamp,
    pub end: Timestamp,
}

impl Segment {
    pub fn new(branch: BranchId, start: Timestamp, end: Timestamp) -> Self {
        Self { branch, start, end }
    }

    pub fn covers(&self, ts: Timestamp) -> bool {
        ts >= self.start && (!self.end.is_specified() || ts <= self.end)
    }
}

/// A live reference from `source.feature` to `target`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct XRef {
    pub source: ObjectId,
    pub feature: String,
    pub target: ObjectId,
}

/// Metadata recorded for every successful commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub branch: BranchId,
    pub timestamp: Timestamp,
    pub previous_timestamp: Timestamp,
    pub user: String,
    pub comment: String,
}

/// Everything one commit hands to the backend, with ids already permanent.
#[derive(Debug, Clone)]
pub struct CommitBatch {
    pub info: CommitInfo,
    pub new_revisions: Vec<Revision>,
    /// Changed objects, already re-addressed to the commit branch and timestamp.
    pub dirty_revisions: Vec<Revision>,
    pub deltas: Vec<RevisionDelta>,
    /// Detached objects and the version of their tombstone.
    pub detached: Vec<(ObjectId, String, Version)>,
    pub id_mappings: IdMap,
}

/// Read side of a persistence backend, shared by every session.
pub trait Store: Send + Sync {
    /// The revision materialized on exactly `point.branch` that is valid at
    /// `point.timestamp`. No ancestor fallback.
    fn read_revision(&self, id: ObjectId, point: BranchPoint) -> Result<Option<Revision>, StorageError>;

    fn read_revision_by_version(
        &self,
        id: ObjectId,
        branch: BranchId,
        version: Version,
    ) -> Result<Option<Revision>, StorageError>;

    /// Ids with at least one revision created inside any of `segments`.
    fn read_change_set(&self, segments: &[Segment]) -> Result<HashSet<ObjectId>, StorageError>;

    /// Every object id with at least one revision on any branch.
    fn object_ids(&self) -> Result<Vec<ObjectId>, StorageError>;

    fn load_branches(&self) -> Result<Vec<Branch>, StorageError>;

    fn create_branch(&self, branch: &Branch) -> Result<(), StorageError>;

    fn rename_branch(&self, branch: &Branch) -> Result<(), StorageError>;

    /// Commit infos ordered by timestamp, optionally restricted to one branch.
    fn commit_infos(
        &self,
        branch: Option<BranchId>,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<CommitInfo>, StorageError>;

    /// Highest persistent object id handed out so far.
    fn last_object_id(&self) -> u64;

    /// Mint a persistent id (store id-generation policy).
    fn new_object_id(&self) -> ObjectId;

    /// Creation time of the repository; the main branch starts here.
    fn creation_time(&self) -> Timestamp;

    /// A writer for one commit.
    fn writer(&self) -> Box<dyn StoreWriter>;
}

/// Write side of one commit. `write` stages, `commit` publishes atomically,
/// `rollback` discards whatever was staged.
pub trait StoreWriter: Send {
    fn write(&mut self, batch: &CommitBatch) -> Result<(), StorageError>;

    fn commit(&mut self) -> Result<(), StorageError>;

    fn rollback(&mut self);
}
