//! Commit pipeline.
//!
//! Every commit walks
//! `PREPARED -> LOCKED -> TIMESTAMPED -> VALIDATED -> WRITTEN -> COMMITTED`.
//! Any failure before COMMITTED funnels into `rollback`, which discards the
//! staged store write, retires the timestamp as failed and releases every
//! lock the commit took. Rollback runs at most once per context.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use arbor_common::config::{ArborConfig, IdGenerationPolicy};
use arbor_common::error::{CommitError, StorageError};
use arbor_common::schema::ModelRegistry;
use arbor_common::types::{
    BranchId, BranchPoint, LockType, ObjectId, RevisionKey, SessionId, Timestamp, Version, ViewId,
};
use arbor_common::value::IdMap;
use arbor_storage::{CommitBatch, CommitInfo, ResolvedRevision, Revision, RevisionDelta, RevisionStore, StoreWriter};

use crate::handler::AccessHandlers;
use crate::lock::LockOutcome;
use crate::locking::{LockHolder, LockKey, LockingManager, LockOwner, ObjectLockState};
use crate::timestamp::TimestampAuthority;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommitState {
    Prepared,
    Locked,
    Timestamped,
    Validated,
    Written,
    Committed,
    RolledBack,
}

impl CommitState {
    pub fn is_terminal(self) -> bool {
        matches!(self, CommitState::Committed | CommitState::RolledBack)
    }

    pub fn can_advance_to(self, next: CommitState) -> bool {
        use CommitState::*;
        match next {
            RolledBack => !self.is_terminal(),
            _ => matches!(
                (self, next),
                (Prepared, Locked)
                    | (Locked, Timestamped)
                    | (Timestamped, Validated)
                    | (Validated, Written)
                    | (Written, Committed)
            ),
        }
    }
}

impl fmt::Display for CommitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CommitState::Prepared => "PREPARED",
            CommitState::Locked => "LOCKED",
            CommitState::Timestamped => "TIMESTAMPED",
            CommitState::Validated => "VALIDATED",
            CommitState::Written => "WRITTEN",
            CommitState::Committed => "COMMITTED",
            CommitState::RolledBack => "ROLLED_BACK",
        };
        f.write_str(s)
    }
}

/// What a transaction hands over on commit.
#[derive(Debug, Clone)]
pub struct CommitRequest {
    pub session: SessionId,
    pub owner: LockOwner,
    pub user: String,
    pub comment: String,
    /// New objects, usually under temporary ids.
    pub new_objects: Vec<Revision>,
    pub deltas: Vec<RevisionDelta>,
    pub detached: Vec<ObjectId>,
    /// Locks to take on new objects once they exist. Temporary ids are remapped.
    pub locks_on_new_objects: Vec<(ObjectId, LockType)>,
    pub auto_release_locks: bool,
    pub timestamp_override: Option<Timestamp>,
    /// The client follows commits of others. When off, a stale base aborts
    /// the commit even if stale revisions are otherwise allowed.
    pub passive_updates: bool,
}

impl CommitRequest {
    pub fn new(session: SessionId, owner: LockOwner, user: &str) -> Self {
        Self {
            session,
            owner,
            user: user.to_string(),
            comment: String::new(),
            new_objects: Vec::new(),
            deltas: Vec::new(),
            detached: Vec::new(),
            locks_on_new_objects: Vec::new(),
            auto_release_locks: false,
            timestamp_override: None,
            passive_updates: true,
        }
    }

    pub fn branch(&self) -> BranchId {
        self.owner.branch_point.branch
    }

    pub fn with_new_object(mut self, revision: Revision) -> Self {
        self.new_objects.push(revision);
        self
    }

    pub fn with_delta(mut self, delta: RevisionDelta) -> Self {
        self.deltas.push(delta);
        self
    }

    pub fn with_detached(mut self, id: ObjectId) -> Self {
        self.detached.push(id);
        self
    }

    pub fn with_comment(mut self, comment: &str) -> Self {
        self.comment = comment.to_string();
        self
    }

    pub fn with_lock_on_new_object(mut self, id: ObjectId, lock_type: LockType) -> Self {
        self.locks_on_new_objects.push((id, lock_type));
        self
    }

    pub fn with_auto_release(mut self, on: bool) -> Self {
        self.auto_release_locks = on;
        self
    }

    pub fn with_passive_updates(mut self, on: bool) -> Self {
        self.passive_updates = on;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.new_objects.is_empty() && self.deltas.is_empty() && self.detached.is_empty()
    }
}

/// Single-commit state, visible to access handlers.
pub struct CommitContext {
    request: CommitRequest,
    state: CommitState,
    pub timestamp: Timestamp,
    pub previous_timestamp: Timestamp,
    pub new_revisions: Vec<Revision>,
    pub dirty_revisions: Vec<Revision>,
    pub deltas: Vec<RevisionDelta>,
    /// Detached ids with their class and tombstone version.
    pub detached: Vec<(ObjectId, String, Version)>,
    pub id_mappings: IdMap,
    locked: Vec<LockKey>,
    containment_keys: Vec<LockKey>,
    writer: Option<Box<dyn StoreWriter>>,
    rollback_reason: Option<String>,
}

impl CommitContext {
    fn new(request: CommitRequest) -> Self {
        Self {
            state: CommitState::Prepared,
            timestamp: Timestamp::UNSPECIFIED,
            previous_timestamp: Timestamp::UNSPECIFIED,
            new_revisions: request.new_objects.clone(),
            dirty_revisions: Vec::new(),
            deltas: request.deltas.clone(),
            detached: Vec::new(),
            id_mappings: IdMap::new(),
            locked: Vec::new(),
            containment_keys: Vec::new(),
            writer: None,
            rollback_reason: None,
            request,
        }
    }

    pub fn state(&self) -> CommitState {
        self.state
    }

    pub fn session(&self) -> SessionId {
        self.request.session
    }

    pub fn view(&self) -> ViewId {
        self.request.owner.view
    }

    pub fn branch(&self) -> BranchId {
        self.request.branch()
    }

    pub fn user(&self) -> &str {
        &self.request.user
    }

    pub fn comment(&self) -> &str {
        &self.request.comment
    }

    pub fn rollback_reason(&self) -> Option<&str> {
        self.rollback_reason.as_deref()
    }

    fn holder(&self) -> LockHolder {
        self.request.owner.holder()
    }

    fn advance(&mut self, next: CommitState) -> Result<(), CommitError> {
        if !self.state.can_advance_to(next) {
            return Err(CommitError::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        tracing::debug!(view = %self.view(), ts = %self.timestamp, "commit {} -> {}", self.state, next);
        self.state = next;
        Ok(())
    }

    fn info(&self) -> CommitInfo {
        CommitInfo {
            branch: self.branch(),
            timestamp: self.timestamp,
            previous_timestamp: self.previous_timestamp,
            user: self.request.user.clone(),
            comment: self.request.comment.clone(),
        }
    }
}

/// Result of a successful commit.
#[derive(Debug, Clone)]
pub struct CommitOutcome {
    pub info: CommitInfo,
    pub id_mappings: IdMap,
    pub new_objects: Vec<(ObjectId, String)>,
    pub changed: Vec<RevisionKey>,
    pub detached: Vec<ObjectId>,
    pub deltas: Vec<RevisionDelta>,
    pub new_object_locks: Vec<ObjectLockState>,
    pub released_locks: Vec<(LockKey, LockType)>,
}

impl CommitOutcome {
    pub fn timestamp(&self) -> Timestamp {
        self.info.timestamp
    }

    pub fn previous_timestamp(&self) -> Timestamp {
        self.info.previous_timestamp
    }

    pub fn branch_point(&self) -> BranchPoint {
        BranchPoint::new(self.info.branch, self.info.timestamp)
    }
}

#[derive(Debug, Default)]
struct CommitStats {
    committed: AtomicU64,
    rolled_back: AtomicU64,
    lock_timeouts: AtomicU64,
    conflicts: AtomicU64,
    integrity_violations: AtomicU64,
    containment_cycles: AtomicU64,
    vetoes: AtomicU64,
    storage_failures: AtomicU64,
    total_commit_us: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitStatsSnapshot {
    pub committed: u64,
    pub rolled_back: u64,
    pub lock_timeouts: u64,
    pub conflicts: u64,
    pub integrity_violations: u64,
    pub containment_cycles: u64,
    pub vetoes: u64,
    pub storage_failures: u64,
    pub avg_commit_us: u64,
}

impl CommitStats {
    fn record_rollback(&self, err: &CommitError) {
        self.rolled_back.fetch_add(1, Ordering::Relaxed);
        let counter = match err {
            CommitError::LockTimeout { .. } => &self.lock_timeouts,
            CommitError::ConcurrentModification { .. } => &self.conflicts,
            CommitError::ReferentialIntegrityViolation(_) => &self.integrity_violations,
            CommitError::ContainmentCycle(_) => &self.containment_cycles,
            CommitError::Vetoed(_) => &self.vetoes,
            CommitError::Storage(_) => &self.storage_failures,
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> CommitStatsSnapshot {
        let committed = self.committed.load(Ordering::Relaxed);
        let total = self.total_commit_us.load(Ordering::Relaxed);
        CommitStatsSnapshot {
            committed,
            rolled_back: self.rolled_back.load(Ordering::Relaxed),
            lock_timeouts: self.lock_timeouts.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            integrity_violations: self.integrity_violations.load(Ordering::Relaxed),
            containment_cycles: self.containment_cycles.load(Ordering::Relaxed),
            vetoes: self.vetoes.load(Ordering::Relaxed),
            storage_failures: self.storage_failures.load(Ordering::Relaxed),
            avg_commit_us: if committed > 0 { total / committed } else { 0 },
        }
    }
}

/// Pipeline knobs taken from `ArborConfig`.
#[derive(Debug, Clone)]
pub struct CommitSettings {
    pub ensure_referential_integrity: bool,
    pub id_generation: IdGenerationPolicy,
    pub allow_commit_with_stale_revisions: bool,
    pub lock_timeout: Duration,
}

impl CommitSettings {
    pub fn from_config(config: &ArborConfig) -> Self {
        Self {
            ensure_referential_integrity: config.repository.ensure_referential_integrity,
            id_generation: config.repository.id_generation,
            allow_commit_with_stale_revisions: config.repository.allow_commit_with_stale_revisions,
            lock_timeout: Duration::from_millis(config.locking.commit_lock_timeout_ms),
        }
    }
}

impl Default for CommitSettings {
    fn default() -> Self {
        Self::from_config(&ArborConfig::default())
    }
}

pub struct CommitPipeline {
    settings: CommitSettings,
    revisions: Arc<RevisionStore>,
    locking: Arc<LockingManager>,
    timestamps: Arc<TimestampAuthority>,
    handlers: Arc<AccessHandlers>,
    model: Arc<ModelRegistry>,
    /// Keys write-locked by in-flight commits whose delta changes containment.
    containment_changes: DashMap<LockKey, ViewId>,
    last_object_id: AtomicU64,
    stats: CommitStats,
}

impl CommitPipeline {
    pub fn new(
        settings: CommitSettings,
        revisions: Arc<RevisionStore>,
        locking: Arc<LockingManager>,
        timestamps: Arc<TimestampAuthority>,
        handlers: Arc<AccessHandlers>,
        model: Arc<ModelRegistry>,
    ) -> Self {
        let last_object_id = AtomicU64::new(revisions.store().last_object_id());
        Self {
            settings,
            revisions,
            locking,
            timestamps,
            handlers,
            model,
            containment_changes: DashMap::new(),
            last_object_id,
            stats: CommitStats::default(),
        }
    }

    pub fn settings(&self) -> &CommitSettings {
        &self.settings
    }

    pub fn prepare(&self, request: CommitRequest) -> CommitContext {
        CommitContext::new(request)
    }

    /// Run a full commit.
    pub fn commit(&self, request: CommitRequest) -> Result<CommitOutcome, CommitError> {
        let mut ctx = self.prepare(request);
        self.execute(&mut ctx)
    }

    /// Drive a prepared context to COMMITTED, rolling back on the first failure.
    pub fn execute(&self, ctx: &mut CommitContext) -> Result<CommitOutcome, CommitError> {
        let started = Instant::now();
        if ctx.state != CommitState::Prepared {
            return Err(CommitError::InvalidTransition {
                from: ctx.state.to_string(),
                to: CommitState::Locked.to_string(),
            });
        }
        if let Err(e) = self.run(ctx) {
            self.rollback(ctx, &e.rollback_message());
            self.stats.record_rollback(&e);
            return Err(e);
        }
        let outcome = self.finish(ctx);
        self.stats.committed.fetch_add(1, Ordering::Relaxed);
        self.stats
            .total_commit_us
            .fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);
        Ok(outcome)
    }

    fn run(&self, ctx: &mut CommitContext) -> Result<(), CommitError> {
        if ctx.request.owner.read_only {
            return Err(CommitError::Rejected(format!("{} is read-only", ctx.view())));
        }
        self.lock_objects(ctx)?;
        ctx.advance(CommitState::Locked)?;

        let issued = self.timestamps.start_commit(ctx.request.timestamp_override)?;
        ctx.timestamp = issued.timestamp;
        ctx.previous_timestamp = issued.previous;
        ctx.advance(CommitState::Timestamped)?;

        self.validate(ctx)?;
        ctx.advance(CommitState::Validated)?;

        self.write(ctx)?;
        ctx.advance(CommitState::Written)?;

        let ts = ctx.timestamp;
        if let Some(writer) = ctx.writer.as_mut() {
            writer.commit().map_err(|e| storage_failure(ts, e))?;
        }
        Ok(())
    }

    // ── PREPARED -> LOCKED ─────────────────────────────────────────────────

    fn lock_objects(&self, ctx: &mut CommitContext) -> Result<(), CommitError> {
        let branch = ctx.branch();
        let holder = ctx.holder();
        let detached: HashSet<ObjectId> = ctx.request.detached.iter().copied().collect();
        let new_ids: HashSet<ObjectId> = ctx
            .new_revisions
            .iter()
            .map(|r| r.id)
            .filter(|id| !id.is_temporary())
            .collect();

        let mut keys = Vec::new();
        let mut targets = Vec::new();
        let mut lock_target = |id: ObjectId, keys: &mut Vec<LockKey>| -> Result<(), CommitError> {
            if id.is_temporary() || new_ids.contains(&id) {
                return Ok(());
            }
            if detached.contains(&id) {
                return Err(CommitError::ReferentialIntegrityViolation(format!(
                    "commit deletes an object and adds a reference to it ({})",
                    id
                )));
            }
            keys.push(self.locking.key(id, branch));
            targets.push(id);
            Ok(())
        };

        if self.settings.ensure_referential_integrity {
            for rev in &ctx.new_revisions {
                for target in rev.references() {
                    lock_target(target, &mut keys)?;
                }
            }
        }

        let mut containment_keys = Vec::new();
        for delta in &ctx.deltas {
            let key = self.locking.key(delta.id, branch);
            keys.push(key);
            let base = self
                .revisions
                .revision_by_version(delta.id, delta.branch, delta.version)
                .map_err(|e| storage_failure(ctx.timestamp, e))?
                .ok_or_else(|| historical(ctx.view(), delta.key()))?;
            if delta.has_containment_changes(&self.model, &base.class) {
                if self.is_container_locked(&holder, &base, branch)? {
                    return Err(CommitError::ContainmentCycle(format!(
                        "a container of {} is already locked for containment changes",
                        delta.id
                    )));
                }
                containment_keys.push(key);
            }
        }

        if self.settings.ensure_referential_integrity {
            for delta in &ctx.deltas {
                for target in delta.added_references() {
                    lock_target(target, &mut keys)?;
                }
            }
        }

        keys.extend(detached.iter().map(|id| self.locking.key(*id, branch)));
        keys.extend(new_ids.iter().map(|id| self.locking.key(*id, branch)));
        if keys.is_empty() {
            return Ok(());
        }

        let timeout = self.settings.lock_timeout;
        match self.locking.lock_keys(LockType::Write, &holder, &keys, timeout) {
            LockOutcome::Granted(_) => {}
            LockOutcome::TimedOut { blocked } => {
                tracing::warn!(view = %ctx.view(), blocked = blocked.len(), "commit could not lock its objects");
                return Err(CommitError::LockTimeout {
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
        }
        let mut seen = HashSet::new();
        keys.retain(|k| seen.insert(*k));
        ctx.locked = keys;
        for key in &containment_keys {
            self.containment_changes.insert(*key, ctx.view());
        }
        ctx.containment_keys = containment_keys;

        for id in targets {
            let live = self
                .revisions
                .resolve(id, BranchPoint::head(branch))
                .map_err(|e| CommitError::Rejected(e.to_string()))?;
            if live.is_none() {
                return Err(CommitError::ReferentialIntegrityViolation(format!(
                    "object {} can not be referenced anymore because it has been detached",
                    id
                )));
            }
        }
        Ok(())
    }

    /// Walk up the container chain of `revision` looking for a container
    /// write-locked by another commit that changes containment.
    fn is_container_locked(&self, holder: &LockHolder, revision: &Revision, branch: BranchId) -> Result<bool, CommitError> {
        let mut visited = HashSet::new();
        let mut next = revision.container;
        while let Some(container) = next {
            if !visited.insert(container) {
                break;
            }
            let key = self.locking.key(container, branch);
            if self.locking.has_lock_by_others(LockType::Write, holder, &key) {
                let other = self.containment_changes.get(&key).map(|v| *v.value());
                if matches!((other, holder), (Some(v), LockHolder::View(own)) if v != *own) {
                    return Ok(true);
                }
            }
            next = self
                .revisions
                .resolve(container, BranchPoint::head(branch))
                .map_err(|e| CommitError::Rejected(e.to_string()))?
                .and_then(|r| r.revision().container);
        }
        Ok(false)
    }

    // ── TIMESTAMPED -> VALIDATED ───────────────────────────────────────────

    fn validate(&self, ctx: &mut CommitContext) -> Result<(), CommitError> {
        let branch = ctx.branch();
        let ts = ctx.timestamp;

        let rebase = self.settings.allow_commit_with_stale_revisions && ctx.request.passive_updates;
        let mut dirty = Vec::with_capacity(ctx.deltas.len());
        for delta in &ctx.deltas {
            dirty.push(self.compute_dirty(ctx.view(), branch, ts, delta, rebase)?);
        }
        ctx.dirty_revisions = dirty;

        let mut detached = Vec::with_capacity(ctx.request.detached.len());
        for id in &ctx.request.detached {
            let resolved = self
                .revisions
                .resolve(*id, BranchPoint::head(branch))
                .map_err(|e| CommitError::Rejected(e.to_string()))?
                .ok_or_else(|| CommitError::ConcurrentModification {
                    view: ctx.view(),
                    reason: format!("{} was already detached", id),
                })?;
            let version = match &resolved {
                ResolvedRevision::Materialized(rev) => rev.version.next(),
                ResolvedRevision::Pointer(_) => Version::FIRST,
            };
            detached.push((*id, resolved.revision().class.clone(), version));
        }
        ctx.detached = detached;

        for rev in &mut ctx.new_revisions {
            rev.stamp_new(branch, ts);
        }

        if self.settings.ensure_referential_integrity && !ctx.detached.is_empty() {
            self.check_xrefs(ctx)?;
        }
        Ok(())
    }

    /// Copy-on-write application of `delta` to the revision it was computed against.
    fn compute_dirty(
        &self,
        view: ViewId,
        branch: BranchId,
        ts: Timestamp,
        delta: &RevisionDelta,
        rebase: bool,
    ) -> Result<Revision, CommitError> {
        let same_branch = delta.branch == branch;
        if !same_branch {
            let first_on_branch = self
                .revisions
                .revision_by_version(delta.id, branch, Version::FIRST)
                .map_err(|e| storage_failure(ts, e))?;
            if first_on_branch.is_some() {
                return Err(historical(view, delta.key()));
            }
        }
        let mut base = self
            .revisions
            .revision_by_version(delta.id, delta.branch, delta.version)
            .map_err(|e| storage_failure(ts, e))?
            .ok_or_else(|| historical(view, delta.key()))?;
        if base.detached {
            return Err(historical(view, delta.key()));
        }
        if same_branch && !self.is_head(&base)? {
            if !rebase {
                return Err(historical(view, delta.key()));
            }
            base = self
                .revisions
                .materialized(delta.id, BranchPoint::head(branch))
                .map_err(|e| storage_failure(ts, e))?
                .filter(|r| !r.detached)
                .ok_or_else(|| historical(view, delta.key()))?;
            tracing::warn!(view = %view, key = %delta.key(), head = %base.version, "applying stale delta on top of head");
        }
        let mut rev = base.copy_for_change();
        rev.adjust_for_commit(branch, ts);
        delta.apply(&mut rev).map_err(|e| CommitError::Rejected(e.to_string()))?;
        Ok(rev)
    }

    fn is_head(&self, base: &Revision) -> Result<bool, CommitError> {
        if !base.is_current() {
            return Ok(false);
        }
        let head = self
            .revisions
            .materialized(base.id, BranchPoint::head(base.branch))
            .map_err(|e| CommitError::Rejected(e.to_string()))?;
        Ok(head.map_or(false, |h| h.version == base.version))
    }

    /// Fail if anything that survives this commit still references a detached object.
    fn check_xrefs(&self, ctx: &CommitContext) -> Result<(), CommitError> {
        let branch = ctx.branch();
        let targets: HashSet<ObjectId> = ctx.detached.iter().map(|(id, _, _)| *id).collect();
        let in_commit: HashSet<ObjectId> = ctx
            .dirty_revisions
            .iter()
            .map(|r| r.id)
            .chain(targets.iter().copied())
            .collect();

        let mut violations: Vec<(ObjectId, String, ObjectId)> = self
            .revisions
            .xrefs(&targets, BranchPoint::head(branch))
            .map_err(|e| CommitError::Rejected(e.to_string()))?
            .into_iter()
            .filter(|x| !in_commit.contains(&x.source))
            .map(|x| (x.source, x.feature, x.target))
            .collect();

        for rev in ctx.new_revisions.iter().chain(ctx.dirty_revisions.iter()) {
            for (feature, target) in rev.references_by_feature() {
                if targets.contains(&target) {
                    violations.push((rev.id, feature.to_string(), target));
                }
            }
        }

        match violations.first() {
            None => Ok(()),
            Some((source, feature, target)) => Err(CommitError::ReferentialIntegrityViolation(format!(
                "{} live reference(s) to detached objects, e.g. {}.{} -> {}",
                violations.len(),
                source,
                feature,
                target
            ))),
        }
    }

    // ── VALIDATED -> WRITTEN ───────────────────────────────────────────────

    fn write(&self, ctx: &mut CommitContext) -> Result<(), CommitError> {
        self.assign_ids(ctx)?;
        if !ctx.id_mappings.is_empty() {
            let map = ctx.id_mappings.clone();
            for rev in &mut ctx.new_revisions {
                rev.remap_references(&map);
            }
            for rev in &mut ctx.dirty_revisions {
                rev.remap_references(&map);
            }
            for delta in &mut ctx.deltas {
                delta.remap_references(&map);
            }
        }

        for handler in self.handlers.write_handlers() {
            handler.before_commit(ctx).map_err(CommitError::Vetoed)?;
        }

        let batch = CommitBatch {
            info: ctx.info(),
            new_revisions: ctx.new_revisions.clone(),
            dirty_revisions: ctx.dirty_revisions.clone(),
            deltas: ctx.deltas.clone(),
            detached: ctx.detached.clone(),
            id_mappings: ctx.id_mappings.clone(),
        };
        let mut writer = self.revisions.store().writer();
        let written = writer.write(&batch);
        ctx.writer = Some(writer);
        written.map_err(|e| storage_failure(ctx.timestamp, e))
    }

    fn assign_ids(&self, ctx: &mut CommitContext) -> Result<(), CommitError> {
        let mut assigned = HashSet::new();
        for rev in &ctx.new_revisions {
            if !rev.id.is_temporary() {
                continue;
            }
            let new_id = self.new_object_id();
            if new_id.is_temporary() {
                return Err(CommitError::InvalidIdMapping(format!(
                    "{} mapped to temporary id {}",
                    rev.id, new_id
                )));
            }
            if !assigned.insert(new_id) || ctx.id_mappings.insert(rev.id, new_id).is_some() {
                return Err(CommitError::InvalidIdMapping(format!(
                    "{} mapped more than once",
                    rev.id
                )));
            }
        }
        Ok(())
    }

    fn new_object_id(&self) -> ObjectId {
        match self.settings.id_generation {
            IdGenerationPolicy::Repository => {
                ObjectId::Persistent(self.last_object_id.fetch_add(1, Ordering::SeqCst) + 1)
            }
            IdGenerationPolicy::Store => self.revisions.store().new_object_id(),
        }
    }

    // ── WRITTEN -> COMMITTED ───────────────────────────────────────────────

    /// Publish the committed revisions, finish the timestamp, then release
    /// locks. Nothing here can undo the commit; handler errors are logged.
    fn finish(&self, ctx: &mut CommitContext) -> CommitOutcome {
        let branch = ctx.branch();
        let ts = ctx.timestamp;
        for rev in ctx.new_revisions.iter().chain(ctx.dirty_revisions.iter()) {
            self.revisions.add_revision(rev.clone());
        }
        for (id, class, version) in &ctx.detached {
            self.revisions
                .add_revision(Revision::detached_marker(*id, class, branch, *version, ts));
        }
        ctx.writer = None;
        self.timestamps.end_commit(ts);

        self.unlock_objects(ctx);
        if !ctx.request.detached.is_empty() {
            if let Err(e) = self.locking.release_detached(&ctx.request.owner, &ctx.request.detached) {
                tracing::warn!(view = %ctx.view(), "releasing locks on detached objects failed: {}", e);
            }
        }

        let mut new_object_locks = Vec::new();
        for (id, lock_type) in &ctx.request.locks_on_new_objects {
            let id = ctx.id_mappings.get(id).copied().unwrap_or(*id);
            match self
                .locking
                .lock_objects(&ctx.request.owner, *lock_type, &[id], false, Duration::ZERO)
            {
                Ok(LockOutcome::Granted(states)) => new_object_locks.extend(states),
                Ok(LockOutcome::TimedOut { .. }) => {
                    tracing::warn!(view = %ctx.view(), object = %id, "could not lock new object after commit")
                }
                Err(e) => tracing::warn!(view = %ctx.view(), object = %id, "locking new object failed: {}", e),
            }
        }

        let released_locks = if ctx.request.auto_release_locks {
            match self.locking.unlock_all_objects(&ctx.request.owner) {
                Ok(released) => released,
                Err(e) => {
                    tracing::warn!(view = %ctx.view(), "auto-release after commit failed: {}", e);
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        // Committed is always reachable from Written here.
        let _ = ctx.advance(CommitState::Committed);

        for handler in self.handlers.write_handlers() {
            if let Err(e) = handler.after_commit(ctx) {
                tracing::warn!(view = %ctx.view(), ts = %ts, "write access handler failed after commit: {}", e);
            }
        }
        tracing::debug!(
            view = %ctx.view(),
            branch = %branch,
            ts = %ts,
            new = ctx.new_revisions.len(),
            dirty = ctx.dirty_revisions.len(),
            detached = ctx.detached.len(),
            "commit finished"
        );

        CommitOutcome {
            info: ctx.info(),
            id_mappings: ctx.id_mappings.clone(),
            new_objects: ctx
                .new_revisions
                .iter()
                .map(|r| (r.id, r.class.clone()))
                .collect(),
            changed: ctx.dirty_revisions.iter().map(|r| r.key()).collect(),
            detached: ctx.detached.iter().map(|(id, _, _)| *id).collect(),
            deltas: ctx.deltas.clone(),
            new_object_locks,
            released_locks,
        }
    }

    // ── ROLLED_BACK ────────────────────────────────────────────────────────

    /// Undo everything `ctx` has done so far. Only the first call has an
    /// effect. Locks the view held before the commit are left in place.
    pub fn rollback(&self, ctx: &mut CommitContext, reason: &str) {
        if ctx.rollback_reason.is_some() || ctx.state == CommitState::Committed {
            return;
        }
        ctx.rollback_reason = Some(reason.to_string());
        tracing::warn!(view = %ctx.view(), state = %ctx.state, ts = %ctx.timestamp, "rolling back commit: {}", reason);

        if let Some(mut writer) = ctx.writer.take() {
            writer.rollback();
        }
        if ctx.timestamp.is_specified() {
            self.timestamps.fail_commit(ctx.timestamp);
            for handler in self.handlers.write_handlers() {
                if let Err(e) = handler.on_rollback(ctx, reason) {
                    tracing::warn!(view = %ctx.view(), "write access handler failed on rollback: {}", e);
                }
            }
        }
        self.unlock_objects(ctx);
        ctx.state = CommitState::RolledBack;
    }

    fn unlock_objects(&self, ctx: &mut CommitContext) {
        let holder = ctx.holder();
        for key in ctx.containment_keys.drain(..) {
            self.containment_changes.remove_if(&key, |_, v| LockHolder::View(*v) == holder);
        }
        if !ctx.locked.is_empty() {
            let locked = std::mem::take(&mut ctx.locked);
            if let Err(e) = self.locking.unlock_keys(LockType::Write, &holder, &locked) {
                tracing::warn!(view = %ctx.view(), "commit locks were not all held at release: {}", e);
            }
        }
    }

    pub fn stats(&self) -> CommitStatsSnapshot {
        self.stats.snapshot()
    }

    /// Next id the repository policy would mint.
    pub fn last_object_id(&self) -> u64 {
        self.last_object_id.load(Ordering::SeqCst)
    }
}

fn historical(view: ViewId, key: RevisionKey) -> CommitError {
    CommitError::ConcurrentModification {
        view,
        reason: format!("{} is not the current revision", key),
    }
}

fn storage_failure(ts: Timestamp, e: StorageError) -> CommitError {
    match e {
        StorageError::ConcurrentModification(reason) => {
            tracing::warn!(ts = %ts, "store rejected commit: {}", reason);
            CommitError::Storage(StorageError::ConcurrentModification(reason))
        }
        other => {
            tracing::error!(ts = %ts, "storage failure during commit: {}", other);
            CommitError::Storage(other)
        }
    }
}
