//! Repository facade.
//!
//! Owns every service of one repository instance (branch tree, revision
//! cache, timestamp authority, lock manager, commit pipeline, sessions,
//! notifications, query workers) and exposes the client-facing operations.
//! Nothing here is process-global; two repositories in one process share no
//! state.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use arbor_common::config::ArborConfig;
use arbor_common::error::{ArborError, ArborResult, ConfigError, LockError, StorageError, TimestampError};
use arbor_common::schema::ModelRegistry;
use arbor_common::types::{
    BranchId, BranchPoint, DurableLockingId, LockType, ObjectId, RevisionKey, SessionId, Timestamp, Version, ViewId,
};
use arbor_storage::{
    Branch, BranchTree, CommitInfo, FileLockAreaStore, LockArea, LockAreaStore, MemLockAreaStore, MergeData,
    ResolvedRevision, Revision, RevisionStore, Store,
};
use arbor_txn::{
    AccessHandlers, CommitOutcome, CommitPipeline, CommitRequest, CommitSettings, CommitStatsSnapshot, LockKey,
    LockOutcome, LockOwner, LockStatsSnapshot, LockingManager, ObjectLockState, TimestampAuthority,
    TimestampStatsSnapshot,
};

use crate::notify::{
    BranchChangeKind, BranchNotification, CommitNotification, ListenerId, LockChangeKind, LockChangeNotification,
    NotificationHub, NotificationScope, NotificationStatsSnapshot, SessionEvent,
};
use crate::query::{Query, QueryExecutor, QueryHandle, QueryHandler, QueryRequest, QueryStatsSnapshot};
use crate::session::{SessionInfo, SessionManager, ViewInfo};

/// Result of an explicit lock request.
#[derive(Debug, Clone, Default)]
pub struct LockResult {
    /// Locks are held after the call.
    pub granted: bool,
    pub timed_out: bool,
    /// Client revision keys that are no longer the branch head.
    pub stale: Vec<RevisionKey>,
    /// The locks are held but the client must catch up to
    /// `required_timestamp` before relying on them.
    pub wait_for_update: bool,
    pub required_timestamp: Timestamp,
    pub locks: Vec<ObjectLockState>,
}

#[derive(Debug, Clone)]
pub struct RepositoryStats {
    pub commits: CommitStatsSnapshot,
    pub locks: LockStatsSnapshot,
    pub timestamps: TimestampStatsSnapshot,
    pub notifications: NotificationStatsSnapshot,
    pub queries: QueryStatsSnapshot,
    pub sessions: usize,
    pub views: usize,
}

pub struct Repository {
    config: ArborConfig,
    model: Arc<ModelRegistry>,
    revisions: Arc<RevisionStore>,
    timestamps: Arc<TimestampAuthority>,
    locking: Arc<LockingManager>,
    handlers: Arc<AccessHandlers>,
    pipeline: CommitPipeline,
    sessions: SessionManager,
    notifications: NotificationHub,
    queries: QueryExecutor,
}

impl Repository {
    /// Bring up a repository over `store`: rebuild the branch tree, resume
    /// timestamps after the last recorded commit and re-acquire the locks of
    /// every persisted lock area.
    pub fn open(config: ArborConfig, store: Arc<dyn Store>, model: ModelRegistry) -> ArborResult<Self> {
        if let Some(addr) = &config.observability.metrics_listen_addr {
            arbor_observability::init_metrics(addr).map_err(|e| ConfigError::Invalid {
                field: "observability.metrics_listen_addr",
                reason: e.to_string(),
            })?;
        }
        let model = Arc::new(model);
        let tree = Arc::new(BranchTree::from_branches(store.load_branches()?)?);

        let last_commit = store
            .commit_infos(None, Timestamp::UNSPECIFIED, Timestamp::UNSPECIFIED)?
            .last()
            .map(|info| info.timestamp)
            .unwrap_or(Timestamp::UNSPECIFIED);
        let initial = last_commit.max(store.creation_time());

        let areas: Arc<dyn LockAreaStore> = match &config.locking.lock_area_dir {
            Some(dir) => Arc::new(FileLockAreaStore::open(dir)?),
            None => Arc::new(MemLockAreaStore::new()),
        };

        let revisions = Arc::new(RevisionStore::new(store, tree.clone()));
        let timestamps = Arc::new(TimestampAuthority::with_system_clock(
            initial,
            config.timestamp.strict_ordering,
            Duration::from_millis(config.timestamp.max_spin_ms),
        ));
        let locking = Arc::new(LockingManager::new(
            config.repository.branching,
            revisions.clone(),
            model.clone(),
            areas,
        ));
        let reloaded = locking.reload_locks()?;
        let handlers = Arc::new(AccessHandlers::new());
        let pipeline = CommitPipeline::new(
            CommitSettings::from_config(&config),
            revisions.clone(),
            locking.clone(),
            timestamps.clone(),
            handlers.clone(),
            model.clone(),
        );
        let queries = QueryExecutor::new(&config.query, revisions.clone(), model.clone())?;
        let notifications = NotificationHub::new(config.notification.channel_capacity);

        tracing::info!(
            repository = %config.repository.name,
            branches = tree.len(),
            last_commit = %initial,
            lock_areas = reloaded,
            "repository opened"
        );

        Ok(Self {
            config,
            model,
            revisions,
            timestamps,
            locking,
            handlers,
            pipeline,
            sessions: SessionManager::new(),
            notifications,
            queries,
        })
    }

    pub fn config(&self) -> &ArborConfig {
        &self.config
    }

    pub fn model(&self) -> &Arc<ModelRegistry> {
        &self.model
    }

    pub fn revisions(&self) -> &Arc<RevisionStore> {
        &self.revisions
    }

    pub fn locking(&self) -> &Arc<LockingManager> {
        &self.locking
    }

    pub fn timestamps(&self) -> &Arc<TimestampAuthority> {
        &self.timestamps
    }

    /// Read and write access handlers.
    pub fn handlers(&self) -> &Arc<AccessHandlers> {
        &self.handlers
    }

    fn tree(&self) -> &Arc<BranchTree> {
        self.revisions.tree()
    }

    // ── Sessions and views ────────────────────────────────────────────────

    pub fn open_session(&self, user: &str, passive_updates: bool) -> SessionId {
        let info = self.sessions.open_session(user, passive_updates);
        arbor_observability::record_active_sessions(self.sessions.session_count());
        info.id
    }

    pub fn session(&self, id: SessionId) -> ArborResult<SessionInfo> {
        Ok(self.sessions.session(id)?)
    }

    pub fn set_passive_updates(&self, id: SessionId, enabled: bool) -> ArborResult<()> {
        Ok(self.sessions.set_passive_updates(id, enabled)?)
    }

    /// Close every view of the session, cancel its queries and drop its listeners.
    pub fn close_session(&self, id: SessionId) -> ArborResult<()> {
        let (_, views) = self.sessions.close_session(id)?;
        for view in &views {
            self.release_view(view);
        }
        let cancelled = self.queries.cancel_session(id);
        let listeners = self.notifications.unsubscribe_session(id);
        arbor_observability::record_active_sessions(self.sessions.session_count());
        tracing::debug!(session = %id, views = views.len(), cancelled, listeners, "session resources released");
        Ok(())
    }

    pub fn open_view(&self, session: SessionId, point: BranchPoint, read_only: bool) -> ArborResult<ViewId> {
        self.tree().require(point.branch)?;
        let view = self.sessions.open_view(session, point, read_only, None)?;
        Ok(view.id)
    }

    /// Open a view on an existing lock area, taking over its locks.
    pub fn open_durable_view(
        &self,
        session: SessionId,
        id: &DurableLockingId,
        read_only: bool,
    ) -> ArborResult<(ViewId, LockArea)> {
        let area = self
            .locking
            .lock_area(id)?
            .ok_or_else(|| StorageError::LockAreaNotFound(id.clone()))?;
        let view = self
            .sessions
            .open_view(session, area.branch_point, read_only, Some(id.clone()))?;
        match self.locking.open_durable_view(id, view.id, read_only) {
            Ok(area) => Ok((view.id, area)),
            Err(e) => {
                // The registry entry must go, but the area stays attached to whoever holds it.
                let _ = self.sessions.close_view(view.id);
                Err(e)
            }
        }
    }

    pub fn view(&self, id: ViewId) -> ArborResult<ViewInfo> {
        Ok(self.sessions.view(id)?)
    }

    pub fn views(&self, session: SessionId) -> ArborResult<Vec<ViewInfo>> {
        self.sessions.session(session)?;
        Ok(self.sessions.views(session))
    }

    /// Move a view to another branch point. Locks stay where they were taken.
    pub fn switch_view(&self, view: ViewId, point: BranchPoint) -> ArborResult<()> {
        self.tree().require(point.branch)?;
        Ok(self.sessions.set_branch_point(view, point)?)
    }

    pub fn close_view(&self, id: ViewId) -> ArborResult<()> {
        let view = self.sessions.close_view(id)?;
        self.release_view(&view);
        Ok(())
    }

    fn release_view(&self, view: &ViewInfo) {
        let released = self.locking.view_closed(view.id, view.durable.as_ref());
        if !released.is_empty() {
            self.publish_locks(view.session, view.id, view.branch_point.branch, LockChangeKind::Unlocked, &released);
        }
    }

    pub fn subscribe(
        &self,
        session: SessionId,
        scope: NotificationScope,
        branch: BranchId,
    ) -> ArborResult<(ListenerId, mpsc::Receiver<SessionEvent>)> {
        self.sessions.session(session)?;
        Ok(self.notifications.subscribe(session, scope, branch))
    }

    pub fn unsubscribe(&self, listener: ListenerId) -> bool {
        self.notifications.unsubscribe(listener)
    }

    // ── Branches ──────────────────────────────────────────────────────────

    pub fn main_branch(&self) -> Branch {
        self.tree().main()
    }

    pub fn branch(&self, id: BranchId) -> ArborResult<Branch> {
        Ok(self.tree().require(id)?)
    }

    pub fn branches(&self) -> Vec<Branch> {
        self.tree().all()
    }

    pub fn sub_branches(&self, id: BranchId) -> ArborResult<Vec<Branch>> {
        self.tree().require(id)?;
        Ok(self.tree().sub_branches(id))
    }

    /// `id` and its ancestors up to main, nearest first.
    pub fn branch_path(&self, id: BranchId) -> ArborResult<Vec<Branch>> {
        Ok(self.tree().lineage(id)?)
    }

    /// Fork `parent` at `base` (now when unspecified or in the future).
    pub fn create_branch(
        &self,
        origin: Option<SessionId>,
        parent: BranchId,
        name: &str,
        base: Timestamp,
    ) -> ArborResult<Branch> {
        let now = self.timestamps.now().max(self.timestamps.last_issued());
        let store = self.revisions.store().clone();
        let branch = self
            .tree()
            .create_branch(parent, name, base, now, |b| store.create_branch(b))?;
        self.notifications.publish(SessionEvent::Branch(BranchNotification {
            origin,
            branch: branch.id,
            name: branch.name.clone(),
            kind: BranchChangeKind::Created,
        }));
        Ok(branch)
    }

    pub fn rename_branch(&self, origin: Option<SessionId>, id: BranchId, name: &str) -> ArborResult<Branch> {
        let store = self.revisions.store().clone();
        let branch = self.tree().rename_branch(id, name, |b| store.rename_branch(b))?;
        tracing::info!(branch = %id, "branch renamed to {}", name);
        self.notifications.publish(SessionEvent::Branch(BranchNotification {
            origin,
            branch: branch.id,
            name: branch.name.clone(),
            kind: BranchChangeKind::Renamed,
        }));
        Ok(branch)
    }

    // ── Reads ─────────────────────────────────────────────────────────────

    /// Resolve `ids` at `point` for `session`. Every read handler sees the
    /// found revisions first and may reject the whole read.
    pub fn get_revisions(
        &self,
        session: SessionId,
        ids: &[ObjectId],
        point: BranchPoint,
    ) -> ArborResult<Vec<Option<ResolvedRevision>>> {
        self.sessions.session(session)?;
        let resolved = self.revisions.resolve_many(ids, point)?;
        let found: Vec<ResolvedRevision> = resolved.iter().flatten().cloned().collect();
        self.handlers
            .check_read(session, &found)
            .map_err(ArborError::ReadRejected)?;
        Ok(resolved)
    }

    pub fn revision_by_version(
        &self,
        id: ObjectId,
        branch: BranchId,
        version: Version,
    ) -> ArborResult<Option<Arc<Revision>>> {
        Ok(self.revisions.revision_by_version(id, branch, version)?)
    }

    /// Accepts timestamps between repository creation and now.
    pub fn validate_timestamp(&self, ts: Timestamp) -> ArborResult<()> {
        let now = self.timestamps.now().max(self.timestamps.last_finished());
        if ts > now {
            return Err(TimestampError::InFuture(ts).into());
        }
        let created = self.revisions.store().creation_time();
        if ts < created {
            return Err(TimestampError::BeforeCreation { requested: ts, created }.into());
        }
        Ok(())
    }

    pub fn last_commit_timestamp(&self) -> Timestamp {
        self.timestamps.last_finished()
    }

    /// Block until the next commit finishes or `timeout` runs out.
    pub fn wait_for_commit(&self, timeout: Duration) -> Timestamp {
        self.timestamps.wait_for_commit(timeout)
    }

    /// Block until every commit up to `ts` has finished. Returns false on timeout.
    pub fn wait_until_visible(&self, ts: Timestamp, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.timestamps.last_finished() >= ts {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.timestamps.wait_for_commit(deadline - now);
        }
    }

    pub fn change_set(&self, a: BranchPoint, b: BranchPoint) -> ArborResult<Vec<ObjectId>> {
        let mut ids: Vec<ObjectId> = self.revisions.change_set(a, b)?.into_iter().collect();
        ids.sort();
        Ok(ids)
    }

    pub fn merge_data(&self, source: BranchPoint, target: BranchPoint) -> ArborResult<MergeData> {
        self.revisions.merge_data(source, target)
    }

    /// Commit history ordered by timestamp. An unspecified `to` means no upper bound.
    pub fn commit_infos(&self, branch: Option<BranchId>, from: Timestamp, to: Timestamp) -> ArborResult<Vec<CommitInfo>> {
        if let Some(b) = branch {
            self.tree().require(b)?;
        }
        Ok(self.revisions.store().commit_infos(branch, from, to)?)
    }

    // ── Commits ───────────────────────────────────────────────────────────

    /// An empty commit request bound to `view`.
    pub fn new_commit(&self, view: ViewId) -> ArborResult<CommitRequest> {
        let view = self.sessions.view(view)?;
        let session = self.sessions.session(view.session)?;
        Ok(CommitRequest::new(view.session, view.owner(), &session.user).with_passive_updates(session.passive_updates))
    }

    pub fn commit(&self, request: CommitRequest) -> ArborResult<CommitOutcome> {
        self.sessions.view(request.owner.view)?;
        let origin = request.session;
        let view = request.owner.view;
        let requested_locks = request.locks_on_new_objects.clone();
        let started = Instant::now();
        match self.pipeline.commit(request) {
            Ok(outcome) => {
                arbor_observability::record_commit_metrics("committed", started.elapsed().as_micros() as u64);
                self.publish_commit(origin, view, &requested_locks, &outcome);
                Ok(outcome)
            }
            Err(e) => {
                arbor_observability::record_commit_metrics(e.reason_code(), started.elapsed().as_micros() as u64);
                Err(e.into())
            }
        }
    }

    fn publish_commit(
        &self,
        origin: SessionId,
        view: ViewId,
        requested_locks: &[(ObjectId, LockType)],
        outcome: &CommitOutcome,
    ) {
        let branch = outcome.info.branch;
        self.notifications.publish(SessionEvent::Commit(CommitNotification {
            origin,
            branch_point: outcome.branch_point(),
            previous_timestamp: outcome.previous_timestamp(),
            new_objects: outcome.new_objects.clone(),
            changed: outcome.changed.clone(),
            detached: outcome.detached.clone(),
            deltas: outcome.deltas.clone(),
        }));
        if !outcome.new_object_locks.is_empty() {
            let locks = requested_locks
                .iter()
                .map(|(id, t)| (outcome.id_mappings.get(id).copied().unwrap_or(*id), *t))
                .collect();
            self.notifications.publish(SessionEvent::LockChange(LockChangeNotification {
                origin,
                view,
                branch,
                kind: LockChangeKind::Locked,
                locks,
            }));
        }
        if !outcome.released_locks.is_empty() {
            self.publish_locks(origin, view, branch, LockChangeKind::Unlocked, &outcome.released_locks);
        }
    }

    // ── Explicit locking ──────────────────────────────────────────────────

    /// Lock `ids` for `view`, then check the client's `revision_keys`
    /// against the branch heads.
    pub fn lock(
        &self,
        view: ViewId,
        lock_type: LockType,
        ids: &[ObjectId],
        revision_keys: &[RevisionKey],
        recursive: bool,
        timeout: Duration,
    ) -> ArborResult<LockResult> {
        let info = self.sessions.view(view)?;
        let session = self.sessions.session(info.session)?;
        let owner = info.owner();
        let type_label = lock_type.to_string();

        let locks = match self.locking.lock_objects(&owner, lock_type, ids, recursive, timeout)? {
            LockOutcome::Granted(states) => states,
            LockOutcome::TimedOut { .. } => {
                arbor_observability::record_lock_metrics(&type_label, "timed_out");
                return Ok(LockResult {
                    timed_out: true,
                    ..LockResult::default()
                });
            }
        };

        let branch = info.branch_point.branch;
        let mut stale = Vec::new();
        for key in revision_keys {
            let head = match self.revisions.resolve(key.id, BranchPoint::head(branch)) {
                Ok(Some(head)) => head,
                Ok(None) => {
                    self.undo_lock(&owner, lock_type, ids, recursive);
                    return Err(LockError::ObjectNotFound(key.id).into());
                }
                Err(e) => {
                    self.undo_lock(&owner, lock_type, ids, recursive);
                    return Err(e);
                }
            };
            if head.key() != *key {
                stale.push(*key);
            }
        }

        if !stale.is_empty() && !session.passive_updates {
            self.undo_lock(&owner, lock_type, ids, recursive);
            arbor_observability::record_lock_metrics(&type_label, "stale");
            tracing::debug!(view = %view, stale = stale.len(), "lock request released on stale revisions");
            return Ok(LockResult {
                stale,
                ..LockResult::default()
            });
        }

        let required_timestamp = if stale.is_empty() {
            Timestamp::UNSPECIFIED
        } else {
            let on_branch: Vec<RevisionKey> = stale
                .iter()
                .map(|k| RevisionKey::new(k.id, branch, k.version))
                .collect();
            self.revisions.newest_head_timestamp(&on_branch)?
        };

        arbor_observability::record_lock_metrics(&type_label, "granted");
        let granted: Vec<(LockKey, LockType)> = locks.iter().map(|s| (s.key, lock_type)).collect();
        self.publish_locks(info.session, view, branch, LockChangeKind::Locked, &granted);
        Ok(LockResult {
            granted: true,
            timed_out: false,
            wait_for_update: !stale.is_empty(),
            stale,
            required_timestamp,
            locks,
        })
    }

    fn undo_lock(&self, owner: &LockOwner, lock_type: LockType, ids: &[ObjectId], recursive: bool) {
        if let Err(e) = self.locking.unlock_objects(owner, Some(lock_type), ids, recursive) {
            tracing::warn!(view = %owner.view, "failed to release {} locks: {}", lock_type, e);
        }
    }

    /// Release `lock_type` (every type when `None`) on `ids`.
    pub fn unlock(
        &self,
        view: ViewId,
        lock_type: Option<LockType>,
        ids: &[ObjectId],
        recursive: bool,
    ) -> ArborResult<Vec<(LockKey, LockType)>> {
        let info = self.sessions.view(view)?;
        let released = self.locking.unlock_objects(&info.owner(), lock_type, ids, recursive)?;
        if !released.is_empty() {
            self.publish_locks(info.session, view, info.branch_point.branch, LockChangeKind::Unlocked, &released);
        }
        Ok(released)
    }

    pub fn unlock_all(&self, view: ViewId) -> ArborResult<Vec<(LockKey, LockType)>> {
        let info = self.sessions.view(view)?;
        let released = self.locking.unlock_all_objects(&info.owner())?;
        if !released.is_empty() {
            self.publish_locks(info.session, view, info.branch_point.branch, LockChangeKind::Unlocked, &released);
        }
        Ok(released)
    }

    fn publish_locks(
        &self,
        origin: SessionId,
        view: ViewId,
        branch: BranchId,
        kind: LockChangeKind,
        locks: &[(LockKey, LockType)],
    ) {
        self.notifications.publish(SessionEvent::LockChange(LockChangeNotification {
            origin,
            view,
            branch,
            kind,
            locks: locks.iter().map(|(k, t)| (k.id, *t)).collect(),
        }));
    }

    // ── Lock areas ────────────────────────────────────────────────────────

    /// Give `view` a durable lock area seeded with the locks it already holds.
    pub fn create_lock_area(&self, view: ViewId) -> ArborResult<LockArea> {
        let info = self.sessions.view(view)?;
        if let Some(existing) = &info.durable {
            return Err(ArborError::InvalidArgument(format!("{} already uses lock area {}", view, existing)));
        }
        let session = self.sessions.session(info.session)?;
        let area = self.locking.create_lock_area(&info.owner(), &session.user)?;
        self.sessions.set_durable(view, Some(area.id.clone()))?;
        Ok(area)
    }

    pub fn lock_area(&self, id: &DurableLockingId) -> ArborResult<Option<LockArea>> {
        self.locking.lock_area(id)
    }

    pub fn lock_areas(&self, user: Option<&str>) -> ArborResult<Vec<LockArea>> {
        self.locking.lock_areas(user)
    }

    pub fn delete_lock_area(&self, id: &DurableLockingId) -> ArborResult<()> {
        self.locking.delete_lock_area(id)
    }

    // ── Queries ───────────────────────────────────────────────────────────

    /// Run `query` at the view's branch point. The query stops when the view
    /// or its session closes.
    pub fn submit_query(&self, view: ViewId, query: Query) -> ArborResult<QueryHandle> {
        let info = self.sessions.view(view)?;
        let cancel = self.sessions.query_token(view)?;
        let request = QueryRequest {
            session: info.session,
            view,
            point: info.branch_point,
            query,
        };
        Ok(self.queries.submit(request, cancel)?)
    }

    pub fn register_query_handler(&self, kind: &str, handler: Arc<dyn QueryHandler>) {
        self.queries.register_handler(kind, handler);
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────

    pub fn stats(&self) -> RepositoryStats {
        let locks = self.locking.stats();
        arbor_observability::record_lock_table(locks.locked_keys, locks.timed_out, locks.waits);
        RepositoryStats {
            commits: self.pipeline.stats(),
            locks,
            timestamps: self.timestamps.stats(),
            notifications: self.notifications.stats(),
            queries: self.queries.stats(),
            sessions: self.sessions.session_count(),
            views: self.sessions.view_count(),
        }
    }

    /// Stop query workers and abort pending timestamp spins.
    pub fn shutdown(&self) {
        self.queries.shutdown();
        self.timestamps.cancel();
        tracing::info!(repository = %self.config.repository.name, "repository shut down");
    }
}
