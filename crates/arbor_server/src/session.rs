//! Session and view registry.
//!
//! A session owns views; a view pins a branch point and may carry a durable
//! locking id. Cancellation tokens form a tree (session -> view -> query) so
//! closing either end stops everything running underneath it.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use arbor_common::error::SessionError;
use arbor_common::types::{BranchPoint, DurableLockingId, SessionId, ViewId};
use arbor_txn::LockOwner;

#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: SessionId,
    pub user: String,
    pub passive_updates: bool,
}

#[derive(Debug, Clone)]
pub struct ViewInfo {
    pub id: ViewId,
    pub session: SessionId,
    pub branch_point: BranchPoint,
    pub read_only: bool,
    pub durable: Option<DurableLockingId>,
}

impl ViewInfo {
    pub fn owner(&self) -> LockOwner {
        LockOwner {
            view: self.id,
            branch_point: self.branch_point,
            read_only: self.read_only,
            durable: self.durable.clone(),
        }
    }
}

struct SessionEntry {
    info: SessionInfo,
    cancel: CancellationToken,
}

struct ViewEntry {
    info: ViewInfo,
    cancel: CancellationToken,
}

pub struct SessionManager {
    sessions: DashMap<SessionId, SessionEntry>,
    views: DashMap<ViewId, ViewEntry>,
    next_session: AtomicU64,
    next_view: AtomicU64,
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            views: DashMap::new(),
            next_session: AtomicU64::new(1),
            next_view: AtomicU64::new(1),
        }
    }

    pub fn open_session(&self, user: &str, passive_updates: bool) -> SessionInfo {
        let info = SessionInfo {
            id: SessionId(self.next_session.fetch_add(1, Ordering::Relaxed)),
            user: user.to_string(),
            passive_updates,
        };
        self.sessions.insert(
            info.id,
            SessionEntry {
                info: info.clone(),
                cancel: CancellationToken::new(),
            },
        );
        tracing::info!(session = %info.id, user = %info.user, "session opened");
        info
    }

    pub fn session(&self, id: SessionId) -> Result<SessionInfo, SessionError> {
        self.sessions
            .get(&id)
            .map(|e| e.info.clone())
            .ok_or(SessionError::SessionNotFound(id))
    }

    pub fn set_passive_updates(&self, id: SessionId, enabled: bool) -> Result<(), SessionError> {
        let mut entry = self.sessions.get_mut(&id).ok_or(SessionError::SessionNotFound(id))?;
        entry.info.passive_updates = enabled;
        Ok(())
    }

    pub fn open_view(
        &self,
        session: SessionId,
        branch_point: BranchPoint,
        read_only: bool,
        durable: Option<DurableLockingId>,
    ) -> Result<ViewInfo, SessionError> {
        // Held until the view is registered so `close_session` can not slip in between.
        let owner = self
            .sessions
            .get(&session)
            .ok_or(SessionError::SessionNotFound(session))?;
        let cancel = owner.cancel.child_token();
        let info = ViewInfo {
            id: ViewId(self.next_view.fetch_add(1, Ordering::Relaxed)),
            session,
            branch_point,
            read_only,
            durable,
        };
        self.views.insert(
            info.id,
            ViewEntry {
                info: info.clone(),
                cancel,
            },
        );
        drop(owner);
        tracing::debug!(session = %session, view = %info.id, point = %branch_point, "view opened");
        Ok(info)
    }

    pub fn view(&self, id: ViewId) -> Result<ViewInfo, SessionError> {
        self.views
            .get(&id)
            .map(|e| e.info.clone())
            .ok_or(SessionError::ViewNotFound(id))
    }

    /// Views of `session`, ordered by id.
    pub fn views(&self, session: SessionId) -> Vec<ViewInfo> {
        let mut out: Vec<ViewInfo> = self
            .views
            .iter()
            .filter(|e| e.info.session == session)
            .map(|e| e.info.clone())
            .collect();
        out.sort_by_key(|v| v.id);
        out
    }

    pub fn set_durable(&self, id: ViewId, durable: Option<DurableLockingId>) -> Result<(), SessionError> {
        let mut entry = self.views.get_mut(&id).ok_or(SessionError::ViewNotFound(id))?;
        entry.info.durable = durable;
        Ok(())
    }

    pub fn set_branch_point(&self, id: ViewId, point: BranchPoint) -> Result<(), SessionError> {
        let mut entry = self.views.get_mut(&id).ok_or(SessionError::ViewNotFound(id))?;
        entry.info.branch_point = point;
        Ok(())
    }

    /// Token for work running on behalf of `view`; cancelled when the view or its session closes.
    pub fn query_token(&self, view: ViewId) -> Result<CancellationToken, SessionError> {
        self.views
            .get(&view)
            .map(|e| e.cancel.child_token())
            .ok_or(SessionError::ViewNotFound(view))
    }

    /// Remove `view` and cancel everything running on it.
    pub fn close_view(&self, id: ViewId) -> Result<ViewInfo, SessionError> {
        let (_, entry) = self.views.remove(&id).ok_or(SessionError::ViewNotFound(id))?;
        entry.cancel.cancel();
        tracing::debug!(view = %id, "view closed");
        Ok(entry.info)
    }

    /// Remove `session` with all of its views. The removed views are returned
    /// so the caller can release their locks.
    pub fn close_session(&self, id: SessionId) -> Result<(SessionInfo, Vec<ViewInfo>), SessionError> {
        let (_, entry) = self.sessions.remove(&id).ok_or(SessionError::SessionNotFound(id))?;
        entry.cancel.cancel();
        let ids: Vec<ViewId> = self.views(id).into_iter().map(|v| v.id).collect();
        let views = ids
            .into_iter()
            .filter_map(|v| self.views.remove(&v).map(|(_, e)| e.info))
            .collect();
        tracing::info!(session = %id, user = %entry.info.user, "session closed");
        Ok((entry.info, views))
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn view_count(&self) -> usize {
        self.views.len()
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}
