//! Cross-session event fan-out.
//!
//! Every listener owns a bounded `tokio::sync::mpsc` queue. Publishing never
//! blocks: an event that does not fit into a listener's queue is dropped for
//! that listener only, so one slow session cannot stall commits.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use arbor_common::types::{BranchId, BranchPoint, LockType, ObjectId, RevisionKey, SessionId, Timestamp, ViewId};
use arbor_storage::RevisionDelta;

/// Which events a listener wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationScope {
    /// Commit and lock events of the listener's branch.
    ThisBranch,
    /// Everything, branch lifecycle included.
    AnyBranch,
    None,
}

#[derive(Debug, Clone)]
pub struct CommitNotification {
    pub origin: SessionId,
    pub branch_point: BranchPoint,
    pub previous_timestamp: Timestamp,
    pub new_objects: Vec<(ObjectId, String)>,
    pub changed: Vec<RevisionKey>,
    pub detached: Vec<ObjectId>,
    pub deltas: Vec<RevisionDelta>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockChangeKind {
    Locked,
    Unlocked,
}

#[derive(Debug, Clone)]
pub struct LockChangeNotification {
    pub origin: SessionId,
    pub view: ViewId,
    pub branch: BranchId,
    pub kind: LockChangeKind,
    pub locks: Vec<(ObjectId, LockType)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchChangeKind {
    Created,
    Renamed,
}

#[derive(Debug, Clone)]
pub struct BranchNotification {
    pub origin: Option<SessionId>,
    pub branch: BranchId,
    pub name: String,
    pub kind: BranchChangeKind,
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    Commit(CommitNotification),
    LockChange(LockChangeNotification),
    Branch(BranchNotification),
}

impl SessionEvent {
    fn origin(&self) -> Option<SessionId> {
        match self {
            SessionEvent::Commit(c) => Some(c.origin),
            SessionEvent::LockChange(l) => Some(l.origin),
            SessionEvent::Branch(b) => b.origin,
        }
    }

    /// Branch the event belongs to; `None` for branch lifecycle events.
    fn branch(&self) -> Option<BranchId> {
        match self {
            SessionEvent::Commit(c) => Some(c.branch_point.branch),
            SessionEvent::LockChange(l) => Some(l.branch),
            SessionEvent::Branch(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub u64);

struct Listener {
    session: SessionId,
    scope: NotificationScope,
    branch: BranchId,
    tx: mpsc::Sender<SessionEvent>,
}

impl Listener {
    fn wants(&self, event: &SessionEvent) -> bool {
        if event.origin() == Some(self.session) {
            return false;
        }
        match self.scope {
            NotificationScope::None => false,
            NotificationScope::AnyBranch => true,
            NotificationScope::ThisBranch => event.branch() == Some(self.branch),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotificationStatsSnapshot {
    pub published: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub listeners: usize,
}

pub struct NotificationHub {
    listeners: Mutex<HashMap<ListenerId, Listener>>,
    capacity: usize,
    next_id: AtomicU64,
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl NotificationHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            listeners: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
            next_id: AtomicU64::new(1),
            published: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Register a listener for `session`. `branch` anchors the `ThisBranch` scope.
    pub fn subscribe(
        &self,
        session: SessionId,
        scope: NotificationScope,
        branch: BranchId,
    ) -> (ListenerId, mpsc::Receiver<SessionEvent>) {
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().insert(
            id,
            Listener {
                session,
                scope,
                branch,
                tx,
            },
        );
        tracing::debug!(session = %session, listener = id.0, ?scope, "listener registered");
        (id, rx)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.listeners.lock().remove(&id).is_some()
    }

    /// Drop every listener of `session`. Returns how many were removed.
    pub fn unsubscribe_session(&self, session: SessionId) -> usize {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|_, l| l.session != session);
        before - listeners.len()
    }

    /// Deliver `event` to every interested listener. Returns the number of
    /// listeners that received it.
    pub fn publish(&self, event: SessionEvent) -> usize {
        self.published.fetch_add(1, Ordering::Relaxed);
        let mut delivered = 0;
        let mut closed = Vec::new();
        {
            let listeners = self.listeners.lock();
            for (id, listener) in listeners.iter() {
                if !listener.wants(&event) {
                    continue;
                }
                match listener.tx.try_send(event.clone()) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        arbor_observability::record_notification_dropped();
                        tracing::warn!(session = %listener.session, listener = id.0, "listener queue full, event dropped");
                    }
                    Err(TrySendError::Closed(_)) => closed.push(*id),
                }
            }
        }
        if !closed.is_empty() {
            let mut listeners = self.listeners.lock();
            for id in closed {
                listeners.remove(&id);
            }
        }
        self.delivered.fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    pub fn stats(&self) -> NotificationStatsSnapshot {
        NotificationStatsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            listeners: self.listener_count(),
        }
    }
}
