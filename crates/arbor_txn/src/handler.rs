//! Hooks for layers that observe commits and reads without taking part in locking.

use std::sync::Arc;

use parking_lot::RwLock;

use arbor_common::types::SessionId;
use arbor_storage::ResolvedRevision;

use crate::commit::CommitContext;

/// Observes commits. `before_commit` runs after validation and before the
/// store write; an error there vetoes the commit.
pub trait WriteAccessHandler: Send + Sync {
    fn before_commit(&self, _ctx: &CommitContext) -> Result<(), String> {
        Ok(())
    }

    /// Runs once the commit is durable. Errors are logged.
    fn after_commit(&self, _ctx: &CommitContext) -> Result<(), String> {
        Ok(())
    }

    /// Errors are logged.
    fn on_rollback(&self, _ctx: &CommitContext, _reason: &str) -> Result<(), String> {
        Ok(())
    }
}

pub trait ReadAccessHandler: Send + Sync {
    /// Inspect revisions before they are handed to `session`. An error rejects the read.
    fn before_sending_revisions(&self, session: SessionId, revisions: &[ResolvedRevision]) -> Result<(), String>;
}

#[derive(Default)]
pub struct AccessHandlers {
    write: RwLock<Vec<Arc<dyn WriteAccessHandler>>>,
    read: RwLock<Vec<Arc<dyn ReadAccessHandler>>>,
}

impl AccessHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_write_handler(&self, handler: Arc<dyn WriteAccessHandler>) {
        self.write.write().push(handler);
    }

    pub fn remove_write_handler(&self, handler: &Arc<dyn WriteAccessHandler>) {
        self.write.write().retain(|h| !Arc::ptr_eq(h, handler));
    }

    pub fn add_read_handler(&self, handler: Arc<dyn ReadAccessHandler>) {
        self.read.write().push(handler);
    }

    pub fn remove_read_handler(&self, handler: &Arc<dyn ReadAccessHandler>) {
        self.read.write().retain(|h| !Arc::ptr_eq(h, handler));
    }

    /// Snapshot so handlers run without the registry lock held.
    pub fn write_handlers(&self) -> Vec<Arc<dyn WriteAccessHandler>> {
        self.write.read().clone()
    }

    pub fn read_handlers(&self) -> Vec<Arc<dyn ReadAccessHandler>> {
        self.read.read().clone()
    }

    /// Run every read handler; the first error wins.
    pub fn check_read(&self, session: SessionId, revisions: &[ResolvedRevision]) -> Result<(), String> {
        for handler in self.read_handlers() {
            handler.before_sending_revisions(session, revisions)?;
        }
        Ok(())
    }
}
