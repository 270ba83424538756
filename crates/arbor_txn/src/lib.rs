pub mod commit;
pub mod handler;
pub mod lock;
pub mod locking;
pub mod timestamp;

pub use commit::{
    CommitContext, CommitOutcome, CommitPipeline, CommitRequest, CommitSettings, CommitState, CommitStatsSnapshot,
};
pub use handler::{AccessHandlers, ReadAccessHandler, WriteAccessHandler};
pub use lock::{LockOutcome, LockState, LockStatsSnapshot, LockTable};
pub use locking::{LockHolder, LockKey, LockOwner, LockingManager, ObjectLockOutcome, ObjectLockState};
pub use timestamp::{Clock, IssuedTimestamp, SystemClock, TimestampAuthority, TimestampStatsSnapshot};

#[cfg(test)]
mod tests;
