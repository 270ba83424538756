pub mod accessor;
pub mod branch;
pub mod delta;
pub mod lock_area;
pub mod mem_store;
pub mod revision;
pub mod revision_store;

pub use accessor::{CommitBatch, CommitInfo, Segment, Store, StoreWriter, XRef};
pub use branch::{Branch, BranchTree, MAIN_BRANCH_NAME};
pub use delta::{FeatureDelta, RevisionDelta};
pub use lock_area::{FileLockAreaStore, LockArea, LockAreaStore, MemLockAreaStore};
pub use mem_store::MemStore;
pub use revision::Revision;
pub use revision_store::{MergeData, PointerRevision, ResolvedRevision, RevisionStore};
