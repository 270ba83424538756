pub mod notify;
pub mod query;
pub mod repository;
pub mod session;

pub use notify::{
    BranchChangeKind, BranchNotification, CommitNotification, ListenerId, LockChangeKind, LockChangeNotification,
    NotificationHub, NotificationScope, NotificationStatsSnapshot, SessionEvent,
};
pub use query::{
    Query, QueryContext, QueryEnd, QueryEvent, QueryExecutor, QueryHandle, QueryHandler, QueryId, QueryRequest,
    QueryRow, QuerySink, QueryStatsSnapshot,
};
pub use repository::{LockResult, Repository, RepositoryStats};
pub use session::{SessionInfo, SessionManager, ViewInfo};
