//! Query executor.
//!
//! Queries run on a fixed pool of worker threads fed by a bounded submission
//! queue. Each query streams its rows into a bounded `tokio::sync::mpsc`
//! channel, so a slow consumer parks the producing worker instead of growing
//! memory. Every query carries a `CancellationToken` derived from its view;
//! a blocked producer wakes up as soon as the token fires.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use arbor_common::config::QueryConfig;
use arbor_common::error::QueryError;
use arbor_common::schema::ModelRegistry;
use arbor_common::types::{BranchPoint, ObjectId, SessionId, ViewId};
use arbor_common::value::FieldValue;
use arbor_storage::{Revision, RevisionStore, XRef};

pub const INSTANCES_OF: &str = "instances_of";
pub const XREFS: &str = "xrefs";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryId(pub u64);

/// A named query with its parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub kind: String,
    pub params: BTreeMap<String, FieldValue>,
}

impl Query {
    pub fn new(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, name: &str, value: FieldValue) -> Self {
        self.params.insert(name.to_string(), value);
        self
    }

    /// Live instances of `class`.
    pub fn instances_of(class: &str) -> Self {
        Self::new(INSTANCES_OF).with_param("class", FieldValue::Text(class.to_string()))
    }

    /// Live references pointing at any of `targets`.
    pub fn xrefs(targets: &[ObjectId]) -> Self {
        Self::new(XREFS).with_param(
            "targets",
            FieldValue::List(targets.iter().map(|id| FieldValue::Ref(*id)).collect()),
        )
    }
}

#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub session: SessionId,
    pub view: ViewId,
    pub point: BranchPoint,
    pub query: Query,
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryRow {
    Revision(Arc<Revision>),
    XRef(XRef),
    Value(FieldValue),
}

/// One item of a result stream. The stream ends after `Completed` or
/// `Failed`; a cancelled query closes the stream without either.
#[derive(Debug)]
pub enum QueryEvent {
    Row(QueryRow),
    Completed { rows: u64 },
    Failed(QueryError),
}

/// What a handler sees while it runs.
pub struct QueryContext<'a> {
    pub revisions: &'a RevisionStore,
    pub model: &'a ModelRegistry,
    pub session: SessionId,
    pub point: BranchPoint,
    pub params: &'a BTreeMap<String, FieldValue>,
    cancel: &'a CancellationToken,
}

impl QueryContext<'_> {
    pub fn param(&self, name: &str) -> Result<&FieldValue, QueryError> {
        self.params
            .get(name)
            .ok_or_else(|| QueryError::Failed(format!("missing parameter '{}'", name)))
    }

    pub fn text_param(&self, name: &str) -> Result<&str, QueryError> {
        match self.param(name)? {
            FieldValue::Text(s) => Ok(s),
            other => Err(QueryError::Failed(format!("parameter '{}' is not text: {}", name, other))),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Receives rows from a running handler.
pub struct QuerySink<'a> {
    tx: &'a mpsc::Sender<QueryEvent>,
    cancel: &'a CancellationToken,
    runtime: &'a tokio::runtime::Runtime,
    rows: u64,
}

impl QuerySink<'_> {
    /// Hand over one row, waiting while the consumer is behind. Returns
    /// `false` once the query is cancelled or the consumer went away; the
    /// handler should stop then.
    pub fn push(&mut self, row: QueryRow) -> bool {
        let sent = self.send(QueryEvent::Row(row));
        if sent {
            self.rows += 1;
        }
        sent
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    fn send(&self, event: QueryEvent) -> bool {
        let tx = self.tx;
        let cancel = self.cancel;
        self.runtime.block_on(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => false,
                sent = tx.send(event) => sent.is_ok(),
            }
        })
    }
}

/// A query implementation. Built-ins are registered as `instances_of` and `xrefs`.
pub trait QueryHandler: Send + Sync {
    fn execute(&self, ctx: &QueryContext<'_>, sink: &mut QuerySink<'_>) -> Result<(), QueryError>;
}

struct InstancesOfHandler;

impl QueryHandler for InstancesOfHandler {
    fn execute(&self, ctx: &QueryContext<'_>, sink: &mut QuerySink<'_>) -> Result<(), QueryError> {
        let class = ctx.text_param("class")?;
        if ctx.model.class(class).is_none() {
            return Err(QueryError::UnknownClass(class.to_string()));
        }
        let ids = ctx
            .revisions
            .store()
            .object_ids()
            .map_err(|e| QueryError::Failed(e.to_string()))?;
        for id in ids {
            if ctx.is_cancelled() {
                return Ok(());
            }
            let resolved = ctx
                .revisions
                .resolve(id, ctx.point)
                .map_err(|e| QueryError::Failed(e.to_string()))?;
            if let Some(r) = resolved {
                if r.revision().class == class && !sink.push(QueryRow::Revision(r.revision().clone())) {
                    return Ok(());
                }
            }
        }
        Ok(())
    }
}

struct XRefsHandler;

impl QueryHandler for XRefsHandler {
    fn execute(&self, ctx: &QueryContext<'_>, sink: &mut QuerySink<'_>) -> Result<(), QueryError> {
        let targets: HashSet<ObjectId> = ctx.param("targets")?.references().into_iter().collect();
        let xrefs = ctx
            .revisions
            .xrefs(&targets, ctx.point)
            .map_err(|e| QueryError::Failed(e.to_string()))?;
        for xref in xrefs {
            if !sink.push(QueryRow::XRef(xref)) {
                break;
            }
        }
        Ok(())
    }
}

/// How a result stream ended.
#[derive(Debug)]
pub enum QueryEnd {
    Completed,
    Failed(QueryError),
    Cancelled,
}

/// Caller side of a submitted query.
#[derive(Debug)]
pub struct QueryHandle {
    pub id: QueryId,
    results: mpsc::Receiver<QueryEvent>,
    cancel: CancellationToken,
}

impl QueryHandle {
    pub async fn next(&mut self) -> Option<QueryEvent> {
        self.results.recv().await
    }

    /// For consumers on plain threads. Must not be called from async code.
    pub fn blocking_next(&mut self) -> Option<QueryEvent> {
        self.results.blocking_recv()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Drain the stream.
    pub async fn collect(mut self) -> (Vec<QueryRow>, QueryEnd) {
        let mut rows = Vec::new();
        while let Some(event) = self.results.recv().await {
            match event {
                QueryEvent::Row(row) => rows.push(row),
                QueryEvent::Completed { .. } => return (rows, QueryEnd::Completed),
                QueryEvent::Failed(e) => return (rows, QueryEnd::Failed(e)),
            }
        }
        (rows, QueryEnd::Cancelled)
    }
}

struct Job {
    id: QueryId,
    request: QueryRequest,
    tx: mpsc::Sender<QueryEvent>,
    cancel: CancellationToken,
}

#[derive(Debug, Default)]
struct QueryStats {
    submitted: AtomicU64,
    rejected: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryStatsSnapshot {
    pub submitted: u64,
    pub rejected: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub running: usize,
}

struct Shared {
    revisions: Arc<RevisionStore>,
    model: Arc<ModelRegistry>,
    handlers: RwLock<HashMap<String, Arc<dyn QueryHandler>>>,
    running: DashMap<QueryId, (SessionId, CancellationToken)>,
    stats: QueryStats,
}

impl Shared {
    fn run(&self, runtime: &tokio::runtime::Runtime, job: Job) {
        let Job {
            id,
            request,
            tx,
            cancel,
        } = job;
        let mut sink = QuerySink {
            tx: &tx,
            cancel: &cancel,
            runtime,
            rows: 0,
        };

        let result = if cancel.is_cancelled() {
            Ok(())
        } else {
            let handler = self.handlers.read().get(&request.query.kind).cloned();
            match handler {
                Some(handler) => {
                    let ctx = QueryContext {
                        revisions: &self.revisions,
                        model: &self.model,
                        session: request.session,
                        point: request.point,
                        params: &request.query.params,
                        cancel: &cancel,
                    };
                    handler.execute(&ctx, &mut sink)
                }
                None => Err(QueryError::Failed(format!(
                    "no handler registered for '{}'",
                    request.query.kind
                ))),
            }
        };
        self.running.remove(&id);

        let rows = sink.rows();
        if cancel.is_cancelled() {
            self.stats.cancelled.fetch_add(1, Ordering::Relaxed);
            arbor_observability::record_query_metrics("cancelled", rows);
            tracing::debug!(query = id.0, view = %request.view, rows, "query cancelled");
            return;
        }
        match result {
            Ok(()) => {
                self.stats.completed.fetch_add(1, Ordering::Relaxed);
                arbor_observability::record_query_metrics("completed", rows);
                sink.send(QueryEvent::Completed { rows });
            }
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                arbor_observability::record_query_metrics("failed", rows);
                tracing::warn!(query = id.0, view = %request.view, kind = %request.query.kind, "query failed: {}", e);
                sink.send(QueryEvent::Failed(e));
            }
        }
    }
}

pub struct QueryExecutor {
    shared: Arc<Shared>,
    submit: Mutex<Option<std_mpsc::SyncSender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    queue_capacity: usize,
    result_capacity: usize,
    next_id: AtomicU64,
}

impl QueryExecutor {
    pub fn new(
        config: &QueryConfig,
        revisions: Arc<RevisionStore>,
        model: Arc<ModelRegistry>,
    ) -> Result<Self, QueryError> {
        let mut handlers: HashMap<String, Arc<dyn QueryHandler>> = HashMap::new();
        handlers.insert(INSTANCES_OF.to_string(), Arc::new(InstancesOfHandler));
        handlers.insert(XREFS.to_string(), Arc::new(XRefsHandler));
        let shared = Arc::new(Shared {
            revisions,
            model,
            handlers: RwLock::new(handlers),
            running: DashMap::new(),
            stats: QueryStats::default(),
        });

        let queue_capacity = config.queue_capacity.max(1);
        let (tx, rx) = std_mpsc::sync_channel::<Job>(queue_capacity);
        let rx = Arc::new(Mutex::new(rx));
        let mut workers = Vec::new();
        for n in 0..config.workers.max(1) {
            let shared = shared.clone();
            let rx = rx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("arbor-query-{}", n))
                .spawn(move || worker_loop(shared, rx))
                .map_err(|e| QueryError::Failed(format!("failed to spawn query worker: {}", e)))?;
            workers.push(handle);
        }
        tracing::debug!(workers = workers.len(), queue = queue_capacity, "query executor started");

        Ok(Self {
            shared,
            submit: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            queue_capacity,
            result_capacity: config.result_capacity.max(1),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn register_handler(&self, kind: &str, handler: Arc<dyn QueryHandler>) {
        self.shared.handlers.write().insert(kind.to_string(), handler);
    }

    pub fn unregister_handler(&self, kind: &str) -> bool {
        self.shared.handlers.write().remove(kind).is_some()
    }

    /// Queue `request`. `cancel` stops the query; pass a token derived from
    /// the owning view so closing the view ends it.
    pub fn submit(&self, request: QueryRequest, cancel: CancellationToken) -> Result<QueryHandle, QueryError> {
        let submit = self.submit.lock();
        let sender = submit.as_ref().ok_or(QueryError::ExecutorShutdown)?;
        let id = QueryId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(self.result_capacity);
        self.shared.running.insert(id, (request.session, cancel.clone()));
        let job = Job {
            id,
            request,
            tx,
            cancel: cancel.clone(),
        };
        match sender.try_send(job) {
            Ok(()) => {
                self.shared.stats.submitted.fetch_add(1, Ordering::Relaxed);
                Ok(QueryHandle {
                    id,
                    results: rx,
                    cancel,
                })
            }
            Err(e) => {
                self.shared.running.remove(&id);
                self.shared.stats.rejected.fetch_add(1, Ordering::Relaxed);
                arbor_observability::record_query_metrics("rejected", 0);
                match e {
                    std_mpsc::TrySendError::Full(_) => {
                        tracing::warn!(query = id.0, capacity = self.queue_capacity, "query queue full");
                        Err(QueryError::QueueFull {
                            capacity: self.queue_capacity,
                        })
                    }
                    std_mpsc::TrySendError::Disconnected(_) => Err(QueryError::ExecutorShutdown),
                }
            }
        }
    }

    pub fn cancel(&self, id: QueryId) -> bool {
        match self.shared.running.get(&id) {
            Some(entry) => {
                entry.value().1.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every query of `session`. Returns how many were cancelled.
    pub fn cancel_session(&self, session: SessionId) -> usize {
        let mut n = 0;
        for entry in self.shared.running.iter() {
            if entry.value().0 == session {
                entry.value().1.cancel();
                n += 1;
            }
        }
        n
    }

    /// Cancel running queries, stop accepting new ones and join the workers.
    pub fn shutdown(&self) {
        for entry in self.shared.running.iter() {
            entry.value().1.cancel();
        }
        self.submit.lock().take();
        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for handle in workers {
            if handle.join().is_err() {
                tracing::error!("query worker panicked");
            }
        }
    }

    pub fn stats(&self) -> QueryStatsSnapshot {
        let s = &self.shared.stats;
        QueryStatsSnapshot {
            submitted: s.submitted.load(Ordering::Relaxed),
            rejected: s.rejected.load(Ordering::Relaxed),
            completed: s.completed.load(Ordering::Relaxed),
            failed: s.failed.load(Ordering::Relaxed),
            cancelled: s.cancelled.load(Ordering::Relaxed),
            running: self.shared.running.len(),
        }
    }
}

impl Drop for QueryExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: Arc<Shared>, rx: Arc<Mutex<std_mpsc::Receiver<Job>>>) {
    let runtime = match tokio::runtime::Builder::new_current_thread().build() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!("query worker could not build its runtime: {}", e);
            return;
        }
    };
    loop {
        let job = rx.lock().recv();
        match job {
            Ok(job) => shared.run(&runtime, job),
            Err(_) => break,
        }
    }
}
