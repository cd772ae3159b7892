use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::backup::{BackupRequest, BackupSession};
use crate::config::ConnectionOptions;
use crate::engine::{Engine, EngineHandle, VerboseEngine};
use crate::error::{ErrorCode, SqlSchedulerError};
use crate::events::{Event, EventSink};
use crate::queue::{LaneId, OperationKind, OperationQueue, Pending, Task};
use crate::results::{CustomDbRow, ResultSet, RowMap, RunResult};
use crate::sqlite::SqliteEngine;
use crate::statement::Statement;
use crate::types::{Limit, Params, SchedulingPolicy};

/// Lifecycle of a [`Connection`].
///
/// A connection only exists once its engine handle is open, so there is no opening state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    /// `close()` is queued; new work is refused.
    Closing,
    Closed,
}

pub(crate) struct ConnectionInner {
    options: ConnectionOptions,
    engine: Arc<dyn EngineHandle>,
    queue: Arc<OperationQueue>,
    state: Mutex<ConnectionState>,
    events: EventSink,
    unfinished_backups: AtomicUsize,
}

impl ConnectionInner {
    fn lock_state(&self) -> MutexGuard<'_, ConnectionState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn state(&self) -> ConnectionState {
        *self.lock_state()
    }

    fn set_state(&self, state: ConnectionState) {
        *self.lock_state() = state;
    }

    pub(crate) fn allocate_lane(&self) -> LaneId {
        self.queue.allocate_lane()
    }

    pub(crate) fn backup_started(&self) {
        self.unfinished_backups.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn backup_released(&self) {
        self.unfinished_backups.fetch_sub(1, Ordering::AcqRel);
    }

    fn unfinished_backups(&self) -> usize {
        self.unfinished_backups.load(Ordering::Acquire)
    }

    /// Queue `work` unless the connection has stopped accepting operations.
    ///
    /// The lifecycle lock is held across the queue submission so nothing slips in behind a
    /// close. Lock order is always lifecycle, then queue.
    pub(crate) fn try_submit<T, F, Fut>(
        self: &Arc<Self>,
        kind: OperationKind,
        lane: Option<LaneId>,
        work: F,
    ) -> Result<Pending<T>, SqlSchedulerError>
    where
        T: Send + 'static,
        F: FnOnce(Arc<dyn EngineHandle>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, SqlSchedulerError>> + Send + 'static,
    {
        let state = self.lock_state();
        match *state {
            ConnectionState::Open => Ok(self.enqueue(kind, lane, work)),
            ConnectionState::Closing => Err(SqlSchedulerError::misuse("Database is closing")),
            ConnectionState::Closed => Err(closed()),
        }
    }

    pub(crate) fn submit<T, F, Fut>(
        self: &Arc<Self>,
        kind: OperationKind,
        lane: Option<LaneId>,
        work: F,
    ) -> Pending<T>
    where
        T: Send + 'static,
        F: FnOnce(Arc<dyn EngineHandle>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, SqlSchedulerError>> + Send + 'static,
    {
        self.try_submit(kind, lane, work)
            .unwrap_or_else(Pending::failed)
    }

    /// Queue without a lifecycle check. Callers hold the lifecycle lock.
    fn enqueue<T, F, Fut>(
        self: &Arc<Self>,
        kind: OperationKind,
        lane: Option<LaneId>,
        work: F,
    ) -> Pending<T>
    where
        T: Send + 'static,
        F: FnOnce(Arc<dyn EngineHandle>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, SqlSchedulerError>> + Send + 'static,
    {
        let engine = Arc::clone(&self.engine);
        let conn = Arc::downgrade(self);
        let (task, pending) = Task::new(kind, self.events.clone(), move || async move {
            let outcome = work(engine).await;
            if let Err(err) = &outcome {
                if err.is_fatal() {
                    if let Some(conn) = conn.upgrade() {
                        conn.mark_lost(err);
                    }
                }
            }
            outcome
        });
        self.queue.submit(Box::new(task), lane, kind.is_exclusive());
        pending
    }

    /// The engine is gone; nothing more can run on this connection.
    fn mark_lost(&self, err: &SqlSchedulerError) {
        warn!(db_path = %self.options.db_path, error = %err, "connection lost");
        self.set_state(ConnectionState::Closed);
        self.queue.fail_pending(closed());
    }

    fn finish_close(&self) {
        self.set_state(ConnectionState::Closed);
        self.queue.fail_pending(closed());
        debug!(db_path = %self.options.db_path, "connection closed");
        self.events.emit(Event::Close);
    }
}

/// Asynchronous handle to one database connection.
///
/// Clones share the same engine handle and operation queue. Every operation is submitted
/// when the method is called; the returned [`Pending`] resolves with its outcome and may be
/// awaited later or dropped.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("db_path", &self.inner.options.db_path)
            .field("state", &self.state())
            .field("policy", &self.policy())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Open a connection on the rusqlite engine.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` for invalid options or the engine error when the database cannot
    /// be opened.
    pub async fn open(options: ConnectionOptions) -> Result<Self, SqlSchedulerError> {
        Self::open_with(Arc::new(SqliteEngine), options).await
    }

    /// Open a connection on a caller-supplied engine.
    ///
    /// Must be called from within a tokio runtime; queued operations are spawned on it.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` for invalid options or the engine error when the database cannot
    /// be opened.
    pub async fn open_with(
        engine: Arc<dyn Engine>,
        options: ConnectionOptions,
    ) -> Result<Self, SqlSchedulerError> {
        options.validate()?;
        let engine: Arc<dyn Engine> = if options.verbose {
            Arc::new(VerboseEngine::new(engine))
        } else {
            engine
        };
        let events = EventSink::new(options.event_capacity);
        let handle = engine.open(&options, events.clone()).await?;
        let queue = OperationQueue::new(options.policy, Handle::current());
        debug!(db_path = %options.db_path, policy = ?options.policy, "connection opened");

        let conn = Self {
            inner: Arc::new(ConnectionInner {
                options,
                engine: handle,
                queue,
                state: Mutex::new(ConnectionState::Open),
                events,
                unfinished_backups: AtomicUsize::new(0),
            }),
        };
        conn.inner.events.emit(Event::Open);
        Ok(conn)
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.inner.options.db_path
    }

    #[must_use]
    pub fn options(&self) -> &ConnectionOptions {
        &self.inner.options
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    #[must_use]
    pub fn policy(&self) -> SchedulingPolicy {
        self.inner.queue.policy()
    }

    /// Switch scheduling policy for operations submitted from now on.
    pub fn set_policy(&self, policy: SchedulingPolicy) {
        self.inner.queue.set_policy(policy);
    }

    /// Run `body` with the sequential policy, restoring the previous policy afterwards.
    ///
    /// Operations submitted inside `body` keep sequential ordering even if they complete
    /// after the policy has been restored.
    pub fn serialize<T>(&self, body: impl FnOnce(&Connection) -> T) -> T {
        self.with_policy(SchedulingPolicy::Sequential, body)
    }

    /// Run `body` with the concurrent policy, restoring the previous policy afterwards.
    pub fn parallelize<T>(&self, body: impl FnOnce(&Connection) -> T) -> T {
        self.with_policy(SchedulingPolicy::Concurrent, body)
    }

    fn with_policy<T>(&self, policy: SchedulingPolicy, body: impl FnOnce(&Connection) -> T) -> T {
        struct Restore<'a> {
            conn: &'a Connection,
            previous: SchedulingPolicy,
        }

        impl Drop for Restore<'_> {
            fn drop(&mut self) {
                self.conn.set_policy(self.previous);
            }
        }

        let _restore = Restore {
            conn: self,
            previous: self.policy(),
        };
        self.set_policy(policy);
        body(self)
    }

    /// Operations currently running against the engine.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner.queue.in_flight()
    }

    /// Operations submitted but not yet started.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.inner.queue.queued()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.events.subscribe()
    }

    /// Run one or more `;`-separated statements without parameters.
    ///
    /// Always waits for everything submitted before it and blocks everything after it.
    pub fn exec(&self, sql: impl Into<String>) -> Pending<()> {
        let sql = sql.into();
        self.inner
            .submit(OperationKind::Exec, None, move |engine| async move {
                engine.exec(sql).await
            })
    }

    pub fn prepare(&self, sql: impl Into<String>) -> Pending<Statement> {
        let (_, prepared) = Statement::prepare(&self.inner, sql.into(), true);
        prepared
    }

    /// Prepare and bind in one call; resolves once both have run.
    pub fn prepare_with(&self, sql: impl Into<String>, params: impl Into<Params>) -> Pending<Statement> {
        let params = params.into();
        if params.is_empty() {
            return self.prepare(sql);
        }
        let (stmt, _) = Statement::prepare(&self.inner, sql.into(), false);
        stmt.bind(params)
    }

    /// Prepare, run once and finalize.
    pub fn run(&self, sql: impl Into<String>, params: impl Into<Params>) -> Pending<RunResult> {
        let params = params.into();
        self.ad_hoc(sql.into(), move |stmt| stmt.run(params))
    }

    pub fn get(
        &self,
        sql: impl Into<String>,
        params: impl Into<Params>,
    ) -> Pending<Option<CustomDbRow>> {
        let params = params.into();
        self.ad_hoc(sql.into(), move |stmt| stmt.get(params))
    }

    pub fn all(&self, sql: impl Into<String>, params: impl Into<Params>) -> Pending<ResultSet> {
        let params = params.into();
        self.ad_hoc(sql.into(), move |stmt| stmt.all(params))
    }

    pub fn each<F>(&self, sql: impl Into<String>, params: impl Into<Params>, on_row: F) -> Pending<usize>
    where
        F: FnMut(CustomDbRow) + Send + 'static,
    {
        let params = params.into();
        self.ad_hoc(sql.into(), move |stmt| stmt.each(params, on_row))
    }

    /// Prepare, key every row by its first column and finalize.
    pub fn map(&self, sql: impl Into<String>, params: impl Into<Params>) -> Pending<RowMap> {
        let params = params.into();
        self.ad_hoc(sql.into(), move |stmt| stmt.map(params))
    }

    fn ad_hoc<T>(&self, sql: String, op: impl FnOnce(&Statement) -> Pending<T>) -> Pending<T> {
        let (stmt, _) = Statement::prepare(&self.inner, sql, false);
        let pending = op(&stmt);
        // Queued on the statement's lane, so it runs after `op`.
        drop(stmt.finalize());
        pending
    }

    /// Change how long the engine retries on a locked database before reporting busy.
    pub fn configure_busy_timeout(&self, timeout: Duration) -> Pending<()> {
        self.inner
            .submit(OperationKind::Configure, None, move |engine| async move {
                engine.set_busy_timeout(timeout).await
            })
    }

    /// Set one of the engine's run-time limits; resolves to the previous value.
    pub fn configure_limit(&self, limit: Limit, value: i32) -> Pending<i32> {
        self.inner
            .submit(OperationKind::Configure, None, move |engine| async move {
                engine.set_limit(limit, value).await
            })
    }

    /// Resolves once every operation submitted before it has completed.
    pub fn wait(&self) -> Pending<()> {
        self.inner
            .submit(OperationKind::Wait, None, |_| async { Ok(()) })
    }

    /// Ask the engine to abort its current call. That call fails with
    /// [`SqlSchedulerError::Interrupted`]; queued operations still run.
    ///
    /// # Errors
    ///
    /// Returns a misuse error unless the connection is open.
    pub fn interrupt(&self) -> Result<(), SqlSchedulerError> {
        match self.state() {
            ConnectionState::Open => {
                debug!(db_path = %self.path(), "interrupt requested");
                self.inner.engine.interrupt();
                Ok(())
            }
            ConnectionState::Closing => Err(SqlSchedulerError::misuse("Database is closing")),
            ConnectionState::Closed => Err(SqlSchedulerError::misuse("Database is not open")),
        }
    }

    /// Close after everything already queued has finished.
    ///
    /// New submissions fail while the close is pending. If statements are still prepared or
    /// a backup is unfinished the engine refuses with `SQLITE_BUSY` and the connection stays
    /// open.
    pub fn close(&self) -> Pending<()> {
        let mut state = self.inner.lock_state();
        match *state {
            ConnectionState::Open => {}
            ConnectionState::Closing => {
                return Pending::failed(SqlSchedulerError::misuse("Database is closing"));
            }
            ConnectionState::Closed => return Pending::failed(closed()),
        }
        *state = ConnectionState::Closing;
        debug!(db_path = %self.path(), "connection closing");

        let conn = Arc::downgrade(&self.inner);
        self.inner
            .enqueue(OperationKind::Close, None, move |engine| async move {
                let Some(conn) = conn.upgrade() else {
                    return engine.close().await;
                };
                if conn.unfinished_backups() > 0 {
                    conn.set_state(ConnectionState::Open);
                    return Err(close_refused());
                }
                match engine.close().await {
                    Ok(()) => {
                        conn.finish_close();
                        Ok(())
                    }
                    Err(err) => {
                        if !err.is_fatal() {
                            debug!(error = %err, "close refused; connection stays open");
                            conn.set_state(ConnectionState::Open);
                        }
                        Err(err)
                    }
                }
            })
    }

    /// Start an incremental backup of this database into the file at `path`.
    pub fn backup(&self, path: impl Into<String>) -> BackupSession {
        self.backup_with(BackupRequest::to_file(path))
    }

    pub fn backup_with(&self, request: BackupRequest) -> BackupSession {
        BackupSession::start(&self.inner, request)
    }
}

fn closed() -> SqlSchedulerError {
    SqlSchedulerError::misuse("Database is closed")
}

fn close_refused() -> SqlSchedulerError {
    SqlSchedulerError::engine(
        ErrorCode::Busy,
        "unable to close due to unfinalized statements or unfinished backups",
    )
}
