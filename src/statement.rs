use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::mpsc;

use crate::connection::ConnectionInner;
use crate::engine::{EngineHandle, StatementId, StatementInfo};
use crate::error::SqlSchedulerError;
use crate::queue::{LaneId, OperationKind, Pending};
use crate::results::{CustomDbRow, ResultSet, RowMap, RunResult};
use crate::types::Params;

/// Where a statement is in its lifecycle, as of the last completed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementPhase {
    Created,
    Bound,
    Stepped,
    Reset,
    Finalized,
}

enum Compiled {
    Preparing,
    Ready(StatementInfo),
    Failed(SqlSchedulerError),
    Released,
}

struct StatementState {
    compiled: Compiled,
    phase: StatementPhase,
    finalize_requested: bool,
}

struct StatementInner {
    conn: Weak<ConnectionInner>,
    sql: Arc<String>,
    lane: LaneId,
    state: Mutex<StatementState>,
}

impl StatementInner {
    fn lock(&self) -> MutexGuard<'_, StatementState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn compiled_id(&self) -> Result<StatementId, SqlSchedulerError> {
        match &self.lock().compiled {
            Compiled::Ready(info) => Ok(info.id),
            Compiled::Failed(err) => Err(err.clone()),
            Compiled::Released => Err(already_finalized()),
            Compiled::Preparing => Err(SqlSchedulerError::misuse("Statement is not prepared")),
        }
    }

    fn set_phase(&self, phase: StatementPhase) {
        self.lock().phase = phase;
    }
}

/// A prepared statement bound to its connection's queue.
///
/// Operations on one statement run in the order they were called under either scheduling
/// policy. Every method submits immediately; the returned [`Pending`] only observes the result.
#[derive(Clone)]
pub struct Statement {
    inner: Arc<StatementInner>,
}

impl std::fmt::Debug for Statement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Statement")
            .field("sql", &self.inner.sql)
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

impl Statement {
    /// Create a statement on `conn` and queue its preparation.
    ///
    /// With `surface_errors` unset the prepare outcome is only recorded; later operations on the
    /// statement report it. Ad hoc `Connection::run`-style calls use that so a bad SQL text is
    /// reported once, by the call the user awaits.
    pub(crate) fn prepare(
        conn: &Arc<ConnectionInner>,
        sql: String,
        surface_errors: bool,
    ) -> (Self, Pending<Statement>) {
        let stmt = Self {
            inner: Arc::new(StatementInner {
                conn: Arc::downgrade(conn),
                sql: Arc::new(sql),
                lane: conn.allocate_lane(),
                state: Mutex::new(StatementState {
                    compiled: Compiled::Preparing,
                    phase: StatementPhase::Created,
                    finalize_requested: false,
                }),
            }),
        };
        let handle = stmt.clone();
        let pending = conn.submit(OperationKind::Prepare, Some(stmt.inner.lane), move |engine| {
            async move {
                let outcome = engine.prepare(Arc::clone(&handle.inner.sql)).await;
                let mut state = handle.inner.lock();
                match outcome {
                    Ok(info) => {
                        state.compiled = Compiled::Ready(info);
                        drop(state);
                        Ok(handle)
                    }
                    Err(err) => {
                        state.compiled = Compiled::Failed(err.clone());
                        drop(state);
                        if surface_errors { Err(err) } else { Ok(handle) }
                    }
                }
            }
        });
        (stmt, pending)
    }

    #[must_use]
    pub fn sql(&self) -> &str {
        &self.inner.sql
    }

    #[must_use]
    pub fn phase(&self) -> StatementPhase {
        self.inner.lock().phase
    }

    #[must_use]
    pub fn is_finalized(&self) -> bool {
        self.inner.lock().finalize_requested
    }

    /// Number of parameter slots, once prepared.
    #[must_use]
    pub fn parameter_count(&self) -> Option<usize> {
        match &self.inner.lock().compiled {
            Compiled::Ready(info) => Some(info.parameter_count),
            _ => None,
        }
    }

    /// Result column names, once prepared.
    #[must_use]
    pub fn column_names(&self) -> Option<Vec<String>> {
        match &self.inner.lock().compiled {
            Compiled::Ready(info) => Some(info.column_names.clone()),
            _ => None,
        }
    }

    fn submit<T, F, Fut>(&self, kind: OperationKind, work: F) -> Pending<T>
    where
        T: Send + 'static,
        F: FnOnce(Arc<dyn EngineHandle>, StatementId) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<T, SqlSchedulerError>> + Send + 'static,
    {
        if self.inner.lock().finalize_requested {
            return Pending::failed(already_finalized());
        }
        let Some(conn) = self.inner.conn.upgrade() else {
            return Pending::failed(SqlSchedulerError::misuse("Database is closed"));
        };
        let inner = Arc::clone(&self.inner);
        conn.submit(kind, Some(self.inner.lane), move |engine| async move {
            let id = inner.compiled_id()?;
            work(engine, id).await
        })
    }

    /// Replace the bindings; earlier values are cleared first.
    pub fn bind(&self, params: impl Into<Params>) -> Pending<Statement> {
        let params = params.into();
        let stmt = self.clone();
        self.submit(OperationKind::Bind, move |engine, id| async move {
            engine.bind(id, params).await?;
            stmt.inner.set_phase(StatementPhase::Bound);
            Ok(stmt)
        })
    }

    /// Rewind so the statement can run again with its current bindings.
    pub fn reset(&self) -> Pending<Statement> {
        let stmt = self.clone();
        self.submit(OperationKind::Reset, move |engine, id| async move {
            engine.reset(id).await?;
            stmt.inner.set_phase(StatementPhase::Reset);
            Ok(stmt)
        })
    }

    /// Execute to completion, reporting the last inserted rowid and the change count.
    pub fn run(&self, params: impl Into<Params>) -> Pending<RunResult> {
        let params = params.into();
        let inner = Arc::clone(&self.inner);
        self.submit(OperationKind::Run, move |engine, id| async move {
            let result = engine.run(id, params).await?;
            inner.set_phase(StatementPhase::Stepped);
            Ok(result)
        })
    }

    /// Next row of the statement's cursor: successive calls walk the result, then resolve to
    /// `None` until [`reset`](Self::reset) or new parameters rewind it.
    pub fn get(&self, params: impl Into<Params>) -> Pending<Option<CustomDbRow>> {
        let params = params.into();
        let inner = Arc::clone(&self.inner);
        self.submit(OperationKind::Get, move |engine, id| async move {
            let row = engine.get(id, params).await?;
            inner.set_phase(StatementPhase::Stepped);
            Ok(row)
        })
    }

    pub fn all(&self, params: impl Into<Params>) -> Pending<ResultSet> {
        let params = params.into();
        let inner = Arc::clone(&self.inner);
        self.submit(OperationKind::All, move |engine, id| async move {
            let rows = engine.all(id, params).await?;
            inner.set_phase(StatementPhase::Stepped);
            Ok(rows)
        })
    }

    /// Every row keyed by its first column, as [`ResultSet::into_map`] builds it.
    pub fn map(&self, params: impl Into<Params>) -> Pending<RowMap> {
        let params = params.into();
        let inner = Arc::clone(&self.inner);
        self.submit(OperationKind::All, move |engine, id| async move {
            let rows = engine.all(id, params).await?;
            inner.set_phase(StatementPhase::Stepped);
            Ok(rows.into_map())
        })
    }

    /// Call `on_row` for every row as it is produced; resolves to the row count.
    pub fn each<F>(&self, params: impl Into<Params>, on_row: F) -> Pending<usize>
    where
        F: FnMut(CustomDbRow) + Send + 'static,
    {
        let params = params.into();
        let inner = Arc::clone(&self.inner);
        self.submit(OperationKind::Each, move |engine, id| async move {
            let count = stream_rows(engine.as_ref(), id, params, on_row).await?;
            inner.set_phase(StatementPhase::Stepped);
            Ok(count)
        })
    }

    /// Release the engine statement after everything already queued on it.
    ///
    /// Calling it again is a no-op; any other method fails once it has been called.
    pub fn finalize(&self) -> Pending<()> {
        {
            let mut state = self.inner.lock();
            if state.finalize_requested {
                return Pending::ready(Ok(()));
            }
            state.finalize_requested = true;
        }
        let Some(conn) = self.inner.conn.upgrade() else {
            self.inner.set_phase(StatementPhase::Finalized);
            return Pending::ready(Ok(()));
        };
        let inner = Arc::clone(&self.inner);
        let submitted = conn.try_submit(
            OperationKind::Finalize,
            Some(self.inner.lane),
            move |engine| async move {
                let compiled = std::mem::replace(&mut inner.lock().compiled, Compiled::Released);
                let outcome = match compiled {
                    Compiled::Ready(info) => engine.finalize(info.id).await,
                    Compiled::Preparing | Compiled::Failed(_) | Compiled::Released => Ok(()),
                };
                inner.set_phase(StatementPhase::Finalized);
                outcome
            },
        );
        submitted.unwrap_or_else(|err| {
            // Not queued; leave the statement usable so finalize can be retried.
            self.inner.lock().finalize_requested = false;
            Pending::failed(err)
        })
    }
}

async fn stream_rows<F>(
    engine: &dyn EngineHandle,
    id: StatementId,
    params: Params,
    mut on_row: F,
) -> Result<usize, SqlSchedulerError>
where
    F: FnMut(CustomDbRow) + Send,
{
    let (tx, mut rx) = mpsc::unbounded_channel();
    let deliver = async {
        while let Some(row) = rx.recv().await {
            on_row(row);
        }
    };
    let (count, ()) = tokio::join!(engine.each(id, params, tx), deliver);
    count
}

fn already_finalized() -> SqlSchedulerError {
    SqlSchedulerError::misuse("Statement is already finalized")
}
