use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::time::{Duration, Instant};

use rusqlite::Connection;
use rusqlite::backup::Backup;
use rusqlite::limits::Limit as SqliteLimit;
use tracing::debug;

use crate::backup::BackupRequest;
use crate::config::OpenMode;
use crate::engine::{StatementId, StatementInfo};
use crate::error::{ErrorCode, SqlSchedulerError};
use crate::events::{Event, EventSink};
use crate::results::{CustomDbRow, ResultSet, RowColumns, RunResult};
use crate::sqlite::backup::{database_name, open_endpoint};
use crate::sqlite::params::bind_params;
use crate::sqlite::query::{column_names, nth_row, step_rows};
use crate::types::{Limit, Params};

use super::channel::{Command, Reply};
use super::manager::open_flags;
use super::session::{Frame, OpenSessions, already_finished};

/// Per-connection settings the worker needs while serving commands.
pub(super) struct WorkerSettings {
    pub(super) trace: bool,
    pub(super) profile: bool,
    pub(super) events: EventSink,
}

impl WorkerSettings {
    fn before(&self, sql: &str) {
        if self.trace {
            self.events.emit(Event::Trace {
                sql: sql.to_owned(),
            });
        }
    }

    fn after(&self, sql: String, started: Instant) {
        if self.profile {
            self.events.emit(Event::Profile {
                sql,
                duration: started.elapsed(),
            });
        }
    }

    fn observed(&self) -> bool {
        self.trace || self.profile
    }
}

/// Where the next `get` picks up.
enum Cursor {
    /// The next fetch executes the statement from the first row.
    Rewound,
    /// A read-only statement that has handed out this many rows.
    Reading(usize),
    /// What is left of a single execution of a statement that writes.
    Buffered(VecDeque<CustomDbRow>),
    /// Rows ran out; stays so until reset or rebind.
    Exhausted,
}

struct Prepared<'conn> {
    stmt: rusqlite::Statement<'conn>,
    sql: Arc<String>,
    columns: RowColumns,
    writes: bool,
    cursor: Cursor,
}

impl Prepared<'_> {
    fn execute<T>(
        &mut self,
        settings: &WorkerSettings,
        body: impl FnOnce(&mut rusqlite::Statement<'_>, &RowColumns) -> Result<T, SqlSchedulerError>,
    ) -> Result<T, SqlSchedulerError> {
        let expanded = settings.observed().then(|| {
            self.stmt
                .expanded_sql()
                .unwrap_or_else(|| self.sql.as_str().to_owned())
        });
        if let Some(sql) = &expanded {
            settings.before(sql);
        }
        let started = Instant::now();
        let outcome = body(&mut self.stmt, &self.columns);
        if let Some(sql) = expanded {
            settings.after(sql, started);
        }
        outcome
    }

    /// Bind non-empty `params`, which also rewinds the cursor.
    fn rebind(&mut self, params: &Params) -> Result<(), SqlSchedulerError> {
        if !params.is_empty() {
            self.cursor = Cursor::Rewound;
            bind_params(&mut self.stmt, params)?;
        }
        Ok(())
    }

    /// Step to the end from the first row, leaving the cursor exhausted.
    fn run_through<T>(
        &mut self,
        settings: &WorkerSettings,
        params: &Params,
        body: impl FnOnce(&mut rusqlite::Statement<'_>, &RowColumns) -> Result<T, SqlSchedulerError>,
    ) -> Result<T, SqlSchedulerError> {
        self.rebind(params)?;
        self.cursor = Cursor::Exhausted;
        self.execute(settings, body)
    }

    /// Next row of the cursor.
    ///
    /// A read-only statement is re-stepped past the rows already handed out, since the
    /// cursor rewinds whenever rusqlite releases it. A statement that writes is executed once
    /// and its rows buffered, so its side effects happen exactly once per pass.
    fn fetch(
        &mut self,
        settings: &WorkerSettings,
    ) -> Result<Option<CustomDbRow>, SqlSchedulerError> {
        let (row, next) = match std::mem::replace(&mut self.cursor, Cursor::Rewound) {
            Cursor::Exhausted => (None, Cursor::Exhausted),
            Cursor::Buffered(mut rows) => {
                let row = rows.pop_front();
                (row, Cursor::Buffered(rows))
            }
            Cursor::Rewound if self.writes => {
                let mut rows = VecDeque::new();
                self.execute(settings, |stmt, columns| {
                    step_rows(stmt, columns, |row| {
                        rows.push_back(row);
                        true
                    })
                })?;
                let row = rows.pop_front();
                (row, Cursor::Buffered(rows))
            }
            Cursor::Rewound => {
                let row = self.execute(settings, |stmt, columns| nth_row(stmt, columns, 0))?;
                (row, Cursor::Reading(1))
            }
            Cursor::Reading(consumed) => {
                let row = nth_row(&mut self.stmt, &self.columns, consumed)?;
                (row, Cursor::Reading(consumed + 1))
            }
        };
        self.cursor = if row.is_some() { next } else { Cursor::Exhausted };
        Ok(row)
    }
}

/// Serve commands until the connection is closed or every sender is gone.
///
/// A refused close (open statements or backups, or the engine reporting busy) hands the
/// connection back to the serve loop, so the handle keeps working.
pub(super) fn run_sqlite_worker(
    mut conn: Connection,
    receiver: &Receiver<Command>,
    settings: &WorkerSettings,
    busy_timeout: Duration,
) {
    let mut counters = Counters {
        next_statement: 1,
        next_session: 1,
        busy_timeout,
    };
    loop {
        let exit = Worker {
            conn: &conn,
            receiver,
            settings,
            counters: &mut counters,
            statements: HashMap::new(),
        }
        .serve(None, None);
        let Exit::Close(respond_to) = exit else {
            debug!("sqlite worker shutting down");
            return;
        };
        match conn.close() {
            Ok(()) => {
                debug!("sqlite connection closed");
                let _ = respond_to.send(Ok(()));
                return;
            }
            Err((returned, err)) => {
                conn = returned;
                let _ = respond_to.send(Err(err.into()));
            }
        }
    }
}

/// State that outlives a refused close.
struct Counters {
    // Ids never leave this connection; u64 won't exhaust in practice.
    next_statement: u64,
    next_session: u64,
    busy_timeout: Duration,
}

enum Exit {
    Shutdown,
    Close(Reply<()>),
    /// The frame's own backup session was released.
    Released,
}

struct Worker<'conn, 'w> {
    conn: &'conn Connection,
    receiver: &'w Receiver<Command>,
    settings: &'w WorkerSettings,
    counters: &'w mut Counters,
    statements: HashMap<StatementId, Prepared<'conn>>,
}

impl<'conn> Worker<'conn, '_> {
    /// Serve commands. Inside a backup frame `own` names the frame's session, and the call
    /// returns once that session is released.
    fn serve(&mut self, sessions: Option<&dyn OpenSessions>, own: Option<u64>) -> Exit {
        loop {
            if let (Some(session), Some(open)) = (own, sessions) {
                if !open.is_live(session) {
                    return Exit::Released;
                }
            }
            let Ok(command) = self.receiver.recv() else {
                return Exit::Shutdown;
            };
            match command {
                Command::Shutdown => return Exit::Shutdown,
                Command::Close { respond_to } => {
                    if self.statements.is_empty() && own.is_none() {
                        return Exit::Close(respond_to);
                    }
                    debug!(
                        open = self.statements.len(),
                        backup = own.is_some(),
                        "close refused"
                    );
                    let _ = respond_to.send(Err(SqlSchedulerError::engine(
                        ErrorCode::Busy,
                        "unable to close due to unfinalized statements or unfinished backups",
                    )));
                }
                Command::BackupStart {
                    request,
                    respond_to,
                } => {
                    if let Some(exit) = self.backup_frame(request, respond_to, sessions) {
                        return exit;
                    }
                }
                Command::BackupStep {
                    session,
                    pages,
                    respond_to,
                } => {
                    let outcome = sessions
                        .and_then(|open| open.step(session, pages))
                        .unwrap_or_else(|| Err(already_finished()));
                    let _ = respond_to.send(outcome);
                }
                Command::BackupFinish {
                    session,
                    respond_to,
                } => {
                    if sessions.is_some_and(|open| open.release(session)) {
                        debug!(session, "backup session finished");
                    }
                    if let Some(respond_to) = respond_to {
                        let _ = respond_to.send(Ok(()));
                    }
                }
                other => self.handle(other),
            }
        }
    }

    /// Start a copy into `request.path` and serve from a frame that owns it.
    ///
    /// Returns `None` once the session is released (or failed to start); any other exit is
    /// passed up to the outermost frame.
    fn backup_frame(
        &mut self,
        request: BackupRequest,
        respond_to: Reply<u64>,
        sessions: Option<&dyn OpenSessions>,
    ) -> Option<Exit> {
        let mut file = match open_endpoint(
            &request.path,
            open_flags(OpenMode::ReadWriteCreate),
            self.counters.busy_timeout,
        ) {
            Ok(file) => file,
            Err(err) => {
                let _ = respond_to.send(Err(err));
                return None;
            }
        };
        let conn = self.conn;
        let backup = match Backup::new_with_names(
            conn,
            database_name(&request.source_name),
            &mut file,
            database_name(&request.destination_name),
        ) {
            Ok(backup) => backup,
            Err(err) => {
                let _ = respond_to.send(Err(err.into()));
                return None;
            }
        };
        let session = self.counters.next_session;
        self.counters.next_session = session.saturating_add(1);
        let frame = Frame {
            session,
            backup: RefCell::new(Some(backup)),
            outer: sessions,
        };
        if respond_to.send(Ok(session)).is_err() {
            return None;
        }
        debug!(session, path = %request.path, "backup session started");
        match self.serve(Some(&frame as &dyn OpenSessions), Some(session)) {
            Exit::Released => None,
            exit => Some(exit),
        }
    }

    fn handle(&mut self, command: Command) {
        let settings = self.settings;
        let conn = self.conn;
        match command {
            Command::Exec { sql, respond_to } => {
                let _ = respond_to.send(exec(conn, &sql, settings));
            }
            Command::Prepare { sql, respond_to } => {
                let outcome = conn.prepare(&sql).map_err(SqlSchedulerError::from).map(|stmt| {
                    let id = StatementId(self.counters.next_statement);
                    self.counters.next_statement = self.counters.next_statement.saturating_add(1);
                    let columns = RowColumns::new(column_names(&stmt));
                    let info = StatementInfo {
                        id,
                        parameter_count: stmt.parameter_count(),
                        column_names: columns.names().to_vec(),
                    };
                    let writes = !stmt.readonly();
                    self.statements.insert(
                        id,
                        Prepared {
                            stmt,
                            sql,
                            columns,
                            writes,
                            cursor: Cursor::Rewound,
                        },
                    );
                    info
                });
                let _ = respond_to.send(outcome);
            }
            Command::Bind {
                stmt,
                params,
                respond_to,
            } => {
                let outcome = with_statement(&mut self.statements, stmt, |p| {
                    p.cursor = Cursor::Rewound;
                    bind_params(&mut p.stmt, &params)
                });
                let _ = respond_to.send(outcome);
            }
            Command::Get {
                stmt,
                params,
                respond_to,
            } => {
                let outcome = with_statement(&mut self.statements, stmt, |p| {
                    p.rebind(&params)?;
                    p.fetch(settings)
                });
                let _ = respond_to.send(outcome);
            }
            Command::All {
                stmt,
                params,
                respond_to,
            } => {
                let outcome = with_statement(&mut self.statements, stmt, |p| {
                    p.run_through(settings, &params, |stmt, columns| {
                        let mut result_set = ResultSet::with_capacity(10);
                        result_set.set_column_names(Arc::clone(columns.names()));
                        step_rows(stmt, columns, |row| {
                            result_set.add_row(row);
                            true
                        })?;
                        Ok(result_set)
                    })
                });
                let _ = respond_to.send(outcome);
            }
            Command::Each {
                stmt,
                params,
                rows,
                respond_to,
            } => {
                let outcome = with_statement(&mut self.statements, stmt, |p| {
                    // A receiver that went away only stops delivery; the count still covers
                    // every row stepped.
                    p.run_through(settings, &params, |stmt, columns| {
                        step_rows(stmt, columns, |row| {
                            let _ = rows.send(row);
                            true
                        })
                    })
                });
                let _ = respond_to.send(outcome);
            }
            Command::Run {
                stmt,
                params,
                respond_to,
            } => {
                let outcome = with_statement(&mut self.statements, stmt, |p| {
                    p.run_through(settings, &params, |stmt, columns| {
                        step_rows(stmt, columns, |_| true)?;
                        Ok(RunResult {
                            last_id: conn.last_insert_rowid(),
                            changes: conn.changes(),
                        })
                    })
                });
                let _ = respond_to.send(outcome);
            }
            Command::Reset { stmt, respond_to } => {
                let outcome = with_statement(&mut self.statements, stmt, |p| {
                    p.cursor = Cursor::Rewound;
                    Ok(())
                });
                let _ = respond_to.send(outcome);
            }
            Command::Finalize { stmt, respond_to } => {
                let outcome = self
                    .statements
                    .remove(&stmt)
                    .map(drop)
                    .ok_or_else(|| unknown_statement(stmt));
                let _ = respond_to.send(outcome);
            }
            Command::BusyTimeout {
                timeout,
                respond_to,
            } => {
                let outcome = conn.busy_timeout(timeout).map_err(SqlSchedulerError::from);
                if outcome.is_ok() {
                    self.counters.busy_timeout = timeout;
                }
                let _ = respond_to.send(outcome);
            }
            Command::SetLimit {
                limit,
                value,
                respond_to,
            } => {
                let previous = conn.set_limit(sqlite_limit(limit), value);
                debug!(?limit, value, previous, "limit configured");
                let _ = respond_to.send(Ok(previous));
            }
            Command::Shutdown
            | Command::Close { .. }
            | Command::BackupStart { .. }
            | Command::BackupStep { .. }
            | Command::BackupFinish { .. } => {}
        }
    }
}

fn sqlite_limit(limit: Limit) -> SqliteLimit {
    match limit {
        Limit::Length => SqliteLimit::SQLITE_LIMIT_LENGTH,
        Limit::SqlLength => SqliteLimit::SQLITE_LIMIT_SQL_LENGTH,
        Limit::Column => SqliteLimit::SQLITE_LIMIT_COLUMN,
        Limit::ExprDepth => SqliteLimit::SQLITE_LIMIT_EXPR_DEPTH,
        Limit::CompoundSelect => SqliteLimit::SQLITE_LIMIT_COMPOUND_SELECT,
        Limit::VdbeOp => SqliteLimit::SQLITE_LIMIT_VDBE_OP,
        Limit::FunctionArg => SqliteLimit::SQLITE_LIMIT_FUNCTION_ARG,
        Limit::Attached => SqliteLimit::SQLITE_LIMIT_ATTACHED,
        Limit::LikePatternLength => SqliteLimit::SQLITE_LIMIT_LIKE_PATTERN_LENGTH,
        Limit::VariableNumber => SqliteLimit::SQLITE_LIMIT_VARIABLE_NUMBER,
        Limit::TriggerDepth => SqliteLimit::SQLITE_LIMIT_TRIGGER_DEPTH,
        Limit::WorkerThreads => SqliteLimit::SQLITE_LIMIT_WORKER_THREADS,
    }
}

fn exec(conn: &Connection, sql: &str, settings: &WorkerSettings) -> Result<(), SqlSchedulerError> {
    settings.before(sql);
    let started = Instant::now();
    let outcome = conn.execute_batch(sql).map_err(SqlSchedulerError::from);
    if settings.observed() {
        settings.after(sql.to_owned(), started);
    }
    outcome
}

fn with_statement<'conn, T>(
    statements: &mut HashMap<StatementId, Prepared<'conn>>,
    id: StatementId,
    body: impl FnOnce(&mut Prepared<'conn>) -> Result<T, SqlSchedulerError>,
) -> Result<T, SqlSchedulerError> {
    let prepared = statements
        .get_mut(&id)
        .ok_or_else(|| unknown_statement(id))?;
    body(prepared)
}

fn unknown_statement(id: StatementId) -> SqlSchedulerError {
    SqlSchedulerError::misuse(format!("unknown statement {id}"))
}
