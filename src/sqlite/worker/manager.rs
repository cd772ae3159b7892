use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::thread;
use std::time::Duration;

use rusqlite::hooks::Action;
use rusqlite::{Connection, InterruptHandle, OpenFlags};
use tokio::sync::{mpsc as async_mpsc, oneshot};
use tracing::debug;

use crate::backup::BackupRequest;
use crate::config::{ConnectionOptions, OpenMode};
use crate::engine::{StatementId, StatementInfo};
use crate::error::SqlSchedulerError;
use crate::events::{ChangeKind, Event, EventSink};
use crate::results::{CustomDbRow, ResultSet, RunResult};
use crate::types::{Limit, Params};

use super::channel::{Command, Reply};
use super::dispatcher::{WorkerSettings, run_sqlite_worker};

static NEXT_WORKER: AtomicU64 = AtomicU64::new(1);

pub(super) struct SqliteWorker {
    sender: Sender<Command>,
    worker_id: u64,
}

impl SqliteWorker {
    /// Open the database on a fresh worker thread and wait until it is ready.
    pub(super) async fn spawn(
        options: &ConnectionOptions,
        events: EventSink,
    ) -> Result<(Self, InterruptHandle), SqlSchedulerError> {
        let (sender, receiver) = mpsc::channel::<Command>();
        let (ready_tx, ready_rx) = oneshot::channel();
        let worker_id = NEXT_WORKER.fetch_add(1, Ordering::Relaxed);
        let path = options.db_path.clone();
        let flags = open_flags(options.mode);
        let busy_timeout = options.busy_timeout;
        let settings = WorkerSettings {
            trace: options.trace,
            profile: options.profile,
            events,
        };

        thread::Builder::new()
            .name(format!("sqlite-worker-{worker_id}"))
            .spawn(move || {
                let conn = match open_connection(&path, flags, busy_timeout, &settings.events) {
                    Ok(conn) => conn,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                if ready_tx.send(Ok(conn.get_interrupt_handle())).is_err() {
                    return;
                }
                debug!(worker_id, path = %path, "sqlite worker started");
                run_sqlite_worker(conn, &receiver, &settings, busy_timeout);
            })
            .map_err(|err| {
                SqlSchedulerError::ConnectionError(format!(
                    "failed to spawn SQLite worker thread: {err}"
                ))
            })?;

        let interrupt = ready_rx
            .await
            .map_err(|_| connection_error("SQLite worker exited while opening"))??;
        Ok((Self { sender, worker_id }, interrupt))
    }

    pub(super) fn worker_id(&self) -> u64 {
        self.worker_id
    }

    pub(super) fn sender(&self) -> Sender<Command> {
        self.sender.clone()
    }

    pub(super) fn send_command(&self, command: Command) -> Result<(), SqlSchedulerError> {
        self.sender
            .send(command)
            .map_err(|_| connection_error("SQLite worker closed"))
    }

    pub(super) async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> Command,
        drop_message: &'static str,
    ) -> Result<T, SqlSchedulerError> {
        let (tx, rx) = oneshot::channel();
        self.send_command(build(tx))?;
        rx.await.map_err(|_| connection_error(drop_message))?
    }

    pub(super) async fn exec(&self, sql: String) -> Result<(), SqlSchedulerError> {
        self.request(
            |respond_to| Command::Exec { sql, respond_to },
            "SQLite worker dropped while executing batch",
        )
        .await
    }

    pub(super) async fn prepare(&self, sql: Arc<String>) -> Result<StatementInfo, SqlSchedulerError> {
        self.request(
            |respond_to| Command::Prepare { sql, respond_to },
            "SQLite worker dropped while preparing statement",
        )
        .await
    }

    pub(super) async fn bind(&self, stmt: StatementId, params: Params) -> Result<(), SqlSchedulerError> {
        self.request(
            |respond_to| Command::Bind {
                stmt,
                params,
                respond_to,
            },
            "SQLite worker dropped while binding parameters",
        )
        .await
    }

    pub(super) async fn get(
        &self,
        stmt: StatementId,
        params: Params,
    ) -> Result<Option<CustomDbRow>, SqlSchedulerError> {
        self.request(
            |respond_to| Command::Get {
                stmt,
                params,
                respond_to,
            },
            "SQLite worker dropped while fetching a row",
        )
        .await
    }

    pub(super) async fn all(&self, stmt: StatementId, params: Params) -> Result<ResultSet, SqlSchedulerError> {
        self.request(
            |respond_to| Command::All {
                stmt,
                params,
                respond_to,
            },
            "SQLite worker dropped while fetching rows",
        )
        .await
    }

    pub(super) async fn each(
        &self,
        stmt: StatementId,
        params: Params,
        rows: async_mpsc::UnboundedSender<CustomDbRow>,
    ) -> Result<usize, SqlSchedulerError> {
        self.request(
            |respond_to| Command::Each {
                stmt,
                params,
                rows,
                respond_to,
            },
            "SQLite worker dropped while streaming rows",
        )
        .await
    }

    pub(super) async fn run(&self, stmt: StatementId, params: Params) -> Result<RunResult, SqlSchedulerError> {
        self.request(
            |respond_to| Command::Run {
                stmt,
                params,
                respond_to,
            },
            "SQLite worker dropped while running statement",
        )
        .await
    }

    pub(super) async fn reset(&self, stmt: StatementId) -> Result<(), SqlSchedulerError> {
        self.request(
            |respond_to| Command::Reset { stmt, respond_to },
            "SQLite worker dropped while resetting statement",
        )
        .await
    }

    pub(super) async fn finalize(&self, stmt: StatementId) -> Result<(), SqlSchedulerError> {
        self.request(
            |respond_to| Command::Finalize { stmt, respond_to },
            "SQLite worker dropped while finalizing statement",
        )
        .await
    }

    pub(super) async fn busy_timeout(&self, timeout: Duration) -> Result<(), SqlSchedulerError> {
        self.request(
            |respond_to| Command::BusyTimeout {
                timeout,
                respond_to,
            },
            "SQLite worker dropped while configuring busy timeout",
        )
        .await
    }

    pub(super) async fn set_limit(&self, limit: Limit, value: i32) -> Result<i32, SqlSchedulerError> {
        self.request(
            |respond_to| Command::SetLimit {
                limit,
                value,
                respond_to,
            },
            "SQLite worker dropped while configuring a limit",
        )
        .await
    }

    pub(super) async fn start_backup(&self, request: BackupRequest) -> Result<u64, SqlSchedulerError> {
        self.request(
            |respond_to| Command::BackupStart {
                request,
                respond_to,
            },
            "SQLite worker dropped while starting a backup",
        )
        .await
    }

    pub(super) async fn close(&self) -> Result<(), SqlSchedulerError> {
        self.request(
            |respond_to| Command::Close { respond_to },
            "SQLite worker dropped while closing",
        )
        .await
    }
}

impl Drop for SqliteWorker {
    fn drop(&mut self) {
        let _ = self.sender.send(Command::Shutdown);
    }
}

pub(crate) fn open_flags(mode: OpenMode) -> OpenFlags {
    let base = OpenFlags::SQLITE_OPEN_URI | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    match mode {
        OpenMode::ReadOnly => base | OpenFlags::SQLITE_OPEN_READ_ONLY,
        OpenMode::ReadWrite => base | OpenFlags::SQLITE_OPEN_READ_WRITE,
        OpenMode::ReadWriteCreate => {
            base | OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE
        }
    }
}

fn open_connection(
    path: &str,
    flags: OpenFlags,
    busy_timeout: Duration,
    events: &EventSink,
) -> Result<Connection, SqlSchedulerError> {
    let conn = Connection::open_with_flags(path, flags)?;
    conn.busy_timeout(busy_timeout)?;
    let sink = events.clone();
    conn.update_hook(Some(
        move |action: Action, database: &str, table: &str, rowid: i64| {
            let kind = match action {
                Action::SQLITE_INSERT => ChangeKind::Insert,
                Action::SQLITE_UPDATE => ChangeKind::Update,
                Action::SQLITE_DELETE => ChangeKind::Delete,
                _ => return,
            };
            sink.emit(Event::Change {
                kind,
                database: database.to_owned(),
                table: table.to_owned(),
                rowid,
            });
        },
    ));
    Ok(conn)
}

pub(super) fn connection_error(message: &str) -> SqlSchedulerError {
    SqlSchedulerError::ConnectionError(message.into())
}
