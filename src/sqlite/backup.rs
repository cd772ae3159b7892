use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::backup::{Backup, StepResult};
use rusqlite::{Connection, DatabaseName, OpenFlags};
use tokio::sync::oneshot;
use tracing::debug;

use crate::backup::BackupRequest;
use crate::config::OpenMode;
use crate::engine::{BackupHandle, BackupProgress};
use crate::error::{ErrorCode, SqlSchedulerError};

use super::worker::open_flags;

type Reply<T> = oneshot::Sender<Result<T, SqlSchedulerError>>;

enum BackupCommand {
    Step {
        pages: i32,
        respond_to: Reply<BackupProgress>,
    },
    Finish {
        respond_to: Reply<()>,
    },
}

static NEXT_BACKUP: AtomicU64 = AtomicU64::new(1);

/// Restore session copying a file into the connection's database, on its own thread with its
/// own pair of connections.
///
/// The destination has to be reopened because rusqlite wants it borrowed mutably, which the
/// worker cannot do while statements are prepared. Only a file-backed database can be
/// restored this way; copies out of the connection run on the worker itself.
pub(crate) struct SqliteBackup {
    sender: Sender<BackupCommand>,
}

struct Endpoints {
    source_path: String,
    source_name: String,
    destination_path: String,
    destination_flags: OpenFlags,
    destination_name: String,
    busy_timeout: Duration,
}

impl SqliteBackup {
    pub(crate) async fn restore(
        db_path: &str,
        mode: OpenMode,
        request: BackupRequest,
        busy_timeout: Duration,
    ) -> Result<Self, SqlSchedulerError> {
        if is_memory_path(db_path) {
            return Err(SqlSchedulerError::engine(
                ErrorCode::Error,
                "restoring requires a file-backed database",
            ));
        }
        let endpoints = Endpoints {
            source_path: request.path,
            source_name: request.source_name,
            destination_path: db_path.to_owned(),
            destination_flags: open_flags(mode),
            destination_name: request.destination_name,
            busy_timeout,
        };

        let (sender, receiver) = mpsc::channel::<BackupCommand>();
        let (ready_tx, ready_rx) = oneshot::channel();
        let backup_id = NEXT_BACKUP.fetch_add(1, Ordering::Relaxed);
        thread::Builder::new()
            .name(format!("sqlite-restore-{backup_id}"))
            .spawn(move || run_backup_worker(&endpoints, &receiver, ready_tx))
            .map_err(|err| {
                SqlSchedulerError::ConnectionError(format!(
                    "failed to spawn SQLite restore thread: {err}"
                ))
            })?;

        ready_rx.await.map_err(|_| {
            SqlSchedulerError::ConnectionError("SQLite restore worker exited while starting".into())
        })??;
        debug!(backup_id, "restore session started");
        Ok(Self { sender })
    }
}

#[async_trait]
impl BackupHandle for SqliteBackup {
    async fn step(&self, pages: i32) -> Result<BackupProgress, SqlSchedulerError> {
        let (respond_to, rx) = oneshot::channel();
        self.sender
            .send(BackupCommand::Step { pages, respond_to })
            .map_err(|_| SqlSchedulerError::misuse("Backup is already finished"))?;
        rx.await.map_err(|_| {
            SqlSchedulerError::ConnectionError("SQLite restore worker dropped while stepping".into())
        })?
    }

    async fn finish(&self) -> Result<(), SqlSchedulerError> {
        let (respond_to, rx) = oneshot::channel();
        if self
            .sender
            .send(BackupCommand::Finish { respond_to })
            .is_err()
        {
            return Ok(());
        }
        rx.await.unwrap_or(Ok(()))
    }
}

fn is_memory_path(path: &str) -> bool {
    path.is_empty() || path == ":memory:" || path.contains("mode=memory")
}

pub(super) fn database_name(name: &str) -> DatabaseName<'_> {
    match name {
        "main" => DatabaseName::Main,
        "temp" => DatabaseName::Temp,
        other => DatabaseName::Attached(other),
    }
}

pub(super) fn open_endpoint(
    path: &str,
    flags: OpenFlags,
    busy_timeout: Duration,
) -> Result<Connection, SqlSchedulerError> {
    let conn = Connection::open_with_flags(path, flags)?;
    conn.busy_timeout(busy_timeout)?;
    Ok(conn)
}

fn run_backup_worker(
    endpoints: &Endpoints,
    receiver: &Receiver<BackupCommand>,
    ready: oneshot::Sender<Result<(), SqlSchedulerError>>,
) {
    let opened = open_endpoint(
        &endpoints.source_path,
        open_flags(OpenMode::ReadWriteCreate),
        endpoints.busy_timeout,
    )
    .and_then(|source| {
        open_endpoint(
            &endpoints.destination_path,
            endpoints.destination_flags,
            endpoints.busy_timeout,
        )
        .map(|destination| (source, destination))
    });
    let (source, mut destination) = match opened {
        Ok(pair) => pair,
        Err(err) => {
            let _ = ready.send(Err(err));
            return;
        }
    };

    let backup = match Backup::new_with_names(
        &source,
        database_name(&endpoints.source_name),
        &mut destination,
        database_name(&endpoints.destination_name),
    ) {
        Ok(backup) => backup,
        Err(err) => {
            let _ = ready.send(Err(err.into()));
            return;
        }
    };
    if ready.send(Ok(())).is_err() {
        return;
    }

    let finished = serve_backup(&backup, receiver);
    drop(backup);
    debug!("restore session finished");
    if let Some(respond_to) = finished {
        let _ = respond_to.send(Ok(()));
    }
}

fn serve_backup(backup: &Backup<'_, '_>, receiver: &Receiver<BackupCommand>) -> Option<Reply<()>> {
    while let Ok(command) = receiver.recv() {
        match command {
            BackupCommand::Step { pages, respond_to } => {
                let _ = respond_to.send(step_backup(backup, pages));
            }
            BackupCommand::Finish { respond_to } => return Some(respond_to),
        }
    }
    None
}

pub(super) fn step_backup(
    backup: &Backup<'_, '_>,
    pages: i32,
) -> Result<BackupProgress, SqlSchedulerError> {
    let done = match backup.step(pages)? {
        StepResult::Done => true,
        StepResult::More => false,
        StepResult::Busy => {
            return Err(SqlSchedulerError::engine(
                ErrorCode::Busy,
                "database is locked",
            ));
        }
        StepResult::Locked => {
            return Err(SqlSchedulerError::engine(
                ErrorCode::Locked,
                "database table is locked",
            ));
        }
        #[allow(unreachable_patterns)]
        _ => {
            return Err(SqlSchedulerError::engine(
                ErrorCode::Error,
                "unexpected backup step result",
            ));
        }
    };
    let progress = backup.progress();
    Ok(BackupProgress {
        done,
        remaining: progress.remaining,
        page_count: progress.pagecount,
    })
}
