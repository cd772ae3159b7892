use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::InterruptHandle;
use tokio::sync::mpsc;

use crate::backup::{BackupDirection, BackupRequest};
use crate::config::{ConnectionOptions, OpenMode};
use crate::engine::{BackupHandle, EngineHandle, StatementId, StatementInfo};
use crate::error::SqlSchedulerError;
use crate::events::EventSink;
use crate::results::{CustomDbRow, ResultSet, RunResult};
use crate::sqlite::backup::SqliteBackup;
use crate::types::{Limit, Params};

use super::manager::SqliteWorker;
use super::session::WorkerBackup;

/// rusqlite connection backed by a dedicated worker thread.
pub struct SqliteHandle {
    worker: SqliteWorker,
    interrupt: InterruptHandle,
    db_path: String,
    mode: OpenMode,
    busy_timeout: Mutex<Duration>,
}

impl SqliteHandle {
    /// Open the database described by `options` on a new worker thread.
    ///
    /// # Errors
    /// Returns the engine error when the file cannot be opened, or `ConnectionError` if the
    /// worker thread cannot be spawned.
    pub async fn open(
        options: &ConnectionOptions,
        events: EventSink,
    ) -> Result<Self, SqlSchedulerError> {
        let (worker, interrupt) = SqliteWorker::spawn(options, events).await?;
        Ok(Self {
            worker,
            interrupt,
            db_path: options.db_path.clone(),
            mode: options.mode,
            busy_timeout: Mutex::new(options.busy_timeout),
        })
    }

    fn current_busy_timeout(&self) -> Duration {
        self.busy_timeout
            .lock()
            .map_or(Duration::ZERO, |timeout| *timeout)
    }
}

impl fmt::Debug for SqliteHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteHandle")
            .field("worker_id", &self.worker.worker_id())
            .field("db_path", &self.db_path)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl EngineHandle for SqliteHandle {
    async fn exec(&self, sql: String) -> Result<(), SqlSchedulerError> {
        self.worker.exec(sql).await
    }

    async fn prepare(&self, sql: Arc<String>) -> Result<StatementInfo, SqlSchedulerError> {
        self.worker.prepare(sql).await
    }

    async fn bind(&self, stmt: StatementId, params: Params) -> Result<(), SqlSchedulerError> {
        self.worker.bind(stmt, params).await
    }

    async fn get(
        &self,
        stmt: StatementId,
        params: Params,
    ) -> Result<Option<CustomDbRow>, SqlSchedulerError> {
        self.worker.get(stmt, params).await
    }

    async fn all(&self, stmt: StatementId, params: Params) -> Result<ResultSet, SqlSchedulerError> {
        self.worker.all(stmt, params).await
    }

    async fn each(
        &self,
        stmt: StatementId,
        params: Params,
        rows: mpsc::UnboundedSender<CustomDbRow>,
    ) -> Result<usize, SqlSchedulerError> {
        self.worker.each(stmt, params, rows).await
    }

    async fn run(&self, stmt: StatementId, params: Params) -> Result<RunResult, SqlSchedulerError> {
        self.worker.run(stmt, params).await
    }

    async fn reset(&self, stmt: StatementId) -> Result<(), SqlSchedulerError> {
        self.worker.reset(stmt).await
    }

    async fn finalize(&self, stmt: StatementId) -> Result<(), SqlSchedulerError> {
        self.worker.finalize(stmt).await
    }

    async fn set_busy_timeout(&self, timeout: Duration) -> Result<(), SqlSchedulerError> {
        self.worker.busy_timeout(timeout).await?;
        if let Ok(mut current) = self.busy_timeout.lock() {
            *current = timeout;
        }
        Ok(())
    }

    async fn set_limit(&self, limit: Limit, value: i32) -> Result<i32, SqlSchedulerError> {
        self.worker.set_limit(limit, value).await
    }

    /// Copies out of the connection run on its worker, so temp and in-memory schemas are
    /// reachable. Restores reopen the database file on a separate thread.
    async fn backup(
        &self,
        request: BackupRequest,
    ) -> Result<Box<dyn BackupHandle>, SqlSchedulerError> {
        match request.direction {
            BackupDirection::ToFile => {
                let session = self.worker.start_backup(request).await?;
                Ok(Box::new(WorkerBackup::new(self.worker.sender(), session)))
            }
            BackupDirection::FromFile => {
                let restore = SqliteBackup::restore(
                    &self.db_path,
                    self.mode,
                    request,
                    self.current_busy_timeout(),
                )
                .await?;
                Ok(Box::new(restore))
            }
        }
    }

    fn interrupt(&self) {
        self.interrupt.interrupt();
    }

    async fn close(&self) -> Result<(), SqlSchedulerError> {
        self.worker.close().await
    }
}
