//! Storage engine seam.
//!
//! A [`Connection`](crate::Connection) talks to its database only through these traits, so the
//! scheduler can be exercised against an instrumented or fake engine. [`Engine`] opens handles;
//! an [`EngineHandle`] owns one open database; a [`BackupHandle`] drives one page-copy session.
//!
//! Handles are not expected to serialize calls themselves beyond what the engine needs for
//! memory safety: ordering is the job of the operation queue in front of them.

mod verbose;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::backup::BackupRequest;
use crate::config::ConnectionOptions;
use crate::error::SqlSchedulerError;
use crate::events::EventSink;
use crate::results::{CustomDbRow, ResultSet, RunResult};
use crate::types::{Limit, Params};

pub use verbose::VerboseEngine;

/// Engine-assigned identity of a prepared statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StatementId(pub u64);

impl fmt::Display for StatementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stmt#{}", self.0)
    }
}

/// What the engine reports about a freshly prepared statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementInfo {
    pub id: StatementId,
    pub parameter_count: usize,
    pub column_names: Vec<String>,
}

/// Page counters after a backup step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackupProgress {
    /// The copy reached the last page.
    pub done: bool,
    pub remaining: i32,
    pub page_count: i32,
}

/// Opens engine handles.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Open the database described by `options`. Change, trace and profile notifications
    /// produced by the engine are published on `events`.
    async fn open(
        &self,
        options: &ConnectionOptions,
        events: EventSink,
    ) -> Result<Arc<dyn EngineHandle>, SqlSchedulerError>;
}

/// One open database.
///
/// Statement execution (`get`, `all`, `each`, `run`) binds `params` first when they are not
/// empty, clearing any earlier bindings and rewinding the statement.
///
/// `get` walks a cursor that survives between calls: successive calls return successive
/// rows, then `None` until the statement is reset or rebound. `all`, `each` and `run` always
/// start from the first row and leave the cursor exhausted.
#[async_trait]
pub trait EngineHandle: Send + Sync {
    /// Run one or more `;`-separated statements, discarding rows.
    async fn exec(&self, sql: String) -> Result<(), SqlSchedulerError>;

    async fn prepare(&self, sql: Arc<String>) -> Result<StatementInfo, SqlSchedulerError>;

    /// Replace the statement's bindings.
    async fn bind(&self, stmt: StatementId, params: Params) -> Result<(), SqlSchedulerError>;

    /// Next row of the statement's cursor, if any.
    async fn get(
        &self,
        stmt: StatementId,
        params: Params,
    ) -> Result<Option<CustomDbRow>, SqlSchedulerError>;

    async fn all(&self, stmt: StatementId, params: Params) -> Result<ResultSet, SqlSchedulerError>;

    /// Send every row to `rows` as it is produced; returns the row count.
    async fn each(
        &self,
        stmt: StatementId,
        params: Params,
        rows: mpsc::UnboundedSender<CustomDbRow>,
    ) -> Result<usize, SqlSchedulerError>;

    /// Step to completion, discarding rows.
    async fn run(&self, stmt: StatementId, params: Params) -> Result<RunResult, SqlSchedulerError>;

    /// Rewind the cursor, keeping the bindings.
    async fn reset(&self, stmt: StatementId) -> Result<(), SqlSchedulerError>;

    async fn finalize(&self, stmt: StatementId) -> Result<(), SqlSchedulerError>;

    async fn set_busy_timeout(&self, timeout: Duration) -> Result<(), SqlSchedulerError>;

    /// Set a run-time limit, returning its previous value.
    async fn set_limit(&self, limit: Limit, value: i32) -> Result<i32, SqlSchedulerError>;

    async fn backup(&self, request: BackupRequest)
    -> Result<Box<dyn BackupHandle>, SqlSchedulerError>;

    /// Abort whatever the engine is executing right now. Must not block.
    fn interrupt(&self);

    /// Release the database. Fails with `SQLITE_BUSY` while statements are still prepared,
    /// in which case the handle stays usable.
    async fn close(&self) -> Result<(), SqlSchedulerError>;
}

/// One page-copy session between two databases.
#[async_trait]
pub trait BackupHandle: Send + Sync {
    /// Copy up to `pages` pages; a negative count copies everything that is left.
    async fn step(&self, pages: i32) -> Result<BackupProgress, SqlSchedulerError>;

    /// Release the session. Calling it again is a no-op.
    async fn finish(&self) -> Result<(), SqlSchedulerError>;
}
