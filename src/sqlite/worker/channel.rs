use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::backup::BackupRequest;
use crate::engine::{BackupProgress, StatementId, StatementInfo};
use crate::error::SqlSchedulerError;
use crate::results::{CustomDbRow, ResultSet, RunResult};
use crate::types::{Limit, Params};

pub(super) type Reply<T> = oneshot::Sender<Result<T, SqlSchedulerError>>;

pub(super) enum Command {
    Exec {
        sql: String,
        respond_to: Reply<()>,
    },
    Prepare {
        sql: Arc<String>,
        respond_to: Reply<StatementInfo>,
    },
    Bind {
        stmt: StatementId,
        params: Params,
        respond_to: Reply<()>,
    },
    Get {
        stmt: StatementId,
        params: Params,
        respond_to: Reply<Option<CustomDbRow>>,
    },
    All {
        stmt: StatementId,
        params: Params,
        respond_to: Reply<ResultSet>,
    },
    Each {
        stmt: StatementId,
        params: Params,
        rows: mpsc::UnboundedSender<CustomDbRow>,
        respond_to: Reply<usize>,
    },
    Run {
        stmt: StatementId,
        params: Params,
        respond_to: Reply<RunResult>,
    },
    Reset {
        stmt: StatementId,
        respond_to: Reply<()>,
    },
    Finalize {
        stmt: StatementId,
        respond_to: Reply<()>,
    },
    BusyTimeout {
        timeout: Duration,
        respond_to: Reply<()>,
    },
    SetLimit {
        limit: Limit,
        value: i32,
        respond_to: Reply<i32>,
    },
    /// Open a copy from this connection into a file; answered with the session number.
    BackupStart {
        request: BackupRequest,
        respond_to: Reply<u64>,
    },
    BackupStep {
        session: u64,
        pages: i32,
        respond_to: Reply<BackupProgress>,
    },
    /// Sent without a reply channel when the handle is dropped.
    BackupFinish {
        session: u64,
        respond_to: Option<Reply<()>>,
    },
    Close {
        respond_to: Reply<()>,
    },
    Shutdown,
}
