//! Incremental online backup sessions.
//!
//! A [`BackupSession`] copies pages between the connection's database and another file in
//! bounded steps. Its operations share the connection's queue on a lane of their own, so they
//! keep their order relative to each other under either scheduling policy.
//!
//! ```text
//! Idle --step(n)--> Stepping --more pages--> Idle
//!                            --done--------> Completed
//!                            --retryable---> Idle      (error still reported)
//!                            --other err---> Failed
//! Idle --finish()--> Completed
//! ```

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tracing::debug;

use crate::connection::ConnectionInner;
use crate::engine::{BackupHandle, BackupProgress};
use crate::error::{ErrorCode, SqlSchedulerError};
use crate::queue::{LaneId, OperationKind, Pending};

/// Which way pages flow relative to the owning connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BackupDirection {
    /// Copy the connection's database into the file.
    #[default]
    ToFile,
    /// Copy the file into the connection's database.
    FromFile,
}

/// Describes a backup between the connection's database and a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRequest {
    pub path: String,
    pub direction: BackupDirection,
    /// Schema read from on the source side.
    pub source_name: String,
    /// Schema written on the destination side.
    pub destination_name: String,
}

impl BackupRequest {
    #[must_use]
    pub fn to_file(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            direction: BackupDirection::ToFile,
            source_name: "main".into(),
            destination_name: "main".into(),
        }
    }

    #[must_use]
    pub fn from_file(path: impl Into<String>) -> Self {
        Self {
            direction: BackupDirection::FromFile,
            ..Self::to_file(path)
        }
    }

    #[must_use]
    pub fn source_name(mut self, name: impl Into<String>) -> Self {
        self.source_name = name.into();
        self
    }

    #[must_use]
    pub fn destination_name(mut self, name: impl Into<String>) -> Self {
        self.destination_name = name.into();
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupState {
    /// No step or finish is queued or running.
    Idle,
    /// Work for this session is queued or running.
    Stepping,
    Completed,
    Failed,
}

impl BackupState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Error codes treated as transient by a fresh session.
#[must_use]
pub fn default_retry_errors() -> HashSet<ErrorCode> {
    HashSet::from([ErrorCode::Busy, ErrorCode::Locked])
}

enum Slot {
    Initializing,
    Ready(Arc<dyn BackupHandle>),
    InitFailed(SqlSchedulerError),
    Released,
}

struct SessionState {
    /// Only `Completed` and `Failed` are stored; the others follow from `outstanding`.
    terminal: Option<BackupState>,
    outstanding: usize,
    remaining: i32,
    page_count: i32,
    message: Option<String>,
    retry_errors: HashSet<ErrorCode>,
    slot: Slot,
    /// Counted by the connection as an unfinished backup.
    counted: bool,
}

impl SessionState {
    fn state(&self) -> BackupState {
        match self.terminal {
            Some(state) => state,
            None if self.outstanding > 0 => BackupState::Stepping,
            None => BackupState::Idle,
        }
    }

    fn fail(&mut self, err: &SqlSchedulerError) {
        self.terminal = Some(BackupState::Failed);
        self.message = Some(err.to_string());
    }
}

struct SessionInner {
    conn: Weak<ConnectionInner>,
    lane: LaneId,
    request: BackupRequest,
    state: Mutex<SessionState>,
}

impl SessionInner {
    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn uncount(&self, state: &mut SessionState) {
        if std::mem::take(&mut state.counted) {
            if let Some(conn) = self.conn.upgrade() {
                conn.backup_released();
            }
        }
    }

    /// Take the engine session out so it can be finished, leaving `Released` behind.
    fn take_handle(&self) -> Option<Arc<dyn BackupHandle>> {
        let mut state = self.lock();
        match std::mem::replace(&mut state.slot, Slot::Released) {
            Slot::Ready(handle) => Some(handle),
            other => {
                state.slot = other;
                None
            }
        }
    }

    async fn release(&self) {
        if let Some(handle) = self.take_handle() {
            if let Err(err) = handle.finish().await {
                debug!(error = %err, "backup finish reported an error");
            }
        }
        let mut state = self.lock();
        if matches!(state.slot, Slot::InitFailed(_)) {
            state.slot = Slot::Released;
        }
        self.uncount(&mut state);
    }

    fn done_with_one(&self) {
        let mut state = self.lock();
        state.outstanding = state.outstanding.saturating_sub(1);
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        let state = self
            .state
            .get_mut()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if std::mem::take(&mut state.counted) {
            if let Some(conn) = self.conn.upgrade() {
                conn.backup_released();
            }
        }
    }
}

/// Handle to one backup session.
#[derive(Clone)]
pub struct BackupSession {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for BackupSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupSession")
            .field("path", &self.inner.request.path)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl BackupSession {
    /// Create the session and queue its initialization on `conn`.
    pub(crate) fn start(conn: &Arc<ConnectionInner>, request: BackupRequest) -> Self {
        let lane = conn.allocate_lane();
        conn.backup_started();
        let inner = Arc::new(SessionInner {
            conn: Arc::downgrade(conn),
            lane,
            request: request.clone(),
            state: Mutex::new(SessionState {
                terminal: None,
                outstanding: 1,
                remaining: -1,
                page_count: -1,
                message: None,
                retry_errors: default_retry_errors(),
                slot: Slot::Initializing,
                counted: true,
            }),
        });

        let session = Arc::clone(&inner);
        let submitted = conn.try_submit(OperationKind::BackupInit, Some(lane), move |engine| {
            async move {
                let outcome = engine.backup(request).await;
                let mut state = session.lock();
                state.outstanding = state.outstanding.saturating_sub(1);
                match outcome {
                    Ok(handle) => state.slot = Slot::Ready(Arc::from(handle)),
                    Err(err) => {
                        debug!(error = %err, "backup initialization failed");
                        state.fail(&err);
                        state.slot = Slot::InitFailed(err);
                        session.uncount(&mut state);
                    }
                }
                Ok(())
            }
        });

        if let Err(err) = submitted {
            let mut state = inner.lock();
            state.outstanding = 0;
            state.fail(&err);
            state.slot = Slot::InitFailed(err);
            inner.uncount(&mut state);
        }
        Self { inner }
    }

    #[must_use]
    pub fn state(&self) -> BackupState {
        self.inner.lock().state()
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.state() == BackupState::Idle
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.state() == BackupState::Completed
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.state() == BackupState::Failed
    }

    /// Pages left to copy after the last step; `-1` before the first step.
    #[must_use]
    pub fn remaining(&self) -> i32 {
        self.inner.lock().remaining
    }

    /// Total pages in the source after the last step; `-1` before the first step.
    #[must_use]
    pub fn page_count(&self) -> i32 {
        self.inner.lock().page_count
    }

    /// Message of the failure that ended the session, if any.
    #[must_use]
    pub fn message(&self) -> Option<String> {
        self.inner.lock().message.clone()
    }

    #[must_use]
    pub fn request(&self) -> &BackupRequest {
        &self.inner.request
    }

    #[must_use]
    pub fn retry_errors(&self) -> HashSet<ErrorCode> {
        self.inner.lock().retry_errors.clone()
    }

    /// Replace the transient error set. Steps already submitted keep the set they captured.
    ///
    /// An empty set makes every error terminal and leaves releasing the session to
    /// [`finish`](Self::finish).
    pub fn set_retry_errors(&self, codes: impl IntoIterator<Item = ErrorCode>) {
        self.inner.lock().retry_errors = codes.into_iter().collect();
    }

    /// Copy up to `pages` pages; `-1` copies everything left. Resolves to `true` once the
    /// copy is complete.
    pub fn step(&self, pages: i32) -> Pending<bool> {
        let retry = {
            let mut state = self.inner.lock();
            if state.terminal.is_some() {
                return Pending::failed(finished());
            }
            state.outstanding += 1;
            state.retry_errors.clone()
        };

        let session = Arc::clone(&self.inner);
        self.submit(OperationKind::BackupStep, move || async move {
            let outcome = run_step(&session, pages, &retry).await;
            session.done_with_one();
            outcome
        })
    }

    /// End the session, releasing its engine resources. A no-op once released.
    pub fn finish(&self) -> Pending<()> {
        {
            let mut state = self.inner.lock();
            if matches!(state.slot, Slot::Released) {
                return Pending::ready(Ok(()));
            }
            state.outstanding += 1;
        }

        let session = Arc::clone(&self.inner);
        self.submit(OperationKind::BackupFinish, move || async move {
            session.release().await;
            let mut state = session.lock();
            state.outstanding = state.outstanding.saturating_sub(1);
            if state.terminal.is_none() {
                state.terminal = Some(BackupState::Completed);
            }
            Ok(())
        })
    }

    fn submit<T, F, Fut>(&self, kind: OperationKind, work: F) -> Pending<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<T, SqlSchedulerError>> + Send + 'static,
    {
        let Some(conn) = self.inner.conn.upgrade() else {
            self.inner.done_with_one();
            return Pending::failed(SqlSchedulerError::misuse("Database is closed"));
        };
        match conn.try_submit(kind, Some(self.inner.lane), move |_| work()) {
            Ok(pending) => pending,
            Err(err) => {
                self.inner.done_with_one();
                Pending::failed(err)
            }
        }
    }
}

async fn run_step(
    session: &Arc<SessionInner>,
    pages: i32,
    retry: &HashSet<ErrorCode>,
) -> Result<bool, SqlSchedulerError> {
    let handle = {
        let state = session.lock();
        if state.terminal.is_some() {
            return Err(match &state.slot {
                Slot::InitFailed(err) => err.clone(),
                _ => finished(),
            });
        }
        match &state.slot {
            Slot::Ready(handle) => Arc::clone(handle),
            Slot::InitFailed(err) => return Err(err.clone()),
            Slot::Initializing | Slot::Released => return Err(finished()),
        }
    };

    let outcome = handle.step(pages).await;
    drop(handle);
    let auto_release = !retry.is_empty();
    match outcome {
        Ok(BackupProgress {
            done,
            remaining,
            page_count,
        }) => {
            {
                let mut state = session.lock();
                state.remaining = remaining;
                state.page_count = page_count;
                if done {
                    state.terminal = Some(BackupState::Completed);
                }
            }
            if done {
                debug!(page_count, "backup completed");
                if auto_release {
                    session.release().await;
                }
            }
            Ok(done)
        }
        Err(err) if err.code().is_some_and(|code| retry.contains(&code)) => {
            debug!(error = %err, "backup step hit transient contention");
            Err(err)
        }
        Err(err) => {
            debug!(error = %err, "backup step failed");
            session.lock().fail(&err);
            if auto_release {
                session.release().await;
            }
            Err(err)
        }
    }
}

fn finished() -> SqlSchedulerError {
    SqlSchedulerError::misuse("Backup is already finished")
}
