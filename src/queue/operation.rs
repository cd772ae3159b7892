use std::fmt;
use std::future::Future;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tokio::sync::oneshot;

use crate::error::SqlSchedulerError;
use crate::events::EventSink;

use super::pending::Pending;

/// What an operation does; used for dispatch decisions and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Exec,
    Prepare,
    Bind,
    Get,
    All,
    Each,
    Run,
    Reset,
    Finalize,
    Configure,
    Wait,
    Close,
    BackupInit,
    BackupStep,
    BackupFinish,
}

impl OperationKind {
    /// Exclusive operations act as barriers under every policy.
    #[must_use]
    pub fn is_exclusive(self) -> bool {
        matches!(self, Self::Exec | Self::Wait | Self::Close)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exec => "exec",
            Self::Prepare => "prepare",
            Self::Bind => "bind",
            Self::Get => "get",
            Self::All => "all",
            Self::Each => "each",
            Self::Run => "run",
            Self::Reset => "reset",
            Self::Finalize => "finalize",
            Self::Configure => "configure",
            Self::Wait => "wait",
            Self::Close => "close",
            Self::BackupInit => "backup",
            Self::BackupStep => "backup-step",
            Self::BackupFinish => "backup-finish",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a finished operation left the engine handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Completion {
    /// The engine handle is unusable; nothing queued may start.
    pub fatal: bool,
}

/// A unit of queued work whose continuation fires exactly once.
pub(crate) trait Operation: Send {
    fn kind(&self) -> OperationKind;

    /// Perform the engine work and deliver the outcome.
    fn start(self: Box<Self>) -> BoxFuture<'static, Completion>;

    /// Deliver `err` without contacting the engine.
    fn reject(self: Box<Self>, err: SqlSchedulerError);
}

type Work<T> = Box<dyn FnOnce() -> BoxFuture<'static, Result<T, SqlSchedulerError>> + Send>;

/// Operation producing a `T`, answered through a oneshot continuation.
pub(crate) struct Task<T> {
    kind: OperationKind,
    work: Work<T>,
    respond_to: oneshot::Sender<Result<T, SqlSchedulerError>>,
    events: EventSink,
}

impl<T: Send + 'static> Task<T> {
    pub(crate) fn new<F, Fut>(kind: OperationKind, events: EventSink, work: F) -> (Self, Pending<T>)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, SqlSchedulerError>> + Send + 'static,
    {
        let (respond_to, receiver) = oneshot::channel();
        let task = Self {
            kind,
            work: Box::new(move || work().boxed()),
            respond_to,
            events,
        };
        (task, Pending::waiting(receiver))
    }
}

fn deliver<T>(
    respond_to: oneshot::Sender<Result<T, SqlSchedulerError>>,
    outcome: Result<T, SqlSchedulerError>,
    events: &EventSink,
) {
    // Caller stopped listening: surface unclaimed failures on the event channel.
    if let Err(Err(err)) = respond_to.send(outcome) {
        events.error(&err);
    }
}

impl<T: Send + 'static> Operation for Task<T> {
    fn kind(&self) -> OperationKind {
        self.kind
    }

    fn start(self: Box<Self>) -> BoxFuture<'static, Completion> {
        let Task {
            work,
            respond_to,
            events,
            ..
        } = *self;
        async move {
            let outcome = work().await;
            let fatal = matches!(&outcome, Err(err) if err.is_fatal());
            deliver(respond_to, outcome, &events);
            Completion { fatal }
        }
        .boxed()
    }

    fn reject(self: Box<Self>, err: SqlSchedulerError) {
        deliver(self.respond_to, Err(err), &self.events);
    }
}
