use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::error::SqlSchedulerError;

/// Deferred result of a submitted operation.
///
/// The operation is already queued when a `Pending` is handed out; awaiting it only
/// observes the outcome. Dropping it does not cancel the operation.
#[must_use = "the operation runs regardless; await the Pending to observe its outcome"]
pub struct Pending<T> {
    inner: Inner<T>,
}

enum Inner<T> {
    Ready(Option<Result<T, SqlSchedulerError>>),
    Waiting(oneshot::Receiver<Result<T, SqlSchedulerError>>),
}

impl<T> Pending<T> {
    pub(crate) fn waiting(receiver: oneshot::Receiver<Result<T, SqlSchedulerError>>) -> Self {
        Self {
            inner: Inner::Waiting(receiver),
        }
    }

    pub(crate) fn ready(outcome: Result<T, SqlSchedulerError>) -> Self {
        Self {
            inner: Inner::Ready(Some(outcome)),
        }
    }

    pub(crate) fn failed(err: SqlSchedulerError) -> Self {
        Self::ready(Err(err))
    }
}

// Neither variant is structurally pinned.
impl<T> Unpin for Pending<T> {}

impl<T> Future for Pending<T> {
    type Output = Result<T, SqlSchedulerError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().inner {
            Inner::Ready(slot) => Poll::Ready(slot.take().unwrap_or_else(|| {
                Err(SqlSchedulerError::misuse("operation result already taken"))
            })),
            Inner::Waiting(receiver) => Pin::new(receiver).poll(cx).map(|received| {
                received.unwrap_or_else(|_| {
                    Err(SqlSchedulerError::ConnectionError(
                        "operation dropped before completion".into(),
                    ))
                })
            }),
        }
    }
}

impl<T> std::fmt::Debug for Pending<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &self.inner {
            Inner::Ready(Some(Ok(_))) => "ready(ok)",
            Inner::Ready(Some(Err(_))) => "ready(err)",
            Inner::Ready(None) => "taken",
            Inner::Waiting(_) => "waiting",
        };
        f.debug_struct("Pending").field("state", &state).finish()
    }
}
