//! Observer notifications published by a connection.
//!
//! Events fan out over a `tokio::sync::broadcast` channel; publishing with no subscribers
//! is a no-op and slow subscribers observe `RecvError::Lagged` rather than stalling the engine.

use std::time::Duration;

use tokio::sync::broadcast;
use tracing::trace;

use crate::error::SqlSchedulerError;

/// Kind of row-level change reported by the engine's update hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Open,
    Close,
    Change {
        kind: ChangeKind,
        database: String,
        table: String,
        rowid: i64,
    },
    /// SQL text of a statement execution, with bound parameters expanded.
    Trace { sql: String },
    Profile { sql: String, duration: Duration },
    /// A failure nobody was waiting for.
    Error { message: String },
}

/// Cheaply clonable publishing side of a connection's event channel.
#[derive(Debug, Clone)]
pub struct EventSink {
    sender: broadcast::Sender<Event>,
}

impl EventSink {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: Event) {
        if self.sender.send(event).is_err() {
            trace!("event dropped: no subscribers");
        }
    }

    pub(crate) fn error(&self, err: &SqlSchedulerError) {
        self.emit(Event::Error {
            message: err.to_string(),
        });
    }
}
