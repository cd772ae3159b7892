//! Backups that copy the worker's own connection into a file.
//!
//! A `rusqlite::backup::Backup` borrows the connection, so it cannot be stored next to it.
//! Instead the worker keeps serving commands from inside the stack frame that owns the
//! backup, and returns from that frame once the session is released. Nested sessions form a
//! chain of frames, innermost first.

use std::cell::RefCell;
use std::sync::mpsc::Sender;

use async_trait::async_trait;
use rusqlite::backup::Backup;
use tokio::sync::oneshot;

use crate::engine::{BackupHandle, BackupProgress};
use crate::error::SqlSchedulerError;
use crate::sqlite::backup::step_backup;

use super::channel::Command;
use super::manager::connection_error;

/// Sessions open on the worker's stack.
pub(super) trait OpenSessions {
    /// `None` when no open session has this number.
    fn step(&self, session: u64, pages: i32) -> Option<Result<BackupProgress, SqlSchedulerError>>;

    /// Drop the session's backup. Returns `false` when it was not found.
    fn release(&self, session: u64) -> bool;

    fn is_live(&self, session: u64) -> bool;
}

pub(super) struct Frame<'a, 'conn, 'file> {
    pub(super) session: u64,
    pub(super) backup: RefCell<Option<Backup<'conn, 'file>>>,
    pub(super) outer: Option<&'a dyn OpenSessions>,
}

impl OpenSessions for Frame<'_, '_, '_> {
    fn step(&self, session: u64, pages: i32) -> Option<Result<BackupProgress, SqlSchedulerError>> {
        if session != self.session {
            return self.outer.and_then(|outer| outer.step(session, pages));
        }
        let backup = self.backup.borrow();
        Some(match backup.as_ref() {
            Some(backup) => step_backup(backup, pages),
            None => Err(already_finished()),
        })
    }

    fn release(&self, session: u64) -> bool {
        if session != self.session {
            return self.outer.is_some_and(|outer| outer.release(session));
        }
        // Dropping the Backup finishes it.
        let released = self.backup.borrow_mut().take();
        released.is_some()
    }

    fn is_live(&self, session: u64) -> bool {
        if session == self.session {
            self.backup.borrow().is_some()
        } else {
            self.outer.is_some_and(|outer| outer.is_live(session))
        }
    }
}

pub(super) fn already_finished() -> SqlSchedulerError {
    SqlSchedulerError::misuse("Backup is already finished")
}

/// Front-end handle for a session served by the worker.
pub(super) struct WorkerBackup {
    sender: Sender<Command>,
    session: u64,
}

impl WorkerBackup {
    pub(super) fn new(sender: Sender<Command>, session: u64) -> Self {
        Self { sender, session }
    }
}

#[async_trait]
impl BackupHandle for WorkerBackup {
    async fn step(&self, pages: i32) -> Result<BackupProgress, SqlSchedulerError> {
        let (respond_to, rx) = oneshot::channel();
        self.sender
            .send(Command::BackupStep {
                session: self.session,
                pages,
                respond_to,
            })
            .map_err(|_| already_finished())?;
        rx.await
            .map_err(|_| connection_error("SQLite worker dropped while stepping a backup"))?
    }

    async fn finish(&self) -> Result<(), SqlSchedulerError> {
        let (respond_to, rx) = oneshot::channel();
        if self
            .sender
            .send(Command::BackupFinish {
                session: self.session,
                respond_to: Some(respond_to),
            })
            .is_err()
        {
            return Ok(());
        }
        rx.await.unwrap_or(Ok(()))
    }
}

impl Drop for WorkerBackup {
    fn drop(&mut self) {
        let _ = self.sender.send(Command::BackupFinish {
            session: self.session,
            respond_to: None,
        });
    }
}
