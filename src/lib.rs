//! Async operation scheduler for SQLite connections.
//!
//! A [`Connection`] owns one engine handle and an operation queue. Statement preparation,
//! binding, stepping, whole-script execution and incremental backups are submitted to the
//! queue as they are called and run against the handle under one of two policies:
//!
//! - [`SchedulingPolicy::Sequential`]: one operation at a time, in submission order.
//! - [`SchedulingPolicy::Concurrent`]: operations on different statements may overlap; each
//!   statement (and each backup session) still sees its own operations in order.
//!
//! ```no_run
//! use sql_scheduler::prelude::*;
//!
//! # async fn demo() -> Result<(), SqlSchedulerError> {
//! let conn = ConnectionOptionsBuilder::new("app.db")
//!     .policy(SchedulingPolicy::Concurrent)
//!     .build()
//!     .await?;
//! conn.exec("CREATE TABLE IF NOT EXISTS foo (txt TEXT)").await?;
//! let insert = conn.prepare("INSERT INTO foo VALUES (?)").await?;
//! insert.run(vec![RowValues::Text("hello".into())]).await?;
//! insert.finalize().await?;
//! conn.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod backup;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod events;
pub mod prelude;
pub mod queue;
pub mod registry;
pub mod results;
pub mod sqlite;
pub mod statement;
pub mod types;

pub use backup::{BackupDirection, BackupRequest, BackupSession, BackupState};
pub use config::{ConnectionOptions, ConnectionOptionsBuilder, OpenMode};
pub use connection::{Connection, ConnectionState};
pub use engine::{Engine, EngineHandle, VerboseEngine};
pub use error::{ErrorCode, SqlSchedulerError};
pub use events::{ChangeKind, Event};
pub use queue::Pending;
pub use registry::ConnectionRegistry;
pub use results::{CustomDbRow, MappedRow, ResultSet, RowMap, RunResult};
pub use sqlite::SqliteEngine;
pub use statement::{Statement, StatementPhase};
pub use types::{Limit, Params, RowValues, SchedulingPolicy};
