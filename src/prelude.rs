//! Convenient imports for common functionality.
//!
//! This module re-exports the types most callers need to open a connection, run
//! statements and drive backups.

pub use crate::backup::{BackupDirection, BackupRequest, BackupSession, BackupState};
pub use crate::config::{ConnectionOptions, ConnectionOptionsBuilder, OpenMode};
pub use crate::connection::{Connection, ConnectionState};
pub use crate::error::{ErrorCode, SqlSchedulerError};
pub use crate::events::{ChangeKind, Event};
pub use crate::queue::Pending;
pub use crate::registry::ConnectionRegistry;
pub use crate::results::{CustomDbRow, MappedRow, ResultSet, RowMap, RunResult};
pub use crate::statement::{Statement, StatementPhase};
pub use crate::types::{Limit, Params, RowValues, SchedulingPolicy};
