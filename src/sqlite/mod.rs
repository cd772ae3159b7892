// SQLite engine - rusqlite behind the scheduler's engine traits
//
// - worker: dedicated thread owning the connection, its prepared statements and outgoing backups
// - backup: per-session thread restoring a file into the connection's database
// - params: parameter conversion and binding
// - query: row extraction

mod backup;
pub mod params;
pub mod query;
pub mod worker;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::ConnectionOptions;
use crate::engine::{Engine, EngineHandle};
use crate::error::SqlSchedulerError;
use crate::events::EventSink;

pub use params::{bind_params, row_value_to_sqlite_value};
pub use query::sqlite_extract_value_sync;
pub use worker::SqliteHandle;

/// Default engine: one rusqlite connection per handle.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteEngine;

#[async_trait]
impl Engine for SqliteEngine {
    async fn open(
        &self,
        options: &ConnectionOptions,
        events: EventSink,
    ) -> Result<Arc<dyn EngineHandle>, SqlSchedulerError> {
        let handle = SqliteHandle::open(options, events).await?;
        Ok(Arc::new(handle))
    }
}
