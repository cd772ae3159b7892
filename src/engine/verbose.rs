use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::backup::BackupRequest;
use crate::config::ConnectionOptions;
use crate::error::SqlSchedulerError;
use crate::events::EventSink;
use crate::results::{CustomDbRow, ResultSet, RunResult};
use crate::types::{Limit, Params};

use super::{BackupHandle, BackupProgress, Engine, EngineHandle, StatementId, StatementInfo};

/// Engine decorator that annotates every error with the call that produced it.
///
/// Wrapped errors become [`SqlSchedulerError::Traced`]; the result code is preserved, so
/// callers matching on [`SqlSchedulerError::code`] are unaffected.
pub struct VerboseEngine {
    inner: Arc<dyn Engine>,
}

impl VerboseEngine {
    #[must_use]
    pub fn new(inner: Arc<dyn Engine>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Engine for VerboseEngine {
    async fn open(
        &self,
        options: &ConnectionOptions,
        events: EventSink,
    ) -> Result<Arc<dyn EngineHandle>, SqlSchedulerError> {
        let inner = self
            .inner
            .open(options, events)
            .await
            .map_err(|err| traced(err, format!("Connection::open({:?})", options.db_path)))?;
        Ok(Arc::new(VerboseHandle {
            inner,
            sql: Mutex::new(HashMap::new()),
        }))
    }
}

struct VerboseHandle {
    inner: Arc<dyn EngineHandle>,
    sql: Mutex<HashMap<StatementId, Arc<String>>>,
}

fn traced(err: SqlSchedulerError, context: String) -> SqlSchedulerError {
    SqlSchedulerError::Traced {
        context,
        source: Box::new(err),
    }
}

impl VerboseHandle {
    fn statement_call(&self, stmt: StatementId, method: &str) -> String {
        let sql = self
            .sql
            .lock()
            .ok()
            .and_then(|map| map.get(&stmt).cloned());
        match sql {
            Some(sql) => format!("Statement::{method}({sql:?})"),
            None => format!("Statement::{method}({stmt})"),
        }
    }

    fn wrap<T>(
        &self,
        stmt: StatementId,
        method: &str,
        result: Result<T, SqlSchedulerError>,
    ) -> Result<T, SqlSchedulerError> {
        result.map_err(|err| traced(err, self.statement_call(stmt, method)))
    }
}

#[async_trait]
impl EngineHandle for VerboseHandle {
    async fn exec(&self, sql: String) -> Result<(), SqlSchedulerError> {
        let context = format!("Connection::exec({sql:?})");
        self.inner
            .exec(sql)
            .await
            .map_err(|err| traced(err, context))
    }

    async fn prepare(&self, sql: Arc<String>) -> Result<StatementInfo, SqlSchedulerError> {
        let info = self
            .inner
            .prepare(Arc::clone(&sql))
            .await
            .map_err(|err| traced(err, format!("Statement::prepare({sql:?})")))?;
        if let Ok(mut map) = self.sql.lock() {
            map.insert(info.id, sql);
        }
        Ok(info)
    }

    async fn bind(&self, stmt: StatementId, params: Params) -> Result<(), SqlSchedulerError> {
        let result = self.inner.bind(stmt, params).await;
        self.wrap(stmt, "bind", result)
    }

    async fn get(
        &self,
        stmt: StatementId,
        params: Params,
    ) -> Result<Option<CustomDbRow>, SqlSchedulerError> {
        let result = self.inner.get(stmt, params).await;
        self.wrap(stmt, "get", result)
    }

    async fn all(&self, stmt: StatementId, params: Params) -> Result<ResultSet, SqlSchedulerError> {
        let result = self.inner.all(stmt, params).await;
        self.wrap(stmt, "all", result)
    }

    async fn each(
        &self,
        stmt: StatementId,
        params: Params,
        rows: mpsc::UnboundedSender<CustomDbRow>,
    ) -> Result<usize, SqlSchedulerError> {
        let result = self.inner.each(stmt, params, rows).await;
        self.wrap(stmt, "each", result)
    }

    async fn run(&self, stmt: StatementId, params: Params) -> Result<RunResult, SqlSchedulerError> {
        let result = self.inner.run(stmt, params).await;
        self.wrap(stmt, "run", result)
    }

    async fn reset(&self, stmt: StatementId) -> Result<(), SqlSchedulerError> {
        let result = self.inner.reset(stmt).await;
        self.wrap(stmt, "reset", result)
    }

    async fn finalize(&self, stmt: StatementId) -> Result<(), SqlSchedulerError> {
        let result = self.inner.finalize(stmt).await;
        let result = self.wrap(stmt, "finalize", result);
        if result.is_ok() {
            if let Ok(mut map) = self.sql.lock() {
                map.remove(&stmt);
            }
        }
        result
    }

    async fn set_busy_timeout(&self, timeout: Duration) -> Result<(), SqlSchedulerError> {
        self.inner
            .set_busy_timeout(timeout)
            .await
            .map_err(|err| traced(err, format!("Connection::configure(busy_timeout={timeout:?})")))
    }

    async fn set_limit(&self, limit: Limit, value: i32) -> Result<i32, SqlSchedulerError> {
        self.inner
            .set_limit(limit, value)
            .await
            .map_err(|err| traced(err, format!("Connection::configure(limit {limit:?}={value})")))
    }

    async fn backup(
        &self,
        request: BackupRequest,
    ) -> Result<Box<dyn BackupHandle>, SqlSchedulerError> {
        let context = format!("Connection::backup({:?})", request.path);
        let inner = self
            .inner
            .backup(request)
            .await
            .map_err(|err| traced(err, context.clone()))?;
        Ok(Box::new(VerboseBackup { inner, context }))
    }

    fn interrupt(&self) {
        self.inner.interrupt();
    }

    async fn close(&self) -> Result<(), SqlSchedulerError> {
        self.inner
            .close()
            .await
            .map_err(|err| traced(err, "Connection::close()".into()))
    }
}

struct VerboseBackup {
    inner: Box<dyn BackupHandle>,
    context: String,
}

#[async_trait]
impl BackupHandle for VerboseBackup {
    async fn step(&self, pages: i32) -> Result<BackupProgress, SqlSchedulerError> {
        self.inner
            .step(pages)
            .await
            .map_err(|err| traced(err, format!("{}.step({pages})", self.context)))
    }

    async fn finish(&self) -> Result<(), SqlSchedulerError> {
        self.inner
            .finish()
            .await
            .map_err(|err| traced(err, format!("{}.finish()", self.context)))
    }
}
