#![allow(dead_code)]

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use sql_scheduler::backup::BackupRequest;
use sql_scheduler::config::ConnectionOptions;
use sql_scheduler::engine::{
    BackupHandle, BackupProgress, Engine, EngineHandle, StatementId, StatementInfo,
};
use sql_scheduler::events::EventSink;
use sql_scheduler::results::{CustomDbRow, ResultSet, RunResult};
use sql_scheduler::sqlite::SqliteEngine;
use sql_scheduler::types::{Limit, Params};
use sql_scheduler::SqlSchedulerError;
use tempfile::TempDir;
use tokio::sync::mpsc;

/// One engine call as seen by the instrumented engine.
#[derive(Debug, Clone)]
pub struct Span {
    pub label: String,
    pub start: Instant,
    pub end: Instant,
}

impl Span {
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Shared log of engine calls plus a switch that makes every later call fail as if the
/// worker thread had died.
#[derive(Debug, Clone, Default)]
pub struct Recorder {
    spans: Arc<Mutex<Vec<Span>>>,
    broken: Arc<AtomicBool>,
}

impl Recorder {
    pub fn spans(&self) -> Vec<Span> {
        let mut spans = self.spans.lock().unwrap().clone();
        spans.sort_by_key(|span| span.start);
        spans
    }

    /// Spans whose label starts with `prefix`, in start order.
    pub fn spans_for(&self, prefix: &str) -> Vec<Span> {
        self.spans()
            .into_iter()
            .filter(|span| span.label.starts_with(prefix))
            .collect()
    }

    pub fn any_overlap(&self) -> bool {
        let spans = self.spans();
        spans
            .iter()
            .enumerate()
            .any(|(i, a)| spans[i + 1..].iter().any(|b| a.overlaps(b)))
    }

    pub fn break_engine(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }

    fn push(&self, span: Span) {
        self.spans.lock().unwrap().push(span);
    }
}

/// Wraps the rusqlite engine, recording start and finish of every call. A non-zero delay is
/// spent inside each call before the real engine runs, which widens any overlap the
/// scheduler allows.
pub struct RecordingEngine {
    inner: Arc<dyn Engine>,
    recorder: Recorder,
    delay: Duration,
}

impl RecordingEngine {
    pub fn new(recorder: Recorder, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(SqliteEngine),
            recorder,
            delay,
        })
    }
}

#[async_trait]
impl Engine for RecordingEngine {
    async fn open(
        &self,
        options: &ConnectionOptions,
        events: EventSink,
    ) -> Result<Arc<dyn EngineHandle>, SqlSchedulerError> {
        let inner = self.inner.open(options, events).await?;
        Ok(Arc::new(RecordingHandle {
            inner,
            recorder: self.recorder.clone(),
            delay: self.delay,
        }))
    }
}

struct RecordingHandle {
    inner: Arc<dyn EngineHandle>,
    recorder: Recorder,
    delay: Duration,
}

impl RecordingHandle {
    async fn timed<T>(
        &self,
        label: String,
        call: impl Future<Output = Result<T, SqlSchedulerError>>,
    ) -> Result<T, SqlSchedulerError> {
        record(&self.recorder, self.delay, label, call).await
    }
}

async fn record<T>(
    recorder: &Recorder,
    delay: Duration,
    label: String,
    call: impl Future<Output = Result<T, SqlSchedulerError>>,
) -> Result<T, SqlSchedulerError> {
    let start = Instant::now();
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    let outcome = if recorder.broken.load(Ordering::SeqCst) {
        Err(SqlSchedulerError::ConnectionError("worker gone".into()))
    } else {
        call.await
    };
    recorder.push(Span {
        label,
        start,
        end: Instant::now(),
    });
    outcome
}

struct RecordingBackup {
    inner: Box<dyn BackupHandle>,
    recorder: Recorder,
    delay: Duration,
}

#[async_trait]
impl BackupHandle for RecordingBackup {
    async fn step(&self, pages: i32) -> Result<BackupProgress, SqlSchedulerError> {
        record(
            &self.recorder,
            self.delay,
            format!("backup step {pages}"),
            self.inner.step(pages),
        )
        .await
    }

    async fn finish(&self) -> Result<(), SqlSchedulerError> {
        record(
            &self.recorder,
            self.delay,
            "backup finish".into(),
            self.inner.finish(),
        )
        .await
    }
}

#[async_trait]
impl EngineHandle for RecordingHandle {
    async fn exec(&self, sql: String) -> Result<(), SqlSchedulerError> {
        let label = format!("exec {sql}");
        self.timed(label, self.inner.exec(sql)).await
    }

    async fn prepare(&self, sql: Arc<String>) -> Result<StatementInfo, SqlSchedulerError> {
        let label = format!("prepare {sql}");
        self.timed(label, self.inner.prepare(sql)).await
    }

    async fn bind(&self, stmt: StatementId, params: Params) -> Result<(), SqlSchedulerError> {
        self.timed(format!("bind {stmt}"), self.inner.bind(stmt, params))
            .await
    }

    async fn get(
        &self,
        stmt: StatementId,
        params: Params,
    ) -> Result<Option<CustomDbRow>, SqlSchedulerError> {
        self.timed(format!("get {stmt}"), self.inner.get(stmt, params))
            .await
    }

    async fn all(&self, stmt: StatementId, params: Params) -> Result<ResultSet, SqlSchedulerError> {
        self.timed(format!("all {stmt}"), self.inner.all(stmt, params))
            .await
    }

    async fn each(
        &self,
        stmt: StatementId,
        params: Params,
        rows: mpsc::UnboundedSender<CustomDbRow>,
    ) -> Result<usize, SqlSchedulerError> {
        self.timed(format!("each {stmt}"), self.inner.each(stmt, params, rows))
            .await
    }

    async fn run(&self, stmt: StatementId, params: Params) -> Result<RunResult, SqlSchedulerError> {
        self.timed(format!("run {stmt}"), self.inner.run(stmt, params))
            .await
    }

    async fn reset(&self, stmt: StatementId) -> Result<(), SqlSchedulerError> {
        self.timed(format!("reset {stmt}"), self.inner.reset(stmt))
            .await
    }

    async fn finalize(&self, stmt: StatementId) -> Result<(), SqlSchedulerError> {
        self.timed(format!("finalize {stmt}"), self.inner.finalize(stmt))
            .await
    }

    async fn set_busy_timeout(&self, timeout: Duration) -> Result<(), SqlSchedulerError> {
        self.timed("configure".into(), self.inner.set_busy_timeout(timeout))
            .await
    }

    async fn set_limit(&self, limit: Limit, value: i32) -> Result<i32, SqlSchedulerError> {
        self.timed("configure".into(), self.inner.set_limit(limit, value))
            .await
    }

    async fn backup(
        &self,
        request: BackupRequest,
    ) -> Result<Box<dyn BackupHandle>, SqlSchedulerError> {
        let inner = self.timed("backup".into(), self.inner.backup(request)).await?;
        Ok(Box::new(RecordingBackup {
            inner,
            recorder: self.recorder.clone(),
            delay: self.delay,
        }))
    }

    fn interrupt(&self) {
        self.inner.interrupt();
    }

    async fn close(&self) -> Result<(), SqlSchedulerError> {
        self.timed("close".into(), self.inner.close()).await
    }
}

/// Scratch directory holding test databases; removed on drop.
pub struct Scratch {
    dir: TempDir,
}

impl Scratch {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn db(&self, name: &str) -> String {
        self.path(name).to_string_lossy().into_owned()
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }
}

/// Count rows of `table` through a plain rusqlite connection.
pub fn count_rows(path: &str, table: &str) -> i64 {
    let conn = rusqlite::Connection::open(path).unwrap();
    conn.query_row(&format!("SELECT count(*) FROM {table}"), [], |row| row.get(0))
        .unwrap()
}
