use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::connection::Connection;
use crate::engine::Engine;
use crate::error::SqlSchedulerError;
use crate::types::SchedulingPolicy;

/// How the database file is opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpenMode {
    ReadOnly,
    ReadWrite,
    /// Read-write, creating the file when missing.
    #[default]
    ReadWriteCreate,
}

/// Options for opening a [`Connection`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionOptions {
    pub db_path: String,
    pub mode: OpenMode,
    pub policy: SchedulingPolicy,
    #[serde(with = "millis")]
    pub busy_timeout: Duration,
    /// Publish `Event::Trace` for every statement execution.
    pub trace: bool,
    /// Publish `Event::Profile` for every statement execution.
    pub profile: bool,
    /// Annotate engine errors with the call that produced them.
    pub verbose: bool,
    pub event_capacity: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            db_path: ":memory:".into(),
            mode: OpenMode::default(),
            policy: SchedulingPolicy::default(),
            busy_timeout: Duration::from_millis(1000),
            trace: false,
            profile: false,
            verbose: false,
            event_capacity: 256,
        }
    }
}

impl ConnectionOptions {
    #[must_use]
    pub fn new(db_path: impl Into<String>) -> Self {
        Self {
            db_path: db_path.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_policy(mut self, policy: SchedulingPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), SqlSchedulerError> {
        if self.db_path.is_empty() {
            return Err(SqlSchedulerError::ConfigError(
                "db_path must not be empty".into(),
            ));
        }
        Ok(())
    }
}

/// Fluent builder for [`ConnectionOptions`].
#[derive(Debug, Clone)]
pub struct ConnectionOptionsBuilder {
    opts: ConnectionOptions,
}

impl ConnectionOptionsBuilder {
    #[must_use]
    pub fn new(db_path: impl Into<String>) -> Self {
        Self {
            opts: ConnectionOptions::new(db_path),
        }
    }

    #[must_use]
    pub fn mode(mut self, mode: OpenMode) -> Self {
        self.opts.mode = mode;
        self
    }

    #[must_use]
    pub fn read_only(self, read_only: bool) -> Self {
        if read_only {
            self.mode(OpenMode::ReadOnly)
        } else {
            self.mode(OpenMode::ReadWriteCreate)
        }
    }

    #[must_use]
    pub fn policy(mut self, policy: SchedulingPolicy) -> Self {
        self.opts.policy = policy;
        self
    }

    #[must_use]
    pub fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.opts.busy_timeout = timeout;
        self
    }

    #[must_use]
    pub fn trace(mut self, enabled: bool) -> Self {
        self.opts.trace = enabled;
        self
    }

    #[must_use]
    pub fn profile(mut self, enabled: bool) -> Self {
        self.opts.profile = enabled;
        self
    }

    #[must_use]
    pub fn verbose(mut self, enabled: bool) -> Self {
        self.opts.verbose = enabled;
        self
    }

    #[must_use]
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.opts.event_capacity = capacity;
        self
    }

    #[must_use]
    pub fn finish(self) -> ConnectionOptions {
        self.opts
    }

    /// Open a connection with the default rusqlite engine.
    ///
    /// # Errors
    ///
    /// Returns `SqlSchedulerError` if the options are invalid or the engine cannot open the file.
    pub async fn build(self) -> Result<Connection, SqlSchedulerError> {
        Connection::open(self.finish()).await
    }

    /// Open a connection with a caller-supplied engine.
    ///
    /// # Errors
    ///
    /// Returns `SqlSchedulerError` if the options are invalid or the engine cannot open the file.
    pub async fn build_with(self, engine: Arc<dyn Engine>) -> Result<Connection, SqlSchedulerError> {
        Connection::open_with(engine, self.finish()).await
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub(super) fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}
