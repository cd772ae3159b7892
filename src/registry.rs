use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::OnceCell;
use tracing::debug;

use crate::config::ConnectionOptions;
use crate::connection::Connection;
use crate::engine::Engine;
use crate::error::SqlSchedulerError;
use crate::sqlite::SqliteEngine;

struct Entry {
    cell: Arc<OnceCell<Connection>>,
    refs: usize,
}

impl Entry {
    fn is_stale(&self) -> bool {
        self.cell.get().is_some_and(|conn| !conn.is_open())
    }
}

/// Shares one open [`Connection`] per database path.
///
/// Each [`open`](Self::open) takes a reference that [`release`](Self::release) gives back;
/// the connection is closed when the last reference is released. In-memory databases are
/// never shared since every open of `:memory:` is a distinct database.
pub struct ConnectionRegistry {
    engine: Arc<dyn Engine>,
    entries: Mutex<HashMap<String, Entry>>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("paths", &self.lock().keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::with_engine(Arc::new(SqliteEngine))
    }

    #[must_use]
    pub fn with_engine(engine: Arc<dyn Engine>) -> Self {
        Self {
            engine,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Return the shared connection for `options.db_path`, opening it on first use.
    ///
    /// Concurrent callers for the same path wait on a single open. Options of later callers
    /// are ignored while the connection is shared.
    ///
    /// # Errors
    ///
    /// Returns the open error; a failed open leaves no entry behind.
    pub async fn open(&self, options: ConnectionOptions) -> Result<Connection, SqlSchedulerError> {
        if is_memory_path(&options.db_path) {
            return Connection::open_with(Arc::clone(&self.engine), options).await;
        }

        let key = options.db_path.clone();
        let cell = {
            let mut entries = self.lock();
            if entries.get(&key).is_some_and(Entry::is_stale) {
                debug!(db_path = %key, "replacing closed registry entry");
                entries.remove(&key);
            }
            let entry = entries.entry(key.clone()).or_insert_with(|| Entry {
                cell: Arc::new(OnceCell::new()),
                refs: 0,
            });
            entry.refs += 1;
            Arc::clone(&entry.cell)
        };

        let engine = Arc::clone(&self.engine);
        match cell
            .get_or_try_init(|| Connection::open_with(engine, options))
            .await
        {
            Ok(conn) => Ok(conn.clone()),
            Err(err) => {
                let mut entries = self.lock();
                if let Some(entry) = entries.get_mut(&key) {
                    if Arc::ptr_eq(&entry.cell, &cell) {
                        entry.refs = entry.refs.saturating_sub(1);
                        if entry.refs == 0 && entry.cell.get().is_none() {
                            entries.remove(&key);
                        }
                    }
                }
                Err(err)
            }
        }
    }

    /// Give back one reference for `path`; the last one closes the connection.
    ///
    /// # Errors
    ///
    /// Returns the close error. The entry is gone either way; a connection that refused to
    /// close stays open for whoever still holds it.
    pub async fn release(&self, path: &str) -> Result<(), SqlSchedulerError> {
        let conn = {
            let mut entries = self.lock();
            let Some(entry) = entries.get_mut(path) else {
                return Ok(());
            };
            entry.refs = entry.refs.saturating_sub(1);
            if entry.refs > 0 {
                return Ok(());
            }
            entries.remove(path).and_then(|entry| entry.cell.get().cloned())
        };
        match conn {
            Some(conn) if conn.is_open() => {
                debug!(db_path = %path, "last registry reference released");
                conn.close().await
            }
            _ => Ok(()),
        }
    }

    /// Close every shared connection regardless of outstanding references.
    ///
    /// # Errors
    ///
    /// Returns the first close error after attempting all of them.
    pub async fn close_all(&self) -> Result<(), SqlSchedulerError> {
        let conns: Vec<Connection> = self
            .lock()
            .drain()
            .filter_map(|(_, entry)| entry.cell.get().cloned())
            .collect();
        let mut first_err = None;
        for conn in conns.into_iter().filter(Connection::is_open) {
            if let Err(err) = conn.close().await {
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    #[must_use]
    pub fn contains(&self, path: &str) -> bool {
        self.lock().contains_key(path)
    }

    /// Outstanding references for `path`.
    #[must_use]
    pub fn ref_count(&self, path: &str) -> usize {
        self.lock().get(path).map_or(0, |entry| entry.refs)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

fn is_memory_path(path: &str) -> bool {
    path == ":memory:" || path.contains("mode=memory")
}
