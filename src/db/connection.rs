//! Database connection management
//!
//! A single rusqlite connection behind a tokio Mutex. Every caller goes
//! through the same lock, so the store has exactly one writer.

use std::path::Path;
use std::sync::Arc;

use rusqlite::Connection;
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};
use tracing::info;

use super::schema;
use crate::error::{StoreError, StoreResult};

pub struct Database {
    conn: Arc<Mutex<Option<Connection>>>,
    path: String,
}

impl Database {
    /// Open (or create) the database at `path` and bring the schema up to date
    pub fn new<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::invalid(format!("Cannot create {}: {}", parent.display(), e))
            })?;
        }

        let conn = Connection::open(path)?;
        Self::prepare(&conn)?;

        info!("Database initialized at {:?}", path);

        Ok(Self {
            conn: Arc::new(Mutex::new(Some(conn))),
            path: path.to_string_lossy().to_string(),
        })
    }

    /// In-memory database, mostly for tests
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::prepare(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(Some(conn))),
            path: ":memory:".to_string(),
        })
    }

    fn prepare(conn: &Connection) -> StoreResult<()> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        schema::migrate(conn)?;
        Ok(())
    }

    /// Lock the connection. Fails with `NotInitialized` after `close`.
    ///
    /// The guard holds the store's only connection; keep it for one
    /// operation and drop it.
    pub async fn conn(&self) -> StoreResult<MappedMutexGuard<'_, Connection>> {
        let guard = self.conn.lock().await;
        MutexGuard::try_map(guard, |slot| slot.as_mut()).map_err(|_| StoreError::NotInitialized)
    }

    /// Drop the connection. Clones share it, so they are closed too.
    pub async fn close(&self) {
        let mut guard = self.conn.lock().await;
        if guard.take().is_some() {
            info!("Database closed: {}", self.path);
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Current schema version (PRAGMA user_version)
    pub async fn schema_version(&self) -> StoreResult<i64> {
        let conn = self.conn().await?;
        Ok(schema::user_version(&conn)?)
    }

    pub async fn health_check(&self) -> StoreResult<bool> {
        let conn = self.conn().await?;
        match conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)) {
            Ok(_) => Ok(true),
            Err(e) => {
                tracing::warn!("Database health check failed: {}", e);
                Ok(false)
            }
        }
    }
}

impl Clone for Database {
    fn clone(&self) -> Self {
        Self {
            conn: Arc::clone(&self.conn),
            path: self.path.clone(),
        }
    }
}
