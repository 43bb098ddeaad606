//! Shared SQLite connection.

use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

use crate::config::StoreConfig;
use crate::error::{ErrorCode, VersoError, VersoResult};
use crate::schema::Schema;
use crate::versioning::SqliteVersionedStore;

/// Handle to one SQLite database. Clones share the connection.
///
/// Separate `Database::open` calls on the same file get separate connections
/// and coordinate through SQLite's own locking.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    config: Arc<StoreConfig>,
}

impl Database {
    /// Open (or create) the database described by `config`.
    pub fn open(config: StoreConfig) -> VersoResult<Self> {
        let opened = if config.is_in_memory() {
            Connection::open_in_memory()
        } else {
            if let Some(parent) = config.database_path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            Connection::open(&config.database_path)
        };
        let conn = opened.map_err(|e| VersoError::Database {
            message: format!("Failed to open {}: {}", config.database_path.display(), e),
            code: ErrorCode::DbConnectionFailed,
            source: Some(Box::new(e)),
        })?;

        conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))?;

        if !config.is_in_memory() {
            let mode: String =
                conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
            debug!(journal_mode = %mode, "Configured journal mode");
        }

        let foreign_keys = if config.enforce_foreign_keys { "ON" } else { "OFF" };
        conn.execute_batch(&format!("PRAGMA foreign_keys = {};", foreign_keys))?;

        info!(
            path = %config.database_path.display(),
            archive_strategy = %config.archive_strategy,
            "Opened verso database"
        );

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            config: Arc::new(config),
        })
    }

    /// Open a private in-memory database (for testing).
    pub fn in_memory() -> VersoResult<Self> {
        Self::open(StoreConfig::in_memory())
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Create the table for `schema` if needed and return a store over it.
    pub fn versioned(&self, schema: Schema) -> VersoResult<SqliteVersionedStore> {
        schema.validate()?;
        self.lock()?.execute_batch(&schema.create_table_sql())?;
        debug!(table = %schema.table(), "Ensured versioned table");
        Ok(SqliteVersionedStore::new(
            self.clone(),
            schema,
            self.config.archive_strategy,
        ))
    }

    pub(crate) fn lock(&self) -> VersoResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| VersoError::database(e.to_string()))
    }

    /// Run `work` inside a `BEGIN IMMEDIATE` transaction.
    ///
    /// The write lock is held from the first statement. Any error rolls the
    /// transaction back and backend failures surface as `TransactionFailed`.
    pub(crate) fn immediate<T>(
        &self,
        work: impl FnOnce(&Transaction<'_>) -> VersoResult<T>,
    ) -> VersoResult<T> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| VersoError::from(e).into_transaction_failure())?;

        let out = work(&tx).map_err(VersoError::into_transaction_failure)?;

        tx.commit()
            .map_err(|e| VersoError::from(e).into_transaction_failure())?;
        Ok(out)
    }
}
