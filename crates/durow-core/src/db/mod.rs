//! SQLite database layer for the Durow engine.
//!
//! Uses rusqlite with WAL mode for concurrent read performance.
//! All database operations are executed via `tokio::task::spawn_blocking`
//! to avoid blocking the async runtime.

use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::error::EngineError;

/// Thread-safe handle to the SQLite database.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) a SQLite database at the given path.
    pub fn open(db_path: &str) -> Result<Self, EngineError> {
        let path = Path::new(db_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let conn = Connection::open(db_path)
            .map_err(|e| EngineError::Database(format!("Failed to open database: {}", e)))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(|e| EngineError::Database(format!("Failed to set pragmas: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.initialize_tables()?;

        tracing::info!("SQLite database opened at: {}", db_path);
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self, EngineError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| EngineError::Database(format!("Failed to open in-memory db: {}", e)))?;

        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(|e| EngineError::Database(format!("Failed to set pragmas: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.initialize_tables()?;
        Ok(db)
    }

    /// Execute a closure with access to the database connection.
    /// Automatically handles locking and error conversion.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, EngineError>
    where
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| EngineError::Database(format!("Lock poisoned: {}", e)))?;
        f(&conn).map_err(|e| EngineError::Database(e.to_string()))
    }

    /// Execute a closure with access to the database connection (async-friendly).
    pub async fn with_conn_async<F, T>(&self, f: F) -> Result<T, EngineError>
    where
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || db.with_conn(f))
            .await
            .map_err(|e| EngineError::Database(format!("Task join error: {}", e)))?
    }

    /// Create all tables if they don't exist.
    fn initialize_tables(&self) -> Result<(), EngineError> {
        self.with_conn(|conn| {
            conn.execute_batch(
                "
                CREATE TABLE IF NOT EXISTS workflow_runs (
                    id              TEXT PRIMARY KEY,
                    workflow_name   TEXT NOT NULL,
                    tenant_id       TEXT NOT NULL DEFAULT 'default',
                    dedupe_key      TEXT,
                    definition      TEXT NOT NULL,
                    status          TEXT NOT NULL DEFAULT 'PENDING',
                    current_step    INTEGER NOT NULL DEFAULT 0,
                    steps           TEXT NOT NULL DEFAULT '[]',
                    input           TEXT NOT NULL DEFAULT 'null',
                    result          TEXT,
                    last_error      TEXT,
                    parent_run_id   TEXT,
                    version         INTEGER NOT NULL DEFAULT 1,
                    lease_owner     TEXT,
                    lease_until     INTEGER,
                    created_at      INTEGER NOT NULL,
                    updated_at      INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_runs_status ON workflow_runs(status);
                CREATE INDEX IF NOT EXISTS idx_runs_parent ON workflow_runs(parent_run_id);

                -- At most one non-terminal run per (workflow, dedupe key).
                -- Rows leave the index as soon as the run reaches a terminal
                -- status, freeing the key for the next start request.
                CREATE UNIQUE INDEX IF NOT EXISTS idx_runs_active_dedupe
                    ON workflow_runs(workflow_name, dedupe_key)
                    WHERE dedupe_key IS NOT NULL
                      AND status IN ('PENDING', 'RUNNING');

                CREATE TABLE IF NOT EXISTS schedules (
                    id              TEXT NOT NULL,
                    tenant_id       TEXT NOT NULL DEFAULT 'default',
                    workflow_name   TEXT NOT NULL,
                    cron_expr       TEXT NOT NULL,
                    task_queue      TEXT NOT NULL DEFAULT 'default',
                    enabled         INTEGER NOT NULL DEFAULT 1,
                    last_fired_at   INTEGER,
                    last_run_id     TEXT,
                    created_at      INTEGER NOT NULL,
                    updated_at      INTEGER NOT NULL,
                    PRIMARY KEY (tenant_id, id)
                );
                CREATE INDEX IF NOT EXISTS idx_schedules_enabled ON schedules(enabled);

                CREATE TABLE IF NOT EXISTS audit_records (
                    run_id          TEXT NOT NULL,
                    step_id         TEXT NOT NULL,
                    attempt         INTEGER NOT NULL,
                    outcome         TEXT NOT NULL,
                    detail          TEXT NOT NULL DEFAULT '{}',
                    recorded_at     INTEGER NOT NULL,
                    PRIMARY KEY (run_id, step_id, attempt)
                );
                ",
            )
        })
    }
}
