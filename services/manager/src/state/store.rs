//! SQLite-based instance store.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use dm_model::Instance;
use rusqlite::{params, Connection};
use thiserror::Error;
use tracing::{debug, warn};

use crate::application::ApplicationRecord;

/// Errors from store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Root instances read back from the store.
#[derive(Debug, Default)]
pub struct RestoredInstances {
    pub roots: Vec<Instance>,
    /// Root instance name and reason, for rows that could not be decoded.
    pub load_errors: Vec<(String, String)>,
}

/// Persistence of applications and their instance trees.
pub trait InstanceStore: Send + Sync {
    fn save_application(&self, record: &ApplicationRecord) -> Result<(), StoreError>;

    /// Remove an application and its instances.
    fn delete_application(&self, name: &str) -> Result<(), StoreError>;

    fn applications(&self) -> Result<Vec<ApplicationRecord>, StoreError>;

    /// Replace the stored instance forest of an application.
    fn save_instances(&self, application: &str, roots: &[Instance]) -> Result<(), StoreError>;

    fn restore_instances(&self, application: &str) -> Result<RestoredInstances, StoreError>;
}

/// SQLite instance store.
pub struct SqliteInstanceStore {
    conn: Mutex<Connection>,
}

impl SqliteInstanceStore {
    /// Open or create a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;

        Ok(store)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        self.conn().execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS applications (
                name TEXT PRIMARY KEY,
                record TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS instances (
                application TEXT NOT NULL,
                name TEXT NOT NULL,
                position INTEGER NOT NULL,
                body TEXT NOT NULL,
                PRIMARY KEY (application, name)
            );

            CREATE INDEX IF NOT EXISTS idx_instances_application ON instances(application);
            "#,
        )?;

        debug!("Instance store schema initialized");
        Ok(())
    }

    /// Store raw rows, bypassing encoding (for testing load errors).
    #[cfg(test)]
    fn insert_raw_instance(&self, application: &str, name: &str, body: &str) {
        self.conn()
            .execute(
                "INSERT INTO instances (application, name, position, body) VALUES (?1, ?2, 999, ?3)",
                params![application, name, body],
            )
            .unwrap();
    }
}

impl InstanceStore for SqliteInstanceStore {
    fn save_application(&self, record: &ApplicationRecord) -> Result<(), StoreError> {
        let body = serde_json::to_string(record)?;
        let now = chrono::Utc::now().timestamp();
        self.conn().execute(
            r#"
            INSERT INTO applications (name, record, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(name) DO UPDATE SET
                record = excluded.record,
                updated_at = excluded.updated_at
            "#,
            params![record.name, body, now],
        )?;
        Ok(())
    }

    fn delete_application(&self, name: &str) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM instances WHERE application = ?1", params![name])?;
        tx.execute("DELETE FROM applications WHERE name = ?1", params![name])?;
        tx.commit()?;
        Ok(())
    }

    fn applications(&self) -> Result<Vec<ApplicationRecord>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT name, record FROM applications ORDER BY name")?;

        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut records = Vec::with_capacity(rows.len());
        for (name, body) in rows {
            match serde_json::from_str(&body) {
                Ok(record) => records.push(record),
                Err(e) => warn!(application = %name, error = %e, "Skipping unreadable application"),
            }
        }
        Ok(records)
    }

    fn save_instances(&self, application: &str, roots: &[Instance]) -> Result<(), StoreError> {
        let bodies = roots
            .iter()
            .map(|root| serde_json::to_string(root).map(|body| (root.name.as_str(), body)))
            .collect::<Result<Vec<_>, _>>()?;

        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM instances WHERE application = ?1",
            params![application],
        )?;
        for (position, (name, body)) in bodies.iter().enumerate() {
            tx.execute(
                "INSERT INTO instances (application, name, position, body) VALUES (?1, ?2, ?3, ?4)",
                params![application, name, position as i64, body],
            )?;
        }
        tx.commit()?;

        debug!(application = %application, roots = roots.len(), "Instances saved");
        Ok(())
    }

    fn restore_instances(&self, application: &str) -> Result<RestoredInstances, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT name, body FROM instances WHERE application = ?1 ORDER BY position",
        )?;

        let rows = stmt
            .query_map(params![application], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut restored = RestoredInstances::default();
        for (name, body) in rows {
            match serde_json::from_str::<Instance>(&body) {
                Ok(root) => restored.roots.push(root),
                Err(e) => restored.load_errors.push((name, e.to_string())),
            }
        }
        Ok(restored)
    }
}
