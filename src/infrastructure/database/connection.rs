use crate::events::EventBus;
use anyhow::{Context, Result, anyhow};
use r2d2::{Pool, PooledConnection};
use rusqlite::Connection;
use std::path::PathBuf;
use std::time::Duration;

/// Minimal r2d2 adapter for rusqlite. Every pooled connection runs in WAL
/// mode with foreign keys on and a busy timeout so concurrent store
/// transactions serialize instead of failing fast.
pub struct SqliteConnectionManager {
    db_path: PathBuf,
}

impl SqliteConnectionManager {
    pub fn file(db_path: PathBuf) -> Self {
        Self { db_path }
    }
}

impl r2d2::ManageConnection for SqliteConnectionManager {
    type Connection = Connection;
    type Error = rusqlite::Error;

    fn connect(&self) -> Result<Connection, rusqlite::Error> {
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |_row| Ok(()))?;
        conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA synchronous = NORMAL;")?;
        Ok(conn)
    }

    fn is_valid(&self, conn: &mut Connection) -> Result<(), rusqlite::Error> {
        conn.query_row("SELECT 1", [], |_row| Ok(()))
    }

    fn has_broken(&self, _conn: &mut Connection) -> bool {
        false
    }
}

/// Handle to the control-plane store. Cheap to clone; all collection access
/// goes through the `*Methods` traits implemented for this type.
#[derive(Clone)]
pub struct Database {
    pool: Pool<SqliteConnectionManager>,
    pub events: EventBus,
    db_path: PathBuf,
}

impl Database {
    pub fn new(db_path: Option<PathBuf>) -> Result<Self> {
        let db_path = match db_path {
            Some(path) => path,
            None => default_db_path()?,
        };

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let manager = SqliteConnectionManager::file(db_path.clone());
        let pool = Pool::builder()
            .max_size(8)
            .build(manager)
            .map_err(|e| anyhow!("Failed to build connection pool: {e}"))?;

        let db = Self {
            pool,
            events: EventBus::new(),
            db_path,
        };
        super::db_schema::initialize_schema(&db)?;
        Ok(db)
    }

    pub fn get_conn(&self) -> Result<PooledConnection<SqliteConnectionManager>> {
        self.pool
            .get()
            .map_err(|e| anyhow!("Failed to get database connection: {e}"))
    }

    pub fn db_path(&self) -> &PathBuf {
        &self.db_path
    }
}

fn default_db_path() -> Result<PathBuf> {
    let base = dirs::data_local_dir()
        .ok_or_else(|| anyhow!("Could not determine local data directory"))?;
    Ok(base.join("leitwerk").join("leitwerk.db"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn opens_and_initializes_schema() {
        let tmp = TempDir::new().unwrap();
        let db = Database::new(Some(tmp.path().join("test.db"))).unwrap();
        let conn = db.get_conn().unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'workspaces'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn clones_share_the_same_file() {
        let tmp = TempDir::new().unwrap();
        let db = Database::new(Some(tmp.path().join("test.db"))).unwrap();
        let clone = db.clone();
        db.get_conn()
            .unwrap()
            .execute(
                "INSERT INTO device_enrollments (device_id, owning_principal, public_key, enrolled_at)
                 VALUES ('d-1', 'alice', 'a2V5', 0)",
                [],
            )
            .unwrap();
        let seen: i64 = clone
            .get_conn()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM device_enrollments", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(seen, 1);
    }
}
