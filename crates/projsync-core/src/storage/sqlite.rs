use rusqlite::{Connection, Result};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

const SCHEMA_VERSION: i64 = 2;

/// Database handle shared between components that persist state.
pub type SharedDatabase = Arc<Mutex<Database>>;

pub struct Database {
    conn: Connection,
}

pub fn lock_shared(db: &SharedDatabase) -> std::result::Result<MutexGuard<'_, Database>, crate::Error> {
    db.lock()
        .map_err(|e| crate::Error::Other(format!("Failed to lock database: {}", e)))
}

impl Database {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let db = Database { conn };
        db.configure_pragmas()?;
        db.migrate_schema()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Database { conn };
        db.configure_pragmas()?;
        db.migrate_schema()?;
        Ok(db)
    }

    pub fn into_shared(self) -> SharedDatabase {
        Arc::new(Mutex::new(self))
    }

    /// WAL lets index readers and the run-history writer proceed concurrently.
    fn configure_pragmas(&self) -> Result<()> {
        self.conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA cache_size = -16000;
             PRAGMA busy_timeout = 5000;",
        )?;
        debug!("SQLite pragmas configured (WAL mode, 16MB cache)");
        Ok(())
    }

    /// Check schema version and migrate if needed.
    /// Every table holds state that a full pass can rebuild, so an unknown
    /// older layout is dropped rather than converted.
    fn migrate_schema(&self) -> Result<()> {
        let version: i64 = self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?;

        if version < SCHEMA_VERSION {
            debug!(
                "Schema version {} < {}, dropping tables and recreating",
                version, SCHEMA_VERSION
            );
            self.conn.execute_batch(
                "DROP TABLE IF EXISTS backup_run;
                 DROP TABLE IF EXISTS index_fts;
                 DROP TABLE IF EXISTS index_entry;
                 DROP TABLE IF EXISTS file_record;",
            )?;
        }

        self.conn.execute_batch(include_str!("schema.sql"))?;
        self.conn
            .pragma_update(None, "user_version", SCHEMA_VERSION)?;
        debug!("SQLite schema initialized (version {})", SCHEMA_VERSION);
        Ok(())
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}
