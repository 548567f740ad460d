//! Database Module for the Aid downloader
//!
//! This module provides the SQLite layer behind the downloader:
//! 1. A key/value settings store
//! 2. Schema creation and version migration
//! 3. The persistent index of files already written to disk

mod index;
mod schema;
mod settings;

pub use index::{FileIndex, IndexRecord};
pub use schema::{SCHEMA_VERSION, SchemaResult, SchemaUpdateError, SchemaUpdater};
pub use settings::{Setting, SettingsStore};

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use rusqlite::{Connection, params};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Database errors
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Schema update failed: {0}")]
    Schema(Box<SchemaUpdateError>),
}

impl From<SchemaUpdateError> for DatabaseError {
    fn from(error: SchemaUpdateError) -> Self {
        DatabaseError::Schema(Box::new(error))
    }
}

pub type DatabaseResult<T> = Result<T, DatabaseError>;

/// Shared handle to the SQLite database.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl Database {
    /// Open (or create) the database file and bring its schema up to date.
    pub fn open(path: impl AsRef<Path>) -> DatabaseResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        debug!("Opening database at {}", path.display());
        let connection = Connection::open(path)?;
        Self::from_connection(connection, Some(path.to_path_buf()))
    }

    /// In-memory database, mostly useful for tests.
    pub fn open_in_memory() -> DatabaseResult<Self> {
        Self::from_connection(Connection::open_in_memory()?, None)
    }

    fn from_connection(connection: Connection, path: Option<PathBuf>) -> DatabaseResult<Self> {
        connection.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             CREATE TABLE IF NOT EXISTS settings (
                 name TEXT PRIMARY KEY,
                 value TEXT NOT NULL
             );",
        )?;

        let database = Self {
            conn: Arc::new(Mutex::new(connection)),
            path,
        };
        database.ensure_schema()?;

        Ok(database)
    }

    /// Create the tables on a fresh database, migrate an existing one.
    fn ensure_schema(&self) -> DatabaseResult<()> {
        if self.get_setting(Setting::SchemaVersion)?.is_none() {
            self.batch_execute(schema::CREATE_SCHEMA)?;
            self.set_setting(Setting::SchemaVersion, &SCHEMA_VERSION.to_string())?;
            info!("Created database schema version {}", SCHEMA_VERSION);
            return Ok(());
        }

        self.repair_stale_version()?;

        if SchemaUpdater::update(self, Some(&SCHEMA_VERSION.to_string()))? {
            info!("Database schema updated to version {}", SCHEMA_VERSION);
        }

        Ok(())
    }

    /// Older builds stored the version after the migration commit. A crash in
    /// between left version 2 tables labelled as version 1.
    fn repair_stale_version(&self) -> DatabaseResult<()> {
        if self.get_setting(Setting::SchemaVersion)?.as_deref().map(str::trim) != Some("1") {
            return Ok(());
        }

        if self.has_column("fileindex", "blake3")? && self.has_column("fileindex", "persisted_at")? {
            warn!("Database tables are already at schema version 2, correcting the stored version");
            self.set_setting(Setting::SchemaVersion, "2")?;
        }

        Ok(())
    }

    fn has_column(&self, table: &str, column: &str) -> DatabaseResult<bool> {
        let conn = self.connection();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM pragma_table_info(?1) WHERE name = ?2",
            params![table, column],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Location of the database file, `None` for in-memory databases.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub(crate) fn connection(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_fresh_database_has_current_version() {
        let db = Database::open_in_memory().unwrap();
        let version = db.get_setting(Setting::SchemaVersion).unwrap();
        assert_eq!(version, Some(SCHEMA_VERSION.to_string()));
        assert!(db.path().is_none());
    }

    #[test]
    fn test_open_creates_parent_directories() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("data").join("aid.sqlite");

        let db = Database::open(&db_path).unwrap();
        assert!(db_path.exists());
        assert_eq!(db.path(), Some(db_path.as_path()));
    }

    #[test]
    fn test_reopen_keeps_settings() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("aid.sqlite");

        {
            let db = Database::open(&db_path).unwrap();
            db.set_setting(Setting::LastImport, "2024-01-01T00:00:00+00:00").unwrap();
        }

        let db = Database::open(&db_path).unwrap();
        assert_eq!(
            db.get_setting(Setting::LastImport).unwrap().as_deref(),
            Some("2024-01-01T00:00:00+00:00")
        );
        assert_eq!(db.get_setting(Setting::SchemaVersion).unwrap(), Some(SCHEMA_VERSION.to_string()));
    }

    #[test]
    fn test_version_one_database_is_migrated() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("old.sqlite");

        {
            let conn = Connection::open(&db_path).unwrap();
            conn.execute_batch(
                "CREATE TABLE settings (name TEXT PRIMARY KEY, value TEXT NOT NULL);
                 CREATE TABLE fileindex (key TEXT PRIMARY KEY, size INTEGER NOT NULL);
                 INSERT INTO settings (name, value) VALUES ('SchemaVersion', '1');
                 INSERT INTO fileindex (key, size) VALUES ('a/old.jpg', 42);",
            )
            .unwrap();
        }

        let db = Database::open(&db_path).unwrap();
        assert_eq!(db.get_setting(Setting::SchemaVersion).unwrap(), Some("2".to_string()));

        let index = FileIndex::load(db).unwrap();
        let record = index.lookup("a/old.jpg").unwrap().unwrap();
        assert_eq!(record.size, 42);
        assert_eq!(record.blake3, None);
        assert_eq!(record.persisted_at, None);
    }

    #[test]
    fn test_interrupted_migration_is_repaired() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("interrupted.sqlite");

        // Columns added but the version row never bumped.
        {
            let conn = Connection::open(&db_path).unwrap();
            conn.execute_batch(
                "CREATE TABLE settings (name TEXT PRIMARY KEY, value TEXT NOT NULL);
                 CREATE TABLE fileindex (key TEXT PRIMARY KEY, size INTEGER NOT NULL);
                 ALTER TABLE fileindex ADD COLUMN blake3 TEXT;
                 ALTER TABLE fileindex ADD COLUMN persisted_at TEXT;
                 INSERT INTO settings (name, value) VALUES ('SchemaVersion', '1');
                 INSERT INTO fileindex (key, size, blake3) VALUES ('a/kept.jpg', 7, 'abc');",
            )
            .unwrap();
        }

        let db = Database::open(&db_path).unwrap();
        assert_eq!(db.get_setting(Setting::SchemaVersion).unwrap(), Some("2".to_string()));

        let index = FileIndex::load(db.clone()).unwrap();
        let record = index.lookup("a/kept.jpg").unwrap().unwrap();
        assert_eq!(record.size, 7);
        assert_eq!(record.blake3.as_deref(), Some("abc"));
        drop(index);
        drop(db);

        // A second open sees a consistent database.
        let db = Database::open(&db_path).unwrap();
        assert_eq!(db.get_setting(Setting::SchemaVersion).unwrap(), Some("2".to_string()));
    }

    #[test]
    fn test_migration_writes_version_with_tables() {
        let db = Database::open_in_memory().unwrap();
        db.batch_execute(&["DROP TABLE fileindex", "CREATE TABLE fileindex (key TEXT PRIMARY KEY, size INTEGER NOT NULL)"])
            .unwrap();
        db.set_setting(Setting::SchemaVersion, "1").unwrap();

        // A step whose last statement fails leaves both the tables and the version untouched.
        let result = db.batch_execute(&[
            "ALTER TABLE fileindex ADD COLUMN blake3 TEXT",
            "UPDATE settings SET value = '2' WHERE name = 'SchemaVersion'",
            "INSERT INTO no_such_table VALUES (1)",
        ]);
        assert!(result.is_err());
        assert_eq!(db.get_setting(Setting::SchemaVersion).unwrap(), Some("1".to_string()));
        assert!(!db.has_column("fileindex", "blake3").unwrap());

        db.ensure_schema().unwrap();
        assert_eq!(db.get_setting(Setting::SchemaVersion).unwrap(), Some("2".to_string()));
        assert!(db.has_column("fileindex", "blake3").unwrap());
        assert!(db.has_column("fileindex", "persisted_at").unwrap());
    }

    #[test]
    fn test_newer_database_is_refused() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("future.sqlite");

        {
            let conn = Connection::open(&db_path).unwrap();
            conn.execute_batch(
                "CREATE TABLE settings (name TEXT PRIMARY KEY, value TEXT NOT NULL);
                 INSERT INTO settings (name, value) VALUES ('SchemaVersion', '99');",
            )
            .unwrap();
        }

        let result = Database::open(&db_path);
        assert!(matches!(result, Err(DatabaseError::Schema(_))));
    }
}
