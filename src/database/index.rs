//! Persistent index of files the writer has already saved.
//!
//! Keys are kept in memory for fast lookups and mirrored to the `fileindex`
//! table, so duplicates are still recognised after a restart. Duplicates are
//! matched by key only. The BLAKE3 digest stored next to each key is metadata
//! for `aid index` and is never used to match content.

use chrono::Utc;
use dashmap::DashSet;
use rusqlite::{OptionalExtension, params};
use tracing::{debug, info, warn};

use super::{Database, DatabaseResult};
use crate::io::DuplicateFilter;

/// One row of the file index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRecord {
    pub key: String,
    pub size: u64,
    pub blake3: Option<String>,
    pub persisted_at: Option<String>,
}

/// Duplicate filter backed by the `fileindex` table, keyed by destination path.
pub struct FileIndex {
    db: Database,
    cache: DashSet<String>,
}

impl FileIndex {
    /// Load every indexed key into memory.
    pub fn load(db: Database) -> DatabaseResult<Self> {
        let cache = DashSet::new();

        {
            let conn = db.connection();
            let mut stmt = conn.prepare("SELECT key FROM fileindex")?;
            let keys = stmt.query_map([], |row| row.get::<_, String>(0))?;
            for key in keys {
                cache.insert(key?);
            }
        }

        info!("Loaded {} entries from the file index", cache.len());
        Ok(Self { db, cache })
    }

    /// Whether `key` is indexed, checking memory first and the table second.
    pub fn contains(&self, key: &str) -> DatabaseResult<bool> {
        if self.cache.contains(key) {
            return Ok(true);
        }

        let found = self
            .db
            .connection()
            .query_row(
                "SELECT 1 FROM fileindex WHERE key = ?1 LIMIT 1",
                params![key],
                |_| Ok(()),
            )
            .optional()?
            .is_some();

        if found {
            self.cache.insert(key.to_string());
        }
        Ok(found)
    }

    /// Record that `data` was persisted under `key`, with its size and digest.
    pub fn record(&self, key: &str, data: &[u8]) -> DatabaseResult<()> {
        let hash = hex::encode(blake3::hash(data).as_bytes());

        self.db.connection().execute(
            "INSERT OR REPLACE INTO fileindex (key, size, blake3, persisted_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![key, data.len() as i64, hash, Utc::now().to_rfc3339()],
        )?;

        self.cache.insert(key.to_string());
        debug!("Indexed {} ({})", key, hash);
        Ok(())
    }

    pub fn lookup(&self, key: &str) -> DatabaseResult<Option<IndexRecord>> {
        let record = self
            .db
            .connection()
            .query_row(
                "SELECT key, size, blake3, persisted_at FROM fileindex WHERE key = ?1",
                params![key],
                |row| {
                    Ok(IndexRecord {
                        key: row.get(0)?,
                        size: row.get::<_, i64>(1)? as u64,
                        blake3: row.get(2)?,
                        persisted_at: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    /// Number of indexed files.
    pub fn len(&self) -> DatabaseResult<u64> {
        let count: i64 = self
            .db
            .connection()
            .query_row("SELECT COUNT(*) FROM fileindex", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn is_empty(&self) -> DatabaseResult<bool> {
        Ok(self.len()? == 0)
    }
}

impl DuplicateFilter for FileIndex {
    fn exists(&self, key: &str) -> bool {
        // A failed lookup only risks writing a file twice.
        self.contains(key).unwrap_or_else(|e| {
            warn!("Index lookup for {} failed, treating as new: {}", key, e);
            false
        })
    }

    fn mark_persisted(&self, key: &str, data: &[u8]) {
        if let Err(e) = self.record(key, data) {
            warn!("Failed to index {}: {}", key, e);
        }
    }
}
