//! Schema versioning for the downloader database.
//!
//! The stored `SchemaVersion` setting is compared with the version this build
//! expects. Older databases are migrated one step at a time, newer ones are refused.

use thiserror::Error;
use tracing::{debug, info};

use super::{DatabaseError, Setting, SettingsStore};

/// Schema version this build reads and writes.
pub const SCHEMA_VERSION: u32 = 2;

/// Statements creating the current schema on a fresh database.
pub(crate) const CREATE_SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS fileindex (
        key TEXT PRIMARY KEY,
        size INTEGER NOT NULL,
        blake3 TEXT,
        persisted_at TEXT
    )",
];

const MIGRATE_1_TO_2: &[&str] = &[
    "ALTER TABLE fileindex ADD COLUMN blake3 TEXT",
    "ALTER TABLE fileindex ADD COLUMN persisted_at TEXT",
];

#[derive(Error, Debug)]
pub enum SchemaUpdateError {
    #[error("Local schema version is missing")]
    MissingLocalVersion,

    #[error("Invalid schema version: {0:?}")]
    InvalidVersion(String),

    #[error("Database schema version {remote} is newer than supported version {local}")]
    RemoteNewer { remote: u32, local: u32 },

    #[error("No migration from schema version {0}")]
    MissingMigration(u32),

    #[error("Settings store error: {0}")]
    Store(#[from] DatabaseError),
}

pub type SchemaResult<T> = Result<T, SchemaUpdateError>;

pub struct SchemaUpdater;

impl SchemaUpdater {
    /// Bring the store's schema up to `local_version`.
    ///
    /// Returns `true` if any migration ran, `false` if the versions already matched.
    pub fn update<S: SettingsStore + ?Sized>(
        store: &S,
        local_version: Option<&str>,
    ) -> SchemaResult<bool> {
        let local = parse_version(local_version.ok_or(SchemaUpdateError::MissingLocalVersion)?)?;
        let remote = store.get_setting(Setting::SchemaVersion)?;
        let remote = parse_version(remote.as_deref().unwrap_or_default())?;

        if remote > local {
            return Err(SchemaUpdateError::RemoteNewer { remote, local });
        }

        if remote == local {
            debug!("Database schema is at version {}", local);
            return Ok(false);
        }

        for version in remote..local {
            let statements = migration(version).ok_or(SchemaUpdateError::MissingMigration(version))?;
            info!("Updating database schema from version {} to {}", version, version + 1);

            // The new version is stored in the same transaction as the step itself.
            let version_update = version_statement(version + 1);
            let mut batch = statements.to_vec();
            batch.push(&version_update);
            store.batch_execute(&batch)?;
        }

        Ok(true)
    }
}

fn migration(from: u32) -> Option<&'static [&'static str]> {
    match from {
        1 => Some(MIGRATE_1_TO_2),
        _ => None,
    }
}

fn version_statement(version: u32) -> String {
    format!(
        "UPDATE settings SET value = '{}' WHERE name = '{}'",
        version,
        Setting::SchemaVersion.key()
    )
}

fn parse_version(raw: &str) -> SchemaResult<u32> {
    match raw.trim().parse::<u32>() {
        Ok(version) if version > 0 => Ok(version),
        _ => Err(SchemaUpdateError::InvalidVersion(raw.to_string())),
    }
}
