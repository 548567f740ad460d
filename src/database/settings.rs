use std::fmt;

use rusqlite::{OptionalExtension, params};
use tracing::{debug, error};

use super::{Database, DatabaseResult};

/// Settings persisted in the `settings` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Setting {
    SchemaVersion,
    LastImport,
}

impl Setting {
    /// Name of the row holding this setting.
    pub fn key(&self) -> &'static str {
        match self {
            Setting::SchemaVersion => "SchemaVersion",
            Setting::LastImport => "LastImport",
        }
    }
}

impl fmt::Display for Setting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// Key/value settings storage with batched statement execution.
pub trait SettingsStore {
    fn get_setting(&self, setting: Setting) -> DatabaseResult<Option<String>>;

    fn set_setting(&self, setting: Setting, value: &str) -> DatabaseResult<()>;

    /// Run all statements in one transaction; nothing is applied if one fails.
    fn batch_execute(&self, statements: &[&str]) -> DatabaseResult<()>;
}

impl SettingsStore for Database {
    fn get_setting(&self, setting: Setting) -> DatabaseResult<Option<String>> {
        let conn = self.connection();
        let value = conn
            .query_row(
                "SELECT value FROM settings WHERE name = ?1",
                params![setting.key()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set_setting(&self, setting: Setting, value: &str) -> DatabaseResult<()> {
        let conn = self.connection();
        conn.execute(
            "INSERT INTO settings (name, value) VALUES (?1, ?2)
             ON CONFLICT(name) DO UPDATE SET value = excluded.value",
            params![setting.key(), value],
        )?;
        debug!("Setting {} = {}", setting, value);
        Ok(())
    }

    fn batch_execute(&self, statements: &[&str]) -> DatabaseResult<()> {
        let mut conn = self.connection();
        let tx = conn.transaction()?;

        for statement in statements {
            if let Err(e) = tx.execute_batch(statement) {
                error!("Batch statement failed, rolling back: {}", e);
                return Err(e.into());
            }
        }

        tx.commit()?;
        Ok(())
    }
}
