//! libSQL storage layer for tasks and their step chains.
//!
//! The [`Storage`] struct wraps an embedded libSQL database and implements
//! [`TaskStore`] and [`StepStore`], the persistence interfaces the scheduler
//! and state machine are written against.
//!
//! **Access rules:**
//! - Scheduler / submit commands: read-write via [`Storage::open`]
//! - Inspection commands (`list`, `show`): read-only via [`Storage::open_readonly`]

mod migrations;
mod steps;
mod store;
mod tasks;

use std::path::Path;

use chrono::{DateTime, Utc};
use libsql::{Connection, Database, params};
use wise_shared::{Result, WiseError};

pub use store::{PipelineStore, StepStore, TaskStore};

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| WiseError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;

        let conn = db.connect().map_err(storage_err)?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open a database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;

        let conn = db.connect().map_err(storage_err)?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        WiseError::Storage(format!("migration v{} failed: {e}", migration.version))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(WiseError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }
}

/// Map any libSQL error into [`WiseError::Storage`].
pub(crate) fn storage_err(e: libsql::Error) -> WiseError {
    WiseError::Storage(e.to_string())
}

/// Current time in the persisted RFC 3339 form.
pub(crate) fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

/// Parse a persisted RFC 3339 timestamp.
pub(crate) fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| WiseError::Storage(format!("invalid date '{s}': {e}")))
}
