use std::path::Path;
use std::time::Duration;

use log::{error, info, warn};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OptionalExtension};

use crate::error::DashReportError;
use crate::schema::{
    is_duplicate_column, CREATE_META_SQL, CREATE_SCHEMA_SQL, CURRENT_SCHEMA_VERSION, MIGRATIONS,
};

const POOL_MAX_SIZE: u32 = 8;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub type DbConnection = PooledConnection<SqliteConnectionManager>;

/// Pooled SQLite access. Readers take any pooled connection; writes are
/// funneled through the write queue, which uses the same pool.
pub struct Database {
    pool: Pool<SqliteConnectionManager>,
}

impl Database {
    pub fn open(db_path: &Path) -> Result<Self, DashReportError> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
            conn.busy_timeout(BUSY_TIMEOUT)?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "foreign_keys", "ON")
        });
        let pool = Pool::builder().max_size(POOL_MAX_SIZE).build(manager)?;

        let db = Database { pool };
        let conn = db.get_connection()?;
        Self::migrate(&conn)?;

        info!("Database opened at: {}", db_path.display());
        Ok(db)
    }

    pub fn get_connection(&self) -> Result<DbConnection, DashReportError> {
        Ok(self.pool.get()?)
    }

    /// Runs `f` inside BEGIN IMMEDIATE / COMMIT, rolling back on error.
    pub fn immediate_transaction<F, T>(conn: &Connection, f: F) -> Result<T, DashReportError>
    where
        F: FnOnce(&Connection) -> Result<T, DashReportError>,
    {
        conn.execute_batch("BEGIN IMMEDIATE")?;
        match f(conn) {
            Ok(value) => {
                conn.execute_batch("COMMIT")?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = conn.execute_batch("ROLLBACK") {
                    error!("Rollback failed: {}", rollback_err);
                }
                Err(e)
            }
        }
    }

    pub fn get_meta_value_locked(
        conn: &Connection,
        key: &str,
    ) -> Result<Option<String>, DashReportError> {
        conn.query_row("SELECT value FROM meta WHERE key = ?", [key], |row| {
            row.get(0)
        })
        .optional()
        .map_err(DashReportError::DatabaseError)
    }

    pub fn set_meta_value_locked(
        conn: &Connection,
        key: &str,
        value: &str,
    ) -> Result<(), DashReportError> {
        conn.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES (?, ?)",
            [key, value],
        )?;
        Ok(())
    }

    pub fn get_schema_version(conn: &Connection) -> Result<Option<u32>, DashReportError> {
        Ok(Self::get_meta_value_locked(conn, "schema_version")?
            .and_then(|v| v.parse::<u32>().ok()))
    }

    fn table_exists(conn: &Connection, table: &str) -> Result<bool, DashReportError> {
        let count: i64 = conn.query_row(
            "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
            [table],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn migrate(conn: &Connection) -> Result<(), DashReportError> {
        conn.execute_batch(CREATE_META_SQL)?;

        let version = match Self::get_schema_version(conn)? {
            Some(version) => version,
            // Databases created before the meta table existed are version 1
            None if Self::table_exists(conn, "schedules")? => 1,
            None => {
                Self::immediate_transaction(conn, |c| {
                    c.execute_batch(CREATE_SCHEMA_SQL)?;
                    Self::set_meta_value_locked(
                        c,
                        "schema_version",
                        &CURRENT_SCHEMA_VERSION.to_string(),
                    )
                })?;
                info!("Created schema version {}", CURRENT_SCHEMA_VERSION);
                return Ok(());
            }
        };

        if version > CURRENT_SCHEMA_VERSION {
            return Err(DashReportError::Error(format!(
                "Database schema version {} is newer than this build supports ({})",
                version, CURRENT_SCHEMA_VERSION
            )));
        }

        for migration in MIGRATIONS.iter().filter(|m| m.from_version >= version) {
            Self::immediate_transaction(conn, |c| {
                for statement in migration.statements {
                    match c.execute(statement, []) {
                        Ok(_) => {}
                        Err(e) if is_duplicate_column(&e) => {
                            warn!("Skipping migration statement, column exists: {}", statement);
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                if let Some(code_fn) = migration.code_fn {
                    code_fn(c)?;
                }
                Self::set_meta_value_locked(
                    c,
                    "schema_version",
                    &(migration.from_version + 1).to_string(),
                )
            })?;
            info!(
                "Upgraded schema from version {} to {}",
                migration.from_version,
                migration.from_version + 1
            );
        }

        Ok(())
    }
}
