use crate::error::DashReportError;
use rusqlite::Connection;

pub const CURRENT_SCHEMA_VERSION: u32 = 3;

/// Function type for migration code that transforms data during schema upgrades.
pub type MigrationFn = fn(&Connection) -> Result<(), DashReportError>;

pub const CREATE_META_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

pub const CREATE_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS schedules (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    org_id INTEGER NOT NULL,
    name TEXT NOT NULL,
    dashboard_uid TEXT NOT NULL,
    dashboard_title TEXT NOT NULL DEFAULT '',
    panel_ids TEXT DEFAULT NULL,         -- JSON array of panel ids, NULL for the whole dashboard
    range_from TEXT NOT NULL,            -- Unresolved, e.g. 'now-7d'
    range_to TEXT NOT NULL,
    interval_type TEXT NOT NULL,         -- daily | weekly | monthly | cron
    cron_expr TEXT NOT NULL DEFAULT '',
    timezone TEXT NOT NULL DEFAULT 'UTC',
    variables TEXT NOT NULL DEFAULT '[]',
    recipients TEXT NOT NULL DEFAULT '{}',
    email_subject TEXT NOT NULL DEFAULT '',
    email_body TEXT NOT NULL DEFAULT '',
    enabled BOOLEAN NOT NULL DEFAULT 1,
    last_run_at TEXT DEFAULT NULL,
    next_run_at TEXT DEFAULT NULL,       -- UTC, whole seconds; NULL when disabled
    owner_user_id INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_schedules_org ON schedules (org_id);
CREATE INDEX IF NOT EXISTS idx_schedules_due ON schedules (enabled, next_run_at);

CREATE TABLE IF NOT EXISTS runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    schedule_id INTEGER NOT NULL,
    org_id INTEGER NOT NULL,
    started_at TEXT NOT NULL,
    finished_at TEXT DEFAULT NULL,
    status TEXT NOT NULL,                -- running | completed | failed
    error_text TEXT DEFAULT NULL,
    rendered_pages INTEGER NOT NULL DEFAULT 0,
    bytes INTEGER NOT NULL DEFAULT 0,
    checksum TEXT DEFAULT NULL,          -- sha256, hex
    artifact BLOB DEFAULT NULL,
    email_sent BOOLEAN NOT NULL DEFAULT 0,
    email_error TEXT DEFAULT NULL,
    created_at TEXT NOT NULL,
    FOREIGN KEY (schedule_id) REFERENCES schedules(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_runs_schedule ON runs (schedule_id, started_at);

CREATE TABLE IF NOT EXISTS settings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    org_id INTEGER NOT NULL UNIQUE,
    smtp_config TEXT DEFAULT NULL,
    renderer_config TEXT NOT NULL,
    limits TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

// Version 1 shipped without cron_expr or email_error
const UPGRADE_1_TO_2_STATEMENTS: &[&str] = &[
    "ALTER TABLE schedules ADD COLUMN cron_expr TEXT NOT NULL DEFAULT ''",
    "ALTER TABLE runs ADD COLUMN email_error TEXT DEFAULT NULL",
];

const UPGRADE_2_TO_3_STATEMENTS: &[&str] = &[
    "ALTER TABLE schedules ADD COLUMN dashboard_title TEXT NOT NULL DEFAULT ''",
    "ALTER TABLE schedules ADD COLUMN panel_ids TEXT DEFAULT NULL",
    "ALTER TABLE schedules ADD COLUMN owner_user_id INTEGER NOT NULL DEFAULT 0",
    "CREATE INDEX IF NOT EXISTS idx_schedules_due ON schedules (enabled, next_run_at)",
];

/// Migration descriptor:
/// - statements: run one at a time so that a column which already exists
///   can be skipped without aborting the rest
/// - code_fn: Rust function for data transformations (optional)
pub struct Migration {
    pub from_version: u32,
    pub statements: &'static [&'static str],
    pub code_fn: Option<MigrationFn>,
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        from_version: 1,
        statements: UPGRADE_1_TO_2_STATEMENTS,
        code_fn: Some(backfill_cron_expr),
    },
    Migration {
        from_version: 2,
        statements: UPGRADE_2_TO_3_STATEMENTS,
        code_fn: None,
    },
];

/// Fill in cron_expr for schedules that only carry an interval type
fn backfill_cron_expr(conn: &Connection) -> Result<(), DashReportError> {
    let updated = conn.execute(
        "UPDATE schedules SET cron_expr = CASE interval_type
            WHEN 'weekly' THEN '0 0 * * 1'
            WHEN 'monthly' THEN '0 0 1 * *'
            ELSE '0 0 * * *'
        END
        WHERE cron_expr IS NULL OR cron_expr = ''",
        [],
    )?;
    if updated > 0 {
        log::info!("Backfilled cron expression for {} schedule(s)", updated);
    }
    Ok(())
}

/// Whether an ALTER failed only because an earlier partial upgrade already added the column
pub fn is_duplicate_column(err: &rusqlite::Error) -> bool {
    err.to_string().contains("duplicate column name")
}
