use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::error::DashReportError;
use crate::timestamps;

/// Runs returned by a history listing
pub const RUN_LIST_LIMIT: i64 = 50;

/// Status of a run. Transitions only go forward: Running -> Completed | Failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }

    pub fn can_transition_to(self, next: RunStatus) -> bool {
        self == next || (self == Self::Running && next.is_terminal())
    }
}

impl FromStr for RunStatus {
    type Err = DashReportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(DashReportError::Error(format!("Invalid run status: '{}'", s))),
        }
    }
}

/// One execution of a schedule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: i64,
    pub schedule_id: i64,
    pub org_id: i64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub error_text: Option<String>,
    pub rendered_pages: i64,
    pub bytes: i64,
    pub checksum: Option<String>,
    /// The rendered PDF. Omitted from listings.
    #[serde(skip)]
    pub artifact: Option<Vec<u8>>,
    pub email_sent: bool,
    pub email_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

const RUN_SUMMARY_COLUMNS: &str = "id, schedule_id, org_id, started_at, finished_at, status,
    error_text, rendered_pages, bytes, checksum, email_sent, email_error, created_at";

impl Run {
    /// A fresh run record in the running state
    pub fn start(schedule_id: i64, org_id: i64, started_at: DateTime<Utc>) -> Self {
        Run {
            id: 0,
            schedule_id,
            org_id,
            started_at,
            finished_at: None,
            status: RunStatus::Running,
            error_text: None,
            rendered_pages: 0,
            bytes: 0,
            checksum: None,
            artifact: None,
            email_sent: false,
            email_error: None,
            created_at: started_at,
        }
    }

    #[cfg(test)]
    pub fn has_artifact(&self) -> bool {
        self.artifact.as_ref().is_some_and(|a| !a.is_empty())
    }

    /// Move to a terminal status, refusing to go backwards
    pub fn finish(
        &mut self,
        status: RunStatus,
        finished_at: DateTime<Utc>,
    ) -> Result<(), DashReportError> {
        if !self.status.can_transition_to(status) {
            return Err(DashReportError::Error(format!(
                "Run {} cannot move from {} to {}",
                self.id,
                self.status.as_str(),
                status.as_str()
            )));
        }
        self.status = status;
        self.finished_at = Some(finished_at);
        Ok(())
    }

    fn from_summary_row(row: &Row) -> Result<Self, rusqlite::Error> {
        let status: String = row.get(5)?;
        Ok(Run {
            id: row.get(0)?,
            schedule_id: row.get(1)?,
            org_id: row.get(2)?,
            started_at: timestamps::opt_from_db(row.get(3)?).unwrap_or_default(),
            finished_at: timestamps::opt_from_db(row.get(4)?),
            status: status.parse::<RunStatus>().map_err(|_| {
                rusqlite::Error::InvalidColumnType(
                    5,
                    "status".to_string(),
                    rusqlite::types::Type::Text,
                )
            })?,
            error_text: row.get(6)?,
            rendered_pages: row.get(7)?,
            bytes: row.get(8)?,
            checksum: row.get(9)?,
            artifact: None,
            email_sent: row.get(10)?,
            email_error: row.get(11)?,
            created_at: timestamps::opt_from_db(row.get(12)?).unwrap_or_default(),
        })
    }

    // ========================================
    // Database operations
    // ========================================

    pub fn insert(conn: &Connection, run: &Run) -> Result<Self, DashReportError> {
        let id: i64 = conn
            .query_row(
                "INSERT INTO runs (
                    schedule_id, org_id, started_at, finished_at, status, error_text,
                    rendered_pages, bytes, checksum, artifact, email_sent, email_error,
                    created_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                RETURNING id",
                params![
                    run.schedule_id,
                    run.org_id,
                    timestamps::to_db(&run.started_at),
                    timestamps::opt_to_db(&run.finished_at),
                    run.status.as_str(),
                    run.error_text,
                    run.rendered_pages,
                    run.bytes,
                    run.checksum,
                    run.artifact,
                    run.email_sent,
                    run.email_error,
                    timestamps::to_db(&Utc::now()),
                ],
                |row| row.get(0),
            )
            .map_err(DashReportError::DatabaseError)?;

        Ok(Run {
            id,
            ..run.clone()
        })
    }

    /// Overwrite status, results, artifact and email fields. A stored
    /// terminal status is never moved back to running.
    pub fn update(conn: &Connection, run: &Run) -> Result<Self, DashReportError> {
        let stored: Option<String> = conn
            .query_row("SELECT status FROM runs WHERE id = ?", [run.id], |row| {
                row.get(0)
            })
            .optional()?;
        let stored = match stored {
            Some(status) => status.parse::<RunStatus>().ok(),
            None => return Err(DashReportError::NotFound(format!("Run {}", run.id))),
        };
        if let Some(stored) = stored {
            if !stored.can_transition_to(run.status) {
                return Err(DashReportError::Error(format!(
                    "Run {} is {} and cannot return to {}",
                    run.id,
                    stored.as_str(),
                    run.status.as_str()
                )));
            }
        }

        conn.execute(
            "UPDATE runs SET
                finished_at = ?, status = ?, error_text = ?, rendered_pages = ?,
                bytes = ?, checksum = ?, artifact = ?, email_sent = ?, email_error = ?
            WHERE id = ?",
            params![
                timestamps::opt_to_db(&run.finished_at),
                run.status.as_str(),
                run.error_text,
                run.rendered_pages,
                run.bytes,
                run.checksum,
                run.artifact,
                run.email_sent,
                run.email_error,
                run.id,
            ],
        )?;
        Ok(run.clone())
    }

    /// A run with its artifact
    pub fn get_by_id(
        conn: &Connection,
        org_id: i64,
        id: i64,
    ) -> Result<Option<Self>, DashReportError> {
        conn.query_row(
            &format!(
                "SELECT {}, artifact FROM runs WHERE id = ? AND org_id = ?",
                RUN_SUMMARY_COLUMNS
            ),
            params![id, org_id],
            |row| {
                let mut run = Self::from_summary_row(row)?;
                run.artifact = row.get(13)?;
                Ok(run)
            },
        )
        .optional()
        .map_err(DashReportError::DatabaseError)
    }

    /// Most recent runs of a schedule, newest first, without artifacts
    pub fn list_for_schedule(
        conn: &Connection,
        org_id: i64,
        schedule_id: i64,
    ) -> Result<Vec<Self>, DashReportError> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM runs
             WHERE org_id = ? AND schedule_id = ?
             ORDER BY started_at DESC, id DESC
             LIMIT ?",
            RUN_SUMMARY_COLUMNS
        ))?;
        let rows = stmt.query_map(
            params![org_id, schedule_id, RUN_LIST_LIMIT],
            Self::from_summary_row,
        )?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(DashReportError::DatabaseError)
    }

    /// Delete finished runs of a tenant that started before `cutoff`
    pub fn prune(
        conn: &Connection,
        org_id: i64,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, DashReportError> {
        let deleted = conn.execute(
            "DELETE FROM runs
             WHERE org_id = ? AND status != 'running' AND datetime(started_at) < datetime(?)",
            params![org_id, timestamps::to_db(&cutoff)],
        )?;
        Ok(deleted)
    }
}
