use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::error::DashReportError;
use crate::timestamps;

pub const DAILY_CRON: &str = "0 0 * * *";
pub const WEEKLY_CRON: &str = "0 0 * * 1";
pub const MONTHLY_CRON: &str = "0 0 1 * *";

/// Interval classification of a schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntervalType {
    Daily,
    Weekly,
    Monthly,
    Cron,
}

impl FromStr for IntervalType {
    type Err = DashReportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "daily" => Ok(Self::Daily),
            "weekly" => Ok(Self::Weekly),
            "monthly" => Ok(Self::Monthly),
            "cron" => Ok(Self::Cron),
            _ => Err(DashReportError::Validation(format!(
                "unknown interval '{}'",
                s
            ))),
        }
    }
}

impl IntervalType {
    /// Cron expression implied by the classification. Unknown values and
    /// "cron" without an expression behave like daily.
    pub fn derived_cron(interval_type: &str) -> &'static str {
        match interval_type.parse::<IntervalType>() {
            Ok(Self::Weekly) => WEEKLY_CRON,
            Ok(Self::Monthly) => MONTHLY_CRON,
            _ => DAILY_CRON,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableOption {
    pub text: String,
    pub value: String,
}

/// One dashboard variable override. Names may repeat for multi-select values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<VariableOption>,
    /// False for duplicates added by the user
    #[serde(default)]
    pub is_original: bool,
}

impl Variable {
    pub fn new(name: &str, value: &str) -> Self {
        Variable {
            name: name.to_string(),
            value: value.to_string(),
            options: Vec::new(),
            is_original: true,
        }
    }
}

/// Parse the stored variables column. Accepts the list form and the older
/// `{"name": "value"}` object form.
pub fn parse_variables(text: Option<&str>) -> Result<Vec<Variable>, serde_json::Error> {
    let text = match text.map(str::trim) {
        None | Some("") | Some("null") => return Ok(Vec::new()),
        Some(text) => text,
    };

    match serde_json::from_str::<Vec<Variable>>(text) {
        Ok(list) => Ok(list),
        Err(list_err) => match serde_json::from_str::<BTreeMap<String, String>>(text) {
            Ok(map) => Ok(map
                .into_iter()
                .map(|(name, value)| Variable::new(&name, &value))
                .collect()),
            Err(_) => Err(list_err),
        },
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipients {
    pub to: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cc: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bcc: Vec<String>,
}

impl Recipients {
    /// Every non-blank address across to, cc and bcc
    pub fn all(&self) -> impl Iterator<Item = &str> {
        self.to
            .iter()
            .chain(self.cc.iter())
            .chain(self.bcc.iter())
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
    }

    pub fn count(&self) -> usize {
        self.all().count()
    }
}

/// A recurring report definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub org_id: i64,
    pub name: String,
    pub dashboard_uid: String,
    #[serde(default)]
    pub dashboard_title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub panel_ids: Option<Vec<i64>>,
    pub range_from: String,
    pub range_to: String,
    pub interval_type: String,
    #[serde(default)]
    pub cron_expr: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub variables: Vec<Variable>,
    pub recipients: Recipients,
    #[serde(default)]
    pub email_subject: String,
    #[serde(default)]
    pub email_body: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub owner_user_id: i64,
    #[serde(default)]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: DateTime<Utc>,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_enabled() -> bool {
    true
}

const SCHEDULE_COLUMNS: &str = "id, org_id, name, dashboard_uid, dashboard_title, panel_ids,
    range_from, range_to, interval_type, cron_expr, timezone, variables, recipients,
    email_subject, email_body, enabled, last_run_at, next_run_at, owner_user_id,
    created_at, updated_at";

fn json_column_error(idx: usize, e: serde_json::Error) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}

impl Schedule {
    /// The cron expression that drives this schedule
    pub fn effective_cron_expr(&self) -> &str {
        let explicit = self.cron_expr.trim();
        if explicit.is_empty() {
            IntervalType::derived_cron(&self.interval_type)
        } else {
            explicit
        }
    }

    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        let panel_ids = row
            .get::<_, Option<String>>(5)?
            .filter(|s| !s.trim().is_empty())
            .map(|s| serde_json::from_str::<Vec<i64>>(&s))
            .transpose()
            .map_err(|e| json_column_error(5, e))?
            .filter(|ids| !ids.is_empty());
        let variables = parse_variables(row.get::<_, Option<String>>(11)?.as_deref())
            .map_err(|e| json_column_error(11, e))?;
        let recipients = match row.get::<_, Option<String>>(12)? {
            Some(text) if !text.trim().is_empty() => {
                serde_json::from_str(&text).map_err(|e| json_column_error(12, e))?
            }
            _ => Recipients::default(),
        };

        Ok(Schedule {
            id: row.get(0)?,
            org_id: row.get(1)?,
            name: row.get(2)?,
            dashboard_uid: row.get(3)?,
            dashboard_title: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
            panel_ids,
            range_from: row.get(6)?,
            range_to: row.get(7)?,
            interval_type: row.get(8)?,
            cron_expr: row.get::<_, Option<String>>(9)?.unwrap_or_default(),
            timezone: row.get(10)?,
            variables,
            recipients,
            email_subject: row.get(13)?,
            email_body: row.get(14)?,
            enabled: row.get(15)?,
            last_run_at: timestamps::opt_from_db(row.get(16)?),
            next_run_at: timestamps::opt_from_db(row.get(17)?),
            owner_user_id: row.get(18)?,
            created_at: timestamps::opt_from_db(row.get(19)?).unwrap_or_default(),
            updated_at: timestamps::opt_from_db(row.get(20)?).unwrap_or_default(),
        })
    }

    fn json_columns(&self) -> Result<(Option<String>, String, String), DashReportError> {
        let panel_ids = match &self.panel_ids {
            Some(ids) if !ids.is_empty() => Some(serde_json::to_string(ids)?),
            _ => None,
        };
        Ok((
            panel_ids,
            serde_json::to_string(&self.variables)?,
            serde_json::to_string(&self.recipients)?,
        ))
    }

    // ========================================
    // Database operations
    // ========================================

    /// Insert a new schedule, assigning id and timestamps.
    ///
    /// Writes go through the write queue, which holds the transaction.
    pub fn insert(conn: &Connection, schedule: &Schedule) -> Result<Self, DashReportError> {
        let now = Utc::now();
        let (panel_ids, variables, recipients) = schedule.json_columns()?;

        let id: i64 = conn
            .query_row(
                "INSERT INTO schedules (
                    org_id, name, dashboard_uid, dashboard_title, panel_ids,
                    range_from, range_to, interval_type, cron_expr, timezone,
                    variables, recipients, email_subject, email_body, enabled,
                    last_run_at, next_run_at, owner_user_id, created_at, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                RETURNING id",
                params![
                    schedule.org_id,
                    schedule.name,
                    schedule.dashboard_uid,
                    schedule.dashboard_title,
                    panel_ids,
                    schedule.range_from,
                    schedule.range_to,
                    schedule.interval_type,
                    schedule.cron_expr,
                    schedule.timezone,
                    variables,
                    recipients,
                    schedule.email_subject,
                    schedule.email_body,
                    schedule.enabled,
                    timestamps::opt_to_db(&schedule.last_run_at),
                    timestamps::opt_to_db(&schedule.next_run_at),
                    schedule.owner_user_id,
                    timestamps::to_db(&now),
                    timestamps::to_db(&now),
                ],
                |row| row.get(0),
            )
            .map_err(DashReportError::DatabaseError)?;

        Self::get_by_id(conn, schedule.org_id, id)?
            .ok_or_else(|| DashReportError::NotFound(format!("Schedule {}", id)))
    }

    /// Full overwrite of a schedule, matched on (org_id, id)
    pub fn update(conn: &Connection, schedule: &Schedule) -> Result<Self, DashReportError> {
        let (panel_ids, variables, recipients) = schedule.json_columns()?;

        let rows_affected = conn
            .execute(
                "UPDATE schedules SET
                    name = ?, dashboard_uid = ?, dashboard_title = ?, panel_ids = ?,
                    range_from = ?, range_to = ?, interval_type = ?, cron_expr = ?,
                    timezone = ?, variables = ?, recipients = ?, email_subject = ?,
                    email_body = ?, enabled = ?, last_run_at = ?, next_run_at = ?,
                    updated_at = ?
                WHERE id = ? AND org_id = ?",
                params![
                    schedule.name,
                    schedule.dashboard_uid,
                    schedule.dashboard_title,
                    panel_ids,
                    schedule.range_from,
                    schedule.range_to,
                    schedule.interval_type,
                    schedule.cron_expr,
                    schedule.timezone,
                    variables,
                    recipients,
                    schedule.email_subject,
                    schedule.email_body,
                    schedule.enabled,
                    timestamps::opt_to_db(&schedule.last_run_at),
                    timestamps::opt_to_db(&schedule.next_run_at),
                    timestamps::to_db(&Utc::now()),
                    schedule.id,
                    schedule.org_id,
                ],
            )
            .map_err(DashReportError::DatabaseError)?;

        if rows_affected == 0 {
            return Err(DashReportError::NotFound(format!(
                "Schedule {}",
                schedule.id
            )));
        }

        Self::get_by_id(conn, schedule.org_id, schedule.id)?
            .ok_or_else(|| DashReportError::NotFound(format!("Schedule {}", schedule.id)))
    }

    /// Write only the next-run field. Used by the dispatcher so that it never
    /// overwrites a concurrent edit of the definition.
    pub fn set_next_run(
        conn: &Connection,
        org_id: i64,
        id: i64,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<(), DashReportError> {
        let rows_affected = conn.execute(
            "UPDATE schedules SET next_run_at = ? WHERE id = ? AND org_id = ?",
            params![timestamps::opt_to_db(&next_run_at), id, org_id],
        )?;
        if rows_affected == 0 {
            return Err(DashReportError::NotFound(format!("Schedule {}", id)));
        }
        Ok(())
    }

    pub fn set_last_run(
        conn: &Connection,
        org_id: i64,
        id: i64,
        last_run_at: DateTime<Utc>,
    ) -> Result<(), DashReportError> {
        let rows_affected = conn.execute(
            "UPDATE schedules SET last_run_at = ? WHERE id = ? AND org_id = ?",
            params![timestamps::to_db(&last_run_at), id, org_id],
        )?;
        if rows_affected == 0 {
            return Err(DashReportError::NotFound(format!("Schedule {}", id)));
        }
        Ok(())
    }

    /// Delete a schedule together with its run history
    pub fn delete(conn: &Connection, org_id: i64, id: i64) -> Result<(), DashReportError> {
        conn.execute(
            "DELETE FROM runs WHERE schedule_id = ? AND org_id = ?",
            params![id, org_id],
        )?;
        let rows_affected = conn.execute(
            "DELETE FROM schedules WHERE id = ? AND org_id = ?",
            params![id, org_id],
        )?;
        if rows_affected == 0 {
            return Err(DashReportError::NotFound(format!("Schedule {}", id)));
        }
        Ok(())
    }

    pub fn get_by_id(
        conn: &Connection,
        org_id: i64,
        id: i64,
    ) -> Result<Option<Self>, DashReportError> {
        conn.query_row(
            &format!(
                "SELECT {} FROM schedules WHERE id = ? AND org_id = ?",
                SCHEDULE_COLUMNS
            ),
            params![id, org_id],
            Self::from_row,
        )
        .optional()
        .map_err(DashReportError::DatabaseError)
    }

    /// All schedules of a tenant, newest first
    pub fn list(conn: &Connection, org_id: i64) -> Result<Vec<Self>, DashReportError> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM schedules WHERE org_id = ? ORDER BY created_at DESC, id DESC",
            SCHEDULE_COLUMNS
        ))?;
        let rows = stmt.query_map([org_id], Self::from_row)?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(DashReportError::DatabaseError)
    }

    /// Enabled schedules whose next run is unset or not after `now`, across
    /// all tenants, earliest first
    pub fn get_due(conn: &Connection, now: DateTime<Utc>) -> Result<Vec<Self>, DashReportError> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM schedules
             WHERE enabled = 1
               AND (next_run_at IS NULL OR datetime(next_run_at) <= datetime(?))
             ORDER BY next_run_at ASC, id ASC",
            SCHEDULE_COLUMNS
        ))?;
        let rows = stmt.query_map([timestamps::to_db(&now)], Self::from_row)?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(DashReportError::DatabaseError)
    }

    /// Distinct tenants that own at least one schedule
    pub fn org_ids(conn: &Connection) -> Result<Vec<i64>, DashReportError> {
        let mut stmt = conn.prepare("SELECT DISTINCT org_id FROM schedules ORDER BY org_id")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect::<Result<Vec<i64>, _>>()
            .map_err(DashReportError::DatabaseError)
    }
}

#[cfg(test)]
pub fn test_schedule(org_id: i64, name: &str) -> Schedule {
    Schedule {
        id: 0,
        org_id,
        name: name.to_string(),
        dashboard_uid: "ops-overview".to_string(),
        dashboard_title: "Ops Overview".to_string(),
        panel_ids: None,
        range_from: "now-7d".to_string(),
        range_to: "now".to_string(),
        interval_type: "daily".to_string(),
        cron_expr: String::new(),
        timezone: "UTC".to_string(),
        variables: vec![Variable::new("env", "prod")],
        recipients: Recipients {
            to: vec!["ops@example.com".to_string()],
            cc: Vec::new(),
            bcc: Vec::new(),
        },
        email_subject: "{{schedule.name}}".to_string(),
        email_body: "Report for {{timerange}}".to_string(),
        enabled: true,
        last_run_at: None,
        next_run_at: None,
        owner_user_id: 1,
        created_at: DateTime::<Utc>::default(),
        updated_at: DateTime::<Utc>::default(),
    }
}
