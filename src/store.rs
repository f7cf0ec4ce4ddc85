use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{info, Level};
use logging_timer::timer;

use crate::database::Database;
use crate::error::DashReportError;
use crate::runs::Run;
use crate::schedules::Schedule;
use crate::settings::Settings;
use crate::write_queue::{WriteOp, WriteQueue};

/// Durable state for schedules, runs and settings.
///
/// Reads go straight to the pool. Every mutation is submitted to the write
/// queue and awaited.
pub struct Store {
    db: Arc<Database>,
    queue: WriteQueue,
}

impl Store {
    /// Wrap an open database and start its write queue
    pub fn new(db: Database, queue_capacity: usize) -> Self {
        let db = Arc::new(db);
        let queue = WriteQueue::start(Arc::clone(&db), queue_capacity);
        Store { db, queue }
    }

    pub async fn close(&self) {
        self.queue.shutdown().await;
        info!("Store closed");
    }

    // Writes

    pub async fn create_schedule(&self, schedule: Schedule) -> Result<Schedule, DashReportError> {
        self.queue
            .submit(WriteOp::CreateSchedule(schedule))
            .await?
            .into_schedule()
    }

    pub async fn update_schedule(&self, schedule: Schedule) -> Result<Schedule, DashReportError> {
        self.queue
            .submit(WriteOp::UpdateSchedule(schedule))
            .await?
            .into_schedule()
    }

    pub async fn set_next_run(
        &self,
        org_id: i64,
        id: i64,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<(), DashReportError> {
        self.queue
            .submit(WriteOp::SetNextRun {
                org_id,
                id,
                next_run_at,
            })
            .await
            .map(|_| ())
    }

    pub async fn set_last_run(
        &self,
        org_id: i64,
        id: i64,
        last_run_at: DateTime<Utc>,
    ) -> Result<(), DashReportError> {
        self.queue
            .submit(WriteOp::SetLastRun {
                org_id,
                id,
                last_run_at,
            })
            .await
            .map(|_| ())
    }

    pub async fn delete_schedule(&self, org_id: i64, id: i64) -> Result<(), DashReportError> {
        self.queue
            .submit(WriteOp::DeleteSchedule { org_id, id })
            .await
            .map(|_| ())
    }

    pub async fn create_run(&self, run: Run) -> Result<Run, DashReportError> {
        self.queue.submit(WriteOp::CreateRun(run)).await?.into_run()
    }

    pub async fn update_run(&self, run: Run) -> Result<Run, DashReportError> {
        self.queue.submit(WriteOp::UpdateRun(run)).await?.into_run()
    }

    pub async fn upsert_settings(&self, settings: Settings) -> Result<Settings, DashReportError> {
        self.queue
            .submit(WriteOp::UpsertSettings(settings))
            .await?
            .into_settings()
    }

    pub async fn prune_runs(
        &self,
        org_id: i64,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, DashReportError> {
        self.queue
            .submit(WriteOp::PruneRuns { org_id, cutoff })
            .await?
            .into_deleted()
    }

    // Reads

    pub fn get_schedule(&self, org_id: i64, id: i64) -> Result<Schedule, DashReportError> {
        let conn = self.db.get_connection()?;
        Schedule::get_by_id(&conn, org_id, id)?
            .ok_or_else(|| DashReportError::NotFound(format!("Schedule {}", id)))
    }

    pub fn list_schedules(&self, org_id: i64) -> Result<Vec<Schedule>, DashReportError> {
        let conn = self.db.get_connection()?;
        Schedule::list(&conn, org_id)
    }

    pub fn get_due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>, DashReportError> {
        let _tmr = timer!(Level::Trace; "Store::get_due_schedules");
        let conn = self.db.get_connection()?;
        Schedule::get_due(&conn, now)
    }

    pub fn schedule_org_ids(&self) -> Result<Vec<i64>, DashReportError> {
        let conn = self.db.get_connection()?;
        Schedule::org_ids(&conn)
    }

    pub fn get_run(&self, org_id: i64, id: i64) -> Result<Run, DashReportError> {
        let conn = self.db.get_connection()?;
        Run::get_by_id(&conn, org_id, id)?
            .ok_or_else(|| DashReportError::NotFound(format!("Run {}", id)))
    }

    pub fn list_runs(&self, org_id: i64, schedule_id: i64) -> Result<Vec<Run>, DashReportError> {
        let conn = self.db.get_connection()?;
        Run::list_for_schedule(&conn, org_id, schedule_id)
    }

    /// Stored settings, if the tenant has any
    pub fn get_settings(&self, org_id: i64) -> Result<Option<Settings>, DashReportError> {
        let conn = self.db.get_connection()?;
        Settings::get(&conn, org_id)
    }

    /// Stored settings, persisting defaults on first access
    pub async fn get_or_create_settings(&self, org_id: i64) -> Result<Settings, DashReportError> {
        if let Some(settings) = self.get_settings(org_id)? {
            return Ok(settings);
        }
        info!("Creating default settings for org {}", org_id);
        self.upsert_settings(Settings::defaults(org_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runs::RunStatus;
    use crate::schedules::test_schedule;
    use tempfile::TempDir;

    fn open_store() -> (TempDir, Store) {
        let dir = TempDir::new().unwrap();
        let db = Database::open(&dir.path().join("store.db")).unwrap();
        (dir, Store::new(db, 16))
    }

    #[tokio::test]
    async fn test_get_or_create_settings_persists_once() {
        let (_dir, store) = open_store();
        assert!(store.get_settings(5).unwrap().is_none());

        let created = store.get_or_create_settings(5).await.unwrap();
        let again = store.get_or_create_settings(5).await.unwrap();
        assert_eq!(created.id, again.id);
        assert_eq!(store.get_settings(5).unwrap().unwrap().org_id, 5);
        store.close().await;
    }

    #[tokio::test]
    async fn test_schedule_lifecycle_through_queue() {
        let (_dir, store) = open_store();
        let created = store.create_schedule(test_schedule(2, "weekly")).await.unwrap();
        assert_eq!(store.list_schedules(2).unwrap().len(), 1);

        let run = store
            .create_run(Run::start(created.id, 2, Utc::now()))
            .await
            .unwrap();
        assert_eq!(store.get_run(2, run.id).unwrap().status, RunStatus::Running);

        store.delete_schedule(2, created.id).await.unwrap();
        assert!(matches!(
            store.get_schedule(2, created.id),
            Err(DashReportError::NotFound(_))
        ));
        assert!(matches!(
            store.get_run(2, run.id),
            Err(DashReportError::NotFound(_))
        ));
        store.close().await;
    }
}
