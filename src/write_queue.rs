use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, error, info, Level};
use logging_timer::timer;
use rusqlite::Connection;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::database::Database;
use crate::error::DashReportError;
use crate::runs::Run;
use crate::schedules::Schedule;
use crate::settings::Settings;

/// A mutation of durable state
#[derive(Debug, Clone)]
pub enum WriteOp {
    CreateSchedule(Schedule),
    UpdateSchedule(Schedule),
    SetNextRun {
        org_id: i64,
        id: i64,
        next_run_at: Option<DateTime<Utc>>,
    },
    SetLastRun {
        org_id: i64,
        id: i64,
        last_run_at: DateTime<Utc>,
    },
    DeleteSchedule {
        org_id: i64,
        id: i64,
    },
    CreateRun(Run),
    UpdateRun(Run),
    UpsertSettings(Settings),
    PruneRuns {
        org_id: i64,
        cutoff: DateTime<Utc>,
    },
}

impl WriteOp {
    pub fn name(&self) -> &'static str {
        match self {
            WriteOp::CreateSchedule(_) => "CreateSchedule",
            WriteOp::UpdateSchedule(_) => "UpdateSchedule",
            WriteOp::SetNextRun { .. } => "SetNextRun",
            WriteOp::SetLastRun { .. } => "SetLastRun",
            WriteOp::DeleteSchedule { .. } => "DeleteSchedule",
            WriteOp::CreateRun(_) => "CreateRun",
            WriteOp::UpdateRun(_) => "UpdateRun",
            WriteOp::UpsertSettings(_) => "UpsertSettings",
            WriteOp::PruneRuns { .. } => "PruneRuns",
        }
    }

    fn apply(self, conn: &Connection) -> Result<WriteOutput, DashReportError> {
        match self {
            WriteOp::CreateSchedule(schedule) => {
                Schedule::insert(conn, &schedule).map(WriteOutput::Schedule)
            }
            WriteOp::UpdateSchedule(schedule) => {
                Schedule::update(conn, &schedule).map(WriteOutput::Schedule)
            }
            WriteOp::SetNextRun {
                org_id,
                id,
                next_run_at,
            } => Schedule::set_next_run(conn, org_id, id, next_run_at).map(|_| WriteOutput::Done),
            WriteOp::SetLastRun {
                org_id,
                id,
                last_run_at,
            } => Schedule::set_last_run(conn, org_id, id, last_run_at).map(|_| WriteOutput::Done),
            WriteOp::DeleteSchedule { org_id, id } => {
                Schedule::delete(conn, org_id, id).map(|_| WriteOutput::Done)
            }
            WriteOp::CreateRun(run) => Run::insert(conn, &run).map(WriteOutput::Run),
            WriteOp::UpdateRun(run) => Run::update(conn, &run).map(WriteOutput::Run),
            WriteOp::UpsertSettings(settings) => {
                Settings::upsert(conn, &settings).map(WriteOutput::Settings)
            }
            WriteOp::PruneRuns { org_id, cutoff } => {
                Run::prune(conn, org_id, cutoff).map(WriteOutput::Deleted)
            }
        }
    }
}

#[derive(Debug)]
pub enum WriteOutput {
    Schedule(Schedule),
    Run(Run),
    Settings(Settings),
    Deleted(usize),
    Done,
}

impl WriteOutput {
    fn unexpected(self, wanted: &str) -> DashReportError {
        DashReportError::Error(format!("write queue returned {:?} where {} was expected", self, wanted))
    }

    pub fn into_schedule(self) -> Result<Schedule, DashReportError> {
        match self {
            WriteOutput::Schedule(schedule) => Ok(schedule),
            other => Err(other.unexpected("a schedule")),
        }
    }

    pub fn into_run(self) -> Result<Run, DashReportError> {
        match self {
            WriteOutput::Run(run) => Ok(run),
            other => Err(other.unexpected("a run")),
        }
    }

    pub fn into_settings(self) -> Result<Settings, DashReportError> {
        match self {
            WriteOutput::Settings(settings) => Ok(settings),
            other => Err(other.unexpected("settings")),
        }
    }

    pub fn into_deleted(self) -> Result<usize, DashReportError> {
        match self {
            WriteOutput::Deleted(count) => Ok(count),
            other => Err(other.unexpected("a delete count")),
        }
    }
}

struct QueuedWrite {
    op: WriteOp,
    respond_to: oneshot::Sender<Result<WriteOutput, DashReportError>>,
}

/// Serializes every write through one worker task.
///
/// Callers await their own result. On shutdown, new submissions are refused,
/// writes already accepted into the buffer are still executed, and then the
/// worker exits.
pub struct WriteQueue {
    sender: mpsc::Sender<QueuedWrite>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl WriteQueue {
    /// Start the worker. Must be called from within a tokio runtime.
    pub fn start(db: Arc<Database>, capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(Self::process_queue(db, receiver, cancel.clone()));
        info!("Write queue started (capacity {})", capacity.max(1));

        WriteQueue {
            sender,
            cancel,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Submit a write and wait for it to be applied
    pub async fn submit(&self, op: WriteOp) -> Result<WriteOutput, DashReportError> {
        if self.cancel.is_cancelled() {
            return Err(DashReportError::QueueClosed);
        }

        let op_name = op.name();
        let (respond_to, response) = oneshot::channel();
        let queued = QueuedWrite { op, respond_to };

        tokio::select! {
            sent = self.sender.send(queued) => {
                if sent.is_err() {
                    return Err(DashReportError::QueueClosed);
                }
            }
            _ = self.cancel.cancelled() => return Err(DashReportError::QueueClosed),
        }

        // The worker answers every accepted write, or drops the sender when it
        // exits without reaching it
        match response.await {
            Ok(result) => result,
            Err(_) => {
                debug!("{} was dropped by a closing write queue", op_name);
                Err(DashReportError::QueueClosed)
            }
        }
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Refuse new writes, drain the buffer, and wait for the worker to exit
    pub async fn shutdown(&self) {
        info!("Write queue shutting down...");
        self.cancel.cancel();
        let worker = self.worker.lock().await.take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                error!("Write queue worker ended abnormally: {}", e);
            }
        }
    }

    async fn process_queue(
        db: Arc<Database>,
        mut receiver: mpsc::Receiver<QueuedWrite>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                queued = receiver.recv() => match queued {
                    Some(queued) => Self::execute(&db, queued).await,
                    None => return,
                },
            }
        }

        receiver.close();
        let mut drained = 0;
        while let Some(queued) = receiver.recv().await {
            Self::execute(&db, queued).await;
            drained += 1;
        }
        info!("Write queue shut down ({} buffered writes drained)", drained);
    }

    async fn execute(db: &Arc<Database>, queued: QueuedWrite) {
        let QueuedWrite { op, respond_to } = queued;
        let op_name = op.name();
        let db = Arc::clone(db);

        let result = tokio::task::spawn_blocking(move || {
            let _tmr = timer!(Level::Trace; "WriteQueue::execute", "{}", op_name);
            let conn = db.get_connection()?;
            Database::immediate_transaction(&conn, |c| op.apply(c))
        })
        .await
        .unwrap_or_else(|e| {
            Err(DashReportError::Error(format!(
                "write {} panicked or was cancelled: {}",
                op_name, e
            )))
        });

        if let Err(e) = &result {
            debug!("Write {} failed: {}", op_name, e);
        }
        if respond_to.send(result).is_err() {
            debug!("Caller of {} went away before the result arrived", op_name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runs::RunStatus;
    use crate::schedules::test_schedule;
    use tempfile::TempDir;

    fn open_db() -> (TempDir, Arc<Database>) {
        let dir = TempDir::new().unwrap();
        let db = Database::open(&dir.path().join("queue.db")).unwrap();
        (dir, Arc::new(db))
    }

    fn count(db: &Database, table: &str) -> i64 {
        let conn = db.get_connection().unwrap();
        conn.query_row(&format!("SELECT count(*) FROM {}", table), [], |row| {
            row.get(0)
        })
        .unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writes_do_not_collide() {
        let (_dir, db) = open_db();
        let queue = Arc::new(WriteQueue::start(Arc::clone(&db), 100));

        let mut handles = Vec::new();
        for i in 0..10 {
            let queue = Arc::clone(&queue);
            handles.push(tokio::spawn(async move {
                let schedule = queue
                    .submit(WriteOp::CreateSchedule(test_schedule(1, &format!("s{}", i))))
                    .await?
                    .into_schedule()?;

                let mut runs = Vec::new();
                for _ in 0..5 {
                    let queue = Arc::clone(&queue);
                    let schedule_id = schedule.id;
                    runs.push(tokio::spawn(async move {
                        let mut run = queue
                            .submit(WriteOp::CreateRun(Run::start(schedule_id, 1, Utc::now())))
                            .await?
                            .into_run()?;
                        run.finish(RunStatus::Completed, Utc::now())?;
                        queue.submit(WriteOp::UpdateRun(run)).await?.into_run()
                    }));
                }
                for run in runs {
                    run.await.unwrap()?;
                }
                Ok::<_, DashReportError>(())
            }));
        }

        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(count(&db, "schedules"), 10);
        assert_eq!(count(&db, "runs"), 50);

        let conn = db.get_connection().unwrap();
        let running: i64 = conn
            .query_row("SELECT count(*) FROM runs WHERE status = 'running'", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(running, 0);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_is_refused() {
        let (_dir, db) = open_db();
        let queue = WriteQueue::start(Arc::clone(&db), 4);
        queue.shutdown().await;
        assert!(queue.is_closed());

        let result = queue
            .submit(WriteOp::CreateSchedule(test_schedule(1, "late")))
            .await;
        assert!(matches!(result, Err(DashReportError::QueueClosed)));
        assert_eq!(count(&db, "schedules"), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_never_loses_an_acknowledged_write() {
        let (_dir, db) = open_db();
        let queue = Arc::new(WriteQueue::start(Arc::clone(&db), 100));

        let mut handles = Vec::new();
        for i in 0..40 {
            let queue = Arc::clone(&queue);
            handles.push(tokio::spawn(async move {
                queue
                    .submit(WriteOp::CreateSchedule(test_schedule(1, &format!("s{}", i))))
                    .await
            }));
        }
        tokio::task::yield_now().await;
        queue.shutdown().await;

        let mut acknowledged = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => acknowledged += 1,
                Err(DashReportError::QueueClosed) => {}
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert_eq!(count(&db, "schedules"), acknowledged);
    }

    #[tokio::test]
    async fn test_failed_write_reports_error_and_queue_keeps_going() {
        let (_dir, db) = open_db();
        let queue = WriteQueue::start(Arc::clone(&db), 4);

        let mut missing = test_schedule(1, "missing");
        missing.id = 999;
        let result = queue.submit(WriteOp::UpdateSchedule(missing)).await;
        assert!(matches!(result, Err(DashReportError::NotFound(_))));

        let created = queue
            .submit(WriteOp::CreateSchedule(test_schedule(1, "after")))
            .await
            .unwrap()
            .into_schedule()
            .unwrap();
        assert!(created.id > 0);
        queue.shutdown().await;
    }
}
