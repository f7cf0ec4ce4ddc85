use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::SchedulerConfig;
use crate::error::DashReportError;
use crate::mail::{self, Mailer};
use crate::next_run::{calculate_next_run, next_run_after};
use crate::render::{inspect_pdf, CredentialChain};
use crate::runs::{Run, RunStatus};
use crate::schedules::Schedule;
use crate::settings::{Limits, Settings};
use crate::store::Store;
use crate::tenant_cache::TenantCache;
use crate::validation::validate_schedule;

pub const EMAIL_NOT_CONFIGURED: &str = "SMTP not configured";

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub tick: Duration,
    pub max_concurrent: usize,
    pub max_attempts: u32,
    /// Jobs waiting for a slot plus jobs running
    pub max_pending: usize,
    /// Attempt n waits n² times this before retrying
    pub backoff_base: Duration,
}

impl DispatcherConfig {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        DispatcherConfig {
            tick: Duration::from_secs(config.tick_seconds),
            max_concurrent: config.max_concurrent,
            max_attempts: config.max_attempts,
            max_pending: config.max_pending,
            backoff_base: Duration::from_secs(1),
        }
    }
}

/// Result of one render-persist-deliver attempt, classified once
#[derive(Debug)]
pub enum AttemptOutcome {
    Completed,
    Retryable(DashReportError),
    Fatal(DashReportError),
}

impl From<Result<(), DashReportError>> for AttemptOutcome {
    fn from(result: Result<(), DashReportError>) -> Self {
        match result {
            Ok(()) => AttemptOutcome::Completed,
            Err(e) if e.is_retryable() => AttemptOutcome::Retryable(e),
            Err(e) => AttemptOutcome::Fatal(e),
        }
    }
}

fn now_secs() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp(now.timestamp(), 0).unwrap_or(now)
}

/// Time left until the next multiple of `tick` on the wall clock
fn until_next_tick(tick: Duration, now: DateTime<Utc>) -> Duration {
    let period = tick.as_millis().max(1) as i64;
    let elapsed = now.timestamp_millis().rem_euclid(period);
    Duration::from_millis((period - elapsed) as u64)
}

struct Inner {
    store: Arc<Store>,
    cache: Arc<TenantCache>,
    mailer: Arc<dyn Mailer>,
    credentials: CredentialChain,
    config: DispatcherConfig,
    slots: Arc<Semaphore>,
    in_flight: StdMutex<HashSet<i64>>,
    cancel: CancellationToken,
}

/// Holds a schedule's place in the in-flight set until the job ends
struct JobGuard {
    inner: Arc<Inner>,
    schedule_id: i64,
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        if let Ok(mut in_flight) = self.inner.in_flight.lock() {
            in_flight.remove(&self.schedule_id);
        }
    }
}

impl Inner {
    /// Reserve a place for a schedule's job: at most one per schedule and
    /// at most `max_pending` overall
    fn admit(self: &Arc<Self>, schedule_id: i64) -> Result<JobGuard, DashReportError> {
        if self.cancel.is_cancelled() {
            return Err(DashReportError::ShuttingDown);
        }
        let mut in_flight = self
            .in_flight
            .lock()
            .map_err(|_| DashReportError::Error("in-flight job set is poisoned".to_string()))?;
        if in_flight.contains(&schedule_id) {
            return Err(DashReportError::AlreadyRunning(schedule_id));
        }
        if in_flight.len() >= self.config.max_pending {
            return Err(DashReportError::Busy(in_flight.len()));
        }
        in_flight.insert(schedule_id);
        Ok(JobGuard {
            inner: Arc::clone(self),
            schedule_id,
        })
    }

    fn in_flight_count(&self) -> usize {
        self.in_flight.lock().map(|s| s.len()).unwrap_or(0)
    }

    fn spawn_job(self: &Arc<Self>, schedule: Schedule, guard: JobGuard) -> JoinHandle<()> {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let _guard = guard;
            let _permit = match Arc::clone(&inner.slots).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    warn!("Execution slots closed; dropping job for schedule {}", schedule.id);
                    return;
                }
            };
            inner.execute(&schedule).await;
        })
    }

    /// One scheduler pass: dispatch everything due, then prune old history
    async fn tick(self: &Arc<Self>, now: DateTime<Utc>) -> Vec<JoinHandle<()>> {
        let due = match self.store.get_due_schedules(now) {
            Ok(due) => due,
            Err(e) => {
                error!("Failed to query due schedules: {}", e);
                return Vec::new();
            }
        };
        if !due.is_empty() {
            debug!("{} schedules due at {}", due.len(), now);
        }

        let mut jobs = Vec::new();
        for schedule in due {
            // Left due on refusal, so the next tick sees it again
            let guard = match self.admit(schedule.id) {
                Ok(guard) => guard,
                Err(e) => {
                    info!("Deferring schedule {} (org {}): {}", schedule.id, schedule.org_id, e);
                    continue;
                }
            };

            // Advance before executing so a slow job is never picked up twice
            let next = next_run_after(&schedule, now);
            if let Err(e) = self
                .store
                .set_next_run(schedule.org_id, schedule.id, Some(next))
                .await
            {
                error!(
                    "Failed to advance next run of schedule {} (org {}): {}",
                    schedule.id, schedule.org_id, e
                );
                continue;
            }
            debug!("Schedule {} next runs at {}", schedule.id, next);

            jobs.push(self.spawn_job(schedule, guard));
        }

        self.prune_history(now).await;
        jobs
    }

    async fn prune_history(&self, now: DateTime<Utc>) {
        let org_ids = match self.store.schedule_org_ids() {
            Ok(ids) => ids,
            Err(e) => {
                error!("Failed to list tenants for run retention: {}", e);
                return;
            }
        };

        for org_id in org_ids {
            let retention_days = match self.cache.get_settings(org_id).await {
                Ok(settings) => settings.limits.retention_days,
                Err(e) => {
                    debug!("Using default retention for org {}: {}", org_id, e);
                    Limits::default().retention_days
                }
            };
            if retention_days == 0 {
                continue;
            }

            let cutoff = now - chrono::Duration::days(i64::from(retention_days));
            match self.store.prune_runs(org_id, cutoff).await {
                Ok(0) => {}
                Ok(deleted) => info!(
                    "Pruned {} runs older than {} days for org {}",
                    deleted, retention_days, org_id
                ),
                Err(e) => error!("Failed to prune runs for org {}: {}", org_id, e),
            }
        }
    }

    async fn execute(&self, schedule: &Schedule) {
        let started_at = now_secs();
        let run = match self
            .store
            .create_run(Run::start(schedule.id, schedule.org_id, started_at))
            .await
        {
            Ok(run) => run,
            Err(e) => {
                error!(
                    "Failed to create run for schedule {} (org {}): {}",
                    schedule.id, schedule.org_id, e
                );
                self.record_last_run(schedule, started_at).await;
                return;
            }
        };
        info!(
            "Run {} started for schedule {} (org {})",
            run.id, schedule.id, schedule.org_id
        );

        let mut run = run;
        let max_attempts = self.config.max_attempts.max(1);
        let mut failure: Option<String> = None;

        for attempt in 1..=max_attempts {
            match self.attempt(schedule, &mut run).await {
                AttemptOutcome::Completed => {
                    failure = None;
                    break;
                }
                AttemptOutcome::Retryable(e) => {
                    let text = format!(
                        "attempt {} of {} for schedule {}: {}",
                        attempt, max_attempts, schedule.id, e
                    );
                    warn!("Run {} failed {}", run.id, text);
                    failure = Some(text);
                    if attempt < max_attempts {
                        tokio::time::sleep(self.config.backoff_base * (attempt * attempt)).await;
                    }
                }
                AttemptOutcome::Fatal(e) => {
                    let text = format!(
                        "attempt {} of {} for schedule {}: {}",
                        attempt, max_attempts, schedule.id, e
                    );
                    error!("Run {} failed without retry, {}", run.id, text);
                    failure = Some(text);
                    break;
                }
            }
        }

        let status = match failure {
            Some(_) => RunStatus::Failed,
            None => RunStatus::Completed,
        };
        run.error_text = failure;
        if let Err(e) = run.finish(status, now_secs()) {
            error!("{}", e);
        }

        let run_id = run.id;
        match self.store.update_run(run).await {
            Ok(_) => info!(
                "Run {} {} for schedule {} (org {})",
                run_id,
                status.as_str(),
                schedule.id,
                schedule.org_id
            ),
            Err(e) => error!("Failed to finalize run {}: {}", run_id, e),
        }

        self.record_last_run(schedule, started_at).await;
    }

    async fn record_last_run(&self, schedule: &Schedule, started_at: DateTime<Utc>) {
        if let Err(e) = self
            .store
            .set_last_run(schedule.org_id, schedule.id, started_at)
            .await
        {
            error!(
                "Failed to record last run of schedule {} (org {}): {}",
                schedule.id, schedule.org_id, e
            );
        }
    }

    async fn attempt(&self, schedule: &Schedule, run: &mut Run) -> AttemptOutcome {
        self.render_and_deliver(schedule, run).await.into()
    }

    async fn render_and_deliver(
        &self,
        schedule: &Schedule,
        run: &mut Run,
    ) -> Result<(), DashReportError> {
        let settings = self.cache.get_settings(schedule.org_id).await?;
        let renderer = self.cache.renderer_for(schedule.org_id).await?;

        let pdf = renderer
            .render_dashboard(schedule, &self.credentials)
            .await?;
        let summary = inspect_pdf(&pdf)?;

        run.rendered_pages = summary.pages as i64;
        run.bytes = pdf.len() as i64;
        run.checksum = Some(hex::encode(Sha256::digest(&pdf)));
        run.artifact = Some(pdf);

        // Stored before any delivery attempt. The render succeeded, so a
        // failed write must not send the run back through the retry loop;
        // the final update carries the artifact again.
        match self.store.update_run(run.clone()).await {
            Ok(_) => info!(
                "Run {} stored {} pages ({} bytes) for schedule {}",
                run.id, run.rendered_pages, run.bytes, schedule.id
            ),
            Err(e) => warn!(
                "Run {}: failed to store artifact for schedule {}: {}",
                run.id, schedule.id, e
            ),
        }

        self.deliver(schedule, &settings, run).await;
        Ok(())
    }

    /// Best effort. The outcome is recorded on the run and never fails it.
    async fn deliver(&self, schedule: &Schedule, settings: &Settings, run: &mut Run) {
        let Some(smtp) = settings.smtp() else {
            info!("Run {}: email skipped, SMTP not configured for org {}", run.id, schedule.org_id);
            run.email_sent = false;
            run.email_error = Some(EMAIL_NOT_CONFIGURED.to_string());
            return;
        };

        let limit = settings.limits.max_attachment_bytes();
        if run.bytes as u64 > limit {
            let text = format!(
                "attachment of {} bytes exceeds the {} MB limit",
                run.bytes, settings.limits.max_attachment_size_mb
            );
            warn!("Run {}: email skipped, {}", run.id, text);
            run.email_sent = false;
            run.email_error = Some(text);
            return;
        }

        let Some(pdf) = run.artifact.as_deref() else {
            return;
        };
        let (subject, body) = mail::compose(schedule, run.started_at);
        let filename = mail::report_filename(schedule, run.started_at);
        let result = self
            .mailer
            .send_report(smtp, &schedule.recipients, &subject, &body, pdf, &filename)
            .await;

        match result {
            Ok(()) => {
                info!("Run {}: report emailed for schedule {}", run.id, schedule.id);
                run.email_sent = true;
                run.email_error = None;
            }
            Err(e) => {
                warn!("Run {}: email delivery failed: {}", run.id, e);
                run.email_sent = false;
                run.email_error = Some(e.to_string());
            }
        }
    }
}

/// Polls for due schedules and runs them on a bounded pool of slots.
///
/// Also the write path for anything that must keep the tenant caches or
/// next-run times coherent: schedule edits and settings updates.
pub struct Dispatcher {
    inner: Arc<Inner>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<Store>,
        cache: Arc<TenantCache>,
        mailer: Arc<dyn Mailer>,
        credentials: CredentialChain,
        config: DispatcherConfig,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Dispatcher {
            inner: Arc::new(Inner {
                store,
                cache,
                mailer,
                credentials,
                config,
                slots,
                in_flight: StdMutex::new(HashSet::new()),
                cancel: CancellationToken::new(),
            }),
            ticker: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.inner.store
    }

    /// Jobs waiting for a slot or running
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight_count()
    }

    /// Start the polling loop. A second call is a no-op.
    pub async fn start(&self) {
        let mut ticker = self.ticker.lock().await;
        if ticker.is_some() || self.inner.cancel.is_cancelled() {
            return;
        }

        let inner = Arc::clone(&self.inner);
        *ticker = Some(tokio::spawn(async move {
            info!(
                "Scheduler started: tick {}s, {} slots, {} attempts",
                inner.config.tick.as_secs(),
                inner.config.max_concurrent,
                inner.config.max_attempts
            );
            loop {
                inner.tick(Utc::now()).await;
                tokio::select! {
                    _ = inner.cancel.cancelled() => break,
                    _ = tokio::time::sleep(until_next_tick(inner.config.tick, Utc::now())) => {}
                }
            }
            info!("Scheduler ticker stopped");
        }));
    }

    /// Stop ticking and close every cached renderer. Jobs already running
    /// are left to finish.
    pub async fn stop(&self) {
        self.inner.cancel.cancel();
        if let Some(handle) = self.ticker.lock().await.take() {
            if let Err(e) = handle.await {
                error!("Scheduler ticker ended abnormally: {}", e);
            }
        }
        self.inner.cache.close_all().await;
        info!("Dispatcher stopped");
    }

    /// Execute a schedule immediately, through the same slots as the ticker
    pub async fn run_now(&self, org_id: i64, id: i64) -> Result<JoinHandle<()>, DashReportError> {
        let schedule = self.inner.store.get_schedule(org_id, id)?;
        let guard = self.inner.admit(schedule.id)?;
        info!("Manual run requested for schedule {} (org {})", id, org_id);
        Ok(self.inner.spawn_job(schedule, guard))
    }

    pub async fn recalculate_next_run(
        &self,
        org_id: i64,
        id: i64,
    ) -> Result<Schedule, DashReportError> {
        let schedule = self.inner.store.get_schedule(org_id, id)?;
        let next = schedule.enabled.then(|| calculate_next_run(&schedule));
        self.inner.store.set_next_run(org_id, id, next).await?;
        info!("Recalculated next run of schedule {} (org {}): {:?}", id, org_id, next);
        self.inner.store.get_schedule(org_id, id)
    }

    pub async fn clear_tenant_cache(&self, org_id: i64) {
        self.inner.cache.invalidate(org_id).await;
    }

    /// Persist a tenant's settings, then drop its cached settings and renderer
    pub async fn update_settings(&self, settings: Settings) -> Result<Settings, DashReportError> {
        let org_id = settings.org_id;
        let saved = self.inner.store.upsert_settings(settings).await?;
        self.inner.cache.invalidate(org_id).await;
        Ok(saved)
    }

    fn limits_for(&self, org_id: i64) -> Result<Limits, DashReportError> {
        Ok(self
            .inner
            .store
            .get_settings(org_id)?
            .map(|settings| settings.limits)
            .unwrap_or_default())
    }

    pub async fn create_schedule(&self, mut schedule: Schedule) -> Result<Schedule, DashReportError> {
        validate_schedule(&schedule, &self.limits_for(schedule.org_id)?)?;
        schedule.last_run_at = None;
        schedule.next_run_at = schedule.enabled.then(|| calculate_next_run(&schedule));

        let created = self.inner.store.create_schedule(schedule).await?;
        info!(
            "Created schedule {} '{}' (org {}), next run {:?}",
            created.id, created.name, created.org_id, created.next_run_at
        );
        Ok(created)
    }

    pub async fn update_schedule(&self, mut schedule: Schedule) -> Result<Schedule, DashReportError> {
        let existing = self.inner.store.get_schedule(schedule.org_id, schedule.id)?;
        validate_schedule(&schedule, &self.limits_for(schedule.org_id)?)?;
        schedule.last_run_at = existing.last_run_at;
        schedule.next_run_at = schedule.enabled.then(|| calculate_next_run(&schedule));

        let updated = self.inner.store.update_schedule(schedule).await?;
        info!(
            "Updated schedule {} (org {}), next run {:?}",
            updated.id, updated.org_id, updated.next_run_at
        );
        Ok(updated)
    }

    pub async fn delete_schedule(&self, org_id: i64, id: i64) -> Result<(), DashReportError> {
        self.inner.store.delete_schedule(org_id, id).await?;
        info!("Deleted schedule {} (org {})", id, org_id);
        Ok(())
    }

    #[cfg(test)]
    async fn tick(&self, now: DateTime<Utc>) -> Vec<JoinHandle<()>> {
        self.inner.tick(now).await
    }
}
