//! Recurring job scheduler with interval and cron-like triggers.
//!
//! Provides:
//! - Human-readable schedule normalization ("every 5 minutes" -> cron)
//! - Interval jobs (`next_run = now + interval`)
//! - Cron jobs, one occurrence per evaluation via `croner`
//! - A fixed-tick control loop (start/stop) plus a public `tick` so tests can
//!   drive the scheduler with a manual clock

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use sagaflow_types::config::SchedulerConfig;
use sagaflow_types::schedule::{JobInfo, ScheduleSpec};
use serde_json::{Value, json};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::definition::WorkflowDefinition;
use super::engine::{ExecutionOptions, ExecutorError, WorkflowEngine};
use super::step_executor::panic_message;
use crate::clock::{Clock, SystemClock};
use crate::repository::execution::ExecutionRepository;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors that can occur during scheduling operations.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// Invalid cron expression, schedule string, or interval.
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("job {0} not found")]
    JobNotFound(Uuid),

    #[error("scheduler is already running")]
    AlreadyRunning,
}

/// Failure reported by a job handler. Logged by the scheduler, never
/// propagated.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("job failed: {0}")]
    Failed(String),

    #[error(transparent)]
    Execution(#[from] ExecutorError),
}

impl From<anyhow::Error> for JobError {
    fn from(err: anyhow::Error) -> Self {
        JobError::Failed(format!("{err:#}"))
    }
}

// ---------------------------------------------------------------------------
// Human-readable schedule normalization
// ---------------------------------------------------------------------------

/// Normalize a human-readable schedule string to a 6-field cron expression.
///
/// Supported patterns (case-insensitive):
/// - "every N seconds"     -> "*/N * * * * *"
/// - "every N minutes"     -> "0 */N * * * *"
/// - "every N hours"       -> "0 0 */N * * *"
/// - "every minute"        -> "0 * * * * *"
/// - "every hour"          -> "0 0 * * * *"
/// - "every day"           -> "0 0 0 * * *"
/// - "every day at HH:MM"  -> "0 MM HH * * *"
/// - "hourly"              -> "0 0 * * * *"
/// - "daily"               -> "0 0 0 * * *"
///
/// 5-field cron gets a leading `0` seconds field; 6-field cron is returned
/// as-is.
pub fn normalize_schedule(input: &str) -> Result<String, SchedulerError> {
    let trimmed = input.trim();

    let parts: Vec<&str> = trimmed.split_whitespace().collect();
    if parts.len() == 5 {
        return Ok(format!("0 {}", parts.join(" ")));
    }
    if parts.len() == 6 {
        return Ok(parts.join(" "));
    }

    let lower = trimmed.to_lowercase();

    if lower == "every minute" || lower == "minutely" {
        return Ok("0 * * * * *".to_string());
    }
    if lower == "every hour" || lower == "hourly" {
        return Ok("0 0 * * * *".to_string());
    }
    if lower == "every day" || lower == "daily" {
        return Ok("0 0 0 * * *".to_string());
    }

    if let Some(rest) = lower.strip_prefix("every ") {
        if let Some(at_part) = rest.strip_prefix("day at ") {
            let invalid = || SchedulerError::InvalidSchedule(input.to_string());
            let (hour, minute) = at_part.split_once(':').ok_or_else(invalid)?;
            let hour: u32 = hour.trim().parse().map_err(|_| invalid())?;
            let minute: u32 = minute.trim().parse().map_err(|_| invalid())?;
            if hour < 24 && minute < 60 {
                return Ok(format!("0 {minute} {hour} * * *"));
            }
            return Err(invalid());
        }

        let words: Vec<&str> = rest.split_whitespace().collect();
        if words.len() == 2 {
            let n: u32 = words[0]
                .parse()
                .map_err(|_| SchedulerError::InvalidSchedule(input.to_string()))?;
            if n == 0 {
                return Err(SchedulerError::InvalidSchedule(
                    "interval must be > 0".to_string(),
                ));
            }
            return match words[1].trim_end_matches('s') {
                "second" => Ok(format!("*/{n} * * * * *")),
                "minute" => Ok(format!("0 */{n} * * * *")),
                "hour" => Ok(format!("0 0 */{n} * * *")),
                _ => Err(SchedulerError::InvalidSchedule(input.to_string())),
            };
        }
    }

    Err(SchedulerError::InvalidSchedule(format!(
        "unrecognized schedule format: '{trimmed}'"
    )))
}

// ---------------------------------------------------------------------------
// Schedules
// ---------------------------------------------------------------------------

/// Requested recurrence for a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schedule {
    Interval(Duration),
    /// Cron expression or human-readable schedule (see [`normalize_schedule`]).
    Cron(String),
}

impl Schedule {
    pub fn every(interval: Duration) -> Self {
        Schedule::Interval(interval)
    }

    pub fn cron(spec: impl Into<String>) -> Self {
        Schedule::Cron(spec.into())
    }
}

/// Parsed, ready-to-evaluate trigger.
enum Trigger {
    Interval(chrono::Duration),
    Cron(croner::Cron),
}

impl Trigger {
    fn parse(schedule: &Schedule) -> Result<(Self, ScheduleSpec), SchedulerError> {
        match schedule {
            Schedule::Interval(every) => {
                if every.is_zero() {
                    return Err(SchedulerError::InvalidSchedule(
                        "interval must be > 0".to_string(),
                    ));
                }
                let step = chrono::Duration::from_std(*every)
                    .map_err(|e| SchedulerError::InvalidSchedule(e.to_string()))?;
                Ok((
                    Trigger::Interval(step),
                    ScheduleSpec::Interval {
                        millis: u64::try_from(every.as_millis()).unwrap_or(u64::MAX),
                    },
                ))
            }
            Schedule::Cron(expression) => {
                let normalized = normalize_schedule(expression)?;
                let cron = normalized
                    .parse::<croner::Cron>()
                    .map_err(|e| SchedulerError::InvalidSchedule(format!("{expression}: {e}")))?;
                Ok((
                    Trigger::Cron(cron),
                    ScheduleSpec::Cron {
                        expression: expression.clone(),
                        normalized,
                    },
                ))
            }
        }
    }

    /// First firing time strictly after `now` (interval: exactly `now + step`).
    fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Trigger::Interval(step) => now.checked_add_signed(*step),
            Trigger::Cron(cron) => cron.iter_after(now).next(),
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Zero-argument async job action.
pub type JobHandler =
    Arc<dyn Fn() -> BoxFuture<'static, Result<(), JobError>> + Send + Sync>;

struct ScheduledJob {
    info: JobInfo,
    trigger: Trigger,
    handler: JobHandler,
}

type JobTable = Arc<RwLock<HashMap<Uuid, ScheduledJob>>>;

struct RunningLoop {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Holds scheduled jobs and dispatches them when due.
pub struct Scheduler {
    jobs: JobTable,
    clock: Arc<dyn Clock>,
    tick_interval: Duration,
    runner: Mutex<Option<RunningLoop>>,
}

impl Scheduler {
    /// Create a scheduler (not yet started).
    pub fn new(config: &SchedulerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            jobs: Arc::new(RwLock::new(HashMap::new())),
            clock,
            tick_interval: Duration::from_millis(config.tick_interval_ms.max(1)),
            runner: Mutex::new(None),
        }
    }

    /// Register a job firing every `interval`, first at `now + interval`.
    pub async fn schedule_interval<F, Fut>(
        &self,
        name: impl Into<String>,
        handler: F,
        interval: Duration,
    ) -> Result<Uuid, SchedulerError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        self.schedule(name, handler, Schedule::every(interval)).await
    }

    /// Register a job firing at the occurrences of a cron-like `spec`.
    pub async fn schedule_cron<F, Fut>(
        &self,
        name: impl Into<String>,
        handler: F,
        spec: &str,
    ) -> Result<Uuid, SchedulerError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        self.schedule(name, handler, Schedule::cron(spec)).await
    }

    /// Register a job with any [`Schedule`].
    pub async fn schedule<F, Fut>(
        &self,
        name: impl Into<String>,
        handler: F,
        schedule: Schedule,
    ) -> Result<Uuid, SchedulerError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        let (trigger, spec) = Trigger::parse(&schedule)?;
        let now = self.clock.now();
        let next_run = trigger.next_after(now).ok_or_else(|| {
            SchedulerError::InvalidSchedule(format!("{schedule:?} has no future occurrence"))
        })?;

        let id = Uuid::now_v7();
        let name = name.into();
        let handler: JobHandler = Arc::new(move || handler().boxed());
        tracing::info!(job_id = %id, job = %name, %next_run, "job scheduled");

        self.jobs.write().await.insert(
            id,
            ScheduledJob {
                info: JobInfo {
                    id,
                    name,
                    schedule: spec,
                    next_run,
                    last_run: None,
                    enabled: true,
                },
                trigger,
                handler,
            },
        );
        Ok(id)
    }

    /// Re-enable a job. Its next run is recomputed from now.
    pub async fn enable(&self, id: Uuid) -> Result<(), SchedulerError> {
        let now = self.clock.now();
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&id).ok_or(SchedulerError::JobNotFound(id))?;
        if !job.info.enabled {
            if let Some(next_run) = job.trigger.next_after(now) {
                job.info.next_run = next_run;
            }
            job.info.enabled = true;
            tracing::info!(job_id = %id, next_run = %job.info.next_run, "job enabled");
        }
        Ok(())
    }

    /// Stop a job from firing until it is enabled again.
    pub async fn disable(&self, id: Uuid) -> Result<(), SchedulerError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&id).ok_or(SchedulerError::JobNotFound(id))?;
        job.info.enabled = false;
        tracing::info!(job_id = %id, "job disabled");
        Ok(())
    }

    /// Delete a job.
    pub async fn remove(&self, id: Uuid) -> Result<JobInfo, SchedulerError> {
        let job = self
            .jobs
            .write()
            .await
            .remove(&id)
            .ok_or(SchedulerError::JobNotFound(id))?;
        tracing::info!(job_id = %id, "job removed");
        Ok(job.info)
    }

    /// Replace a job's schedule. Id, handler and enabled flag are kept.
    pub async fn reschedule(&self, id: Uuid, schedule: Schedule) -> Result<JobInfo, SchedulerError> {
        let (trigger, spec) = Trigger::parse(&schedule)?;
        let now = self.clock.now();
        let next_run = trigger.next_after(now).ok_or_else(|| {
            SchedulerError::InvalidSchedule(format!("{schedule:?} has no future occurrence"))
        })?;

        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&id).ok_or(SchedulerError::JobNotFound(id))?;
        job.trigger = trigger;
        job.info.schedule = spec;
        job.info.next_run = next_run;
        tracing::info!(job_id = %id, %next_run, "job rescheduled");
        Ok(job.info.clone())
    }

    pub async fn job(&self, id: Uuid) -> Option<JobInfo> {
        self.jobs.read().await.get(&id).map(|job| job.info.clone())
    }

    /// All jobs, soonest first.
    pub async fn jobs(&self) -> Vec<JobInfo> {
        let mut jobs: Vec<JobInfo> = self
            .jobs
            .read()
            .await
            .values()
            .map(|job| job.info.clone())
            .collect();
        jobs.sort_by_key(|job| job.next_run);
        jobs
    }

    /// Run one poll: dispatch every enabled job that is due.
    ///
    /// Each handler runs on its own task; the returned handles complete
    /// once the handlers do.
    pub async fn tick(&self) -> Vec<JoinHandle<()>> {
        tick_jobs(&self.jobs, self.clock.as_ref()).await
    }

    /// Start the control loop on a background task.
    pub async fn start(&self) -> Result<(), SchedulerError> {
        let mut runner = self.runner.lock().await;
        if runner.is_some() {
            return Err(SchedulerError::AlreadyRunning);
        }

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let jobs = Arc::clone(&self.jobs);
        let clock = Arc::clone(&self.clock);
        let tick_interval = self.tick_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        tick_jobs(&jobs, clock.as_ref()).await;
                    }
                }
            }
            tracing::debug!("scheduler loop exited");
        });

        *runner = Some(RunningLoop { cancel, handle });
        tracing::info!(tick_ms = tick_interval.as_millis() as u64, "scheduler started");
        Ok(())
    }

    /// Stop the control loop. Jobs already dispatched keep running.
    pub async fn stop(&self) {
        let Some(running) = self.runner.lock().await.take() else {
            return;
        };
        running.cancel.cancel();
        if let Err(e) = running.handle.await {
            tracing::warn!(error = %e, "scheduler loop ended abnormally");
        }
        tracing::info!("scheduler stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.runner.lock().await.is_some()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(&SchedulerConfig::default(), Arc::new(SystemClock))
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("tick_interval", &self.tick_interval)
            .finish_non_exhaustive()
    }
}

async fn tick_jobs(jobs: &JobTable, clock: &dyn Clock) -> Vec<JoinHandle<()>> {
    let now = clock.now();
    let mut due = Vec::new();

    {
        let mut jobs = jobs.write().await;
        for job in jobs.values_mut() {
            if !job.info.enabled || job.info.next_run > now {
                continue;
            }

            job.info.last_run = Some(now);
            match job.trigger.next_after(now) {
                Some(next_run) => job.info.next_run = next_run,
                None => {
                    tracing::warn!(job_id = %job.info.id, "schedule has no further occurrence, disabling job");
                    job.info.enabled = false;
                }
            }
            due.push((job.info.id, job.info.name.clone(), job.handler.clone()));
        }
    }

    due.into_iter()
        .map(|(id, name, handler)| {
            tracing::debug!(job_id = %id, job = %name, "dispatching job");
            tokio::spawn(async move {
                let outcome = AssertUnwindSafe(async move { handler().await })
                    .catch_unwind()
                    .await;
                match outcome {
                    Ok(Ok(())) => tracing::debug!(job_id = %id, job = %name, "job finished"),
                    Ok(Err(e)) => tracing::error!(job_id = %id, job = %name, error = %e, "job failed"),
                    Err(payload) => tracing::error!(
                        job_id = %id,
                        job = %name,
                        panic = %panic_message(payload.as_ref()),
                        "job panicked"
                    ),
                }
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Workflow trigger
// ---------------------------------------------------------------------------

/// Job handler that runs `definition` on `engine` with `inputs` each time it
/// fires. Every execution is tagged with `trigger = "scheduler"` metadata.
pub fn workflow_job<R>(
    engine: Arc<WorkflowEngine<R>>,
    definition: WorkflowDefinition,
    inputs: Value,
) -> impl Fn() -> BoxFuture<'static, Result<(), JobError>> + Send + Sync + 'static
where
    R: ExecutionRepository + 'static,
{
    move || {
        let engine = Arc::clone(&engine);
        let definition = definition.clone();
        let inputs = inputs.clone();
        async move {
            let options = ExecutionOptions::default().with_metadata("trigger", json!("scheduler"));
            engine.execute(&definition, inputs, options).await?;
            Ok(())
        }
        .boxed()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, TokioClock};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn manual_scheduler() -> (Arc<ManualClock>, Scheduler) {
        let clock = Arc::new(ManualClock::new(
            DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        ));
        let scheduler = Scheduler::new(&SchedulerConfig::default(), clock.clone());
        (clock, scheduler)
    }

    fn counting(counter: Arc<AtomicU32>) -> impl Fn() -> BoxFuture<'static, Result<(), JobError>> + Send + Sync + 'static {
        move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            .boxed()
        }
    }

    /// Advance one second and run a tick, waiting for dispatched jobs.
    async fn step(clock: &ManualClock, scheduler: &Scheduler) {
        clock.advance(chrono::Duration::seconds(1));
        for handle in scheduler.tick().await {
            handle.await.unwrap();
        }
    }

    // -------------------------------------------------------------------
    // normalize_schedule
    // -------------------------------------------------------------------

    #[test]
    fn test_normalize_standard_5field_cron() {
        assert_eq!(normalize_schedule("*/5 * * * *").unwrap(), "0 */5 * * * *");
    }

    #[test]
    fn test_normalize_6field_cron_passthrough() {
        assert_eq!(normalize_schedule("30 */5 * * * *").unwrap(), "30 */5 * * * *");
    }

    #[test]
    fn test_normalize_every_n_units() {
        assert_eq!(normalize_schedule("every 5 minutes").unwrap(), "0 */5 * * * *");
        assert_eq!(normalize_schedule("every 10 seconds").unwrap(), "*/10 * * * * *");
        assert_eq!(normalize_schedule("every 2 hours").unwrap(), "0 0 */2 * * *");
        assert_eq!(normalize_schedule("every 1 minute").unwrap(), "0 */1 * * * *");
    }

    #[test]
    fn test_normalize_keywords() {
        assert_eq!(normalize_schedule("every minute").unwrap(), "0 * * * * *");
        assert_eq!(normalize_schedule("hourly").unwrap(), "0 0 * * * *");
        assert_eq!(normalize_schedule("daily").unwrap(), "0 0 0 * * *");
    }

    #[test]
    fn test_normalize_every_day_at_time() {
        assert_eq!(normalize_schedule("every day at 09:30").unwrap(), "0 30 9 * * *");
        assert!(normalize_schedule("every day at 25:00").is_err());
        assert!(normalize_schedule("every day at noon").is_err());
    }

    #[test]
    fn test_normalize_case_insensitive() {
        assert_eq!(normalize_schedule("Every 5 Minutes").unwrap(), "0 */5 * * * *");
    }

    #[test]
    fn test_normalize_rejects_garbage_and_zero() {
        assert!(normalize_schedule("run whenever").is_err());
        assert!(normalize_schedule("every 0 minutes").is_err());
        assert!(normalize_schedule("every 3 fortnights").is_err());
    }

    // -------------------------------------------------------------------
    // Scheduling
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn test_interval_job_fires_once_by_7s_and_twice_by_14s() {
        let (clock, scheduler) = manual_scheduler();
        let runs = Arc::new(AtomicU32::new(0));
        scheduler
            .schedule_interval("every5", counting(runs.clone()), Duration::from_secs(5))
            .await
            .unwrap();

        for _ in 0..6 {
            step(&clock, &scheduler).await;
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1, "by t=6s");

        for _ in 6..13 {
            step(&clock, &scheduler).await;
        }
        assert_eq!(runs.load(Ordering::SeqCst), 2, "by t=13s");
    }

    #[tokio::test]
    async fn test_initial_next_run_and_last_run() {
        let (clock, scheduler) = manual_scheduler();
        let start = clock.now();
        let id = scheduler
            .schedule_interval("job", counting(Arc::default()), Duration::from_secs(3))
            .await
            .unwrap();

        let info = scheduler.job(id).await.unwrap();
        assert_eq!(info.next_run, start + chrono::Duration::seconds(3));
        assert!(info.last_run.is_none());
        assert_eq!(info.schedule, ScheduleSpec::Interval { millis: 3_000 });

        for _ in 0..3 {
            step(&clock, &scheduler).await;
        }
        let info = scheduler.job(id).await.unwrap();
        assert_eq!(info.last_run, Some(start + chrono::Duration::seconds(3)));
        assert_eq!(info.next_run, start + chrono::Duration::seconds(6));
    }

    #[tokio::test]
    async fn test_zero_interval_rejected() {
        let (_, scheduler) = manual_scheduler();
        let err = scheduler
            .schedule_interval("bad", counting(Arc::default()), Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidSchedule(_)));
    }

    #[tokio::test]
    async fn test_sub_second_interval_keeps_its_length() {
        let (clock, scheduler) = manual_scheduler();
        let start = clock.now();
        let id = scheduler
            .schedule_interval("fast", counting(Arc::default()), Duration::from_millis(500))
            .await
            .unwrap();

        let info = scheduler.job(id).await.unwrap();
        assert_eq!(info.schedule, ScheduleSpec::Interval { millis: 500 });
        assert_eq!(info.next_run, start + chrono::Duration::milliseconds(500));
    }

    #[tokio::test]
    async fn test_cron_job_next_run_is_next_occurrence() {
        let (clock, scheduler) = manual_scheduler();
        let id = scheduler
            .schedule_cron("minutely", counting(Arc::default()), "every minute")
            .await
            .unwrap();

        let info = scheduler.job(id).await.unwrap();
        assert!(info.next_run > clock.now());
        assert!(info.next_run <= clock.now() + chrono::Duration::minutes(1));
        assert_eq!(info.next_run.timestamp() % 60, 0);
        assert!(matches!(info.schedule, ScheduleSpec::Cron { ref normalized, .. } if normalized == "0 * * * * *"));
    }

    #[tokio::test]
    async fn test_invalid_cron_rejected() {
        let (_, scheduler) = manual_scheduler();
        assert!(scheduler
            .schedule_cron("bad", counting(Arc::default()), "whenever you like")
            .await
            .is_err());
        assert!(scheduler
            .schedule_cron("bad", counting(Arc::default()), "99 * * * *")
            .await
            .is_err());
        assert!(scheduler.jobs().await.is_empty());
    }

    #[tokio::test]
    async fn test_disabled_job_does_not_fire_and_enable_recomputes() {
        let (clock, scheduler) = manual_scheduler();
        let runs = Arc::new(AtomicU32::new(0));
        let id = scheduler
            .schedule_interval("job", counting(runs.clone()), Duration::from_secs(2))
            .await
            .unwrap();

        scheduler.disable(id).await.unwrap();
        for _ in 0..5 {
            step(&clock, &scheduler).await;
        }
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        scheduler.enable(id).await.unwrap();
        let info = scheduler.job(id).await.unwrap();
        assert_eq!(info.next_run, clock.now() + chrono::Duration::seconds(2));

        step(&clock, &scheduler).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        step(&clock, &scheduler).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_remove_and_unknown_ids() {
        let (_, scheduler) = manual_scheduler();
        let id = scheduler
            .schedule_interval("job", counting(Arc::default()), Duration::from_secs(1))
            .await
            .unwrap();

        let removed = scheduler.remove(id).await.unwrap();
        assert_eq!(removed.name, "job");
        assert!(scheduler.jobs().await.is_empty());

        assert!(matches!(scheduler.remove(id).await, Err(SchedulerError::JobNotFound(_))));
        assert!(matches!(scheduler.enable(id).await, Err(SchedulerError::JobNotFound(_))));
        assert!(matches!(scheduler.disable(id).await, Err(SchedulerError::JobNotFound(_))));
    }

    #[tokio::test]
    async fn test_reschedule_keeps_id_and_handler() {
        let (clock, scheduler) = manual_scheduler();
        let runs = Arc::new(AtomicU32::new(0));
        let id = scheduler
            .schedule_interval("job", counting(runs.clone()), Duration::from_secs(60))
            .await
            .unwrap();

        let info = scheduler
            .reschedule(id, Schedule::every(Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(info.id, id);
        assert_eq!(info.next_run, clock.now() + chrono::Duration::seconds(1));

        step(&clock, &scheduler).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failing_and_panicking_jobs_are_isolated() {
        let (clock, scheduler) = manual_scheduler();
        let runs = Arc::new(AtomicU32::new(0));
        scheduler
            .schedule_interval(
                "fails",
                || async { Err(JobError::Failed("nope".into())) },
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        scheduler
            .schedule_interval(
                "panics",
                || async {
                    if true {
                        panic!("job exploded");
                    }
                    Ok(())
                },
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        scheduler
            .schedule_interval("counts", counting(runs.clone()), Duration::from_secs(1))
            .await
            .unwrap();

        for _ in 0..3 {
            step(&clock, &scheduler).await;
        }
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert_eq!(scheduler.jobs().await.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_control_loop_start_stop() {
        let scheduler = Scheduler::new(
            &SchedulerConfig { tick_interval_ms: 100 },
            Arc::new(TokioClock::new()),
        );
        let runs = Arc::new(AtomicU32::new(0));
        scheduler
            .schedule_interval("job", counting(runs.clone()), Duration::from_millis(500))
            .await
            .unwrap();

        scheduler.start().await.unwrap();
        assert!(scheduler.is_running().await);
        assert!(matches!(scheduler.start().await, Err(SchedulerError::AlreadyRunning)));

        tokio::time::sleep(Duration::from_millis(1_250)).await;
        scheduler.stop().await;
        assert!(!scheduler.is_running().await);

        let fired = runs.load(Ordering::SeqCst);
        assert_eq!(fired, 2, "fires at 0.5s and 1.0s");

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(runs.load(Ordering::SeqCst), fired, "no runs after stop");

        scheduler.stop().await;
    }
}
