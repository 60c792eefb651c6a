//! Scheduler: polls registered schedules and submits the due ones as work.
//!
//! The poll never waits on a running schedule: due schedules are started,
//! wrapped in a [`UnitOfWork`] and handed to the task sink. The unit's
//! completion hook stops the schedule, which recalculates its next fire time.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use courier_core::{CourierError, Lane, Result, SchedulerConfig};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::schedule::{Schedule, ScheduleStatistics, StopReport, TimerConfig};
use crate::telemetry::{TelemetryEvent, TracingTelemetry, record_safely};
use crate::traits::{TaskSink, Telemetry, UnitOfWork};

/// The scheduler: owns schedules and submits them when due.
pub struct Scheduler {
    config: SchedulerConfig,
    sink: Arc<dyn TaskSink>,
    telemetry: Arc<dyn Telemetry>,
    schedules: Mutex<Vec<Arc<Schedule>>>,
    /// Parent of every job token; replaced at the start of each `run`.
    jobs: Mutex<CancellationToken>,
    /// First fatal error raised by a completion hook; surfaced by the next poll.
    fatal: Arc<Mutex<Option<CourierError>>>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, sink: Arc<dyn TaskSink>) -> Self {
        Self {
            config,
            sink,
            telemetry: Arc::new(TracingTelemetry),
            schedules: Mutex::new(Vec::new()),
            jobs: Mutex::new(CancellationToken::new()),
            fatal: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn Telemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }

    fn schedules(&self) -> MutexGuard<'_, Vec<Arc<Schedule>>> {
        self.schedules.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a user schedule.
    pub fn register<F, Fut>(
        &self,
        job: F,
        timer: TimerConfig,
        name: &str,
        long_running: bool,
        priority: Option<Lane>,
    ) -> Result<Arc<Schedule>>
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let mut schedule = Schedule::new(name, timer, job).long_running(long_running);
        if let Some(priority) = priority {
            schedule = schedule.with_priority(priority);
        }
        self.add(schedule)
    }

    /// Register a runtime-owned schedule on the internal lane.
    pub fn register_internal<F, Fut>(&self, job: F, timer: TimerConfig, name: &str) -> Result<Arc<Schedule>>
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.add(Schedule::new(name, timer, job).internal())
    }

    /// Add a prebuilt schedule. Its first fire time is computed here.
    pub fn add(&self, schedule: Schedule) -> Result<Arc<Schedule>> {
        schedule.recalculate(false)?;
        let schedule = Arc::new(schedule);
        tracing::info!(
            "📅 Schedule registered: '{}' ({}) next={:?}",
            schedule.name(),
            schedule.id(),
            schedule.next_execute()
        );
        self.schedules().push(schedule.clone());
        Ok(schedule)
    }

    /// Remove a schedule. An in-flight execution is left to finish.
    pub fn unregister(&self, schedule: &Schedule) -> bool {
        let mut schedules = self.schedules();
        let len = schedules.len();
        schedules.retain(|s| s.id() != schedule.id());
        let removed = schedules.len() < len;
        if removed {
            tracing::info!("🗑️ Schedule unregistered: '{}'", schedule.name());
        }
        removed
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<Schedule>> {
        self.schedules().iter().find(|s| s.id() == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.schedules().len()
    }

    pub fn is_empty(&self) -> bool {
        self.schedules().is_empty()
    }

    pub fn statistics(&self) -> Vec<ScheduleStatistics> {
        self.schedules().iter().map(|s| s.statistics()).collect()
    }

    /// Lane a schedule's work runs on.
    pub fn priority_for(&self, schedule: &Schedule) -> Lane {
        if schedule.is_internal() {
            Lane::Internal
        } else {
            schedule.priority().unwrap_or(self.config.default_priority)
        }
    }

    pub fn poll(&self) -> Result<usize> {
        self.poll_at(Utc::now())
    }

    /// Submit every schedule due at `now`. Returns how many were submitted.
    ///
    /// Fails only with a fatal recalculation error raised since the last poll.
    pub fn poll_at(&self, now: DateTime<Utc>) -> Result<usize> {
        if let Some(err) = self.fatal.lock().unwrap_or_else(PoisonError::into_inner).take() {
            return Err(err);
        }

        let schedules = self.schedules();
        let mut submitted = 0;
        for schedule in schedules.iter() {
            if !schedule.is_due_at(now) {
                continue;
            }
            // Start on an active schedule records the skip.
            if !schedule.start() {
                tracing::debug!(
                    "⏭️ Schedule '{}' skipped (active={}, disabled={})",
                    schedule.name(),
                    schedule.is_active(),
                    schedule.is_disabled()
                );
                continue;
            }
            self.submit(schedule.clone());
            submitted += 1;
        }
        Ok(submitted)
    }

    fn submit(&self, schedule: Arc<Schedule>) {
        let token = self.jobs.lock().unwrap_or_else(PoisonError::into_inner).child_token();
        let priority = self.priority_for(&schedule);
        tracing::debug!("🔔 Schedule triggered: '{}' on {priority}", schedule.name());

        let runner = schedule.clone();
        let work = async move { runner.execute(token).await };

        let telemetry = self.telemetry.clone();
        let fatal = self.fatal.clone();
        let name = schedule.name().to_string();
        let id = schedule.id().to_string();
        let long_running = schedule.is_long_running();

        let unit = UnitOfWork::new(name, priority, work)
            .long_running(long_running)
            .with_context(id)
            .on_complete(move |result| {
                let report = match result {
                    Ok(()) => StopReport::success(),
                    Err(e) => {
                        tracing::warn!("⚠️ Schedule '{}' failed: {e}", schedule.name());
                        record_safely(
                            telemetry.as_ref(),
                            &TelemetryEvent::ScheduleException {
                                schedule_id: schedule.id(),
                                name: schedule.name().to_string(),
                                kind: e.kind().to_string(),
                                message: e.to_string(),
                            },
                        );
                        StopReport::failure().with_exception(e)
                    }
                };
                if let Err(e) = schedule.stop(report) {
                    tracing::error!("🛑 {e}");
                    fatal
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .get_or_insert(e);
                }
            });

        self.sink.submit(unit);
    }

    /// Poll on the configured interval until `shutdown` is cancelled.
    ///
    /// Returns the first fatal error. Cancelling also cancels the tokens of
    /// in-flight jobs. A stopped scheduler can be run again.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let jobs = shutdown.child_token();
        *self.jobs.lock().unwrap_or_else(PoisonError::into_inner) = jobs.clone();
        tracing::info!(
            "⏰ Scheduler started (poll every {}ms, {} schedules)",
            self.config.poll_interval_ms,
            self.len()
        );
        let mut interval = tokio::time::interval(self.config.poll_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.poll() {
                        jobs.cancel();
                        return Err(e);
                    }
                }
            }
        }

        jobs.cancel();
        tracing::info!("⏰ Scheduler stopped");
        Ok(())
    }
}
