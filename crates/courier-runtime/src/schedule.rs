//! Schedule: one timer-driven job and its execution state.
//!
//! A schedule moves Idle → Active on [`Schedule::start`] and back to Idle on
//! [`Schedule::stop`]. Only the poll-driven start/stop pair touches the active
//! flag, so a schedule never runs twice at once.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use courier_core::{CourierError, Lane, RecalculateError, Result};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// The async body a schedule runs each time it fires.
pub type Job = Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// When a schedule fires.
///
/// Precedence: one-shot UTC time, then initial delay, then repeat interval.
/// The first two are consumed once used; the interval is kept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerConfig {
    pub utc_time: Option<DateTime<Utc>>,
    pub initial_delay: Option<Duration>,
    pub interval: Option<Duration>,
}

impl TimerConfig {
    /// No timer: fire once on the first poll, then never again.
    pub fn none() -> Self {
        Self::default()
    }

    /// Fire once at a fixed time.
    pub fn at(time: DateTime<Utc>) -> Self {
        Self { utc_time: Some(time), ..Self::default() }
    }

    /// Fire every `interval`, starting one interval from now.
    pub fn every(interval: Duration) -> Self {
        Self { interval: Some(interval), ..Self::default() }
    }

    /// Fire after `initial_delay`, then every `interval`.
    pub fn delayed(initial_delay: Duration, interval: Duration) -> Self {
        Self {
            initial_delay: Some(initial_delay),
            interval: Some(interval),
            ..Self::default()
        }
    }

    pub fn with_utc_time(mut self, time: DateTime<Utc>) -> Self {
        self.utc_time = Some(time);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.utc_time.is_none() && self.initial_delay.is_none() && self.interval.is_none()
    }

    /// Next fire time, and the timer left over once it has been used.
    pub fn next_fire(
        &self,
        now: DateTime<Utc>,
    ) -> std::result::Result<(Option<DateTime<Utc>>, TimerConfig), String> {
        match (self.utc_time, self.initial_delay, self.interval) {
            (Some(at), _, interval) => Ok((Some(at), TimerConfig { interval, ..Self::default() })),
            (None, Some(delay), interval) => Ok((
                Some(offset(now, delay)?),
                TimerConfig { interval, ..Self::default() },
            )),
            (None, None, Some(every)) => Ok((Some(offset(now, every)?), *self)),
            (None, None, None) => Ok((None, *self)),
        }
    }
}

fn offset(now: DateTime<Utc>, by: Duration) -> std::result::Result<DateTime<Utc>, String> {
    let delta = chrono::Duration::from_std(by).map_err(|e| format!("duration {by:?} out of range: {e}"))?;
    now.checked_add_signed(delta)
        .ok_or_else(|| format!("{now} + {by:?} overflows"))
}

/// Lightweight record of the last failure. Holds text only, never the error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleException {
    pub message: String,
    pub kind: String,
    pub at: DateTime<Utc>,
}

impl ScheduleException {
    pub fn from_error(err: &CourierError, at: DateTime<Utc>) -> Self {
        Self {
            message: err.to_string(),
            kind: err.kind().to_string(),
            at,
        }
    }
}

/// Arguments to [`Schedule::stop`].
#[derive(Debug, Clone)]
pub struct StopReport {
    pub success: bool,
    pub recalculate: bool,
    pub exception: Option<ScheduleException>,
    /// Reference time for the recalculation.
    pub at: DateTime<Utc>,
}

impl StopReport {
    pub fn success() -> Self {
        Self {
            success: true,
            recalculate: true,
            exception: None,
            at: Utc::now(),
        }
    }

    pub fn failure() -> Self {
        Self { success: false, ..Self::success() }
    }

    /// Record `err` as the schedule's last exception.
    pub fn with_exception(mut self, err: &CourierError) -> Self {
        self.exception = Some(ScheduleException::from_error(err, self.at));
        self
    }

    pub fn without_recalculate(mut self) -> Self {
        self.recalculate = false;
        self
    }

    pub fn at(mut self, at: DateTime<Utc>) -> Self {
        if let Some(ex) = self.exception.as_mut() {
            ex.at = at;
        }
        self.at = at;
        self
    }
}

struct ScheduleState {
    timer: TimerConfig,
    next_execute: Option<DateTime<Utc>>,
    last_execute: Option<DateTime<Utc>>,
    active_since: Option<Instant>,
    last_exception: Option<ScheduleException>,
}

pub struct Schedule {
    id: Uuid,
    name: String,
    job: Job,
    long_running: bool,
    internal: bool,
    priority: Option<Lane>,
    active: AtomicBool,
    disabled: AtomicBool,
    enabled: AtomicBool,
    execution_count: AtomicU64,
    active_skip_count: AtomicU64,
    error_count: AtomicU64,
    state: Mutex<ScheduleState>,
}

impl Schedule {
    pub fn new<F, Fut>(name: &str, timer: TimerConfig, job: F) -> Self
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            job: Arc::new(move |token| job(token).boxed()),
            long_running: false,
            internal: false,
            priority: None,
            active: AtomicBool::new(false),
            disabled: AtomicBool::new(false),
            enabled: AtomicBool::new(true),
            execution_count: AtomicU64::new(0),
            active_skip_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            state: Mutex::new(ScheduleState {
                timer,
                next_execute: None,
                last_execute: None,
                active_since: None,
                last_exception: None,
            }),
        }
    }

    pub fn long_running(mut self, long_running: bool) -> Self {
        self.long_running = long_running;
        self
    }

    pub fn with_priority(mut self, priority: Lane) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Mark as a runtime-owned schedule; it runs on the internal lane.
    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    fn state(&self) -> MutexGuard<'_, ScheduleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_long_running(&self) -> bool {
        self.long_running
    }

    pub fn is_internal(&self) -> bool {
        self.internal
    }

    pub fn priority(&self) -> Option<Lane> {
        self.priority
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }

    pub fn disable(&self) {
        self.disabled.store(true, Ordering::Release);
    }

    pub fn enable(&self) {
        self.disabled.store(false, Ordering::Release);
    }

    pub fn execution_count(&self) -> u64 {
        self.execution_count.load(Ordering::Acquire)
    }

    pub fn active_skip_count(&self) -> u64 {
        self.active_skip_count.load(Ordering::Acquire)
    }

    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Acquire)
    }

    pub fn timer(&self) -> TimerConfig {
        self.state().timer
    }

    pub fn next_execute(&self) -> Option<DateTime<Utc>> {
        self.state().next_execute
    }

    pub fn last_execute(&self) -> Option<DateTime<Utc>> {
        self.state().last_execute
    }

    pub fn last_exception(&self) -> Option<ScheduleException> {
        self.state().last_exception.clone()
    }

    /// Claim the schedule for one execution.
    ///
    /// Returns false when disabled, or when already active, in which case the
    /// skip is counted and the execution count is left alone.
    pub fn start(&self) -> bool {
        if self.is_disabled() {
            return false;
        }
        if self
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.active_skip_count.fetch_add(1, Ordering::AcqRel);
            return false;
        }
        self.execution_count.fetch_add(1, Ordering::AcqRel);
        self.state().last_exception = None;
        true
    }

    /// Run the job body. Only valid between a successful `start` and `stop`.
    ///
    /// Job errors and panics come back as [`CourierError::Job`] and
    /// [`CourierError::Panicked`].
    pub async fn execute(&self, token: CancellationToken) -> Result<()> {
        if !self.is_active() {
            return Err(CourierError::Schedule(format!(
                "schedule '{}' executed without start",
                self.name
            )));
        }

        {
            let mut state = self.state();
            state.last_execute = Some(Utc::now());
            state.active_since = Some(Instant::now());
        }

        let outcome = AssertUnwindSafe((self.job)(token)).catch_unwind().await;
        self.state().active_since = None;

        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(CourierError::Job(format!("{e:#}"))),
            Err(panic) => Err(CourierError::Panicked(crate::panic_message(panic.as_ref()))),
        }
    }

    /// Release the schedule after an execution.
    ///
    /// No-op unless active. The active flag is cleared last, even when the
    /// recalculation fails; that failure is returned and is fatal.
    pub fn stop(&self, report: StopReport) -> Result<()> {
        if !self.is_active() {
            return Ok(());
        }
        if !report.success {
            self.error_count.fetch_add(1, Ordering::AcqRel);
        }

        let result = {
            let mut state = self.state();
            if let Some(exception) = report.exception {
                state.last_exception = Some(exception);
            }
            if report.recalculate {
                self.recalculate_locked(&mut state, report.at, false)
            } else {
                Ok(())
            }
        };

        self.active.store(false, Ordering::Release);
        result
    }

    pub fn recalculate(&self, force: bool) -> Result<()> {
        self.recalculate_at(Utc::now(), force)
    }

    /// Compute the next execute time relative to `now`. Skipped when the
    /// current next time is still in the future, unless `force`.
    pub fn recalculate_at(&self, now: DateTime<Utc>, force: bool) -> Result<()> {
        let mut state = self.state();
        self.recalculate_locked(&mut state, now, force)
    }

    fn recalculate_locked(
        &self,
        state: &mut ScheduleState,
        now: DateTime<Utc>,
        force: bool,
    ) -> Result<()> {
        if !force && state.next_execute.is_some_and(|next| next > now) {
            return Ok(());
        }

        match state.timer.next_fire(now) {
            Ok((next, timer)) => {
                state.next_execute = next;
                state.timer = timer;
                Ok(())
            }
            Err(reason) => Err(RecalculateError {
                schedule_kind: if self.internal { "internal" } else { "user" },
                name: self.name.clone(),
                id: self.id.to_string(),
                active: self.is_active(),
                utc_time: state.timer.utc_time,
                initial_delay: state.timer.initial_delay,
                interval: state.timer.interval,
                reason,
            }
            .into()),
        }
    }

    pub fn should_execute(&self) -> bool {
        self.should_execute_at(Utc::now())
    }

    /// Whether the schedule is due at `now` and idle.
    pub fn should_execute_at(&self, now: DateTime<Utc>) -> bool {
        !self.is_active() && self.is_due_at(now)
    }

    /// Timing half of [`should_execute_at`](Self::should_execute_at); ignores
    /// the active flag.
    ///
    /// A schedule that has never run and has no timer at all is always due.
    pub fn is_due_at(&self, now: DateTime<Utc>) -> bool {
        let state = self.state();
        if self.execution_count() == 0 && state.timer.is_empty() && state.next_execute.is_none() {
            return true;
        }
        !self.is_disabled()
            && self.enabled.load(Ordering::Acquire)
            && state.next_execute.is_some_and(|next| next <= now)
    }

    /// Set the enable flag; enabling forces a recalculation.
    pub fn set_should_execute(&self, value: bool) -> Result<()> {
        self.enabled.store(value, Ordering::Release);
        if value {
            self.recalculate(true)?;
        }
        Ok(())
    }

    /// Replace the timer and force a recalculation.
    pub fn set_timer(&self, timer: TimerConfig) -> Result<()> {
        let mut state = self.state();
        state.timer = timer;
        self.recalculate_locked(&mut state, Utc::now(), true)
    }

    pub fn statistics(&self) -> ScheduleStatistics {
        let state = self.state();
        ScheduleStatistics {
            id: self.id,
            name: self.name.clone(),
            internal: self.internal,
            priority: self.priority,
            long_running: self.long_running,
            active: self.is_active(),
            disabled: self.is_disabled(),
            execution_count: self.execution_count(),
            active_skip_count: self.active_skip_count(),
            error_count: self.error_count(),
            last_execute: state.last_execute,
            next_execute: state.next_execute,
            active_for_ms: state.active_since.map(|since| since.elapsed().as_millis() as u64),
            timer: state.timer,
            last_exception: state.last_exception.clone(),
        }
    }
}

impl std::fmt::Debug for Schedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Schedule")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("active", &self.is_active())
            .field("execution_count", &self.execution_count())
            .finish()
    }
}

/// Point-in-time view of a schedule.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleStatistics {
    pub id: Uuid,
    pub name: String,
    pub internal: bool,
    pub priority: Option<Lane>,
    pub long_running: bool,
    pub active: bool,
    pub disabled: bool,
    pub execution_count: u64,
    pub active_skip_count: u64,
    pub error_count: u64,
    pub last_execute: Option<DateTime<Utc>>,
    pub next_execute: Option<DateTime<Utc>>,
    pub active_for_ms: Option<u64>,
    pub timer: TimerConfig,
    pub last_exception: Option<ScheduleException>,
}
