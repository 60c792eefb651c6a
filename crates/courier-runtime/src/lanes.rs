//! Lane-based task sink: 4 priority lanes with per-lane concurrency limits.
//!
//! Units of work queue in their lane; whenever a slot frees up the highest
//! priority lane with queued work is drained first. Long-running units are
//! spawned immediately and never occupy a lane slot, so they cannot starve
//! short work.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use courier_core::{CourierError, Lane, LaneConfig, Result};
use futures::FutureExt;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::Notify;

use crate::traits::{TaskSink, UnitOfWork};

/// Run a unit to completion, turning a panic into [`CourierError::Panicked`],
/// then fire its completion hook. Returns whether the work succeeded.
pub async fn run_unit(unit: UnitOfWork) -> bool {
    let UnitOfWork { name, work, on_complete, .. } = unit;

    let result = match AssertUnwindSafe(work).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(CourierError::Panicked(format!(
            "{name}: {}",
            crate::panic_message(panic.as_ref())
        ))),
    };

    if let Err(e) = &result {
        tracing::debug!("Task '{name}' finished with error: {e}");
    }

    if let Some(hook) = on_complete {
        if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(|| hook(&result))) {
            tracing::warn!(
                "⚠️ Completion hook for '{name}' panicked: {}",
                crate::panic_message(panic.as_ref())
            );
        }
    }

    result.is_ok()
}

/// Per-lane state.
struct LaneState {
    queue: VecDeque<UnitOfWork>,
    active: usize,
    max_concurrent: usize,
    total_processed: u64,
    total_failed: u64,
}

impl LaneState {
    fn new(max_concurrent: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            active: 0,
            max_concurrent: max_concurrent.max(1),
            total_processed: 0,
            total_failed: 0,
        }
    }

    fn dequeue(&mut self) -> Option<UnitOfWork> {
        if self.active < self.max_concurrent {
            let unit = self.queue.pop_front()?;
            self.active += 1;
            Some(unit)
        } else {
            None
        }
    }

    fn complete(&mut self, ok: bool) {
        self.active = self.active.saturating_sub(1);
        self.total_processed += 1;
        if !ok {
            self.total_failed += 1;
        }
    }
}

struct Inner {
    lanes: [Mutex<LaneState>; 4],
    long_running: AtomicUsize,
    /// Pinged whenever a unit finishes.
    finished: Notify,
    handle: Handle,
}

impl Inner {
    fn lane(&self, lane: Lane) -> std::sync::MutexGuard<'_, LaneState> {
        self.lanes[lane.priority() as usize]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-memory [`TaskSink`] running work on the tokio runtime it was created in.
#[derive(Clone)]
pub struct LaneSink {
    inner: Arc<Inner>,
}

impl LaneSink {
    /// Create a sink on the current tokio runtime.
    pub fn new(config: &LaneConfig) -> Result<Self> {
        let handle = Handle::try_current()
            .map_err(|e| CourierError::Config(format!("LaneSink needs a tokio runtime: {e}")))?;
        Ok(Self::with_handle(config, handle))
    }

    /// Create a sink that spawns onto the given runtime.
    pub fn with_handle(config: &LaneConfig, handle: Handle) -> Self {
        let lanes = Lane::ALL.map(|lane| Mutex::new(LaneState::new(config.max_concurrent(lane))));
        Self {
            inner: Arc::new(Inner {
                lanes,
                long_running: AtomicUsize::new(0),
                finished: Notify::new(),
                handle,
            }),
        }
    }

    /// Start as much queued work as the lane limits allow, highest priority first.
    fn pump(&self) {
        for lane in Lane::ALL {
            loop {
                let unit = self.inner.lane(lane).dequeue();
                let Some(unit) = unit else { break };
                let sink = self.clone();
                self.inner.handle.spawn(async move {
                    let ok = run_unit(unit).await;
                    sink.inner.lane(lane).complete(ok);
                    sink.pump();
                    sink.inner.finished.notify_waiters();
                });
            }
        }
    }

    fn spawn_long_running(&self, unit: UnitOfWork) {
        self.inner.long_running.fetch_add(1, Ordering::SeqCst);
        let sink = self.clone();
        self.inner.handle.spawn(async move {
            run_unit(unit).await;
            sink.inner.long_running.fetch_sub(1, Ordering::SeqCst);
            sink.inner.finished.notify_waiters();
        });
    }

    /// Get statistics for all lanes.
    pub fn stats(&self) -> Vec<LaneStats> {
        Lane::ALL
            .iter()
            .map(|&lane| {
                let state = self.inner.lane(lane);
                LaneStats {
                    lane,
                    queued: state.queue.len(),
                    active: state.active,
                    max_concurrent: state.max_concurrent,
                    total_processed: state.total_processed,
                    total_failed: state.total_failed,
                }
            })
            .collect()
    }

    /// Total queued + running units, long-running ones included.
    pub fn total_pending(&self) -> usize {
        let lanes: usize = Lane::ALL
            .iter()
            .map(|&lane| {
                let state = self.inner.lane(lane);
                state.queue.len() + state.active
            })
            .sum();
        lanes + self.inner.long_running.load(Ordering::SeqCst)
    }

    /// Wait until nothing is queued or running.
    pub async fn wait_idle(&self) {
        loop {
            // Register before checking so a completion in between is not missed.
            let mut finished = std::pin::pin!(self.inner.finished.notified());
            finished.as_mut().enable();
            if self.total_pending() == 0 {
                return;
            }
            finished.await;
        }
    }
}

impl TaskSink for LaneSink {
    fn submit(&self, unit: UnitOfWork) {
        tracing::debug!(
            "📥 Lane[{}] submit: {} ({})",
            unit.priority,
            unit.name,
            unit.context.as_deref().unwrap_or("-")
        );
        if unit.long_running {
            self.spawn_long_running(unit);
            return;
        }
        self.inner.lane(unit.priority).queue.push_back(unit);
        self.pump();
    }
}

/// Statistics for a single lane.
#[derive(Debug, Clone, Serialize)]
pub struct LaneStats {
    pub lane: Lane,
    pub queued: usize,
    pub active: usize,
    pub max_concurrent: usize,
    pub total_processed: u64,
    pub total_failed: u64,
}
