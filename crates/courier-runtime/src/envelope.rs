//! Envelope: one unit of dispatcher work.
//!
//! Wraps a [`ServiceMessage`] with routing restrictions, a cancellation
//! token and a one-shot release callback that tells the producer (listener,
//! scheduler or direct caller) how processing ended.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Mutex, OnceLock, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::message::ServiceMessage;

/// Called once with `(success, envelope_id)` when processing ends.
pub type ReleaseCallback = Box<dyn FnOnce(bool, Uuid) -> anyhow::Result<()> + Send>;

/// Where an envelope is allowed to go.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Routing {
    /// Local handlers first, outbound if none match.
    #[default]
    Unrouted,
    /// Local handlers only.
    InternalOnly,
    /// Outbound transmission only.
    ExternalOnly,
}

impl Routing {
    pub fn allows_internal(self) -> bool {
        !matches!(self, Routing::ExternalOnly)
    }

    pub fn allows_external(self) -> bool {
        !matches!(self, Routing::InternalOnly)
    }
}

/// Tri-state outcome of [`Envelope::signal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalResult {
    Unset,
    Success,
    Failure,
}

impl SignalResult {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => SignalResult::Success,
            2 => SignalResult::Failure,
            _ => SignalResult::Unset,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            SignalResult::Unset => 0,
            SignalResult::Success => 1,
            SignalResult::Failure => 2,
        }
    }
}

/// One line of an envelope's trace log.
#[derive(Debug, Clone)]
pub struct TraceEntry {
    pub at: DateTime<Utc>,
    /// Time since the envelope was created.
    pub elapsed: Duration,
    pub message: String,
}

pub struct Envelope {
    id: Uuid,
    message: ServiceMessage,
    created_at: DateTime<Utc>,
    created_tick: Instant,
    cancel: CancellationToken,
    routing: Routing,
    release: Mutex<Option<ReleaseCallback>>,
    signaled: AtomicBool,
    result: AtomicU8,
    execution_time: OnceLock<Duration>,
    max_processing_time: Option<Duration>,
    trace_enabled: bool,
    trace: Mutex<Option<Vec<TraceEntry>>>,
}

impl Envelope {
    pub fn new(
        message: ServiceMessage,
        release: Option<ReleaseCallback>,
        routing: Routing,
        trace_enabled: bool,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            message,
            created_at: Utc::now(),
            created_tick: Instant::now(),
            cancel: CancellationToken::new(),
            routing,
            release: Mutex::new(release),
            signaled: AtomicBool::new(false),
            result: AtomicU8::new(SignalResult::Unset.as_u8()),
            execution_time: OnceLock::new(),
            max_processing_time: None,
            trace_enabled,
            trace: Mutex::new(None),
        }
    }

    /// Unrouted envelope with no release callback and tracing off.
    pub fn from_message(message: ServiceMessage) -> Self {
        Self::new(message, None, Routing::Unrouted, false)
    }

    /// Attach a release callback.
    pub fn with_release<F>(self, release: F) -> Self
    where
        F: FnOnce(bool, Uuid) -> anyhow::Result<()> + Send + 'static,
    {
        *self.release.lock().unwrap_or_else(PoisonError::into_inner) = Some(Box::new(release));
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_max_processing_time(mut self, limit: Duration) -> Self {
        self.max_processing_time = Some(limit);
        self
    }

    /// Move to a new routing restriction.
    pub fn reroute(mut self, routing: Routing) -> Self {
        self.set_routing(routing);
        self
    }

    pub(crate) fn set_routing(&mut self, routing: Routing) {
        if self.routing != routing {
            self.trace(format!("routing {:?} -> {:?}", self.routing, routing));
            self.routing = routing;
        }
    }

    pub(crate) fn set_max_processing_time(&mut self, limit: Option<Duration>) {
        self.max_processing_time = limit;
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn message(&self) -> &ServiceMessage {
        &self.message
    }

    pub(crate) fn message_mut(&mut self) -> &mut ServiceMessage {
        &mut self.message
    }

    pub fn routing(&self) -> Routing {
        self.routing
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Time since creation.
    pub fn age(&self) -> Duration {
        self.created_tick.elapsed()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn max_processing_time(&self) -> Option<Duration> {
        self.max_processing_time
    }

    /// Monotonic deadline derived from the processing-time hint.
    pub fn deadline(&self) -> Option<Instant> {
        self.max_processing_time.map(|limit| self.created_tick + limit)
    }

    /// Whether the processing-time hint has been exceeded. Reporting only.
    pub fn has_expired(&self) -> bool {
        self.deadline().is_some_and(|d| Instant::now() >= d)
    }

    /// Whether a future [`signal`](Self::signal) would still do anything.
    pub fn can_signal(&self) -> bool {
        !self.signaled.load(Ordering::Acquire)
    }

    pub fn signal_result(&self) -> SignalResult {
        SignalResult::from_u8(self.result.load(Ordering::Acquire))
    }

    /// Report the outcome to the producer. Only the first call has any effect.
    ///
    /// The release callback is taken out of its slot before it runs, so it can
    /// never run twice. Errors and panics from the callback are recorded in the
    /// trace log and logged; they never reach the caller.
    pub fn signal(&self, success: bool) {
        if self
            .signaled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let outcome = if success { SignalResult::Success } else { SignalResult::Failure };
        self.result.store(outcome.as_u8(), Ordering::Release);

        let release = self.release.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(release) = release else {
            return;
        };

        let id = self.id;
        match std::panic::catch_unwind(AssertUnwindSafe(|| release(success, id))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(envelope = %id, "⚠️ Release callback failed: {e}");
                self.trace(format!("release callback failed: {e}"));
            }
            Err(panic) => {
                let msg = crate::panic_message(panic.as_ref());
                tracing::warn!(envelope = %id, "⚠️ Release callback panicked: {msg}");
                self.trace(format!("release callback panicked: {msg}"));
            }
        }
    }

    /// Record the execution time. First caller wins; returns whether this call set it.
    pub fn complete_set(&self) -> bool {
        self.execution_time.set(self.created_tick.elapsed()).is_ok()
    }

    pub fn execution_time(&self) -> Option<Duration> {
        self.execution_time.get().copied()
    }

    pub fn trace_enabled(&self) -> bool {
        self.trace_enabled
    }

    /// Append to the trace log. No-op unless tracing is enabled.
    pub fn trace(&self, message: impl Into<String>) {
        if !self.trace_enabled {
            return;
        }
        let entry = TraceEntry {
            at: Utc::now(),
            elapsed: self.created_tick.elapsed(),
            message: message.into(),
        };
        self.trace
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_insert_with(Vec::new)
            .push(entry);
    }

    /// Snapshot of the trace log.
    pub fn trace_log(&self) -> Vec<TraceEntry> {
        self.trace
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or_default()
    }

    /// A new envelope around a deep copy of the message, with a fresh id,
    /// a fresh trace log and its own release callback.
    pub fn clone_with(&self, release: Option<ReleaseCallback>) -> Envelope {
        let mut copy = Envelope::new(self.message.clone(), release, self.routing, self.trace_enabled);
        copy.cancel = self.cancel.child_token();
        copy.max_processing_time = self.max_processing_time;
        copy.trace(format!("cloned from {}", self.id));
        self.trace(format!("cloned to {}", copy.id));
        copy
    }

    /// True iff the message carries a response channel.
    pub fn can_respond(&self) -> bool {
        self.message.has_response_route()
    }

    /// Outbound envelope addressed to this message's response route.
    ///
    /// Check [`can_respond`](Self::can_respond) first: without a response
    /// channel the result has an empty header and fails dispatcher validation.
    pub fn to_response(&self) -> Envelope {
        let mut reply = Envelope::new(self.message.to_response(), None, Routing::Unrouted, self.trace_enabled);
        reply.cancel = self.cancel.child_token();
        reply.max_processing_time = self.max_processing_time;
        reply.trace(format!("response to {}", self.id));
        self.trace(format!("responded with {}", reply.id));
        reply
    }
}

impl std::fmt::Debug for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Envelope")
            .field("id", &self.id)
            .field("header", &self.message.header)
            .field("routing", &self.routing)
            .field("transit_count", &self.message.transit_count)
            .field("signal_result", &self.signal_result())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageHeader;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Barrier};

    fn message() -> ServiceMessage {
        ServiceMessage::new(MessageHeader::new("orders", "order", "create"), serde_json::json!({}))
    }

    #[test]
    fn test_signal_fires_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let env = Envelope::from_message(message()).with_release(move |success, _| {
            assert!(success);
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        assert!(env.can_signal());
        env.signal(true);
        env.signal(false);
        env.signal(true);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!env.can_signal());
        assert_eq!(env.signal_result(), SignalResult::Success);
    }

    #[test]
    fn test_signal_without_callback_sets_result() {
        let env = Envelope::from_message(message());
        assert_eq!(env.signal_result(), SignalResult::Unset);
        env.signal(false);
        assert_eq!(env.signal_result(), SignalResult::Failure);
        assert!(!env.can_signal());
    }

    #[test]
    fn test_callback_error_is_traced_not_raised() {
        let env = Envelope::new(message(), None, Routing::Unrouted, true)
            .with_release(|_, _| Err(anyhow::anyhow!("listener gone")));
        env.signal(true);

        let log = env.trace_log();
        assert!(log.iter().any(|e| e.message.contains("listener gone")));
        assert_eq!(env.signal_result(), SignalResult::Success);
    }

    #[test]
    fn test_callback_panic_is_contained() {
        let env = Envelope::new(message(), None, Routing::Unrouted, true)
            .with_release(|_, _| panic!("bad handler"));
        env.signal(false);

        let log = env.trace_log();
        assert!(log.iter().any(|e| e.message.contains("bad handler")));
        assert_eq!(env.signal_result(), SignalResult::Failure);
    }

    #[test]
    fn test_racing_signals_invoke_once() {
        for _ in 0..50 {
            let calls = Arc::new(AtomicUsize::new(0));
            let winner = Arc::new(Mutex::new(None));
            let (c, w) = (calls.clone(), winner.clone());
            let env = Arc::new(Envelope::from_message(message()).with_release(move |success, _| {
                c.fetch_add(1, Ordering::SeqCst);
                *w.lock().unwrap() = Some(success);
                Ok(())
            }));

            let barrier = Arc::new(Barrier::new(2));
            let handles: Vec<_> = [true, false]
                .into_iter()
                .map(|flag| {
                    let env = env.clone();
                    let barrier = barrier.clone();
                    std::thread::spawn(move || {
                        barrier.wait();
                        env.signal(flag);
                    })
                })
                .collect();
            for h in handles {
                h.join().unwrap();
            }

            assert_eq!(calls.load(Ordering::SeqCst), 1);
            let won = winner.lock().unwrap().unwrap();
            let expected = if won { SignalResult::Success } else { SignalResult::Failure };
            assert_eq!(env.signal_result(), expected);
        }
    }

    #[test]
    fn test_complete_set_first_caller_wins() {
        let env = Envelope::from_message(message());
        assert!(env.execution_time().is_none());
        assert!(env.complete_set());
        let first = env.execution_time().unwrap();
        std::thread::sleep(Duration::from_millis(2));
        assert!(!env.complete_set());
        assert_eq!(env.execution_time().unwrap(), first);
    }

    #[test]
    fn test_to_response_uses_response_fields() {
        let msg = message().with_response(MessageHeader::new("replies", "order", "created"));
        let env = Envelope::from_message(msg);
        assert!(env.can_respond());

        let reply = env.to_response();
        assert_eq!(reply.message().header.channel_id, "replies");
        assert_eq!(reply.message().header.message_type, "order");
        assert_eq!(reply.message().header.action_type, "created");
        assert_eq!(reply.message().correlation_id, Some(env.message().id));
        assert_ne!(reply.id(), env.id());
    }

    #[test]
    fn test_cannot_respond_without_channel() {
        let env = Envelope::from_message(message());
        assert!(!env.can_respond());
        assert!(!env.to_response().message().header.is_routable());
    }

    #[test]
    fn test_clone_cross_references() {
        let env = Envelope::new(message(), None, Routing::InternalOnly, true);
        let copy = env.clone_with(None);

        assert_ne!(copy.id(), env.id());
        assert_eq!(copy.message().id, env.message().id);
        assert_eq!(copy.routing(), Routing::InternalOnly);
        assert!(env.trace_log().iter().any(|e| e.message == format!("cloned to {}", copy.id())));
        assert!(copy.trace_log().iter().any(|e| e.message == format!("cloned from {}", env.id())));
    }

    #[test]
    fn test_clone_follows_parent_cancellation() {
        let env = Envelope::from_message(message());
        let copy = env.clone_with(None);
        env.cancellation().cancel();
        assert!(copy.is_cancelled());
    }

    #[test]
    fn test_trace_disabled_records_nothing() {
        let env = Envelope::from_message(message());
        env.trace("hello");
        assert!(env.trace_log().is_empty());
    }

    #[test]
    fn test_expiry_hint() {
        let env = Envelope::from_message(message()).with_max_processing_time(Duration::ZERO);
        assert!(env.has_expired());
        let env = Envelope::from_message(message()).with_max_processing_time(Duration::from_secs(3600));
        assert!(!env.has_expired());
        assert!(!Envelope::from_message(message()).has_expired());
    }

    #[test]
    fn test_routing_permissions() {
        assert!(Routing::Unrouted.allows_internal() && Routing::Unrouted.allows_external());
        assert!(Routing::InternalOnly.allows_internal() && !Routing::InternalOnly.allows_external());
        assert!(!Routing::ExternalOnly.allows_internal() && Routing::ExternalOnly.allows_external());
    }
}
