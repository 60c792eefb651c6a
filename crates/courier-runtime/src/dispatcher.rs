//! Dispatcher: routes envelopes through local handlers, outbound
//! transmission and the unhandled-payload policy.
//!
//! Every envelope goes through the same pass:
//! validate, bump the transit count, resolve or transmit, route any
//! responses, then clean up. Cleanup always runs and always signals the
//! envelope exactly once, whatever happened before it.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use courier_core::{CourierError, DispatcherConfig, Result, UnhandledAction, UnresolvedReason};
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::envelope::{Envelope, Routing};
use crate::message::{MessageHeader, ServiceMessage};
use crate::telemetry::{TelemetryEvent, TracingTelemetry, record_safely};
use crate::traits::{CommandResolver, TaskSink, Telemetry, Transmitter, UnitOfWork};

/// Decides what to do with a payload nobody handled.
pub type UnresolvedHandler = Arc<dyn Fn(&UnresolvedRequest) -> UnhandledAction + Send + Sync>;

/// Handed to the [`UnresolvedHandler`] when an envelope cannot be delivered.
#[derive(Debug, Clone, Serialize)]
pub struct UnresolvedRequest {
    pub envelope_id: Uuid,
    pub header: MessageHeader,
    pub reason: UnresolvedReason,
    /// Action from `[dispatcher.unhandled]`.
    pub configured: UnhandledAction,
    pub can_respond: bool,
}

/// Result of one dispatcher pass over an envelope.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchOutcome {
    pub envelope_id: Uuid,
    pub success: bool,
    /// Responses routed onwards, local and outbound.
    pub responses: usize,
    pub error: Option<String>,
}

/// Counter snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatcherStats {
    pub active: usize,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub loop_prevented: u64,
    pub unresolved: u64,
    pub responses_internal: u64,
    pub responses_external: u64,
}

#[derive(Default)]
struct Counters {
    active: AtomicUsize,
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    loop_prevented: AtomicU64,
    unresolved: AtomicU64,
    responses_internal: AtomicU64,
    responses_external: AtomicU64,
}

/// Builder for [`Dispatcher`].
pub struct DispatcherBuilder {
    config: DispatcherConfig,
    resolver: Option<Arc<dyn CommandResolver>>,
    transmitter: Option<Arc<dyn Transmitter>>,
    sink: Option<Arc<dyn TaskSink>>,
    telemetry: Arc<dyn Telemetry>,
    on_unresolved: Option<UnresolvedHandler>,
}

impl DispatcherBuilder {
    pub fn resolver(mut self, resolver: Arc<dyn CommandResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn transmitter(mut self, transmitter: Arc<dyn Transmitter>) -> Self {
        self.transmitter = Some(transmitter);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn TaskSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn telemetry(mut self, telemetry: Arc<dyn Telemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Override the configured unhandled-payload action per request.
    pub fn on_unresolved<F>(mut self, handler: F) -> Self
    where
        F: Fn(&UnresolvedRequest) -> UnhandledAction + Send + Sync + 'static,
    {
        self.on_unresolved = Some(Arc::new(handler));
        self
    }

    pub fn build(self) -> Result<Dispatcher> {
        let missing = |what: &str| CourierError::Config(format!("dispatcher needs a {what}"));
        let (events, _) = broadcast::channel(256);
        Ok(Dispatcher {
            inner: Arc::new(Inner {
                resolver: self.resolver.ok_or_else(|| missing("command resolver"))?,
                transmitter: self.transmitter.ok_or_else(|| missing("transmitter"))?,
                sink: self.sink.ok_or_else(|| missing("task sink"))?,
                config: self.config,
                telemetry: self.telemetry,
                on_unresolved: self.on_unresolved,
                events,
                counters: Counters::default(),
            }),
        })
    }
}

struct Inner {
    config: DispatcherConfig,
    resolver: Arc<dyn CommandResolver>,
    transmitter: Arc<dyn Transmitter>,
    sink: Arc<dyn TaskSink>,
    telemetry: Arc<dyn Telemetry>,
    on_unresolved: Option<UnresolvedHandler>,
    events: broadcast::Sender<TelemetryEvent>,
    counters: Counters,
}

/// Cheap to clone; clones share handlers, counters and event stream.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub fn builder(config: DispatcherConfig) -> DispatcherBuilder {
        DispatcherBuilder {
            config,
            resolver: None,
            transmitter: None,
            sink: None,
            telemetry: Arc::new(TracingTelemetry),
            on_unresolved: None,
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.inner.config
    }

    /// Receive every telemetry event this dispatcher emits from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<TelemetryEvent> {
        self.inner.events.subscribe()
    }

    pub fn stats(&self) -> DispatcherStats {
        let c = &self.inner.counters;
        DispatcherStats {
            active: c.active.load(Ordering::Relaxed),
            processed: c.processed.load(Ordering::Relaxed),
            succeeded: c.succeeded.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            loop_prevented: c.loop_prevented.load(Ordering::Relaxed),
            unresolved: c.unresolved.load(Ordering::Relaxed),
            responses_internal: c.responses_internal.load(Ordering::Relaxed),
            responses_external: c.responses_external.load(Ordering::Relaxed),
        }
    }

    /// Wrap a message in an envelope using the configured trace flag and
    /// processing-time hint.
    pub fn envelope(&self, message: ServiceMessage, routing: Routing) -> Envelope {
        let mut envelope = Envelope::new(message, None, routing, self.inner.config.trace_enabled);
        envelope.set_max_processing_time(self.inner.config.max_processing_time());
        envelope
    }

    pub async fn process_message(&self, message: ServiceMessage, routing: Routing) -> DispatchOutcome {
        self.process(self.envelope(message, routing)).await
    }

    pub async fn process_payload(&self, header: MessageHeader, payload: serde_json::Value) -> DispatchOutcome {
        self.process_message(ServiceMessage::new(header, payload), Routing::Unrouted)
            .await
    }

    /// Hand an envelope to the task sink on its message's priority lane.
    pub fn submit(&self, envelope: Envelope) {
        let priority = envelope.message().priority;
        let name = format!("dispatch {}", envelope.message().header);
        let context = envelope.id().to_string();
        let dispatcher = self.clone();
        let unit = UnitOfWork::new(name, priority, async move {
            dispatcher.process(envelope).await;
            Ok(())
        })
        .with_context(context);
        self.inner.sink.submit(unit);
    }

    /// Run one full pass over an envelope. Never fails; the outcome is
    /// reported through the return value, the envelope's signal and events.
    pub async fn process(&self, mut envelope: Envelope) -> DispatchOutcome {
        let counters = &self.inner.counters;
        counters.active.fetch_add(1, Ordering::AcqRel);
        self.emit(TelemetryEvent::ExecuteBegin {
            envelope_id: envelope.id(),
            header: envelope.message().header.clone(),
            prior_transits: envelope.message().transit_count,
        });
        envelope.trace("dispatch begin");

        let mut routed = 0;
        let result = match AssertUnwindSafe(self.route(&mut envelope, &mut routed))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => Err(CourierError::Panicked(crate::panic_message(panic.as_ref()))),
        };

        let success = matches!(result, Ok(true));
        let error = result.err();
        if let Some(e) = &error {
            log_failure(&envelope, e);
            envelope.trace(format!("error: {e}"));
            self.emit(TelemetryEvent::ProcessRequestError {
                envelope_id: envelope.id(),
                header: envelope.message().header.clone(),
                kind: e.kind(),
                error: e.to_string(),
            });
        }

        envelope.complete_set();
        if envelope.has_expired() {
            tracing::warn!(
                envelope = %envelope.id(),
                "⏱️ Dispatch of {} exceeded max processing time {:?}",
                envelope.message().header,
                envelope.max_processing_time()
            );
            envelope.trace("max processing time exceeded");
        }
        envelope.signal(success);

        counters.processed.fetch_add(1, Ordering::Relaxed);
        if success {
            counters.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            counters.failed.fetch_add(1, Ordering::Relaxed);
        }
        counters.active.fetch_sub(1, Ordering::AcqRel);

        let elapsed_ms = envelope.execution_time().map_or(0, |d| d.as_millis() as u64);
        self.emit(TelemetryEvent::ExecuteComplete {
            envelope_id: envelope.id(),
            success,
            elapsed_ms,
            responses: routed,
        });

        DispatchOutcome {
            envelope_id: envelope.id(),
            success,
            responses: routed,
            error: error.map(|e| e.to_string()),
        }
    }

    async fn route(&self, envelope: &mut Envelope, routed: &mut usize) -> Result<bool> {
        if envelope.is_cancelled() {
            envelope.message_mut().status = Some("cancelled".to_string());
            return Err(CourierError::Cancelled(envelope.id().to_string()));
        }
        if !envelope.message().header.is_routable() {
            return Err(CourierError::Validation(format!(
                "envelope {} has no channel id",
                envelope.id()
            )));
        }

        let max = self.inner.config.transit_count_max;
        let count = {
            let message = envelope.message_mut();
            message.transit_count = message.transit_count.saturating_add(1);
            message.transit_count
        };
        if count > max {
            self.inner.counters.loop_prevented.fetch_add(1, Ordering::Relaxed);
            return Err(CourierError::TransitLimit {
                id: envelope.id().to_string(),
                count,
                max,
            });
        }

        if envelope.routing() == Routing::ExternalOnly {
            return self.transmit_or_unresolved(envelope).await;
        }

        let mut responses = Vec::new();
        if self.inner.resolver.execute(envelope, &mut responses).await? {
            envelope.trace(format!("handled locally, {} responses", responses.len()));
            *routed = self.route_responses(responses).await;
            return Ok(true);
        }

        if envelope.routing() == Routing::InternalOnly {
            return self.unresolved(envelope, UnresolvedReason::HandlerNotFound).await;
        }

        envelope.set_routing(Routing::ExternalOnly);
        self.transmit_or_unresolved(envelope).await
    }

    async fn transmit_or_unresolved(&self, envelope: &Envelope) -> Result<bool> {
        if self.inner.transmitter.send(envelope).await? {
            envelope.trace("transmitted");
            Ok(true)
        } else {
            self.unresolved(envelope, UnresolvedReason::NoOutboundChannel).await
        }
    }

    /// Apply the unhandled-payload policy.
    ///
    /// `Ok(false)` means a fail message was wanted but there is nowhere to
    /// send it.
    async fn unresolved(&self, envelope: &Envelope, reason: UnresolvedReason) -> Result<bool> {
        self.inner.counters.unresolved.fetch_add(1, Ordering::Relaxed);
        let header = &envelope.message().header;
        let request = UnresolvedRequest {
            envelope_id: envelope.id(),
            header: header.clone(),
            reason,
            configured: self.inner.config.unhandled.action_for(reason),
            can_respond: envelope.can_respond(),
        };
        let action = self.decide(&request);
        envelope.trace(format!("unresolved ({reason}), action {action:?}"));
        self.emit(TelemetryEvent::ProcessRequestUnresolved {
            envelope_id: envelope.id(),
            header: header.clone(),
            reason,
            action,
        });

        match action {
            UnhandledAction::Ignore => {
                tracing::debug!("Ignoring unresolved payload {header} ({reason})");
                Ok(true)
            }
            UnhandledAction::AttemptResponseFailMessage => {
                if !envelope.can_respond() {
                    tracing::warn!("📭 {header}: {reason}, and no response route for a fail message");
                    return Ok(false);
                }
                let mut reply = envelope.to_response();
                let message = reply.message_mut();
                message.status = Some("501".to_string());
                message.status_description = Some(reason.to_string());
                message.priority = message.priority.lower();
                tracing::info!("📨 {header}: {reason}, sending 501 to {}", reply.message().header);
                self.submit(reply);
                Ok(true)
            }
            UnhandledAction::Exception => Err(CourierError::Unhandled {
                reason,
                detail: header.to_string(),
            }),
        }
    }

    fn decide(&self, request: &UnresolvedRequest) -> UnhandledAction {
        let Some(handler) = &self.inner.on_unresolved else {
            return request.configured;
        };
        match std::panic::catch_unwind(AssertUnwindSafe(|| handler(request))) {
            Ok(action) => action,
            Err(panic) => {
                tracing::warn!(
                    "⚠️ Unresolved handler panicked, using {:?}: {}",
                    request.configured,
                    crate::panic_message(panic.as_ref())
                );
                request.configured
            }
        }
    }

    /// Locally resolvable responses go back through the sink as internal-only;
    /// the rest are transmitted concurrently. Returns how many were routed.
    async fn route_responses(&self, responses: Vec<Envelope>) -> usize {
        let total = responses.len();
        let mut outbound = Vec::new();

        for mut response in responses {
            let local = match response.routing() {
                Routing::InternalOnly => true,
                Routing::ExternalOnly => false,
                Routing::Unrouted => self.inner.resolver.supports(&response.message().header),
            };
            if local {
                response.set_routing(Routing::InternalOnly);
                self.inner.counters.responses_internal.fetch_add(1, Ordering::Relaxed);
                self.submit(response);
            } else {
                response.set_routing(Routing::ExternalOnly);
                outbound.push(response);
            }
        }

        let transmitter = &self.inner.transmitter;
        let results = futures::future::join_all(outbound.iter().map(|r| transmitter.send(r))).await;

        for (response, result) in outbound.iter().zip(results) {
            let header = &response.message().header;
            let sent = match result {
                Ok(true) => {
                    self.inner.counters.responses_external.fetch_add(1, Ordering::Relaxed);
                    true
                }
                Ok(false) => {
                    tracing::warn!("📭 No outbound channel for response {header}");
                    false
                }
                Err(e) => {
                    tracing::warn!("⚠️ Response {header} failed to transmit: {e}");
                    self.emit(TelemetryEvent::ProcessRequestError {
                        envelope_id: response.id(),
                        header: header.clone(),
                        kind: e.kind(),
                        error: e.to_string(),
                    });
                    false
                }
            };
            response.complete_set();
            response.signal(sent);
        }

        total
    }

    fn emit(&self, event: TelemetryEvent) {
        record_safely(self.inner.telemetry.as_ref(), &event);
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }
}

/// Loop prevention is an error; every other failed pass is a warning.
fn failure_level(error: &CourierError) -> tracing::Level {
    match error {
        CourierError::TransitLimit { .. } => tracing::Level::ERROR,
        _ => tracing::Level::WARN,
    }
}

/// Logged independently of the installed telemetry collector.
fn log_failure(envelope: &Envelope, error: &CourierError) {
    let header = &envelope.message().header;
    let transit_count = envelope.message().transit_count;
    let kind = error.kind();
    if failure_level(error) == tracing::Level::ERROR {
        tracing::error!(envelope = %envelope.id(), %header, transit_count, kind, "🔁 Loop prevented: {error}");
    } else if matches!(error, CourierError::Cancelled(_)) {
        tracing::warn!(envelope = %envelope.id(), %header, transit_count, kind, "🚫 {error}");
    } else {
        tracing::warn!(envelope = %envelope.id(), %header, transit_count, kind, "❌ Dispatch failed: {error}");
    }
}
