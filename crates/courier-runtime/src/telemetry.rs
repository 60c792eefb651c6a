//! Telemetry events and the default tracing-backed collector.

use std::panic::AssertUnwindSafe;

use courier_core::{UnhandledAction, UnresolvedReason};
use serde::Serialize;
use uuid::Uuid;

use crate::message::MessageHeader;
use crate::traits::Telemetry;

/// Structured event emitted by the dispatcher and scheduler.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TelemetryEvent {
    /// `prior_transits` is the count before this pass increments it.
    ExecuteBegin {
        envelope_id: Uuid,
        header: MessageHeader,
        prior_transits: u32,
    },
    ExecuteComplete {
        envelope_id: Uuid,
        success: bool,
        elapsed_ms: u64,
        responses: usize,
    },
    ProcessRequestError {
        envelope_id: Uuid,
        header: MessageHeader,
        kind: &'static str,
        error: String,
    },
    ProcessRequestUnresolved {
        envelope_id: Uuid,
        header: MessageHeader,
        reason: UnresolvedReason,
        action: UnhandledAction,
    },
    ScheduleException {
        schedule_id: Uuid,
        name: String,
        kind: String,
        message: String,
    },
}

/// Writes every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTelemetry;

impl Telemetry for TracingTelemetry {
    fn record(&self, event: &TelemetryEvent) {
        match event {
            TelemetryEvent::ExecuteBegin { envelope_id, header, prior_transits } => {
                tracing::debug!(envelope = %envelope_id, %header, prior_transits, "dispatch begin");
            }
            TelemetryEvent::ExecuteComplete { envelope_id, success, elapsed_ms, responses } => {
                tracing::debug!(envelope = %envelope_id, success, elapsed_ms, responses, "dispatch complete");
            }
            TelemetryEvent::ProcessRequestError { envelope_id, header, kind, error } => {
                tracing::warn!(envelope = %envelope_id, %header, kind, "⚠️ Dispatch error: {error}");
            }
            TelemetryEvent::ProcessRequestUnresolved { envelope_id, header, reason, action } => {
                tracing::info!(envelope = %envelope_id, %header, %reason, ?action, "📭 Unresolved payload");
            }
            TelemetryEvent::ScheduleException { schedule_id, name, kind, message } => {
                tracing::warn!(schedule = %schedule_id, kind = %kind, "⚠️ Schedule '{name}' failed: {message}");
            }
        }
    }
}

/// Hand an event to a collector; a panicking collector is logged and ignored.
pub(crate) fn record_safely(telemetry: &dyn Telemetry, event: &TelemetryEvent) {
    if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(|| telemetry.record(event))) {
        tracing::warn!(
            "⚠️ Telemetry collector panicked: {}",
            crate::panic_message(panic.as_ref())
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Exploding;

    impl Telemetry for Exploding {
        fn record(&self, _event: &TelemetryEvent) {
            panic!("collector down");
        }
    }

    #[test]
    fn test_panicking_collector_is_contained() {
        let event = TelemetryEvent::ExecuteComplete {
            envelope_id: Uuid::new_v4(),
            success: true,
            elapsed_ms: 1,
            responses: 0,
        };
        record_safely(&Exploding, &event);
        record_safely(&TracingTelemetry, &event);
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let event = TelemetryEvent::ProcessRequestUnresolved {
            envelope_id: Uuid::nil(),
            header: MessageHeader::new("a", "b", "c"),
            reason: UnresolvedReason::HandlerNotFound,
            action: UnhandledAction::Ignore,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "process_request_unresolved");
        assert_eq!(json["reason"], "handler_not_found");
        assert_eq!(json["action"], "ignore");
    }
}
