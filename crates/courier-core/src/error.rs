//! Courier error types.

use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

use crate::types::UnresolvedReason;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, CourierError>;

/// Every failure the dispatcher and scheduler can observe.
///
/// Only [`CourierError::Recalculate`] is treated as fatal; everything else is
/// caught per item and surfaced through signals and telemetry.
#[derive(Debug, Error)]
pub enum CourierError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Envelope {0} was cancelled")]
    Cancelled(String),

    #[error("Transit limit exceeded for envelope {id}: pass {count} > max {max}")]
    TransitLimit { id: String, count: u32, max: u32 },

    #[error("Unhandled payload ({reason}): {detail}")]
    Unhandled {
        reason: UnresolvedReason,
        detail: String,
    },

    #[error("Handler error: {0}")]
    Handler(String),

    #[error("Transmit error: {0}")]
    Transmit(String),

    #[error("Job failed: {0}")]
    Job(String),

    #[error("Task panicked: {0}")]
    Panicked(String),

    #[error("Schedule error: {0}")]
    Schedule(String),

    #[error(transparent)]
    Recalculate(Box<RecalculateError>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CourierError {
    /// Short type name used by lightweight exception holders.
    pub fn kind(&self) -> &'static str {
        match self {
            CourierError::Config(_) => "config",
            CourierError::Validation(_) => "validation",
            CourierError::Cancelled(_) => "cancelled",
            CourierError::TransitLimit { .. } => "transit_limit",
            CourierError::Unhandled { .. } => "unhandled",
            CourierError::Handler(_) => "handler",
            CourierError::Transmit(_) => "transmit",
            CourierError::Job(_) => "job",
            CourierError::Panicked(_) => "panicked",
            CourierError::Schedule(_) => "schedule",
            CourierError::Recalculate(_) => "recalculate",
            CourierError::Io(_) => "io",
        }
    }

    /// Whether this error must stop the poll loop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CourierError::Recalculate(_))
    }
}

impl From<RecalculateError> for CourierError {
    fn from(e: RecalculateError) -> Self {
        CourierError::Recalculate(Box::new(e))
    }
}

/// Failure to compute a schedule's next fire time, with the full timer
/// context needed to diagnose the misconfiguration.
#[derive(Debug, Clone, Error)]
#[error(
    "Failed to recalculate {schedule_kind} schedule '{name}' ({id}): {reason} \
     [active={active}, utc_time={utc_time:?}, initial_delay={initial_delay:?}, interval={interval:?}]"
)]
pub struct RecalculateError {
    pub schedule_kind: &'static str,
    pub name: String,
    pub id: String,
    pub active: bool,
    pub utc_time: Option<DateTime<Utc>>,
    pub initial_delay: Option<Duration>,
    pub interval: Option<Duration>,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_recalculate_is_fatal() {
        let err: CourierError = RecalculateError {
            schedule_kind: "user",
            name: "nightly".into(),
            id: "abc".into(),
            active: false,
            utc_time: None,
            initial_delay: None,
            interval: Some(Duration::from_secs(5)),
            reason: "overflow".into(),
        }
        .into();
        assert!(err.is_fatal());
        assert_eq!(err.kind(), "recalculate");
        let text = err.to_string();
        assert!(text.contains("nightly"));
        assert!(text.contains("interval=Some(5s)"));

        assert!(!CourierError::Job("boom".into()).is_fatal());
    }

    #[test]
    fn test_transit_limit_message() {
        let err = CourierError::TransitLimit {
            id: "e1".into(),
            count: 21,
            max: 20,
        };
        assert_eq!(
            err.to_string(),
            "Transit limit exceeded for envelope e1: pass 21 > max 20"
        );
    }
}
