//! Routing vocabulary shared by configuration and the runtime.

use serde::{Deserialize, Serialize};

/// Scheduling lane: determines execution priority of submitted work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lane {
    /// Reserved for the runtime's own schedules.
    Internal,
    High,
    #[default]
    Normal,
    Low,
}

impl Lane {
    /// All lanes, highest priority first.
    pub const ALL: [Lane; 4] = [Lane::Internal, Lane::High, Lane::Normal, Lane::Low];

    /// Priority order (lower = higher priority).
    pub fn priority(&self) -> u8 {
        match self {
            Lane::Internal => 0,
            Lane::High => 1,
            Lane::Normal => 2,
            Lane::Low => 3,
        }
    }

    /// One step down. `Low` stays `Low`.
    pub fn lower(&self) -> Lane {
        match self {
            Lane::Internal => Lane::High,
            Lane::High => Lane::Normal,
            Lane::Normal | Lane::Low => Lane::Low,
        }
    }
}

impl std::fmt::Display for Lane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Lane::Internal => write!(f, "internal"),
            Lane::High => write!(f, "high"),
            Lane::Normal => write!(f, "normal"),
            Lane::Low => write!(f, "low"),
        }
    }
}

/// What to do with a payload nobody can handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnhandledAction {
    /// Drop it and report success.
    Ignore,
    /// Send a 501 response back along the response route, if there is one.
    AttemptResponseFailMessage,
    /// Fail the envelope.
    Exception,
}

/// Why a payload ended up unhandled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnresolvedReason {
    HandlerNotFound,
    NoOutboundChannel,
}

impl std::fmt::Display for UnresolvedReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnresolvedReason::HandlerNotFound => write!(f, "handler not found"),
            UnresolvedReason::NoOutboundChannel => write!(f, "no outbound channel"),
        }
    }
}
