//! # Courier Core
//!
//! Shared building blocks for the Courier execution core: the error
//! taxonomy, TOML configuration and the small routing vocabulary
//! (priority lanes, unhandled-payload actions) used by the runtime crate.

pub mod config;
pub mod error;
pub mod types;

pub use config::{CourierConfig, DispatcherConfig, LaneConfig, SchedulerConfig, UnhandledPolicy};
pub use error::{CourierError, RecalculateError, Result};
pub use types::{Lane, UnhandledAction, UnresolvedReason};
