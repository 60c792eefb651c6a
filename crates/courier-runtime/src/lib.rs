//! # Courier Runtime
//!
//! In-process execution core: an envelope dispatcher and a cooperative
//! polling scheduler that share one priority-lane task sink.
//!
//! ## Architecture
//! ```text
//! Scheduler (poll every N ms)
//!   ├── Schedule: utc_time / initial_delay / interval
//!   └── due + idle → UnitOfWork → TaskSink (LaneSink)
//!
//! Dispatcher
//!   ├── Envelope → validate → transit count
//!   ├── CommandResolver (CommandRegistry) → responses
//!   │     ├── local  → InternalOnly → TaskSink
//!   │     └── remote → Transmitter (ChannelTransmitter)
//!   └── unresolved → Ignore | 501 fail message | Exception
//! ```

pub mod dispatcher;
pub mod envelope;
pub mod lanes;
pub mod message;
pub mod registry;
pub mod schedule;
pub mod scheduler;
pub mod telemetry;
pub mod traits;
pub mod transmitter;

pub use dispatcher::{DispatchOutcome, Dispatcher, DispatcherBuilder, DispatcherStats, UnresolvedRequest};
pub use envelope::{Envelope, ReleaseCallback, Routing, SignalResult};
pub use lanes::{LaneSink, LaneStats};
pub use message::{MessageHeader, ServiceMessage};
pub use registry::CommandRegistry;
pub use schedule::{Schedule, ScheduleStatistics, StopReport, TimerConfig};
pub use scheduler::Scheduler;
pub use telemetry::{TelemetryEvent, TracingTelemetry};
pub use traits::{CommandResolver, TaskSink, Telemetry, Transmitter, UnitOfWork};
pub use transmitter::ChannelTransmitter;

/// Text of a caught panic payload.
pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
