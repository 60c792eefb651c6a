//! Seams to the collaborators the core does not own: the task sink that runs
//! work, the resolver that finds local handlers, the outbound transmitter and
//! the telemetry collector.

use std::future::Future;

use async_trait::async_trait;
use courier_core::{Lane, Result};
use futures::future::BoxFuture;

use crate::envelope::Envelope;
use crate::message::MessageHeader;
use crate::telemetry::TelemetryEvent;

/// Called with the unit's result once it has finished (or panicked).
pub type CompletionHook = Box<dyn FnOnce(&Result<()>) + Send>;

/// A piece of work handed to a [`TaskSink`].
pub struct UnitOfWork {
    pub name: String,
    pub priority: Lane,
    /// Hint that the work may hold a slot for a long time.
    pub long_running: bool,
    /// Free-form tag for logs, e.g. the schedule or envelope id.
    pub context: Option<String>,
    pub work: BoxFuture<'static, Result<()>>,
    pub on_complete: Option<CompletionHook>,
}

impl UnitOfWork {
    pub fn new<F>(name: impl Into<String>, priority: Lane, work: F) -> Self
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            priority,
            long_running: false,
            context: None,
            work: Box::pin(work),
            on_complete: None,
        }
    }

    pub fn long_running(mut self, long_running: bool) -> Self {
        self.long_running = long_running;
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn on_complete<F>(mut self, hook: F) -> Self
    where
        F: FnOnce(&Result<()>) + Send + 'static,
    {
        self.on_complete = Some(Box::new(hook));
        self
    }
}

impl std::fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("long_running", &self.long_running)
            .field("context", &self.context)
            .finish()
    }
}

/// Runs units of work concurrently. Fire-and-forget: the sink must eventually
/// run the unit's completion hook.
pub trait TaskSink: Send + Sync {
    fn submit(&self, unit: UnitOfWork);
}

/// Finds and runs a local handler for an envelope.
#[async_trait]
pub trait CommandResolver: Send + Sync {
    /// Whether a local handler exists for this header.
    fn supports(&self, header: &MessageHeader) -> bool;

    /// Run the handler. Returns `Ok(false)` when nothing handles the envelope;
    /// any envelopes the handler produces are appended to `responses`.
    async fn execute(&self, envelope: &Envelope, responses: &mut Vec<Envelope>) -> Result<bool>;
}

/// Sends an envelope to an outbound channel.
#[async_trait]
pub trait Transmitter: Send + Sync {
    /// Returns `Ok(false)` when no outbound channel matches.
    async fn send(&self, envelope: &Envelope) -> Result<bool>;
}

/// Receives structured events from the dispatcher and scheduler.
pub trait Telemetry: Send + Sync {
    fn record(&self, event: &TelemetryEvent);
}
