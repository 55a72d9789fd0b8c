//! Event sink trait and implementations.

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info, Level};

use super::{EventKind, PipelineEvent};

/// Receives run lifecycle events.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Records an event without blocking. Must not panic.
    fn try_emit(&self, event: &PipelineEvent);

    /// Records an event, waiting for slow backends if needed.
    async fn emit(&self, event: PipelineEvent) {
        self.try_emit(&event);
    }
}

/// Discards all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

impl EventSink for NoOpEventSink {
    fn try_emit(&self, _event: &PipelineEvent) {}
}

/// Writes events to the `tracing` subscriber.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingEventSink {
    /// Creates a sink logging at the given level. Levels other than DEBUG
    /// log at INFO.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level sink.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }
}

impl EventSink for LoggingEventSink {
    fn try_emit(&self, event: &PipelineEvent) {
        let stage_id = event.stage_id.as_deref().unwrap_or("");
        if self.level == Level::DEBUG {
            debug!(
                event = %event.kind,
                organization_id = %event.organization_id,
                run_id = %event.run_id,
                stage_id,
                data = %event.data,
                "Pipeline event"
            );
        } else {
            info!(
                event = %event.kind,
                organization_id = %event.organization_id,
                run_id = %event.run_id,
                stage_id,
                data = %event.data,
                "Pipeline event"
            );
        }
    }
}

/// Keeps every event in memory, for tests and diagnostics.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: RwLock<Vec<PipelineEvent>>,
}

impl CollectingEventSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All events in emission order.
    #[must_use]
    pub fn events(&self) -> Vec<PipelineEvent> {
        self.events.read().clone()
    }

    /// Event kinds in emission order.
    #[must_use]
    pub fn kinds(&self) -> Vec<EventKind> {
        self.events.read().iter().map(|e| e.kind).collect()
    }

    /// Events of one kind.
    #[must_use]
    pub fn of_kind(&self, kind: EventKind) -> Vec<PipelineEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }

    /// Stage ids of the events of one kind, in order.
    #[must_use]
    pub fn stages_of_kind(&self, kind: EventKind) -> Vec<String> {
        self.events
            .read()
            .iter()
            .filter(|e| e.kind == kind)
            .filter_map(|e| e.stage_id.clone())
            .collect()
    }

    /// Number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if nothing was collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Drops all collected events.
    pub fn clear(&self) {
        self.events.write().clear();
    }
}

impl EventSink for CollectingEventSink {
    fn try_emit(&self, event: &PipelineEvent) {
        self.events.write().push(event.clone());
    }
}
