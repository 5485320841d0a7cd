//! Telemetry sink abstraction (record-only, best effort).
//!
//! Unlike a durable store, a sink makes minimal promises: `record` may drop
//! events, deliver late, or fail. Callers on the run-transition path must
//! treat every failure as ignorable; run-state correctness never depends on
//! telemetry.

use std::sync::{Arc, RwLock};

use crate::event::TelemetryEvent;

/// Destination for run telemetry events.
///
/// Implementations must be safe to share across threads; recording from the
/// dispatch path must be cheap and must not block on slow backends (buffer or
/// hand off instead).
pub trait TelemetrySink: Send + Sync {
    type Error: core::fmt::Debug + Send + Sync + 'static;

    fn record(&self, event: TelemetryEvent) -> Result<(), Self::Error>;
}

impl<S> TelemetrySink for Arc<S>
where
    S: TelemetrySink + ?Sized,
{
    type Error = S::Error;

    fn record(&self, event: TelemetryEvent) -> Result<(), Self::Error> {
        (**self).record(event)
    }
}

/// Collecting sink for tests and local inspection.
#[derive(Debug, Default)]
pub struct InMemoryTelemetrySink {
    events: RwLock<Vec<TelemetryEvent>>,
}

impl InMemoryTelemetrySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Snapshot of everything recorded so far, in order.
    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events.read().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.events.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TelemetrySink for InMemoryTelemetrySink {
    type Error = std::convert::Infallible;

    fn record(&self, event: TelemetryEvent) -> Result<(), Self::Error> {
        self.events.write().unwrap().push(event);
        Ok(())
    }
}

/// Sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTelemetrySink;

impl TelemetrySink for NoopTelemetrySink {
    type Error = std::convert::Infallible;

    fn record(&self, _event: TelemetryEvent) -> Result<(), Self::Error> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::TelemetryEventKind;
    use runway_core::RunId;

    #[test]
    fn in_memory_sink_preserves_order() {
        let sink = InMemoryTelemetrySink::new();
        let run_id = RunId::new();

        sink.record(TelemetryEvent::new(run_id, TelemetryEventKind::Started))
            .unwrap();
        sink.record(TelemetryEvent::new(run_id, TelemetryEventKind::Failed))
            .unwrap();
        sink.record(TelemetryEvent::new(run_id, TelemetryEventKind::RetryScheduled))
            .unwrap();

        let kinds: Vec<_> = sink.events().iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                TelemetryEventKind::Started,
                TelemetryEventKind::Failed,
                TelemetryEventKind::RetryScheduled,
            ]
        );
    }

    #[test]
    fn shared_sink_records_through_arc() {
        let sink = InMemoryTelemetrySink::arc();
        sink.record(TelemetryEvent::new(RunId::new(), TelemetryEventKind::Succeeded))
            .unwrap();
        assert_eq!(sink.len(), 1);
    }
}
