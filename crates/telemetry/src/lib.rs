//! `runway-telemetry`: fire-and-forget run telemetry.
//!
//! Telemetry is a best-effort side channel: recording an event must never
//! delay or fail a run's state transition. Callers swallow sink errors; sinks
//! make no delivery guarantees beyond what a concrete implementation adds.

pub mod event;
pub mod sink;

pub use event::{TelemetryEvent, TelemetryEventKind};
pub use sink::{InMemoryTelemetrySink, NoopTelemetrySink, TelemetrySink};
