//! Observability setup for Parley: tracing subscriber with optional
//! OpenTelemetry export.

pub mod tracing_setup;
