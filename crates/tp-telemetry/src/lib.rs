//! Telemetry for taskpilot: tracing-subscriber initialisation.

pub mod logging;
