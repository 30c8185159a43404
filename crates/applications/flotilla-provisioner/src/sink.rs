//! Event sink implementations
//!
//! The core emits structured [`FleetEvent`]s; transport is pluggable. The
//! default sink here writes them to the tracing pipeline as JSON, which is
//! what the fleet dashboards scrape in deployments without a dedicated
//! telemetry forwarder.

use tracing::{info, warn};

use flotilla_core::{EventSink, FleetEvent};

/// Sink that logs every event through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct LogEventSink;

impl EventSink for LogEventSink {
    fn emit(&self, event: FleetEvent) {
        match serde_json::to_string(&event) {
            Ok(payload) => info!(kind = event.kind(), %payload, "fleet event"),
            Err(e) => warn!(kind = event.kind(), error = %e, "unserializable fleet event"),
        }
    }
}
