//! Reporting sinks for gauges, counters, service checks and events.
//!
//! A sink is the boundary to the monitoring pipeline. The check only ever
//! pushes into it; nothing it does can fail the check.

mod json_lines;
mod memory;

pub use json_lines::*;
pub use memory::*;

use serde::Serialize;

/// Name used for both the service check and the event type.
pub const CHECK_NAME: &str = "tinyproxy";

/// Health status carried by a service check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ServiceCheckStatus {
    Ok,
    Critical,
}

/// An error event, grouped downstream by `aggregation_key`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    /// Epoch seconds
    pub timestamp: i64,
    pub event_type: String,
    pub msg_title: String,
    pub tags: Vec<String>,
    pub msg_text: String,
    pub aggregation_key: String,
}

/// A single value pushed into a sink.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Emission {
    Gauge {
        name: String,
        value: f64,
        tags: Vec<String>,
    },
    MonotonicCount {
        name: String,
        value: f64,
        tags: Vec<String>,
    },
    ServiceCheck {
        name: String,
        status: ServiceCheckStatus,
        tags: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Event(Event),
}

/// Destination for everything a check reports.
///
/// Implementors only provide [`MetricSink::emit`]; the named reporting
/// operations build the matching [`Emission`].
pub trait MetricSink: Send + Sync {
    fn emit(&self, emission: Emission);

    /// Point-in-time measurement.
    fn gauge(&self, name: &str, value: f64, tags: &[String]) {
        self.emit(Emission::Gauge {
            name: name.to_string(),
            value,
            tags: tags.to_vec(),
        });
    }

    /// Ever-increasing counter; the pipeline derives deltas.
    fn monotonic_count(&self, name: &str, value: f64, tags: &[String]) {
        self.emit(Emission::MonotonicCount {
            name: name.to_string(),
            value,
            tags: tags.to_vec(),
        });
    }

    fn service_check(
        &self,
        name: &str,
        status: ServiceCheckStatus,
        tags: &[String],
        message: Option<&str>,
    ) {
        self.emit(Emission::ServiceCheck {
            name: name.to_string(),
            status,
            tags: tags.to_vec(),
            message: message.map(str::to_string),
        });
    }

    fn event(&self, event: Event) {
        self.emit(Emission::Event(event));
    }
}
